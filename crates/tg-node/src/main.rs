mod workload;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;

use tg_engine::{AgentConfig, Broker, Directory, Partition, RuntimeLockingShard, TicketMachine};
use tg_storage::{FjallStore, KvStore, MemStore};

use crate::workload::WorkloadConfig;

#[derive(clap::Parser, Debug)]
#[command(name = "tg-node", about = "In-process sharded transaction engine with a transfer workload")]
struct Cli {
    #[arg(long)]
    config: Option<PathBuf>,
    /// Overrides `cluster.shards` for hashed directories.
    #[arg(long)]
    shards: Option<u64>,
    /// Overrides `workload.agents`.
    #[arg(long)]
    agents: Option<usize>,
    /// Overrides `workload.seed`.
    #[arg(long)]
    seed: Option<u64>,
    /// Overrides `storage.data_dir`.
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
enum DirectoryKind {
    Hashed,
    Ranged,
}

/// One `[[cluster.partitions]]` entry. Bounds are UTF-8 key prefixes.
#[derive(Debug, Deserialize)]
struct PartitionConfig {
    start: String,
    #[serde(default)]
    end: String,
    shard: u64,
}

#[derive(Debug, Deserialize)]
struct ClusterConfig {
    shards: u64,
    directory: DirectoryKind,
    #[serde(default)]
    partitions: Vec<PartitionConfig>,
}

impl ClusterConfig {
    fn directory(&self) -> anyhow::Result<Directory> {
        match self.directory {
            DirectoryKind::Hashed => {
                anyhow::ensure!(self.shards > 0, "cluster.shards must be at least 1");
                Ok(Directory::hashed(self.shards))
            }
            DirectoryKind::Ranged => {
                let partitions = self
                    .partitions
                    .iter()
                    .map(|p| Partition {
                        start: p.start.as_bytes().to_vec(),
                        end: p.end.as_bytes().to_vec(),
                        shard: p.shard,
                    })
                    .collect();
                Directory::ranged(partitions).context("invalid cluster.partitions")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
enum StorageBackend {
    Memory,
    Fjall,
}

#[derive(Debug, Deserialize)]
struct StorageConfig {
    backend: StorageBackend,
    data_dir: PathBuf,
}

#[derive(Debug, Deserialize)]
struct ObservabilityConfig {
    log_level: String,
    log_format: String,
}

#[derive(Debug, Deserialize)]
struct Config {
    cluster: ClusterConfig,
    storage: StorageConfig,
    agent: AgentConfig,
    workload: WorkloadConfig,
    observability: ObservabilityConfig,
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut figment = Figment::new()
        .merge(Toml::string(include_str!("../../../config/default.toml")));

    if let Some(ref config_path) = cli.config {
        figment = figment.merge(Toml::file_exact(config_path));
    }

    let mut config: Config = figment
        .merge(Env::prefixed("TOLLGATE_").split("__"))
        .extract()
        .context("failed to load configuration")?;

    if let Some(shards) = cli.shards {
        config.cluster.shards = shards;
    }
    if let Some(agents) = cli.agents {
        config.workload.agents = agents;
    }
    if let Some(seed) = cli.seed {
        config.workload.seed = seed;
    }
    if let Some(ref data_dir) = cli.data_dir {
        config.storage.data_dir = data_dir.clone();
    }
    Ok(config)
}

/// Build one runtime locking shard per directory shard over `store`, then
/// drive the workload through a broker.
async fn run_cluster<S: KvStore + Clone>(config: &Config, store: S) -> anyhow::Result<()> {
    let directory = config.cluster.directory()?;
    let shards: Vec<Arc<RuntimeLockingShard<S>>> = directory
        .shard_ids()
        .into_iter()
        .map(|id| Arc::new(RuntimeLockingShard::new(id, store.clone())))
        .collect();
    tracing::info!(shards = shards.len(), directory = ?config.cluster.directory, "cluster ready");

    let broker = Arc::new(Broker::new(Arc::new(TicketMachine::new()), directory.clone(), shards)?);
    let stats = workload::run(broker, &directory, config.agent, &config.workload).await?;
    stats.report();
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use clap::Parser;
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    let log_format = config.observability.log_format.as_str();
    match log_format {
        "json" => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(&config.observability.log_level)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .pretty()
                .with_env_filter(&config.observability.log_level)
                .init();
        }
    }

    tracing::info!(
        backend = ?config.storage.backend,
        agents = config.workload.agents,
        contracts_per_agent = config.workload.contracts_per_agent,
        runner = ?config.workload.runner,
        "node starting"
    );

    match config.storage.backend {
        StorageBackend::Memory => run_cluster(&config, Arc::new(MemStore::new())).await,
        StorageBackend::Fjall => {
            let store = FjallStore::open(&config.storage.data_dir).with_context(|| {
                format!("failed to open fjall store at {}", config.storage.data_dir.display())
            })?;
            run_cluster(&config, store).await
        }
    }
}
