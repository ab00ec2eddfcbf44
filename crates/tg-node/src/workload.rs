use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use tracing::{debug, info, warn};

use tg_engine::runner::{
    decode_u64, encode_u64, IncrementArgs, NativeRunner, Op, Operand, ReadArgs, Script, TransferArgs,
};
use tg_engine::{Agent, AgentConfig, AnyRunner, Broker, Directory, LockingShard, RunnerKind};
use tg_types::{Key, LockMode, ShardId, TgError};

#[derive(Debug, Clone, Deserialize)]
pub struct WorkloadConfig {
    pub agents: usize,
    pub contracts_per_agent: usize,
    pub accounts: u64,
    pub initial_balance: u64,
    pub max_amount: u64,
    pub runner: RunnerKind,
    pub seed: u64,
    pub cross_shard: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkloadStats {
    pub committed: u64,
    /// Attempts spent on committed contracts, wound retries included.
    pub commit_attempts: u64,
    /// Transfers rejected by the contract, e.g. insufficient funds.
    pub runner_faults: u64,
    /// Contracts still wounded after `max_attempts`.
    pub wound_exhausted: u64,
    pub elapsed: Duration,
}

impl WorkloadStats {
    fn merge(&mut self, other: &WorkloadStats) {
        self.committed += other.committed;
        self.commit_attempts += other.commit_attempts;
        self.runner_faults += other.runner_faults;
        self.wound_exhausted += other.wound_exhausted;
    }

    pub fn report(&self) {
        let secs = self.elapsed.as_secs_f64();
        let per_sec = if secs > 0.0 { self.committed as f64 / secs } else { 0.0 };
        let retries = self.commit_attempts.saturating_sub(self.committed);
        info!(
            committed = self.committed,
            retries,
            runner_faults = self.runner_faults,
            wound_exhausted = self.wound_exhausted,
            elapsed_ms = self.elapsed.as_millis() as u64,
            per_sec,
            "workload finished"
        );
    }
}

pub fn account_key(i: u64) -> Key {
    Key::from(format!("acct/{i:06}"))
}

/// Straight-line script equivalent of the native `transfer` contract.
/// Arguments: from, to, amount.
pub fn transfer_script() -> Script {
    Script::new(vec![
        Op::Load { key: Operand::Arg(0), mode: LockMode::Write, dst: 0 },
        Op::Load { key: Operand::Arg(1), mode: LockMode::Write, dst: 1 },
        Op::Sub { dst: 0, lhs: Operand::Reg(0), rhs: Operand::Arg(2) },
        Op::Add { dst: 1, lhs: Operand::Reg(1), rhs: Operand::Arg(2) },
        Op::Store { key: Operand::Arg(0), value: Operand::Reg(0) },
        Op::Store { key: Operand::Arg(1), value: Operand::Reg(1) },
        Op::Return { value: Operand::Reg(0) },
    ])
}

/// Transfer program plus parameter encoding for one runner backend.
struct TransferContract {
    kind: RunnerKind,
    program: Vec<u8>,
}

impl TransferContract {
    fn new(kind: RunnerKind) -> Result<Self, TgError> {
        let program = match kind {
            RunnerKind::Script => transfer_script().encode()?,
            RunnerKind::Native => NativeRunner::TRANSFER.as_bytes().to_vec(),
        };
        Ok(TransferContract { kind, program })
    }

    fn params(&self, from: Key, to: Key, amount: u64) -> Result<Vec<u8>, TgError> {
        match self.kind {
            RunnerKind::Script => {
                Script::encode_args(&[from.into_bytes(), to.into_bytes(), encode_u64(amount)])
            }
            RunnerKind::Native => NativeRunner::transfer_params(&TransferArgs { from, to, amount }),
        }
    }
}

/// Accounts that transfers may pair up. Without `cross_shard`, accounts are
/// grouped by owning shard so every transfer commits on a single shard.
fn account_groups(directory: &Directory, accounts: u64, cross_shard: bool) -> anyhow::Result<Vec<Vec<Key>>> {
    if accounts < 2 {
        bail!("workload needs at least two accounts, got {accounts}");
    }
    if cross_shard {
        return Ok(vec![(0..accounts).map(account_key).collect()]);
    }

    let mut by_shard: BTreeMap<ShardId, Vec<Key>> = BTreeMap::new();
    for i in 0..accounts {
        let key = account_key(i);
        let shard = directory.locate(&key).with_context(|| format!("placing account {key}"))?;
        by_shard.entry(shard).or_default().push(key);
    }
    let groups: Vec<Vec<Key>> = by_shard.into_values().filter(|g| g.len() >= 2).collect();
    if groups.is_empty() {
        bail!("no shard owns two accounts; raise workload.accounts or enable cross_shard");
    }
    Ok(groups)
}

async fn total_balance<S: LockingShard>(
    auditor: &mut Agent<S, AnyRunner>,
    accounts: &[Key],
) -> anyhow::Result<u64> {
    let params = NativeRunner::read_params(&ReadArgs { keys: accounts.to_vec() })?;
    let receipt = auditor
        .exec(NativeRunner::READ.as_bytes(), &params)
        .await
        .context("reading account balances")?;
    let mut total = 0u64;
    for value in NativeRunner::read_result(&receipt.result)? {
        total = total
            .checked_add(decode_u64(&value.unwrap_or_default())?)
            .context("total balance overflows u64")?;
    }
    Ok(total)
}

/// Seed accounts, run `agents` concurrent agents issuing random transfers,
/// and check that the total balance is unchanged afterwards.
pub async fn run<S: LockingShard>(
    broker: Arc<Broker<S>>,
    directory: &Directory,
    agent_config: AgentConfig,
    config: &WorkloadConfig,
) -> anyhow::Result<WorkloadStats> {
    let accounts: Vec<Key> = (0..config.accounts).map(account_key).collect();
    let groups = Arc::new(account_groups(directory, config.accounts, config.cross_shard)?);

    // Seeding and auditing always go through the native contracts.
    let mut admin = Agent::new(0, broker.clone(), Arc::new(AnyRunner::Native(NativeRunner::new())), agent_config);
    for key in &accounts {
        let params = NativeRunner::increment_params(&IncrementArgs { key: key.clone(), by: config.initial_balance })?;
        admin
            .exec(NativeRunner::INCREMENT.as_bytes(), &params)
            .await
            .with_context(|| format!("seeding account {key}"))?;
    }
    let before = total_balance(&mut admin, &accounts).await?;
    info!(accounts = accounts.len(), groups = groups.len(), total = before, "accounts seeded");

    let runner = Arc::new(AnyRunner::from_kind(config.runner));
    let contract = Arc::new(TransferContract::new(config.runner)?);
    let started = Instant::now();

    let mut tasks = Vec::with_capacity(config.agents);
    for id in 1..=config.agents as u64 {
        let agent = Agent::new(id, broker.clone(), runner.clone(), agent_config);
        let rng = StdRng::seed_from_u64(config.seed.wrapping_add(id));
        tasks.push(tokio::spawn(drive(
            agent,
            rng,
            groups.clone(),
            contract.clone(),
            config.contracts_per_agent,
            config.max_amount,
        )));
    }

    let mut stats = WorkloadStats::default();
    for task in tasks {
        stats.merge(&task.await.context("agent task panicked")??);
    }
    stats.elapsed = started.elapsed();

    let after = total_balance(&mut admin, &accounts).await?;
    if after == before {
        info!(total = after, "balance conserved");
    } else if config.cross_shard {
        warn!(before, after, "balance drifted after a partially applied cross-shard commit");
    } else {
        bail!("balance not conserved: {before} before, {after} after");
    }
    Ok(stats)
}

async fn drive<S: LockingShard>(
    mut agent: Agent<S, AnyRunner>,
    mut rng: StdRng,
    groups: Arc<Vec<Vec<Key>>>,
    contract: Arc<TransferContract>,
    contracts: usize,
    max_amount: u64,
) -> anyhow::Result<WorkloadStats> {
    let mut stats = WorkloadStats::default();
    for _ in 0..contracts {
        let params = {
            let group = &groups[rng.random_range(0..groups.len())];
            let from = rng.random_range(0..group.len());
            let to = (from + rng.random_range(1..group.len())) % group.len();
            let amount = rng.random_range(0..=max_amount);
            contract.params(group[from].clone(), group[to].clone(), amount)?
        };
        match agent.exec(&contract.program, &params).await {
            Ok(receipt) => {
                stats.committed += 1;
                stats.commit_attempts += u64::from(receipt.attempts);
            }
            Err(TgError::RunnerFault(reason)) => {
                stats.runner_faults += 1;
                debug!(agent = agent.id(), %reason, "transfer rejected");
            }
            Err(e @ TgError::Wounded { .. }) => {
                stats.wound_exhausted += 1;
                debug!(agent = agent.id(), error = %e, "transfer gave up after repeated wounds");
            }
            Err(e) => return Err(e).with_context(|| format!("agent {} failed", agent.id())),
        }
    }
    Ok(stats)
}
