use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use tg_types::{Key, LockMode, TgError, Ticket, Value};

use crate::broker::Broker;
use crate::runner::{KeyAccess, RunOutput, Runner};
use crate::shard::LockingShard;

/// Lifecycle of the attempt an agent is currently driving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Idle,
    Created,
    Running,
    Committing,
    Committed,
    Aborting,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AgentConfig {
    /// Attempts per contract, counting the first. Only wounds are retried.
    pub max_attempts: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig { max_attempts: 5 }
    }
}

/// Outcome of a committed contract execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecReceipt {
    /// Ticket of the attempt that committed.
    pub ticket: Ticket,
    pub attempts: u32,
    pub result: Value,
    pub updates: BTreeMap<Key, Value>,
}

/// Access callback handed to the runner. Every key access becomes a
/// `Broker::try_lock` under the attempt's ticket.
struct BrokerAccess<'a, S> {
    broker: &'a Broker<S>,
    ticket: Ticket,
    /// First denial seen. Set even if the runner swallows the error.
    denial: Option<TgError>,
}

impl<S: LockingShard> KeyAccess for BrokerAccess<'_, S> {
    async fn access(&mut self, key: Key, mode: LockMode) -> Result<Option<Value>, TgError> {
        match self.broker.try_lock(self.ticket, key, mode).await {
            Ok(value) => Ok(value),
            Err(e) => {
                self.denial.get_or_insert_with(|| e.clone());
                Err(e)
            }
        }
    }
}

/// Drives one contract execution at a time through a [`Broker`].
pub struct Agent<S, R> {
    id: u64,
    broker: Arc<Broker<S>>,
    runner: Arc<R>,
    config: AgentConfig,
    state: AgentState,
    ticket: Option<Ticket>,
}

impl<S: LockingShard, R: Runner> Agent<S, R> {
    pub fn new(id: u64, broker: Arc<Broker<S>>, runner: Arc<R>, config: AgentConfig) -> Self {
        Agent { id, broker, runner, config, state: AgentState::Idle, ticket: None }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    /// Ticket of the current or most recent attempt.
    pub fn ticket(&self) -> Option<Ticket> {
        self.ticket
    }

    /// Run `program` to completion. An attempt that ends wounded is rerun
    /// under a fresh ticket until `max_attempts` is reached; every other
    /// failure is returned after the first attempt.
    pub async fn exec(&mut self, program: &[u8], params: &[u8]) -> Result<ExecReceipt, TgError> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.exec_once(program, params).await {
                Ok((ticket, out)) => {
                    return Ok(ExecReceipt {
                        ticket,
                        attempts: attempt,
                        result: out.result,
                        updates: out.updates,
                    });
                }
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    debug!(agent = self.id, attempt, error = %e, "retrying wounded attempt");
                    attempt += 1;
                    tokio::task::yield_now().await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One attempt under one ticket. Ends `Committed` or `Aborted`.
    async fn exec_once(&mut self, program: &[u8], params: &[u8]) -> Result<(Ticket, RunOutput), TgError> {
        let broker = Arc::clone(&self.broker);
        let ticket = broker.begin().await?;
        self.ticket = Some(ticket);
        self.transition(AgentState::Created);

        self.transition(AgentState::Running);
        let mut access = BrokerAccess { broker: &broker, ticket, denial: None };
        let run = self.runner.run(program, params, &mut access).await;
        // A recorded denial wins over whatever the runner made of it.
        let run = match (run, access.denial) {
            (Ok(out), None) => Ok(out),
            (_, Some(denial)) => Err(denial),
            (Err(e), None) => Err(e),
        };

        let out = match run {
            Ok(out) => out,
            Err(e) => return Err(self.abort(ticket, e).await),
        };

        for (key, value) in &out.updates {
            if let Err(e) = broker.put(ticket, key.clone(), value.clone()).await {
                return Err(self.abort(ticket, e).await);
            }
        }

        self.transition(AgentState::Committing);
        match broker.commit(ticket).await {
            Ok(()) => {
                self.transition(AgentState::Committed);
                info!(agent = self.id, ticket, writes = out.updates.len(), "contract committed");
                Ok((ticket, out))
            }
            Err(e) => Err(self.abort(ticket, e).await),
        }
    }

    async fn abort(&mut self, ticket: Ticket, cause: TgError) -> TgError {
        self.transition(AgentState::Aborting);
        if let Err(e) = self.broker.rollback(ticket).await {
            warn!(agent = self.id, ticket, error = %e, "rollback failed");
        }
        self.transition(AgentState::Aborted);
        info!(agent = self.id, ticket, error = %cause, "contract aborted");
        cause
    }

    fn transition(&mut self, next: AgentState) {
        debug!(agent = self.id, ticket = ?self.ticket, from = ?self.state, to = ?next, "agent state");
        self.state = next;
    }
}
