use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use tg_types::{Key, LockMode, ShardId, TgError, Ticket, TxnStatus, Value};

use crate::directory::Directory;
use crate::shard::{LockOutcome, LockingShard};
use crate::ticket_machine::TicketMachine;
use crate::wound::WoundSignal;

/// Broker-side view of one transaction attempt.
struct TxnState {
    status: TxnStatus,
    wound: WoundSignal,
    /// key → (owning shard, strongest granted mode)
    held: BTreeMap<Key, (ShardId, LockMode)>,
    /// Every shard a request was sent to, granted or not.
    touched: BTreeSet<ShardId>,
}

impl TxnState {
    fn new() -> Self {
        TxnState {
            status: TxnStatus::Active,
            wound: WoundSignal::new(),
            held: BTreeMap::new(),
            touched: BTreeSet::new(),
        }
    }
}

/// Per-transaction coordinator in front of the runtime locking shards.
///
/// The broker owns only its record of which shards and keys each ticket has
/// touched. Lock state lives on the shards and is changed only through
/// `LockingShard` calls.
pub struct Broker<S> {
    ticket_machine: Arc<TicketMachine>,
    directory: Directory,
    shards: HashMap<ShardId, Arc<S>>,
    txns: Mutex<HashMap<Ticket, TxnState>>,
}

impl<S: LockingShard> Broker<S> {
    /// Every shard the directory can route to must be present in `shards`.
    pub fn new(
        ticket_machine: Arc<TicketMachine>,
        directory: Directory,
        shards: Vec<Arc<S>>,
    ) -> Result<Self, TgError> {
        let shards: HashMap<ShardId, Arc<S>> =
            shards.into_iter().map(|s| (s.shard_id(), s)).collect();
        if let Some(missing) = directory.shard_ids().into_iter().find(|id| !shards.contains_key(id)) {
            return Err(TgError::InvalidArgument(format!(
                "directory routes to shard {missing} but no such shard was given"
            )));
        }
        Ok(Broker { ticket_machine, directory, shards, txns: Mutex::new(HashMap::new()) })
    }

    /// Start a transaction attempt under a fresh ticket.
    pub async fn begin(&self) -> Result<Ticket, TgError> {
        let ticket = self.ticket_machine.new_ticket()?;
        self.txns.lock().await.insert(ticket, TxnState::new());
        debug!(ticket, "transaction started");
        Ok(ticket)
    }

    /// `None` once the transaction has finished and been forgotten.
    pub async fn status(&self, ticket: Ticket) -> Option<TxnStatus> {
        self.txns.lock().await.get(&ticket).map(|t| t.status)
    }

    /// Wound signal of an active attempt.
    pub async fn wound_signal(&self, ticket: Ticket) -> Option<WoundSignal> {
        self.txns.lock().await.get(&ticket).map(|t| t.wound.clone())
    }

    /// Shards contacted so far by `ticket`.
    pub async fn touched_shards(&self, ticket: Ticket) -> BTreeSet<ShardId> {
        self.txns
            .lock()
            .await
            .get(&ticket)
            .map(|t| t.touched.clone())
            .unwrap_or_default()
    }

    /// Acquire `mode` on `key` and return the value visible to `ticket`.
    ///
    /// A queued request suspends until the owning shard grants or denies it,
    /// or until the attempt is wounded. Any failure leaves the transaction
    /// `Aborting`; the caller is expected to roll it back.
    pub async fn try_lock(&self, ticket: Ticket, key: Key, mode: LockMode) -> Result<Option<Value>, TgError> {
        let result = self.lock_and_read(ticket, key.clone(), mode).await;
        if let Err(e) = &result {
            info!(ticket, %key, %mode, error = %e, "lock request failed");
            self.mark_aborting(ticket).await;
        }
        result
    }

    async fn lock_and_read(&self, ticket: Ticket, key: Key, mode: LockMode) -> Result<Option<Value>, TgError> {
        let shard_id = self.directory.locate(&key)?;
        let shard = self.shard(shard_id, &key)?;

        let wound = {
            let mut txns = self.txns.lock().await;
            let txn = active(&mut txns, ticket)?;
            if let Some(by) = txn.wound.wounded_by() {
                return Err(TgError::Wounded { ticket, by: Some(by) });
            }
            txn.touched.insert(shard_id);
            txn.wound.clone()
        };

        match shard.try_lock(ticket, key.clone(), mode, wound.clone()).await? {
            LockOutcome::Granted => {}
            LockOutcome::Queued(pending) => {
                debug!(ticket, %key, %mode, shard_id, "waiting for lock");
                tokio::select! {
                    res = pending.resolved() => res.map_err(|r| r.into_error(ticket, &key))?,
                    by = wound.wounded() => return Err(TgError::Wounded { ticket, by }),
                }
            }
            LockOutcome::Denied(reason) => return Err(reason.into_error(ticket, &key)),
        }

        {
            let mut txns = self.txns.lock().await;
            let txn = active(&mut txns, ticket)?;
            let held = txn.held.entry(key.clone()).or_insert((shard_id, mode));
            held.1 = held.1.max(mode);
        }
        shard.get(ticket, &key).await
    }

    /// Buffer a write at the owning shard, taking the write lock first if
    /// the transaction does not hold it yet.
    pub async fn put(&self, ticket: Ticket, key: Key, value: Value) -> Result<(), TgError> {
        let held = {
            let mut txns = self.txns.lock().await;
            active(&mut txns, ticket)?.held.get(&key).copied()
        };
        let shard_id = match held {
            Some((shard_id, LockMode::Write)) => shard_id,
            _ => {
                self.try_lock(ticket, key.clone(), LockMode::Write).await?;
                self.directory.locate(&key)?
            }
        };
        let shard = self.shard(shard_id, &key)?;
        if let Err(e) = shard.put(ticket, key, value).await {
            self.mark_aborting(ticket).await;
            return Err(e);
        }
        Ok(())
    }

    /// Commit on every touched shard, in shard order.
    ///
    /// If a shard refuses because it wounded the ticket, the remaining
    /// shards are rolled back and the wound is returned. Shards committed
    /// before the refusal keep their writes; atomic cross-shard commit needs
    /// a two-phase protocol on top of this.
    pub async fn commit(&self, ticket: Ticket) -> Result<(), TgError> {
        let (touched, wounded_by) = {
            let mut txns = self.txns.lock().await;
            let txn = active(&mut txns, ticket)?;
            txn.status = TxnStatus::Committing;
            (txn.touched.clone(), txn.wound.wounded_by())
        };
        if let Some(by) = wounded_by {
            self.rollback(ticket).await?;
            return Err(TgError::Wounded { ticket, by: Some(by) });
        }

        let mut committed = 0usize;
        let mut failure = None;
        for shard_id in &touched {
            let Some(shard) = self.shards.get(shard_id) else { continue };
            if failure.is_some() {
                if let Err(e) = shard.rollback(ticket).await {
                    warn!(ticket, shard_id, error = %e, "rollback after failed commit failed");
                }
                continue;
            }
            match shard.commit(ticket).await {
                Ok(()) => committed += 1,
                Err(e) => {
                    if committed > 0 {
                        warn!(ticket, shard_id, committed, "commit refused after other shards committed");
                    }
                    failure = Some(e);
                }
            }
        }

        match failure {
            None => {
                self.finish(ticket, TxnStatus::Committed).await;
                info!(ticket, shards = touched.len(), "transaction committed");
                Ok(())
            }
            Some(e) => {
                self.finish(ticket, TxnStatus::Aborted).await;
                info!(ticket, error = %e, "transaction aborted during commit");
                Err(e)
            }
        }
    }

    /// Roll back on every touched shard. Unknown or finished tickets are a
    /// no-op.
    pub async fn rollback(&self, ticket: Ticket) -> Result<(), TgError> {
        let touched = {
            let mut txns = self.txns.lock().await;
            let Some(txn) = txns.get_mut(&ticket) else {
                return Ok(());
            };
            txn.status = TxnStatus::Aborting;
            txn.touched.clone()
        };

        let mut first_err = None;
        for shard_id in &touched {
            let Some(shard) = self.shards.get(shard_id) else { continue };
            if let Err(e) = shard.rollback(ticket).await {
                warn!(ticket, shard_id, error = %e, "shard rollback failed");
                first_err.get_or_insert(e);
            }
        }
        self.finish(ticket, TxnStatus::Aborted).await;
        info!(ticket, shards = touched.len(), "transaction rolled back");
        first_err.map_or(Ok(()), Err)
    }

    fn shard(&self, shard_id: ShardId, key: &Key) -> Result<&Arc<S>, TgError> {
        self.shards.get(&shard_id).ok_or_else(|| TgError::UnknownShard { key: key.clone() })
    }

    async fn mark_aborting(&self, ticket: Ticket) {
        if let Some(txn) = self.txns.lock().await.get_mut(&ticket) {
            if txn.status == TxnStatus::Active {
                txn.status = TxnStatus::Aborting;
            }
        }
    }

    async fn finish(&self, ticket: Ticket, status: TxnStatus) {
        debug_assert!(status.is_finished());
        if self.txns.lock().await.remove(&ticket).is_some() {
            debug!(ticket, ?status, "transaction finished");
        }
    }
}

fn active(txns: &mut HashMap<Ticket, TxnState>, ticket: Ticket) -> Result<&mut TxnState, TgError> {
    txns.get_mut(&ticket)
        .filter(|t| t.status == TxnStatus::Active)
        .ok_or(TgError::TransactionNotActive(ticket))
}
