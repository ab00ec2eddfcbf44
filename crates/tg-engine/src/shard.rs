use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;

use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};

use tg_storage::KvStore;
use tg_types::{Key, LockMode, ShardId, TgError, Ticket, Value};

use crate::wound::WoundSignal;

// ---------------------------------------------------------------------------
// LockingShard trait
// Uses RPITIT like `KvStore`. The in-process `RuntimeLockingShard` is the
// only implementation here; a networked client would implement the same
// calls.
// ---------------------------------------------------------------------------

pub trait LockingShard: Send + Sync + 'static {
    fn shard_id(&self) -> ShardId;

    /// Request `mode` on `key` for `ticket`. `wound` is fired if this shard
    /// later forces the ticket to abort.
    fn try_lock(
        &self,
        ticket: Ticket,
        key: Key,
        mode: LockMode,
        wound: WoundSignal,
    ) -> impl Future<Output = Result<LockOutcome, TgError>> + Send;

    /// Value of `key` as seen by `ticket`: its own buffered write if any,
    /// the committed value otherwise. Requires a held lock.
    fn get(&self, ticket: Ticket, key: &Key)
        -> impl Future<Output = Result<Option<Value>, TgError>> + Send;

    /// Buffer a write. Requires a held write lock.
    fn put(&self, ticket: Ticket, key: Key, value: Value)
        -> impl Future<Output = Result<(), TgError>> + Send;

    /// Apply buffered writes and release every lock held by `ticket`.
    fn commit(&self, ticket: Ticket) -> impl Future<Output = Result<(), TgError>> + Send;

    /// Discard buffered writes and release every lock and wait of `ticket`.
    /// Unknown tickets are a no-op.
    fn rollback(&self, ticket: Ticket) -> impl Future<Output = Result<(), TgError>> + Send;
}

/// Why a lock request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// The requesting ticket was wounded by an older one.
    Wounded { by: Option<Ticket> },
    /// The ticket already has a request pending on this key.
    Duplicate,
    /// The pending request was dropped because the ticket was released.
    Cancelled,
}

impl DenyReason {
    pub fn into_error(self, ticket: Ticket, key: &Key) -> TgError {
        match self {
            DenyReason::Wounded { by } => TgError::Wounded { ticket, by },
            DenyReason::Duplicate | DenyReason::Cancelled => {
                TgError::LockDenied { ticket, key: key.clone() }
            }
        }
    }
}

/// A queued lock request. Resolves when the shard grants or denies it.
#[derive(Debug)]
pub struct PendingLock {
    rx: oneshot::Receiver<Result<(), DenyReason>>,
}

impl PendingLock {
    pub async fn resolved(self) -> Result<(), DenyReason> {
        self.rx.await.unwrap_or(Err(DenyReason::Cancelled))
    }
}

#[derive(Debug)]
pub enum LockOutcome {
    Granted,
    Queued(PendingLock),
    Denied(DenyReason),
}

/// Point-in-time view of one key's lock entry.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LockSnapshot {
    pub holders: Vec<(Ticket, LockMode)>,
    pub waiters: Vec<(Ticket, LockMode)>,
}

// ---------------------------------------------------------------------------
// Lock table
// ---------------------------------------------------------------------------

struct Waiter {
    mode: LockMode,
    reply: oneshot::Sender<Result<(), DenyReason>>,
}

/// Holders and ticket-ordered waiters for one key.
#[derive(Default)]
struct LockEntry {
    holders: BTreeMap<Ticket, LockMode>,
    waiters: BTreeMap<Ticket, Waiter>,
}

impl LockEntry {
    /// Holders other than `ticket` whose mode conflicts with `mode`.
    fn conflicting_holders(&self, ticket: Ticket, mode: LockMode) -> impl Iterator<Item = Ticket> + '_ {
        self.holders
            .iter()
            .filter(move |&(&h, &held)| h != ticket && !held.compatible_with(mode))
            .map(|(&h, _)| h)
    }

    /// Grant now only if no holder conflicts and no older waiter would be
    /// overtaken by a conflicting grant.
    fn grantable(&self, ticket: Ticket, mode: LockMode) -> bool {
        self.conflicting_holders(ticket, mode).next().is_none()
            && self.waiters.range(..ticket).all(|(_, w)| w.mode.compatible_with(mode))
    }

    fn is_idle(&self) -> bool {
        self.holders.is_empty() && self.waiters.is_empty()
    }
}

/// Everything this shard knows about one ticket.
struct TicketState {
    wound: WoundSignal,
    wounded_by: Option<Ticket>,
    held: BTreeMap<Key, LockMode>,
    waiting: BTreeSet<Key>,
    writes: BTreeMap<Key, Value>,
}

impl TicketState {
    fn new(wound: WoundSignal) -> Self {
        TicketState {
            wound,
            wounded_by: None,
            held: BTreeMap::new(),
            waiting: BTreeSet::new(),
            writes: BTreeMap::new(),
        }
    }
}

#[derive(Default)]
struct LockTable {
    locks: HashMap<Key, LockEntry>,
    tickets: HashMap<Ticket, TicketState>,
}

impl LockTable {
    fn try_lock(&mut self, ticket: Ticket, key: Key, mode: LockMode, wound: WoundSignal) -> LockOutcome {
        let state = self.tickets.entry(ticket).or_insert_with(|| TicketState::new(wound));
        // Wounded on another shard: record it here and take nothing.
        if state.wounded_by.is_none() {
            state.wounded_by = state.wound.wounded_by();
        }
        if let Some(by) = state.wounded_by {
            return LockOutcome::Denied(DenyReason::Wounded { by: Some(by) });
        }
        if state.held.get(&key).is_some_and(|&held| held >= mode) {
            return LockOutcome::Granted;
        }
        if state.waiting.contains(&key) {
            return LockOutcome::Denied(DenyReason::Duplicate);
        }

        let entry = self.locks.entry(key.clone()).or_default();
        if entry.grantable(ticket, mode) {
            entry.holders.insert(ticket, mode);
            state.held.insert(key, mode);
            return LockOutcome::Granted;
        }

        // Younger conflicting holders are wounded; older ones are waited on.
        let victims: Vec<Ticket> =
            entry.conflicting_holders(ticket, mode).filter(|&h| h > ticket).collect();
        let (reply, rx) = oneshot::channel();
        entry.waiters.insert(ticket, Waiter { mode, reply });
        state.waiting.insert(key);
        for victim in victims {
            self.wound(victim, ticket);
        }
        LockOutcome::Queued(PendingLock { rx })
    }

    /// Force `victim` to abort in favour of the older `by`. Its locks stay
    /// held until its rollback; its pending waits here are denied at once.
    fn wound(&mut self, victim: Ticket, by: Ticket) {
        let Some(state) = self.tickets.get_mut(&victim) else { return };
        if state.wounded_by.is_some() {
            return;
        }
        state.wounded_by = Some(by);
        state.wound.wound(by);
        info!(ticket = victim, by, "ticket wounded");

        let waiting = std::mem::take(&mut state.waiting);
        for key in waiting {
            if let Some(w) = self.locks.get_mut(&key).and_then(|e| e.waiters.remove(&victim)) {
                let _ = w.reply.send(Err(DenyReason::Wounded { by: Some(by) }));
            }
            self.promote(&key);
        }
    }

    /// Grant queued requests on `key` in ticket order, stopping at the first
    /// waiter that conflicts with the current holders.
    fn promote(&mut self, key: &Key) {
        let Some(entry) = self.locks.get_mut(key) else { return };
        while let Some((&ticket, waiter)) = entry.waiters.first_key_value() {
            if entry.conflicting_holders(ticket, waiter.mode).next().is_some() {
                break;
            }
            let Some((ticket, waiter)) = entry.waiters.pop_first() else { break };
            // An upgrade replaces the ticket's read hold.
            entry.holders.insert(ticket, waiter.mode);
            if let Some(state) = self.tickets.get_mut(&ticket) {
                state.waiting.remove(key);
                state.held.insert(key.clone(), waiter.mode);
            }
            debug!(ticket, %key, mode = %waiter.mode, "queued lock granted");
            // A dropped receiver keeps the hold; the owner's rollback frees it.
            let _ = waiter.reply.send(Ok(()));
        }
        if entry.is_idle() {
            self.locks.remove(key);
        }
    }

    /// Drop every hold and wait of `ticket`, promote the affected keys, and
    /// hand back its state (buffered writes included).
    fn release(&mut self, ticket: Ticket) -> Option<TicketState> {
        let state = self.tickets.remove(&ticket)?;
        for key in &state.waiting {
            if let Some(entry) = self.locks.get_mut(key) {
                entry.waiters.remove(&ticket);
            }
        }
        for key in state.held.keys() {
            if let Some(entry) = self.locks.get_mut(key) {
                entry.holders.remove(&ticket);
            }
        }
        for key in state.waiting.iter().chain(state.held.keys()) {
            self.promote(key);
        }
        Some(state)
    }
}

// ---------------------------------------------------------------------------
// RuntimeLockingShard
// ---------------------------------------------------------------------------

/// Owns one partition of the key space: its lock table, the buffered writes
/// of in-flight tickets, and (through `store`) the committed values.
///
/// All lock-table access goes through a single per-shard mutex.
pub struct RuntimeLockingShard<S> {
    id: ShardId,
    store: S,
    table: Mutex<LockTable>,
}

impl<S: KvStore> RuntimeLockingShard<S> {
    pub fn new(id: ShardId, store: S) -> Self {
        RuntimeLockingShard { id, store, table: Mutex::new(LockTable::default()) }
    }

    /// Holders and waiters of `key`, or `None` if nobody holds or wants it.
    pub async fn lock_snapshot(&self, key: &Key) -> Option<LockSnapshot> {
        let table = self.table.lock().await;
        table.locks.get(key).map(|entry| LockSnapshot {
            holders: entry.holders.iter().map(|(&t, &m)| (t, m)).collect(),
            waiters: entry.waiters.iter().map(|(&t, w)| (t, w.mode)).collect(),
        })
    }

    /// Number of tickets with locks, waits or buffered writes here.
    pub async fn active_tickets(&self) -> usize {
        self.table.lock().await.tickets.len()
    }
}

impl<S: KvStore> LockingShard for RuntimeLockingShard<S> {
    fn shard_id(&self) -> ShardId {
        self.id
    }

    async fn try_lock(
        &self,
        ticket: Ticket,
        key: Key,
        mode: LockMode,
        wound: WoundSignal,
    ) -> Result<LockOutcome, TgError> {
        let mut table = self.table.lock().await;
        let outcome = table.try_lock(ticket, key.clone(), mode, wound);
        match &outcome {
            LockOutcome::Granted => debug!(shard_id = self.id, ticket, %key, %mode, "lock granted"),
            LockOutcome::Queued(_) => debug!(shard_id = self.id, ticket, %key, %mode, "lock queued"),
            LockOutcome::Denied(reason) => {
                debug!(shard_id = self.id, ticket, %key, %mode, ?reason, "lock denied")
            }
        }
        Ok(outcome)
    }

    async fn get(&self, ticket: Ticket, key: &Key) -> Result<Option<Value>, TgError> {
        {
            let table = self.table.lock().await;
            let state = table
                .tickets
                .get(&ticket)
                .filter(|s| s.held.contains_key(key))
                .ok_or_else(|| TgError::LockNotHeld {
                    ticket,
                    key: key.clone(),
                    mode: LockMode::Read,
                })?;
            if let Some(value) = state.writes.get(key) {
                return Ok(Some(value.clone()));
            }
        }
        // The held lock keeps every other writer off this key, so the
        // committed value cannot move under us once the table is unlocked.
        self.store.get(self.id, key).await
    }

    async fn put(&self, ticket: Ticket, key: Key, value: Value) -> Result<(), TgError> {
        let mut table = self.table.lock().await;
        let state = table
            .tickets
            .get_mut(&ticket)
            .filter(|s| s.held.get(&key) == Some(&LockMode::Write))
            .ok_or_else(|| TgError::LockNotHeld {
                ticket,
                key: key.clone(),
                mode: LockMode::Write,
            })?;
        if let Some(by) = state.wounded_by {
            return Err(TgError::Wounded { ticket, by: Some(by) });
        }
        state.writes.insert(key, value);
        Ok(())
    }

    async fn commit(&self, ticket: Ticket) -> Result<(), TgError> {
        let mut table = self.table.lock().await;
        let Some(state) = table.tickets.get(&ticket) else {
            return Ok(());
        };
        if let Some(by) = state.wounded_by {
            table.release(ticket);
            info!(shard_id = self.id, ticket, by, "commit refused, ticket was wounded");
            return Err(TgError::Wounded { ticket, by: Some(by) });
        }

        let writes: Vec<(Key, Value)> =
            state.writes.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        let count = writes.len();
        // Storage is written before any lock is released so the next holder
        // of a key reads the committed value.
        if let Err(e) = self.store.apply(self.id, writes).await {
            warn!(shard_id = self.id, ticket, error = %e, "commit failed, rolling back");
            table.release(ticket);
            return Err(e);
        }
        table.release(ticket);
        debug!(shard_id = self.id, ticket, writes = count, "committed");
        Ok(())
    }

    async fn rollback(&self, ticket: Ticket) -> Result<(), TgError> {
        let mut table = self.table.lock().await;
        if let Some(state) = table.release(ticket) {
            debug!(
                shard_id = self.id,
                ticket,
                discarded = state.writes.len(),
                "rolled back"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tg_storage::MemStore;

    use super::*;

    fn shard() -> RuntimeLockingShard<Arc<MemStore>> {
        RuntimeLockingShard::new(0, Arc::new(MemStore::new()))
    }

    async fn lock(
        shard: &RuntimeLockingShard<Arc<MemStore>>,
        ticket: Ticket,
        key: &str,
        mode: LockMode,
    ) -> (LockOutcome, WoundSignal) {
        let wound = WoundSignal::new();
        let outcome = shard.try_lock(ticket, Key::from(key), mode, wound.clone()).await.unwrap();
        (outcome, wound)
    }

    fn queued(outcome: LockOutcome) -> PendingLock {
        match outcome {
            LockOutcome::Queued(p) => p,
            other => panic!("expected queued, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn readers_share() {
        let s = shard();
        for t in 1..=3 {
            let (o, _) = lock(&s, t, "k", LockMode::Read).await;
            assert!(matches!(o, LockOutcome::Granted));
        }
        let snap = s.lock_snapshot(&Key::from("k")).await.unwrap();
        assert_eq!(snap.holders.len(), 3);
        assert!(snap.waiters.is_empty());
    }

    #[tokio::test]
    async fn same_or_weaker_rerequest_is_noop_grant() {
        let s = shard();
        let (o, _) = lock(&s, 1, "k", LockMode::Write).await;
        assert!(matches!(o, LockOutcome::Granted));
        let (o, _) = lock(&s, 1, "k", LockMode::Write).await;
        assert!(matches!(o, LockOutcome::Granted));
        let (o, _) = lock(&s, 1, "k", LockMode::Read).await;
        assert!(matches!(o, LockOutcome::Granted));

        let snap = s.lock_snapshot(&Key::from("k")).await.unwrap();
        assert_eq!(snap.holders, vec![(1, LockMode::Write)]);
    }

    #[tokio::test]
    async fn sole_reader_upgrades_in_place() {
        let s = shard();
        lock(&s, 1, "k", LockMode::Read).await;
        let (o, _) = lock(&s, 1, "k", LockMode::Write).await;
        assert!(matches!(o, LockOutcome::Granted));
        let snap = s.lock_snapshot(&Key::from("k")).await.unwrap();
        assert_eq!(snap.holders, vec![(1, LockMode::Write)]);
    }

    #[tokio::test]
    async fn younger_requester_waits_without_wounding() {
        let s = shard();
        let (_, w1) = lock(&s, 1, "k", LockMode::Write).await;
        let (o, w2) = lock(&s, 2, "k", LockMode::Write).await;
        let pending = queued(o);

        assert!(!w1.is_wounded());
        assert!(!w2.is_wounded());

        s.commit(1).await.unwrap();
        assert_eq!(pending.resolved().await, Ok(()));
        let snap = s.lock_snapshot(&Key::from("k")).await.unwrap();
        assert_eq!(snap.holders, vec![(2, LockMode::Write)]);
    }

    #[tokio::test]
    async fn older_requester_wounds_younger_holder() {
        let s = shard();
        let (_, w2) = lock(&s, 2, "k", LockMode::Read).await;
        let (o, w1) = lock(&s, 1, "k", LockMode::Write).await;
        let pending = queued(o);

        assert_eq!(w2.wounded_by(), Some(1));
        assert!(!w1.is_wounded());

        // Wounded ticket is refused further locks and cannot commit.
        let (o, _) = lock(&s, 2, "other", LockMode::Read).await;
        assert!(matches!(o, LockOutcome::Denied(DenyReason::Wounded { by: Some(1) })));

        s.rollback(2).await.unwrap();
        assert_eq!(pending.resolved().await, Ok(()));
    }

    #[tokio::test]
    async fn ticket_wounded_elsewhere_takes_nothing_here() {
        let s = shard();
        let (_, w3) = lock(&s, 3, "k", LockMode::Write).await;

        // Ticket 2 was wounded by 1 on another shard before arriving here.
        let w2 = WoundSignal::new();
        w2.wound(1);
        let o = s.try_lock(2, Key::from("k"), LockMode::Write, w2).await.unwrap();
        assert!(matches!(o, LockOutcome::Denied(DenyReason::Wounded { by: Some(1) })));

        assert!(!w3.is_wounded());
        let snap = s.lock_snapshot(&Key::from("k")).await.unwrap();
        assert_eq!(snap.holders, vec![(3, LockMode::Write)]);
        assert!(snap.waiters.is_empty());

        s.rollback(2).await.unwrap();
        s.commit(3).await.unwrap();
        assert_eq!(s.active_tickets().await, 0);
    }

    #[tokio::test]
    async fn wounded_ticket_commit_is_refused_and_rolled_back() {
        let s = shard();
        lock(&s, 5, "k", LockMode::Write).await;
        s.put(5, Key::from("k"), b"young".to_vec()).await.unwrap();
        let (o, _) = lock(&s, 3, "k", LockMode::Write).await;
        let pending = queued(o);

        let err = s.commit(5).await.unwrap_err();
        assert_eq!(err, TgError::Wounded { ticket: 5, by: Some(3) });
        assert_eq!(pending.resolved().await, Ok(()));
        assert_eq!(s.get(3, &Key::from("k")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn wound_denies_victims_pending_wait() {
        let s = shard();
        // 1 holds a; 3 holds b and waits on a; 2 then wants b.
        lock(&s, 1, "a", LockMode::Write).await;
        lock(&s, 3, "b", LockMode::Write).await;
        let (o, _) = lock(&s, 3, "a", LockMode::Write).await;
        let victim_wait = queued(o);
        let (o, _) = lock(&s, 2, "b", LockMode::Write).await;
        let _older_wait = queued(o);

        assert_eq!(victim_wait.resolved().await, Err(DenyReason::Wounded { by: Some(2) }));
        let snap = s.lock_snapshot(&Key::from("a")).await.unwrap();
        assert!(snap.waiters.is_empty());
    }

    #[tokio::test]
    async fn waiters_granted_in_ticket_order() {
        let s = shard();
        lock(&s, 1, "k", LockMode::Write).await;
        // Queue out of order: 4, 2, 3.
        let p4 = queued(lock(&s, 4, "k", LockMode::Write).await.0);
        let p2 = queued(lock(&s, 2, "k", LockMode::Write).await.0);
        let p3 = queued(lock(&s, 3, "k", LockMode::Write).await.0);

        let snap = s.lock_snapshot(&Key::from("k")).await.unwrap();
        assert_eq!(
            snap.waiters.iter().map(|(t, _)| *t).collect::<Vec<_>>(),
            vec![2, 3, 4]
        );

        s.commit(1).await.unwrap();
        assert_eq!(p2.resolved().await, Ok(()));
        s.commit(2).await.unwrap();
        assert_eq!(p3.resolved().await, Ok(()));
        s.commit(3).await.unwrap();
        assert_eq!(p4.resolved().await, Ok(()));
    }

    #[tokio::test]
    async fn compatible_readers_promoted_together() {
        let s = shard();
        lock(&s, 1, "k", LockMode::Write).await;
        let p2 = queued(lock(&s, 2, "k", LockMode::Read).await.0);
        let p3 = queued(lock(&s, 3, "k", LockMode::Read).await.0);
        let p4 = queued(lock(&s, 4, "k", LockMode::Write).await.0);

        s.rollback(1).await.unwrap();
        assert_eq!(p2.resolved().await, Ok(()));
        assert_eq!(p3.resolved().await, Ok(()));

        let snap = s.lock_snapshot(&Key::from("k")).await.unwrap();
        assert_eq!(snap.holders, vec![(2, LockMode::Read), (3, LockMode::Read)]);
        assert_eq!(snap.waiters, vec![(4, LockMode::Write)]);

        s.rollback(2).await.unwrap();
        s.rollback(3).await.unwrap();
        assert_eq!(p4.resolved().await, Ok(()));
    }

    #[tokio::test]
    async fn younger_reader_does_not_overtake_older_writer() {
        let s = shard();
        lock(&s, 5, "k", LockMode::Read).await;
        let (o, _) = lock(&s, 3, "k", LockMode::Write).await;
        let _p3 = queued(o);
        // 7 is compatible with the read holder but conflicts with waiter 3.
        let (o, _) = lock(&s, 7, "k", LockMode::Read).await;
        let _p7 = queued(o);
        // 2 is older than every waiter, so it may join the readers.
        let (o, _) = lock(&s, 2, "k", LockMode::Read).await;
        assert!(matches!(o, LockOutcome::Granted));
    }

    #[tokio::test]
    async fn exclusive_invariant_holds() {
        let s = shard();
        lock(&s, 2, "k", LockMode::Read).await;
        lock(&s, 3, "k", LockMode::Read).await;
        let (o, _) = lock(&s, 1, "k", LockMode::Write).await;
        let p1 = queued(o);

        // Writer waits until both readers are gone.
        s.rollback(2).await.unwrap();
        let snap = s.lock_snapshot(&Key::from("k")).await.unwrap();
        assert_eq!(snap.holders, vec![(3, LockMode::Read)]);
        s.rollback(3).await.unwrap();
        assert_eq!(p1.resolved().await, Ok(()));

        let snap = s.lock_snapshot(&Key::from("k")).await.unwrap();
        assert_eq!(snap.holders, vec![(1, LockMode::Write)]);
    }

    #[tokio::test]
    async fn upgrade_waits_for_older_reader() {
        let s = shard();
        lock(&s, 1, "k", LockMode::Read).await;
        lock(&s, 2, "k", LockMode::Read).await;
        let (o, w2) = lock(&s, 2, "k", LockMode::Write).await;
        let upgrade = queued(o);
        assert!(!w2.is_wounded());

        s.commit(1).await.unwrap();
        assert_eq!(upgrade.resolved().await, Ok(()));
        let snap = s.lock_snapshot(&Key::from("k")).await.unwrap();
        assert_eq!(snap.holders, vec![(2, LockMode::Write)]);
    }

    #[tokio::test]
    async fn duplicate_pending_request_is_denied() {
        let s = shard();
        lock(&s, 1, "k", LockMode::Write).await;
        let _p = queued(lock(&s, 2, "k", LockMode::Read).await.0);
        let (o, _) = lock(&s, 2, "k", LockMode::Read).await;
        assert!(matches!(o, LockOutcome::Denied(DenyReason::Duplicate)));
    }

    #[tokio::test]
    async fn commit_publishes_and_rollback_discards() {
        let s = shard();
        lock(&s, 1, "a", LockMode::Write).await;
        s.put(1, Key::from("a"), b"1".to_vec()).await.unwrap();
        // Own buffered write is visible before commit.
        assert_eq!(s.get(1, &Key::from("a")).await.unwrap(), Some(b"1".to_vec()));
        s.commit(1).await.unwrap();

        lock(&s, 2, "a", LockMode::Write).await;
        s.put(2, Key::from("a"), b"2".to_vec()).await.unwrap();
        s.rollback(2).await.unwrap();

        lock(&s, 3, "a", LockMode::Read).await;
        assert_eq!(s.get(3, &Key::from("a")).await.unwrap(), Some(b"1".to_vec()));
    }

    #[tokio::test]
    async fn get_and_put_require_locks() {
        let s = shard();
        let err = s.get(1, &Key::from("a")).await.unwrap_err();
        assert!(matches!(err, TgError::LockNotHeld { ticket: 1, .. }));

        lock(&s, 1, "a", LockMode::Read).await;
        let err = s.put(1, Key::from("a"), vec![]).await.unwrap_err();
        assert!(matches!(err, TgError::LockNotHeld { mode: LockMode::Write, .. }));
    }

    #[tokio::test]
    async fn rollback_twice_is_noop() {
        let s = shard();
        lock(&s, 1, "a", LockMode::Write).await;
        s.rollback(1).await.unwrap();
        s.rollback(1).await.unwrap();
        s.rollback(99).await.unwrap();

        assert_eq!(s.active_tickets().await, 0);
        assert!(s.lock_snapshot(&Key::from("a")).await.is_none());
        let (o, _) = lock(&s, 2, "a", LockMode::Write).await;
        assert!(matches!(o, LockOutcome::Granted));
    }

    #[tokio::test]
    async fn rollback_of_waiter_cancels_its_request() {
        let s = shard();
        lock(&s, 1, "a", LockMode::Write).await;
        let p = queued(lock(&s, 2, "a", LockMode::Write).await.0);
        s.rollback(2).await.unwrap();
        assert_eq!(p.resolved().await, Err(DenyReason::Cancelled));
        let snap = s.lock_snapshot(&Key::from("a")).await.unwrap();
        assert!(snap.waiters.is_empty());
    }
}
