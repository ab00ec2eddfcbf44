use std::sync::Arc;

use tokio::sync::watch;

use tg_types::Ticket;

/// Abort notification for one transaction attempt.
///
/// The broker creates one per attempt and hands clones to every shard the
/// attempt touches. A shard that wounds the attempt fires it; the broker
/// selects on it while a lock request is queued. The value records which
/// (older) ticket caused the wound. Only the first wound is kept.
#[derive(Debug, Clone)]
pub struct WoundSignal {
    tx: Arc<watch::Sender<Option<Ticket>>>,
}

impl WoundSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        WoundSignal { tx: Arc::new(tx) }
    }

    /// Returns `true` if this call delivered the wound.
    pub fn wound(&self, by: Ticket) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(by);
            true
        })
    }

    pub fn wounded_by(&self) -> Option<Ticket> {
        *self.tx.borrow()
    }

    pub fn is_wounded(&self) -> bool {
        self.wounded_by().is_some()
    }

    /// Resolves once the attempt has been wounded.
    pub async fn wounded(&self) -> Option<Ticket> {
        let mut rx = self.tx.subscribe();
        let by = match rx.wait_for(Option::is_some).await {
            Ok(by) => *by,
            Err(_) => None,
        };
        by
    }
}

impl Default for WoundSignal {
    fn default() -> Self {
        Self::new()
    }
}
