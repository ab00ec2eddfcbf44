use std::sync::atomic::{AtomicU64, Ordering};

use tg_types::{TgError, Ticket};

/// Cluster-wide ticket sequencer.
///
/// The counter lives behind an atomic and is never exposed; every ticket is
/// strictly greater than all tickets issued before it, including tickets of
/// transactions that later aborted.
#[derive(Debug)]
pub struct TicketMachine {
    next: AtomicU64,
}

impl TicketMachine {
    pub fn new() -> Self {
        TicketMachine { next: AtomicU64::new(1) }
    }

    #[cfg(test)]
    fn starting_at(first: Ticket) -> Self {
        TicketMachine { next: AtomicU64::new(first) }
    }

    pub fn new_ticket(&self) -> Result<Ticket, TgError> {
        self.next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_add(1))
            .map_err(|_| TgError::CounterExhausted)
    }

    #[cfg(test)]
    fn peek(&self) -> Ticket {
        self.next.load(Ordering::SeqCst)
    }
}

impl Default for TicketMachine {
    fn default() -> Self {
        Self::new()
    }
}
