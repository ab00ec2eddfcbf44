use std::fmt;

pub type ShardId = u64;

/// Globally unique, strictly increasing transaction ordering token.
/// Lower tickets are older and win conflicts.
pub type Ticket = u64;

/// Stored value. Keys that were never written read as `None`.
pub type Value = Vec<u8>;

/// Opaque key bytes.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, serde::Serialize, serde::Deserialize)]
pub struct Key(Vec<u8>);

impl Key {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Key(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key(s.as_bytes().to_vec())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key(s.into_bytes())
    }
}

impl From<Vec<u8>> for Key {
    fn from(bytes: Vec<u8>) -> Self {
        Key(bytes)
    }
}

impl From<&[u8]> for Key {
    fn from(bytes: &[u8]) -> Self {
        Key(bytes.to_vec())
    }
}

impl AsRef<[u8]> for Key {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

// Keys are usually printable; fall back to hex for binary keys so log
// lines stay readable.
impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) if !s.chars().any(char::is_control) => f.write_str(s),
            _ => {
                f.write_str("0x")?;
                for b in &self.0 {
                    write!(f, "{b:02x}")?;
                }
                Ok(())
            }
        }
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({self})")
    }
}

/// Lock strength. `Read < Write`, so a held mode covers a request when
/// `held >= requested`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub enum LockMode {
    Read,
    Write,
}

impl LockMode {
    /// Two holders on the same key are compatible only if both read.
    pub fn compatible_with(self, other: LockMode) -> bool {
        self == LockMode::Read && other == LockMode::Read
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockMode::Read => f.write_str("read"),
            LockMode::Write => f.write_str("write"),
        }
    }
}

/// Broker-side lifecycle of one transaction attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum TxnStatus {
    Active,
    Committing,
    Committed,
    Aborting,
    Aborted,
}

impl TxnStatus {
    pub fn is_finished(self) -> bool {
        matches!(self, TxnStatus::Committed | TxnStatus::Aborted)
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TgError {
    #[error("no shard owns key {key}")]
    UnknownShard { key: Key },
    #[error("lock on {key} denied to ticket {ticket}")]
    LockDenied { ticket: Ticket, key: Key },
    #[error("ticket {ticket} wounded by ticket {by:?}")]
    Wounded { ticket: Ticket, by: Option<Ticket> },
    #[error("runner fault: {0}")]
    RunnerFault(String),
    #[error("ticket counter exhausted")]
    CounterExhausted,
    #[error("ticket {ticket} does not hold a {mode} lock on {key}")]
    LockNotHeld { ticket: Ticket, key: Key, mode: LockMode },
    #[error("ticket {0} is not active")]
    TransactionNotActive(Ticket),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl TgError {
    /// Aborts that a caller may clear by rerunning with a fresh ticket.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TgError::Wounded { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_mode_strength_orders_read_below_write() {
        assert!(LockMode::Read < LockMode::Write);
        assert!(LockMode::Write >= LockMode::Read);
    }

    #[test]
    fn only_readers_are_compatible() {
        assert!(LockMode::Read.compatible_with(LockMode::Read));
        assert!(!LockMode::Read.compatible_with(LockMode::Write));
        assert!(!LockMode::Write.compatible_with(LockMode::Read));
        assert!(!LockMode::Write.compatible_with(LockMode::Write));
    }

    #[test]
    fn key_display_falls_back_to_hex() {
        assert_eq!(Key::from("acct/7").to_string(), "acct/7");
        assert_eq!(Key::new(vec![0x00, 0xff]).to_string(), "0x00ff");
    }

    #[test]
    fn only_wounds_are_retryable() {
        assert!(TgError::Wounded { ticket: 3, by: Some(1) }.is_retryable());
        assert!(!TgError::LockDenied { ticket: 3, key: "k".into() }.is_retryable());
        assert!(!TgError::RunnerFault("boom".into()).is_retryable());
    }
}
