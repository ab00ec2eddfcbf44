//! Contract execution backends.
//!
//! A runner interprets a contract program against its parameters and calls
//! back through [`KeyAccess`] for every key the program touches. The agent
//! supplies the callback and never looks inside the program.

mod native;
mod script;

use std::collections::BTreeMap;
use std::future::Future;

use tg_types::{Key, LockMode, TgError, Value};

pub use native::{IncrementArgs, NativeRunner, ReadArgs, TransferArgs};
pub use script::{Op, Operand, Script, ScriptRunner};

/// Result of a successful run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOutput {
    /// Writes to buffer at the shards before commit.
    pub updates: BTreeMap<Key, Value>,
    /// Contract return value handed back to the caller.
    pub result: Value,
}

/// Callback a runner invokes for each key access. Resolves to the value
/// visible to the transaction once the lock is held, or to the denial.
pub trait KeyAccess: Send {
    fn access(&mut self, key: Key, mode: LockMode)
        -> impl Future<Output = Result<Option<Value>, TgError>> + Send;
}

pub trait Runner: Send + Sync + 'static {
    /// Execute `program`. Denials from `access` must be returned unchanged;
    /// faults in the program itself are `TgError::RunnerFault`.
    fn run<A: KeyAccess>(
        &self,
        program: &[u8],
        params: &[u8],
        access: &mut A,
    ) -> impl Future<Output = Result<RunOutput, TgError>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerKind {
    Script,
    Native,
}

/// Every supported backend behind one `Runner`.
#[derive(Debug, Clone)]
pub enum AnyRunner {
    Script(ScriptRunner),
    Native(NativeRunner),
}

impl AnyRunner {
    pub fn from_kind(kind: RunnerKind) -> Self {
        match kind {
            RunnerKind::Script => AnyRunner::Script(ScriptRunner::new()),
            RunnerKind::Native => AnyRunner::Native(NativeRunner::new()),
        }
    }

    pub fn kind(&self) -> RunnerKind {
        match self {
            AnyRunner::Script(_) => RunnerKind::Script,
            AnyRunner::Native(_) => RunnerKind::Native,
        }
    }
}

impl Runner for AnyRunner {
    async fn run<A: KeyAccess>(
        &self,
        program: &[u8],
        params: &[u8],
        access: &mut A,
    ) -> Result<RunOutput, TgError> {
        match self {
            AnyRunner::Script(r) => r.run(program, params, access).await,
            AnyRunner::Native(r) => r.run(program, params, access).await,
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers shared by the backends
// ---------------------------------------------------------------------------

/// Balances and counters are little-endian `u64`; an absent or empty value
/// counts as zero.
pub fn decode_u64(value: &[u8]) -> Result<u64, TgError> {
    if value.is_empty() {
        return Ok(0);
    }
    let bytes: [u8; 8] = value
        .try_into()
        .map_err(|_| TgError::RunnerFault(format!("expected 8 byte integer, got {} bytes", value.len())))?;
    Ok(u64::from_le_bytes(bytes))
}

pub fn encode_u64(n: u64) -> Value {
    n.to_le_bytes().to_vec()
}

pub(crate) fn encode<T: serde::Serialize>(val: &T) -> Result<Vec<u8>, TgError> {
    bincode::serde::encode_to_vec(val, bincode::config::standard())
        .map_err(|e| TgError::InvalidArgument(e.to_string()))
}

pub(crate) fn decode<T: for<'de> serde::Deserialize<'de>>(bytes: &[u8]) -> Result<T, TgError> {
    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map(|(v, _)| v)
        .map_err(|e| TgError::RunnerFault(format!("malformed input: {e}")))
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integers_round_trip_and_empty_is_zero() {
        assert_eq!(decode_u64(&encode_u64(1234)).unwrap(), 1234);
        assert_eq!(decode_u64(&[]).unwrap(), 0);
        assert!(matches!(decode_u64(&[1, 2, 3]), Err(TgError::RunnerFault(_))));
    }

    #[test]
    fn runner_kind_selects_backend() {
        assert_eq!(AnyRunner::from_kind(RunnerKind::Script).kind(), RunnerKind::Script);
        assert_eq!(AnyRunner::from_kind(RunnerKind::Native).kind(), RunnerKind::Native);
    }
}
