use tg_types::{Key, LockMode, TgError, Value};

use super::{decode, decode_u64, encode, encode_u64, KeyAccess, RunOutput, Runner};

/// Parameters for the `transfer` contract.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TransferArgs {
    pub from: Key,
    pub to: Key,
    pub amount: u64,
}

/// Parameters for the `increment` contract.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct IncrementArgs {
    pub key: Key,
    pub by: u64,
}

/// Parameters for the `read` contract. The result is the bincode encoding
/// of `Vec<Option<Value>>` in argument order.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ReadArgs {
    pub keys: Vec<Key>,
}

/// Built-in contracts selected by name. The program bytes are the UTF-8
/// contract name and the parameters are the matching `*Args`, bincode
/// encoded.
#[derive(Debug, Clone, Default)]
pub struct NativeRunner;

impl NativeRunner {
    pub const TRANSFER: &'static str = "transfer";
    pub const INCREMENT: &'static str = "increment";
    pub const READ: &'static str = "read";

    pub fn new() -> Self {
        NativeRunner
    }

    pub fn transfer_params(args: &TransferArgs) -> Result<Vec<u8>, TgError> {
        encode(args)
    }

    pub fn increment_params(args: &IncrementArgs) -> Result<Vec<u8>, TgError> {
        encode(args)
    }

    pub fn read_params(args: &ReadArgs) -> Result<Vec<u8>, TgError> {
        encode(args)
    }

    /// Decode the result of a `read` run.
    pub fn read_result(result: &[u8]) -> Result<Vec<Option<Value>>, TgError> {
        decode(result)
    }
}

impl Runner for NativeRunner {
    async fn run<A: KeyAccess>(
        &self,
        program: &[u8],
        params: &[u8],
        access: &mut A,
    ) -> Result<RunOutput, TgError> {
        match program {
            b"transfer" => transfer(decode(params)?, access).await,
            b"increment" => increment(decode(params)?, access).await,
            b"read" => read(decode(params)?, access).await,
            other => Err(TgError::RunnerFault(format!(
                "unknown contract {:?}",
                String::from_utf8_lossy(other)
            ))),
        }
    }
}

async fn transfer<A: KeyAccess>(args: TransferArgs, access: &mut A) -> Result<RunOutput, TgError> {
    let mut out = RunOutput::default();
    // Source before destination. Opposite transfers deadlock-free via wound-wait.
    let from_balance = decode_u64(&access.access(args.from.clone(), LockMode::Write).await?.unwrap_or_default())?;
    if args.from == args.to {
        out.result = encode_u64(from_balance);
        return Ok(out);
    }
    let to_balance = decode_u64(&access.access(args.to.clone(), LockMode::Write).await?.unwrap_or_default())?;

    let remaining = from_balance.checked_sub(args.amount).ok_or_else(|| {
        TgError::RunnerFault(format!(
            "insufficient funds in {}: {} < {}",
            args.from, from_balance, args.amount
        ))
    })?;
    let credited = to_balance
        .checked_add(args.amount)
        .ok_or_else(|| TgError::RunnerFault(format!("balance of {} overflows", args.to)))?;

    out.updates.insert(args.from, encode_u64(remaining));
    out.updates.insert(args.to, encode_u64(credited));
    out.result = encode_u64(remaining);
    Ok(out)
}

async fn increment<A: KeyAccess>(args: IncrementArgs, access: &mut A) -> Result<RunOutput, TgError> {
    let current = decode_u64(&access.access(args.key.clone(), LockMode::Write).await?.unwrap_or_default())?;
    let next = current
        .checked_add(args.by)
        .ok_or_else(|| TgError::RunnerFault(format!("counter {} overflows", args.key)))?;
    let mut out = RunOutput { result: encode_u64(next), ..Default::default() };
    out.updates.insert(args.key, encode_u64(next));
    Ok(out)
}

async fn read<A: KeyAccess>(args: ReadArgs, access: &mut A) -> Result<RunOutput, TgError> {
    let mut values = Vec::with_capacity(args.keys.len());
    for key in args.keys {
        values.push(access.access(key, LockMode::Read).await?);
    }
    Ok(RunOutput { result: encode(&values)?, ..Default::default() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::testing::RecordingAccess;

    fn transfer_args(from: &str, to: &str, amount: u64) -> Vec<u8> {
        NativeRunner::transfer_params(&TransferArgs { from: from.into(), to: to.into(), amount }).unwrap()
    }

    #[tokio::test]
    async fn transfer_moves_funds_under_write_locks() {
        let mut access = RecordingAccess::default();
        access.values.insert(Key::from("a"), encode_u64(50));
        access.values.insert(Key::from("b"), encode_u64(5));

        let out = NativeRunner::new()
            .run(b"transfer", &transfer_args("a", "b", 20), &mut access)
            .await
            .unwrap();

        assert_eq!(access.calls, vec![(Key::from("a"), LockMode::Write), (Key::from("b"), LockMode::Write)]);
        assert_eq!(out.updates.get(&Key::from("a")), Some(&encode_u64(30)));
        assert_eq!(out.updates.get(&Key::from("b")), Some(&encode_u64(25)));
    }

    #[tokio::test]
    async fn transfer_to_self_writes_nothing() {
        let mut access = RecordingAccess::default();
        access.values.insert(Key::from("a"), encode_u64(50));

        let out = NativeRunner::new()
            .run(b"transfer", &transfer_args("a", "a", 20), &mut access)
            .await
            .unwrap();
        assert!(out.updates.is_empty());
        assert_eq!(access.calls.len(), 1);
    }

    #[tokio::test]
    async fn insufficient_funds_faults() {
        let mut access = RecordingAccess::default();
        access.values.insert(Key::from("a"), encode_u64(10));

        let err = NativeRunner::new()
            .run(b"transfer", &transfer_args("a", "b", 11), &mut access)
            .await
            .unwrap_err();
        assert!(matches!(err, TgError::RunnerFault(_)));
    }

    #[tokio::test]
    async fn increment_starts_absent_keys_at_zero() {
        let params = NativeRunner::increment_params(&IncrementArgs { key: "c".into(), by: 7 }).unwrap();
        let mut access = RecordingAccess::default();

        let out = NativeRunner::new().run(b"increment", &params, &mut access).await.unwrap();
        assert_eq!(out.updates.get(&Key::from("c")), Some(&encode_u64(7)));
        assert_eq!(decode_u64(&out.result).unwrap(), 7);
    }

    #[tokio::test]
    async fn read_takes_shared_locks_and_reports_absence() {
        let params = NativeRunner::read_params(&ReadArgs { keys: vec!["x".into(), "y".into()] }).unwrap();
        let mut access = RecordingAccess::default();
        access.values.insert(Key::from("x"), b"1".to_vec());

        let out = NativeRunner::new().run(b"read", &params, &mut access).await.unwrap();
        assert!(out.updates.is_empty());
        assert!(access.calls.iter().all(|(_, mode)| *mode == LockMode::Read));
        assert_eq!(NativeRunner::read_result(&out.result).unwrap(), vec![Some(b"1".to_vec()), None]);
    }

    #[tokio::test]
    async fn unknown_contract_and_bad_params_fault() {
        let mut access = RecordingAccess::default();
        let err = NativeRunner::new().run(b"mint", &[], &mut access).await.unwrap_err();
        assert!(matches!(err, TgError::RunnerFault(_)));

        let err = NativeRunner::new().run(b"transfer", &[0xff], &mut access).await.unwrap_err();
        assert!(matches!(err, TgError::RunnerFault(_)));
        assert!(access.calls.is_empty());
    }
}
