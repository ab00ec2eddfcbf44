use std::collections::BTreeMap;

use tg_types::{Key, LockMode, TgError, Value};

use super::{decode, decode_u64, encode, encode_u64, KeyAccess, RunOutput, Runner};

/// Registers available to a script.
pub const REGISTERS: usize = 16;

/// Upper bound on executed instructions. Scripts have no jumps, so this
/// only limits program length.
const MAX_OPS: usize = 4096;

/// Where an instruction takes a byte string from.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Operand {
    Const(Vec<u8>),
    Reg(u8),
    /// The n-th entry of the bincode-encoded `Vec<Vec<u8>>` parameters.
    Arg(u8),
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Op {
    /// Lock `key` in `mode` and load its value (empty if absent) into `dst`.
    Load { key: Operand, mode: LockMode, dst: u8 },
    /// Lock `key` for writing and record `value` as its new contents.
    Store { key: Operand, value: Operand },
    /// `dst = lhs + rhs` over little-endian u64. Faults on overflow.
    Add { dst: u8, lhs: Operand, rhs: Operand },
    /// `dst = lhs - rhs` over little-endian u64. Faults on underflow.
    Sub { dst: u8, lhs: Operand, rhs: Operand },
    /// Abort the run with `message` unless the operands are equal.
    AssertEq { lhs: Operand, rhs: Operand, message: String },
    Fail { message: String },
    /// Stop and hand `value` back as the contract result.
    Return { value: Operand },
}

/// A straight-line contract program.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Script {
    pub ops: Vec<Op>,
}

impl Script {
    pub fn new(ops: Vec<Op>) -> Self {
        Script { ops }
    }

    /// Program bytes as the runner expects them.
    pub fn encode(&self) -> Result<Vec<u8>, TgError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, TgError> {
        decode(bytes)
    }

    /// Parameter bytes for `Operand::Arg` lookups.
    pub fn encode_args(args: &[Vec<u8>]) -> Result<Vec<u8>, TgError> {
        encode(&args)
    }
}

/// Runs bincode-encoded [`Script`] programs.
#[derive(Debug, Clone, Default)]
pub struct ScriptRunner;

impl ScriptRunner {
    pub fn new() -> Self {
        ScriptRunner
    }
}

struct Frame {
    regs: Vec<Value>,
    args: Vec<Vec<u8>>,
    updates: BTreeMap<Key, Value>,
}

impl Frame {
    fn operand(&self, op: &Operand) -> Result<Value, TgError> {
        match op {
            Operand::Const(bytes) => Ok(bytes.clone()),
            Operand::Reg(r) => self
                .regs
                .get(*r as usize)
                .cloned()
                .ok_or_else(|| TgError::RunnerFault(format!("no register r{r}"))),
            Operand::Arg(i) => self
                .args
                .get(*i as usize)
                .cloned()
                .ok_or_else(|| TgError::RunnerFault(format!("missing argument {i}"))),
        }
    }

    fn set(&mut self, dst: u8, value: Value) -> Result<(), TgError> {
        let slot = self
            .regs
            .get_mut(dst as usize)
            .ok_or_else(|| TgError::RunnerFault(format!("no register r{dst}")))?;
        *slot = value;
        Ok(())
    }

    fn arith(
        &mut self,
        dst: u8,
        lhs: &Operand,
        rhs: &Operand,
        f: fn(u64, u64) -> Option<u64>,
        what: &str,
    ) -> Result<(), TgError> {
        let a = decode_u64(&self.operand(lhs)?)?;
        let b = decode_u64(&self.operand(rhs)?)?;
        let n = f(a, b).ok_or_else(|| TgError::RunnerFault(format!("{what} of {a} and {b} out of range")))?;
        self.set(dst, encode_u64(n))
    }
}

impl Runner for ScriptRunner {
    async fn run<A: KeyAccess>(
        &self,
        program: &[u8],
        params: &[u8],
        access: &mut A,
    ) -> Result<RunOutput, TgError> {
        let script = Script::decode(program)?;
        if script.ops.len() > MAX_OPS {
            return Err(TgError::RunnerFault(format!("program has {} ops", script.ops.len())));
        }
        let args: Vec<Vec<u8>> = if params.is_empty() { Vec::new() } else { decode(params)? };
        let mut frame = Frame { regs: vec![Vec::new(); REGISTERS], args, updates: BTreeMap::new() };

        for op in &script.ops {
            match op {
                Op::Load { key, mode, dst } => {
                    let key = Key::from(frame.operand(key)?);
                    let current = access.access(key.clone(), *mode).await?;
                    // A key written earlier in this run reads back its new value.
                    let value = match frame.updates.get(&key) {
                        Some(pending) => pending.clone(),
                        None => current.unwrap_or_default(),
                    };
                    frame.set(*dst, value)?;
                }
                Op::Store { key, value } => {
                    let key = Key::from(frame.operand(key)?);
                    let value = frame.operand(value)?;
                    access.access(key.clone(), LockMode::Write).await?;
                    frame.updates.insert(key, value);
                }
                Op::Add { dst, lhs, rhs } => frame.arith(*dst, lhs, rhs, u64::checked_add, "sum")?,
                Op::Sub { dst, lhs, rhs } => frame.arith(*dst, lhs, rhs, u64::checked_sub, "difference")?,
                Op::AssertEq { lhs, rhs, message } => {
                    if frame.operand(lhs)? != frame.operand(rhs)? {
                        return Err(TgError::RunnerFault(message.clone()));
                    }
                }
                Op::Fail { message } => return Err(TgError::RunnerFault(message.clone())),
                Op::Return { value } => {
                    let result = frame.operand(value)?;
                    return Ok(RunOutput { updates: frame.updates, result });
                }
            }
        }
        Ok(RunOutput { updates: frame.updates, result: Vec::new() })
    }
}
