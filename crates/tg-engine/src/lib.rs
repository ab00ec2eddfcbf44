//! Sharded transaction engine: ticket-ordered wound-wait locking across
//! runtime locking shards, coordinated per transaction by a broker and
//! driven by contract-executing agents.

pub mod agent;
pub mod broker;
pub mod directory;
pub mod runner;
pub mod shard;
pub mod ticket_machine;
pub mod wound;

pub use agent::{Agent, AgentConfig, AgentState, ExecReceipt};
pub use broker::Broker;
pub use directory::{Directory, Partition};
pub use runner::{AnyRunner, KeyAccess, RunOutput, Runner, RunnerKind};
pub use shard::{LockOutcome, LockSnapshot, LockingShard, RuntimeLockingShard};
pub use ticket_machine::TicketMachine;
pub use wound::WoundSignal;
