//! Agent Canvas Sandbox Layer
//!
//! This crate holds everything on the far side of the sandbox boundary:
//! the wire types an agent script sees, the worker protocol, and the
//! thread-backed script host that runs untrusted agent code.
//!
//! # Core Concept: Declarative Runs
//!
//! A script never touches the world. Each tick it receives an
//! `ExecutionSnapshot`, and the only way it can affect anything is by
//! returning a list of `Op`s that the orchestrator later validates:
//! - Reads come from the snapshot (`api.agent`, `api.incoming`, `api.state`)
//! - Writes are recorded as ops (`api.create_transaction(..)`, `api.transition_state(..)`)
//! - Time is virtual (`api.now`) and wall clock is unavailable
//!
//! # Example
//!
//! ```ignore
//! use canvas_env::{HostMessage, SandboxProvider, SandboxTransport, ThreadSandboxProvider};
//!
//! async fn run_once(limits: SandboxLimits, request: ExecuteRequest) {
//!     let mut sandbox = ThreadSandboxProvider.spawn("agent-1", &limits)?;
//!     sandbox.send(HostMessage::Init { limits }).await?;
//!     let _ready = sandbox.recv().await;
//!     sandbox.send(HostMessage::Execute(Box::new(request))).await?;
//!     let reply = sandbox.recv().await;
//! }
//! ```

mod error;
mod meter;
mod protocol;
mod script_host;
mod transport;
mod types;
mod worker;

pub use error::SandboxError;
pub use protocol::{ExecuteRequest, HostMessage, WorkerMessage};
pub use script_host::{ScriptHost, MAX_OPS_PER_RUN, TICK_HANDLER};
pub use transport::{SandboxProvider, SandboxTransport};
pub use types::{
    AgentId, AgentInfo, AgentRole, ErrorKind, ExecutionSnapshot, LogEntry, LogLevel, Op,
    RunResult, SandboxLimits, ScriptError, TransactionView, TxId, TxState,
};
pub use worker::{ThreadSandbox, ThreadSandboxProvider};
