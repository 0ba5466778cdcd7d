//! Request/response messages exchanged between the orchestrator and a sandbox.
//!
//! ```text
//! Orchestrator                         Sandbox worker
//!   |-- INIT{limits} ---------------------->|
//!   |<------------------------------ READY --|
//!   |-- EXECUTE{requestId, snapshot, code} ->|
//!   |<------ RESULT{requestId, ops, logs} ---|
//!   |-- RESET ------------------------------>|
//!   |<------------------------------ READY --|
//!   |<---------------------- FATAL{message} -|  (host-level failure only)
//! ```
//!
//! Both directions serialize with a `type` tag and camelCase fields, so the
//! same messages can cross a process boundary as JSON.

use crate::types::{ExecutionSnapshot, RunResult, SandboxLimits};
use serde::{Deserialize, Serialize};

/// Payload of an `EXECUTE` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    pub request_id: u64,

    /// Agent info, clock, id counter, transactions and persistent state
    #[serde(flatten)]
    pub snapshot: ExecutionSnapshot,

    /// Script source for this tick
    pub code: String,
}

impl ExecuteRequest {
    pub fn new(request_id: u64, snapshot: ExecutionSnapshot, code: impl Into<String>) -> Self {
        Self {
            request_id,
            snapshot,
            code: code.into(),
        }
    }
}

/// Messages sent from the orchestrator to a sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum HostMessage {
    Init { limits: SandboxLimits },
    Execute(Box<ExecuteRequest>),
    Reset,
}

impl HostMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            HostMessage::Init { .. } => "INIT",
            HostMessage::Execute(_) => "EXECUTE",
            HostMessage::Reset => "RESET",
        }
    }
}

/// Messages sent from a sandbox back to the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum WorkerMessage {
    Ready,
    Result(Box<RunResult>),
    Fatal { message: String },
}

impl WorkerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerMessage::Ready => "READY",
            WorkerMessage::Result(_) => "RESULT",
            WorkerMessage::Fatal { .. } => "FATAL",
        }
    }
}
