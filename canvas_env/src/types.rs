//! Common types shared by the store, the orchestrator and the sandboxes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier of an agent on the canvas.
///
/// Assigned by the world store from its single id counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub u64);

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "agent-{}", self.0)
    }
}

/// Identifier of a connection (transaction) between two agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxId(pub u64);

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx-{}", self.0)
    }
}

/// Role an agent plays in the marketplace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    Requester,
    Provider,
    Validator,
}

impl AgentRole {
    pub fn name(&self) -> &'static str {
        match self {
            AgentRole::Requester => "requester",
            AgentRole::Provider => "provider",
            AgentRole::Validator => "validator",
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AgentRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "requester" => Ok(AgentRole::Requester),
            "provider" => Ok(AgentRole::Provider),
            "validator" => Ok(AgentRole::Validator),
            _ => Err(format!("Unknown agent role: {}", s)),
        }
    }
}

/// Lifecycle state of a transaction.
///
/// `Settled` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxState {
    Initiated,
    Quoted,
    Committed,
    InProgress,
    Delivered,
    Settled,
    Disputed,
    Cancelled,
}

impl TxState {
    /// Every state, in lifecycle order.
    pub const ALL: [TxState; 8] = [
        TxState::Initiated,
        TxState::Quoted,
        TxState::Committed,
        TxState::InProgress,
        TxState::Delivered,
        TxState::Settled,
        TxState::Disputed,
        TxState::Cancelled,
    ];

    /// Returns the wire name of the state.
    pub fn name(&self) -> &'static str {
        match self {
            TxState::Initiated => "INITIATED",
            TxState::Quoted => "QUOTED",
            TxState::Committed => "COMMITTED",
            TxState::InProgress => "IN_PROGRESS",
            TxState::Delivered => "DELIVERED",
            TxState::Settled => "SETTLED",
            TxState::Disputed => "DISPUTED",
            TxState::Cancelled => "CANCELLED",
        }
    }

    /// Returns true if no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TxState::Settled | TxState::Cancelled)
    }

    /// Returns true while the transaction amount sits in the source's escrow.
    pub fn holds_escrow(&self) -> bool {
        matches!(
            self,
            TxState::Committed | TxState::InProgress | TxState::Delivered | TxState::Disputed
        )
    }
}

impl fmt::Display for TxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TxState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TxState::ALL
            .iter()
            .copied()
            .find(|state| state.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("Unknown transaction state: {}", s))
    }
}

/// Read-only view of an agent handed to its own script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentInfo {
    pub id: AgentId,
    pub name: String,
    pub role: AgentRole,

    /// Available balance in micro-units
    pub balance_micro: u64,

    /// Balance held in escrow for committed transactions
    pub locked_micro: u64,
}

/// Read-only view of a connection as seen from one of its parties.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionView {
    pub id: TxId,
    pub source: AgentId,
    pub target: AgentId,
    pub state: TxState,
    pub amount_micro: u64,
    pub service: String,
    pub created_tick: u64,
    pub updated_tick: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dispute_reason: Option<String>,
}

/// Per-agent, per-tick view of the world given to a sandbox.
///
/// Always an owned copy; a sandbox never holds a reference into the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSnapshot {
    pub agent: AgentInfo,
    pub virtual_time_ms: u64,
    pub id_counter: u64,

    /// Transactions where the agent is the target
    pub incoming_transactions: Vec<TransactionView>,

    /// Transactions where the agent is the source
    pub transactions: Vec<TransactionView>,

    /// The agent's private state from the previous tick
    pub persistent_state: serde_json::Value,
}

/// A declarative request to mutate the world, emitted by agent code.
///
/// Ops are data only. The store decides whether and how they apply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum Op {
    CreateTx {
        provider: AgentId,
        amount_micro: u64,
        service: String,
        /// Provisional id from the sandbox's local counter. Never trusted.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id_hint: Option<TxId>,
    },
    TransitionState {
        tx: TxId,
        to: TxState,
    },
    ReleaseEscrow {
        tx: TxId,
    },
    Cancel {
        tx: TxId,
    },
    Dispute {
        tx: TxId,
        reason: String,
    },
    SubmitJob {
        tx: TxId,
        payload: serde_json::Value,
    },
    /// Any op tag this build does not know about.
    #[serde(other)]
    Unrecognized,
}

impl Op {
    /// Returns the wire tag of the op.
    pub fn kind(&self) -> &'static str {
        match self {
            Op::CreateTx { .. } => "CREATE_TX",
            Op::TransitionState { .. } => "TRANSITION_STATE",
            Op::ReleaseEscrow { .. } => "RELEASE_ESCROW",
            Op::Cancel { .. } => "CANCEL",
            Op::Dispute { .. } => "DISPUTE",
            Op::SubmitJob { .. } => "SUBMIT_JOB",
            Op::Unrecognized => "UNRECOGNIZED",
        }
    }

    /// Returns the transaction the op refers to, if any.
    pub fn tx(&self) -> Option<TxId> {
        match self {
            Op::TransitionState { tx, .. }
            | Op::ReleaseEscrow { tx }
            | Op::Cancel { tx }
            | Op::Dispute { tx, .. }
            | Op::SubmitJob { tx, .. } => Some(*tx),
            Op::CreateTx { .. } | Op::Unrecognized => None,
        }
    }
}

/// Severity of a log entry produced during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
}

impl LogEntry {
    pub fn info(message: impl Into<String>) -> Self {
        Self { level: LogLevel::Info, message: message.into() }
    }

    pub fn warn(message: impl Into<String>) -> Self {
        Self { level: LogLevel::Warn, message: message.into() }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self { level: LogLevel::Error, message: message.into() }
    }
}

/// Classification of a failed run or a rejected op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    /// Script failed to parse
    Syntax,
    /// Unhandled error raised while the script ran
    Runtime,
    /// Memory, stack or operation budget exceeded
    Resource,
    /// Script did not return before its deadline
    Timeout,
    /// Op rejected by the validator (never produced by a sandbox)
    Validation,
}

impl ErrorKind {
    pub fn name(&self) -> &'static str {
        match self {
            ErrorKind::Syntax => "syntax",
            ErrorKind::Runtime => "runtime",
            ErrorKind::Resource => "resource",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Validation => "validation",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Structured error surfaced to the user as a log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptError {
    #[serde(rename = "type")]
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
}

impl ScriptError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            line: None,
            column: None,
        }
    }

    pub fn at(mut self, line: Option<u32>, column: Option<u32>) -> Self {
        self.line = line;
        self.column = column;
        self
    }

    pub fn timeout(limit_ms: u64) -> Self {
        Self::new(
            ErrorKind::Timeout,
            format!("execution exceeded {}ms", limit_ms),
        )
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    /// Renders the error as an `error`-level log entry.
    pub fn to_log_entry(&self) -> LogEntry {
        match (self.line, self.column) {
            (Some(line), Some(column)) => LogEntry::error(format!(
                "{} error at {}:{}: {}",
                self.kind, line, column, self.message
            )),
            (Some(line), None) => {
                LogEntry::error(format!("{} error at line {}: {}", self.kind, line, self.message))
            }
            _ => LogEntry::error(format!("{} error: {}", self.kind, self.message)),
        }
    }
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Resource limits a sandbox enforces on every run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SandboxLimits {
    pub max_execution_time_ms: u64,
    pub max_memory_bytes: u64,
    pub max_stack_size_bytes: u64,

    /// Optional deterministic budget of interpreter operations
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_operations: Option<u64>,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            max_execution_time_ms: 250,
            max_memory_bytes: 16 * 1024 * 1024, // 16 MiB
            max_stack_size_bytes: 512 * 1024,   // 512 KiB
            max_operations: None,
        }
    }
}

/// Outcome of one `EXECUTE` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    pub request_id: u64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ScriptError>,
    pub id_counter: u64,
    pub logs: Vec<LogEntry>,
    pub ops: Vec<Op>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_state: Option<serde_json::Value>,
}

impl RunResult {
    /// Builds a failed result. Failed runs never carry ops or state.
    pub fn failed(request_id: u64, id_counter: u64, error: ScriptError, logs: Vec<LogEntry>) -> Self {
        Self {
            request_id,
            success: false,
            error: Some(error),
            id_counter,
            logs,
            ops: Vec::new(),
            final_state: None,
        }
    }
}
