//! Error types for the sandbox boundary.

use thiserror::Error;

/// Errors raised by the host side of a sandbox connection.
///
/// Script failures are not errors at this level; they travel inside a
/// `RunResult` as data.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The worker hung up (thread exited or channel dropped)
    #[error("Sandbox channel closed: {0}")]
    ChannelClosed(String),

    /// The worker could not be started
    #[error("Failed to spawn sandbox: {0}")]
    SpawnFailed(String),

    /// The worker replied with a message that does not fit the protocol
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// No reply arrived before the deadline
    #[error("Sandbox did not answer within {0}ms")]
    Timeout(u64),

    /// The worker replied `FATAL`
    #[error("Sandbox failed: {0}")]
    Fatal(String),
}

impl SandboxError {
    /// Creates a channel-closed error.
    pub fn closed(label: impl std::fmt::Display) -> Self {
        Self::ChannelClosed(label.to_string())
    }

    /// Creates a protocol error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }
}
