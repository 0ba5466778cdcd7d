//! Transport abstraction between the orchestrator and one sandbox.

use async_trait::async_trait;
use crate::error::SandboxError;
use crate::protocol::{HostMessage, WorkerMessage};
use crate::types::SandboxLimits;

/// One end of the worker RPC channel, owned by the orchestrator.
///
/// # Implementations
///
/// - **Threaded**: `ThreadSandbox` - a dedicated OS thread running the script host
/// - **Tests**: scripted doubles that inject faults (FATAL, silence)
///
/// # Message Flow
///
/// ```text
/// Orchestrator                Transport                 Worker
///   |-- send(EXECUTE) ---------->|                         |
///   |                            |-- [isolated thread] --->|
///   |                            |<---------- RESULT ------|
///   |<-- recv() -> RESULT -------|                         |
/// ```
#[async_trait]
pub trait SandboxTransport: Send + Sync + 'static {
    /// Queues a message for the worker.
    ///
    /// # Returns
    /// * `Ok(())` - Message handed to the worker
    /// * `Err(SandboxError::ChannelClosed)` - The worker is gone
    async fn send(&self, message: HostMessage) -> Result<(), SandboxError>;

    /// Receives the next message from the worker.
    ///
    /// Returns `None` once the worker has exited.
    async fn recv(&mut self) -> Option<WorkerMessage>;

    /// Human-readable label used in logs.
    fn label(&self) -> &str;
}

/// Creates fresh sandboxes for the orchestrator.
///
/// Called once per agent, and again whenever a sandbox must be recreated
/// after a timeout or a FATAL reply.
pub trait SandboxProvider: Send + Sync {
    type Sandbox: SandboxTransport;

    /// Starts a new, uninitialized sandbox. The caller sends `INIT`.
    fn spawn(&self, label: &str, limits: &SandboxLimits) -> Result<Self::Sandbox, SandboxError>;
}
