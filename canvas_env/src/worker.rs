//! Thread-backed sandbox: one OS thread per agent speaking the worker protocol.

use crate::error::SandboxError;
use crate::protocol::{HostMessage, WorkerMessage};
use crate::script_host::ScriptHost;
use crate::transport::{SandboxProvider, SandboxTransport};
use crate::types::SandboxLimits;

use async_trait::async_trait;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const MIN_WORKER_STACK: usize = 8 * 1024 * 1024;
const MAX_WORKER_STACK: usize = 128 * 1024 * 1024;

/// Native stack reserved for a worker thread.
///
/// Interpreter frames are far larger than the script-visible stack budget
/// (especially in debug builds), so the thread gets generous headroom and the
/// script call depth limit always trips first.
fn worker_stack_bytes(limits: &SandboxLimits) -> usize {
    usize::try_from(limits.max_stack_size_bytes)
        .unwrap_or(usize::MAX)
        .saturating_mul(128)
        .clamp(MIN_WORKER_STACK, MAX_WORKER_STACK)
}

/// A sandbox running on its own OS thread.
///
/// The thread owns the script host; the orchestrator only ever holds the two
/// channel ends. Dropping the handle raises the abort flag, which stops a
/// runaway script at its next progress check, and closes the inbox so the
/// thread exits.
pub struct ThreadSandbox {
    label: String,
    tx: mpsc::UnboundedSender<HostMessage>,
    rx: mpsc::UnboundedReceiver<WorkerMessage>,
    abort: Arc<AtomicBool>,
}

impl ThreadSandbox {
    /// Starts a worker thread. The sandbox is unusable until `INIT`.
    pub fn spawn(label: impl Into<String>, limits: &SandboxLimits) -> Result<Self, SandboxError> {
        let label = label.into();
        let (host_tx, host_rx) = mpsc::unbounded_channel();
        let (worker_tx, worker_rx) = mpsc::unbounded_channel();
        let abort = Arc::new(AtomicBool::new(false));

        let thread_label = label.clone();
        let thread_abort = Arc::clone(&abort);
        std::thread::Builder::new()
            .name(format!("sandbox-{}", label))
            .stack_size(worker_stack_bytes(limits))
            .spawn(move || worker_loop(thread_label, host_rx, worker_tx, thread_abort))
            .map_err(|e| SandboxError::SpawnFailed(e.to_string()))?;

        Ok(Self {
            label,
            tx: host_tx,
            rx: worker_rx,
            abort,
        })
    }

    /// Stops any run in flight. The sandbox must be discarded afterwards.
    pub fn abort(&self) {
        self.abort.store(true, Ordering::Relaxed);
    }
}

impl Drop for ThreadSandbox {
    fn drop(&mut self) {
        self.abort();
    }
}

#[async_trait]
impl SandboxTransport for ThreadSandbox {
    async fn send(&self, message: HostMessage) -> Result<(), SandboxError> {
        self.tx
            .send(message)
            .map_err(|_| SandboxError::closed(&self.label))
    }

    async fn recv(&mut self) -> Option<WorkerMessage> {
        self.rx.recv().await
    }

    fn label(&self) -> &str {
        &self.label
    }
}

/// Provider handing out `ThreadSandbox`es.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSandboxProvider;

impl SandboxProvider for ThreadSandboxProvider {
    type Sandbox = ThreadSandbox;

    fn spawn(&self, label: &str, limits: &SandboxLimits) -> Result<ThreadSandbox, SandboxError> {
        ThreadSandbox::spawn(label, limits)
    }
}

fn worker_loop(
    label: String,
    mut inbox: mpsc::UnboundedReceiver<HostMessage>,
    outbox: mpsc::UnboundedSender<WorkerMessage>,
    abort: Arc<AtomicBool>,
) {
    let mut host: Option<ScriptHost> = None;

    while let Some(message) = inbox.blocking_recv() {
        let reply = match message {
            HostMessage::Init { limits } => {
                host = Some(ScriptHost::new(limits, Arc::clone(&abort)));
                WorkerMessage::Ready
            }
            HostMessage::Reset => {
                // Drop compiled code and interpreter state, keep the limits.
                if let Some(old) = host.take() {
                    host = Some(ScriptHost::new(old.limits().clone(), Arc::clone(&abort)));
                }
                WorkerMessage::Ready
            }
            HostMessage::Execute(request) => match host.as_mut() {
                None => WorkerMessage::Fatal {
                    message: "EXECUTE received before INIT".to_string(),
                },
                Some(host) => {
                    match panic::catch_unwind(AssertUnwindSafe(|| host.execute(&request))) {
                        Ok(result) => WorkerMessage::Result(Box::new(result)),
                        Err(payload) => WorkerMessage::Fatal {
                            message: panic_message(payload.as_ref()),
                        },
                    }
                }
            },
        };

        let fatal = matches!(reply, WorkerMessage::Fatal { .. });
        if fatal {
            warn!("sandbox {} failing: {:?}", label, reply);
        }
        if outbox.send(reply).is_err() || fatal {
            break;
        }
    }

    debug!("sandbox {} worker exiting", label);
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("script host panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("script host panicked: {}", s)
    } else {
        "script host panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ExecuteRequest;
    use crate::types::{AgentId, AgentInfo, AgentRole, ErrorKind, ExecutionSnapshot, RunResult};
    use std::time::{Duration, Instant};

    fn execute(request_id: u64, code: &str) -> HostMessage {
        let snapshot = ExecutionSnapshot {
            agent: AgentInfo {
                id: AgentId(1),
                name: "Worker".to_string(),
                role: AgentRole::Provider,
                balance_micro: 0,
                locked_micro: 0,
            },
            virtual_time_ms: 0,
            id_counter: 1,
            incoming_transactions: Vec::new(),
            transactions: Vec::new(),
            persistent_state: serde_json::json!({}),
        };
        HostMessage::Execute(Box::new(ExecuteRequest::new(request_id, snapshot, code)))
    }

    async fn expect_result(sandbox: &mut ThreadSandbox) -> RunResult {
        match tokio::time::timeout(Duration::from_secs(5), sandbox.recv()).await {
            Ok(Some(WorkerMessage::Result(result))) => *result,
            other => panic!("expected RESULT, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_init_execute_reset_cycle() {
        let limits = SandboxLimits::default();
        let mut sandbox = ThreadSandbox::spawn("agent-1", &limits).unwrap();

        sandbox.send(HostMessage::Init { limits }).await.unwrap();
        assert_eq!(sandbox.recv().await, Some(WorkerMessage::Ready));

        sandbox
            .send(execute(1, r#"fn on_tick(api) { api.log("hello"); }"#))
            .await
            .unwrap();
        let result = expect_result(&mut sandbox).await;
        assert!(result.success);
        assert_eq!(result.request_id, 1);
        assert_eq!(result.logs.len(), 1);

        sandbox.send(HostMessage::Reset).await.unwrap();
        assert_eq!(sandbox.recv().await, Some(WorkerMessage::Ready));

        sandbox.send(execute(2, "fn on_tick(api) { }")).await.unwrap();
        assert!(expect_result(&mut sandbox).await.success);
    }

    #[tokio::test]
    async fn test_execute_before_init_is_fatal() {
        let mut sandbox = ThreadSandbox::spawn("agent-2", &SandboxLimits::default()).unwrap();

        sandbox.send(execute(1, "fn on_tick(api) { }")).await.unwrap();
        match sandbox.recv().await {
            Some(WorkerMessage::Fatal { message }) => assert!(message.contains("INIT")),
            other => panic!("expected FATAL, got {:?}", other),
        }

        // The worker exits after a fatal reply.
        assert_eq!(sandbox.recv().await, None);
    }

    #[tokio::test]
    async fn test_unbounded_recursion_hits_stack_limit() {
        let limits = SandboxLimits {
            max_stack_size_bytes: 64 * 1024,
            ..SandboxLimits::default()
        };
        let mut sandbox = ThreadSandbox::spawn("agent-3", &limits).unwrap();
        sandbox.send(HostMessage::Init { limits }).await.unwrap();
        assert_eq!(sandbox.recv().await, Some(WorkerMessage::Ready));

        let code = r#"
            fn dive(n) { dive(n + 1) }
            fn on_tick(api) { dive(0); }
        "#;
        sandbox.send(execute(1, code)).await.unwrap();
        let result = expect_result(&mut sandbox).await;

        assert!(!result.success);
        assert_eq!(result.error.unwrap().kind, ErrorKind::Resource);
    }

    #[tokio::test]
    async fn test_drop_aborts_runaway_script() {
        let limits = SandboxLimits {
            max_execution_time_ms: 60_000,
            ..SandboxLimits::default()
        };
        let mut sandbox = ThreadSandbox::spawn("agent-4", &limits).unwrap();
        sandbox.send(HostMessage::Init { limits }).await.unwrap();
        assert_eq!(sandbox.recv().await, Some(WorkerMessage::Ready));

        sandbox.send(execute(1, "fn on_tick(api) { loop { } }")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let started = Instant::now();
        sandbox.abort();
        let result = expect_result(&mut sandbox).await;

        assert_eq!(result.error.unwrap().kind, ErrorKind::Timeout);
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
