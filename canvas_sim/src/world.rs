//! SimWorld - the orchestrator driving agents through rounds.
//!
//! One call to `step` is one tick:
//!
//! ```text
//! open_round ─► snapshot + EXECUTE to every active agent (ascending id)
//!            ─► barrier: await each reply until its own deadline
//!            ─► apply ops agent by agent, commit private state
//!            ─► advance_tick ─► publish WorldSnapshot
//! ```
//!
//! A slow or broken sandbox only ever costs its own agent the round.

use crate::error::SimError;

use canvas_core::{AgentSpec, AgentStatus, OpOutcome, StoreError, WorldSnapshot, WorldStore};
use canvas_env::{
    AgentId, ErrorKind, ExecuteRequest, HostMessage, LogEntry, RunResult, SandboxError,
    SandboxLimits, SandboxProvider, SandboxTransport, ScriptError, ThreadSandboxProvider, TxId,
    WorkerMessage,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

const SNAPSHOT_CHANNEL_CAPACITY: usize = 64;

/// Configuration for a simulation run.
#[derive(Debug, Clone, PartialEq)]
pub struct SimConfig {
    /// Master seed for seeded scenarios
    pub seed: u64,

    /// Virtual time added per tick
    pub tick_duration_ms: u64,

    /// Slack on top of `max_execution_time_ms` before a sandbox is given up on
    pub host_grace_ms: u64,

    /// How long a sandbox may take to answer INIT or RESET
    pub handshake_timeout_ms: u64,

    /// Limits every sandbox enforces
    pub limits: SandboxLimits,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            tick_duration_ms: canvas_core::DEFAULT_TICK_DURATION_MS,
            host_grace_ms: 100,
            handshake_timeout_ms: 2_000,
            limits: SandboxLimits::default(),
        }
    }
}

impl SimConfig {
    /// Per-agent budget from dispatch to reply.
    pub fn execution_budget(&self) -> Duration {
        Duration::from_millis(
            self.limits
                .max_execution_time_ms
                .saturating_add(self.host_grace_ms),
        )
    }
}

/// How one agent's run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    Failed { kind: ErrorKind },
    /// No reply before the host deadline
    TimedOut,
    /// Host-level sandbox failure
    Fatal,
}

impl RunStatus {
    /// True for both the script's own timeout and a missed host deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            RunStatus::TimedOut
                | RunStatus::Failed {
                    kind: ErrorKind::Timeout
                }
        )
    }
}

/// What one agent contributed to a round.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentReport {
    pub agent: AgentId,
    #[serde(flatten)]
    pub status: RunStatus,
    pub logs: Vec<LogEntry>,
    pub outcomes: Vec<OpOutcome>,
}

impl AgentReport {
    pub fn ops_applied(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_applied()).count()
    }

    pub fn ops_rejected(&self) -> usize {
        self.outcomes.len() - self.ops_applied()
    }
}

/// Result of one tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundReport {
    /// Tick the round ran on
    pub tick: u64,
    pub agents: Vec<AgentReport>,
    /// At least one sandbox failed with FATAL
    pub degraded: bool,
}

impl RoundReport {
    pub fn agent(&self, id: AgentId) -> Option<&AgentReport> {
        self.agents.iter().find(|a| a.agent == id)
    }
}

/// Reply collected at the barrier.
enum Collected {
    Reply(Box<RunResult>),
    TimedOut,
    Fatal(String),
}

/// The SimWorld - owns the store and one sandbox per agent.
pub struct SimWorld<P: SandboxProvider = ThreadSandboxProvider> {
    config: SimConfig,
    provider: P,
    store: WorldStore,
    sandboxes: BTreeMap<AgentId, P::Sandbox>,
    next_request_id: u64,
    snapshots: broadcast::Sender<Arc<WorldSnapshot>>,
}

impl SimWorld<ThreadSandboxProvider> {
    /// Creates a world whose agents run on dedicated sandbox threads.
    pub fn new(config: SimConfig) -> Self {
        Self::with_provider(config, ThreadSandboxProvider)
    }
}

impl<P: SandboxProvider> SimWorld<P> {
    pub fn with_provider(config: SimConfig, provider: P) -> Self {
        let (snapshots, _) = broadcast::channel(SNAPSHOT_CHANNEL_CAPACITY);
        Self {
            store: WorldStore::new(config.tick_duration_ms),
            config,
            provider,
            sandboxes: BTreeMap::new(),
            next_request_id: 1,
            snapshots,
        }
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    /// Read access to the canonical state.
    pub fn store(&self) -> &WorldStore {
        &self.store
    }

    pub fn tick(&self) -> u64 {
        self.store.tick()
    }

    /// Returns true if `agent` currently has a live sandbox.
    pub fn has_sandbox(&self, agent: AgentId) -> bool {
        self.sandboxes.contains_key(&agent)
    }

    /// Committed snapshots, one per finished tick.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<WorldSnapshot>> {
        self.snapshots.subscribe()
    }

    // ------------------------------------------------------------------
    // User commands. All take `&mut self`, so none can land mid-round.
    // ------------------------------------------------------------------

    pub fn add_agent(&mut self, spec: AgentSpec) -> AgentId {
        let id = self.store.add_agent(spec);
        info!("Added {} at tick {}", id, self.store.tick());
        id
    }

    /// Replaces an agent's code and resets only that agent's sandbox.
    pub async fn update_code(
        &mut self,
        agent: AgentId,
        code: impl Into<String>,
    ) -> Result<(), SimError> {
        self.store.update_code(agent, code)?;
        self.reset_sandbox(agent).await
    }

    pub fn set_status(&mut self, agent: AgentId, status: AgentStatus) -> Result<(), SimError> {
        self.store.set_status(agent, status)?;
        Ok(())
    }

    /// Overwrites an agent's private persistent state.
    pub fn set_persistent_state(&mut self, agent: AgentId, state: Value) -> Result<(), SimError> {
        self.store.commit_persistent_state(agent, state)?;
        Ok(())
    }

    /// Wires a new connection between two agents.
    pub fn connect(
        &mut self,
        source: AgentId,
        target: AgentId,
        amount_micro: u64,
        service: impl Into<String>,
    ) -> Result<TxId, SimError> {
        Ok(self.store.connect(source, target, amount_micro, service)?)
    }

    /// Drops feed events before `cursor` once a consumer has taken them.
    pub fn discard_events_before(&mut self, cursor: usize) -> usize {
        self.store.discard_events_before(cursor)
    }

    /// Sends RESET to the agent's sandbox, if it has one.
    ///
    /// A sandbox that does not come back READY is dropped and recreated on
    /// the next round.
    pub async fn reset_sandbox(&mut self, agent: AgentId) -> Result<(), SimError> {
        if self.store.agent(agent).is_none() {
            return Err(StoreError::UnknownAgent(agent).into());
        }
        let timeout = Duration::from_millis(self.config.handshake_timeout_ms);
        let Some(sandbox) = self.sandboxes.get_mut(&agent) else {
            return Ok(());
        };

        let result = match sandbox.send(HostMessage::Reset).await {
            Ok(()) => expect_ready(sandbox, timeout).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => debug!("Reset sandbox for {}", agent),
            Err(e) => {
                warn!("Reset of {} failed ({}); sandbox will be recreated", agent, e);
                self.sandboxes.remove(&agent);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Rounds
    // ------------------------------------------------------------------

    /// Runs one tick across every active agent.
    pub async fn step(&mut self) -> Result<RoundReport, SimError> {
        let tick = self.store.tick();
        let agents = self.store.active_agents();
        self.store.open_round(agents.iter().copied())?;
        debug!("Tick {}: dispatching {} agents", tick, agents.len());

        let budget = self.config.execution_budget();
        let mut collected: BTreeMap<AgentId, Collected> = BTreeMap::new();
        let mut in_flight = Vec::with_capacity(agents.len());

        for &agent in &agents {
            let request = self.build_request(agent)?;
            let request_id = request.request_id;
            match self.dispatch(agent, request).await {
                Ok(()) => in_flight.push((agent, request_id, Instant::now() + budget)),
                Err(e) => {
                    collected.insert(agent, Collected::Fatal(e.to_string()));
                }
            }
        }

        // Barrier: nothing is applied until every agent has answered or expired.
        for (agent, request_id, deadline) in in_flight {
            let outcome = match self.sandboxes.get_mut(&agent) {
                Some(sandbox) => await_reply(sandbox, request_id, deadline).await,
                None => Collected::Fatal(SandboxError::closed(agent).to_string()),
            };
            collected.insert(agent, outcome);
        }

        let mut reports = Vec::with_capacity(collected.len());
        for (agent, outcome) in collected {
            let report = self.settle(agent, outcome)?;
            self.store.record_report(agent)?;
            reports.push(report);
        }

        self.store.advance_tick()?;
        // No subscribers is fine.
        let _ = self.snapshots.send(Arc::new(self.store.world_snapshot()));

        let degraded = reports.iter().any(|r| r.status == RunStatus::Fatal);
        Ok(RoundReport {
            tick,
            agents: reports,
            degraded,
        })
    }

    /// Runs `ticks` rounds back to back.
    pub async fn run(&mut self, ticks: u64) -> Result<Vec<RoundReport>, SimError> {
        let mut reports = Vec::new();
        for _ in 0..ticks {
            reports.push(self.step().await?);
        }
        Ok(reports)
    }

    /// Drops every sandbox. Agents get fresh ones if the world is stepped again.
    pub fn shutdown(&mut self) {
        info!("Shutting down {} sandboxes", self.sandboxes.len());
        self.sandboxes.clear();
    }

    fn build_request(&mut self, agent: AgentId) -> Result<ExecuteRequest, SimError> {
        let snapshot = self.store.snapshot(agent)?;
        let code = self
            .store
            .agent(agent)
            .map(|a| a.code.clone())
            .ok_or(StoreError::UnknownAgent(agent))?;

        let request_id = self.next_request_id;
        self.next_request_id += 1;
        Ok(ExecuteRequest::new(request_id, snapshot, code))
    }

    async fn dispatch(&mut self, agent: AgentId, request: ExecuteRequest) -> Result<(), SandboxError> {
        self.ensure_sandbox(agent).await?;
        let sandbox = self
            .sandboxes
            .get(&agent)
            .ok_or_else(|| SandboxError::closed(agent))?;

        let sent = sandbox.send(HostMessage::Execute(Box::new(request))).await;
        if sent.is_err() {
            self.sandboxes.remove(&agent);
        }
        sent
    }

    /// Spawns and initializes a sandbox for `agent` unless one is live.
    async fn ensure_sandbox(&mut self, agent: AgentId) -> Result<(), SandboxError> {
        if self.sandboxes.contains_key(&agent) {
            return Ok(());
        }

        let limits = self.config.limits.clone();
        let mut sandbox = self.provider.spawn(&agent.to_string(), &limits)?;
        sandbox.send(HostMessage::Init { limits }).await?;
        expect_ready(
            &mut sandbox,
            Duration::from_millis(self.config.handshake_timeout_ms),
        )
        .await?;

        debug!("Sandbox {} ready", sandbox.label());
        self.sandboxes.insert(agent, sandbox);
        Ok(())
    }

    /// Turns a collected reply into store effects and a report.
    fn settle(&mut self, agent: AgentId, outcome: Collected) -> Result<AgentReport, SimError> {
        let report = match outcome {
            Collected::Reply(result) => {
                let RunResult {
                    success,
                    error,
                    mut logs,
                    ops,
                    final_state,
                    ..
                } = *result;

                if success {
                    let outcomes = self.store.apply_ops(&ops, agent);
                    logs.extend(
                        outcomes
                            .iter()
                            .filter_map(OpOutcome::error)
                            .map(ScriptError::to_log_entry),
                    );
                    if let Some(state) = final_state {
                        self.store.commit_persistent_state(agent, state)?;
                    }
                    AgentReport {
                        agent,
                        status: RunStatus::Succeeded,
                        logs,
                        outcomes,
                    }
                } else {
                    let error = error.unwrap_or_else(|| {
                        ScriptError::new(ErrorKind::Runtime, "run failed without an error")
                    });
                    debug!("{} run failed: {}", agent, error);
                    logs.push(error.to_log_entry());
                    AgentReport {
                        agent,
                        status: RunStatus::Failed { kind: error.kind },
                        logs,
                        outcomes: Vec::new(),
                    }
                }
            }
            Collected::TimedOut => {
                warn!(
                    "{} did not answer within {:?}; discarding its sandbox",
                    agent,
                    self.config.execution_budget()
                );
                self.sandboxes.remove(&agent);
                AgentReport {
                    agent,
                    status: RunStatus::TimedOut,
                    logs: vec![
                        ScriptError::timeout(self.config.limits.max_execution_time_ms)
                            .to_log_entry(),
                    ],
                    outcomes: Vec::new(),
                }
            }
            Collected::Fatal(message) => {
                warn!("{} sandbox failed: {}", agent, message);
                self.sandboxes.remove(&agent);
                self.store.mark_degraded(agent, &message);
                AgentReport {
                    agent,
                    status: RunStatus::Fatal,
                    logs: vec![LogEntry::error(format!("sandbox failure: {}", message))],
                    outcomes: Vec::new(),
                }
            }
        };
        Ok(report)
    }
}

/// Waits for the RESULT matching `request_id`.
///
/// Results of older requests are skipped; a READY here breaks the protocol.
async fn await_reply<S: SandboxTransport>(
    sandbox: &mut S,
    request_id: u64,
    deadline: Instant,
) -> Collected {
    loop {
        match timeout_at(deadline, sandbox.recv()).await {
            Err(_) => return Collected::TimedOut,
            Ok(None) => return Collected::Fatal(SandboxError::closed(sandbox.label()).to_string()),
            Ok(Some(WorkerMessage::Result(result))) if result.request_id == request_id => {
                return Collected::Reply(result)
            }
            Ok(Some(WorkerMessage::Fatal { message })) => return Collected::Fatal(message),
            Ok(Some(WorkerMessage::Ready)) => {
                let error = SandboxError::protocol(format!("READY while awaiting request {}", request_id));
                return Collected::Fatal(error.to_string());
            }
            Ok(Some(stale)) => {
                debug!("{}: skipping {} while waiting for {}", sandbox.label(), stale.kind(), request_id);
            }
        }
    }
}

async fn expect_ready<S: SandboxTransport>(
    sandbox: &mut S,
    timeout: Duration,
) -> Result<(), SandboxError> {
    let deadline = Instant::now() + timeout;
    loop {
        match timeout_at(deadline, sandbox.recv()).await {
            Err(_) => {
                let ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
                return Err(SandboxError::Timeout(ms));
            }
            Ok(None) => return Err(SandboxError::closed(sandbox.label())),
            Ok(Some(WorkerMessage::Ready)) => return Ok(()),
            Ok(Some(WorkerMessage::Fatal { message })) => return Err(SandboxError::Fatal(message)),
            Ok(Some(WorkerMessage::Result(stale))) => {
                debug!("{}: dropping stale result {}", sandbox.label(), stale.request_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canvas_env::{AgentRole, TxState};
    use serde_json::json;

    const REQUESTER: &str = r#"
        fn on_tick(api) {
            let s = api.state;
            if api.transactions.is_empty() {
                api.create_transaction(s.provider, 10000000, "Data Analysis");
            }
            for tx in api.transactions {
                if tx.state == "INITIATED" {
                    api.transition_state(tx.id, "COMMITTED");
                } else if tx.state == "DELIVERED" {
                    api.release_escrow(tx.id);
                }
            }
        }
    "#;

    const PROVIDER: &str = r#"
        fn on_tick(api) {
            for tx in api.incoming {
                if tx.state == "COMMITTED" {
                    api.transition_state(tx.id, "IN_PROGRESS");
                } else if tx.state == "IN_PROGRESS" {
                    api.transition_state(tx.id, "DELIVERED");
                }
            }
        }
    "#;

    fn spec(name: &str, role: AgentRole, balance: u64, code: &str) -> AgentSpec {
        AgentSpec {
            name: name.to_string(),
            role,
            balance_micro: balance,
            code: code.to_string(),
            initial_state: Value::Null,
        }
    }

    fn fast_config() -> SimConfig {
        SimConfig {
            limits: SandboxLimits {
                max_execution_time_ms: 50,
                ..SandboxLimits::default()
            },
            host_grace_ms: 200,
            ..SimConfig::default()
        }
    }

    #[tokio::test]
    async fn test_escrow_settles_in_five_ticks() {
        let mut world = SimWorld::new(SimConfig::default());
        let p = world.add_agent(spec("Provider", AgentRole::Provider, 0, PROVIDER));
        let r = world.add_agent(spec("Requester", AgentRole::Requester, 50_000_000, REQUESTER));
        world.set_persistent_state(r, json!({ "provider": p.0 })).unwrap();
        let mut updates = world.subscribe();

        let reports = world.run(5).await.unwrap();

        assert_eq!(reports.len(), 5);
        assert!(reports.iter().all(|r| !r.degraded));
        let store = world.store();
        let tx = store.connections().next().unwrap();
        assert_eq!(tx.state, TxState::Settled);
        assert_eq!(store.agent(p).unwrap().balance_micro, 10_000_000);
        assert_eq!(store.agent(r).unwrap().balance_micro, 40_000_000);
        assert_eq!(store.agent(r).unwrap().locked_micro, 0);
        assert_eq!(store.virtual_time_ms(), 5 * canvas_core::DEFAULT_TICK_DURATION_MS);

        let first = updates.recv().await.unwrap();
        assert_eq!(first.tick, 1);
        assert_eq!(first.connections.len(), 1);

        world.shutdown();
        assert!(!world.has_sandbox(p));
    }

    #[tokio::test]
    async fn test_timeout_does_not_block_other_agents() {
        let mut world = SimWorld::new(fast_config());
        let spinner = world.add_agent(spec("Spinner", AgentRole::Validator, 0, "fn on_tick(api) { loop { } }"));
        let p = world.add_agent(spec("Provider", AgentRole::Provider, 0, PROVIDER));
        let r = world.add_agent(spec("Requester", AgentRole::Requester, 50_000_000, REQUESTER));
        world.set_persistent_state(r, json!({ "provider": p.0 })).unwrap();

        let report = world.step().await.unwrap();

        let stuck = report.agent(spinner).unwrap();
        assert!(stuck.status.is_timeout());
        assert!(stuck.outcomes.is_empty());
        assert_eq!(stuck.logs.len(), 1);
        assert!(stuck.logs[0].message.contains("timeout"));

        let requester = report.agent(r).unwrap();
        assert_eq!(requester.status, RunStatus::Succeeded);
        assert_eq!(requester.ops_applied(), 1);
        assert_eq!(world.store().connections().count(), 1);
    }

    #[tokio::test]
    async fn test_failed_run_keeps_state_and_applies_nothing() {
        let mut world = SimWorld::new(SimConfig::default());
        let p = world.add_agent(spec("Provider", AgentRole::Provider, 0, PROVIDER));
        let code = r#"
            fn on_tick(api) {
                let s = api.state;
                s.touched = true;
                api.state = s;
                api.create_transaction(1, 5, "x");
                api.log("about to fail");
                throw "boom";
            }
        "#;
        let r = world.add_agent(spec("Requester", AgentRole::Requester, 100, code));

        let report = world.step().await.unwrap();

        let failed = report.agent(r).unwrap();
        assert_eq!(failed.status, RunStatus::Failed { kind: ErrorKind::Runtime });
        assert_eq!(failed.logs.len(), 2);
        assert_eq!(world.store().connections().count(), 0);
        assert_eq!(world.store().persistent_state(r), Some(&json!({})));
        assert!(world.store().agent(p).is_some());
    }

    #[tokio::test]
    async fn test_rejected_ops_surface_as_validation_logs() {
        let mut world = SimWorld::new(SimConfig::default());
        let p = world.add_agent(spec("Provider", AgentRole::Provider, 0, PROVIDER));
        let r = world.add_agent(spec("Requester", AgentRole::Requester, 100, "fn on_tick(api) { }"));
        let tx = world.connect(r, p, 10, "Data").unwrap();
        let code = format!(r#"fn on_tick(api) {{ api.transition_state({}, "SETTLED"); }}"#, tx.0);
        world.update_code(p, code).await.unwrap();

        let report = world.step().await.unwrap();

        let provider = report.agent(p).unwrap();
        assert_eq!(provider.ops_rejected(), 1);
        assert!(provider.logs[0].message.starts_with("validation error"));
        assert_eq!(world.store().connection(tx).unwrap().state, TxState::Initiated);
    }

    #[tokio::test]
    async fn test_script_id_hint_matches_assigned_id() {
        let mut world = SimWorld::new(SimConfig::default());
        let p = world.add_agent(spec("Provider", AgentRole::Provider, 0, "fn on_tick(api) { }"));
        let code = r#"
            fn on_tick(api) {
                let id = api.create_transaction(1, 5, "Data");
                api.log("hint " + id);
            }
        "#;
        let r = world.add_agent(spec("Requester", AgentRole::Requester, 100, code));
        world.set_status(p, AgentStatus::Paused).unwrap();

        let report = world.step().await.unwrap();

        let requester = report.agent(r).unwrap();
        assert_eq!(requester.outcomes[0], OpOutcome::Applied { index: 0, tx: Some(TxId(3)) });
        assert_eq!(requester.logs[0].message, "hint 3");
        assert!(world.store().connection(TxId(3)).is_some());
    }

    #[tokio::test]
    async fn test_consumed_events_can_be_discarded() {
        let mut world = SimWorld::new(SimConfig::default());
        let p = world.add_agent(spec("Provider", AgentRole::Provider, 0, PROVIDER));
        let r = world.add_agent(spec("Requester", AgentRole::Requester, 50_000_000, REQUESTER));
        world.set_persistent_state(r, json!({ "provider": p.0 })).unwrap();

        for _ in 0..5 {
            let cursor = world.store().event_cursor();
            world.step().await.unwrap();
            assert!(!world.store().events_since(cursor).is_empty());
            world.discard_events_before(cursor);
        }

        // Only the last round's events are retained; settlement still happened.
        assert_eq!(world.store().events().len(), 2);
        assert!(matches!(
            world.store().events().last(),
            Some(canvas_core::CanvasEvent::EscrowReleased { .. })
        ));
        assert_eq!(world.store().agent(p).unwrap().balance_micro, 10_000_000);
    }

    #[tokio::test]
    async fn test_paused_agents_are_skipped() {
        let mut world = SimWorld::new(SimConfig::default());
        let a = world.add_agent(spec("A", AgentRole::Validator, 0, "fn on_tick(api) { }"));
        let b = world.add_agent(spec("B", AgentRole::Validator, 0, "fn on_tick(api) { }"));
        world.set_status(a, AgentStatus::Paused).unwrap();

        let report = world.step().await.unwrap();

        assert!(report.agent(a).is_none());
        assert!(report.agent(b).is_some());
        assert!(!world.has_sandbox(a));
    }

    #[tokio::test]
    async fn test_unknown_agent_commands_fail() {
        let mut world = SimWorld::new(SimConfig::default());
        assert!(world.update_code(AgentId(7), "").await.is_err());
        assert!(world.set_status(AgentId(7), AgentStatus::Paused).is_err());
    }
}
