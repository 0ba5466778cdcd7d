//! Scenario runner - executes built-in scenarios and canvas files.

use crate::config::CanvasFile;
use crate::error::SimError;
use crate::exporter::{SimExport, SimFrame};
use crate::scenarios::ScenarioId;
use crate::templates::{
    create_agent_from_template, BuiltinTemplates, Customizations, DEFAULT_PRICE_MICRO,
};
use crate::world::{RoundReport, RunStatus, SimConfig, SimWorld};

use canvas_core::{CanvasEvent, WorldSnapshot, WorldStore};
use canvas_env::{AgentId, TxState};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use serde_json::json;
use std::future::Future;
use tracing::{debug, info, warn};

/// Tries to move every transaction id it can guess, none of which are its own.
const ROGUE_SCRIPT: &str = r#"
fn on_tick(api) {
    for id in 1..=12 {
        api.release_escrow(id);
        api.transition_state(id, "SETTLED");
        api.cancel(id);
        api.dispute(id, "mine now");
    }
    api.create_transaction(api.agent.id, 1000000, "self dealing");
    api.create_transaction(9999, 1000000, "ghost");
}
"#;

const SPINNER_SCRIPT: &str = "fn on_tick(api) { loop { } }";

const HOG_SCRIPT: &str = r#"
fn on_tick(api) {
    let blob = "xxxxxxxxxxxxxxxx";
    loop { blob += blob; }
}
"#;

/// Results from running a scenario.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioResult {
    /// Scenario (or canvas file) that was run
    pub scenario: String,

    /// Seed used
    pub seed: u64,

    /// Whether the run met the scenario's expectations
    pub passed: bool,

    /// Total ticks executed
    pub total_ticks: u64,

    pub virtual_time_ms: u64,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// Metrics collected during run
    pub metrics: ScenarioMetrics,

    /// Committed state after the last tick
    #[serde(skip)]
    pub final_snapshot: Option<WorldSnapshot>,

    /// Frame-by-frame record of the run
    #[serde(skip)]
    pub export: SimExport,
}

impl ScenarioResult {
    fn aborted(scenario: &str, seed: u64, error: SimError) -> Self {
        let reason = error.to_string();
        let mut export = SimExport::new(scenario, seed, 0);
        export.finalize(false, Some(reason.clone()));
        Self {
            scenario: scenario.to_string(),
            seed,
            passed: false,
            total_ticks: 0,
            virtual_time_ms: 0,
            failure_reason: Some(reason),
            metrics: ScenarioMetrics::default(),
            final_snapshot: None,
            export,
        }
    }
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScenarioMetrics {
    /// Ops applied by the store
    pub ops_applied: u64,

    /// Ops rejected by the validator
    pub ops_rejected: u64,

    /// Runs that failed inside the sandbox (syntax, runtime, resource, timeout)
    pub failed_runs: u64,

    /// Runs that hit the execution deadline
    pub timeouts: u64,

    /// Host-level sandbox failures
    pub faults: u64,

    /// Transactions settled by the end of the run
    pub settled: u64,

    /// Transactions cancelled by the end of the run
    pub cancelled: u64,

    /// Jobs published to the event feed
    pub jobs_submitted: u64,

    /// Transactions moved to DISPUTED
    pub disputes: u64,
}

impl ScenarioMetrics {
    fn record(&mut self, report: &RoundReport) {
        for agent in &report.agents {
            self.ops_applied += agent.ops_applied() as u64;
            self.ops_rejected += agent.ops_rejected() as u64;
            if agent.status.is_timeout() {
                self.timeouts += 1;
            }
            match agent.status {
                RunStatus::Failed { .. } | RunStatus::TimedOut => self.failed_runs += 1,
                RunStatus::Fatal => self.faults += 1,
                RunStatus::Succeeded => {}
            }
        }
    }

    fn record_events(&mut self, events: &[CanvasEvent]) {
        for event in events {
            match event {
                CanvasEvent::JobSubmitted { .. } => self.jobs_submitted += 1,
                CanvasEvent::StateChanged {
                    to: TxState::Disputed,
                    ..
                } => self.disputes += 1,
                _ => {}
            }
        }
    }

    fn close(&mut self, store: &WorldStore) {
        self.settled = count_state(store, TxState::Settled);
        self.cancelled = count_state(store, TxState::Cancelled);
    }
}

fn count_state(store: &WorldStore, state: TxState) -> u64 {
    store.connections().filter(|c| c.state == state).count() as u64
}

/// Post-run expectation of a scenario.
type Check = Box<dyn Fn(&WorldStore, &ScenarioMetrics) -> Result<(), String>>;

/// Runs scenarios.
pub struct ScenarioRunner {
    config: SimConfig,

    /// Overrides each scenario's default tick count
    ticks: Option<u64>,

    templates: BuiltinTemplates,
}

impl ScenarioRunner {
    /// Creates a new scenario runner.
    pub fn new(config: SimConfig) -> Self {
        Self {
            config,
            ticks: None,
            templates: BuiltinTemplates,
        }
    }

    /// Sets the tick count for every scenario.
    pub fn with_ticks(mut self, ticks: u64) -> Self {
        self.ticks = Some(ticks);
        self
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    /// Runs a scenario and returns the result.
    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.config.seed);
        self.block_on(scenario.name(), self.run_scenario(scenario))
    }

    /// Runs the canvas described by a canvas file.
    pub fn run_canvas(&self, canvas: &CanvasFile, name: &str) -> ScenarioResult {
        info!("Starting canvas: {}", name);
        self.block_on(name, self.run_canvas_async(canvas, name))
    }

    fn block_on<F>(&self, name: &str, run: F) -> ScenarioResult
    where
        F: Future<Output = Result<ScenarioResult, SimError>>,
    {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .map_err(|e| SimError::Runtime(e.to_string()));

        match runtime.and_then(|rt| rt.block_on(run)) {
            Ok(result) => result,
            Err(e) => {
                warn!("{} aborted: {}", name, e);
                ScenarioResult::aborted(name, self.config.seed, e)
            }
        }
    }

    async fn run_scenario(&self, scenario: ScenarioId) -> Result<ScenarioResult, SimError> {
        let mut config = self.config.clone();
        if scenario == ScenarioId::RunawayScript {
            // Keep the spinning agents from dominating wall time.
            config.limits.max_execution_time_ms = config.limits.max_execution_time_ms.min(50);
        }

        let mut world = SimWorld::new(config);
        let check = match scenario {
            ScenarioId::EscrowHappyPath => self.setup_happy_path(&mut world)?,
            ScenarioId::RogueActor => self.setup_rogue_actor(&mut world)?,
            ScenarioId::RunawayScript => self.setup_runaway(&mut world)?,
            ScenarioId::DisputeResolution => self.setup_dispute(&mut world)?,
            ScenarioId::Marketplace => self.setup_marketplace(&mut world)?,
        };

        let ticks = self.ticks.unwrap_or_else(|| scenario.default_ticks());
        self.drive(world, scenario.name(), ticks, check).await
    }

    async fn run_canvas_async(
        &self,
        canvas: &CanvasFile,
        name: &str,
    ) -> Result<ScenarioResult, SimError> {
        let mut config = self.config.clone();
        canvas.apply_to(&mut config);
        // Command line overrides the file.
        let ticks = self.ticks.or(canvas.ticks()).unwrap_or(10);

        let mut world = SimWorld::new(config);
        canvas.populate(&mut world, &self.templates)?;
        let total = world.store().total_funds_micro();

        let check: Check =
            Box::new(move |store: &WorldStore, _: &ScenarioMetrics| ledger_balanced(store, total));
        self.drive(world, name, ticks, check).await
    }

    /// Steps `world` for `ticks` rounds, recording frames and metrics.
    async fn drive(
        &self,
        mut world: SimWorld,
        name: &str,
        ticks: u64,
        check: Check,
    ) -> Result<ScenarioResult, SimError> {
        let seed = world.config().seed;
        let mut export = SimExport::new(name, seed, world.config().tick_duration_ms);
        let mut metrics = ScenarioMetrics::default();

        for _ in 0..ticks {
            let cursor = world.store().event_cursor();
            let report = world.step().await?;
            metrics.record(&report);
            metrics.record_events(world.store().events_since(cursor));
            export.add_frame(SimFrame::capture(world.store(), &report, cursor));
            // The frame owns this round's events now.
            world.discard_events_before(cursor);

            if report.degraded {
                warn!("Tick {} degraded", report.tick);
            }
        }
        world.shutdown();

        let store = world.store();
        metrics.close(store);
        let verdict = check(store, &metrics);
        let passed = verdict.is_ok();
        let failure_reason = verdict.err();
        export.finalize(passed, failure_reason.clone());

        debug!("{} metrics: {:?}", name, metrics);
        Ok(ScenarioResult {
            scenario: name.to_string(),
            seed,
            passed,
            total_ticks: store.tick(),
            virtual_time_ms: store.virtual_time_ms(),
            failure_reason,
            metrics,
            final_snapshot: Some(store.world_snapshot()),
            export,
        })
    }

    fn add(
        &self,
        world: &mut SimWorld,
        template: &str,
        customizations: Customizations,
    ) -> Result<AgentId, SimError> {
        let spec = create_agent_from_template(&self.templates, template, customizations)?;
        Ok(world.add_agent(spec))
    }

    /// Provider, then a requester buying from it, then an observer.
    fn add_trading_pair(
        &self,
        world: &mut SimWorld,
        requester_state: serde_json::Value,
    ) -> Result<(AgentId, AgentId), SimError> {
        let provider = self.add(world, "provider", Customizations::named("Provider"))?;
        let mut state = requester_state;
        if let Some(map) = state.as_object_mut() {
            map.insert("provider".to_string(), json!(provider.0));
        }
        let requester = self.add(
            world,
            "requester",
            Customizations::named("Requester").with_state(state),
        )?;
        Ok((requester, provider))
    }

    /// SIM-001: one purchase settles and the provider is paid.
    fn setup_happy_path(&self, world: &mut SimWorld) -> Result<Check, SimError> {
        let (requester, provider) = self.add_trading_pair(world, json!({}))?;
        self.add(world, "validator", Customizations::named("Auditor"))?;
        let total = world.store().total_funds_micro();
        let start = balance(world.store(), requester);

        Ok(Box::new(move |store: &WorldStore, metrics: &ScenarioMetrics| {
            ledger_balanced(store, total)?;
            expect(metrics.settled == 1, format!("expected 1 settlement, saw {}", metrics.settled))?;
            expect(metrics.ops_rejected == 0, format!("{} ops rejected", metrics.ops_rejected))?;
            expect(
                balance(store, provider) == DEFAULT_PRICE_MICRO,
                "provider was not paid".to_string(),
            )?;
            expect(
                balance(store, requester) == start - DEFAULT_PRICE_MICRO,
                "requester was not charged exactly once".to_string(),
            )
        }))
    }

    /// SIM-002: the outsider never changes anything.
    fn setup_rogue_actor(&self, world: &mut SimWorld) -> Result<Check, SimError> {
        let (_, provider) = self.add_trading_pair(world, json!({}))?;
        let rogue = self.add(
            world,
            "validator",
            Customizations::named("Mallory")
                .with_balance(5_000_000)
                .with_code(ROGUE_SCRIPT),
        )?;
        let total = world.store().total_funds_micro();

        Ok(Box::new(move |store: &WorldStore, metrics: &ScenarioMetrics| {
            ledger_balanced(store, total)?;
            expect(metrics.settled == 1, "honest purchase did not settle".to_string())?;
            expect(metrics.ops_rejected > 0, "rogue ops were not rejected".to_string())?;
            expect(
                balance(store, rogue) == 5_000_000,
                "rogue balance changed".to_string(),
            )?;
            expect(
                store.connections().all(|c| c.source != rogue && c.target != rogue),
                "rogue became party to a transaction".to_string(),
            )?;
            expect(
                balance(store, provider) == DEFAULT_PRICE_MICRO,
                "provider was not paid".to_string(),
            )
        }))
    }

    /// SIM-003: spinning and memory-hungry agents fail every round alone.
    fn setup_runaway(&self, world: &mut SimWorld) -> Result<Check, SimError> {
        let spinner = self.add(
            world,
            "validator",
            Customizations::named("Spinner").with_code(SPINNER_SCRIPT),
        )?;
        let hog = self.add(
            world,
            "validator",
            Customizations::named("Hog").with_code(HOG_SCRIPT),
        )?;
        self.add_trading_pair(world, json!({}))?;
        let total = world.store().total_funds_micro();
        let ticks = self.ticks.unwrap_or_else(|| ScenarioId::RunawayScript.default_ticks());

        Ok(Box::new(move |store: &WorldStore, metrics: &ScenarioMetrics| {
            ledger_balanced(store, total)?;
            expect(
                metrics.timeouts >= ticks,
                format!("expected {} timeouts, saw {}", ticks, metrics.timeouts),
            )?;
            expect(
                metrics.failed_runs >= 2 * ticks,
                format!("expected {} failed runs, saw {}", 2 * ticks, metrics.failed_runs),
            )?;
            expect(
                store.persistent_state(spinner) == Some(&json!({}))
                    && store.persistent_state(hog) == Some(&json!({})),
                "failed runs leaked state".to_string(),
            )?;
            if ticks >= 5 {
                expect(metrics.settled == 1, "healthy pair did not settle".to_string())?;
            }
            Ok(())
        }))
    }

    /// SIM-004: the dispute is recorded, then escrow is released.
    fn setup_dispute(&self, world: &mut SimWorld) -> Result<Check, SimError> {
        let (_, provider) = self.add_trading_pair(world, json!({ "dispute_first": true }))?;
        let total = world.store().total_funds_micro();

        Ok(Box::new(move |store: &WorldStore, metrics: &ScenarioMetrics| {
            ledger_balanced(store, total)?;
            expect(metrics.disputes == 1, format!("expected 1 dispute, saw {}", metrics.disputes))?;
            expect(
                store
                    .connections()
                    .all(|c| c.dispute_reason.as_deref() == Some("output failed review")),
                "dispute reason missing".to_string(),
            )?;
            expect(metrics.settled == 1, "disputed purchase did not settle".to_string())?;
            expect(
                balance(store, provider) == DEFAULT_PRICE_MICRO,
                "provider was not paid after the dispute".to_string(),
            )
        }))
    }

    /// SIM-005: a seeded population trades without losing funds.
    fn setup_marketplace(&self, world: &mut SimWorld) -> Result<Check, SimError> {
        let mut rng = ChaCha8Rng::seed_from_u64(self.config.seed);
        let provider_count = rng.gen_range(2..=4);
        let requester_count = rng.gen_range(3..=6);

        let mut providers = Vec::with_capacity(provider_count);
        for i in 0..provider_count {
            let name = format!("Provider-{}", i + 1);
            providers.push(self.add(world, "provider", Customizations::named(name))?);
        }

        for i in 0..requester_count {
            let provider = providers[rng.gen_range(0..providers.len())];
            let price = rng.gen_range(1..=20u64) * 1_000_000;
            let balance = rng.gen_range(20..=80u64) * 1_000_000;
            let rounds = rng.gen_range(1..=3u64);
            self.add(
                world,
                "requester",
                Customizations::named(format!("Requester-{}", i + 1))
                    .with_balance(balance)
                    .with_state(json!({ "provider": provider.0, "price": price, "rounds": rounds })),
            )?;
        }
        self.add(world, "validator", Customizations::named("Auditor"))?;
        let total = world.store().total_funds_micro();

        Ok(Box::new(move |store: &WorldStore, metrics: &ScenarioMetrics| {
            ledger_balanced(store, total)?;
            expect(metrics.faults == 0, format!("{} sandbox faults", metrics.faults))?;
            expect(metrics.settled > 0, "no trade settled".to_string())
        }))
    }
}

fn balance(store: &WorldStore, agent: AgentId) -> u64 {
    store.agent(agent).map(|a| a.balance_micro).unwrap_or_default()
}

fn expect(condition: bool, reason: String) -> Result<(), String> {
    if condition {
        Ok(())
    } else {
        Err(reason)
    }
}

/// Funds are conserved and every locked balance matches its open escrows.
fn ledger_balanced(store: &WorldStore, total: u128) -> Result<(), String> {
    let now = store.total_funds_micro();
    expect(now == total, format!("funds changed from {} to {}", total, now))?;

    for agent in store.agents() {
        let escrowed: u64 = store
            .connections()
            .filter(|c| c.source == agent.id && c.state.holds_escrow())
            .map(|c| c.amount_micro)
            .sum();
        expect(
            agent.locked_micro == escrowed,
            format!(
                "{} has {} locked but {} in escrow",
                agent.id, agent.locked_micro, escrowed
            ),
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner() -> ScenarioRunner {
        ScenarioRunner::new(SimConfig::default())
    }

    #[test]
    fn test_happy_path_passes() {
        let result = runner().run(ScenarioId::EscrowHappyPath);

        assert!(result.passed, "{:?}", result.failure_reason);
        assert_eq!(result.total_ticks, 6);
        assert_eq!(result.metrics.settled, 1);
        assert_eq!(result.metrics.jobs_submitted, 1);
        assert_eq!(result.export.frames.len(), 6);
    }

    #[test]
    fn test_rogue_actor_is_contained() {
        let result = runner().run(ScenarioId::RogueActor);

        assert!(result.passed, "{:?}", result.failure_reason);
        assert!(result.metrics.ops_rejected >= 6 * 50);
    }

    #[test]
    fn test_runaway_scripts_time_out() {
        let result = runner().run(ScenarioId::RunawayScript);

        assert!(result.passed, "{:?}", result.failure_reason);
        assert_eq!(result.metrics.faults, 0);
    }

    #[test]
    fn test_dispute_resolution_passes() {
        let result = runner().run(ScenarioId::DisputeResolution);
        assert!(result.passed, "{:?}", result.failure_reason);
        assert_eq!(result.metrics.disputes, 1);
        let disputed_frames = result
            .export
            .frames
            .iter()
            .filter(|f| f.events.iter().any(|e| matches!(e, CanvasEvent::StateChanged { to: TxState::Disputed, .. })))
            .count();
        assert_eq!(disputed_frames, 1);
    }

    #[test]
    fn test_marketplace_is_reproducible() {
        let first = runner().with_ticks(20).run(ScenarioId::Marketplace);
        let second = runner().with_ticks(20).run(ScenarioId::Marketplace);

        assert!(first.passed, "{:?}", first.failure_reason);
        assert_eq!(first.metrics, second.metrics);
        assert_eq!(first.final_snapshot, second.final_snapshot);
    }

    #[test]
    fn test_too_few_ticks_fails_happy_path() {
        let result = runner().with_ticks(3).run(ScenarioId::EscrowHappyPath);

        assert!(!result.passed);
        assert!(result.failure_reason.unwrap().contains("settlement"));
    }
}
