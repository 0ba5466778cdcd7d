//! The "STORE" Engine - single-writer world state
//!
//! `WorldStore` owns every agent, every connection and every agent's private
//! persistent state. Nothing outside it holds a reference into that data:
//! sandboxes get owned `ExecutionSnapshot`s, renderers get owned
//! `WorldSnapshot`s, and the only mutation paths are `apply_ops` (script
//! effects, one actor at a time) and the user commands below, which the
//! orchestrator only issues between rounds.

use crate::canvas_validator::{self, OpOutcome};
use canvas_env::{
    AgentId, AgentInfo, AgentRole, ExecutionSnapshot, Op, TransactionView, TxId, TxState,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tracing::{debug, warn};

/// Default virtual time that passes per tick.
pub const DEFAULT_TICK_DURATION_MS: u64 = 1_000;

/// Store-level errors (user commands and round bookkeeping)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("Unknown agent: {0}")]
    UnknownAgent(AgentId),

    #[error("Unknown transaction: {0}")]
    UnknownTransaction(TxId),

    #[error("Invalid connection: {0}")]
    InvalidConnection(String),

    #[error("Round for tick {tick} still waiting on {pending:?}")]
    RoundIncomplete { tick: u64, pending: Vec<AgentId> },

    #[error("A round is already open for tick {0}")]
    RoundAlreadyOpen(u64),

    #[error("{0} is not part of the open round")]
    NotInRound(AgentId),
}

/// Whether the orchestrator schedules an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    #[default]
    Active,
    Paused,
}

/// Canonical agent record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRecord {
    pub id: AgentId,
    pub name: String,
    pub role: AgentRole,
    pub balance_micro: u64,
    pub locked_micro: u64,
    pub status: AgentStatus,
    pub code: String,
    pub created_tick: u64,
}

impl AgentRecord {
    pub fn info(&self) -> AgentInfo {
        AgentInfo {
            id: self.id,
            name: self.name.clone(),
            role: self.role,
            balance_micro: self.balance_micro,
            locked_micro: self.locked_micro,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == AgentStatus::Active
    }
}

/// Canonical connection (transaction) record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub id: TxId,
    pub source: AgentId,
    pub target: AgentId,
    pub state: TxState,
    /// Fixed at creation
    pub amount_micro: u64,
    pub service: String,
    pub created_tick: u64,
    pub updated_tick: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dispute_reason: Option<String>,
}

impl Connection {
    pub fn view(&self) -> TransactionView {
        TransactionView {
            id: self.id,
            source: self.source,
            target: self.target,
            state: self.state,
            amount_micro: self.amount_micro,
            service: self.service.clone(),
            created_tick: self.created_tick,
            updated_tick: self.updated_tick,
            dispute_reason: self.dispute_reason.clone(),
        }
    }
}

/// Everything needed to add an agent to the canvas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSpec {
    pub name: String,
    pub role: AgentRole,
    pub balance_micro: u64,
    pub code: String,
    /// Seed for the agent's persistent state; anything but an object is ignored
    #[serde(default)]
    pub initial_state: Value,
}

/// Append-only feed of what happened on the canvas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum CanvasEvent {
    AgentAdded {
        tick: u64,
        agent: AgentId,
        role: AgentRole,
    },
    TransactionCreated {
        tick: u64,
        tx: TxId,
        source: AgentId,
        target: AgentId,
        amount_micro: u64,
        service: String,
    },
    StateChanged {
        tick: u64,
        tx: TxId,
        from: TxState,
        to: TxState,
        actor: AgentId,
    },
    EscrowReleased {
        tick: u64,
        tx: TxId,
        from: AgentId,
        to: AgentId,
        amount_micro: u64,
    },
    JobSubmitted {
        tick: u64,
        tx: TxId,
        actor: AgentId,
        payload: Value,
    },
    /// A sandbox failed at host level and was recreated
    RoundDegraded {
        tick: u64,
        agent: AgentId,
        message: String,
    },
}

impl CanvasEvent {
    pub fn tick(&self) -> u64 {
        match self {
            CanvasEvent::AgentAdded { tick, .. }
            | CanvasEvent::TransactionCreated { tick, .. }
            | CanvasEvent::StateChanged { tick, .. }
            | CanvasEvent::EscrowReleased { tick, .. }
            | CanvasEvent::JobSubmitted { tick, .. }
            | CanvasEvent::RoundDegraded { tick, .. } => *tick,
        }
    }
}

/// Committed view of the whole canvas, published once per tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorldSnapshot {
    pub tick: u64,
    pub virtual_time_ms: u64,
    pub agents: Vec<AgentRecord>,
    pub connections: Vec<TransactionView>,
}

impl WorldSnapshot {
    pub fn agent(&self, id: AgentId) -> Option<&AgentRecord> {
        self.agents.iter().find(|a| a.id == id)
    }

    pub fn connection(&self, id: TxId) -> Option<&TransactionView> {
        self.connections.iter().find(|c| c.id == id)
    }
}

/// The authoritative world state.
#[derive(Debug, Clone)]
pub struct WorldStore {
    tick: u64,
    virtual_time_ms: u64,
    tick_duration_ms: u64,

    /// Next id handed out; agents and transactions share it
    next_id: u64,

    pub(crate) agents: BTreeMap<AgentId, AgentRecord>,
    pub(crate) connections: BTreeMap<TxId, Connection>,
    persistent: BTreeMap<AgentId, Value>,

    /// Agents of the open round that have not reported yet
    pending: BTreeSet<AgentId>,
    round_open: bool,

    /// Retained tail of the feed
    events: Vec<CanvasEvent>,
    /// Events already discarded from the front of the feed
    events_discarded: usize,
}

impl Default for WorldStore {
    fn default() -> Self {
        Self::new(DEFAULT_TICK_DURATION_MS)
    }
}

impl WorldStore {
    pub fn new(tick_duration_ms: u64) -> Self {
        Self {
            tick: 0,
            virtual_time_ms: 0,
            tick_duration_ms,
            next_id: 1,
            agents: BTreeMap::new(),
            connections: BTreeMap::new(),
            persistent: BTreeMap::new(),
            pending: BTreeSet::new(),
            round_open: false,
            events: Vec::new(),
            events_discarded: 0,
        }
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn virtual_time_ms(&self) -> u64 {
        self.virtual_time_ms
    }

    /// Current value of the shared id counter (next id to be handed out).
    pub fn id_counter(&self) -> u64 {
        self.next_id
    }

    /// Hands out the next id. The only id source in the engine.
    pub fn reserve_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn agent(&self, id: AgentId) -> Option<&AgentRecord> {
        self.agents.get(&id)
    }

    pub fn agents(&self) -> impl Iterator<Item = &AgentRecord> {
        self.agents.values()
    }

    /// Ids of every active agent, ascending.
    pub fn active_agents(&self) -> Vec<AgentId> {
        self.agents
            .values()
            .filter(|a| a.is_active())
            .map(|a| a.id)
            .collect()
    }

    pub fn connection(&self, id: TxId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    pub fn persistent_state(&self, agent: AgentId) -> Option<&Value> {
        self.persistent.get(&agent)
    }

    /// Retained events, oldest first.
    pub fn events(&self) -> &[CanvasEvent] {
        &self.events
    }

    /// Position just past the newest event. Cursors count every event ever
    /// appended, so they stay valid across discards.
    pub fn event_cursor(&self) -> usize {
        self.events_discarded + self.events.len()
    }

    /// Events appended at or after `cursor` that are still retained.
    pub fn events_since(&self, cursor: usize) -> &[CanvasEvent] {
        let start = cursor.saturating_sub(self.events_discarded);
        self.events.get(start..).unwrap_or(&[])
    }

    /// Drops every event before `cursor`. Returns how many were dropped.
    pub fn discard_events_before(&mut self, cursor: usize) -> usize {
        let count = cursor
            .saturating_sub(self.events_discarded)
            .min(self.events.len());
        self.events.drain(..count);
        self.events_discarded += count;
        count
    }

    pub(crate) fn push_event(&mut self, event: CanvasEvent) {
        self.events.push(event);
    }

    /// Builds the per-tick view handed to one agent's sandbox.
    ///
    /// Pure read: calling it twice without an intervening mutation returns
    /// equal snapshots.
    pub fn snapshot(&self, agent_id: AgentId) -> Result<ExecutionSnapshot, StoreError> {
        let agent = self
            .agents
            .get(&agent_id)
            .ok_or(StoreError::UnknownAgent(agent_id))?;

        let mut incoming = Vec::new();
        let mut outgoing = Vec::new();
        for conn in self.connections.values() {
            if conn.target == agent_id {
                incoming.push(conn.view());
            } else if conn.source == agent_id {
                outgoing.push(conn.view());
            }
        }

        Ok(ExecutionSnapshot {
            agent: agent.info(),
            virtual_time_ms: self.virtual_time_ms,
            id_counter: self.next_id,
            incoming_transactions: incoming,
            transactions: outgoing,
            persistent_state: self
                .persistent
                .get(&agent_id)
                .cloned()
                .unwrap_or_else(empty_state),
        })
    }

    /// Validates and applies one agent's ops in order.
    ///
    /// A rejected op leaves the world untouched and does not stop the ops
    /// after it.
    pub fn apply_ops(&mut self, ops: &[Op], actor: AgentId) -> Vec<OpOutcome> {
        ops.iter()
            .enumerate()
            .map(|(index, op)| match canvas_validator::apply_op(self, actor, op) {
                Ok(tx) => {
                    debug!("{} applied {} ({:?})", actor, op.kind(), tx);
                    OpOutcome::Applied { index, tx }
                }
                Err(err) => {
                    warn!("Rejected {} from {}: {}", op.kind(), actor, err);
                    OpOutcome::Rejected {
                        index,
                        error: err.to_script_error(),
                    }
                }
            })
            .collect()
    }

    /// Starts the round barrier for the current tick.
    pub fn open_round(
        &mut self,
        agents: impl IntoIterator<Item = AgentId>,
    ) -> Result<(), StoreError> {
        if self.round_open {
            return Err(StoreError::RoundAlreadyOpen(self.tick));
        }
        self.pending = agents.into_iter().collect();
        self.round_open = true;
        Ok(())
    }

    /// Marks one agent of the open round as done (applied, failed or timed out).
    pub fn record_report(&mut self, agent: AgentId) -> Result<(), StoreError> {
        if self.pending.remove(&agent) {
            Ok(())
        } else {
            Err(StoreError::NotInRound(agent))
        }
    }

    /// Closes the round and moves the clock forward.
    ///
    /// Refuses while any agent of the open round has not reported.
    pub fn advance_tick(&mut self) -> Result<u64, StoreError> {
        if !self.pending.is_empty() {
            return Err(StoreError::RoundIncomplete {
                tick: self.tick,
                pending: self.pending.iter().copied().collect(),
            });
        }
        self.round_open = false;
        self.tick += 1;
        self.virtual_time_ms += self.tick_duration_ms;
        Ok(self.tick)
    }

    pub fn add_agent(&mut self, spec: AgentSpec) -> AgentId {
        let id = AgentId(self.reserve_id());
        let state = match spec.initial_state {
            Value::Object(map) => Value::Object(map),
            _ => empty_state(),
        };

        self.agents.insert(
            id,
            AgentRecord {
                id,
                name: spec.name,
                role: spec.role,
                balance_micro: spec.balance_micro,
                locked_micro: 0,
                status: AgentStatus::Active,
                code: spec.code,
                created_tick: self.tick,
            },
        );
        self.persistent.insert(id, state);
        self.events.push(CanvasEvent::AgentAdded {
            tick: self.tick,
            agent: id,
            role: spec.role,
        });
        id
    }

    pub fn update_code(&mut self, agent: AgentId, code: impl Into<String>) -> Result<(), StoreError> {
        let record = self
            .agents
            .get_mut(&agent)
            .ok_or(StoreError::UnknownAgent(agent))?;
        record.code = code.into();
        Ok(())
    }

    pub fn set_status(&mut self, agent: AgentId, status: AgentStatus) -> Result<(), StoreError> {
        let record = self
            .agents
            .get_mut(&agent)
            .ok_or(StoreError::UnknownAgent(agent))?;
        record.status = status;
        Ok(())
    }

    /// Wires a user-drawn connection, starting in `INITIATED`.
    pub fn connect(
        &mut self,
        source: AgentId,
        target: AgentId,
        amount_micro: u64,
        service: impl Into<String>,
    ) -> Result<TxId, StoreError> {
        for agent in [source, target] {
            if !self.agents.contains_key(&agent) {
                return Err(StoreError::UnknownAgent(agent));
            }
        }
        if source == target {
            return Err(StoreError::InvalidConnection(format!(
                "{} cannot connect to itself",
                source
            )));
        }
        Ok(self.insert_connection(source, target, amount_micro, service.into()))
    }

    pub(crate) fn insert_connection(
        &mut self,
        source: AgentId,
        target: AgentId,
        amount_micro: u64,
        service: String,
    ) -> TxId {
        let id = TxId(self.reserve_id());
        self.connections.insert(
            id,
            Connection {
                id,
                source,
                target,
                state: TxState::Initiated,
                amount_micro,
                service: service.clone(),
                created_tick: self.tick,
                updated_tick: self.tick,
                dispute_reason: None,
            },
        );
        self.events.push(CanvasEvent::TransactionCreated {
            tick: self.tick,
            tx: id,
            source,
            target,
            amount_micro,
            service,
        });
        id
    }

    /// Replaces an agent's persistent state after a successful run.
    pub fn commit_persistent_state(&mut self, agent: AgentId, state: Value) -> Result<(), StoreError> {
        if !self.agents.contains_key(&agent) {
            return Err(StoreError::UnknownAgent(agent));
        }
        self.persistent.insert(agent, state);
        Ok(())
    }

    /// Records a host-level sandbox failure.
    pub fn mark_degraded(&mut self, agent: AgentId, message: impl Into<String>) {
        self.events.push(CanvasEvent::RoundDegraded {
            tick: self.tick,
            agent,
            message: message.into(),
        });
    }

    pub fn world_snapshot(&self) -> WorldSnapshot {
        WorldSnapshot {
            tick: self.tick,
            virtual_time_ms: self.virtual_time_ms,
            agents: self.agents.values().cloned().collect(),
            connections: self.connections.values().map(Connection::view).collect(),
        }
    }

    /// Sum of available and locked balances across all agents.
    pub fn total_funds_micro(&self) -> u128 {
        self.agents
            .values()
            .map(|a| u128::from(a.balance_micro) + u128::from(a.locked_micro))
            .sum()
    }
}

fn empty_state() -> Value {
    Value::Object(serde_json::Map::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec(name: &str, role: AgentRole, balance: u64) -> AgentSpec {
        AgentSpec {
            name: name.to_string(),
            role,
            balance_micro: balance,
            code: "fn on_tick(api) { }".to_string(),
            initial_state: Value::Null,
        }
    }

    #[test]
    fn test_ids_are_shared_and_monotonic() {
        let mut store = WorldStore::default();
        let a = store.add_agent(spec("A", AgentRole::Requester, 10));
        let b = store.add_agent(spec("B", AgentRole::Provider, 0));
        let tx = store.connect(a, b, 5, "Data").unwrap();

        assert_eq!((a, b, tx), (AgentId(1), AgentId(2), TxId(3)));
        assert_eq!(store.reserve_id(), 4);
        assert_eq!(store.id_counter(), 5);
    }

    #[test]
    fn test_snapshot_is_pure() {
        let mut store = WorldStore::default();
        let a = store.add_agent(spec("A", AgentRole::Requester, 10));
        let b = store.add_agent(spec("B", AgentRole::Provider, 0));
        store.connect(a, b, 5, "Data").unwrap();

        let first = store.snapshot(a).unwrap();
        let second = store.snapshot(a).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.transactions.len(), 1);
        assert!(first.incoming_transactions.is_empty());
        assert_eq!(first.persistent_state, json!({}));

        let provider_view = store.snapshot(b).unwrap();
        assert_eq!(provider_view.incoming_transactions.len(), 1);
        assert_eq!(store.id_counter(), 4);
    }

    #[test]
    fn test_snapshot_of_unknown_agent() {
        let store = WorldStore::default();
        assert_eq!(
            store.snapshot(AgentId(9)),
            Err(StoreError::UnknownAgent(AgentId(9)))
        );
    }

    #[test]
    fn test_persistent_state_is_private() {
        let mut store = WorldStore::default();
        let mut seeded = spec("A", AgentRole::Requester, 10);
        seeded.initial_state = json!({ "provider": 2 });
        let a = store.add_agent(seeded);
        let b = store.add_agent(spec("B", AgentRole::Provider, 0));

        store.commit_persistent_state(b, json!({ "count": 1 })).unwrap();

        assert_eq!(store.snapshot(a).unwrap().persistent_state, json!({ "provider": 2 }));
        assert_eq!(store.snapshot(b).unwrap().persistent_state, json!({ "count": 1 }));
    }

    #[test]
    fn test_barrier_refuses_pending_reports() {
        let mut store = WorldStore::new(500);
        let a = store.add_agent(spec("A", AgentRole::Requester, 10));
        let b = store.add_agent(spec("B", AgentRole::Provider, 0));

        store.open_round([a, b]).unwrap();
        assert_eq!(store.open_round([a]), Err(StoreError::RoundAlreadyOpen(0)));

        store.record_report(a).unwrap();
        assert_eq!(
            store.advance_tick(),
            Err(StoreError::RoundIncomplete {
                tick: 0,
                pending: vec![b]
            })
        );

        store.record_report(b).unwrap();
        assert_eq!(store.record_report(b), Err(StoreError::NotInRound(b)));
        assert_eq!(store.advance_tick(), Ok(1));
        assert_eq!(store.virtual_time_ms(), 500);
    }

    #[test]
    fn test_connect_rejects_self_and_unknown() {
        let mut store = WorldStore::default();
        let a = store.add_agent(spec("A", AgentRole::Requester, 10));

        assert!(matches!(
            store.connect(a, a, 1, "x"),
            Err(StoreError::InvalidConnection(_))
        ));
        assert_eq!(
            store.connect(a, AgentId(42), 1, "x"),
            Err(StoreError::UnknownAgent(AgentId(42)))
        );
    }

    #[test]
    fn test_paused_agents_are_not_active() {
        let mut store = WorldStore::default();
        let a = store.add_agent(spec("A", AgentRole::Requester, 10));
        let b = store.add_agent(spec("B", AgentRole::Provider, 0));

        store.set_status(a, AgentStatus::Paused).unwrap();
        assert_eq!(store.active_agents(), vec![b]);

        store.update_code(b, "fn on_tick(api) { api.log(1); }").unwrap();
        assert!(store.agent(b).unwrap().code.contains("api.log"));
    }

    #[test]
    fn test_discarded_events_keep_cursors_valid() {
        let mut store = WorldStore::default();
        store.add_agent(spec("A", AgentRole::Validator, 0));
        store.add_agent(spec("B", AgentRole::Validator, 0));
        let mid = store.event_cursor();
        store.add_agent(spec("C", AgentRole::Validator, 0));
        assert_eq!(mid, 2);

        assert_eq!(store.discard_events_before(mid), 2);
        assert_eq!(store.events().len(), 1);
        assert_eq!(store.event_cursor(), 3);
        assert_eq!(store.events_since(mid).len(), 1);
        assert_eq!(store.events_since(0).len(), 1);
        assert!(store.events_since(3).is_empty());

        // Discarding behind or past the feed is clamped.
        assert_eq!(store.discard_events_before(1), 0);
        assert_eq!(store.discard_events_before(10), 1);
        assert!(store.events().is_empty());
        assert_eq!(store.event_cursor(), 3);
    }

    #[test]
    fn test_event_wire_shape() {
        let event = CanvasEvent::EscrowReleased {
            tick: 4,
            tx: TxId(3),
            from: AgentId(1),
            to: AgentId(2),
            amount_micro: 10,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "escrow_released");
        assert_eq!(json["amountMicro"], 10);
    }
}
