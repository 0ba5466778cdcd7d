//! Op validation and application.
//!
//! Each op kind has one rule that checks everything first and only then
//! mutates the store, so a rejected op never leaves a partial change behind.
//! Escrow moves happen in the same call as the state change they belong to.

use crate::canvas_lifecycle::{Edge, LifecycleError};
use crate::canvas_store::{CanvasEvent, WorldStore};
use canvas_env::{AgentId, Op, ScriptError, TxId, TxState};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Why an op was rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Unknown agent: {0}")]
    UnknownAgent(AgentId),

    #[error("Unknown transaction: {0}")]
    UnknownTransaction(TxId),

    #[error("{0} cannot open a transaction with itself")]
    SelfTransaction(AgentId),

    #[error("{agent} has {available} available but {needed} is required")]
    InsufficientFunds {
        agent: AgentId,
        needed: u64,
        available: u64,
    },

    #[error("Escrow for {tx} is not held by {agent}")]
    EscrowMismatch { tx: TxId, agent: AgentId },

    #[error("Unrecognized op type")]
    UnrecognizedOp,

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

impl ValidationError {
    pub fn to_script_error(&self) -> ScriptError {
        ScriptError::validation(self.to_string())
    }
}

/// Result of one op in an `apply_ops` batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum OpOutcome {
    Applied {
        index: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        tx: Option<TxId>,
    },
    Rejected {
        index: usize,
        error: ScriptError,
    },
}

impl OpOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, OpOutcome::Applied { .. })
    }

    pub fn error(&self) -> Option<&ScriptError> {
        match self {
            OpOutcome::Rejected { error, .. } => Some(error),
            OpOutcome::Applied { .. } => None,
        }
    }
}

/// Validates `op` on behalf of `actor` and applies it.
///
/// Returns the id of the transaction the op touched.
pub(crate) fn apply_op(
    store: &mut WorldStore,
    actor: AgentId,
    op: &Op,
) -> Result<Option<TxId>, ValidationError> {
    if store.agent(actor).is_none() {
        return Err(ValidationError::UnknownAgent(actor));
    }

    match op {
        Op::CreateTx {
            provider,
            amount_micro,
            service,
            // Ids come from the store only.
            id_hint: _,
        } => create_tx(store, actor, *provider, *amount_micro, service).map(Some),
        Op::TransitionState { tx, to } => transition(store, actor, *tx, *to).map(|_| Some(*tx)),
        Op::ReleaseEscrow { tx } => release_escrow(store, actor, *tx).map(|_| Some(*tx)),
        Op::Cancel { tx } => cancel(store, actor, *tx).map(|_| Some(*tx)),
        Op::Dispute { tx, reason } => dispute(store, actor, *tx, reason).map(|_| Some(*tx)),
        Op::SubmitJob { tx, payload } => submit_job(store, actor, *tx, payload).map(|_| Some(*tx)),
        Op::Unrecognized => Err(ValidationError::UnrecognizedOp),
    }
}

fn edge(store: &WorldStore, tx: TxId) -> Result<(Edge, u64), ValidationError> {
    let conn = store
        .connection(tx)
        .ok_or(ValidationError::UnknownTransaction(tx))?;
    let edge = Edge {
        tx,
        source: conn.source,
        target: conn.target,
        state: conn.state,
    };
    Ok((edge, conn.amount_micro))
}

fn set_state(store: &mut WorldStore, edge: Edge, to: TxState, actor: AgentId) {
    let tick = store.tick();
    if let Some(conn) = store.connections.get_mut(&edge.tx) {
        conn.state = to;
        conn.updated_tick = tick;
    }
    store.push_event(CanvasEvent::StateChanged {
        tick,
        tx: edge.tx,
        from: edge.state,
        to,
        actor,
    });
}

/// Checks that the source's locked balance covers the escrow of `edge`.
fn check_escrow(store: &WorldStore, edge: &Edge, amount: u64) -> Result<(), ValidationError> {
    let source = store
        .agent(edge.source)
        .ok_or(ValidationError::UnknownAgent(edge.source))?;
    if source.locked_micro < amount {
        return Err(ValidationError::EscrowMismatch {
            tx: edge.tx,
            agent: edge.source,
        });
    }
    Ok(())
}

fn create_tx(
    store: &mut WorldStore,
    actor: AgentId,
    provider: AgentId,
    amount_micro: u64,
    service: &str,
) -> Result<TxId, ValidationError> {
    if provider == actor {
        return Err(ValidationError::SelfTransaction(actor));
    }
    if store.agent(provider).is_none() {
        return Err(ValidationError::UnknownAgent(provider));
    }
    Ok(store.insert_connection(actor, provider, amount_micro, service.to_string()))
}

fn transition(
    store: &mut WorldStore,
    actor: AgentId,
    tx: TxId,
    to: TxState,
) -> Result<(), ValidationError> {
    // States with balance effects share the dedicated rules.
    match to {
        TxState::Committed => return commit(store, actor, tx),
        TxState::Settled => return release_escrow(store, actor, tx),
        TxState::Cancelled => return cancel(store, actor, tx),
        TxState::Disputed => return dispute(store, actor, tx, ""),
        _ => {}
    }

    let (edge, _) = edge(store, tx)?;
    edge.check(actor, to)?;
    set_state(store, edge, to, actor);
    Ok(())
}

/// Moves the amount from the source's available balance into escrow.
fn commit(store: &mut WorldStore, actor: AgentId, tx: TxId) -> Result<(), ValidationError> {
    let (edge, amount) = edge(store, tx)?;
    edge.check(actor, TxState::Committed)?;

    let source = store
        .agents
        .get_mut(&edge.source)
        .ok_or(ValidationError::UnknownAgent(edge.source))?;
    if source.balance_micro < amount {
        return Err(ValidationError::InsufficientFunds {
            agent: edge.source,
            needed: amount,
            available: source.balance_micro,
        });
    }
    source.balance_micro -= amount;
    source.locked_micro = source.locked_micro.saturating_add(amount);

    set_state(store, edge, TxState::Committed, actor);
    Ok(())
}

/// Settles: pays the escrowed amount to the target and marks `SETTLED`.
fn release_escrow(store: &mut WorldStore, actor: AgentId, tx: TxId) -> Result<(), ValidationError> {
    let (edge, amount) = edge(store, tx)?;
    edge.check(actor, TxState::Settled)?;
    check_escrow(store, &edge, amount)?;
    if store.agent(edge.target).is_none() {
        return Err(ValidationError::UnknownAgent(edge.target));
    }

    if let Some(source) = store.agents.get_mut(&edge.source) {
        source.locked_micro -= amount;
    }
    if let Some(target) = store.agents.get_mut(&edge.target) {
        target.balance_micro = target.balance_micro.saturating_add(amount);
    }

    set_state(store, edge, TxState::Settled, actor);
    store.push_event(CanvasEvent::EscrowReleased {
        tick: store.tick(),
        tx,
        from: edge.source,
        to: edge.target,
        amount_micro: amount,
    });
    Ok(())
}

/// Cancels before delivery, refunding escrow if it was locked.
fn cancel(store: &mut WorldStore, actor: AgentId, tx: TxId) -> Result<(), ValidationError> {
    let (edge, amount) = edge(store, tx)?;
    edge.check(actor, TxState::Cancelled)?;

    if edge.state.holds_escrow() {
        check_escrow(store, &edge, amount)?;
        if let Some(source) = store.agents.get_mut(&edge.source) {
            source.locked_micro -= amount;
            source.balance_micro = source.balance_micro.saturating_add(amount);
        }
    }

    set_state(store, edge, TxState::Cancelled, actor);
    Ok(())
}

fn dispute(
    store: &mut WorldStore,
    actor: AgentId,
    tx: TxId,
    reason: &str,
) -> Result<(), ValidationError> {
    let (edge, _) = edge(store, tx)?;
    edge.check(actor, TxState::Disputed)?;

    if let Some(conn) = store.connections.get_mut(&tx) {
        conn.dispute_reason = Some(if reason.is_empty() {
            "no reason given".to_string()
        } else {
            reason.to_string()
        });
    }

    set_state(store, edge, TxState::Disputed, actor);
    Ok(())
}

/// Publishes a job to the event feed. The graph is not touched.
fn submit_job(
    store: &mut WorldStore,
    actor: AgentId,
    tx: TxId,
    payload: &Value,
) -> Result<(), ValidationError> {
    let (edge, _) = edge(store, tx)?;
    edge.party(actor)?;
    if edge.state.is_terminal() {
        return Err(LifecycleError::Terminal {
            tx,
            state: edge.state,
        }
        .into());
    }

    store.push_event(CanvasEvent::JobSubmitted {
        tick: store.tick(),
        tx,
        actor,
        payload: payload.clone(),
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canvas_store::AgentSpec;
    use canvas_env::{AgentRole, ErrorKind};
    use proptest::prelude::*;
    use serde_json::json;

    const START: u64 = 50_000_000;
    const PRICE: u64 = 10_000_000;

    fn world() -> (WorldStore, AgentId, AgentId, AgentId) {
        let mut store = WorldStore::default();
        let mut add = |name: &str, role: AgentRole, balance: u64| {
            store.add_agent(AgentSpec {
                name: name.to_string(),
                role,
                balance_micro: balance,
                code: String::new(),
                initial_state: Value::Null,
            })
        };
        let r = add("Requester", AgentRole::Requester, START);
        let p = add("Provider", AgentRole::Provider, 0);
        let v = add("Validator", AgentRole::Validator, 0);
        (store, r, p, v)
    }

    fn create(provider: AgentId, amount: u64) -> Op {
        Op::CreateTx {
            provider,
            amount_micro: amount,
            service: "Data Analysis".to_string(),
            id_hint: None,
        }
    }

    fn to(tx: TxId, state: TxState) -> Op {
        Op::TransitionState { tx, to: state }
    }

    fn single(store: &mut WorldStore, actor: AgentId, op: Op) -> OpOutcome {
        store.apply_ops(&[op], actor).remove(0)
    }

    fn created_tx(outcome: &OpOutcome) -> TxId {
        match outcome {
            OpOutcome::Applied { tx: Some(tx), .. } => *tx,
            other => panic!("expected applied CREATE_TX, got {:?}", other),
        }
    }

    #[test]
    fn test_escrow_happy_path() {
        let (mut store, r, p, _) = world();

        let tx = created_tx(&single(&mut store, r, create(p, PRICE)));
        let conn = store.connection(tx).unwrap();
        assert_eq!(conn.state, TxState::Initiated);
        assert_eq!(conn.amount_micro, PRICE);

        assert!(single(&mut store, r, to(tx, TxState::Committed)).is_applied());
        assert_eq!(store.agent(r).unwrap().balance_micro, START - PRICE);
        assert_eq!(store.agent(r).unwrap().locked_micro, PRICE);

        assert!(single(&mut store, p, to(tx, TxState::InProgress)).is_applied());
        assert!(single(&mut store, p, to(tx, TxState::Delivered)).is_applied());
        assert!(single(&mut store, r, Op::ReleaseEscrow { tx }).is_applied());

        assert_eq!(store.connection(tx).unwrap().state, TxState::Settled);
        assert_eq!(store.agent(p).unwrap().balance_micro, PRICE);
        assert_eq!(store.agent(r).unwrap().locked_micro, 0);
        assert_eq!(store.total_funds_micro(), u128::from(START));
        assert!(store
            .events()
            .iter()
            .any(|e| matches!(e, CanvasEvent::EscrowReleased { amount_micro: PRICE, .. })));
    }

    #[test]
    fn test_provider_cannot_settle_directly() {
        let (mut store, r, p, _) = world();
        let tx = created_tx(&single(&mut store, r, create(p, PRICE)));

        let outcome = single(&mut store, p, to(tx, TxState::Settled));

        assert_eq!(outcome.error().unwrap().kind, ErrorKind::Validation);
        assert_eq!(store.connection(tx).unwrap().state, TxState::Initiated);
        assert_eq!(store.agent(p).unwrap().balance_micro, 0);
    }

    #[test]
    fn test_stranger_never_changes_a_transaction() {
        let (mut store, r, p, v) = world();
        let tx = created_tx(&single(&mut store, r, create(p, PRICE)));
        single(&mut store, r, to(tx, TxState::Committed));
        single(&mut store, p, to(tx, TxState::InProgress));
        single(&mut store, p, to(tx, TxState::Delivered));
        let before = store.connection(tx).cloned();

        let ops = vec![
            to(tx, TxState::Disputed),
            Op::ReleaseEscrow { tx },
            Op::Cancel { tx },
            Op::Dispute { tx, reason: "mine".to_string() },
            Op::SubmitJob { tx, payload: json!({}) },
        ];
        let outcomes = store.apply_ops(&ops, v);

        assert!(outcomes.iter().all(|o| !o.is_applied()));
        assert_eq!(store.connection(tx).cloned(), before);
    }

    #[test]
    fn test_commit_requires_funds() {
        let (mut store, r, p, _) = world();
        let tx = created_tx(&single(&mut store, r, create(p, START + 1)));

        let outcome = single(&mut store, r, to(tx, TxState::Committed));

        assert!(outcome.error().unwrap().message.contains("available"));
        assert_eq!(store.agent(r).unwrap().balance_micro, START);
        assert_eq!(store.connection(tx).unwrap().state, TxState::Initiated);
    }

    #[test]
    fn test_cancel_refunds_escrow() {
        let (mut store, r, p, _) = world();
        let tx = created_tx(&single(&mut store, r, create(p, PRICE)));
        single(&mut store, r, to(tx, TxState::Committed));

        assert!(!single(&mut store, p, Op::Cancel { tx }).is_applied());
        assert!(single(&mut store, r, Op::Cancel { tx }).is_applied());

        let requester = store.agent(r).unwrap();
        assert_eq!((requester.balance_micro, requester.locked_micro), (START, 0));
        assert_eq!(store.connection(tx).unwrap().state, TxState::Cancelled);
    }

    #[test]
    fn test_cancel_not_allowed_after_delivery() {
        let (mut store, r, p, _) = world();
        let tx = created_tx(&single(&mut store, r, create(p, PRICE)));
        single(&mut store, r, to(tx, TxState::Committed));
        single(&mut store, p, to(tx, TxState::Delivered));

        assert!(!single(&mut store, r, Op::Cancel { tx }).is_applied());
        assert_eq!(store.agent(r).unwrap().locked_micro, PRICE);
    }

    #[test]
    fn test_dispute_then_settle() {
        let (mut store, r, p, _) = world();
        let tx = created_tx(&single(&mut store, r, create(p, PRICE)));
        single(&mut store, r, to(tx, TxState::Committed));
        single(&mut store, p, to(tx, TxState::InProgress));
        single(&mut store, p, to(tx, TxState::Delivered));

        let dispute = Op::Dispute { tx, reason: "late".to_string() };
        assert!(single(&mut store, r, dispute).is_applied());
        let conn = store.connection(tx).unwrap();
        assert_eq!(conn.state, TxState::Disputed);
        assert_eq!(conn.dispute_reason.as_deref(), Some("late"));
        assert_eq!(store.agent(r).unwrap().locked_micro, PRICE);

        assert!(single(&mut store, r, to(tx, TxState::Settled)).is_applied());
        assert_eq!(store.agent(p).unwrap().balance_micro, PRICE);
    }

    #[test]
    fn test_create_tx_ignores_hint_and_checks_target() {
        let (mut store, r, p, _) = world();

        let spoofed = Op::CreateTx {
            provider: p,
            amount_micro: 1,
            service: "x".to_string(),
            id_hint: Some(TxId(1)),
        };
        let tx = created_tx(&single(&mut store, r, spoofed));
        assert_eq!(tx, TxId(4));
        assert_eq!(store.agent(AgentId(1)).unwrap().name, "Requester");

        assert!(!single(&mut store, r, create(r, 1)).is_applied());
        assert!(!single(&mut store, r, create(AgentId(99), 1)).is_applied());
    }

    #[test]
    fn test_rejection_does_not_stop_the_batch() {
        let (mut store, r, p, _) = world();
        let tx = created_tx(&single(&mut store, r, create(p, PRICE)));

        let outcomes = store.apply_ops(
            &[Op::Unrecognized, to(tx, TxState::InProgress), to(tx, TxState::Committed)],
            r,
        );

        assert_eq!(outcomes[0].error().unwrap().message, "Unrecognized op type");
        assert!(!outcomes[1].is_applied());
        assert!(outcomes[2].is_applied());
        assert_eq!(store.connection(tx).unwrap().state, TxState::Committed);
    }

    #[test]
    fn test_submit_job_is_feed_only() {
        let (mut store, r, p, _) = world();
        let tx = created_tx(&single(&mut store, r, create(p, PRICE)));
        let before = store.connection(tx).cloned();

        let job = Op::SubmitJob { tx, payload: json!({ "rows": 3 }) };
        assert!(single(&mut store, p, job.clone()).is_applied());
        assert_eq!(store.connection(tx).cloned(), before);
        assert!(matches!(
            store.events().last(),
            Some(CanvasEvent::JobSubmitted { actor, .. }) if *actor == p
        ));

        single(&mut store, r, Op::Cancel { tx });
        assert!(!single(&mut store, p, job).is_applied());
    }

    fn any_op(tx_count: u64) -> impl Strategy<Value = Op> {
        let tx = (4..4 + tx_count).prop_map(TxId);
        let state = (0..TxState::ALL.len()).prop_map(|i| TxState::ALL[i]);
        prop_oneof![
            (1u64..4, 0u64..30_000_000).prop_map(|(p, amount)| create(AgentId(p), amount)),
            (tx.clone(), state).prop_map(|(tx, s)| to(tx, s)),
            tx.clone().prop_map(|tx| Op::ReleaseEscrow { tx }),
            tx.clone().prop_map(|tx| Op::Cancel { tx }),
            tx.prop_map(|tx| Op::Dispute { tx, reason: String::new() }),
        ]
    }

    proptest! {
        /// Funds are conserved and locked balances always match escrowed amounts.
        #[test]
        fn prop_escrow_accounting(
            steps in proptest::collection::vec((1u64..4, any_op(8)), 0..80)
        ) {
            let (mut store, _, _, _) = world();
            for (actor, op) in steps {
                store.apply_ops(&[op], AgentId(actor));

                prop_assert_eq!(store.total_funds_micro(), u128::from(START));
                for agent in store.agents() {
                    let escrowed: u64 = store
                        .connections()
                        .filter(|c| c.source == agent.id && c.state.holds_escrow())
                        .map(|c| c.amount_micro)
                        .sum();
                    prop_assert_eq!(agent.locked_micro, escrowed);
                }
            }
        }
    }
}
