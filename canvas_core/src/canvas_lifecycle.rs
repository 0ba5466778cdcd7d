//! The "LIFECYCLE" Engine - Transaction State Machine
//!
//! Every connection between two agents moves through a fixed set of states:
//!
//! ```text
//! INITIATED -> QUOTED -> COMMITTED -> IN_PROGRESS -> DELIVERED -> SETTLED
//!     |           |          |    \________________/     |           ^
//!     +-----------+----------+--> CANCELLED              +-> DISPUTED-+
//! ```
//!
//! This module only answers "may `actor` move this transaction from `from`
//! to `to`?". Balance effects live in the validator, which applies them
//! together with the state change.

use canvas_env::{AgentId, TxId, TxState};
use thiserror::Error;

/// Lifecycle violations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleError {
    #[error("{actor} is not a party to {tx}")]
    NotAParty { actor: AgentId, tx: TxId },

    #[error("{tx} is already {state} and cannot change")]
    Terminal { tx: TxId, state: TxState },

    #[error("Illegal transition for {tx}: {from} -> {to}")]
    IllegalTransition { tx: TxId, from: TxState, to: TxState },

    #[error("Only the {required} of {tx} may move it to {to}")]
    Unauthorized { tx: TxId, to: TxState, required: Authority },
}

/// Which side of a connection an agent is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Party {
    Source,
    Target,
}

/// Who may drive a transaction into a given state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Authority {
    Source,
    Target,
    Either,
}

impl Authority {
    pub fn permits(&self, party: Party) -> bool {
        matches!(
            (self, party),
            (Authority::Either, _)
                | (Authority::Source, Party::Source)
                | (Authority::Target, Party::Target)
        )
    }
}

impl std::fmt::Display for Authority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Authority::Source => "source",
            Authority::Target => "target",
            Authority::Either => "source or target",
        })
    }
}

/// States reachable from `from` in one step.
pub fn allowed_next(from: TxState) -> &'static [TxState] {
    use TxState::*;
    match from {
        Initiated => &[Quoted, Committed, Cancelled],
        Quoted => &[Committed, Cancelled],
        Committed => &[InProgress, Delivered, Cancelled],
        InProgress => &[Delivered],
        Delivered => &[Settled, Disputed],
        Disputed => &[Settled],
        Settled | Cancelled => &[],
    }
}

pub fn can_transition(from: TxState, to: TxState) -> bool {
    allowed_next(from).contains(&to)
}

/// Who may move a transaction into `to`.
///
/// The provider quotes, starts and delivers; the requester commits funds,
/// settles and cancels; either side may dispute a delivery.
pub fn authority_for(to: TxState) -> Authority {
    match to {
        TxState::Quoted | TxState::InProgress | TxState::Delivered => Authority::Target,
        TxState::Disputed => Authority::Either,
        TxState::Initiated | TxState::Committed | TxState::Settled | TxState::Cancelled => {
            Authority::Source
        }
    }
}

/// Resolves `actor` against the two ends of a connection.
pub fn party_of(actor: AgentId, source: AgentId, target: AgentId) -> Option<Party> {
    if actor == source {
        Some(Party::Source)
    } else if actor == target {
        Some(Party::Target)
    } else {
        None
    }
}

/// Ends of a connection plus its current state, as seen by the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    pub tx: TxId,
    pub source: AgentId,
    pub target: AgentId,
    pub state: TxState,
}

impl Edge {
    /// Requires `actor` to be one of the two parties.
    pub fn party(&self, actor: AgentId) -> Result<Party, LifecycleError> {
        party_of(actor, self.source, self.target).ok_or(LifecycleError::NotAParty {
            actor,
            tx: self.tx,
        })
    }

    /// Checks a requested transition in order: party, terminal, table, authority.
    ///
    /// A non-party is rejected before anything else is looked at.
    pub fn check(&self, actor: AgentId, to: TxState) -> Result<Party, LifecycleError> {
        let party = self.party(actor)?;

        if self.state.is_terminal() {
            return Err(LifecycleError::Terminal {
                tx: self.tx,
                state: self.state,
            });
        }

        if !can_transition(self.state, to) {
            return Err(LifecycleError::IllegalTransition {
                tx: self.tx,
                from: self.state,
                to,
            });
        }

        let required = authority_for(to);
        if !required.permits(party) {
            return Err(LifecycleError::Unauthorized {
                tx: self.tx,
                to,
                required,
            });
        }

        Ok(party)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const REQUESTER: AgentId = AgentId(1);
    const PROVIDER: AgentId = AgentId(2);
    const STRANGER: AgentId = AgentId(3);

    fn edge(state: TxState) -> Edge {
        Edge {
            tx: TxId(10),
            source: REQUESTER,
            target: PROVIDER,
            state,
        }
    }

    #[test]
    fn test_happy_path_authorization() {
        assert!(edge(TxState::Initiated).check(REQUESTER, TxState::Committed).is_ok());
        assert!(edge(TxState::Committed).check(PROVIDER, TxState::InProgress).is_ok());
        assert!(edge(TxState::InProgress).check(PROVIDER, TxState::Delivered).is_ok());
        assert!(edge(TxState::Delivered).check(REQUESTER, TxState::Settled).is_ok());
    }

    #[test]
    fn test_provider_cannot_settle_from_initiated() {
        let err = edge(TxState::Initiated)
            .check(PROVIDER, TxState::Settled)
            .unwrap_err();

        assert!(matches!(err, LifecycleError::IllegalTransition { .. }));
    }

    #[test]
    fn test_wrong_side_is_unauthorized() {
        let err = edge(TxState::Committed)
            .check(REQUESTER, TxState::InProgress)
            .unwrap_err();
        assert_eq!(
            err,
            LifecycleError::Unauthorized {
                tx: TxId(10),
                to: TxState::InProgress,
                required: Authority::Target,
            }
        );

        assert!(edge(TxState::Delivered).check(PROVIDER, TxState::Settled).is_err());
        assert!(edge(TxState::Quoted).check(PROVIDER, TxState::Cancelled).is_err());
    }

    #[test]
    fn test_either_party_may_dispute() {
        assert!(edge(TxState::Delivered).check(REQUESTER, TxState::Disputed).is_ok());
        assert!(edge(TxState::Delivered).check(PROVIDER, TxState::Disputed).is_ok());
        assert!(edge(TxState::InProgress).check(REQUESTER, TxState::Disputed).is_err());
    }

    #[test]
    fn test_stranger_rejected_even_for_legal_transition() {
        for state in TxState::ALL {
            for to in TxState::ALL {
                let err = edge(state).check(STRANGER, to).unwrap_err();
                assert!(matches!(err, LifecycleError::NotAParty { .. }));
            }
        }
    }

    #[test]
    fn test_terminal_states_are_final() {
        for terminal in [TxState::Settled, TxState::Cancelled] {
            assert!(allowed_next(terminal).is_empty());
            let err = edge(terminal).check(REQUESTER, TxState::Cancelled).unwrap_err();
            assert!(matches!(err, LifecycleError::Terminal { .. }));
        }
    }

    fn any_state() -> impl Strategy<Value = TxState> {
        (0..TxState::ALL.len()).prop_map(|i| TxState::ALL[i])
    }

    fn any_actor() -> impl Strategy<Value = AgentId> {
        prop_oneof![Just(REQUESTER), Just(PROVIDER), Just(STRANGER)]
    }

    proptest! {
        /// Driving the machine with arbitrary requests never leaves the table.
        #[test]
        fn prop_only_table_transitions(
            requests in proptest::collection::vec((any_actor(), any_state()), 0..64)
        ) {
            let mut state = TxState::Initiated;
            for (actor, to) in requests {
                let before = state;
                if edge(state).check(actor, to).is_ok() {
                    state = to;
                }
                prop_assert!(state == before || can_transition(before, state));
                if before.is_terminal() {
                    prop_assert_eq!(state, before);
                }
                if actor == STRANGER {
                    prop_assert_eq!(state, before);
                }
            }
        }
    }
}
