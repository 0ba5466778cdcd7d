//! Agent Canvas Core - the authoritative side of the simulation
//!
//! This library keeps the canvas consistent no matter what agent scripts ask for:
//! 1. **Lifecycle**: a fixed transaction state machine with per-state authorization
//! 2. **Store**: a single-writer world state with a round barrier and shared id counter
//! 3. **Validator**: per-op rules that apply state and escrow effects together or not at all

pub mod canvas_lifecycle;
pub mod canvas_store;
pub mod canvas_validator;

// Re-export key types for convenience
pub use canvas_lifecycle::{Authority, Edge, LifecycleError, Party};
pub use canvas_store::{
    AgentRecord, AgentSpec, AgentStatus, CanvasEvent, Connection, StoreError, WorldSnapshot,
    WorldStore, DEFAULT_TICK_DURATION_MS,
};
pub use canvas_validator::{OpOutcome, ValidationError};
