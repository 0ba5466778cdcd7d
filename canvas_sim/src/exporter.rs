//! JSON exporter for replaying runs in an external viewer.
//!
//! Exports one frame per tick: balances, connections, feed events and what
//! each agent logged.

use crate::world::{RoundReport, RunStatus};
use canvas_core::{AgentStatus, CanvasEvent, WorldStore};
use canvas_env::{AgentId, AgentRole, LogEntry, TransactionView};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use std::path::Path;

/// A single frame of simulation data.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimFrame {
    /// Tick the frame was captured after
    pub tick: u64,

    pub virtual_time_ms: u64,

    pub agents: Vec<AgentFrame>,

    pub connections: Vec<TransactionView>,

    /// Feed events appended during the round
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<CanvasEvent>,

    /// Per-agent logs from the round
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<AgentLogs>,
}

impl SimFrame {
    /// Captures the committed state after `report`'s round.
    ///
    /// `event_cursor` is the feed length before the round started.
    pub fn capture(store: &WorldStore, report: &RoundReport, event_cursor: usize) -> Self {
        Self {
            tick: report.tick,
            virtual_time_ms: store.virtual_time_ms(),
            agents: store
                .agents()
                .map(|a| AgentFrame {
                    id: a.id,
                    name: a.name.clone(),
                    role: a.role,
                    status: a.status,
                    balance_micro: a.balance_micro,
                    locked_micro: a.locked_micro,
                })
                .collect(),
            connections: store.connections().map(|c| c.view()).collect(),
            events: store.events_since(event_cursor).to_vec(),
            logs: report
                .agents
                .iter()
                .filter(|r| !r.logs.is_empty())
                .map(|r| AgentLogs {
                    agent: r.agent,
                    status: r.status,
                    entries: r.logs.clone(),
                })
                .collect(),
        }
    }
}

/// Agent frame data.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentFrame {
    pub id: AgentId,
    pub name: String,
    pub role: AgentRole,
    pub status: AgentStatus,
    pub balance_micro: u64,
    pub locked_micro: u64,
}

/// Logs one agent produced in one round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentLogs {
    pub agent: AgentId,
    #[serde(flatten)]
    pub status: RunStatus,
    pub entries: Vec<LogEntry>,
}

/// Complete simulation export.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimExport {
    /// Scenario name
    pub scenario: String,

    /// Seed used
    pub seed: u64,

    pub tick_duration_ms: u64,

    /// All frames
    pub frames: Vec<SimFrame>,

    /// Final results
    pub passed: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl SimExport {
    /// Creates a new export container.
    pub fn new(scenario: &str, seed: u64, tick_duration_ms: u64) -> Self {
        Self {
            scenario: scenario.to_string(),
            seed,
            tick_duration_ms,
            frames: Vec::new(),
            passed: false,
            failure_reason: None,
        }
    }

    /// Adds a frame.
    pub fn add_frame(&mut self, frame: SimFrame) {
        self.frames.push(frame);
    }

    /// Finalizes the export.
    pub fn finalize(&mut self, passed: bool, failure_reason: Option<String>) {
        self.passed = passed;
        self.failure_reason = failure_reason;
    }

    /// Writes to a JSON file.
    pub fn write_to_file(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        let mut file = File::create(path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }
}
