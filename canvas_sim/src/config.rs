//! Canvas files - TOML descriptions of a canvas to simulate.
//!
//! ```toml
//! [sim]
//! ticks = 12
//! tick_duration_ms = 500
//!
//! [limits]
//! max_execution_time_ms = 100
//!
//! [[agents]]
//! template = "provider"
//! name = "Bob"
//!
//! [[agents]]
//! template = "requester"
//! name = "Alice"
//! provider = "Bob"
//! state = { rounds = 2 }
//!
//! [[connections]]
//! source = "Alice"
//! target = "Bob"
//! amount_micro = 2_000_000
//! ```

use crate::error::SimError;
use crate::templates::{create_agent_from_template, Customizations, TemplateLibrary};
use crate::world::{SimConfig, SimWorld};

use canvas_core::AgentStatus;
use canvas_env::{AgentId, SandboxLimits, SandboxProvider};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

/// Parsed canvas file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CanvasFile {
    #[serde(default)]
    pub sim: SimSection,

    #[serde(default)]
    pub limits: LimitsSection,

    #[serde(default)]
    pub agents: Vec<AgentEntry>,

    #[serde(default)]
    pub connections: Vec<ConnectionEntry>,
}

/// `[sim]` - run settings; anything unset keeps the current value.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SimSection {
    pub seed: Option<u64>,
    pub ticks: Option<u64>,
    pub tick_duration_ms: Option<u64>,
    pub host_grace_ms: Option<u64>,
}

/// `[limits]` - sandbox limits; anything unset keeps the current value.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LimitsSection {
    pub max_execution_time_ms: Option<u64>,
    pub max_memory_bytes: Option<u64>,
    pub max_stack_size_bytes: Option<u64>,
    pub max_operations: Option<u64>,
}

impl LimitsSection {
    pub fn apply(&self, limits: &mut SandboxLimits) {
        if let Some(v) = self.max_execution_time_ms {
            limits.max_execution_time_ms = v;
        }
        if let Some(v) = self.max_memory_bytes {
            limits.max_memory_bytes = v;
        }
        if let Some(v) = self.max_stack_size_bytes {
            limits.max_stack_size_bytes = v;
        }
        if self.max_operations.is_some() {
            limits.max_operations = self.max_operations;
        }
    }
}

/// One `[[agents]]` entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentEntry {
    pub template: String,
    pub name: Option<String>,
    pub balance_micro: Option<u64>,
    /// Inline script replacing the template's code
    pub code: Option<String>,
    /// Name of the agent to buy from; stored as `state.provider`
    pub provider: Option<String>,
    pub state: Option<Value>,
    #[serde(default)]
    pub paused: bool,
}

/// One `[[connections]]` entry, wired before the first tick.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectionEntry {
    pub source: String,
    pub target: String,
    pub amount_micro: u64,
    #[serde(default = "default_service")]
    pub service: String,
}

fn default_service() -> String {
    "General".to_string()
}

impl CanvasFile {
    pub fn from_toml(text: &str) -> Result<Self, SimError> {
        toml::from_str(text).map_err(|e| SimError::config(e.to_string()))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, SimError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    /// Tick count requested by the file.
    pub fn ticks(&self) -> Option<u64> {
        self.sim.ticks
    }

    /// Layers the file's settings over `config`.
    pub fn apply_to(&self, config: &mut SimConfig) {
        if let Some(seed) = self.sim.seed {
            config.seed = seed;
        }
        if let Some(ms) = self.sim.tick_duration_ms {
            config.tick_duration_ms = ms;
        }
        if let Some(ms) = self.sim.host_grace_ms {
            config.host_grace_ms = ms;
        }
        self.limits.apply(&mut config.limits);
    }

    /// Adds the file's agents and connections to `world`.
    ///
    /// Returns the id assigned to each agent name.
    pub fn populate<P, L>(
        &self,
        world: &mut SimWorld<P>,
        library: &L,
    ) -> Result<BTreeMap<String, AgentId>, SimError>
    where
        P: SandboxProvider,
        L: TemplateLibrary + ?Sized,
    {
        let mut ids = BTreeMap::new();
        let mut added = Vec::with_capacity(self.agents.len());

        for (index, entry) in self.agents.iter().enumerate() {
            let customizations = Customizations {
                name: entry.name.clone(),
                balance_micro: entry.balance_micro,
                initial_state: entry.state.clone(),
                code: entry.code.clone(),
            };
            let spec = create_agent_from_template(library, &entry.template, customizations)?;
            let name = entry
                .name
                .clone()
                .unwrap_or_else(|| format!("{}-{}", spec.name, index + 1));
            if ids.contains_key(&name) {
                return Err(SimError::config(format!("duplicate agent name '{}'", name)));
            }

            let id = world.add_agent(spec);
            if entry.paused {
                world.set_status(id, AgentStatus::Paused)?;
            }
            ids.insert(name, id);
            added.push(id);
        }

        // Provider references can point at agents declared later in the file.
        for (entry, &agent) in self.agents.iter().zip(&added) {
            let Some(provider) = &entry.provider else {
                continue;
            };
            let provider_id = lookup(&ids, provider)?;

            let mut state = match world.store().persistent_state(agent) {
                Some(Value::Object(map)) => map.clone(),
                _ => serde_json::Map::new(),
            };
            state.insert("provider".to_string(), Value::from(provider_id.0));
            world.set_persistent_state(agent, Value::Object(state))?;
        }

        for conn in &self.connections {
            let source = lookup(&ids, &conn.source)?;
            let target = lookup(&ids, &conn.target)?;
            let tx = world.connect(source, target, conn.amount_micro, conn.service.clone())?;
            debug!("Wired {} from {} to {}", tx, conn.source, conn.target);
        }

        Ok(ids)
    }
}

fn lookup(ids: &BTreeMap<String, AgentId>, name: &str) -> Result<AgentId, SimError> {
    ids.get(name)
        .copied()
        .ok_or_else(|| SimError::config(format!("unknown agent '{}'", name)))
}
