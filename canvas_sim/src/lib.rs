//! Agent Canvas Simulation Harness
//!
//! This crate drives a population of scripted agents through discrete
//! ticks. Every tick is a round with a barrier: all agents see the same
//! committed world, and nothing they do lands until every agent has
//! answered or run out of time.
//!
//! # Core Principle: One Writer
//!
//! Agent code never mutates shared state:
//! - **Scripts** run in per-agent sandboxes and return declarative ops
//! - **The store** validates and applies ops in ascending agent id order
//! - **Time** is virtual and advances once per tick
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         SimWorld                            │
//! │  ┌──────────────────────────────────────────────────────┐   │
//! │  │ WorldStore (agents, connections, escrow, event feed) │   │
//! │  └──────────────────────────────────────────────────────┘   │
//! │       │ snapshot               ▲ ops                        │
//! │  ┌────▼────┐              ┌────┴────┐                       │
//! │  │ Sandbox │     ...      │ Sandbox │                       │
//! │  │ agent#1 │              │ agent#N │                       │
//! │  └─────────┘              └─────────┘                       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use canvas_sim::{ScenarioRunner, SimConfig};
//! use canvas_sim::scenarios::ScenarioId;
//!
//! let runner = ScenarioRunner::new(SimConfig::default());
//! let result = runner.run(ScenarioId::EscrowHappyPath);
//! assert!(result.passed);
//! ```

mod config;
mod error;
mod exporter;
mod runner;
mod templates;
mod world;
pub mod scenarios;

pub use config::{AgentEntry, CanvasFile, ConnectionEntry, LimitsSection, SimSection};
pub use error::SimError;
pub use exporter::{AgentFrame, AgentLogs, SimExport, SimFrame};
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner};
pub use templates::{
    create_agent_from_template, AgentTemplate, BuiltinTemplates, Customizations,
    TemplateLibrary, DEFAULT_PRICE_MICRO, PROVIDER_SCRIPT, REQUESTER_SCRIPT, VALIDATOR_SCRIPT,
};
pub use world::{AgentReport, RoundReport, RunStatus, SimConfig, SimWorld};
