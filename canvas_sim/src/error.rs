//! Error types for the simulation harness.

use canvas_core::StoreError;
use canvas_env::SandboxError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SimError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("Unknown template: {0}")]
    UnknownTemplate(String),

    #[error("Invalid canvas file: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to start runtime: {0}")]
    Runtime(String),
}

impl SimError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}
