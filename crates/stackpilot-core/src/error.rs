//! Core error types

use thiserror::Error;

/// Errors raised by the step tracker, manifest loader and orchestration loop
#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("Unknown step: {0}")]
    UnknownStep(String),

    #[error("Step has not been started: {0}")]
    StepNotStarted(String),

    #[error("Step {id} already finished with status {status}")]
    StepAlreadyFinished { id: String, status: String },

    #[error("Duplicate step id in manifest: {0}")]
    DuplicateStep(String),

    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("State file error: {0}")]
    State(String),

    #[error("Cloud query failed: {0}")]
    Query(String),

    #[error("Engine command failed: {0}")]
    Engine(String),

    #[error("Deployment interrupted: {0}")]
    Interrupted(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, ProvisionError>;
