//! Terraform driver error types

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TerraformError {
    #[error("terraform not found at '{0}'. Please install: https://developer.hashicorp.com/terraform/install")]
    TerraformNotFound(String),

    #[error("Terraform module not found: {}", .0.display())]
    ModuleNotFound(PathBuf),

    #[error("A terraform command is already running for this deployment")]
    AlreadyRunning,

    #[error("terraform {command} failed: {message}")]
    CommandFailed { command: String, message: String },

    #[error("Failed to parse terraform outputs: {0}")]
    OutputParse(String),

    #[error("terraform process was terminated")]
    Terminated,

    #[error("terraform {command} timed out after {secs}s")]
    Timeout { command: String, secs: u64 },

    #[error("Working directory not initialized; call initialize() first")]
    NotInitialized,

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl TerraformError {
    /// The engine's own failure text for `CommandFailed`
    pub fn message(&self) -> Option<&str> {
        match self {
            TerraformError::CommandFailed { message, .. } => Some(message),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, TerraformError>;
