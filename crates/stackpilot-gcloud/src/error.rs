//! gcloud error types

use stackpilot_core::ProvisionError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GcloudError {
    #[error("gcloud not found. Please install: https://cloud.google.com/sdk/docs/install")]
    GcloudNotFound,

    #[error("gcloud command failed: {0}")]
    CommandFailed(String),

    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl GcloudError {
    /// The queried resource does not exist
    pub fn is_not_found(&self) -> bool {
        match self {
            GcloudError::CommandFailed(stderr) => {
                stderr.contains("NOT_FOUND") || stderr.to_lowercase().contains("was not found")
            }
            _ => false,
        }
    }
}

impl From<GcloudError> for ProvisionError {
    fn from(err: GcloudError) -> Self {
        ProvisionError::Query(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, GcloudError>;
