//! Google Cloud queries for stackpilot
//!
//! This crate implements the `CloudQuery` trait on top of the `gcloud` CLI,
//! letting the recovery engine look up outputs terraform failed to report.
//!
//! # Requirements
//!
//! - `gcloud` CLI must be installed
//! - Authentication is the active gcloud account, or an explicit account /
//!   access-token file set on the wrapper
//!
//! # Example
//!
//! ```ignore
//! use stackpilot_core::CloudQuery;
//! use stackpilot_gcloud::Gcloud;
//!
//! let gcloud = Gcloud::new().with_account("deployer@example.com");
//! let hostname = gcloud.find_gateway_hostname("my-project", "anava").await?;
//! ```

pub mod error;
pub mod gcloud;
mod query;

pub use error::{GcloudError, Result};
pub use gcloud::{ApiKeyInfo, Gcloud, GatewayInfo, ProjectInfo, ProviderInfo};
