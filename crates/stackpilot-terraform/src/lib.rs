//! Terraform process driver for stackpilot
//!
//! This crate implements the `InfraEngine` trait by running the `terraform`
//! CLI as a subprocess.
//!
//! # Features
//!
//! - Per-deployment working directory materialized from a module template
//! - Line-by-line progress streaming (resource actions, stderr)
//! - Apply retry ladder with refresh, replan and transient-error backoff
//! - Per-command timeouts
//! - Graceful interruption of the in-flight process
//!
//! # Requirements
//!
//! - `terraform` must be installed (or configured via `with_binary`)
//! - Cloud credentials are passed through the process environment
//!
//! # Example
//!
//! ```ignore
//! use stackpilot_core::{InfraEngine, ProgressSink};
//! use stackpilot_terraform::TerraformDriver;
//!
//! let mut driver = TerraformDriver::new("./terraform", "/tmp/stackpilot", "anava", "us-central1");
//! driver.initialize("my-project").await?;
//!
//! let progress = ProgressSink::discard();
//! driver.init(&progress).await?;
//! let outputs = driver.get_outputs().await?;
//! ```

pub mod driver;
pub mod error;
pub mod workdir;

pub use driver::{ApplyRetryConfig, CommandTimeouts, TerraformDriver, TerraformVersion};
pub use error::{Result, TerraformError};
pub use workdir::WorkingDirectory;
