//! stackpilot core
//!
//! Deployment bookkeeping for infrastructure provisioned by an external IaC
//! engine: a manifest-driven step tracker with durable state, validation of
//! the engine's outputs, and recovery of outputs the engine failed to report.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────┐
//! │                  stackpilot CLI                    │
//! └─────────────────────┬─────────────────────────────┘
//!                       │
//! ┌─────────────────────▼─────────────────────────────┐
//! │                 stackpilot-core                    │
//! │  ┌──────────────┐  ┌──────────────┐               │
//! │  │   Manifest   │─▶│ StepTracker  │─▶ state.json  │
//! │  └──────────────┘  └──────┬───────┘               │
//! │  ┌────────────────────────▼───────────────────┐   │
//! │  │               Orchestrator                  │   │
//! │  └───────┬──────────────────────────┬─────────┘   │
//! │  ┌───────▼───────┐  ┌───────────────▼─────────┐   │
//! │  │ trait         │  │ validator + recovery     │   │
//! │  │ InfraEngine   │  │ (trait CloudQuery)       │   │
//! │  └───────┬───────┘  └───────────────┬─────────┘   │
//! └──────────┼──────────────────────────┼─────────────┘
//!            │                          │
//! ┌──────────▼─────────┐   ┌────────────▼────────────┐
//! │ stackpilot-terraform│   │    stackpilot-gcloud     │
//! └────────────────────┘   └─────────────────────────┘
//! ```

pub mod classify;
pub mod engine;
pub mod error;
pub mod manifest;
pub mod orchestrator;
pub mod outputs;
pub mod progress;
pub mod query;
pub mod recovery;
pub mod report;
pub mod state;
pub mod tracker;
pub mod validator;

// Re-exports
pub use engine::{InfraEngine, PlanOutcome};
pub use error::{ProvisionError, Result};
pub use manifest::{ErrorAction, ErrorPolicy, ManualIntervention, Manifest, StepDefinition};
pub use orchestrator::{DeploymentOutcome, OutcomeStatus, Orchestrator};
pub use outputs::{OutputOrigin, OutputSet, OutputValue};
pub use progress::{Channel, ProgressEvent, ProgressSink, ResourceAction};
pub use query::CloudQuery;
pub use recovery::{RecoveryConfig, RecoveryEngine};
pub use report::{
    DeploymentReport, InterventionNotice, RecoveryAction, RecoveryActionKind, RecoverySuggestion,
};
pub use state::{DeploymentState, StateLock, StateStore, StepOutcome, StepRecord, StepStatus};
pub use tracker::StepTracker;
pub use validator::{ValidationResult, format_validation_report, validate_outputs};
