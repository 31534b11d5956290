//! Provisioning engine abstraction
//!
//! The orchestration loop drives any engine implementing `InfraEngine`. The
//! Terraform driver is the production implementation; tests supply fakes.

use crate::outputs::OutputSet;
use crate::progress::ProgressSink;
use async_trait::async_trait;
use std::sync::Arc;

/// Result of a plan run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanOutcome {
    /// Plan computed; carries the engine's captured output
    Planned(String),
    /// The infrastructure is already present; go straight to output retrieval
    SkipToOutputs,
}

impl PlanOutcome {
    pub fn is_skip(&self) -> bool {
        matches!(self, PlanOutcome::SkipToOutputs)
    }
}

#[async_trait]
pub trait InfraEngine: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Prepare the working directory (providers, modules, backend)
    async fn init(&self, progress: &ProgressSink) -> Result<String, Self::Error>;

    async fn plan(&self, progress: &ProgressSink) -> Result<PlanOutcome, Self::Error>;

    /// Apply everything, or only `target` when a resource address is given
    async fn apply(
        &self,
        target: Option<&str>,
        progress: &ProgressSink,
    ) -> Result<String, Self::Error>;

    async fn get_outputs(&self) -> Result<OutputSet, Self::Error>;

    async fn destroy(&self, progress: &ProgressSink) -> Result<String, Self::Error>;

    /// Whether `error` means the run was cancelled rather than failed.
    /// Interrupted steps stay in progress so a later run picks them up.
    fn is_interruption(_error: &Self::Error) -> bool {
        false
    }
}

#[async_trait]
impl<T: InfraEngine + ?Sized> InfraEngine for Arc<T> {
    type Error = T::Error;

    async fn init(&self, progress: &ProgressSink) -> Result<String, Self::Error> {
        (**self).init(progress).await
    }

    async fn plan(&self, progress: &ProgressSink) -> Result<PlanOutcome, Self::Error> {
        (**self).plan(progress).await
    }

    async fn apply(
        &self,
        target: Option<&str>,
        progress: &ProgressSink,
    ) -> Result<String, Self::Error> {
        (**self).apply(target, progress).await
    }

    async fn get_outputs(&self) -> Result<OutputSet, Self::Error> {
        (**self).get_outputs().await
    }

    async fn destroy(&self, progress: &ProgressSink) -> Result<String, Self::Error> {
        (**self).destroy(progress).await
    }

    fn is_interruption(error: &Self::Error) -> bool {
        T::is_interruption(error)
    }
}
