//! Deployment reports and operator-facing recovery suggestions

use serde::{Deserialize, Serialize};

/// Summary of a deployment attempt, computed from the tracker's state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentReport {
    pub project_id: String,
    pub solution_prefix: String,

    /// Seconds since the deployment started
    pub duration_secs: i64,

    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub in_progress: usize,

    /// Failed steps whose definition is critical
    pub critical_failures: Vec<String>,

    /// Continuation hint, only when every failure is non-critical
    pub next_steps: Option<String>,

    pub recovery_suggestions: Vec<RecoverySuggestion>,

    /// Failed steps whose error needs an operator
    #[serde(default)]
    pub manual_interventions: Vec<InterventionNotice>,
}

impl DeploymentReport {
    pub fn has_critical_failures(&self) -> bool {
        !self.critical_failures.is_empty()
    }

    /// Some failure needs an operator before the deployment can finish
    pub fn is_blocked(&self) -> bool {
        self.manual_interventions.iter().any(|n| !n.can_continue)
    }

    /// Every manifest step reached a terminal status
    pub fn is_finished(&self) -> bool {
        self.completed + self.failed + self.skipped == self.total
    }
}

impl std::fmt::Display for DeploymentReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} completed, {} failed, {} skipped, {} pending of {} steps in {}s",
            self.completed,
            self.failed,
            self.skipped,
            self.total
                .saturating_sub(self.completed + self.failed + self.skipped),
            self.total,
            self.duration_secs
        )
    }
}

/// A failed step matched the manifest's manual-intervention table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterventionNotice {
    pub step_id: String,
    pub resource: String,
    pub action: String,
    pub steps: Vec<String>,
    pub can_continue: bool,
}

/// Suggestion to adopt an existing resource instead of creating it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoverySuggestion {
    pub step_id: String,
    pub resource: String,
    pub message: String,
}

/// Kind of follow-up proposed for a failed critical step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryActionKind {
    ImportExisting,
    Retry,
}

impl std::fmt::Display for RecoveryActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecoveryActionKind::ImportExisting => write!(f, "import_existing"),
            RecoveryActionKind::Retry => write!(f, "retry"),
        }
    }
}

/// One entry of a recovery plan. Reported, never executed automatically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryAction {
    pub action: RecoveryActionKind,
    pub step_id: String,
    pub description: String,
    pub command: String,
}
