//! Orchestration loop
//!
//! init → plan → apply each manifest step → fetch outputs → validate →
//! recover. Steps run strictly in manifest order; only a critical step
//! failure or a blocking manual intervention stops the loop early.

use crate::engine::{InfraEngine, PlanOutcome};
use crate::error::{ProvisionError, Result};
use crate::outputs::OutputSet;
use crate::progress::ProgressSink;
use crate::query::CloudQuery;
use crate::recovery::RecoveryEngine;
use crate::report::DeploymentReport;
use crate::tracker::StepTracker;
use crate::validator::{ValidationResult, validate_outputs};
use serde::Serialize;

const ALREADY_PRESENT: &str = "infrastructure already present";

/// How a deployment ended, from the operator's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    /// Nothing left to do
    FullyResolved,
    /// Usable, but some outputs are placeholders that need manual follow-up
    RecoveredWithPlaceholders,
    /// A critical step failed or an operator has to step in; the
    /// deployment is incomplete
    CriticalFailure,
}

impl std::fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutcomeStatus::FullyResolved => write!(f, "fully resolved"),
            OutcomeStatus::RecoveredWithPlaceholders => write!(f, "recovered with placeholders"),
            OutcomeStatus::CriticalFailure => write!(f, "critical failure"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeploymentOutcome {
    pub status: OutcomeStatus,
    pub report: DeploymentReport,
    pub outputs: OutputSet,
    pub validation: ValidationResult,
}

impl DeploymentOutcome {
    pub fn placeholders(&self) -> Vec<&str> {
        self.outputs.placeholders()
    }
}

pub struct Orchestrator<E, Q> {
    engine: E,
    tracker: StepTracker,
    recovery: RecoveryEngine<Q>,
}

impl<E: InfraEngine, Q: CloudQuery> Orchestrator<E, Q> {
    pub fn new(engine: E, tracker: StepTracker, recovery: RecoveryEngine<Q>) -> Self {
        Self {
            engine,
            tracker,
            recovery,
        }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn tracker(&self) -> &StepTracker {
        &self.tracker
    }

    pub async fn run(&mut self, progress: &ProgressSink) -> Result<DeploymentOutcome> {
        let project_id = self.tracker.state().project_id.clone();

        progress.stage("init", "Initializing provisioning engine");
        self.engine
            .init(progress)
            .await
            .map_err(|e| ProvisionError::Engine(e.to_string()))?;

        progress.stage("plan", "Computing execution plan");
        let plan = self
            .engine
            .plan(progress)
            .await
            .map_err(|e| ProvisionError::Engine(e.to_string()))?;

        let aborted = match plan {
            PlanOutcome::SkipToOutputs => {
                progress.stage("plan", "Infrastructure already present, retrieving outputs");
                self.skip_remaining(ALREADY_PRESENT).await?;
                false
            }
            PlanOutcome::Planned(_) => self.apply_steps(progress).await?,
        };

        progress.stage("outputs", "Retrieving outputs");
        let outputs = match self.engine.get_outputs().await {
            Ok(outputs) => outputs,
            Err(e) => {
                tracing::warn!("Could not read engine outputs, recovering all: {}", e);
                OutputSet::new()
            }
        };

        let mut validation = validate_outputs(&outputs);
        let outputs = if validation.is_valid || aborted {
            outputs
        } else {
            progress.stage(
                "validate",
                format!("{} output problem(s) found", validation.errors.len()),
            );
            let recovered = self
                .recovery
                .attempt_recovery(&outputs, &project_id, progress)
                .await;
            validation = validate_outputs(&recovered);
            recovered
        };

        let report = self.tracker.generate_report();
        let status = if report.has_critical_failures() || report.is_blocked() {
            OutcomeStatus::CriticalFailure
        } else if !outputs.placeholders().is_empty() {
            OutcomeStatus::RecoveredWithPlaceholders
        } else {
            OutcomeStatus::FullyResolved
        };
        progress.stage("done", format!("Deployment {}", status));

        Ok(DeploymentOutcome {
            status,
            report,
            outputs,
            validation,
        })
    }

    /// Apply steps until the manifest is exhausted. Returns `true` when a
    /// critical failure or a blocking manual intervention stopped the loop.
    async fn apply_steps(&mut self, progress: &ProgressSink) -> Result<bool> {
        while let Some(step) = self.tracker.get_next_step().cloned() {
            self.tracker.start_step(&step.id).await?;
            progress.stage("apply", format!("{} ({})", step.name, step.id));

            match self.engine.apply(step.resource.as_deref(), progress).await {
                Ok(output) => {
                    self.tracker
                        .complete_step(&step.id, summarize(&output))
                        .await?;
                }
                Err(e) if E::is_interruption(&e) => {
                    tracing::warn!("Step {} interrupted, leaving it in progress", step.id);
                    return Err(ProvisionError::Interrupted(e.to_string()));
                }
                Err(e) => {
                    let message = e.to_string();
                    if self.tracker.should_skip_step(&step.id, &message) {
                        self.tracker.skip_step(&step.id, message).await?;
                    } else {
                        let blocking = self.announce_intervention(&step.id, &message, progress);
                        self.tracker.fail_step(&step.id, message).await?;
                        if blocking {
                            tracing::error!("Step {} needs manual intervention, stopping", step.id);
                            return Ok(true);
                        }
                        if step.critical {
                            tracing::error!("Critical step {} failed, stopping", step.id);
                            progress.stage("apply", format!("Critical step {} failed", step.id));
                            return Ok(true);
                        }
                        tracing::warn!("Step {} failed, continuing", step.id);
                    }
                }
            }
        }
        Ok(false)
    }

    /// Returns `true` when the failure blocks the remaining steps
    fn announce_intervention(&self, step_id: &str, error: &str, progress: &ProgressSink) -> bool {
        let Some((_, intervention)) = self.tracker.manifest().matching_intervention(error) else {
            return false;
        };
        progress.stage(
            "apply",
            format!(
                "Manual intervention required for {} ({}): {}",
                intervention.resource, step_id, intervention.action
            ),
        );
        !intervention.can_continue
    }

    async fn skip_remaining(&mut self, reason: &str) -> Result<()> {
        while let Some(step) = self.tracker.get_next_step() {
            let id = step.id.clone();
            self.tracker.skip_step(&id, reason).await?;
        }
        Ok(())
    }
}

/// Last meaningful line of an engine run, e.g. "Apply complete! ..."
fn summarize(output: &str) -> String {
    output
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("ok")
        .to_string()
}
