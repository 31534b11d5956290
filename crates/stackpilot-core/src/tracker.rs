//! Deployment step tracker
//!
//! A state machine over manifest step ids:
//!
//! ```text
//! absent ──start──▶ in_progress ──complete──▶ completed
//!                        │      ──fail──────▶ failed
//!                        └──────skip────────▶ skipped
//! ```
//!
//! Terminal states are final. Every transition is persisted through the
//! attached `StateStore`; a failed write is logged and the in-memory state
//! stays authoritative.

use crate::classify::is_already_exists;
use crate::error::{ProvisionError, Result};
use crate::manifest::{ErrorAction, Manifest, StepDefinition};
use crate::report::{
    DeploymentReport, InterventionNotice, RecoveryAction, RecoveryActionKind, RecoverySuggestion,
};
use crate::state::{DeploymentState, StateStore, StepOutcome, StepRecord, StepStatus};
use chrono::Utc;
use std::path::Path;
use std::sync::Arc;

pub struct StepTracker {
    manifest: Arc<Manifest>,
    state: DeploymentState,
    store: Option<StateStore>,
}

impl StepTracker {
    pub fn new(
        manifest: Arc<Manifest>,
        project_id: impl Into<String>,
        solution_prefix: impl Into<String>,
    ) -> Self {
        Self {
            manifest,
            state: DeploymentState::new(project_id, solution_prefix),
            store: None,
        }
    }

    /// Persist the state to `store` after every transition
    pub fn with_store(mut self, store: StateStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn state(&self) -> &DeploymentState {
        &self.state
    }

    /// Merge a previously persisted state into this one.
    ///
    /// Returns `true` when a state was resumed. A missing, unreadable or
    /// foreign record is not an error: the deployment simply starts fresh.
    pub async fn load_existing_state(&mut self, location: impl AsRef<Path>) -> bool {
        let store = StateStore::new(location);
        let previous = match store.load().await {
            Ok(Some(previous)) => previous,
            Ok(None) => return false,
            Err(e) => {
                tracing::warn!(
                    "Ignoring unreadable deployment state {}: {}",
                    store.path().display(),
                    e
                );
                return false;
            }
        };

        if !previous.matches(&self.state.project_id, &self.state.solution_prefix) {
            tracing::warn!(
                "State {} belongs to {}/{}, starting fresh",
                store.path().display(),
                previous.project_id,
                previous.solution_prefix
            );
            return false;
        }

        self.merge(previous);
        tracing::info!(
            "Resumed deployment {}/{}: {} completed, {} failed, {} skipped",
            self.state.project_id,
            self.state.solution_prefix,
            self.state.completed_steps.len(),
            self.state.failed_steps.len(),
            self.state.skipped_steps.len()
        );
        true
    }

    fn merge(&mut self, previous: DeploymentState) {
        let manifest = Arc::clone(&self.manifest);
        let known = |id: &String| manifest.contains(id);

        self.state.start_time = self.state.start_time.min(previous.start_time);
        self.state.resumed_at = Some(Utc::now());
        if self.state.current_step.is_none() {
            self.state.current_step = previous.current_step.filter(|id| known(id));
        }

        for (id, record) in previous.steps {
            if known(&id) && !self.state.steps.contains_key(&id) {
                self.state.steps.insert(id, record);
            }
        }

        let lists = [
            (previous.completed_steps, StepStatus::Completed),
            (previous.failed_steps, StepStatus::Failed),
            (previous.skipped_steps, StepStatus::Skipped),
        ];
        for (ids, status) in lists {
            for id in ids {
                let consistent = self.state.status_of(&id) == Some(status);
                if known(&id) && consistent && !self.state.is_finished(&id) {
                    self.state.push_terminal(&id, status);
                }
            }
        }
    }

    /// Write the current state to `location`
    pub async fn save_state(&self, location: impl AsRef<Path>) -> Result<()> {
        StateStore::new(location).save(&self.state).await
    }

    async fn persist(&self) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save(&self.state).await {
                tracing::warn!(
                    "Failed to persist deployment state to {}: {}",
                    store.path().display(),
                    e
                );
            }
        }
    }

    fn definition(&self, id: &str) -> Result<&StepDefinition> {
        self.manifest
            .get(id)
            .ok_or_else(|| ProvisionError::UnknownStep(id.to_string()))
    }

    /// Mark a step as started. A step left in progress by an interrupted run
    /// can be started again.
    pub async fn start_step(&mut self, id: &str) -> Result<()> {
        let name = self.definition(id)?.name.clone();
        if let Some(record) = self.state.steps.get(id) {
            if record.status.is_terminal() {
                return Err(ProvisionError::StepAlreadyFinished {
                    id: id.to_string(),
                    status: record.status.to_string(),
                });
            }
        }

        self.state
            .steps
            .insert(id.to_string(), StepRecord::started(name));
        self.state.current_step = Some(id.to_string());
        tracing::info!("Step started: {}", id);
        self.persist().await;
        Ok(())
    }

    pub async fn complete_step(&mut self, id: &str, result: impl Into<String>) -> Result<()> {
        self.finish(id, StepStatus::Completed, StepOutcome::Result(result.into()))
            .await
    }

    pub async fn fail_step(&mut self, id: &str, error: impl Into<String>) -> Result<()> {
        self.finish(id, StepStatus::Failed, StepOutcome::Error(error.into()))
            .await
    }

    /// Skip a step, whether or not it was started
    pub async fn skip_step(&mut self, id: &str, reason: impl Into<String>) -> Result<()> {
        self.finish(id, StepStatus::Skipped, StepOutcome::Reason(reason.into()))
            .await
    }

    async fn finish(&mut self, id: &str, status: StepStatus, outcome: StepOutcome) -> Result<()> {
        let name = self.definition(id)?.name.clone();

        match self.state.steps.get_mut(id) {
            Some(record) if record.status.is_terminal() => {
                return Err(ProvisionError::StepAlreadyFinished {
                    id: id.to_string(),
                    status: record.status.to_string(),
                });
            }
            Some(record) => record.finish(status, outcome),
            None if status == StepStatus::Skipped => {
                let mut record = StepRecord::started(name);
                record.finish(status, outcome);
                self.state.steps.insert(id.to_string(), record);
            }
            None => return Err(ProvisionError::StepNotStarted(id.to_string())),
        }

        self.state.push_terminal(id, status);
        tracing::info!("Step {}: {}", status, id);
        self.persist().await;
        Ok(())
    }

    /// First manifest step that has not reached a terminal status
    pub fn get_next_step(&self) -> Option<&StepDefinition> {
        self.manifest
            .iter()
            .find(|step| !self.state.is_finished(&step.id))
    }

    /// Whether an apply-time failure of `id` is benign. A failure listed in
    /// the manual-intervention table never is.
    pub fn should_skip_step(&self, id: &str, error_text: &str) -> bool {
        let Some(step) = self.manifest.get(id) else {
            return false;
        };

        if let Some((pattern, intervention)) = self.manifest.matching_intervention(error_text) {
            tracing::warn!(
                "Step {} needs manual intervention ({}): {}",
                id,
                pattern,
                intervention.action
            );
            return false;
        }

        if step.can_skip_if_exists && is_already_exists(error_text) {
            tracing::info!("Step {} hit an existing resource, skipping", id);
            return true;
        }

        match self.manifest.matching_policy(error_text) {
            Some((pattern, policy)) if policy.action == ErrorAction::SkipAndContinue => {
                match &policy.log_message {
                    Some(message) => tracing::info!("{} ({})", message, pattern),
                    None => tracing::info!("Known error '{}' on step {}, skipping", pattern, id),
                }
                true
            }
            Some((pattern, policy)) => {
                if let Some(message) = &policy.log_message {
                    tracing::warn!("{} ({})", message, pattern);
                }
                false
            }
            None => false,
        }
    }

    pub fn generate_report(&self) -> DeploymentReport {
        let state = &self.state;
        let critical_failures: Vec<String> = state
            .failed_steps
            .iter()
            .filter(|id| self.manifest.get(id).is_some_and(|s| s.critical))
            .cloned()
            .collect();

        let manual_interventions: Vec<InterventionNotice> = state
            .failed_steps
            .iter()
            .filter_map(|id| {
                let error = match state.steps.get(id)?.outcome.as_ref()? {
                    StepOutcome::Error(error) => error,
                    _ => return None,
                };
                let (_, intervention) = self.manifest.matching_intervention(error)?;
                Some(InterventionNotice {
                    step_id: id.clone(),
                    resource: intervention.resource.clone(),
                    action: intervention.action.clone(),
                    steps: intervention.steps.clone(),
                    can_continue: intervention.can_continue,
                })
            })
            .collect();
        let blocked = manual_interventions.iter().any(|n| !n.can_continue);

        let next_steps = if !state.failed_steps.is_empty() && critical_failures.is_empty() && !blocked {
            Some(format!(
                "{} non-critical step(s) failed ({}). The deployment is usable; redeploy with --fresh to retry them.",
                state.failed_steps.len(),
                state.failed_steps.join(", ")
            ))
        } else {
            None
        };

        let recovery_suggestions = state
            .failed_steps
            .iter()
            .filter_map(|id| self.manifest.get(id))
            .filter(|step| step.imports_existing())
            .filter_map(|step| {
                let resource = step.resource.as_ref()?;
                Some(RecoverySuggestion {
                    step_id: step.id.clone(),
                    resource: resource.clone(),
                    message: format!(
                        "{} may already exist; import it with `terraform import {} <id>` and re-run",
                        resource, resource
                    ),
                })
            })
            .collect();

        DeploymentReport {
            project_id: state.project_id.clone(),
            solution_prefix: state.solution_prefix.clone(),
            duration_secs: Utc::now()
                .signed_duration_since(state.start_time)
                .num_seconds(),
            total: self.manifest.len(),
            completed: state.completed_steps.len(),
            failed: state.failed_steps.len(),
            skipped: state.skipped_steps.len(),
            in_progress: state
                .steps
                .values()
                .filter(|r| r.status == StepStatus::InProgress)
                .count(),
            critical_failures,
            next_steps,
            recovery_suggestions,
            manual_interventions,
        }
    }

    /// Follow-up actions for failed critical steps. For reporting only.
    pub fn recovery_plan(&self) -> Vec<RecoveryAction> {
        self.state
            .failed_steps
            .iter()
            .filter_map(|id| self.manifest.get(id))
            .filter(|step| step.critical)
            .map(|step| match (&step.resource, step.imports_existing()) {
                (Some(resource), true) => RecoveryAction {
                    action: RecoveryActionKind::ImportExisting,
                    step_id: step.id.clone(),
                    description: format!("Import the existing resource for '{}'", step.name),
                    command: format!("terraform import {} <id>", resource),
                },
                _ => RecoveryAction {
                    action: RecoveryActionKind::Retry,
                    step_id: step.id.clone(),
                    description: format!("Fix the cause and retry '{}'", step.name),
                    command: format!(
                        "stackpilot deploy --project {} --prefix {} --fresh",
                        self.state.project_id, self.state.solution_prefix
                    ),
                },
            })
            .collect()
    }
}
