//! Deployment manifest
//!
//! The manifest is the ordered, read-only list of steps a deployment walks
//! through, plus two tables keyed by error substring: how to treat known
//! errors, and which errors need an operator to step in.

use crate::error::{ProvisionError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

const BUILTIN_MANIFEST: &str = include_str!("../manifests/default.yaml");

/// Tag for steps whose resource can be adopted with `terraform import`
pub const IMPORT_EXISTING: &str = "import_existing";

/// A single named unit of provisioning work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Unique key
    pub id: String,

    /// Display text
    pub name: String,

    /// Failure here blocks completion of the deployment
    #[serde(default)]
    pub critical: bool,

    /// An "already exists" failure counts as success-by-omission
    #[serde(default)]
    pub can_skip_if_exists: bool,

    /// Engine resource address this step provisions
    #[serde(default)]
    pub resource: Option<String>,

    /// Optional follow-up tag (e.g. `import_existing`)
    #[serde(default)]
    pub alternative_action: Option<String>,
}

impl StepDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            critical: false,
            can_skip_if_exists: false,
            resource: None,
            alternative_action: None,
        }
    }

    pub fn critical(mut self, critical: bool) -> Self {
        self.critical = critical;
        self
    }

    pub fn skip_if_exists(mut self, skip: bool) -> Self {
        self.can_skip_if_exists = skip;
        self
    }

    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    pub fn with_alternative_action(mut self, action: impl Into<String>) -> Self {
        self.alternative_action = Some(action.into());
        self
    }

    /// Whether the step can be adopted by importing the existing resource
    pub fn imports_existing(&self) -> bool {
        self.alternative_action.as_deref() == Some(IMPORT_EXISTING)
    }
}

/// What to do when a known error pattern shows up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorAction {
    SkipAndContinue,
    Fail,
}

/// Handling policy for one entry of the manifest's error table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPolicy {
    pub action: ErrorAction,

    #[serde(default)]
    pub log_message: Option<String>,
}

/// Instructions for a failure no retry can fix
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualIntervention {
    /// What needs attention, e.g. "Firestore Database"
    pub resource: String,

    /// Short description of what the operator has to do
    pub action: String,

    /// Instructions, in order
    #[serde(default)]
    pub steps: Vec<String>,

    /// The remaining steps can still be applied
    #[serde(default)]
    pub can_continue: bool,
}

/// Ordered sequence of step definitions plus the error tables
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    pub steps: Vec<StepDefinition>,

    /// Error code substring -> policy
    #[serde(default)]
    pub error_handling: BTreeMap<String, ErrorPolicy>,

    /// Error substring -> what the operator has to do about it
    #[serde(default)]
    pub manual_interventions: BTreeMap<String, ManualIntervention>,
}

impl Manifest {
    /// Build a manifest from step definitions, rejecting duplicate ids
    pub fn new(steps: Vec<StepDefinition>) -> Result<Self> {
        let manifest = Self {
            steps,
            error_handling: BTreeMap::new(),
            manual_interventions: BTreeMap::new(),
        };
        manifest.check()?;
        Ok(manifest)
    }

    pub fn with_error_policy(mut self, pattern: impl Into<String>, policy: ErrorPolicy) -> Self {
        self.error_handling.insert(pattern.into(), policy);
        self
    }

    pub fn with_manual_intervention(
        mut self,
        pattern: impl Into<String>,
        intervention: ManualIntervention,
    ) -> Self {
        self.manual_interventions.insert(pattern.into(), intervention);
        self
    }

    /// The manifest for the standard GCP module shipped with stackpilot
    pub fn builtin() -> Result<Self> {
        Self::from_yaml(BUILTIN_MANIFEST)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let manifest: Manifest = serde_yaml::from_str(content)?;
        manifest.check()?;
        Ok(manifest)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let manifest: Manifest = serde_json::from_str(content)?;
        manifest.check()?;
        Ok(manifest)
    }

    /// Load a manifest file; `.json` files are read as JSON, anything else as YAML
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await?;
        let manifest = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&content)?,
            _ => Self::from_yaml(&content)?,
        };
        tracing::debug!(
            "Loaded manifest {} with {} steps",
            path.display(),
            manifest.steps.len()
        );
        Ok(manifest)
    }

    fn check(&self) -> Result<()> {
        if self.steps.is_empty() {
            return Err(ProvisionError::InvalidManifest(
                "manifest has no steps".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for step in &self.steps {
            if step.id.trim().is_empty() {
                return Err(ProvisionError::InvalidManifest(format!(
                    "step '{}' has an empty id",
                    step.name
                )));
            }
            if !seen.insert(step.id.as_str()) {
                return Err(ProvisionError::DuplicateStep(step.id.clone()));
            }
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StepDefinition> {
        self.steps.iter()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// First error-table entry whose pattern occurs in `error_text`
    pub fn matching_policy(&self, error_text: &str) -> Option<(&str, &ErrorPolicy)> {
        self.error_handling
            .iter()
            .find(|(pattern, _)| error_text.contains(pattern.as_str()))
            .map(|(pattern, policy)| (pattern.as_str(), policy))
    }

    /// First manual-intervention entry whose pattern occurs in `error_text`
    pub fn matching_intervention(&self, error_text: &str) -> Option<(&str, &ManualIntervention)> {
        self.manual_interventions
            .iter()
            .find(|(pattern, _)| error_text.contains(pattern.as_str()))
            .map(|(pattern, intervention)| (pattern.as_str(), intervention))
    }

    /// Patterns of every failure that needs an operator. Retrying these is pointless.
    pub fn intervention_patterns(&self) -> impl Iterator<Item = &str> {
        self.manual_interventions.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_manifest_loads() {
        let manifest = Manifest::builtin().unwrap();
        assert!(!manifest.is_empty());
        assert!(manifest.steps.iter().any(|s| s.critical));
        assert!(manifest.error_handling.contains_key("Error 409"));

        let (_, firestore) = manifest
            .matching_intervention("Error: Error creating Database: googleapi: Error 409: Database already exists.")
            .unwrap();
        assert_eq!(firestore.resource, "Firestore Database");
        assert!(!firestore.can_continue);
        let (_, domain) = manifest
            .matching_intervention("Error: You must verify site or domain ownership at https://search.google.com")
            .unwrap();
        assert!(domain.can_continue);
        assert!(!domain.steps.is_empty());
    }

    #[test]
    fn test_manual_interventions_from_yaml() {
        let manifest = Manifest::from_yaml(
            r#"
steps:
  - id: apis
    name: Enable APIs
manual_interventions:
  "Billing account not found":
    resource: Billing
    action: Link a billing account
    steps:
      - Open the billing console
      - Link the project and re-run
"#,
        )
        .unwrap();

        let (pattern, intervention) = manifest
            .matching_intervention("Error 400: Billing account not found for project demo")
            .unwrap();
        assert_eq!(pattern, "Billing account not found");
        assert_eq!(intervention.steps.len(), 2);
        // blocks unless stated otherwise
        assert!(!intervention.can_continue);
        assert_eq!(
            manifest.intervention_patterns().collect::<Vec<_>>(),
            vec!["Billing account not found"]
        );
        assert!(manifest.matching_intervention("Error 503").is_none());
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let result = Manifest::new(vec![
            StepDefinition::new("apis", "Enable APIs"),
            StepDefinition::new("apis", "Enable APIs again"),
        ]);
        assert!(matches!(result, Err(ProvisionError::DuplicateStep(id)) if id == "apis"));
    }

    #[test]
    fn test_empty_manifest_rejected() {
        assert!(matches!(
            Manifest::new(Vec::new()),
            Err(ProvisionError::InvalidManifest(_))
        ));
    }

    #[test]
    fn test_yaml_defaults() {
        let manifest = Manifest::from_yaml(
            r#"
steps:
  - id: bucket
    name: Storage bucket
    resource: google_storage_bucket.data
error_handling:
  "already own it":
    action: skip_and_continue
    log_message: Bucket already owned by this project
"#,
        )
        .unwrap();

        let step = manifest.get("bucket").unwrap();
        assert!(!step.critical);
        assert!(!step.can_skip_if_exists);
        assert_eq!(step.resource.as_deref(), Some("google_storage_bucket.data"));

        let (pattern, policy) = manifest
            .matching_policy("Error: you already own it")
            .unwrap();
        assert_eq!(pattern, "already own it");
        assert_eq!(policy.action, ErrorAction::SkipAndContinue);
    }

    #[test]
    fn test_json_manifest() {
        let manifest = Manifest::from_json(
            r#"{"steps":[{"id":"a","name":"A","critical":true,"alternative_action":"import_existing"}]}"#,
        )
        .unwrap();
        let step = manifest.get("a").unwrap();
        assert!(step.critical);
        assert!(step.imports_existing());
    }
}
