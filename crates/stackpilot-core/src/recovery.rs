//! Output recovery
//!
//! When validation finds required outputs missing or invalid, the recovery
//! engine backfills them: by querying the cloud platform, by rebuilding them
//! from naming conventions, or as a last resort with an explicit placeholder.
//! Recovery never fails; every required field has a value afterwards.

use crate::outputs::{OutputOrigin, OutputSet, OutputValue};
use crate::progress::ProgressSink;
use crate::query::CloudQuery;
use crate::validator::{
    API_GATEWAY_URL, API_KEY, DEVICE_AUTH_SERVICE_ACCOUNT, FIREBASE_CONFIG, TVM_SERVICE_ACCOUNT,
    VERTEX_AI_SERVICE_ACCOUNT, WORKLOAD_IDENTITY_PROVIDER, validate_outputs,
};
use serde_json::{Value, json};
use std::time::Duration;

pub const API_KEY_PLACEHOLDER: &str = "CHECK_CLOUD_CONSOLE_FOR_API_KEY";
pub const CONSOLE_PLACEHOLDER: &str = "CHECK_CONSOLE";

/// Placeholder used when the gateway never reported a hostname
pub fn gateway_placeholder(project_id: &str) -> String {
    format!("https://anava-gateway-pending.{}.gateway.dev", project_id)
}

/// Polling budget and naming conventions for recovery
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    pub gateway_poll_attempts: u32,
    pub gateway_poll_interval: Duration,
    pub service_account_domain: String,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            gateway_poll_attempts: 30,
            gateway_poll_interval: Duration::from_secs(30),
            service_account_domain: "iam.gserviceaccount.com".to_string(),
        }
    }
}

impl RecoveryConfig {
    /// Upper bound on time spent waiting for the gateway
    pub fn max_gateway_wait(&self) -> Duration {
        self.gateway_poll_interval * self.gateway_poll_attempts
    }
}

pub struct RecoveryEngine<Q> {
    query: Q,
    config: RecoveryConfig,
    solution_prefix: String,
}

impl<Q: CloudQuery> RecoveryEngine<Q> {
    pub fn new(query: Q, solution_prefix: impl Into<String>) -> Self {
        Self {
            query,
            config: RecoveryConfig::default(),
            solution_prefix: solution_prefix.into(),
        }
    }

    pub fn with_config(mut self, config: RecoveryConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    /// Return a copy of `outputs` with every missing or invalid required field
    /// filled in
    pub async fn attempt_recovery(
        &self,
        outputs: &OutputSet,
        project_id: &str,
        progress: &ProgressSink,
    ) -> OutputSet {
        let validation = validate_outputs(outputs);
        let mut recovered = outputs.clone();
        if validation.is_valid {
            return recovered;
        }

        let failed: Vec<&str> = validation.failed_fields().collect();
        progress.stage(
            "recovery",
            format!("Recovering {} output(s): {}", failed.len(), failed.join(", ")),
        );

        for field in failed {
            let value = match field {
                API_GATEWAY_URL => self.recover_gateway_url(project_id, progress).await,
                API_KEY => self.recover_api_key(project_id).await,
                FIREBASE_CONFIG => self.recover_firebase_config(project_id, &recovered),
                WORKLOAD_IDENTITY_PROVIDER => self.recover_workload_identity(project_id).await,
                DEVICE_AUTH_SERVICE_ACCOUNT => self.service_account(project_id, "device-auth"),
                TVM_SERVICE_ACCOUNT => self.service_account(project_id, "tvm"),
                VERTEX_AI_SERVICE_ACCOUNT => self.service_account(project_id, "vertex-ai"),
                other => {
                    tracing::warn!("No recovery strategy for output {}", other);
                    continue;
                }
            };

            let verb = if value.is_placeholder() {
                "Placeholder set for"
            } else {
                "Recovered"
            };
            progress.stage("recovery", format!("{} {} ({})", verb, field, value.origin));
            recovered.insert(field, value);
        }

        recovered
    }

    async fn recover_gateway_url(&self, project_id: &str, progress: &ProgressSink) -> OutputValue {
        let attempts = self.config.gateway_poll_attempts.max(1);
        let interval = self.config.gateway_poll_interval;

        for attempt in 1..=attempts {
            match self
                .query
                .find_gateway_hostname(project_id, &self.solution_prefix)
                .await
            {
                Ok(Some(hostname)) if !hostname.trim().is_empty() => {
                    let hostname = hostname.trim().trim_start_matches("https://");
                    tracing::info!("Found API Gateway hostname {} on attempt {}", hostname, attempt);
                    return OutputValue::new(format!("https://{}", hostname))
                        .with_origin(OutputOrigin::Discovered);
                }
                Ok(_) => tracing::debug!("Gateway has no hostname yet (attempt {})", attempt),
                Err(e) => tracing::debug!("Gateway lookup failed on attempt {}: {}", attempt, e),
            }

            if attempt < attempts {
                let elapsed = interval * attempt;
                let remaining = interval * (attempts - attempt);
                progress.stage(
                    "recovery",
                    format!(
                        "Waiting for API Gateway hostname: attempt {}/{}, {:.1} min elapsed, {:.1} min remaining",
                        attempt,
                        attempts,
                        elapsed.as_secs_f64() / 60.0,
                        remaining.as_secs_f64() / 60.0
                    ),
                );
                tokio::time::sleep(interval).await;
            }
        }

        let placeholder = gateway_placeholder(project_id);
        tracing::warn!(
            "API Gateway hostname not available after {} attempts; using placeholder {}",
            attempts,
            placeholder
        );
        OutputValue::new(placeholder).with_origin(OutputOrigin::Placeholder)
    }

    async fn recover_api_key(&self, project_id: &str) -> OutputValue {
        let name_prefix = format!("{}-api-key", self.solution_prefix);
        match self.query.find_api_key(project_id, &name_prefix).await {
            Ok(Some(key)) => {
                return OutputValue::new(key)
                    .sensitive(true)
                    .with_origin(OutputOrigin::Discovered);
            }
            Ok(None) => tracing::warn!("No API key named {}* found", name_prefix),
            Err(e) => tracing::warn!("API key lookup failed: {}", e),
        }
        OutputValue::new(API_KEY_PLACEHOLDER)
            .sensitive(true)
            .with_origin(OutputOrigin::Placeholder)
    }

    fn service_account(&self, project_id: &str, name: &str) -> OutputValue {
        OutputValue::new(format!(
            "{}-{}-sa@{}.{}",
            self.solution_prefix, name, project_id, self.config.service_account_domain
        ))
        .with_origin(OutputOrigin::Derived)
    }

    async fn recover_workload_identity(&self, project_id: &str) -> OutputValue {
        let pool = format!("{}-wi-pool", self.solution_prefix);
        let provider = format!("{}-wi-provider", self.solution_prefix);

        match self
            .query
            .find_workload_identity_provider(project_id, &pool, &provider)
            .await
        {
            Ok(Some(name)) => {
                return OutputValue::new(name).with_origin(OutputOrigin::Discovered);
            }
            Ok(None) => tracing::debug!("Workload identity provider {} not found", provider),
            Err(e) => tracing::debug!("Workload identity lookup failed: {}", e),
        }

        let number = match self.query.project_number(project_id).await {
            Ok(Some(number)) => Some(number),
            Ok(None) => None,
            Err(e) => {
                tracing::debug!("Project number lookup failed: {}", e);
                None
            }
        };
        let origin = if number.is_some() {
            OutputOrigin::Derived
        } else {
            OutputOrigin::Placeholder
        };
        let path = format!(
            "projects/{}/locations/global/workloadIdentityPools/{}/providers/{}",
            number.as_deref().unwrap_or("0"),
            pool,
            provider
        );
        tracing::warn!(
            "Workload identity provider reconstructed as {}; verify it manually",
            path
        );
        OutputValue::new(path).with_origin(origin)
    }

    fn recover_firebase_config(&self, project_id: &str, current: &OutputSet) -> OutputValue {
        // a key recovered earlier in this pass beats the console placeholder
        let api_key = current
            .get(API_KEY)
            .filter(|v| !v.is_placeholder())
            .and_then(|v| v.as_str())
            .filter(|k| !k.is_empty())
            .unwrap_or(CONSOLE_PLACEHOLDER);

        let config: Value = json!({
            "apiKey": api_key,
            "authDomain": format!("{}.firebaseapp.com", project_id),
            "projectId": project_id,
            "storageBucket": format!("{}.appspot.com", project_id),
            "messagingSenderId": CONSOLE_PLACEHOLDER,
            "appId": CONSOLE_PLACEHOLDER,
        });
        tracing::warn!(
            "Firebase config partially reconstructed for {}; fill in the remaining values from the console",
            project_id
        );
        OutputValue::new(config)
            .sensitive(true)
            .with_origin(OutputOrigin::Placeholder)
    }
}
