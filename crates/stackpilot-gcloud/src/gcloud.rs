//! gcloud CLI wrapper
//!
//! Read-only gcloud calls used to recover deployment outputs.

use crate::error::{GcloudError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;

/// gcloud CLI wrapper
#[derive(Debug, Clone)]
pub struct Gcloud {
    binary: PathBuf,
    account: Option<String>,
    access_token_file: Option<PathBuf>,
}

impl Default for Gcloud {
    fn default() -> Self {
        Self::new()
    }
}

impl Gcloud {
    pub fn new() -> Self {
        Self {
            binary: PathBuf::from("gcloud"),
            account: None,
            access_token_file: None,
        }
    }

    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Run every command as this account instead of the active one
    pub fn with_account(mut self, account: impl Into<String>) -> Self {
        self.account = Some(account.into());
        self
    }

    /// Authenticate with an OAuth access token read from a file
    pub fn with_access_token_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.access_token_file = Some(path.into());
        self
    }

    /// Run a gcloud command and return stdout
    async fn run_command(&self, args: &[&str]) -> Result<String> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args);
        if let Some(ref account) = self.account {
            cmd.arg(format!("--account={}", account));
        }
        if let Some(ref token_file) = self.access_token_file {
            cmd.arg(format!("--access-token-file={}", token_file.display()));
        }
        cmd.arg("--quiet");
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        tracing::debug!("Running: gcloud {}", args.join(" "));

        let output = cmd.output().await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => GcloudError::GcloudNotFound,
            _ => GcloudError::IoError(e),
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(GcloudError::CommandFailed(stderr.trim().to_string()));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Like `run_command`, but a missing resource is `None`
    async fn describe(&self, args: &[&str]) -> Result<Option<String>> {
        match self.run_command(args).await {
            Ok(output) => Ok(Some(output)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    // ========== API Gateway ==========

    pub async fn list_gateways(&self, project_id: &str) -> Result<Vec<GatewayInfo>> {
        let project = format!("--project={}", project_id);
        let output = self
            .run_command(&["api-gateway", "gateways", "list", "--format=json", &project])
            .await?;
        parse_list(&output)
    }

    pub async fn describe_gateway(
        &self,
        project_id: &str,
        gateway_id: &str,
        location: &str,
    ) -> Result<Option<GatewayInfo>> {
        let project = format!("--project={}", project_id);
        let location = format!("--location={}", location);
        let output = self
            .describe(&[
                "api-gateway",
                "gateways",
                "describe",
                gateway_id,
                &location,
                &project,
                "--format=json",
            ])
            .await?;

        match output {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    /// Hostname of the first gateway whose id starts with `prefix`.
    /// The project segment of the resource name is never matched.
    pub async fn gateway_hostname(&self, project_id: &str, prefix: &str) -> Result<Option<String>> {
        let gateways = self.list_gateways(project_id).await?;
        let Some(gateway) = gateways.into_iter().find(|g| g.id().starts_with(prefix)) else {
            tracing::debug!("No gateway matching '{}' in {}", prefix, project_id);
            return Ok(None);
        };

        if let Some(hostname) = gateway.hostname() {
            return Ok(Some(hostname.to_string()));
        }

        let Some(location) = gateway.location() else {
            return Ok(None);
        };
        let details = self
            .describe_gateway(project_id, gateway.id(), location)
            .await?;
        Ok(details.and_then(|g| g.hostname().map(String::from)))
    }

    // ========== API Keys ==========

    pub async fn list_api_keys(&self, project_id: &str) -> Result<Vec<ApiKeyInfo>> {
        let project = format!("--project={}", project_id);
        let output = self
            .run_command(&["services", "api-keys", "list", "--format=json", &project])
            .await?;
        parse_list(&output)
    }

    pub async fn api_key_string(&self, project_id: &str, key_name: &str) -> Result<String> {
        let project = format!("--project={}", project_id);
        let output = self
            .run_command(&[
                "services",
                "api-keys",
                "get-key-string",
                key_name,
                "--format=json",
                &project,
            ])
            .await?;
        let key: KeyString = serde_json::from_str(&output)?;
        Ok(key.key_string)
    }

    // ========== IAM / Projects ==========

    pub async fn describe_workload_identity_provider(
        &self,
        project_id: &str,
        pool_id: &str,
        provider_id: &str,
    ) -> Result<Option<ProviderInfo>> {
        let project = format!("--project={}", project_id);
        let pool = format!("--workload-identity-pool={}", pool_id);
        let output = self
            .describe(&[
                "iam",
                "workload-identity-pools",
                "providers",
                "describe",
                provider_id,
                &pool,
                "--location=global",
                &project,
                "--format=json",
            ])
            .await?;

        match output {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    pub async fn describe_project(&self, project_id: &str) -> Result<Option<ProjectInfo>> {
        let output = self
            .describe(&["projects", "describe", project_id, "--format=json"])
            .await?;

        match output {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }
}

fn parse_list<T: for<'de> Deserialize<'de>>(output: &str) -> Result<Vec<T>> {
    if output.trim().is_empty() || output.trim() == "[]" {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_str(output)?)
}

/// API Gateway gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayInfo {
    /// `projects/<p>/locations/<location>/gateways/<id>`
    pub name: String,

    #[serde(default)]
    pub default_hostname: Option<String>,

    #[serde(default)]
    pub state: Option<String>,
}

impl GatewayInfo {
    pub fn id(&self) -> &str {
        self.name.rsplit('/').next().unwrap_or(&self.name)
    }

    pub fn location(&self) -> Option<&str> {
        self.name.split('/').nth(3)
    }

    /// A gateway still being created reports an empty hostname
    pub fn hostname(&self) -> Option<&str> {
        self.default_hostname
            .as_deref()
            .map(str::trim)
            .filter(|h| !h.is_empty())
    }
}

/// API key metadata (the key string is fetched separately)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyInfo {
    pub name: String,

    #[serde(default)]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KeyString {
    key_string: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderInfo {
    /// Full resource name
    pub name: String,

    #[serde(default)]
    pub state: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectInfo {
    pub project_id: String,
    pub project_number: String,
}
