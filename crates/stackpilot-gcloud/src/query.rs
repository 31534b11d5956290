//! `CloudQuery` implementation backed by the gcloud CLI

use crate::gcloud::Gcloud;
use async_trait::async_trait;
use stackpilot_core::CloudQuery;

#[async_trait]
impl CloudQuery for Gcloud {
    async fn find_gateway_hostname(
        &self,
        project_id: &str,
        solution_prefix: &str,
    ) -> stackpilot_core::Result<Option<String>> {
        Ok(self.gateway_hostname(project_id, solution_prefix).await?)
    }

    async fn find_api_key(
        &self,
        project_id: &str,
        name_prefix: &str,
    ) -> stackpilot_core::Result<Option<String>> {
        let keys = self.list_api_keys(project_id).await?;
        let Some(key) = keys.into_iter().find(|k| {
            k.display_name
                .as_deref()
                .is_some_and(|name| name.starts_with(name_prefix))
        }) else {
            return Ok(None);
        };

        tracing::debug!("Found API key {}", key.name);
        Ok(Some(self.api_key_string(project_id, &key.name).await?))
    }

    async fn find_workload_identity_provider(
        &self,
        project_id: &str,
        pool_id: &str,
        provider_id: &str,
    ) -> stackpilot_core::Result<Option<String>> {
        let provider = self
            .describe_workload_identity_provider(project_id, pool_id, provider_id)
            .await?;
        Ok(provider.map(|p| p.name))
    }

    async fn project_number(&self, project_id: &str) -> stackpilot_core::Result<Option<String>> {
        let project = self.describe_project(project_id).await?;
        Ok(project.map(|p| p.project_number))
    }
}
