//! Cloud platform query abstraction
//!
//! The recovery engine only needs a handful of read calls against the cloud
//! platform. How they are transported (CLI, REST) is up to the implementation.

use crate::error::Result;
use async_trait::async_trait;

#[async_trait]
pub trait CloudQuery: Send + Sync {
    /// Default hostname of the gateway whose name contains `solution_prefix`,
    /// `None` while the gateway has no routable hostname yet
    async fn find_gateway_hostname(
        &self,
        project_id: &str,
        solution_prefix: &str,
    ) -> Result<Option<String>>;

    /// Key string of the first API key whose display name starts with `name_prefix`
    async fn find_api_key(&self, project_id: &str, name_prefix: &str) -> Result<Option<String>>;

    /// Full resource name of a workload identity provider
    async fn find_workload_identity_provider(
        &self,
        project_id: &str,
        pool_id: &str,
        provider_id: &str,
    ) -> Result<Option<String>>;

    async fn project_number(&self, project_id: &str) -> Result<Option<String>>;
}
