//! Per-deployment working directory
//!
//! Each `(project_id, solution_prefix)` pair gets its own copy of the module
//! template. The directory name is stable, so a resumed deployment finds the
//! engine's local state from the previous run.

use crate::error::{Result, TerraformError};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

pub const VARS_FILE: &str = "terraform.tfvars.json";

/// Entries of the template that belong to a previous engine run, not the module
const SKIPPED_ENTRIES: &[&str] = &[
    ".terraform",
    "terraform.tfstate",
    "terraform.tfstate.backup",
    "tfplan",
    VARS_FILE,
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkingDirectory {
    path: PathBuf,
}

impl WorkingDirectory {
    /// `<work_root>/<project_id>-<solution_prefix>`
    pub fn for_deployment(work_root: &Path, project_id: &str, solution_prefix: &str) -> Self {
        Self {
            path: work_root.join(format!("{}-{}", project_id, solution_prefix)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn vars_file(&self) -> PathBuf {
        self.path.join(VARS_FILE)
    }

    pub fn exists(&self) -> bool {
        self.path.is_dir()
    }

    /// Copy the module template in and write the variables file
    pub async fn materialize(&self, module_source: &Path, variables: &Map<String, Value>) -> Result<()> {
        ensure_module(module_source).await?;

        tokio::fs::create_dir_all(&self.path).await?;
        copy_tree(module_source, &self.path).await?;

        let json = serde_json::to_string_pretty(&Value::Object(variables.clone()))?;
        tokio::fs::write(self.vars_file(), json).await?;

        tracing::debug!(
            "Materialized module {} into {}",
            module_source.display(),
            self.path.display()
        );
        Ok(())
    }

    pub async fn remove(&self) -> Result<()> {
        if self.exists() {
            tokio::fs::remove_dir_all(&self.path).await?;
        }
        Ok(())
    }
}

/// The template must be a directory holding at least one `.tf` file
async fn ensure_module(module_source: &Path) -> Result<()> {
    if !module_source.is_dir() {
        return Err(TerraformError::ModuleNotFound(module_source.to_path_buf()));
    }

    let mut entries = tokio::fs::read_dir(module_source).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "tf") {
            return Ok(());
        }
    }
    Err(TerraformError::ModuleNotFound(module_source.to_path_buf()))
}

async fn copy_tree(from: &Path, to: &Path) -> Result<()> {
    let mut pending = vec![(from.to_path_buf(), to.to_path_buf())];

    while let Some((src, dest)) = pending.pop() {
        tokio::fs::create_dir_all(&dest).await?;
        let mut entries = tokio::fs::read_dir(&src).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if SKIPPED_ENTRIES.iter().any(|s| name == *s) {
                continue;
            }
            let target = dest.join(&name);
            if entry.file_type().await?.is_dir() {
                pending.push((entry.path(), target));
            } else {
                tokio::fs::copy(entry.path(), target).await?;
            }
        }
    }
    Ok(())
}
