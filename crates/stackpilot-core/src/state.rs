//! Persisted deployment state
//!
//! One `DeploymentState` record per `(project_id, solution_prefix)`, written
//! as pretty JSON after every step transition so an interrupted deployment
//! can pick up where it stopped.

use crate::error::{ProvisionError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Age in seconds after which a deployment lock is considered abandoned
const STALE_LOCK_SECS: u64 = 3600;

/// Lifecycle status of a single step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StepStatus::InProgress)
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepStatus::InProgress => write!(f, "in_progress"),
            StepStatus::Completed => write!(f, "completed"),
            StepStatus::Failed => write!(f, "failed"),
            StepStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// What a finished step left behind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Result(String),
    Error(String),
    Reason(String),
}

/// Record of one step within a deployment attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub name: String,
    pub status: StepStatus,
    pub start_time: DateTime<Utc>,

    /// Absent while the step is in progress
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub outcome: Option<StepOutcome>,
}

impl StepRecord {
    pub fn started(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: StepStatus::InProgress,
            start_time: Utc::now(),
            end_time: None,
            outcome: None,
        }
    }

    pub(crate) fn finish(&mut self, status: StepStatus, outcome: StepOutcome) {
        self.status = status;
        self.end_time = Some(Utc::now());
        self.outcome = Some(outcome);
    }
}

/// State of one deployment attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentState {
    pub project_id: String,
    pub solution_prefix: String,
    pub start_time: DateTime<Utc>,

    #[serde(default)]
    pub resumed_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub current_step: Option<String>,

    /// Step id -> record
    #[serde(default)]
    pub steps: BTreeMap<String, StepRecord>,

    #[serde(default)]
    pub completed_steps: Vec<String>,

    #[serde(default)]
    pub failed_steps: Vec<String>,

    #[serde(default)]
    pub skipped_steps: Vec<String>,
}

impl DeploymentState {
    pub fn new(project_id: impl Into<String>, solution_prefix: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            solution_prefix: solution_prefix.into(),
            start_time: Utc::now(),
            resumed_at: None,
            current_step: None,
            steps: BTreeMap::new(),
            completed_steps: Vec::new(),
            failed_steps: Vec::new(),
            skipped_steps: Vec::new(),
        }
    }

    /// Whether this record belongs to the given deployment key
    pub fn matches(&self, project_id: &str, solution_prefix: &str) -> bool {
        self.project_id == project_id && self.solution_prefix == solution_prefix
    }

    pub fn status_of(&self, id: &str) -> Option<StepStatus> {
        self.steps.get(id).map(|r| r.status)
    }

    /// Whether the step sits in one of the three terminal collections
    pub fn is_finished(&self, id: &str) -> bool {
        self.completed_steps.iter().any(|s| s == id)
            || self.failed_steps.iter().any(|s| s == id)
            || self.skipped_steps.iter().any(|s| s == id)
    }

    pub(crate) fn push_terminal(&mut self, id: &str, status: StepStatus) {
        let list = match status {
            StepStatus::Completed => &mut self.completed_steps,
            StepStatus::Failed => &mut self.failed_steps,
            StepStatus::Skipped => &mut self.skipped_steps,
            StepStatus::InProgress => return,
        };
        list.push(id.to_string());
        if self.current_step.as_deref() == Some(id) {
            self.current_step = None;
        }
    }
}

/// Reads and writes a `DeploymentState` file at a caller-chosen path
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Conventional location for a deployment's state inside `state_dir`
    pub fn for_deployment(
        state_dir: impl AsRef<Path>,
        project_id: &str,
        solution_prefix: &str,
    ) -> Self {
        Self::new(
            state_dir
                .as_ref()
                .join(format!("{}-{}.json", project_id, solution_prefix)),
        )
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn backup_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(".backup");
        PathBuf::from(name)
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(".lock");
        PathBuf::from(name)
    }

    async fn ensure_parent(&self) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                fs::create_dir_all(dir).await?;
                tracing::debug!("Created state directory: {}", dir.display());
            }
        }
        Ok(())
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(".tmp");
        PathBuf::from(name)
    }

    /// Load the persisted state, `None` when no file exists.
    ///
    /// Falls back to the backup when the state file is missing or unreadable,
    /// which is what a crash in the middle of `save` leaves behind.
    pub async fn load(&self) -> Result<Option<DeploymentState>> {
        let backup = self.backup_path();
        match read_state(&self.path).await {
            Ok(Some(state)) => return Ok(Some(state)),
            Ok(None) => {}
            Err(e) if backup.exists() => {
                tracing::warn!(
                    "State file {} is unreadable ({}), trying backup",
                    self.path.display(),
                    e
                );
            }
            Err(e) => return Err(e),
        }

        let state = read_state(&backup).await?;
        if state.is_some() {
            tracing::warn!("Recovered deployment state from {}", backup.display());
        }
        Ok(state)
    }

    /// Write the state, keeping the previous file as a backup.
    ///
    /// The new content goes to a temporary file that is renamed over the
    /// state file, so there is always a complete state or backup on disk.
    pub async fn save(&self, state: &DeploymentState) -> Result<()> {
        self.ensure_parent().await?;

        let content = serde_json::to_string_pretty(state)?;
        let tmp = self.tmp_path();
        fs::write(&tmp, content).await?;

        if self.path.exists() {
            fs::copy(&self.path, self.backup_path()).await?;
        }
        fs::rename(&tmp, &self.path).await?;

        tracing::debug!(
            "Saved state with {} step records to {}",
            state.steps.len(),
            self.path.display()
        );
        Ok(())
    }

    /// Delete the state file and its backup
    pub async fn remove(&self) -> Result<()> {
        for path in [self.path.clone(), self.backup_path(), self.tmp_path()] {
            if path.exists() {
                fs::remove_file(&path).await?;
            }
        }
        tracing::debug!("Removed state {}", self.path.display());
        Ok(())
    }

    /// Take the per-deployment lock so two runs cannot mutate the same record.
    ///
    /// The lock file is created exclusively; a lock older than
    /// `STALE_LOCK_SECS` is replaced once.
    pub async fn acquire_lock(&self) -> Result<StateLock> {
        self.ensure_parent().await?;

        let lock_path = self.lock_path();
        let info = LockInfo {
            holder: std::env::var("HOSTNAME")
                .or_else(|_| std::env::var("HOST"))
                .unwrap_or_else(|_| "unknown".to_string()),
            pid: std::process::id(),
            acquired_at: Utc::now(),
        };
        let content = serde_json::to_string_pretty(&info)?;

        for attempt in 0..2 {
            let created = fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_path)
                .await;
            match created {
                Ok(mut file) => {
                    file.write_all(content.as_bytes()).await?;
                    file.flush().await?;
                    tracing::debug!("Acquired deployment lock {}", lock_path.display());
                    return Ok(StateLock {
                        lock_path,
                        released: false,
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists && attempt == 0 => {
                    check_stale_lock(&lock_path).await?;
                    match fs::remove_file(&lock_path).await {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    return Err(ProvisionError::State(format!(
                        "Deployment is locked ({})",
                        lock_path.display()
                    )));
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(ProvisionError::State(format!(
            "Deployment is locked ({})",
            lock_path.display()
        )))
    }
}

async fn read_state(path: &Path) -> Result<Option<DeploymentState>> {
    if !path.exists() {
        tracing::debug!("State file {} not found", path.display());
        return Ok(None);
    }

    let content = fs::read_to_string(path).await?;
    let state: DeploymentState = serde_json::from_str(&content)?;
    tracing::debug!(
        "Loaded state with {} step records from {}",
        state.steps.len(),
        path.display()
    );
    Ok(Some(state))
}

/// Fails while the existing lock is fresh; Ok means it may be replaced
async fn check_stale_lock(lock_path: &Path) -> Result<()> {
    let content = fs::read_to_string(lock_path).await.unwrap_or_default();
    match serde_json::from_str::<LockInfo>(&content) {
        Ok(info) => {
            let age = Utc::now().signed_duration_since(info.acquired_at);
            if age.num_seconds() < STALE_LOCK_SECS as i64 {
                return Err(ProvisionError::State(format!(
                    "Deployment is locked by {} (pid {}) since {}",
                    info.holder, info.pid, info.acquired_at
                )));
            }
            tracing::warn!("Removing stale lock held by {} (pid {})", info.holder, info.pid);
        }
        Err(e) => {
            // The holder may still be writing it
            let modified = fs::metadata(lock_path).await.and_then(|m| m.modified());
            let fresh = modified
                .ok()
                .and_then(|t| t.elapsed().ok())
                .is_none_or(|age| age.as_secs() < STALE_LOCK_SECS);
            if fresh {
                return Err(ProvisionError::State(format!(
                    "Deployment is locked ({})",
                    lock_path.display()
                )));
            }
            tracing::warn!("Replacing unreadable lock file: {}", e);
        }
    }
    Ok(())
}

#[derive(Debug, Serialize, Deserialize)]
struct LockInfo {
    holder: String,
    #[serde(default)]
    pid: u32,
    acquired_at: DateTime<Utc>,
}

/// RAII guard for a deployment lock
pub struct StateLock {
    lock_path: PathBuf,
    released: bool,
}

impl StateLock {
    pub async fn release(mut self) -> Result<()> {
        if !self.released {
            if self.lock_path.exists() {
                fs::remove_file(&self.lock_path).await?;
                tracing::debug!("Released deployment lock");
            }
            self.released = true;
        }
        Ok(())
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        if !self.released && self.lock_path.exists() {
            let _ = std::fs::remove_file(&self.lock_path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_state_save_load() {
        let temp_dir = tempdir().unwrap();
        let store = StateStore::for_deployment(temp_dir.path(), "demo-project", "anava");

        let mut state = DeploymentState::new("demo-project", "anava");
        let mut record = StepRecord::started("Enable APIs");
        record.finish(StepStatus::Completed, StepOutcome::Result("ok".into()));
        state.steps.insert("enable_apis".into(), record);
        state.push_terminal("enable_apis", StepStatus::Completed);

        store.save(&state).await.unwrap();
        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded, state);
        assert!(store.path().ends_with("demo-project-anava.json"));
    }

    #[tokio::test]
    async fn test_missing_state() {
        let temp_dir = tempdir().unwrap();
        let store = StateStore::new(temp_dir.path().join("nope.json"));
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_keeps_backup() {
        let temp_dir = tempdir().unwrap();
        let store = StateStore::new(temp_dir.path().join("state.json"));
        let state = DeploymentState::new("p", "x");

        store.save(&state).await.unwrap();
        store.save(&state).await.unwrap();
        assert!(temp_dir.path().join("state.json.backup").exists());

        store.remove().await.unwrap();
        assert!(store.load().await.unwrap().is_none());
        assert!(!temp_dir.path().join("state.json.backup").exists());
    }

    #[tokio::test]
    async fn test_lock_is_exclusive() {
        let temp_dir = tempdir().unwrap();
        let store = StateStore::new(temp_dir.path().join("state.json"));

        let lock = store.acquire_lock().await.unwrap();
        assert!(store.acquire_lock().await.is_err());
        lock.release().await.unwrap();
        assert!(store.acquire_lock().await.is_ok());
    }

    #[tokio::test]
    async fn test_load_falls_back_to_backup() {
        let temp_dir = tempdir().unwrap();
        let store = StateStore::new(temp_dir.path().join("state.json"));

        let first = DeploymentState::new("p", "x");
        let mut second = first.clone();
        second.current_step = Some("enable_apis".into());
        store.save(&first).await.unwrap();
        store.save(&second).await.unwrap();

        // A crash between the backup copy and the rename
        std::fs::remove_file(store.path()).unwrap();
        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded, first);

        std::fs::write(store.path(), "{ truncated").unwrap();
        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded, first);
    }

    #[tokio::test]
    async fn test_save_leaves_no_temp_file() {
        let temp_dir = tempdir().unwrap();
        let store = StateStore::new(temp_dir.path().join("state.json"));
        store.save(&DeploymentState::new("p", "x")).await.unwrap();

        assert!(store.path().exists());
        assert!(!temp_dir.path().join("state.json.tmp").exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_lock_has_one_winner() {
        let temp_dir = tempdir().unwrap();
        let store = StateStore::new(temp_dir.path().join("state.json"));

        let a = tokio::spawn({
            let store = store.clone();
            async move { store.acquire_lock().await }
        });
        let b = tokio::spawn({
            let store = store.clone();
            async move { store.acquire_lock().await }
        });
        let (a, b) = (a.await.unwrap(), b.await.unwrap());

        assert!(a.is_ok() != b.is_ok());
    }

    #[tokio::test]
    async fn test_stale_lock_is_replaced() {
        let temp_dir = tempdir().unwrap();
        let store = StateStore::new(temp_dir.path().join("state.json"));
        let stale = LockInfo {
            holder: "crashed-host".into(),
            pid: 42,
            acquired_at: Utc::now() - chrono::TimeDelta::hours(2),
        };
        std::fs::write(
            temp_dir.path().join("state.json.lock"),
            serde_json::to_string(&stale).unwrap(),
        )
        .unwrap();

        let lock = store.acquire_lock().await.unwrap();
        assert!(store.acquire_lock().await.is_err());
        lock.release().await.unwrap();
    }

    #[test]
    fn test_end_time_absent_while_in_progress() {
        let record = StepRecord::started("x");
        assert_eq!(record.status, StepStatus::InProgress);
        assert!(record.end_time.is_none());
        assert!(!record.status.is_terminal());
    }
}
