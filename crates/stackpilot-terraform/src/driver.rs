//! terraform CLI driver
//!
//! Runs the terraform binary inside a per-deployment working directory and
//! streams its output as progress events while it runs.

use crate::error::{Result, TerraformError};
use crate::workdir::WorkingDirectory;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use stackpilot_core::classify::{
    classify_stdout_line, is_already_exists, is_suppressed_stderr, is_transient_error,
    synthesize_failure,
};
use stackpilot_core::{Channel, InfraEngine, OutputSet, PlanOutcome, ProgressEvent, ProgressSink};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

const DEFAULT_BINARY: &str = "terraform";

const PLAN_ARGS: &[&str] = &["plan", "-no-color", "-input=false", "-out=tfplan"];

/// Drift check inside a refresh cycle. Targeted applies never consume a
/// saved plan, and the state was refreshed just before.
const REPLAN_ARGS: &[&str] = &["plan", "-no-color", "-input=false", "-refresh=false"];

/// How hard `apply` tries before giving up
///
/// The ladder is: one attempt, `bare_retries` plain retries, then for each
/// refresh cycle a `refresh` and a fresh `plan` before attempting again.
/// A transient backend failure (503, 429, connection reset) waits
/// `transient_backoff` times the number of attempts made so far.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyRetryConfig {
    pub bare_retries: u32,
    pub refresh_cycles: u32,
    #[serde(with = "duration_secs")]
    pub retry_delay: Duration,
    #[serde(with = "duration_secs")]
    pub transient_backoff: Duration,
}

impl Default for ApplyRetryConfig {
    fn default() -> Self {
        Self {
            bare_retries: 1,
            refresh_cycles: 1,
            retry_delay: Duration::ZERO,
            transient_backoff: Duration::from_secs(10),
        }
    }
}

impl ApplyRetryConfig {
    /// Total number of apply attempts the ladder makes
    pub fn max_attempts(&self) -> u32 {
        1 + self.bare_retries + self.refresh_cycles
    }

    /// Pause before `attempt` (the first retry is attempt 2)
    pub fn delay_before(&self, attempt: u32, transient: bool) -> Duration {
        if transient {
            self.transient_backoff * attempt.saturating_sub(1)
        } else {
            self.retry_delay
        }
    }
}

/// Wall-clock limits per terraform subcommand
///
/// A command over its limit is interrupted like `stop()` would, and fails
/// with `Timeout`. `stop_grace` is how long an interrupted terraform gets to
/// release its state lock before it is killed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandTimeouts {
    #[serde(with = "duration_secs")]
    pub init: Duration,
    #[serde(with = "duration_secs")]
    pub plan: Duration,
    #[serde(with = "duration_secs")]
    pub apply: Duration,
    #[serde(with = "duration_secs")]
    pub stop_grace: Duration,
}

impl Default for CommandTimeouts {
    fn default() -> Self {
        Self {
            init: Duration::from_secs(300),
            plan: Duration::from_secs(600),
            apply: Duration::from_secs(2400),
            stop_grace: Duration::from_secs(10),
        }
    }
}

impl CommandTimeouts {
    /// `refresh` and `destroy` touch every resource, so they share the apply limit
    pub fn limit_for(&self, subcommand: &str) -> Duration {
        match subcommand {
            "plan" => self.plan,
            "apply" | "refresh" | "destroy" => self.apply,
            _ => self.init,
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

/// `terraform version -json`
#[derive(Debug, Clone, Deserialize)]
pub struct TerraformVersion {
    pub terraform_version: String,
    #[serde(default)]
    pub platform: Option<String>,
}

#[derive(Debug, Default)]
struct ActiveSlot {
    busy: bool,
    stop_requested: bool,
    cancel: Option<oneshot::Sender<()>>,
}

fn lock(slot: &Mutex<ActiveSlot>) -> MutexGuard<'_, ActiveSlot> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Holds the driver's slot for one public operation, including every
/// subprocess an apply ladder spawns
struct OperationGuard<'a> {
    slot: &'a Mutex<ActiveSlot>,
}

impl Drop for OperationGuard<'_> {
    fn drop(&mut self) {
        *lock(self.slot) = ActiveSlot::default();
    }
}

/// Drives one deployment's terraform working directory
pub struct TerraformDriver {
    binary: PathBuf,
    module_source: PathBuf,
    work_root: PathBuf,
    solution_prefix: String,
    region: String,
    variables: Map<String, Value>,
    env: Vec<(String, String)>,
    retry: ApplyRetryConfig,
    timeouts: CommandTimeouts,
    fatal_patterns: Vec<String>,
    work_dir: Option<WorkingDirectory>,
    slot: Mutex<ActiveSlot>,
}

impl TerraformDriver {
    pub fn new(
        module_source: impl Into<PathBuf>,
        work_root: impl Into<PathBuf>,
        solution_prefix: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        Self {
            binary: PathBuf::from(DEFAULT_BINARY),
            module_source: module_source.into(),
            work_root: work_root.into(),
            solution_prefix: solution_prefix.into(),
            region: region.into(),
            variables: Map::new(),
            env: Vec::new(),
            retry: ApplyRetryConfig::default(),
            timeouts: CommandTimeouts::default(),
            fatal_patterns: Vec::new(),
            work_dir: None,
            slot: Mutex::new(ActiveSlot::default()),
        }
    }

    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Extra module variable written to `terraform.tfvars.json`
    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }

    /// Environment passed to every terraform process (credentials etc.)
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_retry_config(mut self, retry: ApplyRetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn retry_config(&self) -> &ApplyRetryConfig {
        &self.retry
    }

    pub fn with_timeouts(mut self, timeouts: CommandTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn timeouts(&self) -> &CommandTimeouts {
        &self.timeouts
    }

    /// Apply failures containing any of these (case-insensitive) need a
    /// human and are never retried
    pub fn with_fatal_patterns<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fatal_patterns.extend(patterns.into_iter().map(|p| {
            let pattern: String = p.into();
            pattern.to_lowercase()
        }));
        self
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    pub fn working_directory(&self) -> Option<&WorkingDirectory> {
        self.work_dir.as_ref()
    }

    /// Whether a terraform command is in flight
    pub fn is_busy(&self) -> bool {
        lock(&self.slot).busy
    }

    /// Prepare `<work_root>/<project_id>-<solution_prefix>` from the module template
    pub async fn initialize(&mut self, project_id: &str) -> Result<WorkingDirectory> {
        let dir = WorkingDirectory::for_deployment(&self.work_root, project_id, &self.solution_prefix);

        let mut variables = self.variables.clone();
        variables.insert("project_id".into(), project_id.into());
        variables.insert("region".into(), self.region.clone().into());
        variables.insert("solution_prefix".into(), self.solution_prefix.clone().into());

        dir.materialize(&self.module_source, &variables).await?;
        tracing::info!("Working directory ready: {}", dir.path().display());

        self.work_dir = Some(dir.clone());
        Ok(dir)
    }

    /// Remove the working directory, engine state included
    pub async fn cleanup(&mut self) -> Result<()> {
        if let Some(dir) = self.work_dir.take() {
            dir.remove().await?;
            tracing::info!("Removed working directory {}", dir.path().display());
        }
        Ok(())
    }

    /// Interrupt the in-flight terraform process: SIGINT first, SIGKILL once
    /// the stop grace period runs out. Its pending call fails with
    /// `Terminated`. Returns `false` when nothing was running.
    pub fn stop(&self) -> bool {
        let mut slot = lock(&self.slot);
        if !slot.busy {
            return false;
        }
        slot.stop_requested = true;
        if let Some(cancel) = slot.cancel.take() {
            let _ = cancel.send(());
        }
        tracing::info!("Stop requested for running terraform command");
        true
    }

    pub async fn version(&self) -> Result<TerraformVersion> {
        let _guard = self.begin()?;
        let dir = self.work_dir.as_ref().map(|d| d.path());
        let output = self
            .exec(dir, &["version", "-json"], &ProgressSink::discard())
            .await?;
        Ok(serde_json::from_str(&output)?)
    }

    pub async fn refresh(&self, progress: &ProgressSink) -> Result<String> {
        let _guard = self.begin()?;
        self.refresh_inner(progress).await
    }

    fn begin(&self) -> Result<OperationGuard<'_>> {
        let mut slot = lock(&self.slot);
        if slot.busy {
            return Err(TerraformError::AlreadyRunning);
        }
        slot.busy = true;
        Ok(OperationGuard { slot: &self.slot })
    }

    async fn refresh_inner(&self, progress: &ProgressSink) -> Result<String> {
        self.run(&["refresh", "-no-color", "-input=false"], progress)
            .await
    }

    async fn plan_inner(&self, args: &[&str], progress: &ProgressSink) -> Result<PlanOutcome> {
        match self.run(args, progress).await {
            Ok(output) => Ok(PlanOutcome::Planned(output)),
            Err(TerraformError::CommandFailed { message, .. }) if is_already_exists(&message) => {
                tracing::info!("Plan reports existing resources, skipping to outputs");
                Ok(PlanOutcome::SkipToOutputs)
            }
            Err(e) => Err(e),
        }
    }

    async fn apply_once(&self, target: Option<&str>, progress: &ProgressSink) -> Result<String> {
        // Keep the formatted target alive for the borrowed args
        let target_arg = target.map(|t| format!("-target={}", t));
        let mut args = vec!["apply", "-no-color", "-input=false", "-auto-approve"];
        if let Some(ref arg) = target_arg {
            args.push(arg.as_str());
        }
        self.run(&args, progress).await
    }

    async fn apply_with_retries(&self, target: Option<&str>, progress: &ProgressSink) -> Result<String> {
        let max = self.retry.max_attempts();
        let mut attempt = 1;

        let mut last = match self.apply_once(target, progress).await {
            Ok(output) => return Ok(output),
            Err(e) => e,
        };

        for _ in 0..self.retry.bare_retries {
            if !self.is_retryable(&last) {
                return Err(last);
            }
            attempt += 1;
            self.before_retry(attempt, max, &last, progress).await;

            match self.apply_once(target, progress).await {
                Ok(output) => return Ok(output),
                Err(e) => last = e,
            }
        }

        for _ in 0..self.retry.refresh_cycles {
            if !self.is_retryable(&last) {
                return Err(last);
            }
            attempt += 1;
            self.before_retry(attempt, max, &last, progress).await;

            progress.stage("apply", "Refreshing state before retry");
            if let Err(e) = self.refresh_inner(progress).await {
                tracing::warn!("terraform refresh failed, retrying anyway: {}", e);
            }
            if let Err(e) = self.plan_inner(REPLAN_ARGS, progress).await {
                tracing::warn!("terraform plan failed, retrying anyway: {}", e);
            }

            match self.apply_once(target, progress).await {
                Ok(output) => return Ok(output),
                Err(e) => last = e,
            }
        }

        Err(last)
    }

    async fn before_retry(&self, attempt: u32, max: u32, last: &TerraformError, progress: &ProgressSink) {
        tracing::warn!("terraform apply failed, retrying ({}/{}): {}", attempt, max, last);
        let transient = last.message().is_some_and(is_transient_error);
        let delay = self.retry.delay_before(attempt, transient);
        if transient {
            progress.stage(
                "apply",
                format!(
                    "Transient error, retrying apply in {:?} (attempt {}/{})",
                    delay, attempt, max
                ),
            );
        } else {
            progress.stage("apply", format!("Retrying apply (attempt {}/{})", attempt, max));
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    /// Only engine-reported failures are worth another attempt. An existing
    /// resource will still exist next time, and a fatal pattern needs a human.
    fn is_retryable(&self, error: &TerraformError) -> bool {
        let TerraformError::CommandFailed { message, .. } = error else {
            return false;
        };
        if is_already_exists(message) {
            return false;
        }
        let lower = message.to_lowercase();
        !self.fatal_patterns.iter().any(|p| lower.contains(p.as_str()))
    }

    async fn run(&self, args: &[&str], progress: &ProgressSink) -> Result<String> {
        let dir = self.work_dir.as_ref().ok_or(TerraformError::NotInitialized)?;
        self.exec(Some(dir.path()), args, progress).await
    }

    async fn exec(&self, dir: Option<&Path>, args: &[&str], progress: &ProgressSink) -> Result<String> {
        let result = self.spawn_and_wait(dir, args, progress).await;
        lock(&self.slot).cancel = None;
        result
    }

    async fn spawn_and_wait(
        &self,
        dir: Option<&Path>,
        args: &[&str],
        progress: &ProgressSink,
    ) -> Result<String> {
        let subcommand = args.first().copied().unwrap_or_default();

        let (cancel_tx, cancel_rx) = oneshot::channel();
        {
            let mut slot = lock(&self.slot);
            if slot.stop_requested {
                return Err(TerraformError::Terminated);
            }
            slot.cancel = Some(cancel_tx);
        }

        let mut cmd = Command::new(&self.binary);
        cmd.args(args);
        cmd.env("TF_IN_AUTOMATION", "1");
        cmd.envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        if let Some(dir) = dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        tracing::debug!("Running: {} {}", self.binary.display(), args.join(" "));

        let mut child = cmd.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                TerraformError::TerraformNotFound(self.binary.display().to_string())
            }
            _ => TerraformError::IoError(e),
        })?;

        let stdout = tokio::spawn(pump_stdout(child.stdout.take(), progress.clone()));
        let stderr = tokio::spawn(pump_stderr(child.stderr.take(), progress.clone()));

        let limit = self.timeouts.limit_for(subcommand);
        let finished = tokio::select! {
            status = child.wait() => Finished::Exited(status?),
            Ok(()) = cancel_rx => Finished::Cancelled,
            _ = tokio::time::sleep(limit) => Finished::TimedOut,
        };

        let status = match finished {
            Finished::Exited(status) => status,
            Finished::Cancelled => {
                tracing::warn!("Interrupting terraform {}", subcommand);
                terminate(&mut child, self.timeouts.stop_grace).await?;
                stdout.abort();
                stderr.abort();
                return Err(TerraformError::Terminated);
            }
            Finished::TimedOut => {
                tracing::warn!("terraform {} exceeded {}s, interrupting", subcommand, limit.as_secs());
                terminate(&mut child, self.timeouts.stop_grace).await?;
                stdout.abort();
                stderr.abort();
                return Err(TerraformError::Timeout {
                    command: subcommand.to_string(),
                    secs: limit.as_secs(),
                });
            }
        };

        let captured = join_reader(stdout).await?;
        let stderr_lines = join_reader(stderr).await?;

        if status.success() {
            tracing::debug!("terraform {} finished", subcommand);
            return Ok(captured);
        }

        let message = synthesize_failure(&stderr_lines, status.code());
        tracing::debug!("terraform {} failed: {}", subcommand, message);
        Err(TerraformError::CommandFailed {
            command: subcommand.to_string(),
            message,
        })
    }
}

enum Finished {
    Exited(ExitStatus),
    Cancelled,
    TimedOut,
}

/// Stop `child`, killing it if it is still running after `grace`
async fn terminate(child: &mut Child, grace: Duration) -> Result<()> {
    if interrupt(child, grace).await? {
        return Ok(());
    }
    child.kill().await?;
    Ok(())
}

/// Interrupt `child` the way a terminal Ctrl-C would, so terraform can
/// release its state lock. Returns `true` once it has exited.
#[cfg(unix)]
async fn interrupt(child: &mut Child, grace: Duration) -> Result<bool> {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return Ok(false);
    };
    if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGINT) {
        tracing::debug!("Failed to send SIGINT to {}: {}", pid, e);
        return Ok(false);
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => {
            let status = status?;
            tracing::info!("terraform exited after interrupt ({})", status);
            Ok(true)
        }
        Err(_) => {
            tracing::warn!("terraform still running after {}s, sending SIGKILL", grace.as_secs());
            Ok(false)
        }
    }
}

#[cfg(not(unix))]
async fn interrupt(_child: &mut Child, _grace: Duration) -> Result<bool> {
    Ok(false)
}

async fn join_reader<T>(task: JoinHandle<std::io::Result<T>>) -> Result<T> {
    let output = task.await.map_err(std::io::Error::other)??;
    Ok(output)
}

async fn pump_stdout<R: AsyncRead + Unpin>(
    reader: Option<R>,
    progress: ProgressSink,
) -> std::io::Result<String> {
    let mut captured = String::new();
    let Some(reader) = reader else {
        return Ok(captured);
    };

    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        progress.send(classify_stdout_line(&line));
        captured.push_str(&line);
        captured.push('\n');
    }
    Ok(captured)
}

async fn pump_stderr<R: AsyncRead + Unpin>(
    reader: Option<R>,
    progress: ProgressSink,
) -> std::io::Result<Vec<String>> {
    let mut captured = Vec::new();
    let Some(reader) = reader else {
        return Ok(captured);
    };

    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        if is_suppressed_stderr(&line) {
            tracing::trace!("terraform: {}", line);
            continue;
        }
        progress.send(ProgressEvent::stream(Channel::Stderr, line.as_str()));
        captured.push(line);
    }
    Ok(captured)
}

#[async_trait]
impl InfraEngine for TerraformDriver {
    type Error = TerraformError;

    async fn init(&self, progress: &ProgressSink) -> Result<String> {
        let _guard = self.begin()?;
        self.run(&["init", "-no-color", "-input=false"], progress)
            .await
    }

    /// An "already exists" failure means a previous run got there first,
    /// so the caller should go straight to reading outputs
    async fn plan(&self, progress: &ProgressSink) -> Result<PlanOutcome> {
        let _guard = self.begin()?;
        self.plan_inner(PLAN_ARGS, progress).await
    }

    async fn apply(&self, target: Option<&str>, progress: &ProgressSink) -> Result<String> {
        let _guard = self.begin()?;
        self.apply_with_retries(target, progress).await
    }

    async fn get_outputs(&self) -> Result<OutputSet> {
        let _guard = self.begin()?;
        // Outputs carry secrets; never stream them
        let text = self
            .run(&["output", "-json", "-no-color"], &ProgressSink::discard())
            .await?;
        OutputSet::from_engine_json(&text).map_err(|e| TerraformError::OutputParse(e.to_string()))
    }

    async fn destroy(&self, progress: &ProgressSink) -> Result<String> {
        let _guard = self.begin()?;
        self.run(
            &["destroy", "-no-color", "-input=false", "-auto-approve"],
            progress,
        )
        .await
    }

    fn is_interruption(error: &TerraformError) -> bool {
        matches!(error, TerraformError::Terminated)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use stackpilot_core::ResourceAction;
    use std::os::unix::fs::PermissionsExt;
    use std::sync::Arc;
    use tempfile::{TempDir, tempdir};

    struct Fixture {
        root: TempDir,
        driver: TerraformDriver,
    }

    impl Fixture {
        fn calls(&self) -> Vec<String> {
            std::fs::read_to_string(self.root.path().join("calls.log"))
                .unwrap_or_default()
                .lines()
                .map(String::from)
                .collect()
        }

        fn subcommands(&self) -> Vec<String> {
            self.calls()
                .iter()
                .filter_map(|c| c.split_whitespace().next().map(String::from))
                .collect()
        }
    }

    /// A fake terraform: every call is logged with its arguments, then
    /// `body` (a `case "$1"` body) decides what happens
    fn fake_terraform(root: &Path, body: &str) -> PathBuf {
        let script = root.join("terraform");
        let text = format!(
            "#!/bin/sh\necho \"$*\" >> \"$CALLS_LOG\"\ncase \"$1\" in\n{}\n  *) echo \"ok: $1\" ;;\nesac\n",
            body
        );
        std::fs::write(&script, text).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        script
    }

    fn module(root: &Path) -> PathBuf {
        let module = root.join("module");
        std::fs::create_dir_all(&module).unwrap();
        std::fs::write(module.join("main.tf"), "module \"anava\" {}").unwrap();
        module
    }

    async fn fixture(body: &str) -> Fixture {
        let root = tempdir().unwrap();
        let script = fake_terraform(root.path(), body);
        let mut driver = TerraformDriver::new(
            module(root.path()),
            root.path().join("work"),
            "anava",
            "us-central1",
        )
        .with_binary(script)
        .with_env("CALLS_LOG", root.path().join("calls.log").display().to_string());
        driver.initialize("demo").await.unwrap();
        Fixture { root, driver }
    }

    fn drain(rx: &mut tokio::sync::mpsc::UnboundedReceiver<ProgressEvent>) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    const ALWAYS_FAILING_APPLY: &str = r#"
  apply)
    n=$(grep -c '^apply' "$CALLS_LOG")
    echo "module.anava.google_service_account.tvm: Creating..."
    echo "2024/01/01 [INFO] plugin process failed to start" >&2
    echo "Error: apply attempt $n failed" >&2
    exit 1 ;;"#;

    #[tokio::test]
    async fn test_initialize_writes_variables() {
        let root = tempdir().unwrap();
        let mut driver = TerraformDriver::new(module(root.path()), root.path().join("work"), "anava", "europe-west1")
            .with_variable("enable_firebase", true);

        let dir = driver.initialize("demo").await.unwrap();

        assert_eq!(dir.path(), root.path().join("work/demo-anava"));
        assert!(dir.path().join("main.tf").exists());
        let vars: Value = serde_json::from_str(&std::fs::read_to_string(dir.vars_file()).unwrap()).unwrap();
        assert_eq!(vars["project_id"], "demo");
        assert_eq!(vars["region"], "europe-west1");
        assert_eq!(vars["solution_prefix"], "anava");
        assert_eq!(vars["enable_firebase"], true);
    }

    #[tokio::test]
    async fn test_initialize_missing_module() {
        let root = tempdir().unwrap();
        let mut driver = TerraformDriver::new(root.path().join("nope"), root.path().join("work"), "anava", "us-central1");

        let err = driver.initialize("demo").await.unwrap_err();
        assert!(matches!(err, TerraformError::ModuleNotFound(_)));
        assert!(driver.working_directory().is_none());
    }

    #[tokio::test]
    async fn test_apply_ladder_surfaces_last_failure() {
        let f = fixture(ALWAYS_FAILING_APPLY).await;
        let (sink, mut rx) = ProgressSink::channel();

        let err = f.driver.apply(None, &sink).await.unwrap_err();

        assert_eq!(err.message(), Some("Error: apply attempt 3 failed"));
        assert_eq!(f.subcommands(), vec!["apply", "apply", "refresh", "plan", "apply"]);
        // The replan saves nothing for the targeted apply to ignore
        assert_eq!(f.calls()[3], "plan -no-color -input=false -refresh=false");

        let events = drain(&mut rx);
        assert!(events.contains(&ProgressEvent::ResourceAction {
            resource: "module.anava.google_service_account.tvm".into(),
            action: ResourceAction::Creating,
        }));
        assert!(!events.iter().any(|e| e.to_string().contains("[INFO]")));
        assert!(!f.driver.is_busy());
    }

    #[tokio::test]
    async fn test_apply_ladder_respects_config() {
        let mut f = fixture(ALWAYS_FAILING_APPLY).await;
        f.driver = f.driver.with_retry_config(ApplyRetryConfig {
            bare_retries: 0,
            refresh_cycles: 0,
            ..Default::default()
        });

        let err = f.driver.apply(None, &ProgressSink::discard()).await.unwrap_err();
        assert_eq!(err.message(), Some("Error: apply attempt 1 failed"));
        assert_eq!(f.subcommands(), vec!["apply"]);
    }

    #[tokio::test]
    async fn test_apply_succeeds_on_retry() {
        let f = fixture(
            r#"
  apply)
    n=$(grep -c '^apply' "$CALLS_LOG")
    if [ "$n" -lt 2 ]; then echo "Error: transient backend failure" >&2; exit 1; fi
    echo "Apply complete! Resources: 1 added, 0 changed, 0 destroyed." ;;"#,
        )
        .await;

        let output = f.driver.apply(None, &ProgressSink::discard()).await.unwrap();
        assert!(output.contains("Apply complete!"));
        assert_eq!(f.subcommands(), vec!["apply", "apply"]);
    }

    #[tokio::test]
    async fn test_apply_targets_resource() {
        let f = fixture("  apply) echo \"Apply complete!\" ;;").await;

        f.driver
            .apply(Some("module.anava.google_service_account.tvm"), &ProgressSink::discard())
            .await
            .unwrap();

        assert_eq!(
            f.calls(),
            vec!["apply -no-color -input=false -auto-approve -target=module.anava.google_service_account.tvm"]
        );
    }

    #[tokio::test]
    async fn test_already_exists_is_not_retried() {
        let f = fixture(
            r#"
  apply) echo "Error: googleapi: Error 409: Resource already exists" >&2; exit 1 ;;"#,
        )
        .await;

        let err = f.driver.apply(None, &ProgressSink::discard()).await.unwrap_err();
        assert!(err.to_string().contains("already exists"));
        assert_eq!(f.subcommands(), vec!["apply"]);
    }

    #[tokio::test]
    async fn test_plan_already_exists_skips_to_outputs_every_time() {
        let f = fixture(
            r#"
  plan) echo "Error: Error creating Bucket: googleapi: Error 409: already exists" >&2; exit 1 ;;"#,
        )
        .await;

        for _ in 0..2 {
            let outcome = f.driver.plan(&ProgressSink::discard()).await.unwrap();
            assert!(outcome.is_skip());
        }
        assert_eq!(f.calls(), vec!["plan -no-color -input=false -out=tfplan"; 2]);
    }

    #[tokio::test]
    async fn test_plan_failure() {
        let f = fixture(r#"  plan) echo "Error: Invalid provider configuration" >&2; exit 1 ;;"#).await;

        let err = f.driver.plan(&ProgressSink::discard()).await.unwrap_err();
        assert!(matches!(
            err,
            TerraformError::CommandFailed { ref command, ref message }
                if command == "plan" && message == "Error: Invalid provider configuration"
        ));
    }

    #[tokio::test]
    async fn test_exit_code_when_no_error_lines() {
        let f = fixture(r#"  destroy) echo "something odd happened" >&2; exit 3 ;;"#).await;

        let err = f.driver.destroy(&ProgressSink::discard()).await.unwrap_err();
        assert_eq!(err.message(), Some("exit code 3"));
    }

    #[tokio::test]
    async fn test_get_outputs() {
        let f = fixture(
            r#"  output) echo '{"api_key":{"sensitive":true,"type":"string","value":"AIzaSyExample"},"api_gateway_url":{"sensitive":false,"type":"string","value":"https://gw.gateway.dev"}}' ;;"#,
        )
        .await;

        let outputs = f.driver.get_outputs().await.unwrap();
        assert_eq!(outputs.len(), 2);
        let key = outputs.get("api_key").unwrap();
        assert!(key.sensitive);
        assert_eq!(key.as_str(), Some("AIzaSyExample"));
        assert_eq!(f.calls(), vec!["output -json -no-color"]);
    }

    #[tokio::test]
    async fn test_get_outputs_parse_error() {
        let f = fixture("  output) echo 'not json' ;;").await;

        let err = f.driver.get_outputs().await.unwrap_err();
        assert!(matches!(err, TerraformError::OutputParse(_)));
    }

    #[tokio::test]
    async fn test_not_initialized() {
        let driver = TerraformDriver::new("module", "work", "anava", "us-central1");
        let err = driver.init(&ProgressSink::discard()).await.unwrap_err();
        assert!(matches!(err, TerraformError::NotInitialized));
    }

    #[tokio::test]
    async fn test_missing_binary() {
        let mut f = fixture("").await;
        f.driver = f.driver.with_binary(f.root.path().join("no-such-terraform"));

        let err = f.driver.init(&ProgressSink::discard()).await.unwrap_err();
        assert!(matches!(err, TerraformError::TerraformNotFound(_)));
    }

    #[tokio::test]
    async fn test_version() {
        let f = fixture(r#"  version) echo '{"terraform_version":"1.7.5","platform":"linux_amd64"}' ;;"#).await;

        let version = f.driver.version().await.unwrap();
        assert_eq!(version.terraform_version, "1.7.5");
        assert_eq!(version.platform.as_deref(), Some("linux_amd64"));
    }

    #[tokio::test]
    async fn test_second_call_while_running_and_stop() {
        let Fixture { root: _root, driver } = fixture("  init) exec sleep 5 ;;").await;
        let driver = Arc::new(driver);

        let running = {
            let driver = driver.clone();
            tokio::spawn(async move { driver.init(&ProgressSink::discard()).await })
        };
        while !driver.is_busy() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let err = driver.plan(&ProgressSink::discard()).await.unwrap_err();
        assert!(matches!(err, TerraformError::AlreadyRunning));

        assert!(driver.stop());
        let err = running.await.unwrap().unwrap_err();
        assert!(matches!(err, TerraformError::Terminated));
        assert!(TerraformDriver::is_interruption(&err));
        assert!(!driver.is_busy());
        assert!(!driver.stop());
    }

    const INTERRUPTIBLE_APPLY: &str = r#"
  apply)
    trap 'echo "released state lock" >> "$CALLS_LOG"; exit 130' INT TERM
    echo "waiting for interrupt"
    sleep 5 &
    wait $!
    ;;"#;

    async fn wait_for_line(rx: &mut tokio::sync::mpsc::UnboundedReceiver<ProgressEvent>, line: &str) {
        while let Some(event) = rx.recv().await {
            if event.to_string() == line {
                return;
            }
        }
        panic!("progress channel closed before {:?}", line);
    }

    #[tokio::test]
    async fn test_stop_lets_terraform_clean_up() {
        let Fixture { root, driver } = fixture(INTERRUPTIBLE_APPLY).await;
        let driver = Arc::new(driver.with_timeouts(CommandTimeouts {
            stop_grace: Duration::from_secs(3),
            ..Default::default()
        }));
        let (sink, mut rx) = ProgressSink::channel();

        let running = {
            let driver = driver.clone();
            tokio::spawn(async move { driver.apply(None, &sink).await })
        };
        wait_for_line(&mut rx, "waiting for interrupt").await;

        assert!(driver.stop());
        let err = running.await.unwrap().unwrap_err();
        assert!(matches!(err, TerraformError::Terminated));

        let calls = std::fs::read_to_string(root.path().join("calls.log")).unwrap();
        assert!(calls.contains("released state lock"), "calls: {}", calls);
        // An interrupted apply is not retried
        assert_eq!(calls.lines().filter(|l| l.starts_with("apply")).count(), 1);
    }

    #[tokio::test]
    async fn test_command_timeout_interrupts() {
        let mut f = fixture(INTERRUPTIBLE_APPLY).await;
        f.driver = f.driver.with_timeouts(CommandTimeouts {
            apply: Duration::from_millis(300),
            stop_grace: Duration::from_secs(3),
            ..Default::default()
        });

        let err = f.driver.apply(None, &ProgressSink::discard()).await.unwrap_err();

        assert!(matches!(
            err,
            TerraformError::Timeout { ref command, .. } if command == "apply"
        ));
        assert!(!TerraformDriver::is_interruption(&err));
        assert_eq!(f.subcommands(), vec!["apply", "released"]);
        assert!(!f.driver.is_busy());
    }

    #[test]
    fn test_timeout_per_command() {
        let timeouts = CommandTimeouts::default();
        assert_eq!(timeouts.limit_for("init"), Duration::from_secs(300));
        assert_eq!(timeouts.limit_for("plan"), Duration::from_secs(600));
        assert_eq!(timeouts.limit_for("apply"), Duration::from_secs(2400));
        assert_eq!(timeouts.limit_for("destroy"), Duration::from_secs(2400));
        assert_eq!(timeouts.limit_for("output"), Duration::from_secs(300));
    }

    #[test]
    fn test_transient_backoff_grows_per_attempt() {
        let retry = ApplyRetryConfig {
            retry_delay: Duration::from_secs(1),
            ..Default::default()
        };
        assert_eq!(retry.delay_before(2, true), Duration::from_secs(10));
        assert_eq!(retry.delay_before(3, true), Duration::from_secs(20));
        assert_eq!(retry.delay_before(3, false), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_transient_error_backs_off_then_succeeds() {
        let mut f = fixture(
            r#"
  apply)
    n=$(grep -c '^apply' "$CALLS_LOG")
    if [ "$n" -lt 3 ]; then echo "Error: googleapi: Error 503: The service is currently unavailable." >&2; exit 1; fi
    echo "Apply complete! Resources: 1 added, 0 changed, 0 destroyed." ;;"#,
        )
        .await;
        f.driver = f.driver.with_retry_config(ApplyRetryConfig {
            transient_backoff: Duration::from_millis(20),
            ..Default::default()
        });
        let (sink, mut rx) = ProgressSink::channel();

        let output = f.driver.apply(None, &sink).await.unwrap();

        assert!(output.contains("Apply complete!"));
        assert_eq!(f.subcommands(), vec!["apply", "apply", "refresh", "plan", "apply"]);
        let stages: Vec<String> = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, ProgressEvent::Stage { .. }))
            .map(|e| e.to_string())
            .collect();
        assert!(stages.contains(&"[apply] Transient error, retrying apply in 20ms (attempt 2/3)".to_string()));
        assert!(stages.contains(&"[apply] Transient error, retrying apply in 40ms (attempt 3/3)".to_string()));
    }

    #[tokio::test]
    async fn test_fatal_pattern_is_not_retried() {
        let mut f = fixture(
            r#"
  apply) echo "Error: googleapi: Error 403: Permission denied on resource project demo" >&2; exit 1 ;;"#,
        )
        .await;
        f.driver = f.driver.with_fatal_patterns(["Permission denied"]);

        let err = f.driver.apply(None, &ProgressSink::discard()).await.unwrap_err();
        assert!(err.to_string().contains("Permission denied"));
        assert_eq!(f.subcommands(), vec!["apply"]);
    }

    #[tokio::test]
    async fn test_cleanup_removes_working_directory() {
        let mut f = fixture("").await;
        let dir = f.driver.working_directory().unwrap().clone();
        assert!(dir.exists());

        f.driver.cleanup().await.unwrap();
        assert!(!dir.exists());
        assert!(f.driver.working_directory().is_none());
    }
}
