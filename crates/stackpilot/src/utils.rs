use crate::Target;
use anyhow::Context;
use colored::Colorize;
use stackpilot_config::Settings;
use stackpilot_core::{Manifest, RecoveryConfig, StateStore};
use stackpilot_gcloud::Gcloud;
use stackpilot_terraform::{ApplyRetryConfig, CommandTimeouts, TerraformDriver};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub fn load_settings(path: Option<&Path>) -> anyhow::Result<Settings> {
    let settings = match path {
        Some(path) => Settings::load(path)?,
        None => Settings::discover()?,
    };
    Ok(settings)
}

/// `--manifest`、設定ファイルのマニフェスト、組み込みマニフェストの順に使う
pub async fn load_manifest(settings: &Settings, path: Option<&Path>) -> anyhow::Result<Arc<Manifest>> {
    let manifest = match path.or(settings.manifest.as_deref()) {
        Some(path) => Manifest::load(path)
            .await
            .with_context(|| format!("マニフェストの読み込みに失敗しました: {}", path.display()))?,
        None => Manifest::builtin()?,
    };
    Ok(Arc::new(manifest))
}

pub fn state_store(settings: &Settings, target: &Target) -> StateStore {
    StateStore::for_deployment(settings.state_dir(), &target.project, &target.prefix)
}

pub fn apply_retry_config(settings: &Settings) -> ApplyRetryConfig {
    ApplyRetryConfig {
        bare_retries: settings.apply.bare_retries,
        refresh_cycles: settings.apply.refresh_cycles,
        retry_delay: Duration::from_secs(settings.apply.retry_delay_secs),
        transient_backoff: Duration::from_secs(settings.apply.transient_backoff_secs),
    }
}

pub fn command_timeouts(settings: &Settings) -> CommandTimeouts {
    let timeouts = &settings.timeouts;
    CommandTimeouts {
        init: Duration::from_secs(timeouts.init_secs),
        plan: Duration::from_secs(timeouts.plan_secs),
        apply: Duration::from_secs(timeouts.apply_secs),
        stop_grace: Duration::from_secs(timeouts.stop_grace_secs),
    }
}

pub fn recovery_config(settings: &Settings) -> RecoveryConfig {
    RecoveryConfig {
        gateway_poll_attempts: settings.recovery.gateway_poll_attempts,
        gateway_poll_interval: Duration::from_secs(settings.recovery.gateway_poll_interval_secs),
        ..Default::default()
    }
}

pub fn build_driver(
    settings: &Settings,
    target: &Target,
    region: Option<String>,
    module: Option<PathBuf>,
) -> TerraformDriver {
    let region = region.unwrap_or_else(|| settings.region.clone());
    let module = module.unwrap_or_else(|| settings.module_source.clone());

    let mut driver = TerraformDriver::new(module, settings.work_root(), &target.prefix, region)
        .with_binary(&settings.terraform_bin)
        .with_retry_config(apply_retry_config(settings))
        .with_timeouts(command_timeouts(settings));
    if let Some(ref credentials) = settings.credentials.google_application_credentials {
        driver = driver.with_env(
            "GOOGLE_APPLICATION_CREDENTIALS",
            credentials.display().to_string(),
        );
    }
    driver
}

pub fn build_gcloud(settings: &Settings) -> Gcloud {
    let mut gcloud = Gcloud::new().with_binary(&settings.gcloud_bin);
    if let Some(ref account) = settings.credentials.gcloud_account {
        gcloud = gcloud.with_account(account);
    }
    if let Some(ref token_file) = settings.credentials.access_token_file {
        gcloud = gcloud.with_access_token_file(token_file);
    }
    gcloud
}

/// terraform が使えなければ、インストール案内付きで早めに失敗する
pub async fn preflight(driver: &TerraformDriver) -> anyhow::Result<()> {
    let version = driver
        .version()
        .await
        .with_context(|| format!("terraform の事前チェックに失敗しました ({})", driver.binary().display()))?;
    println!("terraform: {}", version.terraform_version.cyan());
    Ok(())
}
