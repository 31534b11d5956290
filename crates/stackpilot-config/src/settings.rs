//! stackpilot 設定ファイル
//!
//! ```yaml
//! terraform_bin: /usr/local/bin/terraform
//! module_source: ./terraform
//! region: us-central1
//! apply:
//!   bare_retries: 1
//!   refresh_cycles: 1
//!   transient_backoff_secs: 10
//! timeouts:
//!   init_secs: 300
//!   plan_secs: 600
//!   apply_secs: 2400
//!   stop_grace_secs: 10
//! recovery:
//!   gateway_poll_attempts: 30
//!   gateway_poll_interval_secs: 30
//! credentials:
//!   google_application_credentials: ~/keys/deployer.json
//! ```
//!
//! すべてのキーは省略可能。

use crate::error::{ConfigError, Result};
use crate::{find_config_file, get_data_dir};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub terraform_bin: PathBuf,
    pub gcloud_bin: PathBuf,
    /// 各作業ディレクトリにコピーする Terraform モジュールのテンプレート
    pub module_source: PathBuf,
    pub work_root: Option<PathBuf>,
    pub state_dir: Option<PathBuf>,
    /// デプロイマニフェスト（未指定なら組み込みのもの）
    pub manifest: Option<PathBuf>,
    pub region: String,
    pub apply: ApplySettings,
    pub timeouts: TimeoutSettings,
    pub recovery: RecoverySettings,
    pub credentials: CredentialSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            terraform_bin: PathBuf::from("terraform"),
            gcloud_bin: PathBuf::from("gcloud"),
            module_source: PathBuf::from("terraform"),
            work_root: None,
            state_dir: None,
            manifest: None,
            region: "us-central1".to_string(),
            apply: ApplySettings::default(),
            timeouts: TimeoutSettings::default(),
            recovery: RecoverySettings::default(),
            credentials: CredentialSettings::default(),
        }
    }
}

/// apply のリトライ設定
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplySettings {
    pub bare_retries: u32,
    pub refresh_cycles: u32,
    pub retry_delay_secs: u64,
    /// 一時的なエラー（503, 429 など）の待ち時間。試行ごとに倍数で増える
    pub transient_backoff_secs: u64,
}

impl Default for ApplySettings {
    fn default() -> Self {
        Self {
            bare_retries: 1,
            refresh_cycles: 1,
            retry_delay_secs: 0,
            transient_backoff_secs: 10,
        }
    }
}

/// terraform コマンドごとの制限時間（秒）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    /// init, output, version
    pub init_secs: u64,
    pub plan_secs: u64,
    /// apply, refresh, destroy
    pub apply_secs: u64,
    /// 中断後、強制終了するまでの猶予
    pub stop_grace_secs: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            init_secs: 300,
            plan_secs: 600,
            apply_secs: 2400,
            stop_grace_secs: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoverySettings {
    pub gateway_poll_attempts: u32,
    pub gateway_poll_interval_secs: u64,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            gateway_poll_attempts: 30,
            gateway_poll_interval_secs: 30,
        }
    }
}

/// terraform と gcloud に渡す認証情報
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialSettings {
    /// サービスアカウントのキーファイル（`GOOGLE_APPLICATION_CREDENTIALS` として渡す）
    pub google_application_credentials: Option<PathBuf>,
    pub gcloud_account: Option<String>,
    pub access_token_file: Option<PathBuf>,
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// 空のドキュメントはすべてデフォルト値
    pub fn from_yaml(text: &str) -> std::result::Result<Self, serde_yaml::Error> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text)
    }

    /// 見つかった設定ファイルを読み込む。なければデフォルト値
    pub fn discover() -> Result<Self> {
        match find_config_file() {
            Ok(path) => {
                tracing::debug!("設定ファイルを読み込みます: {}", path.display());
                Self::load(&path)
            }
            Err(ConfigError::ConfigFileNotFound) => {
                tracing::debug!("設定ファイルがないため、デフォルト値を使用します");
                Ok(Self::default())
            }
            Err(e) => Err(e),
        }
    }

    pub fn work_root(&self) -> PathBuf {
        self.work_root
            .clone()
            .unwrap_or_else(|| get_data_dir().join("deployments"))
    }

    pub fn state_dir(&self) -> PathBuf {
        self.state_dir
            .clone()
            .unwrap_or_else(|| get_data_dir().join("state"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CONFIG_ENV;
    use serial_test::serial;

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let settings = Settings::from_yaml(
            r#"
region: europe-west1
apply:
  refresh_cycles: 2
"#,
        )
        .unwrap();

        assert_eq!(settings.region, "europe-west1");
        assert_eq!(settings.apply.refresh_cycles, 2);
        assert_eq!(settings.apply.bare_retries, 1);
        assert_eq!(settings.recovery.gateway_poll_attempts, 30);
        assert_eq!(settings.apply.transient_backoff_secs, 10);
        assert_eq!(settings.timeouts, TimeoutSettings::default());
        assert_eq!(settings.terraform_bin, PathBuf::from("terraform"));
    }

    #[test]
    fn test_timeouts() {
        let settings = Settings::from_yaml("timeouts:\n  apply_secs: 3600\n  stop_grace_secs: 30\n").unwrap();
        assert_eq!(settings.timeouts.apply_secs, 3600);
        assert_eq!(settings.timeouts.stop_grace_secs, 30);
        assert_eq!(settings.timeouts.init_secs, 300);
        assert_eq!(settings.timeouts.plan_secs, 600);
    }

    #[test]
    fn test_empty_yaml_is_default() {
        assert_eq!(Settings::from_yaml("\n").unwrap(), Settings::default());
    }

    #[test]
    fn test_explicit_dirs() {
        let settings = Settings::from_yaml("work_root: /srv/work\nstate_dir: /srv/state").unwrap();
        assert_eq!(settings.work_root(), PathBuf::from("/srv/work"));
        assert_eq!(settings.state_dir(), PathBuf::from("/srv/state"));
    }

    #[test]
    fn test_default_dirs_under_data_dir() {
        let settings = Settings::default();
        assert!(settings.work_root().ends_with("stackpilot/deployments"));
        assert!(settings.state_dir().ends_with("stackpilot/state"));
    }

    #[test]
    fn test_load_invalid_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("stackpilot.yaml");
        std::fs::write(&path, "apply: [not, a, map]").unwrap();

        let err = Settings::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("stackpilot.yaml"));
        assert!(err.to_string().starts_with("設定ファイルが不正です"));
    }

    #[test]
    #[serial]
    fn test_discover_from_env() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("custom.yaml");
        std::fs::write(&path, "credentials:\n  gcloud_account: deployer@example.com\n").unwrap();

        let settings = temp_env::with_var(CONFIG_ENV, Some(&path), Settings::discover).unwrap();
        assert_eq!(
            settings.credentials.gcloud_account.as_deref(),
            Some("deployer@example.com")
        );
    }
}
