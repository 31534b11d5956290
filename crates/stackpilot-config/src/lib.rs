pub mod error;
pub mod settings;

pub use error::*;
pub use settings::{ApplySettings, CredentialSettings, RecoverySettings, Settings, TimeoutSettings};

use std::path::PathBuf;

pub const CONFIG_ENV: &str = "STACKPILOT_CONFIG";

const CANDIDATES: [&str; 2] = ["stackpilot.local.yaml", "stackpilot.yaml"];

/// `~/.config/stackpilot`
pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or(ConfigError::ConfigDirNotFound)?
        .join("stackpilot");
    Ok(config_dir)
}

/// 作業ディレクトリとデプロイ状態のデフォルトの置き場所
pub fn get_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("stackpilot")
}

/// stackpilot の設定ファイルを探す
///
/// 検索順序:
/// 1. `STACKPILOT_CONFIG` 環境変数（直接指定）
/// 2. カレントディレクトリ: stackpilot.local.yaml, stackpilot.yaml
/// 3. `./.stackpilot/` ディレクトリ: 同じ順序
/// 4. `~/.config/stackpilot/config.yaml`（グローバル設定）
pub fn find_config_file() -> Result<PathBuf> {
    if let Ok(config_path) = std::env::var(CONFIG_ENV) {
        let path = PathBuf::from(config_path);
        if path.exists() {
            return Ok(path);
        }
        tracing::warn!("{} が存在しないファイルを指しています: {}", CONFIG_ENV, path.display());
    }

    let current_dir = std::env::current_dir()?;

    for filename in &CANDIDATES {
        let path = current_dir.join(filename);
        if path.exists() {
            return Ok(path);
        }
    }

    let local_dir = current_dir.join(".stackpilot");
    if local_dir.is_dir() {
        for filename in &CANDIDATES {
            let path = local_dir.join(filename);
            if path.exists() {
                return Ok(path);
            }
        }
    }

    if let Ok(config_dir) = get_config_dir() {
        let global_config = config_dir.join("config.yaml");
        if global_config.exists() {
            return Ok(global_config);
        }
    }

    Err(ConfigError::ConfigFileNotFound)
}
