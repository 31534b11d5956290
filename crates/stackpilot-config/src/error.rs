use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("設定ディレクトリが見つかりません")]
    ConfigDirNotFound,

    #[error(
        "設定ファイルが見つかりません。以下の場所を確認してください:\n\
        - $STACKPILOT_CONFIG\n\
        - カレントディレクトリ: stackpilot.local.yaml, stackpilot.yaml\n\
        - ./.stackpilot/ ディレクトリ\n\
        - ~/.config/stackpilot/config.yaml"
    )]
    ConfigFileNotFound,

    #[error("設定ファイルが不正です {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("IO エラー: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;
