mod commands;
mod progress;
mod utils;

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "stackpilot")]
#[command(about = "Terraform でクラウド環境を構築する。一歩ずつ、記録しながら。", long_about = None)]
struct Cli {
    /// 設定ファイル（省略時は自動検出、STACKPILOT_CONFIG も参照）
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// デバッグログを出力（RUST_LOG より優先）
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// 状態を持つコマンドが共通で使うデプロイの識別情報
#[derive(Args, Clone)]
pub struct Target {
    /// クラウドのプロジェクト ID
    #[arg(short, long, env = "STACKPILOT_PROJECT")]
    pub project: String,
    /// すべてのリソース名に付くプレフィックス
    #[arg(long, env = "STACKPILOT_PREFIX", default_value = "anava")]
    pub prefix: String,
}

#[derive(Subcommand)]
enum Commands {
    /// デプロイを実行（中断したデプロイは再開）
    Deploy {
        #[command(flatten)]
        target: Target,
        /// リージョン（リージョナルなリソース用）
        #[arg(short, long)]
        region: Option<String>,
        /// デプロイマニフェスト（YAML または JSON、省略時は組み込み）
        #[arg(short, long)]
        manifest: Option<PathBuf>,
        /// Terraform モジュールのテンプレートディレクトリ
        #[arg(long)]
        module: Option<PathBuf>,
        /// 記録済みの進捗を無視してすべてのステップを実行し直す
        #[arg(long)]
        fresh: bool,
    },
    /// デプロイの記録済みの進捗を表示
    Status {
        #[command(flatten)]
        target: Target,
        /// デプロイマニフェスト（YAML または JSON、省略時は組み込み）
        #[arg(short, long)]
        manifest: Option<PathBuf>,
    },
    /// `terraform output -json` の出力を検証
    Validate {
        /// 出力 JSON ファイルのパス
        outputs: PathBuf,
    },
    /// デプロイを削除し、作業ディレクトリも消す
    Destroy {
        #[command(flatten)]
        target: Target,
        /// リージョン（リージョナルなリソース用）
        #[arg(short, long)]
        region: Option<String>,
        /// Terraform モジュールのテンプレートディレクトリ
        #[arg(long)]
        module: Option<PathBuf>,
        /// 削除を確定する
        #[arg(short, long)]
        yes: bool,
    },
    /// バージョン情報を表示
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // ログは stderr へ。stdout はレポート用
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Deploy {
            target,
            region,
            manifest,
            module,
            fresh,
        } => {
            let settings = utils::load_settings(cli.config.as_deref())?;
            commands::deploy::handle(
                &settings,
                &target,
                commands::deploy::DeployOptions {
                    region,
                    manifest,
                    module,
                    fresh,
                    verbose: cli.verbose,
                },
            )
            .await?;
        }
        Commands::Status { target, manifest } => {
            let settings = utils::load_settings(cli.config.as_deref())?;
            commands::status::handle(&settings, &target, manifest.as_deref()).await?;
        }
        Commands::Validate { outputs } => {
            commands::validate::handle(&outputs).await?;
        }
        Commands::Destroy {
            target,
            region,
            module,
            yes,
        } => {
            let settings = utils::load_settings(cli.config.as_deref())?;
            commands::destroy::handle(&settings, &target, region, module, yes).await?;
        }
        Commands::Version => {
            println!("stackpilot {}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
