use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use stackpilot_core::{Channel, ProgressEvent};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

/// デプロイの進捗イベントを表示するスピナー
pub struct DeployProgress {
    handle: JoinHandle<()>,
}

impl DeployProgress {
    /// terraform の標準出力そのものは `verbose` のときだけ表示する
    pub fn spawn(mut rx: UnboundedReceiver<ProgressEvent>, verbose: bool) -> Self {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.enable_steady_tick(Duration::from_millis(120));
        pb.set_message("開始しています...");

        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    ProgressEvent::Stage { name, text } => {
                        pb.println(format!("{} {}", format!("[{}]", name).blue(), text));
                        pb.set_message(text);
                    }
                    ProgressEvent::ResourceAction { resource, action } => {
                        pb.set_message(format!("{} {}", action, resource.cyan()));
                    }
                    ProgressEvent::Stream {
                        channel: Channel::Stderr,
                        text,
                    } => {
                        pb.println(text.yellow().to_string());
                    }
                    ProgressEvent::Stream {
                        channel: Channel::Stdout,
                        text,
                    } => {
                        if verbose {
                            pb.println(text.dimmed().to_string());
                        }
                    }
                }
            }
            pb.finish_and_clear();
        });

        Self { handle }
    }

    /// sink を破棄する前に送られたイベントがすべて表示されるまで待つ
    pub async fn finish(self) {
        if let Err(e) = self.handle.await {
            tracing::debug!("進捗表示が異常終了しました: {}", e);
        }
    }
}
