use super::status::{print_recovery_plan, print_report, print_steps};
use crate::Target;
use crate::progress::DeployProgress;
use crate::utils;
use colored::Colorize;
use stackpilot_config::Settings;
use stackpilot_core::validator::REQUIRED_FIELDS;
use stackpilot_core::{
    DeploymentOutcome, OutcomeStatus, OutputOrigin, Orchestrator, ProgressSink, RecoveryEngine,
    StepTracker, format_validation_report,
};
use std::path::PathBuf;
use std::sync::Arc;

pub struct DeployOptions {
    pub region: Option<String>,
    pub manifest: Option<PathBuf>,
    pub module: Option<PathBuf>,
    pub fresh: bool,
    pub verbose: bool,
}

pub async fn handle(settings: &Settings, target: &Target, options: DeployOptions) -> anyhow::Result<()> {
    println!("{}", "デプロイを開始します...".blue().bold());
    println!("プロジェクト: {}", target.project.cyan());
    println!("プレフィックス: {}", target.prefix.cyan());

    let manifest = utils::load_manifest(settings, options.manifest.as_deref()).await?;
    println!("ステップ数: {}", manifest.len());

    // ロックは作業ディレクトリと記録済みの状態の両方を守る
    let store = utils::state_store(settings, target);
    let lock = store.acquire_lock().await?;

    // 手動対応が必要なエラーはリトライしない
    let mut driver = utils::build_driver(settings, target, options.region, options.module)
        .with_fatal_patterns(manifest.intervention_patterns());
    utils::preflight(&driver).await?;
    let work_dir = driver.initialize(&target.project).await?;
    println!("作業ディレクトリ: {}", work_dir.path().display());

    let mut tracker = StepTracker::new(manifest, &target.project, &target.prefix).with_store(store.clone());
    if options.fresh {
        println!("{}", "記録済みの進捗を無視します (--fresh)".yellow());
    } else if tracker.load_existing_state(store.path()).await {
        let state = tracker.state();
        println!(
            "{}",
            format!(
                "前回の続きから再開します: 完了 {}, スキップ {}, 失敗 {}",
                state.completed_steps.len(),
                state.skipped_steps.len(),
                state.failed_steps.len()
            )
            .yellow()
        );
    }

    let driver = Arc::new(driver);
    let recovery = RecoveryEngine::new(utils::build_gcloud(settings), target.prefix.as_str())
        .with_config(utils::recovery_config(settings));
    let mut orchestrator = Orchestrator::new(Arc::clone(&driver), tracker, recovery);

    // Ctrl-C は terraform 実行中のみ止められる。出力の復旧中は最後まで待つ
    let interrupt = {
        let driver = Arc::clone(&driver);
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                if driver.stop() {
                    eprintln!("{}", "中断を受け付けました。terraform を停止しています...".yellow());
                } else {
                    eprintln!(
                        "{}",
                        "出力を復旧中のため中断できません。完了までお待ちください".yellow()
                    );
                }
            }
        })
    };

    println!();
    let (sink, rx) = ProgressSink::channel();
    let display = DeployProgress::spawn(rx, options.verbose);
    let result = orchestrator.run(&sink).await;
    drop(sink);
    display.finish().await;
    interrupt.abort();

    println!();
    print_steps(orchestrator.tracker());
    println!();

    let outcome = match result {
        Ok(outcome) => outcome,
        Err(e) => {
            println!(
                "進捗は {} に保存されました。同じコマンドを再実行すると再開します",
                store.path().display()
            );
            return Err(e.into());
        }
    };

    print_report(&outcome.report);
    print_recovery_plan(&orchestrator.tracker().recovery_plan());
    println!();
    print!("{}", format_validation_report(&outcome.validation));
    println!();
    print_outputs(&outcome);

    lock.release().await?;

    match outcome.status {
        OutcomeStatus::FullyResolved => {
            println!("{}", "✓ デプロイが完了しました".green().bold());
            Ok(())
        }
        OutcomeStatus::RecoveredWithPlaceholders => {
            println!(
                "{}",
                "✓ デプロイは完了しましたが、一部の出力は手動での確認が必要です:"
                    .yellow()
                    .bold()
            );
            for name in outcome.placeholders() {
                println!("  • {}", name.yellow());
            }
            Ok(())
        }
        OutcomeStatus::CriticalFailure if outcome.report.has_critical_failures() => Err(anyhow::anyhow!(
            "デプロイに失敗しました。重要なステップ: {}",
            outcome.report.critical_failures.join(", ")
        )),
        OutcomeStatus::CriticalFailure => {
            let blocked: Vec<&str> = outcome
                .report
                .manual_interventions
                .iter()
                .filter(|n| !n.can_continue)
                .map(|n| n.step_id.as_str())
                .collect();
            Err(anyhow::anyhow!(
                "手動対応が必要なためデプロイを中断しました: {}",
                blocked.join(", ")
            ))
        }
    }
}

fn print_outputs(outcome: &DeploymentOutcome) {
    println!("{}", "出力:".bold());
    for field in REQUIRED_FIELDS {
        let Some(output) = outcome.outputs.get(field.name) else {
            println!("  {}: {}", field.name, "(未取得)".red());
            continue;
        };
        let shown = if output.sensitive {
            "(機密)".to_string()
        } else {
            match output.as_str() {
                Some(text) => text.to_string(),
                None => output.resolved().to_string(),
            }
        };
        let origin = match output.origin {
            OutputOrigin::Engine => String::new(),
            OutputOrigin::Placeholder => format!(" [{}]", output.origin).yellow().to_string(),
            _ => format!(" [{}]", output.origin).dimmed().to_string(),
        };
        println!("  {}: {}{}", field.name.cyan(), shown, origin);
    }
}
