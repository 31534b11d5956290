use crate::Target;
use crate::utils;
use colored::Colorize;
use stackpilot_config::Settings;
use stackpilot_core::{DeploymentReport, RecoveryAction, StepOutcome, StepStatus, StepTracker};
use std::path::Path;

pub async fn handle(settings: &Settings, target: &Target, manifest: Option<&Path>) -> anyhow::Result<()> {
    let manifest = utils::load_manifest(settings, manifest).await?;
    let store = utils::state_store(settings, target);

    let mut tracker = StepTracker::new(manifest, &target.project, &target.prefix);
    if !tracker.load_existing_state(store.path()).await {
        println!(
            "{}/{} のデプロイ記録はありません ({})",
            target.project.cyan(),
            target.prefix.cyan(),
            store.path().display()
        );
        return Ok(());
    }

    println!(
        "{}",
        format!("デプロイ {}/{}", target.project, target.prefix).bold()
    );
    print_steps(&tracker);
    println!();
    print_report(&tracker.generate_report());
    print_recovery_plan(&tracker.recovery_plan());
    Ok(())
}

pub fn print_steps(tracker: &StepTracker) {
    let state = tracker.state();
    for step in tracker.manifest().iter() {
        let record = state.steps.get(&step.id);
        let (symbol, status) = match record.map(|r| r.status) {
            Some(StepStatus::Completed) => ("✓".green(), "完了".green()),
            Some(StepStatus::Failed) => ("✗".red(), "失敗".red()),
            Some(StepStatus::Skipped) => ("↷".yellow(), "スキップ".yellow()),
            Some(StepStatus::InProgress) => ("…".cyan(), "実行中".cyan()),
            None => ("·".dimmed(), "未実行".dimmed()),
        };
        let critical = if step.critical { " (重要)" } else { "" };
        println!("  {} {}{} {}", symbol, step.name, critical.dimmed(), status);

        let (text, is_error) = match record.and_then(|r| r.outcome.as_ref()) {
            Some(StepOutcome::Error(text)) => (text.as_str(), true),
            Some(StepOutcome::Result(text)) | Some(StepOutcome::Reason(text)) => (text.as_str(), false),
            None => continue,
        };
        for line in text.lines().take(3) {
            if is_error {
                println!("      {}", line.red());
            } else {
                println!("      {}", line.dimmed());
            }
        }
    }
}

pub fn print_report(report: &DeploymentReport) {
    println!("概要: {}", report);

    if report.has_critical_failures() {
        println!(
            "{} {}",
            "重要なステップの失敗:".red().bold(),
            report.critical_failures.join(", ")
        );
    }
    print_interventions(report);
    if let Some(ref next) = report.next_steps {
        println!("{} {}", "次の手順:".yellow(), next);
    }
    for suggestion in &report.recovery_suggestions {
        println!(
            "  • {} ({}): {}",
            suggestion.step_id.cyan(),
            suggestion.resource,
            suggestion.message
        );
    }
}

/// 手動対応が必要なエラーと、その手順
fn print_interventions(report: &DeploymentReport) {
    if report.manual_interventions.is_empty() {
        return;
    }
    println!("{}", "手動対応が必要です:".red().bold());
    for notice in &report.manual_interventions {
        let state = if notice.can_continue {
            "続行可能".yellow()
        } else {
            "デプロイを中断".red()
        };
        println!(
            "  • {} ({}): {} [{}]",
            notice.resource.cyan(),
            notice.step_id,
            notice.action,
            state
        );
        for (i, step) in notice.steps.iter().enumerate() {
            println!("      {}. {}", i + 1, step);
        }
    }
}

pub fn print_recovery_plan(actions: &[RecoveryAction]) {
    if actions.is_empty() {
        return;
    }
    println!();
    println!("{}", "復旧プラン:".bold());
    for action in actions {
        println!("  • [{}] {}", action.action, action.description);
        println!("    $ {}", action.command.cyan());
    }
}
