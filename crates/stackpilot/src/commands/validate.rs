use anyhow::Context;
use colored::Colorize;
use stackpilot_core::{OutputSet, format_validation_report, validate_outputs};
use std::path::Path;

pub async fn handle(path: &Path) -> anyhow::Result<()> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("{} を読み込めませんでした", path.display()))?;
    let outputs = OutputSet::from_engine_json(&text)
        .with_context(|| {
            format!("{} は terraform output -json の形式ではありません", path.display())
        })?;

    let result = validate_outputs(&outputs);
    print!("{}", format_validation_report(&result));

    if !result.is_valid {
        anyhow::bail!("必須の出力のうち {} 件が未取得または不正です", result.failed_fields().count());
    }
    println!("{}", "✓ 必須の出力はすべて揃っています".green().bold());
    Ok(())
}
