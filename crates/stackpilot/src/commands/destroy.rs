use crate::Target;
use crate::progress::DeployProgress;
use crate::utils;
use colored::Colorize;
use stackpilot_config::Settings;
use stackpilot_core::{InfraEngine, ProgressSink};
use std::path::PathBuf;

pub async fn handle(
    settings: &Settings,
    target: &Target,
    region: Option<String>,
    module: Option<PathBuf>,
    yes: bool,
) -> anyhow::Result<()> {
    println!(
        "{}",
        format!("{}/{} を削除します", target.project, target.prefix).red().bold()
    );

    if !yes {
        println!();
        println!(
            "{}",
            "警告: このデプロイのすべてのリソースが削除されます。".yellow()
        );
        println!("実行するには --yes オプションを指定してください");
        return Ok(());
    }

    let store = utils::state_store(settings, target);
    let lock = store.acquire_lock().await?;

    let mut driver = utils::build_driver(settings, target, region, module);
    utils::preflight(&driver).await?;
    driver.initialize(&target.project).await?;

    let (sink, rx) = ProgressSink::channel();
    let display = DeployProgress::spawn(rx, false);
    let result = async {
        driver.init(&sink).await?;
        driver.destroy(&sink).await
    }
    .await;
    drop(sink);
    display.finish().await;
    result?;

    driver.cleanup().await?;

    // 記録済みの進捗は、もう存在しないリソースを指している
    store.remove().await?;
    lock.release().await?;

    println!("{}", "✓ デプロイを削除しました".green().bold());
    Ok(())
}
