#![allow(deprecated)] // TODO: cargo_bin → cargo_bin_cmd! へ移行

use assert_cmd::Command;
use predicates::prelude::*;
use stackpilot_core::{Manifest, StateStore, StepTracker};
use std::path::Path;
use std::sync::Arc;

const VALID_OUTPUTS: &str = r#"{
  "api_gateway_url": {"sensitive": false, "type": "string", "value": "https://anava-gw-abc123.uc.gateway.dev"},
  "api_key": {"sensitive": true, "type": "string", "value": "AIzaSyD-example-key-000000000000000"},
  "firebase_config": {"sensitive": false, "type": ["object", {}], "value": {"apiKey": "AIzaSyD", "projectId": "demo"}},
  "workload_identity_provider": {"sensitive": false, "type": "string", "value": "projects/123/locations/global/workloadIdentityPools/anava-wi-pool/providers/anava-wi-provider"},
  "device_auth_service_account": {"sensitive": false, "type": "string", "value": "anava-device-auth-sa@demo.iam.gserviceaccount.com"},
  "tvm_service_account": {"sensitive": false, "type": "string", "value": "anava-tvm-sa@demo.iam.gserviceaccount.com"},
  "vertex_ai_service_account": {"sensitive": false, "type": "string", "value": "anava-vertex-ai-sa@demo.iam.gserviceaccount.com"}
}"#;

fn stackpilot() -> Command {
    let mut cmd = Command::cargo_bin("stackpilot").unwrap();
    cmd.env_remove("STACKPILOT_CONFIG")
        .env_remove("STACKPILOT_PROJECT")
        .env_remove("STACKPILOT_PREFIX")
        .env("NO_COLOR", "1");
    cmd
}

fn write_config(dir: &Path) -> std::path::PathBuf {
    let config = dir.join("stackpilot.yaml");
    std::fs::write(
        &config,
        format!(
            "state_dir: {}\nwork_root: {}\n",
            dir.join("state").display(),
            dir.join("work").display()
        ),
    )
    .unwrap();
    config
}

/// ヘルプにすべてのコマンドが表示されることを確認
#[test]
fn test_cli_help() {
    stackpilot()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Terraform"))
        .stdout(predicate::str::contains("deploy"))
        .stdout(predicate::str::contains("status"))
        .stdout(predicate::str::contains("validate"))
        .stdout(predicate::str::contains("destroy"));
}

#[test]
fn test_cli_version() {
    stackpilot()
        .arg("version")
        .assert()
        .success()
        .stdout(predicate::str::contains("stackpilot"));
}

#[test]
fn test_deploy_help() {
    stackpilot()
        .args(["deploy", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--project"))
        .stdout(predicate::str::contains("--prefix"))
        .stdout(predicate::str::contains("--fresh"))
        .stdout(predicate::str::contains("--manifest"));
}

#[test]
fn test_deploy_requires_project() {
    stackpilot()
        .arg("deploy")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--project"));
}

#[test]
fn test_validate_complete_outputs() {
    let temp_dir = tempfile::tempdir().unwrap();
    let path = temp_dir.path().join("outputs.json");
    std::fs::write(&path, VALID_OUTPUTS).unwrap();

    stackpilot()
        .arg("validate")
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("Output validation: PASSED"));
}

#[test]
fn test_validate_reports_missing_outputs() {
    let temp_dir = tempfile::tempdir().unwrap();
    let path = temp_dir.path().join("outputs.json");
    let mut outputs: serde_json::Value = serde_json::from_str(VALID_OUTPUTS).unwrap();
    outputs.as_object_mut().unwrap().remove("api_key");
    std::fs::write(&path, outputs.to_string()).unwrap();

    stackpilot()
        .arg("validate")
        .arg(&path)
        .assert()
        .failure()
        .stdout(predicate::str::contains("Output validation: FAILED"))
        .stdout(predicate::str::contains("Missing required output: api_key"));
}

#[test]
fn test_validate_rejects_non_json() {
    let temp_dir = tempfile::tempdir().unwrap();
    let path = temp_dir.path().join("outputs.json");
    std::fs::write(&path, "Apply complete!").unwrap();

    stackpilot()
        .arg("validate")
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("terraform output -json の形式ではありません"));
}

#[test]
fn test_status_without_state() {
    let temp_dir = tempfile::tempdir().unwrap();
    let config = write_config(temp_dir.path());

    stackpilot()
        .arg("--config")
        .arg(&config)
        .args(["status", "--project", "demo"])
        .assert()
        .success()
        .stdout(predicate::str::contains("デプロイ記録はありません"));
}

#[tokio::test]
async fn test_status_shows_recorded_progress() {
    let temp_dir = tempfile::tempdir().unwrap();
    let config = write_config(temp_dir.path());

    let store = StateStore::for_deployment(temp_dir.path().join("state"), "demo", "anava");
    let manifest = Arc::new(Manifest::builtin().unwrap());
    let mut tracker = StepTracker::new(manifest, "demo", "anava").with_store(store);
    tracker.start_step("enable_apis").await.unwrap();
    tracker.complete_step("enable_apis", "Apply complete!").await.unwrap();
    tracker.start_step("device_auth_sa").await.unwrap();
    tracker
        .fail_step("device_auth_sa", "Error: Error 403: Permission denied")
        .await
        .unwrap();

    stackpilot()
        .arg("--config")
        .arg(&config)
        .args(["status", "--project", "demo", "--prefix", "anava"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Enable required Google Cloud APIs"))
        .stdout(predicate::str::contains("Permission denied"))
        .stdout(predicate::str::contains("重要なステップの失敗:"))
        .stdout(predicate::str::contains("terraform import module.anava.google_service_account.device_auth"))
        // Permission denied は手動対応の表に載っている
        .stdout(predicate::str::contains("手動対応が必要です:"))
        .stdout(predicate::str::contains("Service Permissions (device_auth_sa): Grant required permissions"))
        .stdout(predicate::str::contains("1. Make sure the deploying account has Owner or Editor"));
}

#[test]
fn test_destroy_requires_confirmation() {
    let temp_dir = tempfile::tempdir().unwrap();
    let config = write_config(temp_dir.path());

    stackpilot()
        .arg("--config")
        .arg(&config)
        .args(["destroy", "--project", "demo"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--yes"));

    assert!(!temp_dir.path().join("work").exists());
}
