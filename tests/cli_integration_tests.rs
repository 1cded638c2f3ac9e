// CLI contract: one JSON object on stdout, exit code 0 for claimed/idle/ok

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::{json, Value};
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn conductor(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("conductor").unwrap();
    cmd.current_dir(dir.path())
        .env("RUST_LOG", "warn")
        .env_remove("GITHUB_TOKEN")
        .arg("--state-file")
        .arg(dir.path().join("state.json"));
    cmd
}

fn stdout_json(output: &std::process::Output) -> Value {
    serde_json::from_slice(&output.stdout).expect("stdout is one JSON object")
}

fn seed(path: &Path) {
    let state = json!({
        "available_tasks": [
            {
                "id": "7",
                "title": "Harden session cookies",
                "required_skills": ["security"],
                "priority": "high",
                "created_at": "2024-03-01T10:00:00Z"
            }
        ]
    });
    fs::write(path, serde_json::to_string_pretty(&state).unwrap()).unwrap();
}

#[test]
fn test_claim_on_empty_pool_is_idle() {
    let dir = TempDir::new().unwrap();
    conductor(&dir)
        .args(["claim", "--role", "frontend"])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""status":"idle""#));
}

#[test]
fn test_claim_heartbeat_complete_lifecycle() {
    let dir = TempDir::new().unwrap();
    seed(&dir.path().join("state.json"));

    let claimed = conductor(&dir)
        .args(["claim", "--role", "security"])
        .output()
        .unwrap();
    assert!(claimed.status.success());
    let body = stdout_json(&claimed);
    assert_eq!(body["status"], "claimed");
    assert_eq!(body["task_id"], "7");
    let agent_id = body["agent_id"].as_str().unwrap().to_string();
    assert!(agent_id.starts_with("security_"));

    conductor(&dir)
        .args(["heartbeat", "--agent-id", &agent_id])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""status":"ok""#));

    conductor(&dir)
        .args(["complete", "--agent-id", &agent_id])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""status":"completed""#));

    // The claim is gone, so the agent must stop
    conductor(&dir)
        .args(["heartbeat", "--agent-id", &agent_id])
        .assert()
        .failure()
        .stdout(predicate::str::contains(r#""status":"lost""#));
}

#[test]
fn test_explicit_unknown_task_is_error_object() {
    let dir = TempDir::new().unwrap();
    seed(&dir.path().join("state.json"));

    let output = conductor(&dir)
        .args(["claim", "--role", "dev", "--task-id", "404"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    let body = stdout_json(&output);
    assert_eq!(body["status"], "error");
    assert!(body["message"].as_str().unwrap().contains("404"));
}

#[test]
fn test_health_json_snapshot() {
    let dir = TempDir::new().unwrap();
    seed(&dir.path().join("state.json"));

    let output = conductor(&dir).args(["health", "--json"]).output().unwrap();
    assert!(output.status.success());
    let snapshot = stdout_json(&output);
    assert_eq!(snapshot["available"], 1);
    assert_eq!(snapshot["by_skill"]["security"], 1);
    let score = snapshot["health"]["score"].as_f64().unwrap();
    assert!((0.0..=1.0).contains(&score));
}

#[test]
fn test_health_human_summary() {
    let dir = TempDir::new().unwrap();
    conductor(&dir)
        .arg("health")
        .assert()
        .success()
        .stdout(predicate::str::starts_with("Health: "));
}

#[test]
fn test_sweep_and_archive_dry_runs() {
    let dir = TempDir::new().unwrap();
    seed(&dir.path().join("state.json"));

    conductor(&dir)
        .args(["sweep-stale", "--dry-run", "--timeout", "30"])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""reclaimed_count":0"#));

    conductor(&dir)
        .args(["archive", "--dry-run", "--max-age", "7"])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""archived_count":0"#));
}

#[test]
fn test_corrupt_state_file_reports_error() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("state.json"), "{ not json").unwrap();

    conductor(&dir)
        .args(["claim", "--role", "dev"])
        .assert()
        .failure()
        .stdout(predicate::str::contains(r#""status":"error""#))
        .stdout(predicate::str::contains("malformed record"));
}

#[test]
fn test_missing_config_file_reports_error() {
    let dir = TempDir::new().unwrap();
    conductor(&dir)
        .args(["--config", "does-not-exist.toml", "health"])
        .assert()
        .failure()
        .stdout(predicate::str::contains(r#""status":"error""#));
}

#[test]
fn test_usage_errors_are_error_objects() {
    let dir = TempDir::new().unwrap();
    let missing_role = conductor(&dir).arg("claim").output().unwrap();
    assert!(!missing_role.status.success());
    let body = stdout_json(&missing_role);
    assert_eq!(body["status"], "error");
    assert!(body["message"].as_str().unwrap().contains("--role"));

    conductor(&dir)
        .args(["sweep-stale", "--timeout", "18446744073709551615"])
        .assert()
        .failure()
        .stdout(predicate::str::contains(r#""status":"error""#));
}

#[test]
fn test_help_is_not_an_error() {
    let dir = TempDir::new().unwrap();
    conductor(&dir)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("sweep-stale"));
}
