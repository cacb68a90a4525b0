//! CLI integration tests for the Stagegate command-line interface.
//!
//! These tests verify:
//! - Help text is displayed correctly
//! - Workflow files are validated and rehearsed end to end
//! - Invalid inputs are rejected with appropriate messages
//!
//! Every test points `--config-dir` at a temp dir so no user config or log
//! directory is touched.

use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

const RELEASE: &str = r#"
[workflow]
id = "release"
title = "Release"

[workflow.input]
coverage = 72

[[workflow.stages]]
id = "build"
type = "implementation"

[[workflow.stages.steps]]
id = "compile"

[workflow.stages.gate]
threshold = 0.8

[[workflow.stages.gate.checks]]
name = "coverage"
kind = "test_coverage"
params = { key = "input.coverage", min = 80 }

[[workflow.stages]]
id = "ship"
type = "deployment"

[[workflow.stages.steps]]
id = "publish"
"#;

/// Get a command for the stagegate binary, isolated in `dir`.
fn stagegate(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("stagegate").unwrap();
    cmd.current_dir(dir)
        .env_remove("STAGEGATE_CONFIG_DIR")
        .args(["--config-dir", dir.to_str().unwrap()]);
    cmd
}

fn workspace_with(contents: &str) -> (TempDir, std::path::PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("workflow.toml");
    std::fs::write(&file, contents).unwrap();
    (dir, file)
}

// ─────────────────────────────────────────────────────────────────────────────
// Help and Version Tests
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_help_lists_subcommands() {
    let dir = tempfile::tempdir().unwrap();
    stagegate(dir.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Stagegate"))
        .stdout(predicate::str::contains("validate"))
        .stdout(predicate::str::contains("rehearse"))
        .stdout(predicate::str::contains("config"));
}

#[test]
fn test_version_displays() {
    let dir = tempfile::tempdir().unwrap();
    stagegate(dir.path())
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("stagegate"));
}

#[test]
fn test_unknown_subcommand_rejected() {
    let dir = tempfile::tempdir().unwrap();
    stagegate(dir.path())
        .arg("launch")
        .assert()
        .failure()
        .stderr(predicate::str::contains("unrecognized subcommand"));
}

// ─────────────────────────────────────────────────────────────────────────────
// Validate
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_validate_valid_workflow() {
    let (dir, file) = workspace_with(RELEASE);
    stagegate(dir.path())
        .arg("validate")
        .arg(&file)
        .assert()
        .success()
        .stdout(predicate::str::contains("Release"))
        .stdout(predicate::str::contains("build-gate"));
}

#[test]
fn test_validate_json_output() {
    let (dir, file) = workspace_with(RELEASE);
    let output = stagegate(dir.path())
        .args(["--json", "validate"])
        .arg(&file)
        .output()
        .unwrap();
    assert!(output.status.success());

    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["valid"], true);
    assert_eq!(json["stages"][0]["stage_type"], "implementation");
    assert_eq!(json["stages"][0]["checks"], 1);
    assert!(json["stages"][1]["gate"].is_null());
}

#[test]
fn test_validate_rejects_duplicate_stage() {
    let (dir, file) = workspace_with(
        r#"
[workflow]
title = "Dup"

[[workflow.stages]]
id = "a"
type = "custom"

[[workflow.stages]]
id = "a"
type = "review"
"#,
    );
    stagegate(dir.path())
        .arg("validate")
        .arg(&file)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Duplicate stage ID: a"));
}

#[test]
fn test_validate_rejects_unknown_stage_type() {
    let (dir, file) = workspace_with(
        r#"
[workflow]
title = "Bad"

[[workflow.stages]]
id = "a"
type = "teleport"
"#,
    );
    stagegate(dir.path())
        .arg("validate")
        .arg(&file)
        .assert()
        .failure()
        .stderr(predicate::str::contains("TOML parse error"));
}

#[test]
fn test_validate_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    stagegate(dir.path())
        .args(["validate", "nope.toml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read"));
}

// ─────────────────────────────────────────────────────────────────────────────
// Rehearse
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_rehearse_blocking_gate_fails() {
    let (dir, file) = workspace_with(RELEASE);
    stagegate(dir.path())
        .arg("rehearse")
        .arg(&file)
        .assert()
        .failure()
        .stdout(predicate::str::contains("gate build-gate failed"))
        .stdout(predicate::str::contains("workflow failed at build"))
        .stderr(predicate::str::contains("Rehearsal failed"));
}

#[test]
fn test_rehearse_input_override_passes_gate() {
    let (dir, file) = workspace_with(RELEASE);
    stagegate(dir.path())
        .arg("rehearse")
        .arg(&file)
        .args(["--input", "coverage=91"])
        .assert()
        .success()
        .stdout(predicate::str::contains("gate build-gate passed"))
        .stdout(predicate::str::contains("ship complete"))
        .stdout(predicate::str::contains("workflow completed"));
}

#[test]
fn test_rehearse_skip_gates() {
    let (dir, file) = workspace_with(RELEASE);
    stagegate(dir.path())
        .arg("rehearse")
        .arg(&file)
        .arg("--skip-gates")
        .assert()
        .success()
        .stdout(predicate::str::contains("workflow completed"))
        .stdout(predicate::str::contains("gate").not());
}

#[test]
fn test_rehearse_json_events() {
    let (dir, file) = workspace_with(RELEASE);
    let output = stagegate(dir.path())
        .args(["--json", "rehearse"])
        .arg(&file)
        .args(["-i", "coverage=95"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let events: Vec<serde_json::Value> = String::from_utf8(output.stdout)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(events.first().unwrap()["event"], "workflow_start");
    assert_eq!(events.last().unwrap()["event"], "workflow_complete");
    assert!(events.iter().any(|e| e["event"] == "gate_passed"));
    assert!(events.iter().all(|e| e["workflow_id"] == "release"));
}

#[test]
fn test_rehearse_rejects_bad_input() {
    let (dir, file) = workspace_with(RELEASE);
    stagegate(dir.path())
        .arg("rehearse")
        .arg(&file)
        .args(["--input", "coverage"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("expected KEY=VALUE"));
}

// ─────────────────────────────────────────────────────────────────────────────
// Config
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_config_path_uses_config_dir() {
    let dir = tempfile::tempdir().unwrap();
    let expected = dir.path().join("config.toml");
    stagegate(dir.path())
        .args(["config", "path"])
        .assert()
        .success()
        .stdout(predicate::str::contains(expected.to_str().unwrap()));
}

#[test]
fn test_config_show_defaults() {
    let dir = tempfile::tempdir().unwrap();
    stagegate(dir.path())
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("not found"))
        .stdout(predicate::str::contains("[pipeline]"))
        .stdout(predicate::str::contains("max_snapshots = 10"));
}

#[test]
fn test_config_show_layers_user_and_project() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("config.toml"),
        "[pipeline]\nmax_retries = 7\n\n[logging]\nfile = false\n",
    )
    .unwrap();
    std::fs::write(dir.path().join("stagegate.toml"), "[snapshots]\nmax_snapshots = 4\n").unwrap();

    let output = stagegate(dir.path())
        .args(["--json", "config", "show"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["config"]["pipeline"]["max_retries"], 7);
    assert_eq!(json["config"]["snapshots"]["max_snapshots"], 4);
    assert_eq!(json["config"]["logging"]["file"], false);
    let loaded: Vec<_> = json["sources"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|s| s["loaded"] == true)
        .collect();
    assert_eq!(loaded.len(), 2);
    assert_eq!(loaded[0]["layer"], "user");
    assert_eq!(loaded[1]["layer"], "project");
}

#[test]
fn test_file_logging_writes_under_config_dir() {
    let (dir, file) = workspace_with(RELEASE);
    stagegate(dir.path()).arg("validate").arg(&file).assert().success();
    assert!(dir.path().join("logs").is_dir());
}
