//! Integration tests for the adw binary.
//!
//! Each test works in its own temporary project directory and talks to no
//! issue tracker or monitor.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

/// Helper to create an adw Command isolated from the caller's environment
fn adw(dir: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("adw");
    cmd.current_dir(dir.path())
        .env_remove("ADW_PROJECT_DIR")
        .env_remove("ADW_STATE_DIR")
        .env_remove("ADW_TREES_DIR")
        .env_remove("ADW_SERVER_PORT")
        .env_remove("ADW_EXECUTOR")
        .env("ADW_NOTIFY_URL", "")
        .env("RUST_LOG", "error");
    cmd
}

fn create_temp_project() -> TempDir {
    TempDir::new().unwrap()
}

/// Write a state record the way a phase executor would.
fn write_state(dir: &Path, adw_id: &str, body: serde_json::Value) {
    let workflow_dir = dir.join("agents").join(adw_id);
    fs::create_dir_all(&workflow_dir).unwrap();
    fs::write(
        workflow_dir.join("adw_state.json"),
        serde_json::to_string_pretty(&body).unwrap(),
    )
    .unwrap();
}

fn read_state(dir: &Path, adw_id: &str) -> serde_json::Value {
    let content = fs::read_to_string(dir.join("agents").join(adw_id).join("adw_state.json")).unwrap();
    serde_json::from_str(&content).unwrap()
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_adw_help() {
        let dir = create_temp_project();
        adw(&dir)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("run"))
            .stdout(predicate::str::contains("serve"));
    }

    #[test]
    fn test_adw_version() {
        let dir = create_temp_project();
        adw(&dir).arg("--version").assert().success();
    }

    #[test]
    fn test_run_rejects_unknown_template() {
        let dir = create_temp_project();
        adw(&dir)
            .args(["run", "42", "--template", "waterfall"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid workflow template"));
    }

    #[test]
    fn test_run_rejects_unknown_phase() {
        let dir = create_temp_project();
        adw(&dir)
            .args(["run", "42", "--from", "deploy"])
            .assert()
            .failure();
    }
}

// =============================================================================
// Configuration
// =============================================================================

mod config {
    use super::*;

    #[test]
    fn test_config_init_creates_file() {
        let dir = create_temp_project();
        adw(&dir)
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Created adw.toml"));

        let content = fs::read_to_string(dir.path().join(".adw/adw.toml")).unwrap();
        assert!(content.contains("[ports]"));
        assert!(content.contains("backend_start = 9100"));
    }

    #[test]
    fn test_config_init_does_not_overwrite() {
        let dir = create_temp_project();
        fs::create_dir_all(dir.path().join(".adw")).unwrap();
        fs::write(dir.path().join(".adw/adw.toml"), "[ports]\npool_size = 3\n").unwrap();

        adw(&dir)
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("already exists"));

        let content = fs::read_to_string(dir.path().join(".adw/adw.toml")).unwrap();
        assert_eq!(content, "[ports]\npool_size = 3\n");
    }

    #[test]
    fn test_config_show_defaults() {
        let dir = create_temp_project();
        adw(&dir)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Using defaults"))
            .stdout(predicate::str::contains("pool_size = 15"));
    }

    #[test]
    fn test_config_show_reads_file_and_env() {
        let dir = create_temp_project();
        fs::create_dir_all(dir.path().join(".adw")).unwrap();
        fs::write(dir.path().join(".adw/adw.toml"), "[ports]\npool_size = 4\n").unwrap();

        adw(&dir)
            .env("ADW_SERVER_PORT", "8123")
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("pool_size = 4"))
            .stdout(predicate::str::contains("port = 8123"));
    }

    #[test]
    fn test_invalid_config_is_reported() {
        let dir = create_temp_project();
        fs::create_dir_all(dir.path().join(".adw")).unwrap();
        fs::write(dir.path().join(".adw/adw.toml"), "[ports\n").unwrap();

        adw(&dir)
            .args(["status", "--no-external"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("adw.toml"));
    }
}

// =============================================================================
// Allocation and conflicts
// =============================================================================

mod resources {
    use super::*;

    #[test]
    fn test_allocate_assigns_first_free_pair() {
        let dir = create_temp_project();
        write_state(
            dir.path(),
            "abc12345",
            serde_json::json!({"adw_id": "abc12345", "issue_number": "42"}),
        );

        adw(&dir)
            .args(["allocate", "abc12345"])
            .assert()
            .success()
            .stdout(predicate::str::contains("9100"))
            .stdout(predicate::str::contains("9200"));

        let state = read_state(dir.path(), "abc12345");
        assert_eq!(state["backend_port"], 9100);
        assert_eq!(state["frontend_port"], 9200);
        assert!(state["worktree_path"].as_str().unwrap().ends_with("trees/abc12345"));
    }

    #[test]
    fn test_allocate_is_idempotent() {
        let dir = create_temp_project();
        write_state(
            dir.path(),
            "abc12345",
            serde_json::json!({"adw_id": "abc12345", "issue_number": 42}),
        );
        adw(&dir).args(["allocate", "abc12345"]).assert().success();
        adw(&dir).args(["allocate", "abc12345"]).assert().success();

        let state = read_state(dir.path(), "abc12345");
        assert_eq!(state["backend_port"], 9100);
    }

    #[test]
    fn test_allocate_skips_claimed_ports() {
        let dir = create_temp_project();
        write_state(
            dir.path(),
            "first111",
            serde_json::json!({
                "adw_id": "first111",
                "issue_number": "1",
                "backend_port": 9100,
                "frontend_port": 9200,
                "worktree_path": "trees/first111"
            }),
        );
        write_state(
            dir.path(),
            "second22",
            serde_json::json!({"adw_id": "second22", "issue_number": "2"}),
        );

        adw(&dir).args(["allocate", "second22"]).assert().success();
        let state = read_state(dir.path(), "second22");
        assert_eq!(state["backend_port"], 9101);
        assert_eq!(state["frontend_port"], 9201);
    }

    #[test]
    fn test_allocate_preserves_unknown_fields() {
        let dir = create_temp_project();
        write_state(
            dir.path(),
            "abc12345",
            serde_json::json!({
                "adw_id": "abc12345",
                "issue_number": "42",
                "model_set": "heavy"
            }),
        );
        adw(&dir).args(["allocate", "abc12345"]).assert().success();
        assert_eq!(read_state(dir.path(), "abc12345")["model_set"], "heavy");
    }

    #[test]
    fn test_allocate_unknown_workflow_fails() {
        let dir = create_temp_project();
        adw(&dir)
            .args(["allocate", "missing1"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("No state found"));
    }

    #[test]
    fn test_allocate_rejects_path_like_id() {
        let dir = create_temp_project();
        adw(&dir)
            .args(["allocate", "../escape"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid workflow id"));
    }

    #[test]
    fn test_conflicts_reports_shared_ports() {
        let dir = create_temp_project();
        for id in ["first111", "second22"] {
            write_state(
                dir.path(),
                id,
                serde_json::json!({
                    "adw_id": id,
                    "issue_number": "7",
                    "backend_port": 9105,
                    "frontend_port": 9205,
                    "worktree_path": format!("trees/{id}")
                }),
            );
        }

        adw(&dir)
            .args(["conflicts", "first111"])
            .assert()
            .success()
            .stdout(predicate::str::contains("second22"))
            .stdout(predicate::str::contains("9105"));
    }

    #[test]
    fn test_conflicts_none() {
        let dir = create_temp_project();
        write_state(
            dir.path(),
            "alone111",
            serde_json::json!({"adw_id": "alone111", "issue_number": "7"}),
        );
        adw(&dir)
            .args(["conflicts", "alone111"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No conflicts"));
    }

    #[test]
    fn test_cleanup_unknown_workflow_fails() {
        let dir = create_temp_project();
        adw(&dir)
            .args(["cleanup", "missing1"])
            .assert()
            .failure();
    }
}

// =============================================================================
// Status and health
// =============================================================================

mod monitoring {
    use super::*;

    #[test]
    fn test_status_json_empty() {
        let dir = create_temp_project();
        let output = adw(&dir)
            .args(["status", "--json", "--no-external"])
            .assert()
            .success()
            .get_output()
            .stdout
            .clone();
        let snapshot: serde_json::Value = serde_json::from_slice(&output).unwrap();
        assert_eq!(snapshot["summary"]["total"], 0);
        assert!(snapshot["workflows"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_status_lists_workflows_and_corrupt_records() {
        let dir = create_temp_project();
        write_state(
            dir.path(),
            "good1234",
            serde_json::json!({
                "adw_id": "good1234",
                "issue_number": "42",
                "status": "completed",
                "completed_phases": ["plan", "validate", "build"],
                "workflow_template": "plan_build"
            }),
        );
        let corrupt_dir = dir.path().join("agents/bad12345");
        fs::create_dir_all(&corrupt_dir).unwrap();
        fs::write(corrupt_dir.join("adw_state.json"), "{not json").unwrap();

        let output = adw(&dir)
            .args(["status", "--json", "--no-external"])
            .assert()
            .success()
            .get_output()
            .stdout
            .clone();
        let snapshot: serde_json::Value = serde_json::from_slice(&output).unwrap();
        assert_eq!(snapshot["summary"]["total"], 2);
        assert_eq!(snapshot["summary"]["completed"], 1);

        let workflows = snapshot["workflows"].as_array().unwrap();
        let bad = workflows.iter().find(|w| w["adw_id"] == "bad12345").unwrap();
        assert_eq!(bad["status"], "unknown");
        assert!(bad["error"].is_string());
    }

    #[test]
    fn test_status_table() {
        let dir = create_temp_project();
        write_state(
            dir.path(),
            "good1234",
            serde_json::json!({"adw_id": "good1234", "issue_number": "42"}),
        );
        adw(&dir)
            .args(["status", "--no-external"])
            .assert()
            .success()
            .stdout(predicate::str::contains("good1234"))
            .stdout(predicate::str::contains("1 total"));
    }

    #[test]
    fn test_health_missing_workflow_is_critical() {
        let dir = create_temp_project();
        let output = adw(&dir)
            .args(["health", "missing1", "--json"])
            .assert()
            .success()
            .get_output()
            .stdout
            .clone();
        let report: serde_json::Value = serde_json::from_slice(&output).unwrap();
        assert_eq!(report["overall"], "critical");
        assert_eq!(report["checks"]["state_file"]["status"], "critical");
    }
}
