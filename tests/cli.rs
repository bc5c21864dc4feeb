//! Integration tests for the forgeflow binary.
//!
//! Each test runs in its own temp directory so the default
//! `.forgeflow/flow.toml` and `.forgeflow/flow.db` paths stay isolated.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

fn forgeflow(dir: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("forgeflow");
    cmd.current_dir(dir.path())
        .env_remove("FORGEFLOW_CONFIG")
        .env_remove("FORGEFLOW_DB")
        .env_remove("FORGEFLOW_TRACKER_URL")
        .env_remove("RUST_LOG");
    cmd
}

fn init_project(dir: &TempDir) {
    forgeflow(dir).arg("init").assert().success();
}

fn write_event(dir: &TempDir, name: &str, body: &str) -> String {
    let path = dir.path().join(name);
    fs::write(&path, body).unwrap();
    path.to_string_lossy().to_string()
}

// =============================================================================
// Basics
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_help_lists_commands() {
        let dir = TempDir::new().unwrap();
        forgeflow(&dir)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("serve"))
            .stdout(predicate::str::contains("replay"));
    }

    #[test]
    fn test_version() {
        let dir = TempDir::new().unwrap();
        forgeflow(&dir).arg("--version").assert().success();
    }

    #[test]
    fn test_init_creates_config_and_database() {
        let dir = TempDir::new().unwrap();
        forgeflow(&dir)
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("Created"));

        assert!(dir.path().join(".forgeflow/flow.toml").exists());
        assert!(dir.path().join(".forgeflow/flow.db").exists());
        let content = fs::read_to_string(dir.path().join(".forgeflow/flow.toml")).unwrap();
        assert!(content.contains("Needs Refinement"));
    }

    #[test]
    fn test_init_does_not_overwrite_without_force() {
        let dir = TempDir::new().unwrap();
        init_project(&dir);
        forgeflow(&dir)
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("already exists"));
        forgeflow(&dir)
            .args(["init", "--force"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Created"));
    }
}

// =============================================================================
// Configuration
// =============================================================================

mod config {
    use super::*;

    #[test]
    fn test_validate_default_config_warns_about_tracker() {
        let dir = TempDir::new().unwrap();
        init_project(&dir);
        forgeflow(&dir)
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("tracker.base_url is not set"));
    }

    #[test]
    fn test_validate_rejects_duplicate_statuses() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("flow.toml"),
            "[[statuses]]\nname = \"Todo\"\n\n[[statuses]]\nname = \"todo\"\n",
        )
        .unwrap();
        forgeflow(&dir)
            .args(["--config", "flow.toml", "config", "validate"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Duplicate status"));
    }

    #[test]
    fn test_show_renders_toml() {
        let dir = TempDir::new().unwrap();
        forgeflow(&dir)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("showing defaults"))
            .stdout(predicate::str::contains("[server]"));
    }

    #[test]
    fn test_statuses_prints_default_lifecycle() {
        let dir = TempDir::new().unwrap();
        forgeflow(&dir)
            .arg("statuses")
            .assert()
            .success()
            .stdout(predicate::str::contains("Needs Refinement"))
            .stdout(predicate::str::contains("cascade"))
            .stdout(predicate::str::contains("Code Generation Ready"));
    }
}

// =============================================================================
// Store inspection and replay
// =============================================================================

mod operations {
    use super::*;

    #[test]
    fn test_runs_and_questions_on_empty_store() {
        let dir = TempDir::new().unwrap();
        init_project(&dir);
        forgeflow(&dir)
            .arg("runs")
            .assert()
            .success()
            .stdout(predicate::str::contains("No runs."));
        forgeflow(&dir)
            .arg("questions")
            .assert()
            .success()
            .stdout(predicate::str::contains("No pending questions."));
    }

    #[test]
    fn test_questions_rejects_unknown_state() {
        let dir = TempDir::new().unwrap();
        init_project(&dir);
        forgeflow(&dir)
            .args(["questions", "--state", "bogus"])
            .assert()
            .failure();
    }

    #[test]
    fn test_replay_unknown_status_is_no_trigger() {
        let dir = TempDir::new().unwrap();
        init_project(&dir);
        let event = write_event(
            &dir,
            "event.json",
            r#"{"eventType":"issue","action":"update","itemId":"item-1","status":"Someday"}"#,
        );
        forgeflow(&dir)
            .args(["replay", &event])
            .assert()
            .success()
            .stdout(predicate::str::contains("no_trigger"))
            .stdout(predicate::str::contains("unknown_status"));
        forgeflow(&dir)
            .arg("runs")
            .assert()
            .success()
            .stdout(predicate::str::contains("No runs."));
    }

    #[test]
    fn test_replay_redelivery_is_dropped_across_processes() {
        let dir = TempDir::new().unwrap();
        init_project(&dir);
        let event = write_event(
            &dir,
            "created.json",
            r#"{"eventType":"issue","action":"create","itemId":"item-1","status":"Backlog","deliveryId":"d-1"}"#,
        );
        forgeflow(&dir)
            .args(["replay", &event])
            .assert()
            .success()
            .stdout(predicate::str::contains("registered"));
        forgeflow(&dir)
            .args(["replay", &event])
            .assert()
            .success()
            .stdout(predicate::str::contains("duplicate"));
    }

    #[test]
    fn test_replay_malformed_event() {
        let dir = TempDir::new().unwrap();
        init_project(&dir);
        let event = write_event(&dir, "bad.json", "{\"eventType\":\"issue\"}");
        forgeflow(&dir)
            .args(["replay", &event])
            .assert()
            .success()
            .stdout(predicate::str::contains("malformed"));
    }

    #[test]
    fn test_cancel_unknown_run_fails() {
        let dir = TempDir::new().unwrap();
        init_project(&dir);
        forgeflow(&dir)
            .args(["cancel", "no-such-run"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("not found"));
    }

    #[test]
    fn test_sweep_with_nothing_overdue() {
        let dir = TempDir::new().unwrap();
        init_project(&dir);
        forgeflow(&dir)
            .arg("sweep")
            .assert()
            .success()
            .stdout(predicate::str::contains("No overdue questions."));
    }
}
