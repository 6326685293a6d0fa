//! Integration tests for the foreman CLI.
//!
//! Everything here runs against a throwaway project directory and never needs
//! tmux, git or the claude CLI.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// Helper to create a foreman Command
fn foreman() -> Command {
    cargo_bin_cmd!("foreman")
}

/// Helper to create a project with one spec covering every stage
fn create_project() -> TempDir {
    let dir = TempDir::new().unwrap();
    let spec = dir.path().join(".foreman/specs/auth");
    fs::create_dir_all(&spec).unwrap();
    fs::write(spec.join("srd.md"), "# Authentication\n\nUsers sign in.\n").unwrap();
    fs::write(
        spec.join("tasks.md"),
        "## Database\n- [ ] Users table\n\n## Backend\n- [ ] Login endpoint\n\n## Frontend\n- [ ] Login page\n\n## Testing\n- [ ] Login e2e\n",
    )
    .unwrap();
    dir
}

fn init_project(dir: &TempDir) {
    foreman()
        .current_dir(dir.path())
        .arg("init")
        .assert()
        .success();
}

fn read_state(dir: &TempDir) -> serde_json::Value {
    let text = fs::read_to_string(dir.path().join(".foreman/state.json")).unwrap();
    serde_json::from_str(&text).unwrap()
}

/// Mark a task assigned the way the scheduler would, without needing sessions.
fn assign(dir: &TempDir, task: &str, worker: &str) {
    let path = dir.path().join(".foreman/state.json");
    let mut state = read_state(dir);
    state["tasks"][task]["status"] = "assigned".into();
    state["tasks"][task]["assignedTo"] = worker.into();
    state["tasks"][task]["branch"] = format!("foreman/{}", task).into();
    state["workers"][worker]["status"] = "working".into();
    state["workers"][worker]["currentTask"] = task.into();
    let stage = state["tasks"][task]["stage"].as_str().unwrap().to_string();
    state["queues"][stage.as_str()] = serde_json::json!([]);
    fs::write(path, serde_json::to_string_pretty(&state).unwrap()).unwrap();
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_foreman_help() {
        foreman()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("report"));
    }

    #[test]
    fn test_foreman_version() {
        foreman().arg("--version").assert().success();
    }

    #[test]
    fn test_status_before_init() {
        let dir = TempDir::new().unwrap();
        foreman()
            .current_dir(dir.path())
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("foreman init"));
    }

    #[test]
    fn test_unknown_command_fails() {
        foreman().arg("deploy").assert().failure();
    }
}

// =============================================================================
// Init
// =============================================================================

mod init {
    use super::*;

    #[test]
    fn test_init_creates_state_with_first_stage_queued() {
        let dir = create_project();
        foreman()
            .current_dir(dir.path())
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("Authentication"))
            .stdout(predicate::str::contains("1 tasks ready"));

        let state = read_state(&dir);
        assert_eq!(state["stats"]["totalTasks"], 4);
        assert_eq!(state["queues"]["database"][0], "auth-001");
        assert!(state["queues"]["backend"].as_array().unwrap().is_empty());
        assert_eq!(state["tasks"]["auth-004"]["dependsOn"][0], "auth-003");
        assert_eq!(state["workers"]["fm-testing"]["status"], "idle");
        assert!(dir.path().join(".foreman/issues").is_dir());
    }

    #[test]
    fn test_init_dry_run_writes_nothing() {
        let dir = create_project();
        foreman()
            .current_dir(dir.path())
            .args(["init", "--dry-run"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Dry run"));
        assert!(!dir.path().join(".foreman/state.json").exists());
    }

    #[test]
    fn test_init_twice_needs_force() {
        let dir = create_project();
        init_project(&dir);
        foreman()
            .current_dir(dir.path())
            .arg("init")
            .assert()
            .failure()
            .stderr(predicate::str::contains("--force"));
        foreman()
            .current_dir(dir.path())
            .args(["init", "--force"])
            .assert()
            .success();
    }

    /// Write an executable stand-in for the claude CLI that prints `output`.
    fn fake_claude(dir: &TempDir, output: &str) -> String {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.path().join("fake-claude");
        fs::write(
            &path,
            format!("#!/bin/sh\ncat > /dev/null\ncat <<'EOF'\n{}\nEOF\n", output),
        )
        .unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn test_init_reconcile_marks_existing_work() {
        let dir = create_project();
        fs::create_dir_all(dir.path().join("migrations")).unwrap();
        fs::write(dir.path().join("migrations/001_users.sql"), "create table users();").unwrap();
        let bin = TempDir::new().unwrap();
        let claude = fake_claude(
            &bin,
            r#"{"tasks": [{"id": "auth-001", "implemented": true, "evidence": "migrations/001_users.sql"}]}"#,
        );

        foreman()
            .current_dir(dir.path())
            .env("CLAUDE_CMD", &claude)
            .args(["init", "--reconcile"])
            .assert()
            .success()
            .stdout(predicate::str::contains("1 tasks already implemented"));

        let state = read_state(&dir);
        assert_eq!(state["tasks"]["auth-001"]["status"], "merged");
        assert_eq!(state["tasks"]["auth-001"]["reconciled"], "migrations/001_users.sql");
        assert_eq!(state["stats"]["completedTasks"], 1);
        assert!(state["queues"]["database"].as_array().unwrap().is_empty());
        assert_eq!(state["queues"]["backend"][0], "auth-002");
    }

    #[test]
    fn test_init_reconcile_failure_keeps_plan() {
        let dir = create_project();
        let bin = TempDir::new().unwrap();
        let claude = fake_claude(&bin, "nothing to report");

        foreman()
            .current_dir(dir.path())
            .env("CLAUDE_CMD", &claude)
            .args(["init", "--reconcile"])
            .assert()
            .success()
            .stdout(predicate::str::contains("reconciliation skipped"));

        let state = read_state(&dir);
        assert_eq!(state["tasks"]["auth-001"]["status"], "pending");
        assert_eq!(state["queues"]["database"][0], "auth-001");
    }

    #[test]
    fn test_init_without_specs_fails() {
        let dir = TempDir::new().unwrap();
        foreman()
            .current_dir(dir.path())
            .arg("init")
            .assert()
            .failure()
            .stderr(predicate::str::contains("No specs directory"));
    }
}

// =============================================================================
// Worker self-reports
// =============================================================================

mod reports {
    use super::*;

    #[test]
    fn test_start_verify_complete_waits_for_review() {
        let dir = create_project();
        init_project(&dir);
        assign(&dir, "auth-001", "fm-database");

        for step in ["start", "verify"] {
            foreman()
                .current_dir(dir.path())
                .args(["report", step, "auth-001"])
                .assert()
                .success();
        }
        foreman()
            .current_dir(dir.path())
            .args(["report", "complete", "auth-001", "--files", "db/users.sql,db/seed.sql"])
            .assert()
            .success()
            .stdout(predicate::str::contains("waiting for review"));

        let state = read_state(&dir);
        assert_eq!(state["tasks"]["auth-001"]["status"], "completed");
        assert_eq!(state["tasks"]["auth-001"]["filesChanged"][1], "db/seed.sql");
        assert_eq!(state["workers"]["fm-database"]["status"], "verifying");
    }

    #[test]
    fn test_complete_unassigned_task_is_rejected() {
        let dir = create_project();
        init_project(&dir);
        foreman()
            .current_dir(dir.path())
            .args(["report", "complete", "auth-002"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("auth-002"));
        assert_eq!(read_state(&dir)["tasks"]["auth-002"]["status"], "pending");
    }

    #[test]
    fn test_three_failures_make_a_task_stuck_then_revive() {
        let dir = create_project();
        init_project(&dir);

        for attempt in 1..=3 {
            assign(&dir, "auth-001", "fm-database");
            let expected = if attempt < 3 { "back in the queue" } else { "now stuck" };
            foreman()
                .current_dir(dir.path())
                .args(["report", "fail", "auth-001", "--reason", "compile error"])
                .assert()
                .success()
                .stdout(predicate::str::contains(expected));
        }

        let state = read_state(&dir);
        assert_eq!(state["tasks"]["auth-001"]["status"], "stuck");
        assert_eq!(state["tasks"]["auth-001"]["stuckReason"], "compile error");
        assert_eq!(state["stats"]["stuckTasks"], 1);
        assert_eq!(state["workers"]["fm-database"]["status"], "stuck");

        // Advice recorded by the oracle during a run shows up next to the task.
        let mut state = state;
        state["tasks"]["auth-001"]["oracleGuidance"] = serde_json::json!({
            "providedAt": "2026-01-01T00:00:00Z",
            "analysis": "the build script is missing",
            "guidance": "add build.rs before the migration",
            "escalate": false,
            "path": ".foreman/oracle/guidance-auth-001.md"
        });
        fs::write(
            dir.path().join(".foreman/state.json"),
            serde_json::to_string_pretty(&state).unwrap(),
        )
        .unwrap();

        foreman()
            .current_dir(dir.path())
            .arg("stuck")
            .assert()
            .success()
            .stdout(predicate::str::contains("compile error"))
            .stdout(predicate::str::contains("add build.rs before the migration"));

        foreman()
            .current_dir(dir.path())
            .args(["revive", "auth-001"])
            .assert()
            .success();
        let state = read_state(&dir);
        assert_eq!(state["tasks"]["auth-001"]["status"], "pending");
        assert_eq!(state["queues"]["database"][0], "auth-001");
        assert_eq!(state["workers"]["fm-database"]["status"], "idle");
    }
}

// =============================================================================
// Operator controls
// =============================================================================

mod controls {
    use super::*;

    #[test]
    fn test_pause_resume_stop() {
        let dir = create_project();
        init_project(&dir);

        foreman()
            .current_dir(dir.path())
            .arg("pause")
            .assert()
            .success()
            .stdout(predicate::str::contains("Paused"));
        assert_eq!(read_state(&dir)["orchestrator"]["status"], "paused");

        foreman()
            .current_dir(dir.path())
            .arg("pause")
            .assert()
            .success()
            .stdout(predicate::str::contains("Already paused"));

        foreman()
            .current_dir(dir.path())
            .arg("resume")
            .assert()
            .success();
        assert_eq!(read_state(&dir)["orchestrator"]["status"], "active");

        foreman()
            .current_dir(dir.path())
            .arg("stop")
            .assert()
            .success();
        assert_eq!(read_state(&dir)["orchestrator"]["status"], "stopped");
    }

    #[test]
    fn test_paused_run_once_records_poll_only() {
        let dir = create_project();
        init_project(&dir);
        foreman()
            .current_dir(dir.path())
            .arg("pause")
            .assert()
            .success();

        foreman()
            .current_dir(dir.path())
            .args(["run", "--once"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Paused"));

        let state = read_state(&dir);
        assert_eq!(state["orchestrator"]["totalPolls"], 1);
        assert_eq!(state["tasks"]["auth-001"]["status"], "pending");
    }

    #[test]
    fn test_run_without_state_fails() {
        let dir = TempDir::new().unwrap();
        foreman()
            .current_dir(dir.path())
            .args(["run", "--once"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("foreman init"));
    }

    #[test]
    fn test_status_shows_queues_and_workers() {
        let dir = create_project();
        init_project(&dir);
        foreman()
            .current_dir(dir.path())
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("0/4 merged"))
            .stdout(predicate::str::contains("fm-database"))
            .stdout(predicate::str::contains("auth-001"));
    }

    #[test]
    fn test_reset_force() {
        let dir = create_project();
        init_project(&dir);
        foreman()
            .current_dir(dir.path())
            .args(["reset", "--force"])
            .assert()
            .success();
        assert!(!dir.path().join(".foreman/state.json").exists());
    }
}

// =============================================================================
// Configuration
// =============================================================================

mod config {
    use super::*;

    #[test]
    fn test_config_init_then_validate() {
        let dir = TempDir::new().unwrap();
        foreman()
            .current_dir(dir.path())
            .args(["config", "init"])
            .assert()
            .success();
        assert!(dir.path().join(".foreman/foreman.toml").exists());

        foreman()
            .current_dir(dir.path())
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration is valid"));
    }

    #[test]
    fn test_config_show_reflects_file() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join(".foreman")).unwrap();
        fs::write(
            dir.path().join(".foreman/foreman.toml"),
            "[orchestrator]\npoll_interval_secs = 5\n",
        )
        .unwrap();
        foreman()
            .current_dir(dir.path())
            .env_remove("FOREMAN_POLL_INTERVAL")
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("poll_interval_secs = 5"));
    }

    #[test]
    fn test_custom_worker_prefix() {
        let dir = create_project();
        fs::write(
            dir.path().join(".foreman/foreman.toml"),
            "[sessions]\nprefix = \"shop-\"\n",
        )
        .unwrap();
        init_project(&dir);
        let state = read_state(&dir);
        assert!(state["workers"].get("shop-backend").is_some());
    }
}
