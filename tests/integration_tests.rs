//! Integration tests for the placescout binary.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

fn placescout() -> Command {
    cargo_bin_cmd!("placescout")
}

/// A temp directory holding a config whose paths all point inside it.
fn project() -> TempDir {
    let dir = TempDir::new().unwrap();
    let config = format!(
        r#"
[database]
path = "{root}/storage/placescout.db"

[pipeline]
project_root = "{root}"
state_dir = "{root}/state"
command = ["sh", "-c", "echo hello"]
retention_days = 30

[campaign]
relay_token = "super-secret"
"#,
        root = dir.path().display()
    );
    fs::write(dir.path().join("placescout.toml"), config).unwrap();
    dir
}

fn in_project(dir: &TempDir) -> Command {
    let mut cmd = placescout();
    cmd.current_dir(dir.path());
    cmd
}

mod cli_basics {
    use super::*;

    #[test]
    fn test_help() {
        placescout()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("serve"))
            .stdout(predicate::str::contains("init-db"));
    }

    #[test]
    fn test_version() {
        placescout()
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("placescout"));
    }

    #[test]
    fn test_unknown_subcommand_fails() {
        placescout().arg("frobnicate").assert().failure();
    }
}

mod store {
    use super::*;

    #[test]
    fn test_init_db_creates_database() {
        let dir = project();
        in_project(&dir)
            .arg("init-db")
            .assert()
            .success()
            .stdout(predicate::str::contains("Database initialized"));
        assert!(dir.path().join("storage/placescout.db").exists());
    }

    #[test]
    fn test_init_db_is_idempotent() {
        let dir = project();
        in_project(&dir).arg("init-db").assert().success();
        in_project(&dir).arg("init-db").assert().success();
    }

    #[test]
    fn test_prune_on_empty_store() {
        let dir = project();
        in_project(&dir)
            .arg("prune")
            .assert()
            .success()
            .stdout(predicate::str::contains("Pruned 0 pipeline run(s)"));
    }

    #[test]
    fn test_prune_disabled() {
        let dir = project();
        in_project(&dir)
            .args(["prune", "--days", "0"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Retention is disabled"));
    }
}

mod status {
    use super::*;

    #[test]
    fn test_status_idle_json() {
        let dir = project();
        let output = in_project(&dir).arg("status").output().unwrap();
        assert!(output.status.success());
        let view: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        assert_eq!(view["status"], "IDLE");
        assert_eq!(view["running"], false);
        assert!(view["run_id"].is_null());
    }
}

mod configuration {
    use super::*;

    #[test]
    fn test_config_show_uses_file_and_redacts_token() {
        let dir = project();
        in_project(&dir)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[pipeline]"))
            .stdout(predicate::str::contains("echo hello"))
            .stdout(predicate::str::contains("super-secret").not());
    }

    #[test]
    fn test_config_show_defaults_without_file() {
        let dir = TempDir::new().unwrap();
        in_project(&dir)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No config file"))
            .stdout(predicate::str::contains("port = 8010"));
    }

    #[test]
    fn test_config_init_prints_defaults() {
        placescout()
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[campaign]"))
            .stdout(predicate::str::contains("batch_size = 50"));
    }

    #[test]
    fn test_invalid_config_fails() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("placescout.toml"), "[server\nport = ").unwrap();
        in_project(&dir)
            .arg("status")
            .assert()
            .failure()
            .stderr(predicate::str::contains("Failed to parse"));
    }
}
