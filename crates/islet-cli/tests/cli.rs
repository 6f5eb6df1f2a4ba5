//! End-to-end tests for islet CLI commands.

#![allow(deprecated)] // Allow deprecated Command::cargo_bin for tests

use std::fs;
use std::path::PathBuf;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

// =============================================================================
// Test Helpers
// =============================================================================

fn islet() -> Command {
    Command::cargo_bin("islet").expect("islet binary should be built")
}

/// A temporary dispatcher configuration file.
struct TestConfig {
    _temp_dir: TempDir,
    path: PathBuf,
}

impl TestConfig {
    fn new(json: &str) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().join("islet.json");
        fs::write(&path, json).expect("Failed to write config");
        Self {
            _temp_dir: temp_dir,
            path,
        }
    }
}

// =============================================================================
// run
// =============================================================================

#[test]
fn test_run_prints_results_in_order() {
    islet()
        .args(["run", "mathlib.square:4", "mathlib.square:5"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[16,25]"));
}

#[test]
fn test_run_positional_arguments_from_list() {
    islet()
        .args(["run", "mathlib.add:[2, 3]", "mathlib.sum:[1, 2, 3, 4]"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[5,10]"));
}

#[test]
fn test_run_reports_failing_index() {
    islet()
        .args(["run", "mathlib.square:4", "mathlib.missing_fn:4"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("task 1 failed (resolution)"))
        .stderr(predicate::str::contains("missing_fn"))
        .stderr(predicate::str::contains("task 0 failed").not())
        .stderr(predicate::str::contains("1 of 2 tasks failed"));
}

#[test]
fn test_run_rejects_malformed_call() {
    islet()
        .args(["run", "square:4"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("expected namespace.name"));
}

#[test]
fn test_run_requires_at_least_one_call() {
    islet().arg("run").assert().failure();
}

#[test]
fn test_run_with_config_file() {
    let config = TestConfig::new(r#"{"thread_name_prefix": "cli-test"}"#);
    islet()
        .arg("--config")
        .arg(&config.path)
        .args(["run", "mathlib.factorial:10"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[3628800]"));
}

#[test]
fn test_run_rejects_invalid_config() {
    let config = TestConfig::new(r#"{"runtime": {"allow_spawning_daemon_threads": true}}"#);
    islet()
        .arg("--config")
        .arg(&config.path)
        .args(["run", "mathlib.square:4"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid configuration"));
}

#[test]
fn test_run_capability_fence_applies() {
    islet()
        .args(["run", "sys.spawn_thread"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("capability denied"));

    let config = TestConfig::new(r#"{"runtime": {"allow_spawning_threads": true}}"#);
    islet()
        .arg("--config")
        .arg(&config.path)
        .args(["run", "sys.spawn_thread"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[true]"));
}

// =============================================================================
// bench
// =============================================================================

#[test]
fn test_bench_all_modes_small_inputs() {
    islet()
        .args(["bench", "--tasks", "3", "--min", "1000", "--max", "1010"])
        .assert()
        .success()
        .stdout(predicate::str::contains("isolated"))
        .stdout(predicate::str::contains("shared"))
        .stdout(predicate::str::contains("native"))
        .stdout(predicate::str::contains("single"));
}

#[test]
fn test_bench_native_mode_only() {
    islet()
        .args(["bench", "--mode", "native", "--tasks", "2", "--min", "5", "--max", "5"])
        .assert()
        .success()
        .stdout(predicate::str::contains("native"))
        .stdout(predicate::str::contains("120"))
        .stdout(predicate::str::contains("isolated").not());
}

#[test]
fn test_bench_rejects_inverted_range() {
    islet()
        .args(["bench", "--min", "10", "--max", "5"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid range"));
}
