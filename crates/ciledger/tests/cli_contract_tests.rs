//! CLI command contract tests.
//!
//! Runs the real binary against a temp workspace and checks:
//! - Deterministic exit codes (blocked checks and exceeded alerts exit 1)
//! - Stable JSON output for `--json`
//! - Refusals leave state untouched
//! - Concurrent processes never lose ledger writes

use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime};

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use tempfile::TempDir;

// =============================================================================
// Test fixture helpers
// =============================================================================

/// Create a temp workspace with a config that tolerates heavy contention.
fn setup_workspace() -> TempDir {
    let dir = TempDir::new().expect("create temp dir");
    fs::write(
        dir.path().join("ciledger.toml"),
        "[lock]\ntimeout_ms = 60000\nbase_backoff_ms = 5\nmax_backoff_ms = 50\n",
    )
    .expect("write config");
    dir
}

/// Workspace with a pricing config declaring limits for `gemini`.
fn setup_priced_workspace(limits: &str) -> TempDir {
    let dir = setup_workspace();
    let pricing_dir = dir.path().join("ci/config");
    fs::create_dir_all(&pricing_dir).expect("create pricing dir");
    fs::write(
        pricing_dir.join("model-pricing.json"),
        format!(
            r#"{{"prices_per_million_tokens": {{"gemini": {{"input": 1.25, "usage_limits": {limits}}}}},
               "thresholds": {{"cost_per_day": {{"warning": 5.0, "critical": 20.0}}}}}}"#
        ),
    )
    .expect("write pricing");
    dir
}

fn ciledger(ws: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_ciledger"));
    cmd.env("RUST_LOG", "error")
        .env_remove("CILEDGER_CONFIG")
        .arg("--workspace")
        .arg(ws);
    cmd
}

fn ledger(ws: &Path) -> Value {
    let raw = fs::read(ws.join("docs/ci-status/pipeline-log.json")).expect("read ledger");
    serde_json::from_slice(&raw).expect("ledger is valid JSON")
}

fn budget_state(ws: &Path) -> Value {
    let raw = fs::read(ws.join(".claude/budget-state.json")).expect("read budget state");
    serde_json::from_slice(&raw).expect("budget state is valid JSON")
}

fn write_usage(ws: &Path, lines: &[String]) {
    let dir = ws.join("docs/ci-status/usage");
    fs::create_dir_all(&dir).expect("create usage dir");
    fs::write(dir.join("calls.jsonl"), lines.join("\n")).expect("write usage");
}

fn usage_line(service: &str, cost: f64) -> String {
    let ts = chrono::Utc::now().to_rfc3339();
    format!(r#"{{"timestamp":"{ts}","service":"{service}","cost_usd":{cost},"tokens_in":100,"tokens_out":50}}"#)
}

// =============================================================================
// Ledger commands
// =============================================================================

mod status {
    use super::*;

    #[test]
    fn version_prints_package_version() {
        let ws = setup_workspace();
        ciledger(ws.path())
            .arg("version")
            .assert()
            .success()
            .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
    }

    #[test]
    fn append_then_tail_json() {
        let ws = setup_workspace();
        ciledger(ws.path())
            .args(["append-status", "build_started", r#"{"job": "lint"}"#])
            .assert()
            .success();

        let output = ciledger(ws.path())
            .args(["tail-status", "--json"])
            .output()
            .expect("run tail-status");
        assert!(output.status.success());
        let tail: Value = serde_json::from_slice(&output.stdout).expect("tail JSON");
        let entries = tail.as_array().expect("array");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["type"], "build_started");
        assert_eq!(entries[0]["details"]["job"], "lint");
    }

    #[test]
    fn append_with_invalid_json_fails_without_writing() {
        let ws = setup_workspace();
        ciledger(ws.path())
            .args(["append-status", "build_started", "{oops"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("not valid JSON"));
        assert!(!ws.path().join("docs/ci-status/pipeline-log.json").exists());
    }

    #[test]
    fn get_phase_defaults_to_unknown() {
        let ws = setup_workspace();
        ciledger(ws.path())
            .arg("get-phase")
            .assert()
            .success()
            .stdout(predicate::str::contains("Phase ID: unknown"))
            .stdout(predicate::str::contains("Phase Name: Unknown"));
    }

    #[test]
    fn update_status_tags_current_phase() {
        let ws = setup_workspace();
        ciledger(ws.path())
            .args(["set-phase", "test", "Unit tests"])
            .assert()
            .success();
        ciledger(ws.path())
            .args(["get-phase"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Phase ID: test"))
            .stdout(predicate::str::contains("Status: in_progress"));

        ciledger(ws.path())
            .args(["update-status", "3 tests failed", "--status-type", "error"])
            .args(["--metadata", "{not json"])
            .assert()
            .success();

        let doc = ledger(ws.path());
        let last = doc["activities"].as_array().unwrap().last().unwrap().clone();
        assert_eq!(last["type"], "error");
        assert_eq!(last["details"]["phase"], "test");
        assert_eq!(last["details"]["message"], "3 tests failed");
        assert!(last["details"].get("metadata").is_none());
        assert_eq!(doc["phase_history"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn unknown_status_type_is_rejected() {
        let ws = setup_workspace();
        ciledger(ws.path())
            .args(["update-status", "hello", "--status-type", "fatal"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Unknown status type"));
    }

    #[test]
    fn concurrent_processes_lose_no_writes() {
        const PROCS: usize = 6;
        const PER_PROC: usize = 8;

        let ws = setup_workspace();
        let bin = env!("CARGO_BIN_EXE_ciledger");
        let handles: Vec<_> = (0..PROCS)
            .map(|p| {
                let root = ws.path().to_path_buf();
                std::thread::spawn(move || {
                    for i in 0..PER_PROC {
                        let status = std::process::Command::new(bin)
                            .env("RUST_LOG", "error")
                            .env_remove("CILEDGER_CONFIG")
                            .arg("--workspace")
                            .arg(&root)
                            .args(["append-status", "job", &format!(r#"{{"seq": {}}}"#, p * 100 + i)])
                            .status()
                            .expect("spawn ciledger");
                        assert!(status.success());
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("writer thread");
        }

        let doc = ledger(ws.path());
        let mut seqs: Vec<u64> = doc["activities"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|a| a["details"]["seq"].as_u64())
            .collect();
        seqs.sort_unstable();
        let mut expected: Vec<u64> = (0..PROCS)
            .flat_map(|p| (0..PER_PROC).map(move |i| (p * 100 + i) as u64))
            .collect();
        expected.sort_unstable();
        assert_eq!(seqs, expected);
    }
}

// =============================================================================
// Rotation and cleanup
// =============================================================================

mod rotate {
    use super::*;

    fn seed_aged_ledger(ws: &Path) {
        let dir = ws.join("docs/ci-status");
        fs::create_dir_all(&dir).unwrap();
        let now = chrono::Utc::now().to_rfc3339();
        fs::write(
            dir.join("pipeline-log.json"),
            format!(
                r#"{{"activities": [
                    {{"timestamp": "2020-01-01T00:00:00", "type": "old", "details": {{}}}},
                    {{"timestamp": "{now}", "type": "fresh", "details": {{}}}}
                ]}}"#
            ),
        )
        .unwrap();
    }

    #[test]
    fn dry_run_reports_without_archiving() {
        let ws = setup_workspace();
        seed_aged_ledger(ws.path());
        ciledger(ws.path())
            .args(["rotate-status", "--dry-run"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Oldest entry is"))
            .stdout(predicate::str::contains("would archive"));
        assert!(!ws.path().join("docs/ci-status/archive").exists());
        assert_eq!(ledger(ws.path())["activities"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn rotation_archives_once() {
        let ws = setup_workspace();
        seed_aged_ledger(ws.path());
        ciledger(ws.path())
            .arg("rotate-status")
            .assert()
            .success()
            .stdout(predicate::str::contains("Archived to"));
        ciledger(ws.path())
            .arg("rotate-status")
            .assert()
            .success()
            .stdout(predicate::str::contains("No rotation needed"));

        let archives = fs::read_dir(ws.path().join("docs/ci-status/archive"))
            .unwrap()
            .count();
        assert_eq!(archives, 1);
        let doc = ledger(ws.path());
        let activities = doc["activities"].as_array().unwrap();
        assert_eq!(activities.len(), 1);
        assert_eq!(activities[0]["type"], "fresh");
    }

    #[test]
    fn rotate_logs_deletes_only_expired_files() {
        let ws = setup_workspace();
        let logs = ws.path().join("docs/ci-status/build-logs");
        fs::create_dir_all(&logs).unwrap();
        let old = logs.join("old.log");
        let recent = logs.join("recent.log");
        fs::write(&old, "old").unwrap();
        fs::write(&recent, "recent").unwrap();
        fs::File::options()
            .write(true)
            .open(&old)
            .unwrap()
            .set_modified(SystemTime::now() - Duration::from_secs(40 * 24 * 3600))
            .unwrap();

        ciledger(ws.path())
            .args(["rotate-logs", "--dry-run"])
            .assert()
            .success()
            .stdout(predicate::str::contains("old.log"));
        assert!(old.exists());

        let output = ciledger(ws.path())
            .args(["rotate-logs", "--json"])
            .output()
            .unwrap();
        assert!(output.status.success());
        let plan: Value = serde_json::from_slice(&output.stdout).unwrap();
        assert_eq!(plan["total_deleted"], 1);
        assert!(!old.exists());
        assert!(recent.exists());
    }
}

// =============================================================================
// Budget commands
// =============================================================================

mod budget {
    use super::*;

    #[test]
    fn missing_pricing_config_fails_before_mutation() {
        let ws = setup_workspace();
        ciledger(ws.path())
            .args(["budget", "check", "gemini", "--cost", "1.0"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("pricing"));
        assert!(!ws.path().join(".claude/budget-state.json").exists());
    }

    #[test]
    fn check_exit_codes_follow_decision() {
        let ws = setup_priced_workspace(r#"{"max_requests_per_day": 1}"#);
        ciledger(ws.path())
            .args(["budget", "check", "gemini", "--record"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Allowed: gemini"));
        ciledger(ws.path())
            .args(["budget", "check", "gemini"])
            .assert()
            .code(1)
            .stderr(predicate::str::contains("Daily request limit exceeded: 1/1"));
    }

    #[test]
    fn cost_limit_blocks_projected_spend() {
        let ws = setup_priced_workspace(r#"{"max_cost_per_day": 10.0}"#);
        for _ in 0..2 {
            ciledger(ws.path())
                .args(["budget", "check", "gemini", "--cost", "4.0"])
                .assert()
                .success();
        }
        ciledger(ws.path())
            .args(["budget", "check", "gemini", "--cost", "4.0"])
            .assert()
            .code(1)
            .stderr(predicate::str::contains("would exceed daily limit"));
        ciledger(ws.path())
            .args(["budget", "check", "gemini", "--cost", "1.0"])
            .assert()
            .success();

        let state = budget_state(ws.path());
        let today = chrono::Utc::now().format("%Y-%m-%d").to_string();
        assert_eq!(state["daily_usage"]["gemini"][&today]["requests"], 3);
    }

    #[test]
    fn check_json_reports_decision() {
        let ws = setup_priced_workspace("{}");
        let output = ciledger(ws.path())
            .args(["budget", "check", "gemini", "--json"])
            .output()
            .unwrap();
        assert!(output.status.success());
        let eval: Value = serde_json::from_slice(&output.stdout).unwrap();
        assert_eq!(eval["service"], "gemini");
        assert_eq!(eval["decision"]["decision"], "allowed");
        assert_eq!(eval["recorded"], false);
    }

    #[test]
    fn status_flags_threshold_level() {
        let ws = setup_priced_workspace("{}");
        write_usage(ws.path(), &[usage_line("gemini", 4.0), usage_line("gemini", 3.0)]);
        ciledger(ws.path())
            .args(["budget", "status", "--days", "1"])
            .assert()
            .success()
            .stdout(predicate::str::contains("gemini"))
            .stdout(predicate::str::contains("WARNING"));

        let output = ciledger(ws.path())
            .args(["budget", "status", "--json"])
            .output()
            .unwrap();
        let status: Value = serde_json::from_slice(&output.stdout).unwrap();
        assert_eq!(status["level"], "warning");
        assert_eq!(status["services"][0]["totals"]["calls"], 2);
    }

    #[test]
    fn reset_without_confirm_changes_nothing() {
        let ws = setup_priced_workspace("{}");
        ciledger(ws.path())
            .args(["budget", "check", "gemini", "--cost", "1.0"])
            .assert()
            .success();
        let before = fs::read(ws.path().join(".claude/budget-state.json")).unwrap();

        ciledger(ws.path())
            .args(["budget", "reset", "--service", "gemini"])
            .assert()
            .code(1)
            .stderr(predicate::str::contains("--confirm"));
        assert_eq!(
            fs::read(ws.path().join(".claude/budget-state.json")).unwrap(),
            before
        );

        ciledger(ws.path())
            .args(["budget", "reset", "--service", "gemini", "--confirm"])
            .assert()
            .success();
        let state = budget_state(ws.path());
        assert!(state.get("last_request_gemini").is_none());
    }

    #[test]
    fn exceeded_alert_records_violation_and_fails() {
        let ws = setup_workspace();
        write_usage(ws.path(), &[usage_line("gemini", 8.0), usage_line("o3", 7.5)]);
        ciledger(ws.path())
            .args(["budget", "alert", "--threshold", "10", "--days", "1"])
            .assert()
            .code(1)
            .stderr(predicate::str::contains("exceeds $10.00 threshold"));

        let state = budget_state(ws.path());
        let violations = state["violations"].as_array().unwrap();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0]["usage_breakdown"]["o3"]["calls"], 1);
    }

    #[test]
    fn alert_within_threshold_succeeds() {
        let ws = setup_workspace();
        write_usage(ws.path(), &[usage_line("gemini", 1.0)]);
        ciledger(ws.path())
            .args(["budget", "alert", "--threshold", "10"])
            .assert()
            .success()
            .stdout(predicate::str::contains("within"));
        assert!(!ws.path().join(".claude/budget-state.json").exists());
    }
}
