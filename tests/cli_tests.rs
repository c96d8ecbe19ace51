//! CLI smoke tests: help, config validation, status decoding and the
//! in-memory simulation.

mod common;

use std::fs;

use serde_json::Value;

fn write_config(dir: &tempfile::TempDir, body: &str) -> String {
    let path = dir.path().join("igate.toml");
    fs::write(&path, body).expect("write config");
    path.to_string_lossy().into_owned()
}

fn parse_json(stdout: &str) -> Value {
    serde_json::from_str(stdout.trim()).expect("stdout is one JSON document")
}

#[test]
fn help_command_prints_usage() {
    let result = common::run_cli_case("help_command_prints_usage", &["--help"]);
    assert!(
        result.status.success(),
        "expected success; log: {}",
        result.log_path.display()
    );
    assert!(
        result.stdout.contains("Usage: igate [OPTIONS] <COMMAND>"),
        "missing help banner; log: {}",
        result.log_path.display()
    );
}

#[test]
fn subcommand_help_flags_work() {
    for subcommand in ["config", "status", "simulate"] {
        let case = format!("subcommand_help_{subcommand}");
        let result = common::run_cli_case(&case, &[subcommand, "--help"]);
        assert!(
            result.status.success(),
            "{subcommand} --help failed; log: {}",
            result.log_path.display()
        );
    }
}

#[test]
fn config_validate_accepts_sparse_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = write_config(&dir, "[workers]\ncount = 2\n");
    let result = common::run_cli_case(
        "config_validate_accepts_sparse_file",
        &["--config", &config, "--json", "config", "validate"],
    );
    assert!(
        result.status.success(),
        "expected success; log: {}",
        result.log_path.display()
    );
    let payload = parse_json(&result.stdout);
    assert_eq!(payload["valid"], Value::Bool(true));
    assert!(payload["hash"].as_str().is_some_and(|h| !h.is_empty()));
}

#[test]
fn config_validate_rejects_zero_workers() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = write_config(&dir, "[workers]\ncount = 0\n");
    let result = common::run_cli_case(
        "config_validate_rejects_zero_workers",
        &["--config", &config, "--json", "config", "validate"],
    );
    assert_eq!(
        result.status.code(),
        Some(1),
        "expected user error; log: {}",
        result.log_path.display()
    );
    let payload = parse_json(&result.stdout);
    assert_eq!(payload["valid"], Value::Bool(false));
    assert_eq!(payload["code"], Value::from("IG-1001"));
}

#[test]
fn status_decode_summarizes_payload() {
    let dir = tempfile::tempdir().expect("tempdir");
    let payload = r#"[
        {"scenario":"login-test","status":"passed","detail":"ok",
         "testRunName":"login-test-1a2b3c4d","lastUpdateTime":"2026-03-01T12:05:00Z","generation":0},
        {"scenario":"checkout-test","status":"in_progress","detail":"running",
         "lastUpdateTime":"2026-03-01T12:01:00Z","generation":1}
    ]"#;
    let path = dir.path().join("status.json");
    fs::write(&path, payload).expect("write payload");
    let path = path.to_string_lossy().into_owned();

    let result = common::run_cli_case(
        "status_decode_summarizes_payload",
        &["--json", "status", "decode", &path],
    );
    assert!(
        result.status.success(),
        "expected success; log: {}",
        result.log_path.display()
    );
    let out = parse_json(&result.stdout);
    assert_eq!(out["entries"].as_array().map(Vec::len), Some(2));
    assert_eq!(out["summary"]["total"], Value::from(2));
    assert_eq!(out["all_terminal"], Value::Bool(false));
}

#[test]
fn status_decode_rejects_corrupt_payload() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("status.json");
    fs::write(&path, "[{\"scenario\":").expect("write payload");
    let path = path.to_string_lossy().into_owned();

    let result = common::run_cli_case(
        "status_decode_rejects_corrupt_payload",
        &["status", "decode", &path],
    );
    assert_eq!(
        result.status.code(),
        Some(1),
        "expected user error; log: {}",
        result.log_path.display()
    );
    assert!(result.stderr.contains("IG-2002"), "log: {}", result.log_path.display());
}

#[test]
fn simulate_json_reports_every_version_set() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = write_config(&dir, "");
    let result = common::run_cli_case(
        "simulate_json_reports_every_version_set",
        &[
            "--config",
            &config,
            "--json",
            "simulate",
            "--version-sets",
            "4",
            "--scenarios",
            "3",
            "--seed",
            "7",
        ],
    );
    assert!(
        result.status.success(),
        "expected success; log: {}",
        result.log_path.display()
    );
    let out = parse_json(&result.stdout);
    assert_eq!(out["command"], Value::from("simulate"));
    assert_eq!(out["seed"], Value::from(7));
    let sets = out["version_sets"].as_array().expect("version_sets array");
    assert_eq!(sets.len(), 4);
    assert!(
        sets.iter().all(|vs| !vs["outcome"].is_null()),
        "every version set converges; log: {}",
        result.log_path.display()
    );
}

#[test]
fn simulate_rejects_out_of_range_pass_rate() {
    let result = common::run_cli_case(
        "simulate_rejects_out_of_range_pass_rate",
        &["simulate", "--pass-rate", "1.5"],
    );
    assert_eq!(
        result.status.code(),
        Some(1),
        "expected user error; log: {}",
        result.log_path.display()
    );
}
