//! CLI integration tests for pulsar-operator
//!
//! These tests run the built binary without a cluster.
//! Run with: cargo test --test cli_test

use std::process::Command;

/// Run pulsar-operator with given args and return (exit_code, stdout, stderr)
fn run_cmd(args: &[&str]) -> (i32, String, String) {
    let output = Command::new(env!("CARGO_BIN_EXE_pulsar-operator"))
        .args(args)
        .output()
        .expect("Failed to execute command");

    let exit_code = output.status.code().unwrap_or(-1);
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    (exit_code, stdout, stderr)
}

// === Help and Version Tests ===

#[test]
fn test_help() {
    let (exit_code, stdout, _stderr) = run_cmd(&["--help"]);
    assert_eq!(exit_code, 0);
    assert!(stdout.contains("autoscales Apache Pulsar"));
    assert!(stdout.contains("run"));
    assert!(stdout.contains("crd"));
    assert!(stdout.contains("check-config"));
}

#[test]
fn test_version() {
    let (exit_code, stdout, _stderr) = run_cmd(&["--version"]);
    assert_eq!(exit_code, 0);
    assert!(stdout.contains("pulsar-operator"));
}

#[test]
fn test_run_help() {
    let (exit_code, stdout, _stderr) = run_cmd(&["run", "--help"]);
    assert_eq!(exit_code, 0);
    assert!(stdout.contains("--config"));
    assert!(stdout.contains("--log-format"));
}

#[test]
fn test_unknown_command_fails() {
    let (exit_code, _stdout, stderr) = run_cmd(&["scale-everything"]);
    assert_ne!(exit_code, 0);
    assert!(stderr.contains("unrecognized subcommand"));
}

// === CRD Tests ===

#[test]
fn test_crd_manifest() {
    let (exit_code, stdout, _stderr) = run_cmd(&["crd"]);
    assert_eq!(exit_code, 0);
    assert!(stdout.contains("kind: CustomResourceDefinition"));
    assert!(stdout.contains("pulsarclusters.pulsar.oss.dev"));
    assert!(stdout.contains("diskUsageToleranceHwm"));
    assert!(stdout.contains("lowerCpuThreshold"));
}

// === Config Tests ===

#[test]
fn test_check_config_valid() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pulsar-operator.toml");
    std::fs::write(
        &path,
        "[autoscaler]\nsettle_delay_ms = 2500\n\n[logging]\nformat = \"json\"\n",
    )
    .unwrap();

    let (exit_code, stdout, _stderr) = run_cmd(&["check-config", path.to_str().unwrap()]);
    assert_eq!(exit_code, 0);
    assert!(stdout.contains("Configuration OK"));
    assert!(stdout.contains("settle_delay_ms = 2500"));
    assert!(stdout.contains("cookie_delete_attempts = 3"));
}

#[test]
fn test_check_config_invalid() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pulsar-operator.toml");
    std::fs::write(&path, "[autoscaler]\ncookie_delete_attempts = 0\n").unwrap();

    let (exit_code, _stdout, stderr) = run_cmd(&["check-config", path.to_str().unwrap()]);
    assert_ne!(exit_code, 0);
    assert!(stderr.contains("cookie_delete_attempts"));
}

#[test]
fn test_check_config_missing_file() {
    let (exit_code, _stdout, stderr) = run_cmd(&["check-config", "/nonexistent/pulsar-operator.toml"]);
    assert_ne!(exit_code, 0);
    assert!(stderr.contains("Failed to read config file"));
}
