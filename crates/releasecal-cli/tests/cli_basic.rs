//! Basic CLI E2E tests.
//!
//! Tests invoke CLI commands via cargo run and verify outputs.

use std::process::Command;

/// Run a CLI command and return (stdout, stderr, exit code).
fn run_cli(args: &[&str]) -> (String, String, i32) {
    let output = Command::new("cargo")
        .args(["run", "-p", "releasecal-cli", "--"])
        .args(args)
        .env("RELEASECAL_ENV", "dev")
        .output()
        .expect("Failed to execute CLI command");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let code = output.status.code().unwrap_or(-1);

    (stdout, stderr, code)
}

#[test]
fn test_help() {
    let (stdout, _, code) = run_cli(&["--help"]);
    assert_eq!(code, 0, "help failed");
    assert!(stdout.contains("sync"));
    assert!(stdout.contains("release"));
}

#[test]
fn test_sync_help() {
    let (stdout, _, code) = run_cli(&["sync", "--help"]);
    assert_eq!(code, 0, "sync help failed");
    assert!(stdout.contains("run"));
    assert!(stdout.contains("status"));
    assert!(stdout.contains("redrive"));
}

#[test]
fn test_release_list() {
    let (_, _, code) = run_cli(&["release", "list"]);
    assert_eq!(code, 0, "release list failed");
}

#[test]
fn test_sync_status() {
    let (_, _, code) = run_cli(&["sync", "status"]);
    assert_eq!(code, 0, "sync status failed");
}

#[test]
fn test_sync_run_requires_token() {
    // Without RELEASECAL_ACCESS_TOKEN the run must fail fast with a clear
    // message instead of making unauthenticated calls.
    let output = Command::new("cargo")
        .args(["run", "-p", "releasecal-cli", "--", "sync", "run"])
        .env("RELEASECAL_ENV", "dev")
        .env_remove("RELEASECAL_ACCESS_TOKEN")
        .output()
        .expect("Failed to execute CLI command");

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("RELEASECAL_ACCESS_TOKEN"));
}
