//! CLI Integration Tests
//!
//! Runs the built `grid` binary. Tests are skipped when the binary has not
//! been built yet.

use std::path::PathBuf;
use std::process::{Command, Output};

/// Gets the path to the grid binary.
fn grid_bin() -> PathBuf {
    let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.push("../../target/debug/grid");

    if !path.exists() {
        let mut release_path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
        release_path.push("../../target/release/grid");
        return release_path;
    }

    path
}

fn run(args: &[&str]) -> Option<Output> {
    Command::new(grid_bin()).args(args).output().ok()
}

#[test]
fn test_status_requires_http_prefix() {
    let Some(output) = run(&["status", "127.0.0.1:4444"]) else {
        return;
    };
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("http://"));
}

#[test]
fn test_status_requires_address() {
    let Some(output) = run(&["status"]) else {
        return;
    };
    assert!(!output.status.success());
}

#[test]
fn test_hub_rejects_missing_config_file() {
    let Some(output) = run(&["hub", "--config", "/nonexistent/hub.json"]) else {
        return;
    };
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("hub.json"));
}

#[test]
fn test_hub_rejects_invalid_config_file() {
    let file = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(file.path(), "{ not json").unwrap();

    let Some(output) = run(&["hub", "--config", file.path().to_str().unwrap()]) else {
        return;
    };
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Failed to parse"));
}

#[test]
fn test_help_lists_commands() {
    let Some(output) = run(&["--help"]) else {
        return;
    };
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("hub"));
    assert!(stdout.contains("status"));
}
