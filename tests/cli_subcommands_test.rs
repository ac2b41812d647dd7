//! Smoke tests for the CLI subcommands that don't need a container engine.

use std::fs;
use std::path::PathBuf;
use std::process::Command;
use tempfile::TempDir;

fn host_binary() -> String {
    env!("CARGO_BIN_EXE_workspace-host").to_string()
}

fn create_test_config(temp_dir: &TempDir) -> PathBuf {
    let config_path = temp_dir.path().join("workspace-host.yaml");
    let config = format!(
        r#"
state_dir: {state}
port_range:
  min: 20000
  max: 20100
heartbeat_timeout: 5m
defaults:
  image: workspace/python:3.12
blob_store:
  kind: filesystem
"#,
        state = temp_dir.path().join("state").display()
    );
    fs::write(&config_path, config).expect("Failed to write config");
    config_path
}

#[test]
fn test_help_lists_subcommands() {
    let output = Command::new(host_binary())
        .arg("--help")
        .output()
        .expect("Failed to run workspace-host");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for command in ["serve", "status", "history", "prune", "validate"] {
        assert!(stdout.contains(command), "help should mention {}", command);
    }
}

#[test]
fn test_validate_prints_summary() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = create_test_config(&temp_dir);

    let output = Command::new(host_binary())
        .args(["--config", config_path.to_str().unwrap(), "validate"])
        .output()
        .expect("Failed to run workspace-host");

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    assert!(stdout.contains("Configuration is valid"));
    assert!(stdout.contains("20000-20100 (100 ports)"));
    assert!(stdout.contains("workspace/python:3.12"));
}

#[test]
fn test_validate_rejects_bad_config_with_hint() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("workspace-host.yaml");
    fs::write(&config_path, "port_range:\n  min: 5000\n  max: 4000\n").unwrap();

    let output = Command::new(host_binary())
        .args(["--config", config_path.to_str().unwrap(), "validate"])
        .output()
        .expect("Failed to run workspace-host");

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Error:"), "stderr: {}", stderr);
}

#[test]
fn test_missing_config_file_is_an_error() {
    let output = Command::new(host_binary())
        .args(["--config", "/nonexistent/workspace-host.yaml", "status"])
        .output()
        .expect("Failed to run workspace-host");

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("does not exist"), "stderr: {}", stderr);
}

#[test]
fn test_status_on_empty_registry() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = create_test_config(&temp_dir);

    let output = Command::new(host_binary())
        .args(["--config", config_path.to_str().unwrap(), "status", "--json"])
        .output()
        .expect("Failed to run workspace-host");

    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    let workspaces: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(workspaces, serde_json::json!([]));
}

#[test]
fn test_status_of_unknown_workspace_fails_with_hint() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = create_test_config(&temp_dir);

    let output = Command::new(host_binary())
        .args(["--config", config_path.to_str().unwrap(), "status", "ws-nobody"])
        .output()
        .expect("Failed to run workspace-host");

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Workspace not found: ws-nobody"), "stderr: {}", stderr);
    assert!(stderr.contains("Hint:"), "stderr: {}", stderr);
}
