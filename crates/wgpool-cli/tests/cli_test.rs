//! End-to-end tests of the `wgpool` binary that need no network privileges

use std::process::{Command, Output};
use tempfile::TempDir;

fn wgpool(temp: &TempDir, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_wgpool"))
        .arg("--config-dir")
        .arg(temp.path().join("config"))
        .arg("--state-file")
        .arg(temp.path().join("state").join("connections.json"))
        .arg("--tunnel-dir")
        .arg(temp.path().join("tunnels"))
        .args(args)
        .env_remove("WGPOOL_POOL_URL")
        .env_remove("WGPOOL_SUDO")
        .env_remove("RUST_LOG")
        .output()
        .expect("failed to run wgpool")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn test_version() {
    let temp = TempDir::new().unwrap();
    let output = wgpool(&temp, &["--version"]);
    assert!(output.status.success());
    assert!(stdout(&output).starts_with("wgpool "));
}

#[test]
fn test_config_round_trip() {
    let temp = TempDir::new().unwrap();

    let output = wgpool(&temp, &["config", "set-pool-url", "http://10.0.0.5:3000/vpn_api"]);
    assert!(output.status.success());

    let output = wgpool(&temp, &["config", "show"]);
    assert!(output.status.success());
    assert!(stdout(&output).contains("\"pool_url\": \"http://10.0.0.5:3000/vpn_api\""));

    let output = wgpool(&temp, &["config", "reset"]);
    assert!(output.status.success());
    let output = wgpool(&temp, &["config", "show"]);
    assert!(stdout(&output).contains("\"pool_url\": null"));
}

#[test]
fn test_invalid_pool_url_is_rejected() {
    let temp = TempDir::new().unwrap();
    let output = wgpool(&temp, &["config", "set-pool-url", "pool.internal"]);
    assert!(!output.status.success());
    assert!(!temp.path().join("config").join("config.json").exists());
}

#[test]
fn test_invalid_worker_fails_before_touching_the_network() {
    let temp = TempDir::new().unwrap();
    let output = wgpool(&temp, &["down", "worker-1"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("Invalid worker id"));
}

#[test]
fn test_down_requires_worker_or_all() {
    let temp = TempDir::new().unwrap();
    let output = wgpool(&temp, &["down"]);
    assert!(!output.status.success());
}
