//! CLI surface: exit codes and the environment-override documentation.

use assert_cmd::Command;
use predicates::prelude::*;

fn tickvaultd() -> Command {
    let mut cmd = Command::cargo_bin("tickvaultd").expect("binary builds");
    cmd.env_clear();
    cmd
}

#[test]
fn env_help_documents_the_override_set() {
    tickvaultd()
        .arg("env-help")
        .assert()
        .success()
        .stdout(predicate::str::contains("TICKVAULT_PIPELINE_CAPACITY"))
        .stdout(predicate::str::contains("TICKVAULT_DRAIN_TIMEOUT_SECS"))
        .stdout(predicate::str::contains("TICKVAULT_MARKET_TZ"));
}

#[test]
fn missing_config_file_is_a_config_error() {
    tickvaultd()
        .args(["run", "--config", "/nonexistent/tickvault.json"])
        .assert()
        .code(1);
}

#[test]
fn malformed_config_file_is_a_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.json");
    std::fs::write(&path, "{ not json").unwrap();
    tickvaultd()
        .args(["run", "--config"])
        .arg(&path)
        .assert()
        .code(1);
}

#[test]
fn missing_data_root_is_a_config_error() {
    tickvaultd().arg("run").assert().code(1);
}

#[test]
fn bad_env_override_is_a_config_error() {
    let dir = tempfile::tempdir().unwrap();
    tickvaultd()
        .args(["run", "--data-root"])
        .arg(dir.path())
        .env("TICKVAULT_PIPELINE_CAPACITY", "lots")
        .assert()
        .code(1);
}

#[test]
fn unwritable_data_root_is_a_startup_failure() {
    let dir = tempfile::tempdir().unwrap();
    // A plain file where a directory must be created.
    let occupied = dir.path().join("occupied");
    std::fs::write(&occupied, b"not a directory").unwrap();
    tickvaultd()
        .args(["run", "--data-root"])
        .arg(occupied.join("data"))
        .assert()
        .code(2);
}

#[cfg(unix)]
#[test]
fn graceful_interrupt_exits_zero() {
    use std::io::Read;
    use std::time::{Duration, Instant};

    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("stdout.log");
    let log = std::fs::File::create(&log_path).unwrap();
    let mut child = std::process::Command::new(assert_cmd::cargo::cargo_bin("tickvaultd"))
        .args(["run", "--data-root"])
        .arg(dir.path().join("data"))
        .env_clear()
        .stdout(log)
        .stderr(std::process::Stdio::null())
        .spawn()
        .unwrap();

    // Wait until the daemon reports readiness, so the signal handler is
    // installed before the interrupt arrives.
    let deadline = Instant::now() + Duration::from_secs(30);
    loop {
        let mut contents = String::new();
        if let Ok(mut f) = std::fs::File::open(&log_path) {
            let _ = f.read_to_string(&mut contents);
        }
        if contents.contains("tickvaultd running") {
            break;
        }
        assert!(Instant::now() < deadline, "daemon never became ready");
        std::thread::sleep(Duration::from_millis(100));
    }

    let killed = std::process::Command::new("kill")
        .args(["-INT", &child.id().to_string()])
        .status()
        .unwrap();
    assert!(killed.success());

    let status = child.wait().unwrap();
    assert_eq!(status.code(), Some(0), "graceful shutdown is the normal exit");
}

#[test]
fn invalid_symbol_spec_in_config_is_a_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("config.json");
    // Depth requested with zero levels fails validation.
    std::fs::write(
        &config,
        serde_json::json!({
            "data_root": dir.path().join("data"),
            "symbols": [{
                "symbol": "AAPL",
                "subscribe_trades": true,
                "subscribe_depth": true,
                "depth_levels": 0
            }]
        })
        .to_string(),
    )
    .unwrap();
    tickvaultd()
        .args(["run", "--config"])
        .arg(&config)
        .assert()
        .code(1);
}
