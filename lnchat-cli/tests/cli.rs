//! Smoke tests against the built binary.

use std::process::Command;

fn lnchat() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_lnchat"));
    // Keep the caller's environment from leaking into config resolution.
    for (key, _) in std::env::vars() {
        if key.starts_with("LNCHAT_") {
            cmd.env_remove(key);
        }
    }
    cmd
}

#[test]
fn test_help_lists_commands() {
    let output = lnchat().arg("--help").output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("run"));
    assert!(stdout.contains("genpwdhash"));
}

#[test]
fn test_run_help_lists_flags() {
    let output = lnchat().args(["run", "--help"]).output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("--lnd-macaroon-path"));
    assert!(stdout.contains("--graceful-shutdown-timeout"));
}

#[test]
fn test_run_rejects_bad_pwdhash() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("lnchat.toml");
    std::fs::write(&config, "[server]\npwdhash = \"not-a-hash\"\n").unwrap();

    let output = lnchat()
        .arg("run")
        .arg("--config")
        .arg(&config)
        .output()
        .unwrap();
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("pwdhash"), "stderr: {}", stderr);
}

#[test]
fn test_run_rejects_pwdhash_from_env() {
    let output = lnchat()
        .arg("run")
        .env("LNCHAT_SERVER_PWDHASH", "plaintext")
        .output()
        .unwrap();
    assert!(!output.status.success());
}

#[test]
fn test_run_requires_macaroon() {
    let output = lnchat()
        .args(["run", "--lnd-address", "127.0.0.1:1"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("macaroon_path"), "stderr: {}", stderr);
}
