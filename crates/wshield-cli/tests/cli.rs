//! Smoke tests for the `webshield` binary

use assert_cmd::Command;
use predicates::prelude::*;
use std::path::Path;

fn webshield(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("webshield").unwrap();
    cmd.current_dir(dir).env_remove("RUST_LOG").env("NO_COLOR", "1");
    cmd
}

/// Config without downloadable sources so nothing touches the network
fn offline_config(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("ws.toml");
    std::fs::write(&path, "[lists]\nsources = []\n\n[threat]\nenabled = false\n").unwrap();
    path
}

#[test]
fn test_help_lists_commands() {
    let dir = tempfile::tempdir().unwrap();
    webshield(dir.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("filter"))
        .stdout(predicate::str::contains("completions"));
}

#[test]
fn test_version() {
    let dir = tempfile::tempdir().unwrap();
    webshield(dir.path())
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::starts_with("webshield "));
}

#[test]
fn test_config_generate_then_validate() {
    let dir = tempfile::tempdir().unwrap();

    webshield(dir.path())
        .args(["config", "generate", "-p", "strict"])
        .assert()
        .success();
    assert!(dir.path().join("webshield.toml").exists());

    webshield(dir.path())
        .args(["config", "validate", "webshield.toml"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration is valid"))
        .stdout(predicate::str::contains("strict"));
}

#[test]
fn test_config_validate_rejects_bad_file() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("bad.toml"), "[proxy]\nport = 0\n").unwrap();

    webshield(dir.path())
        .args(["config", "validate", "bad.toml"])
        .assert()
        .failure();
}

#[test]
fn test_config_show_uses_discovered_file() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("webshield.toml"), "[proxy]\nport = 3129\n").unwrap();

    webshield(dir.path())
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("port = 3129"));
}

#[test]
fn test_run_dry_run() {
    let dir = tempfile::tempdir().unwrap();
    let config = offline_config(dir.path());

    webshield(dir.path())
        .args(["run", "--dry-run", "--port", "3130", "-c"])
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("127.0.0.1:3130"))
        .stdout(predicate::str::contains("dry run"));
}

#[test]
fn test_filter_add_then_check() {
    let dir = tempfile::tempdir().unwrap();
    let config = offline_config(dir.path());
    let data = dir.path().join("data");

    webshield(dir.path())
        .args(["filter", "add", "*.ads.test", "-c"])
        .arg(&config)
        .arg("-d")
        .arg(&data)
        .assert()
        .success()
        .stdout(predicate::str::contains("Added"));

    webshield(dir.path())
        .args(["check", "--json", "http://cdn.ads.test/banner.js", "-c"])
        .arg(&config)
        .arg("-d")
        .arg(&data)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"blocked\":true"))
        .stdout(predicate::str::contains("Blocked Domain"));

    webshield(dir.path())
        .args(["filter", "list", "--list", "blocklist", "-c"])
        .arg(&config)
        .arg("-d")
        .arg(&data)
        .assert()
        .success()
        .stdout(predicate::str::contains("*.ads.test"));
}

#[test]
fn test_filter_add_rejects_invalid_pattern() {
    let dir = tempfile::tempdir().unwrap();
    let config = offline_config(dir.path());

    webshield(dir.path())
        .args(["filter", "add", "bad host", "-c"])
        .arg(&config)
        .arg("-d")
        .arg(dir.path().join("data"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid pattern"));
}

#[test]
fn test_check_allows_clean_url() {
    let dir = tempfile::tempdir().unwrap();
    let config = offline_config(dir.path());

    webshield(dir.path())
        .args(["check", "https://example.test/", "-c"])
        .arg(&config)
        .arg("-d")
        .arg(dir.path().join("data"))
        .assert()
        .success()
        .stdout(predicate::str::contains("ALLOWED"));
}

#[test]
fn test_completions_bash() {
    let dir = tempfile::tempdir().unwrap();
    webshield(dir.path())
        .args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("webshield"));
}
