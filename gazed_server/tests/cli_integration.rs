//! Binary-level tests: flags and exit codes.
use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::process::Command;
use tempfile::tempdir;

#[test]
fn help_lists_the_documented_flags() {
    let mut cmd = Command::cargo_bin("server").unwrap();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--host"))
        .stdout(predicate::str::contains("--port"))
        .stdout(predicate::str::contains("--log-level"))
        .stdout(predicate::str::contains("--config"));
}

#[test]
fn missing_config_file_exits_with_code_1() {
    let mut cmd = Command::cargo_bin("server").unwrap();
    cmd.args(["--config", "/nonexistent/gazed.toml"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("configuration error"));
}

#[test]
fn malformed_config_exits_with_code_1() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("bad.toml");
    std::fs::write(&path, "[stream]\nsampling_rate_hz = \"fast\"\n").unwrap();

    let mut cmd = Command::cargo_bin("server").unwrap();
    cmd.args(["--config"])
        .arg(&path)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("configuration error"));
}

#[test]
fn out_of_bounds_config_value_exits_with_code_1() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("bad.toml");
    std::fs::write(&path, "[stream]\nsnapshot_rate_hz = 0\n").unwrap();

    let mut cmd = Command::cargo_bin("server").unwrap();
    cmd.args(["--config"])
        .arg(&path)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("snapshot_rate_hz"));
}
