#![allow(clippy::unwrap_used)]
// Smoke tests for CLI argument handling.

use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn help_shows_task_syntax() {
    Command::cargo_bin("mdsweep")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("filter chain"))
        .stdout(predicate::str::contains("--tasks"));
}

#[test]
fn missing_host_is_a_usage_error() {
    Command::cargo_bin("mdsweep")
        .unwrap()
        .env_remove("MDSWEEP_HOST")
        .env_remove("MDSWEEP_USER")
        .args(["-u", "admin"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--host"));
}

#[test]
fn version_flag_works() {
    Command::cargo_bin("mdsweep")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("mdsweep"));
}
