//! Integration tests for the `spindle` binary entry point.

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::str::contains;

#[test]
fn help_lists_the_commands() {
    let mut command = cargo_bin_cmd!("spindle");
    command.arg("--help");
    command
        .assert()
        .success()
        .stdout(contains("detect"))
        .stdout(contains("capabilities"))
        .stdout(contains("serve"));
}

#[test]
fn malformed_call_payload_exits_with_failure() {
    let plugins = tempfile::TempDir::new().expect("temp dir");
    let mut command = cargo_bin_cmd!("spindle");
    command
        .arg("--plugins-dir")
        .arg(plugins.path())
        .args(["call", "echo", "[1,"]);
    command
        .assert()
        .failure()
        .stderr(contains("invalid JSON payload"));
}

#[test]
fn unknown_log_format_is_a_configuration_error() {
    let mut command = cargo_bin_cmd!("spindle");
    command.env("SPINDLE_LOG_FORMAT", "xml").args(["detect", "."]);
    command
        .assert()
        .failure()
        .stderr(contains("failed to load configuration"));
}
