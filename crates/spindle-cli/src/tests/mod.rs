//! Unit and behaviour tests for the CLI runtime.

mod behaviour;

use std::ffi::OsString;
use std::path::Path;
use std::process::ExitCode;
use std::time::Duration;

use camino::Utf8PathBuf;
use rstest::rstest;
use spindle_config::{Config, LogFormat};
use tempfile::TempDir;

use crate::config::{
    ConfigArgumentSplit, ConfigLoader, FlagAction, manager_settings, process_config_flag,
    split_config_arguments,
};
use crate::{AppError, IoStreams, run_with_shutdown};

/// Loader that hands out a fixed configuration.
pub(super) struct StubLoader(pub(super) Config);

impl ConfigLoader for StubLoader {
    fn load(&self, _args: &[OsString]) -> Result<Config, AppError> {
        Ok(self.0.clone())
    }
}

/// Captured result of one CLI run.
#[derive(Debug)]
pub(super) struct Outcome {
    pub(super) exit: ExitCode,
    pub(super) stdout: String,
    pub(super) stderr: String,
}

pub(super) fn test_config(plugins: &Path) -> Config {
    Config {
        log_filter: Some(String::from("warn")),
        log_format: Some(LogFormat::Compact),
        plugins_dir: Some(
            Utf8PathBuf::from_path_buf(plugins.to_path_buf()).expect("utf-8 temp dir"),
        ),
        readiness_timeout_ms: Some(5_000),
        probe_interval_ms: Some(20),
        grace_period_ms: Some(200),
        ..Config::default()
    }
}

/// Runs the CLI with `args` after the program name. Serving stops at once.
pub(super) fn run_cli(config: Config, args: &[&str]) -> Outcome {
    let argv = std::iter::once(OsString::from("spindle")).chain(args.iter().map(OsString::from));
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let exit = {
        let mut io = IoStreams::new(&mut stdout, &mut stderr);
        run_with_shutdown(argv, &mut io, &StubLoader(config), || async { Ok(()) })
    };
    Outcome {
        exit,
        stdout: String::from_utf8(stdout).expect("stdout utf8"),
        stderr: String::from_utf8(stderr).expect("stderr utf8"),
    }
}

pub(super) fn write_plugin(plugins: &Path, name: &str, manifest: &str) {
    let dir = plugins.join(name);
    std::fs::create_dir_all(&dir).expect("plugin dir");
    std::fs::write(dir.join("spindle.toml"), manifest).expect("manifest");
}

pub(super) fn shell_plugin(plugins: &Path, name: &str, script: &str) {
    write_plugin(
        plugins,
        name,
        &format!("command = [\"sh\", \"-c\", {script:?}]\n\n[health]\nmarker = \"READY\"\n"),
    );
}

fn os_args(args: &[&str]) -> Vec<OsString> {
    args.iter().map(OsString::from).collect()
}

#[rstest]
#[case::inline_value("--log-filter=debug", FlagAction::Include { needs_value: false })]
#[case::separate_value("--plugins-dir", FlagAction::Include { needs_value: true })]
#[case::command("call", FlagAction::Skip)]
#[case::unknown_flag("--verbose", FlagAction::Skip)]
#[case::short_flag("-h", FlagAction::Skip)]
fn classifies_config_flags(#[case] argument: &str, #[case] expected: FlagAction) {
    assert_eq!(process_config_flag(argument.as_ref()), expected);
}

#[rstest]
#[case::empty(&[], &[], &[])]
#[case::program_only(&["spindle"], &["spindle"], &["spindle"])]
#[case::leading_flags(
    &["spindle", "--plugins-dir", "/srv", "--log-format=compact", "start", "echo"],
    &["spindle", "--plugins-dir", "/srv", "--log-format=compact"],
    &["spindle", "start", "echo"],
)]
#[case::flags_after_command_stay(
    &["spindle", "call", "echo", "--plugins-dir", "/srv"],
    &["spindle"],
    &["spindle", "call", "echo", "--plugins-dir", "/srv"],
)]
#[case::dangling_value(
    &["spindle", "--config-path"],
    &["spindle", "--config-path"],
    &["spindle"],
)]
fn splits_config_arguments(
    #[case] args: &[&str],
    #[case] config: &[&str],
    #[case] command: &[&str],
) {
    assert_eq!(
        split_config_arguments(&os_args(args)),
        ConfigArgumentSplit {
            config_arguments: os_args(config),
            command_arguments: os_args(command),
        }
    );
}

#[test]
fn maps_configuration_onto_manager_settings() {
    let config = Config {
        plugins_dir: Some(Utf8PathBuf::from("/srv/plugins")),
        readiness_timeout_ms: Some(1_500),
        idle_threshold_secs: Some(5),
        output_buffer_lines: Some(0),
        ..Config::default()
    };
    let settings = manager_settings(&config);
    assert_eq!(settings.plugins_dir, Path::new("/srv/plugins"));
    assert_eq!(settings.readiness_timeout, Duration::from_millis(1_500));
    assert_eq!(settings.idle_threshold, Duration::from_secs(5));
    assert_eq!(settings.call_timeout, config.call_timeout());
    assert_eq!(settings.output_lines, 1);
}

#[rstest]
#[case::python("main.py", "python: python3 main.py")]
#[case::go("go.mod", "go: go run .")]
fn detect_prints_the_selected_command(#[case] marker: &str, #[case] expected: &str) {
    let plugins = TempDir::new().expect("temp dir");
    let source = plugins.path().join("demo");
    std::fs::create_dir_all(&source).expect("source dir");
    std::fs::write(source.join(marker), "").expect("marker");

    let outcome = run_cli(
        test_config(plugins.path()),
        &["detect", source.to_str().expect("utf-8 path")],
    );
    assert_eq!(outcome.exit, ExitCode::SUCCESS, "stderr: {}", outcome.stderr);
    assert_eq!(outcome.stdout.trim(), expected);
}

#[test]
fn detect_reports_unsupported_trees() {
    let plugins = TempDir::new().expect("temp dir");
    let outcome = run_cli(
        test_config(plugins.path()),
        &["detect", plugins.path().to_str().expect("utf-8 path")],
    );
    assert_eq!(outcome.exit, ExitCode::FAILURE);
    assert!(outcome.stderr.contains("no supported runtime"), "{}", outcome.stderr);
}

#[test]
fn start_reports_the_ready_endpoint() {
    let plugins = TempDir::new().expect("temp dir");
    shell_plugin(plugins.path(), "sleeper", "echo READY; exec sleep 30");
    let outcome = run_cli(test_config(plugins.path()), &["start", "sleeper"]);
    assert_eq!(outcome.exit, ExitCode::SUCCESS, "stderr: {}", outcome.stderr);
    assert!(
        outcome.stdout.starts_with("sleeper ready on 127.0.0.1:"),
        "{}",
        outcome.stdout
    );
}

#[test]
fn call_rejects_malformed_payloads_before_starting_anything() {
    let plugins = TempDir::new().expect("temp dir");
    let outcome = run_cli(test_config(plugins.path()), &["call", "echo", "{not json"]);
    assert_eq!(outcome.exit, ExitCode::FAILURE);
    assert!(outcome.stderr.starts_with("invalid JSON payload"), "{}", outcome.stderr);
}

#[test]
fn capabilities_of_a_plugin_without_a_listing_fail() {
    let plugins = TempDir::new().expect("temp dir");
    shell_plugin(plugins.path(), "quiet", "echo READY; exec sleep 30");
    let outcome = run_cli(test_config(plugins.path()), &["capabilities", "quiet"]);
    assert_eq!(outcome.exit, ExitCode::FAILURE);
    assert!(outcome.stdout.is_empty(), "{}", outcome.stdout);
    assert!(
        outcome.stderr.contains("call to plugin 'quiet' failed"),
        "{}",
        outcome.stderr
    );
}

#[test]
fn serve_preloads_then_stops_on_shutdown() {
    let plugins = TempDir::new().expect("temp dir");
    shell_plugin(plugins.path(), "a", "echo READY; exec sleep 30");
    shell_plugin(plugins.path(), "b", "echo READY; exec sleep 30");
    let outcome = run_cli(test_config(plugins.path()), &["serve", "a", "b"]);
    assert_eq!(outcome.exit, ExitCode::SUCCESS, "stderr: {}", outcome.stderr);
}

#[test]
fn serve_fails_when_a_preload_fails() {
    let plugins = TempDir::new().expect("temp dir");
    shell_plugin(plugins.path(), "good", "echo READY; exec sleep 30");
    shell_plugin(plugins.path(), "bad", "exit 3");
    let outcome = run_cli(test_config(plugins.path()), &["serve", "good", "bad"]);
    assert_eq!(outcome.exit, ExitCode::FAILURE);
    assert!(
        outcome.stderr.contains("1 of 2 plugins failed to start"),
        "{}",
        outcome.stderr
    );
}

#[test]
fn help_goes_to_stdout_and_succeeds() {
    let plugins = TempDir::new().expect("temp dir");
    let outcome = run_cli(test_config(plugins.path()), &["--help"]);
    assert_eq!(outcome.exit, ExitCode::SUCCESS);
    assert!(outcome.stdout.contains("Usage: spindle"), "{}", outcome.stdout);
    assert!(outcome.stderr.is_empty());
}

#[test]
fn a_missing_command_is_a_usage_error() {
    let plugins = TempDir::new().expect("temp dir");
    let outcome = run_cli(test_config(plugins.path()), &[]);
    assert_eq!(outcome.exit, ExitCode::FAILURE);
    assert!(outcome.stderr.contains("Usage: spindle"), "{}", outcome.stderr);
}
