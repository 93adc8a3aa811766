//! Behaviour-driven tests for the `spindle` command line.

use std::cell::RefCell;
use std::process::ExitCode;

use rstest::fixture;
use rstest_bdd_macros::{given, scenario, then, when};
use tempfile::TempDir;

use super::{Outcome, run_cli, shell_plugin, test_config, write_plugin};

struct TestWorld {
    plugins: TempDir,
    outcome: RefCell<Option<Outcome>>,
}

#[fixture]
fn world() -> TestWorld {
    TestWorld {
        plugins: TempDir::new().expect("temp dir"),
        outcome: RefCell::new(None),
    }
}

impl TestWorld {
    fn run(&self, args: &[&str]) {
        let outcome = run_cli(test_config(self.plugins.path()), args);
        *self.outcome.borrow_mut() = Some(outcome);
    }

    fn with_outcome<T>(&self, check: impl FnOnce(&Outcome) -> T) -> T {
        let outcome = self.outcome.borrow();
        check(outcome.as_ref().expect("spindle has not run"))
    }
}

#[given("no plugin sources")]
fn given_no_sources(world: &TestWorld) {
    assert!(
        std::fs::read_dir(world.plugins.path())
            .expect("read dir")
            .next()
            .is_none()
    );
}

#[given("a plugin source \"{name}\" containing \"{marker}\"")]
fn given_source_with_marker(world: &TestWorld, name: String, marker: String) {
    let dir = world.plugins.path().join(name);
    std::fs::create_dir_all(&dir).expect("source dir");
    std::fs::write(dir.join(marker), "{}").expect("marker");
}

#[given("plugin source \"{name}\" declares the command \"{command}\"")]
fn given_manifest_command(world: &TestWorld, name: String, command: String) {
    let argv: Vec<&str> = command.split_whitespace().collect();
    write_plugin(world.plugins.path(), &name, &format!("command = {argv:?}\n"));
}

#[given("a shell plugin \"{name}\" that becomes ready")]
fn given_ready_plugin(world: &TestWorld, name: String) {
    shell_plugin(world.plugins.path(), &name, "echo READY; exec sleep 30");
}

#[given("a shell plugin \"{name}\" that exits after printing \"{message}\"")]
fn given_crashing_plugin(world: &TestWorld, name: String, message: String) {
    shell_plugin(
        world.plugins.path(),
        &name,
        &format!("echo '{message}' >&2; exit 1"),
    );
}

#[when("spindle runs \"detect\" on plugin source \"{name}\"")]
fn when_detect(world: &TestWorld, name: String) {
    let path = world.plugins.path().join(name);
    world.run(&["detect", path.to_str().expect("utf-8 path")]);
}

#[when("spindle starts plugin \"{name}\"")]
fn when_start(world: &TestWorld, name: String) {
    world.run(&["start", &name]);
}

#[then("the command succeeds")]
fn then_succeeds(world: &TestWorld) {
    world.with_outcome(|outcome| {
        assert_eq!(outcome.exit, ExitCode::SUCCESS, "stderr: {}", outcome.stderr);
    });
}

#[then("the command fails")]
fn then_fails(world: &TestWorld) {
    world.with_outcome(|outcome| assert_eq!(outcome.exit, ExitCode::FAILURE));
}

#[then("standard output reads \"{text}\"")]
fn then_stdout_reads(world: &TestWorld, text: String) {
    world.with_outcome(|outcome| assert_eq!(outcome.stdout.trim_end(), text));
}

#[then("standard output mentions \"{text}\"")]
fn then_stdout_mentions(world: &TestWorld, text: String) {
    world.with_outcome(|outcome| {
        assert!(outcome.stdout.contains(&text), "stdout: {}", outcome.stdout);
    });
}

#[then("standard error mentions \"{text}\"")]
fn then_stderr_mentions(world: &TestWorld, text: String) {
    world.with_outcome(|outcome| {
        assert!(outcome.stderr.contains(&text), "stderr: {}", outcome.stderr);
    });
}

#[scenario(path = "tests/features/cli.feature", name = "Detecting a Node plugin")]
fn detecting_a_node_plugin(world: TestWorld) {
    drop(world);
}

#[scenario(
    path = "tests/features/cli.feature",
    name = "A manifest command takes precedence during detection"
)]
fn a_manifest_command_takes_precedence(world: TestWorld) {
    drop(world);
}

#[scenario(
    path = "tests/features/cli.feature",
    name = "Starting a plugin reports its endpoint"
)]
fn starting_a_plugin_reports_its_endpoint(world: TestWorld) {
    drop(world);
}

#[scenario(
    path = "tests/features/cli.feature",
    name = "Starting a plugin that crashes reports its output"
)]
fn starting_a_crashing_plugin_reports_its_output(world: TestWorld) {
    drop(world);
}

#[scenario(
    path = "tests/features/cli.feature",
    name = "Starting an unknown plugin fails"
)]
fn starting_an_unknown_plugin_fails(world: TestWorld) {
    drop(world);
}
