//! End-to-end tests driving the echo plugin binary through the manager.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rstest::{fixture, rstest};
use rstest_bdd_macros::{given, scenario, then, when};
use serde_json::{Value, json};
use spindle_plugins::manifest::MANIFEST_FILE;
use spindle_plugins::observer::RecordingObserver;
use spindle_plugins::{
    LifecycleObserver, ManagerSettings, PluginError, PluginManager, PluginStatus,
};
use tempfile::TempDir;
use tokio::runtime::Runtime;

const ECHO_BIN: &str = env!("CARGO_BIN_EXE_spindle-echo-plugin");

fn write_manifest(root: &Path, name: &str, manifest: &str) {
    let dir = root.join(name);
    std::fs::create_dir_all(&dir).expect("plugin dir");
    std::fs::write(dir.join(MANIFEST_FILE), manifest).expect("manifest");
}

fn install_echo(root: &Path, name: &str) {
    write_manifest(root, name, &format!("command = [{ECHO_BIN:?}]\n"));
}

fn install_script(root: &Path, name: &str, script: &str) {
    write_manifest(root, name, &format!("command = [\"sh\", \"-c\", {script:?}]\n"));
}

fn settings(root: &Path) -> ManagerSettings {
    ManagerSettings {
        readiness_timeout: Duration::from_secs(10),
        probe_interval: Duration::from_millis(20),
        call_timeout: Duration::from_secs(5),
        grace_period: Duration::from_millis(500),
        reap_interval: Duration::from_secs(60),
        ..ManagerSettings::new(root)
    }
}

fn manager(root: &Path, observer: &Arc<RecordingObserver>) -> PluginManager {
    PluginManager::builder(settings(root))
        .observer(Arc::clone(observer) as Arc<dyn LifecycleObserver>)
        .build()
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

struct TestWorld {
    runtime: Runtime,
    plugins: TempDir,
    manager: Option<Arc<PluginManager>>,
    observer: Arc<RecordingObserver>,
    reply: Option<Result<Value, PluginError>>,
    elapsed: Duration,
}

#[fixture]
fn world() -> TestWorld {
    TestWorld {
        runtime: tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .expect("runtime"),
        plugins: TempDir::new().expect("temp dir"),
        manager: None,
        observer: Arc::new(RecordingObserver::new()),
        reply: None,
        elapsed: Duration::ZERO,
    }
}

impl TestWorld {
    fn manager(&mut self) -> Arc<PluginManager> {
        if let Some(manager) = &self.manager {
            return Arc::clone(manager);
        }
        let _entered = self.runtime.enter();
        let manager = Arc::new(manager(self.plugins.path(), &self.observer));
        self.manager = Some(Arc::clone(&manager));
        manager
    }

    fn error(&self) -> &PluginError {
        self.reply
            .as_ref()
            .expect("no call recorded")
            .as_ref()
            .expect_err("expected the call to fail")
    }
}

impl Drop for TestWorld {
    fn drop(&mut self) {
        if let Some(manager) = self.manager.take() {
            self.runtime.block_on(manager.shutdown());
        }
    }
}

#[given("the echo plugin is installed as \"{name}\"")]
fn given_echo(world: &mut TestWorld, name: String) {
    install_echo(world.plugins.path(), &name);
}

#[given("a plugin \"{name}\" that exits at once printing \"{message}\"")]
fn given_broken(world: &mut TestWorld, name: String, message: String) {
    install_script(
        world.plugins.path(),
        &name,
        &format!("echo '{message}' >&2; exit 1"),
    );
}

#[when("plugin \"{name}\" is called with message \"{message}\"")]
fn when_called(world: &mut TestWorld, name: String, message: String) {
    let manager = world.manager();
    let payload = json!({ "msg": message });
    let began = Instant::now();
    let reply = world.runtime.block_on(manager.call(&name, &payload));
    world.elapsed = began.elapsed();
    world.reply = Some(reply);
}

#[then("the reply carries message \"{message}\"")]
fn then_reply(world: &mut TestWorld, message: String) {
    let reply = world
        .reply
        .as_ref()
        .expect("no call recorded")
        .as_ref()
        .expect("call succeeds");
    assert_eq!(reply, &json!({ "msg": message }));
}

#[then("plugin \"{name}\" became ready within {secs} seconds")]
fn then_ready_within(world: &mut TestWorld, name: String, secs: u64) {
    assert!(world.elapsed < Duration::from_secs(secs), "took {:?}", world.elapsed);
    assert_eq!(world.observer.spawn_count(&name), 1);
}

#[then("plugin \"{name}\" is ready")]
fn then_ready(world: &mut TestWorld, name: String) {
    assert_eq!(world.manager().status(&name), PluginStatus::Ready);
}

#[then("plugin \"{name}\" is failed")]
fn then_failed(world: &mut TestWorld, name: String) {
    assert_eq!(world.manager().status(&name), PluginStatus::Failed);
}

#[then("the call fails because the process exited")]
fn then_exited(world: &mut TestWorld) {
    let error = world.error();
    assert!(
        matches!(error, PluginError::ProcessExited { .. }),
        "expected ProcessExited, got: {error}"
    );
}

#[then("the error output mentions \"{text}\"")]
fn then_output_mentions(world: &mut TestWorld, text: String) {
    let error = world.error();
    assert!(error.to_string().contains(&text), "output missing: {error}");
}

#[scenario(
    path = "tests/features/end_to_end.feature",
    name = "The echo plugin starts on demand and echoes a call"
)]
fn echo_plugin_round_trip(world: TestWorld) {
    drop(world);
}

#[scenario(
    path = "tests/features/end_to_end.feature",
    name = "A plugin that exits at once is reported with its output"
)]
fn immediate_exit_is_reported(world: TestWorld) {
    drop(world);
}

// ---------------------------------------------------------------------------
// Calls against live processes
// ---------------------------------------------------------------------------

#[fixture]
fn plugins() -> TempDir {
    TempDir::new().expect("temp dir")
}

#[rstest]
#[tokio::test]
async fn plugins_started_together_answer_on_their_own_ports(plugins: TempDir) {
    install_echo(plugins.path(), "left");
    install_echo(plugins.path(), "right");
    let observer = Arc::new(RecordingObserver::new());
    let manager = manager(plugins.path(), &observer);

    let left_payload = json!({"side": "left"});
    let right_payload = json!({"side": "right"});
    let (left, right) = tokio::join!(
        manager.call("left", &left_payload),
        manager.call("right", &right_payload),
    );
    assert_eq!(left.expect("left"), json!({"side": "left"}));
    assert_eq!(right.expect("right"), json!({"side": "right"}));

    let left_port = manager.describe("left").port.expect("left port");
    let right_port = manager.describe("right").port.expect("right port");
    assert_ne!(left_port, right_port);
    manager.shutdown().await;
}

#[rstest]
#[tokio::test]
async fn crash_during_a_call_restarts_once(plugins: TempDir) {
    install_echo(plugins.path(), "fragile");
    let observer = Arc::new(RecordingObserver::new());
    let manager = manager(plugins.path(), &observer);

    let error = manager
        .call("fragile", &json!({"exit": 4}))
        .await
        .expect_err("the plugin exits on every attempt");
    assert!(error.is_transport(), "{error}");
    assert_eq!(observer.spawn_count("fragile"), 2);

    let reply = manager
        .call("fragile", &json!({"msg": "again"}))
        .await
        .expect("a fresh process answers");
    assert_eq!(reply, json!({"msg": "again"}));
    assert_eq!(observer.spawn_count("fragile"), 3);
    manager.shutdown().await;
}

#[rstest]
#[tokio::test]
async fn calls_refresh_the_idle_clock(plugins: TempDir) {
    install_echo(plugins.path(), "steady");
    let observer = Arc::new(RecordingObserver::new());
    let manager = PluginManager::builder(ManagerSettings {
        idle_threshold: Duration::from_millis(400),
        reap_interval: Duration::from_millis(50),
        ..settings(plugins.path())
    })
    .observer(Arc::clone(&observer) as Arc<dyn LifecycleObserver>)
    .build();

    for _ in 0..8 {
        manager
            .call("steady", &json!({"tick": true}))
            .await
            .expect("call");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(observer.spawn_count("steady"), 1);
    assert_eq!(manager.status("steady"), PluginStatus::Ready);

    tokio::time::sleep(Duration::from_millis(900)).await;
    assert_eq!(manager.status("steady"), PluginStatus::Absent);
    manager.shutdown().await;
}

#[rstest]
#[tokio::test]
async fn stopping_the_echo_plugin_is_graceful(plugins: TempDir) {
    install_echo(plugins.path(), "polite");
    let observer = Arc::new(RecordingObserver::new());
    let manager = manager(plugins.path(), &observer);

    manager.start("polite").await.expect("start");
    let began = Instant::now();
    assert!(manager.stop("polite").await.expect("stop"));
    assert!(began.elapsed() < Duration::from_millis(500), "needed SIGKILL");
    assert_eq!(manager.status("polite"), PluginStatus::Absent);
    manager.shutdown().await;
}

#[rstest]
#[tokio::test]
async fn echo_capabilities_are_discovered_and_recorded(plugins: TempDir) {
    install_echo(plugins.path(), "described");
    let observer = Arc::new(RecordingObserver::new());
    let manager = manager(plugins.path(), &observer);

    let capabilities = manager
        .refresh_capabilities("described")
        .await
        .expect("capabilities");
    let names: Vec<&str> = capabilities
        .tools
        .iter()
        .filter_map(|tool| tool.get("name").and_then(Value::as_str))
        .collect();
    assert_eq!(names, vec!["echo"]);
    assert!(capabilities.resources.is_empty());
    assert!(capabilities.prompts.is_empty());

    let snapshot = manager.describe("described");
    assert_eq!(snapshot.status, PluginStatus::Ready);
    assert_eq!(snapshot.capabilities, Some(capabilities));
    assert_eq!(
        snapshot.state_description.as_deref(),
        Some("capabilities refreshed: 1 tools, 0 resources, 0 prompts")
    );
    assert_eq!(observer.spawn_count("described"), 1);
    manager.shutdown().await;
}

#[rstest]
#[tokio::test]
async fn manifest_capabilities_path_is_honoured(plugins: TempDir) {
    write_manifest(
        plugins.path(),
        "relocated",
        &format!("command = [{ECHO_BIN:?}]\ncapabilities_path = \"/call\"\n"),
    );
    let observer = Arc::new(RecordingObserver::new());
    let manager = manager(plugins.path(), &observer);

    let error = manager
        .refresh_capabilities("relocated")
        .await
        .expect_err("the call route only accepts POST");
    assert!(
        matches!(error, PluginError::CallRejected { status: 405, .. }),
        "{error}"
    );
    assert_eq!(manager.status("relocated"), PluginStatus::Ready);
    manager.shutdown().await;
}
