//! Crate-level integration and BDD tests.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use crate::error::PluginError;
use crate::manager::{ManagerSettings, PluginManager};
use crate::observer::{LifecycleObserver, RecordingObserver};
use crate::registry::PluginStatus;
use crate::runtime::{RuntimeDetector, RuntimeKind};


#[tokio::test]
async fn restricted_detectors_ignore_other_runtimes() {
    let plugins = TempDir::new().expect("temp dir");
    let dir = plugins.path().join("pyplugin");
    std::fs::create_dir(&dir).expect("dir");
    std::fs::write(dir.join("main.py"), "print('hi')\n").expect("main.py");

    let observer = Arc::new(RecordingObserver::new());
    let manager = PluginManager::builder(ManagerSettings {
        reap_interval: Duration::from_secs(60),
        ..ManagerSettings::new(plugins.path())
    })
    .detector(RuntimeDetector::new(vec![RuntimeKind::Go, RuntimeKind::Cargo]))
    .observer(Arc::clone(&observer) as Arc<dyn LifecycleObserver>)
    .build();

    let error = manager.start("pyplugin").await.expect_err("python is not enabled");
    assert!(matches!(error, PluginError::UnsupportedRuntime { .. }), "{error}");
    assert_eq!(manager.status("pyplugin"), PluginStatus::Failed);
    assert_eq!(observer.spawn_count("pyplugin"), 0);
    manager.shutdown().await;
}
