//! Malformed configuration must fail loudly rather than fall back to defaults.

use std::ffi::{OsStr, OsString};
use std::fs;
use std::sync::{Mutex, MutexGuard};

use once_cell::sync::Lazy;
use ortho_config::OrthoConfig;
use tempfile::TempDir;

use spindle_config::Config;

static ENV_MUTEX: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

struct EnvOverride {
    key: &'static str,
    previous: Option<OsString>,
    guard: Option<MutexGuard<'static, ()>>,
}

impl EnvOverride {
    fn set_var(key: &'static str, value: &OsStr) -> Self {
        let guard = ENV_MUTEX.lock().expect("env mutex poisoned");
        let previous = std::env::var_os(key);
        unsafe { std::env::set_var(key, value) };
        Self {
            key,
            previous,
            guard: Some(guard),
        }
    }
}

impl Drop for EnvOverride {
    fn drop(&mut self) {
        match self.previous.take() {
            Some(value) => unsafe { std::env::set_var(self.key, value) },
            None => unsafe { std::env::remove_var(self.key) },
        }
        drop(self.guard.take());
    }
}

#[test]
fn malformed_file_is_reported() {
    let temp_dir = TempDir::new().expect("create temp dir");
    let path = temp_dir.path().join("spindle.toml");
    fs::write(&path, "idle_threshold_secs = \"soon\"\n").expect("write malformed config");

    let args = vec![
        OsString::from("spindle"),
        OsString::from("--config-path"),
        path.into_os_string(),
    ];

    let error = Config::load_from_iter(args).expect_err("loading must fail");
    assert!(!error.to_string().is_empty());
}

#[test]
fn malformed_environment_value_is_reported() {
    let _env = EnvOverride::set_var("SPINDLE_GRACE_PERIOD_MS", OsStr::new("not-a-number"));

    let error = Config::load_from_iter([OsString::from("spindle")])
        .expect_err("loading must fail");
    assert!(!error.to_string().is_empty());
}

#[test]
fn environment_value_is_applied() {
    let _env = EnvOverride::set_var("SPINDLE_CALL_TIMEOUT_MS", OsStr::new("1500"));

    let config = Config::load_from_iter([OsString::from("spindle")]).expect("load config");
    assert_eq!(config.call_timeout_ms, Some(1500));
}

#[test]
fn load_without_any_source_uses_defaults() {
    let _guard = ENV_MUTEX.lock().expect("env mutex poisoned");

    let config = Config::load_from_iter([OsString::from("spindle")]).expect("load config");
    assert_eq!(
        config.readiness_timeout_ms,
        Some(spindle_config::DEFAULT_READINESS_TIMEOUT_MS)
    );
    assert_eq!(config.log_filter(), spindle_config::DEFAULT_LOG_FILTER);
    assert_eq!(
        config.output_buffer_lines(),
        spindle_config::DEFAULT_OUTPUT_BUFFER_LINES
    );
}
