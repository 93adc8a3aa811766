use std::env;

use camino::Utf8PathBuf;

use crate::logging::LogFormat;

/// Default log filter expression used by the binaries.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Time a freshly spawned plugin has to pass its health check.
pub const DEFAULT_READINESS_TIMEOUT_MS: u64 = 10_000;

/// Delay between readiness probe attempts.
pub const DEFAULT_PROBE_INTERVAL_MS: u64 = 100;

/// Upper bound on a single forwarded call.
pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 30_000;

/// Time between the graceful termination signal and the forced kill.
pub const DEFAULT_GRACE_PERIOD_MS: u64 = 2_000;

/// Idle time after which a ready plugin is reclaimed.
pub const DEFAULT_IDLE_THRESHOLD_SECS: u64 = 600;

/// Period of the idle reaper sweep.
pub const DEFAULT_REAP_INTERVAL_SECS: u64 = 30;

/// Number of captured output lines retained per plugin.
pub const DEFAULT_OUTPUT_BUFFER_LINES: usize = 200;

/// Default log filter expression used by the binaries.
#[must_use]
pub const fn default_log_filter() -> &'static str {
    DEFAULT_LOG_FILTER
}

/// Default logging format for the binaries.
#[must_use]
pub const fn default_log_format() -> LogFormat {
    LogFormat::Json
}

/// Directory under which plugin sources are looked up when none is configured.
///
/// Prefers the platform data directory and falls back to the temporary
/// directory when no data directory exists or it is not valid UTF-8.
#[must_use]
pub fn default_plugins_dir() -> Utf8PathBuf {
    let mut base = dirs::data_dir()
        .and_then(|path| Utf8PathBuf::from_path_buf(path).ok())
        .unwrap_or_else(fallback_base_directory);
    base.push("spindle");
    base.push("plugins");
    base
}

fn fallback_base_directory() -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(env::temp_dir()).unwrap_or_else(|_| Utf8PathBuf::from("/tmp"))
}
