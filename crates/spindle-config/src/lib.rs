//! Shared configuration for the Spindle plugin host.
//!
//! Values are layered by `ortho_config`: built-in defaults, then a TOML file
//! (`--config-path` or `SPINDLE_CONFIG_PATH`), then `SPINDLE_*` environment
//! variables, then command-line flags. The defaults layer always carries the
//! numeric settings, so a load with no file, environment or flags succeeds.
//! Fields stay optional on the struct itself and the accessors below supply
//! the same defaults for values built by hand.

mod defaults;
mod logging;

use std::time::Duration;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::{Deserialize, Serialize};

pub use defaults::{
    DEFAULT_CALL_TIMEOUT_MS, DEFAULT_GRACE_PERIOD_MS, DEFAULT_IDLE_THRESHOLD_SECS,
    DEFAULT_LOG_FILTER, DEFAULT_OUTPUT_BUFFER_LINES, DEFAULT_PROBE_INTERVAL_MS,
    DEFAULT_REAP_INTERVAL_SECS, DEFAULT_READINESS_TIMEOUT_MS, default_log_filter,
    default_log_format, default_plugins_dir,
};
pub use logging::{LogFormat, LogFormatParseError};

/// Command-line flags consumed by the configuration loader rather than by
/// the command that follows them.
pub const CONFIG_CLI_FLAGS: &[&str] = &[
    "--config-path",
    "--log-filter",
    "--log-format",
    "--plugins-dir",
    "--readiness-timeout-ms",
    "--probe-interval-ms",
    "--call-timeout-ms",
    "--grace-period-ms",
    "--idle-threshold-secs",
    "--reap-interval-secs",
    "--output-buffer-lines",
];

/// Layered configuration for the plugin host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, OrthoConfig)]
#[ortho_config(prefix = "SPINDLE")]
pub struct Config {
    /// Tracing filter expression, for example `info,spindle_plugins=debug`.
    #[ortho_config(default = DEFAULT_LOG_FILTER.to_owned())]
    pub log_filter: Option<String>,
    /// Output format of emitted log events.
    pub log_format: Option<LogFormat>,
    /// Directory that holds one sub-directory per named plugin source.
    pub plugins_dir: Option<Utf8PathBuf>,
    /// Readiness deadline for a freshly spawned plugin, in milliseconds.
    #[ortho_config(default = DEFAULT_READINESS_TIMEOUT_MS)]
    pub readiness_timeout_ms: Option<u64>,
    /// Delay between readiness probe attempts, in milliseconds.
    #[ortho_config(default = DEFAULT_PROBE_INTERVAL_MS)]
    pub probe_interval_ms: Option<u64>,
    /// Timeout applied to each forwarded call, in milliseconds.
    #[ortho_config(default = DEFAULT_CALL_TIMEOUT_MS)]
    pub call_timeout_ms: Option<u64>,
    /// Grace period between SIGTERM and SIGKILL, in milliseconds.
    #[ortho_config(default = DEFAULT_GRACE_PERIOD_MS)]
    pub grace_period_ms: Option<u64>,
    /// Idle time after which a ready plugin is stopped, in seconds.
    #[ortho_config(default = DEFAULT_IDLE_THRESHOLD_SECS)]
    pub idle_threshold_secs: Option<u64>,
    /// Period of the idle reaper sweep, in seconds.
    #[ortho_config(default = DEFAULT_REAP_INTERVAL_SECS)]
    pub reap_interval_secs: Option<u64>,
    /// Captured output lines retained per plugin.
    #[ortho_config(default = DEFAULT_OUTPUT_BUFFER_LINES)]
    pub output_buffer_lines: Option<usize>,
}

impl Config {
    /// Resolved log filter.
    #[must_use]
    pub fn log_filter(&self) -> &str {
        self.log_filter.as_deref().unwrap_or(DEFAULT_LOG_FILTER)
    }

    /// Resolved log format.
    #[must_use]
    pub fn log_format(&self) -> LogFormat {
        self.log_format.unwrap_or_else(default_log_format)
    }

    /// Resolved plugin source directory.
    #[must_use]
    pub fn plugins_dir(&self) -> Utf8PathBuf {
        self.plugins_dir.clone().unwrap_or_else(default_plugins_dir)
    }

    /// Resolved readiness deadline.
    #[must_use]
    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_millis(
            self.readiness_timeout_ms
                .unwrap_or(DEFAULT_READINESS_TIMEOUT_MS),
        )
    }

    /// Resolved readiness probe interval.
    #[must_use]
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms.unwrap_or(DEFAULT_PROBE_INTERVAL_MS))
    }

    /// Resolved per-call timeout.
    #[must_use]
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms.unwrap_or(DEFAULT_CALL_TIMEOUT_MS))
    }

    /// Resolved termination grace period.
    #[must_use]
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms.unwrap_or(DEFAULT_GRACE_PERIOD_MS))
    }

    /// Resolved idle threshold.
    #[must_use]
    pub fn idle_threshold(&self) -> Duration {
        Duration::from_secs(
            self.idle_threshold_secs
                .unwrap_or(DEFAULT_IDLE_THRESHOLD_SECS),
        )
    }

    /// Resolved reaper sweep period.
    #[must_use]
    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs.unwrap_or(DEFAULT_REAP_INTERVAL_SECS))
    }

    /// Resolved output buffer capacity. Never zero.
    #[must_use]
    pub fn output_buffer_lines(&self) -> usize {
        self.output_buffer_lines
            .unwrap_or(DEFAULT_OUTPUT_BUFFER_LINES)
            .max(1)
    }
}
