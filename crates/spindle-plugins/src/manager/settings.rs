use std::path::PathBuf;
use std::time::Duration;

use crate::reaper::ReaperSettings;
use crate::supervisor::SupervisorSettings;

/// Tunables of a [`super::PluginManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerSettings {
    /// Root the default provisioner resolves source references under.
    pub plugins_dir: PathBuf,
    /// Readiness deadline when the manifest sets none.
    pub readiness_timeout: Duration,
    /// Delay between readiness checks.
    pub probe_interval: Duration,
    /// Upper bound on one forwarded call.
    pub call_timeout: Duration,
    /// Time between `SIGTERM` and `SIGKILL`.
    pub grace_period: Duration,
    /// Idle time after which a ready plugin is stopped.
    pub idle_threshold: Duration,
    /// Period of the reaper sweep.
    pub reap_interval: Duration,
    /// Captured output lines retained per plugin.
    pub output_lines: usize,
}

impl ManagerSettings {
    /// Settings with the stock timings and `plugins_dir` as source root.
    #[must_use]
    pub fn new(plugins_dir: impl Into<PathBuf>) -> Self {
        Self {
            plugins_dir: plugins_dir.into(),
            readiness_timeout: Duration::from_secs(10),
            probe_interval: Duration::from_millis(100),
            call_timeout: Duration::from_secs(30),
            grace_period: Duration::from_secs(2),
            idle_threshold: Duration::from_secs(600),
            reap_interval: Duration::from_secs(30),
            output_lines: 200,
        }
    }

    pub(crate) const fn supervisor(&self) -> SupervisorSettings {
        SupervisorSettings {
            grace_period: self.grace_period,
            output_lines: self.output_lines,
        }
    }

    pub(crate) const fn reaper(&self) -> ReaperSettings {
        ReaperSettings {
            interval: self.reap_interval,
            idle_threshold: self.idle_threshold,
        }
    }
}
