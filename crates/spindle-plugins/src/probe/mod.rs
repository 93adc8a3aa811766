//! Readiness detection for freshly spawned plugins.
//!
//! The probe polls until the overall deadline. Each round first checks
//! whether the process already exited, then runs the health check: an HTTP
//! `GET` whose status must fall in the expected range, or the appearance of a
//! marker line in the captured output.

use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::gateway::loopback_client;
use crate::manifest::HealthCheck;
use crate::runtime::PLUGIN_HOST;
use crate::supervisor::{ExitSummary, OutputBuffer, RunningPlugin};

const PROBE_TARGET: &str = "spindle_plugins::probe";

/// Upper bound on a single HTTP health request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(1);

/// Stand-in deadline for timeouts too large to represent as an instant.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Instant `timeout` from now, saturating for unrepresentable timeouts.
pub(crate) fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

/// Why a plugin never became ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeFailure {
    /// The process exited while being probed.
    Exited(ExitSummary),
    /// The deadline passed with the process still running.
    TimedOut,
    /// The process state could not be queried.
    Unobservable,
}

/// Polls a spawned plugin until it is ready or the deadline passes.
#[derive(Debug, Clone)]
pub struct ReadinessProbe {
    client: reqwest::Client,
    interval: Duration,
}

impl ReadinessProbe {
    /// Creates a probe that checks every `interval`.
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            client: loopback_client(),
            interval: interval.max(Duration::from_millis(1)),
        }
    }

    /// Probe interval.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// Waits until `plugin` passes `health` or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// Returns the [`ProbeFailure`] that ended the wait. The caller owns
    /// termination of the process.
    pub async fn wait_ready(
        &self,
        plugin: &mut RunningPlugin,
        health: &HealthCheck,
        timeout: Duration,
    ) -> Result<(), ProbeFailure> {
        let deadline = deadline_after(timeout);
        let mut attempts = 0_u32;
        loop {
            attempts = attempts.saturating_add(1);
            match plugin.try_exit() {
                Ok(Some(exit)) => return Err(ProbeFailure::Exited(exit)),
                Ok(None) => {}
                Err(_) => return Err(ProbeFailure::Unobservable),
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if self
                .check(plugin.port(), plugin.output(), health, remaining)
                .await
            {
                debug!(
                    target: PROBE_TARGET,
                    plugin = plugin.name(),
                    port = plugin.port(),
                    attempts,
                    "plugin passed readiness check"
                );
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                debug!(
                    target: PROBE_TARGET,
                    plugin = plugin.name(),
                    attempts,
                    "readiness deadline passed"
                );
                return Err(ProbeFailure::TimedOut);
            }
            tokio::time::sleep(self.interval.min(deadline - now)).await;
        }
    }

    /// Runs one health check round.
    pub async fn check(
        &self,
        port: u16,
        output: &OutputBuffer,
        health: &HealthCheck,
        budget: Duration,
    ) -> bool {
        match health {
            HealthCheck::OutputMarker { .. } => output.marker_seen(),
            HealthCheck::Http { path, expected } => {
                let url = format!("http://{PLUGIN_HOST}:{port}{path}");
                let timeout = budget.clamp(Duration::from_millis(50), REQUEST_TIMEOUT);
                match self.client.get(&url).timeout(timeout).send().await {
                    Ok(response) => expected.contains(response.status().as_u16()),
                    Err(_) => false,
                }
            }
        }
    }
}
