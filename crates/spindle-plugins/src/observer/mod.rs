//! Structured lifecycle events for plugin processes.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::error::PluginError;

const OBSERVER_TARGET: &str = "spindle_plugins::lifecycle";

/// Observer trait used to surface plugin lifecycle events to telemetry sinks.
pub trait LifecycleObserver: Send + Sync {
    /// Invoked before a start attempt spawns anything.
    fn starting(&self, name: &str);

    /// Invoked once the process is spawned on `port`.
    fn spawned(&self, name: &str, port: u16, pid: Option<u32>);

    /// Invoked when the process passes its readiness check.
    fn ready(&self, name: &str, port: u16, elapsed: Duration);

    /// Invoked when a start attempt fails.
    fn failed(&self, name: &str, error: &PluginError);

    /// Invoked when an idle process is reclaimed.
    fn reaped(&self, name: &str, idle: Duration);

    /// Invoked when a tracked process was found dead and evicted.
    fn evicted(&self, name: &str, error: &PluginError);

    /// Invoked when a process is stopped on request or at shutdown.
    fn stopped(&self, name: &str);
}

impl<T> LifecycleObserver for Arc<T>
where
    T: LifecycleObserver + ?Sized,
{
    fn starting(&self, name: &str) {
        (**self).starting(name);
    }

    fn spawned(&self, name: &str, port: u16, pid: Option<u32>) {
        (**self).spawned(name, port, pid);
    }

    fn ready(&self, name: &str, port: u16, elapsed: Duration) {
        (**self).ready(name, port, elapsed);
    }

    fn failed(&self, name: &str, error: &PluginError) {
        (**self).failed(name, error);
    }

    fn reaped(&self, name: &str, idle: Duration) {
        (**self).reaped(name, idle);
    }

    fn evicted(&self, name: &str, error: &PluginError) {
        (**self).evicted(name, error);
    }

    fn stopped(&self, name: &str) {
        (**self).stopped(name);
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Default observer that records lifecycle events using `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl LifecycleObserver for TracingObserver {
    fn starting(&self, name: &str) {
        tracing::info!(
            target: OBSERVER_TARGET,
            event = "starting",
            plugin = name,
            "starting plugin"
        );
    }

    fn spawned(&self, name: &str, port: u16, pid: Option<u32>) {
        tracing::debug!(
            target: OBSERVER_TARGET,
            event = "spawned",
            plugin = name,
            port,
            pid,
            "plugin process spawned"
        );
    }

    fn ready(&self, name: &str, port: u16, elapsed: Duration) {
        tracing::info!(
            target: OBSERVER_TARGET,
            event = "ready",
            plugin = name,
            port,
            elapsed_ms = millis(elapsed),
            "plugin ready"
        );
    }

    fn failed(&self, name: &str, error: &PluginError) {
        tracing::error!(
            target: OBSERVER_TARGET,
            event = "failed",
            plugin = name,
            error = %error,
            "plugin failed to start"
        );
    }

    fn reaped(&self, name: &str, idle: Duration) {
        tracing::info!(
            target: OBSERVER_TARGET,
            event = "reaped",
            plugin = name,
            idle_ms = millis(idle),
            "idle plugin reclaimed"
        );
    }

    fn evicted(&self, name: &str, error: &PluginError) {
        tracing::warn!(
            target: OBSERVER_TARGET,
            event = "evicted",
            plugin = name,
            error = %error,
            "dead plugin evicted"
        );
    }

    fn stopped(&self, name: &str) {
        tracing::info!(
            target: OBSERVER_TARGET,
            event = "stopped",
            plugin = name,
            "plugin stopped"
        );
    }
}

/// One recorded lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// See [`LifecycleObserver::starting`].
    Starting(String),
    /// See [`LifecycleObserver::spawned`].
    Spawned {
        /// Plugin name.
        name: String,
        /// Assigned port.
        port: u16,
    },
    /// See [`LifecycleObserver::ready`].
    Ready(String),
    /// See [`LifecycleObserver::failed`].
    Failed(String),
    /// See [`LifecycleObserver::reaped`].
    Reaped(String),
    /// See [`LifecycleObserver::evicted`].
    Evicted(String),
    /// See [`LifecycleObserver::stopped`].
    Stopped(String),
}

/// Observer that keeps every event in memory, for assertions.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<LifecycleEvent>>,
}

impl RecordingObserver {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, event: LifecycleEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }

    /// All events so far, oldest first.
    #[must_use]
    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of processes spawned for `name`.
    #[must_use]
    pub fn spawn_count(&self, name: &str) -> usize {
        self.events()
            .iter()
            .filter(|event| matches!(event, LifecycleEvent::Spawned { name: n, .. } if n == name))
            .count()
    }

    /// Ports assigned to spawned processes, in spawn order.
    #[must_use]
    pub fn spawned_ports(&self) -> Vec<u16> {
        self.events()
            .iter()
            .filter_map(|event| match event {
                LifecycleEvent::Spawned { port, .. } => Some(*port),
                _ => None,
            })
            .collect()
    }
}

impl LifecycleObserver for RecordingObserver {
    fn starting(&self, name: &str) {
        self.record(LifecycleEvent::Starting(name.to_owned()));
    }

    fn spawned(&self, name: &str, port: u16, _pid: Option<u32>) {
        self.record(LifecycleEvent::Spawned {
            name: name.to_owned(),
            port,
        });
    }

    fn ready(&self, name: &str, _port: u16, _elapsed: Duration) {
        self.record(LifecycleEvent::Ready(name.to_owned()));
    }

    fn failed(&self, name: &str, _error: &PluginError) {
        self.record(LifecycleEvent::Failed(name.to_owned()));
    }

    fn reaped(&self, name: &str, _idle: Duration) {
        self.record(LifecycleEvent::Reaped(name.to_owned()));
    }

    fn evicted(&self, name: &str, _error: &PluginError) {
        self.record(LifecycleEvent::Evicted(name.to_owned()));
    }

    fn stopped(&self, name: &str) {
        self.record(LifecycleEvent::Stopped(name.to_owned()));
    }
}
