//! Background reclamation of idle and dead plugin processes.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::observer::LifecycleObserver;
use crate::registry::{PluginRegistry, ReapOutcome};
use crate::supervisor::Supervisor;

const REAPER_TARGET: &str = "spindle_plugins::reaper";

/// Shortest sweep period accepted.
pub const MIN_INTERVAL: Duration = Duration::from_millis(10);

/// Timing of the reaper loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaperSettings {
    /// Time between sweeps.
    pub interval: Duration,
    /// Idle time after which a ready process is stopped.
    pub idle_threshold: Duration,
}

/// Names touched by one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Idle processes that were terminated.
    pub reaped: Vec<String>,
    /// Processes found dead and evicted.
    pub evicted: Vec<String>,
    /// Slots skipped because a start, call or stop held them.
    pub busy: Vec<String>,
    /// Empty slots dropped from the registry.
    pub pruned: Vec<String>,
}

/// Visits every slot once, reclaiming idle or dead processes, then prunes
/// slots that have been empty for longer than `idle_threshold`.
///
/// Busy slots are skipped rather than awaited.
pub async fn sweep(
    registry: &PluginRegistry,
    supervisor: &Supervisor,
    observer: &dyn LifecycleObserver,
    idle_threshold: Duration,
) -> SweepReport {
    let mut report = SweepReport::default();
    for slot in registry.slots() {
        let name = slot.name().to_owned();
        match slot.reap(supervisor, idle_threshold).await {
            ReapOutcome::Reaped { idle } => {
                observer.reaped(&name, idle);
                report.reaped.push(name);
            }
            ReapOutcome::Died(error) => {
                observer.evicted(&name, &error);
                report.evicted.push(name);
            }
            ReapOutcome::Busy => report.busy.push(name),
            ReapOutcome::Empty | ReapOutcome::Kept => {}
        }
    }
    report.pruned = registry.prune(idle_threshold);
    report
}

/// Handle to the running reaper task. Dropping it cancels the loop.
#[derive(Debug)]
pub struct ReaperHandle {
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ReaperHandle {
    /// Stops the loop and waits for the in-progress sweep to finish.
    pub async fn stop(mut self) {
        self.token.cancel();
        if let Some(task) = self.task.take()
            && let Err(error) = task.await
        {
            debug!(target: REAPER_TARGET, %error, "reaper task ended abnormally");
        }
    }

    /// Returns `true` once the loop has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(JoinHandle::is_finished)
    }
}

impl Drop for ReaperHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Spawns the reaper loop on the current tokio runtime.
#[must_use]
pub fn spawn_reaper(
    registry: Arc<PluginRegistry>,
    supervisor: Arc<Supervisor>,
    observer: Arc<dyn LifecycleObserver>,
    settings: ReaperSettings,
) -> ReaperHandle {
    let token = CancellationToken::new();
    let child = token.child_token();
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(settings.interval.max(MIN_INTERVAL));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                () = child.cancelled() => break,
                _ = ticker.tick() => {
                    let report = sweep(
                        &registry,
                        &supervisor,
                        observer.as_ref(),
                        settings.idle_threshold,
                    )
                    .await;
                    debug!(
                        target: REAPER_TARGET,
                        reaped = report.reaped.len(),
                        evicted = report.evicted.len(),
                        busy = report.busy.len(),
                        pruned = report.pruned.len(),
                        "reaper sweep finished"
                    );
                }
            }
        }
        debug!(target: REAPER_TARGET, "reaper stopped");
    });
    ReaperHandle {
        token,
        task: Some(task),
    }
}
