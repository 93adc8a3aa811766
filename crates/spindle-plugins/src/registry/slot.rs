//! One named plugin: its live process and its externally visible state.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;
use tracing::debug;

use crate::error::PluginError;
use crate::gateway::PluginCapabilities;
use crate::manifest::DEFAULT_CAPABILITIES_PATH;
use crate::supervisor::{ExitSummary, RunningPlugin, Supervisor};

use super::{PluginSnapshot, PluginStatus};

const SLOT_TARGET: &str = "spindle_plugins::registry";

/// Lifecycle stage of a single spawned process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    /// Spawned, not yet confirmed ready.
    Starting,
    /// Passed its readiness check.
    Ready,
    /// Failed its readiness check or died.
    Failed,
    /// Stopped by the manager.
    Terminated,
}

impl ProcessStatus {
    pub(crate) const fn can_become(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Starting, Self::Ready | Self::Failed | Self::Terminated)
                | (Self::Ready, Self::Failed | Self::Terminated)
        )
    }
}

/// Address of a ready plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Plugin name.
    pub name: String,
    /// Loopback port.
    pub port: u16,
    /// Path that receives forwarded calls.
    pub call_path: String,
    /// Path that lists the plugin's capabilities.
    pub capabilities_path: String,
}

/// A spawned plugin process owned by its slot.
#[derive(Debug)]
pub struct PluginProcess {
    running: RunningPlugin,
    call_path: String,
    capabilities_path: String,
    status: ProcessStatus,
    started_at: SystemTime,
}

impl PluginProcess {
    /// Wraps a freshly spawned process in the `Starting` state.
    #[must_use]
    pub fn new(running: RunningPlugin, call_path: impl Into<String>) -> Self {
        Self {
            running,
            call_path: call_path.into(),
            capabilities_path: DEFAULT_CAPABILITIES_PATH.to_owned(),
            status: ProcessStatus::Starting,
            started_at: SystemTime::now(),
        }
    }

    /// Overrides the capabilities path.
    #[must_use]
    pub fn with_capabilities_path(mut self, path: impl Into<String>) -> Self {
        self.capabilities_path = path.into();
        self
    }

    /// Moves to `next` if the transition is allowed. Terminal states never
    /// change. Returns whether the status changed.
    pub fn advance(&mut self, next: ProcessStatus) -> bool {
        if self.status.can_become(next) {
            self.status = next;
            true
        } else {
            false
        }
    }

    /// Current stage.
    #[must_use]
    pub const fn status(&self) -> ProcessStatus {
        self.status
    }

    /// The underlying process.
    #[must_use]
    pub const fn running(&self) -> &RunningPlugin {
        &self.running
    }

    /// Mutable access to the underlying process.
    pub const fn running_mut(&mut self) -> &mut RunningPlugin {
        &mut self.running
    }

    fn endpoint(&self) -> Endpoint {
        Endpoint {
            name: self.running.name().to_owned(),
            port: self.running.port(),
            call_path: self.call_path.clone(),
            capabilities_path: self.capabilities_path.clone(),
        }
    }
}

/// What a reaper sweep did to one slot.
#[derive(Debug, Clone)]
pub enum ReapOutcome {
    /// The slot was locked by a start, call or stop.
    Busy,
    /// No process is tracked.
    Empty,
    /// The process is in use or not idle long enough.
    Kept,
    /// The idle process was terminated and evicted.
    Reaped {
        /// Time since last use.
        idle: Duration,
    },
    /// The process had exited on its own and was evicted.
    Died(PluginError),
}

#[derive(Debug, Default)]
struct SlotState {
    status: PluginStatus,
    completed_attempts: u64,
    last_outcome: Option<Result<(), PluginError>>,
    last_error: Option<PluginError>,
    port: Option<u16>,
    pid: Option<u32>,
    started_at: Option<SystemTime>,
    last_used: Option<Instant>,
    last_used_at: Option<SystemTime>,
    status_changed: Option<Instant>,
    in_flight: usize,
    capabilities: Option<PluginCapabilities>,
    state_description: Option<String>,
}

impl SlotState {
    fn set_status(&mut self, status: PluginStatus) {
        self.status = status;
        self.status_changed = Some(Instant::now());
    }

    fn touch(&mut self) {
        self.last_used = Some(Instant::now());
        self.last_used_at = Some(SystemTime::now());
    }

    fn clear_process(&mut self) {
        self.port = None;
        self.pid = None;
        self.started_at = None;
    }
}

/// Per-name cell holding at most one live process.
///
/// The async `process` lock serialises start, stop and reap for this name
/// and is never held across a forwarded call. The synchronous `state` cell
/// mirrors what observers need so status reads never wait on a start.
#[derive(Debug)]
pub struct PluginSlot {
    name: String,
    process: AsyncMutex<Option<PluginProcess>>,
    state: Mutex<SlotState>,
}

impl PluginSlot {
    pub(super) fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            process: AsyncMutex::new(None),
            state: Mutex::new(SlotState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Plugin name.
    #[must_use]
    pub const fn name(&self) -> &str {
        self.name.as_str()
    }

    /// Current status, without waiting on any lifecycle operation.
    #[must_use]
    pub fn status(&self) -> PluginStatus {
        self.state().status
    }

    /// Number of start attempts that ran to completion.
    #[must_use]
    pub fn completed_attempts(&self) -> u64 {
        self.state().completed_attempts
    }

    /// Returns `true` when the slot tracks nothing worth keeping: no process,
    /// no call or lifecycle operation in progress, and an absent or failed
    /// status older than `retention`.
    #[must_use]
    pub fn is_disposable(&self, retention: Duration) -> bool {
        let Ok(process) = self.process.try_lock() else {
            return false;
        };
        if process.is_some() {
            return false;
        }
        let state = self.state();
        matches!(state.status, PluginStatus::Absent | PluginStatus::Failed)
            && state.in_flight == 0
            && state
                .status_changed
                .is_none_or(|changed| changed.elapsed() >= retention)
    }

    /// Point-in-time description of this slot.
    #[must_use]
    pub fn snapshot(&self) -> PluginSnapshot {
        let state = self.state();
        PluginSnapshot {
            name: self.name.clone(),
            status: state.status,
            port: state.port,
            pid: state.pid,
            started_at: state.started_at,
            last_used: state.last_used_at,
            in_flight_calls: state.in_flight,
            last_error: state.last_error.as_ref().map(ToString::to_string),
            capabilities: state.capabilities.clone(),
            state_description: state.state_description.clone(),
        }
    }

    /// Returns the endpoint of the live process, starting one with `start`
    /// if there is none.
    ///
    /// Concurrent callers are single-flighted: one runs `start`, the others
    /// wait on the slot lock. A waiter that arrived while an attempt was in
    /// progress shares that attempt's outcome instead of starting again; a
    /// caller arriving after a failed attempt completed retries.
    ///
    /// # Errors
    ///
    /// Returns the error of the attempt this caller ran or joined.
    pub async fn acquire<F, Fut>(&self, start: F) -> Result<Endpoint, PluginError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<PluginProcess, PluginError>>,
    {
        let seen = self.completed_attempts();
        let mut guard = self.process.lock().await;

        if let Some(process) = guard.as_mut() {
            match process.running_mut().try_exit() {
                Ok(None) => {
                    let endpoint = process.endpoint();
                    self.state().touch();
                    return Ok(endpoint);
                }
                Ok(Some(exit)) => {
                    drop(self.evict_exited(&mut guard, exit).await);
                }
                Err(error) => self.evict_failed(&mut guard, error),
            }
        }

        {
            let state = self.state();
            if state.completed_attempts != seen
                && let Some(Err(error)) = &state.last_outcome
            {
                debug!(
                    target: SLOT_TARGET,
                    plugin = self.name.as_str(),
                    "joining outcome of concurrent start attempt"
                );
                return Err(error.clone());
            }
        }

        let mut attempt = AttemptMark::begin(self);
        let outcome = start().await;
        attempt.complete();

        let mut state = self.state();
        state.completed_attempts = state.completed_attempts.saturating_add(1);
        match outcome {
            Ok(mut process) => {
                process.advance(ProcessStatus::Ready);
                state.set_status(PluginStatus::Ready);
                state.port = Some(process.running.port());
                state.pid = process.running.pid();
                state.started_at = Some(process.started_at);
                state.last_error = None;
                state.last_outcome = Some(Ok(()));
                state.touch();
                drop(state);
                let endpoint = process.endpoint();
                *guard = Some(process);
                Ok(endpoint)
            }
            Err(error) => {
                state.set_status(PluginStatus::Failed);
                state.clear_process();
                state.last_error = Some(error.clone());
                state.last_outcome = Some(Err(error.clone()));
                Err(error)
            }
        }
    }

    /// Records the outcome of a capabilities refresh.
    ///
    /// A failure keeps the last capabilities that were read successfully.
    pub fn record_capabilities(&self, outcome: &Result<PluginCapabilities, PluginError>) {
        let mut state = self.state();
        match outcome {
            Ok(capabilities) => {
                state.state_description = Some(format!(
                    "capabilities refreshed: {} tools, {} resources, {} prompts",
                    capabilities.tools.len(),
                    capabilities.resources.len(),
                    capabilities.prompts.len()
                ));
                state.capabilities = Some(capabilities.clone());
            }
            Err(error) => {
                state.state_description =
                    Some(format!("failed to refresh capabilities: {error}"));
            }
        }
    }

    /// Marks a call as in flight. The returned guard refreshes the last-used
    /// marker again when dropped.
    #[must_use]
    pub fn begin_call(self: &Arc<Self>) -> CallGuard {
        let mut state = self.state();
        state.in_flight = state.in_flight.saturating_add(1);
        state.touch();
        CallGuard {
            slot: Arc::clone(self),
        }
    }

    /// Evicts the process if it has exited, returning the recorded error.
    pub async fn evict_if_dead(&self) -> Option<PluginError> {
        let mut guard = self.process.lock().await;
        let process = guard.as_mut()?;
        match process.running_mut().try_exit() {
            Ok(None) => None,
            Ok(Some(exit)) => Some(self.evict_exited(&mut guard, exit).await),
            Err(error) => {
                self.evict_failed(&mut guard, error.clone());
                Some(error)
            }
        }
    }

    /// Terminates and evicts the live process. Returns `false` when there was
    /// nothing to stop.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Io`] if the process could not be reaped; it is
    /// evicted regardless.
    pub async fn stop(&self, supervisor: &Supervisor) -> Result<bool, PluginError> {
        let mut guard = self.process.lock().await;
        let Some(mut process) = guard.take() else {
            return Ok(false);
        };
        let result = supervisor.terminate(process.running_mut()).await;
        process.advance(ProcessStatus::Terminated);
        self.record_absent();
        result.map(|_| true)
    }

    /// Reclaims the process if it is idle beyond `threshold` or dead. Never
    /// waits on the slot lock.
    pub async fn reap(&self, supervisor: &Supervisor, threshold: Duration) -> ReapOutcome {
        let Ok(mut guard) = self.process.try_lock() else {
            return ReapOutcome::Busy;
        };
        let Some(process) = guard.as_mut() else {
            return ReapOutcome::Empty;
        };
        match process.running_mut().try_exit() {
            Ok(None) => {}
            Ok(Some(exit)) => return ReapOutcome::Died(self.evict_exited(&mut guard, exit).await),
            Err(error) => {
                self.evict_failed(&mut guard, error.clone());
                return ReapOutcome::Died(error);
            }
        }

        let (idle, in_flight) = {
            let state = self.state();
            let idle = state
                .last_used
                .map_or(Duration::ZERO, |used| used.elapsed());
            (idle, state.in_flight)
        };
        if in_flight > 0 || idle < threshold {
            return ReapOutcome::Kept;
        }

        let Some(mut process) = guard.take() else {
            return ReapOutcome::Empty;
        };
        if let Err(error) = supervisor.terminate(process.running_mut()).await {
            debug!(
                target: SLOT_TARGET,
                plugin = self.name.as_str(),
                %error,
                "idle plugin did not terminate cleanly"
            );
        }
        process.advance(ProcessStatus::Terminated);
        self.record_absent();
        ReapOutcome::Reaped { idle }
    }

    async fn evict_exited(
        &self,
        slot: &mut Option<PluginProcess>,
        exit: ExitSummary,
    ) -> PluginError {
        let output = match slot.as_mut() {
            Some(process) => process.running_mut().final_output().await,
            None => crate::supervisor::OutputTail::default(),
        };
        let error = PluginError::ProcessExited {
            name: self.name.clone(),
            exit,
            output,
        };
        self.evict_failed(slot, error.clone());
        error
    }

    fn evict_failed(&self, slot: &mut Option<PluginProcess>, error: PluginError) {
        if let Some(mut process) = slot.take() {
            process.advance(ProcessStatus::Failed);
        }
        debug!(
            target: SLOT_TARGET,
            plugin = self.name.as_str(),
            %error,
            "evicted dead plugin process"
        );
        let mut state = self.state();
        state.set_status(PluginStatus::Failed);
        state.clear_process();
        state.last_error = Some(error);
    }

    fn record_absent(&self) {
        let mut state = self.state();
        state.set_status(PluginStatus::Absent);
        state.clear_process();
    }
}

/// Keeps a call counted as in flight until dropped.
#[derive(Debug)]
pub struct CallGuard {
    slot: Arc<PluginSlot>,
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        let mut state = self.slot.state();
        state.in_flight = state.in_flight.saturating_sub(1);
        state.touch();
    }
}

/// Marks the slot as starting and reverts to absent if the attempt is
/// abandoned before it completes.
struct AttemptMark<'a> {
    slot: &'a PluginSlot,
    completed: bool,
}

impl<'a> AttemptMark<'a> {
    fn begin(slot: &'a PluginSlot) -> Self {
        slot.state().set_status(PluginStatus::Starting);
        Self {
            slot,
            completed: false,
        }
    }

    const fn complete(&mut self) {
        self.completed = true;
    }
}

impl Drop for AttemptMark<'_> {
    fn drop(&mut self) {
        if !self.completed {
            self.slot.record_absent();
        }
    }
}
