//! Shared table of plugin slots.
//!
//! The [`PluginRegistry`] maps plugin names to [`PluginSlot`]s. The table
//! itself sits behind a short-held synchronous mutex used only to look up or
//! insert slots; all lifecycle work happens under the per-slot async lock, so
//! a slow start of one plugin never blocks another. Slots left empty are
//! pruned by the reaper so the table does not grow with every name ever
//! requested.

mod slot;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use serde::Serialize;

use crate::gateway::PluginCapabilities;

pub use self::slot::{CallGuard, Endpoint, PluginProcess, PluginSlot, ProcessStatus, ReapOutcome};

/// Externally visible lifecycle state of a named plugin.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginStatus {
    /// No process is tracked.
    #[default]
    Absent,
    /// A start attempt is in progress.
    Starting,
    /// The process passed its readiness check and accepts calls.
    Ready,
    /// The last start attempt failed or the process died.
    Failed,
}

impl PluginStatus {
    /// Returns the canonical string representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Absent => "absent",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for PluginStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time description of one plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginSnapshot {
    /// Plugin name.
    pub name: String,
    /// Lifecycle state.
    pub status: PluginStatus,
    /// Port of the live process.
    pub port: Option<u16>,
    /// Process id of the live process.
    pub pid: Option<u32>,
    /// When the live process was spawned.
    pub started_at: Option<SystemTime>,
    /// When the plugin last served or received a call.
    pub last_used: Option<SystemTime>,
    /// Calls currently being forwarded.
    pub in_flight_calls: usize,
    /// Message of the most recent failure.
    pub last_error: Option<String>,
    /// Capabilities from the last successful refresh.
    pub capabilities: Option<PluginCapabilities>,
    /// Outcome of the last capabilities refresh, in words.
    pub state_description: Option<String>,
}

impl PluginSnapshot {
    /// Snapshot of a name that was never seen.
    #[must_use]
    pub fn absent(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            status: PluginStatus::Absent,
            port: None,
            pid: None,
            started_at: None,
            last_used: None,
            in_flight_calls: 0,
            last_error: None,
            capabilities: None,
            state_description: None,
        }
    }
}

/// Registry of plugin slots keyed by name.
#[derive(Debug, Default)]
pub struct PluginRegistry {
    slots: Mutex<HashMap<String, Arc<PluginSlot>>>,
}

impl PluginRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, Arc<PluginSlot>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the slot for `name`, creating it on first use.
    #[must_use]
    pub fn slot(&self, name: &str) -> Arc<PluginSlot> {
        let mut table = self.table();
        if let Some(slot) = table.get(name) {
            return Arc::clone(slot);
        }
        let slot = Arc::new(PluginSlot::new(name));
        table.insert(name.to_owned(), Arc::clone(&slot));
        slot
    }

    /// Returns the slot for `name` without creating it.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<PluginSlot>> {
        self.table().get(name).cloned()
    }

    /// All slots, in no particular order.
    #[must_use]
    pub fn slots(&self) -> Vec<Arc<PluginSlot>> {
        self.table().values().cloned().collect()
    }

    /// Status of `name`; names never seen are [`PluginStatus::Absent`].
    #[must_use]
    pub fn status(&self, name: &str) -> PluginStatus {
        self.get(name).map_or(PluginStatus::Absent, |slot| slot.status())
    }

    /// Snapshot of `name`.
    #[must_use]
    pub fn snapshot(&self, name: &str) -> PluginSnapshot {
        self.get(name)
            .map_or_else(|| PluginSnapshot::absent(name), |slot| slot.snapshot())
    }

    /// Drops slots that no caller holds and that are disposable after
    /// `retention`, returning their names.
    ///
    /// Holding the table lock while checking the reference count means no
    /// new handle to a slot can appear between the check and the removal.
    pub fn prune(&self, retention: Duration) -> Vec<String> {
        let mut pruned = Vec::new();
        self.table().retain(|name, slot| {
            let keep = Arc::strong_count(slot) > 1 || !slot.is_disposable(retention);
            if !keep {
                pruned.push(name.clone());
            }
            keep
        });
        pruned
    }

    /// Number of known names.
    #[must_use]
    pub fn len(&self) -> usize {
        self.table().len()
    }

    /// Returns `true` when no name was ever seen.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table().is_empty()
    }
}
