//! Domain errors raised by plugin lifecycle operations.
//!
//! All errors use `thiserror`-derived enums with structured context so callers
//! can inspect the failure programmatically. I/O errors are wrapped in `Arc`
//! so the whole enum is `Clone`: a single failed start attempt is handed to
//! every caller that queued behind it.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use crate::supervisor::{ExitSummary, OutputTail};

/// Errors arising from plugin lifecycle operations.
#[derive(Debug, Clone, Error)]
pub enum PluginError {
    /// No launch strategy matched the plugin source tree.
    #[error("plugin '{name}' has no supported runtime under {}", root.display())]
    UnsupportedRuntime {
        /// Plugin name.
        name: String,
        /// Source root that was inspected.
        root: PathBuf,
    },

    /// The program required by the selected strategy is not installed.
    #[error("plugin '{name}' requires '{program}', which was not found")]
    MissingRuntimeExecutable {
        /// Plugin name.
        name: String,
        /// Program that could not be resolved.
        program: String,
    },

    /// A `spindle.toml` manifest failed to parse or validate.
    #[error("invalid manifest {}: {message}", path.display())]
    Manifest {
        /// Manifest file path.
        path: PathBuf,
        /// Description of the problem.
        message: String,
    },

    /// No free loopback port could be reserved.
    #[error("no free loopback port after {attempts} attempts")]
    PortsExhausted {
        /// Number of reservations attempted.
        attempts: u32,
    },

    /// The plugin process could not be spawned.
    #[error("plugin '{name}' failed to start: {message}")]
    SpawnFailed {
        /// Plugin name.
        name: String,
        /// Human-readable failure description.
        message: String,
        /// Optional underlying I/O error.
        #[source]
        source: Option<Arc<io::Error>>,
    },

    /// The plugin did not pass its health check before the deadline.
    #[error("plugin '{name}' was not ready after {timeout_ms}ms{output}")]
    LaunchTimeout {
        /// Plugin name.
        name: String,
        /// Readiness deadline in milliseconds.
        timeout_ms: u64,
        /// Final lines captured from the process.
        output: OutputTail,
    },

    /// The plugin process exited on its own.
    #[error("plugin '{name}' exited with {exit}{output}")]
    ProcessExited {
        /// Plugin name.
        name: String,
        /// How the process ended.
        exit: ExitSummary,
        /// Final lines captured from the process.
        output: OutputTail,
    },

    /// A forwarded call did not complete in time.
    #[error("call to plugin '{name}' timed out after {timeout_ms}ms")]
    CallTimeout {
        /// Plugin name.
        name: String,
        /// Call timeout in milliseconds.
        timeout_ms: u64,
    },

    /// The plugin endpoint could not be reached or dropped the connection.
    #[error("call to plugin '{name}' failed: {message}")]
    CallTransportError {
        /// Plugin name.
        name: String,
        /// Transport failure description.
        message: String,
    },

    /// The plugin answered with a non-success HTTP status.
    #[error("plugin '{name}' rejected the call with status {status}: {body}")]
    CallRejected {
        /// Plugin name.
        name: String,
        /// HTTP status code.
        status: u16,
        /// Response body, truncated.
        body: String,
    },

    /// The plugin answered with a body that is not JSON.
    #[error("plugin '{name}' returned an invalid response: {message}")]
    InvalidResponse {
        /// Plugin name.
        name: String,
        /// Parse failure description.
        message: String,
    },

    /// The requester may not use the referenced credential.
    #[error("access to credential '{reference}' was denied")]
    CredentialAccessDenied {
        /// Credential reference.
        reference: String,
    },

    /// The referenced credential does not exist.
    #[error("credential '{reference}' not found")]
    CredentialNotFound {
        /// Credential reference.
        reference: String,
    },

    /// The plugin source could not be provisioned.
    #[error("failed to fetch plugin source '{reference}': {message}")]
    Fetch {
        /// Source reference.
        reference: String,
        /// Failure description.
        message: String,
    },

    /// An I/O error occurred while supervising the plugin process.
    #[error("I/O error supervising plugin '{name}': {source}")]
    Io {
        /// Plugin name.
        name: String,
        /// Underlying I/O error.
        #[source]
        source: Arc<io::Error>,
    },

    /// The manager has been shut down.
    #[error("plugin manager is shutting down")]
    ShuttingDown,
}

impl PluginError {
    /// Returns `true` for conditions that affect the whole manager rather
    /// than a single plugin. These are never retried.
    #[must_use]
    pub const fn is_manager_fatal(&self) -> bool {
        matches!(self, Self::PortsExhausted { .. } | Self::ShuttingDown)
    }

    /// Returns `true` when the failure means the plugin endpoint is gone
    /// rather than misbehaving.
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::CallTransportError { .. })
    }

    pub(crate) fn io(name: &str, source: io::Error) -> Self {
        Self::Io {
            name: name.to_owned(),
            source: Arc::new(source),
        }
    }
}

#[cfg(test)]
mod tests;
