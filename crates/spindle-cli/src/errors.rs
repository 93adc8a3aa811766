//! Error types for the CLI runtime.

use std::io;
use std::sync::Arc;

use spindle_plugins::PluginError;
use thiserror::Error;

use crate::telemetry::TelemetryError;

#[derive(Debug, Error)]
pub(crate) enum AppError {
    #[error("failed to load configuration: {0}")]
    LoadConfiguration(Arc<ortho_config::OrthoError>),
    #[error("{0}")]
    CliUsage(clap::Error),
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),
    #[error("failed to start the async runtime: {0}")]
    Runtime(io::Error),
    #[error("invalid JSON payload: {0}")]
    InvalidPayload(serde_json::Error),
    #[error("plugin source path {0} has no directory name")]
    UnnamedSource(String),
    #[error(transparent)]
    Plugin(#[from] PluginError),
    #[error("{failed} of {total} plugins failed to start")]
    Preload { failed: usize, total: usize },
    #[error("failed to wait for a shutdown signal: {0}")]
    Signal(io::Error),
    #[error("failed to write output: {0}")]
    WriteOutput(io::Error),
    #[error("failed to render plugin reply: {0}")]
    RenderReply(serde_json::Error),
}
