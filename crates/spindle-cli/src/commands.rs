//! Execution of parsed commands against a plugin manager.

use std::future::Future;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use serde_json::Value;
use spindle_config::Config;
use spindle_plugins::runtime::CommandSource;
use spindle_plugins::{LaunchPlan, PluginManager, RuntimeDetector};
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::cli::CliCommand;
use crate::config::manager_settings;
use crate::{AppError, IoStreams};

const CLI_TARGET: &str = "spindle_cli::commands";

/// Runs `command`, writing results to `io`.
///
/// `shutdown` resolves when a serving host should stop.
pub(crate) async fn execute<W, E, S>(
    command: CliCommand,
    config: &Config,
    io: &mut IoStreams<'_, W, E>,
    shutdown: S,
) -> Result<(), AppError>
where
    W: Write,
    E: Write,
    S: Future<Output = Result<(), AppError>>,
{
    match command {
        CliCommand::Detect { path } => detect(&path, io),
        CliCommand::Start { name } => {
            let manager = PluginManager::builder(manager_settings(config)).build();
            let outcome = start(&manager, &name, io).await;
            manager.shutdown().await;
            outcome
        }
        CliCommand::Call { name, payload } => {
            let payload: Value = serde_json::from_str(&payload).map_err(AppError::InvalidPayload)?;
            let manager = PluginManager::builder(manager_settings(config)).build();
            let outcome = call(&manager, &name, &payload, io).await;
            manager.shutdown().await;
            outcome
        }
        CliCommand::Capabilities { name } => {
            let manager = PluginManager::builder(manager_settings(config)).build();
            let outcome = capabilities(&manager, &name, io).await;
            manager.shutdown().await;
            outcome
        }
        CliCommand::Serve { names } => {
            let manager = Arc::new(PluginManager::builder(manager_settings(config)).build());
            let outcome = serve(&manager, names, shutdown).await;
            manager.shutdown().await;
            outcome
        }
    }
}

fn detect<W: Write, E: Write>(path: &Path, io: &mut IoStreams<'_, W, E>) -> Result<(), AppError> {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| AppError::UnnamedSource(path.display().to_string()))?;
    let plan = LaunchPlan::resolve(&name, path, &RuntimeDetector::default())?;
    let origin = match plan.source() {
        CommandSource::Strategy(kind) => kind.as_str(),
        CommandSource::Explicit(_) => "manifest",
    };
    let command = plan.command(0)?;
    writeln!(io.stdout, "{origin}: {command}").map_err(AppError::WriteOutput)
}

async fn start<W: Write, E: Write>(
    manager: &PluginManager,
    name: &str,
    io: &mut IoStreams<'_, W, E>,
) -> Result<(), AppError> {
    let endpoint = manager.start(name).await?;
    writeln!(
        io.stdout,
        "{} ready on 127.0.0.1:{}{}",
        endpoint.name, endpoint.port, endpoint.call_path
    )
    .map_err(AppError::WriteOutput)
}

async fn call<W: Write, E: Write>(
    manager: &PluginManager,
    name: &str,
    payload: &Value,
    io: &mut IoStreams<'_, W, E>,
) -> Result<(), AppError> {
    let reply = manager.call(name, payload).await?;
    serde_json::to_writer_pretty(&mut *io.stdout, &reply).map_err(AppError::RenderReply)?;
    writeln!(io.stdout).map_err(AppError::WriteOutput)
}

async fn capabilities<W: Write, E: Write>(
    manager: &PluginManager,
    name: &str,
    io: &mut IoStreams<'_, W, E>,
) -> Result<(), AppError> {
    let listing = manager.refresh_capabilities(name).await?;
    serde_json::to_writer_pretty(&mut *io.stdout, &listing).map_err(AppError::RenderReply)?;
    writeln!(io.stdout).map_err(AppError::WriteOutput)
}

async fn serve<S>(
    manager: &Arc<PluginManager>,
    names: Vec<String>,
    shutdown: S,
) -> Result<(), AppError>
where
    S: Future<Output = Result<(), AppError>>,
{
    let total = names.len();
    let mut preloads = JoinSet::new();
    for name in names {
        let manager = Arc::clone(manager);
        preloads.spawn(async move {
            let outcome = manager.start(&name).await;
            (name, outcome)
        });
    }

    let mut failed = 0usize;
    for (name, outcome) in preloads.join_all().await {
        match outcome {
            Ok(endpoint) => {
                info!(target: CLI_TARGET, plugin = %name, port = endpoint.port, "plugin preloaded");
            }
            Err(error) => {
                failed += 1;
                warn!(target: CLI_TARGET, plugin = %name, %error, "plugin failed to preload");
            }
        }
    }
    if failed > 0 {
        return Err(AppError::Preload { failed, total });
    }

    info!(target: CLI_TARGET, plugins = total, "serving until interrupted");
    shutdown.await?;
    info!(target: CLI_TARGET, "shutdown requested");
    Ok(())
}

/// Resolves when the process receives `SIGINT` or `SIGTERM`.
pub(crate) async fn shutdown_signal() -> Result<(), AppError> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .map_err(AppError::Signal)?;
    tokio::select! {
        interrupted = tokio::signal::ctrl_c() => interrupted.map_err(AppError::Signal),
        _ = terminate.recv() => Ok(()),
    }
}
