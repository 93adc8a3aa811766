//! Spawning, output capture and termination of plugin processes.
//!
//! Every plugin runs in its own process group with `PORT` and `HOST` in its
//! environment and the source root as its working directory. Termination
//! signals the whole group: `SIGTERM` first, then `SIGKILL` once the grace
//! period has elapsed.

mod output;
mod ports;

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::PluginError;
use crate::manifest::HealthCheck;
use crate::runtime::{LaunchCommand, LaunchPlan};

pub use self::output::{ExitSummary, OutputBuffer, OutputTail, Stream};
pub use self::ports::{DEFAULT_PORT_ATTEMPTS, PortLease, PortLedger};

const SUPERVISOR_TARGET: &str = "spindle_plugins::supervisor";

/// Upper bound on waiting for output readers to flush final lines.
pub const READER_DRAIN_LIMIT: Duration = Duration::from_millis(250);

/// Tunables of the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorSettings {
    /// Time between `SIGTERM` and `SIGKILL`.
    pub grace_period: Duration,
    /// Captured output lines retained per plugin.
    pub output_lines: usize,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(2),
            output_lines: 200,
        }
    }
}

/// Spawns and stops plugin processes.
#[derive(Debug, Clone, Default)]
pub struct Supervisor {
    settings: SupervisorSettings,
    ports: PortLedger,
}

impl Supervisor {
    /// Creates a supervisor with its own port ledger.
    #[must_use]
    pub fn new(settings: SupervisorSettings) -> Self {
        Self {
            settings,
            ports: PortLedger::default(),
        }
    }

    /// Replaces the port ledger.
    #[must_use]
    pub fn with_ports(mut self, ports: PortLedger) -> Self {
        self.ports = ports;
        self
    }

    /// Ports leased to live plugins.
    #[must_use]
    pub const fn ports(&self) -> &PortLedger {
        &self.ports
    }

    /// Configured tunables.
    #[must_use]
    pub const fn settings(&self) -> SupervisorSettings {
        self.settings
    }

    /// Spawns the plugin described by `plan`.
    ///
    /// `extra_env` is merged over the plan environment; it carries
    /// per-launch values such as resolved credentials.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::MissingRuntimeExecutable`] before anything is
    /// spawned when the program cannot be found, [`PluginError::PortsExhausted`]
    /// when no port can be leased, and [`PluginError::SpawnFailed`] when the
    /// OS refuses to start the process.
    pub fn launch(
        &self,
        plan: &LaunchPlan,
        extra_env: &BTreeMap<String, String>,
    ) -> Result<RunningPlugin, PluginError> {
        let name = plan.name();
        let program = which::which_in(plan.program(), std::env::var_os("PATH"), plan.root())
            .map_err(|_| PluginError::MissingRuntimeExecutable {
                name: name.to_owned(),
                program: plan.program().to_owned(),
            })?;

        let lease = self.ports.reserve()?;
        let command = plan
            .command(lease.port())?
            .with_envs(extra_env.clone());

        let mut process = Command::new(&program);
        process
            .args(command.args())
            .envs(command.env())
            .current_dir(plan.root())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        debug!(
            target: SUPERVISOR_TARGET,
            plugin = name,
            program = %program.display(),
            command = %command,
            port = lease.port(),
            "spawning plugin process"
        );

        let mut child = process.spawn().map_err(|error| PluginError::SpawnFailed {
            name: name.to_owned(),
            message: error.to_string(),
            source: Some(std::sync::Arc::new(error)),
        })?;

        let output = match plan.health() {
            HealthCheck::OutputMarker { marker } => {
                OutputBuffer::with_marker(self.settings.output_lines, marker.as_str())
            }
            HealthCheck::Http { .. } => OutputBuffer::new(self.settings.output_lines),
        };
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(output::capture(name, Stream::Stdout, stdout, output.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(output::capture(name, Stream::Stderr, stderr, output.clone()));
        }

        Ok(RunningPlugin {
            name: name.to_owned(),
            pid: child.id(),
            child,
            lease,
            output,
            readers,
            command,
        })
    }

    /// Stops `plugin`: `SIGTERM` to its group, then `SIGKILL` after the
    /// grace period. A process that already exited is only reaped.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Io`] when the process cannot be waited on.
    pub async fn terminate(&self, plugin: &mut RunningPlugin) -> Result<ExitSummary, PluginError> {
        if let Some(exit) = plugin.try_exit()? {
            plugin.drain_output().await;
            return Ok(exit);
        }

        plugin.signal_group(Signal::SIGTERM);
        let graceful = tokio::time::timeout(self.settings.grace_period, plugin.child.wait()).await;
        let status = match graceful {
            Ok(waited) => waited.map_err(|error| PluginError::io(&plugin.name, error))?,
            Err(_) => {
                warn!(
                    target: SUPERVISOR_TARGET,
                    plugin = plugin.name.as_str(),
                    grace_ms = u64::try_from(self.settings.grace_period.as_millis())
                        .unwrap_or(u64::MAX),
                    "plugin ignored SIGTERM, killing process group"
                );
                plugin.signal_group(Signal::SIGKILL);
                // The group kill normally suffices; this covers a child that
                // left the group.
                drop(plugin.child.start_kill());
                plugin
                    .child
                    .wait()
                    .await
                    .map_err(|error| PluginError::io(&plugin.name, error))?
            }
        };
        plugin.drain_output().await;

        let exit = ExitSummary::from(status);
        debug!(
            target: SUPERVISOR_TARGET,
            plugin = plugin.name.as_str(),
            %exit,
            "plugin process terminated"
        );
        Ok(exit)
    }
}

/// A spawned plugin process and the resources tied to it.
#[derive(Debug)]
pub struct RunningPlugin {
    name: String,
    pid: Option<u32>,
    child: Child,
    lease: PortLease,
    output: OutputBuffer,
    readers: Vec<JoinHandle<()>>,
    command: LaunchCommand,
}

impl RunningPlugin {
    /// Plugin name.
    #[must_use]
    pub const fn name(&self) -> &str {
        self.name.as_str()
    }

    /// Port the plugin was told to listen on.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.lease.port()
    }

    /// OS process id, also the process group id.
    #[must_use]
    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Captured output.
    #[must_use]
    pub const fn output(&self) -> &OutputBuffer {
        &self.output
    }

    /// Command the process was spawned with.
    #[must_use]
    pub const fn command(&self) -> &LaunchCommand {
        &self.command
    }

    /// Returns the exit summary if the process has ended, without blocking.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Io`] if the process state cannot be queried.
    pub fn try_exit(&mut self) -> Result<Option<ExitSummary>, PluginError> {
        self.child
            .try_wait()
            .map(|status| status.map(ExitSummary::from))
            .map_err(|error| PluginError::io(&self.name, error))
    }

    /// Returns `true` while the process has not exited.
    pub fn is_alive(&mut self) -> bool {
        matches!(self.try_exit(), Ok(None))
    }

    /// Waits briefly for output readers to finish, then returns the
    /// retained output.
    pub async fn final_output(&mut self) -> OutputTail {
        self.drain_output().await;
        self.output.tail()
    }

    async fn drain_output(&mut self) {
        output::drain(&mut self.readers, READER_DRAIN_LIMIT).await;
    }

    fn signal_group(&self, signal: Signal) {
        let Some(pgid) = self.pid.and_then(|pid| i32::try_from(pid).ok()) else {
            return;
        };
        match killpg(Pid::from_raw(pgid), signal) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(error) => warn!(
                target: SUPERVISOR_TARGET,
                plugin = self.name.as_str(),
                ?signal,
                %error,
                "failed to signal plugin process group"
            ),
        }
    }
}
