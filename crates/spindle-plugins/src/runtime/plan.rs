//! Resolution of a source tree into a concrete launch plan.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::PluginError;
use crate::manifest::{HealthCheck, LaunchManifest};

use super::{LaunchCommand, RuntimeDetector, RuntimeKind};

/// Where the launch command of a plan comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandSource {
    /// A detected or manifest-selected runtime strategy.
    Strategy(RuntimeKind),
    /// An explicit argument vector from the manifest.
    Explicit(Vec<String>),
}

/// Everything needed to spawn and probe one plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    name: String,
    root: PathBuf,
    source: CommandSource,
    env: BTreeMap<String, String>,
    health: HealthCheck,
    call_path: String,
    capabilities_path: String,
    startup_timeout: Option<Duration>,
}

impl LaunchPlan {
    /// Resolves the plan for the tree at `root`.
    ///
    /// A manifest `command` wins over everything, then a manifest `runtime`,
    /// then marker detection.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Manifest`] for an invalid manifest and
    /// [`PluginError::UnsupportedRuntime`] when nothing matches.
    pub fn resolve(
        name: &str,
        root: &Path,
        detector: &RuntimeDetector,
    ) -> Result<Self, PluginError> {
        let manifest = LaunchManifest::load(root)?.unwrap_or_default();
        let source = match (&manifest.command, manifest.runtime) {
            (Some(argv), _) => CommandSource::Explicit(argv.clone()),
            (None, Some(kind)) => CommandSource::Strategy(kind),
            (None, None) => detector
                .select(root)
                .map(CommandSource::Strategy)
                .ok_or_else(|| PluginError::UnsupportedRuntime {
                    name: name.to_owned(),
                    root: root.to_path_buf(),
                })?,
        };

        Ok(Self {
            name: name.to_owned(),
            root: root.to_path_buf(),
            health: manifest.health_check(),
            call_path: manifest.call_path().to_owned(),
            capabilities_path: manifest.capabilities_path().to_owned(),
            startup_timeout: manifest.startup_timeout_secs.map(Duration::from_secs),
            env: manifest.env,
            source,
        })
    }

    /// Builds a plan directly, bypassing manifest and detection.
    #[must_use]
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>, source: CommandSource) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
            source,
            env: BTreeMap::new(),
            health: HealthCheck::default(),
            call_path: crate::manifest::DEFAULT_CALL_PATH.to_owned(),
            capabilities_path: crate::manifest::DEFAULT_CAPABILITIES_PATH.to_owned(),
            startup_timeout: None,
        }
    }

    /// Overrides the readiness check.
    #[must_use]
    pub fn with_health(mut self, health: HealthCheck) -> Self {
        self.health = health;
        self
    }

    /// Overrides the readiness deadline.
    #[must_use]
    pub const fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = Some(timeout);
        self
    }

    /// Adds an environment variable for the plugin process.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Plugin name.
    #[must_use]
    pub const fn name(&self) -> &str {
        self.name.as_str()
    }

    /// Source root, used as the working directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Origin of the launch command.
    #[must_use]
    pub const fn source(&self) -> &CommandSource {
        &self.source
    }

    /// Readiness check.
    #[must_use]
    pub const fn health(&self) -> &HealthCheck {
        &self.health
    }

    /// Path that receives forwarded calls.
    #[must_use]
    pub const fn call_path(&self) -> &str {
        self.call_path.as_str()
    }

    /// Path that lists the plugin's capabilities.
    #[must_use]
    pub const fn capabilities_path(&self) -> &str {
        self.capabilities_path.as_str()
    }

    /// Readiness deadline declared by the manifest, if any.
    #[must_use]
    pub const fn startup_timeout(&self) -> Option<Duration> {
        self.startup_timeout
    }

    /// Program that will be executed, before port assignment.
    #[must_use]
    pub fn program(&self) -> &str {
        match &self.source {
            CommandSource::Strategy(kind) => kind.program(),
            CommandSource::Explicit(argv) => argv.first().map_or("", String::as_str),
        }
    }

    /// Renders the final command for `port`, with manifest environment
    /// merged in.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::SpawnFailed`] if an explicit command is empty.
    pub fn command(&self, port: u16) -> Result<LaunchCommand, PluginError> {
        let command = match &self.source {
            CommandSource::Strategy(kind) => kind.build_command(&self.root, port),
            CommandSource::Explicit(argv) => {
                LaunchCommand::from_argv(argv, port).ok_or_else(|| PluginError::SpawnFailed {
                    name: self.name.clone(),
                    message: String::from("launch command is empty"),
                    source: None,
                })?
            }
        };
        // PORT and HOST stay authoritative over manifest env.
        Ok(command.with_envs(self.env.clone()).bound_to(port))
    }
}
