//! Optional launch manifest (`spindle.toml`) found at a plugin source root.
//!
//! A manifest overrides runtime detection. When it declares a `command`, that
//! command is used verbatim (after `{port}` substitution) regardless of any
//! marker files. When it declares only a `runtime`, the named strategy is used
//! without marker detection. Manifests are validated once, on load; keys the
//! loader does not understand are kept in [`LaunchManifest::extra`] and logged.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::debug;

use crate::error::PluginError;
use crate::runtime::RuntimeKind;

/// File name of the launch manifest.
pub const MANIFEST_FILE: &str = "spindle.toml";

/// Default health check path.
pub const DEFAULT_HEALTH_PATH: &str = "/health";

/// Default path that receives forwarded calls.
pub const DEFAULT_CALL_PATH: &str = "/call";

/// Default path that lists the tools, resources and prompts a plugin offers.
pub const DEFAULT_CAPABILITIES_PATH: &str = "/capabilities";

const MANIFEST_TARGET: &str = "spindle_plugins::manifest";

/// Inclusive range of HTTP status codes treated as healthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct StatusRange {
    /// Lowest accepted status.
    pub min: u16,
    /// Highest accepted status.
    pub max: u16,
}

impl Default for StatusRange {
    fn default() -> Self {
        Self { min: 200, max: 299 }
    }
}

impl StatusRange {
    /// Returns `true` when `status` lies within the range.
    #[must_use]
    pub const fn contains(self, status: u16) -> bool {
        status >= self.min && status <= self.max
    }
}

/// How readiness of a freshly spawned plugin is confirmed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthCheck {
    /// `GET http://127.0.0.1:<port><path>` answers with a status in range.
    Http {
        /// Request path, starting with `/`.
        path: String,
        /// Accepted status codes.
        expected: StatusRange,
    },
    /// A captured output line contains `marker`.
    OutputMarker {
        /// Substring to look for.
        marker: String,
    },
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self::Http {
            path: DEFAULT_HEALTH_PATH.to_owned(),
            expected: StatusRange::default(),
        }
    }
}

/// `[health]` table of the manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HealthSection {
    /// HTTP path to probe.
    pub path: Option<String>,
    /// Accepted HTTP statuses.
    pub expected_status: Option<StatusRange>,
    /// Output marker that signals readiness instead of an HTTP probe.
    pub marker: Option<String>,
}

/// Parsed contents of `spindle.toml`.
///
/// # Example
///
/// ```toml
/// command = ["./bin/server", "--port", "{port}"]
/// call_path = "/invoke"
/// capabilities_path = "/describe"
/// startup_timeout_secs = 20
///
/// [env]
/// RUST_LOG = "info"
///
/// [health]
/// path = "/ready"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct LaunchManifest {
    /// Explicit argument vector, program first.
    #[serde(default)]
    pub command: Option<Vec<String>>,
    /// Runtime strategy to use instead of detection.
    #[serde(default)]
    pub runtime: Option<RuntimeKind>,
    /// Extra environment for the plugin process.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Readiness check configuration.
    #[serde(default)]
    pub health: Option<HealthSection>,
    /// Path that receives forwarded calls.
    #[serde(default)]
    pub call_path: Option<String>,
    /// Path that lists the plugin's capabilities.
    #[serde(default)]
    pub capabilities_path: Option<String>,
    /// Readiness deadline overriding the manager default.
    #[serde(default)]
    pub startup_timeout_secs: Option<u64>,
    /// Keys the loader does not recognise.
    #[serde(flatten)]
    pub extra: toml::Table,
}

impl LaunchManifest {
    /// Loads and validates `spindle.toml` under `root`.
    ///
    /// Returns `Ok(None)` when the tree carries no manifest.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Manifest`] if the file cannot be read, is not
    /// valid TOML, or fails validation.
    pub fn load(root: &Path) -> Result<Option<Self>, PluginError> {
        let path = root.join(MANIFEST_FILE);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(manifest_error(&path, error.to_string())),
        };
        let manifest = Self::parse(&path, &text)?;
        Ok(Some(manifest))
    }

    /// Parses and validates manifest text read from `path`.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Manifest`] on parse or validation failure.
    pub fn parse(path: &Path, text: &str) -> Result<Self, PluginError> {
        let manifest: Self =
            toml::from_str(text).map_err(|error| manifest_error(path, error.to_string()))?;
        manifest.validate(path)?;
        if !manifest.extra.is_empty() {
            let keys: Vec<&str> = manifest.extra.keys().map(String::as_str).collect();
            debug!(
                target: MANIFEST_TARGET,
                path = %path.display(),
                ?keys,
                "ignoring unrecognised manifest keys"
            );
        }
        Ok(manifest)
    }

    fn validate(&self, path: &Path) -> Result<(), PluginError> {
        if let Some(command) = &self.command {
            match command.first() {
                None => return Err(manifest_error(path, "command must not be empty")),
                Some(program) if program.trim().is_empty() => {
                    return Err(manifest_error(path, "command program must not be blank"));
                }
                Some(_) => {}
            }
        }
        if let Some(call_path) = &self.call_path {
            require_absolute_path(path, "call_path", call_path)?;
        }
        if let Some(capabilities_path) = &self.capabilities_path {
            require_absolute_path(path, "capabilities_path", capabilities_path)?;
        }
        if self.startup_timeout_secs == Some(0) {
            return Err(manifest_error(
                path,
                "startup_timeout_secs must be greater than zero",
            ));
        }
        if let Some(health) = &self.health {
            validate_health(path, health)?;
        }
        Ok(())
    }

    /// Readiness check declared by the manifest, or the default HTTP probe.
    #[must_use]
    pub fn health_check(&self) -> HealthCheck {
        let Some(health) = &self.health else {
            return HealthCheck::default();
        };
        if let Some(marker) = &health.marker {
            return HealthCheck::OutputMarker {
                marker: marker.clone(),
            };
        }
        HealthCheck::Http {
            path: health
                .path
                .clone()
                .unwrap_or_else(|| DEFAULT_HEALTH_PATH.to_owned()),
            expected: health.expected_status.unwrap_or_default(),
        }
    }

    /// Call path declared by the manifest, or `/call`.
    #[must_use]
    pub fn call_path(&self) -> &str {
        self.call_path.as_deref().unwrap_or(DEFAULT_CALL_PATH)
    }

    /// Capabilities path declared by the manifest, or `/capabilities`.
    #[must_use]
    pub fn capabilities_path(&self) -> &str {
        self.capabilities_path
            .as_deref()
            .unwrap_or(DEFAULT_CAPABILITIES_PATH)
    }
}

fn validate_health(path: &Path, health: &HealthSection) -> Result<(), PluginError> {
    if health.marker.is_some() && (health.path.is_some() || health.expected_status.is_some()) {
        return Err(manifest_error(
            path,
            "health.marker cannot be combined with an HTTP health check",
        ));
    }
    if health.marker.as_deref() == Some("") {
        return Err(manifest_error(path, "health.marker must not be empty"));
    }
    if let Some(probe_path) = &health.path {
        require_absolute_path(path, "health.path", probe_path)?;
    }
    if let Some(range) = health.expected_status {
        let valid = 100..=599;
        if range.min > range.max || !valid.contains(&range.min) || !valid.contains(&range.max) {
            return Err(manifest_error(
                path,
                format!(
                    "health.expected_status {}..={} is not a valid HTTP status range",
                    range.min, range.max
                ),
            ));
        }
    }
    Ok(())
}

fn require_absolute_path(path: &Path, key: &str, value: &str) -> Result<(), PluginError> {
    if value.starts_with('/') {
        Ok(())
    } else {
        Err(manifest_error(
            path,
            format!("{key} must start with '/', got '{value}'"),
        ))
    }
}

fn manifest_error(path: &Path, message: impl Into<String>) -> PluginError {
    PluginError::Manifest {
        path: PathBuf::from(path),
        message: message.into(),
    }
}
