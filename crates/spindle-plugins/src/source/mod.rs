//! Plugin source provisioning.
//!
//! A plugin is named by a *source reference*. A [`SourceProvisioner`] turns
//! the reference into a local directory, and [`SourceCache`] keeps that
//! directory for the lifetime of the manager so later starts skip the fetch.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::debug;

use crate::credentials::ResolvedCredential;
use crate::error::PluginError;

const SOURCE_TARGET: &str = "spindle_plugins::source";

/// A plugin source available on the local filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginSource {
    /// Reference the source was fetched from.
    pub reference: String,
    /// Local directory holding the source tree.
    pub local_path: PathBuf,
    /// Whether the path came from the cache rather than a fresh fetch.
    pub cached: bool,
}

/// Materialises source references as local directories.
#[async_trait]
pub trait SourceProvisioner: Send + Sync {
    /// Fetches `reference`, authenticating with `credential` when given.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Fetch`] when the source cannot be obtained.
    async fn fetch(
        &self,
        reference: &str,
        credential: Option<&ResolvedCredential>,
    ) -> Result<PathBuf, PluginError>;
}

/// Resolves references as sub-directories of a fixed root.
#[derive(Debug, Clone)]
pub struct LocalDirectoryProvisioner {
    root: PathBuf,
}

impl LocalDirectoryProvisioner {
    /// Creates a provisioner rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory that references are resolved against.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn fetch_error(reference: &str, message: impl Into<String>) -> PluginError {
    PluginError::Fetch {
        reference: reference.to_owned(),
        message: message.into(),
    }
}

/// Rejects references that would escape the provisioner root.
fn validate_reference(reference: &str) -> Result<&Path, PluginError> {
    if reference.trim().is_empty() {
        return Err(fetch_error(reference, "reference is empty"));
    }
    let path = Path::new(reference);
    if !path
        .components()
        .all(|component| matches!(component, Component::Normal(_)))
    {
        return Err(fetch_error(
            reference,
            "reference must be a relative path without '..'",
        ));
    }
    Ok(path)
}

#[async_trait]
impl SourceProvisioner for LocalDirectoryProvisioner {
    async fn fetch(
        &self,
        reference: &str,
        _credential: Option<&ResolvedCredential>,
    ) -> Result<PathBuf, PluginError> {
        let relative = validate_reference(reference)?;
        let path = self.root.join(relative);
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|error| fetch_error(reference, format!("{}: {error}", path.display())))?;
        if !metadata.is_dir() {
            return Err(fetch_error(
                reference,
                format!("{} is not a directory", path.display()),
            ));
        }
        Ok(path)
    }
}

/// Remembers fetched sources by reference.
#[derive(Debug, Default)]
pub struct SourceCache {
    entries: Mutex<HashMap<String, PathBuf>>,
}

impl SourceCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, PathBuf>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the cached source for `reference`, fetching it on a miss.
    ///
    /// The fetch runs without holding the cache lock. Failed fetches are not
    /// cached.
    ///
    /// # Errors
    ///
    /// Propagates the provisioner's error.
    pub async fn get_or_fetch(
        &self,
        reference: &str,
        provisioner: &dyn SourceProvisioner,
        credential: Option<&ResolvedCredential>,
    ) -> Result<PluginSource, PluginError> {
        if let Some(path) = self.entries().get(reference) {
            return Ok(PluginSource {
                reference: reference.to_owned(),
                local_path: path.clone(),
                cached: true,
            });
        }
        let path = provisioner.fetch(reference, credential).await?;
        debug!(
            target: SOURCE_TARGET,
            reference,
            path = %path.display(),
            "plugin source fetched"
        );
        let local_path = self
            .entries()
            .entry(reference.to_owned())
            .or_insert(path)
            .clone();
        Ok(PluginSource {
            reference: reference.to_owned(),
            local_path,
            cached: false,
        })
    }

    /// Drops the cached entry for `reference`.
    #[must_use = "reports whether an entry was removed"]
    pub fn invalidate(&self, reference: &str) -> bool {
        self.entries().remove(reference).is_some()
    }

    /// Number of cached sources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    /// Returns `true` when nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}
