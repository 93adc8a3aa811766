//! Lifecycle management for locally run plugin servers.
//!
//! A plugin is an HTTP server in any language whose source lives in a local
//! directory. The [`PluginManager`] starts it on demand, waits for it to pass
//! a health check, forwards JSON calls to it, and stops it again once it has
//! been idle for long enough.
//!
//! # Architecture
//!
//! - [`runtime`] picks a launch strategy from marker files or a
//!   `spindle.toml` [`manifest`].
//! - [`supervisor`] leases a loopback port, spawns the process in its own
//!   process group, captures its output and terminates it.
//! - [`probe`] waits for readiness within a deadline.
//! - [`registry`] holds one slot per name. Starts are single-flighted under
//!   the slot lock; status reads never wait.
//! - [`reaper`] sweeps the registry, reclaims idle or dead processes and
//!   prunes slots left empty.
//! - [`gateway`] forwards calls over loopback HTTP and reads the
//!   capabilities a plugin advertises.
//! - [`source`] and [`credentials`] are the seams to source provisioning and
//!   credential storage.
//! - [`observer`] reports lifecycle events.
//!
//! # Example
//!
//! ```rust,no_run
//! use serde_json::json;
//! use spindle_plugins::{ManagerSettings, PluginManager};
//!
//! # async fn demo() -> Result<(), spindle_plugins::PluginError> {
//! let manager = PluginManager::builder(ManagerSettings::new("/srv/plugins")).build();
//! let reply = manager.call("echo", &json!({ "msg": "hi" })).await?;
//! assert_eq!(reply, json!({ "msg": "hi" }));
//! manager.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod credentials;
pub mod error;
pub mod gateway;
pub mod manager;
pub mod manifest;
pub mod observer;
pub mod probe;
pub mod reaper;
pub mod registry;
pub mod runtime;
pub mod source;
pub mod supervisor;

#[cfg(test)]
mod tests;

pub use self::credentials::{
    CredentialFields, CredentialResolver, NoCredentials, Requester, ResolvedCredential, Secret,
    StaticCredentials,
};
pub use self::error::PluginError;
pub use self::gateway::PluginCapabilities;
pub use self::manager::{ManagerSettings, PluginDefinition, PluginManager, PluginManagerBuilder};
pub use self::manifest::{HealthCheck, LaunchManifest};
pub use self::observer::{LifecycleObserver, TracingObserver};
pub use self::registry::{Endpoint, PluginSnapshot, PluginStatus};
pub use self::runtime::{LaunchCommand, LaunchPlan, RuntimeDetector, RuntimeKind};
pub use self::source::{LocalDirectoryProvisioner, PluginSource, SourceProvisioner};
