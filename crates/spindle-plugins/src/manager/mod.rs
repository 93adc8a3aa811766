//! The public entry point of the lifecycle manager.
//!
//! [`PluginManager`] ties the pieces together. A call resolves or starts the
//! named plugin under its slot lock, releases the lock, and forwards the
//! payload through the gateway. Starting fetches the source, picks a launch
//! plan, spawns the process and waits for readiness; any failure terminates
//! the process and leaves the name `Failed` until the next attempt.
//! Capability refreshes travel the same way as calls and record their
//! outcome on the plugin.

mod settings;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::credentials::{
    CredentialResolver, NoCredentials, Requester, ResolvedCredential, Secret,
};
use crate::error::PluginError;
use crate::gateway::{CallGateway, PluginCapabilities};
use crate::observer::{LifecycleObserver, TracingObserver};
use crate::probe::{ProbeFailure, ReadinessProbe};
use crate::reaper::{ReaperHandle, spawn_reaper};
use crate::registry::{
    Endpoint, PluginProcess, PluginRegistry, PluginSlot, PluginSnapshot, PluginStatus,
};
use crate::runtime::{LaunchPlan, RuntimeDetector};
use crate::source::{LocalDirectoryProvisioner, SourceCache, SourceProvisioner};
use crate::supervisor::{PortLedger, RunningPlugin, Supervisor};

pub use self::settings::ManagerSettings;

const MANAGER_TARGET: &str = "spindle_plugins::manager";

/// How long a plugin that dropped a call may take to be observed as exited.
const LIVENESS_GRACE: Duration = Duration::from_millis(200);
const LIVENESS_POLL: Duration = Duration::from_millis(10);

/// Optional mapping from a plugin name to its source and credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginDefinition {
    /// Name callers use.
    pub name: String,
    /// Source reference handed to the provisioner.
    pub reference: String,
    /// Credential reference resolved for launches and calls.
    pub credential: Option<String>,
}

impl PluginDefinition {
    /// A definition whose reference is `reference` and with no credential.
    #[must_use]
    pub fn new(name: impl Into<String>, reference: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            reference: reference.into(),
            credential: None,
        }
    }

    /// Attaches a credential reference.
    #[must_use]
    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = Some(credential.into());
        self
    }
}

/// Builder for [`PluginManager`].
pub struct PluginManagerBuilder {
    settings: ManagerSettings,
    detector: RuntimeDetector,
    provisioner: Option<Arc<dyn SourceProvisioner>>,
    credentials: Arc<dyn CredentialResolver>,
    observer: Arc<dyn LifecycleObserver>,
    ports: Option<PortLedger>,
}

impl PluginManagerBuilder {
    /// Replaces the runtime strategy list.
    #[must_use]
    pub fn detector(mut self, detector: RuntimeDetector) -> Self {
        self.detector = detector;
        self
    }

    /// Replaces the default local-directory provisioner.
    #[must_use]
    pub fn provisioner(mut self, provisioner: Arc<dyn SourceProvisioner>) -> Self {
        self.provisioner = Some(provisioner);
        self
    }

    /// Sets the credential resolver. Defaults to [`NoCredentials`].
    #[must_use]
    pub fn credentials(mut self, credentials: Arc<dyn CredentialResolver>) -> Self {
        self.credentials = credentials;
        self
    }

    /// Sets the lifecycle observer. Defaults to [`TracingObserver`].
    #[must_use]
    pub fn observer(mut self, observer: Arc<dyn LifecycleObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Shares a port ledger with other supervisors.
    #[must_use]
    pub fn ports(mut self, ports: PortLedger) -> Self {
        self.ports = Some(ports);
        self
    }

    /// Builds the manager and starts its reaper.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    #[must_use]
    pub fn build(self) -> PluginManager {
        let mut supervisor = Supervisor::new(self.settings.supervisor());
        if let Some(ports) = self.ports {
            supervisor = supervisor.with_ports(ports);
        }
        let supervisor = Arc::new(supervisor);
        let registry = Arc::new(PluginRegistry::new());
        let provisioner = self.provisioner.unwrap_or_else(|| {
            Arc::new(LocalDirectoryProvisioner::new(
                self.settings.plugins_dir.clone(),
            ))
        });
        let reaper = spawn_reaper(
            Arc::clone(&registry),
            Arc::clone(&supervisor),
            Arc::clone(&self.observer),
            self.settings.reaper(),
        );
        PluginManager {
            probe: ReadinessProbe::new(self.settings.probe_interval),
            gateway: CallGateway::new(self.settings.call_timeout),
            settings: self.settings,
            detector: self.detector,
            registry,
            supervisor,
            sources: SourceCache::new(),
            provisioner,
            credentials: self.credentials,
            observer: self.observer,
            definitions: Mutex::new(HashMap::new()),
            reaper: Mutex::new(Some(reaper)),
            shutting_down: AtomicBool::new(false),
        }
    }
}

/// Starts, tracks, calls and reclaims local plugin servers.
pub struct PluginManager {
    settings: ManagerSettings,
    detector: RuntimeDetector,
    registry: Arc<PluginRegistry>,
    supervisor: Arc<Supervisor>,
    probe: ReadinessProbe,
    gateway: CallGateway,
    sources: SourceCache,
    provisioner: Arc<dyn SourceProvisioner>,
    credentials: Arc<dyn CredentialResolver>,
    observer: Arc<dyn LifecycleObserver>,
    definitions: Mutex<HashMap<String, PluginDefinition>>,
    reaper: Mutex<Option<ReaperHandle>>,
    shutting_down: AtomicBool,
}

impl PluginManager {
    /// Starts building a manager with `settings`.
    #[must_use]
    pub fn builder(settings: ManagerSettings) -> PluginManagerBuilder {
        PluginManagerBuilder {
            settings,
            detector: RuntimeDetector::default(),
            provisioner: None,
            credentials: Arc::new(NoCredentials),
            observer: Arc::new(TracingObserver),
            ports: None,
        }
    }

    /// Settings the manager was built with.
    #[must_use]
    pub const fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    /// Maps `definition.name` to a source reference and credential.
    /// Replaces an earlier definition for the same name.
    pub fn register(&self, definition: PluginDefinition) {
        self.definitions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(definition.name.clone(), definition);
    }

    fn definition(&self, name: &str) -> PluginDefinition {
        self.definitions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .unwrap_or_else(|| PluginDefinition::new(name, name))
    }

    fn ensure_open(&self) -> Result<(), PluginError> {
        if self.shutting_down.load(Ordering::Acquire) {
            Err(PluginError::ShuttingDown)
        } else {
            Ok(())
        }
    }

    /// Ensures `name` is running and ready.
    ///
    /// # Errors
    ///
    /// Returns the start failure, shared with concurrent callers that joined
    /// the same attempt.
    pub async fn start(&self, name: &str) -> Result<Endpoint, PluginError> {
        self.ready_slot(name, None)
            .await
            .map(|(_, endpoint)| endpoint)
    }

    /// Forwards `payload` to `name`, starting it first if needed.
    ///
    /// # Errors
    ///
    /// Returns start failures and call failures.
    pub async fn call(&self, name: &str, payload: &Value) -> Result<Value, PluginError> {
        self.call_as(name, payload, None).await
    }

    /// As [`Self::call`], on behalf of `requester`.
    ///
    /// A transport failure triggers one liveness check. If the process died
    /// it is evicted, restarted once, and the call retried once. A transport
    /// failure against a live process is returned as is.
    ///
    /// # Errors
    ///
    /// Returns start failures, credential failures and call failures.
    pub async fn call_as(
        &self,
        name: &str,
        payload: &Value,
        requester: Option<&Requester>,
    ) -> Result<Value, PluginError> {
        let (slot, endpoint) = self.ready_slot(name, requester).await?;
        let authorization = self.authorization(name, requester).await?;
        let first = self
            .forward(&slot, &endpoint, payload, authorization.as_ref())
            .await;
        let error = match first {
            Err(error) if error.is_transport() => error,
            other => return other,
        };

        let Some(death) = Self::confirm_death(&slot).await else {
            return Err(error);
        };
        self.observer.evicted(name, &death);
        debug!(
            target: MANAGER_TARGET,
            plugin = name,
            "plugin died during a call, restarting once"
        );
        let (slot, endpoint) = self.ready_slot(name, requester).await?;
        self.forward(&slot, &endpoint, payload, authorization.as_ref())
            .await
    }

    /// Reads the tools, resources and prompts `name` offers, starting it
    /// first if needed.
    ///
    /// The outcome is kept on the plugin: a success replaces the recorded
    /// capabilities, and either way the snapshot's `state_description` says
    /// what happened. A failed read leaves the process running.
    ///
    /// # Errors
    ///
    /// Returns start failures and the failure of the read itself.
    pub async fn refresh_capabilities(&self, name: &str) -> Result<PluginCapabilities, PluginError> {
        self.refresh_capabilities_as(name, None).await
    }

    /// As [`Self::refresh_capabilities`], on behalf of `requester`.
    ///
    /// # Errors
    ///
    /// Returns start failures, credential failures and read failures.
    pub async fn refresh_capabilities_as(
        &self,
        name: &str,
        requester: Option<&Requester>,
    ) -> Result<PluginCapabilities, PluginError> {
        let (slot, endpoint) = self.ready_slot(name, requester).await?;
        let authorization = self.authorization(name, requester).await?;
        let outcome = {
            let _call = slot.begin_call();
            self.gateway
                .capabilities(&endpoint, authorization.as_ref())
                .await
        };
        slot.record_capabilities(&outcome);
        match &outcome {
            Ok(capabilities) => debug!(
                target: MANAGER_TARGET,
                plugin = name,
                tools = capabilities.tools.len(),
                resources = capabilities.resources.len(),
                prompts = capabilities.prompts.len(),
                "capabilities refreshed"
            ),
            Err(error) => warn!(
                target: MANAGER_TARGET,
                plugin = name,
                %error,
                "capabilities refresh failed"
            ),
        }
        outcome
    }

    /// External status of `name`. Never waits on a start.
    #[must_use]
    pub fn status(&self, name: &str) -> PluginStatus {
        self.registry.status(name)
    }

    /// Detailed view of `name`.
    #[must_use]
    pub fn describe(&self, name: &str) -> PluginSnapshot {
        self.registry.snapshot(name)
    }

    /// Terminates `name` if it is running. Returns `false` when nothing was
    /// running.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Io`] when the process could not be reaped.
    pub async fn stop(&self, name: &str) -> Result<bool, PluginError> {
        let Some(slot) = self.registry.get(name) else {
            return Ok(false);
        };
        let stopped = slot.stop(&self.supervisor).await?;
        if stopped {
            self.observer.stopped(name);
        }
        Ok(stopped)
    }

    /// Stops the reaper and terminates every tracked plugin. Later starts
    /// and calls fail with [`PluginError::ShuttingDown`].
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let reaper = self
            .reaper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(reaper) = reaper {
            reaper.stop().await;
        }

        let mut stops = JoinSet::new();
        for slot in self.registry.slots() {
            let supervisor = Arc::clone(&self.supervisor);
            let observer = Arc::clone(&self.observer);
            stops.spawn(async move {
                match slot.stop(&supervisor).await {
                    Ok(true) => observer.stopped(slot.name()),
                    Ok(false) => {}
                    Err(error) => warn!(
                        target: MANAGER_TARGET,
                        plugin = slot.name(),
                        %error,
                        "plugin did not stop cleanly"
                    ),
                }
            });
        }
        while let Some(joined) = stops.join_next().await {
            if let Err(error) = joined {
                warn!(target: MANAGER_TARGET, %error, "stop task failed");
            }
        }
    }

    async fn ready_slot(
        &self,
        name: &str,
        requester: Option<&Requester>,
    ) -> Result<(Arc<PluginSlot>, Endpoint), PluginError> {
        self.ensure_open()?;
        let slot = self.registry.slot(name);
        let endpoint = slot.acquire(|| self.launch(name, requester)).await?;
        Ok((slot, endpoint))
    }

    /// Checks whether the process behind `slot` died, allowing it a moment
    /// to finish exiting after its connections dropped.
    async fn confirm_death(slot: &PluginSlot) -> Option<PluginError> {
        let deadline = Instant::now() + LIVENESS_GRACE;
        loop {
            if let Some(death) = slot.evict_if_dead().await {
                return Some(death);
            }
            if Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(LIVENESS_POLL).await;
        }
    }

    async fn forward(
        &self,
        slot: &Arc<PluginSlot>,
        endpoint: &Endpoint,
        payload: &Value,
        authorization: Option<&Secret>,
    ) -> Result<Value, PluginError> {
        let _call = slot.begin_call();
        self.gateway.forward(endpoint, payload, authorization).await
    }

    async fn resolve_credential(
        &self,
        name: &str,
        requester: Option<&Requester>,
    ) -> Result<Option<ResolvedCredential>, PluginError> {
        let Some(reference) = self.definition(name).credential else {
            return Ok(None);
        };
        self.credentials
            .resolve(&reference, requester)
            .await
            .map(Some)
    }

    async fn authorization(
        &self,
        name: &str,
        requester: Option<&Requester>,
    ) -> Result<Option<Secret>, PluginError> {
        let Some(credential) = self.resolve_credential(name, requester).await? else {
            return Ok(None);
        };
        credential.authorization(requester)
    }

    async fn launch(
        &self,
        name: &str,
        requester: Option<&Requester>,
    ) -> Result<PluginProcess, PluginError> {
        self.ensure_open()?;
        self.observer.starting(name);
        let outcome = self.launch_attempt(name, requester).await;
        if let Err(error) = &outcome {
            self.observer.failed(name, error);
        }
        outcome
    }

    async fn launch_attempt(
        &self,
        name: &str,
        requester: Option<&Requester>,
    ) -> Result<PluginProcess, PluginError> {
        let definition = self.definition(name);
        let credential = self.resolve_credential(name, requester).await?;
        let source = self
            .sources
            .get_or_fetch(
                &definition.reference,
                self.provisioner.as_ref(),
                credential.as_ref(),
            )
            .await?;
        let plan = LaunchPlan::resolve(name, &source.local_path, &self.detector)?;
        let credential_env = credential
            .as_ref()
            .map(ResolvedCredential::launch_env)
            .unwrap_or_default();

        let began = Instant::now();
        let mut running = self.supervisor.launch(&plan, &credential_env)?;
        self.observer.spawned(name, running.port(), running.pid());

        let timeout = plan
            .startup_timeout()
            .unwrap_or(self.settings.readiness_timeout);
        match self
            .probe
            .wait_ready(&mut running, plan.health(), timeout)
            .await
        {
            Ok(()) => {
                self.observer.ready(name, running.port(), began.elapsed());
                Ok(PluginProcess::new(running, plan.call_path())
                    .with_capabilities_path(plan.capabilities_path()))
            }
            Err(failure) => Err(self.abandon(running, failure, timeout).await),
        }
    }

    /// Terminates a plugin that never became ready and builds the error,
    /// including the tail of its output.
    async fn abandon(
        &self,
        mut running: RunningPlugin,
        failure: ProbeFailure,
        timeout: Duration,
    ) -> PluginError {
        let terminated = self.supervisor.terminate(&mut running).await;
        let output = running.final_output().await;
        let name = running.name().to_owned();
        match (failure, terminated) {
            (ProbeFailure::Exited(exit), _) | (ProbeFailure::Unobservable, Ok(exit)) => {
                PluginError::ProcessExited { name, exit, output }
            }
            (ProbeFailure::TimedOut, _) => PluginError::LaunchTimeout {
                name,
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                output,
            },
            (ProbeFailure::Unobservable, Err(error)) => error,
        }
    }
}

impl std::fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginManager")
            .field("settings", &self.settings)
            .field("plugins", &self.registry.len())
            .field("shutting_down", &self.shutting_down.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
