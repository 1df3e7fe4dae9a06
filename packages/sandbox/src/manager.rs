// ABOUTME: Per-user sandbox lifecycle manager
// ABOUTME: Ensures, recovers, creates, sweeps and destroys one agent container per user

use crate::client::AgentClient;
use crate::health::{ReadinessError, ReadinessProber};
use crate::monitor;
use crate::paths::PathTranslator;
use crate::ports::{PortAllocator, PortError};
use crate::providers::{
    ContainerConfig, ContainerInfo, PortMapping, Provider, ProviderError, VolumeMount,
};
use crate::registry::{SandboxRegistry, SandboxStatus, UserSandbox};
use crate::settings::{SandboxSettings, SettingsError};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const CONTAINER_NAME_PREFIX: &str = "orkee-agent-";
pub const LABEL_MANAGED: &str = "orkee.sandbox.managed";
pub const LABEL_COMPONENT: &str = "orkee.sandbox.component";
pub const LABEL_USER_ID: &str = "orkee.sandbox.user_id";
pub const COMPONENT_AGENT_WORKER: &str = "agent-worker";

const AGENT_HOME: &str = "/home/opencode";
const MAX_USER_ID_LEN: usize = 128;

#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("No free sandbox port in range {start}..{end}")]
    PortExhausted { start: u16, end: u16 },

    #[error("Failed to create sandbox for user {user_id}: {source}")]
    CreateFailed {
        user_id: String,
        #[source]
        source: ProviderError,
    },

    #[error("Sandbox at {url} did not become ready after {attempts} attempts")]
    NotReady { url: String, attempts: u32 },

    #[error("Sandbox for user {user_id} is not running (status: {status})")]
    NotRunning {
        user_id: String,
        status: SandboxStatus,
    },

    #[error("Container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("Invalid user id: {0:?}")]
    InvalidUserId(String),

    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error("Agent client error: {0}")]
    Client(String),

    #[error("Failed to prepare repos directory: {0}")]
    Io(#[from] std::io::Error),

    #[error("Sandbox task failed: {0}")]
    Task(String),
}

impl From<PortError> for ManagerError {
    fn from(err: PortError) -> Self {
        match err {
            PortError::Exhausted { start, end } => ManagerError::PortExhausted { start, end },
        }
    }
}

impl From<ReadinessError> for ManagerError {
    fn from(err: ReadinessError) -> Self {
        match err {
            ReadinessError::NotReady { url, attempts } => ManagerError::NotReady { url, attempts },
            ReadinessError::Client(msg) => ManagerError::Client(msg),
        }
    }
}

pub type Result<T> = std::result::Result<T, ManagerError>;

pub fn container_name(user_id: &str) -> String {
    format!("{}{}", CONTAINER_NAME_PREFIX, user_id)
}

/// User ids become part of container and volume names
pub fn validate_user_id(user_id: &str) -> Result<()> {
    let valid = !user_id.is_empty()
        && user_id.len() <= MAX_USER_ID_LEN
        && user_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));

    if valid {
        Ok(())
    } else {
        Err(ManagerError::InvalidUserId(user_id.to_string()))
    }
}

/// Labels carried by every sandbox container this manager creates
fn managed_labels() -> HashMap<String, String> {
    HashMap::from([
        (LABEL_MANAGED.to_string(), "true".to_string()),
        (
            LABEL_COMPONENT.to_string(),
            COMPONENT_AGENT_WORKER.to_string(),
        ),
    ])
}

/// One async mutex per user id, created on demand and dropped once nobody
/// holds or waits on it.
#[derive(Default)]
struct UserLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

struct UserLockGuard<'a> {
    guard: Option<OwnedMutexGuard<()>>,
    locks: &'a UserLocks,
    user_id: String,
}

impl UserLocks {
    async fn acquire(&self, user_id: &str) -> UserLockGuard<'_> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
            Arc::clone(locks.entry(user_id.to_string()).or_default())
        };

        UserLockGuard {
            guard: Some(lock.lock_owned().await),
            locks: self,
            user_id: user_id.to_string(),
        }
    }

    fn prune(&self, user_id: &str) {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        if locks
            .get(user_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(user_id);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

impl Drop for UserLockGuard<'_> {
    fn drop(&mut self) {
        // Release before pruning so our own clone is not counted
        self.guard.take();
        self.locks.prune(&self.user_id);
    }
}

/// Owns every per-user sandbox: the registry, the port pool and the runtime
/// handle. Cheap reads (`get_status`, `list_all`) never touch the runtime.
pub struct SandboxManager {
    provider: Arc<dyn Provider>,
    settings: SandboxSettings,
    registry: SandboxRegistry,
    ports: PortAllocator,
    prober: ReadinessProber,
    paths: PathTranslator,
    locks: UserLocks,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl SandboxManager {
    pub fn new(provider: Arc<dyn Provider>, settings: SandboxSettings) -> Result<Self> {
        settings.validate()?;

        let mut ports = PortAllocator::new(settings.port_range());
        if settings.probe_host_ports {
            ports = ports.with_host_probe();
        }
        let prober = ReadinessProber::new(
            settings.ready_retries,
            settings.ready_interval(),
            settings.probe_timeout(),
        );
        let paths = PathTranslator::new(&settings.host_repos_dir, &settings.sandbox_repos_dir);

        Ok(Self {
            provider,
            settings,
            registry: SandboxRegistry::new(),
            ports,
            prober,
            paths,
            locks: UserLocks::default(),
            sweeper: Mutex::new(None),
        })
    }

    pub fn settings(&self) -> &SandboxSettings {
        &self.settings
    }

    pub fn registry(&self) -> &SandboxRegistry {
        &self.registry
    }

    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    pub fn paths(&self) -> &PathTranslator {
        &self.paths
    }

    /// Connect to the runtime, adopt surviving containers and start the idle
    /// sweeper. A runtime that cannot be reached is an error; a missing image
    /// is only a warning.
    pub async fn init(self: &Arc<Self>) -> Result<()> {
        info!("Initializing sandbox manager");

        if let Err(e) = self.provider.ping().await {
            error!("Cannot connect to container runtime: {}", e);
            error!("Sandbox features are unavailable until the runtime is reachable");
            return Err(ManagerError::RuntimeUnavailable(e.to_string()));
        }
        info!("Container runtime connected");

        match self.provider.image_exists(&self.settings.image).await {
            Ok(true) => info!("Sandbox image {} found", self.settings.image),
            Ok(false) => warn!(
                "Sandbox image {} not found; sandbox creation will fail until it is available",
                self.settings.image
            ),
            Err(e) => warn!(
                "Could not check for sandbox image {}: {}",
                self.settings.image, e
            ),
        }

        let adopted = self.discover_on_startup().await;
        self.start_idle_sweeper();

        info!(
            "Sandbox manager ready ({} adopted, idle timeout {}m)",
            adopted, self.settings.idle_timeout_minutes
        );
        Ok(())
    }

    /// Return a live sandbox for `user_id`, recovering or creating one if
    /// needed. Concurrent calls for the same user share one provisioning
    /// sequence. The work runs on its own task, so a caller that gives up
    /// waiting does not interrupt a creation half way.
    pub async fn ensure(self: &Arc<Self>, user_id: &str) -> Result<UserSandbox> {
        validate_user_id(user_id)?;

        let manager = Arc::clone(self);
        let owned_id = user_id.to_string();
        match tokio::spawn(async move { manager.ensure_locked(&owned_id).await }).await {
            Ok(result) => result,
            Err(e) => {
                error!("Sandbox task for user {} failed: {}", user_id, e);
                self.discard_abandoned_start(user_id).await;
                Err(ManagerError::Task(e.to_string()))
            }
        }
    }

    /// Clear what a crashed creation left behind: its `starting` record,
    /// its port and any partial container.
    async fn discard_abandoned_start(&self, user_id: &str) {
        let _lock = self.locks.acquire(user_id).await;

        let Some(record) = self.registry.get(user_id).await else {
            return;
        };
        if record.status != SandboxStatus::Starting {
            return;
        }

        warn!(
            "Discarding abandoned sandbox start for user {} on port {}",
            user_id, record.host_port
        );
        self.ports.release(record.host_port);
        self.registry.remove(user_id).await;
        self.stop_and_remove(&container_name(user_id)).await.ok();
    }

    async fn ensure_locked(&self, user_id: &str) -> Result<UserSandbox> {
        let _lock = self.locks.acquire(user_id).await;

        if let Some(existing) = self.registry.get(user_id).await {
            // A `starting` record seen while holding the lock was left by a
            // creation that never finished
            if existing.status == SandboxStatus::Running {
                let touched = self
                    .registry
                    .update(user_id, |s| s.last_activity = Utc::now())
                    .await;
                return Ok(touched.unwrap_or(existing));
            }

            debug!(
                "Discarding {} record for user {} before recovery",
                existing.status, user_id
            );
            self.ports.release(existing.host_port);
            self.registry.remove(user_id).await;
        }

        if let Some(recovered) = self.recover(user_id).await {
            return Ok(recovered);
        }

        self.create(user_id).await
    }

    /// Adopt a container left over from an earlier process if it still
    /// answers; otherwise clear it out of the way.
    async fn recover(&self, user_id: &str) -> Option<UserSandbox> {
        let name = container_name(user_id);

        let info = match self.provider.inspect_container(&name).await {
            Ok(info) => info,
            Err(e) if e.is_not_found() => return None,
            Err(e) => {
                warn!("Failed to inspect container {}: {}", name, e);
                return None;
            }
        };

        if !info.is_running() {
            info!(
                "Removing non-running container {} ({:?})",
                name, info.status
            );
            self.stop_and_remove(&name).await.ok();
            return None;
        }

        let Some(host_port) = info.host_port_for(self.settings.agent_port) else {
            warn!(
                "Container {} publishes no port for {}, removing",
                name, self.settings.agent_port
            );
            self.stop_and_remove(&name).await.ok();
            return None;
        };

        let record = UserSandbox::adopted(user_id, &info.id, host_port, info.created_at);
        self.ports.mark_allocated(host_port);

        if let Err(e) = self.verify_liveness(&record.base_url).await {
            info!(
                "Stale container {} on port {} does not answer ({}), removing",
                name, host_port, e
            );
            self.stop_and_remove(&name).await.ok();
            self.ports.release(host_port);
            return None;
        }

        info!(
            "Recovered container {} for user {} on port {}",
            name, user_id, host_port
        );
        self.registry.insert(record.clone()).await;
        Some(record)
    }

    async fn create(&self, user_id: &str) -> Result<UserSandbox> {
        let host_port = self.ports.allocate()?;
        let name = container_name(user_id);

        let mut record = UserSandbox::starting(user_id, host_port);
        self.registry.insert(record.clone()).await;
        info!(
            "Creating container {} for user {} on port {}",
            name, user_id, host_port
        );

        match self.provision(user_id, &name, host_port, &record.base_url).await {
            Ok(container_id) => {
                record.sandbox_id = container_id;
                record.status = SandboxStatus::Running;
                record.last_activity = Utc::now();
                self.registry.insert(record.clone()).await;
                info!("Container {} ready at {}", name, record.base_url);
                Ok(record)
            }
            Err(e) => {
                error!("Failed to create container {}: {}", name, e);
                let message = e.to_string();
                self.registry
                    .update(user_id, |s| {
                        s.status = SandboxStatus::Error;
                        s.error = Some(message);
                    })
                    .await;

                self.ports.release(host_port);
                if let Err(cleanup) = self.stop_and_remove(&name).await {
                    warn!("Cleanup of failed container {} incomplete: {}", name, cleanup);
                }
                self.registry.remove(user_id).await;
                Err(e)
            }
        }
    }

    async fn provision(
        &self,
        user_id: &str,
        name: &str,
        host_port: u16,
        base_url: &str,
    ) -> Result<String> {
        tokio::fs::create_dir_all(&self.settings.host_repos_dir).await?;

        let config = self.container_config(user_id, name, host_port);
        let container_id = self
            .provider
            .create_container(&config)
            .await
            .map_err(|source| ManagerError::CreateFailed {
                user_id: user_id.to_string(),
                source,
            })?;

        self.registry
            .update(user_id, |s| s.sandbox_id = container_id.clone())
            .await;

        self.provider
            .start_container(&container_id)
            .await
            .map_err(|source| ManagerError::CreateFailed {
                user_id: user_id.to_string(),
                source,
            })?;

        self.prober.wait_until_ready(base_url).await?;
        Ok(container_id)
    }

    fn container_config(&self, user_id: &str, name: &str, host_port: u16) -> ContainerConfig {
        let agent_port = self.settings.agent_port;
        let sandbox_repos = self.settings.sandbox_repos_dir.to_string_lossy().into_owned();

        let env_vars = HashMap::from([
            ("OPENCODE_PORT".to_string(), agent_port.to_string()),
            ("REPOS_DIR".to_string(), sandbox_repos.clone()),
        ]);

        let volumes = vec![
            VolumeMount {
                source: format!("orkee-agent-auth-{}", user_id),
                container_path: format!("{}/.local/share/opencode", AGENT_HOME),
                readonly: false,
            },
            VolumeMount {
                source: format!("orkee-agent-config-{}", user_id),
                container_path: format!("{}/.config/opencode", AGENT_HOME),
                readonly: false,
            },
            VolumeMount {
                source: self.settings.host_repos_dir.to_string_lossy().into_owned(),
                container_path: sandbox_repos,
                readonly: false,
            },
        ];

        let mut labels = managed_labels();
        labels.insert(LABEL_USER_ID.to_string(), user_id.to_string());

        ContainerConfig {
            image: self.settings.image.clone(),
            name: name.to_string(),
            env_vars,
            volumes,
            ports: vec![PortMapping {
                host_port,
                container_port: agent_port,
                protocol: "tcp".to_string(),
            }],
            memory_mb: self.settings.memory_mb,
            cpu_shares: self.settings.cpu_shares,
            pids_limit: self.settings.pids_limit,
            restart_max_retries: self.settings.restart_max_retries,
            labels,
        }
    }

    async fn verify_liveness(&self, base_url: &str) -> Result<()> {
        let client = AgentClient::new(base_url, self.settings.probe_timeout())
            .map_err(|e| ManagerError::Client(e.to_string()))?;
        client
            .list_sessions()
            .await
            .map(|_| ())
            .map_err(|e| ManagerError::Client(e.to_string()))
    }

    /// Stop then remove a container by name. A container that is already
    /// gone counts as success; the last other error is returned.
    async fn stop_and_remove(&self, name: &str) -> std::result::Result<(), ProviderError> {
        let stopped = match self
            .provider
            .stop_container(name, self.settings.stop_timeout_secs)
            .await
        {
            Ok(()) => true,
            Err(e) if e.is_not_found() => {
                debug!("Container {} already gone", name);
                return Ok(());
            }
            Err(e) => {
                warn!("Failed to stop container {}: {}", name, e);
                false
            }
        };

        match self.provider.remove_container(name, !stopped).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => {
                warn!("Failed to remove container {}: {}", name, e);
                Err(e)
            }
        }
    }

    /// Tear down the sandbox for `user_id`. Runtime failures are logged and
    /// never leave the record or port behind; calling this for a user with no
    /// sandbox is a no-op.
    pub async fn destroy(&self, user_id: &str) -> Result<()> {
        validate_user_id(user_id)?;
        let _lock = self.locks.acquire(user_id).await;
        self.teardown(user_id).await;
        Ok(())
    }

    async fn teardown(&self, user_id: &str) {
        let name = container_name(user_id);
        let existing = self
            .registry
            .update(user_id, |s| s.status = SandboxStatus::Stopping)
            .await;

        info!("Destroying container {}", name);
        if let Err(e) = self.stop_and_remove(&name).await {
            warn!("Container {} may still exist: {}", name, e);
        }

        if let Some(record) = existing {
            self.ports.release(record.host_port);
            self.registry.remove(user_id).await;
        }
    }

    /// Reset the idle clock. No-op for unknown users.
    pub async fn touch(&self, user_id: &str) {
        self.registry
            .update(user_id, |s| s.last_activity = Utc::now())
            .await;
    }

    /// Ask the agent whether it is alive. A running record that fails the
    /// check is marked `error`, so the next `ensure` replaces it.
    pub async fn check_health(&self, user_id: &str) -> bool {
        let Some(record) = self.registry.get(user_id).await else {
            return false;
        };
        if record.status != SandboxStatus::Running {
            return false;
        }

        match self.verify_liveness(&record.base_url).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Health check failed for user {}: {}", user_id, e);
                let message = e.to_string();
                self.registry
                    .update(user_id, |s| {
                        if s.status == SandboxStatus::Running && s.host_port == record.host_port {
                            s.status = SandboxStatus::Error;
                            s.error = Some(message);
                        }
                    })
                    .await;
                false
            }
        }
    }

    pub async fn idle_sweep(&self) -> Vec<String> {
        self.sweep_idle_at(Utc::now()).await
    }

    /// Destroy every running sandbox idle for longer than the configured
    /// timeout as of `now`. Returns the user ids that were torn down.
    pub async fn sweep_idle_at(&self, now: DateTime<Utc>) -> Vec<String> {
        let idle_timeout = self.settings.idle_timeout();
        let is_idle = |s: &UserSandbox| {
            s.status == SandboxStatus::Running && s.idle_for(now) > idle_timeout
        };

        let candidates: Vec<String> = self
            .registry
            .list_by_status(SandboxStatus::Running)
            .await
            .into_iter()
            .filter(|s| is_idle(s))
            .map(|s| s.user_id)
            .collect();

        let mut destroyed = Vec::new();
        for user_id in candidates {
            let _lock = self.locks.acquire(&user_id).await;

            // Touched or replaced since we looked
            let still_idle = self
                .registry
                .get(&user_id)
                .await
                .is_some_and(|s| is_idle(&s));
            if !still_idle {
                continue;
            }

            info!(
                "Sandbox for user {} idle for more than {}m, destroying",
                user_id, self.settings.idle_timeout_minutes
            );
            self.teardown(&user_id).await;
            destroyed.push(user_id);
        }

        destroyed
    }

    /// Register running managed containers that survived a restart and
    /// remove stopped ones. Returns how many were adopted.
    pub async fn discover_on_startup(&self) -> usize {
        let containers = match self.provider.list_containers(&managed_labels()).await {
            Ok(containers) => containers,
            Err(e) => {
                error!("Failed to list existing sandbox containers: {}", e);
                return 0;
            }
        };

        let mut adopted = 0;
        for info in containers {
            let Some(user_id) = info.labels.get(LABEL_USER_ID).cloned() else {
                continue;
            };

            if info.is_running() {
                if self.adopt(&user_id, &info).await {
                    adopted += 1;
                }
            } else {
                match self.provider.remove_container(&info.id, true).await {
                    Ok(()) => info!("Removed stopped container {}", info.name),
                    Err(e) if e.is_not_found() => {}
                    Err(e) => warn!("Failed to remove stopped container {}: {}", info.name, e),
                }
            }
        }

        adopted
    }

    async fn adopt(&self, user_id: &str, info: &ContainerInfo) -> bool {
        if validate_user_id(user_id).is_err() {
            warn!("Ignoring container {} with invalid user label", info.name);
            return false;
        }
        let Some(host_port) = info.host_port_for(self.settings.agent_port) else {
            debug!("Container {} publishes no agent port, skipping", info.name);
            return false;
        };

        let _lock = self.locks.acquire(user_id).await;
        if self.registry.get(user_id).await.is_some() {
            debug!("User {} already has a sandbox record, skipping", user_id);
            return false;
        }

        self.ports.mark_allocated(host_port);
        self.registry
            .insert(UserSandbox::adopted(
                user_id,
                &info.id,
                host_port,
                info.created_at,
            ))
            .await;
        info!(
            "Adopted existing container {} for user {} on port {}",
            info.name, user_id, host_port
        );
        true
    }

    fn start_idle_sweeper(self: &Arc<Self>) {
        let mut sweeper = self.sweeper.lock().unwrap_or_else(|p| p.into_inner());
        if sweeper.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        *sweeper = Some(monitor::spawn_idle_sweeper(
            Arc::downgrade(self),
            self.settings.sweep_interval(),
        ));
    }

    fn stop_idle_sweeper(&self) {
        let handle = self
            .sweeper
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }

    pub fn is_sweeper_running(&self) -> bool {
        self.sweeper
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Stop the sweeper and tear down every known sandbox concurrently.
    pub async fn shutdown_all(&self) {
        info!("Shutting down sandbox manager");
        self.stop_idle_sweeper();

        let user_ids = self.registry.user_ids().await;
        let results = join_all(user_ids.iter().map(|user_id| async move {
            (user_id, self.destroy(user_id).await)
        }))
        .await;

        for (user_id, result) in results {
            if let Err(e) = result {
                error!("Error destroying sandbox for user {}: {}", user_id, e);
            }
        }

        info!("Sandbox manager shut down ({} sandbox(es))", user_ids.len());
    }

    pub async fn get_status(&self, user_id: &str) -> Option<UserSandbox> {
        self.registry.get(user_id).await
    }

    pub async fn list_all(&self) -> Vec<UserSandbox> {
        self.registry.list().await
    }

    /// Ensure the user's sandbox and hand back a client for its agent,
    /// optionally scoped to a host directory under the repos root.
    pub async fn client_for_user(
        self: &Arc<Self>,
        user_id: &str,
        directory: Option<&Path>,
    ) -> Result<AgentClient> {
        let sandbox = self.ensure(user_id).await?;
        if sandbox.status != SandboxStatus::Running {
            return Err(ManagerError::NotRunning {
                user_id: user_id.to_string(),
                status: sandbox.status,
            });
        }
        self.touch(user_id).await;

        let mut client = AgentClient::new(&sandbox.base_url, self.settings.probe_timeout())
            .map_err(|e| ManagerError::Client(e.to_string()))?;
        if let Some(directory) = directory {
            client = client.with_directory(
                self.paths
                    .to_sandbox_path(directory)
                    .to_string_lossy()
                    .into_owned(),
            );
        }
        Ok(client)
    }
}
