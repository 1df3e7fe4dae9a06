// ABOUTME: In-memory container runtime and fixtures shared by unit tests
// ABOUTME: Records every runtime call and can be told to fail specific operations

use crate::providers::{
    ContainerConfig, ContainerInfo, ContainerStatus, Provider, ProviderError,
};
use crate::settings::SandboxSettings;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

type Result<T> = std::result::Result<T, ProviderError>;

#[derive(Default)]
pub struct MockProvider {
    containers: Mutex<HashMap<String, ContainerInfo>>,
    created: Mutex<Vec<ContainerConfig>>,
    calls: Mutex<Vec<String>>,
    broken: Mutex<HashSet<String>>,
    next_id: AtomicUsize,
    pub unreachable: AtomicBool,
    pub fail_create: AtomicBool,
    /// Panic inside the next `create_container` call
    pub panic_create: AtomicBool,
    pub image_missing: AtomicBool,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretend a container already exists under the runtime
    pub fn add_container(
        &self,
        name: &str,
        status: ContainerStatus,
        ports: &[(u16, u16)],
        labels: &[(&str, &str)],
    ) {
        let id = format!("existing-{}", name);
        let info = ContainerInfo {
            id,
            name: name.to_string(),
            status,
            ports: ports.iter().copied().collect(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            created_at: Utc::now() - chrono::Duration::minutes(5),
        };
        self.lock_containers().insert(name.to_string(), info);
    }

    /// Make stop and remove fail for this container
    pub fn break_teardown(&self, name: &str) {
        self.broken
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(name.to_string());
    }

    pub fn container(&self, name: &str) -> Option<ContainerInfo> {
        self.lock_containers().get(name).cloned()
    }

    pub fn created_configs(&self) -> Vec<ContainerConfig> {
        self.created
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn count_calls(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    fn record(&self, call: String) {
        self.calls
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(call);
    }

    fn lock_containers(&self) -> std::sync::MutexGuard<'_, HashMap<String, ContainerInfo>> {
        self.containers.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn is_broken(&self, name: &str) -> bool {
        self.broken
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(name)
    }

    /// Resolve a name or id to the name key
    fn find(containers: &HashMap<String, ContainerInfo>, container: &str) -> Option<String> {
        if containers.contains_key(container) {
            return Some(container.to_string());
        }
        containers
            .values()
            .find(|c| c.id == container)
            .map(|c| c.name.clone())
    }
}

#[async_trait]
impl Provider for MockProvider {
    async fn ping(&self) -> Result<()> {
        self.record("ping".to_string());
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(ProviderError::ConnectionError(
                "connection refused".to_string(),
            ));
        }
        Ok(())
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        self.record(format!("image_exists {}", image));
        Ok(!self.image_missing.load(Ordering::SeqCst))
    }

    async fn create_container(&self, config: &ContainerConfig) -> Result<String> {
        self.record(format!("create {}", config.name));
        if self.panic_create.swap(false, Ordering::SeqCst) {
            panic!("runtime client crashed while creating {}", config.name);
        }
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(ProviderError::ContainerError("no space left".to_string()));
        }

        let mut containers = self.lock_containers();
        if containers.contains_key(&config.name) {
            return Err(ProviderError::ContainerError(format!(
                "Conflict: name {} already in use",
                config.name
            )));
        }

        let id = format!("ctr-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        containers.insert(
            config.name.clone(),
            ContainerInfo {
                id: id.clone(),
                name: config.name.clone(),
                status: ContainerStatus::Created,
                ports: config
                    .ports
                    .iter()
                    .map(|p| (p.container_port, p.host_port))
                    .collect(),
                labels: config.labels.clone(),
                created_at: Utc::now(),
            },
        );
        self.created
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(config.clone());

        Ok(id)
    }

    async fn start_container(&self, container: &str) -> Result<()> {
        self.record(format!("start {}", container));
        let mut containers = self.lock_containers();
        let key = Self::find(&containers, container)
            .ok_or_else(|| ProviderError::NotFound(container.to_string()))?;
        if let Some(info) = containers.get_mut(&key) {
            info.status = ContainerStatus::Running;
        }
        Ok(())
    }

    async fn stop_container(&self, container: &str, _timeout_secs: u64) -> Result<()> {
        self.record(format!("stop {}", container));
        if self.is_broken(container) {
            return Err(ProviderError::ContainerError(
                "container did not stop in time".to_string(),
            ));
        }
        let mut containers = self.lock_containers();
        let key = Self::find(&containers, container)
            .ok_or_else(|| ProviderError::NotFound(container.to_string()))?;
        if let Some(info) = containers.get_mut(&key) {
            info.status = ContainerStatus::Stopped;
        }
        Ok(())
    }

    async fn remove_container(&self, container: &str, force: bool) -> Result<()> {
        self.record(format!("remove {}", container));
        if self.is_broken(container) {
            return Err(ProviderError::ContainerError(
                "removal already in progress".to_string(),
            ));
        }
        let mut containers = self.lock_containers();
        let key = Self::find(&containers, container)
            .ok_or_else(|| ProviderError::NotFound(container.to_string()))?;
        if !force && containers.get(&key).is_some_and(|c| c.is_running()) {
            return Err(ProviderError::ContainerError(
                "cannot remove a running container".to_string(),
            ));
        }
        containers.remove(&key);
        Ok(())
    }

    async fn inspect_container(&self, container: &str) -> Result<ContainerInfo> {
        self.record(format!("inspect {}", container));
        let containers = self.lock_containers();
        Self::find(&containers, container)
            .and_then(|key| containers.get(&key).cloned())
            .ok_or_else(|| ProviderError::NotFound(container.to_string()))
    }

    async fn list_containers(
        &self,
        labels: &HashMap<String, String>,
    ) -> Result<Vec<ContainerInfo>> {
        self.record("list".to_string());
        Ok(self
            .lock_containers()
            .values()
            .filter(|c| labels.iter().all(|(k, v)| c.labels.get(k) == Some(v)))
            .cloned()
            .collect())
    }
}

/// Settings tuned for tests: fast readiness, one-port range, temp repos dir
pub fn test_settings(port: u16, repos_dir: &std::path::Path) -> SandboxSettings {
    SandboxSettings {
        host_repos_dir: repos_dir.to_path_buf(),
        port_range_start: port,
        port_range_end: port.saturating_add(1),
        probe_host_ports: false,
        ready_retries: 3,
        ready_interval_ms: 10,
        probe_timeout_secs: 1,
        stop_timeout_secs: 1,
        ..Default::default()
    }
}

/// An agent server that passes both readiness and liveness checks
pub async fn healthy_agent() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(crate::health::READINESS_PATH))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(crate::client::SESSION_LIST_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
        .mount(&server)
        .await;
    server
}

/// A port nothing listens on
pub fn dead_port() -> u16 {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))
        .unwrap_or_else(|e| panic!("failed to bind: {}", e));
    let port = listener
        .local_addr()
        .unwrap_or_else(|e| panic!("no local addr: {}", e))
        .port();
    drop(listener);
    port
}
