// ABOUTME: Container runtime trait used by the per-user sandbox lifecycle manager
// ABOUTME: Defines the control API (create/start/stop/remove/inspect/list) and its data types

use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;

pub mod docker;

pub use docker::DockerProvider;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Container not found: {0}")]
    NotFound(String),

    #[error("Container error: {0}")]
    ContainerError(String),

    #[error("Image error: {0}")]
    ImageError(String),
}

impl ProviderError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, ProviderError>;

/// Everything the runtime needs to create one agent sandbox
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerConfig {
    pub image: String,
    pub name: String,
    pub env_vars: HashMap<String, String>,
    pub volumes: Vec<VolumeMount>,
    pub ports: Vec<PortMapping>,
    pub memory_mb: u64,
    pub cpu_shares: i64,
    pub pids_limit: i64,
    pub restart_max_retries: i64,
    pub labels: HashMap<String, String>,
}

/// A bind or named-volume mount. `source` is either an absolute host path or
/// a volume name.
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeMount {
    pub source: String,
    pub container_path: String,
    pub readonly: bool,
}

impl VolumeMount {
    pub fn to_bind(&self) -> String {
        format!(
            "{}:{}:{}",
            self.source,
            self.container_path,
            if self.readonly { "ro" } else { "rw" }
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PortMapping {
    pub host_port: u16,
    pub container_port: u16,
    pub protocol: String, // tcp or udp
}

/// Container state as reported by the runtime
#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub status: ContainerStatus,
    pub ports: HashMap<u16, u16>, // container_port -> host_port
    pub labels: HashMap<String, String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl ContainerInfo {
    pub fn is_running(&self) -> bool {
        self.status == ContainerStatus::Running
    }

    /// Host port published for the given container port, if any
    pub fn host_port_for(&self, container_port: u16) -> Option<u16> {
        self.ports.get(&container_port).copied()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ContainerStatus {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Stopped,
    Dead,
    Unknown(String),
}

impl ContainerStatus {
    pub fn from_docker_state(state: &str) -> Self {
        match state.to_lowercase().as_str() {
            "created" => Self::Created,
            "running" => Self::Running,
            "paused" => Self::Paused,
            "restarting" => Self::Restarting,
            "removing" => Self::Removing,
            "exited" => Self::Stopped,
            "dead" => Self::Dead,
            other => Self::Unknown(other.to_string()),
        }
    }
}

/// Control API of the container runtime hosting the agent sandboxes
#[async_trait]
pub trait Provider: Send + Sync {
    /// Check that the runtime daemon answers
    async fn ping(&self) -> Result<()>;

    /// Check if an image exists locally
    async fn image_exists(&self, image: &str) -> Result<bool>;

    /// Create (but do not start) a container, returning its id
    async fn create_container(&self, config: &ContainerConfig) -> Result<String>;

    async fn start_container(&self, container: &str) -> Result<()>;

    /// Stop a container, killing it after `timeout_secs`
    async fn stop_container(&self, container: &str, timeout_secs: u64) -> Result<()>;

    async fn remove_container(&self, container: &str, force: bool) -> Result<()>;

    /// Inspect a container by name or id. Missing containers are `NotFound`.
    async fn inspect_container(&self, container: &str) -> Result<ContainerInfo>;

    /// List containers (running or not) carrying all of the given labels
    async fn list_containers(&self, labels: &HashMap<String, String>)
        -> Result<Vec<ContainerInfo>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_status_from_docker_state() {
        assert_eq!(
            ContainerStatus::from_docker_state("running"),
            ContainerStatus::Running
        );
        assert_eq!(
            ContainerStatus::from_docker_state("Exited"),
            ContainerStatus::Stopped
        );
        assert_eq!(
            ContainerStatus::from_docker_state("weird"),
            ContainerStatus::Unknown("weird".to_string())
        );
    }

    #[test]
    fn test_volume_mount_bind_string() {
        let named = VolumeMount {
            source: "orkee-agent-auth-alice".to_string(),
            container_path: "/home/opencode/.local/share/opencode".to_string(),
            readonly: false,
        };
        assert_eq!(
            named.to_bind(),
            "orkee-agent-auth-alice:/home/opencode/.local/share/opencode:rw"
        );
    }
}
