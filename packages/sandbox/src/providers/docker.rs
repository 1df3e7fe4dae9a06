// ABOUTME: Docker implementation of the sandbox container runtime
// ABOUTME: Uses bollard to create, start, stop, inspect and list per-user agent containers

use super::{ContainerConfig, ContainerInfo, ContainerStatus, Provider, ProviderError, Result};
use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
        StartContainerOptions, StopContainerOptions,
    },
    errors::Error as BollardError,
    image::ListImagesOptions,
    models::{
        ContainerInspectResponse, ContainerSummary, HostConfig, PortBinding, PortMap,
        RestartPolicy, RestartPolicyNameEnum,
    },
    Docker,
};
use std::collections::HashMap;
use tracing::{debug, info};

pub struct DockerProvider {
    client: Docker,
}

impl DockerProvider {
    /// Connect using the local defaults (`DOCKER_HOST` or the platform socket)
    pub fn new() -> Result<Self> {
        let client = Docker::connect_with_defaults()
            .map_err(|e| ProviderError::ConnectionError(e.to_string()))?;

        Ok(Self { client })
    }

    /// Create with a specific Docker connection
    pub fn with_client(client: Docker) -> Self {
        Self { client }
    }

    /// Convert our config to bollard config
    fn to_bollard_config(config: &ContainerConfig) -> Result<Config<String>> {
        let memory_bytes = config
            .memory_mb
            .checked_mul(1024 * 1024)
            .and_then(|bytes| i64::try_from(bytes).ok())
            .ok_or_else(|| {
                ProviderError::ContainerError(format!(
                    "Memory limit of {} MB is out of range",
                    config.memory_mb
                ))
            })?;

        let mut exposed_ports = HashMap::new();
        let mut port_bindings = HashMap::new();

        for port in &config.ports {
            let container_port = format!("{}/{}", port.container_port, port.protocol);
            exposed_ports.insert(container_port.clone(), HashMap::new());

            let binding = vec![PortBinding {
                host_ip: None,
                host_port: Some(port.host_port.to_string()),
            }];
            port_bindings.insert(container_port, Some(binding));
        }

        let binds: Vec<String> = config.volumes.iter().map(|v| v.to_bind()).collect();

        let env: Vec<String> = config
            .env_vars
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let host_config = HostConfig {
            binds: Some(binds),
            port_bindings: if port_bindings.is_empty() {
                None
            } else {
                Some(port_bindings)
            },
            memory: Some(memory_bytes),
            cpu_shares: Some(config.cpu_shares),
            pids_limit: Some(config.pids_limit),
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::ON_FAILURE),
                maximum_retry_count: Some(config.restart_max_retries),
            }),
            ..Default::default()
        };

        Ok(Config {
            image: Some(config.image.clone()),
            env: Some(env),
            labels: Some(config.labels.clone()),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        })
    }

    /// Flatten a bollard port map ("4096/tcp" -> bindings) into container -> host ports
    fn collect_ports(port_map: &PortMap, ports: &mut HashMap<u16, u16>) {
        for (container_port_str, bindings) in port_map {
            let Some(host_port_str) = bindings
                .as_ref()
                .and_then(|b| b.first())
                .and_then(|b| b.host_port.as_ref())
            else {
                continue;
            };

            let Some(port_num) = container_port_str.split('/').next() else {
                continue;
            };

            if let (Ok(container_port), Ok(host_port)) =
                (port_num.parse::<u16>(), host_port_str.parse::<u16>())
            {
                ports.insert(container_port, host_port);
            }
        }
    }

    fn from_inspect(requested: &str, inspect: ContainerInspectResponse) -> Result<ContainerInfo> {
        let state = inspect.state.as_ref().ok_or_else(|| {
            ProviderError::ContainerError(format!(
                "Container {} has no state information",
                requested
            ))
        })?;

        let status = ContainerStatus::from_docker_state(
            state
                .status
                .as_ref()
                .map(|s| s.as_ref())
                .unwrap_or("unknown"),
        );

        // Live mappings first; the configured bindings cover stopped containers
        let mut ports = HashMap::new();
        if let Some(port_map) = inspect
            .network_settings
            .as_ref()
            .and_then(|ns| ns.ports.as_ref())
        {
            Self::collect_ports(port_map, &mut ports);
        }
        if ports.is_empty() {
            if let Some(port_map) = inspect
                .host_config
                .as_ref()
                .and_then(|hc| hc.port_bindings.as_ref())
            {
                Self::collect_ports(port_map, &mut ports);
            }
        }

        let created_at = inspect
            .created
            .as_ref()
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&chrono::Utc))
            .unwrap_or_else(chrono::Utc::now);

        Ok(ContainerInfo {
            id: inspect.id.unwrap_or_else(|| requested.to_string()),
            name: inspect
                .name
                .unwrap_or_else(|| requested.to_string())
                .trim_start_matches('/')
                .to_string(),
            status,
            ports,
            labels: inspect.config.and_then(|c| c.labels).unwrap_or_default(),
            created_at,
        })
    }

    fn from_summary(summary: ContainerSummary) -> Option<ContainerInfo> {
        let id = summary.id?;

        let ports = summary
            .ports
            .unwrap_or_default()
            .into_iter()
            .filter_map(|p| p.public_port.map(|public| (p.private_port, public)))
            .collect();

        let name = summary
            .names
            .and_then(|names| names.into_iter().next())
            .map(|n| n.trim_start_matches('/').to_string())
            .unwrap_or_else(|| id.clone());

        let created_at = summary
            .created
            .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0))
            .unwrap_or_else(chrono::Utc::now);

        Some(ContainerInfo {
            id,
            name,
            status: ContainerStatus::from_docker_state(summary.state.as_deref().unwrap_or("unknown")),
            ports,
            labels: summary.labels.unwrap_or_default(),
            created_at,
        })
    }

    fn map_container_error(container: &str, err: BollardError) -> ProviderError {
        match err {
            BollardError::DockerResponseServerError {
                status_code: 404, ..
            } => ProviderError::NotFound(container.to_string()),
            e => ProviderError::ContainerError(e.to_string()),
        }
    }
}

#[async_trait]
impl Provider for DockerProvider {
    async fn ping(&self) -> Result<()> {
        self.client
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| ProviderError::ConnectionError(e.to_string()))
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        let options = ListImagesOptions::<String> {
            filters: HashMap::from([("reference".to_string(), vec![image.to_string()])]),
            ..Default::default()
        };

        let images = self
            .client
            .list_images(Some(options))
            .await
            .map_err(|e| ProviderError::ImageError(e.to_string()))?;

        Ok(!images.is_empty())
    }

    async fn create_container(&self, config: &ContainerConfig) -> Result<String> {
        info!("Creating container: {}", config.name);

        let options = CreateContainerOptions {
            name: config.name.clone(),
            platform: None,
        };

        let container = self
            .client
            .create_container(Some(options), Self::to_bollard_config(config)?)
            .await
            .map_err(|e| ProviderError::ContainerError(e.to_string()))?;

        debug!("Created container: {}", container.id);
        Ok(container.id)
    }

    async fn start_container(&self, container: &str) -> Result<()> {
        info!("Starting container: {}", container);

        self.client
            .start_container(container, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| Self::map_container_error(container, e))
    }

    async fn stop_container(&self, container: &str, timeout_secs: u64) -> Result<()> {
        info!("Stopping container: {} (timeout: {}s)", container, timeout_secs);

        let options = StopContainerOptions {
            t: i64::try_from(timeout_secs).unwrap_or(i64::MAX),
        };

        match self.client.stop_container(container, Some(options)).await {
            Ok(()) => Ok(()),
            // Already stopped
            Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => {
                debug!("Container {} already stopped", container);
                Ok(())
            }
            Err(e) => Err(Self::map_container_error(container, e)),
        }
    }

    async fn remove_container(&self, container: &str, force: bool) -> Result<()> {
        info!("Removing container: {} (force: {})", container, force);

        // Named volumes hold the agent's credentials and must survive removal
        let options = RemoveContainerOptions {
            force,
            v: false,
            ..Default::default()
        };

        self.client
            .remove_container(container, Some(options))
            .await
            .map_err(|e| Self::map_container_error(container, e))
    }

    async fn inspect_container(&self, container: &str) -> Result<ContainerInfo> {
        let inspect = self
            .client
            .inspect_container(container, None)
            .await
            .map_err(|e| Self::map_container_error(container, e))?;

        Self::from_inspect(container, inspect)
    }

    async fn list_containers(
        &self,
        labels: &HashMap<String, String>,
    ) -> Result<Vec<ContainerInfo>> {
        let label_filters: Vec<String> = labels
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let options = ListContainersOptions {
            all: true,
            filters: HashMap::from([("label".to_string(), label_filters)]),
            ..Default::default()
        };

        let containers = self
            .client
            .list_containers(Some(options))
            .await
            .map_err(|e| ProviderError::ContainerError(e.to_string()))?;

        Ok(containers
            .into_iter()
            .filter_map(Self::from_summary)
            .collect())
    }
}
