// ABOUTME: Per-user agent sandbox lifecycle for Orkee
// ABOUTME: One long-lived container per user, provisioned on demand and reclaimed when idle

pub mod client;
pub mod health;
pub mod manager;
pub mod monitor;
pub mod paths;
pub mod ports;
pub mod providers;
pub mod registry;
pub mod settings;

#[cfg(test)]
mod testing;

pub use client::AgentClient;
pub use health::{ReadinessError, ReadinessProber};
pub use manager::{container_name, ManagerError, SandboxManager};
pub use paths::PathTranslator;
pub use ports::{PortAllocator, PortError};
pub use providers::{DockerProvider, Provider as SandboxProvider, ProviderError};
pub use registry::{SandboxRegistry, SandboxStatus, UserSandbox};
pub use settings::{SandboxSettings, SettingsError};
