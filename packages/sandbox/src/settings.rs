// ABOUTME: Environment-driven settings for per-user agent sandboxes
// ABOUTME: Image, idle timeout, repo roots, port range and per-container resource caps

use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

pub const ORKEE_SANDBOX_IMAGE: &str = "ORKEE_SANDBOX_IMAGE";
pub const ORKEE_SANDBOX_IDLE_TIMEOUT_MINUTES: &str = "ORKEE_SANDBOX_IDLE_TIMEOUT_MINUTES";
pub const ORKEE_SANDBOX_SWEEP_INTERVAL_SECS: &str = "ORKEE_SANDBOX_SWEEP_INTERVAL_SECS";
pub const ORKEE_REPOS_DIR: &str = "ORKEE_REPOS_DIR";
pub const ORKEE_SANDBOX_REPOS_DIR: &str = "ORKEE_SANDBOX_REPOS_DIR";
pub const ORKEE_SANDBOX_PORT_RANGE_START: &str = "ORKEE_SANDBOX_PORT_RANGE_START";
pub const ORKEE_SANDBOX_PORT_RANGE_END: &str = "ORKEE_SANDBOX_PORT_RANGE_END";
pub const ORKEE_SANDBOX_AGENT_PORT: &str = "ORKEE_SANDBOX_AGENT_PORT";
pub const ORKEE_SANDBOX_MEMORY_MB: &str = "ORKEE_SANDBOX_MEMORY_MB";
pub const ORKEE_SANDBOX_CPU_SHARES: &str = "ORKEE_SANDBOX_CPU_SHARES";
pub const ORKEE_SANDBOX_PIDS_LIMIT: &str = "ORKEE_SANDBOX_PIDS_LIMIT";
pub const ORKEE_SANDBOX_READY_RETRIES: &str = "ORKEE_SANDBOX_READY_RETRIES";
pub const ORKEE_SANDBOX_READY_INTERVAL_MS: &str = "ORKEE_SANDBOX_READY_INTERVAL_MS";
pub const ORKEE_SANDBOX_PROBE_TIMEOUT_SECS: &str = "ORKEE_SANDBOX_PROBE_TIMEOUT_SECS";
pub const ORKEE_SANDBOX_STOP_TIMEOUT_SECS: &str = "ORKEE_SANDBOX_STOP_TIMEOUT_SECS";

/// 1 TiB
pub const MAX_MEMORY_MB: u64 = 1024 * 1024;
/// One year
pub const MAX_IDLE_TIMEOUT_MINUTES: u64 = 365 * 24 * 60;

#[derive(Error, Debug, PartialEq)]
pub enum SettingsError {
    #[error("Invalid sandbox settings: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SandboxSettings {
    pub image: String,
    pub idle_timeout_minutes: u64,
    pub sweep_interval_secs: u64,

    // Repository mount
    pub host_repos_dir: PathBuf,
    pub sandbox_repos_dir: PathBuf,

    // Networking
    pub port_range_start: u16,
    /// Exclusive
    pub port_range_end: u16,
    pub agent_port: u16,
    /// Skip range ports some other process already listens on
    pub probe_host_ports: bool,

    // Resource caps
    pub memory_mb: u64,
    pub cpu_shares: i64,
    pub pids_limit: i64,
    pub restart_max_retries: i64,

    // Readiness and teardown
    pub ready_retries: u32,
    pub ready_interval_ms: u64,
    pub probe_timeout_secs: u64,
    pub stop_timeout_secs: u64,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            image: "opencode-worker:latest".to_string(),
            idle_timeout_minutes: 120,
            sweep_interval_secs: 300,
            host_repos_dir: PathBuf::from("/tmp/orkee-repos"),
            sandbox_repos_dir: PathBuf::from("/home/opencode/repos"),
            port_range_start: 30000,
            port_range_end: 31000,
            agent_port: 4096,
            probe_host_ports: true,
            memory_mb: 512,
            cpu_shares: 512,
            pids_limit: 256,
            restart_max_retries: 3,
            ready_retries: 30,
            ready_interval_ms: 1000,
            probe_timeout_secs: 10,
            stop_timeout_secs: 10,
        }
    }
}

impl SandboxSettings {
    /// Read settings from the environment, falling back to defaults for
    /// anything unset, unparseable or out of bounds.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let image = std::env::var(ORKEE_SANDBOX_IMAGE)
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or(defaults.image);

        Self {
            image,
            idle_timeout_minutes: env_or(
                ORKEE_SANDBOX_IDLE_TIMEOUT_MINUTES,
                defaults.idle_timeout_minutes,
                |v| (1..=MAX_IDLE_TIMEOUT_MINUTES).contains(&v),
            ),
            sweep_interval_secs: env_or(
                ORKEE_SANDBOX_SWEEP_INTERVAL_SECS,
                defaults.sweep_interval_secs,
                |v| v >= 1,
            ),
            host_repos_dir: std::env::var(ORKEE_REPOS_DIR)
                .map(PathBuf::from)
                .unwrap_or(defaults.host_repos_dir),
            sandbox_repos_dir: std::env::var(ORKEE_SANDBOX_REPOS_DIR)
                .map(PathBuf::from)
                .unwrap_or(defaults.sandbox_repos_dir),
            port_range_start: env_or(
                ORKEE_SANDBOX_PORT_RANGE_START,
                defaults.port_range_start,
                |v| v > 0,
            ),
            port_range_end: env_or(
                ORKEE_SANDBOX_PORT_RANGE_END,
                defaults.port_range_end,
                |v| v > 0,
            ),
            agent_port: env_or(ORKEE_SANDBOX_AGENT_PORT, defaults.agent_port, |v| v > 0),
            probe_host_ports: defaults.probe_host_ports,
            memory_mb: env_or(ORKEE_SANDBOX_MEMORY_MB, defaults.memory_mb, |v| {
                (64..=MAX_MEMORY_MB).contains(&v)
            }),
            cpu_shares: env_or(ORKEE_SANDBOX_CPU_SHARES, defaults.cpu_shares, |v| v >= 2),
            pids_limit: env_or(ORKEE_SANDBOX_PIDS_LIMIT, defaults.pids_limit, |v| v >= 1),
            restart_max_retries: defaults.restart_max_retries,
            ready_retries: env_or(ORKEE_SANDBOX_READY_RETRIES, defaults.ready_retries, |v| {
                v >= 1
            }),
            ready_interval_ms: env_or(
                ORKEE_SANDBOX_READY_INTERVAL_MS,
                defaults.ready_interval_ms,
                |_| true,
            ),
            probe_timeout_secs: env_or(
                ORKEE_SANDBOX_PROBE_TIMEOUT_SECS,
                defaults.probe_timeout_secs,
                |v| v >= 1,
            ),
            stop_timeout_secs: env_or(
                ORKEE_SANDBOX_STOP_TIMEOUT_SECS,
                defaults.stop_timeout_secs,
                |_| true,
            ),
        }
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.image.trim().is_empty() {
            return Err(SettingsError::Invalid("image must not be empty".to_string()));
        }
        if self.port_range_start >= self.port_range_end {
            return Err(SettingsError::Invalid(format!(
                "port range {}..{} is empty",
                self.port_range_start, self.port_range_end
            )));
        }
        if !(1..=MAX_IDLE_TIMEOUT_MINUTES).contains(&self.idle_timeout_minutes) {
            return Err(SettingsError::Invalid(format!(
                "idle timeout of {} minutes is outside 1..={}",
                self.idle_timeout_minutes, MAX_IDLE_TIMEOUT_MINUTES
            )));
        }
        if self.memory_mb > MAX_MEMORY_MB {
            return Err(SettingsError::Invalid(format!(
                "memory limit of {} MB exceeds {} MB",
                self.memory_mb, MAX_MEMORY_MB
            )));
        }
        if self.agent_port == 0 {
            return Err(SettingsError::Invalid(
                "agent port must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn port_range(&self) -> Range<u16> {
        self.port_range_start..self.port_range_end
    }

    pub fn idle_timeout(&self) -> chrono::Duration {
        let minutes = self.idle_timeout_minutes.min(MAX_IDLE_TIMEOUT_MINUTES);
        chrono::Duration::minutes(i64::try_from(minutes).unwrap_or(i64::MAX))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn ready_interval(&self) -> Duration {
        Duration::from_millis(self.ready_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

/// Parse `var_name`, warning and using `default` when it is set but unusable
fn env_or<T, F>(var_name: &str, default: T, valid: F) -> T
where
    T: FromStr + Copy + std::fmt::Display,
    F: Fn(T) -> bool,
{
    let Ok(raw) = std::env::var(var_name) else {
        return default;
    };

    match raw.trim().parse::<T>() {
        Ok(value) if valid(value) => value,
        Ok(_) => {
            warn!(
                "Environment variable {} has invalid value '{}', using default: {}",
                var_name, raw, default
            );
            default
        }
        Err(_) => {
            warn!(
                "Environment variable {} has unparseable value '{}', using default: {}",
                var_name, raw, default
            );
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for var in [
            ORKEE_SANDBOX_IMAGE,
            ORKEE_SANDBOX_IDLE_TIMEOUT_MINUTES,
            ORKEE_SANDBOX_PORT_RANGE_START,
            ORKEE_SANDBOX_PORT_RANGE_END,
            ORKEE_SANDBOX_MEMORY_MB,
            ORKEE_REPOS_DIR,
        ] {
            std::env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_defaults_when_unset() {
        clear_env();
        let settings = SandboxSettings::from_env();
        assert_eq!(settings, SandboxSettings::default());
        assert!(settings.validate().is_ok());
        assert_eq!(settings.port_range(), 30000..31000);
        assert_eq!(settings.idle_timeout(), chrono::Duration::hours(2));
    }

    #[test]
    #[serial]
    fn test_reads_overrides() {
        clear_env();
        std::env::set_var(ORKEE_SANDBOX_IMAGE, "registry.local/agent:2");
        std::env::set_var(ORKEE_SANDBOX_IDLE_TIMEOUT_MINUTES, "30");
        std::env::set_var(ORKEE_SANDBOX_PORT_RANGE_START, "40000");
        std::env::set_var(ORKEE_SANDBOX_PORT_RANGE_END, "40010");
        std::env::set_var(ORKEE_REPOS_DIR, "/srv/repos");

        let settings = SandboxSettings::from_env();
        assert_eq!(settings.image, "registry.local/agent:2");
        assert_eq!(settings.idle_timeout_minutes, 30);
        assert_eq!(settings.port_range(), 40000..40010);
        assert_eq!(settings.host_repos_dir, PathBuf::from("/srv/repos"));
        clear_env();
    }

    #[test]
    #[serial]
    fn test_invalid_values_fall_back() {
        clear_env();
        std::env::set_var(ORKEE_SANDBOX_MEMORY_MB, "16");
        std::env::set_var(ORKEE_SANDBOX_IDLE_TIMEOUT_MINUTES, "soon");
        std::env::set_var(ORKEE_SANDBOX_IMAGE, "   ");

        let settings = SandboxSettings::from_env();
        assert_eq!(settings.memory_mb, 512);
        assert_eq!(settings.idle_timeout_minutes, 120);
        assert_eq!(settings.image, "opencode-worker:latest");
        clear_env();
    }

    #[test]
    #[serial]
    fn test_oversized_values_fall_back() {
        clear_env();
        std::env::set_var(ORKEE_SANDBOX_MEMORY_MB, "17592186044416");
        std::env::set_var(ORKEE_SANDBOX_IDLE_TIMEOUT_MINUTES, "9223372036854775807");

        let settings = SandboxSettings::from_env();
        assert_eq!(settings.memory_mb, 512);
        assert_eq!(settings.idle_timeout_minutes, 120);
        assert!(settings.validate().is_ok());
        clear_env();
    }

    #[test]
    fn test_validate_rejects_oversized_limits() {
        let memory = SandboxSettings {
            memory_mb: MAX_MEMORY_MB + 1,
            ..Default::default()
        };
        assert!(matches!(
            memory.validate(),
            Err(SettingsError::Invalid(msg)) if msg.contains("memory limit")
        ));

        let idle = SandboxSettings {
            idle_timeout_minutes: u64::MAX,
            ..Default::default()
        };
        assert!(matches!(
            idle.validate(),
            Err(SettingsError::Invalid(msg)) if msg.contains("idle timeout")
        ));
        // Still computable without panicking
        assert_eq!(
            idle.idle_timeout(),
            chrono::Duration::minutes(MAX_IDLE_TIMEOUT_MINUTES as i64)
        );
    }

    #[test]
    fn test_validate_rejects_empty_port_range() {
        let settings = SandboxSettings {
            port_range_start: 31000,
            port_range_end: 31000,
            ..Default::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(SettingsError::Invalid(msg)) if msg.contains("31000..31000")
        ));
    }
}
