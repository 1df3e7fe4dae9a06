// ABOUTME: In-memory registry of per-user agent sandboxes
// ABOUTME: Holds one UserSandbox record per user id; the lifecycle manager is its only writer

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl SandboxStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserSandbox {
    pub user_id: String,
    /// Runtime container id; empty until creation completes
    pub sandbox_id: String,
    pub host_port: u16,
    pub base_url: String,
    pub status: SandboxStatus,
    pub last_activity: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl UserSandbox {
    pub fn starting(user_id: &str, host_port: u16) -> Self {
        let now = Utc::now();
        Self {
            user_id: user_id.to_string(),
            sandbox_id: String::new(),
            host_port,
            base_url: base_url_for(host_port),
            status: SandboxStatus::Starting,
            last_activity: now,
            created_at: now,
            error: None,
        }
    }

    /// Record for a container that is already up under the runtime
    pub fn adopted(
        user_id: &str,
        sandbox_id: &str,
        host_port: u16,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id: user_id.to_string(),
            sandbox_id: sandbox_id.to_string(),
            host_port,
            base_url: base_url_for(host_port),
            status: SandboxStatus::Running,
            last_activity: Utc::now(),
            created_at,
            error: None,
        }
    }

    pub fn idle_for(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.last_activity)
    }
}

pub fn base_url_for(host_port: u16) -> String {
    format!("http://127.0.0.1:{}", host_port)
}

/// Keyed store of sandbox records.
///
/// Each call is atomic on its own, but nothing here makes a read followed by
/// a write atomic; the manager serialises per-user sequences itself.
#[derive(Default)]
pub struct SandboxRegistry {
    sandboxes: RwLock<HashMap<String, UserSandbox>>,
}

impl SandboxRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, user_id: &str) -> Option<UserSandbox> {
        self.sandboxes.read().await.get(user_id).cloned()
    }

    /// Insert or replace the record for `sandbox.user_id`, returning the old one
    pub async fn insert(&self, sandbox: UserSandbox) -> Option<UserSandbox> {
        self.sandboxes
            .write()
            .await
            .insert(sandbox.user_id.clone(), sandbox)
    }

    /// Mutate a record in place. Returns the updated copy, or None if absent.
    pub async fn update<F>(&self, user_id: &str, f: F) -> Option<UserSandbox>
    where
        F: FnOnce(&mut UserSandbox),
    {
        let mut sandboxes = self.sandboxes.write().await;
        let sandbox = sandboxes.get_mut(user_id)?;
        f(sandbox);
        Some(sandbox.clone())
    }

    pub async fn remove(&self, user_id: &str) -> Option<UserSandbox> {
        self.sandboxes.write().await.remove(user_id)
    }

    pub async fn list(&self) -> Vec<UserSandbox> {
        self.sandboxes.read().await.values().cloned().collect()
    }

    pub async fn list_by_status(&self, status: SandboxStatus) -> Vec<UserSandbox> {
        self.sandboxes
            .read()
            .await
            .values()
            .filter(|s| s.status == status)
            .cloned()
            .collect()
    }

    pub async fn user_ids(&self) -> Vec<String> {
        self.sandboxes.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.sandboxes.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sandboxes.read().await.is_empty()
    }
}
