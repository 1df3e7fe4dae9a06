// ABOUTME: Minimal HTTP client for the coding agent running inside a sandbox
// ABOUTME: Used for liveness checks and handed to callers that talk to the agent

use serde_json::Value;
use std::time::Duration;

/// Session listing endpoint of the agent server
pub const SESSION_LIST_PATH: &str = "/session";

const CONNECT_TIMEOUT_SECS: u64 = 2;

#[derive(Debug, Clone)]
pub struct AgentClient {
    http: reqwest::Client,
    base_url: String,
    directory: Option<String>,
}

impl AgentClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS).min(timeout))
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            directory: None,
        })
    }

    /// Scope requests to a directory as seen from inside the sandbox
    pub fn with_directory(mut self, directory: impl Into<String>) -> Self {
        self.directory = Some(directory.into());
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn directory(&self) -> Option<&str> {
        self.directory.as_deref()
    }

    /// List the agent's sessions. Any transport error or non-2xx status fails.
    pub async fn list_sessions(&self) -> Result<Vec<Value>, reqwest::Error> {
        let mut request = self
            .http
            .get(format!("{}{}", self.base_url, SESSION_LIST_PATH));
        if let Some(directory) = &self.directory {
            request = request.query(&[("directory", directory)]);
        }

        request.send().await?.error_for_status()?.json().await
    }
}
