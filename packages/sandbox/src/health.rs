// ABOUTME: Readiness probing for freshly started sandboxes
// ABOUTME: Polls the agent's health path with bounded attempts until it answers or gives up

use std::time::Duration;
use thiserror::Error;
use tokio::time;
use tracing::debug;

/// Path polled while a sandbox boots
pub const READINESS_PATH: &str = "/api/session";

#[derive(Error, Debug, PartialEq)]
pub enum ReadinessError {
    #[error("Sandbox at {url} did not become ready after {attempts} attempts")]
    NotReady { url: String, attempts: u32 },

    #[error("Failed to build HTTP client: {0}")]
    Client(String),
}

#[derive(Debug, Clone)]
pub struct ReadinessProber {
    max_attempts: u32,
    interval: Duration,
    attempt_timeout: Duration,
}

impl ReadinessProber {
    pub fn new(max_attempts: u32, interval: Duration, attempt_timeout: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            interval,
            attempt_timeout,
        }
    }

    /// Upper bound on how long `wait_until_ready` can take
    pub fn max_wait(&self) -> Duration {
        (self.attempt_timeout + self.interval) * self.max_attempts
    }

    /// Poll `{base_url}{READINESS_PATH}` until it returns a 2xx status
    pub async fn wait_until_ready(&self, base_url: &str) -> Result<(), ReadinessError> {
        let client = reqwest::Client::builder()
            .timeout(self.attempt_timeout)
            .build()
            .map_err(|e| ReadinessError::Client(e.to_string()))?;
        let url = format!("{}{}", base_url.trim_end_matches('/'), READINESS_PATH);

        for attempt in 1..=self.max_attempts {
            match client.get(&url).send().await {
                Ok(response) if response.status().is_success() => {
                    debug!("{} ready after {} attempt(s)", url, attempt);
                    return Ok(());
                }
                Ok(response) => {
                    debug!("{} not ready: HTTP {}", url, response.status());
                }
                Err(e) => {
                    debug!("{} not ready: {}", url, e);
                }
            }

            if attempt < self.max_attempts {
                time::sleep(self.interval).await;
            }
        }

        Err(ReadinessError::NotReady {
            url: base_url.to_string(),
            attempts: self.max_attempts,
        })
    }
}
