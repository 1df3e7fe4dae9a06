// ABOUTME: Background idle sweeper for per-user sandboxes
// ABOUTME: Periodically tears down sandboxes whose last activity is older than the idle timeout

use crate::manager::SandboxManager;
use std::sync::Weak;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info};

/// Spawn the sweep loop. The task holds only a weak handle, so it ends on its
/// own once the manager is dropped; `SandboxManager::shutdown_all` aborts it
/// explicitly.
pub fn spawn_idle_sweeper(manager: Weak<SandboxManager>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Idle sweeper started (interval: {}s)", period.as_secs());

        let mut ticker = time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // First tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let Some(manager) = manager.upgrade() else {
                info!("Idle sweeper stopped: manager dropped");
                break;
            };

            let destroyed = manager.idle_sweep().await;
            if destroyed.is_empty() {
                debug!("Idle sweep found nothing to reclaim");
            } else {
                info!(
                    "Idle sweep reclaimed {} sandbox(es): {}",
                    destroyed.len(),
                    destroyed.join(", ")
                );
            }
        }
    })
}
