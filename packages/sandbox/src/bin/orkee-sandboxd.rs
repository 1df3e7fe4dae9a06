// ABOUTME: Standalone daemon hosting the per-user sandbox manager
// ABOUTME: Adopts surviving sandboxes at startup and tears them all down on Ctrl-C

use anyhow::Context;
use orkee_agent_sandbox::{DockerProvider, SandboxManager, SandboxSettings};
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .init();

    let settings = SandboxSettings::from_env();
    info!(
        "Sandbox image {}, ports {}..{}, repos {}",
        settings.image,
        settings.port_range_start,
        settings.port_range_end,
        settings.host_repos_dir.display()
    );

    let provider = DockerProvider::new().context("Failed to create Docker client")?;
    let manager = Arc::new(
        SandboxManager::new(Arc::new(provider), settings)
            .context("Invalid sandbox settings")?,
    );

    // Keep running without sandboxes so a later Docker start is a restart away
    if let Err(e) = manager.init().await {
        error!("Sandbox manager failed to initialize: {}", e);
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    manager.shutdown_all().await;
    Ok(())
}
