//! LRA Coordinator Binary
//!
//! Runs a coordinator node with a PostgreSQL store when `DATABASE_URL` is set
//! and an in-memory store otherwise.

use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lra_coordinator::{Coordinator, CoordinatorConfig, MemoryStore, PgStore, SharedStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = CoordinatorConfig::from_env();

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting LRA Coordinator");

    if let Err(e) = config.validate() {
        error!(error = %e, "Invalid configuration");
        return Err(anyhow::anyhow!("Configuration error: {}", e));
    }

    let store: SharedStore = match &config.database_url {
        Some(url) => {
            let store = PgStore::connect(url).await?;
            store.migrate().await?;
            info!("Using PostgreSQL store");
            Arc::new(store)
        }
        None => {
            info!("Using in-memory store, LRAs will not survive a restart");
            Arc::new(MemoryStore::new())
        }
    };

    let coordinator = Arc::new(Coordinator::builder(config.clone()).store(store).build()?);

    // Set up graceful shutdown
    let coordinator_clone = coordinator.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            return;
        }
        info!("Shutdown signal received");
        if let Err(e) = coordinator_clone.stop().await {
            error!(error = %e, "Error during shutdown");
        }
    });

    coordinator.start().await?;

    info!(
        node_id = %coordinator.node_id(),
        base_url = %config.base_url,
        "Coordinator running"
    );

    // Keep running until shutdown
    while !coordinator.state().is_terminal() {
        tokio::time::sleep(tokio::time::Duration::from_secs(1)).await;
    }

    if config.metrics_enabled {
        info!(metrics = %coordinator.metrics_handle().to_prometheus(), "Final metrics");
    }
    info!("Coordinator shutdown complete");
    Ok(())
}
