// src/main.rs
//! Agent Fleet Coordinator
//!
//! Starts the configured worker pools, serves the routing gateway and runs
//! the health/autoscaling loop until Ctrl-C, then tears the fleet down.

use agent_fleet::coordinator::Coordinator;
use agent_fleet::gateway::Gateway;
use agent_fleet::observability::{init_metrics, init_tracing};
use agent_fleet::utils::config::{config_path, CoordinatorConfig};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // the log format lives in the config, so tracing falls back to the
    // default format when loading fails
    let loaded = CoordinatorConfig::load();
    let log_format = loaded
        .as_ref()
        .map(|config| config.observability.log_format)
        .unwrap_or_default();
    init_tracing(log_format)?;

    info!("Starting Agent Fleet Coordinator v{}", env!("CARGO_PKG_VERSION"));
    let config = match loaded {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration from {}: {}", config_path(), e);
            return Err(e).context("Failed to load configuration");
        }
    };
    info!("Configuration loaded from {}: {:?}", config_path(), config);

    init_metrics(&config.observability)?;

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let coordinator = Arc::new(Coordinator::new(config)?);
    coordinator.start().await;

    let gateway = Gateway::bind(Arc::clone(&coordinator), &addr)
        .await
        .with_context(|| format!("Failed to bind gateway on {}", addr))?;

    // Graceful shutdown handler
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let wait_for = |mut rx: watch::Receiver<bool>| async move {
        let _ = rx.wait_for(|stopped| *stopped).await;
    };

    let gateway_task = tokio::spawn(gateway.serve(wait_for(shutdown_rx.clone())));
    let control_loop = {
        let coordinator = Arc::clone(&coordinator);
        let rx = shutdown_rx.clone();
        tokio::spawn(async move { coordinator.run(wait_for(rx)).await })
    };

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received shutdown signal, cleaning up..."),
        Err(e) => error!("Failed to listen for shutdown signal: {}", e),
    }
    let _ = shutdown_tx.send(true);

    if let Err(e) = gateway_task.await {
        error!("Gateway task failed: {}", e);
    }
    if let Err(e) = control_loop.await {
        error!("Control loop failed: {}", e);
    }

    let outcomes = coordinator.shutdown().await;
    info!("Stopped {} instances", outcomes.len());
    Ok(())
}
