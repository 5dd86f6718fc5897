// src/observability.rs
//! Logging and metrics setup for the coordinator binary

use crate::utils::config::{LogFormat, ObservabilityConfig};
use crate::utils::errors::{FleetError, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Install the global tracing subscriber; `RUST_LOG` overrides the `info` default
pub fn init_tracing(format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    let installed = match format {
        LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
        LogFormat::Pretty => registry.with(fmt::layer().with_target(false)).try_init(),
    };
    installed.map_err(|e| FleetError::Config(format!("tracing already initialized: {}", e)))
}

/// Start the Prometheus exporter when an address is configured
pub fn init_metrics(config: &ObservabilityConfig) -> Result<()> {
    let Some(addr) = &config.metrics_addr else {
        return Ok(());
    };

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| FleetError::Config(format!("invalid metrics_addr '{}': {}", addr, e)))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| FleetError::Config(format!("failed to start metrics exporter: {}", e)))?;

    info!("Prometheus metrics on http://{}/metrics", addr);
    Ok(())
}
