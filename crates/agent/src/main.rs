//! Quota turbo agent - adaptive CPU quota controller
//!
//! This binary runs as a DaemonSet on each Kubernetes node,
//! raising and lowering the CFS quota of opted-in containers.

use anyhow::{Context, Result};
use quotaturbo::{
    health::components, Client, HealthRegistry, QuotaTurboService, StaticPodSource,
    StructuredLogger, TurboMetrics,
};
use quotaturbo_agent::{api, config};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting quotaturbo-agent");

    let config = config::AgentConfig::load()?;
    info!(
        node_name = %config.node_name,
        pods = config.pods.len(),
        "Agent configured"
    );

    let health_registry = HealthRegistry::new();
    health_registry.register(components::TURBO_LOOP).await;
    health_registry.register(components::CGROUP_FS).await;

    let metrics = TurboMetrics::new();
    let logger = StructuredLogger::new(&config.node_name);

    let client = Client::builder()
        .config(config.turbo.clone())
        .build()
        .context("failed to create quota turbo client")?;
    let pods = Arc::new(StaticPodSource::new(config.pods.clone()));
    let service = Arc::new(QuotaTurboService::new(
        Arc::new(client),
        pods,
        config.service_config(),
        health_registry.clone(),
        logger.clone(),
    )?);

    let starting = Arc::clone(&service);
    let reports = tokio::task::spawn_blocking(move || starting.pre_start())
        .await
        .context("pod recovery panicked")??;
    let unclean = reports.iter().filter(|r| !r.is_clean()).count();
    if unclean > 0 {
        warn!(pods = unclean, "Some pods kept a stale quota after recovery");
    }

    logger.log_startup(
        AGENT_VERSION,
        config.turbo.high_water_mark,
        config.turbo.alarm_water_mark,
    );

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let turbo_handle = tokio::spawn(Arc::clone(&service).run(shutdown_rx));

    let app_state = Arc::new(api::AppState::new(health_registry.clone(), metrics));
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    health_registry.set_ready(true).await;

    tokio::signal::ctrl_c().await?;
    logger.log_shutdown("SIGINT received");
    health_registry.set_ready(false).await;

    let _ = shutdown_tx.send(());
    if let Err(e) = turbo_handle.await {
        warn!(error = %e, "Quota turbo loop ended abnormally");
    }
    api_handle.abort();

    let stopping = Arc::clone(&service);
    tokio::task::spawn_blocking(move || stopping.terminate())
        .await
        .context("pod recovery panicked")?;

    info!("Shutdown complete");
    Ok(())
}
