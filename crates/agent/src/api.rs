//! Health and metrics endpoints of the agent
//!
//! `/healthz` and `/readyz` answer 503 only when the controller cannot adjust
//! quotas at all. A degraded tick, where some containers failed, still counts
//! as healthy.

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use quotaturbo::{HealthRegistry, TurboMetrics};
use std::sync::Arc;
use tracing::{error, info};

#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    /// Held so the quota metrics are registered before the first scrape
    pub metrics: TurboMetrics,
}

impl AppState {
    pub fn new(health_registry: HealthRegistry, metrics: TurboMetrics) -> Self {
        Self {
            health_registry,
            metrics,
        }
    }
}

fn availability(up: bool) -> StatusCode {
    if up {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn healthz(State(state): State<Arc<AppState>>) -> Response {
    let health = state.health_registry.health().await;
    (availability(health.status.is_operational()), Json(health)).into_response()
}

async fn readyz(State(state): State<Arc<AppState>>) -> Response {
    let readiness = state.health_registry.readiness().await;
    (availability(readiness.ready), Json(readiness)).into_response()
}

/// Text exposition of the default Prometheus registry
async fn metrics() -> Response {
    let encoder = TextEncoder::new();
    let mut body = Vec::new();
    match encoder.encode(&prometheus::gather(), &mut body) {
        Ok(()) => (
            [(header::CONTENT_TYPE, encoder.format_type().to_string())],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode quota metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Serve the endpoints on every interface until the listener fails
pub async fn serve(port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "Agent API listening");

    axum::serve(listener, create_router(state)).await?;
    Ok(())
}
