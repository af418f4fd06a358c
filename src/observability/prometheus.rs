//! Prometheus HTTP endpoint for metrics scraping.
//!
//! Provides:
//! - `/metrics` - Prometheus metrics endpoint
//! - `/health` - Registry status as JSON
//! - `/ready` - Readiness check

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use prometheus::{Encoder, Registry, TextEncoder};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;

use crate::service::NotificationRouter;

/// Prometheus server state.
#[derive(Clone)]
pub struct PrometheusState {
    registry: Arc<Registry>,
    router: Arc<NotificationRouter>,
}

impl PrometheusState {
    /// Create a new Prometheus state with the given registry.
    pub fn new(registry: Registry, router: Arc<NotificationRouter>) -> Self {
        Self {
            registry: Arc::new(registry),
            router,
        }
    }
}

/// Health response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub disabled: bool,
    pub active_subscriptions: usize,
}

/// Create the Prometheus HTTP router.
pub fn create_router(state: PrometheusState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .with_state(state)
}

/// Handle GET /metrics - Prometheus metrics endpoint.
async fn metrics_handler(State(state): State<PrometheusState>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = state.registry.gather();

    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain; charset=utf-8")],
                format!("Failed to encode metrics: {e}").into_bytes(),
            )
        }
    }
}

/// Handle GET /health - registry status.
async fn health_handler(State(state): State<PrometheusState>) -> Json<HealthResponse> {
    let disabled = state.router.is_disabled();
    Json(HealthResponse {
        status: if disabled { "disabled" } else { "ok" },
        version: env!("CARGO_PKG_VERSION"),
        disabled,
        active_subscriptions: state.router.registry().active_count(),
    })
}

/// Handle GET /ready - Readiness check.
async fn ready_handler() -> impl IntoResponse {
    (StatusCode::OK, "READY")
}

/// Run the Prometheus HTTP server.
///
/// # Arguments
///
/// * `addr` - Address to bind to
/// * `state` - Metrics registry and router to report on
/// * `shutdown_rx` - Receiver for shutdown signal
pub async fn run_prometheus_server(
    addr: SocketAddr,
    state: PrometheusState,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(address = %addr, "Starting Prometheus metrics server");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
            tracing::info!("Prometheus server shutting down");
        })
        .await?;

    Ok(())
}
