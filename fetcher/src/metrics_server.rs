//! `GET /metrics` (Prometheus text) and `GET /healthz` on `METRICS_PORT`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Shared readiness flag: `true` when mock mode is on (always healthy) or
/// the last upstream call succeeded.
#[derive(Clone, Default)]
pub struct Health {
    upstream_reachable: Arc<AtomicBool>,
    mock_mode: bool,
}

impl Health {
    #[must_use]
    pub fn new(mock_mode: bool) -> Self {
        Self {
            upstream_reachable: Arc::new(AtomicBool::new(true)),
            mock_mode,
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.upstream_reachable.store(reachable, Ordering::Relaxed);
    }

    fn is_healthy(&self) -> bool {
        self.mock_mode || self.upstream_reachable.load(Ordering::Relaxed)
    }
}

#[derive(Clone)]
struct AppState {
    health: Health,
    prometheus: PrometheusHandle,
}

pub async fn serve(
    port: u16,
    health: Health,
    prometheus: PrometheusHandle,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let state = AppState { health, prometheus };
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "metrics server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    state.prometheus.render()
}

async fn healthz_handler(State(state): State<AppState>) -> impl IntoResponse {
    if state.health.is_healthy() {
        (StatusCode::OK, Json(json!({ "status": "ok" })))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "status": "degraded" })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_mode_is_always_healthy() {
        let health = Health::new(true);
        health.set_reachable(false);
        assert!(health.is_healthy());
    }

    #[test]
    fn real_mode_reflects_reachability() {
        let health = Health::new(false);
        assert!(health.is_healthy());
        health.set_reachable(false);
        assert!(!health.is_healthy());
    }
}
