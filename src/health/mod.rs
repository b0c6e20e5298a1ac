//! Health check endpoints
//!
//! `/health` answers whenever the process runs, `/ready` reflects the
//! worker fleet, `/metrics` serves Prometheus text.

use crate::metrics::OrchestratorMetrics;
use crate::orchestrator::OrchestratorHandle;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use std::sync::Arc;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// Readiness check response
#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    pub ready: bool,
    pub workers_total: usize,
    pub workers_ready: usize,
    pub workers_failed: usize,
    pub total_shards: u32,
    pub shutting_down: bool,
}

/// Application state for health endpoints
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: OrchestratorHandle,
    pub metrics: Arc<OrchestratorMetrics>,
}

/// Create the health check router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Health endpoint - always returns 200 if process is running
async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Readiness endpoint - 200 only when every worker is Ready
async fn ready_handler(State(state): State<AppState>) -> impl IntoResponse {
    let table = state.orchestrator.table();
    let response = ReadyResponse {
        ready: table.is_healthy() && !state.orchestrator.is_shutting_down(),
        workers_total: table.worker_count(),
        workers_ready: table.ready_workers(),
        workers_failed: table.failed_workers(),
        total_shards: table.total_shards(),
        shutting_down: state.orchestrator.is_shutting_down(),
    };

    if response.ready {
        (StatusCode::OK, Json(response))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response))
    }
}

/// Metrics endpoint - returns Prometheus format metrics
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        state.metrics.render(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_response_serialization() {
        let response = ReadyResponse {
            ready: true,
            workers_total: 3,
            workers_ready: 3,
            workers_failed: 0,
            total_shards: 9,
            shutting_down: false,
        };

        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"ready\":true"));
        assert!(json.contains("\"workers_ready\":3"));
    }

    #[test]
    fn health_response_serialization() {
        let response = HealthResponse {
            status: "healthy",
            version: "0.3.0",
        };

        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("healthy"));
    }
}
