//! Health check handlers
//!
//! Provides health and readiness endpoints for monitoring and orchestration.

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use utoipa::ToSchema;

use crate::state::AppState;

/// Health check response
#[derive(Serialize, ToSchema)]
pub struct HealthResponse {
    /// Service status: "healthy" or "degraded"
    #[schema(example = "healthy")]
    pub status: String,
    /// Server version from Cargo.toml
    #[schema(example = "0.1.0")]
    pub version: String,
    #[schema(example = "faceid-server")]
    pub service: String,
    /// Face analyzer bound at startup
    #[schema(example = "onnx:buffalo_l@cuda")]
    pub analyzer: String,
    /// Whether the identity store is currently connected
    pub store_connected: bool,
}

/// GET /health - Liveness endpoint
///
/// Always 200 while the process serves requests; `status` is "degraded" when
/// the identity store is disconnected.
#[utoipa::path(
    get,
    path = "/health",
    tag = "Health",
    responses((status = 200, description = "Service is alive", body = HealthResponse))
)]
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let store_connected = state.pipeline.store().is_connected();

    let status = if store_connected {
        "healthy"
    } else {
        "degraded"
    };

    Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        service: "faceid-server".to_string(),
        analyzer: state.pipeline.analyzer_name(),
        store_connected,
    })
}

/// Readiness response for Kubernetes
#[derive(Serialize, ToSchema)]
pub struct ReadyResponse {
    /// Whether the service is ready to accept traffic
    pub ready: bool,
    pub store_connected: bool,
}

/// GET /ready - Kubernetes readiness probe
///
/// Checks the identity store, reconnecting if needed. Returns 503 until the
/// store is reachable and the identity collection exists.
#[utoipa::path(
    get,
    path = "/ready",
    tag = "Health",
    responses(
        (status = 200, description = "Ready to serve", body = ReadyResponse),
        (status = 503, description = "Identity store not reachable", body = ReadyResponse)
    )
)]
pub async fn ready(State(state): State<AppState>) -> (StatusCode, Json<ReadyResponse>) {
    let readiness = state.pipeline.readiness().await;

    let status = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadyResponse {
            ready: readiness.ready,
            store_connected: readiness.store_connected,
        }),
    )
}
