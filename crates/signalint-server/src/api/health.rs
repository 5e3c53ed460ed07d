//! Health check API endpoint.
//!
//! Provides a simple health check endpoint for monitoring and load balancers.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use signalint_core::{RadioKind, RosterHealth, ScanStatus};
use utoipa::ToSchema;

use crate::state::AppState;

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "status": "ok",
    "version": "0.1.0",
    "scanning": ["ble"],
    "stale_rosters": []
}))]
pub struct HealthResponse {
    /// Service status. `degraded` while a roster cannot read its stores.
    #[schema(example = "ok")]
    pub status: String,

    /// Service version from Cargo.toml.
    #[schema(example = "0.1.0")]
    pub version: String,

    /// Radios with an active scan.
    pub scanning: Vec<RadioKind>,

    /// Radios whose roster is frozen at its last good value.
    pub stale_rosters: Vec<RadioKind>,
}

/// Creates the health router.
pub fn router() -> Router<AppState> {
    Router::new().route("/", get(health_check))
}

/// Health check endpoint.
///
/// Returns the service version and which radios are scanning or stale.
#[utoipa::path(
    get,
    path = "/health",
    tag = "system",
    operation_id = "healthCheck",
    summary = "Check service health",
    description = "Returns basic service status information. Use this endpoint \
        for load balancer health checks and monitoring.",
    responses(
        (status = 200, description = "Service is running", body = HealthResponse)
    )
)]
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let scanning: Vec<RadioKind> = RadioKind::ALL
        .into_iter()
        .filter(|kind| state.radio(*kind).scan_status() == ScanStatus::Scanning)
        .collect();
    let stale_rosters: Vec<RadioKind> = RadioKind::ALL
        .into_iter()
        .filter(|kind| matches!(state.radio(*kind).roster_health(), RosterHealth::Stale { .. }))
        .collect();

    let status = if stale_rosters.is_empty() { "ok" } else { "degraded" };

    Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        scanning,
        stale_rosters,
    })
}
