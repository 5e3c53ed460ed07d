//! Scan control endpoints.
//!
//! One scan may run per radio. A scan started without a duration uses
//! `scan.default_duration_secs`; a duration of 0 scans until stopped.

use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use signalint_core::{RadioKind, ScanStatus};
use tracing::info;
use utoipa::ToSchema;

use crate::api::error::{ApiResult, ErrorResponse};
use crate::api::radio_kind;
use crate::state::AppState;

/// Creates the scan router, nested under `/api/{kind}`.
pub fn router() -> Router<AppState> {
    Router::new().route(
        "/scan",
        post(start_scan).delete(stop_scan).get(get_scan_status),
    )
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// Request body for starting a scan.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({ "duration_secs": 30 }))]
pub struct StartScanRequest {
    /// Stop after this many seconds. 0 scans until stopped; absent uses the default.
    #[schema(example = 30, minimum = 0)]
    pub duration_secs: Option<u64>,
}

/// Scan state of one radio.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ScanStatusResponse {
    /// Radio the status belongs to.
    pub kind: RadioKind,
    /// Current status.
    pub status: ScanStatus,
}

/// Result of stopping a scan.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({ "kind": "ble", "was_running": true, "recorded": 42, "error": null }))]
pub struct StopScanResponse {
    /// Radio that was stopped.
    pub kind: RadioKind,
    /// Whether a scan was running.
    pub was_running: bool,
    /// Observations recorded by the stopped scan.
    pub recorded: usize,
    /// Why the scan had failed, if it did.
    #[schema(nullable)]
    pub error: Option<String>,
}

// ============================================================================
// Handlers
// ============================================================================

/// Start scanning.
#[utoipa::path(
    post,
    path = "/api/{kind}/scan",
    tag = "scan",
    operation_id = "startScan",
    summary = "Start a scan",
    description = "Starts scanning the radio. Every sighting is appended to the \
        radio's observation log. Failures while scanning are reported on the \
        scan status.",
    params(("kind" = RadioKind, Path, description = "Radio kind: `ble` or `wifi`")),
    request_body(content = StartScanRequest, description = "Optional scan duration"),
    responses(
        (status = 202, description = "Scan started", body = ScanStatusResponse),
        (status = 409, description = "A scan is already running", body = ErrorResponse)
    )
)]
pub async fn start_scan(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    request: Option<Json<StartScanRequest>>,
) -> ApiResult<(StatusCode, Json<ScanStatusResponse>)> {
    let kind = radio_kind(&kind)?;
    let request = request.map(|Json(r)| r).unwrap_or_default();
    let max_duration = match request.duration_secs {
        Some(0) => None,
        Some(secs) => Some(Duration::from_secs(secs)),
        None => state.config().scan.default_duration(),
    };

    let radio = state.radio(kind);
    radio.start_scan(max_duration)?;
    info!(%kind, duration_secs = ?max_duration.map(|d| d.as_secs()), "Scan requested");

    Ok((
        StatusCode::ACCEPTED,
        Json(ScanStatusResponse {
            kind,
            status: radio.scan_status(),
        }),
    ))
}

/// Stop scanning.
#[utoipa::path(
    delete,
    path = "/api/{kind}/scan",
    tag = "scan",
    operation_id = "stopScan",
    summary = "Stop the scan",
    description = "Stops the running scan and waits for its last observations to be \
        stored. Stopping an idle radio is not an error.",
    params(("kind" = RadioKind, Path, description = "Radio kind: `ble` or `wifi`")),
    responses(
        (status = 200, description = "Scan stopped", body = StopScanResponse)
    )
)]
pub async fn stop_scan(
    State(state): State<AppState>,
    Path(kind): Path<String>,
) -> ApiResult<Json<StopScanResponse>> {
    let kind = radio_kind(&kind)?;
    let summary = state.radio(kind).stop_scan().await;

    Ok(Json(match summary {
        Some(summary) => StopScanResponse {
            kind,
            was_running: true,
            recorded: summary.recorded,
            error: summary.error,
        },
        None => StopScanResponse {
            kind,
            was_running: false,
            recorded: 0,
            error: None,
        },
    }))
}

/// Get the scan status.
#[utoipa::path(
    get,
    path = "/api/{kind}/scan",
    tag = "scan",
    operation_id = "getScanStatus",
    summary = "Get the scan status",
    description = "Returns whether the radio is scanning, idle, or why its last scan failed.",
    params(("kind" = RadioKind, Path, description = "Radio kind: `ble` or `wifi`")),
    responses(
        (status = 200, description = "Status retrieved", body = ScanStatusResponse)
    )
)]
pub async fn get_scan_status(
    State(state): State<AppState>,
    Path(kind): Path<String>,
) -> ApiResult<Json<ScanStatusResponse>> {
    let kind = radio_kind(&kind)?;
    Ok(Json(ScanStatusResponse {
        kind,
        status: state.radio(kind).scan_status(),
    }))
}
