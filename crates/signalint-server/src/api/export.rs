//! CSV export endpoints.

use axum::extract::{Path, State};
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use signalint_core::{ExportStatus, RadioKind};
use utoipa::ToSchema;

use crate::api::error::{ApiResult, ErrorResponse};
use crate::api::radio_kind;
use crate::state::AppState;

/// Creates the export router, nested under `/api/{kind}`.
pub fn router() -> Router<AppState> {
    Router::new().route("/export", post(run_export).get(get_export_status))
}

/// Result of an export.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({ "kind": "ble", "records": 120 }))]
pub struct ExportResponse {
    /// Radio that was exported.
    pub kind: RadioKind,
    /// Rows written.
    #[schema(example = 120, minimum = 0)]
    pub records: usize,
}

/// Export status of one radio.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ExportStatusResponse {
    /// Radio the status belongs to.
    pub kind: RadioKind,
    /// Current status. Returns to idle a short while after each export.
    pub status: ExportStatus,
}

/// Export the observation log.
#[utoipa::path(
    post,
    path = "/api/{kind}/export",
    tag = "export",
    operation_id = "exportLog",
    summary = "Export the observation log as CSV",
    description = "Renders every stored observation of the radio as CSV and writes it to \
        the export directory as `BLE_LOG_<millis>.csv` or `SIGINT_LOG_<millis>.csv`.",
    params(("kind" = RadioKind, Path, description = "Radio kind: `ble` or `wifi`")),
    responses(
        (status = 200, description = "Export written", body = ExportResponse),
        (status = 500, description = "Log unreadable or file not written", body = ErrorResponse)
    )
)]
pub async fn run_export(
    State(state): State<AppState>,
    Path(kind): Path<String>,
) -> ApiResult<Json<ExportResponse>> {
    let kind = radio_kind(&kind)?;
    let records = state.radio(kind).export().await?;
    Ok(Json(ExportResponse { kind, records }))
}

/// Get the export status.
#[utoipa::path(
    get,
    path = "/api/{kind}/export",
    tag = "export",
    operation_id = "getExportStatus",
    summary = "Get the export status",
    description = "Returns the status of the radio's most recent export.",
    params(("kind" = RadioKind, Path, description = "Radio kind: `ble` or `wifi`")),
    responses(
        (status = 200, description = "Status retrieved", body = ExportStatusResponse)
    )
)]
pub async fn get_export_status(
    State(state): State<AppState>,
    Path(kind): Path<String>,
) -> ApiResult<Json<ExportStatusResponse>> {
    let kind = radio_kind(&kind)?;
    Ok(Json(ExportStatusResponse {
        kind,
        status: state.radio(kind).export_status(),
    }))
}
