//! Roster and observation log endpoints.
//!
//! The roster is the deduplicated, alias-resolved view of one radio's log.
//! Without `q` the live roster is returned, filtered by the search text last
//! set through `PUT /roster/query`. With `q` a roster is derived for that
//! text on the spot.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, put};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use signalint_core::{PathLossModel, RadioKind, RosterEntry, RosterHealth, ScanObservation};
use utoipa::{IntoParams, ToSchema};

use crate::api::error::{ApiResult, ErrorResponse};
use crate::api::radio_kind;
use crate::state::AppState;

/// Creates the roster router, nested under `/api/{kind}`.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/roster", get(get_roster))
        .route("/roster/query", put(set_roster_query))
        .route("/observations", get(get_observations))
        .route("/logs", delete(clear_logs))
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// Query parameters for the roster endpoint.
#[derive(Debug, Clone, Deserialize, IntoParams)]
pub struct RosterQuery {
    /// Case-insensitive search over display name and identifier.
    #[param(example = "printer")]
    pub q: Option<String>,
}

/// Roster of one radio.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RosterResponse {
    /// Radio the roster covers.
    pub kind: RadioKind,

    /// Search text the entries were filtered by.
    #[schema(example = "")]
    pub query: String,

    /// One entry per identifier, most recently seen first.
    pub entries: Vec<RosterEntry>,

    /// Whether the roster reflects the stores.
    pub health: RosterHealth,
}

/// Request body for setting the live search text.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({ "query": "printer" }))]
pub struct SetQueryRequest {
    /// New search text. Blank shows everything.
    pub query: String,
}

/// One stored observation.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ObservationResponse {
    /// Hardware address.
    #[schema(example = "AA:BB:CC:DD:EE:FF")]
    pub identifier: String,

    /// Broadcast name or SSID (may be empty).
    pub label: String,

    /// Signal strength.
    #[schema(example = -67)]
    pub rssi_dbm: i16,

    /// Time of the sighting.
    pub observed_at: DateTime<Utc>,

    /// Estimated distance in metres (BLE only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_distance_m: Option<f64>,

    /// Channel frequency (WiFi only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_mhz: Option<u32>,
}

impl ObservationResponse {
    fn new(observation: ScanObservation, model: &PathLossModel) -> Self {
        Self {
            estimated_distance_m: observation.estimated_distance(model),
            frequency_mhz: observation.frequency_mhz(),
            identifier: observation.identifier,
            label: observation.label,
            rssi_dbm: observation.rssi_dbm,
            observed_at: observation.observed_at,
        }
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// Get the device roster.
#[utoipa::path(
    get,
    path = "/api/{kind}/roster",
    tag = "roster",
    operation_id = "getRoster",
    summary = "Get the device roster",
    description = "Returns one entry per distinct identifier in the radio's log, most \
        recently seen first, with aliases applied. Pass `q` to search immediately; \
        otherwise the live roster and its current search text are returned.",
    params(
        ("kind" = RadioKind, Path, description = "Radio kind: `ble` or `wifi`"),
        RosterQuery
    ),
    responses(
        (status = 200, description = "Roster retrieved", body = RosterResponse),
        (status = 400, description = "Unknown radio kind", body = ErrorResponse),
        (status = 500, description = "Stores could not be read", body = ErrorResponse)
    )
)]
pub async fn get_roster(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    Query(query): Query<RosterQuery>,
) -> ApiResult<Json<RosterResponse>> {
    let kind = radio_kind(&kind)?;
    let radio = state.radio(kind);

    let (query, entries) = match query.q {
        Some(q) => {
            let entries = radio.search(&q)?;
            (q, entries)
        }
        None => (radio.search_query(), radio.roster()),
    };

    Ok(Json(RosterResponse {
        kind,
        query,
        entries,
        health: radio.roster_health(),
    }))
}

/// Set the live roster's search text.
#[utoipa::path(
    put,
    path = "/api/{kind}/roster/query",
    tag = "roster",
    operation_id = "setRosterQuery",
    summary = "Set the live search text",
    description = "Replaces the search text of the live roster. The change is applied \
        after the configured debounce delay.",
    params(("kind" = RadioKind, Path, description = "Radio kind: `ble` or `wifi`")),
    request_body = SetQueryRequest,
    responses(
        (status = 202, description = "Search text accepted"),
        (status = 400, description = "Unknown radio kind", body = ErrorResponse)
    )
)]
pub async fn set_roster_query(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    Json(request): Json<SetQueryRequest>,
) -> ApiResult<StatusCode> {
    let kind = radio_kind(&kind)?;
    state.radio(kind).set_search_query(request.query);
    Ok(StatusCode::ACCEPTED)
}

/// Get the full observation log.
#[utoipa::path(
    get,
    path = "/api/{kind}/observations",
    tag = "roster",
    operation_id = "getObservations",
    summary = "Get the observation log",
    description = "Returns every stored observation of the radio, newest first.",
    params(("kind" = RadioKind, Path, description = "Radio kind: `ble` or `wifi`")),
    responses(
        (status = 200, description = "Log retrieved", body = [ObservationResponse]),
        (status = 400, description = "Unknown radio kind", body = ErrorResponse),
        (status = 500, description = "Log could not be read", body = ErrorResponse)
    )
)]
pub async fn get_observations(
    State(state): State<AppState>,
    Path(kind): Path<String>,
) -> ApiResult<Json<Vec<ObservationResponse>>> {
    let kind = radio_kind(&kind)?;
    let model = state.config().distance;
    let rows = state
        .radio(kind)
        .observations()?
        .into_iter()
        .map(|observation| ObservationResponse::new(observation, &model))
        .collect();
    Ok(Json(rows))
}

/// Clear the observation log.
#[utoipa::path(
    delete,
    path = "/api/{kind}/logs",
    tag = "roster",
    operation_id = "clearLogs",
    summary = "Clear the observation log",
    description = "Deletes every stored observation of the radio. Aliases are kept.",
    params(("kind" = RadioKind, Path, description = "Radio kind: `ble` or `wifi`")),
    responses(
        (status = 204, description = "Log cleared"),
        (status = 400, description = "Unknown radio kind", body = ErrorResponse),
        (status = 500, description = "Log could not be cleared", body = ErrorResponse)
    )
)]
pub async fn clear_logs(
    State(state): State<AppState>,
    Path(kind): Path<String>,
) -> ApiResult<StatusCode> {
    let kind = radio_kind(&kind)?;
    state.radio(kind).clear_logs()?;
    Ok(StatusCode::NO_CONTENT)
}
