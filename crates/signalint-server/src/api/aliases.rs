//! Alias management endpoints.
//!
//! An alias replaces an emitter's broadcast label in the roster. Aliases are
//! per radio kind; renaming a BLE device never affects the WiFi roster.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use signalint_core::{Alias, RadioKind};
use utoipa::ToSchema;

use crate::api::error::{ApiError, ApiResult, ErrorResponse};
use crate::api::radio_kind;
use crate::state::AppState;

/// Creates the alias router, nested under `/api/{kind}`.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/aliases", get(list_aliases).delete(clear_aliases))
        .route("/aliases/{identifier}", put(rename).delete(remove_alias))
}

/// Request body for renaming a device.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({ "label": "Hallway printer" }))]
pub struct RenameRequest {
    /// New display name. Surrounding whitespace is trimmed; must not be blank.
    #[schema(example = "Hallway printer", min_length = 1)]
    pub label: String,
}

/// List every alias.
#[utoipa::path(
    get,
    path = "/api/{kind}/aliases",
    tag = "aliases",
    operation_id = "listAliases",
    summary = "List aliases",
    description = "Returns every alias of the radio, ordered by identifier.",
    params(("kind" = RadioKind, Path, description = "Radio kind: `ble` or `wifi`")),
    responses(
        (status = 200, description = "Aliases retrieved", body = [Alias]),
        (status = 400, description = "Unknown radio kind", body = ErrorResponse)
    )
)]
pub async fn list_aliases(
    State(state): State<AppState>,
    Path(kind): Path<String>,
) -> ApiResult<Json<Vec<Alias>>> {
    let kind = radio_kind(&kind)?;
    Ok(Json(state.radio(kind).aliases()?))
}

/// Rename a device.
#[utoipa::path(
    put,
    path = "/api/{kind}/aliases/{identifier}",
    tag = "aliases",
    operation_id = "renameDevice",
    summary = "Rename a device",
    description = "Creates or replaces the alias of an identifier. The roster shows the \
        alias instead of the broadcast label from then on.",
    params(
        ("kind" = RadioKind, Path, description = "Radio kind: `ble` or `wifi`"),
        ("identifier" = String, Path, description = "Hardware address of the device")
    ),
    request_body = RenameRequest,
    responses(
        (status = 200, description = "Alias stored", body = Alias),
        (status = 400, description = "Blank label or unknown radio kind", body = ErrorResponse)
    )
)]
pub async fn rename(
    State(state): State<AppState>,
    Path((kind, identifier)): Path<(String, String)>,
    Json(request): Json<RenameRequest>,
) -> ApiResult<Json<Alias>> {
    let kind = radio_kind(&kind)?;
    Ok(Json(state.radio(kind).rename(&identifier, &request.label)?))
}

/// Remove a device's alias.
#[utoipa::path(
    delete,
    path = "/api/{kind}/aliases/{identifier}",
    tag = "aliases",
    operation_id = "removeAlias",
    summary = "Remove an alias",
    description = "Deletes the alias of an identifier so the roster shows its broadcast \
        label again.",
    params(
        ("kind" = RadioKind, Path, description = "Radio kind: `ble` or `wifi`"),
        ("identifier" = String, Path, description = "Hardware address of the device")
    ),
    responses(
        (status = 204, description = "Alias removed"),
        (status = 404, description = "No alias for the identifier", body = ErrorResponse)
    )
)]
pub async fn remove_alias(
    State(state): State<AppState>,
    Path((kind, identifier)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    let kind = radio_kind(&kind)?;
    if state.radio(kind).remove_alias(&identifier)? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound {
            error_code: "ALIAS_NOT_FOUND".to_string(),
            message: format!("No alias for '{identifier}'"),
        })
    }
}

/// Remove every alias.
#[utoipa::path(
    delete,
    path = "/api/{kind}/aliases",
    tag = "aliases",
    operation_id = "clearAliases",
    summary = "Clear aliases",
    description = "Deletes every alias of the radio. Observations are kept.",
    params(("kind" = RadioKind, Path, description = "Radio kind: `ble` or `wifi`")),
    responses(
        (status = 204, description = "Aliases cleared"),
        (status = 400, description = "Unknown radio kind", body = ErrorResponse)
    )
)]
pub async fn clear_aliases(
    State(state): State<AppState>,
    Path(kind): Path<String>,
) -> ApiResult<StatusCode> {
    let kind = radio_kind(&kind)?;
    state.radio(kind).clear_aliases()?;
    Ok(StatusCode::NO_CONTENT)
}
