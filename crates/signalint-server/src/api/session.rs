//! Connection session endpoints.
//!
//! There is a single session. Connecting to a new device tears down the
//! current one first.

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use signalint_core::{ConnectionState, DataChannel, SessionMessage};
use utoipa::ToSchema;

use crate::api::error::{ApiError, ApiResult, ErrorResponse};
use crate::state::AppState;

/// Creates the session router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(get_session).post(connect).delete(disconnect))
        .route("/messages", post(send_message))
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// Snapshot of the session.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SessionResponse {
    /// Connection state.
    pub state: ConnectionState,
    /// Identifier of the connected or connecting peer.
    #[schema(nullable, example = "D4:36:39:00:10:01")]
    pub peer: Option<String>,
    /// Whether messages can be exchanged.
    pub data_channel: DataChannel,
    /// Messages of the current session, oldest first.
    pub messages: Vec<SessionMessage>,
}

/// Request body for connecting.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({ "identifier": "D4:36:39:00:10:01" }))]
pub struct ConnectRequest {
    /// Hardware address of the peer.
    pub identifier: String,
}

/// Request body for sending a message.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({ "text": "hello" }))]
pub struct SendMessageRequest {
    /// Text written to the peer as UTF-8.
    pub text: String,
}

/// Result of sending a message.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SendMessageResponse {
    /// The recorded message.
    pub message: SessionMessage,
}

fn snapshot(state: &AppState) -> SessionResponse {
    let session = state.session();
    SessionResponse {
        state: session.state(),
        peer: session.peer_identifier(),
        data_channel: session.data_channel(),
        messages: session.messages(),
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// Get the session.
#[utoipa::path(
    get,
    path = "/api/session",
    tag = "session",
    operation_id = "getSession",
    summary = "Get the session",
    description = "Returns the connection state, peer, data channel and message history.",
    responses(
        (status = 200, description = "Session retrieved", body = SessionResponse)
    )
)]
pub async fn get_session(State(state): State<AppState>) -> Json<SessionResponse> {
    Json(snapshot(&state))
}

/// Connect to a peer.
#[utoipa::path(
    post,
    path = "/api/session",
    tag = "session",
    operation_id = "connect",
    summary = "Connect to a device",
    description = "Tears down any current session and starts connecting to the device. \
        Returns once the connection attempt is under way; poll the session to follow \
        it to `connected`.",
    request_body = ConnectRequest,
    responses(
        (status = 200, description = "Connecting", body = SessionResponse),
        (status = 404, description = "Device not found", body = ErrorResponse),
        (status = 502, description = "Connection failed", body = ErrorResponse)
    )
)]
pub async fn connect(
    State(state): State<AppState>,
    Json(request): Json<ConnectRequest>,
) -> ApiResult<Json<SessionResponse>> {
    state.session().connect(request.identifier.trim()).await?;
    Ok(Json(snapshot(&state)))
}

/// Disconnect.
#[utoipa::path(
    delete,
    path = "/api/session",
    tag = "session",
    operation_id = "disconnect",
    summary = "Disconnect",
    description = "Releases the peer. Disconnecting without a session is not an error.",
    responses(
        (status = 200, description = "Disconnected", body = SessionResponse)
    )
)]
pub async fn disconnect(State(state): State<AppState>) -> Json<SessionResponse> {
    state.session().disconnect().await;
    Json(snapshot(&state))
}

/// Send a message to the peer.
#[utoipa::path(
    post,
    path = "/api/session/messages",
    tag = "session",
    operation_id = "sendMessage",
    summary = "Send a message",
    description = "Writes the text to the peer's write characteristic. Requires a \
        connected session with a ready data channel.",
    request_body = SendMessageRequest,
    responses(
        (status = 200, description = "Message sent", body = SendMessageResponse),
        (status = 409, description = "No ready session or write failed", body = ErrorResponse)
    )
)]
pub async fn send_message(
    State(state): State<AppState>,
    Json(request): Json<SendMessageRequest>,
) -> ApiResult<Json<SendMessageResponse>> {
    let session = state.session();
    if !session.send_message(&request.text).await {
        return Err(ApiError::Conflict {
            error_code: "MESSAGE_NOT_SENT".to_string(),
            message: format!(
                "Message not sent. Session is {} with data channel {:?}.",
                session.state(),
                session.data_channel()
            ),
        });
    }

    let message = session
        .messages()
        .into_iter()
        .rev()
        .find(|m| m.sent)
        .ok_or_else(|| ApiError::InternalError {
            error_code: "MESSAGE_NOT_RECORDED".to_string(),
            message: "Sent message missing from history".to_string(),
            details: None,
        })?;
    Ok(Json(SendMessageResponse { message }))
}
