//! HTTP API routes and handlers.
//!
//! This module contains all HTTP endpoint implementations organized by domain:
//! - `roster` - Device roster, observation log and log clearing
//! - `aliases` - Device renaming
//! - `scan` - Scan start, stop and status
//! - `export` - CSV export of the observation log
//! - `session` - The single device connection and its messages
//! - `health` - Service health checks
//! - `error` - API error types
//! - `openapi` - OpenAPI specification generation

use axum::routing::get;
use axum::Router;
use signalint_core::RadioKind;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub mod aliases;
pub mod error;
pub mod export;
pub mod health;
pub mod openapi;
pub mod roster;
pub mod scan;
pub mod session;

pub use error::{ApiError, ApiResult, ErrorResponse};
pub use openapi::get_openapi_json;

/// Creates the combined API router with all endpoints.
///
/// # Route Structure
///
/// ```text
/// /health                      - Health check
/// /api
/// ├── /{kind}                  - Per radio (`ble` or `wifi`)
/// │   ├── /roster              - Device roster (?q= searches)
/// │   ├── /roster/query        - Live search text
/// │   ├── /observations        - Full observation log
/// │   ├── /logs                - Clear the log
/// │   ├── /aliases[/{id}]      - Device renaming
/// │   ├── /scan                - Scan start, stop, status
/// │   └── /export              - CSV export and status
/// ├── /session                 - Connection state, connect, disconnect
/// ├── /session/messages        - Send a message
/// └── /openapi.json            - OpenAPI specification
/// ```
pub fn create_router(state: AppState) -> Router {
    let per_radio = Router::new()
        .merge(roster::router())
        .merge(aliases::router())
        .merge(scan::router())
        .merge(export::router());

    Router::new()
        .nest("/health", health::router())
        .nest(
            "/api",
            Router::new()
                .route("/openapi.json", get(openapi::get_openapi_spec))
                .nest("/session", session::router())
                .nest("/{kind}", per_radio),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Parse the `{kind}` path segment.
pub(crate) fn radio_kind(segment: &str) -> ApiResult<RadioKind> {
    RadioKind::ALL
        .into_iter()
        .find(|kind| kind.as_str().eq_ignore_ascii_case(segment))
        .ok_or_else(|| ApiError::unknown_radio(segment))
}

#[cfg(test)]
mod tests {
    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request, StatusCode};
    use serde_json::{json, Value};
    use signalint_core::platform::simulated::{ScriptedScanSource, DEMO_PEER};
    use signalint_core::scan::{RawScanEvent, RawSighting};
    use signalint_core::ConnectionState;
    use tower::ServiceExt;

    use super::*;
    use crate::state::test_support;

    fn app() -> (Router, AppState) {
        let ble = ScriptedScanSource::new(RadioKind::Ble).with_events(vec![
            RawScanEvent::single(RawSighting::ble("AA:01", Some("Printer,Hall"), -60)),
            RawScanEvent::single(RawSighting::ble("AA:02", None, -80)),
        ]);
        let wifi = ScriptedScanSource::new(RadioKind::Wifi).keep_open();
        let state = test_support::state(ble, wifi);
        (create_router(state.clone()), state)
    }

    async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(body) => {
                request = request.header("content-type", "application/json");
                Body::from(body.to_string())
            }
            None => Body::empty(),
        };
        let response = app
            .clone()
            .oneshot(request.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    async fn scan_ble(app: &Router, state: &AppState) {
        let (status, _) = call(app, Method::POST, "/api/ble/scan", Some(json!({"duration_secs": 0}))).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        state
            .radio(RadioKind::Ble)
            .subscribe_scan_status()
            .wait_for(|s| !matches!(s, signalint_core::ScanStatus::Scanning))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (app, _) = app();
        let (status, body) = call(&app, Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_unknown_radio_is_bad_request() {
        let (app, _) = app();
        let (status, body) = call(&app, Method::GET, "/api/zigbee/roster", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "UNKNOWN_RADIO");
    }

    #[tokio::test]
    async fn test_scan_then_search_roster() {
        let (app, state) = app();
        scan_ble(&app, &state).await;

        let (status, body) = call(&app, Method::GET, "/api/ble/observations", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 2);

        let (status, body) = call(&app, Method::GET, "/api/ble/roster?q=printer", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["query"], "printer");
        let entries = body["entries"].as_array().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["identifier"], "AA:01");

        // WiFi never sees BLE data.
        let (_, body) = call(&app, Method::GET, "/api/wifi/roster?q=", None).await;
        assert!(body["entries"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rename_and_remove_alias() {
        let (app, state) = app();
        scan_ble(&app, &state).await;

        let (status, body) = call(
            &app,
            Method::PUT,
            "/api/ble/aliases/AA:02",
            Some(json!({"label": "  Desk tag "})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["label"], "Desk tag");

        let (_, body) = call(&app, Method::GET, "/api/ble/roster?q=desk", None).await;
        assert_eq!(body["entries"][0]["is_aliased"], true);

        let (status, body) = call(
            &app,
            Method::PUT,
            "/api/ble/aliases/AA:02",
            Some(json!({"label": "   "})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "INVALID_ALIAS");

        let (status, _) = call(&app, Method::DELETE, "/api/ble/aliases/AA:02", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = call(&app, Method::DELETE, "/api/ble/aliases/AA:02", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_second_scan_conflicts() {
        let (app, _) = app();
        let (status, _) = call(&app, Method::POST, "/api/wifi/scan", None).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let (status, body) = call(&app, Method::POST, "/api/wifi/scan", None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "SCAN_ALREADY_RUNNING");

        let (status, body) = call(&app, Method::DELETE, "/api/wifi/scan", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["was_running"], true);
        let (_, body) = call(&app, Method::GET, "/api/wifi/scan", None).await;
        assert_eq!(body["status"]["state"], "idle");
    }

    #[tokio::test]
    async fn test_export_and_clear_logs() {
        let (app, state) = app();
        scan_ble(&app, &state).await;

        let (status, body) = call(&app, Method::POST, "/api/ble/export", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["records"], 2);
        let (_, body) = call(&app, Method::GET, "/api/ble/export", None).await;
        assert_eq!(body["status"]["state"], "succeeded");

        let (status, _) = call(&app, Method::DELETE, "/api/ble/logs", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (_, body) = call(&app, Method::GET, "/api/ble/observations", None).await;
        assert!(body.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_session_round_trip() {
        let (app, state) = app();

        let (status, body) = call(&app, Method::POST, "/api/session", Some(json!({"identifier": "FF:FF"}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "PEER_NOT_FOUND");

        let (status, _) = call(
            &app,
            Method::POST,
            "/api/session/messages",
            Some(json!({"text": "hi"})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = call(&app, Method::POST, "/api/session", Some(json!({"identifier": DEMO_PEER}))).await;
        assert_eq!(status, StatusCode::OK);
        state
            .session()
            .subscribe_data_channel()
            .wait_for(|c| *c == signalint_core::DataChannel::Ready)
            .await
            .unwrap();
        assert_eq!(state.session().state(), ConnectionState::Connected);

        let (status, body) = call(
            &app,
            Method::POST,
            "/api/session/messages",
            Some(json!({"text": "hi"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"]["text"], "hi");
        assert_eq!(body["message"]["sent"], true);

        let (status, body) = call(&app, Method::DELETE, "/api/session", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"]["state"], "disconnected");
    }

    #[tokio::test]
    async fn test_openapi_route() {
        let (app, _) = app();
        let (status, body) = call(&app, Method::GET, "/api/openapi.json", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["paths"]["/api/{kind}/roster"].is_object());
    }
}
