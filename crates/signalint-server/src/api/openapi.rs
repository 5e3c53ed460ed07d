//! OpenAPI specification generation for the signalint API.
//!
//! The document is served at `/api/openapi.json` and written to the workspace
//! root by the `gen-openapi` binary for client generation.

use axum::Json;
use signalint_core::{
    Alias, ConnectionState, DataChannel, ExportStatus, RadioKind, RosterEntry, RosterHealth,
    ScanStatus, SessionMessage,
};
use utoipa::OpenApi;

use super::aliases::RenameRequest;
use super::error::ErrorResponse;
use super::export::{ExportResponse, ExportStatusResponse};
use super::health::HealthResponse;
use super::roster::{ObservationResponse, RosterResponse, SetQueryRequest};
use super::scan::{ScanStatusResponse, StartScanRequest, StopScanResponse};
use super::session::{ConnectRequest, SendMessageRequest, SendMessageResponse, SessionResponse};

/// Serve the OpenAPI specification as JSON.
pub async fn get_openapi_spec() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

/// Returns the OpenAPI specification as a string (for writing to file).
/// Used by the gen-openapi binary.
pub fn get_openapi_json() -> String {
    ApiDoc::openapi()
        .to_pretty_json()
        .expect("Failed to serialize OpenAPI spec")
}

/// Main OpenAPI document structure for signalint.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "signalint API",
        version = "0.1.0",
        description = r#"
# signalint API

signalint collects BLE advertisements and WiFi beacons, keeps a searchable
roster of every emitter seen, and holds a single message session with one
BLE device.

## Overview

Every per-radio route lives under `/api/{kind}` where `kind` is `ble` or `wifi`.

1. **Scan**: start and stop scanning. Each sighting is appended to the radio's log.
2. **Roster**: the latest sighting per device, newest first, with aliases applied.
3. **Aliases**: rename devices. Aliases are kept separately per radio.
4. **Export**: write the full log as a CSV file.
5. **Session**: connect to one BLE device and exchange text messages.
"#,
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    ),
    servers(
        (url = "/", description = "Local signalint server")
    ),
    tags(
        (name = "system", description = "Health checks"),
        (name = "roster", description = "Device roster and observation log"),
        (name = "aliases", description = "Device renaming"),
        (name = "scan", description = "Scan control"),
        (name = "export", description = "CSV export of the observation log"),
        (name = "session", description = "Connection to a single BLE device")
    ),
    paths(
        super::health::health_check,
        super::roster::get_roster,
        super::roster::set_roster_query,
        super::roster::get_observations,
        super::roster::clear_logs,
        super::aliases::list_aliases,
        super::aliases::rename,
        super::aliases::remove_alias,
        super::aliases::clear_aliases,
        super::scan::start_scan,
        super::scan::stop_scan,
        super::scan::get_scan_status,
        super::export::run_export,
        super::export::get_export_status,
        super::session::get_session,
        super::session::connect,
        super::session::disconnect,
        super::session::send_message,
    ),
    components(
        schemas(
            ErrorResponse,
            HealthResponse,
            RadioKind,
            // Roster
            RosterEntry,
            RosterHealth,
            RosterResponse,
            SetQueryRequest,
            ObservationResponse,
            // Aliases
            Alias,
            RenameRequest,
            // Scan
            ScanStatus,
            StartScanRequest,
            ScanStatusResponse,
            StopScanResponse,
            // Export
            ExportStatus,
            ExportResponse,
            ExportStatusResponse,
            // Session
            ConnectionState,
            DataChannel,
            SessionMessage,
            SessionResponse,
            ConnectRequest,
            SendMessageRequest,
            SendMessageResponse,
        )
    )
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openapi_spec_generation() {
        let spec = ApiDoc::openapi();
        assert_eq!(spec.info.title, "signalint API");
        assert!(spec.paths.paths.contains_key("/api/{kind}/scan"));
        assert!(spec.paths.paths.contains_key("/api/session/messages"));
    }

    #[test]
    fn test_openapi_json_serialization() {
        let json = get_openapi_json();
        assert!(json.contains("\"openapi\":"));
        assert!(json.contains("\"signalint API\""));
        assert!(json.contains("\"RosterEntry\""));
    }
}
