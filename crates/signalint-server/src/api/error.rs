//! API error types and response handling.
//!
//! This module provides a unified error type for all API handlers
//! with automatic conversion to appropriate HTTP responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use signalint_core::SignalError;
use utoipa::ToSchema;

/// Result type alias for API handlers.
pub type ApiResult<T> = Result<T, ApiError>;

/// Unified API error type.
///
/// Each variant maps to a specific HTTP status code and produces a
/// consistent JSON error response.
#[derive(Debug, Clone)]
pub enum ApiError {
    /// 400 Bad Request - Invalid input from client.
    BadRequest {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
    },

    /// 403 Forbidden - The platform refused access to the radio.
    Forbidden {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
    },

    /// 404 Not Found - Resource does not exist.
    NotFound {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
    },

    /// 409 Conflict - Operation cannot be completed due to current state.
    Conflict {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
    },

    /// 500 Internal Server Error - Unexpected server-side error.
    InternalError {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
        /// Optional details.
        details: Option<String>,
    },

    /// 502 Bad Gateway - The connected peer failed or misbehaved.
    BadGateway {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
    },

    /// 503 Service Unavailable - Radio hardware is missing or switched off.
    ServiceUnavailable {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
        /// Optional additional details.
        details: Option<String>,
    },
}

/// Standard JSON error response body.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "error": "INVALID_ALIAS",
    "message": "Invalid alias: label must not be blank",
    "details": null
}))]
pub struct ErrorResponse {
    /// Machine-readable error code (e.g., "PEER_NOT_FOUND").
    #[schema(example = "INVALID_ALIAS")]
    pub error: String,

    /// Human-readable error message.
    #[schema(example = "Invalid alias: label must not be blank")]
    pub message: String,

    /// Optional additional details for debugging.
    #[schema(nullable)]
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    /// A 400 for an unrecognised radio kind in the path.
    pub fn unknown_radio(kind: &str) -> Self {
        Self::BadRequest {
            error_code: "UNKNOWN_RADIO".to_string(),
            message: format!("Unknown radio '{kind}'. Expected 'ble' or 'wifi'."),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let plain = |error: String, message: String| ErrorResponse {
            error,
            message,
            details: None,
        };
        let (status, error_response) = match self {
            Self::BadRequest {
                error_code,
                message,
            } => (StatusCode::BAD_REQUEST, plain(error_code, message)),

            Self::Forbidden {
                error_code,
                message,
            } => (StatusCode::FORBIDDEN, plain(error_code, message)),

            Self::NotFound {
                error_code,
                message,
            } => (StatusCode::NOT_FOUND, plain(error_code, message)),

            Self::Conflict {
                error_code,
                message,
            } => (StatusCode::CONFLICT, plain(error_code, message)),

            Self::InternalError {
                error_code,
                message,
                details,
            } => {
                tracing::error!(
                    error_code = %error_code,
                    message = %message,
                    details = ?details,
                    "Internal server error"
                );

                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse {
                        error: error_code,
                        message,
                        details: details.map(|d| serde_json::json!(d)),
                    },
                )
            }

            Self::BadGateway {
                error_code,
                message,
            } => (StatusCode::BAD_GATEWAY, plain(error_code, message)),

            Self::ServiceUnavailable {
                error_code,
                message,
                details,
            } => (
                StatusCode::SERVICE_UNAVAILABLE,
                ErrorResponse {
                    error: error_code,
                    message,
                    details: details.map(|d| serde_json::json!(d)),
                },
            ),
        };

        (status, Json(error_response)).into_response()
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BadRequest { message, .. } => write!(f, "Bad Request: {message}"),
            Self::Forbidden { message, .. } => write!(f, "Forbidden: {message}"),
            Self::NotFound { message, .. } => write!(f, "Not Found: {message}"),
            Self::Conflict { message, .. } => write!(f, "Conflict: {message}"),
            Self::InternalError { message, .. } => write!(f, "Internal Error: {message}"),
            Self::BadGateway { message, .. } => write!(f, "Bad Gateway: {message}"),
            Self::ServiceUnavailable { message, .. } => {
                write!(f, "Service Unavailable: {message}")
            }
        }
    }
}

impl std::error::Error for ApiError {}

/// Convert from signalint-core errors.
impl From<SignalError> for ApiError {
    fn from(err: SignalError) -> Self {
        let error_code = err.error_code().to_string();
        let message = err.to_string();

        match err.http_status_code() {
            400 | 422 => Self::BadRequest {
                error_code,
                message,
            },
            403 => Self::Forbidden {
                error_code,
                message,
            },
            404 => Self::NotFound {
                error_code,
                message,
            },
            409 => Self::Conflict {
                error_code,
                message,
            },
            502 => Self::BadGateway {
                error_code,
                message,
            },
            503 => Self::ServiceUnavailable {
                error_code,
                message,
                details: None,
            },
            _ => Self::InternalError {
                error_code,
                message,
                details: None,
            },
        }
    }
}

impl From<signalint_core::SessionError> for ApiError {
    fn from(err: signalint_core::SessionError) -> Self {
        Self::from(SignalError::from(err))
    }
}

#[cfg(test)]
mod tests {
    use signalint_core::RadioKind;

    use super::*;

    #[test]
    fn test_bad_request_error() {
        let err = ApiError::BadRequest {
            error_code: "test_error".to_string(),
            message: "Test message".to_string(),
        };
        assert!(err.to_string().contains("Bad Request"));
    }

    #[test]
    fn test_error_response_serialization() {
        let response = ErrorResponse {
            error: "test_error".to_string(),
            message: "Test message".to_string(),
            details: None,
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("test_error"));
    }

    #[test]
    fn test_signal_errors_map_to_statuses() {
        let status = |err: SignalError| ApiError::from(err).into_response().status();

        assert_eq!(
            status(SignalError::InvalidAlias("blank".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status(SignalError::PermissionDenied("no".into())),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            status(SignalError::PeerNotFound("AA".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status(SignalError::ScanAlreadyRunning(RadioKind::Ble)),
            StatusCode::CONFLICT
        );
        assert_eq!(status(SignalError::LinkLost), StatusCode::BAD_GATEWAY);
        assert_eq!(
            status(SignalError::RadioDisabled(RadioKind::Wifi)),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status(SignalError::PersistenceError("disk".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
