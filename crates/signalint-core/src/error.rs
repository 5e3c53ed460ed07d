//! Unified error types for the signalint core library.
//!
//! This module provides a unified error type [`SignalError`] that covers all
//! failure modes across signalint. Each module also has its own specific error
//! type (`ScanError`, `IngestError`, `SessionError`, `ExportError`,
//! `StoreError`, `ConfigError`) for internal use; all of them convert into
//! [`SignalError`].
//!
//! # Design Principles
//!
//! - **Specific variants**: Each error variant captures exactly one failure mode
//! - **Actionable messages**: Error messages guide users toward resolution
//! - **HTTP-ready**: Error types include HTTP status codes and error codes
//!
//! # Example
//!
//! ```rust
//! use signalint_core::error::{Result, SignalError};
//!
//! fn rename(label: &str) -> Result<()> {
//!     if label.trim().is_empty() {
//!         return Err(SignalError::InvalidAlias("label must not be blank".into()));
//!     }
//!     Ok(())
//! }
//! ```

use thiserror::Error;

use crate::types::RadioKind;

/// The unified error type for all signalint operations.
#[derive(Debug, Error)]
pub enum SignalError {
    // =========================================================================
    // RADIO ERRORS
    // =========================================================================
    /// No scanner exists for the radio.
    #[error("{0} scanner is not available. Ensure the radio hardware is present and drivers are loaded.")]
    RadioUnavailable(RadioKind),

    /// The radio is switched off.
    #[error("{0} radio is disabled. Switch it on and try again.")]
    RadioDisabled(RadioKind),

    /// The platform refused access to the radio.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Scanning failed.
    #[error("Scan failed: {0}")]
    ScanFailed(String),

    /// A scan is already running on the radio.
    #[error("A {0} scan is already running. Stop it before starting another.")]
    ScanAlreadyRunning(RadioKind),

    // =========================================================================
    // SESSION ERRORS
    // =========================================================================
    /// No peer is known under the identifier.
    #[error("Device not found: '{0}'. Ensure the device is powered on and within range.")]
    PeerNotFound(String),

    /// Connecting to the peer failed.
    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    /// The link dropped.
    #[error("Link lost")]
    LinkLost,

    /// Service discovery or notification setup failed.
    #[error("Service discovery failed: {0}")]
    DiscoveryFailed(String),

    /// A message could not be written.
    #[error("Write failed: {0}")]
    WriteFailed(String),

    /// The operation needs a connected session.
    #[error("No connected session")]
    NotConnected,

    // =========================================================================
    // ALIAS ERRORS
    // =========================================================================
    /// An alias label was rejected.
    #[error("Invalid alias: {0}")]
    InvalidAlias(String),

    // =========================================================================
    // EXPORT ERRORS
    // =========================================================================
    /// The export could not be written or delivered.
    #[error("Export failed: {0}")]
    ExportIoFailure(String),

    // =========================================================================
    // CONFIGURATION ERRORS
    // =========================================================================
    /// The configuration could not be parsed.
    #[error("Failed to parse configuration: {0}")]
    ConfigParseError(String),

    /// The configuration contains invalid values.
    #[error("Configuration validation failed: {0}")]
    ConfigValidationError(String),

    // =========================================================================
    // PERSISTENCE & I/O ERRORS
    // =========================================================================
    /// An error occurred while persisting or reading data.
    #[error("Persistence error: {0}")]
    PersistenceError(String),

    /// A low-level I/O error occurred.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// A specialized [`Result`] type for signalint operations.
pub type Result<T> = std::result::Result<T, SignalError>;

impl SignalError {
    /// Returns `true` if this error is related to radio hardware or scanning.
    #[inline]
    #[must_use]
    pub const fn is_radio_error(&self) -> bool {
        matches!(
            self,
            Self::RadioUnavailable(_)
                | Self::RadioDisabled(_)
                | Self::PermissionDenied(_)
                | Self::ScanFailed(_)
                | Self::ScanAlreadyRunning(_)
        )
    }

    /// Returns `true` if this error is related to a connection session.
    #[inline]
    #[must_use]
    pub const fn is_session_error(&self) -> bool {
        matches!(
            self,
            Self::PeerNotFound(_)
                | Self::ConnectFailed(_)
                | Self::LinkLost
                | Self::DiscoveryFailed(_)
                | Self::WriteFailed(_)
                | Self::NotConnected
        )
    }

    /// Returns `true` if this error is related to configuration.
    #[inline]
    #[must_use]
    pub const fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::ConfigParseError(_) | Self::ConfigValidationError(_)
        )
    }

    /// Returns `true` if this error is related to I/O or persistence.
    #[inline]
    #[must_use]
    pub const fn is_io_error(&self) -> bool {
        matches!(
            self,
            Self::PersistenceError(_) | Self::IoError(_) | Self::ExportIoFailure(_)
        )
    }

    /// Returns `true` if this error is likely recoverable by retrying.
    #[inline]
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::PeerNotFound(_)
                | Self::ScanFailed(_)
                | Self::ConnectFailed(_)
                | Self::LinkLost
                | Self::ScanAlreadyRunning(_)
        )
    }

    /// Returns an HTTP-appropriate status code for this error.
    #[inline]
    #[must_use]
    pub const fn http_status_code(&self) -> u16 {
        match self {
            // 400 Bad Request - malformed input
            Self::InvalidAlias(_) => 400,

            // 403 Forbidden - understood but refused
            Self::PermissionDenied(_) => 403,

            // 404 Not Found
            Self::PeerNotFound(_) => 404,

            // 409 Conflict - current state prevents the operation
            Self::ScanAlreadyRunning(_) | Self::NotConnected => 409,

            // 422 Unprocessable Entity - semantic errors
            Self::ConfigParseError(_) | Self::ConfigValidationError(_) => 422,

            // 500 Internal Server Error - server-side issues
            Self::PersistenceError(_) | Self::IoError(_) | Self::ExportIoFailure(_) => 500,

            // 502 Bad Gateway - the peer misbehaved
            Self::ConnectFailed(_)
            | Self::LinkLost
            | Self::DiscoveryFailed(_)
            | Self::WriteFailed(_) => 502,

            // 503 Service Unavailable - radio hardware issues
            Self::RadioUnavailable(_) | Self::RadioDisabled(_) | Self::ScanFailed(_) => 503,
        }
    }

    /// Returns a machine-readable error code for API responses.
    #[inline]
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::RadioUnavailable(_) => "RADIO_UNAVAILABLE",
            Self::RadioDisabled(_) => "RADIO_DISABLED",
            Self::PermissionDenied(_) => "PERMISSION_DENIED",
            Self::ScanFailed(_) => "SCAN_FAILED",
            Self::ScanAlreadyRunning(_) => "SCAN_ALREADY_RUNNING",
            Self::PeerNotFound(_) => "PEER_NOT_FOUND",
            Self::ConnectFailed(_) => "CONNECT_FAILED",
            Self::LinkLost => "LINK_LOST",
            Self::DiscoveryFailed(_) => "DISCOVERY_FAILED",
            Self::WriteFailed(_) => "WRITE_FAILED",
            Self::NotConnected => "NOT_CONNECTED",
            Self::InvalidAlias(_) => "INVALID_ALIAS",
            Self::ExportIoFailure(_) => "EXPORT_IO_FAILURE",
            Self::ConfigParseError(_) => "CONFIG_PARSE_ERROR",
            Self::ConfigValidationError(_) => "CONFIG_VALIDATION_ERROR",
            Self::PersistenceError(_) => "PERSISTENCE_ERROR",
            Self::IoError(_) => "IO_ERROR",
        }
    }
}

// =============================================================================
// CONVERSIONS FROM MODULE-SPECIFIC ERRORS
// =============================================================================

impl From<crate::scan::ScanError> for SignalError {
    fn from(err: crate::scan::ScanError) -> Self {
        use crate::scan::ScanError;
        match err {
            ScanError::RadioUnavailable { kind } => Self::RadioUnavailable(kind),
            ScanError::RadioDisabled { kind } => Self::RadioDisabled(kind),
            ScanError::PermissionDenied(message) => Self::PermissionDenied(message),
            ScanError::PlatformFailure { code } => {
                Self::ScanFailed(format!("platform error code {code}"))
            }
            ScanError::StartFailed(message) | ScanError::StopFailed(message) => {
                Self::ScanFailed(message)
            }
        }
    }
}

impl From<crate::ingest::IngestError> for SignalError {
    fn from(err: crate::ingest::IngestError) -> Self {
        use crate::ingest::IngestError;
        match err {
            IngestError::ScanAlreadyRunning { kind } => Self::ScanAlreadyRunning(kind),
        }
    }
}

impl From<crate::session::SessionError> for SignalError {
    fn from(err: crate::session::SessionError) -> Self {
        use crate::session::SessionError;
        match err {
            SessionError::PeerNotFound { identifier } => Self::PeerNotFound(identifier),
            SessionError::ConnectFailed(message) | SessionError::Adapter(message) => {
                Self::ConnectFailed(message)
            }
            SessionError::ConnectTimeout => Self::ConnectFailed(err.to_string()),
            SessionError::LinkLost => Self::LinkLost,
            SessionError::DiscoveryFailed(message) => Self::DiscoveryFailed(message),
            SessionError::WriteFailed(message) => Self::WriteFailed(message),
            SessionError::NotConnected => Self::NotConnected,
        }
    }
}

impl From<crate::export::ExportError> for SignalError {
    fn from(err: crate::export::ExportError) -> Self {
        use crate::export::ExportError;
        match err {
            ExportError::ReadFailed(message) => Self::PersistenceError(message),
            ExportError::ExportIoFailure { .. } | ExportError::DeliveryFailed(_) => {
                Self::ExportIoFailure(err.to_string())
            }
        }
    }
}

impl From<crate::store::StoreError> for SignalError {
    fn from(err: crate::store::StoreError) -> Self {
        Self::PersistenceError(err.to_string())
    }
}

impl From<crate::config::ConfigError> for SignalError {
    fn from(err: crate::config::ConfigError) -> Self {
        use crate::config::ConfigError;
        match err {
            ConfigError::NotFound(path) => {
                Self::PersistenceError(format!("Configuration file not found: {path}"))
            }
            ConfigError::ReadError { .. } | ConfigError::WriteError { .. } => {
                Self::PersistenceError(err.to_string())
            }
            ConfigError::ParseError(e) => Self::ConfigParseError(e.to_string()),
            ConfigError::SerializeError(e) => Self::ConfigParseError(e.to_string()),
            ConfigError::LoadError(e) => Self::ConfigParseError(e.to_string()),
            ConfigError::ValidationError { field, message } => {
                Self::ConfigValidationError(format!("{field}: {message}"))
            }
            ConfigError::MultipleValidationErrors(errors) => {
                let messages: Vec<String> = errors.into_iter().map(|e| e.to_string()).collect();
                Self::ConfigValidationError(messages.join("; "))
            }
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
