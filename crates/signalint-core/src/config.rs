//! Application configuration management.
//!
//! Handles loading, saving, and validating signalint configuration including:
//! - Radio backend and scan defaults
//! - Distance model calibration
//! - Roster search debounce
//! - GATT identifiers and connect timeout for sessions
//! - Export timezone, directory and status reset
//! - Storage location and HTTP bind address
//!
//! Configuration is read from an optional TOML file layered with environment
//! variables of the form `SIGNALINT__SECTION__KEY` (for example
//! `SIGNALINT__SERVER__PORT=8080`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono_tz::Tz;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::distance::PathLossModel;
use crate::export::ExportOptions;
use crate::roster::RosterOptions;
use crate::session::{GattProfile, SessionOptions};

/// Prefix of configuration environment variables.
pub const ENV_PREFIX: &str = "SIGNALINT";

static MAC_ADDRESS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([0-9A-Fa-f]{2}:){5}[0-9A-Fa-f]{2}$").expect("MAC address pattern is valid")
});

/// Errors raised while loading, saving or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No configuration file at the given path.
    #[error("Configuration file not found: {0}")]
    NotFound(String),

    /// The configuration file could not be read.
    #[error("Failed to read {path}: {source}")]
    ReadError {
        /// File that failed.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file could not be written.
    #[error("Failed to write {path}: {source}")]
    WriteError {
        /// File that failed.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The TOML document is malformed.
    #[error("Failed to parse configuration: {0}")]
    ParseError(#[from] toml::de::Error),

    /// The configuration could not be encoded as TOML.
    #[error("Failed to serialize configuration: {0}")]
    SerializeError(#[from] toml::ser::Error),

    /// Layering file and environment sources failed.
    #[error("Failed to load configuration: {0}")]
    LoadError(#[from] config::ConfigError),

    /// A single field has an invalid value.
    #[error("Invalid {field}: {message}")]
    ValidationError {
        /// Dotted path of the field.
        field: String,
        /// What is wrong with it.
        message: String,
    },

    /// Several fields have invalid values.
    #[error("{} validation errors", .0.len())]
    MultipleValidationErrors(Vec<ConfigError>),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Radio backend used for scans and sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RadioBackend {
    /// Synthetic emitters, no hardware needed.
    #[default]
    Simulated,
    /// BlueZ over D-Bus (requires the `bluetooth` feature).
    Bluez,
}

/// Main application configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Scanning.
    pub scan: ScanConfig,
    /// Distance model.
    pub distance: PathLossModel,
    /// Roster aggregation.
    pub roster: RosterConfig,
    /// Connection sessions.
    pub session: SessionConfig,
    /// CSV export.
    pub export: ExportConfig,
    /// Persistence.
    pub storage: StorageConfig,
    /// HTTP server.
    pub server: ServerConfig,
}

/// Scan settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Radio backend.
    pub backend: RadioBackend,
    /// Duration of a scan started without an explicit duration. 0 scans until stopped.
    pub default_duration_secs: u64,
    /// Capacity of the channel between platform and ingestion.
    pub buffer: usize,
    /// Interval between simulated advertisement bursts.
    pub simulated_interval_ms: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            backend: RadioBackend::Simulated,
            default_duration_secs: 10,
            buffer: crate::scan::DEFAULT_SCAN_BUFFER,
            simulated_interval_ms: 1000,
        }
    }
}

impl ScanConfig {
    /// Default scan duration, `None` for unlimited.
    #[must_use]
    pub const fn default_duration(&self) -> Option<Duration> {
        if self.default_duration_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.default_duration_secs))
        }
    }
}

/// Roster settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RosterConfig {
    /// Delay before search text is applied.
    pub search_debounce_ms: u64,
}

impl Default for RosterConfig {
    fn default() -> Self {
        Self {
            search_debounce_ms: 300,
        }
    }
}

/// Session settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Service carrying the message characteristics.
    pub service_uuid: Uuid,
    /// Characteristic inbound messages are notified on.
    pub read_characteristic_uuid: Uuid,
    /// Characteristic outbound messages are written to.
    pub write_characteristic_uuid: Uuid,
    /// Descriptor written to enable notifications.
    pub notify_descriptor_uuid: Uuid,
    /// Connect timeout. 0 waits indefinitely.
    pub connect_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let profile = GattProfile::default();
        Self {
            service_uuid: profile.service,
            read_characteristic_uuid: profile.read_characteristic,
            write_characteristic_uuid: profile.write_characteristic,
            notify_descriptor_uuid: profile.notify_descriptor,
            connect_timeout_secs: 15,
        }
    }
}

impl SessionConfig {
    /// GATT identifiers as a profile.
    #[must_use]
    pub const fn profile(&self) -> GattProfile {
        GattProfile {
            service: self.service_uuid,
            read_characteristic: self.read_characteristic_uuid,
            write_characteristic: self.write_characteristic_uuid,
            notify_descriptor: self.notify_descriptor_uuid,
        }
    }
}

/// Export settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// Timezone of the human-readable time column.
    #[serde(with = "timezone_serde")]
    pub timezone: Tz,
    /// Delay before the export status returns to idle.
    pub status_reset_ms: u64,
    /// Directory exports are written to. Defaults to `<data_dir>/exports`.
    pub directory: Option<PathBuf>,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            timezone: chrono_tz::UTC,
            status_reset_ms: 2000,
            directory: None,
        }
    }
}

/// Storage settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding observation logs and alias tables.
    pub data_dir: PathBuf,
    /// Keep everything in memory instead.
    pub in_memory: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: crate::store::default_data_dir(),
            in_memory: false,
        }
    }
}

/// HTTP server settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address.
    pub host: String,
    /// Bind port.
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
        }
    }
}

impl Config {
    /// Load configuration from `path` (if it exists) and the environment, then validate.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be parsed or validation fails.
    pub fn load_or_default(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let builder = config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            );

        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the default path and the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be parsed or validation fails.
    pub fn load() -> ConfigResult<Self> {
        Self::load_or_default(Self::config_path())
    }

    /// Parse and validate a TOML document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is malformed or invalid.
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to `path` as pretty TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, path: impl AsRef<Path>) -> ConfigResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::WriteError {
                path: parent.display().to_string(),
                source,
            })?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|source| ConfigError::WriteError {
            path: path.display().to_string(),
            source,
        })
    }

    /// Check every field, collecting all problems.
    ///
    /// # Errors
    ///
    /// Returns the single problem, or [`ConfigError::MultipleValidationErrors`].
    pub fn validate(&self) -> ConfigResult<()> {
        let mut errors = Vec::new();
        let mut invalid = |field: &str, message: String| {
            errors.push(ConfigError::ValidationError {
                field: field.to_string(),
                message,
            });
        };

        let exponent = self.distance.path_loss_exponent;
        if !exponent.is_finite() || exponent <= 0.0 {
            invalid(
                "distance.path_loss_exponent",
                format!("must be a positive number, got {exponent}"),
            );
        }
        if !(-100..=0).contains(&self.distance.reference_power_dbm) {
            invalid(
                "distance.reference_power_dbm",
                format!(
                    "must be between -100 and 0 dBm, got {}",
                    self.distance.reference_power_dbm
                ),
            );
        }
        if self.scan.buffer == 0 {
            invalid("scan.buffer", "must be at least 1".to_string());
        }
        if self.scan.simulated_interval_ms == 0 {
            invalid("scan.simulated_interval_ms", "must be at least 1".to_string());
        }
        if self.roster.search_debounce_ms > 10_000 {
            invalid(
                "roster.search_debounce_ms",
                format!("must be at most 10000, got {}", self.roster.search_debounce_ms),
            );
        }
        if self.session.connect_timeout_secs > 300 {
            invalid(
                "session.connect_timeout_secs",
                format!("must be at most 300, got {}", self.session.connect_timeout_secs),
            );
        }
        if self.session.read_characteristic_uuid.is_nil()
            || self.session.write_characteristic_uuid.is_nil()
        {
            invalid(
                "session",
                "characteristic UUIDs must not be nil".to_string(),
            );
        }
        if self.server.host.trim().is_empty() {
            invalid("server.host", "must not be empty".to_string());
        }
        if self.server.port == 0 {
            invalid("server.port", "must not be 0".to_string());
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ConfigError::MultipleValidationErrors(errors)),
        }
    }

    /// Roster options derived from this configuration.
    #[must_use]
    pub const fn roster_options(&self) -> RosterOptions {
        RosterOptions {
            debounce: Duration::from_millis(self.roster.search_debounce_ms),
            model: self.distance,
        }
    }

    /// Session options derived from this configuration.
    #[must_use]
    pub const fn session_options(&self) -> SessionOptions {
        SessionOptions {
            profile: self.session.profile(),
            connect_timeout: if self.session.connect_timeout_secs == 0 {
                None
            } else {
                Some(Duration::from_secs(self.session.connect_timeout_secs))
            },
        }
    }

    /// Export options derived from this configuration.
    #[must_use]
    pub const fn export_options(&self) -> ExportOptions {
        ExportOptions {
            model: self.distance,
            timezone: self.export.timezone,
            status_reset: Duration::from_millis(self.export.status_reset_ms),
        }
    }

    /// Directory exports are written to.
    #[must_use]
    pub fn export_dir(&self) -> PathBuf {
        self.export
            .directory
            .clone()
            .unwrap_or_else(|| self.storage.data_dir.join("exports"))
    }

    /// Get the configuration file path.
    #[must_use]
    pub fn config_path() -> PathBuf {
        // On Linux hosts: /etc/signalint/config.toml
        // Elsewhere: the platform config directory
        #[cfg(target_os = "linux")]
        {
            PathBuf::from("/etc/signalint/config.toml")
        }
        #[cfg(not(target_os = "linux"))]
        {
            directories::ProjectDirs::from("", "", "signalint").map_or_else(
                || PathBuf::from("config.toml"),
                |dirs| dirs.config_dir().join("config.toml"),
            )
        }
    }
}

/// Whether `address` is a colon-separated 48-bit hardware address.
#[must_use]
pub fn is_valid_mac_address(address: &str) -> bool {
    MAC_ADDRESS_RE.is_match(address)
}

/// Whether `timezone` is a known IANA timezone name.
#[must_use]
pub fn is_valid_timezone_format(timezone: &str) -> bool {
    timezone.parse::<Tz>().is_ok()
}

mod timezone_serde {
    use chrono_tz::Tz;
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(tz: &Tz, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(tz.name())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Tz, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.scan.default_duration(), Some(Duration::from_secs(10)));
        assert_eq!(config.roster_options().debounce, Duration::from_millis(300));
        assert_eq!(
            config.session_options().connect_timeout,
            Some(Duration::from_secs(15))
        );
        assert_eq!(config.session.profile(), GattProfile::default());
        assert_eq!(config.export_options().status_reset, Duration::from_millis(2000));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml_str(
            r#"
            [distance]
            path_loss_exponent = 3.0

            [export]
            timezone = "Europe/Berlin"
            "#,
        )
        .unwrap();

        assert!((config.distance.path_loss_exponent - 3.0).abs() < f64::EPSILON);
        assert_eq!(config.distance.reference_power_dbm, -59);
        assert_eq!(config.export.timezone, chrono_tz::Europe::Berlin);
        assert_eq!(config.server.port, 3000);
    }

    #[test]
    fn test_unknown_timezone_is_a_parse_error() {
        let err = Config::from_toml_str("[export]\ntimezone = \"Mars/Olympus\"").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn test_validation_collects_every_problem() {
        let mut config = Config::default();
        config.distance.path_loss_exponent = 0.0;
        config.distance.reference_power_dbm = 10;
        config.server.port = 0;

        match config.validate() {
            Err(ConfigError::MultipleValidationErrors(errors)) => assert_eq!(errors.len(), 3),
            other => panic!("expected multiple errors, got {other:?}"),
        }
    }

    #[test]
    fn test_single_validation_error_is_not_wrapped() {
        let mut config = Config::default();
        config.distance.path_loss_exponent = f64::NAN;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError { field, .. }) if field == "distance.path_loss_exponent"
        ));
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.scan.backend = RadioBackend::Bluez;
        config.storage.data_dir = temp.path().join("data");
        config.save(&path).unwrap();

        let loaded = Config::load_or_default(&path).unwrap();
        assert_eq!(loaded.scan.backend, RadioBackend::Bluez);
        assert_eq!(loaded.storage.data_dir, temp.path().join("data"));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let temp = TempDir::new().unwrap();
        let config = Config::load_or_default(temp.path().join("absent.toml")).unwrap();
        assert_eq!(config.roster.search_debounce_ms, 300);
    }

    #[test]
    fn test_zero_durations_disable_limits() {
        let mut config = Config::default();
        config.scan.default_duration_secs = 0;
        config.session.connect_timeout_secs = 0;
        assert_eq!(config.scan.default_duration(), None);
        assert_eq!(config.session_options().connect_timeout, None);
    }

    #[test]
    fn test_mac_address_validation() {
        assert!(is_valid_mac_address("AA:BB:CC:DD:EE:FF"));
        assert!(is_valid_mac_address("aa:bb:cc:00:11:22"));
        assert!(!is_valid_mac_address("AA:BB:CC:DD:EE"));
        assert!(!is_valid_mac_address("AA-BB-CC-DD-EE-FF"));
        assert!(!is_valid_mac_address("GG:BB:CC:DD:EE:FF"));
    }

    #[test]
    fn test_timezone_validation() {
        assert!(is_valid_timezone_format("UTC"));
        assert!(is_valid_timezone_format("America/New_York"));
        assert!(!is_valid_timezone_format("Not/AZone"));
    }
}
