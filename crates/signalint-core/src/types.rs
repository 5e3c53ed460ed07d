//! Shared domain types.
//!
//! Observations are split per [`RadioKind`]: BLE and WiFi sightings live in
//! independent logs, alias tables and rosters.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::distance::PathLossModel;

/// Radio technology an emitter was observed on.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum RadioKind {
    /// Bluetooth Low Energy peripherals.
    Ble,
    /// WiFi access points.
    Wifi,
}

impl RadioKind {
    /// All radio kinds, in a stable order.
    pub const ALL: [Self; 2] = [Self::Ble, Self::Wifi];

    /// Lowercase identifier used in paths and file names.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ble => "ble",
            Self::Wifi => "wifi",
        }
    }

    /// Label shown when an emitter broadcasts no name.
    #[must_use]
    pub const fn unknown_label(self) -> &'static str {
        match self {
            Self::Ble => "Unknown Device",
            Self::Wifi => "Hidden Network",
        }
    }
}

impl fmt::Display for RadioKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ble => f.write_str("BLE"),
            Self::Wifi => f.write_str("WiFi"),
        }
    }
}

/// Kind-specific part of an observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ObservationDetail {
    /// BLE sighting. Distance is derived from RSSI on read, never stored.
    Ble,
    /// WiFi sighting with its channel frequency.
    Wifi {
        /// Channel centre frequency in MHz.
        frequency_mhz: u32,
    },
}

/// One timestamped sighting of an emitter.
///
/// Observations are immutable once appended to a log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanObservation {
    /// Stable hardware address (BLE MAC or WiFi BSSID).
    pub identifier: String,

    /// Broadcast name or SSID. Empty when the emitter advertised none.
    pub label: String,

    /// Received signal strength in dBm.
    pub rssi_dbm: i16,

    /// When the sighting was recorded (millisecond precision).
    pub observed_at: DateTime<Utc>,

    /// Kind-specific payload.
    #[serde(flatten)]
    pub detail: ObservationDetail,
}

impl ScanObservation {
    /// Build a BLE observation.
    pub fn ble(
        identifier: impl Into<String>,
        label: impl Into<String>,
        rssi_dbm: i16,
        observed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            label: label.into(),
            rssi_dbm,
            observed_at: truncate_to_millis(observed_at),
            detail: ObservationDetail::Ble,
        }
    }

    /// Build a WiFi observation.
    pub fn wifi(
        identifier: impl Into<String>,
        label: impl Into<String>,
        rssi_dbm: i16,
        frequency_mhz: u32,
        observed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            label: label.into(),
            rssi_dbm,
            observed_at: truncate_to_millis(observed_at),
            detail: ObservationDetail::Wifi { frequency_mhz },
        }
    }

    /// Radio kind this observation belongs to.
    #[must_use]
    pub const fn kind(&self) -> RadioKind {
        match self.detail {
            ObservationDetail::Ble => RadioKind::Ble,
            ObservationDetail::Wifi { .. } => RadioKind::Wifi,
        }
    }

    /// Estimated distance in metres for BLE sightings, `None` for WiFi.
    #[must_use]
    pub fn estimated_distance(&self, model: &PathLossModel) -> Option<f64> {
        match self.detail {
            ObservationDetail::Ble => Some(model.estimate(self.rssi_dbm)),
            ObservationDetail::Wifi { .. } => None,
        }
    }

    /// Channel frequency for WiFi sightings, `None` for BLE.
    #[must_use]
    pub const fn frequency_mhz(&self) -> Option<u32> {
        match self.detail {
            ObservationDetail::Ble => None,
            ObservationDetail::Wifi { frequency_mhz } => Some(frequency_mhz),
        }
    }
}

/// Operator-assigned label for an identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Alias {
    /// Identifier the alias applies to.
    #[schema(example = "AA:BB:CC:DD:EE:FF")]
    pub identifier: String,

    /// Human-readable label.
    #[schema(example = "Hallway printer")]
    pub label: String,
}

/// A message exchanged over a connection session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct SessionMessage {
    /// Decoded message text.
    pub text: String,

    /// When the message was sent or received.
    pub at: DateTime<Utc>,

    /// `true` for outgoing messages, `false` for inbound notifications.
    pub sent: bool,
}

/// Drop sub-millisecond precision so that stored and exported timestamps agree.
fn truncate_to_millis(at: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(at.timestamp_millis()).unwrap_or(at)
}
