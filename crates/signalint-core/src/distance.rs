//! RSSI to distance estimation.
//!
//! Uses the log-distance path-loss model:
//!
//! ```text
//! distance = 10 ^ ((reference_power - rssi) / (10 * path_loss_exponent))
//! ```
//!
//! A reading of exactly 0 dBm means the radio had no valid sample and maps to
//! [`UNKNOWN_DISTANCE`]. The same [`PathLossModel`] value must be used
//! everywhere a distance is shown or exported.

use serde::{Deserialize, Serialize};

/// Measured power at one metre, in dBm.
pub const DEFAULT_REFERENCE_POWER_DBM: i16 = -59;

/// Free-space path-loss exponent.
pub const DEFAULT_PATH_LOSS_EXPONENT: f64 = 2.0;

/// Sentinel returned when no distance can be estimated.
pub const UNKNOWN_DISTANCE: f64 = -1.0;

/// Calibration constants for the path-loss model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathLossModel {
    /// Expected RSSI at one metre, in dBm.
    pub reference_power_dbm: i16,

    /// Environment-dependent attenuation exponent (2.0 in free space).
    pub path_loss_exponent: f64,
}

impl Default for PathLossModel {
    fn default() -> Self {
        Self {
            reference_power_dbm: DEFAULT_REFERENCE_POWER_DBM,
            path_loss_exponent: DEFAULT_PATH_LOSS_EXPONENT,
        }
    }
}

impl PathLossModel {
    /// Estimate the distance in metres for an RSSI reading.
    #[must_use]
    pub fn estimate(&self, rssi_dbm: i16) -> f64 {
        estimate_distance(rssi_dbm, self)
    }
}

/// Estimate the distance in metres for an RSSI reading.
///
/// Returns [`UNKNOWN_DISTANCE`] for a 0 dBm reading.
#[must_use]
pub fn estimate_distance(rssi_dbm: i16, model: &PathLossModel) -> f64 {
    if rssi_dbm == 0 {
        return UNKNOWN_DISTANCE;
    }
    let exponent = (f64::from(model.reference_power_dbm) - f64::from(rssi_dbm))
        / (10.0 * model.path_loss_exponent);
    10f64.powf(exponent)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_rssi_is_unknown() {
        assert!((estimate_distance(0, &PathLossModel::default()) - UNKNOWN_DISTANCE).abs() < f64::EPSILON);

        let tuned = PathLossModel {
            reference_power_dbm: -70,
            path_loss_exponent: 3.5,
        };
        assert!((tuned.estimate(0) - UNKNOWN_DISTANCE).abs() < f64::EPSILON);
    }

    #[test]
    fn test_reference_power_is_one_metre() {
        let model = PathLossModel::default();
        assert!((model.estimate(-59) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_known_values() {
        let model = PathLossModel::default();
        // -79 dBm is 20 dB below the reference: 10 ^ (20 / 20) = 10 m
        assert!((model.estimate(-79) - 10.0).abs() < 1e-9);
        // -70 dBm: 10 ^ 0.55
        assert!((model.estimate(-70) - 3.548_133_892).abs() < 1e-6);
    }

    #[test]
    fn test_monotonically_decreasing_in_rssi() {
        let model = PathLossModel::default();
        let readings: Vec<i16> = (-120..=20).filter(|r| *r != 0).collect();
        for pair in readings.windows(2) {
            let weaker = model.estimate(pair[0]);
            let stronger = model.estimate(pair[1]);
            assert!(
                stronger < weaker,
                "rssi {} -> {stronger}, rssi {} -> {weaker}",
                pair[1],
                pair[0]
            );
        }
    }

    #[test]
    fn test_exponent_scales_distance() {
        let free_space = PathLossModel::default();
        let indoor = PathLossModel {
            path_loss_exponent: 4.0,
            ..PathLossModel::default()
        };
        // With a larger exponent the same loss maps to a shorter distance.
        assert!(indoor.estimate(-80) < free_space.estimate(-80));
    }
}
