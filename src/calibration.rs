//! Display value → raw stepper ticks
//!
//! A gauge's dial is rarely linear in stepper ticks, so each gauge carries a
//! table of `(display, raw)` anchor points. Lookups between anchors are
//! linearly interpolated; lookups outside the table saturate to the end
//! points.

use crate::error::{ConfigurationError, ValidationError};
use serde::{Deserialize, Serialize};

/// Generic 0..=100 table shipped as the client default
pub const DEFAULT_TABLE: [(f64, f64); 5] = [
    (0.0, 0.0),
    (25.0, 155.0),
    (50.0, 310.0),
    (75.0, 460.0),
    (100.0, 620.0),
];

/// Validated, read-only calibration table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<(f64, f64)>", into = "Vec<(f64, f64)>")]
pub struct CalibrationTable {
    points: Vec<(f64, f64)>,
}

impl CalibrationTable {
    /// Build a table; display values must be finite and non-decreasing
    pub fn new(points: Vec<(f64, f64)>) -> Result<Self, ConfigurationError> {
        if points.is_empty() {
            return Err(ConfigurationError::EmptyCalibrationTable);
        }
        for (index, &(display, raw)) in points.iter().enumerate() {
            if !display.is_finite() || !raw.is_finite() {
                return Err(ConfigurationError::NonFiniteCalibration { index });
            }
            if index > 0 && display < points[index - 1].0 {
                return Err(ConfigurationError::NonMonotonicCalibration { index });
            }
        }
        Ok(Self { points })
    }

    /// Map a display value to raw ticks, rounding half up
    ///
    /// NaN and infinities have no place on a dial and are rejected rather
    /// than saturated.
    pub fn map(&self, value: f64) -> Result<i64, ValidationError> {
        if !value.is_finite() {
            return Err(ValidationError::NonFiniteValue);
        }
        // `new` guarantees at least one point
        let first = self.points[0];
        let last = self.points[self.points.len() - 1];

        if value <= first.0 {
            return Ok(round_half_up(first.1));
        }
        if value >= last.0 {
            return Ok(round_half_up(last.1));
        }

        // First anchor at or above the value; exact hits resolve here
        let high = self
            .points
            .iter()
            .position(|&(display, _)| display >= value)
            .unwrap_or(self.points.len() - 1);
        let (high_display, high_raw) = self.points[high];
        if high_display == value {
            return Ok(round_half_up(high_raw));
        }

        let Some(low) = high.checked_sub(1) else {
            return Ok(round_half_up(high_raw));
        };
        let (low_display, low_raw) = self.points[low];
        let ticks_per_unit = (high_raw - low_raw) / (high_display - low_display);
        Ok(round_half_up(low_raw + (value - low_display) * ticks_per_unit))
    }
}

impl Default for CalibrationTable {
    fn default() -> Self {
        Self {
            points: DEFAULT_TABLE.to_vec(),
        }
    }
}

impl TryFrom<Vec<(f64, f64)>> for CalibrationTable {
    type Error = ConfigurationError;

    fn try_from(points: Vec<(f64, f64)>) -> Result<Self, Self::Error> {
        Self::new(points)
    }
}

impl From<CalibrationTable> for Vec<(f64, f64)> {
    fn from(table: CalibrationTable) -> Self {
        table.points
    }
}

fn round_half_up(x: f64) -> i64 {
    (x + 0.5).floor() as i64
}
