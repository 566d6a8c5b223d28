//! Error types
//!
//! Nothing here is fatal to the control loop. Configuration and control
//! errors are returned to the caller of a setter; sensor faults are absorbed
//! by the sensor field and surface only as degraded flags.

use thiserror::Error;

/// A configuration value was rejected. The previous configuration stays in effect.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    /// Gate thresholds must satisfy `0 <= low < high <= 1`.
    #[error("invalid gate thresholds: high={high} must be > low={low}, both within [0, 1]")]
    InvalidThresholds { high: f32, low: f32 },

    /// A scalar parameter fell outside its documented range.
    #[error("{name} = {value} outside [{min}, {max}]")]
    OutOfRange {
        name: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    /// The integration step could advance a phase by more than π.
    #[error("integration step too large: dt * max_velocity = {advance} rad (must be < π)")]
    StepTooLarge { advance: f32 },

    /// A per-channel table does not match the channel count.
    #[error("{name} has {actual} entries, expected {expected}")]
    ChannelCountMismatch {
        name: &'static str,
        expected: usize,
        actual: usize,
    },

    /// Boundary tables must be strictly increasing.
    #[error("{name} must be strictly increasing within [0, 1]")]
    NotMonotonic { name: &'static str },

    /// TOML document could not be parsed.
    #[error("config parse error: {0}")]
    Parse(String),
}

impl ConfigError {
    pub(crate) fn out_of_range(name: &'static str, value: impl Into<f64>, min: f64, max: f64) -> Self {
        Self::OutOfRange {
            name,
            value: value.into(),
            min,
            max,
        }
    }
}

/// Check `value` against an inclusive range.
pub(crate) fn check_range(
    name: &'static str,
    value: f32,
    min: f32,
    max: f32,
) -> Result<(), ConfigError> {
    if value.is_finite() && (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::out_of_range(name, value, min as f64, max as f64))
    }
}

/// A single channel failed to produce a usable reading this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SensorFault {
    /// The bus transaction for the channel failed.
    #[error("channel {channel}: read failed")]
    ReadFailed { channel: usize },

    /// The channel returned a value outside the plausible raw range.
    #[error("channel {channel}: raw value {raw} out of range")]
    OutOfRange { channel: usize, raw: u16 },
}

/// A control command was rejected before it was queued.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ControlError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Maintenance operations are disabled in this build's configuration.
    #[error("maintenance access is disabled")]
    MaintenanceDisabled,

    /// A calibration run is already collecting samples.
    #[error("calibration already in progress")]
    CalibrationInProgress,

    /// Calibration needs at least one sample.
    #[error("calibration sample count must be > 0")]
    InvalidSampleCount,
}
