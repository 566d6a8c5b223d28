//! Engine configuration
//!
//! Every record deserializes from TOML with per-field defaults, so a partial
//! document only overrides what it names. `validate()` is the single gate
//! between a parsed document and a running engine.

use serde::{Deserialize, Serialize};
use std::f32::consts::PI;

use crate::error::{check_range, ConfigError};

/// Number of discrete sensor channels in the field.
pub const CHANNEL_COUNT: usize = 19;

/// Number of coupled phase oscillators.
pub const OSCILLATOR_COUNT: usize = 8;

/// Interior boundaries separating the nine tiers.
pub const TIER_BOUNDARY_COUNT: usize = 8;

/// Inverse golden ratio, the lower phase boundary.
pub const PHI_INV: f32 = 0.618_034;

/// √3/2, the upper phase boundary where density peaks.
pub const Z_CRITICAL: f32 = 0.866_025_4;

/// Cartesian positions of the 19 channels on a unit-spaced hexagonal layout
/// (rows of 3, 4, 5, 4, 3; channel 9 at the center).
pub const HEX_POSITIONS: [[f32; 2]; CHANNEL_COUNT] = [
    [-0.866, -1.5],
    [0.000, -1.5],
    [0.866, -1.5],
    [-1.299, -0.75],
    [-0.433, -0.75],
    [0.433, -0.75],
    [1.299, -0.75],
    [-1.732, 0.0],
    [-0.866, 0.0],
    [0.000, 0.0],
    [0.866, 0.0],
    [1.732, 0.0],
    [-1.299, 0.75],
    [-0.433, 0.75],
    [0.433, 0.75],
    [1.299, 0.75],
    [-0.866, 1.5],
    [0.000, 1.5],
    [0.866, 1.5],
];

// =========================================================================
// SENSOR FIELD
// =========================================================================

/// Sensor field acquisition and smoothing parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    /// EMA smoothing factor, exclusive (0, 1). Higher follows the input faster.
    pub smoothing_alpha: f32,

    /// Activation threshold for channels without a calibrated one.
    pub default_threshold: f32,

    /// Raw counts below baseline that map to a normalized reading of 1.0.
    pub full_scale: u16,

    /// Smallest plausible raw reading.
    pub raw_min: u16,

    /// Largest plausible raw reading.
    pub raw_max: u16,

    /// Margin added to the observed noise floor during calibration.
    pub calibration_margin: f32,

    /// Consecutive faults before a channel is marked degraded.
    pub degrade_after: u8,

    /// Per-channel contribution to `z`. Equal weights give `activeCount / N`.
    pub weights: [f32; CHANNEL_COUNT],

    /// Per-channel layout positions used for the angular centroid.
    pub positions: [[f32; 2]; CHANNEL_COUNT],
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            smoothing_alpha: 0.3,
            default_threshold: 0.15,
            full_scale: 100,
            raw_min: 1,
            raw_max: 1023,
            calibration_margin: 0.1,
            degrade_after: 3,
            weights: [1.0; CHANNEL_COUNT],
            positions: HEX_POSITIONS,
        }
    }
}

impl SensorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.smoothing_alpha > 0.0 && self.smoothing_alpha < 1.0) {
            return Err(ConfigError::out_of_range(
                "sensor.smoothing_alpha",
                self.smoothing_alpha,
                0.0,
                1.0,
            ));
        }
        check_range("sensor.default_threshold", self.default_threshold, 0.0, 1.0)?;
        check_range("sensor.calibration_margin", self.calibration_margin, 0.0, 0.99)?;
        if self.full_scale == 0 {
            return Err(ConfigError::out_of_range(
                "sensor.full_scale",
                self.full_scale,
                1.0,
                u16::MAX as f64,
            ));
        }
        if self.raw_min >= self.raw_max {
            return Err(ConfigError::out_of_range(
                "sensor.raw_min",
                self.raw_min,
                0.0,
                self.raw_max as f64 - 1.0,
            ));
        }
        if self.degrade_after == 0 {
            return Err(ConfigError::out_of_range(
                "sensor.degrade_after",
                self.degrade_after,
                1.0,
                u8::MAX as f64,
            ));
        }
        for &w in &self.weights {
            check_range("sensor.weights", w, 0.0, f32::MAX)?;
        }
        if self.weights.iter().sum::<f32>() <= 0.0 {
            return Err(ConfigError::out_of_range("sensor.weights (sum)", 0.0f32, f64::MIN_POSITIVE, f64::MAX));
        }
        Ok(())
    }
}

// =========================================================================
// PHASE CLASSIFICATION
// =========================================================================

/// Fixed boundaries for phase and tier classification.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseConfig {
    /// Boundary between phase 0 and phase 1.
    pub low_boundary: f32,

    /// Boundary between phase 1 and phase 2.
    pub high_boundary: f32,

    /// Strictly increasing interior tier boundaries.
    pub tier_boundaries: [f32; TIER_BOUNDARY_COUNT],
}

impl Default for PhaseConfig {
    fn default() -> Self {
        Self {
            low_boundary: PHI_INV,
            high_boundary: Z_CRITICAL,
            tier_boundaries: [0.10, 0.20, 0.45, 0.65, 0.75, Z_CRITICAL, 0.92, 0.97],
        }
    }
}

impl PhaseConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range("phase.low_boundary", self.low_boundary, 0.0, 1.0)?;
        check_range("phase.high_boundary", self.high_boundary, 0.0, 1.0)?;
        if self.low_boundary >= self.high_boundary {
            return Err(ConfigError::NotMonotonic {
                name: "phase boundaries",
            });
        }
        let in_unit = self
            .tier_boundaries
            .iter()
            .all(|b| b.is_finite() && (0.0..=1.0).contains(b));
        let increasing = self.tier_boundaries.windows(2).all(|w| w[0] < w[1]);
        if !(in_unit && increasing) {
            return Err(ConfigError::NotMonotonic {
                name: "phase.tier_boundaries",
            });
        }
        Ok(())
    }
}

// =========================================================================
// HYSTERESIS GATE
// =========================================================================

/// Crossing gate thresholds and sequence timeout.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Rising-edge threshold. A crossing counts when `z` rises through it.
    pub high_threshold: f32,

    /// Re-arm threshold. `z` must fall to or below it between crossings.
    pub low_threshold: f32,

    /// Window from the first arm of a sequence to unlock.
    pub timeout_ms: u64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            high_threshold: 0.85,
            low_threshold: 0.82,
            timeout_ms: 5_000,
        }
    }
}

impl GateConfig {
    /// Create a gate configuration, rejecting `high <= low`.
    pub fn new(high: f32, low: f32, timeout_ms: u64) -> Result<Self, ConfigError> {
        let config = Self {
            high_threshold: high,
            low_threshold: low,
            timeout_ms,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_thresholds(self.high_threshold, self.low_threshold)?;
        if self.timeout_ms == 0 {
            return Err(ConfigError::out_of_range(
                "gate.timeout_ms",
                0.0f32,
                1.0,
                u64::MAX as f64,
            ));
        }
        Ok(())
    }
}

/// Check a high/low threshold pair.
pub fn validate_thresholds(high: f32, low: f32) -> Result<(), ConfigError> {
    let in_unit = |v: f32| v.is_finite() && (0.0..=1.0).contains(&v);
    if in_unit(high) && in_unit(low) && high > low {
        Ok(())
    } else {
        Err(ConfigError::InvalidThresholds { high, low })
    }
}

// =========================================================================
// OSCILLATOR NETWORK
// =========================================================================

/// How phases are laid out on construction and reset.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InitialSpread {
    /// `θᵢ = 2πi/M`, which puts the order parameter at zero.
    Even,
    /// Uniform random phases from a seeded generator.
    Random { seed: u64 },
}

/// Coupled oscillator integration parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OscillatorConfig {
    /// Fixed integration step in seconds.
    pub dt_s: f32,

    /// Center natural frequency in Hz.
    pub base_frequency_hz: f32,

    /// Fractional detune per oscillator index around the center.
    pub detune: f32,

    /// Explicit natural frequencies in rad/s, overriding base/detune.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub natural_frequencies: Option<[f32; OSCILLATOR_COUNT]>,

    /// Initial coupling K.
    pub coupling: f32,

    /// Lower clamp for K.
    pub coupling_min: f32,

    /// Upper clamp for K.
    pub coupling_max: f32,

    /// Order parameter at or above which the network counts as synchronized.
    pub sync_threshold: f32,

    /// Phase layout on construction and reset.
    pub initial_spread: InitialSpread,
}

impl Default for OscillatorConfig {
    fn default() -> Self {
        Self {
            dt_s: 0.001,
            base_frequency_hz: 10.0,
            detune: 0.01,
            natural_frequencies: None,
            coupling: 0.3514,
            coupling_min: 0.0,
            coupling_max: 1.0,
            sync_threshold: 0.92,
            initial_spread: InitialSpread::Even,
        }
    }
}

impl OscillatorConfig {
    /// Natural frequencies ωᵢ in rad/s.
    pub fn natural_frequencies(&self) -> [f32; OSCILLATOR_COUNT] {
        if let Some(omegas) = self.natural_frequencies {
            return omegas;
        }
        let half = (OSCILLATOR_COUNT / 2) as f32;
        let mut omegas = [0.0; OSCILLATOR_COUNT];
        for (i, omega) in omegas.iter_mut().enumerate() {
            let hz = self.base_frequency_hz * (1.0 + self.detune * (i as f32 - half));
            *omega = 2.0 * PI * hz;
        }
        omegas
    }

    /// Clamp a coupling value into the configured range.
    pub fn clamp_coupling(&self, k: f32) -> f32 {
        if k.is_nan() {
            return self.coupling_min;
        }
        k.clamp(self.coupling_min, self.coupling_max)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.dt_s.is_finite() && self.dt_s > 0.0) {
            return Err(ConfigError::out_of_range("oscillator.dt_s", self.dt_s, f64::MIN_POSITIVE, 1.0));
        }
        check_range("oscillator.coupling_min", self.coupling_min, 0.0, f32::MAX)?;
        check_range(
            "oscillator.coupling_max",
            self.coupling_max,
            self.coupling_min,
            f32::MAX,
        )?;
        if !self.coupling.is_finite() {
            return Err(ConfigError::out_of_range(
                "oscillator.coupling",
                self.coupling,
                self.coupling_min as f64,
                self.coupling_max as f64,
            ));
        }
        check_range("oscillator.sync_threshold", self.sync_threshold, 0.0, 1.0)?;

        // |dθ/dt| <= |ω| + K, since the mean of M sines is bounded by 1
        let max_omega = self
            .natural_frequencies()
            .iter()
            .map(|w| w.abs())
            .fold(0.0f32, f32::max);
        let advance = self.dt_s * (max_omega + self.coupling_max);
        if !advance.is_finite() || advance >= PI {
            return Err(ConfigError::StepTooLarge { advance });
        }
        Ok(())
    }
}

// =========================================================================
// FORMATION
// =========================================================================

/// Where the formation detector takes its coherence from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoherenceSource {
    /// The oscillator network's order parameter.
    Oscillator,
    /// `1 - k·σ` over a sliding window of smoothed channel readings.
    FieldVariance,
}

/// Formation thresholds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FormationConfig {
    /// κ: coherence must be at least this.
    pub kappa_threshold: f32,

    /// η: density must exceed this.
    pub eta_threshold: f32,

    /// R: active channel count must be at least this.
    pub resonance_threshold: u8,

    /// Width constant `w` of the density peak.
    pub density_width: f32,

    pub coherence_source: CoherenceSource,

    /// Samples in the field-variance coherence window.
    pub coherence_window: usize,
}

impl Default for FormationConfig {
    fn default() -> Self {
        Self {
            kappa_threshold: 0.92,
            eta_threshold: PHI_INV,
            resonance_threshold: 7,
            density_width: 36.0,
            coherence_source: CoherenceSource::Oscillator,
            coherence_window: 32,
        }
    }
}

impl FormationConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range("formation.kappa_threshold", self.kappa_threshold, 0.0, 1.0)?;
        check_range("formation.eta_threshold", self.eta_threshold, 0.0, 1.0)?;
        check_range(
            "formation.resonance_threshold",
            self.resonance_threshold as f32,
            1.0,
            CHANNEL_COUNT as f32,
        )?;
        if !(self.density_width.is_finite() && self.density_width > 0.0) {
            return Err(ConfigError::out_of_range(
                "formation.density_width",
                self.density_width,
                f64::MIN_POSITIVE,
                f64::MAX,
            ));
        }
        if self.coherence_window < 2 {
            return Err(ConfigError::out_of_range(
                "formation.coherence_window",
                self.coherence_window as f32,
                2.0,
                f64::MAX,
            ));
        }
        Ok(())
    }
}

// =========================================================================
// SCHEDULER
// =========================================================================

/// Loop rates and control-surface policy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Outer loop and sensor poll rate in Hz.
    pub loop_rate_hz: u32,

    /// Oscillator integration rate in Hz. Must be >= the loop rate.
    pub integration_rate_hz: u32,

    /// Snapshot publication rate in Hz. Must be <= the loop rate.
    pub publish_rate_hz: u32,

    /// Gain applied to `z` when driving the oscillator coupling from the field.
    /// Zero keeps K at its configured value.
    pub field_coupling_gain: f32,

    /// Allow issuing maintenance keys (force unlock).
    pub maintenance_enabled: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            loop_rate_hz: 100,
            integration_rate_hz: 1000,
            publish_rate_hz: 10,
            field_coupling_gain: 0.0,
            maintenance_enabled: false,
        }
    }
}

impl SchedulerConfig {
    /// Cycle budget in microseconds.
    pub fn cycle_budget_us(&self) -> u64 {
        1_000_000 / self.loop_rate_hz.max(1) as u64
    }

    /// Convert loop ticks to milliseconds of logical time.
    pub fn ticks_to_ms(&self, ticks: u64) -> u64 {
        ticks * 1000 / self.loop_rate_hz.max(1) as u64
    }

    /// Convert milliseconds to loop ticks (rounded).
    pub fn ms_to_ticks(&self, ms: u64) -> u64 {
        (ms * self.loop_rate_hz as u64 + 500) / 1000
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.loop_rate_hz == 0 || self.loop_rate_hz > 1_000_000 {
            return Err(ConfigError::out_of_range(
                "scheduler.loop_rate_hz",
                self.loop_rate_hz,
                1.0,
                1_000_000.0,
            ));
        }
        if self.integration_rate_hz < self.loop_rate_hz {
            return Err(ConfigError::out_of_range(
                "scheduler.integration_rate_hz",
                self.integration_rate_hz,
                self.loop_rate_hz as f64,
                u32::MAX as f64,
            ));
        }
        if self.publish_rate_hz == 0 || self.publish_rate_hz > self.loop_rate_hz {
            return Err(ConfigError::out_of_range(
                "scheduler.publish_rate_hz",
                self.publish_rate_hz,
                1.0,
                self.loop_rate_hz as f64,
            ));
        }
        check_range("scheduler.field_coupling_gain", self.field_coupling_gain, 0.0, f32::MAX)?;
        Ok(())
    }
}

// =========================================================================
// ENGINE
// =========================================================================

/// Complete engine configuration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub sensor: SensorConfig,
    pub phase: PhaseConfig,
    pub gate: GateConfig,
    pub oscillator: OscillatorConfig,
    pub formation: FormationConfig,
    pub scheduler: SchedulerConfig,
}

impl EngineConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Render as TOML.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Validate every section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.sensor.validate()?;
        self.phase.validate()?;
        self.gate.validate()?;
        self.oscillator.validate()?;
        self.formation.validate()?;
        self.scheduler.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_gate_rejects_inverted_thresholds() {
        assert_eq!(
            GateConfig::new(0.80, 0.85, 5000),
            Err(ConfigError::InvalidThresholds {
                high: 0.80,
                low: 0.85
            })
        );
        assert!(GateConfig::new(0.85, 0.85, 5000).is_err());
        assert!(GateConfig::new(1.2, 0.5, 5000).is_err());
        assert!(GateConfig::new(0.85, 0.82, 5000).is_ok());
    }

    #[test]
    fn test_step_too_large_rejected() {
        let config = OscillatorConfig {
            dt_s: 0.1,
            base_frequency_hz: 10.0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::StepTooLarge { .. })
        ));
    }

    #[test]
    fn test_natural_frequencies_centered() {
        let config = OscillatorConfig::default();
        let omegas = config.natural_frequencies();
        let center = 2.0 * PI * config.base_frequency_hz;
        assert!((omegas[OSCILLATOR_COUNT / 2] - center).abs() < 1e-3);
        assert!(omegas.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_partial_toml_overrides() {
        let text = r#"
            [gate]
            high_threshold = 0.9
            low_threshold = 0.7

            [scheduler]
            publish_rate_hz = 20
        "#;
        let config = EngineConfig::from_toml_str(text).unwrap();
        assert_eq!(config.gate.high_threshold, 0.9);
        assert_eq!(config.gate.timeout_ms, 5_000);
        assert_eq!(config.scheduler.publish_rate_hz, 20);
        assert_eq!(config.scheduler.loop_rate_hz, 100);
    }

    #[test]
    fn test_toml_rejects_invalid_section() {
        let text = r#"
            [gate]
            high_threshold = 0.5
            low_threshold = 0.7
        "#;
        assert!(matches!(
            EngineConfig::from_toml_str(text),
            Err(ConfigError::InvalidThresholds { .. })
        ));
    }

    #[test]
    fn test_toml_round_trip_preserves_config() {
        let config = EngineConfig::default();
        let text = config.to_toml_string().unwrap();
        assert_eq!(EngineConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn test_tick_time_conversion() {
        let config = SchedulerConfig::default();
        assert_eq!(config.ticks_to_ms(100), 1000);
        assert_eq!(config.ms_to_ticks(5000), 500);
        assert_eq!(config.cycle_budget_us(), 10_000);
    }
}
