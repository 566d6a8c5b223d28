//! Sensor field - polled channels smoothed into `z` and `theta`
//!
//! Each poll reads every channel once, normalizes it against the channel's
//! baseline, folds it into an exponential moving average, and compares the
//! average against the channel's activation threshold.
//!
//! ## Faults
//!
//! A channel that fails to read (or reads outside the plausible raw range)
//! is left out of this cycle's active set and its smoothed value is held.
//! After `degrade_after` consecutive faults it is marked degraded and stays
//! out of the active set and the centroid until the next calibration.
//! If every channel faults in one poll the state carries `bus_fault` for an
//! external supervisor; the poll itself never fails.
//!
//! ## Calibration
//!
//! Calibration samples one reading per channel per poll, so the control loop
//! keeps its cadence. When the run completes each channel gets
//! `baseline = mean` and `threshold = noise_floor + margin`.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{SensorConfig, CHANNEL_COUNT};
use crate::error::{ControlError, SensorFault};
use crate::oscillator::wrap_angle;

/// A bounded-latency source of raw channel readings.
///
/// Implementations must not block: one call is one bus transaction.
pub trait SensorSource {
    /// Read one channel's raw value.
    fn read_channel(&mut self, channel: usize) -> Result<u16, SensorFault>;

    /// Angle from a dedicated orientation sensor, if one is fitted.
    fn orientation(&mut self) -> Option<f32> {
        None
    }
}

/// Source backed by a frame the caller sets before each poll.
///
/// `None` entries read as failed channels.
#[derive(Clone, Debug)]
pub struct FrameSource {
    pub frame: [Option<u16>; CHANNEL_COUNT],
    pub orientation: Option<f32>,
}

impl FrameSource {
    /// All channels reading `raw`.
    pub fn uniform(raw: u16) -> Self {
        Self {
            frame: [Some(raw); CHANNEL_COUNT],
            orientation: None,
        }
    }
}

impl SensorSource for FrameSource {
    fn read_channel(&mut self, channel: usize) -> Result<u16, SensorFault> {
        self.frame
            .get(channel)
            .copied()
            .flatten()
            .ok_or(SensorFault::ReadFailed { channel })
    }

    fn orientation(&mut self) -> Option<f32> {
        self.orientation
    }
}

/// Per-channel calibration entry.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelCalibration {
    /// Raw reading with no field present. `None` adopts the first valid reading.
    pub baseline: Option<u16>,
    /// Normalized activation threshold.
    pub threshold: f32,
}

/// Calibration for every channel, loaded from and saved to external storage.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CalibrationRecord {
    pub channels: [ChannelCalibration; CHANNEL_COUNT],
}

impl CalibrationRecord {
    /// No baselines yet, every channel at `threshold`.
    pub fn uncalibrated(threshold: f32) -> Self {
        Self {
            channels: [ChannelCalibration {
                baseline: None,
                threshold,
            }; CHANNEL_COUNT],
        }
    }
}

/// Per-cycle sensor field output.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SensorFieldState {
    pub raw: [u16; CHANNEL_COUNT],
    pub smoothed: [f32; CHANNEL_COUNT],
    /// Bit `i` set when channel `i` is active.
    pub active_mask: u32,
    pub active_count: u8,
    /// Weighted active fraction in `[0, 1]`.
    pub z: f32,
    /// Angle in `[0, 2π)`.
    pub theta: f32,
    /// Channels that faulted this cycle.
    pub fault_mask: u32,
    /// Channels excluded until recalibrated.
    pub degraded_mask: u32,
    /// Every channel faulted this cycle.
    pub bus_fault: bool,
    pub calibrating: bool,
}

impl SensorFieldState {
    fn empty() -> Self {
        Self {
            raw: [0; CHANNEL_COUNT],
            smoothed: [0.0; CHANNEL_COUNT],
            active_mask: 0,
            active_count: 0,
            z: 0.0,
            theta: 0.0,
            fault_mask: 0,
            degraded_mask: 0,
            bus_fault: false,
            calibrating: false,
        }
    }

    pub fn is_active(&self, channel: usize) -> bool {
        self.active_mask & (1 << channel) != 0
    }

    pub fn is_degraded(&self, channel: usize) -> bool {
        self.degraded_mask & (1 << channel) != 0
    }
}

/// In-flight calibration accumulators.
#[derive(Clone, Debug)]
struct CalibrationRun {
    polls_remaining: u32,
    samples: [u32; CHANNEL_COUNT],
    sum: [u64; CHANNEL_COUNT],
    min: [u16; CHANNEL_COUNT],
    max: [u16; CHANNEL_COUNT],
}

impl CalibrationRun {
    fn new(polls: u32) -> Self {
        Self {
            polls_remaining: polls,
            samples: [0; CHANNEL_COUNT],
            sum: [0; CHANNEL_COUNT],
            min: [u16::MAX; CHANNEL_COUNT],
            max: [0; CHANNEL_COUNT],
        }
    }

    fn add(&mut self, channel: usize, raw: u16) {
        self.samples[channel] += 1;
        self.sum[channel] += raw as u64;
        self.min[channel] = self.min[channel].min(raw);
        self.max[channel] = self.max[channel].max(raw);
    }
}

/// Polled, smoothed sensor array.
#[derive(Clone, Debug)]
pub struct SensorField {
    config: SensorConfig,
    calibration: CalibrationRecord,
    state: SensorFieldState,
    consecutive_faults: [u8; CHANNEL_COUNT],
    run: Option<CalibrationRun>,
}

impl SensorField {
    /// Create a field with an externally loaded calibration record.
    pub fn new(config: SensorConfig, calibration: CalibrationRecord) -> Self {
        Self {
            config,
            calibration,
            state: SensorFieldState::empty(),
            consecutive_faults: [0; CHANNEL_COUNT],
            run: None,
        }
    }

    /// Create a field with no baselines and the default threshold everywhere.
    pub fn uncalibrated(config: SensorConfig) -> Self {
        let record = CalibrationRecord::uncalibrated(config.default_threshold);
        Self::new(config, record)
    }

    pub fn state(&self) -> &SensorFieldState {
        &self.state
    }

    pub fn config(&self) -> &SensorConfig {
        &self.config
    }

    pub fn calibration(&self) -> &CalibrationRecord {
        &self.calibration
    }

    pub fn is_calibrating(&self) -> bool {
        self.run.is_some()
    }

    // =========================================================================
    // POLLING
    // =========================================================================

    /// Read every channel once and recompute the field state.
    pub fn poll(&mut self, source: &mut dyn SensorSource) -> &SensorFieldState {
        let alpha = self.config.smoothing_alpha;
        let mut fault_mask = 0u32;

        for ch in 0..CHANNEL_COUNT {
            match self.read_checked(source, ch) {
                Ok(raw) => {
                    self.consecutive_faults[ch] = 0;
                    self.state.raw[ch] = raw;
                    if let Some(run) = self.run.as_mut() {
                        run.add(ch, raw);
                    }
                    let normalized = self.normalize(ch, raw);
                    let s = &mut self.state.smoothed[ch];
                    *s = alpha * normalized + (1.0 - alpha) * *s;
                }
                Err(fault) => {
                    fault_mask |= 1 << ch;
                    self.record_fault(ch, fault);
                }
            }
        }

        self.state.fault_mask = fault_mask;
        self.state.bus_fault = fault_mask.count_ones() as usize == CHANNEL_COUNT;
        self.update_activity();
        self.state.theta = match source.orientation() {
            Some(angle) if angle.is_finite() => wrap_angle(angle),
            _ => self.centroid_angle(),
        };

        self.advance_calibration();
        self.state.calibrating = self.run.is_some();
        &self.state
    }

    fn read_checked(&self, source: &mut dyn SensorSource, ch: usize) -> Result<u16, SensorFault> {
        let raw = source.read_channel(ch)?;
        if raw < self.config.raw_min || raw > self.config.raw_max {
            return Err(SensorFault::OutOfRange { channel: ch, raw });
        }
        Ok(raw)
    }

    fn record_fault(&mut self, ch: usize, fault: SensorFault) {
        let count = &mut self.consecutive_faults[ch];
        *count = count.saturating_add(1);
        let bit = 1u32 << ch;
        if *count >= self.config.degrade_after && self.state.degraded_mask & bit == 0 {
            self.state.degraded_mask |= bit;
            warn!(channel = ch, %fault, faults = *count, "sensor channel degraded");
        }
    }

    /// Touch lowers the reading, so activation is the drop below baseline.
    fn normalize(&mut self, ch: usize, raw: u16) -> f32 {
        let baseline = *self.calibration.channels[ch].baseline.get_or_insert(raw);
        let delta = baseline as f32 - raw as f32;
        (delta / self.config.full_scale as f32).clamp(0.0, 1.0)
    }

    fn update_activity(&mut self) {
        let excluded = self.state.fault_mask | self.state.degraded_mask;
        let mut mask = 0u32;
        let mut weighted = 0.0f32;
        for ch in 0..CHANNEL_COUNT {
            let bit = 1u32 << ch;
            if excluded & bit == 0
                && self.state.smoothed[ch] > self.calibration.channels[ch].threshold
            {
                mask |= bit;
                weighted += self.config.weights[ch];
            }
        }
        let total: f32 = self.config.weights.iter().sum();

        self.state.active_mask = mask;
        self.state.active_count = mask.count_ones() as u8;
        self.state.z = (weighted / total).clamp(0.0, 1.0);
    }

    /// Angle of the activity-weighted centroid of active channels.
    fn centroid_angle(&self) -> f32 {
        let (mut sx, mut sy, mut sw) = (0.0f32, 0.0f32, 0.0f32);
        for ch in 0..CHANNEL_COUNT {
            if !self.state.is_active(ch) {
                continue;
            }
            let w = self.state.smoothed[ch];
            let [x, y] = self.config.positions[ch];
            sx += x * w;
            sy += y * w;
            sw += w;
        }
        if sw <= f32::EPSILON {
            return 0.0;
        }
        let (cx, cy) = (sx / sw, sy / sw);
        if cx.hypot(cy) <= 1e-6 {
            return 0.0;
        }
        wrap_angle(cy.atan2(cx))
    }

    // =========================================================================
    // CALIBRATION
    // =========================================================================

    /// Start collecting `samples` polls of baseline data.
    pub fn begin_calibration(&mut self, samples: u32) -> Result<(), ControlError> {
        if samples == 0 {
            return Err(ControlError::InvalidSampleCount);
        }
        if self.run.is_some() {
            return Err(ControlError::CalibrationInProgress);
        }
        self.run = Some(CalibrationRun::new(samples));
        self.state.calibrating = true;
        Ok(())
    }

    /// Calibrate synchronously by polling `samples` times.
    pub fn calibrate(
        &mut self,
        source: &mut dyn SensorSource,
        samples: u32,
    ) -> Result<&CalibrationRecord, ControlError> {
        self.begin_calibration(samples)?;
        while self.run.is_some() {
            self.poll(source);
        }
        Ok(&self.calibration)
    }

    /// Abandon an in-flight calibration, keeping the previous record.
    pub fn cancel_calibration(&mut self) {
        self.run = None;
        self.state.calibrating = false;
    }

    /// Replace the calibration record (e.g. loaded from storage).
    ///
    /// A calibration in flight is abandoned so it cannot overwrite the record.
    pub fn load_calibration(&mut self, record: CalibrationRecord) {
        self.cancel_calibration();
        self.calibration = record;
        self.state.smoothed = [0.0; CHANNEL_COUNT];
        self.clear_degraded(u32::MAX);
    }

    fn advance_calibration(&mut self) {
        let Some(run) = self.run.as_mut() else {
            return;
        };
        run.polls_remaining = run.polls_remaining.saturating_sub(1);
        if run.polls_remaining > 0 {
            return;
        }
        let Some(run) = self.run.take() else {
            return;
        };

        let full_scale = self.config.full_scale as f32;
        let margin = self.config.calibration_margin;
        let mut recalibrated = 0u32;
        for ch in 0..CHANNEL_COUNT {
            let n = run.samples[ch];
            if n == 0 {
                continue;
            }
            let mean = (run.sum[ch] as f64 / n as f64) as f32;
            let spread = (run.max[ch] as f32 - mean).max(mean - run.min[ch] as f32);
            let noise_floor = (spread / full_scale).max(0.0);

            self.calibration.channels[ch] = ChannelCalibration {
                baseline: Some(mean.round() as u16),
                threshold: (noise_floor + margin).min(1.0),
            };
            self.state.smoothed[ch] = 0.0;
            recalibrated |= 1 << ch;
        }
        self.clear_degraded(recalibrated);
        info!(
            channels = recalibrated.count_ones(),
            still_degraded = self.state.degraded_mask.count_ones(),
            "sensor calibration complete"
        );
    }

    fn clear_degraded(&mut self, mask: u32) {
        for ch in 0..CHANNEL_COUNT {
            if mask & (1 << ch) != 0 {
                self.consecutive_faults[ch] = 0;
            }
        }
        self.state.degraded_mask &= !mask;
    }
}
