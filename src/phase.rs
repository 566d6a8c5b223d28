//! Phase classification - pure mapping from `z` to phase, tier, and density
//!
//! No state and no hysteresis at this layer. The same `z` always produces
//! the same classification; anything that needs memory of past values lives
//! in the crossing gate.

use serde::{Deserialize, Serialize};

use crate::config::PhaseConfig;

/// One of three ordered operating phases.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Phase {
    /// `z < low_boundary`
    Low = 0,
    /// `low_boundary <= z < high_boundary`
    Mid = 1,
    /// `z >= high_boundary`
    High = 2,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Low => "low",
            Phase::Mid => "mid",
            Phase::High => "high",
        }
    }
}

/// Classification result for one cycle.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PhaseState {
    pub phase: Phase,
    /// Sub-tier in `1..=9`.
    pub tier: u8,
    /// The clamped coordinate that was classified.
    pub z: f32,
}

/// Clamp into `[0, 1]`, mapping NaN to 0.
#[inline]
pub fn clamp_unit(z: f32) -> f32 {
    if z.is_nan() {
        0.0
    } else {
        z.clamp(0.0, 1.0)
    }
}

/// Maps `z` onto phases and tiers using fixed boundaries.
#[derive(Clone, Debug)]
pub struct PhaseClassifier {
    config: PhaseConfig,
}

impl PhaseClassifier {
    pub fn new(config: PhaseConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PhaseConfig {
        &self.config
    }

    /// Classify a coordinate. Input is clamped to `[0, 1]` first.
    pub fn classify(&self, z: f32) -> PhaseState {
        let z = clamp_unit(z);
        PhaseState {
            phase: self.phase_of(z),
            tier: self.tier_of(z),
            z,
        }
    }

    /// Phase for an already clamped `z`.
    pub fn phase_of(&self, z: f32) -> Phase {
        if z < self.config.low_boundary {
            Phase::Low
        } else if z < self.config.high_boundary {
            Phase::Mid
        } else {
            Phase::High
        }
    }

    /// Tier = 1 + number of interior boundaries at or below `z`.
    pub fn tier_of(&self, z: f32) -> u8 {
        let passed = self
            .config
            .tier_boundaries
            .iter()
            .filter(|&&b| b <= z)
            .count() as u8;
        (1 + passed).clamp(1, 9)
    }

    /// Peak-shaped density of `z`, exactly 1.0 at the upper phase boundary.
    pub fn density(&self, z: f32, width: f32) -> f32 {
        density(clamp_unit(z), self.config.high_boundary, width)
    }
}

/// `exp(-w · (z - peak)²)`
#[inline]
pub fn density(z: f32, peak: f32, width: f32) -> f32 {
    let d = z - peak;
    (-width * d * d).exp()
}
