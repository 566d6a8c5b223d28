//! Crossing gate - hysteresis state machine over `z`
//!
//! Two thresholds control the sequence so that `z` hovering near a boundary
//! cannot chatter:
//!
//! - **high_threshold**: a crossing counts when `z` rises through it
//! - **low_threshold**: `z` must fall to or below it to re-arm
//!
//! Three crossings, each preceded by a re-arm, unlock the gate. The whole
//! sequence must finish within `timeout_ms` of the first arm, otherwise the
//! gate drops back to `Locked` and the count starts over. `Unlocked` is
//! terminal until an explicit reset.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{validate_thresholds, GateConfig};
use crate::error::ConfigError;
use crate::phase::clamp_unit;

/// Crossings needed to unlock.
pub const REQUIRED_CROSSINGS: u8 = 3;

/// Gate state machine position.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GateStatus {
    Locked,
    Armed,
    Crossed1,
    Crossed2,
    Unlocked,
}

/// What the last update did.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GateEvent {
    None,
    /// `z` fell to the low threshold; the next rising edge will count.
    Rearmed,
    /// A qualifying crossing short of unlock.
    RisingEdge,
    Unlocked,
    /// The sequence window elapsed; back to `Locked`.
    Timeout,
    Reset,
    ForcedUnlock,
}

/// Observable gate state.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GateState {
    pub status: GateStatus,
    pub crossing_count: u8,
    pub armed: bool,
    /// Set on the first arm of a fresh sequence.
    pub sequence_start_ms: Option<u64>,
    pub last_transition_ms: Option<u64>,
    pub unlocked_at_ms: Option<u64>,
    pub last_event: GateEvent,
}

impl GateState {
    fn locked() -> Self {
        Self {
            status: GateStatus::Locked,
            crossing_count: 0,
            armed: false,
            sequence_start_ms: None,
            last_transition_ms: None,
            unlocked_at_ms: None,
            last_event: GateEvent::None,
        }
    }

    pub fn is_unlocked(&self) -> bool {
        self.status == GateStatus::Unlocked
    }
}

/// Proof of maintenance access.
///
/// Only the scheduler can issue one, and only when maintenance is enabled in
/// its configuration. Operations that bypass the crossing sequence take it
/// by reference.
#[derive(Debug)]
pub struct MaintenanceKey {
    _private: (),
}

impl MaintenanceKey {
    pub(crate) fn issue() -> Self {
        Self { _private: () }
    }
}

/// Hysteresis crossing gate.
#[derive(Clone, Debug)]
pub struct HysteresisGate {
    config: GateConfig,
    state: GateState,
    prev_z: f32,
}

impl HysteresisGate {
    pub fn new(config: GateConfig) -> Self {
        Self {
            config,
            state: GateState::locked(),
            prev_z: 0.0,
        }
    }

    pub fn state(&self) -> &GateState {
        &self.state
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    pub fn is_unlocked(&self) -> bool {
        self.state.is_unlocked()
    }

    // =========================================================================
    // SEQUENCE
    // =========================================================================

    /// Feed one cycle's `z`. Returns what happened this cycle.
    pub fn update(&mut self, z: f32, now_ms: u64) -> GateEvent {
        let z = clamp_unit(z);
        let event = self.advance(z, now_ms);
        self.prev_z = z;
        if event != GateEvent::None {
            self.state.last_event = event;
        }
        event
    }

    fn advance(&mut self, z: f32, now_ms: u64) -> GateEvent {
        if self.state.status == GateStatus::Unlocked {
            return GateEvent::None;
        }

        if let Some(start) = self.state.sequence_start_ms {
            if now_ms.saturating_sub(start) > self.config.timeout_ms {
                debug!(
                    crossings = self.state.crossing_count,
                    elapsed_ms = now_ms - start,
                    "gate sequence timed out"
                );
                self.restart_sequence(Some(now_ms));
                return GateEvent::Timeout;
            }
        }

        if z <= self.config.low_threshold {
            if self.state.armed {
                return GateEvent::None;
            }
            self.state.armed = true;
            self.state.status = GateStatus::Armed;
            self.state.last_transition_ms = Some(now_ms);
            if self.state.sequence_start_ms.is_none() {
                self.state.sequence_start_ms = Some(now_ms);
            }
            return GateEvent::Rearmed;
        }

        let high = self.config.high_threshold;
        if self.state.armed && self.prev_z < high && z >= high {
            self.state.armed = false;
            self.state.crossing_count += 1;
            self.state.last_transition_ms = Some(now_ms);
            self.state.status = match self.state.crossing_count {
                1 => GateStatus::Crossed1,
                2 => GateStatus::Crossed2,
                _ => GateStatus::Unlocked,
            };
            debug!(crossings = self.state.crossing_count, z, "gate crossing");

            if self.state.status == GateStatus::Unlocked {
                self.state.unlocked_at_ms = Some(now_ms);
                info!(at_ms = now_ms, "gate unlocked");
                return GateEvent::Unlocked;
            }
            return GateEvent::RisingEdge;
        }

        GateEvent::None
    }

    fn restart_sequence(&mut self, now_ms: Option<u64>) {
        self.state.status = GateStatus::Locked;
        self.state.crossing_count = 0;
        self.state.armed = false;
        self.state.sequence_start_ms = None;
        self.state.unlocked_at_ms = None;
        self.state.last_transition_ms = now_ms;
    }

    // =========================================================================
    // CONTROL
    // =========================================================================

    /// Return to `Locked` with no crossings. Idempotent.
    pub fn reset(&mut self, now_ms: u64) {
        self.restart_sequence(Some(now_ms));
        self.state.last_event = GateEvent::Reset;
    }

    /// Replace the thresholds. Rejects `high <= low` and keeps the old pair.
    pub fn set_thresholds(&mut self, high: f32, low: f32) -> Result<(), ConfigError> {
        validate_thresholds(high, low)?;
        self.config.high_threshold = high;
        self.config.low_threshold = low;
        Ok(())
    }

    /// Jump straight to `Unlocked`, bypassing the crossing sequence.
    pub fn force_unlock(&mut self, _key: &MaintenanceKey, now_ms: u64) {
        self.state.status = GateStatus::Unlocked;
        self.state.crossing_count = REQUIRED_CROSSINGS;
        self.state.armed = false;
        self.state.unlocked_at_ms = Some(now_ms);
        self.state.last_transition_ms = Some(now_ms);
        self.state.last_event = GateEvent::ForcedUnlock;
        info!(at_ms = now_ms, "gate force-unlocked via maintenance access");
    }

    /// Time spent unlocked, zero while locked.
    pub fn unlock_duration_ms(&self, now_ms: u64) -> u64 {
        self.state
            .unlocked_at_ms
            .map_or(0, |at| now_ms.saturating_sub(at))
    }
}
