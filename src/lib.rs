//! Field Sync - real-time sensor field, crossing gate, and oscillator formation engine
//!
//! A fixed array of touch channels is polled every cycle and summarized into
//! a single coordinate `z ∈ [0, 1]`. Everything downstream reacts to `z`.
//!
//! # Core Types
//!
//! - **SensorField**: smoothed channels, active set, `z` and `theta`
//! - **PhaseClassifier**: pure mapping from `z` to phase, tier, and density
//! - **HysteresisGate**: three genuine crossings unlock, timeout restarts
//! - **OscillatorNetwork**: coupled phase oscillators and their order parameter
//! - **FormationDetector**: coherence + density + resonance conjunction
//! - **Scheduler**: one control loop running all of the above at fixed rates
//!
//! # Data Flow
//!
//! One direction per cycle:
//!
//! ```text
//! SensorField ──z──> PhaseClassifier ──> HysteresisGate
//!      │                    │
//!      │ (z, coupling)      │ density
//!      v                    v
//! OscillatorNetwork ──r──> FormationDetector <── resonance
//! ```
//!
//! The scheduler publishes an immutable [`Snapshot`] of all five states at a
//! lower rate. Publication downsampling only changes how often state is
//! seen, never the values.
//!
//! # Example
//!
//! ```rust
//! use field_sync::{EngineConfig, FrameSource, GateStatus, Scheduler};
//!
//! let mut engine = Scheduler::uncalibrated(EngineConfig::default()).unwrap();
//! let mut source = FrameSource::uniform(700);
//!
//! // First poll adopts the idle readings as baselines.
//! let snapshot = engine.tick(&mut source).expect("first cycle publishes");
//! assert_eq!(snapshot.sensor.active_count, 0);
//! assert_eq!(snapshot.gate.status, GateStatus::Armed);
//! ```
//!
//! # Control
//!
//! Commands are validated on [`Scheduler::submit`] and applied at the start
//! of the next cycle. Bypassing the crossing sequence needs a
//! [`MaintenanceKey`], which the scheduler only issues when maintenance is
//! enabled in its configuration.

mod coherence;
mod config;
mod error;
mod formation;
mod gate;
mod oscillator;
mod phase;
mod publish;
mod scheduler;
mod sensor;

pub use coherence::CoherenceWindow;
pub use config::{
    validate_thresholds, CoherenceSource, EngineConfig, FormationConfig, GateConfig,
    InitialSpread, OscillatorConfig, PhaseConfig, SchedulerConfig, SensorConfig, CHANNEL_COUNT,
    HEX_POSITIONS, OSCILLATOR_COUNT, PHI_INV, TIER_BOUNDARY_COUNT, Z_CRITICAL,
};
pub use error::{ConfigError, ControlError, SensorFault};
pub use formation::{FormationDetector, FormationState};
pub use gate::{GateEvent, GateState, GateStatus, HysteresisGate, MaintenanceKey, REQUIRED_CROSSINGS};
pub use oscillator::{order_parameter, wrap_angle, OscillatorNetwork, OscillatorState};
pub use phase::{clamp_unit, density, Phase, PhaseClassifier, PhaseState};
pub use publish::{
    ChannelObserver, Diagnostics, FnObserver, SharedSnapshot, Snapshot, SnapshotObserver,
};
pub use scheduler::{
    Clock, Command, MaintenanceCommand, ManualClock, MonotonicClock, RateDivider, Scheduler,
};
pub use sensor::{
    CalibrationRecord, ChannelCalibration, FrameSource, SensorField, SensorFieldState,
    SensorSource,
};
