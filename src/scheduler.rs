//! Scheduler - the single control loop
//!
//! One call to [`Scheduler::tick`] is one outer cycle:
//!
//! 1. apply commands queued since the last cycle
//! 2. poll the sensor field
//! 3. classify `z`
//! 4. feed the crossing gate
//! 5. step the oscillator network (several integration steps per cycle)
//! 6. evaluate formation
//! 7. publish a snapshot when the publication divider fires
//!
//! ## Rates
//!
//! Rates are related by integer accumulators ([`RateDivider`]), never by
//! timers. Integration runs `integration_rate / loop_rate` steps per cycle
//! (carrying the remainder), publication fires once every
//! `loop_rate / publish_rate` cycles. Logical time is derived from the tick
//! count, so the state machine behaves the same on hardware and in tests.
//!
//! The wall clock is only used to measure cycle duration for overrun
//! diagnostics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::coherence::CoherenceWindow;
use crate::config::{validate_thresholds, CoherenceSource, EngineConfig, SchedulerConfig};
use crate::error::{ConfigError, ControlError};
use crate::formation::FormationDetector;
use crate::gate::{HysteresisGate, MaintenanceKey};
use crate::oscillator::OscillatorNetwork;
use crate::phase::{Phase, PhaseClassifier};
use crate::publish::{Diagnostics, Publisher, SharedSnapshot, Snapshot, SnapshotObserver};
use crate::sensor::{CalibrationRecord, SensorField, SensorSource};

// =========================================================================
// CLOCKS
// =========================================================================

/// Microsecond clock used for cycle timing.
pub trait Clock: Send {
    fn now_us(&self) -> u64;
}

/// Hosted monotonic clock.
#[derive(Debug)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_us(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }
}

/// Clock advanced by hand. Clones share the same time.
#[derive(Clone, Debug, Default)]
pub struct ManualClock {
    now_us: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance_us(&self, us: u64) {
        self.now_us.fetch_add(us, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_us(&self) -> u64 {
        self.now_us.load(Ordering::SeqCst)
    }
}

// =========================================================================
// RATE DIVIDER
// =========================================================================

/// Integer accumulator relating a target rate to a base tick rate.
///
/// Each base tick adds `rate`; every whole `base` accumulated is one event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RateDivider {
    rate: u32,
    base: u32,
    acc: u32,
}

impl RateDivider {
    pub fn new(rate: u32, base: u32) -> Self {
        Self {
            rate,
            base: base.max(1),
            acc: 0,
        }
    }

    /// Like `new`, but the first base tick already produces an event.
    pub fn primed(rate: u32, base: u32) -> Self {
        let mut divider = Self::new(rate, base);
        divider.acc = divider.base.saturating_sub(rate.min(divider.base));
        divider
    }

    /// Advance one base tick. Returns the number of events due.
    pub fn tick(&mut self) -> u32 {
        let total = self.acc as u64 + self.rate as u64;
        let events = total / self.base as u64;
        self.acc = (total % self.base as u64) as u32;
        events as u32
    }
}

// =========================================================================
// CONTROL SURFACE
// =========================================================================

/// Operations available to an external command dispatcher.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Command {
    /// Base oscillator coupling. Clamped to the configured range.
    SetCoupling(f32),
    /// Gate thresholds; rejected unless `0 <= low < high <= 1`.
    SetGateThresholds { high: f32, low: f32 },
    /// Recalibrate over `samples` cycles. Also resets the gate.
    Calibrate { samples: u32 },
    /// Gate to `Locked`, oscillators re-spread, formation cleared.
    Reset,
}

/// Operations that need a [`MaintenanceKey`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MaintenanceCommand {
    ForceUnlock,
}

#[derive(Clone, Copy, Debug)]
enum Pending {
    Control(Command),
    Maintenance(MaintenanceCommand),
}

// =========================================================================
// SCHEDULER
// =========================================================================

/// Owns every component and runs them in a fixed order each cycle.
pub struct Scheduler {
    config: SchedulerConfig,
    sensor: SensorField,
    classifier: PhaseClassifier,
    gate: HysteresisGate,
    network: OscillatorNetwork,
    formation: FormationDetector,
    coherence: CoherenceWindow,
    integration: RateDivider,
    publication: RateDivider,
    clock: Box<dyn Clock>,
    pending: Vec<Pending>,
    publisher: Publisher,
    shared: SharedSnapshot,
    last_phase: Option<Phase>,
    /// Phase changed on some cycle since the last publication.
    phase_changed: bool,
    diagnostics: Diagnostics,
    tick: u64,
}

impl Scheduler {
    /// Build every component from a validated configuration and a calibration
    /// record loaded at startup.
    pub fn new(config: EngineConfig, calibration: CalibrationRecord) -> Result<Self, ConfigError> {
        config.validate()?;
        let EngineConfig {
            sensor,
            phase,
            gate,
            oscillator,
            formation,
            scheduler,
        } = config;

        info!(
            loop_hz = scheduler.loop_rate_hz,
            integration_hz = scheduler.integration_rate_hz,
            publish_hz = scheduler.publish_rate_hz,
            "scheduler configured"
        );

        Ok(Self {
            integration: RateDivider::new(scheduler.integration_rate_hz, scheduler.loop_rate_hz),
            publication: RateDivider::primed(scheduler.publish_rate_hz, scheduler.loop_rate_hz),
            sensor: SensorField::new(sensor, calibration),
            classifier: PhaseClassifier::new(phase),
            gate: HysteresisGate::new(gate),
            network: OscillatorNetwork::new(oscillator),
            coherence: CoherenceWindow::new(formation.coherence_window),
            formation: FormationDetector::new(formation),
            config: scheduler,
            clock: Box::new(MonotonicClock::new()),
            pending: Vec::new(),
            publisher: Publisher::default(),
            shared: SharedSnapshot::new(),
            last_phase: None,
            phase_changed: false,
            diagnostics: Diagnostics::default(),
            tick: 0,
        })
    }

    /// Build with no stored calibration; baselines come from first readings.
    pub fn uncalibrated(config: EngineConfig) -> Result<Self, ConfigError> {
        let record = CalibrationRecord::uncalibrated(config.sensor.default_threshold);
        Self::new(config, record)
    }

    /// Replace the cycle-timing clock.
    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    // ===== Accessors =====

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn sensor(&self) -> &SensorField {
        &self.sensor
    }

    pub fn classifier(&self) -> &PhaseClassifier {
        &self.classifier
    }

    pub fn gate(&self) -> &HysteresisGate {
        &self.gate
    }

    pub fn network(&self) -> &OscillatorNetwork {
        &self.network
    }

    pub fn formation(&self) -> &FormationDetector {
        &self.formation
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// Completed cycles.
    pub fn ticks(&self) -> u64 {
        self.tick
    }

    /// Logical time of the next cycle.
    pub fn now_ms(&self) -> u64 {
        self.config.ticks_to_ms(self.tick)
    }

    // ===== Publication =====

    pub fn subscribe(&mut self, observer: Box<dyn SnapshotObserver>) {
        self.publisher.subscribe(observer);
    }

    /// Handle to the latest-value cell, for a transport task.
    pub fn shared_snapshot(&self) -> SharedSnapshot {
        self.shared.clone()
    }

    /// The most recently published snapshot.
    pub fn latest(&self) -> Option<Arc<Snapshot>> {
        self.shared.load()
    }

    // =========================================================================
    // CONTROL
    // =========================================================================

    /// Validate a command and queue it for the start of the next cycle.
    pub fn submit(&mut self, command: Command) -> Result<(), ControlError> {
        match command {
            Command::SetCoupling(k) => {
                if !k.is_finite() {
                    let osc = self.network.config();
                    return Err(ConfigError::out_of_range(
                        "oscillator.coupling",
                        k,
                        osc.coupling_min as f64,
                        osc.coupling_max as f64,
                    )
                    .into());
                }
            }
            Command::SetGateThresholds { high, low } => validate_thresholds(high, low)?,
            Command::Calibrate { samples } => {
                if samples == 0 {
                    return Err(ControlError::InvalidSampleCount);
                }
                if self.sensor.is_calibrating() || self.calibration_queued() {
                    return Err(ControlError::CalibrationInProgress);
                }
            }
            Command::Reset => {}
        }
        debug!(?command, "command queued");
        self.pending.push(Pending::Control(command));
        Ok(())
    }

    /// Install a stored calibration record between cycles.
    ///
    /// Abandons any calibration in flight, clears degraded channels, and
    /// resets the gate since `z` restarts from zero.
    pub fn load_calibration(&mut self, record: CalibrationRecord) {
        self.pending
            .retain(|p| !matches!(p, Pending::Control(Command::Calibrate { .. })));
        self.sensor.load_calibration(record);
        self.gate.reset(self.now_ms());
        info!("calibration record loaded");
    }

    /// Issue a maintenance key. Fails unless maintenance is enabled.
    pub fn maintenance_key(&self) -> Result<MaintenanceKey, ControlError> {
        if !self.config.maintenance_enabled {
            return Err(ControlError::MaintenanceDisabled);
        }
        Ok(MaintenanceKey::issue())
    }

    /// Queue a maintenance operation for the start of the next cycle.
    pub fn submit_maintenance(
        &mut self,
        _key: &MaintenanceKey,
        command: MaintenanceCommand,
    ) -> Result<(), ControlError> {
        if !self.config.maintenance_enabled {
            return Err(ControlError::MaintenanceDisabled);
        }
        warn!(?command, "maintenance command queued");
        self.pending.push(Pending::Maintenance(command));
        Ok(())
    }

    fn calibration_queued(&self) -> bool {
        self.pending
            .iter()
            .any(|p| matches!(p, Pending::Control(Command::Calibrate { .. })))
    }

    fn apply_pending(&mut self, now_ms: u64) {
        for pending in std::mem::take(&mut self.pending) {
            match pending {
                Pending::Control(Command::SetCoupling(k)) => {
                    let applied = self.network.set_coupling(k);
                    info!(requested = k, applied, "coupling set");
                }
                Pending::Control(Command::SetGateThresholds { high, low }) => {
                    match self.gate.set_thresholds(high, low) {
                        Ok(()) => info!(high, low, "gate thresholds set"),
                        Err(e) => warn!(error = %e, "gate thresholds rejected"),
                    }
                }
                Pending::Control(Command::Calibrate { samples }) => {
                    match self.sensor.begin_calibration(samples) {
                        Ok(()) => {
                            info!(samples, "sensor calibration started");
                            self.gate.reset(now_ms);
                        }
                        Err(e) => warn!(error = %e, "calibration not started"),
                    }
                }
                Pending::Control(Command::Reset) => {
                    self.gate.reset(now_ms);
                    self.network.reset();
                    self.formation.reset();
                    self.coherence.clear();
                    info!(at_ms = now_ms, "engine reset");
                }
                Pending::Maintenance(MaintenanceCommand::ForceUnlock) => {
                    let key = MaintenanceKey::issue();
                    self.gate.force_unlock(&key, now_ms);
                }
            }
        }
    }

    // =========================================================================
    // CYCLE
    // =========================================================================

    /// Run one outer cycle. Returns the snapshot if one was published.
    pub fn tick(&mut self, source: &mut dyn SensorSource) -> Option<Arc<Snapshot>> {
        let started_us = self.clock.now_us();
        let now_ms = self.config.ticks_to_ms(self.tick);

        self.apply_pending(now_ms);

        let sensor = *self.sensor.poll(source);
        let phase = self.classifier.classify(sensor.z);
        let phase_changed = self.last_phase.is_some_and(|p| p != phase.phase);
        self.phase_changed |= phase_changed;
        if phase_changed {
            debug!(phase = phase.phase.as_str(), tier = phase.tier, z = phase.z, "phase changed");
        }
        self.last_phase = Some(phase.phase);

        self.gate.update(sensor.z, now_ms);

        let coupling_input = (self.config.field_coupling_gain > 0.0)
            .then(|| self.network.coupling() + self.config.field_coupling_gain * sensor.z);
        let steps = self.integration.tick();
        self.network.step_n(steps as usize, coupling_input);
        self.diagnostics.integration_steps += steps as u64;

        let coherence = match self.formation.config().coherence_source {
            CoherenceSource::Oscillator => self.network.order_parameter(),
            CoherenceSource::FieldVariance => {
                self.coherence.push(&sensor.smoothed);
                self.coherence.coherence()
            }
        };
        let density = self
            .classifier
            .density(sensor.z, self.formation.config().density_width);
        self.formation
            .evaluate(coherence, density, sensor.active_count, now_ms);

        self.tick += 1;
        self.diagnostics.ticks = self.tick;

        let published = if self.publication.tick() > 0 {
            Some(self.publish(now_ms))
        } else {
            None
        };
        self.record_timing(started_us);
        published
    }

    fn publish(&mut self, now_ms: u64) -> Arc<Snapshot> {
        self.diagnostics.publications += 1;
        let snapshot = Arc::new(self.build_snapshot(now_ms));
        self.phase_changed = false;
        self.shared.store(Arc::clone(&snapshot));
        self.publisher.publish(&snapshot);
        snapshot
    }

    /// Run `n` cycles against the same source.
    pub fn run_for(&mut self, source: &mut dyn SensorSource, n: u64) {
        for _ in 0..n {
            self.tick(source);
        }
    }

    /// Combined state as of the last completed cycle, regardless of the
    /// publication rate.
    pub fn snapshot(&self) -> Snapshot {
        let now_ms = self.config.ticks_to_ms(self.tick.saturating_sub(1));
        self.build_snapshot(now_ms)
    }

    fn build_snapshot(&self, now_ms: u64) -> Snapshot {
        let sensor = *self.sensor.state();
        Snapshot {
            tick: self.tick.saturating_sub(1),
            time_ms: now_ms,
            phase: self.classifier.classify(sensor.z),
            sensor,
            phase_changed: self.phase_changed,
            gate: *self.gate.state(),
            oscillator: *self.network.state(),
            formation: *self.formation.state(),
            diagnostics: self.diagnostics,
        }
    }

    fn record_timing(&mut self, started_us: u64) {
        let elapsed = self.clock.now_us().saturating_sub(started_us);
        let d = &mut self.diagnostics;
        d.last_cycle_us = elapsed;
        d.max_cycle_us = d.max_cycle_us.max(elapsed);

        let budget = self.config.cycle_budget_us();
        if elapsed > budget {
            d.overruns += 1;
            warn!(
                tick = self.tick.saturating_sub(1),
                elapsed_us = elapsed,
                budget_us = budget,
                overruns = d.overruns,
                "control loop overrun"
            );
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("tick", &self.tick)
            .field("gate", &self.gate.state().status)
            .field("pending", &self.pending.len())
            .field("observers", &self.publisher.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::GateStatus;
    use crate::publish::FnObserver;
    use crate::sensor::FrameSource;

    const BASELINE: u16 = 700;

    /// Source whose first `k` channels read fully pressed.
    fn pressed(k: usize) -> FrameSource {
        let mut source = FrameSource::uniform(BASELINE);
        for slot in source.frame.iter_mut().take(k) {
            *slot = Some(BASELINE - 100);
        }
        source
    }

    fn scheduler(config: EngineConfig) -> Scheduler {
        let mut record = CalibrationRecord::uncalibrated(0.15);
        for ch in record.channels.iter_mut() {
            ch.baseline = Some(BASELINE);
        }
        Scheduler::new(config, record)
            .unwrap()
            .with_clock(ManualClock::new())
    }

    #[test]
    fn test_rate_divider_integer_ratio() {
        let mut d = RateDivider::new(1000, 100);
        assert!((0..5).all(|_| d.tick() == 10));
    }

    #[test]
    fn test_rate_divider_carries_remainder() {
        let mut d = RateDivider::new(250, 100);
        let steps: Vec<u32> = (0..4).map(|_| d.tick()).collect();
        assert_eq!(steps, vec![2, 3, 2, 3]);
    }

    #[test]
    fn test_primed_divider_fires_first() {
        let mut d = RateDivider::primed(10, 100);
        let fired: Vec<u32> = (0..21).map(|_| d.tick()).collect();
        assert_eq!(fired[0], 1);
        assert_eq!(fired[10], 1);
        assert_eq!(fired[20], 1);
        assert_eq!(fired.iter().sum::<u32>(), 3);
    }

    #[test]
    fn test_integration_steps_per_tick() {
        let mut s = scheduler(EngineConfig::default());
        s.run_for(&mut pressed(0), 3);
        assert_eq!(s.network().state().steps, 30);
        assert_eq!(s.diagnostics().integration_steps, 30);
        assert_eq!(s.now_ms(), 30);
    }

    #[test]
    fn test_publication_downsampled() {
        let mut s = scheduler(EngineConfig::default());
        let mut source = pressed(0);
        let published = (0..25).filter(|_| s.tick(&mut source).is_some()).count();
        assert_eq!(published, 3);
        assert_eq!(s.diagnostics().publications, 3);
        assert_eq!(s.latest().map(|snap| snap.tick), Some(20));
    }

    #[test]
    fn test_commands_apply_next_cycle() {
        let mut s = scheduler(EngineConfig::default());
        s.submit(Command::SetCoupling(0.7)).unwrap();
        assert_eq!(s.network().coupling(), 0.3514);
        s.tick(&mut pressed(0));
        assert_eq!(s.network().coupling(), 0.7);

        s.submit(Command::SetCoupling(4.0)).unwrap();
        s.tick(&mut pressed(0));
        assert_eq!(s.network().coupling(), 1.0);
    }

    #[test]
    fn test_invalid_commands_rejected() {
        let mut s = scheduler(EngineConfig::default());
        assert!(matches!(
            s.submit(Command::SetGateThresholds { high: 0.5, low: 0.6 }),
            Err(ControlError::Config(ConfigError::InvalidThresholds { .. }))
        ));
        assert!(s.submit(Command::SetCoupling(f32::NAN)).is_err());
        assert_eq!(
            s.submit(Command::Calibrate { samples: 0 }),
            Err(ControlError::InvalidSampleCount)
        );
        s.submit(Command::Calibrate { samples: 4 }).unwrap();
        assert_eq!(
            s.submit(Command::Calibrate { samples: 4 }),
            Err(ControlError::CalibrationInProgress)
        );

        s.tick(&mut pressed(0));
        assert_eq!(s.gate().config().high_threshold, 0.85);
        assert_eq!(s.gate().config().low_threshold, 0.82);
    }

    #[test]
    fn test_maintenance_disabled_by_default() {
        let s = scheduler(EngineConfig::default());
        assert_eq!(
            s.maintenance_key().unwrap_err(),
            ControlError::MaintenanceDisabled
        );
    }

    #[test]
    fn test_force_unlock_with_key() {
        let mut config = EngineConfig::default();
        config.scheduler.maintenance_enabled = true;
        let mut s = scheduler(config);
        let key = s.maintenance_key().unwrap();
        s.submit_maintenance(&key, MaintenanceCommand::ForceUnlock)
            .unwrap();
        assert!(!s.gate().is_unlocked());
        s.tick(&mut pressed(0));
        assert!(s.gate().is_unlocked());

        s.submit(Command::Reset).unwrap();
        s.tick(&mut pressed(0));
        assert_eq!(s.gate().state().crossing_count, 0);
    }

    #[test]
    fn test_overrun_counted_not_fatal() {
        struct SlowClock(ManualClock);
        impl Clock for SlowClock {
            fn now_us(&self) -> u64 {
                // Every read advances by 6 ms, so each cycle measures 6 ms.
                self.0.advance_us(6_000);
                self.0.now_us()
            }
        }
        let mut s = scheduler(EngineConfig::default()).with_clock(SlowClock(ManualClock::new()));
        s.run_for(&mut pressed(0), 2);
        assert_eq!(s.diagnostics().overruns, 0);
        assert_eq!(s.diagnostics().last_cycle_us, 6_000);

        let mut config = EngineConfig::default();
        config.scheduler.loop_rate_hz = 200;
        config.scheduler.publish_rate_hz = 10;
        let mut s = scheduler(config).with_clock(SlowClock(ManualClock::new()));
        s.run_for(&mut pressed(0), 2);
        assert_eq!(s.diagnostics().overruns, 2);
        assert_eq!(s.ticks(), 2);
    }

    #[test]
    fn test_formation_from_steady_field() {
        let mut config = EngineConfig::default();
        config.formation.coherence_source = CoherenceSource::FieldVariance;
        let mut s = scheduler(config);

        // 17 of 19 channels: z ≈ 0.895, density above η, resonance 17.
        let mut source = pressed(17);
        s.run_for(&mut source, 10);
        assert!(!s.formation().is_formed());

        // Once the smoothing ramp leaves the window the field reads as coherent.
        s.run_for(&mut source, 90);
        let state = s.formation().state();
        assert!(state.density_ok);
        assert_eq!(state.resonance, 17);
        assert!(state.coherence_ok);
        assert!(state.formed);
        assert_eq!(state.total_formations, 1);

        // A dead bus leaves no active channels.
        let mut dead = FrameSource {
            frame: [None; crate::config::CHANNEL_COUNT],
            orientation: None,
        };
        s.run_for(&mut dead, 1);
        assert!(s.sensor().state().bus_fault);
        assert!(!s.formation().is_formed());
    }

    #[test]
    fn test_phase_changed_flag() {
        let mut s = scheduler(EngineConfig::default());
        let first = s.tick(&mut pressed(0)).unwrap();
        assert!(!first.phase_changed);
        assert_eq!(first.phase.phase, Phase::Low);

        let mut full = pressed(19);
        s.run_for(&mut full, 9);
        let snap = s.tick(&mut full).unwrap();
        assert_eq!(snap.phase.phase, Phase::High);
        assert_eq!(snap.gate.status, GateStatus::Crossed1);
    }

    #[test]
    fn test_phase_changed_sticky_until_published() {
        let mut s = scheduler(EngineConfig::default());
        let mut published = Vec::new();
        for t in 0..21 {
            // A short press at tick 3 is High for two cycles, then Low again.
            let mut source = if t == 3 { pressed(19) } else { pressed(0) };
            if let Some(snap) = s.tick(&mut source) {
                published.push(snap);
            }
            if t == 6 {
                assert!(s.snapshot().phase_changed);
            }
        }

        assert_eq!(published.len(), 3);
        assert!(!published[0].phase_changed);
        assert_eq!(published[1].tick, 10);
        assert_eq!(published[1].phase.phase, Phase::Low);
        assert!(published[1].phase_changed);
        assert!(!published[2].phase_changed);
    }

    #[test]
    fn test_overrun_includes_publication() {
        let clock = ManualClock::new();
        let mut s = scheduler(EngineConfig::default()).with_clock(clock.clone());
        let observer_clock = clock.clone();
        s.subscribe(Box::new(FnObserver(move |_: &Arc<Snapshot>| {
            observer_clock.advance_us(25_000);
        })));

        s.run_for(&mut pressed(0), 21);
        let d = s.diagnostics();
        assert_eq!(d.publications, 3);
        assert_eq!(d.overruns, 3);
        assert_eq!(d.max_cycle_us, 25_000);
        assert_eq!(d.last_cycle_us, 25_000);
    }

    #[test]
    fn test_calibrate_command_completes_over_ticks() {
        let mut s = scheduler(EngineConfig::default());
        s.tick(&mut FrameSource::uniform(BASELINE));
        assert_eq!(s.gate().state().status, GateStatus::Armed);
        s.tick(&mut FrameSource::uniform(BASELINE - 100));
        assert_eq!(s.gate().state().status, GateStatus::Crossed1);

        // Hand resting on the array while calibrating: it becomes the baseline.
        s.submit(Command::Calibrate { samples: 5 }).unwrap();
        let mut resting = FrameSource::uniform(BASELINE - 100);
        s.run_for(&mut resting, 4);
        assert!(s.sensor().is_calibrating());
        s.tick(&mut resting);
        assert!(!s.sensor().is_calibrating());

        let gate = s.gate().state();
        assert_eq!(gate.status, GateStatus::Locked);
        assert_eq!(gate.crossing_count, 0);
        for ch in s.sensor().calibration().channels.iter() {
            assert_eq!(ch.baseline, Some(BASELINE - 100));
            assert!((ch.threshold - 0.1).abs() < 1e-6);
        }

        s.tick(&mut resting);
        assert_eq!(s.sensor().state().active_count, 0);
        assert_eq!(s.gate().state().status, GateStatus::Armed);
    }

    #[test]
    fn test_reset_respreads_and_clears_formation() {
        let mut config = EngineConfig::default();
        config.formation.coherence_source = CoherenceSource::FieldVariance;
        let mut s = scheduler(config.clone());
        let mut source = pressed(17);
        s.run_for(&mut source, 100);
        assert!(s.formation().is_formed());
        assert_eq!(s.coherence.len(), s.coherence.capacity());

        s.submit(Command::Reset).unwrap();
        s.tick(&mut source);

        let mut fresh = scheduler(config);
        fresh.tick(&mut pressed(17));
        assert_eq!(s.network().state().steps, 10);
        assert_eq!(s.network().state().phases, fresh.network().state().phases);

        // One frame in the window yields zero coherence.
        assert_eq!(s.coherence.len(), 1);
        let formation = s.formation().state();
        assert!(!formation.formed);
        assert_eq!(formation.total_formations, 0);
        assert_eq!(formation.peak_coherence, 0.0);
        assert!(s.sensor().calibration().channels[0].baseline.is_some());
    }

    #[test]
    fn test_field_coupling_clamped() {
        let mut config = EngineConfig::default();
        config.scheduler.field_coupling_gain = 2.0;

        // K + 2·1.0 exceeds coupling_max and is clamped to 1.0.
        let mut s = scheduler(config.clone());
        s.tick(&mut pressed(19));
        assert_eq!(s.sensor().state().z, 1.0);
        let mut expected = OscillatorNetwork::new(config.oscillator.clone());
        expected.step_n(10, Some(1.0));
        assert_eq!(s.network().state().phases, expected.state().phases);
        assert_eq!(s.network().coupling(), 0.3514);

        // z = 0 leaves the base coupling in effect.
        let mut idle = scheduler(config.clone());
        idle.tick(&mut pressed(0));
        let mut expected = OscillatorNetwork::new(config.oscillator);
        expected.step_n(10, None);
        assert_eq!(idle.network().state().phases, expected.state().phases);
    }

    #[test]
    fn test_load_calibration_replaces_record() {
        let mut s = scheduler(EngineConfig::default());
        let mut resting = FrameSource::uniform(BASELINE - 100);
        s.tick(&mut resting);
        assert_eq!(s.sensor().state().active_count, 19);

        s.submit(Command::Calibrate { samples: 5 }).unwrap();
        s.tick(&mut resting);
        assert!(s.sensor().is_calibrating());

        let mut record = CalibrationRecord::uncalibrated(0.2);
        for ch in record.channels.iter_mut() {
            ch.baseline = Some(BASELINE - 100);
        }
        s.load_calibration(record.clone());
        assert!(!s.sensor().is_calibrating());
        assert_eq!(s.gate().state().status, GateStatus::Locked);

        // The abandoned run never overwrites the loaded record.
        s.run_for(&mut FrameSource::uniform(BASELINE), 10);
        assert_eq!(s.sensor().calibration(), &record);
        assert_eq!(s.sensor().state().active_count, 0);

        // A calibration can be started again afterwards.
        s.submit(Command::Calibrate { samples: 5 }).unwrap();
    }
}
