//! Snapshot publication - immutable combined state handed to the transport side
//!
//! The scheduler builds one [`Snapshot`] per publication and hands it out as
//! an `Arc`. Nothing downstream can observe component state mid-update:
//! readers either hold the previous snapshot or the new one.
//!
//! Two ways to receive snapshots:
//!
//! - **Observers**: pushed on every publication ([`SnapshotObserver`])
//! - **[`SharedSnapshot`]**: a latest-value cell another task can poll

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::mpsc::Sender;
use std::sync::Arc;

use crate::formation::FormationState;
use crate::gate::GateState;
use crate::oscillator::OscillatorState;
use crate::phase::PhaseState;
use crate::sensor::SensorFieldState;

/// Loop health counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostics {
    pub ticks: u64,
    pub integration_steps: u64,
    pub publications: u64,
    /// Cycles that exceeded the loop budget.
    pub overruns: u64,
    pub last_cycle_us: u64,
    pub max_cycle_us: u64,
}

/// Combined engine state at one tick.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub tick: u64,
    /// Logical time derived from the tick count.
    pub time_ms: u64,
    pub sensor: SensorFieldState,
    pub phase: PhaseState,
    /// Phase changed on at least one cycle since the previous publication.
    pub phase_changed: bool,
    pub gate: GateState,
    pub oscillator: OscillatorState,
    pub formation: FormationState,
    pub diagnostics: Diagnostics,
}

impl Snapshot {
    /// Sub-tier for actuation rendering.
    pub fn tier(&self) -> u8 {
        self.phase.tier
    }

    pub fn is_formed(&self) -> bool {
        self.formation.formed
    }

    /// Total sensor bus failure, for an external supervisor.
    pub fn bus_fault(&self) -> bool {
        self.sensor.bus_fault
    }
}

/// Receives every published snapshot.
pub trait SnapshotObserver: Send + Sync {
    fn on_snapshot(&self, snapshot: &Arc<Snapshot>);
}

/// Closure observer for simple cases.
pub struct FnObserver<F: Fn(&Arc<Snapshot>) + Send + Sync>(pub F);

impl<F: Fn(&Arc<Snapshot>) + Send + Sync> SnapshotObserver for FnObserver<F> {
    fn on_snapshot(&self, snapshot: &Arc<Snapshot>) {
        (self.0)(snapshot);
    }
}

/// Forwards snapshots into an mpsc channel. A dropped receiver is ignored.
pub struct ChannelObserver {
    sender: Sender<Arc<Snapshot>>,
}

impl ChannelObserver {
    pub fn new(sender: Sender<Arc<Snapshot>>) -> Self {
        Self { sender }
    }
}

impl SnapshotObserver for ChannelObserver {
    fn on_snapshot(&self, snapshot: &Arc<Snapshot>) {
        let _ = self.sender.send(Arc::clone(snapshot));
    }
}

/// Latest published snapshot, swapped whole on each publication.
#[derive(Clone, Default)]
pub struct SharedSnapshot {
    inner: Arc<RwLock<Option<Arc<Snapshot>>>>,
}

impl SharedSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the held snapshot.
    pub fn store(&self, snapshot: Arc<Snapshot>) {
        *self.inner.write() = Some(snapshot);
    }

    /// The most recent snapshot, if any has been published.
    pub fn load(&self) -> Option<Arc<Snapshot>> {
        self.inner.read().clone()
    }
}

impl SnapshotObserver for SharedSnapshot {
    fn on_snapshot(&self, snapshot: &Arc<Snapshot>) {
        self.store(Arc::clone(snapshot));
    }
}

impl std::fmt::Debug for SharedSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tick = self.inner.read().as_ref().map(|s| s.tick);
        f.debug_struct("SharedSnapshot").field("tick", &tick).finish()
    }
}

/// Fan-out list of observers.
#[derive(Default)]
pub(crate) struct Publisher {
    observers: Vec<Box<dyn SnapshotObserver>>,
}

impl Publisher {
    pub(crate) fn subscribe(&mut self, observer: Box<dyn SnapshotObserver>) {
        self.observers.push(observer);
    }

    pub(crate) fn len(&self) -> usize {
        self.observers.len()
    }

    pub(crate) fn publish(&self, snapshot: &Arc<Snapshot>) {
        for observer in &self.observers {
            observer.on_snapshot(snapshot);
        }
    }
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("observers", &self.observers.len())
            .finish()
    }
}
