//! Oscillator network - coupled phase oscillators with forward Euler steps
//!
//! dθᵢ/dt = ωᵢ + (K/M) Σⱼ sin(θⱼ − θᵢ)
//!
//! The order parameter r ∈ [0, 1] and mean phase ψ come from
//! r·e^(iψ) = (1/M) Σⱼ e^(iθⱼ). Both are recomputed after every step and
//! after every reset; nothing else writes them.
//!
//! Phases live in a fixed array indexed `0..M`. The step size is checked at
//! configuration time so that no single step can move a phase by π or more.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::f32::consts::TAU;

use crate::config::{InitialSpread, OscillatorConfig, OSCILLATOR_COUNT};

/// Wrap an angle into `[0, 2π)`.
#[inline]
pub fn wrap_angle(theta: f32) -> f32 {
    let wrapped = theta.rem_euclid(TAU);
    // rem_euclid can round up to exactly TAU for tiny negative inputs
    if wrapped >= TAU {
        0.0
    } else {
        wrapped
    }
}

/// Order parameter and mean phase of a set of phases.
pub fn order_parameter(phases: &[f32]) -> (f32, f32) {
    if phases.is_empty() {
        return (0.0, 0.0);
    }
    let n = phases.len() as f32;
    let (sum_cos, sum_sin) = phases
        .iter()
        .fold((0.0f32, 0.0f32), |(c, s), &p| (c + p.cos(), s + p.sin()));
    let r = ((sum_cos / n).powi(2) + (sum_sin / n).powi(2)).sqrt();
    (r.min(1.0), wrap_angle(sum_sin.atan2(sum_cos)))
}

/// Observable network state.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct OscillatorState {
    /// θᵢ in `[0, 2π)`.
    pub phases: [f32; OSCILLATOR_COUNT],
    /// ωᵢ in rad/s.
    pub natural_frequencies: [f32; OSCILLATOR_COUNT],
    /// Base coupling K used when a step carries no override.
    pub coupling: f32,
    /// r in `[0, 1]`.
    pub order_parameter: f32,
    /// ψ in `[0, 2π)`.
    pub mean_phase: f32,
    /// `order_parameter >= sync_threshold`.
    pub synchronized: bool,
    /// Integration steps since construction or reset.
    pub steps: u64,
}

/// Fixed-size Kuramoto network.
#[derive(Clone, Debug)]
pub struct OscillatorNetwork {
    config: OscillatorConfig,
    state: OscillatorState,
    rng: Option<ChaCha8Rng>,
}

impl OscillatorNetwork {
    /// Create a network with phases laid out per `config.initial_spread`.
    pub fn new(config: OscillatorConfig) -> Self {
        let rng = match config.initial_spread {
            InitialSpread::Even => None,
            InitialSpread::Random { seed } => Some(ChaCha8Rng::seed_from_u64(seed)),
        };
        let state = OscillatorState {
            phases: [0.0; OSCILLATOR_COUNT],
            natural_frequencies: config.natural_frequencies(),
            coupling: config.clamp_coupling(config.coupling),
            order_parameter: 0.0,
            mean_phase: 0.0,
            synchronized: false,
            steps: 0,
        };
        let mut network = Self { config, state, rng };
        network.spread_phases();
        network
    }

    /// Create a network starting from explicit phases.
    pub fn with_phases(config: OscillatorConfig, phases: [f32; OSCILLATOR_COUNT]) -> Self {
        let mut network = Self::new(config);
        for (slot, p) in network.state.phases.iter_mut().zip(phases) {
            *slot = wrap_angle(p);
        }
        network.refresh_order();
        network
    }

    pub fn state(&self) -> &OscillatorState {
        &self.state
    }

    pub fn config(&self) -> &OscillatorConfig {
        &self.config
    }

    pub fn coupling(&self) -> f32 {
        self.state.coupling
    }

    pub fn order_parameter(&self) -> f32 {
        self.state.order_parameter
    }

    pub fn mean_phase(&self) -> f32 {
        self.state.mean_phase
    }

    // =========================================================================
    // INTEGRATION
    // =========================================================================

    /// Advance every oscillator by one fixed step.
    ///
    /// `coupling_input` overrides K for this step only (clamped to the
    /// configured range); the base coupling is left unchanged.
    pub fn step(&mut self, coupling_input: Option<f32>) -> &OscillatorState {
        let k = coupling_input
            .map(|k| self.config.clamp_coupling(k))
            .unwrap_or(self.state.coupling);
        let dt = self.config.dt_s;
        let k_over_m = k / OSCILLATOR_COUNT as f32;
        let phases = self.state.phases;

        for (i, theta) in self.state.phases.iter_mut().enumerate() {
            let theta_i = phases[i];
            let coupling_sum: f32 = phases.iter().map(|&theta_j| (theta_j - theta_i).sin()).sum();
            let velocity = self.state.natural_frequencies[i] + k_over_m * coupling_sum;
            *theta = wrap_angle(theta_i + dt * velocity);
        }

        self.state.steps += 1;
        self.refresh_order();
        &self.state
    }

    /// Advance `n` steps with the same coupling input.
    pub fn step_n(&mut self, n: usize, coupling_input: Option<f32>) -> &OscillatorState {
        for _ in 0..n {
            self.step(coupling_input);
        }
        &self.state
    }

    // =========================================================================
    // CONTROL
    // =========================================================================

    /// Set the base coupling for subsequent steps. Returns the clamped value.
    pub fn set_coupling(&mut self, k: f32) -> f32 {
        self.state.coupling = self.config.clamp_coupling(k);
        self.state.coupling
    }

    /// Re-spread phases and drop the order parameter to its baseline.
    pub fn reset(&mut self) {
        self.state.steps = 0;
        self.spread_phases();
    }

    fn spread_phases(&mut self) {
        match self.rng.as_mut() {
            Some(rng) => {
                for theta in self.state.phases.iter_mut() {
                    *theta = rng.gen_range(0.0..TAU);
                }
            }
            None => {
                for (i, theta) in self.state.phases.iter_mut().enumerate() {
                    *theta = i as f32 * TAU / OSCILLATOR_COUNT as f32;
                }
            }
        }
        self.refresh_order();
    }

    fn refresh_order(&mut self) {
        let (r, psi) = order_parameter(&self.state.phases);
        self.state.order_parameter = r;
        self.state.mean_phase = psi;
        self.state.synchronized = r >= self.config.sync_threshold;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::f32::consts::PI;

    #[test]
    fn test_even_spread_order_near_zero() {
        let net = OscillatorNetwork::new(OscillatorConfig::default());
        assert_abs_diff_eq!(net.order_parameter(), 0.0, epsilon = 1e-5);
        assert!(!net.state().synchronized);
    }

    #[test]
    fn test_identical_phases_full_order() {
        let net = OscillatorNetwork::with_phases(OscillatorConfig::default(), [0.0; OSCILLATOR_COUNT]);
        assert_eq!(net.order_parameter(), 1.0);
        assert!(net.state().synchronized);

        let net = OscillatorNetwork::with_phases(OscillatorConfig::default(), [2.5; OSCILLATOR_COUNT]);
        assert_abs_diff_eq!(net.order_parameter(), 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(net.mean_phase(), 2.5, epsilon = 1e-5);
    }

    #[test]
    fn test_order_parameter_bounded_while_stepping() {
        let config = OscillatorConfig {
            coupling: 1.0,
            ..Default::default()
        };
        let mut net = OscillatorNetwork::new(config);
        for _ in 0..5_000 {
            let state = net.step(None);
            assert!((0.0..=1.0).contains(&state.order_parameter));
            assert!((0.0..TAU).contains(&state.mean_phase));
            assert!(state.phases.iter().all(|p| (0.0..TAU).contains(p)));
        }
        assert_eq!(net.state().steps, 5_000);
    }

    #[test]
    fn test_uncoupled_phases_advance_at_natural_rate() {
        let config = OscillatorConfig {
            coupling: 0.0,
            ..Default::default()
        };
        let mut net = OscillatorNetwork::new(config.clone());
        let before = net.state().phases;
        net.step(None);
        let omegas = config.natural_frequencies();
        for i in 0..OSCILLATOR_COUNT {
            let expected = wrap_angle(before[i] + config.dt_s * omegas[i]);
            assert_abs_diff_eq!(net.state().phases[i], expected, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_strong_coupling_synchronizes() {
        // Identical frequencies and strong coupling pull a loose cluster together.
        let config = OscillatorConfig {
            natural_frequencies: Some([2.0 * PI; OSCILLATOR_COUNT]),
            coupling_max: 20.0,
            coupling: 20.0,
            dt_s: 0.001,
            ..Default::default()
        };
        let phases = [0.0, 0.3, 0.6, 0.9, 1.2, 0.2, 0.5, 0.8];
        let mut net = OscillatorNetwork::with_phases(config, phases);
        let r0 = net.order_parameter();
        net.step_n(3_000, None);
        assert!(net.order_parameter() > r0);
        assert!(net.order_parameter() > 0.99);
    }

    #[test]
    fn test_set_coupling_clamped() {
        let mut net = OscillatorNetwork::new(OscillatorConfig::default());
        assert_eq!(net.set_coupling(3.0), 1.0);
        assert_eq!(net.set_coupling(-1.0), 0.0);
        assert_eq!(net.set_coupling(0.5), 0.5);
        assert_eq!(net.coupling(), 0.5);
    }

    #[test]
    fn test_coupling_override_is_per_step() {
        let mut net = OscillatorNetwork::new(OscillatorConfig::default());
        net.set_coupling(0.2);
        net.step(Some(0.9));
        assert_eq!(net.coupling(), 0.2);
    }

    #[test]
    fn test_reset_restores_spread() {
        let config = OscillatorConfig {
            natural_frequencies: Some([2.0 * PI; OSCILLATOR_COUNT]),
            ..Default::default()
        };
        let mut net = OscillatorNetwork::with_phases(config, [1.0; OSCILLATOR_COUNT]);
        assert!(net.order_parameter() > 0.99);
        net.reset();
        assert_abs_diff_eq!(net.order_parameter(), 0.0, epsilon = 1e-5);
        assert_eq!(net.state().steps, 0);
    }

    #[test]
    fn test_random_spread_deterministic_per_seed() {
        let config = OscillatorConfig {
            initial_spread: InitialSpread::Random { seed: 7 },
            ..Default::default()
        };
        let a = OscillatorNetwork::new(config.clone());
        let b = OscillatorNetwork::new(config);
        assert_eq!(a.state().phases, b.state().phases);
        assert!(a.state().phases.iter().all(|p| (0.0..TAU).contains(p)));
    }

    #[test]
    fn test_wrap_angle_range() {
        assert_eq!(wrap_angle(TAU), 0.0);
        assert!(wrap_angle(-1e-9) < TAU);
        assert_abs_diff_eq!(wrap_angle(-PI / 2.0), 1.5 * PI, epsilon = 1e-6);
    }
}
