//! Formation detection - three-way conjunction of coherence, density, and resonance
//!
//! `formed` holds exactly while all three criteria hold on the current
//! evaluation:
//!
//! - coherence >= κ
//! - density > η
//! - resonance >= R
//!
//! The detector remembers when the current formation began, but that
//! timestamp is only reported, never used for gating.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::FormationConfig;

/// Observable formation state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FormationState {
    pub coherence: f32,
    pub density: f32,
    /// Active channel count.
    pub resonance: u8,
    pub coherence_ok: bool,
    pub density_ok: bool,
    pub resonance_ok: bool,
    pub formed: bool,
    pub formed_since_ms: Option<u64>,
    /// Rising edges of `formed` since the last stats reset.
    pub total_formations: u32,
    pub peak_coherence: f32,
    pub peak_density: f32,
}

#[derive(Clone, Debug)]
pub struct FormationDetector {
    config: FormationConfig,
    state: FormationState,
}

impl FormationDetector {
    pub fn new(config: FormationConfig) -> Self {
        Self {
            config,
            state: FormationState::default(),
        }
    }

    pub fn state(&self) -> &FormationState {
        &self.state
    }

    pub fn config(&self) -> &FormationConfig {
        &self.config
    }

    pub fn is_formed(&self) -> bool {
        self.state.formed
    }

    /// Evaluate the three criteria for this cycle.
    pub fn evaluate(&mut self, coherence: f32, density: f32, resonance: u8, now_ms: u64) -> bool {
        let s = &mut self.state;
        s.coherence = coherence;
        s.density = density;
        s.resonance = resonance;

        s.coherence_ok = coherence >= self.config.kappa_threshold;
        s.density_ok = density > self.config.eta_threshold;
        s.resonance_ok = resonance >= self.config.resonance_threshold;

        let was_formed = s.formed;
        s.formed = s.coherence_ok && s.density_ok && s.resonance_ok;

        if s.formed && !was_formed {
            s.formed_since_ms = Some(now_ms);
            s.total_formations = s.total_formations.saturating_add(1);
            info!(coherence, density, resonance, "formation gained");
        } else if !s.formed && was_formed {
            let held_ms = s.formed_since_ms.map_or(0, |t| now_ms.saturating_sub(t));
            s.formed_since_ms = None;
            info!(
                held_ms,
                coherence_ok = s.coherence_ok,
                density_ok = s.density_ok,
                resonance_ok = s.resonance_ok,
                "formation lost"
            );
        }

        s.peak_coherence = s.peak_coherence.max(coherence);
        s.peak_density = s.peak_density.max(density);

        s.formed
    }

    /// How long the current formation has held, zero when not formed.
    pub fn formed_duration_ms(&self, now_ms: u64) -> u64 {
        self.state
            .formed_since_ms
            .map_or(0, |since| now_ms.saturating_sub(since))
    }

    /// Clear counters and peaks; the current `formed` flag is kept.
    pub fn reset_stats(&mut self) {
        self.state.total_formations = 0;
        self.state.peak_coherence = 0.0;
        self.state.peak_density = 0.0;
    }

    /// Forget everything, including an ongoing formation.
    pub fn reset(&mut self) {
        self.state = FormationState::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> FormationDetector {
        FormationDetector::new(FormationConfig::default())
    }

    #[test]
    fn test_all_criteria_required() {
        let mut d = detector();
        assert!(d.evaluate(0.95, 0.9, 8, 0));
        assert!(d.is_formed());
        assert_eq!(d.state().formed_since_ms, Some(0));
    }

    #[test]
    fn test_each_criterion_flips_formed() {
        let cases = [(0.91, 0.9, 8), (0.95, 0.5, 8), (0.95, 0.9, 6)];
        for (coherence, density, resonance) in cases {
            let mut d = detector();
            assert!(d.evaluate(0.95, 0.9, 8, 0));
            assert!(!d.evaluate(coherence, density, resonance, 10));
            assert_eq!(d.state().formed_since_ms, None);
        }
    }

    #[test]
    fn test_threshold_edges() {
        let mut d = detector();
        // κ and R are inclusive, η is strict.
        assert!(d.evaluate(0.92, 0.7, 7, 0));
        let eta = d.config().eta_threshold;
        assert!(!d.evaluate(0.92, eta, 7, 10));
    }

    #[test]
    fn test_formed_since_kept_while_holding() {
        let mut d = detector();
        d.evaluate(0.95, 0.9, 8, 100);
        d.evaluate(0.96, 0.8, 9, 110);
        d.evaluate(0.97, 0.85, 10, 120);
        assert_eq!(d.state().formed_since_ms, Some(100));
        assert_eq!(d.formed_duration_ms(150), 50);
        assert_eq!(d.state().total_formations, 1);
    }

    #[test]
    fn test_counts_and_peaks() {
        let mut d = detector();
        d.evaluate(0.95, 0.9, 8, 0);
        d.evaluate(0.5, 0.9, 8, 10);
        d.evaluate(0.99, 0.95, 8, 20);
        assert_eq!(d.state().total_formations, 2);
        assert_eq!(d.state().peak_coherence, 0.99);
        assert_eq!(d.state().peak_density, 0.95);

        d.reset_stats();
        assert_eq!(d.state().total_formations, 0);
        assert!(d.is_formed());
    }
}
