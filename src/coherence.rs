//! Field coherence window - ring buffer of smoothed channel frames
//!
//! An alternative coherence source for formation detection: a stable
//! pattern (low variance over the window) reads as high coherence.
//!
//! coherence = clamp(1 − k·σ, 0, 1), with σ the RMS deviation of each
//! channel from its own window mean. k = 3.16 puts σ = 0.1 near 0.68.

use crate::config::CHANNEL_COUNT;

/// Scale from RMS deviation to coherence loss.
pub const DEVIATION_SCALE: f32 = 3.16;

/// Fixed-capacity ring buffer of channel frames.
#[derive(Clone, Debug)]
pub struct CoherenceWindow {
    /// Ring buffer of frames.
    frames: Vec<[f32; CHANNEL_COUNT]>,

    /// Next write position.
    write_head: usize,

    /// Frames written, saturating at capacity.
    filled: usize,
}

impl CoherenceWindow {
    /// Create a window holding `capacity` frames.
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: vec![[0.0; CHANNEL_COUNT]; capacity.max(1)],
            write_head: 0,
            filled: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.frames.len()
    }

    pub fn len(&self) -> usize {
        self.filled
    }

    pub fn is_empty(&self) -> bool {
        self.filled == 0
    }

    /// Append a frame, evicting the oldest once full.
    pub fn push(&mut self, frame: &[f32; CHANNEL_COUNT]) {
        self.frames[self.write_head] = *frame;
        self.write_head = (self.write_head + 1) % self.frames.len();
        self.filled = (self.filled + 1).min(self.frames.len());
    }

    /// The last `n` frames, oldest first.
    pub fn read_window(&self, n: usize) -> impl Iterator<Item = &[f32; CHANNEL_COUNT]> + '_ {
        let n = n.min(self.filled);
        let cap = self.frames.len();
        let start = self.write_head + cap - n;
        (0..n).map(move |i| &self.frames[(start + i) % cap])
    }

    /// Variance-derived coherence over the filled window. Zero until two frames exist.
    pub fn coherence(&self) -> f32 {
        if self.filled < 2 {
            return 0.0;
        }
        let n = self.filled as f32;

        let mut means = [0.0f32; CHANNEL_COUNT];
        for frame in self.read_window(self.filled) {
            for (m, v) in means.iter_mut().zip(frame.iter()) {
                *m += v;
            }
        }
        for m in &mut means {
            *m /= n;
        }

        let mut total = 0.0f32;
        for frame in self.read_window(self.filled) {
            for (m, v) in means.iter().zip(frame.iter()) {
                let d = v - m;
                total += d * d;
            }
        }
        let variance = total / (n * CHANNEL_COUNT as f32);

        (1.0 - variance.sqrt() * DEVIATION_SCALE).clamp(0.0, 1.0)
    }

    /// Drop all frames.
    pub fn clear(&mut self) {
        for frame in &mut self.frames {
            *frame = [0.0; CHANNEL_COUNT];
        }
        self.write_head = 0;
        self.filled = 0;
    }
}
