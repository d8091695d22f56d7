//! Power squelch and soft audio gate
//!
//! Block power is estimated on a decimated grid (every `stride`-th
//! pair) and smoothed with a power-of-two EMA. A hysteresis comparator
//! drives the gate decision; audio is then scaled by a Q15 envelope
//! that slews toward open or closed with separate attack and release
//! rates, so the gate never clicks.

use crate::IqSample;

#[cfg(not(test))]
use log::trace;

#[cfg(test)]
use std::println as trace;

// close threshold as a fraction of the open threshold
const CLOSE_RATIO: f32 = 0.8;

/// Decimated-power squelch with soft envelope gate
#[derive(Clone, Debug)]
pub struct PowerSquelch {
    // per-component mean power threshold
    level: f32,

    // EMA length, log2
    window_log2: u32,

    // smoothed pair power
    running: f32,

    // measurement grid
    stride: usize,
    phase: usize,

    gate_open: bool,

    // soft gate envelope, Q15
    env_q15: i32,
    attack_q15: i32,
    release_q15: i32,
}

impl PowerSquelch {
    /// Full-scale envelope value
    pub const ENV_OPEN: i32 = 32768;

    /// Create a squelch
    ///
    /// `level` is the per-component mean power threshold; the pair
    /// domain comparison uses `2 * level`. `window` is rounded to the
    /// nearest power of two in `[1, 32768]`. `stride` sets the
    /// measurement grid and is forced even and nonzero.
    pub fn new(level: f32, window: u32, stride: usize) -> Self {
        let window_log2 = 31 - window.clamp(1, 32768).next_power_of_two().leading_zeros();
        Self {
            level,
            window_log2,
            running: 0.0,
            stride: (stride & !1).max(2),
            phase: 0,
            gate_open: false,
            env_q15: 0,
            attack_q15: 6554,  // ~0.2
            release_q15: 1638, // ~0.05
        }
    }

    /// Set attack and release fractions in `[0, 1]`
    pub fn set_attack_release(&mut self, attack: f32, release: f32) {
        self.attack_q15 = (attack.clamp(0.0, 1.0) * 32768.0) as i32;
        self.release_q15 = (release.clamp(0.0, 1.0) * 32768.0) as i32;
    }

    /// Reset the estimator and close the gate
    pub fn reset(&mut self) {
        self.running = 0.0;
        self.phase = 0;
        self.gate_open = false;
        self.env_q15 = 0;
    }

    /// Measure one block and update the gate decision
    pub fn process(&mut self, block: &[IqSample]) -> bool {
        if block.is_empty() {
            return self.gate_open;
        }

        let mut acc = 0.0f32;
        let mut count = 0u32;
        let mut n = self.phase;
        while n < block.len() {
            acc += block[n].norm_sqr();
            count += 1;
            n += self.stride;
        }
        // keep the grid phase even as it wraps into the next block
        self.phase = (n - block.len()) & !1;

        if count > 0 {
            let mean = acc / count as f32;
            self.running += (mean - self.running) / (1u32 << self.window_log2) as f32;
        }

        let thr_pair = 2.0 * self.level;
        let was = self.gate_open;
        if self.running >= thr_pair {
            self.gate_open = true;
        } else if self.running < thr_pair * CLOSE_RATIO {
            self.gate_open = false;
        }
        if was != self.gate_open {
            trace!(
                "squelch: gate {} (power {:.1} thr {:.1})",
                if self.gate_open { "open" } else { "closed" },
                self.running,
                thr_pair
            );
        }
        self.gate_open
    }

    /// Apply the soft envelope to audio in place
    pub fn apply_gate(&mut self, audio: &mut [f32]) {
        let target = if self.gate_open { Self::ENV_OPEN } else { 0 };
        let alpha = if self.gate_open {
            self.attack_q15
        } else {
            self.release_q15
        };
        for sa in audio.iter_mut() {
            self.env_q15 += ((target - self.env_q15) * alpha) >> 15;
            *sa *= self.env_q15 as f32 / Self::ENV_OPEN as f32;
        }
    }

    /// Current gate decision
    pub fn gate_open(&self) -> bool {
        self.gate_open
    }

    /// Smoothed pair power
    pub fn power(&self) -> f32 {
        self.running
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block_of(mag: f32, n: usize) -> Vec<IqSample> {
        vec![IqSample::new(mag, mag); n]
    }

    #[test]
    fn test_opens_above_threshold() {
        // pair power of this block is 2*level*4: well above threshold
        let mut sq = PowerSquelch::new(100.0, 4, 2);
        let blk = block_of(20.0, 256);
        // 1 + ceil(log2(window)) blocks is the opening bound
        let mut opened_at = None;
        for i in 0..4 {
            if sq.process(&blk) {
                opened_at = Some(i);
                break;
            }
        }
        assert!(opened_at.is_some() && opened_at.unwrap() <= 3);
    }

    #[test]
    fn test_hysteresis_band_holds() {
        let mut sq = PowerSquelch::new(100.0, 1, 2);
        assert!(sq.process(&block_of(20.0, 256)));

        // power just inside the hysteresis band: stays open
        let mid = (2.0f32 * 100.0 * 0.9 / 2.0).sqrt();
        assert!(sq.process(&block_of(mid, 256)));

        // well below the close threshold: shuts
        for _i in 0..8 {
            sq.process(&block_of(0.1, 256));
        }
        assert!(!sq.gate_open());
    }

    #[test]
    fn test_soft_gate_ramps() {
        let mut sq = PowerSquelch::new(1.0, 1, 2);
        sq.process(&block_of(20.0, 64));
        assert!(sq.gate_open());

        let mut audio = vec![1.0f32; 512];
        sq.apply_gate(&mut audio);
        // envelope starts closed and ramps: early samples attenuated,
        // late samples near unity
        assert!(audio[0] < 0.5);
        assert!(audio[511] > 0.95);

        sq.reset();
        assert!(!sq.gate_open());
    }

    #[test]
    fn test_stride_forced_even() {
        let sq = PowerSquelch::new(1.0, 4, 5);
        assert_eq!(sq.stride, 4);
        let sq = PowerSquelch::new(1.0, 4, 0);
        assert_eq!(sq.stride, 2);
    }
}
