//! Carrier recovery: frequency-locked loop
//!
//! Two error detectors feed one second-order loop:
//!
//! * **FM decision-directed**: the DC content of the quadrature
//!   discriminator is proportional to the residual carrier frequency
//!   offset, so the mean per-sample phase delta of the rotated block is
//!   the error signal directly.
//! * **Band-edge** (CQPSK): two FIR filters sit at the upper and lower
//!   band edges of the root-raised-cosine spectrum; the difference of
//!   their output powers steers the loop. Used as an acquisition aid
//!   that latches once the loop settles and then free-runs at the
//!   latched frequency.
//!
//! The loop is `freq += β·err; phase += freq + α·err`, with a deadband
//! on the error and a per-block slew clamp on the frequency step.

use std::f32::consts::PI;

use crate::IqSample;

#[cfg(not(test))]
use log::debug;

#[cfg(test)]
use std::println as debug;

/// Frequency error detector selection
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FllMode {
    /// Decision-directed from the FM discriminator DC
    FmDirected,

    /// Band-edge detector for CQPSK, acquisition-only with lock latch
    BandEdge,
}

/// Frequency-locked loop with NCO correction
#[derive(Clone, Debug)]
pub struct Fll {
    mode: FllMode,

    // loop gains
    alpha: f32,
    beta: f32,

    // errors smaller than this are ignored
    deadband: f32,

    // maximum |Δfreq| per block, radians/sample
    slew_max: f32,

    // NCO state, radians/sample and radians
    freq: f32,
    phase: f32,

    enabled: bool,

    // acquisition latch (band-edge mode only)
    acq_locked: bool,
    acq_quiet_runs: u32,

    // band-edge filters
    band_edge: Option<BandEdgeDetector>,
}

impl Fll {
    /// Frequency magnitude below which a block counts as "quiet"
    /// (radians/sample): about 15 Hz at 48 kSa/s.
    pub const LOCK_FREQ_THR: f32 = 2.0e-3;

    /// Consecutive quiet blocks required to latch acquisition
    pub const LOCK_BLOCKS: u32 = 4;

    /// Create an FM decision-directed FLL
    pub fn new_fm(alpha: f32, beta: f32, deadband: f32, slew_max: f32) -> Self {
        Self {
            mode: FllMode::FmDirected,
            alpha,
            beta,
            deadband,
            slew_max,
            freq: 0.0,
            phase: 0.0,
            enabled: true,
            acq_locked: false,
            acq_quiet_runs: 0,
            band_edge: None,
        }
    }

    /// Create a band-edge acquisition FLL for CQPSK
    ///
    /// `sps` is samples per symbol at the loop's input; `rolloff` is
    /// the RRC excess bandwidth.
    pub fn new_band_edge(alpha: f32, beta: f32, slew_max: f32, sps: f32, rolloff: f32) -> Self {
        Self {
            mode: FllMode::BandEdge,
            alpha,
            beta,
            deadband: 0.0,
            slew_max,
            freq: 0.0,
            phase: 0.0,
            enabled: true,
            acq_locked: false,
            acq_quiet_runs: 0,
            band_edge: Some(BandEdgeDetector::new(45, sps, rolloff)),
        }
    }

    /// Reset to zero initial conditions, clearing any acquisition latch
    pub fn reset(&mut self) {
        self.freq = 0.0;
        self.phase = 0.0;
        self.acq_locked = false;
        self.acq_quiet_runs = 0;
        if let Some(be) = self.band_edge.as_mut() {
            be.reset();
        }
    }

    /// Enable or disable the loop; disabled passes input through
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Rotate one block in place and run one loop update
    pub fn process(&mut self, block: &mut [IqSample]) {
        if !self.enabled || block.is_empty() {
            return;
        }

        let err = match self.mode {
            FllMode::FmDirected => self.rotate_and_measure_fm(block),
            FllMode::BandEdge => self.rotate_and_measure_band_edge(block),
        };

        if self.acq_locked {
            // keep rotating at the latched frequency; no updates
            return;
        }

        let err = if err.abs() < self.deadband { 0.0 } else { err };
        let delta = (self.beta * err).clamp(-self.slew_max, self.slew_max);
        self.freq += delta;
        self.phase += self.alpha * err;
        self.phase = wrap_pi(self.phase);

        if self.mode == FllMode::BandEdge {
            if self.freq.abs() <= Self::LOCK_FREQ_THR || err.abs() < 1.0e-6 {
                self.acq_quiet_runs += 1;
                if self.acq_quiet_runs >= Self::LOCK_BLOCKS {
                    debug!("fll: acquisition latched at {:.5} rad/sa", self.freq);
                    self.acq_locked = true;
                }
            } else {
                self.acq_quiet_runs = 0;
            }
        }
    }

    // Rotate by the NCO and return the mean residual phase delta.
    fn rotate_and_measure_fm(&mut self, block: &mut [IqSample]) -> f32 {
        let mut prev: Option<IqSample> = None;
        let mut acc = 0.0f32;
        let mut count = 0u32;
        for sa in block.iter_mut() {
            *sa *= IqSample::from_polar(1.0, -self.phase);
            self.phase = wrap_pi(self.phase + self.freq);
            if let Some(p) = prev {
                let d = *sa * p.conj();
                if d.norm_sqr() > 0.0 {
                    acc += d.arg();
                    count += 1;
                }
            }
            prev = Some(*sa);
        }
        if count == 0 {
            0.0
        } else {
            acc / count as f32
        }
    }

    // Rotate by the NCO, run the band-edge filters, return the
    // accumulated power-difference error (normalized per sample).
    fn rotate_and_measure_band_edge(&mut self, block: &mut [IqSample]) -> f32 {
        let be = self.band_edge.as_mut().expect("band-edge taps");
        let mut acc = 0.0f32;
        for sa in block.iter_mut() {
            *sa *= IqSample::from_polar(1.0, -self.phase);
            self.phase = wrap_pi(self.phase + self.freq);
            acc += be.error(*sa);
        }
        acc / block.len() as f32
    }

    /// Current frequency estimate, radians/sample
    pub fn freq(&self) -> f32 {
        self.freq
    }

    /// Current frequency estimate in Q15, where π maps to 32768
    pub fn freq_q15(&self) -> i32 {
        (self.freq / PI * 32768.0) as i32
    }

    /// Current frequency estimate in Hz for the given sample rate
    pub fn freq_hz(&self, rate: f32) -> f32 {
        self.freq * rate / (2.0 * PI)
    }

    /// True once band-edge acquisition has latched
    pub fn acq_locked(&self) -> bool {
        self.acq_locked
    }
}

// Band-edge power-difference error detector.
//
// Upper and lower filters are the RRC prototype heterodyned to
// ±(1+rolloff)/(2·sps); error = |lower|² − |upper|².
#[derive(Clone, Debug)]
struct BandEdgeDetector {
    taps_upper: Vec<IqSample>,
    taps_lower: Vec<IqSample>,
    delay: Vec<IqSample>,
    idx: usize,
}

impl BandEdgeDetector {
    fn new(size: usize, sps: f32, rolloff: f32) -> Self {
        let n = size | 1;
        let mid = n / 2;

        let mut rrc = vec![0.0f32; n];
        for (i, tap) in rrc.iter_mut().enumerate() {
            let t = (i as f32 - mid as f32) / sps;
            *tap = crate::matched::rrc_tap(t, rolloff);
        }

        let edge = (1.0 + rolloff) / (2.0 * sps);
        let mut taps_upper = Vec::with_capacity(n);
        let mut taps_lower = Vec::with_capacity(n);
        for (i, &tap) in rrc.iter().enumerate() {
            let ph = 2.0 * PI * edge * (i as f32 - mid as f32);
            taps_upper.push(IqSample::from_polar(tap, ph));
            taps_lower.push(IqSample::from_polar(tap, -ph));
        }

        Self {
            taps_upper,
            taps_lower,
            delay: vec![IqSample::new(0.0, 0.0); n],
            idx: 0,
        }
    }

    fn reset(&mut self) {
        self.delay.fill(IqSample::new(0.0, 0.0));
        self.idx = 0;
    }

    #[inline]
    fn error(&mut self, sa: IqSample) -> f32 {
        let n = self.delay.len();
        self.delay[self.idx] = sa;
        self.idx = (self.idx + 1) % n;

        let mut up = IqSample::new(0.0, 0.0);
        let mut lo = IqSample::new(0.0, 0.0);
        for i in 0..n {
            let s = self.delay[(self.idx + i) % n];
            up += s * self.taps_upper[i];
            lo += s * self.taps_lower[i];
        }
        lo.norm_sqr() - up.norm_sqr()
    }
}

#[inline]
fn wrap_pi(ph: f32) -> f32 {
    let mut ph = ph;
    while ph > PI {
        ph -= 2.0 * PI;
    }
    while ph < -PI {
        ph += 2.0 * PI;
    }
    ph
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_approx_eq::assert_approx_eq;

    use crate::testutil::tone;

    #[test]
    fn test_fm_cfo_pulldown() {
        // +200 Hz residual at 48 kHz: loop must pull the estimate up
        let mut fll = Fll::new_fm(0.002, 0.05, 0.0, 0.5);
        let cfo = 2.0 * PI * 200.0 / 48000.0;

        for blk_no in 0..40 {
            let mut blk: Vec<IqSample> = (0..512)
                .map(|n| {
                    let sample_no = (blk_no * 512 + n) as f32;
                    IqSample::from_polar(1.0, cfo * sample_no)
                })
                .collect();
            fll.process(&mut blk);
        }

        assert_approx_eq!(fll.freq_hz(48000.0), 200.0f32, 30.0);
    }

    #[test]
    fn test_slew_clamp() {
        let mut fll = Fll::new_fm(0.0, 1.0, 0.0, 1.0e-4);
        let mut blk = tone(4000.0, 48000.0, 1.0, 256);
        let before = fll.freq();
        fll.process(&mut blk);
        assert!((fll.freq() - before).abs() <= 1.0e-4 + f32::EPSILON);
    }

    #[test]
    fn test_deadband_holds() {
        let mut fll = Fll::new_fm(0.1, 0.1, 1.0, 0.5);
        // 10 Hz offset is far inside a 1-radian deadband
        let mut blk = tone(10.0, 48000.0, 1.0, 512);
        fll.process(&mut blk);
        assert_eq!(fll.freq(), 0.0);
    }

    #[test]
    fn test_band_edge_latch() {
        // centered noiseless carrier: quiet runs accumulate and latch
        let mut fll = Fll::new_band_edge(0.01, 0.01, 0.5, 10.0, 0.25);
        for _i in 0..Fll::LOCK_BLOCKS + 1 {
            let mut blk = vec![IqSample::new(1.0, 0.0); 256];
            fll.process(&mut blk);
        }
        assert!(fll.acq_locked());

        // latched loop must not move
        let f = fll.freq();
        let mut blk = tone(2000.0, 48000.0, 1.0, 256);
        fll.process(&mut blk);
        assert_eq!(f, fll.freq());

        fll.reset();
        assert!(!fll.acq_locked());
    }

    #[test]
    fn test_disabled_is_identity() {
        let mut fll = Fll::new_fm(0.1, 0.1, 0.0, 0.5);
        fll.set_enabled(false);
        let mut blk = tone(1000.0, 48000.0, 1.0, 64);
        let orig = blk.clone();
        fll.process(&mut blk);
        assert_eq!(orig, blk);
    }
}
