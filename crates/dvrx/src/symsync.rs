//! Symbol timing recovery: Gardner TED
//!
//! A Gardner timing error detector drives a second-order loop over the
//! fractional sample phase `mu` and the symbol period estimate `omega`
//! (samples per symbol). Two interpolator back-ends are provided:
//!
//! * **MMSE polyphase** (decimating): an 8-tap fractional-delay bank
//!   with 128 phases and linear blending between adjacent phases;
//!   outputs one sample per symbol. Used for CQPSK.
//! * **Cubic Farrow** (non-decimating): a 4-point cubic Lagrange
//!   interpolator applied at the working rate; the loop still updates
//!   at symbol cadence but every input sample produces an output
//!   sample. Used for FM/C4FM discriminator paths.
//!
//! The delay line is stored doubled so any 8-sample window can be read
//! as one contiguous slice without wraparound copies.

use crate::IqSample;

#[cfg(not(test))]
use log::debug;

#[cfg(test)]
use std::println as debug;

// delay line capacity, samples (storage is 2x this)
const DL_SIZE: usize = 64;

// MMSE interpolator geometry
const MMSE_NTAPS: usize = 8;
const MMSE_NSTEPS: usize = 128;

// Yair-Linn lock detector window, symbols
const LOCK_WINDOW: u32 = 64;

/// Interpolator back-end selection
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TedMode {
    /// 8-tap MMSE polyphase, decimating to one sample per symbol
    MmseDecimate,

    /// Cubic Farrow, non-decimating
    FarrowTrack,
}

/// Gardner timing error detector and corrector
#[derive(Clone, Debug)]
pub struct SymbolSync {
    mode: TedMode,

    // loop gains
    gain_mu: f32,
    gain_omega: f32,

    // symbol period estimate and its clamp
    omega: f32,
    omega_mid: f32,
    omega_rel: f32,

    // fractional sample phase in [0, 1)
    mu: f32,

    // doubled circular delay line
    dl: Vec<IqSample>,
    dl_index: usize,

    // samples until the next symbol decision
    to_consume: usize,

    // previous on-symbol sample for the Gardner product
    last: IqSample,

    // smoothed timing error
    e_ema: f32,

    // Yair-Linn accumulators
    lock_on: f32,
    lock_mid: f32,
    lock_count: u32,
    locked: bool,

    // gain boosts remaining after an SPS change
    fast_acq_kicks: u32,

    enabled: bool,
}

impl SymbolSync {
    /// Permitted samples-per-symbol range
    pub const SPS_MIN: f32 = 2.0;
    pub const SPS_MAX: f32 = 20.0;

    /// Default proportional gain
    pub const DEFAULT_GAIN_MU: f32 = 0.025;

    /// Default relative omega excursion
    pub const DEFAULT_OMEGA_REL: f32 = 0.002;

    /// Normalized lock threshold
    pub const LOCK_THRESHOLD: f32 = 0.4;

    /// Symbol decisions boosted after an SPS change
    const FAST_ACQ_KICKS: u32 = 32;

    /// Create a timing loop at `sps` samples per symbol
    ///
    /// `gain_omega` defaults to `0.1 · gain_mu²` when zero is passed.
    pub fn new(mode: TedMode, sps: f32, gain_mu: f32, gain_omega: f32, omega_rel: f32) -> Self {
        let sps = sps.clamp(Self::SPS_MIN, Self::SPS_MAX);
        let gain_omega = if gain_omega > 0.0 {
            gain_omega
        } else {
            0.1 * gain_mu * gain_mu
        };
        Self {
            mode,
            gain_mu,
            gain_omega,
            omega: sps,
            omega_mid: sps,
            omega_rel,
            mu: 0.0,
            dl: vec![IqSample::new(0.0, 0.0); 2 * DL_SIZE],
            dl_index: 0,
            to_consume: sps as usize,
            last: IqSample::new(0.0, 0.0),
            e_ema: 0.0,
            lock_on: 0.0,
            lock_mid: 0.0,
            lock_count: 0,
            locked: false,
            fast_acq_kicks: 0,
            enabled: true,
        }
    }

    /// Reset loop state, keeping the configured gains and SPS
    pub fn reset(&mut self) {
        self.omega = self.omega_mid;
        self.mu = 0.0;
        self.dl.fill(IqSample::new(0.0, 0.0));
        self.dl_index = 0;
        self.to_consume = self.omega_mid as usize;
        self.last = IqSample::new(0.0, 0.0);
        self.e_ema = 0.0;
        self.lock_on = 0.0;
        self.lock_mid = 0.0;
        self.lock_count = 0;
        self.locked = false;
        self.fast_acq_kicks = 0;
    }

    /// Change the nominal samples-per-symbol
    ///
    /// Triggers a fast-acquisition phase where the loop gains are
    /// boosted for the next few symbol decisions.
    pub fn set_sps(&mut self, sps: f32) {
        let sps = sps.clamp(Self::SPS_MIN, Self::SPS_MAX);
        self.omega_mid = sps;
        self.omega = sps;
        self.fast_acq_kicks = Self::FAST_ACQ_KICKS;
        self.locked = false;
        self.lock_on = 0.0;
        self.lock_mid = 0.0;
        self.lock_count = 0;
        debug!("symsync: sps -> {:.2}, fast acquire", sps);
    }

    /// Enable or disable the loop; disabled copies input to output
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Process one block
    ///
    /// In [`TedMode::MmseDecimate`] the output holds one sample per
    /// symbol; in [`TedMode::FarrowTrack`] it matches the input length.
    pub fn process(&mut self, input: &[IqSample]) -> Vec<IqSample> {
        if !self.enabled {
            return input.to_vec();
        }
        match self.mode {
            TedMode::MmseDecimate => self.process_decimate(input),
            TedMode::FarrowTrack => self.process_track(input),
        }
    }

    fn process_decimate(&mut self, input: &[IqSample]) -> Vec<IqSample> {
        let mut out = Vec::with_capacity(input.len() / self.omega_mid as usize + 2);
        for &sa in input {
            self.push(sa);
            if self.to_consume > 0 {
                self.to_consume -= 1;
                continue;
            }

            let current = self.interp_mmse(0, self.mu);
            let half = self.omega / 2.0;
            let mid = self.interp_mmse(half as usize, self.mu + half.fract());
            out.push(current);
            self.update(current, mid);
        }
        out
    }

    fn process_track(&mut self, input: &[IqSample]) -> Vec<IqSample> {
        let mut out = Vec::with_capacity(input.len());
        for &sa in input {
            self.push(sa);
            out.push(self.interp_cubic(0, self.mu));

            if self.to_consume > 0 {
                self.to_consume -= 1;
                continue;
            }
            let current = self.interp_cubic(0, self.mu);
            let half = self.omega / 2.0;
            let mid = self.interp_cubic(half as usize, self.mu + half.fract());
            self.update(current, mid);
        }
        out
    }

    // One Gardner loop update; sets to_consume for the next decision.
    fn update(&mut self, current: IqSample, mid: IqSample) {
        // dot-product form of the Gardner error for complex input
        let diff = self.last - current;
        let e = (diff.re * mid.re + diff.im * mid.im).clamp(-1.0, 1.0);
        self.last = current;

        let boost = if self.fast_acq_kicks > 0 {
            self.fast_acq_kicks -= 1;
            4.0
        } else {
            1.0
        };

        self.omega += boost * self.gain_omega * e;
        let lo = self.omega_mid * (1.0 - self.omega_rel);
        let hi = self.omega_mid * (1.0 + self.omega_rel);
        self.omega = self.omega.clamp(lo, hi);

        self.mu += self.omega + boost * self.gain_mu * e;
        let adv = self.mu.floor();
        self.to_consume = adv.max(1.0) as usize - 1;
        self.mu -= adv;
        // floor() guarantees this, but sign glitches at the f32 edge
        // would poison the interpolator index
        self.mu = self.mu.clamp(0.0, 1.0 - f32::EPSILON);

        self.e_ema += (e - self.e_ema) * 0.05;

        self.lock_on += current.norm_sqr();
        self.lock_mid += mid.norm_sqr();
        self.lock_count += 1;
        if self.lock_count >= LOCK_WINDOW {
            let total = self.lock_on + self.lock_mid;
            let norm = if total > 0.0 {
                (self.lock_on - self.lock_mid) / total
            } else {
                0.0
            };
            let was = self.locked;
            self.locked = norm > Self::LOCK_THRESHOLD;
            if self.locked != was {
                debug!("symsync: lock {} (metric {:.3})", self.locked, norm);
            }
            self.lock_on = 0.0;
            self.lock_mid = 0.0;
            self.lock_count = 0;
        }
    }

    #[inline]
    fn push(&mut self, sa: IqSample) {
        self.dl[self.dl_index] = sa;
        self.dl[self.dl_index + DL_SIZE] = sa;
        self.dl_index = (self.dl_index + 1) % DL_SIZE;
    }

    // Contiguous window of the `n` samples ending `back` samples ago,
    // oldest first.
    #[inline]
    fn window(&self, back: usize, n: usize) -> &[IqSample] {
        let end = self.dl_index + DL_SIZE - back;
        &self.dl[end - n..end]
    }

    // 8-tap MMSE interpolation at fractional delay `mu` within the
    // window ending `back` samples ago.
    fn interp_mmse(&self, back: usize, mu: f32) -> IqSample {
        let mu = mu.fract();
        let scaled = mu * MMSE_NSTEPS as f32;
        let k = (scaled as usize).min(MMSE_NSTEPS - 1);
        let blend = scaled - k as f32;

        let bank = mmse_bank();
        let a = &bank[k];
        let b = &bank[(k + 1).min(MMSE_NSTEPS)];

        let win = self.window(back, MMSE_NTAPS);
        let mut acc = IqSample::new(0.0, 0.0);
        for (i, &sa) in win.iter().enumerate() {
            let tap = a[i] + (b[i] - a[i]) * blend;
            acc += sa * tap;
        }
        acc
    }

    // 4-point cubic Lagrange interpolation.
    fn interp_cubic(&self, back: usize, mu: f32) -> IqSample {
        let mu = mu.fract();
        let win = self.window(back, 4);
        let (xm1, x0, x1, x2) = (win[0], win[1], win[2], win[3]);

        let c0 = x0;
        let c1 = (x1 - xm1) * 0.5;
        let c2 = xm1 - x0 * 2.5 + x1 * 2.0 - x2 * 0.5;
        let c3 = (x2 - xm1) * 0.5 + (x0 - x1) * 1.5;
        ((c3 * mu + c2) * mu + c1) * mu + c0
    }

    /// Current symbol period estimate, samples
    pub fn omega(&self) -> f32 {
        self.omega
    }

    /// Current fractional phase in `[0, 1)`
    pub fn mu(&self) -> f32 {
        self.mu
    }

    /// Smoothed timing error
    pub fn error(&self) -> f32 {
        self.e_ema
    }

    /// True while the Yair-Linn detector reports lock
    pub fn locked(&self) -> bool {
        self.locked
    }
}

// Fractional-delay bank: Hamming-windowed sinc at NSTEPS+1 phases so
// phase NSTEPS (delay 1.0) is a valid blend partner for the last step.
fn mmse_bank() -> &'static Vec<[f32; MMSE_NTAPS]> {
    use lazy_static::lazy_static;
    use std::f32::consts::PI;

    lazy_static! {
        static ref BANK: Vec<[f32; MMSE_NTAPS]> = {
            let center = (MMSE_NTAPS / 2 - 1) as f32;
            let mut bank = Vec::with_capacity(MMSE_NSTEPS + 1);
            for k in 0..=MMSE_NSTEPS {
                let d = center + k as f32 / MMSE_NSTEPS as f32;
                let mut taps = [0.0f32; MMSE_NTAPS];
                let mut sum = 0.0f32;
                for (i, tap) in taps.iter_mut().enumerate() {
                    let t = i as f32 - d;
                    let sinc = if t.abs() < 1.0e-6 {
                        1.0
                    } else {
                        (PI * t).sin() / (PI * t)
                    };
                    let w = 0.54
                        - 0.46 * (2.0 * PI * i as f32 / (MMSE_NTAPS - 1) as f32).cos();
                    *tap = sinc * w;
                    sum += *tap;
                }
                for tap in taps.iter_mut() {
                    *tap /= sum;
                }
                bank.push(taps);
            }
            bank
        };
    }
    &BANK
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_approx_eq::assert_approx_eq;

    fn square_symbols(sps: usize, nsyms: usize) -> Vec<IqSample> {
        let mut out = Vec::with_capacity(sps * nsyms);
        for k in 0..nsyms {
            let v = if k % 2 == 0 { 1.0 } else { -1.0 };
            out.extend(std::iter::repeat(IqSample::new(v, 0.0)).take(sps));
        }
        out
    }

    #[test]
    fn test_decimation_ratio() {
        let mut uut = SymbolSync::new(TedMode::MmseDecimate, 10.0, 0.025, 0.0, 0.002);
        let input = square_symbols(10, 200);
        let out = uut.process(&input);
        // one output per symbol, give or take loop settling
        assert!(out.len() >= 195 && out.len() <= 205, "got {}", out.len());
    }

    #[test]
    fn test_omega_mu_clamps() {
        let mut uut = SymbolSync::new(TedMode::MmseDecimate, 10.0, 0.25, 0.1, 0.002);
        // hostile input: random-ish magnitudes stress the loop
        let input: Vec<IqSample> = (0..4000)
            .map(|n| IqSample::new(((n * 7919) % 97) as f32 / 48.5 - 1.0, 0.0))
            .collect();
        uut.process(&input);
        assert!(uut.omega() >= 10.0 * (1.0 - 0.002));
        assert!(uut.omega() <= 10.0 * (1.0 + 0.002));
        assert!(uut.mu() >= 0.0 && uut.mu() < 1.0);
    }

    #[test]
    fn test_sps_clamp() {
        let uut = SymbolSync::new(TedMode::MmseDecimate, 100.0, 0.025, 0.0, 0.002);
        assert_approx_eq!(uut.omega(), SymbolSync::SPS_MAX, 1.0e-6);
        let uut = SymbolSync::new(TedMode::MmseDecimate, 1.0, 0.025, 0.0, 0.002);
        assert_approx_eq!(uut.omega(), SymbolSync::SPS_MIN, 1.0e-6);
    }

    #[test]
    fn test_farrow_preserves_length() {
        let mut uut = SymbolSync::new(TedMode::FarrowTrack, 10.0, 0.025, 0.0, 0.002);
        let input = square_symbols(10, 50);
        let out = uut.process(&input);
        assert_eq!(out.len(), input.len());
    }

    #[test]
    fn test_disabled_is_identity() {
        let mut uut = SymbolSync::new(TedMode::MmseDecimate, 10.0, 0.025, 0.0, 0.002);
        uut.set_enabled(false);
        let input = square_symbols(10, 20);
        assert_eq!(uut.process(&input), input);
    }

    #[test]
    fn test_set_sps_triggers_fast_acquire() {
        let mut uut = SymbolSync::new(TedMode::MmseDecimate, 10.0, 0.025, 0.0, 0.002);
        uut.set_sps(8.0);
        assert_approx_eq!(uut.omega(), 8.0f32, 1.0e-6);
        assert!(!uut.locked());
        assert!(uut.fast_acq_kicks > 0);
    }

    #[test]
    fn test_lock_detector_on_clean_symbols() {
        // alternating full-scale symbols: on-symbol energy dominates
        // the mid-symbol zero crossings once timing settles
        let mut uut = SymbolSync::new(TedMode::MmseDecimate, 10.0, 0.025, 0.0, 0.002);
        let input = square_symbols(10, 2000);
        uut.process(&input);
        assert!(uut.locked());
    }
}
