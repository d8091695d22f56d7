//! Complex DC blocker

use crate::IqSample;

/// Leaky-integrator DC blocker for complex baseband
///
/// Tracks the running DC offset of both rails with
/// `dc += (x − dc) · 2⁻ᵏ` and subtracts it from the signal. Larger `k`
/// means a slower, narrower notch. The shift is configurable in
/// `[6, 15]`; out-of-range values are clamped.
///
/// Zero-IF front ends park a large DC spike at the channel center;
/// removing it before the discriminator keeps the FM audio and the
/// C4FM symbol levels unbiased.
#[derive(Clone, Debug)]
pub struct DcBlocker {
    // leak shift; pole at 1 - 2^-k
    shift: u32,

    // running DC estimate
    dc: IqSample,
}

impl DcBlocker {
    /// Minimum permitted leak shift
    pub const MIN_SHIFT: u32 = 6;

    /// Maximum permitted leak shift
    pub const MAX_SHIFT: u32 = 15;

    /// Create a DC blocker with leak shift `k`
    pub fn new(k: u32) -> Self {
        Self {
            shift: k.clamp(Self::MIN_SHIFT, Self::MAX_SHIFT),
            dc: IqSample::new(0.0, 0.0),
        }
    }

    /// Reset to zero initial conditions
    pub fn reset(&mut self) {
        self.dc = IqSample::new(0.0, 0.0);
    }

    /// Remove DC from one sample
    #[inline]
    pub fn filter(&mut self, input: IqSample) -> IqSample {
        let alpha = 1.0f32 / (1u32 << self.shift) as f32;
        self.dc += (input - self.dc) * alpha;
        input - self.dc
    }

    /// Remove DC from a block in place
    pub fn filter_block(&mut self, block: &mut [IqSample]) {
        for sa in block.iter_mut() {
            *sa = self.filter(*sa);
        }
    }

    /// Current DC estimate
    pub fn dc_estimate(&self) -> IqSample {
        self.dc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_shift_clamp() {
        assert_eq!(DcBlocker::new(0).shift, DcBlocker::MIN_SHIFT);
        assert_eq!(DcBlocker::new(30).shift, DcBlocker::MAX_SHIFT);
        assert_eq!(DcBlocker::new(11).shift, 11);
    }

    #[test]
    fn test_dc_removal() {
        let mut uut = DcBlocker::new(6);
        let mut out = IqSample::new(0.0, 0.0);
        for _i in 0..4096 {
            out = uut.filter(IqSample::new(100.0, -50.0));
        }
        assert_approx_eq!(out.re, 0.0f32, 1.0e-1);
        assert_approx_eq!(out.im, 0.0f32, 1.0e-1);
        assert_approx_eq!(uut.dc_estimate().re, 100.0f32, 1.0e-1);
    }

    #[test]
    fn test_ac_preserved() {
        // a fast alternating signal rides through nearly untouched
        let mut uut = DcBlocker::new(11);
        let mut clk = 1.0f32;
        let mut out = IqSample::new(0.0, 0.0);
        for _i in 0..1024 {
            out = uut.filter(IqSample::new(100.0 + clk, 0.0));
            clk = -clk;
        }
        assert!(out.re.abs() > 0.5);
    }
}
