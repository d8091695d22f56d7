//! Envelope automatic gain control

use crate::IqSample;

/// Block-envelope AGC for FM-family paths
///
/// Computes the RMS magnitude of each block, derives a raw gain of
/// `target_rms / rms`, and slews the applied gain toward it. Separate
/// smoothing constants are used for gain increases (`alpha_up`) and
/// decreases (`alpha_down`) so the AGC can back off fast on strong
/// signals while ramping up gently out of noise.
///
/// CQPSK amplitude carries information through the matched filter, so
/// the pipeline driver must not run this stage on CQPSK paths.
#[derive(Clone, Debug)]
pub struct EnvelopeAgc {
    // desired block RMS of |z|
    target_rms: f32,

    // blocks quieter than this are left alone
    min_rms: f32,

    // smoothing toward a larger gain
    alpha_up: f32,

    // smoothing toward a smaller gain
    alpha_down: f32,

    // applied gain
    gain: f32,

    // per-sample limiter enable
    limiter: bool,
}

impl EnvelopeAgc {
    /// Raw gain clamp, low side
    const GAIN_RAW_MIN: f32 = 0.125;

    /// Raw gain clamp, high side
    const GAIN_RAW_MAX: f32 = 8.0;

    /// Applied gain clamp (Q15 1024 .. 262144 in the fixed-point original)
    const GAIN_MIN: f32 = 1024.0 / 32768.0;
    const GAIN_MAX: f32 = 262144.0 / 32768.0;

    // limiter tolerance band around the target magnitude
    const LIMIT_LOW: f32 = 0.5 * 0.5;
    const LIMIT_HIGH: f32 = 2.0 * 2.0;

    /// Create an AGC targeting the given block RMS
    ///
    /// `alpha_up` and `alpha_down` are smoothing fractions in
    /// `[0.0, 1.0]`; 1.0 snaps to the raw gain immediately.
    pub fn new(target_rms: f32, min_rms: f32, alpha_up: f32, alpha_down: f32) -> Self {
        Self {
            target_rms,
            min_rms,
            alpha_up: alpha_up.clamp(0.0, 1.0),
            alpha_down: alpha_down.clamp(0.0, 1.0),
            gain: 1.0,
            limiter: false,
        }
    }

    /// Reset to unity gain
    pub fn reset(&mut self) {
        self.gain = 1.0;
    }

    /// Enable or disable the per-sample limiter
    pub fn set_limiter(&mut self, enable: bool) {
        self.limiter = enable;
    }

    /// Normalize one block in place
    ///
    /// Updates the gain from the block RMS, then scales every sample.
    /// Blocks below `min_rms` only apply the previous gain.
    pub fn process(&mut self, block: &mut [IqSample]) {
        if block.is_empty() {
            return;
        }

        let power: f32 = block.iter().map(|z| z.norm_sqr()).sum::<f32>() / block.len() as f32;
        let rms = power.sqrt();

        if rms >= self.min_rms {
            // rms is pre-gain, so this is the absolute gain wanted
            let raw = (self.target_rms / rms).clamp(Self::GAIN_RAW_MIN, Self::GAIN_RAW_MAX);
            let alpha = if raw > self.gain {
                self.alpha_up
            } else {
                self.alpha_down
            };
            self.gain += (raw - self.gain) * alpha;
            self.gain = self.gain.clamp(Self::GAIN_MIN, Self::GAIN_MAX);
        }

        let target_sq = self.target_rms * self.target_rms;
        for sa in block.iter_mut() {
            *sa *= self.gain;
            if self.limiter {
                let mag_sq = sa.norm_sqr();
                if mag_sq > Self::LIMIT_HIGH * target_sq || mag_sq < Self::LIMIT_LOW * target_sq {
                    if mag_sq > 0.0 {
                        *sa *= self.target_rms / mag_sq.sqrt();
                    }
                }
            }
        }
    }

    /// Current applied gain
    pub fn gain(&self) -> f32 {
        self.gain
    }

    /// Current applied gain in Q15
    pub fn gain_q15(&self) -> i32 {
        (self.gain * 32768.0) as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_approx_eq::assert_approx_eq;

    fn block_of(mag: f32, n: usize) -> Vec<IqSample> {
        vec![IqSample::new(mag, 0.0); n]
    }

    #[test]
    fn test_converges_to_target() {
        let mut agc = EnvelopeAgc::new(1.0, 0.0, 0.5, 0.5);
        let mut blk = block_of(4.0, 64);
        for _i in 0..64 {
            blk = block_of(4.0, 64);
            agc.process(&mut blk);
        }
        // output RMS near target
        let rms = (blk.iter().map(|z| z.norm_sqr()).sum::<f32>() / blk.len() as f32).sqrt();
        assert_approx_eq!(rms, 1.0f32, 1.0e-2);
        assert_approx_eq!(agc.gain(), 0.25f32, 1.0e-2);
    }

    #[test]
    fn test_quiet_block_holds_gain() {
        let mut agc = EnvelopeAgc::new(1.0, 0.5, 1.0, 1.0);
        let mut blk = block_of(4.0, 32);
        agc.process(&mut blk);
        let held = agc.gain();

        // below min_rms: gain must not move
        let mut quiet = block_of(0.01, 32);
        agc.process(&mut quiet);
        assert_eq!(held, agc.gain());
    }

    #[test]
    fn test_gain_clamps() {
        let mut agc = EnvelopeAgc::new(10000.0, 0.0, 1.0, 1.0);
        let mut blk = block_of(0.001, 32);
        for _i in 0..64 {
            blk = block_of(0.001, 32);
            agc.process(&mut blk);
        }
        assert!(agc.gain() <= EnvelopeAgc::GAIN_MAX);

        let mut agc = EnvelopeAgc::new(0.0001, 0.0, 1.0, 1.0);
        for _i in 0..64 {
            blk = block_of(1000.0, 32);
            agc.process(&mut blk);
        }
        assert!(agc.gain() >= EnvelopeAgc::GAIN_MIN);
    }

    #[test]
    fn test_limiter_bounds_magnitude() {
        let mut agc = EnvelopeAgc::new(1.0, 0.0, 1.0, 1.0);
        agc.set_limiter(true);
        // one wild outlier inside an otherwise steady block
        let mut blk = block_of(1.0, 64);
        blk[10] = IqSample::new(50.0, 0.0);
        agc.process(&mut blk);
        assert!(blk[10].norm() <= 2.0 * 1.0 + 1.0e-3);
    }
}
