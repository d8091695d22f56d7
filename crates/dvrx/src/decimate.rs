//! Rate reduction: half-band cascade and channel low-pass
//!
//! The input from the SDR front end arrives well above the working
//! rate. A cascade of half-band FIR stages halves the rate `passes`
//! times: stage 0 uses a longer 31-tap kernel with the heavier
//! stopband, later stages share a 15-tap kernel since each successive
//! octave relaxes the transition band. A fixed 63-tap windowed-sinc
//! channel low-pass then shapes the channel at the working rate, in
//! either a wide (analog FM) or digital-narrow profile.

use crate::filter::{windowed_sinc, FilterCoeff};
use crate::IqSample;

/// Channel low-pass profile
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, strum_macros::Display)]
pub enum LpfProfile {
    /// Wide profile, fc ≈ 8 kHz, for analog FM audio
    #[default]
    Wide,

    /// Narrow profile, fc ≈ 5 kHz at 24 kHz Fs, for digital voice
    Digital,
}

/// Maximum number of half-band passes
pub const MAX_PASSES: u32 = 8;

// stage-0 kernel length (wide transition, heavier stopband)
const HB0_TAPS: usize = 31;

// shared kernel length for stages 1..N
const HB_TAPS: usize = 15;

// channel LPF length
const CHAN_TAPS: usize = 63;

/// Half-band decimation cascade with optional channel LPF
#[derive(Clone, Debug)]
pub struct Decimator {
    stages: Vec<HalfBandStage>,
    channel: Option<ChannelLpf>,
}

impl Decimator {
    /// Create a cascade of `passes` half-band stages
    ///
    /// `passes` is clamped to `[0, 8]`. With `channel` set, the 63-tap
    /// channel low-pass runs at the decimated rate; `output_rate` is
    /// needed to place its cutoff.
    pub fn new(passes: u32, channel: Option<LpfProfile>, output_rate: u32) -> Self {
        let passes = passes.min(MAX_PASSES);
        let mut stages = Vec::with_capacity(passes as usize);
        for i in 0..passes {
            let taps = if i == 0 { HB0_TAPS } else { HB_TAPS };
            stages.push(HalfBandStage::new(taps));
        }
        Self {
            stages,
            channel: channel.map(|p| ChannelLpf::new(p, output_rate)),
        }
    }

    /// Number of half-band passes
    pub fn passes(&self) -> u32 {
        self.stages.len() as u32
    }

    /// Reset all stage histories to zero
    pub fn reset(&mut self) {
        for st in self.stages.iter_mut() {
            st.reset();
        }
        if let Some(ch) = self.channel.as_mut() {
            ch.reset();
        }
    }

    /// Decimate one block
    ///
    /// An input of even length `L` produces exactly `L / 2^passes`
    /// output samples (provided `L` is divisible by `2^passes`, which
    /// the intake layer guarantees by sizing blocks as multiples of
    /// 256). Zero-length input yields zero-length output with no
    /// filtering.
    pub fn process(&mut self, input: &[IqSample]) -> Vec<IqSample> {
        if input.is_empty() {
            return Vec::new();
        }

        // double-buffer between two scratch vectors so no stage reads
        // storage it is writing
        let mut cur = input.to_vec();
        for st in self.stages.iter_mut() {
            cur = st.process(&cur);
        }
        if let Some(ch) = self.channel.as_mut() {
            ch.process(&mut cur);
        }
        cur
    }
}

// One decimate-by-two FIR stage with inter-block history
#[derive(Clone, Debug)]
struct HalfBandStage {
    coeff: FilterCoeff<f32>,
    hist: Vec<IqSample>,
}

impl HalfBandStage {
    fn new(taps: usize) -> Self {
        // half-band: cutoff at a quarter of the input rate
        let h = windowed_sinc(taps, 0.25);
        Self {
            coeff: FilterCoeff::from_slice(&h),
            hist: vec![IqSample::new(0.0, 0.0); taps - 1],
        }
    }

    fn reset(&mut self) {
        self.hist.fill(IqSample::new(0.0, 0.0));
    }

    fn process(&mut self, input: &[IqSample]) -> Vec<IqSample> {
        let taps = self.coeff.len();
        let mut buf = Vec::with_capacity(self.hist.len() + input.len());
        buf.extend_from_slice(&self.hist);
        buf.extend_from_slice(input);

        let mut out = Vec::with_capacity(input.len() / 2 + 1);
        let mut n = 0usize;
        while n < input.len() {
            // most recent sample of this output's window
            let end = n + self.hist.len();
            let start = end + 1 - taps;
            out.push(self.coeff.filter(&buf[start..=end]));
            n += 2;
        }

        let keep = taps - 1;
        self.hist.clear();
        self.hist.extend_from_slice(&buf[buf.len() - keep..]);
        out
    }
}

// 63-tap channel low-pass at the working rate
#[derive(Clone, Debug)]
struct ChannelLpf {
    coeff: FilterCoeff<f32>,
    hist: Vec<IqSample>,
}

impl ChannelLpf {
    fn new(profile: LpfProfile, rate: u32) -> Self {
        let fc_hz = match profile {
            LpfProfile::Wide => 8000.0f32,
            LpfProfile::Digital => 5000.0f32,
        };
        let cutoff = (fc_hz / rate.max(1) as f32).clamp(0.01, 0.45);
        let h = windowed_sinc(CHAN_TAPS, cutoff);
        Self {
            coeff: FilterCoeff::from_slice(&h),
            hist: vec![IqSample::new(0.0, 0.0); CHAN_TAPS - 1],
        }
    }

    fn reset(&mut self) {
        self.hist.fill(IqSample::new(0.0, 0.0));
    }

    fn process(&mut self, block: &mut [IqSample]) {
        if block.is_empty() {
            return;
        }

        let taps = self.coeff.len();
        let mut buf = Vec::with_capacity(self.hist.len() + block.len());
        buf.extend_from_slice(&self.hist);
        buf.extend_from_slice(block);

        for (n, out) in block.iter_mut().enumerate() {
            let end = n + taps - 1;
            *out = self.coeff.filter(&buf[end + 1 - taps..=end]);
        }

        self.hist.clear();
        self.hist.extend_from_slice(&buf[buf.len() - (taps - 1)..]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_approx_eq::assert_approx_eq;

    use crate::testutil::tone;

    #[test]
    fn test_length_law() {
        // output length equals L / 2^N for every pass count
        for passes in 0..=MAX_PASSES {
            let mut dec = Decimator::new(passes, None, 24000);
            let blk = vec![IqSample::new(1.0, 0.0); 1024];
            let out = dec.process(&blk);
            assert_eq!(out.len(), 1024 >> passes, "passes={}", passes);
        }
    }

    #[test]
    fn test_zero_length_skips() {
        let mut dec = Decimator::new(2, Some(LpfProfile::Wide), 24000);
        assert!(dec.process(&[]).is_empty());
    }

    #[test]
    fn test_dc_gain() {
        // DC gain within 0.5 dB through three stages plus channel LPF
        let mut dec = Decimator::new(3, Some(LpfProfile::Wide), 24000);
        let blk = vec![IqSample::new(1.0, 0.0); 4096];
        let out = dec.process(&blk);
        let settled = &out[out.len() / 2..];
        for sa in settled {
            assert!(sa.re > 0.944 && sa.re < 1.059, "DC gain off: {}", sa.re);
        }
    }

    #[test]
    fn test_stopband_rejection() {
        // a tone near the input Nyquist must be strongly attenuated
        // after one halving
        let mut dec = Decimator::new(1, None, 24000);
        let blk = tone(22000.0, 48000.0, 1.0, 8192);
        let out = dec.process(&blk);
        let tail = &out[out.len() / 2..];
        let pwr: f32 = tail.iter().map(|z| z.norm_sqr()).sum::<f32>() / tail.len() as f32;
        // -60 dBc: the 31-tap Blackman design clears this with margin
        assert!(pwr < 1.0e-6, "stopband leak: {}", pwr);
    }

    #[test]
    fn test_streaming_matches_one_shot() {
        let mut one = Decimator::new(2, None, 24000);
        let mut two = Decimator::new(2, None, 24000);

        let blk = tone(1000.0, 48000.0, 1.0, 2048);
        let whole = one.process(&blk);
        let mut parts = two.process(&blk[..1024]);
        parts.extend(two.process(&blk[1024..]));

        assert_eq!(whole.len(), parts.len());
        for (a, b) in whole.iter().zip(parts.iter()) {
            assert_approx_eq!(a.re, b.re, 1.0e-5);
            assert_approx_eq!(a.im, b.im, 1.0e-5);
        }
    }
}
