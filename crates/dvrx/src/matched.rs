//! Root-raised-cosine matched filtering
//!
//! C4FM and CQPSK transmitters shape their symbols with a
//! root-raised-cosine pulse; running the conjugate RRC at the receiver
//! completes the raised-cosine response and maximizes SNR at the
//! symbol decision instants. Tap sets are designed in closed form and
//! memoized by `(sps, rolloff, span)` since the same few designs recur
//! across retunes.

use std::collections::HashMap;
use std::f32::consts::PI;
use std::sync::Arc;
use std::sync::Mutex;

use lazy_static::lazy_static;

use crate::filter::FilterCoeff;
use crate::IqSample;

lazy_static! {
    // design cache; rolloff keyed by its bit pattern
    static ref TAP_CACHE: Mutex<HashMap<(u32, u32, u32), Arc<Vec<f32>>>> =
        Mutex::new(HashMap::new());
}

/// One closed-form RRC tap at symbol-normalized time `t`
///
/// Handles the removable singularities at `t = 0` and
/// `|t| = 1/(4·rolloff)` explicitly.
pub(crate) fn rrc_tap(t: f32, rolloff: f32) -> f32 {
    let a = rolloff;
    if t.abs() < 1.0e-6 {
        1.0 - a + 4.0 * a / PI
    } else if (t.abs() - 1.0 / (4.0 * a)).abs() < 1.0e-6 {
        (a / 2.0f32.sqrt())
            * ((1.0 + 2.0 / PI) * (PI / (4.0 * a)).sin()
                + (1.0 - 2.0 / PI) * (PI / (4.0 * a)).cos())
    } else {
        let num = (PI * t * (1.0 - a)).sin() + 4.0 * a * t * (PI * t * (1.0 + a)).cos();
        let den = PI * t * (1.0 - (4.0 * a * t) * (4.0 * a * t));
        num / den
    }
}

/// Design (or fetch from cache) an RRC tap set
///
/// `sps` is samples per symbol, `span` the filter length in symbols.
/// The returned kernel has `sps * span + 1` taps and unity DC gain.
pub fn design_rrc(sps: u32, rolloff: f32, span: u32) -> Arc<Vec<f32>> {
    let key = (sps, rolloff.to_bits(), span);
    let mut cache = TAP_CACHE.lock().expect("rrc cache poisoned");
    if let Some(h) = cache.get(&key) {
        return h.clone();
    }

    let n = (sps * span + 1) as usize;
    let mid = (n / 2) as i32;
    let mut h: Vec<f32> = (0..n)
        .map(|i| rrc_tap((i as i32 - mid) as f32 / sps as f32, rolloff))
        .collect();
    let sum: f32 = h.iter().sum();
    for tap in h.iter_mut() {
        *tap /= sum;
    }

    let h = Arc::new(h);
    cache.insert(key, h.clone());
    h
}

/// Streaming RRC matched filter
#[derive(Clone, Debug)]
pub struct MatchedFilter {
    coeff: FilterCoeff<f32>,
    hist: Vec<IqSample>,
}

impl MatchedFilter {
    /// Default excess bandwidth for C4FM-family shaping
    pub const DEFAULT_ROLLOFF: f32 = 0.2;

    /// Default filter span, symbols
    pub const DEFAULT_SPAN: u32 = 5;

    /// Create a matched filter for the given samples-per-symbol
    pub fn new(sps: u32, rolloff: f32, span: u32) -> Self {
        let h = design_rrc(sps.max(1), rolloff.clamp(0.05, 1.0), span.max(1));
        let taps = h.len();
        Self {
            coeff: FilterCoeff::from_slice(h.as_slice()),
            hist: vec![IqSample::new(0.0, 0.0); taps - 1],
        }
    }

    /// Reset the delay line to zero
    pub fn reset(&mut self) {
        self.hist.fill(IqSample::new(0.0, 0.0));
    }

    /// Filter one block in place
    pub fn process(&mut self, block: &mut [IqSample]) {
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

    #[test]
    fn test_design_symmetry_and_gain() {
        let h = design_rrc(10, 0.2, 5);
        assert_eq!(h.len(), 51);

        // even symmetry about the center tap
        for i in 0..h.len() / 2 {
            assert_approx_eq!(h[i], h[h.len() - 1 - i], 1.0e-6);
        }

        // unity DC gain
        let sum: f32 = h.iter().sum();
        assert_approx_eq!(sum, 1.0f32, 1.0e-5);

        // peak at center
        let mid = h.len() / 2;
        for (i, &tap) in h.iter().enumerate() {
            if i != mid {
                assert!(tap < h[mid]);
            }
        }
    }

    #[test]
    fn test_design_cache_hits() {
        let a = design_rrc(10, 0.2, 5);
        let b = design_rrc(10, 0.2, 5);
        assert!(Arc::ptr_eq(&a, &b));

        let c = design_rrc(10, 0.35, 5);
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn test_singularity_taps_finite() {
        // t = 1/(4α) lands exactly on a tap for α = 0.25, sps = 4
        let h = design_rrc(4, 0.25, 8);
        for &tap in h.iter() {
            assert!(tap.is_finite());
        }
    }

    #[test]
    fn test_dc_passes() {
        let mut mf = MatchedFilter::new(10, 0.2, 5);
        let mut blk = vec![IqSample::new(1.0, 0.0); 256];
        mf.process(&mut blk);
        assert_approx_eq!(blk[200].re, 1.0f32, 1.0e-3);
        assert_approx_eq!(blk[200].im, 0.0f32, 1.0e-3);
    }

    #[test]
    fn test_streaming_matches_one_shot() {
        let mut one = MatchedFilter::new(10, 0.2, 5);
        let mut two = MatchedFilter::new(10, 0.2, 5);

        let blk = crate::testutil::tone(1200.0, 48000.0, 1.0, 1024);
        let mut whole = blk.clone();
        one.process(&mut whole);

        let mut head = blk[..300].to_vec();
        let mut tail = blk[300..].to_vec();
        two.process(&mut head);
        two.process(&mut tail);
        head.extend(tail);

        for (a, b) in whole.iter().zip(head.iter()) {
            assert_approx_eq!(a.re, b.re, 1.0e-5);
            assert_approx_eq!(a.im, b.im, 1.0e-5);
        }
    }
}
