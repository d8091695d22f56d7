//! Discriminators: FM and differential QPSK
//!
//! Both run the same quadrature algebra, `Δφ = arg(z · z_prev*)`,
//! emitting the phase delta in Q14 where π maps to `1 << 14`. The FM
//! path treats the deltas as audio; the DQPSK path feeds them to a
//! sector slicer that maps each delta to a dibit.

use crate::{IqSample, Q14_PI};

/// Discriminator selection for the pipeline driver
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, strum_macros::Display)]
pub enum Discriminator {
    /// Quadrature FM, Q14 audio out
    #[default]
    Fm,

    /// Differential QPSK, Q14 deltas sliced to dibits downstream
    DifferentialQpsk,

    /// No discrimination; raw complex passthrough
    Raw,
}

/// Quadrature phase-delta demodulator
#[derive(Clone, Debug)]
pub struct PhaseDemod {
    prev: IqSample,
}

impl PhaseDemod {
    pub fn new() -> Self {
        Self {
            prev: IqSample::new(1.0, 0.0),
        }
    }

    /// Reset the differential reference
    pub fn reset(&mut self) {
        self.prev = IqSample::new(1.0, 0.0);
    }

    /// Demodulate one sample to a Q14 phase delta
    #[inline]
    pub fn demod(&mut self, z: IqSample) -> i16 {
        let d = z * self.prev.conj();
        self.prev = z;
        phase_q14(d)
    }

    /// Demodulate a block
    pub fn process(&mut self, block: &[IqSample]) -> Vec<i16> {
        block.iter().map(|&z| self.demod(z)).collect()
    }
}

impl Default for PhaseDemod {
    fn default() -> Self {
        Self::new()
    }
}

/// Convert a complex rotation to Q14 phase, saturated to `i16`
#[inline]
pub fn phase_q14(d: IqSample) -> i16 {
    let ph = d.im.atan2(d.re) / std::f32::consts::PI * Q14_PI as f32;
    ph.round().clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// Slice a Q14 DQPSK phase delta to a dibit
///
/// Sector boundaries sit at 0 and ±π/2; the nominal constellation
/// points are ±π/4 and ±3π/4.
///
/// ```text
///   +π/4 -> 0b00      +3π/4 -> 0b01
///   -π/4 -> 0b10      -3π/4 -> 0b11
/// ```
#[inline]
pub fn dqpsk_dibit(delta_q14: i16) -> u8 {
    let half_pi = (Q14_PI / 2) as i16;
    if delta_q14 >= half_pi {
        0b01
    } else if delta_q14 >= 0 {
        0b00
    } else if delta_q14 > -half_pi {
        0b10
    } else {
        0b11
    }
}
