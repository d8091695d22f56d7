//! FIR filter primitives
//!
//! [`FilterCoeff`] holds an impulse response and implements the
//! multiply-accumulate half of FIR filtering. [`Window`] is the sliding
//! sample-history half. Split this way, one set of coefficients can be
//! shared by the I and Q rails, and interpolators can index into the
//! raw history directly.
//!
//! The sample history convention is oldest-first: `history[0]` is the
//! least recent sample and `history[N-1]` the most recent. Coefficients
//! are stored reversed so the multiply-accumulate walks both slices
//! forward.

use std::collections::VecDeque;
use std::convert::AsRef;

use nalgebra::base::Scalar;
use nalgebra::DVector;
use num_traits::{One, Zero};

/// FIR filter coefficients
///
/// Coefficients are stored in *reverse* order of their textbook
/// representation; see the module documentation.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterCoeff<T>(DVector<T>)
where
    T: Copy + Scalar + One + Zero;

impl<T> FilterCoeff<T>
where
    T: Copy + Scalar + One + Zero,
{
    /// Create from an impulse response slice
    pub fn from_slice<S>(h: S) -> Self
    where
        S: AsRef<[T]>,
    {
        let inp = h.as_ref();
        FilterCoeff(DVector::from_iterator(
            inp.len(),
            inp.iter().rev().copied(),
        ))
    }

    /// Number of filter coefficients
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if there are no coefficients
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Multiply-accumulate against the given sample history
    ///
    /// `history[N-1]` must be the most recent sample. If the history is
    /// shorter than the coefficients, the missing samples are taken as
    /// zero; if longer, the oldest excess samples are ignored.
    pub fn filter<I, In, Out>(&self, history: I) -> Out
    where
        I: AsRef<[In]>,
        In: Copy + Scalar + std::ops::Mul<T, Output = Out>,
        Out: Copy + Scalar + Zero + std::ops::AddAssign,
    {
        multiply_accumulate(history.as_ref(), self.0.as_slice())
    }

    /// Coefficients as a slice, in reverse order
    #[inline]
    pub fn as_slice(&self) -> &[T] {
        self.0.as_slice()
    }
}

impl<T> AsRef<[T]> for FilterCoeff<T>
where
    T: Copy + Scalar + One + Zero,
{
    #[inline]
    fn as_ref(&self) -> &[T] {
        self.as_slice()
    }
}

/// Sliding sample-history window
///
/// Fixed length, zero-filled at creation. New samples are pushed onto
/// the right; old samples age off the left.
#[derive(Clone, Debug)]
pub struct Window<T>(VecDeque<T>)
where
    T: Copy + Zero;

impl<T> Window<T>
where
    T: Copy + Zero,
{
    /// Create a zero-filled window of length `len`
    pub fn new(len: usize) -> Self {
        let mut out = Self(VecDeque::with_capacity(len));
        for _i in 0..len {
            out.0.push_back(T::zero());
        }
        out
    }

    /// Reset to zero initial conditions
    pub fn reset(&mut self) {
        let len = self.0.len();
        self.0.clear();
        for _i in 0..len {
            self.0.push_back(T::zero());
        }
    }

    /// Window length
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if the window has zero length
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Push one sample, returning the sample that aged off
    #[inline]
    pub fn push_scalar(&mut self, input: T) -> T {
        let aged = self.0.pop_front().unwrap_or_else(T::zero);
        self.0.push_back(input);
        aged
    }

    /// Oldest sample in the window
    #[inline]
    pub fn front(&self) -> T {
        *self.0.front().expect("empty window")
    }

    /// Window contents, oldest-first
    ///
    /// The deque is kept contiguous, so this is cheap.
    pub fn as_slice(&mut self) -> &[T] {
        self.0.make_contiguous();
        let (head, _) = self.0.as_slices();
        head
    }

    /// Sample at position `idx`, where 0 is the oldest
    #[inline]
    pub fn at(&self, idx: usize) -> T {
        self.0[idx]
    }
}

// Multiply-accumulate: out = Σ history[i] · rev_coeff[i], clipped to
// the shorter of the two, aligned at the recent end.
fn multiply_accumulate<In, Coeff, Out>(history: &[In], rev_coeff: &[Coeff]) -> Out
where
    In: Copy + std::ops::Mul<Coeff, Output = Out>,
    Coeff: Copy,
    Out: Copy + Zero + std::ops::AddAssign,
{
    let mul_len = usize::min(history.len(), rev_coeff.len());
    let history = &history[history.len() - mul_len..];
    let rev_coeff = &rev_coeff[rev_coeff.len() - mul_len..];

    let mut out = Out::zero();
    for (hi, co) in history.iter().zip(rev_coeff.iter()) {
        out += *hi * *co;
    }
    out
}

/// Design a Blackman-windowed sinc low-pass filter
///
/// `cutoff` is the normalized cutoff frequency (Nyquist = 0.5). Taps
/// are normalized to unity DC gain. `taps` should be odd for linear
/// phase with integer delay. The Blackman window trades transition
/// width for better than 70 dB of stopband attenuation.
pub fn windowed_sinc(taps: usize, cutoff: f32) -> Vec<f32> {
    use std::f32::consts::PI;
    assert!(taps > 0);
    assert!(cutoff > 0.0 && cutoff <= 0.5);

    let mid = (taps / 2) as isize;
    let mut h = Vec::with_capacity(taps);
    for n in 0..taps {
        let x = n as isize - mid;
        let sinc = if x == 0 {
            2.0 * cutoff
        } else {
            (2.0 * cutoff * PI * x as f32).sin() / (PI * x as f32)
        };
        let t = (2.0 * PI * n as f32) / (taps as f32 - 1.0);
        let window = 0.42 - 0.5 * t.cos() + 0.08 * (2.0 * t).cos();
        h.push(sinc * window);
    }

    let norm: f32 = h.iter().sum();
    for v in h.iter_mut() {
        *v /= norm;
    }
    h
}
