//! Vocoder bridge and per-slot jitter buffering
//!
//! Codec frames recovered by the protocol layers are 49-bit AMBE or
//! 88-bit IMBE payloads plus FEC error counts. This module applies the
//! per-call keystream at the correct bit offset, hands the frame to an
//! external [`Vocoder`] for synthesis, and parks the resulting 160
//! PCM samples in a per-slot jitter ring for the mixer to drain on its
//! own cadence.

use arraydeque::{ArrayDeque, Wrapping};
use thiserror::Error;

use crate::crypto::Algorithm;

#[cfg(not(test))]
use log::trace;

#[cfg(test)]
use std::println as trace;

/// PCM samples per codec frame (20 ms at 8 kHz)
pub const FRAME_SAMPLES: usize = 160;

/// Jitter ring depth, frames
pub const JITTER_DEPTH: usize = 8;

/// FEC error count at which keystream application is suppressed for
/// RC4 voice frames
pub const RC4_ERR_SUPPRESS: u8 = 3;

/// One recovered codec frame with its FEC error counts
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CodecFrame {
    /// 49-bit half-rate AMBE, packed MSB-first in 7 bytes
    Ambe { bits: [u8; 7], errs: u8, errs2: u8 },

    /// 88-bit full-rate IMBE, packed MSB-first in 11 bytes
    Imbe { bits: [u8; 11], errs: u8, errs2: u8 },
}

impl CodecFrame {
    /// Payload width, bits
    pub fn nbits(&self) -> usize {
        match self {
            CodecFrame::Ambe { .. } => 49,
            CodecFrame::Imbe { .. } => 88,
        }
    }

    /// Combined FEC error count
    pub fn errors(&self) -> u8 {
        match self {
            CodecFrame::Ambe { errs, errs2, .. } | CodecFrame::Imbe { errs, errs2, .. } => {
                errs.saturating_add(*errs2)
            }
        }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        match self {
            CodecFrame::Ambe { bits, .. } => bits,
            CodecFrame::Imbe { bits, .. } => bits,
        }
    }
}

/// Vocoder failure: the frame was too damaged to synthesize
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("codec frame unrecoverable ({errs} errors)")]
pub struct CodecError {
    pub errs: u8,
}

/// External voice synthesizer
///
/// Converts one codec frame into [`FRAME_SAMPLES`] PCM samples at
/// 8 kHz. Implementations may carry internal state (frame repeats,
/// comfort noise) between calls.
pub trait Vocoder: Send {
    fn synthesize(&mut self, frame: &CodecFrame) -> Result<[i16; FRAME_SAMPLES], CodecError>;
}

/// Fixed-depth ring of synthesized frames
///
/// Overflow drops the oldest frame: late audio is worse than lost
/// audio for a live receiver.
#[derive(Clone, Debug, Default)]
pub struct JitterRing {
    frames: ArrayDeque<[i16; FRAME_SAMPLES], JITTER_DEPTH, Wrapping>,
}

impl JitterRing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one frame, dropping the oldest if full
    pub fn push(&mut self, frame: [i16; FRAME_SAMPLES]) {
        if self.frames.push_back(frame).is_some() {
            trace!("jitter ring overflow; oldest frame dropped");
        }
    }

    /// Take the oldest queued frame
    pub fn pop(&mut self) -> Option<[i16; FRAME_SAMPLES]> {
        self.frames.pop_front()
    }

    /// Frames queued
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Discard all queued frames
    pub fn clear(&mut self) {
        self.frames.clear();
    }
}

// Per-slot keystream cursor state.
#[derive(Clone, Debug, Default)]
struct SlotCipher {
    ks: Vec<u8>,
    alg: Option<Algorithm>,
    // bit offset into ks; monotone within a superframe
    cursor: usize,
}

/// Bridges protocol voice frames to the vocoder and jitter rings
pub struct VocoderBridge {
    vocoder: Box<dyn Vocoder>,
    rings: [JitterRing; 2],
    ciphers: [SlotCipher; 2],
}

impl VocoderBridge {
    pub fn new(vocoder: Box<dyn Vocoder>) -> Self {
        Self {
            vocoder,
            rings: [JitterRing::new(), JitterRing::new()],
            ciphers: [SlotCipher::default(), SlotCipher::default()],
        }
    }

    /// Install keystream for a slot, resetting its bit cursor
    pub fn set_keystream(&mut self, slot: usize, alg: Algorithm, ks: Vec<u8>) {
        self.ciphers[slot & 1] = SlotCipher {
            ks,
            alg: Some(alg),
            cursor: 0,
        };
    }

    /// Drop keystream state for a slot
    pub fn clear_keystream(&mut self, slot: usize) {
        self.ciphers[slot & 1] = SlotCipher::default();
    }

    /// Rewind a slot's keystream cursor (superframe boundary or sync
    /// loss, per protocol rules)
    pub fn reset_cursor(&mut self, slot: usize) {
        self.ciphers[slot & 1].cursor = 0;
    }

    /// Decrypt (if keyed), synthesize, and enqueue one voice frame
    ///
    /// The keystream cursor always advances by the frame width, even
    /// when application is suppressed, so later frames stay aligned.
    pub fn push_frame(&mut self, slot: usize, mut frame: CodecFrame) -> Result<(), CodecError> {
        let slot = slot & 1;
        let nbits = frame.nbits();
        let cipher = &mut self.ciphers[slot];

        if !cipher.ks.is_empty() {
            // badly damaged RC4 frames make loud pops when XORed with
            // a misaligned-looking stream; pass them through raw
            let suppress =
                cipher.alg == Some(Algorithm::Rc4) && frame.errors() >= RC4_ERR_SUPPRESS;
            if !suppress {
                xor_bits(frame.bytes_mut(), &cipher.ks, cipher.cursor, nbits);
            }
            cipher.cursor += nbits;
        }

        let pcm = self.vocoder.synthesize(&frame)?;
        self.rings[slot].push(pcm);
        Ok(())
    }

    /// Drain one frame from a slot's ring
    pub fn pop(&mut self, slot: usize) -> Option<[i16; FRAME_SAMPLES]> {
        self.rings[slot & 1].pop()
    }

    /// Frames queued on a slot
    pub fn queued(&self, slot: usize) -> usize {
        self.rings[slot & 1].len()
    }

    /// Drop all buffered audio and cipher state for a slot
    pub fn reset_slot(&mut self, slot: usize) {
        self.rings[slot & 1].clear();
        self.clear_keystream(slot);
    }
}

impl std::fmt::Debug for VocoderBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VocoderBridge")
            .field("queued", &[self.rings[0].len(), self.rings[1].len()])
            .finish()
    }
}

// XOR `nbits` of keystream (starting at bit `cursor`) into a packed
// MSB-first bit array.
fn xor_bits(buf: &mut [u8], ks: &[u8], cursor: usize, nbits: usize) {
    for i in 0..nbits {
        let kbit = cursor + i;
        if kbit / 8 >= ks.len() {
            break;
        }
        let k = (ks[kbit / 8] >> (7 - kbit % 8)) & 1;
        buf[i / 8] ^= k << (7 - i % 8);
    }
}
