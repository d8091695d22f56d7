//! Audio mixing, per-slot gain, and output formatting
//!
//! The mixer drains synthesized 160-sample frames from the two slot
//! jitter rings and produces interleaved output for the sink. Slot 0
//! maps to the left channel and slot 1 to the right; mono output sums
//! both. A muted or missing slot contributes silence, and a frame
//! where every contributor is silent is skipped entirely (no all-zero
//! blocks are emitted).
//!
//! Gain normalization (`agf` in the config surface) runs in 20-sample
//! windows across each frame, adapting toward a target average
//! magnitude; an optional one-pole high-pass removes vocoder DC before
//! the gain stage.

use crate::vocoder::FRAME_SAMPLES;

/// Frames per DMR BS voice superframe drained per mix call
pub const DMR_3V2_FRAMES: usize = 3;

/// Frames per P25 Phase 2 superframe drained per slot
pub const P25P2_4V2_FRAMES: usize = 4;

/// Sink sample layout
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, strum_macros::Display)]
pub enum OutputFormat {
    /// 8 kHz mono PCM16, slots summed
    #[default]
    Pcm8kMono,

    /// 8 kHz stereo PCM16, slot 0 left / slot 1 right
    Pcm8kStereo,

    /// 48 kHz mono PCM16, nearest-neighbor upsampled 6x
    Pcm48kMono,
}

/// Windowed automatic gain for one audio slot
///
/// Adapts in 20-sample windows toward a target average magnitude of
/// 0.075 (full scale 1.0), with the gain held inside `[1.0, 46.0]`
/// and the output hard-clipped at ±0.9.
#[derive(Clone, Debug)]
pub struct AudioAgc {
    gain: f32,
}

impl AudioAgc {
    const TARGET: f32 = 0.075;
    const GAIN_MIN: f32 = 1.0;
    const GAIN_MAX: f32 = 46.0;
    const CLIP: f32 = 0.9;
    const WINDOW: usize = 20;

    pub fn new() -> Self {
        Self { gain: Self::GAIN_MIN }
    }

    pub fn reset(&mut self) {
        self.gain = Self::GAIN_MIN;
    }

    /// Normalize one frame in place
    pub fn process(&mut self, frame: &mut [f32]) {
        for win in frame.chunks_mut(Self::WINDOW) {
            let avg: f32 = win.iter().map(|s| s.abs()).sum::<f32>() / win.len() as f32;
            if avg > 1.0e-6 {
                let desired = (Self::TARGET / avg).clamp(Self::GAIN_MIN, Self::GAIN_MAX);
                self.gain += (desired - self.gain) * 0.125;
                self.gain = self.gain.clamp(Self::GAIN_MIN, Self::GAIN_MAX);
            }
            for sa in win.iter_mut() {
                *sa = (*sa * self.gain).clamp(-Self::CLIP, Self::CLIP);
            }
        }
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }
}

impl Default for AudioAgc {
    fn default() -> Self {
        Self::new()
    }
}

/// One-pole high-pass for vocoder DC removal
#[derive(Clone, Debug)]
pub struct OnePoleHpf {
    alpha: f32,
    prev_in: f32,
    prev_out: f32,
}

impl OnePoleHpf {
    /// `alpha` near 1.0 gives a low cutoff; 0.9646 is roughly 46 Hz at
    /// 8 kHz
    pub fn new(alpha: f32) -> Self {
        Self {
            alpha: alpha.clamp(0.0, 1.0),
            prev_in: 0.0,
            prev_out: 0.0,
        }
    }

    pub fn reset(&mut self) {
        self.prev_in = 0.0;
        self.prev_out = 0.0;
    }

    pub fn process(&mut self, frame: &mut [f32]) {
        for sa in frame.iter_mut() {
            let y = self.alpha * (self.prev_out + *sa - self.prev_in);
            self.prev_in = *sa;
            self.prev_out = y;
            *sa = y;
        }
    }
}

// Per-slot processing chain and mute latch.
#[derive(Clone, Debug)]
struct SlotChain {
    agc: AudioAgc,
    hpf: OnePoleHpf,
    muted: bool,
}

impl SlotChain {
    fn new() -> Self {
        Self {
            agc: AudioAgc::new(),
            hpf: OnePoleHpf::new(0.9646),
            muted: false,
        }
    }
}

/// Two-slot audio mixer
#[derive(Clone, Debug)]
pub struct AudioMixer {
    format: OutputFormat,
    slots: [SlotChain; 2],
    agc_enabled: bool,
    hpf_enabled: bool,
}

impl AudioMixer {
    pub fn new(format: OutputFormat) -> Self {
        Self {
            format,
            slots: [SlotChain::new(), SlotChain::new()],
            agc_enabled: true,
            hpf_enabled: false,
        }
    }

    /// Enable or disable the windowed gain stage
    pub fn set_agc(&mut self, enabled: bool) {
        self.agc_enabled = enabled;
    }

    /// Enable or disable the high-pass stage
    pub fn set_hpf(&mut self, enabled: bool) {
        self.hpf_enabled = enabled;
    }

    /// Mute or unmute a slot (ENC without key, blocked talkgroup,
    /// TG-hold on the other slot)
    pub fn set_slot_muted(&mut self, slot: usize, muted: bool) {
        self.slots[slot & 1].muted = muted;
    }

    /// True when the slot is muted
    pub fn slot_muted(&self, slot: usize) -> bool {
        self.slots[slot & 1].muted
    }

    /// Reset both slot chains
    pub fn reset(&mut self) {
        for s in self.slots.iter_mut() {
            s.agc.reset();
            s.hpf.reset();
            s.muted = false;
        }
    }

    /// Mix one frame pair into sink-ready PCM
    ///
    /// Returns an empty vector when every contributing slot is silent;
    /// the caller skips the sink write in that case.
    pub fn mix(
        &mut self,
        frames: [Option<[i16; FRAME_SAMPLES]>; 2],
    ) -> Vec<i16> {
        let mut chans = [[0.0f32; FRAME_SAMPLES]; 2];
        let mut live = [false; 2];

        for slot in 0..2 {
            let chain = &mut self.slots[slot];
            let frame = match frames[slot] {
                Some(f) if !chain.muted => f,
                _ => continue,
            };
            live[slot] = true;
            for (dst, src) in chans[slot].iter_mut().zip(frame.iter()) {
                *dst = *src as f32 / 32768.0;
            }
            if self.hpf_enabled {
                chain.hpf.process(&mut chans[slot]);
            }
            if self.agc_enabled {
                chain.agc.process(&mut chans[slot]);
            }
        }

        if !live[0] && !live[1] {
            return Vec::new();
        }

        match self.format {
            OutputFormat::Pcm8kMono => {
                let mut out = Vec::with_capacity(FRAME_SAMPLES);
                for n in 0..FRAME_SAMPLES {
                    out.push(to_i16(chans[0][n] + chans[1][n]));
                }
                out
            }
            OutputFormat::Pcm8kStereo => {
                let mut out = Vec::with_capacity(2 * FRAME_SAMPLES);
                for n in 0..FRAME_SAMPLES {
                    out.push(to_i16(chans[0][n]));
                    out.push(to_i16(chans[1][n]));
                }
                out
            }
            OutputFormat::Pcm48kMono => {
                let mut out = Vec::with_capacity(6 * FRAME_SAMPLES);
                for n in 0..FRAME_SAMPLES {
                    let sa = to_i16(chans[0][n] + chans[1][n]);
                    out.extend(std::iter::repeat(sa).take(6));
                }
                out
            }
        }
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }
}

// Symmetric with the 1/32768 input scale, so mixing is linear in the
// LSB; rounds to nearest.
#[inline]
fn to_i16(x: f32) -> i16 {
    (x * 32768.0)
        .round()
        .clamp(i16::MIN as f32, i16::MAX as f32) as i16
}
