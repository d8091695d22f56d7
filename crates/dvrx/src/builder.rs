//! Builder interface for creating a [`Receiver`]

use thiserror::Error;

use crate::decimate::LpfProfile;
use crate::demod::Discriminator;
use crate::groups::ImportError;
use crate::mixer::OutputFormat;
use crate::receiver::Receiver;
use crate::symsync::SymbolSync;

/// Sample rates the front-end accepts
pub const SUPPORTED_RATES: [u32; 3] = [24000, 48000, 96000];

/// Error in receiver configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Input sampling rate is unsupported
    #[error("unsupported input rate {0} Hz (expected one of 24000, 48000, 96000)")]
    InvalidSampleRate(u32),

    /// I/Q block lengths must be even (interleaved pairs)
    #[error("interleaved I/Q length {0} is not even")]
    OddIqLength(usize),

    /// A CSV import failed during configuration
    #[error(transparent)]
    Import(#[from] ImportError),
}

/// Slot service preference for mono output
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SlotPreference {
    /// slot 0 only
    Slot0,
    /// slot 1 only
    Slot1,
    /// both slots
    #[default]
    Both,
}

/// Resolved receiver configuration
///
/// Produced by [`ReceiverBuilder::build`]; all values are within
/// their working ranges.
#[derive(Clone, Debug)]
pub(crate) struct Config {
    pub input_rate: u32,
    pub squelch_level: f32,
    pub squelch_window: u32,
    pub ted_sps: u32,
    pub ted_gain_mu: f32,
    pub ted_gain_omega: f32,
    pub omega_rel: f32,
    pub rrc_alpha: f32,
    pub rrc_span: u32,
    pub fll_alpha: f32,
    pub fll_beta: f32,
    pub fm_agc_target_rms: f32,
    pub dc_block_shift: u32,
    pub lpf_profile: LpfProfile,
    pub discriminator: Discriminator,
    pub output_format: OutputFormat,
    pub hangtime_s: f32,
    pub grant_voice_timeout_s: f32,
    pub cc_grace_s: f32,
    pub force_release_extra_s: f32,
    pub force_release_margin_s: f32,
    pub err_hold_pct: f32,
    pub err_hold_s: f32,
    pub scanner_mode: bool,
    pub trunk_use_allow_list: bool,
    pub reverse_mute: bool,
    pub unmute_encrypted: bool,
    pub slot_preference: SlotPreference,
    pub strict_data_crc: bool,
}

/// Builds a [`Receiver`]
///
/// Most fields have sensible defaults for a 48 kHz front-end feeding
/// a C4FM or CQPSK channel. Setters clamp their arguments into the
/// working range rather than erroring; only the sample rate is
/// validated at [`build`](Self::build) time.
#[derive(Clone, Debug)]
pub struct ReceiverBuilder {
    cfg: Config,
}

impl ReceiverBuilder {
    /// New receiver for interleaved i16 I/Q at `input_rate` Hz
    pub fn new(input_rate: u32) -> Self {
        Self {
            cfg: Config {
                input_rate,
                squelch_level: 0.0,
                squelch_window: 64,
                ted_sps: 10,
                ted_gain_mu: SymbolSync::DEFAULT_GAIN_MU,
                ted_gain_omega: 0.0,
                omega_rel: SymbolSync::DEFAULT_OMEGA_REL,
                rrc_alpha: 0.25,
                rrc_span: 0,
                fll_alpha: 0.002,
                fll_beta: 0.02,
                fm_agc_target_rms: 10000.0,
                dc_block_shift: 11,
                lpf_profile: LpfProfile::Digital,
                discriminator: Discriminator::Fm,
                output_format: OutputFormat::Pcm8kMono,
                hangtime_s: 2.0,
                grant_voice_timeout_s: 4.0,
                cc_grace_s: 5.0,
                force_release_extra_s: 30.0,
                force_release_margin_s: 2.0,
                err_hold_pct: 20.0,
                err_hold_s: 1.0,
                scanner_mode: false,
                trunk_use_allow_list: false,
                reverse_mute: false,
                unmute_encrypted: false,
                slot_preference: SlotPreference::Both,
                strict_data_crc: false,
            },
        }
    }

    /// Squelch threshold as per-component mean power; `0.0` disables
    pub fn with_squelch_level(mut self, level: f32) -> Self {
        self.cfg.squelch_level = level.max(0.0);
        self
    }

    /// Squelch power estimator window, in samples
    ///
    /// Rounded up to the next power of two, between 2 and 65536.
    pub fn with_squelch_window(mut self, window: u32) -> Self {
        self.cfg.squelch_window = window.clamp(2, 65536);
        self
    }

    /// Samples per symbol for timing recovery, 2 to 20
    pub fn with_ted_sps(mut self, sps: u32) -> Self {
        self.cfg.ted_sps = sps.clamp(2, 20);
        self
    }

    /// Timing loop proportional gain
    pub fn with_ted_gain_mu(mut self, gain: f32) -> Self {
        self.cfg.ted_gain_mu = gain.clamp(1.0e-4, 1.0);
        self
    }

    /// Timing loop frequency gain; `0.0` selects `0.1 * gain_mu²`
    pub fn with_ted_gain_omega(mut self, gain: f32) -> Self {
        self.cfg.ted_gain_omega = gain.clamp(0.0, 1.0);
        self
    }

    /// Relative bound on symbol-period wander
    pub fn with_omega_rel(mut self, rel: f32) -> Self {
        self.cfg.omega_rel = rel.clamp(1.0e-4, 0.01);
        self
    }

    /// Matched filter excess bandwidth
    pub fn with_rrc_alpha(mut self, alpha: f32) -> Self {
        self.cfg.rrc_alpha = alpha.clamp(0.05, 0.5);
        self
    }

    /// Matched filter span in symbols; `0` selects `(11·sps+1)/(2·sps)`
    pub fn with_rrc_span(mut self, span: u32) -> Self {
        self.cfg.rrc_span = span.min(16);
        self
    }

    /// Carrier loop gains (phase, frequency)
    pub fn with_fll_gains(mut self, alpha: f32, beta: f32) -> Self {
        self.cfg.fll_alpha = alpha.clamp(0.0, 0.5);
        self.cfg.fll_beta = beta.clamp(0.0, 0.5);
        self
    }

    /// Front-end AGC target RMS, in i16 counts
    pub fn with_agc_target_rms(mut self, rms: f32) -> Self {
        self.cfg.fm_agc_target_rms = rms.clamp(100.0, 30000.0);
        self
    }

    /// DC blocker pole shift, 6 to 15
    pub fn with_dc_block_shift(mut self, k: u32) -> Self {
        self.cfg.dc_block_shift = k.clamp(6, 15);
        self
    }

    /// Channel low-pass profile ahead of the demodulator
    pub fn with_lpf_profile(mut self, profile: LpfProfile) -> Self {
        self.cfg.lpf_profile = profile;
        self
    }

    /// Discriminator selection (FM for C4FM paths, DQPSK for CQPSK)
    pub fn with_discriminator(mut self, disc: Discriminator) -> Self {
        self.cfg.discriminator = disc;
        self
    }

    /// PCM output format of [`RxEvent::Audio`](crate::RxEvent::Audio)
    pub fn with_output_format(mut self, format: OutputFormat) -> Self {
        self.cfg.output_format = format;
        self
    }

    /// Seconds of sync loss tolerated before the frame layer resets
    pub fn with_hangtime(mut self, seconds: f32) -> Self {
        self.cfg.hangtime_s = seconds.clamp(0.0, 60.0);
        self
    }

    /// Seconds to wait for voice after a trunking grant
    pub fn with_grant_voice_timeout(mut self, seconds: f32) -> Self {
        self.cfg.grant_voice_timeout_s = seconds.clamp(0.5, 60.0);
        self
    }

    /// Control-channel grace period before candidate cycling
    pub fn with_cc_grace(mut self, seconds: f32) -> Self {
        self.cfg.cc_grace_s = seconds.clamp(0.5, 120.0);
        self
    }

    /// Voice-channel force-release lease extension and safety margin
    pub fn with_force_release(mut self, extra_s: f32, margin_s: f32) -> Self {
        self.cfg.force_release_extra_s = extra_s.clamp(0.0, 600.0);
        self.cfg.force_release_margin_s = margin_s.clamp(0.0, 60.0);
        self
    }

    /// Error-rate hold: mute when FEC errors exceed `pct` for `hold_s`
    pub fn with_err_hold(mut self, pct: f32, hold_s: f32) -> Self {
        self.cfg.err_hold_pct = pct.clamp(0.0, 100.0);
        self.cfg.err_hold_s = hold_s.clamp(0.0, 30.0);
        self
    }

    /// Scanner mode: return to hunting after every call
    pub fn with_scanner_mode(mut self, enabled: bool) -> Self {
        self.cfg.scanner_mode = enabled;
        self
    }

    /// Honor the group allow list when following trunking grants
    pub fn with_trunk_use_allow_list(mut self, enabled: bool) -> Self {
        self.cfg.trunk_use_allow_list = enabled;
        self
    }

    /// Invert the mute sense of the group list
    pub fn with_reverse_mute(mut self, enabled: bool) -> Self {
        self.cfg.reverse_mute = enabled;
        self
    }

    /// Pass encrypted audio through unmuted (for devices decrypting
    /// downstream)
    pub fn with_unmute_encrypted(mut self, enabled: bool) -> Self {
        self.cfg.unmute_encrypted = enabled;
        self
    }

    /// Restrict mono output to one TDMA slot
    pub fn with_slot_preference(mut self, pref: SlotPreference) -> Self {
        self.cfg.slot_preference = pref;
        self
    }

    /// Abort multi-block data assembly on any block CRC failure
    pub fn with_strict_data_crc(mut self, enabled: bool) -> Self {
        self.cfg.strict_data_crc = enabled;
        self
    }

    /// Create the receiver
    ///
    /// Errors if the input rate is not one of the supported rates.
    pub fn build(self) -> Result<Receiver, ConfigError> {
        let mut cfg = self.cfg;
        if !SUPPORTED_RATES.contains(&cfg.input_rate) {
            return Err(ConfigError::InvalidSampleRate(cfg.input_rate));
        }
        if cfg.rrc_span == 0 {
            cfg.rrc_span = (11 * cfg.ted_sps + 1) / (2 * cfg.ted_sps);
        }
        if cfg.squelch_window.count_ones() != 1 {
            cfg.squelch_window = cfg.squelch_window.next_power_of_two();
        }
        Ok(Receiver::new(cfg))
    }
}
