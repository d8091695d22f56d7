//! Receiver: the full decode pipeline behind one iterator
//!
//! [`Receiver`] owns every DSP stage, the frame synchronizer, the
//! protocol state machines, and the audio path. The caller feeds
//! blocks of interleaved i16 I/Q; events come back in order. The
//! command ring is drained at every block boundary, and sync loss
//! beyond the hangtime resets the protocol layer while preserving
//! trunking context.
//!
//! Burst FEC (Golay, BPTC, trellis) runs between the dibit stream and
//! the protocol machines; the [`drive_dmr`](Receiver::drive_dmr)
//! family of methods accepts the corrected material and routes the
//! resulting events through talkgroup gating and encryption muting.

use std::collections::VecDeque;
use std::time::Instant;

#[cfg(not(test))]
use log::{debug, info, trace, warn};

#[cfg(test)]
use std::println as debug;

#[cfg(test)]
use std::println as info;

#[cfg(test)]
use std::println as trace;

#[cfg(test)]
use std::println as warn;

use crate::agc::EnvelopeAgc;
use crate::builder::{Config, ConfigError, SlotPreference};
use crate::command::{Command, CommandRing};
use crate::crypto::{Algorithm, CryptoError, KeyStore};
use crate::dcblock::DcBlocker;
use crate::decimate::Decimator;
use crate::demod::{phase_q14, Discriminator, PhaseDemod};
use crate::fll::Fll;
use crate::framesync::{FrameSync, Protocol, SyncType};
use crate::groups::{ChannelMap, GroupList};
use crate::iqbalance::IqBalancer;
use crate::matched::MatchedFilter;
use crate::mixer::AudioMixer;
use crate::proto::dmr::DmrMachine;
use crate::proto::dmr_data::DataAssembler;
use crate::proto::nxdn::NxdnMachine;
use crate::proto::p25::P25Machine;
use crate::proto::{RxEvent, Slot};
use crate::squelch::PowerSquelch;
use crate::symsync::{SymbolSync, TedMode};
use crate::trunking::{TrunkState, TrunkTimers, TrunkingController, Tuner};
use crate::vocoder::{CodecFrame, Vocoder, VocoderBridge};
use crate::IqSample;

/// Nominal symbol rate for all supported air interfaces
pub const SYMBOL_RATE: u32 = 4800;

// preferred working rate after decimation
const WORKING_RATE: u32 = 48000;

/// A multi-protocol digital voice receiver
///
/// Create with [`ReceiverBuilder`](crate::ReceiverBuilder). Feed it
/// interleaved I/Q via [`iter`](Self::iter) or block-wise via
/// [`process`](Self::process) and [`drain_events`](Self::drain_events).
pub struct Receiver {
    cfg: Config,

    // DSP chain, in processing order
    decimator: Decimator,
    dc: DcBlocker,
    iqbal: IqBalancer,
    agc: EnvelopeAgc,
    squelch: PowerSquelch,
    fll: Fll,
    matched: MatchedFilter,
    symsync: SymbolSync,
    demod: PhaseDemod,
    framesync: FrameSync,

    // protocol layer
    dmr: DmrMachine,
    p25: P25Machine,
    nxdn: NxdnMachine,
    data: [DataAssembler; 2],

    // audio path
    bridge: Option<VocoderBridge>,
    mixer: AudioMixer,

    // control plane
    keys: KeyStore,
    groups: GroupList,
    channels: ChannelMap,
    trunking: Option<TrunkingController>,
    commands: Option<CommandRing>,

    // derived rates
    working_rate: u32,
    sps: f32,

    // sync bookkeeping
    in_sync: bool,
    sync_protocol: Option<Protocol>,
    samples_since_sync: u64,
    sym_phase: f32,
    prev_symbol: IqSample,

    // per-call encryption mute, logged once per call
    enc_warned: [bool; 2],

    tg_hold: u32,
    exit: bool,
    events: VecDeque<RxEvent>,
}

impl Receiver {
    pub(crate) fn new(cfg: Config) -> Self {
        let passes = match cfg.input_rate {
            96000 => 1,
            _ => 0,
        };
        let working_rate = cfg.input_rate >> passes;
        let sps = if working_rate == WORKING_RATE {
            cfg.ted_sps as f32
        } else {
            // 24 kHz front end: half the configured symbol period
            (cfg.ted_sps as f32 * working_rate as f32 / WORKING_RATE as f32)
                .max(SymbolSync::SPS_MIN)
        };

        let (fll, ted_mode) = match cfg.discriminator {
            Discriminator::DifferentialQpsk => (
                Fll::new_band_edge(cfg.fll_alpha, cfg.fll_beta, 0.01, sps, cfg.rrc_alpha),
                TedMode::MmseDecimate,
            ),
            _ => (
                Fll::new_fm(cfg.fll_alpha, cfg.fll_beta, 0.0, 0.01),
                TedMode::FarrowTrack,
            ),
        };

        let mut rx = Self {
            decimator: Decimator::new(passes, Some(cfg.lpf_profile), working_rate),
            dc: DcBlocker::new(cfg.dc_block_shift),
            iqbal: IqBalancer::new(1.0 / 512.0, 1.0e-3),
            agc: EnvelopeAgc::new(cfg.fm_agc_target_rms, 32.0, 1.0 / 32.0, 1.0 / 512.0),
            squelch: PowerSquelch::new(cfg.squelch_level, cfg.squelch_window, 2),
            fll,
            matched: MatchedFilter::new(sps as u32, cfg.rrc_alpha, cfg.rrc_span),
            symsync: SymbolSync::new(
                ted_mode,
                sps,
                cfg.ted_gain_mu,
                cfg.ted_gain_omega,
                cfg.omega_rel,
            ),
            demod: PhaseDemod::new(),
            framesync: FrameSync::new(4),
            dmr: DmrMachine::new(),
            p25: P25Machine::new(),
            nxdn: NxdnMachine::new(0),
            data: [
                DataAssembler::new(Slot::S0, cfg.strict_data_crc),
                DataAssembler::new(Slot::S1, cfg.strict_data_crc),
            ],
            bridge: None,
            mixer: AudioMixer::new(cfg.output_format),
            keys: KeyStore::new(),
            groups: GroupList::new(),
            channels: ChannelMap::new(),
            trunking: None,
            commands: None,
            working_rate,
            sps,
            in_sync: false,
            sync_protocol: None,
            samples_since_sync: 0,
            sym_phase: 0.0,
            prev_symbol: IqSample::new(0.0, 0.0),
            enc_warned: [false; 2],
            tg_hold: 0,
            exit: false,
            events: VecDeque::new(),
            cfg,
        };
        rx.apply_slot_preference();
        rx
    }

    pub(crate) fn config(&self) -> &Config {
        &self.cfg
    }

    /// Working sample rate after decimation, Hz
    pub fn working_rate(&self) -> u32 {
        self.working_rate
    }

    /// Attach the consumer half of a command ring
    pub fn attach_commands(&mut self, ring: CommandRing) {
        self.commands = Some(ring);
    }

    /// Attach a vocoder; voice synthesis is disabled without one
    pub fn set_vocoder(&mut self, vocoder: Box<dyn Vocoder>) {
        self.bridge = Some(VocoderBridge::new(vocoder));
    }

    /// Enable trunking follow with the given tuner
    pub fn enable_trunking(&mut self, tuner: Box<dyn Tuner>) {
        self.trunking = Some(TrunkingController::new(
            tuner,
            TrunkTimers {
                hangtime: self.cfg.hangtime_s,
                cc_grace: self.cfg.cc_grace_s,
                min_follow_dwell: 0.5,
                force_release_extra: self.cfg.force_release_extra_s,
                force_release_margin: self.cfg.force_release_margin_s,
            },
        ));
    }

    /// Key material table for encrypted calls
    pub fn keystore_mut(&mut self) -> &mut KeyStore {
        &mut self.keys
    }

    /// Replace the talkgroup allow/block list
    pub fn set_group_list(&mut self, groups: GroupList) {
        self.groups = groups;
    }

    /// Replace the trunking channel map
    pub fn set_channel_map(&mut self, channels: ChannelMap) {
        self.channels = channels;
    }

    /// Whether the frame layer currently holds sync
    pub fn in_sync(&self) -> bool {
        self.in_sync
    }

    /// Iterate events from a source of interleaved i16 (I, Q) pairs
    ///
    /// The iterator pulls as many samples as needed to produce each
    /// event and ends when the source is exhausted or an `Exit`
    /// command arrives.
    pub fn iter<I>(&mut self, src: I) -> SourceIter<'_, I::IntoIter>
    where
        I: IntoIterator<Item = i16>,
    {
        SourceIter {
            rx: self,
            src: src.into_iter(),
        }
    }

    /// Process one block of interleaved i16 (I, Q) pairs
    ///
    /// Events accumulate for [`drain_events`](Self::drain_events).
    pub fn process(&mut self, iq: &[i16]) -> Result<(), ConfigError> {
        if iq.len() % 2 != 0 {
            return Err(ConfigError::OddIqLength(iq.len()));
        }
        self.drain_commands();
        if self.exit || iq.is_empty() {
            return Ok(());
        }

        let raw: Vec<IqSample> = iq
            .chunks_exact(2)
            .map(|p| IqSample::new(p[0] as f32, p[1] as f32))
            .collect();
        let mut block = self.decimator.process(&raw);

        // squelch watches the decimated, unconditioned signal
        if !self.squelch.process(&block) {
            self.note_silence(block.len());
            return Ok(());
        }

        self.dc.filter_block(&mut block);
        self.iqbal.process(&mut block);
        self.agc.process(&mut block);
        self.fll.process(&mut block);

        match self.cfg.discriminator {
            Discriminator::DifferentialQpsk => {
                self.matched.process(&mut block);
                let symbols = self.symsync.process(&block);
                for &sym in symbols.iter() {
                    let d = sym * self.prev_symbol.conj();
                    self.prev_symbol = sym;
                    self.on_symbol(phase_q14(d));
                }
                self.tick_sync(block.len());
            }
            _ => {
                let tracked = self.symsync.process(&block);
                let phases = self.demod.process(&tracked);
                for &ph in phases.iter() {
                    self.sym_phase += 1.0;
                    if self.sym_phase >= self.sps {
                        self.sym_phase -= self.sps;
                        self.on_symbol(ph);
                    }
                }
                self.tick_sync(block.len());
            }
        }
        Ok(())
    }

    /// Take all pending events in order
    pub fn drain_events(&mut self) -> Vec<RxEvent> {
        self.events.drain(..).collect()
    }

    /// Feed FEC-corrected DMR material through the machine
    ///
    /// Events route through talkgroup gating and encryption muting.
    pub fn drive_dmr<F>(&mut self, f: F)
    where
        F: FnOnce(&mut DmrMachine) -> Vec<RxEvent>,
    {
        let evs = f(&mut self.dmr);
        self.route_events(evs);
    }

    /// Feed FEC-corrected P25 material through the machine
    ///
    /// Grants accumulated by control signaling are resolved against
    /// the channel map and handed to the trunking controller.
    pub fn drive_p25<F>(&mut self, f: F)
    where
        F: FnOnce(&mut P25Machine) -> Vec<RxEvent>,
    {
        let evs = f(&mut self.p25);
        self.route_events(evs);
        self.follow_p25_grants();
    }

    /// Feed an assembled NXDN layer-3 message through the machine
    pub fn drive_nxdn<F>(&mut self, f: F)
    where
        F: FnOnce(&mut NxdnMachine) -> Vec<RxEvent>,
    {
        let evs = f(&mut self.nxdn);
        self.route_events(evs);
    }

    /// Feed data-call material through a slot's PDU assembler
    pub fn drive_data<F>(&mut self, slot: Slot, f: F)
    where
        F: FnOnce(&mut DataAssembler) -> Vec<RxEvent>,
    {
        let evs = f(&mut self.data[slot.index()]);
        self.route_events(evs);
    }

    /// Configure a slot's voice keystream from call encryption sync
    ///
    /// With no loadable key the slot is muted and a single
    /// [`RxEvent::EncryptedCallMuted`] is emitted per call.
    pub fn set_slot_keystream(
        &mut self,
        slot: Slot,
        alg: Algorithm,
        key_id: u16,
        mi: &[u8],
        nbytes: usize,
    ) {
        if alg == Algorithm::Clear {
            if let Some(bridge) = self.bridge.as_mut() {
                bridge.clear_keystream(slot.index());
            }
            self.mixer.set_slot_muted(slot.index(), false);
            self.enc_warned[slot.index()] = false;
            return;
        }
        if self.cfg.unmute_encrypted {
            return;
        }
        match self.keys.keystream(alg, key_id, mi, nbytes) {
            Ok(ks) => {
                if let Some(bridge) = self.bridge.as_mut() {
                    bridge.set_keystream(slot.index(), alg, ks);
                }
                self.mixer.set_slot_muted(slot.index(), false);
            }
            Err(CryptoError::MissingKey(_)) | Err(CryptoError::NoGenerator(_)) => {
                self.mixer.set_slot_muted(slot.index(), true);
                if !self.enc_warned[slot.index()] {
                    self.enc_warned[slot.index()] = true;
                    info!(
                        "slot {}: {} key {:#06x} not loaded; muting",
                        slot, alg, key_id
                    );
                    self.events.push_back(RxEvent::EncryptedCallMuted {
                        slot,
                        alg,
                        key_id,
                    });
                }
            }
            Err(e) => {
                warn!("slot {}: keystream: {}", slot, e);
                self.mixer.set_slot_muted(slot.index(), true);
            }
        }
    }

    /// Configure a slot's data-call keystream from header encryption
    /// signaling
    ///
    /// The derived bytes decrypt the assembled PDU in place at
    /// completion, starting `ks_start` bytes in; with no loadable key
    /// the PDU surfaces as ciphertext.
    pub fn set_data_keystream(
        &mut self,
        slot: Slot,
        alg: Algorithm,
        key_id: u16,
        mi: &[u8],
        nbytes: usize,
        ks_start: usize,
    ) {
        if alg == Algorithm::Clear {
            return;
        }
        match self.keys.keystream(alg, key_id, mi, nbytes) {
            Ok(ks) => {
                let asm = &mut self.data[slot.index()];
                asm.set_ks_start(ks_start);
                asm.set_keystream(ks);
            }
            Err(e) => {
                debug!("slot {}: data keystream: {}", slot, e);
            }
        }
    }

    /// Deliver one codec voice frame for a slot
    ///
    /// Synthesized PCM is mixed and surfaces as [`RxEvent::Audio`].
    pub fn feed_codec_frame(&mut self, slot: Slot, frame: CodecFrame) {
        if let Some(tc) = self.trunking.as_mut() {
            tc.on_voice_activity(slot.index(), Instant::now());
        }
        let Some(bridge) = self.bridge.as_mut() else {
            trace!("no vocoder attached; dropping voice frame");
            return;
        };
        if let Err(e) = bridge.push_frame(slot.index(), frame) {
            debug!("slot {}: vocoder: {}", slot, e);
        }
        self.emit_audio();
    }

    // Drain synthesized frames through the mixer. Slot 0 is serviced
    // before slot 1 within a block.
    fn emit_audio(&mut self) {
        let Some(bridge) = self.bridge.as_mut() else {
            return;
        };
        loop {
            let frames = [bridge.pop(0), bridge.pop(1)];
            if frames[0].is_none() && frames[1].is_none() {
                break;
            }
            let pcm = self.mixer.mix(frames);
            if !pcm.is_empty() {
                self.events.push_back(RxEvent::Audio(pcm));
            }
        }
    }

    // One sliced symbol into the frame layer.
    fn on_symbol(&mut self, value: i16) {
        let (_dibit, sync) = self.framesync.symbol(value);
        if let Some(sync) = sync {
            self.on_sync(sync);
        }
    }

    fn on_sync(&mut self, sync: SyncType) {
        self.samples_since_sync = 0;
        let proto = sync.protocol();
        // announce the first acquisition, and re-announce when a
        // different protocol takes over the channel
        if !self.in_sync || self.sync_protocol != Some(proto) {
            self.in_sync = true;
            self.sync_protocol = Some(proto);
            debug!("sync acquired: {}", sync);
            self.events.push_back(RxEvent::SyncAcquired(sync));
        }
        let now = Instant::now();
        if let Some(tc) = self.trunking.as_mut() {
            if sync.is_voice() {
                let slot = match proto {
                    Protocol::Dmr => self.dmr.current_slot().index(),
                    _ => 0,
                };
                tc.on_voice_activity(slot, now);
            } else {
                tc.on_cc_activity(now);
            }
        }
    }

    // Account squelch-closed or sync-free time; fire the hangtime.
    fn note_silence(&mut self, samples: usize) {
        self.samples_since_sync += samples as u64;
        let limit = (self.cfg.hangtime_s * self.working_rate as f32) as u64;
        if self.in_sync && self.samples_since_sync > limit {
            self.on_sync_lost();
        }
    }

    fn tick_sync(&mut self, samples: usize) {
        self.note_silence(samples);
    }

    // Hangtime expired: reset the protocol layer, keep trunk context.
    fn on_sync_lost(&mut self) {
        info!("sync lost");
        self.in_sync = false;
        self.sync_protocol = None;
        self.events.push_back(RxEvent::SyncLost);

        let mut evs = self.dmr.no_carrier();
        evs.extend(self.p25.no_carrier());
        evs.extend(self.nxdn.no_carrier());
        self.route_events(evs);

        for asm in self.data.iter_mut() {
            asm.reset();
        }
        if let Some(bridge) = self.bridge.as_mut() {
            bridge.reset_slot(0);
            bridge.reset_slot(1);
        }
        self.framesync.reset();
        self.enc_warned = [false; 2];

        if let Some(tc) = self.trunking.as_mut() {
            let was_tuned = tc.state() == TrunkState::VcTuned;
            if let Err(e) = tc.on_no_carrier(Instant::now()) {
                warn!("trunk: retune failed: {}", e);
            }
            if was_tuned && tc.state() != TrunkState::VcTuned {
                // back on the control channel: restore its symbol geometry
                let geom = tc.cc_geometry();
                let scale = self.working_rate as f32 / WORKING_RATE as f32;
                self.sps = geom.sps as f32 * scale;
                self.symsync.set_sps(self.sps);
                self.sym_phase = geom.center as f32 * scale;
            }
        }
    }

    // Apply talkgroup gating to call events, then publish them.
    fn route_events(&mut self, events: Vec<RxEvent>) {
        for ev in events {
            match &ev {
                RxEvent::CallStart(call) | RxEvent::CallUpdate(call) => {
                    let slot = call.slot.index();
                    let muted = !self.call_audible(call.talkgroup);
                    self.mixer.set_slot_muted(slot, muted);
                    if muted {
                        trace!("slot {}: TG {} gated", call.slot, call.talkgroup);
                    }
                }
                RxEvent::CallEnd(call) => {
                    let slot = call.slot.index();
                    self.mixer.set_slot_muted(slot, false);
                    self.enc_warned[slot] = false;
                    self.apply_slot_preference();
                }
                _ => {}
            }
            self.events.push_back(ev);
        }
    }

    // Group list verdict for a talkgroup, honoring TG-hold and the
    // reverse-mute switch.
    fn call_audible(&self, tg: u32) -> bool {
        if self.tg_hold != 0 {
            return tg == self.tg_hold;
        }
        let permitted = self
            .groups
            .permits(tg, self.cfg.trunk_use_allow_list);
        permitted != self.cfg.reverse_mute
    }

    fn apply_slot_preference(&mut self) {
        match self.cfg.slot_preference {
            SlotPreference::Slot0 => self.mixer.set_slot_muted(1, true),
            SlotPreference::Slot1 => self.mixer.set_slot_muted(0, true),
            SlotPreference::Both => {}
        }
    }

    fn follow_p25_grants(&mut self) {
        let grants = self.p25.drain_grants();
        if grants.is_empty() {
            return;
        }
        let Some(tc) = self.trunking.as_mut() else {
            return;
        };
        let now = Instant::now();
        for grant in grants {
            if !self
                .groups
                .permits(grant.talkgroup, self.cfg.trunk_use_allow_list)
            {
                trace!("grant for TG {} not permitted", grant.talkgroup);
                continue;
            }
            let Some(freq) = self.channels.freq(grant.channel as u32) else {
                debug!("grant channel {} not in channel map", grant.channel);
                continue;
            };
            if let Err(e) =
                tc.note_grant(0, freq, self.cfg.grant_voice_timeout_s, now)
            {
                warn!("trunk: grant follow failed: {}", e);
            }
        }
    }

    fn drain_commands(&mut self) {
        let Some(ring) = self.commands.as_ref() else {
            return;
        };
        let cmds = ring.drain();
        let now = Instant::now();
        for cmd in cmds {
            match cmd {
                Command::SetSquelchLevel(level) => {
                    self.squelch =
                        PowerSquelch::new(level.max(0.0), self.cfg.squelch_window, 2);
                    self.cfg.squelch_level = level.max(0.0);
                }
                Command::SetHangtime(s) => {
                    self.cfg.hangtime_s = s.clamp(0.0, 60.0);
                }
                Command::Tune(freq) => {
                    if let Some(tc) = self.trunking.as_mut() {
                        if let Err(e) = tc.set_cc(freq as u64, false, now) {
                            warn!("tune: {}", e);
                        }
                    }
                }
                Command::LoadKey { key_id, material } => {
                    self.keys.load_key(key_id, material);
                }
                Command::ClearKeys => self.keys.clear(),
                Command::SetGroup { tg, mode } => self.groups.set(tg, mode),
                Command::TgHold(tg) => {
                    self.tg_hold = tg;
                    if tg != 0 {
                        info!("holding on TG {}", tg);
                    }
                }
                Command::SlotPreference(p) => {
                    self.cfg.slot_preference = match p {
                        0 => SlotPreference::Slot0,
                        1 => SlotPreference::Slot1,
                        _ => SlotPreference::Both,
                    };
                    self.mixer.set_slot_muted(0, false);
                    self.mixer.set_slot_muted(1, false);
                    self.apply_slot_preference();
                }
                Command::UnmuteEncrypted(on) => {
                    self.cfg.unmute_encrypted = on;
                }
                Command::CycleCcCandidate => {
                    if let Some(tc) = self.trunking.as_mut() {
                        if let Err(e) = tc.cycle_cc_candidate(now) {
                            warn!("cc cycle: {}", e);
                        }
                    }
                }
                Command::ForceRelease => {
                    if let Some(tc) = self.trunking.as_mut() {
                        if let Err(e) = tc.force_release(now) {
                            warn!("force release: {}", e);
                        }
                    }
                }
                Command::Exit => {
                    self.exit = true;
                }
            }
        }
    }
}

/// Iterator adapter binding a [`Receiver`] to a sample source
///
/// Produced by [`Receiver::iter`].
pub struct SourceIter<'rx, I> {
    rx: &'rx mut Receiver,
    src: I,
}

// samples pulled per block: 1024 interleaved pairs
const BLOCK_PAIRS: usize = 1024;

impl<'rx, I> Iterator for SourceIter<'rx, I>
where
    I: Iterator<Item = i16>,
{
    type Item = RxEvent;

    fn next(&mut self) -> Option<RxEvent> {
        loop {
            if let Some(ev) = self.rx.events.pop_front() {
                return Some(ev);
            }
            if self.rx.exit {
                return None;
            }
            let mut block = Vec::with_capacity(2 * BLOCK_PAIRS);
            for _n in 0..2 * BLOCK_PAIRS {
                match self.src.next() {
                    Some(sa) => block.push(sa),
                    None => break,
                }
            }
            if block.is_empty() {
                return self.rx.events.pop_front();
            }
            if block.len() % 2 != 0 {
                // ragged tail from a truncated source
                block.pop();
            }
            if self.rx.process(&block).is_err() {
                return None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ReceiverBuilder;
    use crate::command::CommandRing;
    use crate::framesync::{dibit_symbol, pattern_dibits};
    use crate::groups::ListMode;
    use crate::proto::CallInfo;
    use crate::testutil::{interleave_i16, tone};
    use crate::vocoder::{CodecError, FRAME_SAMPLES};

    struct NullTuner {
        tunes: std::sync::Arc<std::sync::Mutex<Vec<u64>>>,
    }

    impl Tuner for NullTuner {
        fn tune(&mut self, freq_hz: u64) -> std::io::Result<()> {
            self.tunes.lock().unwrap().push(freq_hz);
            Ok(())
        }
    }

    struct ConstVocoder;

    impl Vocoder for ConstVocoder {
        fn synthesize(&mut self, _frame: &CodecFrame) -> Result<[i16; FRAME_SAMPLES], CodecError> {
            Ok([1000; FRAME_SAMPLES])
        }
    }

    fn receiver() -> Receiver {
        ReceiverBuilder::new(48000).build().unwrap()
    }

    #[test]
    fn test_odd_iq_length_rejected() {
        let mut rx = receiver();
        assert!(matches!(
            rx.process(&[0i16; 3]),
            Err(ConfigError::OddIqLength(3))
        ));
        assert!(rx.process(&[0i16; 4]).is_ok());
    }

    #[test]
    fn test_squelch_closed_produces_no_events() {
        let mut rx = ReceiverBuilder::new(48000)
            .with_squelch_level(1.0e6)
            .build()
            .unwrap();
        let iq = interleave_i16(&tone(1000.0, 48000.0, 10.0, 2048));
        rx.process(&iq).unwrap();
        assert!(rx.drain_events().is_empty());
        assert!(!rx.in_sync());
    }

    #[test]
    fn test_exit_command_stops_iterator() {
        let mut rx = receiver();
        let (tx, ring) = CommandRing::new();
        rx.attach_commands(ring);
        tx.post(Command::Exit);

        let src = std::iter::repeat(0i16).take(100_000);
        assert_eq!(rx.iter(src).next(), None);
    }

    #[test]
    fn test_tg_hold_gates_other_calls() {
        let mut rx = receiver();
        let (tx, ring) = CommandRing::new();
        rx.attach_commands(ring);
        tx.post(Command::TgHold(42));
        rx.process(&[]).unwrap(); // drain commands

        rx.drive_dmr(|m| {
            vec![RxEvent::CallStart(CallInfo::clear(
                Protocol::Dmr,
                Slot::S0,
                99,
                1,
            ))]
            .into_iter()
            .chain(m.no_carrier())
            .collect()
        });
        assert!(rx.mixer.slot_muted(0));

        rx.drive_dmr(|_m| {
            vec![RxEvent::CallStart(CallInfo::clear(
                Protocol::Dmr,
                Slot::S0,
                42,
                1,
            ))]
        });
        assert!(!rx.mixer.slot_muted(0));
    }

    #[test]
    fn test_block_list_gates_audio_not_events() {
        let mut rx = receiver();
        let mut gl = GroupList::new();
        gl.set(99, ListMode::Block);
        rx.set_group_list(gl);

        rx.drive_dmr(|_m| {
            vec![RxEvent::CallStart(CallInfo::clear(
                Protocol::Dmr,
                Slot::S1,
                99,
                7,
            ))]
        });
        // the event still surfaces; only audio is gated
        let evs = rx.drain_events();
        assert!(matches!(&evs[0], RxEvent::CallStart(c) if c.talkgroup == 99));
        assert!(rx.mixer.slot_muted(1));
    }

    #[test]
    fn test_encrypted_call_muted_once() {
        let mut rx = receiver();
        rx.set_vocoder(Box::new(ConstVocoder));
        rx.set_slot_keystream(Slot::S0, Algorithm::Aes256, 0x0123, &[0u8; 9], 18);
        rx.set_slot_keystream(Slot::S0, Algorithm::Aes256, 0x0123, &[0u8; 9], 18);

        let evs = rx.drain_events();
        assert_eq!(evs.len(), 1);
        assert!(matches!(
            &evs[0],
            RxEvent::EncryptedCallMuted {
                slot: Slot::S0,
                alg: Algorithm::Aes256,
                key_id: 0x0123,
            }
        ));
        assert!(rx.mixer.slot_muted(0));
    }

    #[test]
    fn test_clear_keystream_unmutes() {
        let mut rx = receiver();
        rx.set_vocoder(Box::new(ConstVocoder));
        rx.set_slot_keystream(Slot::S0, Algorithm::Aes256, 1, &[0u8; 9], 18);
        assert!(rx.mixer.slot_muted(0));
        rx.set_slot_keystream(Slot::S0, Algorithm::Clear, 0, &[], 0);
        assert!(!rx.mixer.slot_muted(0));
    }

    #[test]
    fn test_data_keystream_decrypts_pdu() {
        use crate::crc::{crc16, CrcMask};
        use crate::proto::dmr_data::{seal_crc32, DataHeader, BLOCK_BYTES};

        let key = vec![0x12, 0x34];
        let mut rx = receiver();
        rx.keystore_mut().load_key(0x0042, key.clone());

        // derive the stream the receiver will install
        let mut store = KeyStore::new();
        store.load_key(0x0042, key);
        let ks = store
            .keystream(Algorithm::BasicPrivacy, 0x0042, &[], 8)
            .unwrap();

        let plain = b"DISPATCH";
        let mut cipher: Vec<u8> =
            plain.iter().zip(ks.iter()).map(|(p, k)| p ^ k).collect();
        seal_crc32(&mut cipher);

        // unconfirmed, sap 0, one block
        let mut hb = [0u8; 12];
        hb[0] = 0x82;
        hb[8] = 1;
        let c = crc16(&hb[..10], CrcMask::DataHeader);
        hb[10..12].copy_from_slice(&c.to_be_bytes());
        let header = DataHeader::parse(&hb).unwrap();

        rx.drive_data(Slot::S0, |asm| {
            asm.on_header(header);
            Vec::new()
        });
        rx.set_data_keystream(Slot::S0, Algorithm::BasicPrivacy, 0x0042, &[], 8, 0);

        let mut blk = [0u8; BLOCK_BYTES];
        blk.copy_from_slice(&cipher);
        rx.drive_data(Slot::S0, |asm| asm.on_block(&blk));

        let evs = rx.drain_events();
        let Some(RxEvent::Data(d)) = evs
            .iter()
            .find(|ev| matches!(ev, RxEvent::Data(_)))
        else {
            panic!("expected data event");
        };
        assert!(d.crc_ok);
        assert_eq!(&d.bytes[..8], plain);
    }

    #[test]
    fn test_codec_frame_produces_audio() {
        let mut rx = receiver();
        rx.set_vocoder(Box::new(ConstVocoder));
        rx.feed_codec_frame(
            Slot::S0,
            CodecFrame::Ambe {
                bits: [0u8; 7],
                errs: 0,
                errs2: 0,
            },
        );

        let evs = rx.drain_events();
        assert_eq!(evs.len(), 1);
        let RxEvent::Audio(pcm) = &evs[0] else {
            panic!("expected audio");
        };
        assert_eq!(pcm.len(), FRAME_SAMPLES);
        assert!(pcm.iter().any(|&s| s != 0));
    }

    #[test]
    fn test_sync_acquired_from_symbol_stream() {
        let mut rx = receiver();
        // idle symbols, then a BS data sync pattern at symbol rate
        let mut symbols: Vec<i16> = Vec::new();
        for n in 0..64 {
            symbols.push(dibit_symbol((n % 4) as u8));
        }
        for d in pattern_dibits(0xDFF5_7D75_DF5D, 24) {
            symbols.push(dibit_symbol(d));
        }
        for &s in symbols.iter() {
            rx.on_symbol(s);
        }
        let evs = rx.drain_events();
        assert!(evs
            .iter()
            .any(|e| matches!(e, RxEvent::SyncAcquired(s) if s.protocol() == Protocol::Dmr)));
        assert!(rx.in_sync());
    }

    #[test]
    fn test_sync_reannounced_on_protocol_change() {
        let mut rx = receiver();
        rx.on_sync(SyncType::NxdnFsw);
        rx.on_sync(SyncType::DmrBsData);
        let evs = rx.drain_events();
        assert!(evs
            .iter()
            .any(|e| matches!(e, RxEvent::SyncAcquired(SyncType::NxdnFsw))));
        assert!(evs
            .iter()
            .any(|e| matches!(e, RxEvent::SyncAcquired(SyncType::DmrBsData))));

        // further syncs of the same protocol stay quiet
        rx.on_sync(SyncType::DmrBsVoice);
        assert!(rx.drain_events().is_empty());
    }

    #[test]
    fn test_hangtime_resets_protocol_layer() {
        let mut rx = ReceiverBuilder::new(48000).with_hangtime(0.1).build().unwrap();
        rx.drive_dmr(|_m| {
            vec![RxEvent::CallStart(CallInfo::clear(
                Protocol::Dmr,
                Slot::S0,
                5,
                6,
            ))]
        });
        rx.in_sync = true;
        rx.drain_events();

        // 0.2 s of closed squelch at 48 kHz
        rx.note_silence(9600);
        let evs = rx.drain_events();
        assert!(evs.iter().any(|e| matches!(e, RxEvent::SyncLost)));
        assert!(!rx.in_sync());
    }

    #[test]
    fn test_grant_follow_uses_channel_map() {
        let mut rx = receiver();
        let tunes = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        rx.enable_trunking(Box::new(NullTuner {
            tunes: tunes.clone(),
        }));
        let mut cm = ChannelMap::new();
        cm.set(0x100A, 851_012_500);
        rx.set_channel_map(cm);

        rx.drive_p25(|m| {
            let raw = crate::proto::p25::Tsbk::parse(&p25_grant_bytes(0x100A, 4501, 700123))
                .unwrap();
            m.on_tsbk(&raw)
        });
        assert_eq!(tunes.lock().unwrap().as_slice(), &[851_012_500]);
    }

    fn p25_grant_bytes(channel: u16, tg: u16, src: u32) -> [u8; 12] {
        use crate::crc::{crc16, CrcMask};
        let mut b = [0u8; 12];
        b[0] = 0x80; // last block, opcode 0x00
        let ch = channel.to_be_bytes();
        let tg = tg.to_be_bytes();
        let src = src.to_be_bytes();
        b[2] = 0x00;
        b[3] = ch[0];
        b[4] = ch[1];
        b[5] = tg[0];
        b[6] = tg[1];
        b[7] = src[1];
        b[8] = src[2];
        b[9] = src[3];
        let crc = crc16(&b[..10], CrcMask::None);
        b[10..12].copy_from_slice(&crc.to_be_bytes());
        b
    }
}
