//! Trunking control: grant follow and control-channel return
//!
//! A trunked system parks the receiver on a control channel (CC) and
//! announces voice grants naming a voice channel (VC) frequency. The
//! controller follows grants by retuning the sample source, watches
//! voice activity while tuned away, and returns to the CC when the
//! call ends, times out, or overstays its lease. All timer decisions
//! take an explicit `now` so the state machine is testable without
//! waiting out real time.

use std::time::{Duration, Instant};

use thiserror::Error;

#[cfg(not(test))]
use log::{debug, info};

#[cfg(test)]
use std::println as debug;

#[cfg(test)]
use std::println as info;

/// Retune failure from the sample source
#[derive(Debug, Error)]
#[error("retune to {freq_hz} Hz failed: {source}")]
pub struct TuneError {
    pub freq_hz: u64,
    #[source]
    pub source: std::io::Error,
}

/// Retune port into the sample source
pub trait Tuner: Send {
    fn tune(&mut self, freq_hz: u64) -> std::io::Result<()>;
}

/// Observable trunking state
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum_macros::Display)]
pub enum TrunkState {
    /// No control channel acquired
    CcIdle,
    /// Camped on the control channel
    CcActive,
    /// Tuned away following a voice grant
    VcTuned,
}

/// Symbol geometry restored when returning to the control channel
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SymbolGeometry {
    /// samples per symbol
    pub sps: u32,
    /// decision offset within the symbol
    pub center: u32,
}

impl SymbolGeometry {
    /// P25 FDMA control channel geometry
    pub const FDMA: SymbolGeometry = SymbolGeometry { sps: 10, center: 4 };

    /// TDMA control channel geometry
    pub const TDMA: SymbolGeometry = SymbolGeometry { sps: 8, center: 3 };
}

/// Timer configuration, seconds
#[derive(Clone, Copy, Debug)]
pub struct TrunkTimers {
    /// voice-idle time before CC return
    pub hangtime: f32,
    /// CC sync loss tolerated before candidate cycling
    pub cc_grace: f32,
    /// minimum dwell on a VC before another grant may move us
    pub min_follow_dwell: f32,
    /// lease extension past the grant timeout
    pub force_release_extra: f32,
    /// safety margin subtracted from the force-release deadline
    pub force_release_margin: f32,
}

impl Default for TrunkTimers {
    fn default() -> Self {
        Self {
            hangtime: 2.0,
            cc_grace: 5.0,
            min_follow_dwell: 0.5,
            force_release_extra: 30.0,
            force_release_margin: 2.0,
        }
    }
}

/// Trunked-site identity, used for per-site state reset
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SiteId {
    pub wacn: u32,
    pub sysid: u16,
    pub nac: u16,
    pub ran: u8,
}

/// Grant-follow state machine
pub struct TrunkingController {
    tuner: Box<dyn Tuner>,
    timers: TrunkTimers,
    state: TrunkState,

    cc_freq: u64,
    cc_tdma: bool,
    vc_freq: [u64; 2],

    // candidate control channels, insertion-ordered
    candidates: Vec<u64>,
    cand_idx: usize,
    last_tuned_freq: u64,

    grant_time: Option<Instant>,
    grant_timeout: Duration,
    last_voice: Option<Instant>,
    voice_seen: bool,
    last_cc_sync: Option<Instant>,

    site: SiteId,
}

impl TrunkingController {
    pub fn new(tuner: Box<dyn Tuner>, timers: TrunkTimers) -> Self {
        Self {
            tuner,
            timers,
            state: TrunkState::CcIdle,
            cc_freq: 0,
            cc_tdma: false,
            vc_freq: [0; 2],
            candidates: Vec::new(),
            cand_idx: 0,
            last_tuned_freq: 0,
            grant_time: None,
            grant_timeout: Duration::ZERO,
            last_voice: None,
            voice_seen: false,
            last_cc_sync: None,
            site: SiteId::default(),
        }
    }

    /// Current state
    pub fn state(&self) -> TrunkState {
        self.state
    }

    /// True while tuned to a voice channel
    pub fn is_tuned(&self) -> bool {
        self.state == TrunkState::VcTuned
    }

    /// Symbol geometry to restore after a CC return
    pub fn cc_geometry(&self) -> SymbolGeometry {
        if self.cc_tdma {
            SymbolGeometry::TDMA
        } else {
            SymbolGeometry::FDMA
        }
    }

    /// Record the site identity; a change resets per-site counters
    pub fn set_site(&mut self, site: SiteId) {
        if site != self.site {
            debug!("trunk: new site {:?}", site);
            self.site = site;
            self.candidates.clear();
            self.cand_idx = 0;
        }
    }

    pub fn site(&self) -> SiteId {
        self.site
    }

    /// Camp on a control channel
    pub fn set_cc(&mut self, freq_hz: u64, tdma: bool, now: Instant) -> Result<(), TuneError> {
        self.cc_freq = freq_hz;
        self.cc_tdma = tdma;
        self.retune(freq_hz)?;
        self.state = TrunkState::CcActive;
        self.last_cc_sync = Some(now);
        if !self.candidates.contains(&freq_hz) {
            self.candidates.push(freq_hz);
        }
        Ok(())
    }

    /// Remember an advertised alternate control channel
    pub fn add_cc_candidate(&mut self, freq_hz: u64) {
        if freq_hz != 0 && !self.candidates.contains(&freq_hz) {
            self.candidates.push(freq_hz);
        }
    }

    /// Follow a voice grant
    ///
    /// Ignored while the minimum follow dwell on a current grant has
    /// not elapsed. `voice_timeout_s` bounds the wait for first voice.
    pub fn note_grant(
        &mut self,
        slot: usize,
        vc_freq: u64,
        voice_timeout_s: f32,
        now: Instant,
    ) -> Result<(), TuneError> {
        if let (TrunkState::VcTuned, Some(t0)) = (self.state, self.grant_time) {
            if now.duration_since(t0) < secs(self.timers.min_follow_dwell) {
                debug!("trunk: grant ignored inside follow dwell");
                return Ok(());
            }
        }
        self.vc_freq[slot & 1] = vc_freq;
        self.retune(vc_freq)?;
        self.state = TrunkState::VcTuned;
        self.grant_time = Some(now);
        self.grant_timeout = secs(voice_timeout_s);
        self.voice_seen = false;
        self.last_voice = None;
        info!("trunk: following grant to {} Hz (slot {})", vc_freq, slot & 1);
        Ok(())
    }

    /// Refresh the voice activity timer
    pub fn on_voice_activity(&mut self, _slot: usize, now: Instant) {
        if self.state == TrunkState::VcTuned {
            self.voice_seen = true;
            self.last_voice = Some(now);
        }
    }

    /// Note control-channel signaling while camped
    pub fn on_cc_activity(&mut self, now: Instant) {
        if self.state != TrunkState::VcTuned {
            self.last_cc_sync = Some(now);
        }
    }

    /// Periodic no-carrier tick
    ///
    /// Decides whether to return to the control channel (grant voice
    /// timeout, hangtime expiry, or force-release) or to cycle CC
    /// candidates after prolonged CC loss.
    pub fn on_no_carrier(&mut self, now: Instant) -> Result<(), TuneError> {
        match self.state {
            TrunkState::VcTuned => {
                let t0 = self.grant_time.expect("granted without timestamp");

                if !self.voice_seen && now.duration_since(t0) > self.grant_timeout {
                    debug!("trunk: no voice within grant timeout");
                    return self.return_to_cc(now);
                }
                if let Some(tv) = self.last_voice {
                    if now.duration_since(tv) > secs(self.timers.hangtime) {
                        debug!("trunk: hangtime expired");
                        return self.return_to_cc(now);
                    }
                }
                let lease = self.grant_timeout + secs(self.timers.force_release_extra)
                    - secs(self.timers.force_release_margin);
                if now.duration_since(t0) > lease {
                    debug!("trunk: force release");
                    return self.return_to_cc(now);
                }
                Ok(())
            }
            TrunkState::CcActive => {
                if let Some(ts) = self.last_cc_sync {
                    if now.duration_since(ts) > secs(self.timers.cc_grace) {
                        return self.cycle_cc_candidate(now);
                    }
                }
                Ok(())
            }
            TrunkState::CcIdle => Ok(()),
        }
    }

    /// Force an immediate CC return (user command)
    pub fn force_release(&mut self, now: Instant) -> Result<(), TuneError> {
        if self.state == TrunkState::VcTuned {
            self.return_to_cc(now)
        } else {
            Ok(())
        }
    }

    /// Advance to the next control-channel candidate
    ///
    /// Candidates cycle in insertion order; a candidate equal to the
    /// previous tune is skipped once so a two-entry list alternates.
    pub fn cycle_cc_candidate(&mut self, now: Instant) -> Result<(), TuneError> {
        if self.candidates.is_empty() {
            self.state = TrunkState::CcIdle;
            return Ok(());
        }
        let mut idx = (self.cand_idx + 1) % self.candidates.len();
        if self.candidates[idx] == self.last_tuned_freq && self.candidates.len() > 1 {
            idx = (idx + 1) % self.candidates.len();
        }
        self.cand_idx = idx;
        self.cc_freq = self.candidates[idx];
        info!("trunk: cycling to CC candidate {} Hz", self.cc_freq);
        self.retune(self.cc_freq)?;
        self.state = TrunkState::CcActive;
        self.last_cc_sync = Some(now);
        Ok(())
    }

    fn return_to_cc(&mut self, now: Instant) -> Result<(), TuneError> {
        self.retune(self.cc_freq)?;
        self.state = TrunkState::CcActive;
        self.grant_time = None;
        self.voice_seen = false;
        self.last_voice = None;
        self.last_cc_sync = Some(now);
        info!("trunk: returned to CC {} Hz", self.cc_freq);
        Ok(())
    }

    fn retune(&mut self, freq_hz: u64) -> Result<(), TuneError> {
        self.tuner.tune(freq_hz).map_err(|source| TuneError {
            freq_hz,
            source,
        })?;
        self.last_tuned_freq = freq_hz;
        Ok(())
    }
}

impl std::fmt::Debug for TrunkingController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrunkingController")
            .field("state", &self.state)
            .field("cc_freq", &self.cc_freq)
            .field("candidates", &self.candidates.len())
            .finish()
    }
}

#[inline]
fn secs(s: f32) -> Duration {
    Duration::from_secs_f32(s.max(0.0))
}
