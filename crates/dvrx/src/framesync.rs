//! Frame synchronization and symbol slicing
//!
//! Every demodulated symbol passes through three cooperating pieces:
//!
//! 1. [`LevelTracker`] follows the signal extrema and derives the
//!    slicing thresholds (`center`, `umid`, `lmid`) used to map a Q14
//!    symbol value to a dibit.
//! 2. [`SyncDetector`] slides the last 32 dibits against the sync
//!    dictionary and reports a [`SyncType`] on a match.
//! 3. [`FrameSync`] ties them together and carries the running jitter
//!    estimate used as a signal-quality metric.
//!
//! Sync patterns are stored as four-level FSK dibit sequences. A
//! polarity flip exchanges `+3 <-> -3` and `+1 <-> -1`, which is a XOR
//! of `0b10` on every dibit; inverted dictionary variants are stored
//! explicitly so a match immediately names the polarity.

use crate::Q14_PI;

#[cfg(not(test))]
use log::debug;

#[cfg(test)]
use std::println as debug;

/// Decoded air-interface family
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum_macros::Display)]
pub enum Protocol {
    #[strum(serialize = "DMR")]
    Dmr,
    #[strum(serialize = "P25P1")]
    P25Phase1,
    #[strum(serialize = "P25P2")]
    P25Phase2,
    #[strum(serialize = "NXDN")]
    Nxdn,
}

/// Matched sync word: protocol, burst class, and polarity
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum_macros::Display)]
pub enum SyncType {
    DmrBsVoice,
    DmrBsData,
    DmrMsVoice,
    DmrMsData,
    DmrDmoVoice,
    DmrDmoData,
    P25p1,
    P25p1Inverted,
    P25p2,
    P25p2Inverted,
    NxdnFsw,
    NxdnFswInverted,
}

impl SyncType {
    /// Protocol family this sync belongs to
    pub fn protocol(&self) -> Protocol {
        match self {
            SyncType::DmrBsVoice
            | SyncType::DmrBsData
            | SyncType::DmrMsVoice
            | SyncType::DmrMsData
            | SyncType::DmrDmoVoice
            | SyncType::DmrDmoData => Protocol::Dmr,
            SyncType::P25p1 | SyncType::P25p1Inverted => Protocol::P25Phase1,
            SyncType::P25p2 | SyncType::P25p2Inverted => Protocol::P25Phase2,
            SyncType::NxdnFsw | SyncType::NxdnFswInverted => Protocol::Nxdn,
        }
    }

    /// True for voice burst syncs
    pub fn is_voice(&self) -> bool {
        matches!(
            self,
            SyncType::DmrBsVoice | SyncType::DmrMsVoice | SyncType::DmrDmoVoice
        )
    }

    /// True when the match was against an inverted-polarity pattern
    pub fn is_inverted(&self) -> bool {
        matches!(
            self,
            SyncType::P25p1Inverted | SyncType::P25p2Inverted | SyncType::NxdnFswInverted
        )
    }
}

/// One sync dictionary entry
#[derive(Clone, Copy, Debug)]
pub struct SyncEntry {
    /// dibit pattern, MSB-aligned to `2 * dibits` bits
    pub pattern: u64,

    /// pattern length in dibits
    pub dibits: u32,

    pub sync: SyncType,
}

// Polarity flip of every dibit in an n-dibit pattern.
const fn flip(pattern: u64, dibits: u32) -> u64 {
    pattern ^ (0xAAAA_AAAA_AAAA_AAAAu64 >> (64 - 2 * dibits))
}

/// Static sync dictionary
///
/// The DMR voice/data pairs are each other's polarity inversions, so
/// DMR needs no separate inverted entries; a flipped BS voice burst
/// simply matches as BS data and the burst classifier sorts it out.
pub const SYNC_DICTIONARY: &[SyncEntry] = &[
    SyncEntry {
        pattern: 0x755FD7DF75F7,
        dibits: 24,
        sync: SyncType::DmrBsVoice,
    },
    SyncEntry {
        pattern: 0xDFF57D75DF5D,
        dibits: 24,
        sync: SyncType::DmrBsData,
    },
    SyncEntry {
        pattern: 0x7F7D5DD57DFD,
        dibits: 24,
        sync: SyncType::DmrMsVoice,
    },
    SyncEntry {
        pattern: 0xD5D7F77FD757,
        dibits: 24,
        sync: SyncType::DmrMsData,
    },
    SyncEntry {
        pattern: 0x5D577F7757FF,
        dibits: 24,
        sync: SyncType::DmrDmoVoice,
    },
    SyncEntry {
        pattern: 0xF7FDD5DDFD55,
        dibits: 24,
        sync: SyncType::DmrDmoData,
    },
    SyncEntry {
        pattern: 0x5575F5FF77FF,
        dibits: 24,
        sync: SyncType::P25p1,
    },
    SyncEntry {
        pattern: flip(0x5575F5FF77FF, 24),
        dibits: 24,
        sync: SyncType::P25p1Inverted,
    },
    SyncEntry {
        pattern: 0x575D57F7FF,
        dibits: 20,
        sync: SyncType::P25p2,
    },
    SyncEntry {
        pattern: flip(0x575D57F7FF, 20),
        dibits: 20,
        sync: SyncType::P25p2Inverted,
    },
    SyncEntry {
        pattern: 0xCDF59,
        dibits: 10,
        sync: SyncType::NxdnFsw,
    },
    SyncEntry {
        pattern: flip(0xCDF59, 10),
        dibits: 10,
        sync: SyncType::NxdnFswInverted,
    },
];

/// Longest dictionary pattern, dibits
pub const SYNC_DIBITS_MAX: u32 = 24;

/// Sliding sync-word correlator
#[derive(Clone, Debug)]
pub struct SyncDetector {
    // last 32 dibits, newest in the low bits
    history: u64,
    count: u32,

    // permitted mismatched dibits for a full-length pattern
    max_errors: u32,
}

impl SyncDetector {
    /// Create a detector tolerating `max_errors` mismatched dibits
    ///
    /// The budget applies to patterns of [`SYNC_DIBITS_MAX`] dibits
    /// and scales down proportionally for shorter patterns, so a
    /// 10-dibit NXDN FSW is held to the same error *rate* as a
    /// 24-dibit DMR sync rather than the same absolute count.
    pub fn new(max_errors: u32) -> Self {
        Self {
            history: 0,
            count: 0,
            max_errors,
        }
    }

    /// Clear the dibit history
    pub fn reset(&mut self) {
        self.history = 0;
        self.count = 0;
    }

    /// Shift in one dibit; returns the longest matching sync
    pub fn push(&mut self, dibit: u8) -> Option<SyncType> {
        self.history = (self.history << 2) | (dibit & 0x03) as u64;
        self.count = (self.count + 1).min(32);

        let mut best: Option<(u32, SyncType)> = None;
        for entry in SYNC_DICTIONARY {
            if self.count < entry.dibits {
                continue;
            }
            let mask = u64::MAX >> (64 - 2 * entry.dibits);
            let diff = (self.history & mask) ^ entry.pattern;
            let allowed = self.max_errors * entry.dibits / SYNC_DIBITS_MAX;
            if dibit_errors(diff) <= allowed {
                // prefer the longest pattern when several match
                match best {
                    Some((len, _)) if len >= entry.dibits => {}
                    _ => best = Some((entry.dibits, entry.sync)),
                }
            }
        }
        best.map(|(_, s)| s)
    }
}

// Count dibit positions with any mismatched bit.
#[inline]
fn dibit_errors(diff: u64) -> u32 {
    ((diff | (diff >> 1)) & 0x5555_5555_5555_5555).count_ones()
}

/// Signal extrema tracker and dibit slicer
///
/// `max`/`min` follow the envelope of the Q14 symbol stream; `center`
/// is their midpoint and `umid`/`lmid` sit halfway between the center
/// and each extreme. Slicing compares against the three thresholds to
/// produce four-level FSK dibits.
#[derive(Clone, Debug)]
pub struct LevelTracker {
    max: i32,
    min: i32,
    center: i32,
    umid: i32,
    lmid: i32,

    // EMA of symbol distance from the nearest nominal level
    jitter: f32,
}

impl LevelTracker {
    // envelope contraction per symbol, as a shift
    const DECAY_SHIFT: u32 = 8;

    pub fn new() -> Self {
        let mut s = Self {
            max: Q14_PI / 2,
            min: -(Q14_PI / 2),
            center: 0,
            umid: 0,
            lmid: 0,
            jitter: 0.0,
        };
        s.derive();
        s
    }

    /// Reset to the nominal four-level geometry
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Track one symbol value
    pub fn update(&mut self, value: i16) {
        let v = value as i32;
        if v > self.max {
            self.max = v;
        } else {
            self.max -= (self.max - self.center) >> Self::DECAY_SHIFT;
        }
        if v < self.min {
            self.min = v;
        } else {
            self.min -= (self.min - self.center) >> Self::DECAY_SHIFT;
        }
        self.derive();

        // distance from the nearest nominal level, normalized to the
        // level spacing
        let spacing = ((self.max - self.min) / 3).max(1) as f32;
        let levels = [self.max, self.umid, self.lmid, self.min];
        let d = levels
            .iter()
            .map(|&l| (v - l).abs())
            .min()
            .unwrap_or(0) as f32
            / spacing;
        self.jitter += (d - self.jitter) * 0.05;
    }

    fn derive(&mut self) {
        self.center = (self.max + self.min) / 2;
        self.umid = self.center + (self.max - self.center) / 2;
        self.lmid = self.center - (self.center - self.min) / 2;
    }

    /// Slice a symbol value against the current thresholds
    ///
    /// Levels map to dibits as `+3 -> 01`, `+1 -> 00`, `-1 -> 10`,
    /// `-3 -> 11`.
    #[inline]
    pub fn slice(&self, value: i16) -> u8 {
        let v = value as i32;
        if v > self.umid {
            0b01
        } else if v > self.center {
            0b00
        } else if v >= self.lmid {
            0b10
        } else {
            0b11
        }
    }

    /// Slicing center level
    pub fn center(&self) -> i32 {
        self.center
    }

    /// Normalized jitter metric (0 is perfect)
    pub fn jitter(&self) -> f32 {
        self.jitter
    }
}

impl Default for LevelTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Combined slicer and sync matcher
#[derive(Clone, Debug)]
pub struct FrameSync {
    levels: LevelTracker,
    detector: SyncDetector,
    last_sync: Option<SyncType>,
}

impl FrameSync {
    pub fn new(max_sync_errors: u32) -> Self {
        Self {
            levels: LevelTracker::new(),
            detector: SyncDetector::new(max_sync_errors),
            last_sync: None,
        }
    }

    /// Reset both the slicer geometry and the sync history
    pub fn reset(&mut self) {
        self.levels.reset();
        self.detector.reset();
        self.last_sync = None;
    }

    /// Process one Q14 symbol; returns the sliced dibit and any sync
    /// word completed by it
    pub fn symbol(&mut self, value: i16) -> (u8, Option<SyncType>) {
        self.levels.update(value);
        let dibit = self.levels.slice(value);
        let sync = self.detector.push(dibit);
        if let Some(s) = sync {
            if self.last_sync != Some(s) {
                debug!("framesync: {} ({})", s, s.protocol());
            }
            self.last_sync = Some(s);
        }
        (dibit, sync)
    }

    /// Most recent sync match
    pub fn last_sync(&self) -> Option<SyncType> {
        self.last_sync
    }

    /// Slicer state
    pub fn levels(&self) -> &LevelTracker {
        &self.levels
    }
}

/// Dibits for the nominal symbol levels, used when synthesizing test
/// bursts from a pattern
pub fn pattern_dibits(pattern: u64, dibits: u32) -> Vec<u8> {
    (0..dibits)
        .rev()
        .map(|i| ((pattern >> (2 * i)) & 0x03) as u8)
        .collect()
}

/// Nominal Q14 symbol value for a dibit
pub fn dibit_symbol(dibit: u8) -> i16 {
    match dibit & 0x03 {
        0b01 => (3 * Q14_PI / 4) as i16,
        0b00 => (Q14_PI / 4) as i16,
        0b10 => -(Q14_PI / 4) as i16,
        _ => -(3 * Q14_PI / 4) as i16,
    }
}
