//! Talkgroup lists, channel maps, and CSV imports
//!
//! Three user-maintained tables steer the receiver: the group list
//! (which talkgroups to play or mute), the channel map (trunk channel
//! number to frequency), and key imports destined for the
//! [`KeyStore`](crate::crypto::KeyStore). All three load from simple
//! CSV and are published to the decode thread as immutable snapshots;
//! a reload builds a fresh table and swaps the pointer.

use std::collections::HashMap;
use std::io::Write;
use std::path::Path;

use lazy_static::lazy_static;
use regex::Regex;
use thiserror::Error;

#[cfg(not(test))]
use log::info;

#[cfg(test)]
use std::println as info;

lazy_static! {
    static ref HEX_KEY: Regex = Regex::new(r"^(?:0[xX])?([0-9A-Fa-f]+)$").unwrap();
    static ref DEC_KEY: Regex = Regex::new(r"^[0-9]+$").unwrap();
}

/// Malformed CSV input
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ImportError {
    #[error("line {line}: expected at least {want} fields, got {got}")]
    FieldCount { line: usize, want: usize, got: usize },

    #[error("line {line}: bad number `{text}`")]
    BadNumber { line: usize, text: String },

    #[error("line {line}: mode must be A or B, got `{text}`")]
    BadMode { line: usize, text: String },

    #[error("line {line}: bad key material `{text}`")]
    BadKey { line: usize, text: String },
}

/// Whether a list entry admits or rejects traffic
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum_macros::Display)]
pub enum ListMode {
    /// Play this talkgroup
    Allow,
    /// Mute this talkgroup
    Block,
}

impl ListMode {
    fn parse(text: &str, line: usize) -> Result<Self, ImportError> {
        match text.trim() {
            "A" | "a" => Ok(ListMode::Allow),
            "B" | "b" => Ok(ListMode::Block),
            other => Err(ImportError::BadMode {
                line,
                text: other.to_owned(),
            }),
        }
    }
}

/// One group list row
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupEntry {
    pub tg: u32,
    pub mode: ListMode,
    pub name: String,
    /// optional algorithm hint from the import
    pub alg_hint: Option<u8>,
}

/// Ordered talkgroup list
#[derive(Clone, Debug, Default)]
pub struct GroupList {
    entries: Vec<GroupEntry>,
}

impl GroupList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse CSV rows of `tg,mode,name[,alg_hint]`
    ///
    /// Blank lines and `#` comments are skipped.
    pub fn import_csv(text: &str) -> Result<Self, ImportError> {
        let mut entries = Vec::new();
        for (lineno, raw) in text.lines().enumerate() {
            let line = lineno + 1;
            let raw = raw.trim();
            if raw.is_empty() || raw.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = raw.split(',').collect();
            if fields.len() < 3 {
                return Err(ImportError::FieldCount {
                    line,
                    want: 3,
                    got: fields.len(),
                });
            }
            let tg = parse_u32(fields[0], line)?;
            let mode = ListMode::parse(fields[1], line)?;
            let alg_hint = match fields.get(3) {
                Some(f) if !f.trim().is_empty() => Some(parse_u32(f, line)? as u8),
                _ => None,
            };
            entries.push(GroupEntry {
                tg,
                mode,
                name: fields[2].trim().to_owned(),
                alg_hint,
            });
        }
        info!("group list: {} entries", entries.len());
        Ok(Self { entries })
    }

    /// Add or replace an entry for `tg`
    pub fn set(&mut self, tg: u32, mode: ListMode) {
        if let Some(e) = self.entries.iter_mut().find(|e| e.tg == tg) {
            e.mode = mode;
        } else {
            self.entries.push(GroupEntry {
                tg,
                mode,
                name: String::new(),
                alg_hint: None,
            });
        }
    }

    /// Look up an entry
    pub fn lookup(&self, tg: u32) -> Option<&GroupEntry> {
        self.entries.iter().find(|e| e.tg == tg)
    }

    /// Gate decision for a call on `tg`
    ///
    /// With `allow_list` semantics only listed `Allow` groups play;
    /// otherwise every group plays unless listed `Block`.
    pub fn permits(&self, tg: u32, allow_list: bool) -> bool {
        match (self.lookup(tg), allow_list) {
            (Some(e), _) => e.mode == ListMode::Allow,
            (None, true) => false,
            (None, false) => true,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Render back to CSV for autosave
    pub fn to_csv(&self) -> String {
        let mut out = String::new();
        for e in &self.entries {
            let mode = match e.mode {
                ListMode::Allow => 'A',
                ListMode::Block => 'B',
            };
            out.push_str(&format!("{},{},{}", e.tg, mode, e.name));
            if let Some(h) = e.alg_hint {
                out.push_str(&format!(",{}", h));
            }
            out.push('\n');
        }
        out
    }
}

/// Trunk channel number to frequency map
#[derive(Clone, Debug, Default)]
pub struct ChannelMap {
    map: HashMap<u32, u64>,
}

impl ChannelMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse CSV rows of `channel,freq_hz`
    pub fn import_csv(text: &str) -> Result<Self, ImportError> {
        let mut map = HashMap::new();
        for (lineno, raw) in text.lines().enumerate() {
            let line = lineno + 1;
            let raw = raw.trim();
            if raw.is_empty() || raw.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = raw.split(',').collect();
            if fields.len() < 2 {
                return Err(ImportError::FieldCount {
                    line,
                    want: 2,
                    got: fields.len(),
                });
            }
            let chan = parse_u32(fields[0], line)?;
            let freq = fields[1].trim().parse::<u64>().map_err(|_e| {
                ImportError::BadNumber {
                    line,
                    text: fields[1].trim().to_owned(),
                }
            })?;
            map.insert(chan, freq);
        }
        info!("channel map: {} channels", map.len());
        Ok(Self { map })
    }

    /// Insert one mapping
    pub fn set(&mut self, channel: u32, freq_hz: u64) {
        self.map.insert(channel, freq_hz);
    }

    /// Frequency for a channel number
    pub fn freq(&self, channel: u32) -> Option<u64> {
        self.map.get(&channel).copied()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Parse CSV rows of `key_id,key` where the key is decimal or hex
///
/// Decimal keys load as big-endian minimal bytes (the Basic Privacy
/// convention); hex keys load verbatim, one byte per digit pair.
pub fn import_keys_csv(text: &str) -> Result<Vec<(u16, Vec<u8>)>, ImportError> {
    let mut out = Vec::new();
    for (lineno, raw) in text.lines().enumerate() {
        let line = lineno + 1;
        let raw = raw.trim();
        if raw.is_empty() || raw.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = raw.split(',').collect();
        if fields.len() < 2 {
            return Err(ImportError::FieldCount {
                line,
                want: 2,
                got: fields.len(),
            });
        }
        let key_id = parse_u32(fields[0], line)? as u16;
        let text = fields[1].trim();

        let material = if DEC_KEY.is_match(text) {
            let v: u64 = text.parse().map_err(|_e| ImportError::BadKey {
                line,
                text: text.to_owned(),
            })?;
            let bytes = v.to_be_bytes();
            let first = bytes.iter().position(|&b| b != 0).unwrap_or(7);
            bytes[first..].to_vec()
        } else if let Some(caps) = HEX_KEY.captures(text) {
            let hex = caps.get(1).expect("capture group").as_str();
            if hex.len() % 2 != 0 {
                return Err(ImportError::BadKey {
                    line,
                    text: text.to_owned(),
                });
            }
            (0..hex.len())
                .step_by(2)
                .map(|i| u8::from_str_radix(&hex[i..i + 2], 16))
                .collect::<Result<Vec<u8>, _>>()
                .map_err(|_e| ImportError::BadKey {
                    line,
                    text: text.to_owned(),
                })?
        } else {
            return Err(ImportError::BadKey {
                line,
                text: text.to_owned(),
            });
        };
        out.push((key_id, material));
    }
    Ok(out)
}

/// Write a user-config file atomically: temp file in the same
/// directory, then rename over the target
pub fn save_atomic(path: &Path, contents: &str) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut f = std::fs::File::create(&tmp)?;
        f.write_all(contents.as_bytes())?;
        f.sync_all()?;
    }
    std::fs::rename(&tmp, path)
}

fn parse_u32(text: &str, line: usize) -> Result<u32, ImportError> {
    let text = text.trim();
    let parsed = if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16)
    } else {
        text.parse()
    };
    parsed.map_err(|_e| ImportError::BadNumber {
        line,
        text: text.to_owned(),
    })
}
