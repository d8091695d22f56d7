//! MBE codec frame file formats
//!
//! Two on-disk formats carry raw vocoder frames:
//!
//! * The binary record format: a 4-byte magic (`.imb`, `.amb`, or
//!   `.dmb`) followed by records of `errs2` (1 byte) plus the packed
//!   codec bytes: 11 for IMBE, 6 plus a residual byte for AMBE.
//! * The SDRTrunk JSON `.mbe` format: one JSON object per line with
//!   the codec bits in a `hex` field, 36 hex digits for IMBE and 18
//!   for AMBE, interpreted as dibit pairs.
//!
//! The JSON parser is a token scanner over `"key":value` pairs; the
//! format is flat and machine-written, so a full JSON document model
//! is not required.

use std::io::{self, Read};
use std::path::Path;

use anyhow::{anyhow, bail, Context};
use byteorder::ReadBytesExt;
use log::debug;

use dvrx::CodecFrame;

/// Frame flavor from the file magic
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MbeKind {
    /// 88-bit IMBE (P25 Phase 1), magic `.imb`
    Imbe,
    /// 49-bit AMBE, magic `.amb`
    Ambe,
    /// 49-bit AMBE from DMR captures, magic `.dmb`
    AmbeDmr,
}

impl MbeKind {
    fn from_magic(magic: &[u8; 4]) -> Option<Self> {
        match magic {
            b".imb" => Some(MbeKind::Imbe),
            b".amb" => Some(MbeKind::Ambe),
            b".dmb" => Some(MbeKind::AmbeDmr),
            _ => None,
        }
    }

    /// Packed codec payload bytes per record, after `errs2`
    fn record_bytes(&self) -> usize {
        match self {
            MbeKind::Imbe => 11,
            // 6 packed bytes + 1 residual
            MbeKind::Ambe | MbeKind::AmbeDmr => 7,
        }
    }
}

/// One frame from an SDRTrunk JSON record, with its call metadata
#[derive(Clone, Debug, Default, PartialEq)]
pub struct JsonRecord {
    pub protocol: String,
    pub call_type: String,
    pub encrypted: bool,
    pub to: u32,
    pub from: u32,
    pub algorithm: String,
    pub key_id: u16,
    pub mi: Vec<u8>,
    pub hex: String,
    pub time_ms: u64,
}

/// Read the binary record format
pub fn read_binary(path: &Path) -> anyhow::Result<(MbeKind, Vec<CodecFrame>)> {
    let mut file = std::fs::File::open(path)
        .with_context(|| format!("unable to open MBE file \"{}\"", path.display()))?;

    let mut magic = [0u8; 4];
    file.read_exact(&mut magic)
        .context("MBE file shorter than its magic")?;
    let kind = MbeKind::from_magic(&magic)
        .ok_or_else(|| anyhow!("unrecognized MBE magic {:02x?}", magic))?;

    let mut frames = Vec::new();
    loop {
        let errs2 = match file.read_u8() {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e).context("reading MBE record"),
        };
        let mut payload = vec![0u8; kind.record_bytes()];
        match file.read_exact(&mut payload) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                debug!("MBE file ends mid-record; discarding tail");
                break;
            }
            Err(e) => return Err(e).context("reading MBE record"),
        }
        frames.push(frame_from_bytes(kind, errs2, &payload));
    }
    debug!(
        "{}: {} {:?} frames",
        path.display(),
        frames.len(),
        kind
    );
    Ok((kind, frames))
}

fn frame_from_bytes(kind: MbeKind, errs2: u8, payload: &[u8]) -> CodecFrame {
    match kind {
        MbeKind::Imbe => {
            let mut bits = [0u8; 11];
            bits.copy_from_slice(&payload[..11]);
            CodecFrame::Imbe {
                bits,
                errs: 0,
                errs2,
            }
        }
        MbeKind::Ambe | MbeKind::AmbeDmr => {
            let mut bits = [0u8; 7];
            bits.copy_from_slice(&payload[..7]);
            CodecFrame::Ambe {
                bits,
                errs: 0,
                errs2,
            }
        }
    }
}

/// Parse one line of the SDRTrunk JSON format
pub fn parse_json_record(line: &str) -> anyhow::Result<JsonRecord> {
    let mut rec = JsonRecord::default();
    let mut scan = TokenScanner::new(line);
    while let Some((key, value)) = scan.next_pair()? {
        match key.as_str() {
            "version" => {}
            "protocol" => rec.protocol = value.into_string(),
            "call_type" => rec.call_type = value.into_string(),
            "encrypted" => rec.encrypted = value.as_bool(),
            "to" => rec.to = value.as_u64() as u32,
            "from" => rec.from = value.as_u64() as u32,
            "encryption_algorithm" => rec.algorithm = value.into_string(),
            "encryption_key_id" => rec.key_id = value.as_u64() as u16,
            "encryption_mi" => rec.mi = hex_bytes(&value.into_string())?,
            "hex" => rec.hex = value.into_string(),
            "time" => rec.time_ms = value.as_u64(),
            other => debug!("mbe json: ignoring field \"{}\"", other),
        }
    }
    if rec.hex.len() != 36 && rec.hex.len() != 18 {
        bail!(
            "hex field length {} (expected 36 for IMBE or 18 for AMBE)",
            rec.hex.len()
        );
    }
    Ok(rec)
}

impl JsonRecord {
    /// Convert the `hex` field into a codec frame
    ///
    /// The digits are dibit pairs: each hex digit carries two dibits,
    /// MSB-first, matching the over-the-air symbol order.
    pub fn frame(&self) -> anyhow::Result<CodecFrame> {
        let bytes = hex_bytes(&self.hex)?;
        Ok(match self.hex.len() {
            36 => {
                let mut bits = [0u8; 11];
                bits.copy_from_slice(&bytes[..11]);
                CodecFrame::Imbe {
                    bits,
                    errs: 0,
                    errs2: 0,
                }
            }
            _ => {
                let mut bits = [0u8; 7];
                bits[..bytes.len().min(7)].copy_from_slice(&bytes[..bytes.len().min(7)]);
                CodecFrame::Ambe {
                    bits,
                    errs: 0,
                    errs2: 0,
                }
            }
        })
    }
}

// A scanned JSON value: bare token or quoted string.
enum Value {
    Str(String),
    Bare(String),
}

impl Value {
    fn into_string(self) -> String {
        match self {
            Value::Str(s) | Value::Bare(s) => s,
        }
    }

    fn as_bool(&self) -> bool {
        matches!(self, Value::Bare(s) if s == "true")
            || matches!(self, Value::Str(s) if s == "true")
    }

    fn as_u64(&self) -> u64 {
        match self {
            Value::Str(s) | Value::Bare(s) => s.parse().unwrap_or(0),
        }
    }
}

// Scanner over `"key":value` pairs in a flat JSON object.
struct TokenScanner<'a> {
    rest: &'a str,
}

impl<'a> TokenScanner<'a> {
    fn new(line: &'a str) -> Self {
        Self { rest: line }
    }

    fn next_pair(&mut self) -> anyhow::Result<Option<(String, Value)>> {
        // find the next quoted key
        let Some(start) = self.rest.find('"') else {
            return Ok(None);
        };
        let after = &self.rest[start + 1..];
        let end = after
            .find('"')
            .ok_or_else(|| anyhow!("unterminated key in MBE JSON"))?;
        let key = after[..end].to_owned();
        let mut rest = &after[end + 1..];

        let colon = rest
            .find(':')
            .ok_or_else(|| anyhow!("missing ':' after \"{}\"", key))?;
        rest = rest[colon + 1..].trim_start();

        let value = if let Some(stripped) = rest.strip_prefix('"') {
            let end = stripped
                .find('"')
                .ok_or_else(|| anyhow!("unterminated value for \"{}\"", key))?;
            let v = Value::Str(stripped[..end].to_owned());
            rest = &stripped[end + 1..];
            v
        } else {
            let end = rest
                .find([',', '}'])
                .unwrap_or(rest.len());
            let v = Value::Bare(rest[..end].trim().to_owned());
            rest = &rest[end..];
            v
        };
        self.rest = rest;
        Ok(Some((key, value)))
    }
}

fn hex_bytes(s: &str) -> anyhow::Result<Vec<u8>> {
    if s.len() % 2 != 0 {
        bail!("odd-length hex string");
    }
    (0..s.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&s[i..i + 2], 16)
                .map_err(|_| anyhow!("bad hex digits \"{}\"", &s[i..i + 2]))
        })
        .collect()
}
