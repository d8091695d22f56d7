//! DMR burst classification and slot state machine
//!
//! A DMR TDMA frame interleaves two 30 ms slots; each burst carries
//! either voice (identified by a voice sync or embedded signalling) or
//! data/control (identified by the slot type field). This module
//! tracks both slots independently, follows the six-burst voice
//! superframe cadence, and parses the control payloads that matter to
//! call handling: CACH/TACT, full link control, privacy indicator
//! headers, and CSBKs. Multi-block data assembly lives in
//! [`super::dmr_data`].

use crate::bits::BitCursor;
use crate::crc::{crc16, CrcMask};
use crate::crypto::Algorithm;
use crate::framesync::Protocol;
use crate::proto::{CallInfo, RxEvent, SignalingEvent, Slot};

#[cfg(not(test))]
use log::{debug, trace};

#[cfg(test)]
use std::println as debug;

#[cfg(test)]
use std::println as trace;

/// TDMA timing constants
pub struct DmrTiming;

impl DmrTiming {
    pub const SLOTS_PER_FRAME: usize = 2;
    pub const FRAME_DURATION_MS: f64 = 60.0;
    pub const SLOT_DURATION_MS: f64 = 30.0;
    pub const SYMBOLS_PER_SLOT: usize = 144;
    pub const SYMBOL_RATE: f64 = 4800.0;
    /// voice bursts per superframe (A through F)
    pub const BURSTS_PER_SUPERFRAME: u8 = 6;
}

/// Slot type data type codes (ETSI TS 102 361-1 §9.3.6)
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum_macros::Display)]
pub enum DataType {
    PiHeader,
    VoiceLcHeader,
    TerminatorLc,
    Csbk,
    MbcHeader,
    MbcContinuation,
    DataHeader,
    Rate12Data,
    Rate34Data,
    Idle,
    Rate1Data,
    Unified,
    Reserved(u8),
}

impl DataType {
    pub fn from_code(code: u8) -> Self {
        match code & 0x0F {
            0x0 => DataType::PiHeader,
            0x1 => DataType::VoiceLcHeader,
            0x2 => DataType::TerminatorLc,
            0x3 => DataType::Csbk,
            0x4 => DataType::MbcHeader,
            0x5 => DataType::MbcContinuation,
            0x6 => DataType::DataHeader,
            0x7 => DataType::Rate12Data,
            0x8 => DataType::Rate34Data,
            0x9 => DataType::Idle,
            0xA => DataType::Rate1Data,
            0xB => DataType::Unified,
            other => DataType::Reserved(other),
        }
    }
}

/// Parsed slot type field: color code plus burst data type
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotType {
    pub color_code: u8,
    pub data_type: DataType,
}

impl SlotType {
    /// Parse the 8 information bits of a slot type field
    ///
    /// FEC decode of the Golay(20,8) happens with the symbol layer;
    /// this consumes the corrected byte.
    pub fn from_byte(b: u8) -> Self {
        Self {
            color_code: b >> 4,
            data_type: DataType::from_code(b & 0x0F),
        }
    }
}

// Hamming(7,4) for the TACT field: data bits d3..d0, parity bits
// p2 p1 p0 appended.
fn hamming74_encode(data: u8) -> u8 {
    let d = data & 0x0F;
    let d3 = (d >> 3) & 1;
    let d2 = (d >> 2) & 1;
    let d1 = (d >> 1) & 1;
    let d0 = d & 1;
    let p2 = d3 ^ d2 ^ d1;
    let p1 = d2 ^ d1 ^ d0;
    let p0 = d3 ^ d2 ^ d0;
    (d << 3) | (p2 << 2) | (p1 << 1) | p0
}

// Decode with single-error correction. Returns (data, corrected) or
// None for uncorrectable patterns.
fn hamming74_decode(code: u8) -> Option<(u8, bool)> {
    let clean = hamming74_encode(code >> 3);
    let syndrome = (clean ^ code) & 0x7F;
    if syndrome == 0 {
        return Some((code >> 3, false));
    }
    // try flipping each bit once
    for i in 0..7 {
        let cand = code ^ (1 << i);
        if hamming74_encode(cand >> 3) == cand & 0x7F {
            return Some(((cand >> 3) & 0x0F, true));
        }
    }
    None
}

/// Parsed CACH TACT field
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Tact {
    /// access type: busy/idle
    pub at: bool,
    /// TDMA channel (slot) this burst belongs to
    pub slot: Slot,
    /// link control start/stop
    pub lcss: u8,
    /// a single bit error was corrected
    pub corrected: bool,
}

/// Decode the 7-bit TACT from the CACH
pub fn parse_tact(tact7: u8) -> Option<Tact> {
    let (data, corrected) = hamming74_decode(tact7 & 0x7F)?;
    Some(Tact {
        at: data & 0x08 != 0,
        slot: if data & 0x04 != 0 { Slot::S1 } else { Slot::S0 },
        lcss: data & 0x03,
        corrected,
    })
}

/// Full link control: the call descriptor carried by voice headers,
/// terminators, and embedded signalling
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FullLinkControl {
    pub flco: u8,
    pub fid: u8,
    pub service_options: u8,
    pub dest: u32,
    pub source: u32,
}

impl FullLinkControl {
    /// Privacy bit in the service options
    const SVC_PRIVACY: u8 = 0x40;

    /// Parse the 9 information bytes of an FLC
    pub fn parse(bytes: &[u8; 9]) -> Self {
        let mut cur = BitCursor::new(bytes);
        cur.skip(2).expect("fixed-size read"); // PF + reserved
        let flco = cur.read(6).expect("fixed-size read") as u8;
        let fid = cur.read_u8().expect("fixed-size read");
        let service_options = cur.read_u8().expect("fixed-size read");
        let dest = cur.read(24).expect("fixed-size read");
        let source = cur.read(24).expect("fixed-size read");
        Self {
            flco,
            fid,
            service_options,
            dest,
            source,
        }
    }

    /// Group (true) or unit-to-unit (false) addressing
    pub fn is_group(&self) -> bool {
        // FLCO 0 = group voice, 3 = unit to unit
        self.flco != 3
    }

    pub fn is_private(&self) -> bool {
        self.service_options & Self::SVC_PRIVACY != 0
    }
}

/// Parsed privacy indicator header
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PiHeader {
    pub alg: Algorithm,
    pub key_id: u8,
    pub mi: [u8; 4],
}

impl PiHeader {
    /// Parse the 10 information bytes of a PI header
    pub fn parse(bytes: &[u8; 10]) -> Self {
        let mut mi = [0u8; 4];
        mi.copy_from_slice(&bytes[3..7]);
        Self {
            alg: Algorithm::from_dmr_alg(bytes[0] & 0x07),
            key_id: bytes[2],
            mi,
        }
    }
}

/// A parsed control signalling block
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Csbk {
    pub last_block: bool,
    pub opcode: u8,
    pub fid: u8,
    pub dest: u32,
    pub source: u32,
}

/// CSBK opcodes surfaced with names
const CSBKO_BS_OUTBOUND_ACTIVATION: u8 = 0x39;
const CSBKO_PREAMBLE: u8 = 0x3D;

impl Csbk {
    /// Parse a 12-byte CSBK and verify its CRC
    pub fn parse(bytes: &[u8; 12]) -> Option<Self> {
        let crc = u16::from_be_bytes([bytes[10], bytes[11]]);
        if crc16(&bytes[..10], CrcMask::Csbk) != crc {
            return None;
        }
        Some(Self {
            last_block: bytes[0] & 0x80 != 0,
            opcode: bytes[0] & 0x3F,
            fid: bytes[1],
            dest: u32::from_be_bytes([0, bytes[4], bytes[5], bytes[6]]),
            source: u32::from_be_bytes([0, bytes[7], bytes[8], bytes[9]]),
        })
    }

    fn describe(&self) -> String {
        match self.opcode {
            CSBKO_BS_OUTBOUND_ACTIVATION => "BS outbound activation".to_owned(),
            CSBKO_PREAMBLE => "CSBK preamble".to_owned(),
            other => format!("CSBK opcode {:#04x}", other),
        }
    }
}

// Per-slot voice call context.
#[derive(Clone, Debug, Default)]
struct SlotContext {
    call: Option<CallInfo>,
    // A..F position within the voice superframe
    cadence: u8,
    // pending encryption descriptor from a PI header
    pi: Option<PiHeader>,
    // consecutive TACT/EMB failures
    cascade_errs: u8,
}

impl SlotContext {
    // cascade failures tolerated before reset_blocks
    const CASCADE_LIMIT: u8 = 3;
}

/// DMR decode state machine over both slots
#[derive(Clone, Debug, Default)]
pub struct DmrMachine {
    slots: [SlotContext; 2],
    current: usize,
    color_code: Option<u8>,
}

impl DmrMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Slot indicated by the most recent CACH
    pub fn current_slot(&self) -> Slot {
        Slot::from_index(self.current)
    }

    /// Color code learned from slot type fields
    pub fn color_code(&self) -> Option<u8> {
        self.color_code
    }

    /// Feed a decoded TACT; steers slot arbitration
    pub fn on_tact(&mut self, tact: Tact) {
        self.current = tact.slot.index();
        self.slots[self.current].cascade_errs = 0;
    }

    /// Note a TACT or EMB that failed to decode
    ///
    /// Three consecutive failures zero the slot's assembly state but
    /// preserve the call context (`reset_blocks` semantics).
    pub fn on_cascade_failure(&mut self) -> bool {
        let ctx = &mut self.slots[self.current];
        ctx.cascade_errs += 1;
        if ctx.cascade_errs >= SlotContext::CASCADE_LIMIT {
            debug!("dmr: slot {} cascade failure, resetting blocks", self.current);
            ctx.cascade_errs = 0;
            ctx.cadence = 0;
            return true;
        }
        false
    }

    /// Handle a voice LC header on the current slot
    pub fn on_voice_header(&mut self, flc: &FullLinkControl) -> Vec<RxEvent> {
        let slot = Slot::from_index(self.current);
        let ctx = &mut self.slots[self.current];
        ctx.cadence = 0;

        let mut info = CallInfo {
            protocol: Protocol::Dmr,
            slot,
            talkgroup: flc.dest,
            source: flc.source,
            group: flc.is_group(),
            encrypted: flc.is_private(),
            alg: Algorithm::Clear,
            key_id: 0,
        };
        if let Some(pi) = &ctx.pi {
            info.encrypted = true;
            info.alg = pi.alg;
            info.key_id = pi.key_id as u16;
        }

        let started = ctx.call.as_ref() != Some(&info);
        ctx.call = Some(info.clone());
        if started {
            vec![RxEvent::CallStart(info)]
        } else {
            Vec::new()
        }
    }

    /// Handle a PI header on the current slot
    pub fn on_pi_header(&mut self, pi: PiHeader) -> Vec<RxEvent> {
        let ctx = &mut self.slots[self.current];
        trace!("dmr: PI header alg {} key {}", pi.alg, pi.key_id);
        ctx.pi = Some(pi);
        if let Some(call) = ctx.call.as_mut() {
            call.encrypted = true;
            call.alg = pi.alg;
            call.key_id = pi.key_id as u16;
            return vec![RxEvent::CallUpdate(call.clone())];
        }
        Vec::new()
    }

    /// Advance the superframe cadence for one voice burst
    ///
    /// Returns true at a superframe boundary (burst A), where the
    /// keystream cursor resets.
    pub fn on_voice_burst(&mut self) -> bool {
        let ctx = &mut self.slots[self.current];
        let boundary = ctx.cadence == 0;
        ctx.cadence = (ctx.cadence + 1) % DmrTiming::BURSTS_PER_SUPERFRAME;
        boundary
    }

    /// Handle a CSBK on the current slot
    pub fn on_csbk(&mut self, bytes: &[u8; 12]) -> Vec<RxEvent> {
        let Some(csbk) = Csbk::parse(bytes) else {
            return Vec::new();
        };
        vec![RxEvent::Signaling(SignalingEvent {
            protocol: Protocol::Dmr,
            slot: Slot::from_index(self.current),
            opcode: csbk.opcode,
            talkgroup: csbk.dest,
            source: csbk.source,
            description: csbk.describe(),
        })]
    }

    /// Record the color code from a verified slot type
    pub fn on_slot_type(&mut self, st: SlotType) {
        self.color_code = Some(st.color_code);
    }

    /// Handle a terminator LC: close the slot's call
    pub fn on_terminator(&mut self) -> Vec<RxEvent> {
        let ctx = &mut self.slots[self.current];
        ctx.cadence = 0;
        ctx.pi = None;
        match ctx.call.take() {
            Some(info) => vec![RxEvent::CallEnd(info)],
            None => Vec::new(),
        }
    }

    /// Active call on a slot, if any
    pub fn call(&self, slot: Slot) -> Option<&CallInfo> {
        self.slots[slot.index()].call.as_ref()
    }

    /// Carrier loss: close calls and clear all per-slot state
    pub fn no_carrier(&mut self) -> Vec<RxEvent> {
        let mut events = Vec::new();
        for ctx in self.slots.iter_mut() {
            if let Some(info) = ctx.call.take() {
                events.push(RxEvent::CallEnd(info));
            }
            *ctx = SlotContext::default();
        }
        self.color_code = None;
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flc(dest: u32, source: u32, svc: u8) -> FullLinkControl {
        FullLinkControl {
            flco: 0,
            fid: 0,
            service_options: svc,
            dest,
            source,
        }
    }

    fn csbk_bytes(opcode: u8, dest: u32, source: u32) -> [u8; 12] {
        let mut b = [0u8; 12];
        b[0] = 0x80 | (opcode & 0x3F);
        b[4..7].copy_from_slice(&dest.to_be_bytes()[1..]);
        b[7..10].copy_from_slice(&source.to_be_bytes()[1..]);
        let crc = crc16(&b[..10], CrcMask::Csbk);
        b[10..12].copy_from_slice(&crc.to_be_bytes());
        b
    }

    #[test]
    fn test_hamming74_roundtrip_and_correction() {
        for d in 0..16u8 {
            let code = hamming74_encode(d);
            assert_eq!(hamming74_decode(code), Some((d, false)));
            for i in 0..7 {
                let (got, fixed) = hamming74_decode(code ^ (1 << i)).unwrap();
                assert_eq!(got, d, "bit {} of data {}", i, d);
                assert!(fixed);
            }
        }
    }

    #[test]
    fn test_tact_slot_steering() {
        let mut m = DmrMachine::new();
        // data=0b0100 selects slot 1
        let t = parse_tact(hamming74_encode(0b0100)).unwrap();
        assert_eq!(t.slot, Slot::S1);
        m.on_tact(t);
        assert_eq!(m.current_slot(), Slot::S1);
    }

    #[test]
    fn test_csbk_decode() {
        let mut m = DmrMachine::new();
        let events = m.on_csbk(&csbk_bytes(0x39, 1234, 5678));
        assert_eq!(events.len(), 1);
        let RxEvent::Signaling(sig) = &events[0] else {
            panic!("expected signaling event");
        };
        assert_eq!(sig.opcode, 0x39);
        assert_eq!(sig.talkgroup, 1234);
        assert_eq!(sig.source, 5678);
        assert_eq!(sig.description, "BS outbound activation");
    }

    #[test]
    fn test_csbk_bad_crc_rejected() {
        let mut m = DmrMachine::new();
        let mut b = csbk_bytes(0x39, 1234, 5678);
        b[5] ^= 0x01;
        assert!(m.on_csbk(&b).is_empty());
    }

    #[test]
    fn test_voice_call_lifecycle() {
        let mut m = DmrMachine::new();
        let events = m.on_voice_header(&flc(1234, 5678, 0));
        assert!(matches!(&events[0], RxEvent::CallStart(ci)
            if ci.talkgroup == 1234 && ci.source == 5678 && !ci.encrypted));

        // repeated header mid-call emits nothing new
        assert!(m.on_voice_header(&flc(1234, 5678, 0)).is_empty());

        let events = m.on_terminator();
        assert!(matches!(&events[0], RxEvent::CallEnd(ci) if ci.talkgroup == 1234));
        assert!(m.call(Slot::S0).is_none());
    }

    #[test]
    fn test_pi_header_marks_encryption() {
        let mut m = DmrMachine::new();
        m.on_voice_header(&flc(100, 200, 0));

        let mut raw = [0u8; 10];
        raw[0] = 0x02; // RC4
        raw[2] = 0x05;
        raw[3..7].copy_from_slice(&[1, 2, 3, 4]);
        let events = m.on_pi_header(PiHeader::parse(&raw));
        assert!(matches!(&events[0], RxEvent::CallUpdate(ci)
            if ci.encrypted && ci.alg == Algorithm::Rc4 && ci.key_id == 5));
    }

    #[test]
    fn test_superframe_cadence() {
        let mut m = DmrMachine::new();
        assert!(m.on_voice_burst()); // burst A
        for _i in 0..5 {
            assert!(!m.on_voice_burst()); // B..F
        }
        assert!(m.on_voice_burst()); // next superframe
    }

    #[test]
    fn test_cascade_failure_resets_blocks() {
        let mut m = DmrMachine::new();
        m.on_voice_header(&flc(9, 8, 0));
        assert!(!m.on_cascade_failure());
        assert!(!m.on_cascade_failure());
        assert!(m.on_cascade_failure());
        // call context preserved through reset_blocks
        assert!(m.call(Slot::S0).is_some());
    }

    #[test]
    fn test_no_carrier_closes_calls() {
        let mut m = DmrMachine::new();
        m.on_voice_header(&flc(1, 2, 0));
        let events = m.no_carrier();
        assert!(matches!(events[0], RxEvent::CallEnd(_)));
        assert!(m.call(Slot::S0).is_none());
        assert!(m.color_code().is_none());
    }

    #[test]
    fn test_data_type_codes() {
        assert_eq!(DataType::from_code(0x3), DataType::Csbk);
        assert_eq!(DataType::from_code(0x6), DataType::DataHeader);
        assert_eq!(DataType::from_code(0x9), DataType::Idle);
        let st = SlotType::from_byte(0x53);
        assert_eq!(st.color_code, 5);
        assert_eq!(st.data_type, DataType::Csbk);
    }
}
