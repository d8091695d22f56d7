//! P25 Phase 1 and Phase 2 state machines
//!
//! Phase 1 (FDMA, C4FM) frames open with a Network Identifier: 12-bit
//! NAC plus a 4-bit Data Unit ID that selects the frame body. Voice
//! travels as IMBE in LDU1/LDU2 pairs; LDU2 repeats the encryption
//! sync (algorithm, key id, 72-bit message indicator) so a receiver
//! joining mid-call can classify the traffic. Control channels carry
//! trunking signaling blocks (TSBK) in TSDU frames.
//!
//! Phase 2 (TDMA) replaces the NID with MAC signaling per slot;
//! push-to-talk and end-of-call MAC messages carry the same
//! encryption sync material.
//!
//! The machine consumes FEC-corrected bytes with error counts and
//! emits [`RxEvent`]s; frequency planning from grant channel numbers
//! is left to the trunking layer.

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

/// Data Unit ID from the Phase 1 NID
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum_macros::Display)]
pub enum Duid {
    /// Header data unit: opens a voice call, carries encryption sync
    Hdu,
    /// Terminator without link control
    Tdu,
    /// Logical link data unit 1: voice + link control
    Ldu1,
    /// Trunking signaling data unit
    Tsdu,
    /// Logical link data unit 2: voice + encryption sync
    Ldu2,
    /// Packet data unit
    Pdu,
    /// Terminator with link control
    TduLc,
    Unknown(u8),
}

impl Duid {
    pub fn from_code(code: u8) -> Self {
        match code & 0x0F {
            0x0 => Duid::Hdu,
            0x3 => Duid::Tdu,
            0x5 => Duid::Ldu1,
            0x7 => Duid::Tsdu,
            0xA => Duid::Ldu2,
            0xC => Duid::Pdu,
            0xF => Duid::TduLc,
            other => Duid::Unknown(other),
        }
    }
}

/// Phase 1 Network Identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Nid {
    pub nac: u16,
    pub duid: Duid,
}

impl Nid {
    /// Split a corrected 16-bit NID codeword
    pub fn from_word(word: u16) -> Self {
        Self {
            nac: word >> 4,
            duid: Duid::from_code((word & 0x0F) as u8),
        }
    }
}

/// Encryption sync material from HDU, LDU2, or a MAC PTT
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EncryptionSync {
    pub algid: u8,
    pub key_id: u16,
    pub mi: [u8; 9],
}

impl EncryptionSync {
    pub fn algorithm(&self) -> Algorithm {
        Algorithm::from_p25_algid(self.algid)
    }

    pub fn is_clear(&self) -> bool {
        self.algorithm() == Algorithm::Clear
    }

    /// Parse the 12-byte ESS field: MI(9) + ALGID(1) + KID(2)
    pub fn parse(bytes: &[u8; 12]) -> Self {
        let mut mi = [0u8; 9];
        mi.copy_from_slice(&bytes[..9]);
        Self {
            algid: bytes[9],
            key_id: u16::from_be_bytes([bytes[10], bytes[11]]),
            mi,
        }
    }
}

/// Voice channel grant extracted from trunking signaling
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GrantInfo {
    /// channel number; the trunking layer maps it to a frequency
    pub channel: u16,
    pub talkgroup: u32,
    pub source: u32,
    /// grant names a TDMA (Phase 2) voice channel
    pub tdma: bool,
}

/// TSBK opcodes this machine acts on
pub mod tsbk_opcode {
    pub const GROUP_VOICE_GRANT: u8 = 0x00;
    pub const GROUP_VOICE_GRANT_UPDATE: u8 = 0x02;
    pub const SECONDARY_CC: u8 = 0x39;
    pub const RFSS_STATUS: u8 = 0x3A;
    pub const NETWORK_STATUS: u8 = 0x3B;
    pub const ADJACENT_STATUS: u8 = 0x3C;
}

/// A parsed trunking signaling block
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Tsbk {
    pub last_block: bool,
    pub opcode: u8,
    pub mfid: u8,
    pub args: [u8; 8],
}

impl Tsbk {
    /// Parse a 12-byte deinterleaved, trellis-corrected TSBK
    ///
    /// The final two bytes are CCITT-16 over the preceding ten.
    pub fn parse(bytes: &[u8; 12]) -> Option<Self> {
        let crc = u16::from_be_bytes([bytes[10], bytes[11]]);
        if crc16(&bytes[..10], CrcMask::None) != crc {
            return None;
        }
        let mut args = [0u8; 8];
        args.copy_from_slice(&bytes[2..10]);
        Some(Self {
            last_block: bytes[0] & 0x80 != 0,
            opcode: bytes[0] & 0x3F,
            mfid: bytes[1],
            args,
        })
    }

    /// Interpret grant opcodes
    pub fn grant(&self) -> Option<GrantInfo> {
        match self.opcode {
            tsbk_opcode::GROUP_VOICE_GRANT | tsbk_opcode::GROUP_VOICE_GRANT_UPDATE => {
                // svc(1) chan(2) group(2) source(3)
                Some(GrantInfo {
                    channel: u16::from_be_bytes([self.args[1], self.args[2]]),
                    talkgroup: u32::from_be_bytes([0, 0, self.args[3], self.args[4]]),
                    source: u32::from_be_bytes([0, self.args[5], self.args[6], self.args[7]]),
                    tdma: self.args[0] & 0x04 != 0,
                })
            }
            _ => None,
        }
    }
}

/// Phase 2 MAC message opcodes
pub mod mac_opcode {
    pub const PTT: u8 = 0x01;
    pub const END_PTT: u8 = 0x02;
    pub const IDLE: u8 = 0x03;
    pub const ACTIVE: u8 = 0x04;
    pub const HANGTIME: u8 = 0x05;
}

/// A Phase 2 MAC message relevant to call tracking
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MacMessage {
    pub opcode: u8,
    pub talkgroup: u32,
    pub source: u32,
    pub ess: Option<EncryptionSync>,
}

impl MacMessage {
    /// Parse a MAC PDU payload after FEC
    ///
    /// PTT carries MI(9) ALGID(1) KID(2) group(2) source(3); END_PTT
    /// carries group and source only.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let opcode = *bytes.first()? & 0x3F;
        match opcode {
            mac_opcode::PTT => {
                if bytes.len() < 18 {
                    return None;
                }
                let mut ess_bytes = [0u8; 12];
                ess_bytes.copy_from_slice(&bytes[1..13]);
                Some(Self {
                    opcode,
                    talkgroup: u32::from_be_bytes([0, 0, bytes[13], bytes[14]]),
                    source: u32::from_be_bytes([0, bytes[15], bytes[16], bytes[17]]),
                    ess: Some(EncryptionSync::parse(&ess_bytes)),
                })
            }
            mac_opcode::END_PTT => {
                if bytes.len() < 6 {
                    return None;
                }
                Some(Self {
                    opcode,
                    talkgroup: u32::from_be_bytes([0, 0, bytes[1], bytes[2]]),
                    source: u32::from_be_bytes([0, bytes[3], bytes[4], bytes[5]]),
                    ess: None,
                })
            }
            mac_opcode::IDLE | mac_opcode::ACTIVE | mac_opcode::HANGTIME => Some(Self {
                opcode,
                talkgroup: 0,
                source: 0,
                ess: None,
            }),
            _ => None,
        }
    }
}

/// Air interface phase the machine is tracking
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum P25Phase {
    #[default]
    Phase1,
    Phase2,
}

impl P25Phase {
    pub fn protocol(&self) -> Protocol {
        match self {
            P25Phase::Phase1 => Protocol::P25Phase1,
            P25Phase::Phase2 => Protocol::P25Phase2,
        }
    }
}

#[derive(Clone, Debug, Default)]
struct SlotContext {
    call: Option<CallInfo>,
    ess: Option<EncryptionSync>,
}

/// P25 call and signaling state machine
#[derive(Clone, Debug)]
pub struct P25Machine {
    phase: P25Phase,
    /// last NAC seen; site identity for the trunking layer
    nac: u16,
    wacn: u32,
    sysid: u16,
    slots: [SlotContext; 2],
    /// grants observed since the last drain
    grants: Vec<GrantInfo>,
}

impl Default for P25Machine {
    fn default() -> Self {
        Self::new()
    }
}

impl P25Machine {
    pub fn new() -> Self {
        Self {
            phase: P25Phase::Phase1,
            nac: 0,
            wacn: 0,
            sysid: 0,
            slots: [SlotContext::default(), SlotContext::default()],
            grants: Vec::new(),
        }
    }

    pub fn phase(&self) -> P25Phase {
        self.phase
    }

    /// Switch between FDMA and TDMA tracking; drops per-slot state
    pub fn set_phase(&mut self, phase: P25Phase) {
        if phase != self.phase {
            debug!("p25: rate switch to {:?}", phase);
            self.phase = phase;
            self.slots = [SlotContext::default(), SlotContext::default()];
        }
    }

    pub fn nac(&self) -> u16 {
        self.nac
    }

    /// Site identity observed from network status broadcasts
    pub fn site(&self) -> (u32, u16) {
        (self.wacn, self.sysid)
    }

    /// Take the grants accumulated from control signaling
    pub fn drain_grants(&mut self) -> Vec<GrantInfo> {
        std::mem::take(&mut self.grants)
    }

    /// Phase 1 NID at the head of each frame
    pub fn on_nid(&mut self, nid: Nid) {
        self.nac = nid.nac;
        trace!("p25: nac {:#05x} duid {}", nid.nac, nid.duid);
    }

    /// HDU encryption sync opens a call on slot 0
    pub fn on_hdu(&mut self, ess: EncryptionSync, talkgroup: u32) -> Vec<RxEvent> {
        self.start_call(Slot::S0, talkgroup, 0, Some(ess))
    }

    /// LDU1 link control: group/source addressing mid-call
    pub fn on_ldu1(&mut self, talkgroup: u32, source: u32) -> Vec<RxEvent> {
        let ess = self.slots[0].ess;
        self.start_call(Slot::S0, talkgroup, source, ess)
    }

    /// LDU2 encryption sync: late entry reclassification
    pub fn on_ldu2(&mut self, ess: EncryptionSync) -> Vec<RxEvent> {
        self.slots[0].ess = Some(ess);
        let Some(call) = self.slots[0].call.clone() else {
            // voice without a header yet: open from the ESS alone
            return self.start_call(Slot::S0, 0, 0, Some(ess));
        };
        let mut updated = call.clone();
        apply_ess(&mut updated, &ess);
        if updated != call {
            self.slots[0].call = Some(updated.clone());
            return vec![RxEvent::CallUpdate(updated)];
        }
        Vec::new()
    }

    /// Terminator data unit ends the slot-0 call
    pub fn on_tdu(&mut self) -> Vec<RxEvent> {
        self.end_call(Slot::S0)
    }

    /// TSDU signaling block on a control channel
    pub fn on_tsbk(&mut self, tsbk: &Tsbk) -> Vec<RxEvent> {
        let mut events = Vec::new();
        if let Some(grant) = tsbk.grant() {
            debug!(
                "p25: voice grant ch {} tg {} src {}",
                grant.channel, grant.talkgroup, grant.source
            );
            self.grants.push(grant);
        }
        match tsbk.opcode {
            tsbk_opcode::NETWORK_STATUS => {
                // lra(1) wacn(20) sysid(12) chan(2) ...
                self.wacn = (u32::from_be_bytes([
                    0, tsbk.args[1], tsbk.args[2], tsbk.args[3],
                ])) >> 4;
                self.sysid =
                    u16::from_be_bytes([tsbk.args[3], tsbk.args[4]]) & 0x0FFF;
            }
            _ => {}
        }
        events.push(RxEvent::Signaling(SignalingEvent {
            protocol: self.phase.protocol(),
            slot: Slot::S0,
            opcode: tsbk.opcode,
            talkgroup: tsbk.grant().map(|g| g.talkgroup).unwrap_or(0),
            source: tsbk.grant().map(|g| g.source).unwrap_or(0),
            description: describe_tsbk(tsbk.opcode),
        }));
        events
    }

    /// Phase 2 MAC message for one TDMA slot
    pub fn on_mac(&mut self, slot: Slot, mac: &MacMessage) -> Vec<RxEvent> {
        match mac.opcode {
            mac_opcode::PTT => self.start_call(slot, mac.talkgroup, mac.source, mac.ess),
            mac_opcode::END_PTT => self.end_call(slot),
            _ => Vec::new(),
        }
    }

    /// Carrier lost: close all calls and forget slot state
    pub fn no_carrier(&mut self) -> Vec<RxEvent> {
        let mut events = Vec::new();
        events.extend(self.end_call(Slot::S0));
        events.extend(self.end_call(Slot::S1));
        events
    }

    /// Whether the slot's traffic is encrypted (known ESS, non-clear)
    pub fn slot_encrypted(&self, slot: Slot) -> bool {
        self.slots[slot.index()]
            .ess
            .map(|e| !e.is_clear())
            .unwrap_or(false)
    }

    /// ESS currently governing the slot
    pub fn slot_ess(&self, slot: Slot) -> Option<EncryptionSync> {
        self.slots[slot.index()].ess
    }

    fn start_call(
        &mut self,
        slot: Slot,
        talkgroup: u32,
        source: u32,
        ess: Option<EncryptionSync>,
    ) -> Vec<RxEvent> {
        let ctx = &mut self.slots[slot.index()];
        let mut call = CallInfo::clear(self.phase.protocol(), slot, talkgroup, source);
        if let Some(ess) = ess {
            ctx.ess = Some(ess);
            apply_ess(&mut call, &ess);
        }
        match &ctx.call {
            Some(existing) if *existing == call => Vec::new(),
            Some(_) => {
                ctx.call = Some(call.clone());
                vec![RxEvent::CallUpdate(call)]
            }
            None => {
                ctx.call = Some(call.clone());
                vec![RxEvent::CallStart(call)]
            }
        }
    }

    fn end_call(&mut self, slot: Slot) -> Vec<RxEvent> {
        let ctx = &mut self.slots[slot.index()];
        ctx.ess = None;
        match ctx.call.take() {
            Some(call) => vec![RxEvent::CallEnd(call)],
            None => Vec::new(),
        }
    }
}

fn apply_ess(call: &mut CallInfo, ess: &EncryptionSync) {
    call.alg = ess.algorithm();
    call.encrypted = !ess.is_clear();
    call.key_id = ess.key_id;
}

fn describe_tsbk(opcode: u8) -> String {
    match opcode {
        tsbk_opcode::GROUP_VOICE_GRANT => "group voice grant".to_owned(),
        tsbk_opcode::GROUP_VOICE_GRANT_UPDATE => "group voice grant update".to_owned(),
        tsbk_opcode::SECONDARY_CC => "secondary control channel".to_owned(),
        tsbk_opcode::RFSS_STATUS => "RFSS status broadcast".to_owned(),
        tsbk_opcode::NETWORK_STATUS => "network status broadcast".to_owned(),
        tsbk_opcode::ADJACENT_STATUS => "adjacent site status".to_owned(),
        other => format!("opcode {:#04x}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tsbk_bytes(opcode: u8, args: [u8; 8]) -> [u8; 12] {
        let mut b = [0u8; 12];
        b[0] = 0x80 | opcode;
        b[1] = 0x00;
        b[2..10].copy_from_slice(&args);
        let crc = crc16(&b[..10], CrcMask::None);
        b[10..12].copy_from_slice(&crc.to_be_bytes());
        b
    }

    fn grant_args(channel: u16, tg: u16, src: u32, tdma: bool) -> [u8; 8] {
        let ch = channel.to_be_bytes();
        let tg = tg.to_be_bytes();
        let src = src.to_be_bytes();
        [
            if tdma { 0x04 } else { 0x00 },
            ch[0],
            ch[1],
            tg[0],
            tg[1],
            src[1],
            src[2],
            src[3],
        ]
    }

    fn aes_ess() -> EncryptionSync {
        EncryptionSync {
            algid: 0x84,
            key_id: 0x0123,
            mi: [1, 2, 3, 4, 5, 6, 7, 8, 9],
        }
    }

    #[test]
    fn test_nid_split() {
        let nid = Nid::from_word(0x293A);
        assert_eq!(nid.nac, 0x293);
        assert_eq!(nid.duid, Duid::Ldu2);
        assert_eq!(Nid::from_word(0x2930).duid, Duid::Hdu);
        assert_eq!(Nid::from_word(0x2937).duid, Duid::Tsdu);
    }

    #[test]
    fn test_tsbk_crc_and_grant() {
        let raw = tsbk_bytes(
            tsbk_opcode::GROUP_VOICE_GRANT,
            grant_args(0x100A, 4501, 700123, false),
        );
        let tsbk = Tsbk::parse(&raw).unwrap();
        assert!(tsbk.last_block);
        let grant = tsbk.grant().unwrap();
        assert_eq!(grant.channel, 0x100A);
        assert_eq!(grant.talkgroup, 4501);
        assert_eq!(grant.source, 700123);
        assert!(!grant.tdma);

        let mut bad = raw;
        bad[4] ^= 0x01;
        assert!(Tsbk::parse(&bad).is_none());
    }

    #[test]
    fn test_machine_accumulates_grants() {
        let mut m = P25Machine::new();
        let raw = tsbk_bytes(
            tsbk_opcode::GROUP_VOICE_GRANT,
            grant_args(10, 200, 300, true),
        );
        let tsbk = Tsbk::parse(&raw).unwrap();
        let events = m.on_tsbk(&tsbk);
        assert!(matches!(&events[0], RxEvent::Signaling(s) if s.talkgroup == 200));

        let grants = m.drain_grants();
        assert_eq!(grants.len(), 1);
        assert!(grants[0].tdma);
        assert!(m.drain_grants().is_empty());
    }

    #[test]
    fn test_voice_call_lifecycle_phase1() {
        let mut m = P25Machine::new();
        m.on_nid(Nid::from_word(0x2930));

        let clear = EncryptionSync {
            algid: 0x80,
            key_id: 0,
            mi: [0; 9],
        };
        let events = m.on_hdu(clear, 4501);
        assert!(matches!(&events[0], RxEvent::CallStart(c) if !c.encrypted));

        // LDU1 fills in the source address
        let events = m.on_ldu1(4501, 700123);
        assert!(matches!(&events[0], RxEvent::CallUpdate(c) if c.source == 700123));

        let events = m.on_tdu();
        assert!(matches!(&events[0], RxEvent::CallEnd(_)));
        assert!(m.on_tdu().is_empty());
    }

    #[test]
    fn test_ldu2_late_entry_aes_mute_classification() {
        // join mid-call: first frame seen is an LDU2 with AES-256
        let mut m = P25Machine::new();
        let events = m.on_ldu2(aes_ess());
        let RxEvent::CallStart(call) = &events[0] else {
            panic!("expected call start");
        };
        assert!(call.encrypted);
        assert_eq!(call.alg, Algorithm::Aes256);
        assert_eq!(call.key_id, 0x0123);
        assert!(m.slot_encrypted(Slot::S0));
    }

    #[test]
    fn test_ldu2_reclassifies_existing_call() {
        let mut m = P25Machine::new();
        m.on_ldu1(4501, 700123);
        let events = m.on_ldu2(aes_ess());
        assert!(matches!(&events[0], RxEvent::CallUpdate(c) if c.encrypted));
        // repeated identical ESS is quiet
        assert!(m.on_ldu2(aes_ess()).is_empty());
    }

    #[test]
    fn test_mac_ptt_and_end() {
        let mut m = P25Machine::new();
        m.set_phase(P25Phase::Phase2);

        let mut ptt = vec![mac_opcode::PTT];
        ptt.extend_from_slice(&[9, 8, 7, 6, 5, 4, 3, 2, 1]); // MI
        ptt.push(0xAA); // RC4
        ptt.extend_from_slice(&0x0042u16.to_be_bytes());
        ptt.extend_from_slice(&1234u16.to_be_bytes());
        ptt.extend_from_slice(&567890u32.to_be_bytes()[1..]);
        let mac = MacMessage::parse(&ptt).unwrap();
        assert_eq!(mac.ess.unwrap().algorithm(), Algorithm::Rc4);

        let events = m.on_mac(Slot::S1, &mac);
        let RxEvent::CallStart(call) = &events[0] else {
            panic!("expected call start");
        };
        assert_eq!(call.protocol, Protocol::P25Phase2);
        assert_eq!(call.slot, Slot::S1);
        assert_eq!(call.talkgroup, 1234);

        let mut end = vec![mac_opcode::END_PTT];
        end.extend_from_slice(&1234u16.to_be_bytes());
        end.extend_from_slice(&567890u32.to_be_bytes()[1..]);
        let mac = MacMessage::parse(&end).unwrap();
        let events = m.on_mac(Slot::S1, &mac);
        assert!(matches!(&events[0], RxEvent::CallEnd(_)));
    }

    #[test]
    fn test_phase_switch_resets_slots() {
        let mut m = P25Machine::new();
        m.on_ldu1(1, 2);
        m.set_phase(P25Phase::Phase2);
        assert!(m.on_tdu().is_empty());
        assert_eq!(m.phase(), P25Phase::Phase2);
    }

    #[test]
    fn test_no_carrier_closes_both_slots() {
        let mut m = P25Machine::new();
        m.set_phase(P25Phase::Phase2);
        let ptt_for = |tg: u16| {
            let mut p = vec![mac_opcode::PTT];
            p.extend_from_slice(&[0u8; 9]);
            p.push(0x80);
            p.extend_from_slice(&0u16.to_be_bytes());
            p.extend_from_slice(&tg.to_be_bytes());
            p.extend_from_slice(&[0, 0, 1]);
            p
        };
        m.on_mac(Slot::S0, &MacMessage::parse(&ptt_for(10)).unwrap());
        m.on_mac(Slot::S1, &MacMessage::parse(&ptt_for(20)).unwrap());

        let events = m.no_carrier();
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], RxEvent::CallEnd(c) if c.slot == Slot::S0));
        assert!(matches!(&events[1], RxEvent::CallEnd(c) if c.slot == Slot::S1));
    }
}
