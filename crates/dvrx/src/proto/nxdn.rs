//! NXDN state machine
//!
//! Every NXDN frame after the FSW carries a LICH octet naming the RF
//! channel type and which logical channels ride in the frame. Voice
//! frames spread one layer-3 message across four 18-bit SACCH
//! fragments (each guarded by CRC6); non-voice frames carry a whole
//! message in FACCH (CRC12), and control channels use CAC. Layer-3
//! messages open with a message type octet followed by the RAN.
//!
//! The machine filters on RAN when one is configured, assembles the
//! SACCH superframe, and tracks the single-call (non-TDMA) lifecycle.

use arrayvec::ArrayVec;

use crate::bits::BitCursor;
use crate::crc::{crc12, crc6};
use crate::crypto::Algorithm;
use crate::framesync::Protocol;
use crate::proto::{CallInfo, RxEvent, SignalingEvent, Slot};

#[cfg(not(test))]
use log::{debug, trace};

#[cfg(test)]
use std::println as debug;

#[cfg(test)]
use std::println as trace;

/// RF channel type from the LICH
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum_macros::Display)]
pub enum RfChannel {
    /// control channel
    Rcch,
    /// traffic channel, voice
    Rtch,
    /// traffic channel, data
    Rdch,
    Reserved,
}

/// Link Information Channel octet
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Lich {
    pub rf_channel: RfChannel,
    /// frame carries SACCH + voice (vs FACCH)
    pub voice_frame: bool,
    /// outbound (base to mobile)
    pub outbound: bool,
}

impl Lich {
    /// Decode the LICH; `None` on bad even parity
    pub fn from_byte(byte: u8) -> Option<Self> {
        if (byte.count_ones() & 1) != 0 {
            return None;
        }
        let rf = match byte >> 6 {
            0b00 => RfChannel::Rcch,
            0b01 => RfChannel::Rtch,
            0b10 => RfChannel::Rdch,
            _ => RfChannel::Reserved,
        };
        Some(Self {
            rf_channel: rf,
            voice_frame: byte & 0x20 != 0,
            outbound: byte & 0x02 != 0,
        })
    }
}

/// Layer-3 message types
pub mod message_type {
    pub const VCALL: u8 = 0x01;
    pub const VCALL_IV: u8 = 0x03;
    pub const TX_RELEASE: u8 = 0x08;
    pub const DCALL_HEADER: u8 = 0x09;
    pub const IDLE: u8 = 0x10;
    pub const DISC_INFO: u8 = 0x11;
    pub const SRV_INFO: u8 = 0x19;
}

/// NXDN cipher type field
fn cipher_algorithm(cipher: u8) -> Algorithm {
    match cipher & 0x03 {
        0 => Algorithm::Clear,
        1 => Algorithm::VendorLfsr, // 15-bit scrambler
        2 => Algorithm::Des,
        _ => Algorithm::Aes256,
    }
}

/// A decoded VCALL/DCALL header
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CallHeader {
    pub message_type: u8,
    pub ran: u8,
    pub group: bool,
    pub source: u32,
    pub dest: u32,
    pub cipher: u8,
    pub key_id: u8,
}

impl CallHeader {
    /// Parse a VCALL or DCALL header from an assembled layer-3 body
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 8 {
            return None;
        }
        let mut cur = BitCursor::new(bytes);
        let message_type = cur.read(6).ok()? as u8;
        let ran = cur.read(6).ok()? as u8;
        cur.skip(2).ok()?;
        // option field: call type in the top bits
        let option = cur.read_u8().ok()?;
        let source = cur.read(16).ok()?;
        let dest = cur.read(16).ok()?;
        let cipher = cur.read(2).ok()? as u8;
        let key_id = cur.read(6).ok()? as u8;
        Some(Self {
            message_type,
            ran,
            group: option & 0x80 == 0,
            source,
            dest,
            cipher,
            key_id,
        })
    }

    pub fn algorithm(&self) -> Algorithm {
        cipher_algorithm(self.cipher)
    }
}

/// SACCH superframe assembler: four 18-bit fragments per message
#[derive(Clone, Debug, Default)]
pub struct SacchAssembler {
    bits: ArrayVec<u8, { 4 * SACCH_FRAGMENT_BITS }>,
    /// next expected structure field countdown (3..=0)
    expect: u8,
}

/// Fragment payload bits after the structure field and CRC
pub const SACCH_FRAGMENT_BITS: usize = 18;

impl SacchAssembler {
    pub fn new() -> Self {
        Self {
            bits: ArrayVec::new(),
            expect: 3,
        }
    }

    pub fn reset(&mut self) {
        self.bits.clear();
        self.expect = 3;
    }

    /// Feed one SACCH field: structure countdown, 18 payload bits
    /// (MSB-justified in `frag`), and the received CRC6
    ///
    /// The CRC covers the structure field plus the payload bits.
    /// Returns the assembled 9-byte message when the superframe
    /// completes.
    pub fn push(&mut self, structure: u8, frag: &[u8; 3], crc: u8) -> Option<Vec<u8>> {
        let structure = structure & 0x03;
        let mut check = [0u8; 4];
        check[0] = structure << 6 | frag[0] >> 2;
        check[1] = frag[0] << 6 | frag[1] >> 2;
        check[2] = frag[1] << 6 | frag[2] >> 2;
        if crc6(&check, 2 + SACCH_FRAGMENT_BITS) != crc & 0x3F {
            trace!("nxdn: sacch fragment crc6 fail");
            self.reset();
            return None;
        }
        if structure != self.expect {
            // lost a fragment; resynchronize on the next superframe
            self.reset();
            if structure != 3 {
                return None;
            }
        }

        for n in 0..SACCH_FRAGMENT_BITS {
            self.bits.push((frag[n / 8] >> (7 - n % 8)) & 1);
        }
        if self.expect == 0 {
            let msg = pack_bits(&self.bits);
            self.reset();
            return Some(msg);
        }
        self.expect -= 1;
        None
    }
}

fn pack_bits(bits: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8; (bits.len() + 7) / 8];
    for (n, &b) in bits.iter().enumerate() {
        out[n / 8] |= (b & 1) << (7 - n % 8);
    }
    out
}

/// Verify a FACCH/CAC body: last 12 bits are CRC12 over the rest
pub fn check_crc12(bytes: &[u8], nbits: usize) -> bool {
    if nbits < 12 {
        return false;
    }
    let body_bits = nbits - 12;
    let mut cur = BitCursor::new(bytes);
    if cur.skip(body_bits).is_err() {
        return false;
    }
    let Ok(want) = cur.read(12) else {
        return false;
    };
    crc12(bytes, body_bits) == want as u16
}

/// NXDN call and signaling state machine
#[derive(Clone, Debug)]
pub struct NxdnMachine {
    /// RAN filter; 0 accepts any
    ran: u8,
    lich: Option<Lich>,
    sacch: SacchAssembler,
    call: Option<CallInfo>,
    /// last site RAN observed
    site_ran: u8,
}

impl Default for NxdnMachine {
    fn default() -> Self {
        Self::new(0)
    }
}

impl NxdnMachine {
    pub fn new(ran_filter: u8) -> Self {
        Self {
            ran: ran_filter & 0x3F,
            lich: None,
            sacch: SacchAssembler::new(),
            call: None,
            site_ran: 0,
        }
    }

    pub fn set_ran_filter(&mut self, ran: u8) {
        self.ran = ran & 0x3F;
    }

    pub fn site_ran(&self) -> u8 {
        self.site_ran
    }

    pub fn lich(&self) -> Option<Lich> {
        self.lich
    }

    pub fn on_lich(&mut self, lich: Lich) {
        if self.lich.map(|l| l.rf_channel) != Some(lich.rf_channel) {
            debug!("nxdn: {} frame", lich.rf_channel);
        }
        self.lich = Some(lich);
    }

    /// SACCH field from a voice frame
    pub fn on_sacch(&mut self, structure: u8, frag: &[u8; 3], crc: u8) -> Vec<RxEvent> {
        match self.sacch.push(structure, frag, crc) {
            Some(msg) => self.on_message(&msg),
            None => Vec::new(),
        }
    }

    /// Whole layer-3 message from FACCH or CAC, already CRC-checked
    pub fn on_message(&mut self, body: &[u8]) -> Vec<RxEvent> {
        let Some(&mt) = body.first() else {
            return Vec::new();
        };
        let mt = (mt >> 2) & 0x3F;
        match mt {
            message_type::VCALL | message_type::VCALL_IV | message_type::DCALL_HEADER => {
                let Some(header) = CallHeader::parse(body) else {
                    return Vec::new();
                };
                self.site_ran = header.ran;
                if self.ran != 0 && header.ran != self.ran {
                    trace!("nxdn: ran {} filtered (want {})", header.ran, self.ran);
                    return Vec::new();
                }
                self.start_call(&header)
            }
            message_type::TX_RELEASE => self.end_call(),
            message_type::IDLE => Vec::new(),
            message_type::DISC_INFO | message_type::SRV_INFO => {
                vec![RxEvent::Signaling(SignalingEvent {
                    protocol: Protocol::Nxdn,
                    slot: Slot::S0,
                    opcode: mt,
                    talkgroup: 0,
                    source: 0,
                    description: if mt == message_type::SRV_INFO {
                        "service information".to_owned()
                    } else {
                        "disconnect information".to_owned()
                    },
                })]
            }
            other => {
                trace!("nxdn: message type {:#04x} ignored", other);
                Vec::new()
            }
        }
    }

    pub fn no_carrier(&mut self) -> Vec<RxEvent> {
        self.lich = None;
        self.sacch.reset();
        self.end_call()
    }

    fn start_call(&mut self, header: &CallHeader) -> Vec<RxEvent> {
        let mut call = CallInfo::clear(Protocol::Nxdn, Slot::S0, header.dest, header.source);
        call.group = header.group;
        call.alg = header.algorithm();
        call.encrypted = call.alg != Algorithm::Clear;
        call.key_id = header.key_id as u16;
        match &self.call {
            Some(existing) if *existing == call => Vec::new(),
            Some(_) => {
                self.call = Some(call.clone());
                vec![RxEvent::CallUpdate(call)]
            }
            None => {
                self.call = Some(call.clone());
                vec![RxEvent::CallStart(call)]
            }
        }
    }

    fn end_call(&mut self) -> Vec<RxEvent> {
        match self.call.take() {
            Some(call) => vec![RxEvent::CallEnd(call)],
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bits::BitWriter;

    fn vcall_body(mt: u8, ran: u8, src: u16, dst: u16, cipher: u8, key_id: u8) -> Vec<u8> {
        let mut w = BitWriter::new();
        w.write(mt as u32, 6);
        w.write(ran as u32, 6);
        w.write(0, 2); // pad into option byte alignment used by parse
        w.write(0, 8); // option: group
        w.write(src as u32, 16);
        w.write(dst as u32, 16);
        w.write(cipher as u32, 2);
        w.write(key_id as u32, 6);
        w.write(0, 10);
        w.into_bytes()
    }

    fn sacch_crc(structure: u8, frag: &[u8; 3]) -> u8 {
        let mut check = [0u8; 4];
        check[0] = structure << 6 | frag[0] >> 2;
        check[1] = frag[0] << 6 | frag[1] >> 2;
        check[2] = frag[1] << 6 | frag[2] >> 2;
        crc6(&check, 2 + SACCH_FRAGMENT_BITS)
    }

    #[test]
    fn test_lich_parity_and_fields() {
        // RTCH, voice, outbound: 0b0110_0010 has three ones -> add parity
        let byte = 0b0110_0011u8;
        let lich = Lich::from_byte(byte).unwrap();
        assert_eq!(lich.rf_channel, RfChannel::Rtch);
        assert!(lich.voice_frame);
        assert!(lich.outbound);

        assert!(Lich::from_byte(0b0110_0010).is_none()); // odd parity
        assert_eq!(Lich::from_byte(0).unwrap().rf_channel, RfChannel::Rcch);
    }

    #[test]
    fn test_vcall_opens_call() {
        let mut m = NxdnMachine::new(0);
        let body = vcall_body(message_type::VCALL, 5, 100, 200, 0, 0);
        let events = m.on_message(&body);
        let RxEvent::CallStart(call) = &events[0] else {
            panic!("expected call start");
        };
        assert_eq!(call.protocol, Protocol::Nxdn);
        assert_eq!(call.talkgroup, 200);
        assert_eq!(call.source, 100);
        assert!(!call.encrypted);
        assert_eq!(m.site_ran(), 5);
    }

    #[test]
    fn test_scrambler_cipher_classification() {
        let mut m = NxdnMachine::new(0);
        let body = vcall_body(message_type::VCALL_IV, 1, 7, 9, 1, 12);
        let events = m.on_message(&body);
        let RxEvent::CallStart(call) = &events[0] else {
            panic!("expected call start");
        };
        assert!(call.encrypted);
        assert_eq!(call.alg, Algorithm::VendorLfsr);
        assert_eq!(call.key_id, 12);
    }

    #[test]
    fn test_ran_filter() {
        let mut m = NxdnMachine::new(3);
        let body = vcall_body(message_type::VCALL, 5, 1, 2, 0, 0);
        assert!(m.on_message(&body).is_empty());
        // the site RAN is still recorded for display
        assert_eq!(m.site_ran(), 5);

        let body = vcall_body(message_type::VCALL, 3, 1, 2, 0, 0);
        assert!(!m.on_message(&body).is_empty());
    }

    #[test]
    fn test_srv_info_emits_signaling() {
        let mut m = NxdnMachine::new(0);
        let body = vec![message_type::SRV_INFO << 2, 0, 0, 0, 0, 0, 0, 0];
        let events = m.on_message(&body);
        let RxEvent::Signaling(s) = &events[0] else {
            panic!("expected signaling");
        };
        assert_eq!(s.protocol, Protocol::Nxdn);
        assert_eq!(s.opcode, message_type::SRV_INFO);
        assert_eq!(s.description, "service information");
    }

    #[test]
    fn test_tx_release_ends_call() {
        let mut m = NxdnMachine::new(0);
        m.on_message(&vcall_body(message_type::VCALL, 1, 1, 2, 0, 0));
        let rel = vec![message_type::TX_RELEASE << 2, 0, 0, 0, 0, 0, 0, 0];
        let events = m.on_message(&rel);
        assert!(matches!(&events[0], RxEvent::CallEnd(_)));
        assert!(m.on_message(&rel).is_empty());
    }

    #[test]
    fn test_sacch_superframe_assembly() {
        let mut m = NxdnMachine::new(0);
        let body = vcall_body(message_type::VCALL, 1, 44, 55, 0, 0);
        // spread the first 72 bits over four 18-bit fragments
        let mut events = Vec::new();
        for (i, structure) in (0u8..4).map(|i| (i, 3 - i)) {
            let start = i as usize * SACCH_FRAGMENT_BITS;
            let mut frag = [0u8; 3];
            for n in 0..SACCH_FRAGMENT_BITS {
                let bit = start + n;
                let b = (body[bit / 8] >> (7 - bit % 8)) & 1;
                frag[n / 8] |= b << (7 - n % 8);
            }
            let crc = sacch_crc(structure, &frag);
            events = m.on_sacch(structure, &frag, crc);
        }
        let RxEvent::CallStart(call) = &events[0] else {
            panic!("expected call start from assembled sacch");
        };
        assert_eq!(call.talkgroup, 55);
        assert_eq!(call.source, 44);
    }

    #[test]
    fn test_sacch_bad_crc_resets() {
        let mut m = NxdnMachine::new(0);
        let frag = [0xAAu8, 0xBB, 0xC0];
        let events = m.on_sacch(3, &frag, sacch_crc(3, &frag) ^ 0x01);
        assert!(events.is_empty());
        assert_eq!(m.sacch.expect, 3);
    }

    #[test]
    fn test_crc12_check() {
        let mut w = BitWriter::new();
        w.write(0xABCD, 16);
        w.write(0x12, 8);
        let body = w.into_bytes();
        let c = crc12(&body, 24);
        let mut w = BitWriter::new();
        w.write(0xABCD, 16);
        w.write(0x12, 8);
        w.write(c as u32, 12);
        let framed = w.into_bytes();
        assert!(check_crc12(&framed, 36));
        let mut bad = framed.clone();
        bad[0] ^= 0x40;
        assert!(!check_crc12(&bad, 36));
    }
}
