//! DMR data PDU assembly and dispatch
//!
//! A data call opens with a 12-byte data header naming the format,
//! service access point, and block count; payload then arrives as
//! 12-byte blocks. Two assembly modes exist:
//!
//! * **Type 1** (unconfirmed/confirmed/response): blocks append into a
//!   superframe buffer; the last four bytes carry a CRC32 computed
//!   over the payload with a 16-bit byte swap within each pair.
//! * **Type 2** (MBC and UDT): the header plus continuation blocks
//!   form one message; MBC marks its last block with a flag bit, while
//!   UDT with a reserved appended-block count terminates on the first
//!   CRC16 match, never exceeding four blocks.
//!
//! Completed PDUs dispatch by SAP: IPv4/UDP payloads route by
//! well-known port (LRRP location, ARS registration, TMS text), short
//! data applies a UTF-8 heuristic, and the rest surface as raw bytes.

use crate::bits::swap_u16_pairs;
use crate::crc::{crc16, crc32, crc9, CrcMask};
use crate::crypto::apply_keystream;
use crate::framesync::Protocol;
use crate::proto::lrrp;
use crate::proto::{DataPayload, RxEvent, SignalingEvent, Slot};

#[cfg(not(test))]
use log::{debug, trace};

#[cfg(test)]
use std::println as debug;

#[cfg(test)]
use std::println as trace;

/// Payload bytes per data block
pub const BLOCK_BYTES: usize = 12;

/// Maximum declared block count
pub const MAX_BLOCKS: u8 = 127;

/// UDT assembly hard limit when count-termination is unavailable
pub const UDT_MAX_APPENDED: usize = 4;

/// MBC assembly hard limit, blocks including the header
pub const MBC_MAX_BLOCKS: usize = 8;

/// Well-known UDP ports inside SAP-4 PDUs
pub mod ports {
    pub const LRRP: u16 = 4001;
    pub const ARS: u16 = 4005;
    pub const TMS: u16 = 4007;
    pub const ETSI_TMS: u16 = 5016;
    pub const LIP: u16 = 5017;
    pub const P25_LOCN: u16 = 49198;
}

/// Service names for SAP-4 ports without a dedicated decoder
static PORT_SERVICES: phf::Map<u16, &'static str> = phf::phf_map! {
    4005u16 => "ARS registration",
    5017u16 => "LIP location report",
    49198u16 => "P25 location",
};

/// Data packet format from the header DPF field
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum_macros::Display)]
pub enum DataFormat {
    Udt,
    Response,
    Unconfirmed,
    Confirmed,
    ShortDataDefined,
    ShortDataRaw,
    Proprietary,
    Reserved(u8),
}

impl DataFormat {
    pub fn from_dpf(dpf: u8) -> Self {
        match dpf & 0x0F {
            0 => DataFormat::Udt,
            1 => DataFormat::Response,
            2 => DataFormat::Unconfirmed,
            3 => DataFormat::Confirmed,
            13 => DataFormat::ShortDataDefined,
            14 => DataFormat::ShortDataRaw,
            15 => DataFormat::Proprietary,
            other => DataFormat::Reserved(other),
        }
    }
}

/// Parsed and CRC-verified data header
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DataHeader {
    pub format: DataFormat,
    pub group: bool,
    pub response_requested: bool,
    pub sap: u8,
    /// pad octets appended to fill the last block
    pub pad_octets: u8,
    pub dest: u32,
    pub source: u32,
    /// blocks to follow, 1..=127
    pub blocks: u8,
    pub fsn: u8,
    /// UDT format code (UDT headers only)
    pub udt_format: u8,
    /// UDT appended-block count; 3 is reserved
    pub uab: u8,
}

/// UDT format code for NMEA location
pub const UDT_FORMAT_NMEA: u8 = 0x05;

/// UAB value meaning "reserved": terminate by CRC instead of count
pub const UAB_RESERVED: u8 = 3;

impl DataHeader {
    /// Parse a 12-byte header; `None` on CRC failure
    pub fn parse(bytes: &[u8; 12]) -> Option<Self> {
        let crc = u16::from_be_bytes([bytes[10], bytes[11]]);
        if crc16(&bytes[..10], CrcMask::DataHeader) != crc {
            return None;
        }
        let format = DataFormat::from_dpf(bytes[0] & 0x0F);
        Some(Self {
            format,
            group: bytes[0] & 0x80 != 0,
            response_requested: bytes[0] & 0x40 != 0,
            sap: bytes[1] >> 4,
            pad_octets: bytes[1] & 0x0F,
            dest: u32::from_be_bytes([0, bytes[2], bytes[3], bytes[4]]),
            source: u32::from_be_bytes([0, bytes[5], bytes[6], bytes[7]]),
            blocks: (bytes[8] & 0x7F).max(1).min(MAX_BLOCKS),
            fsn: bytes[9] & 0x0F,
            udt_format: bytes[1] & 0x0F,
            uab: bytes[8] & 0x03,
        })
    }

    /// Type-2 assembly (header + continuation blocks as one message)
    pub fn is_type2(&self) -> bool {
        matches!(self.format, DataFormat::Udt)
    }
}

/// Verify the trailing CRC32 of an assembled type-1 PDU
///
/// The CRC covers every byte but the last four, taken in 16-bit
/// pair-swapped order; the tail is read in the same swapped order.
pub fn check_crc32(pdu: &[u8]) -> bool {
    if pdu.len() < 8 {
        return false;
    }
    let mut swapped = pdu.to_vec();
    swap_u16_pairs(&mut swapped);
    let n = swapped.len();
    let tail = u32::from_be_bytes([
        swapped[n - 4],
        swapped[n - 3],
        swapped[n - 2],
        swapped[n - 1],
    ]);
    crc32(&swapped[..n - 4]) == tail
}

/// Append a matching CRC32 tail to a payload (test fixtures and the
/// response path)
pub fn seal_crc32(payload: &mut Vec<u8>) {
    let mut swapped = payload.clone();
    // the CRC itself occupies one swapped pair, so pad alignment first
    debug_assert!(swapped.len() % 2 == 0);
    swap_u16_pairs(&mut swapped);
    let c = crc32(&swapped).to_be_bytes();
    // write the tail so the swapped read in check_crc32 recovers it
    payload.push(c[1]);
    payload.push(c[0]);
    payload.push(c[3]);
    payload.push(c[2]);
}

/// Assembly progress for one slot
#[derive(Clone, Debug, PartialEq, Eq)]
enum AssemblyState {
    Idle,
    Blocks,
    Complete { crc_ok: bool },
}

/// Multi-block data assembler for one slot
#[derive(Clone, Debug)]
pub struct DataAssembler {
    slot: Slot,
    state: AssemblyState,
    header: Option<DataHeader>,
    buf: Vec<u8>,
    block_counter: u8,
    /// confirmed-delivery DBSN tracking
    dbsn_have: Vec<u8>,
    /// strict mode aborts on any block CRC failure
    strict: bool,
    /// bytes to skip before keystream application
    ks_start: usize,
    /// derived keystream for an ENC data call
    data_ks: Option<Vec<u8>>,
    /// multi-block control accumulation (header + continuations)
    mbc: Option<Vec<u8>>,
}

impl DataAssembler {
    pub fn new(slot: Slot, strict: bool) -> Self {
        Self {
            slot,
            state: AssemblyState::Idle,
            header: None,
            buf: Vec::new(),
            block_counter: 0,
            dbsn_have: Vec::new(),
            strict,
            ks_start: 0,
            data_ks: None,
            mbc: None,
        }
    }

    /// Abandon any partial assembly
    pub fn reset(&mut self) {
        self.state = AssemblyState::Idle;
        self.header = None;
        self.buf.clear();
        self.block_counter = 0;
        self.dbsn_have.clear();
        self.ks_start = 0;
        self.data_ks = None;
        self.mbc = None;
    }

    /// Current header, when one is latched
    pub fn header(&self) -> Option<&DataHeader> {
        self.header.as_ref()
    }

    /// Offset where keystream application begins
    pub fn set_ks_start(&mut self, bytes: usize) {
        self.ks_start = bytes;
    }

    /// Install the derived keystream for an ENC data call
    ///
    /// On completion the assembled payload is XORed with this
    /// keystream from [`set_ks_start`](Self::set_ks_start), excluding
    /// the pad octets and the trailing CRC. Link-layer CRCs are
    /// verified on the ciphertext, before application.
    pub fn set_keystream(&mut self, ks: Vec<u8>) {
        self.data_ks = Some(ks);
    }

    /// Begin assembly from a verified header
    pub fn on_header(&mut self, header: DataHeader) {
        debug!(
            "dmr data: {} header, sap {}, {} blocks, dst {}",
            header.format, header.sap, header.blocks, header.dest
        );
        self.reset();
        self.header = Some(header);
        self.state = AssemblyState::Blocks;
    }

    /// Feed one 12-byte block; returns events when the PDU completes
    pub fn on_block(&mut self, block: &[u8; BLOCK_BYTES]) -> Vec<RxEvent> {
        if self.state != AssemblyState::Blocks {
            return Vec::new();
        }
        let Some(header) = self.header else {
            return Vec::new();
        };

        if header.is_type2() {
            return self.on_type2_block(&header, block);
        }

        if header.format == DataFormat::Confirmed {
            // DBSN(7) + CRC9 prefix, 10 payload bytes
            let dbsn = block[0] >> 1;
            let mut check = [0u8; 10];
            check.copy_from_slice(&block[2..12]);
            let want = (((block[0] & 1) as u16) << 8) | block[1] as u16;
            if crc9(&check, 80) != want {
                trace!("dmr data: block dbsn {} crc9 fail", dbsn);
                if self.strict {
                    self.reset();
                    return Vec::new();
                }
            }
            if self.dbsn_have.contains(&dbsn) {
                return Vec::new(); // retry of a block we already hold
            }
            self.dbsn_have.push(dbsn);
            self.buf.extend_from_slice(&block[2..12]);
        } else {
            self.buf.extend_from_slice(block);
        }

        self.block_counter += 1;
        if self.block_counter < header.blocks {
            return Vec::new();
        }

        // all declared blocks present
        let crc_ok = if header.format == DataFormat::Confirmed {
            // confirmed payload CRC9s already verified per block
            true
        } else {
            check_crc32(&self.buf)
        };
        self.complete(&header, crc_ok)
    }

    // UDT / MBC continuation handling.
    fn on_type2_block(&mut self, header: &DataHeader, block: &[u8; BLOCK_BYTES]) -> Vec<RxEvent> {
        self.buf.extend_from_slice(block);
        self.block_counter += 1;

        let count_terminated = header.uab != UAB_RESERVED
            && self.block_counter >= header.uab.max(1);

        // reserved UAB: probe the appended blocks for a CRC16 match
        let crc_terminated = header.uab == UAB_RESERVED && {
            let n = self.buf.len();
            let want = u16::from_be_bytes([self.buf[n - 2], self.buf[n - 1]]);
            crc16(&self.buf[..n - 2], CrcMask::Udt) == want
        };

        if crc_terminated || count_terminated {
            return self.complete(header, true);
        }
        if self.block_counter as usize >= UDT_MAX_APPENDED {
            debug!("dmr data: UDT exceeded {} blocks, abandoning", UDT_MAX_APPENDED);
            let events = self.complete(header, false);
            return events;
        }
        Vec::new()
    }

    fn complete(&mut self, header: &DataHeader, crc_ok: bool) -> Vec<RxEvent> {
        self.state = AssemblyState::Complete { crc_ok };
        let mut payload = std::mem::take(&mut self.buf);
        if let Some(ks) = self.data_ks.as_ref() {
            // pad octets and the CRC32 tail travel in the clear
            let tail = 4 + header.pad_octets as usize;
            apply_keystream(&mut payload, ks, self.ks_start, tail);
        }
        let mut events = dispatch(header, self.slot, payload, crc_ok);
        self.reset();
        events.drain(..).collect()
    }

    /// Begin multi-block control assembly from an MBC header block
    pub fn on_mbc_header(&mut self, block: &[u8; BLOCK_BYTES]) {
        self.mbc = Some(block.to_vec());
    }

    /// Feed an MBC continuation block
    ///
    /// The last continuation is flagged in its high bit and closes
    /// the assembly; its final two bytes carry the CRC16 over
    /// everything before them.
    pub fn on_mbc_continuation(&mut self, block: &[u8; BLOCK_BYTES]) -> Vec<RxEvent> {
        let Some(buf) = self.mbc.as_mut() else {
            trace!("dmr data: MBC continuation without header");
            return Vec::new();
        };
        let last = block[0] & 0x80 != 0;
        buf.extend_from_slice(block);
        if !last {
            if buf.len() >= MBC_MAX_BLOCKS * BLOCK_BYTES {
                debug!("dmr data: MBC exceeded {} blocks, abandoning", MBC_MAX_BLOCKS);
                self.mbc = None;
            }
            return Vec::new();
        }

        let buf = self.mbc.take().unwrap_or_default();
        let n = buf.len();
        let want = u16::from_be_bytes([buf[n - 2], buf[n - 1]]);
        let crc_ok = crc16(&buf[..n - 2], CrcMask::Mbc) == want;
        let opcode = buf[0] & 0x3F;
        vec![RxEvent::Signaling(SignalingEvent {
            protocol: Protocol::Dmr,
            slot: self.slot,
            opcode,
            talkgroup: 0,
            source: 0,
            description: format!(
                "multi-block control, opcode {:#04x}, {} bytes{}",
                opcode,
                n,
                if crc_ok { "" } else { " (crc fail)" },
            ),
        })]
    }
}

// Route a completed PDU by SAP.
fn dispatch(header: &DataHeader, slot: Slot, bytes: Vec<u8>, crc_ok: bool) -> Vec<RxEvent> {
    let mut events = Vec::new();
    let mut text = None;

    match header.sap {
        1 => {
            // proprietary data; MFID 0x10 carries MNIS-encapsulated
            // location and registration traffic
            if bytes.first() == Some(&0x10) {
                if let Some(fix) = lrrp::decode(&bytes, header.source) {
                    events.push(RxEvent::Location(fix));
                } else {
                    text = Some(format!("MNIS message ({} bytes)", bytes.len()));
                }
            }
        }
        4 => {
            // IPv4 + UDP
            if let Some((src_port, dst_port, payload)) = parse_ipv4_udp(&bytes) {
                match dst_port {
                    ports::LRRP => {
                        if let Some(fix) = lrrp::decode(payload, header.source) {
                            events.push(RxEvent::Location(fix));
                        }
                    }
                    ports::TMS | ports::ETSI_TMS => {
                        text = utf8_heuristic(payload);
                    }
                    other => match PORT_SERVICES.get(&other) {
                        Some(service) => {
                            text = Some(format!("{} ({} bytes)", service, payload.len()));
                        }
                        None => {
                            trace!("dmr data: UDP {} -> {} unhandled", src_port, other);
                        }
                    },
                }
            }
        }
        2 | 3 => {
            // compressed IP/UDP: 4-byte header, ports carried as IDs
            if let Some((dpid, payload)) = parse_compressed_udp(&bytes) {
                match dpid {
                    1 => text = utf8_heuristic(payload),
                    other => {
                        trace!("dmr data: compressed UDP dpid {} unhandled", other);
                    }
                }
            }
        }
        10 => {
            text = utf8_heuristic(&bytes);
        }
        _ => {}
    }

    events.push(RxEvent::Data(DataPayload {
        protocol: Protocol::Dmr,
        slot,
        sap: header.sap,
        source: header.source,
        dest: header.dest,
        bytes,
        crc_ok,
        text,
    }));
    events
}

/// Parse an IPv4 header followed by UDP; returns source port,
/// destination port, and the UDP payload
///
/// Requires version 4 and IHL >= 5; the usable length is clamped to
/// the lesser of the IP total length and the bytes available.
pub fn parse_ipv4_udp(bytes: &[u8]) -> Option<(u16, u16, &[u8])> {
    if bytes.len() < 20 {
        return None;
    }
    let version = bytes[0] >> 4;
    let ihl = (bytes[0] & 0x0F) as usize;
    if version != 4 || ihl < 5 {
        return None;
    }
    let header_len = ihl * 4;
    let total = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
    let avail = total.min(bytes.len());
    if avail < header_len + 8 {
        return None;
    }
    // protocol 17 = UDP
    if bytes[9] != 17 {
        return None;
    }
    let udp = &bytes[header_len..avail];
    let src_port = u16::from_be_bytes([udp[0], udp[1]]);
    let dst_port = u16::from_be_bytes([udp[2], udp[3]]);
    let udp_len = (u16::from_be_bytes([udp[4], udp[5]]) as usize).min(udp.len());
    if udp_len < 8 {
        return None;
    }
    Some((src_port, dst_port, &udp[8..udp_len]))
}

/// Parse a compressed IP/UDP header (SAP 2/3); returns the
/// destination port identifier and the payload
///
/// The 4-byte compressed header carries the IPv4 identification
/// field and 7-bit source/destination port identifiers in place of
/// full addresses and ports. Identifier 1 is the UTF-16/UTF-8 text
/// service.
pub fn parse_compressed_udp(bytes: &[u8]) -> Option<(u8, &[u8])> {
    if bytes.len() < 4 {
        return None;
    }
    let dpid = bytes[3] & 0x7F;
    Some((dpid, &bytes[4..]))
}

// Accept the bytes as text when they are valid UTF-8 and mostly
// printable.
fn utf8_heuristic(bytes: &[u8]) -> Option<String> {
    let s = std::str::from_utf8(bytes).ok()?;
    let printable = s
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\r')
        .count();
    if s.is_empty() || printable * 4 < s.chars().count() * 3 {
        return None;
    }
    Some(s.trim_end_matches('\0').to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_bytes(dpf: u8, sap: u8, blocks: u8, dest: u32, source: u32) -> [u8; 12] {
        let mut b = [0u8; 12];
        b[0] = 0x80 | (dpf & 0x0F);
        b[1] = sap << 4;
        b[2..5].copy_from_slice(&dest.to_be_bytes()[1..]);
        b[5..8].copy_from_slice(&source.to_be_bytes()[1..]);
        b[8] = blocks & 0x7F;
        let crc = crc16(&b[..10], CrcMask::DataHeader);
        b[10..12].copy_from_slice(&crc.to_be_bytes());
        b
    }

    #[test]
    fn test_header_parse_and_crc() {
        let raw = header_bytes(3, 4, 4, 1234, 5678);
        let h = DataHeader::parse(&raw).unwrap();
        assert_eq!(h.format, DataFormat::Confirmed);
        assert_eq!(h.sap, 4);
        assert_eq!(h.blocks, 4);
        assert_eq!(h.dest, 1234);
        assert_eq!(h.source, 5678);

        let mut bad = raw;
        bad[3] ^= 0xFF;
        assert!(DataHeader::parse(&bad).is_none());
    }

    #[test]
    fn test_crc32_seal_and_check() {
        let mut pdu = vec![0x11u8, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88];
        seal_crc32(&mut pdu);
        assert_eq!(pdu.len(), 12);
        assert!(check_crc32(&pdu));

        pdu[2] ^= 0x01;
        assert!(!check_crc32(&pdu));
    }

    #[test]
    fn test_unconfirmed_assembly_four_blocks() {
        // 4 blocks of 12: 44 payload bytes + CRC32 tail
        let mut payload: Vec<u8> = (0u8..44).collect();
        seal_crc32(&mut payload);
        assert_eq!(payload.len(), 48);

        let mut asm = DataAssembler::new(Slot::S0, false);
        let h = DataHeader::parse(&header_bytes(2, 0, 4, 10, 20)).unwrap();
        asm.on_header(h);

        let mut events = Vec::new();
        for blk in payload.chunks(BLOCK_BYTES) {
            let mut b = [0u8; BLOCK_BYTES];
            b.copy_from_slice(blk);
            events = asm.on_block(&b);
        }
        assert_eq!(events.len(), 1);
        let RxEvent::Data(d) = &events[0] else {
            panic!("expected data event");
        };
        assert!(d.crc_ok);
        assert_eq!(d.bytes.len(), 48);
    }

    #[test]
    fn test_confirmed_dbsn_dedup() {
        let mut asm = DataAssembler::new(Slot::S0, false);
        let h = DataHeader::parse(&header_bytes(3, 0, 2, 10, 20)).unwrap();
        asm.on_header(h);

        let mut blk = [0u8; BLOCK_BYTES];
        blk[0] = 1 << 1; // dbsn 1
        let payload = [0xAAu8; 10];
        blk[2..].copy_from_slice(&payload);
        let c = crc9(&payload, 80);
        blk[0] |= (c >> 8) as u8 & 1;
        blk[1] = c as u8;

        assert!(asm.on_block(&blk).is_empty());
        // same DBSN again: ignored, not double-counted
        assert!(asm.on_block(&blk).is_empty());
        assert_eq!(asm.block_counter, 1);
    }

    #[test]
    fn test_udt_crc16_termination() {
        // UAB reserved: assembly stops at the first CRC16 match
        let mut asm = DataAssembler::new(Slot::S0, false);
        let mut raw = header_bytes(0, 0, 0, 10, 20);
        raw[8] = UAB_RESERVED;
        let crc = crc16(&raw[..10], CrcMask::DataHeader);
        raw[10..12].copy_from_slice(&crc.to_be_bytes());
        let h = DataHeader::parse(&raw).unwrap();
        assert_eq!(h.uab, UAB_RESERVED);
        asm.on_header(h);

        // one appended block whose tail is a valid CRC16
        let mut blk = [0u8; BLOCK_BYTES];
        blk[..4].copy_from_slice(b"$GPx");
        let c = crc16(&blk[..10], CrcMask::Udt);
        blk[10..12].copy_from_slice(&c.to_be_bytes());

        let events = asm.on_block(&blk);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], RxEvent::Data(d) if d.crc_ok));
    }

    #[test]
    fn test_udt_caps_at_four_blocks() {
        let mut asm = DataAssembler::new(Slot::S0, false);
        let mut raw = header_bytes(0, 0, 0, 1, 2);
        raw[8] = UAB_RESERVED;
        let crc = crc16(&raw[..10], CrcMask::DataHeader);
        raw[10..12].copy_from_slice(&crc.to_be_bytes());
        asm.on_header(DataHeader::parse(&raw).unwrap());

        let junk = [0x5Au8; BLOCK_BYTES];
        let mut events = Vec::new();
        for _i in 0..UDT_MAX_APPENDED {
            events = asm.on_block(&junk);
        }
        // terminated (failed) at the cap, never beyond
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], RxEvent::Data(d) if !d.crc_ok));
    }

    #[test]
    fn test_ipv4_udp_parse() {
        // minimal IPv4 + UDP datagram carrying b"hello"
        let mut pkt = vec![
            0x45, 0x00, 0x00, 0x21, // v4, IHL 5, total 33
            0x00, 0x00, 0x00, 0x00, 0x40, 17, 0x00, 0x00, // TTL, UDP
            10, 0, 0, 1, 10, 0, 0, 2,
        ];
        pkt.extend_from_slice(&4001u16.to_be_bytes()); // src port
        pkt.extend_from_slice(&ports::TMS.to_be_bytes()); // dst port
        pkt.extend_from_slice(&13u16.to_be_bytes()); // UDP length
        pkt.extend_from_slice(&[0, 0]); // checksum
        pkt.extend_from_slice(b"hello");

        let (sp, dp, payload) = parse_ipv4_udp(&pkt).unwrap();
        assert_eq!(sp, 4001);
        assert_eq!(dp, ports::TMS);
        assert_eq!(payload, b"hello");

        // wrong version rejected
        let mut bad = pkt.clone();
        bad[0] = 0x65;
        assert!(parse_ipv4_udp(&bad).is_none());
    }

    #[test]
    fn test_compressed_udp_parse() {
        // id field, flags/spid, dpid 1 (text service)
        let pdu = [0x12, 0x34, 0x00, 0x01, b'h', b'i'];
        let (dpid, payload) = parse_compressed_udp(&pdu).unwrap();
        assert_eq!(dpid, 1);
        assert_eq!(payload, b"hi");

        assert!(parse_compressed_udp(&[0x00, 0x01]).is_none());
    }

    #[test]
    fn test_mbc_last_block_flag_terminates() {
        let mut asm = DataAssembler::new(Slot::S1, false);

        // continuation with no header latched is ignored
        let stray = [0x80u8; BLOCK_BYTES];
        assert!(asm.on_mbc_continuation(&stray).is_empty());

        let mut hdr = [0u8; BLOCK_BYTES];
        hdr[0] = 0x28; // opcode in the low six bits
        asm.on_mbc_header(&hdr);

        // a middle continuation (LB clear) emits nothing
        let mid = [0u8; BLOCK_BYTES];
        assert!(asm.on_mbc_continuation(&mid).is_empty());

        // last continuation: LB set, CRC16 over everything before the
        // final two bytes
        let mut last = [0u8; BLOCK_BYTES];
        last[0] = 0x80;
        let mut all = Vec::new();
        all.extend_from_slice(&hdr);
        all.extend_from_slice(&mid);
        all.extend_from_slice(&last);
        let c = crc16(&all[..all.len() - 2], CrcMask::Mbc);
        last[10..12].copy_from_slice(&c.to_be_bytes());

        let events = asm.on_mbc_continuation(&last);
        assert_eq!(events.len(), 1);
        let RxEvent::Signaling(s) = &events[0] else {
            panic!("expected signaling event");
        };
        assert_eq!(s.opcode, 0x28);
        assert_eq!(s.slot, Slot::S1);
        assert!(!s.description.contains("crc fail"));
    }

    #[test]
    fn test_keystream_applied_on_completion() {
        let plain = b"SECRET!!";
        let ks = [0x5Au8; 8];
        let mut cipher: Vec<u8> =
            plain.iter().zip(ks.iter()).map(|(p, k)| p ^ k).collect();
        // the link-layer CRC seals the ciphertext
        seal_crc32(&mut cipher);
        assert_eq!(cipher.len(), BLOCK_BYTES);

        let mut asm = DataAssembler::new(Slot::S0, false);
        let h = DataHeader::parse(&header_bytes(2, 0, 1, 10, 20)).unwrap();
        asm.on_header(h);
        asm.set_keystream(ks.to_vec());

        let mut blk = [0u8; BLOCK_BYTES];
        blk.copy_from_slice(&cipher);
        let events = asm.on_block(&blk);
        assert_eq!(events.len(), 1);
        let RxEvent::Data(d) = &events[0] else {
            panic!("expected data event");
        };
        assert!(d.crc_ok);
        assert_eq!(&d.bytes[..8], plain);
        // the CRC tail travels in the clear
        assert_eq!(&d.bytes[8..], &cipher[8..]);
    }

    #[test]
    fn test_mnis_location_routed() {
        // MFID 0x10 transport prefix, then an LRRP envelope
        let mut bytes = vec![0x10, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00];
        bytes.extend_from_slice(&[0x13, 0x00]);
        bytes.push(0x51);
        bytes.extend_from_slice(&0x2000_0000i32.to_be_bytes()); // 22.5 N
        bytes.extend_from_slice(&0x2000_0000i32.to_be_bytes()); // 45.0 E

        let h = DataHeader::parse(&header_bytes(2, 1, 1, 10, 77)).unwrap();
        let events = dispatch(&h, Slot::S0, bytes, true);
        assert!(events.iter().any(|ev| matches!(
            ev,
            RxEvent::Location(fix)
                if fix.source == 77 && (fix.lat - 22.5).abs() < 1e-6
        )));
    }

    #[test]
    fn test_utf8_heuristic() {
        assert_eq!(
            utf8_heuristic(b"dispatch msg\0\0"),
            Some("dispatch msg".to_owned())
        );
        assert_eq!(utf8_heuristic(&[0xFF, 0xFE, 0x01]), None);
        assert_eq!(utf8_heuristic(b""), None);
    }
}
