//! Protocol state machines and the receiver event model
//!
//! Each supported air interface gets its own submodule housing the
//! burst/frame state machine; they all speak to the rest of the crate
//! through the types here. The state machines consume FEC-corrected
//! payload bytes plus error counts (the bit-level FEC lives with the
//! symbol layer) and emit [`RxEvent`]s.

pub mod dmr;
pub mod dmr_data;
pub mod lrrp;
pub mod nxdn;
pub mod p25;

use crate::crypto::Algorithm;
use crate::framesync::{Protocol, SyncType};

/// TDMA slot index
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum_macros::Display)]
pub enum Slot {
    #[strum(serialize = "0")]
    S0,
    #[strum(serialize = "1")]
    S1,
}

impl Slot {
    /// Array index for per-slot state
    pub fn index(&self) -> usize {
        match self {
            Slot::S0 => 0,
            Slot::S1 => 1,
        }
    }

    pub fn from_index(idx: usize) -> Self {
        if idx & 1 == 0 {
            Slot::S0
        } else {
            Slot::S1
        }
    }

    /// The opposite slot
    pub fn other(&self) -> Self {
        match self {
            Slot::S0 => Slot::S1,
            Slot::S1 => Slot::S0,
        }
    }
}

/// Active call description
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallInfo {
    pub protocol: Protocol,
    pub slot: Slot,
    pub talkgroup: u32,
    pub source: u32,
    /// group call (true) or individual (false)
    pub group: bool,
    pub encrypted: bool,
    pub alg: Algorithm,
    pub key_id: u16,
}

impl CallInfo {
    /// A cleartext group call skeleton
    pub fn clear(protocol: Protocol, slot: Slot, talkgroup: u32, source: u32) -> Self {
        Self {
            protocol,
            slot,
            talkgroup,
            source,
            group: true,
            encrypted: false,
            alg: Algorithm::Clear,
            key_id: 0,
        }
    }
}

impl std::fmt::Display for CallInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} slot {} {} TG {} SRC {}",
            self.protocol,
            self.slot,
            if self.group { "group" } else { "private" },
            self.talkgroup,
            self.source
        )?;
        if self.encrypted {
            write!(f, " [{} key {:#06x}]", self.alg, self.key_id)?;
        }
        Ok(())
    }
}

/// A completed data PDU
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataPayload {
    pub protocol: Protocol,
    pub slot: Slot,
    /// service access point the PDU was addressed to
    pub sap: u8,
    pub source: u32,
    pub dest: u32,
    pub bytes: Vec<u8>,
    pub crc_ok: bool,
    /// decoded text, when the SAP carries text
    pub text: Option<String>,
}

/// Summary of one control/signaling block (CSBK, TSBK, MAC, CAC)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignalingEvent {
    pub protocol: Protocol,
    pub slot: Slot,
    pub opcode: u8,
    pub talkgroup: u32,
    pub source: u32,
    pub description: String,
}

/// A decoded location fix (LRRP, LIP, NXDN location)
#[derive(Clone, Debug, PartialEq)]
pub struct LocationFix {
    pub source: u32,
    pub lat: f64,
    pub lon: f64,
    pub altitude_m: Option<f32>,
    pub speed_mph: Option<f32>,
    pub heading_deg: Option<u16>,
}

/// Events published by the receiver
#[derive(Clone, Debug, PartialEq)]
pub enum RxEvent {
    /// A sync word was matched
    SyncAcquired(SyncType),

    /// Sync lost beyond the hangtime
    SyncLost,

    /// A voice call opened on a slot
    CallStart(CallInfo),

    /// Call descriptor changed mid-call (late entry, ESS arrival)
    CallUpdate(CallInfo),

    /// The call's slot fell silent or terminated
    CallEnd(CallInfo),

    /// Mixed, sink-ready PCM
    Audio(Vec<i16>),

    /// A data PDU completed assembly
    Data(DataPayload),

    /// Control signaling worth surfacing
    Signaling(SignalingEvent),

    /// A location fix was decoded from a data PDU
    Location(LocationFix),

    /// Voice present but muted: encrypted with no usable key
    EncryptedCallMuted {
        slot: Slot,
        alg: Algorithm,
        key_id: u16,
    },
}
