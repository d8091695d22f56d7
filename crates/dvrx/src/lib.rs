//! # dvrx: multi-protocol digital voice receiver core
//!
//! This crate provides the signal-processing and protocol core of a
//! real-time digital voice/data radio decoder. It accepts blocks of
//! interleaved 16-bit I/Q samples from a software-defined radio
//! front-end and recovers voice codec frames and structured signaling
//! for the DMR, P25 (Phase 1 and Phase 2) and NXDN protocol families.
//!
//! ## Disclaimer
//!
//! This crate is dual-licensed MIT and Apache 2.0. Read these licenses
//! carefully as they may affect your rights.
//!
//! Decoding of encrypted traffic requires that you have the legal right
//! to hold the key material involved. This crate ships no cipher
//! implementations beyond trivial keystream expanders; see
//! [`KeystreamGenerator`](crate::crypto::KeystreamGenerator).
//!
//! ## Example
//!
//! ```
//! use dvrx::{ReceiverBuilder, RxEvent};
//!
//! # let some_iq_source_iterator = || std::iter::once(0i16);
//! #
//! // create a receiver with your input sampling rate
//! let mut rx = ReceiverBuilder::new(48000)
//!     .with_squelch_level(110.0)          // per-component mean power
//!     .with_ted_sps(10)                   // samples per symbol
//!     .with_hangtime(2.0)                 // seconds of sync loss tolerated
//!     .build()
//!     .expect("valid configuration");
//!
//! // let iqsrc be an iterator of interleaved i16 (I, Q) pairs
//! let iqsrc = some_iq_source_iterator();
//! for evt in rx.iter(iqsrc) {
//!     match evt {
//!         RxEvent::CallStart(info) => {
//!             println!("call start: TG {} SRC {}", info.talkgroup, info.source);
//!         }
//!         RxEvent::SyncLost => {}
//!         _ => {}
//!     }
//! }
//! ```
//!
//! The receiver is created via a [builder](crate::ReceiverBuilder) and
//! binds by iterator to any source of interleaved `i16` I/Q samples at
//! the configured rate. The iterator consumes as many samples as needed
//! to produce the next [`RxEvent`].
//!
//! ## Architecture
//!
//! The pull pipeline runs entirely on the caller's thread:
//!
//! ```txt
//! [i16 I/Q blocks]
//!       ↓
//! [Decimator + channel LPF]
//!       ↓
//! [DC block / IQ balance / AGC]
//!       ↓
//! [FLL carrier recovery]
//!       ↓
//! [RRC matched filter]           (CQPSK paths)
//!       ↓
//! [Gardner timing recovery]
//!       ↓
//! [FM / DQPSK discriminator]
//!       ↓
//! [Frame synchronizer]
//!       ↓
//! [Protocol state machines]  →  [Vocoder bridge]  →  [Audio mixer]
//!       ↓
//! [Trunking controller]  →  retunes the sample source
//! ```
//!
//! A single-producer single-consumer [command queue](crate::command)
//! carries control-plane messages from a UI thread into the core; it is
//! drained between blocks.
//!
//! ## Crate features
//!
//! * `chrono`: timestamp call events with true UTC timestamps. If
//!   enabled, `chrono` becomes part of this crate's public API.

pub mod agc;
pub mod bits;
mod builder;
pub mod command;
pub mod crc;
pub mod crypto;
pub mod dcblock;
pub mod decimate;
pub mod demod;
mod filter;
pub mod fll;
pub mod framesync;
pub mod groups;
pub mod iqbalance;
pub mod matched;
pub mod mixer;
pub mod proto;
mod receiver;
pub mod squelch;
pub mod symsync;
pub mod trunking;
pub mod vocoder;

pub use builder::{ConfigError, ReceiverBuilder, SlotPreference};
pub use command::{Command, CommandRing, CommandSender};
pub use crypto::{Algorithm, KeyStore, KeystreamGenerator};
pub use decimate::LpfProfile;
pub use demod::Discriminator;
pub use framesync::{Protocol, SyncType};
pub use groups::{ChannelMap, GroupList, ImportError, ListMode};
pub use mixer::OutputFormat;
pub use proto::{CallInfo, DataPayload, LocationFix, RxEvent, SignalingEvent, Slot};
pub use receiver::{Receiver, SourceIter};
pub use trunking::{TrunkState, TrunkingController, Tuner};
pub use vocoder::{CodecFrame, Vocoder};

/// Complex baseband sample type used throughout the DSP chain.
pub type IqSample = num_complex::Complex<f32>;

/// Phase values are expressed in Q14: π corresponds to `1 << 14`.
pub const Q14_PI: i32 = 1 << 14;
