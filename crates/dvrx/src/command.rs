//! Control-plane command queue
//!
//! The UI thread is the single producer and the decode thread the
//! single consumer of a bounded ring of tagged commands. Posting never
//! blocks: when the ring is full the oldest command is dropped, an
//! overflow counter increments, and one warning is logged per overflow
//! burst (the warning gate re-arms once the ring regains spare
//! capacity). The decode thread drains the ring between blocks and
//! applies commands in FIFO order.

use std::sync::{Arc, Mutex};

use arraydeque::{ArrayDeque, Wrapping};

#[cfg(not(test))]
use log::warn;

#[cfg(test)]
use std::println as warn;

use crate::groups::ListMode;

/// Ring capacity, commands
pub const COMMAND_CAPACITY: usize = 128;

/// A control command from the UI
///
/// Tags are stable across releases; payloads are small value types.
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    /// Set the squelch threshold (per-component mean power)
    SetSquelchLevel(f32),
    /// Set trunking hangtime, seconds
    SetHangtime(f32),
    /// Retune the sample source
    Tune(u32),
    /// Load key material for a key id
    LoadKey { key_id: u16, material: Vec<u8> },
    /// Forget all loaded keys
    ClearKeys,
    /// Add or update a talkgroup list entry
    SetGroup { tg: u32, mode: ListMode },
    /// Hold on one talkgroup (0 releases)
    TgHold(u32),
    /// Prefer a TDMA slot: 0, 1, or 2 for both
    SlotPreference(u8),
    /// Play encrypted audio even without a key
    UnmuteEncrypted(bool),
    /// Advance to the next control-channel candidate
    CycleCcCandidate,
    /// Release the voice channel and return to the control channel
    ForceRelease,
    /// Stop the receiver
    Exit,
}

struct RingInner {
    queue: ArrayDeque<Command, COMMAND_CAPACITY, Wrapping>,
    overflows: u64,
    warned: bool,
}

/// Producer handle; clone-free, owned by the UI side
pub struct CommandSender {
    inner: Arc<Mutex<RingInner>>,
}

impl CommandSender {
    /// Post a command without blocking
    ///
    /// Returns `false` when the ring was full and the oldest command
    /// was dropped to make room.
    pub fn post(&self, cmd: Command) -> bool {
        let mut inner = self.inner.lock().expect("command ring poisoned");
        let displaced = inner.queue.push_back(cmd);
        if displaced.is_some() {
            inner.overflows += 1;
            if !inner.warned {
                inner.warned = true;
                warn!(
                    "command ring full; dropping oldest (overflows: {})",
                    inner.overflows
                );
            }
            false
        } else {
            true
        }
    }
}

/// Consumer handle, owned by the decode thread
pub struct CommandRing {
    inner: Arc<Mutex<RingInner>>,
}

impl CommandRing {
    /// Create a ring, returning the producer and consumer halves
    pub fn new() -> (CommandSender, CommandRing) {
        let inner = Arc::new(Mutex::new(RingInner {
            queue: ArrayDeque::new(),
            overflows: 0,
            warned: false,
        }));
        (
            CommandSender {
                inner: inner.clone(),
            },
            CommandRing { inner },
        )
    }

    /// Drain all queued commands in FIFO order
    pub fn drain(&self) -> Vec<Command> {
        let mut inner = self.inner.lock().expect("command ring poisoned");
        let out: Vec<Command> = inner.queue.drain(..).collect();
        // spare capacity again: re-arm the overflow warning
        inner.warned = false;
        out
    }

    /// Total commands lost to overflow
    pub fn overflows(&self) -> u64 {
        self.inner.lock().expect("command ring poisoned").overflows
    }

    /// Commands currently queued
    pub fn len(&self) -> usize {
        self.inner.lock().expect("command ring poisoned").queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let (tx, rx) = CommandRing::new();
        assert!(tx.post(Command::SetHangtime(1.0)));
        assert!(tx.post(Command::TgHold(42)));
        assert!(tx.post(Command::Exit));
        assert_eq!(
            rx.drain(),
            vec![
                Command::SetHangtime(1.0),
                Command::TgHold(42),
                Command::Exit
            ]
        );
        assert!(rx.is_empty());
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let (tx, rx) = CommandRing::new();
        for tg in 0..COMMAND_CAPACITY as u32 {
            assert!(tx.post(Command::TgHold(tg)));
        }
        // the 129th post displaces command 0 and counts one overflow
        assert!(!tx.post(Command::TgHold(999)));
        assert_eq!(rx.overflows(), 1);
        assert_eq!(rx.len(), COMMAND_CAPACITY);

        let cmds = rx.drain();
        assert_eq!(cmds[0], Command::TgHold(1));
        assert_eq!(cmds[COMMAND_CAPACITY - 1], Command::TgHold(999));
    }

    #[test]
    fn test_warning_gate_rearms_after_drain() {
        let (tx, rx) = CommandRing::new();
        for _i in 0..COMMAND_CAPACITY + 5 {
            tx.post(Command::CycleCcCandidate);
        }
        assert_eq!(rx.overflows(), 5);
        rx.drain();
        // next overflow burst warns again, counted separately
        for _i in 0..COMMAND_CAPACITY + 2 {
            tx.post(Command::CycleCcCandidate);
        }
        assert_eq!(rx.overflows(), 7);
    }

    #[test]
    fn test_cross_thread_post() {
        let (tx, rx) = CommandRing::new();
        let th = std::thread::spawn(move || {
            for _i in 0..10 {
                tx.post(Command::ForceRelease);
            }
        });
        th.join().unwrap();
        assert_eq!(rx.drain().len(), 10);
    }
}
