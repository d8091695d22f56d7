//! Event loop: drive the receiver and disposition its events
//!
//! ```txt
//!   start
//!   ||                                 ||== CallUpdate ==||
//!   \/                                 ||                ||
//! +-------------+                 +------------+         ||
//! |   Hunting   | == CallStart => |   InCall   | <=======||
//! +-------------+                 +------------+
//!   ||      /\                         ||
//!   ||      ||== CallEnd, SyncLost ====||
//!   ||
//!   \/
//!   EOF
//! ```
//!
//! While `InCall`, audio events append to the per-call WAV (or to
//! stdout when no `--wav-dir` was given). `CallEnd` closes and
//! renames the recording; calls that never produced audio are
//! discarded.

use std::io::Write;

use byteorder::{NativeEndian, WriteBytesExt};
use log::{debug, info, warn};

use dvrx::{CallInfo, Receiver, RxEvent};

use crate::cli::Args;
use crate::mbe;
use crate::wav::CallWav;

/// Run the decode loop until the input is exhausted
pub fn run<I>(args: &Args, rx: &mut Receiver, input: I)
where
    I: Iterator<Item = i16>,
{
    let mut wav: Option<CallWav> = None;
    let mut current_call: Option<CallInfo> = None;
    let stdout = std::io::stdout();
    let mut sink = stdout.lock();

    for event in rx.iter(input) {
        match event {
            RxEvent::SyncAcquired(sync) => {
                info!("sync: {}", sync);
            }
            RxEvent::SyncLost => {
                info!("sync lost");
                close_call(&mut wav, &mut current_call, args);
            }
            RxEvent::CallStart(call) | RxEvent::CallUpdate(call) => {
                if !args.quiet && current_call.as_ref() != Some(&call) {
                    println!("{}", call);
                }
                if wav.is_none() {
                    if let Some(dir) = args.wav_dir.as_deref() {
                        match CallWav::create(dir, 1) {
                            Ok(w) => wav = Some(w),
                            Err(e) => warn!("wav: {}", e),
                        }
                    }
                }
                current_call = Some(call);
            }
            RxEvent::CallEnd(call) => {
                if !args.quiet {
                    println!("{} slot {} call end TG {}", call.protocol, call.slot, call.talkgroup);
                }
                close_call(&mut wav, &mut current_call, args);
            }
            RxEvent::Audio(pcm) => {
                if let Some(w) = wav.as_mut() {
                    if let Err(e) = w.write_samples(&pcm) {
                        warn!("wav write: {}", e);
                    }
                } else {
                    for &sa in pcm.iter() {
                        if sink.write_i16::<NativeEndian>(sa).is_err() {
                            debug!("audio sink closed");
                            return;
                        }
                    }
                }
            }
            RxEvent::Data(pdu) => {
                if !args.quiet {
                    match &pdu.text {
                        Some(text) => println!(
                            "{} data SAP {} {} -> {}: {}",
                            pdu.protocol, pdu.sap, pdu.source, pdu.dest, text
                        ),
                        None => println!(
                            "{} data SAP {} {} -> {}: {} bytes (crc {})",
                            pdu.protocol,
                            pdu.sap,
                            pdu.source,
                            pdu.dest,
                            pdu.bytes.len(),
                            if pdu.crc_ok { "ok" } else { "BAD" },
                        ),
                    }
                }
            }
            RxEvent::Signaling(sig) => {
                debug!(
                    "{} signaling: {} (TG {} SRC {})",
                    sig.protocol, sig.description, sig.talkgroup, sig.source
                );
            }
            RxEvent::Location(fix) => {
                if !args.quiet {
                    println!(
                        "location {}: {:.5}, {:.5}{}",
                        fix.source,
                        fix.lat,
                        fix.lon,
                        fix.speed_mph
                            .map(|s| format!(" ({:.1} mph)", s))
                            .unwrap_or_default(),
                    );
                }
            }
            RxEvent::EncryptedCallMuted { slot, alg, key_id } => {
                if !args.quiet {
                    println!("slot {} encrypted ({} key {:#06x}); muted", slot, alg, key_id);
                }
            }
        }
    }

    close_call(&mut wav, &mut current_call, args);
}

// Finish or discard the in-progress recording.
fn close_call(wav: &mut Option<CallWav>, call: &mut Option<CallInfo>, _args: &Args) {
    let Some(w) = wav.take() else {
        *call = None;
        return;
    };
    match call.take() {
        Some(call) if w.duration() > 0.0 => {
            let system = call.protocol.to_string();
            if let Err(e) = w.finish(&call, &system) {
                warn!("wav close: {}", e);
            }
        }
        _ => w.abandon(),
    }
}

/// Print the contents of an MBE codec frame file
pub fn dump_mbe(args: &Args, path: &std::path::Path) -> anyhow::Result<()> {
    let head = std::fs::read(path)?;
    if head.first() == Some(&b'{') {
        // SDRTrunk JSON: one object per line
        let text = String::from_utf8_lossy(&head);
        let mut count = 0usize;
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            let rec = mbe::parse_json_record(line)?;
            let frame = rec.frame()?;
            count += 1;
            if !args.quiet {
                println!(
                    "{} {} TG {} SRC {}: {} bits{}",
                    rec.protocol,
                    rec.call_type,
                    rec.to,
                    rec.from,
                    frame.nbits(),
                    if rec.encrypted {
                        format!(" [{} key {}]", rec.algorithm, rec.key_id)
                    } else {
                        String::new()
                    },
                );
            }
        }
        info!("{}: {} JSON frames", path.display(), count);
    } else {
        let (kind, frames) = mbe::read_binary(path)?;
        if !args.quiet {
            for frame in frames.iter() {
                println!("{:?} frame, {} bits, errs2 {}", kind, frame.nbits(), frame.errors());
            }
        }
        info!("{}: {} frames", path.display(), frames.len());
    }
    Ok(())
}
