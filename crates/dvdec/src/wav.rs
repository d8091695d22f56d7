//! Per-call WAV recording
//!
//! Each call is written to a temporary file while in progress. On
//! close the RIFF length fields are patched and the file is renamed
//! to its permanent name:
//!
//! ```txt
//! {date}_{time}_{rnd5}_{sys}_{gi}_TGT_{tgt}_SRC_{src}.wav
//! ```
//!
//! where `gi` is `G` for group calls and `I` for individual, and
//! `rnd5` is a five-character discriminator so two calls closing in
//! the same second cannot collide.

use std::fs::File;
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, WriteBytesExt};
use chrono::Utc;
use log::{debug, info};

use dvrx::CallInfo;

/// Output sampling rate, Hz
pub const WAV_RATE: u32 = 8000;

// RIFF byte offsets patched at close
const RIFF_SIZE_OFFSET: u64 = 4;
const DATA_SIZE_OFFSET: u64 = 40;

/// An open per-call WAV file
pub struct CallWav {
    file: File,
    tmp_path: PathBuf,
    dir: PathBuf,
    data_bytes: u32,
    channels: u16,
}

impl CallWav {
    /// Open a recording in `dir` for a call
    pub fn create(dir: &Path, channels: u16) -> io::Result<Self> {
        let tmp_path = dir.join(format!(".call-{}.wav.tmp", rnd5()));
        let mut file = File::create(&tmp_path)?;
        write_header(&mut file, channels, 0)?;
        debug!("recording to {}", tmp_path.display());
        Ok(Self {
            file,
            tmp_path,
            dir: dir.to_path_buf(),
            data_bytes: 0,
            channels,
        })
    }

    /// Append PCM samples
    pub fn write_samples(&mut self, pcm: &[i16]) -> io::Result<()> {
        for &sa in pcm {
            self.file.write_i16::<LittleEndian>(sa)?;
        }
        self.data_bytes += 2 * pcm.len() as u32;
        Ok(())
    }

    /// Duration recorded so far, seconds
    pub fn duration(&self) -> f32 {
        self.data_bytes as f32 / (2.0 * self.channels as f32 * WAV_RATE as f32)
    }

    /// Patch the header, close, and rename to the permanent name
    pub fn finish(mut self, call: &CallInfo, system: &str) -> io::Result<PathBuf> {
        self.file.seek(SeekFrom::Start(RIFF_SIZE_OFFSET))?;
        self.file
            .write_u32::<LittleEndian>(36 + self.data_bytes)?;
        self.file.seek(SeekFrom::Start(DATA_SIZE_OFFSET))?;
        self.file.write_u32::<LittleEndian>(self.data_bytes)?;
        self.file.flush()?;
        drop(self.file);

        let now = Utc::now();
        let gi = if call.group { "G" } else { "I" };
        let name = format!(
            "{}_{}_{}_{}_{}_TGT_{}_SRC_{}.wav",
            now.format("%Y%m%d"),
            now.format("%H%M%S"),
            rnd5(),
            system,
            gi,
            call.talkgroup,
            call.source,
        );
        let final_path = self.dir.join(name);
        std::fs::rename(&self.tmp_path, &final_path)?;
        info!("call recorded: {}", final_path.display());
        Ok(final_path)
    }

    /// Discard the recording (empty or unwanted call)
    pub fn abandon(self) {
        drop(self.file);
        let _ = std::fs::remove_file(&self.tmp_path);
    }
}

fn write_header(file: &mut File, channels: u16, data_bytes: u32) -> io::Result<()> {
    let byte_rate = WAV_RATE * channels as u32 * 2;
    file.write_all(b"RIFF")?;
    file.write_u32::<LittleEndian>(36 + data_bytes)?;
    file.write_all(b"WAVE")?;
    file.write_all(b"fmt ")?;
    file.write_u32::<LittleEndian>(16)?; // PCM fmt chunk
    file.write_u16::<LittleEndian>(1)?; // PCM16LE
    file.write_u16::<LittleEndian>(channels)?;
    file.write_u32::<LittleEndian>(WAV_RATE)?;
    file.write_u32::<LittleEndian>(byte_rate)?;
    file.write_u16::<LittleEndian>(channels * 2)?; // block align
    file.write_u16::<LittleEndian>(16)?; // bits per sample
    file.write_all(b"data")?;
    file.write_u32::<LittleEndian>(data_bytes)?;
    Ok(())
}

// Five base-36 characters derived from the monotonic clock.
fn rnd5() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let mut seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64 ^ (d.as_secs() << 20))
        .unwrap_or(0x5DEECE66D);
    let mut out = String::with_capacity(5);
    for _i in 0..5 {
        seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        let c = (seed >> 58) as u32 % 36;
        out.push(char::from_digit(c, 36).unwrap_or('0'));
    }
    out
}
