use std::fmt::Display;
use std::path::PathBuf;

use clap::{error::ErrorKind, value_parser, CommandFactory, Parser};

/// Standard input filename
const STDIN_FILE: &str = "-";

const USAGE_SHORT: &str = r#"
This program accepts raw I/Q samples in interleaved signed 16-bit (i16) format, at the given sampling --rate, and decodes DMR, P25 Phase 1/2, and NXDN voice and data traffic. Call and signaling events are printed as they occur.

See --help for more details.
"#;

const USAGE_LONG: &str = r#"
This program accepts raw I/Q samples in interleaved signed 16-bit (i16) format, at the given sampling --rate, and decodes DMR, P25 Phase 1/2, and NXDN voice and data traffic. Call and signaling events are printed as they occur.

You can pipe in baseband from rtl_sdr or similar:

    rtl_sdr -f 451.800M -s 960k - \
        | csdr convert_u8_f | csdr fir_decimate_cc 20 \
        | csdr convert_f_s16 \
        | dvdec -r 48000

Decoded 8 kHz PCM audio is written to standard output unless --wav-dir is given, in which case each call lands in its own WAV file named

    {date}_{time}_{rnd5}_{sys}_{gi}_TGT_{tgt}_SRC_{src}.wav

Encrypted calls are muted unless the matching key has been imported with --keys-csv. Decoding encrypted traffic requires that you have the legal right to hold the key material involved.
"#;

const ADVANCED: &str = "Advanced Demodulator Options";

/// Top-level program arguments
#[derive(Parser, Clone, Debug)]
#[command(version)]
#[command(about, long_about = None)]
#[command(after_help = USAGE_SHORT, after_long_help = USAGE_LONG)]
#[command(max_term_width = 100)]
pub struct Args {
    /// Verbosity level (-vvv for more)
    #[arg(short, long, default_value_t = 0, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Print NOTHING, not even call events
    #[arg(short, long)]
    pub quiet: bool,

    /// Sampling rate (Hz): 24000, 48000, or 96000
    #[arg(short, long, default_value_t = 48000)]
    pub rate: u32,

    /// Input file (or "-" for stdin)
    ///
    /// The input must be interleaved (I, Q) pairs, signed 16-bit
    /// native-endian at --rate.
    #[arg(long, default_value_t = STDIN_FILE.to_string())]
    pub file: String,

    /// Decode an MBE codec frame file instead of I/Q
    ///
    /// Accepts the binary ".imb"/".amb"/".dmb" record formats and
    /// the SDRTrunk JSON ".mbe" format. Records are printed; audio
    /// requires an external vocoder.
    #[arg(long)]
    pub mbe: Option<PathBuf>,

    /// Directory for per-call WAV files
    ///
    /// Without this option, decoded 8 kHz PCM goes to stdout.
    #[arg(long)]
    pub wav_dir: Option<PathBuf>,

    /// Import decryption keys from CSV (key_id,key)
    ///
    /// Keys are decimal, or hexadecimal with an 0x prefix.
    #[arg(long)]
    pub keys_csv: Option<PathBuf>,

    /// Import a talkgroup allow/block list from CSV (tg,mode[,name])
    #[arg(long)]
    pub groups_csv: Option<PathBuf>,

    /// Import a trunking channel map from CSV (channel,freq_hz)
    #[arg(long)]
    pub channels_csv: Option<PathBuf>,

    /// Demodulator: fm (C4FM/FSK paths) or dqpsk (CQPSK/LSM)
    #[arg(long, default_value = "fm")]
    pub demod: String,

    /// Squelch threshold (per-component mean power; 0 disables)
    #[arg(long, default_value_t = 0.0)]
    pub squelch: f32,

    /// Play encrypted audio even without a key
    #[arg(long)]
    pub unmute_encrypted: bool,

    /// Samples per symbol
    #[arg(long, default_value_t = 10)]
    #[arg(value_parser = value_parser!(u32).range(2..=20))]
    #[arg(hide_short_help = true)]
    #[arg(help_heading = ADVANCED)]
    pub ted_sps: u32,

    /// Timing loop proportional gain
    #[arg(long, default_value_t = 0.025)]
    #[arg(hide_short_help = true)]
    #[arg(help_heading = ADVANCED)]
    pub ted_gain_mu: f32,

    /// RRC matched filter excess bandwidth
    #[arg(long, default_value_t = 0.25)]
    #[arg(hide_short_help = true)]
    #[arg(help_heading = ADVANCED)]
    pub rrc_alpha: f32,

    /// Sync hangtime before the protocol layer resets (seconds)
    #[arg(long, default_value_t = 2.0)]
    #[arg(hide_short_help = true)]
    #[arg(help_heading = ADVANCED)]
    pub hangtime: f32,

    /// DC blocker pole shift (6..15)
    #[arg(long, default_value_t = 11)]
    #[arg(value_parser = value_parser!(u32).range(6..=15))]
    #[arg(hide_short_help = true)]
    #[arg(help_heading = ADVANCED)]
    pub dc_block_shift: u32,
}

impl Args {
    /// Return true if the user requests input from stdin
    pub fn input_is_stdin(&self) -> bool {
        self.file == STDIN_FILE
    }
}

/// A program-level error with exit code
#[derive(Debug)]
pub struct CliError {
    error: anyhow::Error,
    exit_code: i32,
}

impl CliError {
    /// Create new error with a custom exit code
    pub fn new(error: anyhow::Error, code: i32) -> CliError {
        CliError {
            error,
            exit_code: code,
        }
    }

    /// Print this error to the terminal
    ///
    /// Errors from clap are printed verbatim. Other types of errors
    /// are printed indirectly via clap's fancy formatter.
    pub fn print(&self) -> std::io::Result<()> {
        if let Some(e) = self.error.downcast_ref::<clap::Error>() {
            e.print()
        } else {
            Args::command()
                .error(ErrorKind::Format, self.to_string())
                .print()
        }
    }

    /// Print this error to the terminal and exit
    pub fn exit(&self) -> ! {
        drop(self.print());
        std::process::exit(self.exit_code);
    }
}

impl Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.error)
    }
}

impl std::error::Error for CliError {}

impl From<anyhow::Error> for CliError {
    fn from(err: anyhow::Error) -> CliError {
        CliError::new(err, 1)
    }
}

impl From<clap::Error> for CliError {
    fn from(err: clap::Error) -> CliError {
        let code = if err.use_stderr() { 1 } else { 0 };
        CliError::new(err.into(), code)
    }
}
