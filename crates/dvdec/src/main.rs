use std::io;

use anyhow::{anyhow, Context};
use byteorder::{NativeEndian, ReadBytesExt};
use clap::Parser;
use log::{info, LevelFilter};

use dvrx::{ChannelMap, Discriminator, GroupList, ReceiverBuilder};

mod app;
mod cli;
mod mbe;
mod wav;

use cli::{Args, CliError};

fn main() {
    match dvdec() {
        Ok(()) => {}
        Err(cli_error) => cli_error.exit(),
    }
}

fn dvdec() -> Result<(), CliError> {
    // Parse options and start logging
    let args = Args::try_parse()?;
    log_setup(&args);

    // MBE file playback does not need the DSP pipeline
    if let Some(path) = args.mbe.clone() {
        return app::dump_mbe(&args, &path).map_err(CliError::from);
    }

    let discriminator = match args.demod.as_str() {
        "fm" => Discriminator::Fm,
        "dqpsk" => Discriminator::DifferentialQpsk,
        other => {
            return Err(
                anyhow!("unknown --demod \"{}\" (expected fm or dqpsk)", other).into(),
            )
        }
    };

    // create the decoder
    let mut rx = ReceiverBuilder::new(args.rate)
        .with_discriminator(discriminator)
        .with_squelch_level(args.squelch)
        .with_ted_sps(args.ted_sps)
        .with_ted_gain_mu(args.ted_gain_mu)
        .with_rrc_alpha(args.rrc_alpha)
        .with_hangtime(args.hangtime)
        .with_dc_block_shift(args.dc_block_shift)
        .with_unmute_encrypted(args.unmute_encrypted)
        .build()
        .map_err(|e| CliError::new(e.into(), 1))?;

    import_config(&args, &mut rx)?;

    // file setup: locks stdin in case we need it
    let stdin = io::stdin();
    let stdin_handle = stdin.lock();
    let mut inbuf = file_setup(&args, stdin_handle)?;

    // processing: read interleaved i16 I/Q from the input source
    app::run(
        &args,
        &mut rx,
        std::iter::from_fn(|| inbuf.read_i16::<NativeEndian>().ok()),
    );

    Ok(())
}

fn import_config(args: &Args, rx: &mut dvrx::Receiver) -> Result<(), CliError> {
    if let Some(path) = args.keys_csv.as_deref() {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("unable to read --keys-csv \"{}\"", path.display()))
            .map_err(CliError::from)?;
        let keys = dvrx::groups::import_keys_csv(&text)
            .map_err(|e| CliError::new(e.into(), 1))?;
        info!("loaded {} keys", keys.len());
        for (key_id, material) in keys {
            rx.keystore_mut().load_key(key_id, material);
        }
    }
    if let Some(path) = args.groups_csv.as_deref() {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("unable to read --groups-csv \"{}\"", path.display()))
            .map_err(CliError::from)?;
        let groups = GroupList::import_csv(&text).map_err(|e| CliError::new(e.into(), 1))?;
        info!("loaded {} group entries", groups.len());
        rx.set_group_list(groups);
    }
    if let Some(path) = args.channels_csv.as_deref() {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("unable to read --channels-csv \"{}\"", path.display()))
            .map_err(CliError::from)?;
        let channels =
            ChannelMap::import_csv(&text).map_err(|e| CliError::new(e.into(), 1))?;
        info!("loaded {} channels", channels.len());
        rx.set_channel_map(channels);
    }
    Ok(())
}

fn log_setup(args: &Args) {
    if args.quiet {
        // no logging
        return;
    } else if std::env::var_os("RUST_LOG").is_none() {
        // parameter controls
        let log_filter = match args.verbose {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Info,
            2 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        pretty_env_logger::formatted_builder()
            .filter_module("dvrx", log_filter)
            .filter_module("dvdec", log_filter)
            .init();
    } else {
        // environment controls
        pretty_env_logger::init();
    }
}

fn file_setup<'stdin>(
    args: &Args,
    stdin: std::io::StdinLock<'stdin>,
) -> Result<Box<dyn io::BufRead + 'stdin>, CliError> {
    if args.input_is_stdin() {
        info!("decoder reading standard input");
        if !is_terminal(&std::io::stdin()) {
            Ok(Box::new(io::BufReader::new(stdin)))
        } else {
            Err(anyhow!(
                "cowardly refusing to read I/Q samples from a terminal.

Pipe a source of raw uncompressed baseband from rtl_sdr, csdr,
or similar into this program."
            )
            .into())
        }
    } else {
        info!("decoder reading file: \"{}\"", &args.file);
        Ok(Box::new(io::BufReader::new(
            std::fs::File::open(&args.file)
                .with_context(|| format!("Unable to open --file \"{}\"", args.file))
                .map_err(CliError::from)?,
        )))
    }
}

#[cfg(not(target_os = "windows"))]
fn is_terminal<S>(stream: &S) -> bool
where
    S: std::os::fd::AsRawFd,
{
    terminal_size::terminal_size_using_fd(stream.as_raw_fd()).is_some()
}

#[cfg(target_os = "windows")]
fn is_terminal<S>(stream: &S) -> bool
where
    S: std::os::windows::io::AsRawHandle,
{
    terminal_size::terminal_size_using_handle(stream.as_raw_handle()).is_some()
}
