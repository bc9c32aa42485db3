//! decode-cli — probe a media container or extract its audio through the
//! pull-based decode engine.
//!
//! ## Commands
//! - `probe`: open a container and print its streams and duration.
//! - `extract`: decode a file's audio to a WAV, optionally windowed with
//!   `--start`/`--end`. The pull loop treats short reads as underrun and
//!   waits for the decode thread to catch up, the way a playback frontend
//!   would play silence.

mod cli;

use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use decode_engine::config::BYTES_PER_SAMPLE;
use decode_engine::demux::{Demuxer, SymphoniaDemuxer};
use decode_engine::{DecodeConfig, MediaSession};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let args = cli::Args::parse();

    let default_filter = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    match &args.cmd {
        cli::Command::Probe { path } => probe(path),
        cli::Command::Extract {
            path,
            output,
            start,
            end,
        } => extract(&args, path, output, *start, *end),
    }
}

/// Open the container directly and describe what the demuxer sees.
fn probe(path: &Path) -> Result<()> {
    let file = File::open(path).with_context(|| format!("open {path:?}"))?;
    let demuxer = SymphoniaDemuxer::open(Box::new(file), &path.to_string_lossy())?;

    for info in demuxer.streams() {
        println!(
            "stream {}: {:?} codec={} rate={} channels={}",
            info.index,
            info.kind,
            info.codec.as_deref().unwrap_or("unknown"),
            info.sample_rate
                .map_or_else(|| "-".to_string(), |r| r.to_string()),
            info.channels
                .map_or_else(|| "-".to_string(), |c| c.to_string()),
        );
    }

    match demuxer.duration_seconds() {
        Some(secs) => println!("duration: {secs:.3}s"),
        None => println!("duration: unknown"),
    }

    Ok(())
}

/// Decode `path`'s audio through the session pull interface into a WAV.
fn extract(args: &cli::Args, path: &Path, output: &Path, start: f64, end: f64) -> Result<()> {
    let config = DecodeConfig {
        sample_rate: args.rate,
        buffer_seconds: args.buffer_seconds,
    };

    let file = File::open(path).with_context(|| format!("open {path:?}"))?;
    let mut session = MediaSession::open(Box::new(file), &path.to_string_lossy(), config.clone());
    session.set_window(start, end);
    session.start();

    let stop = Arc::new(AtomicBool::new(false));
    let stop_for_signal = stop.clone();
    let _ = ctrlc::set_handler(move || {
        stop_for_signal.store(true, Ordering::Relaxed);
    });

    let spec = hound::WavSpec {
        channels: 2,
        sample_rate: config.sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer =
        hound::WavWriter::create(output, spec).with_context(|| format!("create {output:?}"))?;

    let mut buf = [0u8; 16_384];
    let mut total_bytes = 0u64;

    loop {
        if stop.load(Ordering::Relaxed) {
            tracing::info!("interrupted, stopping extraction");
            break;
        }

        let n = session.read_audio(&mut buf);
        if n == 0 {
            if session.status().audio_finished {
                break;
            }
            // Underrun: let the decode thread catch up.
            std::thread::sleep(Duration::from_millis(2));
            continue;
        }

        for sample in buf[..n].chunks_exact(2) {
            writer.write_sample(i16::from_le_bytes([sample[0], sample[1]]))?;
        }
        total_bytes += n as u64;
    }

    writer.finalize().context("finalize wav")?;
    session.close();

    let seconds = total_bytes as f64 / (config.sample_rate as f64 * BYTES_PER_SAMPLE as f64);
    tracing::info!(
        output = %output.display(),
        bytes = total_bytes,
        seconds = format!("{seconds:.3}"),
        "extraction finished"
    );

    Ok(())
}
