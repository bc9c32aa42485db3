use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "decode-cli", version)]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Command,

    /// Output sample rate in Hz for extracted audio
    #[arg(long, default_value_t = 44_100)]
    pub rate: u32,

    /// Buffered-audio target the decode thread keeps ahead, in seconds
    #[arg(long, default_value_t = 2.0)]
    pub buffer_seconds: f32,

    /// Verbose library logging
    #[arg(long)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print a container's streams and duration
    Probe {
        /// Path to a media file
        path: PathBuf,
    },

    /// Decode a file's audio into a WAV through the pull interface
    Extract {
        /// Path to a media file
        path: PathBuf,

        /// Output WAV path
        #[arg(long, default_value = "out.wav")]
        output: PathBuf,

        /// Start offset in seconds; content before it is skipped
        #[arg(long, default_value_t = 0.0)]
        start: f64,

        /// End bound in seconds; 0 plays to the natural end
        #[arg(long, default_value_t = 0.0)]
        end: f64,
    },
}
