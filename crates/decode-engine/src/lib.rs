//! Decode Engine — a background media-decode engine.
//!
//! Opens a compressed audio/video container over an abstract seekable byte
//! source, demultiplexes it into elementary streams, decodes and resamples
//! audio to a fixed interleaved stereo/16-bit output format, and exposes a
//! pull-based interface so a playback frontend can read ready samples on
//! demand while decoding continues on a background thread.
//!
//! ## Pipeline
//! 1. **Demux**: container packets are routed to per-stream queues, buffering
//!    packets read "for the other stream" until that stream wants them.
//! 2. **Decode + resample**: audio packets become fixed-format PCM frames,
//!    windowed against the configured start offset and buffered up to a
//!    target duration.
//! 3. **Pull**: [`MediaSession::read_audio`] drains the frame queue into the
//!    caller's buffer; short reads signal underrun or end of stream.
//!
//! Video packets are decoded and timestamped, but frame delivery is left to
//! a surrounding system.

pub mod codec;
pub mod config;
pub mod demux;
pub mod session;
pub mod source;

mod pipeline;
mod queue;
mod resample;

pub use config::DecodeConfig;
pub use session::{MediaSession, SessionStatus};
pub use source::ByteSource;
