//! Output format and buffering configuration.
//!
//! Every component that needs the fixed output format receives it from here;
//! there is no process-global sample rate.

/// Output channel count. Delivered audio is always stereo.
pub const OUT_CHANNELS: usize = 2;

/// Bytes per channel of one output sample (signed 16-bit).
pub const BYTES_PER_CHANNEL: usize = 2;

/// Bytes per interleaved output sample across all channels.
pub const BYTES_PER_SAMPLE: usize = OUT_CHANNELS * BYTES_PER_CHANNEL;

/// Decode tuning parameters shared by the demux/decode/resample stages.
#[derive(Clone, Debug)]
pub struct DecodeConfig {
    /// Output sample rate in Hz. All delivered audio is resampled to this.
    pub sample_rate: u32,
    /// Buffered-audio duration the decode thread keeps ahead of reads.
    pub buffer_seconds: f32,
}

impl Default for DecodeConfig {
    /// Defaults tuned for pull-based playback across common sources.
    fn default() -> Self {
        Self {
            sample_rate: 44_100,
            buffer_seconds: 2.0,
        }
    }
}

impl DecodeConfig {
    /// Buffered-audio production target in output samples.
    ///
    /// If `buffer_seconds` is non-finite or `<= 0.0`, a safe fallback is used.
    pub(crate) fn target_samples(&self) -> u64 {
        let secs = if self.buffer_seconds.is_finite() && self.buffer_seconds > 0.0 {
            self.buffer_seconds
        } else {
            2.0
        };

        (self.sample_rate as f32 * secs).ceil() as u64
    }
}
