//! Per-frame conversion to the fixed output format.
//!
//! Every frame handed to [`FrameConverter::convert`] comes out as interleaved
//! stereo signed 16-bit at the configured output rate, whatever the source
//! rate or layout. Sources already at the output rate bypass the resampler
//! entirely; a conversion failure only costs the one frame.

use anyhow::{Result, anyhow, bail};
use audioadapter_buffers::direct::InterleavedSlice;
use rubato::{
    Async, FixedAsync, Indexing, Resampler, SincInterpolationParameters, SincInterpolationType,
    WindowFunction, calculate_cutoff,
};

use crate::codec::AudioFrame;
use crate::config::{BYTES_PER_CHANNEL, BYTES_PER_SAMPLE, OUT_CHANNELS};

/// Resampler input chunk size in frames.
const CHUNK_FRAMES: usize = 1024;

/// A fully converted audio frame: interleaved stereo `i16` bytes at the
/// output rate, ready for the pull interface.
pub(crate) struct PcmFrame {
    pub(crate) data: Vec<u8>,
}

impl PcmFrame {
    /// Number of interleaved output samples carried by this frame.
    pub(crate) fn samples(&self) -> usize {
        self.data.len() / BYTES_PER_SAMPLE
    }

    #[cfg(test)]
    pub(crate) fn from_samples(samples: Vec<i16>) -> Self {
        let mut data = Vec::with_capacity(samples.len() * BYTES_PER_CHANNEL);
        for s in samples {
            data.extend_from_slice(&s.to_le_bytes());
        }
        Self { data }
    }
}

/// Converts raw decoded frames to the fixed output format.
///
/// The sinc resampler is stateful and rebuilt whenever the source rate
/// changes mid-stream.
pub(crate) struct FrameConverter {
    out_rate: u32,
    state: Option<ResamplerState>,
}

struct ResamplerState {
    src_rate: u32,
    inner: Box<dyn Resampler<f32>>,
    out_buf: Vec<f32>,
}

impl FrameConverter {
    pub(crate) fn new(out_rate: u32) -> Self {
        Self {
            out_rate,
            state: None,
        }
    }

    /// Convert one raw frame into output-format PCM.
    pub(crate) fn convert(&mut self, frame: &AudioFrame) -> Result<PcmFrame> {
        if frame.channels == 0 {
            bail!("audio frame without channels");
        }

        let stereo = map_to_stereo(&frame.samples, frame.channels);
        let converted = if frame.rate == self.out_rate {
            stereo
        } else {
            self.resample(&stereo, frame.rate)?
        };

        Ok(PcmFrame {
            data: to_i16_bytes(&converted),
        })
    }

    fn resample(&mut self, stereo: &[f32], src_rate: u32) -> Result<Vec<f32>> {
        if self.state.as_ref().map(|s| s.src_rate) != Some(src_rate) {
            self.state = Some(ResamplerState::new(src_rate, self.out_rate)?);
        }
        let Some(ResamplerState { inner, out_buf, .. }) = self.state.as_mut() else {
            bail!("resampler state missing");
        };

        let total_frames = stereo.len() / OUT_CHANNELS;
        let mut out = Vec::with_capacity(out_buf.len());
        let mut pos = 0;

        let mut indexing = Indexing {
            input_offset: 0,
            output_offset: 0,
            active_channels_mask: None,
            partial_len: None,
        };

        while pos < total_frames {
            let take = (total_frames - pos).min(CHUNK_FRAMES);
            let slice = &stereo[pos * OUT_CHANNELS..(pos + take) * OUT_CHANNELS];

            let input = InterleavedSlice::new(slice, OUT_CHANNELS, take)
                .map_err(|e| anyhow!("resampler input adapter: {e}"))?;

            let capacity_frames = out_buf.len() / OUT_CHANNELS;
            let mut output = InterleavedSlice::new_mut(out_buf, OUT_CHANNELS, capacity_frames)
                .map_err(|e| anyhow!("resampler output adapter: {e}"))?;

            indexing.input_offset = 0;
            indexing.output_offset = 0;
            indexing.partial_len = (take < CHUNK_FRAMES).then_some(take);

            let (_consumed, produced) = inner
                .process_into_buffer(&input, &mut output, Some(&indexing))
                .map_err(|e| anyhow!("resampler process: {e}"))?;

            out.extend_from_slice(&out_buf[..produced * OUT_CHANNELS]);
            pos += take;
        }

        Ok(out)
    }
}

impl ResamplerState {
    fn new(src_rate: u32, out_rate: u32) -> Result<Self> {
        let f_ratio = out_rate as f64 / src_rate as f64;

        let sinc_len = 128;
        let window = WindowFunction::BlackmanHarris2;
        let params = SincInterpolationParameters {
            sinc_len,
            f_cutoff: calculate_cutoff(sinc_len, window),
            interpolation: SincInterpolationType::Cubic,
            oversampling_factor: 256,
            window,
        };

        let inner: Box<dyn Resampler<f32>> = Box::new(
            Async::<f32>::new_sinc(
                f_ratio,
                1.1,
                &params,
                CHUNK_FRAMES,
                OUT_CHANNELS,
                FixedAsync::Input,
            )
            .map_err(|e| anyhow!("resampler init: {e}"))?,
        );

        // One chunk of output plus headroom for high upsampling ratios.
        let capacity_frames = (CHUNK_FRAMES as f64 * f_ratio).ceil() as usize + CHUNK_FRAMES;

        Ok(Self {
            src_rate,
            inner,
            out_buf: vec![0.0; capacity_frames * OUT_CHANNELS],
        })
    }
}

/// Map an interleaved source layout down (or up) to stereo.
///
/// Mono duplicates into both channels; wider layouts keep the front pair.
fn map_to_stereo(samples: &[f32], channels: usize) -> Vec<f32> {
    match channels {
        2 => samples.to_vec(),
        1 => samples.iter().flat_map(|&s| [s, s]).collect(),
        n => {
            let frames = samples.len() / n;
            let mut out = Vec::with_capacity(frames * OUT_CHANNELS);
            for f in 0..frames {
                out.push(samples[f * n]);
                out.push(samples[f * n + 1]);
            }
            out
        }
    }
}

/// Interleaved `f32` to little-endian signed 16-bit bytes.
fn to_i16_bytes(samples: &[f32]) -> Vec<u8> {
    let mut data = Vec::with_capacity(samples.len() * BYTES_PER_CHANNEL);
    for &s in samples {
        let v = (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
        data.extend_from_slice(&v.to_le_bytes());
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(rate: u32, channels: usize, samples: Vec<f32>) -> AudioFrame {
        AudioFrame {
            rate,
            channels,
            pts: Some(0.0),
            samples,
        }
    }

    #[test]
    fn stereo_at_output_rate_passes_through_exactly() {
        let mut conv = FrameConverter::new(44_100);
        let out = conv
            .convert(&frame(44_100, 2, vec![0.5, -0.5, 0.25, -0.25]))
            .unwrap();
        assert_eq!(out.samples(), 2);

        let first = i16::from_le_bytes([out.data[0], out.data[1]]);
        let second = i16::from_le_bytes([out.data[2], out.data[3]]);
        assert_eq!(first, (0.5 * i16::MAX as f32) as i16);
        assert_eq!(second, -(0.5 * i16::MAX as f32) as i16);
    }

    #[test]
    fn mono_duplicates_into_both_channels() {
        let mut conv = FrameConverter::new(44_100);
        let out = conv.convert(&frame(44_100, 1, vec![0.5, 0.25])).unwrap();
        assert_eq!(out.samples(), 2);

        let left = i16::from_le_bytes([out.data[0], out.data[1]]);
        let right = i16::from_le_bytes([out.data[2], out.data[3]]);
        assert_eq!(left, right);
    }

    #[test]
    fn wide_layouts_keep_the_front_pair() {
        let mut conv = FrameConverter::new(44_100);
        let out = conv
            .convert(&frame(44_100, 6, vec![0.5, -0.5, 0.9, 0.9, 0.9, 0.9]))
            .unwrap();
        assert_eq!(out.samples(), 1);

        let left = i16::from_le_bytes([out.data[0], out.data[1]]);
        let right = i16::from_le_bytes([out.data[2], out.data[3]]);
        assert_eq!(left, (0.5 * i16::MAX as f32) as i16);
        assert_eq!(right, -(0.5 * i16::MAX as f32) as i16);
    }

    #[test]
    fn over_full_scale_input_is_clamped() {
        let mut conv = FrameConverter::new(44_100);
        let out = conv.convert(&frame(44_100, 2, vec![2.0, -2.0])).unwrap();
        let left = i16::from_le_bytes([out.data[0], out.data[1]]);
        let right = i16::from_le_bytes([out.data[2], out.data[3]]);
        assert_eq!(left, i16::MAX);
        assert_eq!(right, -i16::MAX);
    }

    #[test]
    fn empty_layout_is_rejected() {
        let mut conv = FrameConverter::new(44_100);
        assert!(conv.convert(&frame(44_100, 0, vec![])).is_err());
    }

    #[test]
    fn resampling_roughly_doubles_sample_count() {
        let mut conv = FrameConverter::new(44_100);
        let out = conv
            .convert(&frame(22_050, 2, vec![0.1; 22_050 * 2]))
            .unwrap();
        // One second of input; the sinc filter delay keeps this a little
        // under a full second of output on the first frame.
        assert!(out.samples() > 40_000, "got {}", out.samples());
        assert!(out.samples() < 46_000, "got {}", out.samples());
    }
}
