//! Decoder contracts and raw frame types.
//!
//! The decode steps only need "decode one compressed unit into zero-or-one
//! raw frame" with partial-consumption semantics: every call reports how many
//! packet bytes it consumed, and the caller advances its cursor and resubmits
//! the remainder until the packet is exhausted.

use anyhow::{Context, Result};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CodecParameters, DecoderOptions};
use symphonia::core::formats::Packet as SymphoniaPacket;

use crate::demux::MediaPacket;

/// One decoded unit of raw audio: interleaved `f32` at the source rate and
/// layout, before conversion to the output format.
#[derive(Clone, Debug)]
pub struct AudioFrame {
    /// Source sample rate in Hz.
    pub rate: u32,
    /// Source channel count.
    pub channels: usize,
    /// Best-effort presentation time of the first sample, in seconds.
    pub pts: Option<f64>,
    /// Interleaved samples, `frames() * channels` long.
    pub samples: Vec<f32>,
}

impl AudioFrame {
    /// Number of per-channel sample frames carried by this frame.
    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.samples.len() / self.channels
        }
    }
}

/// One decoded video image. Delivery to a render target is out of scope for
/// this engine; the decode step computes the timestamp and drops the frame.
#[derive(Clone, Debug)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    /// Best-effort presentation time in seconds.
    pub pts: Option<f64>,
    /// Raw pixel data in whatever layout the decoder produced.
    pub data: Vec<u8>,
}

/// Result of one decode call.
pub struct DecodeStep<F> {
    /// Packet bytes consumed by this call.
    pub consumed: usize,
    /// The frame produced, if any. `None` means the decoder wants more data.
    pub frame: Option<F>,
}

/// Decode compressed audio units with partial-consumption semantics.
pub trait AudioDecoder: Send {
    /// Decode from `packet` starting at byte `offset`.
    ///
    /// An error is fatal to the audio stream.
    fn decode(&mut self, packet: &MediaPacket, offset: usize) -> Result<DecodeStep<AudioFrame>>;

    /// End-of-stream flush: return buffered frames until `None`.
    fn drain(&mut self) -> Option<AudioFrame>;
}

/// Decode compressed video units with partial-consumption semantics.
pub trait VideoDecoder: Send {
    /// Decode from `packet` starting at byte `offset`.
    ///
    /// An error is fatal to the video stream only.
    fn decode(&mut self, packet: &MediaPacket, offset: usize) -> Result<DecodeStep<VideoFrame>>;

    /// End-of-stream flush: return buffered frames until `None`.
    fn drain(&mut self) -> Option<VideoFrame>;
}

/// Symphonia-backed audio decoder.
///
/// Symphonia consumes a whole packet per call, so `consumed` always covers
/// the remaining bytes; the partial-consumption loop in the decode step still
/// holds for backends that decode incrementally.
pub(crate) struct SymphoniaAudioDecoder {
    inner: Box<dyn symphonia::core::codecs::Decoder>,
    track_id: u32,
}

impl SymphoniaAudioDecoder {
    pub(crate) fn new(params: &CodecParameters, track_id: u32) -> Result<Self> {
        let inner = symphonia::default::get_codecs()
            .make(params, &DecoderOptions::default())
            .context("open audio decoder")?;
        Ok(Self { inner, track_id })
    }
}

impl AudioDecoder for SymphoniaAudioDecoder {
    fn decode(&mut self, packet: &MediaPacket, offset: usize) -> Result<DecodeStep<AudioFrame>> {
        let remaining = &packet.data[offset..];
        let sym_packet = SymphoniaPacket::new_from_slice(self.track_id, 0, 0, remaining);

        let decoded = self.inner.decode(&sym_packet).context("decode audio packet")?;
        let spec = *decoded.spec();
        let frames = decoded.frames();

        let frame = if frames == 0 {
            None
        } else {
            let mut sample_buf = SampleBuffer::<f32>::new(frames as u64, spec);
            sample_buf.copy_interleaved_ref(decoded);
            Some(AudioFrame {
                rate: spec.rate,
                channels: spec.channels.count(),
                pts: packet.pts,
                samples: sample_buf.samples().to_vec(),
            })
        };

        Ok(DecodeStep {
            consumed: remaining.len(),
            frame,
        })
    }

    fn drain(&mut self) -> Option<AudioFrame> {
        // Symphonia decoders hold no tail frames across packets.
        None
    }
}
