//! Container demultiplexing contracts and the Symphonia-backed reader.
//!
//! The decode thread only needs "give me the next packet" and "seek to a
//! point at or before T"; everything container-specific sits behind the
//! [`Demuxer`] trait, and [`MediaBackend`] abstracts how a demuxer is opened
//! over a byte source.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use symphonia::core::codecs::CodecParameters;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::{Time, TimeBase};

use crate::codec::{AudioDecoder, SymphoniaAudioDecoder, VideoDecoder};
use crate::source::{ByteSource, SourceAdapter};

/// Media type of an elementary stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamKind {
    Audio,
    Video,
    /// Anything the engine does not decode; packets for these are discarded.
    Other,
}

/// Descriptive entry for one elementary stream in the container.
#[derive(Clone, Debug)]
pub struct StreamInfo {
    /// Index into the container's stream table.
    pub index: usize,
    pub kind: StreamKind,
    /// Best-effort codec label, for logs and probing tools.
    pub codec: Option<String>,
    pub sample_rate: Option<u32>,
    pub channels: Option<usize>,
}

/// One compressed, timestamped unit of a single elementary stream.
#[derive(Clone, Debug)]
pub struct MediaPacket {
    /// Stream index this packet belongs to.
    pub stream: usize,
    /// Presentation time in seconds, when the container provides one.
    pub pts: Option<f64>,
    /// Duration in seconds, when known.
    pub duration: Option<f64>,
    pub data: Box<[u8]>,
}

/// Pull-based container reader.
///
/// `next_packet` returns `None` once the container is exhausted; that
/// sentinel is what the decode steps use to finish their streams. Decoders
/// are opened through the demuxer because their setup parameters live in the
/// container's stream table.
pub trait Demuxer: Send {
    fn streams(&self) -> &[StreamInfo];

    fn next_packet(&mut self) -> Result<Option<MediaPacket>>;

    /// Seek to the closest point at or before `seconds`.
    fn seek_to(&mut self, seconds: f64) -> Result<()>;

    /// Total duration in seconds, when the container reports one.
    fn duration_seconds(&self) -> Option<f64>;

    /// Open a decoder for an audio stream; `None` when no codec is usable.
    fn open_audio_decoder(&self, stream: usize) -> Option<Box<dyn AudioDecoder>>;

    /// Open a decoder for a video stream; `None` when no codec is usable.
    fn open_video_decoder(&self, stream: usize) -> Option<Box<dyn VideoDecoder>>;
}

/// Opens a [`Demuxer`] over a byte source.
pub trait MediaBackend: Send + Sync {
    fn open(&mut self, source: Box<dyn ByteSource>, name: &str) -> Result<Box<dyn Demuxer>>;
}

/// Production backend: probe and demux through Symphonia.
#[derive(Default)]
pub struct SymphoniaBackend;

impl MediaBackend for SymphoniaBackend {
    fn open(&mut self, source: Box<dyn ByteSource>, name: &str) -> Result<Box<dyn Demuxer>> {
        Ok(Box::new(SymphoniaDemuxer::open(source, name)?))
    }
}

/// Symphonia-backed demuxer over any [`ByteSource`].
pub struct SymphoniaDemuxer {
    format: Box<dyn FormatReader>,
    streams: Vec<StreamInfo>,
    /// Per-stream codec parameters, kept for decoder setup.
    params: Vec<CodecParameters>,
    /// Per-stream timestamp base for PTS conversion.
    time_bases: Vec<Option<TimeBase>>,
    /// Container track id -> stream index.
    track_index: HashMap<u32, usize>,
    duration: Option<f64>,
}

impl SymphoniaDemuxer {
    /// Probe the container and build the stream table.
    pub fn open(source: Box<dyn ByteSource>, name: &str) -> Result<Self> {
        let mss = MediaSourceStream::new(Box::new(SourceAdapter::new(source)), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = name_extension(name) {
            hint.with_extension(ext);
        }

        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .with_context(|| format!("probe container {name:?}"))?;

        let format = probed.format;

        let mut streams = Vec::new();
        let mut params = Vec::new();
        let mut time_bases = Vec::new();
        let mut track_index = HashMap::new();
        let mut duration = None;

        for (index, track) in format.tracks().iter().enumerate() {
            let info = stream_info(index, &track.codec_params);
            if duration.is_none() && info.kind == StreamKind::Audio {
                duration = params_duration_seconds(&track.codec_params);
            }
            track_index.insert(track.id, index);
            time_bases.push(track.codec_params.time_base);
            params.push(track.codec_params.clone());
            streams.push(info);
        }

        Ok(Self {
            format,
            streams,
            params,
            time_bases,
            track_index,
            duration,
        })
    }
}

impl Demuxer for SymphoniaDemuxer {
    fn streams(&self) -> &[StreamInfo] {
        &self.streams
    }

    fn next_packet(&mut self) -> Result<Option<MediaPacket>> {
        let packet = match self.format.next_packet() {
            Ok(p) => p,
            // Symphonia reports end of stream as an I/O error.
            Err(SymphoniaError::IoError(_)) => return Ok(None),
            Err(SymphoniaError::ResetRequired) => return Ok(None),
            Err(e) => return Err(e).context("read container packet"),
        };

        let Some(&stream) = self.track_index.get(&packet.track_id()) else {
            // Track appeared after probing; nothing routes to it.
            return Ok(Some(MediaPacket {
                stream: usize::MAX,
                pts: None,
                duration: None,
                data: packet.data,
            }));
        };

        // Best-effort timestamps: prefer the track time base, fall back to
        // interpreting raw timestamps as sample counts.
        let to_seconds = |units: u64| match self.time_bases[stream] {
            Some(tb) => Some(time_to_seconds(tb.calc_time(units))),
            None => self.streams[stream]
                .sample_rate
                .map(|rate| units as f64 / rate as f64),
        };
        let pts = to_seconds(packet.ts());
        let duration = to_seconds(packet.dur());

        Ok(Some(MediaPacket {
            stream,
            pts,
            duration,
            data: packet.data,
        }))
    }

    fn seek_to(&mut self, seconds: f64) -> Result<()> {
        let time = Time::new(seconds.max(0.0).trunc() as u64, seconds.max(0.0).fract());
        self.format
            .seek(
                SeekMode::Coarse,
                SeekTo::Time {
                    time,
                    track_id: None,
                },
            )
            .context("seek container")?;
        Ok(())
    }

    fn duration_seconds(&self) -> Option<f64> {
        self.duration
    }

    fn open_audio_decoder(&self, stream: usize) -> Option<Box<dyn AudioDecoder>> {
        let params = self.params.get(stream)?;
        let track_id = self
            .track_index
            .iter()
            .find_map(|(id, &index)| (index == stream).then_some(*id))?;

        match SymphoniaAudioDecoder::new(params, track_id) {
            Ok(decoder) => Some(Box::new(decoder)),
            Err(e) => {
                tracing::warn!(stream, "no usable audio codec: {e:#}");
                None
            }
        }
    }

    fn open_video_decoder(&self, stream: usize) -> Option<Box<dyn VideoDecoder>> {
        // Symphonia carries no video codecs; the stream is treated as
        // finished immediately by the decode step.
        tracing::debug!(stream, "no video decoder available");
        None
    }
}

/// Classify one track and capture its descriptive fields.
fn stream_info(index: usize, params: &CodecParameters) -> StreamInfo {
    let kind = if params.sample_rate.is_some() || params.channels.is_some() {
        StreamKind::Audio
    } else {
        StreamKind::Other
    };

    StreamInfo {
        index,
        kind,
        codec: codec_label(params),
        sample_rate: params.sample_rate,
        channels: params.channels.map(|c| c.count()),
    }
}

/// Best-effort codec label for logs and the probe command.
fn codec_label(params: &CodecParameters) -> Option<String> {
    use symphonia::core::codecs::*;
    let name = match params.codec {
        CODEC_TYPE_FLAC => "FLAC",
        CODEC_TYPE_MP3 => "MP3",
        CODEC_TYPE_AAC => "AAC",
        CODEC_TYPE_ALAC => "ALAC",
        CODEC_TYPE_VORBIS => "VORBIS",
        CODEC_TYPE_OPUS => "OPUS",
        CODEC_TYPE_PCM_S16LE | CODEC_TYPE_PCM_S16BE => "PCM_S16",
        CODEC_TYPE_PCM_S24LE | CODEC_TYPE_PCM_S24BE => "PCM_S24",
        CODEC_TYPE_PCM_S32LE | CODEC_TYPE_PCM_S32BE => "PCM_S32",
        CODEC_TYPE_PCM_F32LE | CODEC_TYPE_PCM_F32BE => "PCM_F32",
        _ => return None,
    };
    Some(name.to_string())
}

/// Best-effort total duration from codec metadata.
fn params_duration_seconds(params: &CodecParameters) -> Option<f64> {
    let frames = params.n_frames?;
    let rate = params.sample_rate?;
    if rate == 0 {
        return None;
    }
    Some(frames as f64 / rate as f64)
}

fn time_to_seconds(time: Time) -> f64 {
    time.seconds as f64 + time.frac
}

/// Extension portion of a stream name, used as a probe hint.
fn name_extension(name: &str) -> Option<&str> {
    Path::new(name).extension().and_then(|e| e.to_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use symphonia::core::codecs::{CODEC_TYPE_FLAC, CodecParameters};

    #[test]
    fn tracks_with_audio_params_classify_as_audio() {
        let mut params = CodecParameters::new();
        params.sample_rate = Some(48_000);
        let info = stream_info(0, &params);
        assert_eq!(info.kind, StreamKind::Audio);
        assert_eq!(info.sample_rate, Some(48_000));
    }

    #[test]
    fn tracks_without_audio_params_classify_as_other() {
        let params = CodecParameters::new();
        assert_eq!(stream_info(3, &params).kind, StreamKind::Other);
    }

    #[test]
    fn params_duration_handles_zero_rate() {
        let mut params = CodecParameters::new();
        params.sample_rate = Some(0);
        params.n_frames = Some(100);
        assert!(params_duration_seconds(&params).is_none());
    }

    #[test]
    fn params_duration_computes_seconds() {
        let mut params = CodecParameters::new();
        params.sample_rate = Some(48_000);
        params.n_frames = Some(96_000);
        assert_eq!(params_duration_seconds(&params), Some(2.0));
    }

    #[test]
    fn codec_label_maps_known_codecs() {
        let mut params = CodecParameters::new();
        params.codec = CODEC_TYPE_FLAC;
        assert_eq!(codec_label(&params), Some("FLAC".to_string()));
        assert!(codec_label(&CodecParameters::new()).is_none());
    }

    #[test]
    fn name_extension_ignores_missing_extensions() {
        assert_eq!(name_extension("track.flac"), Some("flac"));
        assert_eq!(name_extension("archive.track.flac"), Some("flac"));
        assert_eq!(name_extension("track"), None);
    }

    #[test]
    fn time_to_seconds_combines_parts() {
        let time = Time::new(2, 0.5);
        assert_eq!(time_to_seconds(time), 2.5);
    }
}
