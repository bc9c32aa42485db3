//! The media session: open, window, start, pull, close.
//!
//! One [`MediaSession`] owns one open media stream. After `start` the decode
//! thread produces audio into a frame queue; any number of reader threads
//! drain it through [`MediaSession::read_audio`]. Every shared field sits
//! behind a single mutex, and one condition variable carries all three wake
//! reasons — "initialization finished", "reader wants more audio", and
//! "shutdown requested" — disambiguated by the flags re-checked after waking.

use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use crate::config::{BYTES_PER_SAMPLE, DecodeConfig};
use crate::demux::{MediaBackend, SymphoniaBackend};
use crate::pipeline::DecodePipeline;
use crate::queue::FrameQueue;
use crate::resample::PcmFrame;
use crate::source::ByteSource;

/// State shared between the decode thread and readers.
///
/// Guarded by the session's single lock. `ready` and `quit` are one-way
/// flags: once set they never revert.
pub(crate) struct SharedState {
    /// Initialization finished; readers may proceed.
    pub(crate) ready: bool,
    /// A reader consumed data and wants more decoded.
    pub(crate) needs_decode: bool,
    /// Shutdown requested.
    pub(crate) quit: bool,
    pub(crate) audio_finished: bool,
    pub(crate) video_finished: bool,
    /// Converted frames waiting for the pull interface.
    pub(crate) frames: FrameQueue,
    /// Samples currently buffered: queued frames plus the partial-frame
    /// remainder. Drives the production target; never goes negative.
    pub(crate) queued_samples: u64,
    /// Samples delivered through `read_audio` so far.
    pub(crate) read_samples: u64,
    /// Delivery budget in samples; 0 means play until the data runs out.
    pub(crate) duration_samples: u64,
    /// The frame currently being read from, and the byte offset into it.
    /// The offset is always a valid position inside the frame while one is
    /// present.
    pub(crate) out_frame: Option<PcmFrame>,
    pub(crate) out_index: usize,
}

impl SharedState {
    fn new() -> Self {
        Self {
            ready: false,
            needs_decode: false,
            quit: false,
            audio_finished: false,
            video_finished: false,
            frames: FrameQueue::default(),
            queued_samples: 0,
            read_samples: 0,
            duration_samples: 0,
            out_frame: None,
            out_index: 0,
        }
    }
}

/// The lock/condvar pair shared with the decode thread.
pub(crate) struct Shared {
    pub(crate) state: Mutex<SharedState>,
    pub(crate) cond: Condvar,
}

/// Best-effort snapshot of session progress.
#[derive(Clone, Copy, Debug, Default)]
pub struct SessionStatus {
    pub ready: bool,
    pub audio_finished: bool,
    pub video_finished: bool,
    /// Decoded samples currently buffered ahead of the reader.
    pub buffered_samples: u64,
    /// Whole frames waiting in the queue (excludes the partial frame).
    pub buffered_frames: usize,
    /// Samples delivered through `read_audio` so far.
    pub delivered_samples: u64,
}

/// Everything the decode thread needs to begin; taken at `start`.
struct Pending {
    backend: Box<dyn MediaBackend>,
    source: Box<dyn ByteSource>,
}

/// One open media stream.
///
/// Dropping the session triggers [`MediaSession::close`]; a session that was
/// never started tears down synchronously in the caller, while a started one
/// shuts down asynchronously on the decode thread.
pub struct MediaSession {
    shared: Arc<Shared>,
    config: DecodeConfig,
    name: String,
    /// Seconds of content to skip at the start of the stream.
    skip: f64,
    started: bool,
    pending: Option<Pending>,
}

impl MediaSession {
    /// Open a media stream over `source`, probing with `name`'s extension.
    ///
    /// No I/O happens here; the container is opened by the decode thread
    /// after [`MediaSession::start`]. Open/probe failures surface as a ready
    /// session whose streams are already finished, so readers never hang.
    pub fn open(source: Box<dyn ByteSource>, name: &str, config: DecodeConfig) -> Self {
        Self::open_with_backend(Box::new(SymphoniaBackend), source, name, config)
    }

    /// Open with a caller-supplied demux/decode backend.
    pub fn open_with_backend(
        backend: Box<dyn MediaBackend>,
        source: Box<dyn ByteSource>,
        name: &str,
        config: DecodeConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(SharedState::new()),
                cond: Condvar::new(),
            }),
            config,
            name: name.to_string(),
            skip: 0.0,
            started: false,
            pending: Some(Pending { backend, source }),
        }
    }

    /// Set the playback window. Must be called before `start`.
    ///
    /// `start` is the stream time at which delivery begins; content before it
    /// is decoded and discarded. A non-zero `end` bounds delivery to
    /// `end - start` seconds; 0 plays to the natural end.
    pub fn set_window(&mut self, start: f64, end: f64) {
        if self.started {
            tracing::warn!(name = %self.name, "set_window ignored after start");
            return;
        }

        self.skip = start;
        if end != 0.0 {
            let samples = ((end - start) * self.config.sample_rate as f64).max(0.0) as u64;
            self.shared.state.lock().unwrap().duration_samples = samples;
        }
    }

    /// Spawn the decode thread and hand it the container.
    pub fn start(&mut self) {
        let Some(pending) = self.pending.take() else {
            tracing::debug!(name = %self.name, "session already started");
            return;
        };

        let pipeline = DecodePipeline::new(
            self.shared.clone(),
            pending.backend,
            pending.source,
            self.name.clone(),
            self.config.clone(),
            self.skip,
        );

        let builder = thread::Builder::new().name(format!("decode: {}", self.name));
        match builder.spawn(move || pipeline.run()) {
            // The handle is dropped: the thread runs detached and owns the
            // decode resources until it exits.
            Ok(_) => self.started = true,
            Err(e) => {
                tracing::error!(name = %self.name, "decode thread spawn failed: {e}");
                let mut st = self.shared.state.lock().unwrap();
                st.ready = true;
                st.audio_finished = true;
                st.video_finished = true;
                drop(st);
                self.shared.cond.notify_all();
            }
        }
    }

    /// Drain buffered audio into `out`, returning the bytes written.
    ///
    /// Safe to call from a real-time audio callback once the session is
    /// started: the only wait is for initial readiness. A short (possibly
    /// zero) count signals underrun or end of stream — treat it as silence
    /// or stop, never as an error.
    pub fn read_audio(&self, out: &mut [u8]) -> usize {
        let shared = &self.shared;
        let mut st = shared.state.lock().unwrap();

        while !st.ready {
            st = shared.cond.wait(st).unwrap();
        }

        let mut len = out.len();

        if st.duration_samples > 0 {
            let remaining = st.duration_samples.saturating_sub(st.read_samples);
            if remaining == 0 {
                st.audio_finished = true;
            }
            len = len.min((remaining as usize).saturating_mul(BYTES_PER_SAMPLE));
        }

        let mut written = 0;

        while len > 0 {
            if st.out_frame.is_none() {
                st.out_frame = st.frames.pop();
                st.out_index = 0;
            }

            let (count, frame_done) = match st.out_frame.as_ref() {
                // Underrun: return what we have.
                None => break,
                Some(frame) => {
                    let avail = frame.data.len() - st.out_index;
                    if avail == 0 {
                        (0, true)
                    } else {
                        let count = len.min(avail);
                        out[written..written + count]
                            .copy_from_slice(&frame.data[st.out_index..st.out_index + count]);
                        (count, count == avail)
                    }
                }
            };

            st.out_index += count;
            st.read_samples += (count / BYTES_PER_SAMPLE) as u64;
            st.queued_samples = st
                .queued_samples
                .saturating_sub((count / BYTES_PER_SAMPLE) as u64);
            written += count;
            len -= count;

            if frame_done {
                st.out_frame = None;
                st.out_index = 0;
            }
        }

        // Only wake the decode thread if we consumed something.
        if written > 0 {
            st.needs_decode = true;
            shared.cond.notify_all();
        }

        written
    }

    /// Snapshot session progress for status displays and tooling.
    pub fn status(&self) -> SessionStatus {
        let st = self.shared.state.lock().unwrap();
        SessionStatus {
            ready: st.ready,
            audio_finished: st.audio_finished,
            video_finished: st.video_finished,
            buffered_samples: st.queued_samples,
            buffered_frames: st.frames.len(),
            delivered_samples: st.read_samples,
        }
    }

    /// Request shutdown. Idempotent.
    ///
    /// A started session is torn down asynchronously by the decode thread;
    /// an unstarted one releases its resources here.
    pub fn close(&mut self) {
        if !self.started {
            self.pending = None;
            return;
        }

        let mut st = self.shared.state.lock().unwrap();
        st.quit = true;
        drop(st);
        self.shared.cond.notify_all();
    }
}

impl Drop for MediaSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use anyhow::{Result, anyhow};

    use crate::codec::{AudioDecoder, AudioFrame, DecodeStep, VideoDecoder, VideoFrame};
    use crate::demux::{Demuxer, MediaBackend, MediaPacket, StreamInfo, StreamKind};

    /// Shape of the synthetic container produced by [`ToneBackend`].
    #[derive(Clone)]
    struct ToneSpec {
        rate: u32,
        frame_samples: usize,
        packets: usize,
        audio: bool,
        video_packets: usize,
        video_decoder: bool,
        video_fail_after: Option<usize>,
        duration: Option<f64>,
        video_frames: Arc<AtomicUsize>,
    }

    impl ToneSpec {
        fn audio_only(packets: usize, frame_samples: usize) -> Self {
            Self {
                rate: 44_100,
                frame_samples,
                packets,
                audio: true,
                video_packets: 0,
                video_decoder: false,
                video_fail_after: None,
                duration: None,
                video_frames: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    struct ToneBackend {
        spec: ToneSpec,
    }

    impl MediaBackend for ToneBackend {
        fn open(&mut self, _source: Box<dyn ByteSource>, _name: &str) -> Result<Box<dyn Demuxer>> {
            Ok(Box::new(ToneDemuxer::new(self.spec.clone())))
        }
    }

    struct FailingBackend;

    impl MediaBackend for FailingBackend {
        fn open(&mut self, _source: Box<dyn ByteSource>, _name: &str) -> Result<Box<dyn Demuxer>> {
            Err(anyhow!("synthetic probe failure"))
        }
    }

    /// Deterministic demuxer: `packets` audio packets of `frame_samples`
    /// stereo samples each, optionally interleaved with video packets.
    struct ToneDemuxer {
        spec: ToneSpec,
        streams: Vec<StreamInfo>,
        audio_produced: usize,
        video_produced: usize,
    }

    impl ToneDemuxer {
        fn new(spec: ToneSpec) -> Self {
            let mut streams = Vec::new();
            if spec.audio {
                streams.push(StreamInfo {
                    index: 0,
                    kind: StreamKind::Audio,
                    codec: Some("TONE".to_string()),
                    sample_rate: Some(spec.rate),
                    channels: Some(2),
                });
            }
            if spec.video_packets > 0 {
                streams.push(StreamInfo {
                    index: 1,
                    kind: StreamKind::Video,
                    codec: Some("TESTVID".to_string()),
                    sample_rate: None,
                    channels: None,
                });
            }
            Self {
                spec,
                streams,
                audio_produced: 0,
                video_produced: 0,
            }
        }
    }

    impl Demuxer for ToneDemuxer {
        fn streams(&self) -> &[StreamInfo] {
            &self.streams
        }

        fn next_packet(&mut self) -> Result<Option<MediaPacket>> {
            let audio_left = self.spec.audio && self.audio_produced < self.spec.packets;
            let video_left = self.video_produced < self.spec.video_packets;

            // Round-robin interleave, audio first.
            if audio_left && (!video_left || self.audio_produced <= self.video_produced) {
                let seconds_per_packet = self.spec.frame_samples as f64 / self.spec.rate as f64;
                let pts = self.audio_produced as f64 * seconds_per_packet;
                self.audio_produced += 1;
                return Ok(Some(MediaPacket {
                    stream: 0,
                    pts: Some(pts),
                    duration: Some(seconds_per_packet),
                    data: vec![0u8; self.spec.frame_samples].into_boxed_slice(),
                }));
            }

            if video_left {
                let pts = self.video_produced as f64 / 30.0;
                self.video_produced += 1;
                return Ok(Some(MediaPacket {
                    stream: 1,
                    pts: Some(pts),
                    duration: None,
                    data: vec![0u8; 16].into_boxed_slice(),
                }));
            }

            Ok(None)
        }

        fn seek_to(&mut self, _seconds: f64) -> Result<()> {
            // The decode steps do the trimming; packets always start at 0.
            Ok(())
        }

        fn duration_seconds(&self) -> Option<f64> {
            self.spec.duration
        }

        fn open_audio_decoder(&self, stream: usize) -> Option<Box<dyn AudioDecoder>> {
            (self.spec.audio && stream == 0).then(|| {
                Box::new(ToneAudioDecoder {
                    rate: self.spec.rate,
                }) as Box<dyn AudioDecoder>
            })
        }

        fn open_video_decoder(&self, stream: usize) -> Option<Box<dyn VideoDecoder>> {
            (self.spec.video_decoder && stream == 1).then(|| {
                Box::new(CountingVideoDecoder {
                    decoded: self.spec.video_frames.clone(),
                    fail_after: self.spec.video_fail_after,
                }) as Box<dyn VideoDecoder>
            })
        }
    }

    /// One stereo sample per payload byte, at a constant amplitude.
    struct ToneAudioDecoder {
        rate: u32,
    }

    impl AudioDecoder for ToneAudioDecoder {
        fn decode(&mut self, packet: &MediaPacket, offset: usize) -> Result<DecodeStep<AudioFrame>> {
            let consumed = packet.data.len() - offset;
            Ok(DecodeStep {
                consumed,
                frame: Some(AudioFrame {
                    rate: self.rate,
                    channels: 2,
                    pts: packet.pts,
                    samples: vec![0.25; consumed * 2],
                }),
            })
        }

        fn drain(&mut self) -> Option<AudioFrame> {
            None
        }
    }

    struct CountingVideoDecoder {
        decoded: Arc<AtomicUsize>,
        fail_after: Option<usize>,
    }

    impl VideoDecoder for CountingVideoDecoder {
        fn decode(&mut self, packet: &MediaPacket, offset: usize) -> Result<DecodeStep<VideoFrame>> {
            if let Some(limit) = self.fail_after {
                if self.decoded.load(Ordering::Relaxed) >= limit {
                    return Err(anyhow!("synthetic video decode failure"));
                }
            }
            self.decoded.fetch_add(1, Ordering::Relaxed);
            Ok(DecodeStep {
                consumed: packet.data.len() - offset,
                frame: Some(VideoFrame {
                    width: 16,
                    height: 16,
                    pts: packet.pts,
                    data: Vec::new(),
                }),
            })
        }

        fn drain(&mut self) -> Option<VideoFrame> {
            None
        }
    }

    fn tone_session(spec: ToneSpec) -> MediaSession {
        MediaSession::open_with_backend(
            Box::new(ToneBackend { spec }),
            Box::new(Cursor::new(Vec::new())),
            "tone.test",
            DecodeConfig::default(),
        )
    }

    /// Pull until the audio stream genuinely ends, tolerating underruns.
    fn pull_all(session: &MediaSession) -> Vec<u8> {
        let mut buf = [0u8; 4_096];
        let mut out = Vec::new();
        let mut waits = 0;

        loop {
            let n = session.read_audio(&mut buf);
            out.extend_from_slice(&buf[..n]);

            if n == 0 {
                if session.status().audio_finished {
                    break;
                }
                waits += 1;
                assert!(waits < 10_000, "decode thread made no progress");
                std::thread::sleep(Duration::from_millis(1));
            }
        }

        out
    }

    fn wait_for_video_finished(session: &MediaSession) {
        for _ in 0..10_000 {
            if session.status().video_finished {
                return;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        panic!("video stream never finished");
    }

    #[test]
    fn full_stream_delivers_every_sample_then_zero() {
        // 5 seconds at 44.1 kHz, in 0.25 s packets (exact in f64, so the
        // windowing tests below trim deterministically).
        let mut session = tone_session(ToneSpec::audio_only(20, 11_025));
        session.start();

        let out = pull_all(&session);
        assert_eq!(out.len(), 5 * 44_100 * BYTES_PER_SAMPLE);

        let mut buf = [0u8; 64];
        assert_eq!(session.read_audio(&mut buf), 0);
    }

    #[test]
    fn start_window_skips_leading_audio() {
        let mut session = tone_session(ToneSpec::audio_only(20, 11_025));
        session.set_window(2.0, 0.0);
        session.start();

        let out = pull_all(&session);
        assert_eq!(out.len(), 3 * 44_100 * BYTES_PER_SAMPLE);
    }

    #[test]
    fn straddling_frame_is_trimmed_at_the_sample_boundary() {
        let mut session = tone_session(ToneSpec::audio_only(20, 11_025));
        // 2.125 s falls mid-packet: the packet covering [2.0, 2.25) loses
        // its first floor(0.125 * 44100) = 5512 samples.
        session.set_window(2.125, 0.0);
        session.start();

        let out = pull_all(&session);
        let expected_samples = 3 * 44_100 - 5_512;
        assert_eq!(out.len(), expected_samples * BYTES_PER_SAMPLE);
    }

    #[test]
    fn end_window_bounds_delivery() {
        let mut session = tone_session(ToneSpec::audio_only(20, 11_025));
        session.set_window(1.0, 3.0);
        session.start();

        let out = pull_all(&session);
        assert_eq!(out.len(), 2 * 44_100 * BYTES_PER_SAMPLE);
        assert!(session.status().audio_finished);
    }

    #[test]
    fn container_duration_bounds_delivery_when_no_window_is_set() {
        let mut spec = ToneSpec::audio_only(20, 11_025);
        // Container claims 2 s even though 5 s of packets exist.
        spec.duration = Some(2.0);
        let mut session = tone_session(spec);
        session.start();

        let out = pull_all(&session);
        assert_eq!(out.len(), 2 * 44_100 * BYTES_PER_SAMPLE);
    }

    #[test]
    fn missing_audio_stream_reads_zero_after_ready() {
        let mut spec = ToneSpec::audio_only(0, 0);
        spec.audio = false;
        let mut session = tone_session(spec);
        session.start();

        let mut buf = [0u8; 256];
        assert_eq!(session.read_audio(&mut buf), 0);
        let status = session.status();
        assert!(status.ready);
        assert!(status.audio_finished);
        assert!(status.video_finished);
    }

    #[test]
    fn failed_initialization_still_becomes_ready() {
        let mut session = MediaSession::open_with_backend(
            Box::new(FailingBackend),
            Box::new(Cursor::new(Vec::new())),
            "broken.test",
            DecodeConfig::default(),
        );
        session.start();

        let mut buf = [0u8; 256];
        assert_eq!(session.read_audio(&mut buf), 0);
        assert!(session.status().audio_finished);
    }

    #[test]
    fn close_before_start_tears_down_synchronously() {
        let mut session = tone_session(ToneSpec::audio_only(4, 11_025));
        session.set_window(0.5, 0.0);
        assert!(!session.status().ready);
        session.close();
        session.close();
    }

    #[test]
    fn close_twice_after_start_is_safe() {
        let mut session = tone_session(ToneSpec::audio_only(4, 11_025));
        session.start();
        session.close();
        session.close();
    }

    #[test]
    fn read_after_close_returns_promptly() {
        let mut session = tone_session(ToneSpec::audio_only(4, 11_025));
        session.start();
        session.close();

        let mut buf = [0u8; 1_024];
        // May drain residue; must not hang.
        let _ = session.read_audio(&mut buf);
    }

    #[test]
    fn concurrent_readers_never_duplicate_samples() {
        let mut session = tone_session(ToneSpec::audio_only(20, 11_025));
        session.start();
        let session = Arc::new(session);

        let mut handles = Vec::new();
        for _ in 0..2 {
            let session = session.clone();
            handles.push(std::thread::spawn(move || {
                let mut buf = [0u8; 1_024];
                let mut total = 0usize;
                loop {
                    let n = session.read_audio(&mut buf);
                    total += n;
                    if n == 0 {
                        if session.status().audio_finished {
                            break;
                        }
                        std::thread::sleep(Duration::from_millis(1));
                    }
                }
                total
            }));
        }

        let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 5 * 44_100 * BYTES_PER_SAMPLE);
    }

    #[test]
    fn video_frames_are_decoded_and_counted() {
        let mut spec = ToneSpec::audio_only(4, 11_025);
        spec.video_packets = 10;
        spec.video_decoder = true;
        let frames = spec.video_frames.clone();

        let mut session = tone_session(spec);
        session.start();

        pull_all(&session);
        wait_for_video_finished(&session);
        assert_eq!(frames.load(Ordering::Relaxed), 10);
    }

    #[test]
    fn video_decode_error_finishes_only_the_video_stream() {
        let mut spec = ToneSpec::audio_only(4, 11_025);
        spec.video_packets = 10;
        spec.video_decoder = true;
        spec.video_fail_after = Some(3);
        let frames = spec.video_frames.clone();

        let mut session = tone_session(spec);
        session.start();

        let out = pull_all(&session);
        wait_for_video_finished(&session);
        assert_eq!(frames.load(Ordering::Relaxed), 3);
        assert_eq!(out.len(), 44_100 * BYTES_PER_SAMPLE);
    }

    // Minimal RIFF/WAVE writer: 16-bit stereo PCM.
    fn wav_bytes(rate: u32, frames: usize) -> Vec<u8> {
        let data_len = frames * BYTES_PER_SAMPLE;
        let mut out = Vec::with_capacity(44 + data_len);
        out.extend_from_slice(b"RIFF");
        out.extend_from_slice(&((36 + data_len) as u32).to_le_bytes());
        out.extend_from_slice(b"WAVE");
        out.extend_from_slice(b"fmt ");
        out.extend_from_slice(&16u32.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&2u16.to_le_bytes());
        out.extend_from_slice(&rate.to_le_bytes());
        out.extend_from_slice(&(rate * BYTES_PER_SAMPLE as u32).to_le_bytes());
        out.extend_from_slice(&(BYTES_PER_SAMPLE as u16).to_le_bytes());
        out.extend_from_slice(&16u16.to_le_bytes());
        out.extend_from_slice(b"data");
        out.extend_from_slice(&(data_len as u32).to_le_bytes());
        for i in 0..frames {
            let v = ((i % 128) as i16 - 64) * 256;
            out.extend_from_slice(&v.to_le_bytes());
            out.extend_from_slice(&v.to_le_bytes());
        }
        out
    }

    #[test]
    fn wav_source_decodes_through_the_symphonia_backend() {
        let bytes = wav_bytes(44_100, 44_100);
        let mut session = MediaSession::open(
            Box::new(Cursor::new(bytes)),
            "tone.wav",
            DecodeConfig::default(),
        );
        session.start();

        let out = pull_all(&session);
        assert_eq!(out.len(), 44_100 * BYTES_PER_SAMPLE);
    }

    #[test]
    fn wav_source_honors_the_start_window() {
        let bytes = wav_bytes(44_100, 44_100);
        let mut session = MediaSession::open(
            Box::new(Cursor::new(bytes)),
            "tone.wav",
            DecodeConfig::default(),
        );
        session.set_window(0.5, 0.0);
        session.start();

        let out = pull_all(&session);
        assert_eq!(out.len(), 22_050 * BYTES_PER_SAMPLE);
    }
}
