//! The decode thread.
//!
//! Owns the demuxer, decoders, converter, and per-stream packet queues, and
//! runs the whole pipeline on its own schedule: initialize, then alternate
//! audio/video decode steps under the readiness/wake protocol until told to
//! quit, then drain and tear down. Nothing here unwinds past the thread;
//! every decode-level failure lands in a finished flag.

use std::sync::Arc;

use anyhow::{Result, anyhow};

use crate::codec::{AudioDecoder, AudioFrame, VideoDecoder};
use crate::config::{BYTES_PER_SAMPLE, DecodeConfig};
use crate::demux::{Demuxer, MediaBackend, MediaPacket, StreamKind};
use crate::queue::PacketQueue;
use crate::resample::FrameConverter;
use crate::session::Shared;
use crate::source::ByteSource;

/// Longest container duration accepted as a delivery bound, in seconds.
/// Values outside [0, MAX] are treated as unknown (play until exhausted).
const MAX_DURATION_SECONDS: f64 = 3_600.0;

pub(crate) struct DecodePipeline {
    shared: Arc<Shared>,
    backend: Box<dyn MediaBackend>,
    source: Option<Box<dyn ByteSource>>,
    name: String,
    config: DecodeConfig,
    /// Seconds of content to discard before delivery begins.
    skip: f64,

    demuxer: Option<Box<dyn Demuxer>>,
    audio_stream: Option<usize>,
    video_stream: Option<usize>,
    audio_decoder: Option<Box<dyn AudioDecoder>>,
    video_decoder: Option<Box<dyn VideoDecoder>>,
    converter: FrameConverter,
    audio_packets: PacketQueue,
    video_packets: PacketQueue,
    /// The video packet being decoded and the byte cursor into it.
    video_cursor: Option<(MediaPacket, usize)>,
}

impl DecodePipeline {
    pub(crate) fn new(
        shared: Arc<Shared>,
        backend: Box<dyn MediaBackend>,
        source: Box<dyn ByteSource>,
        name: String,
        config: DecodeConfig,
        skip: f64,
    ) -> Self {
        let converter = FrameConverter::new(config.sample_rate);
        Self {
            shared,
            backend,
            source: Some(source),
            name,
            config,
            skip,
            demuxer: None,
            audio_stream: None,
            video_stream: None,
            audio_decoder: None,
            video_decoder: None,
            converter,
            audio_packets: PacketQueue::default(),
            video_packets: PacketQueue::default(),
            video_cursor: None,
        }
    }

    /// Thread entry point: initialize, loop, drain, tear down.
    pub(crate) fn run(mut self) {
        tracing::debug!(name = %self.name, "decode thread started");

        match self.initialize() {
            Ok(()) => self.ready_loop(),
            Err(e) => {
                // Fatal to the session: surface readiness anyway with both
                // streams finished, so readers get zeros instead of hanging.
                tracing::warn!(name = %self.name, "media initialization failed: {e:#}");
                let mut st = self.shared.state.lock().unwrap();
                st.audio_finished = true;
                st.video_finished = true;
            }
        }

        self.drain();

        tracing::debug!(
            name = %self.name,
            audio_packets = self.audio_packets.len(),
            video_packets = self.video_packets.len(),
            "decode thread exiting"
        );
        // Decoders, demuxer, queues and converter drop here.
    }

    /// Open the container, select streams, open decoders, compute the
    /// duration bound, and perform the initial seek.
    fn initialize(&mut self) -> Result<()> {
        let source = self
            .source
            .take()
            .ok_or_else(|| anyhow!("byte source already taken"))?;
        let mut demuxer = self.backend.open(source, &self.name)?;

        // First stream of each kind wins.
        for info in demuxer.streams() {
            match info.kind {
                StreamKind::Audio if self.audio_stream.is_none() => {
                    self.audio_stream = Some(info.index);
                }
                StreamKind::Video if self.video_stream.is_none() => {
                    self.video_stream = Some(info.index);
                }
                _ => {}
            }
            if self.audio_stream.is_some() && self.video_stream.is_some() {
                break;
            }
        }

        self.audio_decoder = self
            .audio_stream
            .and_then(|s| demuxer.open_audio_decoder(s));
        self.video_decoder = self
            .video_stream
            .and_then(|s| demuxer.open_video_decoder(s));

        tracing::debug!(
            name = %self.name,
            audio_stream = ?self.audio_stream,
            video_stream = ?self.video_stream,
            "streams selected"
        );

        // Delivery bound from container metadata, unless set_window already
        // configured one.
        if let Some(duration) = demuxer.duration_seconds() {
            let bound = duration_bound_samples(duration, self.config.sample_rate);
            let mut st = self.shared.state.lock().unwrap();
            if st.duration_samples == 0 {
                st.duration_samples = bound;
            }
        }

        if self.skip != 0.0 {
            if let Err(e) = demuxer.seek_to(self.skip) {
                // The skip window still trims everything before the target.
                tracing::warn!(name = %self.name, "initial seek failed: {e:#}");
            }
        }

        self.demuxer = Some(demuxer);
        Ok(())
    }

    /// Alternate decode steps and sleep on the condvar until asked for more
    /// audio or told to quit.
    fn ready_loop(&mut self) {
        loop {
            let (quit, audio_finished, video_finished) = {
                let st = self.shared.state.lock().unwrap();
                (st.quit, st.audio_finished, st.video_finished)
            };
            if quit {
                break;
            }

            if !audio_finished {
                self.decode_audio();
            }
            if !video_finished {
                self.decode_video();
            }

            let mut st = self.shared.state.lock().unwrap();
            if !st.ready {
                // One-time signal: initialization succeeded and the queues
                // hold first data.
                st.ready = true;
                self.shared.cond.notify_all();
            }
            if !st.needs_decode && !st.quit {
                st = self.shared.cond.wait(st).unwrap();
            }
            st.needs_decode = false;
        }
    }

    /// Make sure no reader waits forever, then hold until quit.
    fn drain(&mut self) {
        let mut st = self.shared.state.lock().unwrap();
        if !st.ready {
            st.ready = true;
            self.shared.cond.notify_all();
        }
        while !st.quit {
            st = self.shared.cond.wait(st).unwrap();
        }
    }

    /// Next packet for `kind`'s stream, demuxing and routing as needed.
    ///
    /// `None` is the end-of-stream sentinel. Packets for the other decoded
    /// stream are parked on its queue; packets for unknown streams are
    /// dropped.
    fn read_packet(&mut self, kind: StreamKind) -> Option<MediaPacket> {
        loop {
            let queued = match kind {
                StreamKind::Audio => self.audio_packets.pop(),
                _ => self.video_packets.pop(),
            };
            if let Some(packet) = queued {
                return Some(packet);
            }

            let demuxer = self.demuxer.as_mut()?;
            let packet = match demuxer.next_packet() {
                Ok(Some(p)) => p,
                Ok(None) => return None,
                Err(e) => {
                    tracing::warn!(name = %self.name, "demux error: {e:#}");
                    return None;
                }
            };

            if Some(packet.stream) == self.audio_stream {
                self.audio_packets.push(packet);
            } else if Some(packet.stream) == self.video_stream {
                self.video_packets.push(packet);
            }
        }
    }

    /// Decode audio until the buffered target is reached or the stream ends.
    fn decode_audio(&mut self) {
        if self.audio_decoder.is_none() {
            self.set_audio_finished();
            return;
        }

        let target = self.config.target_samples();

        while self.queued_samples() < target {
            let Some(packet) = self.read_packet(StreamKind::Audio) else {
                // End of stream: flush the decoder, then finish.
                while let Some(frame) = self.audio_decoder.as_mut().and_then(|d| d.drain()) {
                    self.handle_audio_frame(frame);
                }
                self.set_audio_finished();
                return;
            };
            if packet.data.is_empty() {
                continue;
            }

            let mut offset = 0;
            loop {
                let step = {
                    let Some(decoder) = self.audio_decoder.as_mut() else {
                        return;
                    };
                    match decoder.decode(&packet, offset) {
                        Ok(step) => step,
                        Err(e) => {
                            // Fatal to the audio path.
                            tracing::warn!(name = %self.name, "audio decode failed: {e:#}");
                            self.set_audio_finished();
                            return;
                        }
                    }
                };

                offset += step.consumed;

                let Some(frame) = step.frame else {
                    // The decoder wants the next packet.
                    break;
                };
                self.handle_audio_frame(frame);

                if offset >= packet.data.len() {
                    break;
                }
            }
        }
    }

    /// Convert one decoded frame, apply the skip window, and enqueue it.
    fn handle_audio_frame(&mut self, frame: AudioFrame) {
        let converted = match self.converter.convert(&frame) {
            Ok(c) => c,
            Err(e) => {
                // Recoverable: the stream continues without this frame.
                tracing::debug!(name = %self.name, "frame conversion failed, dropped: {e:#}");
                return;
            }
        };
        if converted.samples() == 0 {
            return;
        }

        let rate = self.config.sample_rate;
        let start = frame.pts.unwrap_or(0.0);
        let end = start + converted.samples() as f64 / rate as f64;

        let mut st = self.shared.state.lock().unwrap();
        if start >= self.skip {
            // Normal case: queue the frame.
            st.queued_samples += converted.samples() as u64;
            st.frames.push(converted);
        } else if end < self.skip {
            // Entirely before the window: drop it.
        } else {
            // Straddles the skip point: this becomes the partial output
            // frame, positioned at the first sample at or after the skip.
            let cut = skip_cut_bytes(self.skip, start, rate);
            if cut < converted.data.len() {
                st.queued_samples += ((converted.data.len() - cut) / BYTES_PER_SAMPLE) as u64;
                st.out_frame = Some(converted);
                st.out_index = cut;
            }
        }
    }

    /// Decode video until the stream ends.
    fn decode_video(&mut self) {
        if self.video_decoder.is_none() {
            self.set_video_finished();
            return;
        }

        while !self.video_finished() {
            self.decode_video_frame();
        }
    }

    /// Decode up to one video frame.
    ///
    /// Frame delivery is out of scope for this engine: the presentation
    /// timestamp is computed and the frame dropped. The surrounding system
    /// supplies the sink.
    fn decode_video_frame(&mut self) {
        loop {
            let exhausted = self
                .video_cursor
                .as_ref()
                .is_none_or(|(packet, offset)| *offset >= packet.data.len());

            if exhausted {
                match self.read_packet(StreamKind::Video) {
                    Some(packet) => {
                        self.video_cursor = Some((packet, 0));
                        continue;
                    }
                    None => {
                        // End of stream: flush, then finish.
                        if let Some(frame) = self.video_decoder.as_mut().and_then(|d| d.drain()) {
                            self.emit_video_frame(&frame);
                            return;
                        }
                        self.set_video_finished();
                        return;
                    }
                }
            }

            let step = {
                let Some((packet, offset)) = self.video_cursor.as_ref() else {
                    return;
                };
                let Some(decoder) = self.video_decoder.as_mut() else {
                    return;
                };
                match decoder.decode(packet, *offset) {
                    Ok(step) => step,
                    Err(e) => {
                        // Fatal to the video stream only.
                        tracing::warn!(name = %self.name, "video decode failed: {e:#}");
                        self.set_video_finished();
                        return;
                    }
                }
            };

            if let Some((_, offset)) = self.video_cursor.as_mut() {
                *offset += step.consumed;
            }

            match step.frame {
                Some(frame) => {
                    self.emit_video_frame(&frame);
                    return;
                }
                None if step.consumed == 0 => {
                    // The decoder refused the rest of this packet.
                    self.video_cursor = None;
                }
                None => {}
            }
        }
    }

    fn emit_video_frame(&self, frame: &crate::codec::VideoFrame) {
        if let Some(pts) = frame.pts {
            tracing::trace!(name = %self.name, pts, "video frame decoded");
        }
    }

    fn queued_samples(&self) -> u64 {
        self.shared.state.lock().unwrap().queued_samples
    }

    fn video_finished(&self) -> bool {
        self.shared.state.lock().unwrap().video_finished
    }

    fn set_audio_finished(&self) {
        self.shared.state.lock().unwrap().audio_finished = true;
    }

    fn set_video_finished(&self) {
        self.shared.state.lock().unwrap().video_finished = true;
    }
}

/// Delivery bound in output samples from a container duration.
fn duration_bound_samples(seconds: f64, rate: u32) -> u64 {
    if (0.0..=MAX_DURATION_SECONDS).contains(&seconds) {
        (seconds * rate as f64) as u64
    } else {
        0
    }
}

/// Byte offset of the first sample at or after `skip` inside a frame
/// starting at `start` seconds.
fn skip_cut_bytes(skip: f64, start: f64, rate: u32) -> usize {
    BYTES_PER_SAMPLE * (((skip - start) * rate as f64) as usize)
}
