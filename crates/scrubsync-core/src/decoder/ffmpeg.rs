//! FFmpeg-backed decoders.
//!
//! Each elementary stream gets its own demux context so the video and audio
//! workers can seek and read independently. Video is converted to RGBA and
//! audio is resampled to interleaved f32 stereo at the output rate.

use std::path::Path;
use std::time::Duration;

use ffmpeg_next as ffmpeg;
use ffmpeg_next::ffi;

use super::{BoxedAudioDecoder, MediaStreams, StreamDecoder};
use crate::error::{DecodeError, EngineError, Result};
use crate::media::{AudioBlock, MediaInfo, PixelFormat, Plane, VideoFrame};

const OUTPUT_CHANNELS: u16 = 2;

/// Opens `path` and builds a decoder per stream.
pub fn open(path: &Path, output_rate: u32) -> Result<MediaStreams> {
    // ffmpeg::init() is safe to call multiple times
    ffmpeg::init().map_err(|e| EngineError::Open(format!("FFmpeg init failed: {e}")))?;

    let video = FfmpegVideoDecoder::open(path)?;
    let audio = FfmpegAudioDecoder::open(path, output_rate)?;

    let info = MediaInfo {
        duration: video.duration,
        frame_rate: video.frame_rate,
        width: video.decoder.width(),
        height: video.decoder.height(),
        sample_rate: audio.as_ref().map(|_| output_rate),
        channels: audio.as_ref().map(|_| OUTPUT_CHANNELS),
    };

    tracing::info!(
        "Opened {}: {}x{}, {:.2} fps, duration {:?}, audio: {}",
        path.display(),
        info.width,
        info.height,
        info.frame_rate,
        info.duration,
        if audio.is_some() { "yes" } else { "none" }
    );

    Ok(MediaStreams {
        info,
        video: Box::new(video),
        audio: audio.map(|decoder| Box::new(decoder) as BoxedAudioDecoder),
    })
}

fn open_input(path: &Path) -> Result<ffmpeg::format::context::Input> {
    ffmpeg::format::input(&path)
        .map_err(|e| EngineError::Open(format!("Failed to open {}: {e}", path.display())))
}

fn container_duration(input: &ffmpeg::format::context::Input) -> Duration {
    if input.duration() > 0 {
        Duration::from_micros(
            (input.duration() as f64 * 1_000_000.0 / ffi::AV_TIME_BASE as f64) as u64,
        )
    } else {
        Duration::ZERO
    }
}

fn ts_to_duration(ts: i64, time_base: (i32, i32)) -> Duration {
    if ts < 0 || time_base.1 == 0 {
        return Duration::ZERO;
    }
    let seconds = (ts as f64) * (time_base.0 as f64) / (time_base.1 as f64);
    Duration::from_secs_f64(seconds.max(0.0))
}

/// Repositions `input` to the keyframe at or before `position`.
fn seek_input(
    input: &mut ffmpeg::format::context::Input,
    position: Duration,
) -> std::result::Result<(), DecodeError> {
    // input.seek() expects timestamps in AV_TIME_BASE (microseconds), not stream time_base
    let timestamp = position.as_micros() as i64;
    input
        .seek(timestamp, ..timestamp)
        .map_err(|e| DecodeError::Seek(format!("seek to {position:?} failed: {e}")))
}

fn classify_packet_error(err: ffmpeg::Error, position: Option<Duration>) -> DecodeError {
    match err {
        ffmpeg::Error::InvalidData | ffmpeg::Error::Other { .. } => DecodeError::Corrupt {
            position,
            reason: err.to_string(),
        },
        other => DecodeError::Fatal(other.to_string()),
    }
}

/// Video stream decoder producing RGBA frames.
pub struct FfmpegVideoDecoder {
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    decoder: ffmpeg::decoder::Video,
    scaler: Option<ffmpeg::software::scaling::Context>,
    time_base: (i32, i32),
    frame_rate: f32,
    duration: Duration,
    sequence: u64,
    packets_exhausted: bool,
    eof_sent: bool,
    eof_reached: bool,
}

// SAFETY: the decoder is owned and used by a single decode worker thread. The
// FFmpeg contexts hold raw pointers but are never shared between threads.
unsafe impl Send for FfmpegVideoDecoder {}

impl FfmpegVideoDecoder {
    pub fn open(path: &Path) -> Result<Self> {
        let input = open_input(path)?;

        let stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or(EngineError::NoVideoStream)?;
        let stream_index = stream.index();
        let time_base = stream.time_base();
        let rate = stream.avg_frame_rate();
        let frame_rate = rate.0 as f64 / rate.1.max(1) as f64;

        let context = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
            .map_err(|e| EngineError::Open(format!("Failed to create codec context: {e}")))?;
        let decoder = context
            .decoder()
            .video()
            .map_err(|e| EngineError::Open(format!("Failed to open video decoder: {e}")))?;

        let duration = container_duration(&input);

        Ok(Self {
            input,
            stream_index,
            decoder,
            scaler: None,
            time_base: (time_base.0, time_base.1),
            frame_rate: if frame_rate.is_finite() && frame_rate > 0.0 {
                frame_rate as f32
            } else {
                30.0
            },
            duration,
            sequence: 0,
            packets_exhausted: false,
            eof_sent: false,
            eof_reached: false,
        })
    }

    fn frame_duration(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.frame_rate as f64)
    }

    fn ensure_scaler(
        &mut self,
        width: u32,
        height: u32,
        src_format: ffmpeg::format::Pixel,
    ) -> std::result::Result<(), DecodeError> {
        // Recreate scaler if format OR dimensions changed
        let needs_recreate = match &self.scaler {
            None => true,
            Some(scaler) => {
                let input = scaler.input();
                input.format != src_format || input.width != width || input.height != height
            }
        };

        if needs_recreate {
            let scaler = ffmpeg::software::scaling::Context::get(
                src_format,
                width,
                height,
                ffmpeg::format::Pixel::RGBA,
                width,
                height,
                ffmpeg::software::scaling::Flags::BILINEAR,
            )
            .map_err(|e| DecodeError::Fatal(format!("Failed to create scaler: {e}")))?;
            self.scaler = Some(scaler);
        }
        Ok(())
    }

    fn to_frame(
        &mut self,
        decoded: &ffmpeg::frame::Video,
        pts: Duration,
    ) -> std::result::Result<VideoFrame, DecodeError> {
        let (width, height) = (decoded.width(), decoded.height());
        self.ensure_scaler(width, height, decoded.format())?;

        let Some(scaler) = self.scaler.as_mut() else {
            return Err(DecodeError::Fatal("Scaler not initialized".to_string()));
        };

        let mut rgba = ffmpeg::frame::Video::empty();
        scaler.run(decoded, &mut rgba).map_err(|e| DecodeError::Corrupt {
            position: Some(pts),
            reason: format!("Scaling failed: {e}"),
        })?;

        // Copy row by row; the scaler's stride may include padding
        let stride = rgba.stride(0);
        let row_bytes = width as usize * 4;
        let data = rgba.data(0);
        let mut pixels = Vec::with_capacity(row_bytes * height as usize);
        for y in 0..height as usize {
            let start = y * stride;
            pixels.extend_from_slice(&data[start..start + row_bytes]);
        }

        let sequence = self.sequence;
        self.sequence += 1;

        Ok(VideoFrame::new(
            pts,
            sequence,
            self.frame_duration(),
            PixelFormat::Rgba,
            width,
            height,
            vec![Plane {
                data: pixels,
                stride: row_bytes,
            }],
        ))
    }

    fn feed_packet(&mut self) -> std::result::Result<(), DecodeError> {
        if self.packets_exhausted {
            if !self.eof_sent {
                self.eof_sent = true;
                self.decoder
                    .send_eof()
                    .map_err(|e| DecodeError::Fatal(format!("Failed to drain decoder: {e}")))?;
            }
            return Ok(());
        }

        let time_base = self.time_base;
        for (stream, packet) in self.input.packets() {
            if stream.index() != self.stream_index {
                continue;
            }
            let position = packet.pts().map(|ts| ts_to_duration(ts, time_base));
            return self
                .decoder
                .send_packet(&packet)
                .map_err(|e| classify_packet_error(e, position));
        }

        self.packets_exhausted = true;
        Ok(())
    }
}

impl StreamDecoder for FfmpegVideoDecoder {
    type Unit = VideoFrame;

    fn decode_next(&mut self) -> std::result::Result<Option<VideoFrame>, DecodeError> {
        if self.eof_reached {
            return Ok(None);
        }

        let mut decoded = ffmpeg::frame::Video::empty();
        loop {
            match self.decoder.receive_frame(&mut decoded) {
                Ok(()) => {
                    let ts = decoded.timestamp().or(decoded.pts()).unwrap_or(0);
                    let pts = ts_to_duration(ts, self.time_base);
                    return self.to_frame(&decoded, pts).map(Some);
                }
                Err(ffmpeg::Error::Eof) => {
                    self.eof_reached = true;
                    return Ok(None);
                }
                Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::error::EAGAIN => {
                    self.feed_packet()?;
                }
                Err(e) => {
                    return Err(DecodeError::Corrupt {
                        position: None,
                        reason: format!("Decode error: {e}"),
                    })
                }
            }
        }
    }

    fn seek(&mut self, position: Duration) -> std::result::Result<(), DecodeError> {
        tracing::debug!("FFmpeg video seek: position={:?}", position);
        seek_input(&mut self.input, position)?;
        self.decoder.flush();
        self.packets_exhausted = false;
        self.eof_sent = false;
        self.eof_reached = false;
        Ok(())
    }

    fn is_eof(&self) -> bool {
        self.eof_reached
    }

    fn label(&self) -> &'static str {
        "video"
    }
}

/// Audio stream decoder producing interleaved f32 stereo blocks.
pub struct FfmpegAudioDecoder {
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    decoder: ffmpeg::decoder::Audio,
    resampler: Option<ffmpeg::software::resampling::Context>,
    time_base: (i32, i32),
    output_rate: u32,
    packets_exhausted: bool,
    eof_sent: bool,
    eof_reached: bool,
}

// SAFETY: see FfmpegVideoDecoder.
unsafe impl Send for FfmpegAudioDecoder {}

impl FfmpegAudioDecoder {
    /// Opens the best audio stream of `path`, or returns None if there is none.
    pub fn open(path: &Path, output_rate: u32) -> Result<Option<Self>> {
        let input = open_input(path)?;

        let Some(stream) = input.streams().best(ffmpeg::media::Type::Audio) else {
            tracing::info!("{} has no audio stream", path.display());
            return Ok(None);
        };
        let stream_index = stream.index();
        let time_base = stream.time_base();

        let context = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
            .map_err(|e| EngineError::Open(format!("Failed to create codec context: {e}")))?;
        let decoder = context
            .decoder()
            .audio()
            .map_err(|e| EngineError::Open(format!("Failed to open audio decoder: {e}")))?;

        tracing::info!(
            "Audio: {}Hz -> {}Hz, {} channels",
            decoder.rate(),
            output_rate,
            decoder.channels()
        );

        Ok(Some(Self {
            input,
            stream_index,
            decoder,
            resampler: None,
            time_base: (time_base.0, time_base.1),
            output_rate,
            packets_exhausted: false,
            eof_sent: false,
            eof_reached: false,
        }))
    }

    fn ensure_resampler(
        &mut self,
        frame: &ffmpeg::frame::Audio,
    ) -> std::result::Result<(), DecodeError> {
        let needs_recreate = match &self.resampler {
            None => true,
            Some(resampler) => {
                let input = resampler.input();
                input.format != frame.format()
                    || input.rate != frame.rate()
                    || input.channel_layout != frame.channel_layout()
            }
        };

        if needs_recreate {
            let resampler = ffmpeg::software::resampling::Context::get(
                frame.format(),
                frame.channel_layout(),
                frame.rate(),
                ffmpeg::format::Sample::F32(ffmpeg::format::sample::Type::Packed),
                ffmpeg::ChannelLayout::STEREO,
                self.output_rate,
            )
            .map_err(|e| DecodeError::Fatal(format!("Failed to create resampler: {e}")))?;
            self.resampler = Some(resampler);
        }
        Ok(())
    }

    /// Resamples one decoded frame. Returns None while the resampler is
    /// still buffering.
    fn to_block(
        &mut self,
        frame: &ffmpeg::frame::Audio,
        pts: Duration,
    ) -> std::result::Result<Option<AudioBlock>, DecodeError> {
        self.ensure_resampler(frame)?;
        let Some(resampler) = self.resampler.as_mut() else {
            return Err(DecodeError::Fatal("Resampler not initialized".to_string()));
        };

        let mut output = ffmpeg::frame::Audio::empty();
        resampler.run(frame, &mut output).map_err(|e| DecodeError::Corrupt {
            position: Some(pts),
            reason: format!("Resampling failed: {e}"),
        })?;

        let frames = output.samples();
        if frames == 0 {
            return Ok(None);
        }

        let wanted = frames * OUTPUT_CHANNELS as usize;
        let samples: Vec<f32> = output
            .data(0)
            .chunks_exact(4)
            .take(wanted)
            .map(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
            .collect();

        Ok(Some(AudioBlock::new(
            pts,
            samples,
            output.rate(),
            OUTPUT_CHANNELS,
        )))
    }

    fn feed_packet(&mut self) -> std::result::Result<(), DecodeError> {
        if self.packets_exhausted {
            if !self.eof_sent {
                self.eof_sent = true;
                self.decoder
                    .send_eof()
                    .map_err(|e| DecodeError::Fatal(format!("Failed to drain decoder: {e}")))?;
            }
            return Ok(());
        }

        let time_base = self.time_base;
        for (stream, packet) in self.input.packets() {
            if stream.index() != self.stream_index {
                continue;
            }
            let position = packet.pts().map(|ts| ts_to_duration(ts, time_base));
            return self
                .decoder
                .send_packet(&packet)
                .map_err(|e| classify_packet_error(e, position));
        }

        self.packets_exhausted = true;
        Ok(())
    }
}

impl StreamDecoder for FfmpegAudioDecoder {
    type Unit = AudioBlock;

    fn decode_next(&mut self) -> std::result::Result<Option<AudioBlock>, DecodeError> {
        if self.eof_reached {
            return Ok(None);
        }

        let mut decoded = ffmpeg::frame::Audio::empty();
        loop {
            match self.decoder.receive_frame(&mut decoded) {
                Ok(()) => {
                    let ts = decoded.timestamp().or(decoded.pts()).unwrap_or(0);
                    let pts = ts_to_duration(ts, self.time_base);
                    if let Some(block) = self.to_block(&decoded, pts)? {
                        return Ok(Some(block));
                    }
                }
                Err(ffmpeg::Error::Eof) => {
                    self.eof_reached = true;
                    return Ok(None);
                }
                Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::error::EAGAIN => {
                    self.feed_packet()?;
                }
                Err(e) => {
                    return Err(DecodeError::Corrupt {
                        position: None,
                        reason: format!("Decode error: {e}"),
                    })
                }
            }
        }
    }

    fn seek(&mut self, position: Duration) -> std::result::Result<(), DecodeError> {
        tracing::debug!("FFmpeg audio seek: position={:?}", position);
        seek_input(&mut self.input, position)?;
        self.decoder.flush();
        // Drop samples buffered for the old position
        self.resampler = None;
        self.packets_exhausted = false;
        self.eof_sent = false;
        self.eof_reached = false;
        Ok(())
    }

    fn is_eof(&self) -> bool {
        self.eof_reached
    }

    fn label(&self) -> &'static str {
        "audio"
    }
}
