//! Deterministic generated media.
//!
//! Produces a constant-frame-rate video stream (flat grey frames whose level
//! follows the frame index) and a 440 Hz sine audio stream, with optional
//! injected faults. Seeking lands on the keyframe at or before the target, as
//! a real demuxer would. Used by the test-suite and by the demo when no file
//! is given.

use std::f32::consts::TAU;
use std::thread;
use std::time::Duration;

use super::{MediaStreams, StreamDecoder};
use crate::error::DecodeError;
use crate::media::{AudioBlock, MediaInfo, PixelFormat, Plane, VideoFrame};

const TONE_HZ: f32 = 440.0;
const TONE_LEVEL: f32 = 0.2;

/// Faults to inject into the generated streams.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FaultPlan {
    /// Video frame indices that fail with a corrupt-packet error
    pub corrupt_video_frames: Vec<u64>,
    /// Audio block indices that fail with a corrupt-packet error
    pub corrupt_audio_blocks: Vec<u64>,
    /// Frame index that carries the timestamp of two frames earlier
    pub out_of_order_frame: Option<u64>,
    /// Frame index at which the video stream fails permanently
    pub fatal_video_frame: Option<u64>,
}

/// Shape of the generated media.
#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticConfig {
    pub duration: Duration,
    pub frame_rate: f32,
    pub width: u32,
    pub height: u32,
    /// None generates video-only media
    pub sample_rate: Option<u32>,
    pub channels: u16,
    /// Sample frames per audio block
    pub block_samples: usize,
    /// Frames between keyframes
    pub keyframe_interval: u64,
    /// Simulated decode time per unit
    pub decode_cost: Duration,
    pub faults: FaultPlan,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(10),
            frame_rate: 24.0,
            width: 16,
            height: 16,
            sample_rate: Some(48_000),
            channels: 2,
            block_samples: 1024,
            keyframe_interval: 12,
            decode_cost: Duration::ZERO,
            faults: FaultPlan::default(),
        }
    }
}

impl SyntheticConfig {
    pub fn new(duration: Duration, frame_rate: f32) -> Self {
        Self {
            duration,
            frame_rate,
            ..Self::default()
        }
    }

    pub fn with_audio(mut self, sample_rate: u32, channels: u16) -> Self {
        self.sample_rate = Some(sample_rate);
        self.channels = channels;
        self
    }

    pub fn without_audio(mut self) -> Self {
        self.sample_rate = None;
        self
    }

    pub fn with_keyframe_interval(mut self, frames: u64) -> Self {
        self.keyframe_interval = frames.max(1);
        self
    }

    pub fn with_decode_cost(mut self, cost: Duration) -> Self {
        self.decode_cost = cost;
        self
    }

    pub fn with_faults(mut self, faults: FaultPlan) -> Self {
        self.faults = faults;
        self
    }
}

/// Factory for the generated streams.
#[derive(Debug, Clone)]
pub struct SyntheticMedia {
    config: SyntheticConfig,
}

impl SyntheticMedia {
    pub fn new(config: SyntheticConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SyntheticConfig {
        &self.config
    }

    pub fn info(&self) -> MediaInfo {
        MediaInfo {
            duration: self.config.duration,
            frame_rate: self.config.frame_rate,
            width: self.config.width,
            height: self.config.height,
            sample_rate: self.config.sample_rate,
            channels: self.config.sample_rate.map(|_| self.config.channels),
        }
    }

    /// Number of video frames in the stream.
    pub fn frame_count(&self) -> u64 {
        (self.config.duration.as_secs_f64() * self.config.frame_rate as f64).ceil() as u64
    }

    pub fn video_decoder(&self) -> SyntheticVideo {
        SyntheticVideo {
            config: self.config.clone(),
            frame_count: self.frame_count(),
            next_index: 0,
            eof: false,
            failed: false,
        }
    }

    pub fn audio_decoder(&self) -> Option<SyntheticAudio> {
        let sample_rate = self.config.sample_rate?;
        let total_samples = (self.config.duration.as_secs_f64() * sample_rate as f64).round() as u64;
        Some(SyntheticAudio {
            sample_rate,
            channels: self.config.channels.max(1),
            block_samples: self.config.block_samples.max(1) as u64,
            total_samples,
            corrupt_blocks: self.config.faults.corrupt_audio_blocks.clone(),
            decode_cost: self.config.decode_cost,
            next_block: 0,
            eof: false,
        })
    }

    /// Builds the decoder set the engine loads.
    pub fn streams(&self) -> MediaStreams {
        MediaStreams {
            info: self.info(),
            video: Box::new(self.video_decoder()),
            audio: self
                .audio_decoder()
                .map(|decoder| Box::new(decoder) as super::BoxedAudioDecoder),
        }
    }
}

/// Generated video stream.
pub struct SyntheticVideo {
    config: SyntheticConfig,
    frame_count: u64,
    next_index: u64,
    eof: bool,
    failed: bool,
}

impl SyntheticVideo {
    fn pts_of(&self, index: u64) -> Duration {
        Duration::from_secs_f64(index as f64 / self.config.frame_rate as f64)
    }

    fn render(&self, index: u64, pts: Duration) -> VideoFrame {
        let level = (index % 256) as u8;
        let stride = self.config.width as usize * 4;
        let mut data = vec![level; stride * self.config.height as usize];
        // Opaque alpha
        for pixel in data.chunks_exact_mut(4) {
            pixel[3] = 0xFF;
        }
        VideoFrame::new(
            pts,
            index,
            self.pts_of(1),
            PixelFormat::Rgba,
            self.config.width,
            self.config.height,
            vec![Plane { data, stride }],
        )
    }
}

impl StreamDecoder for SyntheticVideo {
    type Unit = VideoFrame;

    fn decode_next(&mut self) -> Result<Option<VideoFrame>, DecodeError> {
        if self.failed {
            return Err(DecodeError::Fatal("stream already failed".into()));
        }
        if self.next_index >= self.frame_count {
            self.eof = true;
            return Ok(None);
        }

        let index = self.next_index;
        self.next_index += 1;

        if !self.config.decode_cost.is_zero() {
            thread::sleep(self.config.decode_cost);
        }

        let faults = &self.config.faults;
        if faults.fatal_video_frame == Some(index) {
            self.failed = true;
            return Err(DecodeError::Fatal(format!(
                "bitstream unreadable at frame {index}"
            )));
        }
        if faults.corrupt_video_frames.contains(&index) {
            return Err(DecodeError::Corrupt {
                position: Some(self.pts_of(index)),
                reason: format!("invalid slice data in frame {index}"),
            });
        }

        let pts = if faults.out_of_order_frame == Some(index) {
            self.pts_of(index.saturating_sub(2))
        } else {
            self.pts_of(index)
        };
        Ok(Some(self.render(index, pts)))
    }

    fn seek(&mut self, position: Duration) -> Result<(), DecodeError> {
        let target = (position.as_secs_f64() * self.config.frame_rate as f64).floor() as u64;
        let target = target.min(self.frame_count.saturating_sub(1));
        let keyframe = target - target % self.config.keyframe_interval.max(1);

        tracing::trace!(
            "Synthetic video seek to {:?}: frame {} (keyframe {})",
            position,
            target,
            keyframe
        );
        self.next_index = keyframe;
        self.eof = false;
        Ok(())
    }

    fn is_eof(&self) -> bool {
        self.eof
    }

    fn label(&self) -> &'static str {
        "video"
    }
}

/// Generated audio stream.
pub struct SyntheticAudio {
    sample_rate: u32,
    channels: u16,
    block_samples: u64,
    total_samples: u64,
    corrupt_blocks: Vec<u64>,
    decode_cost: Duration,
    next_block: u64,
    eof: bool,
}

impl StreamDecoder for SyntheticAudio {
    type Unit = AudioBlock;

    fn decode_next(&mut self) -> Result<Option<AudioBlock>, DecodeError> {
        let start = self.next_block * self.block_samples;
        if start >= self.total_samples {
            self.eof = true;
            return Ok(None);
        }

        let block = self.next_block;
        self.next_block += 1;

        if !self.decode_cost.is_zero() {
            thread::sleep(self.decode_cost);
        }

        let pts = Duration::from_micros(start * 1_000_000 / self.sample_rate as u64);
        if self.corrupt_blocks.contains(&block) {
            return Err(DecodeError::Corrupt {
                position: Some(pts),
                reason: format!("bad frame header in audio block {block}"),
            });
        }

        let frames = self.block_samples.min(self.total_samples - start);
        let channels = self.channels as usize;
        let mut data = Vec::with_capacity(frames as usize * channels);
        for i in start..start + frames {
            let t = i as f32 / self.sample_rate as f32;
            let sample = (TAU * TONE_HZ * t).sin() * TONE_LEVEL;
            data.extend(std::iter::repeat(sample).take(channels));
        }

        Ok(Some(AudioBlock::new(pts, data, self.sample_rate, self.channels)))
    }

    fn seek(&mut self, position: Duration) -> Result<(), DecodeError> {
        let sample = position.as_micros() as u64 * self.sample_rate as u64 / 1_000_000;
        let last_block = self.total_samples.saturating_sub(1) / self.block_samples;
        self.next_block = (sample / self.block_samples).min(last_block);
        self.eof = false;
        Ok(())
    }

    fn is_eof(&self) -> bool {
        self.eof
    }

    fn label(&self) -> &'static str {
        "audio"
    }
}
