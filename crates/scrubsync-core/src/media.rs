//! Decoded media units and stream metadata.
//!
//! A [`VideoFrame`] or [`AudioBlock`] is created by a decoder, moves through
//! its bounded queue and is dropped by the consumer after presentation. Each
//! unit remembers the seek generation it was decoded under so consumers can
//! recognise data from before a seek.

use std::time::Duration;

/// Pixel format for decoded video frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUV 4:2:0 planar
    Yuv420p,
    /// RGBA 32-bit
    Rgba,
}

/// A single plane of pixel data.
#[derive(Debug, Clone)]
pub struct Plane {
    /// Raw pixel data
    pub data: Vec<u8>,
    /// Stride (bytes per row, may include padding)
    pub stride: usize,
}

/// Common surface of everything that travels through a
/// [`BoundedQueue`](crate::frame_queue::BoundedQueue).
pub trait MediaUnit: Send + 'static {
    /// Presentation timestamp relative to stream start.
    fn pts(&self) -> Duration;
    /// Seek generation the unit was decoded under.
    fn generation(&self) -> u64;
    /// Stamps the unit with the worker's current generation.
    fn set_generation(&mut self, generation: u64);
    /// How long the unit covers on the timeline.
    fn duration(&self) -> Duration;

    /// Cuts away whatever presents before `position`.
    ///
    /// Returns false if nothing is left to present, in which case the unit
    /// should be discarded. Video frames cannot be split and are simply
    /// kept or discarded.
    fn trim_front(&mut self, position: Duration) -> bool {
        self.pts() >= position
    }
}

/// One decoded video image.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    /// Presentation timestamp (when this frame should be displayed)
    pub pts: Duration,
    /// Decode-order index within the stream
    pub sequence: u64,
    /// Nominal display duration (1 / frame rate)
    pub frame_duration: Duration,
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub planes: Vec<Plane>,
    generation: u64,
}

impl VideoFrame {
    pub fn new(
        pts: Duration,
        sequence: u64,
        frame_duration: Duration,
        format: PixelFormat,
        width: u32,
        height: u32,
        planes: Vec<Plane>,
    ) -> Self {
        Self {
            pts,
            sequence,
            frame_duration,
            format,
            width,
            height,
            planes,
            generation: 0,
        }
    }

    /// Returns the frame dimensions.
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

impl MediaUnit for VideoFrame {
    fn pts(&self) -> Duration {
        self.pts
    }

    fn generation(&self) -> u64 {
        self.generation
    }

    fn set_generation(&mut self, generation: u64) {
        self.generation = generation;
    }

    fn duration(&self) -> Duration {
        self.frame_duration
    }
}

/// A contiguous run of decoded, interleaved f32 samples.
#[derive(Clone)]
pub struct AudioBlock {
    /// Presentation timestamp of the first sample
    pub pts: Duration,
    /// Interleaved samples (-1.0 to 1.0)
    pub data: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
    generation: u64,
}

impl AudioBlock {
    pub fn new(pts: Duration, data: Vec<f32>, sample_rate: u32, channels: u16) -> Self {
        Self {
            pts,
            data,
            sample_rate,
            channels,
            generation: 0,
        }
    }

    /// Number of sample frames (samples per channel).
    pub fn sample_count(&self) -> usize {
        self.data.len() / self.channels.max(1) as usize
    }

    /// Timestamp just past the last sample.
    pub fn end_pts(&self) -> Duration {
        self.pts + MediaUnit::duration(self)
    }
}

impl MediaUnit for AudioBlock {
    fn pts(&self) -> Duration {
        self.pts
    }

    fn generation(&self) -> u64 {
        self.generation
    }

    fn set_generation(&mut self, generation: u64) {
        self.generation = generation;
    }

    fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        let frames = self.sample_count() as u64;
        Duration::from_micros(frames * 1_000_000 / self.sample_rate as u64)
    }

    fn trim_front(&mut self, position: Duration) -> bool {
        if position <= self.pts {
            return true;
        }
        if position >= self.end_pts() {
            return false;
        }
        let channels = self.channels.max(1) as usize;
        let skip_frames = ((position - self.pts).as_micros() as u64 * self.sample_rate as u64
            / 1_000_000) as usize;
        let skip = (skip_frames * channels).min(self.data.len());
        self.data.drain(..skip);
        self.pts = position;
        !self.data.is_empty()
    }
}

impl std::fmt::Debug for AudioBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioBlock")
            .field("pts", &self.pts)
            .field("data_len", &self.data.len())
            .field("sample_rate", &self.sample_rate)
            .field("channels", &self.channels)
            .field("generation", &self.generation)
            .finish()
    }
}

/// Metadata about the loaded media.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaInfo {
    /// Total duration of the media
    pub duration: Duration,
    /// Video frame rate (frames per second)
    pub frame_rate: f32,
    pub width: u32,
    pub height: u32,
    /// Audio sample rate, if the media has audio
    pub sample_rate: Option<u32>,
    /// Audio channel count, if the media has audio
    pub channels: Option<u16>,
}

impl MediaInfo {
    /// Returns the frame duration based on frame rate.
    pub fn frame_duration(&self) -> Duration {
        if self.frame_rate <= 0.0 || !self.frame_rate.is_finite() {
            return Duration::from_millis(33); // Default to ~30fps
        }
        Duration::from_secs_f64(1.0 / self.frame_rate as f64)
    }

    /// Last timestamp a seek may resolve to.
    pub fn last_valid_timestamp(&self) -> Duration {
        self.duration
    }

    pub fn has_audio(&self) -> bool {
        self.sample_rate.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_block_duration() {
        let block = AudioBlock::new(Duration::from_secs(2), vec![0.0; 48_000 * 2], 48_000, 2);
        assert_eq!(block.sample_count(), 48_000);
        assert_eq!(MediaUnit::duration(&block), Duration::from_secs(1));
        assert_eq!(block.end_pts(), Duration::from_secs(3));
    }

    #[test]
    fn test_trim_front() {
        let mut block = AudioBlock::new(Duration::from_secs(1), vec![0.5; 4_800 * 2], 48_000, 2);
        assert!(block.trim_front(Duration::from_millis(1_050)));
        assert_eq!(block.pts, Duration::from_millis(1_050));
        assert_eq!(block.sample_count(), 2_400);
        assert_eq!(block.end_pts(), Duration::from_millis(1_100));

        assert!(!block.trim_front(Duration::from_secs(2)));
    }

    #[test]
    fn test_frame_duration_fallback() {
        let mut info = MediaInfo {
            duration: Duration::from_secs(60),
            frame_rate: 24.0,
            width: 16,
            height: 16,
            sample_rate: Some(48_000),
            channels: Some(2),
        };
        assert_eq!(info.frame_duration(), Duration::from_secs_f64(1.0 / 24.0));

        info.frame_rate = 0.0;
        assert_eq!(info.frame_duration(), Duration::from_millis(33));
    }
}
