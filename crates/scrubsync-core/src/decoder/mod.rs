//! Decoder adapter: the seam between the engine and a demux/decode library.
//!
//! A backend hands the engine one [`StreamDecoder`] per elementary stream.
//! Each decoder is owned by exactly one decode worker, which pulls units out
//! of it and pushes them into that stream's bounded queue. Decoders never
//! touch the queues or the master clock themselves.

use std::path::Path;
use std::time::Duration;

use crate::error::{DecodeError, Result};
use crate::media::{AudioBlock, MediaInfo, MediaUnit, VideoFrame};

#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;
pub mod synthetic;

pub use synthetic::{FaultPlan, SyntheticConfig, SyntheticMedia};

/// Sample rate audio is resampled to before it reaches the output driver.
pub const DEFAULT_OUTPUT_SAMPLE_RATE: u32 = 48_000;

/// A decoder for one elementary stream.
pub trait StreamDecoder: Send {
    /// What this stream decodes to.
    type Unit: MediaUnit;

    /// Decodes the next unit in presentation order.
    ///
    /// Returns `Ok(None)` when no unit is available; callers check
    /// [`is_eof`](Self::is_eof) to tell end of stream from a transient gap.
    /// [`DecodeError::Corrupt`] covers a single bad packet and the caller may
    /// keep decoding afterwards.
    fn decode_next(&mut self) -> std::result::Result<Option<Self::Unit>, DecodeError>;

    /// Repositions the demux cursor to the nearest keyframe at or before
    /// `position`. Units decoded afterwards may start before `position`.
    fn seek(&mut self, position: Duration) -> std::result::Result<(), DecodeError>;

    /// Returns true once the stream is exhausted.
    fn is_eof(&self) -> bool;

    /// Short name used in log lines.
    fn label(&self) -> &'static str {
        "stream"
    }
}

impl<D: StreamDecoder + ?Sized> StreamDecoder for Box<D> {
    type Unit = D::Unit;

    fn decode_next(&mut self) -> std::result::Result<Option<Self::Unit>, DecodeError> {
        (**self).decode_next()
    }

    fn seek(&mut self, position: Duration) -> std::result::Result<(), DecodeError> {
        (**self).seek(position)
    }

    fn is_eof(&self) -> bool {
        (**self).is_eof()
    }

    fn label(&self) -> &'static str {
        (**self).label()
    }
}

pub type BoxedVideoDecoder = Box<dyn StreamDecoder<Unit = VideoFrame>>;
pub type BoxedAudioDecoder = Box<dyn StreamDecoder<Unit = AudioBlock>>;

/// Everything a backend produces for one opened media file.
pub struct MediaStreams {
    pub info: MediaInfo,
    pub video: BoxedVideoDecoder,
    /// None when the media has no audio track
    pub audio: Option<BoxedAudioDecoder>,
}

impl std::fmt::Debug for MediaStreams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaStreams")
            .field("info", &self.info)
            .field("has_audio", &self.audio.is_some())
            .finish()
    }
}

/// Opens a media file with the FFmpeg backend.
#[cfg(feature = "ffmpeg")]
pub fn open_media(path: &Path) -> Result<MediaStreams> {
    ffmpeg::open(path, DEFAULT_OUTPUT_SAMPLE_RATE)
}

/// Opens a media file with the FFmpeg backend.
///
/// This build has no decode backend, so every path fails to open.
#[cfg(not(feature = "ffmpeg"))]
pub fn open_media(path: &Path) -> Result<MediaStreams> {
    Err(crate::error::EngineError::Open(format!(
        "{}: built without the `ffmpeg` feature",
        path.display()
    )))
}

/// Returns true if `err` should stop the stream rather than skip one unit.
pub(crate) fn is_fatal(err: &DecodeError) -> bool {
    !matches!(err, DecodeError::Corrupt { .. })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_corrupt_is_not_fatal() {
        assert!(!is_fatal(&DecodeError::Corrupt {
            position: None,
            reason: "crc mismatch".into()
        }));
        assert!(is_fatal(&DecodeError::Fatal("eof in header".into())));
        assert!(is_fatal(&DecodeError::Seek("not seekable".into())));
    }

    #[cfg(not(feature = "ffmpeg"))]
    #[test]
    fn test_open_without_backend_fails() {
        use crate::error::EngineError;
        let err = open_media(Path::new("clip.mp4")).unwrap_err();
        assert!(matches!(err, EngineError::Open(_)));
    }
}
