//! Error types for the playback engine.
//!
//! Recoverable per-unit problems (a corrupt packet, an out-of-order frame)
//! never surface through these types to the caller: decode workers log and
//! skip them. Only conditions that end or degrade playback reach the UI, and
//! they do so as [`ErrorCategory`] events rather than as unwinding errors.

use std::time::Duration;

/// Result alias carrying [`EngineError`].
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors returned by engine operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    /// The media file could not be opened or demuxed at all.
    #[error("failed to open media: {0}")]
    Open(String),
    /// The container has no decodable video stream.
    #[error("no video stream found")]
    NoVideoStream,
    /// The decode layer reported an unrecoverable failure.
    #[error("decode failed: {0}")]
    Decode(String),
    /// The audio output device could not be opened.
    #[error("audio device unavailable: {0}")]
    Device(String),
    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// An operation that needs loaded media was called before `load`.
    #[error("no media loaded")]
    NotLoaded,
    /// A worker thread could not be started.
    #[error("failed to spawn {0} thread")]
    Spawn(String),
}

/// Errors reported by a [`StreamDecoder`](crate::decoder::StreamDecoder).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeError {
    /// A single packet could not be decoded; the unit is skipped.
    #[error("corrupt packet at {position:?}: {reason}")]
    Corrupt {
        /// Stream position of the packet, if known
        position: Option<Duration>,
        /// Backend message
        reason: String,
    },
    /// The stream can no longer be decoded.
    #[error("fatal stream error: {0}")]
    Fatal(String),
    /// Repositioning the demux cursor failed.
    #[error("seek failed: {0}")]
    Seek(String),
}

impl From<DecodeError> for EngineError {
    fn from(err: DecodeError) -> Self {
        match err {
            DecodeError::Fatal(msg) | DecodeError::Seek(msg) => EngineError::Decode(msg),
            corrupt @ DecodeError::Corrupt { .. } => EngineError::Decode(corrupt.to_string()),
        }
    }
}

/// Errors reported by an [`AudioSink`](crate::audio::AudioSink).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SinkError {
    /// The output device went away.
    #[error("audio device disconnected")]
    Disconnected,
    /// The backend rejected the stream or the write.
    #[error("audio backend error: {0}")]
    Backend(String),
}

impl From<SinkError> for EngineError {
    fn from(err: SinkError) -> Self {
        EngineError::Device(err.to_string())
    }
}

/// Coarse error category delivered to the UI layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// The file or a stream inside it can no longer be decoded.
    DecodeFailure,
    /// Audio output failed; playback continues video-only.
    DeviceUnavailable,
    /// The video stream is exhausted.
    EndOfStream,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::DecodeFailure => write!(f, "decode failure"),
            ErrorCategory::DeviceUnavailable => write!(f, "device unavailable"),
            ErrorCategory::EndOfStream => write!(f, "end of stream"),
        }
    }
}

/// Extracts a readable message from a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
