//! scrubsync-core: synchronized audio/video playback for preview and edit tools.
//!
//! The engine decodes a media file into independent audio and video
//! streams, plays audio through an output device that acts as the master
//! clock, and presents video frames against that clock with drift
//! correction. It contains:
//!
//! - Decoding: [`decoder`] (backend seam, synthetic source, FFmpeg backend)
//! - Data plane: [`frame_queue`], [`clock`], [`audio`], [`audio_output`], [`render`]
//!   (device buffering in [`ring_buffer`] and [`resample`])
//! - Control plane: [`sync`], [`seek`], [`segment`], [`session`]
//! - Facade: [`engine`] with its [`events`] channel
//!
//! This crate has **no UI dependency**. Frames go to a [`FramePresenter`]
//! and notifications come back as [`EngineEvent`]s on a channel the UI
//! drains from its own loop.

pub mod audio;
pub mod audio_output;
pub mod clock;
pub mod config;
pub mod decode_thread;
pub mod decoder;
pub mod engine;
pub mod error;
pub mod events;
pub mod frame_queue;
pub mod media;
pub mod render;
pub mod resample;
pub mod ring_buffer;
pub mod seek;
pub mod segment;
pub mod session;
pub mod sync;

pub use audio::{AudioHandle, AudioSink, NullSink, PacedSink, SinkControl};
pub use clock::MasterClock;
pub use config::{EngineConfig, NotifyConfig, QueueConfig, SegmentConfig, SyncConfig};
pub use decoder::{MediaStreams, StreamDecoder, SyntheticConfig, SyntheticMedia};
pub use engine::PlaybackEngine;
pub use error::{DecodeError, EngineError, ErrorCategory, Result, SinkError};
pub use events::{EngineEvent, EventReceiver, PlaybackState};
pub use media::{AudioBlock, MediaInfo, MediaUnit, PixelFormat, Plane, VideoFrame};
pub use render::{FramePresenter, Pacer};
pub use segment::{SegmentBounds, VisibleWindow};
pub use sync::{SyncController, SyncSnapshot};
