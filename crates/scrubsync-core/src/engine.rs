//! The public playback engine.
//!
//! [`PlaybackEngine`] is what a UI talks to. It loads media into a
//! [`PlaybackSession`] (two decode workers, the audio output driver and the
//! render loop, all sharing one [`SessionContext`]) and forwards user
//! commands to it. Everything the UI needs to hear about arrives on the
//! [`EventReceiver`] returned by [`PlaybackEngine::events`].
//!
//! ```no_run
//! use scrubsync_core::{EngineConfig, PlaybackEngine, VideoFrame};
//!
//! let mut engine = PlaybackEngine::new(EngineConfig::default(), |frame: &VideoFrame| {
//!     let _planes = &frame.planes; // upload to a texture
//! })?;
//! engine.load("clip.mp4")?;
//! engine.set_segment_bounds(12.0, 18.5)?;
//! engine.seek(12.0)?;
//! engine.play()?;
//! # Ok::<(), scrubsync_core::EngineError>(())
//! ```

use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use crate::audio::{AudioHandle, AudioSink};
use crate::audio_output::AudioOutput;
use crate::config::EngineConfig;
use crate::decode_thread::DecodeWorker;
use crate::decoder::{self, MediaStreams};
use crate::error::{EngineError, ErrorCategory, Result, SinkError};
use crate::events::{self, EngineEvent, EventReceiver, EventSender, PlaybackState};
use crate::media::MediaInfo;
use crate::render::{FramePresenter, RenderLoop, SharedPresenter, SystemPacer};
use crate::seek::{SeekController, SeekOutcome};
use crate::segment::{SegmentBounds, VisibleWindow};
use crate::session::{spawn_guarded, SessionContext};
use crate::sync::{SyncController, SyncSnapshot};

/// Opens the audio device for a freshly loaded file.
///
/// Called on the audio output thread, which then owns the sink for the
/// rest of the session.
pub type SinkFactory =
    Arc<dyn Fn(&MediaInfo) -> std::result::Result<Box<dyn AudioSink>, SinkError> + Send + Sync>;

/// Default device: cpal when built with it, otherwise a paced virtual sink.
fn default_sink(info: &MediaInfo) -> std::result::Result<Box<dyn AudioSink>, SinkError> {
    #[cfg(feature = "cpal")]
    {
        let rate = info.sample_rate.unwrap_or(decoder::DEFAULT_OUTPUT_SAMPLE_RATE);
        let channels = info.channels.unwrap_or(2);
        Ok(Box::new(crate::audio::CpalSink::open(rate, channels)?))
    }
    #[cfg(not(feature = "cpal"))]
    {
        let _ = info;
        Ok(Box::new(crate::audio::PacedSink::new()))
    }
}

/// Runs the factory for media with audio, reporting a failure once.
fn open_sink(factory: &SinkFactory, ctx: &SessionContext) -> Option<Box<dyn AudioSink>> {
    if !ctx.info.has_audio() {
        return None;
    }
    match factory(&ctx.info) {
        Ok(sink) => Some(sink),
        Err(err) => {
            tracing::warn!("Audio device unavailable: {}; playing video-only", err);
            ctx.events.error(
                ErrorCategory::DeviceUnavailable,
                format!("audio output unavailable: {err}"),
            );
            None
        }
    }
}

/// Converts UI seconds to a timeline position inside `[0, limit]`.
fn clamp_secs(secs: f64, limit: Duration) -> Duration {
    if secs.is_nan() || secs <= 0.0 {
        Duration::ZERO
    } else if secs >= limit.as_secs_f64() {
        limit
    } else {
        Duration::from_secs_f64(secs)
    }
}

/// Threads and shared state of one loaded file.
pub struct PlaybackSession {
    ctx: SessionContext,
    seek: Arc<SeekController>,
    video_worker: Option<DecodeWorker>,
    audio_worker: Option<DecodeWorker>,
    output_thread: Option<JoinHandle<()>>,
    render_thread: Option<JoinHandle<()>>,
}

impl PlaybackSession {
    fn start(
        config: EngineConfig,
        streams: MediaStreams,
        presenter: SharedPresenter,
        sink_factory: &SinkFactory,
        audio: AudioHandle,
        events: EventSender,
    ) -> Result<Self> {
        let MediaStreams {
            info,
            video,
            audio: audio_decoder,
        } = streams;

        let ctx = SessionContext::new(info, config, events.clone());
        let seek = Arc::new(SeekController::new(ctx.clone()));
        // Dropping a partially started session tears down what did start
        let mut session = Self {
            ctx: ctx.clone(),
            seek: Arc::clone(&seek),
            video_worker: None,
            audio_worker: None,
            output_thread: None,
            render_thread: None,
        };

        session.video_worker = Some(DecodeWorker::spawn(
            "scrubsync-video-decode",
            video,
            Arc::clone(&ctx.video_queue),
            &ctx.transport,
            Arc::clone(&seek),
            events.clone(),
            true,
        )?);
        if let Some(decoder) = audio_decoder {
            session.audio_worker = Some(DecodeWorker::spawn(
                "scrubsync-audio-decode",
                decoder,
                Arc::clone(&ctx.audio_queue),
                &ctx.transport,
                Arc::clone(&seek),
                events.clone(),
                false,
            )?);
        }

        let factory = Arc::clone(sink_factory);
        let output_ctx = ctx.clone();
        let fallback_ctx = ctx.clone();
        let fallback_audio = audio.clone();
        session.output_thread = Some(spawn_guarded(
            "scrubsync-audio-output",
            ErrorCategory::DeviceUnavailable,
            events.clone(),
            // The failed sink is already dropped; keep the clock moving without it
            move || {
                tracing::warn!("Audio output failed; continuing video-only on wall clock");
                AudioOutput::new(fallback_ctx, None, fallback_audio).run();
            },
            move || {
                let sink = open_sink(&factory, &output_ctx);
                AudioOutput::new(output_ctx, sink, audio).run();
            },
        )?);

        let render = RenderLoop::with_shared(ctx.clone(), presenter, SystemPacer);
        let render_events = events.clone();
        session.render_thread = Some(spawn_guarded(
            "scrubsync-render",
            ErrorCategory::DecodeFailure,
            events,
            move || {
                render_events.transition(PlaybackState::Error);
            },
            move || render.run(),
        )?);

        Ok(session)
    }

    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }
}

impl Drop for PlaybackSession {
    fn drop(&mut self) {
        self.ctx.shutdown();
        // Workers join in their own Drop
        self.video_worker.take();
        self.audio_worker.take();
        for handle in [self.output_thread.take(), self.render_thread.take()]
            .into_iter()
            .flatten()
        {
            if handle.join().is_err() {
                tracing::warn!("Session thread exited abnormally");
            }
        }
        tracing::debug!("Playback session closed");
    }
}

/// Synchronized audio/video playback for one media file at a time.
pub struct PlaybackEngine {
    config: EngineConfig,
    presenter: SharedPresenter,
    sink_factory: SinkFactory,
    audio: AudioHandle,
    events_tx: EventSender,
    events_rx: EventReceiver,
    session: Option<PlaybackSession>,
}

impl PlaybackEngine {
    /// Creates an engine that hands frames to `presenter`.
    pub fn new(config: EngineConfig, presenter: impl FramePresenter + 'static) -> Result<Self> {
        config.validate()?;
        let (events_tx, events_rx) = events::channel();
        Ok(Self {
            config,
            presenter: Arc::new(Mutex::new(Box::new(presenter))),
            sink_factory: Arc::new(default_sink),
            audio: AudioHandle::new(),
            events_tx,
            events_rx,
            session: None,
        })
    }

    /// Replaces how the audio device is opened for each loaded file.
    pub fn with_sink_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn(&MediaInfo) -> std::result::Result<Box<dyn AudioSink>, SinkError>
            + Send
            + Sync
            + 'static,
    {
        self.sink_factory = Arc::new(factory);
        self
    }

    /// Opens `path` with the decode backend and starts a paused session.
    pub fn load(&mut self, path: impl AsRef<Path>) -> Result<MediaInfo> {
        self.close();
        let path = path.as_ref();
        tracing::info!("Loading {}", path.display());
        match decoder::open_media(path) {
            Ok(streams) => self.load_streams(streams),
            Err(err) => {
                tracing::error!("Failed to open {}: {}", path.display(), err);
                self.fail(&err);
                Err(err)
            }
        }
    }

    /// Starts a paused session on already-opened streams.
    pub fn load_streams(&mut self, streams: MediaStreams) -> Result<MediaInfo> {
        self.close();
        let info = streams.info.clone();
        tracing::info!(
            "Media: {:?}, {:.2} fps, {}x{}, audio: {}",
            info.duration,
            info.frame_rate,
            info.width,
            info.height,
            info.sample_rate
                .map_or_else(|| "none".to_string(), |rate| format!("{rate} Hz"))
        );

        match PlaybackSession::start(
            self.config.clone(),
            streams,
            Arc::clone(&self.presenter),
            &self.sink_factory,
            self.audio.clone(),
            self.events_tx.clone(),
        ) {
            Ok(session) => {
                self.session = Some(session);
                self.events_tx.transition(PlaybackState::Ready);
                Ok(info)
            }
            Err(err) => {
                self.fail(&err);
                Err(err)
            }
        }
    }

    fn fail(&self, err: &EngineError) {
        self.events_tx
            .error(ErrorCategory::DecodeFailure, err.to_string());
        self.events_tx.transition(PlaybackState::Error);
    }

    fn session(&self) -> Result<&PlaybackSession> {
        self.session.as_ref().ok_or(EngineError::NotLoaded)
    }

    /// Starts or resumes playback. After the end of the media, playback
    /// restarts from the segment start (or the beginning).
    pub fn play(&mut self) -> Result<()> {
        let session = self.session()?;
        if self.events_tx.state() == PlaybackState::Ended {
            let restart = session
                .ctx
                .segment
                .bounds()
                .map_or(Duration::ZERO, |b| b.start);
            session.seek.request(restart);
        }
        session.ctx.transport.play();
        Ok(())
    }

    pub fn pause(&mut self) -> Result<()> {
        self.session()?.ctx.transport.pause();
        Ok(())
    }

    /// Seeks to `secs`, clamped to `[0, duration]`. Returns the target.
    pub fn seek(&mut self, secs: f64) -> Result<Duration> {
        let session = self.session()?;
        let target = clamp_secs(secs, session.ctx.info.last_valid_timestamp());
        if target.as_secs_f64() != secs {
            tracing::debug!("Seek target {:.3}s clamped to {:?}", secs, target);
        }
        if session.seek.request(target) == SeekOutcome::Coalesced {
            tracing::trace!("Seek to {:?} coalesced", target);
        }
        Ok(target)
    }

    /// Blocks until no seek is in flight. Returns false on timeout.
    pub fn wait_for_seek(&self, timeout: Duration) -> Result<bool> {
        Ok(self.session()?.seek.wait_idle(timeout))
    }

    pub fn is_seeking(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|session| session.seek.is_seeking())
    }

    /// Sets output volume (0-100, clamped).
    pub fn set_volume(&self, volume: u32) {
        self.audio.set_volume(volume);
    }

    pub fn set_muted(&self, muted: bool) {
        self.audio.set_muted(muted);
    }

    /// Sets the A/V sync offset. Applies to the next frame, and to files
    /// loaded later.
    pub fn set_sync_offset(&mut self, offset_ms: i64) {
        self.config.sync.offset_ms = offset_ms;
        if let Some(session) = &self.session {
            session.ctx.sync.set_sync_offset_ms(offset_ms);
        }
    }

    pub fn sync_offset(&self) -> i64 {
        self.session
            .as_ref()
            .map_or(self.config.sync.offset_ms, |s| s.ctx.sync.sync_offset_ms())
    }

    /// Sets the segment playback stops at, in seconds.
    pub fn set_segment_bounds(&self, start: f64, end: f64) -> Result<SegmentBounds> {
        let session = self.session()?;
        let duration = session.ctx.info.duration;
        Ok(session
            .ctx
            .segment
            .set_segment_bounds(clamp_secs(start, duration), clamp_secs(end, duration)))
    }

    /// Drags the segment start. Returns None when no segment is set.
    pub fn drag_segment_start(&self, secs: f64) -> Result<Option<SegmentBounds>> {
        let session = self.session()?;
        let position = clamp_secs(secs, session.ctx.info.duration);
        Ok(session.ctx.segment.drag_segment_start(position))
    }

    /// Drags the segment end. Returns None when no segment is set.
    pub fn drag_segment_end(&self, secs: f64) -> Result<Option<SegmentBounds>> {
        let session = self.session()?;
        let position = clamp_secs(secs, session.ctx.info.duration);
        Ok(session.ctx.segment.drag_segment_end(position))
    }

    pub fn clear_segment(&self) -> Result<()> {
        self.session()?.ctx.segment.clear();
        Ok(())
    }

    pub fn segment_bounds(&self) -> Option<SegmentBounds> {
        self.session.as_ref()?.ctx.segment.bounds()
    }

    pub fn visible_window(&self) -> Option<VisibleWindow> {
        Some(self.session.as_ref()?.ctx.segment.window())
    }

    /// Event stream for the UI. Clones share one queue.
    pub fn events(&self) -> EventReceiver {
        self.events_rx.clone()
    }

    /// Drains pending events without blocking.
    pub fn poll_events(&self) -> Vec<EngineEvent> {
        self.events_rx.try_iter().collect()
    }

    /// Presentation time of the last shown frame.
    pub fn position(&self) -> Duration {
        self.session
            .as_ref()
            .map_or(Duration::ZERO, |s| s.ctx.transport.position())
    }

    /// Current master clock value.
    pub fn clock_time(&self) -> Duration {
        self.session
            .as_ref()
            .map_or(Duration::ZERO, |s| s.ctx.clock.now())
    }

    pub fn state(&self) -> PlaybackState {
        self.events_tx.state()
    }

    pub fn media_info(&self) -> Option<&MediaInfo> {
        self.session.as_ref().map(|s| &s.ctx.info)
    }

    /// Sync controller of the loaded file, for tuning thresholds.
    pub fn sync(&self) -> Option<Arc<SyncController>> {
        self.session.as_ref().map(|s| Arc::clone(&s.ctx.sync))
    }

    pub fn sync_snapshot(&self) -> Option<SyncSnapshot> {
        self.session.as_ref().map(|s| s.ctx.sync.snapshot())
    }

    pub fn audio_handle(&self) -> AudioHandle {
        self.audio.clone()
    }

    /// Stops and joins every session thread. The engine can load again.
    pub fn close(&mut self) {
        if let Some(session) = self.session.take() {
            tracing::info!("Closing session. {}", session.ctx.sync.snapshot());
            drop(session);
            self.events_tx.transition(PlaybackState::Idle);
        }
    }
}

impl Drop for PlaybackEngine {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::VideoFrame;

    #[test]
    fn test_clamp_secs() {
        let limit = Duration::from_secs(60);
        assert_eq!(clamp_secs(-3.0, limit), Duration::ZERO);
        assert_eq!(clamp_secs(f64::NAN, limit), Duration::ZERO);
        assert_eq!(clamp_secs(200.0, limit), limit);
        assert_eq!(clamp_secs(f64::INFINITY, limit), limit);
        assert_eq!(clamp_secs(1.5, limit), Duration::from_millis(1_500));
    }

    #[test]
    fn test_commands_require_loaded_media() {
        let mut engine = PlaybackEngine::new(EngineConfig::default(), |_: &VideoFrame| {}).unwrap();
        assert_eq!(engine.play(), Err(EngineError::NotLoaded));
        assert_eq!(engine.seek(1.0), Err(EngineError::NotLoaded));
        assert!(engine.set_segment_bounds(1.0, 2.0).is_err());
        assert_eq!(engine.state(), PlaybackState::Idle);

        // Offset set before loading is kept for the next file
        engine.set_sync_offset(-120);
        assert_eq!(engine.sync_offset(), -120);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = EngineConfig::default();
        config.sync.drift_window = 0;
        assert!(matches!(
            PlaybackEngine::new(config, |_: &VideoFrame| {}),
            Err(EngineError::InvalidConfig(_))
        ));
    }

    #[cfg(not(feature = "ffmpeg"))]
    #[test]
    fn test_open_failure_is_terminal_event() {
        let mut engine = PlaybackEngine::new(EngineConfig::default(), |_: &VideoFrame| {}).unwrap();
        assert!(matches!(
            engine.load("/nonexistent/clip.mp4"),
            Err(EngineError::Open(_))
        ));
        assert_eq!(engine.state(), PlaybackState::Error);
        assert!(engine.poll_events().iter().any(|e| matches!(
            e,
            EngineEvent::PlaybackError {
                category: ErrorCategory::DecodeFailure,
                ..
            }
        )));
    }
}
