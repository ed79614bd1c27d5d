//! Render loop: presents video frames against the master clock.
//!
//! For every dequeued frame the loop measures drift against the clock,
//! lets the [`SyncController`](crate::sync::SyncController) decide between
//! render, wait and drop, checks the segment end, and hands the frame to a
//! [`FramePresenter`]. Early frames are waited for in short slices so a
//! pause, seek or stop interrupts the wait promptly.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::ErrorCategory;
use crate::events::PlaybackState;
use crate::frame_queue::QueueItem;
use crate::media::{MediaUnit, VideoFrame};
use crate::session::SessionContext;
use crate::sync::{FrameDecision, SYNC_DRIFT_THRESHOLD_MS};

/// Longest single sleep while waiting for an early frame.
const MAX_WAIT_SLICE: Duration = Duration::from_millis(10);

/// How long to block on an empty queue before re-checking the transport.
const POP_TIMEOUT: Duration = Duration::from_millis(50);

/// Receives frames at their presentation time.
pub trait FramePresenter: Send {
    fn present(&mut self, frame: &VideoFrame);
}

impl<F> FramePresenter for F
where
    F: FnMut(&VideoFrame) + Send,
{
    fn present(&mut self, frame: &VideoFrame) {
        self(frame)
    }
}

/// Presenter shared across sessions of one engine.
pub type SharedPresenter = Arc<Mutex<Box<dyn FramePresenter>>>;

/// Sleeps on behalf of the render loop.
pub trait Pacer {
    fn sleep(&mut self, duration: Duration);
}

/// Real-time pacing with `thread::sleep`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPacer;

impl Pacer for SystemPacer {
    fn sleep(&mut self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// What became of one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Presented,
    /// Skipped to catch up with the clock
    Dropped,
    /// Timestamp before the previously presented frame
    OutOfOrder,
    /// Decoded before the latest seek
    Stale,
    /// Kept for later: playback paused before it was due
    Held,
    /// The session is shutting down
    Stopped,
}

enum WaitResult {
    Due(i64),
    Paused,
    Superseded,
    Stopped,
}

pub struct RenderLoop<P: Pacer = SystemPacer> {
    ctx: SessionContext,
    presenter: SharedPresenter,
    pacer: P,
    /// Frame taken off the queue but not yet presented
    held: Option<VideoFrame>,
    generation: u64,
    last_pts: Option<Duration>,
    /// Generation in which a frame has been presented
    presented_generation: Option<u64>,
    /// Generation whose end marker was consumed while paused
    ended_generation: Option<u64>,
    last_notified: Option<Duration>,
    /// Frames between periodic drift log lines
    log_interval: u64,
    frames_since_log: u64,
}

impl<P: Pacer> RenderLoop<P> {
    pub fn new(ctx: SessionContext, presenter: impl FramePresenter + 'static, pacer: P) -> Self {
        Self::with_shared(ctx, Arc::new(Mutex::new(Box::new(presenter))), pacer)
    }

    pub fn with_shared(ctx: SessionContext, presenter: SharedPresenter, pacer: P) -> Self {
        let log_interval = (ctx.info.frame_rate.round() as u64).max(1);
        let generation = ctx.transport.generation();
        Self {
            ctx,
            presenter,
            pacer,
            held: None,
            generation,
            last_pts: None,
            presented_generation: None,
            ended_generation: None,
            last_notified: None,
            log_interval,
            frames_since_log: 0,
        }
    }

    /// Thread body: runs until the transport stops.
    pub fn run(mut self) {
        tracing::info!(
            "Render loop started ({:.2} fps, drift log every {} frames)",
            self.ctx.info.frame_rate,
            self.log_interval
        );

        while !self.ctx.transport.is_stopped() {
            if self.ctx.transport.is_paused() {
                self.idle_paused();
                continue;
            }
            let generation = self.ctx.transport.generation();
            if self.ended_generation == Some(generation) {
                self.end_of_stream(generation);
                continue;
            }

            let item = match self.held.take() {
                Some(frame) => Some(QueueItem::Unit(frame)),
                None => self.ctx.video_queue.pop_timeout(POP_TIMEOUT),
            };
            match item {
                Some(QueueItem::Unit(frame)) => {
                    self.handle_frame(frame);
                }
                Some(QueueItem::EndOfStream { generation }) => {
                    if generation == self.ctx.transport.generation() {
                        self.end_of_stream(generation);
                    }
                }
                None => {}
            }
        }

        tracing::info!("Render loop stopped. {}", self.ctx.sync.snapshot());
    }

    /// While paused, show the first frame of a generation that has none yet.
    fn idle_paused(&mut self) {
        let generation = self.ctx.transport.generation();
        if self.held.as_ref().is_some_and(|f| f.generation() != generation) {
            self.held = None;
        }
        if self.presented_generation == Some(generation) {
            self.ctx
                .transport
                .wait_while_paused(Duration::from_millis(50));
            return;
        }

        let item = match self.held.take() {
            Some(frame) => Some(QueueItem::Unit(frame)),
            None => self.ctx.video_queue.pop_timeout(Duration::from_millis(20)),
        };
        match item {
            Some(QueueItem::Unit(frame)) if frame.generation() == generation => {
                tracing::debug!("Preview frame at {:?}", frame.pts);
                self.enter_generation(generation);
                self.present(&frame);
            }
            Some(QueueItem::EndOfStream { generation: ended }) if ended == generation => {
                // Nothing to preview; report the end once playback resumes
                self.ended_generation = Some(generation);
                self.presented_generation = Some(generation);
            }
            _ => {}
        }
    }

    fn enter_generation(&mut self, generation: u64) {
        if self.generation != generation {
            self.generation = generation;
            self.last_pts = None;
            self.last_notified = None;
            self.frames_since_log = 0;
        }
    }

    /// Runs one frame through drift correction and presents it if due.
    pub fn handle_frame(&mut self, frame: VideoFrame) -> FrameOutcome {
        let generation = self.ctx.transport.generation();
        if frame.generation() != generation {
            tracing::trace!("Discarding stale frame seq={} pts={:?}", frame.sequence, frame.pts);
            return FrameOutcome::Stale;
        }
        self.enter_generation(generation);

        if let Some(last) = self.last_pts {
            if frame.pts < last {
                tracing::warn!(
                    "Out-of-order frame seq={} pts={:?} after {:?}, dropping",
                    frame.sequence,
                    frame.pts,
                    last
                );
                self.ctx.sync.record_dropped();
                return FrameOutcome::OutOfOrder;
            }
        }

        let ctx = &self.ctx;
        let audio_time = ctx.clock.now();
        let mut drift_us = ctx.sync.drift_us(audio_time, frame.pts);

        let queue = &ctx.video_queue;
        let clock = &ctx.clock;
        let sync = &ctx.sync;
        let decision = sync.decide(drift_us, || {
            queue
                .peek_with(|next| {
                    next.generation() == generation && sync.drift_us(clock.now(), next.pts) >= 0
                })
                .unwrap_or(false)
        });

        match decision {
            FrameDecision::Drop => {
                let avg = self.ctx.sync.record(frame.sequence, drift_us);
                self.ctx.sync.record_dropped();
                self.log_drift(&frame, audio_time, drift_us, avg);
                tracing::trace!("Dropped late frame seq={}", frame.sequence);
                return FrameOutcome::Dropped;
            }
            FrameDecision::Wait(_) => match self.wait_until_due(&frame, generation) {
                WaitResult::Due(drift) => drift_us = drift,
                WaitResult::Paused => {
                    self.held = Some(frame);
                    return FrameOutcome::Held;
                }
                WaitResult::Superseded => return FrameOutcome::Stale,
                WaitResult::Stopped => return FrameOutcome::Stopped,
            },
            FrameDecision::Render => {}
        }

        if self.ctx.segment.end_reached(frame.pts) {
            tracing::info!("Segment end reached at {:?}, pausing", frame.pts);
            self.ctx.transport.pause();
            self.ctx.events.segment_end_reached(frame.pts);
            self.held = Some(frame);
            return FrameOutcome::Held;
        }

        let avg = self.ctx.sync.record(frame.sequence, drift_us);
        self.present(&frame);
        self.ctx.sync.record_rendered();
        self.log_drift(&frame, self.ctx.clock.now(), drift_us, avg);
        FrameOutcome::Presented
    }

    /// Sleeps in slices until the frame is due.
    fn wait_until_due(&mut self, frame: &VideoFrame, generation: u64) -> WaitResult {
        loop {
            let transport = &self.ctx.transport;
            if transport.is_stopped() {
                return WaitResult::Stopped;
            }
            if transport.generation() != generation {
                return WaitResult::Superseded;
            }
            if transport.is_paused() {
                return WaitResult::Paused;
            }

            let drift_us = self.ctx.sync.drift_us(self.ctx.clock.now(), frame.pts);
            if self.ctx.sync.is_due(drift_us) {
                return WaitResult::Due(drift_us);
            }

            let overhead = self.ctx.sync.scheduling_overhead();
            let remaining = Duration::from_micros(drift_us.unsigned_abs()).saturating_sub(overhead);
            self.pacer
                .sleep(remaining.clamp(Duration::from_micros(500), MAX_WAIT_SLICE));
        }
    }

    fn present(&mut self, frame: &VideoFrame) {
        self.presenter.lock().present(frame);
        self.last_pts = Some(frame.pts);
        self.presented_generation = Some(self.generation);
        self.ctx.transport.set_position(frame.pts);
        self.notify_time(frame.pts);
    }

    /// Emits `TimeChanged` when the position moved at least the interval.
    fn notify_time(&mut self, position: Duration) {
        let interval = self.ctx.config.notify.time_changed_interval();
        let due = match self.last_notified {
            Some(last) => position.saturating_sub(last) >= interval || position < last,
            None => true,
        };
        if due {
            self.last_notified = Some(position);
            self.ctx.events.time_changed(position);
        }
    }

    fn log_drift(&mut self, frame: &VideoFrame, audio_time: Duration, drift_us: i64, avg_us: i64) {
        self.frames_since_log += 1;
        let drift_ms = drift_us as f64 / 1000.0;
        let avg_ms = avg_us as f64 / 1000.0;

        if self.ctx.sync.exceeds_threshold(drift_us) {
            let level_ms = drift_us.abs() / 1000;
            if level_ms > SYNC_DRIFT_THRESHOLD_MS * 2 {
                tracing::warn!(
                    "A/V drift severe: seq={} video={:?} audio={:?} drift_ms={:+.1} avg_ms={:+.1}",
                    frame.sequence,
                    frame.pts,
                    audio_time,
                    drift_ms,
                    avg_ms
                );
            } else {
                tracing::warn!(
                    "A/V drift: seq={} video={:?} audio={:?} drift_ms={:+.1} avg_ms={:+.1}",
                    frame.sequence,
                    frame.pts,
                    audio_time,
                    drift_ms,
                    avg_ms
                );
            }
        } else if self.frames_since_log >= self.log_interval {
            tracing::info!(
                "A/V sync: seq={} video={:?} audio={:?} drift_ms={:+.1} avg_ms={:+.1}",
                frame.sequence,
                frame.pts,
                audio_time,
                drift_ms,
                avg_ms
            );
        } else {
            return;
        }
        self.frames_since_log = 0;
    }

    fn end_of_stream(&mut self, generation: u64) {
        tracing::info!(
            "Video ended at {:?}. {}",
            self.ctx.transport.position(),
            self.ctx.sync.snapshot().quality_summary()
        );
        self.ctx.events.transition(PlaybackState::Ended);
        self.ctx
            .events
            .error(ErrorCategory::EndOfStream, "end of stream");

        while !self.ctx.transport.is_stopped() && self.ctx.transport.generation() == generation {
            self.pacer.sleep(Duration::from_millis(20));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineConfig, SyncConfig};
    use crate::decoder::{SyntheticConfig, SyntheticMedia};
    use crate::events::{self, EngineEvent};
    use crate::media::PixelFormat;

    /// Pacer that moves the master clock instead of sleeping.
    struct ClockPacer {
        ctx: SessionContext,
        slept: Duration,
    }

    impl Pacer for ClockPacer {
        fn sleep(&mut self, duration: Duration) {
            self.slept += duration;
            let generation = self.ctx.transport.generation();
            self.ctx
                .clock
                .advance(generation, self.ctx.clock.now() + duration);
        }
    }

    fn frame(seq: u64, pts_ms: u64, generation: u64) -> VideoFrame {
        let mut frame = VideoFrame::new(
            Duration::from_millis(pts_ms),
            seq,
            Duration::from_millis(40),
            PixelFormat::Rgba,
            1,
            1,
            Vec::new(),
        );
        frame.set_generation(generation);
        frame
    }

    fn render_loop(
        offset_ms: i64,
    ) -> (
        RenderLoop<ClockPacer>,
        SessionContext,
        Arc<Mutex<Vec<u64>>>,
        events::EventReceiver,
    ) {
        let media = SyntheticMedia::new(SyntheticConfig::new(Duration::from_secs(60), 25.0));
        let (events, rx) = events::channel();
        let config = EngineConfig {
            sync: SyncConfig {
                offset_ms,
                ..SyncConfig::default()
            },
            ..EngineConfig::default()
        };
        let ctx = SessionContext::new(media.info(), config, events);
        ctx.transport.play();

        let presented = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&presented);
        let pacer = ClockPacer {
            ctx: ctx.clone(),
            slept: Duration::ZERO,
        };
        let render = RenderLoop::new(
            ctx.clone(),
            move |f: &VideoFrame| sink.lock().push(f.sequence),
            pacer,
        );
        (render, ctx, presented, rx)
    }

    #[test]
    fn test_on_time_frame_is_presented() {
        let (mut render, ctx, presented, _rx) = render_loop(0);
        ctx.clock.reset(0, Duration::from_millis(1_000));
        assert_eq!(render.handle_frame(frame(25, 1_000, 0)), FrameOutcome::Presented);
        assert_eq!(*presented.lock(), vec![25]);
        assert_eq!(ctx.transport.position(), Duration::from_secs(1));
        assert_eq!(render.pacer.slept, Duration::ZERO);
    }

    #[test]
    fn test_early_frame_waits_until_due() {
        let (mut render, ctx, _presented, _rx) = render_loop(0);
        ctx.clock.reset(0, Duration::from_millis(1_000));
        assert_eq!(render.handle_frame(frame(26, 1_040, 0)), FrameOutcome::Presented);
        // Waited out the drift minus scheduling overhead
        assert!(render.pacer.slept >= Duration::from_millis(38));
        let recorded = ctx.sync.drift_window();
        assert!(recorded[0].drift_us >= -2_000 && recorded[0].drift_us <= 0);
    }

    #[test]
    fn test_late_frame_dropped_when_next_is_due() {
        let (mut render, ctx, presented, _rx) = render_loop(0);
        ctx.clock.reset(0, Duration::from_millis(1_000));
        assert!(ctx.video_queue.push(frame(21, 840, 0)));
        assert_eq!(render.handle_frame(frame(20, 800, 0)), FrameOutcome::Dropped);

        // Nothing queued behind it: render anyway
        let _ = ctx.video_queue.try_pop();
        assert_eq!(render.handle_frame(frame(21, 840, 0)), FrameOutcome::Presented);
        assert_eq!(*presented.lock(), vec![21]);
        assert_eq!(ctx.sync.snapshot().frames_dropped, 1);
    }

    #[test]
    fn test_out_of_order_and_stale_frames() {
        let (mut render, ctx, presented, _rx) = render_loop(0);
        ctx.clock.reset(0, Duration::from_millis(1_000));
        render.handle_frame(frame(25, 1_000, 0));
        assert_eq!(render.handle_frame(frame(23, 920, 0)), FrameOutcome::OutOfOrder);
        assert_eq!(render.handle_frame(frame(26, 1_000, 7)), FrameOutcome::Stale);
        assert_eq!(*presented.lock(), vec![25]);
    }

    #[test]
    fn test_offset_applies_to_next_frame() {
        let (mut render, ctx, _presented, _rx) = render_loop(0);
        ctx.clock.reset(0, Duration::from_millis(1_000));
        ctx.sync.set_sync_offset_ms(500);
        ctx.sync.set_sync_offset_ms(40);
        render.handle_frame(frame(26, 1_040, 0));
        // With +40ms the frame is exactly due: no wait
        assert_eq!(render.pacer.slept, Duration::ZERO);
        assert_eq!(ctx.sync.drift_window()[0].drift_us, 0);
    }

    #[test]
    fn test_segment_end_pauses_and_holds_frame() {
        let (mut render, ctx, presented, rx) = render_loop(0);
        ctx.segment
            .set_segment_bounds(Duration::from_secs(9), Duration::from_secs(10));
        ctx.clock.reset(0, Duration::from_millis(9_960));
        render.handle_frame(frame(249, 9_960, 0));
        ctx.clock.reset(0, Duration::from_millis(10_000));
        assert_eq!(render.handle_frame(frame(250, 10_000, 0)), FrameOutcome::Held);

        assert!(ctx.transport.is_paused());
        assert_eq!(*presented.lock(), vec![249]);
        assert!(rx.try_iter().any(|e| e
            == EngineEvent::SegmentEndReached {
                position: Duration::from_secs(10)
            }));

        // Resuming presents the held frame without firing again
        ctx.transport.play();
        let held = render.held.take().unwrap();
        assert_eq!(render.handle_frame(held), FrameOutcome::Presented);
    }

    #[test]
    fn test_time_changed_is_rate_limited() {
        let (mut render, ctx, _presented, rx) = render_loop(0);
        for seq in 0..25 {
            let pts = seq * 40;
            ctx.clock.reset(0, Duration::from_millis(pts));
            render.handle_frame(frame(seq, pts, 0));
        }
        let times: Vec<_> = rx
            .try_iter()
            .filter_map(|e| match e {
                EngineEvent::TimeChanged { position } => Some(position.as_millis()),
                _ => None,
            })
            .collect();
        assert_eq!(times, vec![0, 280, 560, 840]);
    }
}
