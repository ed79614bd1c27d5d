//! Seek controller: `Idle -> Seeking -> Idle`.
//!
//! A seek starts a new generation. Under the controller's lock it flushes
//! both queues into that generation, resets the master clock to the target
//! and tells every decode worker to reposition. Each worker acknowledges
//! once its decoder has moved; the last acknowledgement completes the seek.
//! Requests that arrive meanwhile are coalesced into a single pending
//! target that runs when the in-flight seek completes.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::decode_thread::DecodeCommand;
use crate::events::PlaybackState;
use crate::session::SessionContext;

/// What happened to a seek request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekOutcome {
    /// The seek started immediately
    Started,
    /// Another seek is in flight; this target replaces any pending one
    Coalesced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SeekPhase {
    Idle,
    Seeking {
        generation: u64,
        target: Duration,
        /// Workers that have not acknowledged yet
        outstanding: usize,
    },
}

struct SeekState {
    phase: SeekPhase,
    pending: Option<Duration>,
    /// State to return to once the last seek completes
    resume: PlaybackState,
}

pub struct SeekController {
    ctx: SessionContext,
    state: Mutex<SeekState>,
    idle: Condvar,
}

impl SeekController {
    pub fn new(ctx: SessionContext) -> Self {
        Self {
            ctx,
            state: Mutex::new(SeekState {
                phase: SeekPhase::Idle,
                pending: None,
                resume: PlaybackState::Ready,
            }),
            idle: Condvar::new(),
        }
    }

    /// Requests a seek to `target`, clamped to the media.
    pub fn request(&self, target: Duration) -> SeekOutcome {
        let target = target.min(self.ctx.info.last_valid_timestamp());
        let mut state = self.state.lock();

        if let SeekPhase::Seeking {
            target: in_flight, ..
        } = state.phase
        {
            if let Some(replaced) = state.pending.replace(target) {
                tracing::debug!("Seek to {:?} superseded by {:?}", replaced, target);
            }
            tracing::debug!(
                "Seek to {:?} queued behind in-flight seek to {:?}",
                target,
                in_flight
            );
            return SeekOutcome::Coalesced;
        }

        state.resume = self.ctx.events.state();
        self.start(&mut state, target);
        SeekOutcome::Started
    }

    fn start(&self, state: &mut SeekState, target: Duration) {
        let ctx = &self.ctx;
        ctx.events.transition(PlaybackState::Seeking);

        let generation = ctx.transport.generation().wrapping_add(1);
        // Clock first: the output driver picks up the new generation from the
        // transport and must find the clock already reset
        ctx.clock.reset(generation, target);
        let frames = ctx.video_queue.flush(generation);
        let blocks = ctx.audio_queue.flush(generation);
        ctx.transport.set_generation(generation);
        ctx.sync.reset();
        ctx.segment.rearm(target);
        ctx.transport.set_position(target);

        let outstanding = ctx
            .transport
            .broadcast(DecodeCommand::Seek { generation, target });

        tracing::info!(
            "Seek to {:?} (generation {}): flushed {} frames, {} audio blocks, {} workers",
            target,
            generation,
            frames,
            blocks,
            outstanding
        );

        state.phase = SeekPhase::Seeking {
            generation,
            target,
            outstanding,
        };
        if outstanding == 0 {
            self.finish(state);
        }
    }

    /// Called by a decode worker once its decoder has repositioned.
    pub fn acknowledge(&self, generation: u64) {
        let mut state = self.state.lock();
        let done = match &mut state.phase {
            SeekPhase::Seeking {
                generation: current,
                outstanding,
                ..
            } if *current == generation => {
                *outstanding = outstanding.saturating_sub(1);
                *outstanding == 0
            }
            // Acknowledgement for a seek that was already superseded
            _ => false,
        };
        if done {
            self.finish(&mut state);
        }
    }

    /// Called when a decode worker died; it will never acknowledge.
    pub fn worker_lost(&self) {
        let mut state = self.state.lock();
        let done = match &mut state.phase {
            SeekPhase::Seeking { outstanding, .. } => {
                *outstanding = outstanding.saturating_sub(1);
                *outstanding == 0
            }
            SeekPhase::Idle => false,
        };
        if done {
            self.finish(&mut state);
        }
    }

    fn finish(&self, state: &mut SeekState) {
        if let Some(next) = state.pending.take() {
            self.start(state, next);
            return;
        }
        let SeekPhase::Seeking { target, .. } = state.phase else {
            return;
        };
        state.phase = SeekPhase::Idle;

        let transport = &self.ctx.transport;
        let resumed = if !transport.is_paused() {
            PlaybackState::Playing
        } else if state.resume == PlaybackState::Ready {
            PlaybackState::Ready
        } else {
            PlaybackState::Paused
        };
        self.ctx.events.transition(resumed);
        self.ctx.events.seek_completed(target);
        tracing::debug!("Seek to {:?} complete, {:?}", target, resumed);
        self.idle.notify_all();
    }

    pub fn is_seeking(&self) -> bool {
        matches!(self.state.lock().phase, SeekPhase::Seeking { .. })
    }

    /// Target of the in-flight seek, if any.
    pub fn target(&self) -> Option<Duration> {
        match self.state.lock().phase {
            SeekPhase::Seeking { target, .. } => Some(target),
            SeekPhase::Idle => None,
        }
    }

    /// Blocks until no seek is in flight. Returns false on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while matches!(state.phase, SeekPhase::Seeking { .. }) {
            if self.idle.wait_until(&mut state, deadline).timed_out() {
                return !matches!(state.phase, SeekPhase::Seeking { .. });
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::decoder::{SyntheticConfig, SyntheticMedia};
    use crate::events::{self, EngineEvent};
    use crate::media::{MediaUnit, VideoFrame};

    fn context() -> (SessionContext, events::EventReceiver) {
        let media = SyntheticMedia::new(SyntheticConfig::new(Duration::from_secs(60), 24.0));
        let (events, rx) = events::channel();
        let ctx = SessionContext::new(media.info(), EngineConfig::default(), events);
        (ctx, rx)
    }

    fn register_worker(ctx: &SessionContext) -> crossbeam_channel::Receiver<DecodeCommand> {
        let (tx, rx) = crossbeam_channel::unbounded();
        ctx.transport.register(tx);
        rx
    }

    #[test]
    fn test_seek_without_workers_completes() {
        let (ctx, rx) = context();
        let seek = SeekController::new(ctx.clone());
        assert_eq!(seek.request(Duration::from_secs(12)), SeekOutcome::Started);
        assert!(!seek.is_seeking());
        assert_eq!(ctx.clock.now(), Duration::from_secs(12));
        assert_eq!(ctx.transport.generation(), 1);
        assert!(rx
            .try_iter()
            .any(|e| e == EngineEvent::SeekCompleted {
                position: Duration::from_secs(12)
            }));
    }

    #[test]
    fn test_seek_target_is_clamped() {
        let (ctx, _rx) = context();
        let seek = SeekController::new(ctx.clone());
        seek.request(Duration::from_secs(200));
        assert_eq!(ctx.clock.now(), Duration::from_secs(60));
        assert_eq!(ctx.transport.position(), Duration::from_secs(60));
    }

    #[test]
    fn test_seek_flushes_queues() {
        let (ctx, _rx) = context();
        let mut frame = VideoFrame::new(
            Duration::ZERO,
            0,
            Duration::from_millis(41),
            crate::media::PixelFormat::Rgba,
            1,
            1,
            Vec::new(),
        );
        frame.set_generation(0);
        assert!(ctx.video_queue.push(frame.clone()));

        let seek = SeekController::new(ctx.clone());
        seek.request(Duration::from_secs(3));
        assert!(ctx.video_queue.is_empty());
        // Pre-seek units can no longer enter
        assert!(!ctx.video_queue.push(frame));
    }

    #[test]
    fn test_requests_coalesce_while_in_flight() {
        let (ctx, rx) = context();
        let commands = register_worker(&ctx);
        let seek = SeekController::new(ctx.clone());

        assert_eq!(seek.request(Duration::from_secs(5)), SeekOutcome::Started);
        assert_eq!(seek.request(Duration::from_secs(6)), SeekOutcome::Coalesced);
        assert_eq!(seek.request(Duration::from_secs(7)), SeekOutcome::Coalesced);
        assert_eq!(seek.target(), Some(Duration::from_secs(5)));

        assert_eq!(
            commands.try_recv(),
            Ok(DecodeCommand::Seek {
                generation: 1,
                target: Duration::from_secs(5)
            })
        );
        seek.acknowledge(1);

        // Only the latest pending target runs
        assert_eq!(
            commands.try_recv(),
            Ok(DecodeCommand::Seek {
                generation: 2,
                target: Duration::from_secs(7)
            })
        );
        assert!(commands.try_recv().is_err());
        assert!(seek.is_seeking());

        // A stale acknowledgement changes nothing
        seek.acknowledge(1);
        assert!(seek.is_seeking());

        seek.acknowledge(2);
        assert!(!seek.is_seeking());
        assert!(seek.wait_idle(Duration::ZERO));
        assert_eq!(ctx.clock.now(), Duration::from_secs(7));

        let completed: Vec<_> = rx
            .try_iter()
            .filter(|e| matches!(e, EngineEvent::SeekCompleted { .. }))
            .collect();
        assert_eq!(
            completed,
            vec![EngineEvent::SeekCompleted {
                position: Duration::from_secs(7)
            }]
        );
    }

    #[test]
    fn test_lost_worker_does_not_wedge_seek() {
        let (ctx, _rx) = context();
        let _commands = register_worker(&ctx);
        let seek = SeekController::new(ctx.clone());
        seek.request(Duration::from_secs(1));
        assert!(seek.is_seeking());
        assert!(!seek.wait_idle(Duration::from_millis(10)));

        seek.worker_lost();
        assert!(!seek.is_seeking());
    }

    #[test]
    fn test_resume_state_after_seek() {
        let (ctx, _rx) = context();
        let seek = SeekController::new(ctx.clone());
        ctx.events.transition(PlaybackState::Ready);
        seek.request(Duration::from_secs(1));
        assert_eq!(ctx.events.state(), PlaybackState::Ready);

        ctx.transport.play();
        seek.request(Duration::from_secs(2));
        assert_eq!(ctx.events.state(), PlaybackState::Playing);

        ctx.transport.pause();
        seek.request(Duration::from_secs(3));
        assert_eq!(ctx.events.state(), PlaybackState::Paused);
    }
}
