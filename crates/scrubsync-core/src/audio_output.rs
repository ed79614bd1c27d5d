//! Audio output driver: feeds the sink and drives the master clock.
//!
//! Three clock sources, in order of preference:
//!
//! - **Device**: after each block the sink accepts, the clock moves to the
//!   block's end timestamp. An empty queue holds the clock where it is.
//! - **Silent**: the device failed (or never opened). The clock follows
//!   wall time from an anchor, and blocks are discarded as they come due.
//!   Entering this mode warns once and emits one `DeviceUnavailable` event.
//! - **Wall**: the media has no audio, or the audio stream ended before the
//!   video. The clock follows wall time up to the media duration.

use std::thread;
use std::time::{Duration, Instant};

use crate::audio::{AudioHandle, AudioSink};
use crate::error::ErrorCategory;
use crate::frame_queue::QueueItem;
use crate::media::{AudioBlock, MediaUnit};
use crate::session::SessionContext;

/// How long to wait for a block before re-checking transport flags.
const POP_TIMEOUT: Duration = Duration::from_millis(20);

/// Tick of the wall-clock modes.
const WALL_TICK: Duration = Duration::from_millis(5);

/// Which source currently drives the master clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockSource {
    Device,
    Silent,
    Wall,
}

pub struct AudioOutput {
    ctx: SessionContext,
    sink: Option<Box<dyn AudioSink>>,
    handle: AudioHandle,
    generation: u64,
    /// Wall-clock anchor: clock position at a known instant
    anchor: Option<(Instant, Duration)>,
    audio_ended: bool,
    device_lost: bool,
    paused: bool,
}

impl AudioOutput {
    /// Creates the driver. `sink` is None when the device could not be
    /// opened; the caller has already reported that.
    pub fn new(ctx: SessionContext, sink: Option<Box<dyn AudioSink>>, handle: AudioHandle) -> Self {
        let device_lost = sink.is_none() && ctx.info.has_audio();
        let generation = ctx.transport.generation();
        Self {
            ctx,
            sink,
            handle,
            generation,
            anchor: None,
            audio_ended: false,
            device_lost,
            paused: true,
        }
    }

    pub fn clock_source(&self) -> ClockSource {
        if !self.ctx.info.has_audio() || self.audio_ended {
            ClockSource::Wall
        } else if self.sink.is_none() {
            ClockSource::Silent
        } else {
            ClockSource::Device
        }
    }

    /// Thread body: runs until the transport stops.
    pub fn run(mut self) {
        tracing::info!(
            "Audio output started ({:?}, sink: {})",
            self.clock_source(),
            self.sink.as_ref().map_or("none", |s| s.label())
        );

        while !self.ctx.transport.is_stopped() {
            if self.ctx.transport.is_paused() {
                self.enter_pause();
                self.ctx.transport.wait_while_paused(Duration::from_millis(50));
                continue;
            }
            self.leave_pause();
            self.sync_generation();

            match self.clock_source() {
                ClockSource::Device => {
                    if let Some(item) = self.ctx.audio_queue.pop_timeout(POP_TIMEOUT) {
                        self.handle_item(item);
                    }
                    // Empty queue: underrun, the clock holds
                }
                ClockSource::Silent => {
                    self.advance_wall();
                    self.discard_due_blocks();
                    thread::sleep(WALL_TICK);
                }
                ClockSource::Wall => {
                    self.advance_wall();
                    thread::sleep(WALL_TICK);
                }
            }
        }

        tracing::info!("Audio output stopped at {:?}", self.ctx.clock.now());
    }

    fn handle_item(&mut self, item: QueueItem<AudioBlock>) {
        match item {
            QueueItem::Unit(block) => {
                if block.generation() != self.generation {
                    self.sync_generation();
                }
                if block.generation() == self.generation {
                    self.play_block(block);
                }
            }
            QueueItem::EndOfStream { generation } => {
                if generation == self.transport_generation() {
                    self.sync_generation();
                    tracing::info!(
                        "Audio ended at {:?}; clock follows wall time",
                        self.ctx.clock.now()
                    );
                    self.audio_ended = true;
                    self.anchor = Some((Instant::now(), self.ctx.clock.now()));
                }
            }
        }
    }

    /// Writes one block to the sink and moves the clock to its end.
    ///
    /// Returns true if the sink accepted the block. A sink failure switches
    /// the driver to the silent clock.
    pub fn play_block(&mut self, mut block: AudioBlock) -> bool {
        let Some(sink) = self.sink.as_mut() else {
            return false;
        };

        self.handle.apply(&mut block.data);
        match sink.write(&block) {
            Ok(()) => {
                let end = block.end_pts();
                if !self.ctx.clock.advance(block.generation(), end) {
                    tracing::trace!("Clock did not advance to {:?} (stale or behind)", end);
                }
                true
            }
            Err(err) => {
                self.lose_device(err.to_string());
                false
            }
        }
    }

    fn lose_device(&mut self, reason: String) {
        let label = self.sink.as_ref().map_or("none", |s| s.label());
        self.sink = None;
        self.anchor = Some((Instant::now(), self.ctx.clock.now()));

        if !self.device_lost {
            self.device_lost = true;
            tracing::warn!(
                "Audio device ({}) unavailable: {}; continuing video-only on wall clock",
                label,
                reason
            );
            self.ctx.events.error(
                ErrorCategory::DeviceUnavailable,
                format!("audio output unavailable: {reason}"),
            );
        }
    }

    fn transport_generation(&self) -> u64 {
        self.ctx.transport.generation()
    }

    /// Picks up a seek: flushes the device and re-anchors the wall clock.
    fn sync_generation(&mut self) {
        let generation = self.transport_generation();
        if generation == self.generation {
            return;
        }
        tracing::debug!(
            "Audio output generation {} -> {}",
            self.generation,
            generation
        );
        self.generation = generation;
        self.audio_ended = false;
        if let Some(sink) = self.sink.as_mut() {
            sink.flush();
        }
        self.anchor = Some((Instant::now(), self.ctx.clock.now()));
    }

    fn advance_wall(&mut self) {
        if !self.ctx.clock.is_current(self.generation) {
            // Seek in progress; wait for the transport to catch up
            self.anchor = None;
            return;
        }
        let (instant, base) = *self
            .anchor
            .get_or_insert_with(|| (Instant::now(), self.ctx.clock.now()));
        let position = (base + instant.elapsed()).min(self.ctx.info.duration);
        self.ctx.clock.advance(self.generation, position);
    }

    /// Silent mode: drop blocks whose time has passed so the decoder keeps up.
    fn discard_due_blocks(&mut self) {
        let now = self.ctx.clock.now();
        let generation = self.generation;
        while let Some(item) = self.ctx.audio_queue.pop_if(|item| match item {
            QueueItem::Unit(block) => block.generation() != generation || block.end_pts() <= now,
            QueueItem::EndOfStream { .. } => true,
        }) {
            if let QueueItem::EndOfStream { generation: eos } = item {
                if eos == generation {
                    self.audio_ended = true;
                }
            }
        }
    }

    fn enter_pause(&mut self) {
        if self.paused {
            return;
        }
        self.paused = true;
        self.anchor = None;
        if let Some(sink) = self.sink.as_mut() {
            sink.pause();
        }
        tracing::debug!("Audio output paused at {:?}", self.ctx.clock.now());
    }

    fn leave_pause(&mut self) {
        if !self.paused {
            return;
        }
        self.paused = false;
        if let Some(sink) = self.sink.as_mut() {
            sink.resume();
        }
        self.anchor = Some((Instant::now(), self.ctx.clock.now()));
        tracing::debug!("Audio output resumed at {:?}", self.ctx.clock.now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::NullSink;
    use crate::config::EngineConfig;
    use crate::decoder::{SyntheticConfig, SyntheticMedia};
    use crate::events::{self, EngineEvent};

    fn block(pts_ms: u64, generation: u64) -> AudioBlock {
        // 10ms of stereo at 48kHz
        let mut block = AudioBlock::new(Duration::from_millis(pts_ms), vec![0.5; 960], 48_000, 2);
        block.set_generation(generation);
        block
    }

    fn output(
        sink: Option<Box<dyn AudioSink>>,
    ) -> (AudioOutput, SessionContext, events::EventReceiver) {
        let media = SyntheticMedia::new(SyntheticConfig::new(Duration::from_secs(10), 24.0));
        let (events, rx) = events::channel();
        let ctx = SessionContext::new(media.info(), EngineConfig::default(), events);
        let output = AudioOutput::new(ctx.clone(), sink, AudioHandle::new());
        (output, ctx, rx)
    }

    #[test]
    fn test_clock_follows_accepted_blocks() {
        let (mut output, ctx, _rx) = output(Some(Box::new(NullSink::new())));
        assert_eq!(output.clock_source(), ClockSource::Device);

        let mut last = Duration::ZERO;
        for i in 0..20 {
            assert!(output.play_block(block(i * 10, 0)));
            let now = ctx.clock.now();
            assert!(now >= last);
            last = now;
        }
        assert_eq!(ctx.clock.now(), Duration::from_millis(200));
    }

    #[test]
    fn test_empty_queue_holds_clock_until_next_block() {
        let media = SyntheticMedia::new(SyntheticConfig::new(Duration::from_secs(10), 24.0));
        let (events, _rx) = events::channel();
        let ctx = SessionContext::new(media.info(), EngineConfig::default(), events);
        ctx.transport.play();

        let driver_ctx = ctx.clone();
        let driver = thread::spawn(move || {
            let sink: Box<dyn AudioSink> = Box::new(NullSink::new());
            AudioOutput::new(driver_ctx, Some(sink), AudioHandle::new()).run();
        });
        let wait_for = |target: Duration| {
            let deadline = Instant::now() + Duration::from_secs(2);
            while ctx.clock.now() < target && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(2));
            }
            ctx.clock.now()
        };

        assert!(ctx.audio_queue.push(block(0, 0)));
        assert_eq!(wait_for(Duration::from_millis(10)), Duration::from_millis(10));

        // Underrun: the driver keeps polling an empty queue
        thread::sleep(Duration::from_millis(150));
        assert_eq!(ctx.clock.now(), Duration::from_millis(10));

        assert!(ctx.audio_queue.push(block(10, 0)));
        assert_eq!(wait_for(Duration::from_millis(20)), Duration::from_millis(20));

        ctx.shutdown();
        driver.join().unwrap();
    }

    #[test]
    fn test_stale_block_does_not_move_clock() {
        let (mut output, ctx, _rx) = output(Some(Box::new(NullSink::new())));
        output.play_block(block(0, 0));
        ctx.clock.reset(1, Duration::from_secs(5));
        output.play_block(block(10, 0));
        assert_eq!(ctx.clock.now(), Duration::from_secs(5));
    }

    #[test]
    fn test_device_loss_reports_once() {
        let sink = NullSink::new();
        let control = sink.control();
        let (mut output, ctx, rx) = output(Some(Box::new(sink)));

        output.play_block(block(0, 0));
        control.disconnect();
        for i in 1..10 {
            assert!(!output.play_block(block(i * 10, 0)));
        }
        assert_eq!(output.clock_source(), ClockSource::Silent);
        assert_eq!(ctx.clock.now(), Duration::from_millis(10));

        let device_errors = rx
            .try_iter()
            .filter(|e| {
                matches!(
                    e,
                    EngineEvent::PlaybackError {
                        category: ErrorCategory::DeviceUnavailable,
                        ..
                    }
                )
            })
            .count();
        assert_eq!(device_errors, 1);
    }

    #[test]
    fn test_missing_device_starts_silent_without_event() {
        let (output, _ctx, rx) = output(None);
        assert_eq!(output.clock_source(), ClockSource::Silent);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_wall_clock_is_clamped_to_duration() {
        let (mut output, ctx, _rx) = output(Some(Box::new(NullSink::new())));
        ctx.clock.reset(0, Duration::from_millis(9_990));
        output.audio_ended = true;
        output.anchor = Some((Instant::now(), Duration::from_millis(9_990)));
        thread::sleep(Duration::from_millis(30));
        output.advance_wall();
        assert_eq!(ctx.clock.now(), Duration::from_secs(10));
    }

    #[test]
    fn test_silent_mode_discards_due_blocks() {
        let (mut output, ctx, _rx) = output(None);
        for i in 0..4 {
            assert!(ctx.audio_queue.push(block(i * 10, 0)));
        }
        ctx.clock.reset(0, Duration::from_millis(20));
        output.discard_due_blocks();
        assert_eq!(ctx.audio_queue.len(), 2);

        assert!(ctx.audio_queue.push_end_of_stream(0));
        ctx.clock.reset(0, Duration::from_millis(50));
        output.discard_due_blocks();
        assert!(ctx.audio_queue.is_empty());
        assert_eq!(output.clock_source(), ClockSource::Wall);
    }
}
