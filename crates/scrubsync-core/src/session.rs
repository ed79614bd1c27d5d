//! Shared state of one loaded media file.
//!
//! A session owns the two queues, the master clock, the sync and segment
//! controllers and a [`Transport`] that carries play/pause/stop and the seek
//! generation. Every worker thread holds a clone of the [`SessionContext`].

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::Sender;
use parking_lot::{Condvar, Mutex};

use crate::clock::MasterClock;
use crate::config::EngineConfig;
use crate::decode_thread::DecodeCommand;
use crate::error::{panic_message, EngineError, ErrorCategory, Result};
use crate::events::{EventSender, PlaybackState};
use crate::frame_queue::BoundedQueue;
use crate::media::{AudioBlock, MediaInfo, VideoFrame};
use crate::segment::SegmentMonitor;
use crate::sync::SyncController;

/// Play/pause/stop flags, the seek generation and the presented position.
///
/// Workers poll the flags between units of work; the decode workers also
/// receive the same transitions as [`DecodeCommand`]s.
pub struct Transport {
    paused: AtomicBool,
    stopped: AtomicBool,
    generation: AtomicU64,
    /// Timestamp of the last presented frame, or the last seek target
    position_us: AtomicU64,
    commanders: Mutex<Vec<Sender<DecodeCommand>>>,
    pause_lock: Mutex<()>,
    unpaused: Condvar,
    events: EventSender,
}

impl Transport {
    /// Creates a paused transport at generation 0.
    pub fn new(events: EventSender) -> Self {
        Self {
            paused: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            position_us: AtomicU64::new(0),
            commanders: Mutex::new(Vec::new()),
            pause_lock: Mutex::new(()),
            unpaused: Condvar::new(),
            events,
        }
    }

    /// Registers a decode worker's command channel.
    pub fn register(&self, commands: Sender<DecodeCommand>) {
        self.commanders.lock().push(commands);
    }

    /// Sends `command` to every live decode worker. Returns how many got it.
    pub fn broadcast(&self, command: DecodeCommand) -> usize {
        let mut commanders = self.commanders.lock();
        // Workers that exited dropped their receiver
        commanders.retain(|tx| tx.send(command.clone()).is_ok());
        commanders.len()
    }

    pub fn play(&self) {
        if self.is_stopped() {
            return;
        }
        self.paused.store(false, Ordering::Release);
        self.broadcast(DecodeCommand::Play);
        {
            let _guard = self.pause_lock.lock();
            self.unpaused.notify_all();
        }
        for from in [PlaybackState::Ready, PlaybackState::Paused] {
            if self.events.transition_from(from, PlaybackState::Playing) {
                break;
            }
        }
    }

    pub fn pause(&self) {
        if self.paused.swap(true, Ordering::AcqRel) {
            return;
        }
        self.broadcast(DecodeCommand::Pause);
        self.events
            .transition_from(PlaybackState::Playing, PlaybackState::Paused);
    }

    /// Sets the teardown flag and wakes every thread parked on the transport.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.broadcast(DecodeCommand::Stop);
        let _guard = self.pause_lock.lock();
        self.unpaused.notify_all();
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Blocks while paused, for at most `timeout`. Returns true if running.
    pub fn wait_while_paused(&self, timeout: Duration) -> bool {
        let mut guard = self.pause_lock.lock();
        if self.is_paused() && !self.is_stopped() {
            self.unpaused.wait_for(&mut guard, timeout);
        }
        !self.is_paused() && !self.is_stopped()
    }

    /// Current seek generation.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub(crate) fn set_generation(&self, generation: u64) {
        self.generation.store(generation, Ordering::Release);
    }

    /// Last presented frame timestamp (or seek target before the first frame).
    pub fn position(&self) -> Duration {
        Duration::from_micros(self.position_us.load(Ordering::Acquire))
    }

    pub fn set_position(&self, position: Duration) {
        self.position_us
            .store(position.as_micros() as u64, Ordering::Release);
    }
}

/// Handles shared by every thread of a session.
#[derive(Clone)]
pub struct SessionContext {
    pub info: MediaInfo,
    pub config: Arc<EngineConfig>,
    pub clock: MasterClock,
    pub sync: Arc<SyncController>,
    pub segment: Arc<SegmentMonitor>,
    pub transport: Arc<Transport>,
    pub events: EventSender,
    pub video_queue: Arc<BoundedQueue<VideoFrame>>,
    pub audio_queue: Arc<BoundedQueue<AudioBlock>>,
}

impl SessionContext {
    pub fn new(info: MediaInfo, config: EngineConfig, events: EventSender) -> Self {
        let sync = Arc::new(SyncController::new(&config.sync));
        let segment = Arc::new(SegmentMonitor::new(
            info.duration,
            &config.segment,
            events.clone(),
        ));
        let video_queue = Arc::new(BoundedQueue::new("video", config.queues.video_capacity));
        let audio_queue = Arc::new(BoundedQueue::new("audio", config.queues.audio_capacity));

        Self {
            info,
            config: Arc::new(config),
            clock: MasterClock::new(),
            sync,
            segment,
            transport: Arc::new(Transport::new(events.clone())),
            events,
            video_queue,
            audio_queue,
        }
    }

    /// Stops the transport and both queues, releasing every blocked thread.
    pub fn shutdown(&self) {
        self.transport.stop();
        self.video_queue.stop();
        self.audio_queue.stop();
    }
}

/// Spawns a named worker whose panics become error events.
///
/// `on_panic` runs on the worker thread after the event was sent.
pub(crate) fn spawn_guarded<F, P>(
    name: &str,
    category: ErrorCategory,
    events: EventSender,
    on_panic: P,
    body: F,
) -> Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
    P: FnOnce() + Send + 'static,
{
    let thread_name = name.to_string();
    thread::Builder::new()
        .name(thread_name.clone())
        .spawn(move || {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(body)) {
                let message = panic_message(payload.as_ref());
                tracing::error!("{} thread panicked: {}", thread_name, message);
                events.error(category, format!("{thread_name} stopped: {message}"));
                on_panic();
            }
        })
        .map_err(|err| {
            tracing::error!("Failed to spawn {} thread: {}", name, err);
            EngineError::Spawn(name.to_string())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{self, EngineEvent};

    #[test]
    fn test_play_pause_transitions() {
        let (events, rx) = events::channel();
        events.transition(PlaybackState::Ready);
        let transport = Transport::new(events.clone());
        assert!(transport.is_paused());

        transport.play();
        assert!(!transport.is_paused());
        assert_eq!(events.state(), PlaybackState::Playing);

        transport.pause();
        transport.pause();
        assert_eq!(events.state(), PlaybackState::Paused);

        let states: Vec<_> = rx
            .try_iter()
            .filter_map(|e| match e {
                EngineEvent::StateChanged(s) => Some(s),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![
                PlaybackState::Ready,
                PlaybackState::Playing,
                PlaybackState::Paused
            ]
        );
    }

    #[test]
    fn test_play_does_not_override_seeking() {
        let (events, _rx) = events::channel();
        events.transition(PlaybackState::Seeking);
        let transport = Transport::new(events.clone());
        transport.play();
        assert_eq!(events.state(), PlaybackState::Seeking);
        assert!(!transport.is_paused());
    }

    #[test]
    fn test_broadcast_skips_exited_workers() {
        let (events, _rx) = events::channel();
        let transport = Transport::new(events);
        let (tx_a, rx_a) = crossbeam_channel::unbounded();
        let (tx_b, rx_b) = crossbeam_channel::unbounded();
        transport.register(tx_a);
        transport.register(tx_b);
        drop(rx_b);

        assert_eq!(transport.broadcast(DecodeCommand::Play), 1);
        assert_eq!(rx_a.try_recv(), Ok(DecodeCommand::Play));
    }

    #[test]
    fn test_stop_wakes_paused_waiter() {
        let (events, _rx) = events::channel();
        let transport = Arc::new(Transport::new(events));
        let waiter = {
            let transport = Arc::clone(&transport);
            thread::spawn(move || transport.wait_while_paused(Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        transport.stop();
        assert!(!waiter.join().unwrap());
    }

    #[test]
    fn test_spawn_guarded_reports_panic() {
        let (events, rx) = events::channel();
        let (lost_tx, lost_rx) = crossbeam_channel::bounded(1);
        let handle = spawn_guarded(
            "test-worker",
            ErrorCategory::DecodeFailure,
            events,
            move || {
                let _ = lost_tx.send(());
            },
            || panic!("boom"),
        )
        .unwrap();
        handle.join().unwrap();

        assert!(lost_rx.try_recv().is_ok());
        match rx.try_recv() {
            Ok(EngineEvent::PlaybackError { category, message }) => {
                assert_eq!(category, ErrorCategory::DecodeFailure);
                assert!(message.contains("boom"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
