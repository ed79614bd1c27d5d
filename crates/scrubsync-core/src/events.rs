//! Outbound notifications for the UI layer.
//!
//! Worker threads never call into UI code. They push [`EngineEvent`]s onto a
//! bounded channel and the UI drains it from its own loop. When the UI falls
//! behind, new `TimeChanged` events are dropped first; any other event
//! evicts the oldest undrained one.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TrySendError};

use crate::error::ErrorCategory;

/// Coarse playback state reported to the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PlaybackState {
    /// Nothing loaded
    Idle = 0,
    /// Media loaded, first frame available, not yet playing
    Ready = 1,
    Playing = 2,
    Paused = 3,
    /// A seek is repositioning the decoders
    Seeking = 4,
    /// The video stream ran out; audio may have ended earlier
    Ended = 5,
    /// A fatal error stopped playback
    Error = 6,
}

impl PlaybackState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Ready,
            2 => Self::Playing,
            3 => Self::Paused,
            4 => Self::Seeking,
            5 => Self::Ended,
            6 => Self::Error,
            _ => Self::Idle,
        }
    }
}

/// Notifications delivered to the UI.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// Presentation time moved; rate-limited, not one per frame
    TimeChanged { position: Duration },
    /// Playback paused at the segment end
    SegmentEndReached { position: Duration },
    /// The scrubber's visible window moved
    WindowChanged { start: Duration, end: Duration },
    /// Something went wrong that the user should hear about
    PlaybackError {
        category: ErrorCategory,
        message: String,
    },
    StateChanged(PlaybackState),
    /// A seek finished and playback resumed from `position`
    SeekCompleted { position: Duration },
}

/// Receiving end handed to the UI.
pub type EventReceiver = Receiver<EngineEvent>;

/// Events held for a UI that is not draining.
pub const EVENT_CAPACITY: usize = 1024;

/// Creates a connected event sender and receiver.
pub fn channel() -> (EventSender, EventReceiver) {
    let (tx, rx) = crossbeam_channel::bounded(EVENT_CAPACITY);
    (
        EventSender {
            tx,
            overflow: rx.clone(),
            state: Arc::new(AtomicU8::new(PlaybackState::Idle as u8)),
        },
        rx,
    )
}

/// Cloneable sending end shared by the engine's threads.
///
/// Also owns the current [`PlaybackState`], so every state transition emits
/// exactly one [`EngineEvent::StateChanged`].
#[derive(Clone)]
pub struct EventSender {
    tx: Sender<EngineEvent>,
    /// Used to evict the oldest event when the channel is full
    overflow: Receiver<EngineEvent>,
    state: Arc<AtomicU8>,
}

impl EventSender {
    pub fn send(&self, event: EngineEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(EngineEvent::TimeChanged { .. })) => {
                tracing::trace!("event channel full, dropping TimeChanged");
            }
            Err(TrySendError::Full(event)) => {
                if let Ok(evicted) = self.overflow.try_recv() {
                    tracing::debug!("event channel full, dropped {:?}", evicted);
                }
                if self.tx.try_send(event).is_err() {
                    tracing::warn!("event channel full, event lost");
                }
            }
            Err(TrySendError::Disconnected(_)) => {
                tracing::trace!("event receiver dropped");
            }
        }
    }

    pub fn time_changed(&self, position: Duration) {
        self.send(EngineEvent::TimeChanged { position });
    }

    pub fn segment_end_reached(&self, position: Duration) {
        self.send(EngineEvent::SegmentEndReached { position });
    }

    pub fn window_changed(&self, start: Duration, end: Duration) {
        self.send(EngineEvent::WindowChanged { start, end });
    }

    pub fn seek_completed(&self, position: Duration) {
        self.send(EngineEvent::SeekCompleted { position });
    }

    pub fn error(&self, category: ErrorCategory, message: impl Into<String>) {
        self.send(EngineEvent::PlaybackError {
            category,
            message: message.into(),
        });
    }

    /// Current playback state.
    pub fn state(&self) -> PlaybackState {
        PlaybackState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Moves to `state`, emitting `StateChanged` if it differs from the
    /// current one. Returns the previous state.
    pub fn transition(&self, state: PlaybackState) -> PlaybackState {
        let previous = PlaybackState::from_u8(self.state.swap(state as u8, Ordering::AcqRel));
        if previous != state {
            tracing::debug!("Playback state {:?} -> {:?}", previous, state);
            self.send(EngineEvent::StateChanged(state));
        }
        previous
    }

    /// Moves to `to` only if the current state is `from`.
    pub fn transition_from(&self, from: PlaybackState, to: PlaybackState) -> bool {
        let swapped = self
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if swapped && from != to {
            tracing::debug!("Playback state {:?} -> {:?}", from, to);
            self.send(EngineEvent::StateChanged(to));
        }
        swapped
    }
}
