//! Segment boundary monitor for the edit/preview mode.
//!
//! Holds an optional `[start, end]` segment and the scrubber's visible
//! window around it. The render loop asks [`SegmentMonitor::end_reached`]
//! before presenting every frame; the answer is read from an atomic so the
//! check costs nothing when no segment is set.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::SegmentConfig;
use crate::events::EventSender;

const NO_SEGMENT: u64 = u64::MAX;

/// A segment on the media timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentBounds {
    pub start: Duration,
    pub end: Duration,
}

impl SegmentBounds {
    pub fn len(&self) -> Duration {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// Range of the timeline a scrubber shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VisibleWindow {
    pub start: Duration,
    pub end: Duration,
}

struct SegmentState {
    bounds: Option<SegmentBounds>,
    window: VisibleWindow,
}

pub struct SegmentMonitor {
    state: Mutex<SegmentState>,
    /// Segment end in microseconds, or [`NO_SEGMENT`]
    end_us: AtomicU64,
    /// Cleared when the end fires; set again once playback is before the end
    armed: AtomicBool,
    duration: Duration,
    pad: Duration,
    min_duration: Duration,
    events: EventSender,
}

impl SegmentMonitor {
    pub fn new(duration: Duration, config: &SegmentConfig, events: EventSender) -> Self {
        Self {
            state: Mutex::new(SegmentState {
                bounds: None,
                window: VisibleWindow {
                    start: Duration::ZERO,
                    end: duration,
                },
            }),
            end_us: AtomicU64::new(NO_SEGMENT),
            armed: AtomicBool::new(true),
            duration,
            pad: config.window_pad(),
            min_duration: config.min_duration(),
            events,
        }
    }

    /// Sets both boundaries and recenters the visible window on them.
    ///
    /// Both values are clamped to the media. If the segment would be shorter
    /// than the minimum, `end` moves to `start + minimum`, or `start` moves
    /// back when that would run past the end of the media.
    pub fn set_segment_bounds(&self, start: Duration, end: Duration) -> SegmentBounds {
        let mut start = start.min(self.duration);
        let mut end = end.min(self.duration);

        if end < start + self.min_duration {
            end = start + self.min_duration;
            if end > self.duration {
                end = self.duration;
                start = end.saturating_sub(self.min_duration);
            }
        }

        let bounds = SegmentBounds { start, end };
        let window = VisibleWindow {
            start: start.saturating_sub(self.pad),
            end: (end + self.pad).min(self.duration),
        };
        {
            let mut state = self.state.lock();
            state.bounds = Some(bounds);
            state.window = window;
        }
        self.end_us.store(end.as_micros() as u64, Ordering::Release);
        self.armed.store(true, Ordering::Release);

        tracing::debug!(
            "Segment set to {:?}..{:?}, window {:?}..{:?}",
            start,
            end,
            window.start,
            window.end
        );
        self.events.window_changed(window.start, window.end);
        bounds
    }

    /// Moves the segment start, keeping at least the minimum duration.
    ///
    /// Returns None when no segment is set.
    pub fn drag_segment_start(&self, position: Duration) -> Option<SegmentBounds> {
        let mut state = self.state.lock();
        let mut bounds = state.bounds?;

        let latest = bounds.end.saturating_sub(self.min_duration);
        bounds.start = position.min(latest);
        state.bounds = Some(bounds);

        let mut window = state.window;
        while bounds.start <= window.start && window.start > Duration::ZERO {
            window.start = window.start.saturating_sub(self.pad);
        }
        let changed = window != state.window;
        state.window = window;
        drop(state);

        if changed {
            tracing::debug!("Window start extended to {:?}", window.start);
            self.events.window_changed(window.start, window.end);
        }
        Some(bounds)
    }

    /// Moves the segment end, keeping at least the minimum duration.
    ///
    /// Returns None when no segment is set.
    pub fn drag_segment_end(&self, position: Duration) -> Option<SegmentBounds> {
        let mut state = self.state.lock();
        let mut bounds = state.bounds?;

        let earliest = (bounds.start + self.min_duration).min(self.duration);
        bounds.end = position.min(self.duration).max(earliest);
        state.bounds = Some(bounds);
        self.end_us
            .store(bounds.end.as_micros() as u64, Ordering::Release);

        let mut window = state.window;
        while bounds.end >= window.end && window.end < self.duration {
            window.end = (window.end + self.pad).min(self.duration);
        }
        let changed = window != state.window;
        state.window = window;
        drop(state);

        if changed {
            tracing::debug!("Window end extended to {:?}", window.end);
            self.events.window_changed(window.start, window.end);
        }
        Some(bounds)
    }

    /// Removes the segment; the window goes back to the whole media.
    pub fn clear(&self) {
        let window = VisibleWindow {
            start: Duration::ZERO,
            end: self.duration,
        };
        {
            let mut state = self.state.lock();
            state.bounds = None;
            state.window = window;
        }
        self.end_us.store(NO_SEGMENT, Ordering::Release);
        self.events.window_changed(window.start, window.end);
    }

    /// Returns true exactly once when `pts` first reaches the segment end.
    ///
    /// The monitor re-arms as soon as a timestamp before the end is seen, so
    /// every crossing fires once and playing on past the end does not.
    pub fn end_reached(&self, pts: Duration) -> bool {
        let end_us = self.end_us.load(Ordering::Acquire);
        if end_us == NO_SEGMENT {
            return false;
        }
        if (pts.as_micros() as u64) < end_us {
            self.armed.store(true, Ordering::Release);
            return false;
        }
        self.armed.swap(false, Ordering::AcqRel)
    }

    /// Re-arms for a playback position set by a seek.
    pub fn rearm(&self, position: Duration) {
        let end_us = self.end_us.load(Ordering::Acquire);
        self.armed
            .store((position.as_micros() as u64) < end_us, Ordering::Release);
    }

    pub fn bounds(&self) -> Option<SegmentBounds> {
        self.state.lock().bounds
    }

    pub fn window(&self) -> VisibleWindow {
        self.state.lock().window
    }

    pub fn min_duration(&self) -> Duration {
        self.min_duration
    }
}
