//! Sync offset, drift policy and drift statistics.
//!
//! Drift is measured against the audio master clock for every dequeued
//! video frame:
//!
//! ```text
//! drift = audio_time - frame.pts + sync_offset
//! ```
//!
//! Positive drift means the frame is overdue, negative means it is early.
//! A positive offset makes every frame due earlier, which compensates for a
//! video presentation path with more latency than the audio path.
//!
//! The offset and the thresholds are atomics so the UI thread can change
//! them while the render loop is running; the next drift computation sees
//! the new value. The rolling window of [`DriftSample`]s sits behind a short
//! mutex that only the render loop and [`SyncController::snapshot`] take.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::SyncConfig;

/// Threshold for acceptable A/V sync drift.
pub const SYNC_DRIFT_THRESHOLD_MS: i64 = 100;

/// Threshold for warning-level drift (noticeable but tolerable).
pub const SYNC_DRIFT_WARNING_MS: i64 = 150;

/// Threshold for severe drift (clearly out of sync).
pub const SYNC_DRIFT_SEVERE_MS: i64 = 200;

/// Samples after a reset during which max drift is not tracked.
const GRACE_SAMPLES: u64 = 5;

/// What the render loop should do with a dequeued frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDecision {
    /// Present immediately
    Render,
    /// Hold the frame for roughly this long, then present it
    Wait(Duration),
    /// Skip the frame; the next one is already due
    Drop,
}

/// One drift measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriftSample {
    pub sequence: u64,
    /// Signed drift in microseconds (positive = video late)
    pub drift_us: i64,
}

struct DriftWindow {
    samples: VecDeque<DriftSample>,
    capacity: usize,
    sum_us: i64,
}

impl DriftWindow {
    fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            sum_us: 0,
        }
    }

    fn push(&mut self, sample: DriftSample) -> i64 {
        if self.samples.len() == self.capacity {
            if let Some(old) = self.samples.pop_front() {
                self.sum_us -= old.drift_us;
            }
        }
        self.sum_us += sample.drift_us;
        self.samples.push_back(sample);
        self.average_us()
    }

    fn average_us(&self) -> i64 {
        if self.samples.is_empty() {
            0
        } else {
            self.sum_us / self.samples.len() as i64
        }
    }

    fn clear(&mut self) {
        self.samples.clear();
        self.sum_us = 0;
    }
}

/// Owner of the sync offset, the drift thresholds and the drift window.
pub struct SyncController {
    offset_ms: AtomicI64,
    late_threshold_us: AtomicU64,
    early_threshold_us: AtomicU64,
    overhead_us: AtomicU64,
    drop_late_frames: AtomicBool,

    window: Mutex<DriftWindow>,

    /// Latest recorded drift in microseconds
    current_drift_us: AtomicI64,
    /// Largest positive drift seen (video behind audio)
    max_behind_us: AtomicI64,
    /// Most negative drift seen (video ahead of audio)
    max_ahead_us: AtomicI64,
    /// Sum of absolute drift values for the session average
    total_abs_drift_us: AtomicU64,
    sample_count: AtomicU64,
    out_of_sync_count: AtomicU64,
    frames_rendered: AtomicU64,
    frames_dropped: AtomicU64,
    grace_samples: AtomicU64,
}

impl SyncController {
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            offset_ms: AtomicI64::new(config.offset_ms),
            late_threshold_us: AtomicU64::new(config.late_threshold_ms.saturating_mul(1000)),
            early_threshold_us: AtomicU64::new(config.early_threshold_ms.saturating_mul(1000)),
            overhead_us: AtomicU64::new(config.scheduling_overhead_ms.saturating_mul(1000)),
            drop_late_frames: AtomicBool::new(config.drop_late_frames),
            window: Mutex::new(DriftWindow::new(config.drift_window)),
            current_drift_us: AtomicI64::new(0),
            max_behind_us: AtomicI64::new(0),
            max_ahead_us: AtomicI64::new(0),
            total_abs_drift_us: AtomicU64::new(0),
            sample_count: AtomicU64::new(0),
            out_of_sync_count: AtomicU64::new(0),
            frames_rendered: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            grace_samples: AtomicU64::new(0),
        }
    }

    /// Current sync offset in milliseconds.
    pub fn sync_offset_ms(&self) -> i64 {
        self.offset_ms.load(Ordering::Acquire)
    }

    /// Sets the sync offset. Never blocks; the next drift computation uses it.
    pub fn set_sync_offset_ms(&self, offset_ms: i64) {
        let previous = self.offset_ms.swap(offset_ms, Ordering::AcqRel);
        if previous != offset_ms {
            tracing::info!("Sync offset changed: {:+}ms -> {:+}ms", previous, offset_ms);
        }
    }

    pub fn late_threshold(&self) -> Duration {
        Duration::from_micros(self.late_threshold_us.load(Ordering::Relaxed))
    }

    pub fn set_late_threshold(&self, threshold: Duration) {
        self.late_threshold_us
            .store(threshold.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn early_threshold(&self) -> Duration {
        Duration::from_micros(self.early_threshold_us.load(Ordering::Relaxed))
    }

    pub fn set_early_threshold(&self, threshold: Duration) {
        self.early_threshold_us
            .store(threshold.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn scheduling_overhead(&self) -> Duration {
        Duration::from_micros(self.overhead_us.load(Ordering::Relaxed))
    }

    pub fn set_scheduling_overhead(&self, overhead: Duration) {
        self.overhead_us
            .store(overhead.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn drops_late_frames(&self) -> bool {
        self.drop_late_frames.load(Ordering::Relaxed)
    }

    pub fn set_drop_late_frames(&self, enabled: bool) {
        self.drop_late_frames.store(enabled, Ordering::Relaxed);
    }

    /// Drift in microseconds of a frame at `pts` against `audio_time`.
    pub fn drift_us(&self, audio_time: Duration, pts: Duration) -> i64 {
        let audio_us = audio_time.as_micros() as i64;
        let pts_us = pts.as_micros() as i64;
        (audio_us - pts_us).saturating_add(self.sync_offset_ms().saturating_mul(1000))
    }

    /// Returns true if a frame with this drift may be presented without waiting.
    pub fn is_due(&self, drift_us: i64) -> bool {
        drift_us >= -(self.overhead_us.load(Ordering::Relaxed) as i64)
    }

    /// Applies the wait/render/drop policy to a frame with `drift_us`.
    ///
    /// `next_overdue` is only consulted for late frames; it reports whether
    /// the frame queued behind this one is already due as well.
    pub fn decide(&self, drift_us: i64, next_overdue: impl FnOnce() -> bool) -> FrameDecision {
        let late = self.late_threshold_us.load(Ordering::Relaxed) as i64;
        let early = self.early_threshold_us.load(Ordering::Relaxed) as i64;

        if drift_us > late {
            if self.drops_late_frames() && next_overdue() {
                FrameDecision::Drop
            } else {
                FrameDecision::Render
            }
        } else if drift_us < -early {
            let overhead = self.overhead_us.load(Ordering::Relaxed) as i64;
            let wait_us = (-drift_us - overhead).max(0) as u64;
            FrameDecision::Wait(Duration::from_micros(wait_us))
        } else {
            FrameDecision::Render
        }
    }

    /// Returns true if `drift_us` lies outside the late/early band.
    pub fn exceeds_threshold(&self, drift_us: i64) -> bool {
        drift_us > self.late_threshold_us.load(Ordering::Relaxed) as i64
            || drift_us < -(self.early_threshold_us.load(Ordering::Relaxed) as i64)
    }

    /// Records a drift sample and returns the rolling average in microseconds.
    pub fn record(&self, sequence: u64, drift_us: i64) -> i64 {
        let average = self.window.lock().push(DriftSample { sequence, drift_us });

        // Skip max tracking during seek warmup to avoid transient spikes
        let in_grace = self
            .grace_samples
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1))
            .is_ok();

        self.current_drift_us.store(drift_us, Ordering::Relaxed);
        if !in_grace {
            if drift_us > 0 {
                self.max_behind_us.fetch_max(drift_us, Ordering::Relaxed);
            } else {
                self.max_ahead_us.fetch_min(drift_us, Ordering::Relaxed);
            }
        }

        self.total_abs_drift_us
            .fetch_add(drift_us.unsigned_abs(), Ordering::Relaxed);
        self.sample_count.fetch_add(1, Ordering::Relaxed);

        if drift_us.abs() > self.late_threshold_us.load(Ordering::Relaxed) as i64 {
            self.out_of_sync_count.fetch_add(1, Ordering::Relaxed);
        }
        average
    }

    pub fn record_rendered(&self) {
        self.frames_rendered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Rolling average drift over the window, in microseconds.
    pub fn rolling_average_us(&self) -> i64 {
        self.window.lock().average_us()
    }

    /// Returns a copy of the samples currently in the window, oldest first.
    pub fn drift_window(&self) -> Vec<DriftSample> {
        self.window.lock().samples.iter().copied().collect()
    }

    /// Clears statistics after a seek; the offset and thresholds are kept.
    pub fn reset(&self) {
        self.window.lock().clear();
        self.current_drift_us.store(0, Ordering::Relaxed);
        self.max_behind_us.store(0, Ordering::Relaxed);
        self.max_ahead_us.store(0, Ordering::Relaxed);
        self.total_abs_drift_us.store(0, Ordering::Relaxed);
        self.sample_count.store(0, Ordering::Relaxed);
        self.out_of_sync_count.store(0, Ordering::Relaxed);
        self.grace_samples.store(GRACE_SAMPLES, Ordering::Relaxed);
    }

    /// Returns true if the latest drift is within the late threshold.
    pub fn is_in_sync(&self) -> bool {
        self.current_drift_us.load(Ordering::Relaxed).abs()
            <= self.late_threshold_us.load(Ordering::Relaxed) as i64
    }

    pub fn snapshot(&self) -> SyncSnapshot {
        let sample_count = self.sample_count.load(Ordering::Relaxed);
        let total_abs = self.total_abs_drift_us.load(Ordering::Relaxed);
        SyncSnapshot {
            offset_ms: self.sync_offset_ms(),
            current_drift_us: self.current_drift_us.load(Ordering::Relaxed),
            rolling_avg_drift_us: self.rolling_average_us(),
            mean_abs_drift_us: if sample_count > 0 {
                total_abs / sample_count
            } else {
                0
            },
            max_behind_us: self.max_behind_us.load(Ordering::Relaxed),
            max_ahead_us: self.max_ahead_us.load(Ordering::Relaxed),
            sample_count,
            out_of_sync_count: self.out_of_sync_count.load(Ordering::Relaxed),
            frames_rendered: self.frames_rendered.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
        }
    }
}

impl Default for SyncController {
    fn default() -> Self {
        Self::new(&SyncConfig::default())
    }
}

/// Point-in-time copy of the sync statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncSnapshot {
    pub offset_ms: i64,
    /// Latest drift (positive = video behind audio)
    pub current_drift_us: i64,
    /// Average drift over the rolling window
    pub rolling_avg_drift_us: i64,
    /// Mean absolute drift since the last reset
    pub mean_abs_drift_us: u64,
    pub max_behind_us: i64,
    pub max_ahead_us: i64,
    pub sample_count: u64,
    /// Samples whose drift exceeded the late threshold
    pub out_of_sync_count: u64,
    pub frames_rendered: u64,
    pub frames_dropped: u64,
}

impl SyncSnapshot {
    pub fn current_drift_ms(&self) -> i64 {
        self.current_drift_us / 1000
    }

    pub fn rolling_avg_drift_ms(&self) -> i64 {
        self.rolling_avg_drift_us / 1000
    }

    /// Largest drift magnitude in either direction, in milliseconds.
    pub fn max_drift_ms(&self) -> i64 {
        self.max_behind_us.max(-self.max_ahead_us) / 1000
    }

    /// Percentage of samples that were out of sync.
    pub fn out_of_sync_percentage(&self) -> f64 {
        if self.sample_count == 0 {
            return 0.0;
        }
        self.out_of_sync_count as f64 / self.sample_count as f64 * 100.0
    }

    /// Returns a human-readable summary of sync quality.
    pub fn quality_summary(&self) -> String {
        let max_drift = self.max_drift_ms();
        let quality = if max_drift < SYNC_DRIFT_THRESHOLD_MS {
            "Excellent"
        } else if max_drift < SYNC_DRIFT_WARNING_MS {
            "Good"
        } else if max_drift < SYNC_DRIFT_SEVERE_MS {
            "Fair"
        } else {
            "Poor"
        };

        format!(
            "{quality} (max drift: {max_drift:+}ms, mean |drift|: {}ms, {:.1}% out of sync, {} dropped)",
            self.mean_abs_drift_us / 1000,
            self.out_of_sync_percentage(),
            self.frames_dropped
        )
    }
}

impl std::fmt::Display for SyncSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "A/V Sync: drift={:+}ms avg={:+}ms (max ahead={:+}ms, behind={:+}ms), offset={:+}ms, {} samples, {:.1}% out of sync",
            self.current_drift_ms(),
            self.rolling_avg_drift_ms(),
            self.max_ahead_us / 1000,
            self.max_behind_us / 1000,
            self.offset_ms,
            self.sample_count,
            self.out_of_sync_percentage()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(offset_ms: i64) -> SyncController {
        SyncController::new(&SyncConfig {
            offset_ms,
            drift_window: 4,
            ..SyncConfig::default()
        })
    }

    #[test]
    fn test_drift_formula_includes_offset() {
        let sync = controller(0);
        let drift = sync.drift_us(Duration::from_millis(1_000), Duration::from_millis(1_040));
        assert_eq!(drift, -40_000);

        sync.set_sync_offset_ms(1500);
        let drift = sync.drift_us(Duration::from_millis(1_000), Duration::from_millis(1_040));
        assert_eq!(drift, 1_460_000);

        // Out-of-range offsets saturate instead of overflowing
        sync.set_sync_offset_ms(i64::MAX);
        assert_eq!(sync.drift_us(Duration::ZERO, Duration::ZERO), i64::MAX);
    }

    #[test]
    fn test_huge_thresholds_saturate() {
        let sync = SyncController::new(&SyncConfig {
            late_threshold_ms: u64::MAX,
            ..SyncConfig::default()
        });
        assert_eq!(sync.late_threshold(), Duration::from_micros(u64::MAX));
    }

    #[test]
    fn test_offset_change_takes_effect_immediately() {
        let sync = controller(0);
        sync.set_sync_offset_ms(300);
        sync.set_sync_offset_ms(-200);
        assert_eq!(sync.sync_offset_ms(), -200);
        assert_eq!(sync.drift_us(Duration::from_secs(5), Duration::from_secs(5)), -200_000);
    }

    #[test]
    fn test_decide_policy() {
        let sync = controller(0);
        assert_eq!(sync.decide(0, || unreachable!()), FrameDecision::Render);
        assert_eq!(sync.decide(90_000, || unreachable!()), FrameDecision::Render);
        assert_eq!(sync.decide(-5_000, || unreachable!()), FrameDecision::Render);
        assert_eq!(
            sync.decide(-40_000, || unreachable!()),
            FrameDecision::Wait(Duration::from_millis(38))
        );
        assert_eq!(sync.decide(250_000, || true), FrameDecision::Drop);
        assert_eq!(sync.decide(250_000, || false), FrameDecision::Render);

        sync.set_drop_late_frames(false);
        assert_eq!(sync.decide(250_000, || true), FrameDecision::Render);
    }

    #[test]
    fn test_thresholds_are_runtime_tunable() {
        let sync = controller(0);
        sync.set_late_threshold(Duration::from_millis(20));
        assert_eq!(sync.decide(50_000, || true), FrameDecision::Drop);
        sync.set_early_threshold(Duration::from_millis(100));
        assert_eq!(sync.decide(-40_000, || unreachable!()), FrameDecision::Render);
    }

    #[test]
    fn test_rolling_window_average() {
        let sync = controller(0);
        assert_eq!(sync.record(0, 10_000), 10_000);
        assert_eq!(sync.record(1, 20_000), 15_000);
        sync.record(2, 30_000);
        sync.record(3, 40_000);
        // Window of 4: the first sample falls out
        assert_eq!(sync.record(4, 50_000), 35_000);
        assert_eq!(sync.drift_window().len(), 4);
        assert_eq!(sync.drift_window()[0].sequence, 1);
    }

    #[test]
    fn test_snapshot_and_reset() {
        let sync = controller(0);
        sync.record(0, 120_000);
        sync.record(1, -30_000);
        sync.record_rendered();
        sync.record_dropped();

        let snap = sync.snapshot();
        assert_eq!(snap.sample_count, 2);
        assert_eq!(snap.out_of_sync_count, 1);
        assert_eq!(snap.max_behind_us, 120_000);
        assert_eq!(snap.max_ahead_us, -30_000);
        assert_eq!(snap.mean_abs_drift_us, 75_000);
        assert_eq!(snap.max_drift_ms(), 120);
        assert!(snap.quality_summary().starts_with("Good"));
        assert!(snap.to_string().starts_with("A/V Sync:"));

        sync.reset();
        // Grace period: a spike right after reset is not kept as max
        sync.record(0, 500_000);
        let snap = sync.snapshot();
        assert_eq!(snap.max_behind_us, 0);
        assert_eq!(snap.sample_count, 1);
        assert!(!sync.is_in_sync());
        assert_eq!(snap.frames_rendered, 1);
    }
}
