//! Engine configuration.
//!
//! Everything here has a working default. The host application may embed an
//! [`EngineConfig`] in its own settings file; every group deserializes with
//! missing fields filled from [`Default`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Upper bound for the drift thresholds and the scheduling overhead.
pub const MAX_THRESHOLD_MS: u64 = 60_000;

/// Largest sync offset accepted in either direction (one hour).
pub const MAX_OFFSET_MS: u64 = 3_600_000;

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub queues: QueueConfig,
    pub sync: SyncConfig,
    pub segment: SegmentConfig,
    pub notify: NotifyConfig,
}

impl EngineConfig {
    /// Checks value ranges that would otherwise deadlock or divide by zero.
    pub fn validate(&self) -> Result<()> {
        let sync = &self.sync;
        if [
            sync.late_threshold_ms,
            sync.early_threshold_ms,
            sync.scheduling_overhead_ms,
        ]
        .iter()
        .any(|ms| *ms > MAX_THRESHOLD_MS)
        {
            return Err(EngineError::InvalidConfig(format!(
                "drift thresholds must not exceed {MAX_THRESHOLD_MS}ms"
            )));
        }
        if sync.offset_ms.unsigned_abs() > MAX_OFFSET_MS {
            return Err(EngineError::InvalidConfig(format!(
                "sync offset must be within ±{MAX_OFFSET_MS}ms"
            )));
        }
        if self.queues.video_capacity == 0 || self.queues.audio_capacity == 0 {
            return Err(EngineError::InvalidConfig(
                "queue capacities must be non-zero".into(),
            ));
        }
        if self.sync.drift_window == 0 {
            return Err(EngineError::InvalidConfig(
                "drift window must hold at least one sample".into(),
            ));
        }
        if self.segment.min_duration_ms == 0 {
            return Err(EngineError::InvalidConfig(
                "minimum segment duration must be non-zero".into(),
            ));
        }
        if !self.segment.window_pad_secs.is_finite() || self.segment.window_pad_secs <= 0.0 {
            return Err(EngineError::InvalidConfig(
                "window padding must be a positive number of seconds".into(),
            ));
        }
        Ok(())
    }
}

/// Bounded queue sizes between the decoders and the consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Decoded video frames buffered ahead of the render loop
    pub video_capacity: usize,
    /// Decoded audio blocks buffered ahead of the output driver
    pub audio_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            video_capacity: 5,
            audio_capacity: 32,
        }
    }
}

/// Drift correction parameters. All of these can also be changed at runtime
/// through [`SyncController`](crate::sync::SyncController).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Initial sync offset in milliseconds (positive makes frames due earlier)
    pub offset_ms: i64,
    /// Drift above which a frame counts as overdue
    pub late_threshold_ms: u64,
    /// Drift below the negative of which a frame is held back
    pub early_threshold_ms: u64,
    /// Subtracted from waits to absorb wake-up latency
    pub scheduling_overhead_ms: u64,
    /// Skip overdue frames when the next frame is overdue too
    pub drop_late_frames: bool,
    /// Number of drift samples in the rolling window
    pub drift_window: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            offset_ms: 1500,
            late_threshold_ms: 100,
            early_threshold_ms: 10,
            scheduling_overhead_ms: 2,
            drop_late_frames: true,
            drift_window: 100,
        }
    }
}

/// Segment editing parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentConfig {
    /// Padding around a segment for the scrubber's visible window
    pub window_pad_secs: f64,
    /// Shortest segment the boundaries may be dragged to
    pub min_duration_ms: u64,
}

impl SegmentConfig {
    pub fn window_pad(&self) -> Duration {
        Duration::from_secs_f64(self.window_pad_secs.max(0.0))
    }

    pub fn min_duration(&self) -> Duration {
        Duration::from_millis(self.min_duration_ms)
    }
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            window_pad_secs: 30.0,
            min_duration_ms: 100,
        }
    }
}

/// Outbound notification pacing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    /// Minimum interval between time-changed events
    pub time_changed_interval_ms: u64,
}

impl NotifyConfig {
    pub fn time_changed_interval(&self) -> Duration {
        Duration::from_millis(self.time_changed_interval_ms)
    }
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            time_changed_interval_ms: 250,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.sync.offset_ms, 1500);
        assert_eq!(config.sync.late_threshold_ms, 100);
        assert_eq!(config.sync.drift_window, 100);
        assert_eq!(config.segment.window_pad(), Duration::from_secs(30));
        assert_eq!(config.segment.min_duration(), Duration::from_millis(100));
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{ "sync": { "offset_ms": -250 } }"#).unwrap();
        assert_eq!(config.sync.offset_ms, -250);
        assert_eq!(config.sync.late_threshold_ms, 100);
        assert_eq!(config.queues, QueueConfig::default());
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let mut config = EngineConfig::default();
        config.queues.video_capacity = 0;
        assert!(matches!(
            config.validate(),
            Err(EngineError::InvalidConfig(_))
        ));

        let mut config = EngineConfig::default();
        config.segment.window_pad_secs = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_bounds_thresholds_and_offset() {
        let mut config = EngineConfig::default();
        config.sync.late_threshold_ms = u64::MAX;
        assert!(matches!(
            config.validate(),
            Err(EngineError::InvalidConfig(_))
        ));

        let mut config = EngineConfig::default();
        config.sync.offset_ms = i64::MIN;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.sync.late_threshold_ms = MAX_THRESHOLD_MS;
        config.sync.offset_ms = -(MAX_OFFSET_MS as i64);
        assert!(config.validate().is_ok());
    }
}
