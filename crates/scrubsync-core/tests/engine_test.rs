//! End-to-end tests of the threaded engine on synthetic media.
//!
//! Audio goes to a [`PacedSink`], so these run in real time; streams are
//! kept short and assertions leave generous scheduling margins.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use scrubsync_core::{
    AudioBlock, AudioSink, EngineConfig, EngineEvent, ErrorCategory, EventReceiver, PacedSink, PlaybackEngine,
    PlaybackState, SinkControl, SinkError, SyncConfig, SyntheticConfig, SyntheticMedia,
    VideoFrame,
};

fn config() -> EngineConfig {
    EngineConfig {
        sync: SyncConfig {
            offset_ms: 0,
            ..SyncConfig::default()
        },
        ..EngineConfig::default()
    }
}

/// Engine whose presenter records every presented timestamp.
fn engine(media: &SyntheticMedia) -> (PlaybackEngine, Arc<Mutex<Vec<Duration>>>, SinkControl) {
    let presented = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&presented);

    let sink = PacedSink::new();
    let control = sink.control();
    let slot = Mutex::new(Some(sink));

    let mut engine = PlaybackEngine::new(config(), move |frame: &VideoFrame| {
        seen.lock().push(frame.pts);
    })
    .unwrap()
    .with_sink_factory(move |_| {
        slot.lock()
            .take()
            .map(|sink| Box::new(sink) as Box<dyn AudioSink>)
            .ok_or_else(|| SinkError::Backend("sink already opened".into()))
    });
    engine.load_streams(media.streams()).unwrap();
    (engine, presented, control)
}

fn wait_for_event(
    rx: &EventReceiver,
    timeout: Duration,
    mut pred: impl FnMut(&EngineEvent) -> bool,
) -> Option<EngineEvent> {
    let deadline = Instant::now() + timeout;
    while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
        match rx.recv_timeout(remaining) {
            Ok(event) if pred(&event) => return Some(event),
            Ok(_) => {}
            Err(_) => return None,
        }
    }
    None
}

fn device_errors(events: &[EngineEvent]) -> usize {
    events
        .iter()
        .filter(|e| {
            matches!(
                e,
                EngineEvent::PlaybackError {
                    category: ErrorCategory::DeviceUnavailable,
                    ..
                }
            )
        })
        .count()
}

fn media(secs: u64, fps: f32) -> SyntheticMedia {
    SyntheticMedia::new(SyntheticConfig::new(Duration::from_secs(secs), fps).with_audio(48_000, 2))
}

#[test]
fn test_load_shows_preview_frame_and_is_ready() {
    let media = media(5, 24.0);
    let (engine, presented, _control) = engine(&media);
    assert_eq!(engine.state(), PlaybackState::Ready);

    let deadline = Instant::now() + Duration::from_secs(2);
    while presented.lock().is_empty() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(presented.lock().first(), Some(&Duration::ZERO));
    // Still paused: the preview is the only frame
    thread::sleep(Duration::from_millis(100));
    assert_eq!(presented.lock().len(), 1);
}

#[test]
fn test_seek_discards_frames_from_before_the_seek() {
    let media = media(20, 24.0);
    let (mut engine, presented, _control) = engine(&media);

    engine.play().unwrap();
    thread::sleep(Duration::from_millis(300));

    let target = engine.seek(12.0).unwrap();
    assert_eq!(target, Duration::from_secs(12));
    assert!(engine.wait_for_seek(Duration::from_secs(2)).unwrap());
    assert_eq!(engine.state(), PlaybackState::Playing);

    thread::sleep(Duration::from_millis(50));
    presented.lock().clear();
    thread::sleep(Duration::from_millis(500));

    let after = presented.lock().clone();
    assert!(!after.is_empty());
    assert!(after.iter().all(|pts| *pts >= target), "{after:?}");
    assert!(engine.position() >= target);
    assert!(engine
        .poll_events()
        .contains(&EngineEvent::SeekCompleted { position: target }));
}

#[test]
fn test_seek_past_end_clamps_to_duration() {
    let media = media(60, 24.0);
    let (mut engine, _presented, _control) = engine(&media);

    assert_eq!(engine.seek(200.0).unwrap(), Duration::from_secs(60));
    assert!(engine.wait_for_seek(Duration::from_secs(2)).unwrap());
    assert_eq!(engine.clock_time(), Duration::from_secs(60));
    // Seeking from Ready comes back to Ready
    assert_eq!(engine.state(), PlaybackState::Ready);

    assert_eq!(engine.seek(-5.0).unwrap(), Duration::ZERO);
    assert!(engine.wait_for_seek(Duration::from_secs(2)).unwrap());
    assert_eq!(engine.clock_time(), Duration::ZERO);
}

#[test]
fn test_rapid_seeks_settle_on_last_target() {
    let media = media(30, 24.0);
    let (mut engine, presented, _control) = engine(&media);
    engine.play().unwrap();

    for secs in [3.0, 9.0, 14.0, 21.0, 25.0] {
        engine.seek(secs).unwrap();
    }
    assert!(engine.wait_for_seek(Duration::from_secs(3)).unwrap());
    assert!(engine.clock_time() >= Duration::from_secs(25));

    thread::sleep(Duration::from_millis(50));
    presented.lock().clear();
    thread::sleep(Duration::from_millis(300));
    assert!(presented
        .lock()
        .iter()
        .all(|pts| *pts >= Duration::from_secs(25)));
}

#[test]
fn test_device_loss_continues_on_wall_clock() {
    let media = media(20, 24.0);
    let (mut engine, _presented, control) = engine(&media);
    let rx = engine.events();

    engine.play().unwrap();
    thread::sleep(Duration::from_millis(400));
    control.disconnect();

    assert!(wait_for_event(&rx, Duration::from_secs(2), |e| matches!(
        e,
        EngineEvent::PlaybackError {
            category: ErrorCategory::DeviceUnavailable,
            ..
        }
    ))
    .is_some());

    let before = engine.position();
    thread::sleep(Duration::from_millis(500));
    assert!(engine.position() > before + Duration::from_millis(250));
    assert_eq!(engine.state(), PlaybackState::Playing);

    // No duplicate report however many blocks fail afterwards
    let rest: Vec<_> = rx.try_iter().collect();
    assert_eq!(device_errors(&rest), 0);
}

/// Plays a few blocks in real time, then panics inside `write`.
struct FaultySink {
    inner: PacedSink,
    blocks_left: u32,
}

impl AudioSink for FaultySink {
    fn write(&mut self, block: &AudioBlock) -> Result<(), SinkError> {
        if self.blocks_left == 0 {
            panic!("output driver fault");
        }
        self.blocks_left -= 1;
        self.inner.write(block)
    }

    fn label(&self) -> &'static str {
        "faulty"
    }
}

#[test]
fn test_output_thread_panic_falls_back_to_wall_clock() {
    let media = media(20, 24.0);
    let mut engine = PlaybackEngine::new(config(), |_: &VideoFrame| {})
        .unwrap()
        .with_sink_factory(|_| {
            let sink = FaultySink {
                inner: PacedSink::new(),
                blocks_left: 10,
            };
            Ok(Box::new(sink) as Box<dyn AudioSink>)
        });
    engine.load_streams(media.streams()).unwrap();
    let rx = engine.events();
    engine.play().unwrap();

    assert!(wait_for_event(&rx, Duration::from_secs(2), |e| matches!(
        e,
        EngineEvent::PlaybackError {
            category: ErrorCategory::DeviceUnavailable,
            ..
        }
    ))
    .is_some());

    let before = engine.position();
    thread::sleep(Duration::from_millis(500));
    assert!(engine.position() > before + Duration::from_millis(250));
    assert_eq!(engine.state(), PlaybackState::Playing);
}

#[test]
fn test_missing_device_plays_video_only() {
    let media = media(10, 24.0);
    let mut engine = PlaybackEngine::new(config(), |_: &VideoFrame| {})
        .unwrap()
        .with_sink_factory(|_| Err(SinkError::Backend("no output device".into())));
    engine.load_streams(media.streams()).unwrap();
    engine.play().unwrap();
    thread::sleep(Duration::from_millis(500));

    assert!(engine.position() > Duration::from_millis(200));
    assert_eq!(device_errors(&engine.poll_events()), 1);
}

#[test]
fn test_segment_end_pauses_within_a_frame() {
    let media = media(20, 30.0);
    let (mut engine, _presented, _control) = engine(&media);
    let rx = engine.events();

    engine.set_segment_bounds(9.0, 10.0).unwrap();
    engine.seek(9.5).unwrap();
    assert!(engine.wait_for_seek(Duration::from_secs(2)).unwrap());
    engine.play().unwrap();

    let event = wait_for_event(&rx, Duration::from_secs(3), |e| {
        matches!(e, EngineEvent::SegmentEndReached { .. })
    });
    let Some(EngineEvent::SegmentEndReached { position }) = event else {
        panic!("segment end not reached");
    };
    let error = position.as_secs_f64() - 10.0;
    assert!((0.0..0.034).contains(&error.abs()), "stopped at {position:?}");

    thread::sleep(Duration::from_millis(100));
    assert_eq!(engine.state(), PlaybackState::Paused);
    let paused_at = engine.position();
    thread::sleep(Duration::from_millis(200));
    assert_eq!(engine.position(), paused_at);
    assert!(paused_at < Duration::from_secs(10));
}

#[test]
fn test_zero_length_segment_is_widened() {
    let media = media(20, 24.0);
    let (engine, _presented, _control) = engine(&media);

    let bounds = engine.set_segment_bounds(5.0, 5.0).unwrap();
    assert_eq!(bounds.start, Duration::from_secs(5));
    assert_eq!(bounds.end, Duration::from_millis(5_100));

    // Dragging the start into the end stops at the minimum length
    for secs in [5.05, 5.5, 8.0, 20.0] {
        let bounds = engine.drag_segment_start(secs).unwrap().unwrap();
        assert!(bounds.len() >= Duration::from_millis(100), "{bounds:?}");
    }
    let end = engine.drag_segment_end(0.0).unwrap().unwrap();
    assert!(end.len() >= Duration::from_millis(100));
}

#[test]
fn test_end_of_stream_then_play_restarts() {
    let media = media(1, 24.0);
    let (mut engine, _presented, _control) = engine(&media);
    let rx = engine.events();

    engine.play().unwrap();
    assert!(wait_for_event(&rx, Duration::from_secs(4), |e| {
        *e == EngineEvent::StateChanged(PlaybackState::Ended)
    })
    .is_some());
    assert_eq!(engine.state(), PlaybackState::Ended);

    engine.play().unwrap();
    assert!(engine.wait_for_seek(Duration::from_secs(2)).unwrap());
    thread::sleep(Duration::from_millis(100));
    assert_eq!(engine.state(), PlaybackState::Playing);
    assert!(engine.position() < Duration::from_millis(800));
}

#[test]
fn test_close_joins_threads_and_returns_to_idle() {
    let media = media(10, 24.0);
    let (mut engine, _presented, _control) = engine(&media);
    engine.play().unwrap();
    thread::sleep(Duration::from_millis(100));

    engine.close();
    assert_eq!(engine.state(), PlaybackState::Idle);
    assert!(engine.media_info().is_none());
    assert_eq!(engine.position(), Duration::ZERO);

    // The engine can load again
    engine.load_streams(media.streams()).unwrap();
    assert_eq!(engine.state(), PlaybackState::Ready);
}
