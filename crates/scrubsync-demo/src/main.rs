//! Headless playback driver.
//!
//! Plays a file (or a generated test stream) through the engine without a
//! window, logs every engine event and prints the A/V sync report at the
//! end. Useful for checking drift on real media:
//!
//! ```bash
//! RUST_LOG=scrubsync_core=debug cargo run -p scrubsync-demo --features ffmpeg,cpal -- clip.mp4
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use scrubsync_core::{
    EngineConfig, EngineEvent, PlaybackEngine, PlaybackState, Result, SyntheticConfig,
    SyntheticMedia, VideoFrame,
};

#[derive(Parser, Debug)]
#[command(name = "scrubsync-demo", about = "Play media through the scrubsync engine")]
struct Args {
    /// Media file; a generated test stream is played when omitted
    file: Option<PathBuf>,

    /// Length of the generated stream in seconds
    #[arg(long, default_value_t = 30)]
    duration: u64,

    /// Frame rate of the generated stream
    #[arg(long, default_value_t = 24.0)]
    fps: f32,

    /// Generate a stream without audio (wall-clock playback)
    #[arg(long)]
    no_audio: bool,

    /// A/V sync offset in milliseconds (positive shows each frame earlier)
    #[arg(long, allow_hyphen_values = true)]
    offset: Option<i64>,

    /// Segment start in seconds
    #[arg(long, requires = "segment_end")]
    segment_start: Option<f64>,

    /// Segment end in seconds
    #[arg(long, requires = "segment_start")]
    segment_end: Option<f64>,

    /// Jump back to the segment start each time its end is reached
    #[arg(long, requires = "segment_start")]
    loop_segment: bool,

    /// Start position in seconds
    #[arg(long)]
    seek: Option<f64>,

    /// Stop after this many seconds of wall time
    #[arg(long, default_value_t = 10.0)]
    play_secs: f64,

    /// Output volume, 0-100
    #[arg(long, default_value_t = 100)]
    volume: u32,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("scrubsync_core=info,scrubsync_demo=info")
            }),
        )
        .init();

    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{}", err);
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> Result<()> {
    let mut config = EngineConfig::default();
    if let Some(offset) = args.offset {
        config.sync.offset_ms = offset;
    }

    let frames = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&frames);
    let mut engine = PlaybackEngine::new(config, move |_: &VideoFrame| {
        counter.fetch_add(1, Ordering::Relaxed);
    })?;
    engine.set_volume(args.volume);

    let info = match &args.file {
        Some(path) => engine.load(path)?,
        None => {
            let mut synthetic =
                SyntheticConfig::new(Duration::from_secs(args.duration), args.fps);
            if args.no_audio {
                synthetic = synthetic.without_audio();
            }
            tracing::info!("No file given, playing a generated {}s stream", args.duration);
            engine.load_streams(SyntheticMedia::new(synthetic).streams())?
        }
    };
    tracing::info!(
        "Loaded {:?} at {:.2} fps, sync offset {}ms",
        info.duration,
        info.frame_rate,
        engine.sync_offset()
    );

    if let (Some(start), Some(end)) = (args.segment_start, args.segment_end) {
        let bounds = engine.set_segment_bounds(start, end)?;
        tracing::info!("Segment {:?}..{:?}", bounds.start, bounds.end);
    }
    if let Some(secs) = args.seek {
        engine.seek(secs)?;
        engine.wait_for_seek(Duration::from_secs(5))?;
    }

    engine.play()?;
    let events = engine.events();
    let deadline = Instant::now() + Duration::from_secs_f64(args.play_secs.max(0.0));

    while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
        let Ok(event) = events.recv_timeout(remaining.min(Duration::from_millis(100))) else {
            continue;
        };
        match event {
            EngineEvent::TimeChanged { position } => {
                tracing::debug!("Position {:.2}s", position.as_secs_f64());
            }
            EngineEvent::SegmentEndReached { position } => {
                tracing::info!("Segment end at {:.3}s", position.as_secs_f64());
                if args.loop_segment {
                    if let Some(bounds) = engine.segment_bounds() {
                        engine.seek(bounds.start.as_secs_f64())?;
                        engine.play()?;
                    }
                }
            }
            EngineEvent::StateChanged(state) => {
                tracing::info!("State: {:?}", state);
                if matches!(state, PlaybackState::Ended | PlaybackState::Error) {
                    break;
                }
            }
            other => tracing::info!("{:?}", other),
        }
    }

    if let Some(snapshot) = engine.sync_snapshot() {
        println!("{snapshot}");
        println!("{}", snapshot.quality_summary());
    }
    println!(
        "Presented {} frames, stopped at {:.3}s",
        frames.load(Ordering::Relaxed),
        engine.position().as_secs_f64()
    );
    engine.close();
    Ok(())
}
