//! Audio output devices and volume control.
//!
//! The output driver (see [`audio_output`](crate::audio_output)) hands each
//! decoded block to an [`AudioSink`]. A sink's `write` returns once the
//! device has accepted the block, which is the moment the master clock may
//! move to the block's end.
//!
//! - [`PacedSink`] plays blocks in real time without hardware and can be
//!   unplugged at runtime through its [`SinkControl`].
//! - [`NullSink`] accepts everything immediately (for callers that drive
//!   time themselves).
//! - `CpalSink` (feature `cpal`) feeds the default output device.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use crate::error::SinkError;
use crate::media::{AudioBlock, MediaUnit};

#[cfg(feature = "cpal")]
pub use cpal_impl::CpalSink;

/// Volume and mute control shared between the UI and the output driver.
///
/// This is a lightweight handle that can be cloned freely.
#[derive(Clone)]
pub struct AudioHandle {
    inner: Arc<AudioHandleInner>,
}

struct AudioHandleInner {
    /// Volume level (0-100)
    volume: AtomicU32,
    muted: AtomicBool,
}

impl AudioHandle {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(AudioHandleInner {
                volume: AtomicU32::new(100),
                muted: AtomicBool::new(false),
            }),
        }
    }

    /// Returns the current volume (0-100).
    pub fn volume(&self) -> u32 {
        self.inner.volume.load(Ordering::Relaxed)
    }

    /// Sets the volume, clamped to 0-100.
    pub fn set_volume(&self, volume: u32) {
        self.inner.volume.store(volume.min(100), Ordering::Relaxed);
    }

    pub fn is_muted(&self) -> bool {
        self.inner.muted.load(Ordering::Relaxed)
    }

    pub fn set_muted(&self, muted: bool) {
        self.inner.muted.store(muted, Ordering::Relaxed);
    }

    /// Toggles the mute state.
    pub fn toggle_mute(&self) {
        self.inner.muted.fetch_xor(true, Ordering::Relaxed);
    }

    /// Returns the effective gain (0.0-1.0) accounting for mute.
    pub fn effective_volume(&self) -> f32 {
        if self.is_muted() {
            0.0
        } else {
            self.volume() as f32 / 100.0
        }
    }

    /// Scales `samples` in place by the effective volume.
    pub fn apply(&self, samples: &mut [f32]) {
        let gain = self.effective_volume();
        if gain >= 1.0 {
            return;
        }
        for sample in samples {
            *sample *= gain;
        }
    }
}

impl Default for AudioHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// A hardware or simulated audio output.
///
/// Sinks are created and dropped on the output driver thread, so they need
/// not be `Send`.
pub trait AudioSink {
    /// Hands one block to the device, blocking until the device accepts it.
    fn write(&mut self, block: &AudioBlock) -> Result<(), SinkError>;

    /// Stops output; buffered samples are kept.
    fn pause(&mut self) {}

    /// Resumes output after [`pause`](Self::pause).
    fn resume(&mut self) {}

    /// Discards anything buffered for the old position after a seek.
    fn flush(&mut self) {}

    /// Short name used in log lines.
    fn label(&self) -> &'static str;
}

impl<S: AudioSink + ?Sized> AudioSink for Box<S> {
    fn write(&mut self, block: &AudioBlock) -> Result<(), SinkError> {
        (**self).write(block)
    }

    fn pause(&mut self) {
        (**self).pause()
    }

    fn resume(&mut self) {
        (**self).resume()
    }

    fn flush(&mut self) {
        (**self).flush()
    }

    fn label(&self) -> &'static str {
        (**self).label()
    }
}

/// Remote control for a [`PacedSink`], used to simulate unplugging the device.
#[derive(Clone, Default)]
pub struct SinkControl {
    disconnected: Arc<AtomicBool>,
    blocks_written: Arc<AtomicU64>,
}

impl SinkControl {
    /// Makes every subsequent write fail with [`SinkError::Disconnected`].
    pub fn disconnect(&self) {
        self.disconnected.store(true, Ordering::Release);
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    /// Number of blocks the sink has accepted.
    pub fn blocks_written(&self) -> u64 {
        self.blocks_written.load(Ordering::Relaxed)
    }
}

/// Plays blocks in real time by sleeping for each block's duration.
///
/// `write` returns when the block would have finished playing on a device
/// with a single block of buffering. Consecutive writes are scheduled
/// back-to-back so timing does not accumulate sleep overshoot.
pub struct PacedSink {
    control: SinkControl,
    next_deadline: Option<Instant>,
}

impl PacedSink {
    pub fn new() -> Self {
        Self {
            control: SinkControl::default(),
            next_deadline: None,
        }
    }

    pub fn control(&self) -> SinkControl {
        self.control.clone()
    }
}

impl Default for PacedSink {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioSink for PacedSink {
    fn write(&mut self, block: &AudioBlock) -> Result<(), SinkError> {
        if self.control.is_disconnected() {
            return Err(SinkError::Disconnected);
        }

        let now = Instant::now();
        // After an underrun the device restarts from now
        let start = match self.next_deadline {
            Some(deadline) if deadline > now => deadline,
            _ => now,
        };
        let end = start + MediaUnit::duration(block);
        if let Some(wait) = end.checked_duration_since(Instant::now()) {
            thread::sleep(wait);
        }
        self.next_deadline = Some(end);

        if self.control.is_disconnected() {
            return Err(SinkError::Disconnected);
        }
        self.control.blocks_written.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn pause(&mut self) {
        self.next_deadline = None;
    }

    fn flush(&mut self) {
        self.next_deadline = None;
    }

    fn label(&self) -> &'static str {
        "paced"
    }
}

/// Accepts every block immediately.
#[derive(Default)]
pub struct NullSink {
    control: SinkControl,
}

impl NullSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn control(&self) -> SinkControl {
        self.control.clone()
    }
}

impl AudioSink for NullSink {
    fn write(&mut self, _block: &AudioBlock) -> Result<(), SinkError> {
        if self.control.is_disconnected() {
            return Err(SinkError::Disconnected);
        }
        self.control.blocks_written.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn label(&self) -> &'static str {
        "null"
    }
}

#[cfg(feature = "cpal")]
mod cpal_impl {
    use std::time::Duration;

    use super::*;
    use crate::resample::LinearResampler;
    use crate::ring_buffer::{sample_ring, SampleConsumer, SampleProducer};
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::{FromSample, SampleFormat, SizedSample};

    /// Samples buffered between `write` and the device callback.
    const BUFFER_SECONDS: f32 = 0.1;

    /// How long `write` waits for buffer space before declaring the device dead.
    const STALL_TIMEOUT: Duration = Duration::from_secs(2);

    /// Sleep between checks for buffer space.
    const SPACE_POLL: Duration = Duration::from_millis(2);

    /// Flags shared with the device callbacks.
    struct StreamFlags {
        /// Set by the stream error callback
        failed: AtomicBool,
        playing: AtomicBool,
    }

    /// Output through the system's default device.
    ///
    /// Blocks go through a lock-free sample ring that the cpal callback
    /// drains; `write` waits while the ring is full. The sink is opened and
    /// dropped on the output driver thread, which owns the stream.
    pub struct CpalSink {
        producer: SampleProducer,
        flags: Arc<StreamFlags>,
        /// The cpal output stream (kept alive; audio stops when dropped)
        stream: cpal::Stream,
        resampler: LinearResampler,
        scratch: Vec<f32>,
        sample_rate: u32,
        channels: u16,
    }

    impl CpalSink {
        /// Opens the default output device for media at `sample_rate` with
        /// `channels` interleaved source channels.
        ///
        /// The stream runs at the media rate when the device supports it,
        /// otherwise at the device's own rate with blocks resampled on write.
        pub fn open(sample_rate: u32, channels: u16) -> Result<Self, SinkError> {
            let host = cpal::default_host();
            let device = host
                .default_output_device()
                .ok_or_else(|| SinkError::Backend("No audio output device available".into()))?;

            let supported = device
                .default_output_config()
                .map_err(|e| SinkError::Backend(format!("Failed to get output config: {e}")))?;
            let sample_format = supported.sample_format();
            let device_rate = supported.sample_rate();
            let native_channels = supported.channels().max(1);

            let mut device_channels = native_channels.clamp(1, 2);
            if device_channels != native_channels
                && !is_config_supported(&device, device_channels, sample_format, device_rate)
            {
                tracing::debug!(
                    "Device has no {}ch config, using its {} channels",
                    device_channels,
                    native_channels
                );
                device_channels = native_channels;
            }

            let mut stream_rate = sample_rate;
            if stream_rate != device_rate
                && !is_config_supported(&device, device_channels, sample_format, stream_rate)
            {
                tracing::warn!(
                    "Media sample rate {}Hz not supported for {:?}/{}ch, resampling to device rate {}Hz",
                    stream_rate,
                    sample_format,
                    device_channels,
                    device_rate,
                );
                stream_rate = device_rate;
            }

            let config = cpal::StreamConfig {
                channels: device_channels,
                sample_rate: stream_rate,
                buffer_size: cpal::BufferSize::Default,
            };

            let capacity =
                (stream_rate as f32 * BUFFER_SECONDS) as usize * channels.max(1) as usize;
            let (producer, consumer) = sample_ring(capacity);
            let flags = Arc::new(StreamFlags {
                failed: AtomicBool::new(false),
                playing: AtomicBool::new(true),
            });

            let stream = match sample_format {
                SampleFormat::I16 => {
                    build_stream::<i16>(&device, &config, channels, consumer, &flags)
                }
                SampleFormat::U16 => {
                    build_stream::<u16>(&device, &config, channels, consumer, &flags)
                }
                SampleFormat::I32 => {
                    build_stream::<i32>(&device, &config, channels, consumer, &flags)
                }
                SampleFormat::F32 => {
                    build_stream::<f32>(&device, &config, channels, consumer, &flags)
                }
                SampleFormat::F64 => {
                    build_stream::<f64>(&device, &config, channels, consumer, &flags)
                }
                other => Err(SinkError::Backend(format!(
                    "Unsupported output sample format: {other:?}"
                ))),
            }?;
            stream
                .play()
                .map_err(|e| SinkError::Backend(format!("cpal stream play failed: {e}")))?;

            if stream_rate != sample_rate {
                tracing::info!(
                    "Audio output initialized (cpal, media={}Hz, stream={}Hz, {}ch)",
                    sample_rate,
                    stream_rate,
                    device_channels
                );
            } else {
                tracing::info!(
                    "Audio output initialized (cpal, {}Hz, {}ch)",
                    stream_rate,
                    device_channels
                );
            }

            Ok(Self {
                producer,
                flags,
                stream,
                resampler: LinearResampler::new(sample_rate, stream_rate, channels),
                scratch: Vec::new(),
                sample_rate,
                channels,
            })
        }

        /// Pushes `samples` into the ring, waiting for the callback to make room.
        fn push_all(&self, mut samples: &[f32]) -> Result<(), SinkError> {
            let mut last_progress = Instant::now();
            while !samples.is_empty() {
                if self.flags.failed.load(Ordering::Acquire) {
                    return Err(SinkError::Disconnected);
                }
                let written = self.producer.push(samples);
                samples = &samples[written..];
                if written > 0 {
                    last_progress = Instant::now();
                } else if last_progress.elapsed() >= STALL_TIMEOUT {
                    return Err(SinkError::Disconnected);
                } else {
                    thread::sleep(SPACE_POLL);
                }
            }
            Ok(())
        }
    }

    fn is_config_supported(
        device: &cpal::Device,
        channels: u16,
        sample_format: SampleFormat,
        sample_rate: u32,
    ) -> bool {
        let Ok(configs) = device.supported_output_configs() else {
            return false;
        };
        configs.into_iter().any(|cfg| {
            cfg.channels() == channels
                && cfg.sample_format() == sample_format
                && sample_rate >= cfg.min_sample_rate()
                && sample_rate <= cfg.max_sample_rate()
        })
    }

    fn build_stream<T>(
        device: &cpal::Device,
        config: &cpal::StreamConfig,
        source_channels: u16,
        mut consumer: SampleConsumer,
        flags: &Arc<StreamFlags>,
    ) -> Result<cpal::Stream, SinkError>
    where
        T: SizedSample + FromSample<f32>,
    {
        let output_channels = config.channels as usize;
        let source_channels = source_channels.clamp(1, 2) as usize;
        let data_flags = Arc::clone(flags);
        let error_flags = Arc::clone(flags);

        device
            .build_output_stream(
                config,
                move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                    let zero = T::from_sample(0.0f32);
                    if !data_flags.playing.load(Ordering::Acquire) {
                        data.fill(zero);
                        return;
                    }

                    for frame in data.chunks_mut(output_channels) {
                        let (left, right) = if source_channels == 1 {
                            let mono = consumer.pop().unwrap_or(0.0);
                            (mono, mono)
                        } else {
                            let left = consumer.pop().unwrap_or(0.0);
                            let right = consumer.pop().unwrap_or(0.0);
                            (left, right)
                        };
                        match frame {
                            [mono] => *mono = T::from_sample((left + right) * 0.5),
                            [l, r, rest @ ..] => {
                                *l = T::from_sample(left);
                                *r = T::from_sample(right);
                                rest.fill(zero);
                            }
                            [] => {}
                        }
                    }
                },
                move |err| {
                    tracing::error!("cpal audio error: {err}");
                    error_flags.failed.store(true, Ordering::Release);
                },
                None,
            )
            .map_err(|e| SinkError::Backend(format!("Failed to build cpal stream: {e}")))
    }

    impl AudioSink for CpalSink {
        fn write(&mut self, block: &AudioBlock) -> Result<(), SinkError> {
            if block.sample_rate != self.sample_rate || block.channels != self.channels {
                tracing::warn!(
                    "Block format {}Hz/{}ch differs from device stream {}Hz/{}ch",
                    block.sample_rate,
                    block.channels,
                    self.sample_rate,
                    self.channels
                );
            }

            if self.resampler.is_passthrough() {
                return self.push_all(&block.data);
            }
            let mut scratch = std::mem::take(&mut self.scratch);
            scratch.clear();
            self.resampler.process(&block.data, &mut scratch);
            let result = self.push_all(&scratch);
            self.scratch = scratch;
            result
        }

        fn pause(&mut self) {
            self.flags.playing.store(false, Ordering::Release);
            // pause() may not be supported on all platforms; the playing flag fills silence
            let _ = self.stream.pause();
        }

        fn resume(&mut self) {
            self.flags.playing.store(true, Ordering::Release);
            if let Err(e) = self.stream.play() {
                tracing::error!("cpal stream play failed: {e}");
            }
        }

        fn flush(&mut self) {
            self.producer.flush();
            self.resampler.reset();
        }

        fn label(&self) -> &'static str {
            "cpal"
        }
    }
}
