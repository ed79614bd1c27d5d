//! Linear sample-rate conversion for devices that cannot run at the media
//! rate.
//!
//! The FFmpeg backend already resamples to a fixed output rate; this only
//! bridges the gap when the device refuses that rate.

/// Streaming linear resampler over interleaved frames.
///
/// State carries across calls so consecutive blocks join without clicks.
pub struct LinearResampler {
    from: u32,
    to: u32,
    channels: usize,
    /// Read position in input frames, relative to `previous` when present
    position: f64,
    /// Last input frame of the previous call
    previous: Option<Vec<f32>>,
}

impl LinearResampler {
    pub fn new(from: u32, to: u32, channels: u16) -> Self {
        Self {
            from: from.max(1),
            to: to.max(1),
            channels: channels.max(1) as usize,
            position: 0.0,
            previous: None,
        }
    }

    pub fn is_passthrough(&self) -> bool {
        self.from == self.to
    }

    pub fn output_rate(&self) -> u32 {
        self.to
    }

    /// Forgets the previous block, e.g. after a seek.
    pub fn reset(&mut self) {
        self.position = 0.0;
        self.previous = None;
    }

    /// Appends the resampled form of `input` to `output`.
    pub fn process(&mut self, input: &[f32], output: &mut Vec<f32>) {
        if self.is_passthrough() {
            output.extend_from_slice(input);
            return;
        }

        let channels = self.channels;
        let input_frames = input.len() / channels;
        if input_frames == 0 {
            return;
        }
        let offset = usize::from(self.previous.is_some());
        let total = input_frames + offset;
        let step = self.from as f64 / self.to as f64;

        let previous = self.previous.as_deref();

        let mut position = self.position;
        while position + 1.0 < total as f64 {
            let index = position as usize;
            let frac = (position - index as f64) as f32;
            let a = frame_at(previous, input, channels, index);
            let b = frame_at(previous, input, channels, index + 1);
            output.extend(a.iter().zip(b).map(|(a, b)| a + (b - a) * frac));
            position += step;
        }

        // The last frame becomes index 0 of the next call
        self.position = position - (total - 1) as f64;
        let last = (input_frames - 1) * channels;
        self.previous = Some(input[last..last + channels].to_vec());
    }
}

/// Frame `index` of the previous frame (if any) followed by `input`.
fn frame_at<'a>(
    previous: Option<&'a [f32]>,
    input: &'a [f32],
    channels: usize,
    index: usize,
) -> &'a [f32] {
    match (previous, index) {
        (Some(previous), 0) => previous,
        (Some(_), _) => &input[(index - 1) * channels..index * channels],
        (None, _) => &input[index * channels..(index + 1) * channels],
    }
}
