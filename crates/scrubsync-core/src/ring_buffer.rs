//! Lock-free SPSC ring of interleaved f32 samples.
//!
//! Sits between the output driver thread and the audio device callback.
//! Only the producer modifies `write_pos`, only the consumer modifies
//! `read_pos`, so the callback never waits on a lock.
//!
//! The producer never overwrites unread samples: [`SampleProducer::push`]
//! stores what fits and reports how many it took. A sink's `write` only
//! returns once the device buffer has taken the whole block, so the master
//! clock never runs ahead of what the device holds.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

struct RingShared {
    /// f32 samples stored as bits; power-of-two length
    buffer: Box<[AtomicU32]>,
    /// Monotonic, masked on access. Only the producer writes it
    write_pos: AtomicUsize,
    /// Monotonic, masked on access. Only the consumer writes it
    read_pos: AtomicUsize,
    mask: usize,
    capacity: usize,
    /// Bumped by the producer on flush; the consumer snaps to `flush_pos`
    flush_generation: AtomicU64,
    flush_pos: AtomicUsize,
    underruns: AtomicU64,
}

/// Writing half, owned by the sink.
pub struct SampleProducer {
    shared: Arc<RingShared>,
}

/// Reading half, owned by the device callback.
pub struct SampleConsumer {
    shared: Arc<RingShared>,
    generation: u64,
}

/// Creates a ring holding at least `capacity` samples.
pub fn sample_ring(capacity: usize) -> (SampleProducer, SampleConsumer) {
    let capacity = capacity.max(64).next_power_of_two();
    let shared = Arc::new(RingShared {
        buffer: (0..capacity)
            .map(|_| AtomicU32::new(0.0f32.to_bits()))
            .collect::<Vec<_>>()
            .into_boxed_slice(),
        write_pos: AtomicUsize::new(0),
        read_pos: AtomicUsize::new(0),
        mask: capacity - 1,
        capacity,
        flush_generation: AtomicU64::new(0),
        flush_pos: AtomicUsize::new(0),
        underruns: AtomicU64::new(0),
    });
    (
        SampleProducer {
            shared: Arc::clone(&shared),
        },
        SampleConsumer {
            shared,
            generation: 0,
        },
    )
}

impl SampleProducer {
    /// Copies as many of `samples` as fit. Returns the number written.
    pub fn push(&self, samples: &[f32]) -> usize {
        let s = &self.shared;
        let wp = s.write_pos.load(Ordering::Relaxed);
        let count = self.free(wp).min(samples.len());

        let mut idx = wp & s.mask;
        for &sample in &samples[..count] {
            s.buffer[idx].store(sample.to_bits(), Ordering::Relaxed);
            idx = (idx + 1) & s.mask;
        }
        s.write_pos.store(wp.wrapping_add(count), Ordering::Release);
        count
    }

    /// Discards everything buffered so far. The consumer skips it on its
    /// next read; space is available to the producer immediately.
    pub fn flush(&self) {
        let s = &self.shared;
        s.flush_pos
            .store(s.write_pos.load(Ordering::Relaxed), Ordering::Relaxed);
        s.flush_generation.fetch_add(1, Ordering::Release);
    }

    /// Samples buffered and not yet read.
    pub fn len(&self) -> usize {
        let wp = self.shared.write_pos.load(Ordering::Relaxed);
        self.shared.capacity - self.free(wp)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Times the consumer found the ring empty.
    pub fn underruns(&self) -> u64 {
        self.shared.underruns.load(Ordering::Relaxed)
    }

    fn free(&self, wp: usize) -> usize {
        let s = &self.shared;
        let rp = s.read_pos.load(Ordering::Acquire);
        // A flush the consumer has not seen yet already counts as read
        let flushed = s.flush_pos.load(Ordering::Relaxed);
        let used = wp.wrapping_sub(rp).min(wp.wrapping_sub(flushed));
        s.capacity - used.min(s.capacity)
    }
}

impl SampleConsumer {
    /// Takes the next sample, or None when the ring is empty.
    pub fn pop(&mut self) -> Option<f32> {
        let s = &self.shared;

        let generation = s.flush_generation.load(Ordering::Acquire);
        if generation != self.generation {
            self.generation = generation;
            let target = s.flush_pos.load(Ordering::Relaxed);
            let rp = s.read_pos.load(Ordering::Relaxed);
            let wp = s.write_pos.load(Ordering::Acquire);
            // Only ever skip forward
            if wp.wrapping_sub(target) < wp.wrapping_sub(rp) {
                s.read_pos.store(target, Ordering::Release);
            }
        }

        let rp = s.read_pos.load(Ordering::Relaxed);
        let wp = s.write_pos.load(Ordering::Acquire);
        if rp == wp {
            s.underruns.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        let sample = f32::from_bits(s.buffer[rp & s.mask].load(Ordering::Relaxed));
        s.read_pos.store(rp.wrapping_add(1), Ordering::Release);
        Some(sample)
    }
}
