//! The master clock: audio presentation time.
//!
//! The audio output driver is the only writer. The render loop, the sync
//! controller and the UI read it on every frame, so it is a single atomic
//! word with no lock on either side.
//!
//! The word packs the seek generation (upper 16 bits) next to the position
//! in microseconds (lower 48 bits, about 8.9 years). Packing both lets a
//! driver that is still finishing a pre-seek block lose its compare-exchange
//! instead of moving the clock back to the old position after the reset.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

const MICROS_BITS: u32 = 48;
const MICROS_MASK: u64 = (1 << MICROS_BITS) - 1;
const GENERATION_MASK: u64 = 0xFFFF;

fn pack(generation: u64, position: Duration) -> u64 {
    let micros = (position.as_micros() as u64).min(MICROS_MASK);
    ((generation & GENERATION_MASK) << MICROS_BITS) | micros
}

fn unpack(word: u64) -> (u64, Duration) {
    (word >> MICROS_BITS, Duration::from_micros(word & MICROS_MASK))
}

/// Shared handle to the audio presentation clock.
#[derive(Clone, Default)]
pub struct MasterClock {
    word: Arc<AtomicU64>,
}

impl MasterClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current audio presentation time.
    pub fn now(&self) -> Duration {
        unpack(self.word.load(Ordering::Acquire)).1
    }

    /// Generation of the last reset, truncated to 16 bits.
    pub fn generation(&self) -> u64 {
        unpack(self.word.load(Ordering::Acquire)).0
    }

    /// Moves the clock forward to `position`.
    ///
    /// Ignored when `generation` is not the clock's current generation (the
    /// caller is still working on pre-seek data) or when `position` is not
    /// ahead of the current value. Returns true if the clock moved.
    pub fn advance(&self, generation: u64, position: Duration) -> bool {
        let generation = generation & GENERATION_MASK;
        let target = pack(generation, position);
        let mut current = self.word.load(Ordering::Acquire);

        loop {
            let (current_gen, _) = unpack(current);
            if current_gen != generation || target <= current {
                return false;
            }
            match self.word.compare_exchange_weak(
                current,
                target,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Sets the clock to `position` and starts `generation`.
    ///
    /// This is the only operation that may move the clock backwards.
    pub fn reset(&self, generation: u64, position: Duration) {
        self.word.store(pack(generation, position), Ordering::Release);
        tracing::debug!(
            "Master clock reset to {:?} (generation {})",
            position,
            generation & GENERATION_MASK
        );
    }

    /// Returns true if `generation` matches the clock's current generation.
    pub fn is_current(&self, generation: u64) -> bool {
        self.generation() == generation & GENERATION_MASK
    }
}

impl std::fmt::Debug for MasterClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (generation, position) = unpack(self.word.load(Ordering::Acquire));
        f.debug_struct("MasterClock")
            .field("generation", &generation)
            .field("position", &position)
            .finish()
    }
}
