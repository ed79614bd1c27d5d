//! Bounded queues between the decode workers and their consumers.
//!
//! One [`BoundedQueue`] carries video frames to the render loop and another
//! carries audio blocks to the output driver. Producers block when the queue
//! is full and consumers block when it is empty. A flush (during seek) clears
//! the queue and advances its generation under the same mutex, so a unit
//! decoded before the flush can never be pushed after it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::media::MediaUnit;

/// An entry in a [`BoundedQueue`].
#[derive(Debug)]
pub enum QueueItem<T> {
    /// A decoded unit
    Unit(T),
    /// The producer reached end of stream; nothing follows in this generation
    EndOfStream { generation: u64 },
}

struct QueueState<T> {
    items: VecDeque<QueueItem<T>>,
    /// Only units stamped with this generation are accepted
    generation: u64,
}

/// A thread-safe bounded queue of decoded media units.
pub struct BoundedQueue<T> {
    state: Mutex<QueueState<T>>,
    capacity: usize,
    /// Signalled when an item is pushed
    item_available: Condvar,
    /// Signalled when an item is popped or the queue is flushed
    space_available: Condvar,
    /// Set on teardown; wakes and releases every blocked thread
    stopped: AtomicBool,
    name: &'static str,
}

impl<T: MediaUnit> BoundedQueue<T> {
    /// Creates a queue holding at most `capacity` items.
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                generation: 0,
            }),
            capacity: capacity.max(1),
            item_available: Condvar::new(),
            space_available: Condvar::new(),
            stopped: AtomicBool::new(false),
            name,
        }
    }

    /// Pushes a unit, blocking while the queue is full.
    ///
    /// Returns false if the queue was stopped or the unit belongs to an older
    /// generation than the queue (it was decoded before a flush). Rejected
    /// units are dropped.
    pub fn push(&self, unit: T) -> bool {
        let generation = unit.generation();
        self.push_item(QueueItem::Unit(unit), generation)
    }

    /// Pushes the end-of-stream marker for `generation`.
    pub fn push_end_of_stream(&self, generation: u64) -> bool {
        self.push_item(QueueItem::EndOfStream { generation }, generation)
    }

    fn push_item(&self, item: QueueItem<T>, generation: u64) -> bool {
        let mut state = self.state.lock();

        while state.items.len() >= self.capacity {
            if self.is_stopped() || state.generation != generation {
                return false;
            }
            self.space_available.wait(&mut state);
        }

        // Check again after waiting: a flush may have happened meanwhile
        if self.is_stopped() || state.generation != generation {
            return false;
        }

        state.items.push_back(item);
        self.item_available.notify_one();
        true
    }

    /// Takes the next item without blocking.
    pub fn try_pop(&self) -> Option<QueueItem<T>> {
        let mut state = self.state.lock();
        let item = state.items.pop_front();
        if item.is_some() {
            self.space_available.notify_one();
        }
        item
    }

    /// Takes the next item, blocking up to `timeout` for one to arrive.
    ///
    /// Returns None on timeout or when the queue is stopped.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<QueueItem<T>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();

        while state.items.is_empty() {
            if self.is_stopped() {
                return None;
            }
            if self
                .item_available
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                break;
            }
        }

        let item = state.items.pop_front();
        if item.is_some() {
            self.space_available.notify_one();
        }
        item
    }

    /// Takes the next item only if `pred` accepts it. Never blocks.
    pub fn pop_if(&self, pred: impl FnOnce(&QueueItem<T>) -> bool) -> Option<QueueItem<T>> {
        let mut state = self.state.lock();
        if !state.items.front().is_some_and(pred) {
            return None;
        }
        let item = state.items.pop_front();
        self.space_available.notify_one();
        item
    }

    /// Applies `f` to the next queued unit without removing it.
    ///
    /// Returns None when the queue is empty or the head is the end marker.
    pub fn peek_with<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        let state = self.state.lock();
        match state.items.front() {
            Some(QueueItem::Unit(unit)) => Some(f(unit)),
            _ => None,
        }
    }

    /// Discards everything queued and moves the queue to `generation`.
    ///
    /// Blocked producers wake up; those holding units from the previous
    /// generation get `false` from [`push`](Self::push).
    pub fn flush(&self, generation: u64) -> usize {
        let dropped = {
            let mut state = self.state.lock();
            let count = state.items.len();
            state.items.clear();
            state.generation = generation;
            count
        };
        self.space_available.notify_all();
        self.item_available.notify_all();

        tracing::debug!(
            "{} queue flush: dropped {} items, generation={}",
            self.name,
            dropped,
            generation
        );
        dropped
    }

    /// Returns the generation the queue currently accepts.
    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    /// Returns the number of items currently in the queue.
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Returns true if the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if the queue is full.
    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Stops the queue, waking every blocked producer and consumer.
    ///
    /// Called during teardown so no worker stays parked in `push` while the
    /// session is being joined.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        // Take the lock so a waiter between its check and its wait can't miss this
        drop(self.state.lock());
        self.space_available.notify_all();
        self.item_available.notify_all();
    }

    /// Returns true if the queue has been stopped.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}
