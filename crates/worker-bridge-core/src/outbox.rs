//! Bounded FIFO for messages produced while disconnected.

use std::collections::VecDeque;

/// Default capacity, matching the queue the control server tolerates on replay.
pub const DEFAULT_CAPACITY: usize = 1250;

/// Queue that evicts its oldest entry once full.
///
/// Callers get no delivery guarantee for anything pushed while offline.
#[derive(Debug)]
pub struct Outbox<T> {
    queue: VecDeque<T>,
    capacity: usize,
    dropped: u64,
}

impl<T> Default for Outbox<T> {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl<T> Outbox<T> {
    /// Create an outbox holding at most `capacity` items.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(capacity.min(32)),
            capacity,
            dropped: 0,
        }
    }

    /// Enqueue an item, returning the evicted oldest item when full.
    ///
    /// With zero capacity nothing is retained and the item itself is returned.
    pub fn push(&mut self, item: T) -> Option<T> {
        if self.capacity == 0 {
            self.dropped = self.dropped.saturating_add(1);
            return Some(item);
        }

        let evicted = if self.queue.len() >= self.capacity {
            self.dropped = self.dropped.saturating_add(1);
            self.queue.pop_front()
        } else {
            None
        };
        self.queue.push_back(item);
        evicted
    }

    /// Take every queued item, oldest first.
    pub fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        self.queue.drain(..)
    }

    /// Put an item back at the head, e.g. after a failed flush.
    pub fn requeue_front(&mut self, item: T) {
        if self.queue.len() >= self.capacity {
            self.dropped = self.dropped.saturating_add(1);
            return;
        }
        self.queue.push_front(item);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Total items evicted over the outbox's lifetime.
    #[must_use]
    pub const fn dropped(&self) -> u64 {
        self.dropped
    }
}
