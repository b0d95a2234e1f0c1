// src/ring.rs
//! Bounded lockless MPMC ring of event-slot indices
//!
//! Multi-producer multi-consumer FIFO used for event queues, order queues
//! and free-id pools. A full ring reports the shortfall as a count, it
//! never stalls the producer.

use crossbeam_queue::ArrayQueue;

/// Fixed-capacity FIFO of pointer-sized slots
pub(crate) struct Ring {
    q: ArrayQueue<u32>,
}

impl Ring {
    /// Create a ring with the given capacity (power of two)
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        debug_assert!(capacity.is_power_of_two());
        Self {
            q: ArrayQueue::new(capacity),
        }
    }

    /// Enqueue one item; returns it back if the ring is full
    pub fn enqueue(&self, item: u32) -> Result<(), u32> {
        self.q.push(item)
    }

    /// Enqueue items until the ring fills up; returns the number accepted
    pub fn enqueue_burst(&self, items: &[u32]) -> usize {
        for (n, &item) in items.iter().enumerate() {
            if self.q.push(item).is_err() {
                return n;
            }
        }
        items.len()
    }

    /// Dequeue one item
    pub fn dequeue(&self) -> Option<u32> {
        self.q.pop()
    }

    /// Dequeue up to `out.len()` items; returns the number dequeued
    pub fn dequeue_burst(&self, out: &mut [u32]) -> usize {
        for (n, slot) in out.iter_mut().enumerate() {
            match self.q.pop() {
                Some(item) => *slot = item,
                None => return n,
            }
        }
        out.len()
    }

    /// Number of items currently in the ring
    #[must_use]
    pub fn count(&self) -> usize {
        self.q.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.q.is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.q.capacity()
    }
}
