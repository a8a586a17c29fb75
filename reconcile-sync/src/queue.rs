//! Bounded per-key update queue.
//!
//! Absorbs bursts so producers never wait on conflict resolution. Each key
//! holds at most `capacity_per_key` pending operations; when a key is full the
//! oldest pending operation for that key is evicted to make room. Arrival
//! order is preserved globally, and therefore per key.

use crate::operation::UpdateOperation;
use std::collections::{HashMap, VecDeque};

/// Default number of pending operations per key.
pub const DEFAULT_QUEUE_CAPACITY: usize = 10;

/// Default number of operations processed per drain batch.
pub const DEFAULT_BATCH_SIZE: usize = 5;

/// FIFO of pending updates with a per-key bound.
#[derive(Debug)]
pub struct UpdateQueue<T> {
    pending: VecDeque<UpdateOperation<T>>,
    per_key: HashMap<String, usize>,
    capacity_per_key: usize,
}

impl<T> UpdateQueue<T> {
    /// Creates an empty queue.
    pub fn new(capacity_per_key: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            per_key: HashMap::new(),
            capacity_per_key: capacity_per_key.max(1),
        }
    }

    /// Enqueues an operation, returning the operation evicted to make room.
    pub fn push(&mut self, op: UpdateOperation<T>) -> Option<UpdateOperation<T>> {
        let mut evicted = None;
        if self.pending_for(&op.key) >= self.capacity_per_key {
            if let Some(pos) = self.pending.iter().position(|queued| queued.key == op.key) {
                evicted = self.pending.remove(pos);
                self.decrement(&op.key);
            }
        }

        *self.per_key.entry(op.key.clone()).or_default() += 1;
        self.pending.push_back(op);
        evicted
    }

    /// Removes up to `max` operations from the front of the queue.
    pub fn take_batch(&mut self, max: usize) -> Vec<UpdateOperation<T>> {
        let n = max.min(self.pending.len());
        let batch: Vec<_> = self.pending.drain(..n).collect();
        for op in &batch {
            self.decrement(&op.key);
        }
        batch
    }

    /// Drops every pending operation for a key. Returns how many were dropped.
    pub fn remove_key(&mut self, key: &str) -> usize {
        let before = self.pending.len();
        self.pending.retain(|op| op.key != key);
        self.per_key.remove(key);
        before - self.pending.len()
    }

    /// Pending operations for a key.
    pub fn pending_for(&self, key: &str) -> usize {
        self.per_key.get(key).copied().unwrap_or(0)
    }

    /// Iterates over pending operations for a key, oldest first.
    pub fn iter_key<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a UpdateOperation<T>> {
        self.pending.iter().filter(move |op| op.key == key)
    }

    /// Total pending operations.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn decrement(&mut self, key: &str) {
        if let Some(count) = self.per_key.get_mut(key) {
            *count -= 1;
            if *count == 0 {
                self.per_key.remove(key);
            }
        }
    }
}

impl<T> Default for UpdateQueue<T> {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}
