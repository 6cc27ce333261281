// src/core/cache/expiry.rs

//! A min-heap of cache-entry expiry times, popped by the eviction loop.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use tokio::time::Instant;

use super::CacheKey;

/// Heap entries carry a sequence number so re-inserted keys with equal deadlines
/// stay orderable without comparing keys.
#[derive(Debug)]
pub(crate) struct ExpiryHeap {
    heap: BinaryHeap<Reverse<(Instant, u64, CacheKey)>>,
    seq: u64,
}

impl ExpiryHeap {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            seq: 0,
        }
    }

    pub fn push(&mut self, deadline: Instant, key: CacheKey) {
        self.seq += 1;
        self.heap.push(Reverse((deadline, self.seq, key)));
    }

    /// The earliest scheduled deadline, if any.
    pub fn peek_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse((deadline, _, _))| *deadline)
    }

    /// Pops every entry scheduled at or before `now`.
    pub fn pop_due(&mut self, now: Instant) -> Vec<CacheKey> {
        let mut due = Vec::new();
        while let Some(Reverse((deadline, _, _))) = self.heap.peek() {
            if *deadline > now {
                break;
            }
            let Reverse((_, _, key)) = self.heap.pop().expect("peeked entry");
            due.push(key);
        }
        due
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }
}
