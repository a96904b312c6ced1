//! Per-frame caps on expensive side effects (evictions, collider creation).

use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// A count of operations still allowed this frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameAllowance {
    cap: usize,
    spent: usize,
}

impl FrameAllowance {
    pub fn new(cap: usize) -> Self {
        Self { cap, spent: 0 }
    }

    /// Spend one unit. Returns false once the cap is reached.
    pub fn try_spend(&mut self) -> bool {
        if self.spent < self.cap {
            self.spent += 1;
            true
        } else {
            false
        }
    }

    pub fn remaining(&self) -> usize {
        self.cap - self.spent
    }

    pub fn spent(&self) -> usize {
        self.spent
    }

    pub fn exhausted(&self) -> bool {
        self.spent >= self.cap
    }
}

struct Deferred<T> {
    priority: f64,
    seq: u64,
    item: T,
}

impl<T> PartialEq for Deferred<T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<T> Eq for Deferred<T> {}

impl<T> PartialOrd for Deferred<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Deferred<T> {
    // BinaryHeap is a max-heap: the lowest score, then the oldest entry,
    // must compare greatest.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .total_cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Expensive operations waiting for frame budget.
///
/// Lower priority scores run first; equal scores run in submission order.
/// Work left over at the end of a frame keeps its place, so it is never
/// overtaken by later work of the same priority.
pub struct DeferredQueue<T> {
    heap: BinaryHeap<Deferred<T>>,
    next_seq: u64,
}

impl<T> Default for DeferredQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> DeferredQueue<T> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    pub fn push(&mut self, priority: f64, item: T) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Deferred {
            priority,
            seq,
            item,
        });
    }

    /// Take at most `cap` operations for this frame, best first.
    pub fn drain_frame(&mut self, cap: usize) -> Vec<T> {
        let mut allowance = FrameAllowance::new(cap);
        let mut out = Vec::new();
        while !self.heap.is_empty() && allowance.try_spend() {
            if let Some(d) = self.heap.pop() {
                out.push(d.item);
            }
        }
        out
    }

    /// Drop queued operations that no longer apply.
    pub fn retain(&mut self, mut keep: impl FnMut(&T) -> bool) {
        self.heap.retain(|d| keep(&d.item));
    }

    pub fn peek_priority(&self) -> Option<f64> {
        self.heap.peek().map(|d| d.priority)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
