//! Throttled, prioritized load requests.
//!
//! At most one request per tile is outstanding (pending or in flight), and
//! at most `max_concurrent` are in flight. Only pending requests can be
//! cancelled; in-flight loads always run to completion.

use std::collections::{HashMap, HashSet};

use tilestream_common::TileKey;

/// What happened to a `request_load` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// A new request was queued.
    Enqueued,
    /// Already queued; the request was only renewed.
    AlreadyPending,
    /// Already dispatched; nothing to do.
    InFlight,
}

/// A request moved to in-flight by [`LoadScheduler::dispatch`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadRequest {
    pub key: TileKey,
    pub priority: f64,
    pub submitted_frame: u64,
}

#[derive(Debug, Clone, Copy)]
struct PendingLoad {
    priority: f64,
    submitted_frame: u64,
    last_requested_frame: u64,
    seq: u64,
}

#[derive(Debug)]
pub struct LoadScheduler {
    max_concurrent: usize,
    pending: HashMap<TileKey, PendingLoad>,
    in_flight: HashMap<TileKey, f64>,
    next_seq: u64,
}

impl LoadScheduler {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent,
            pending: HashMap::new(),
            in_flight: HashMap::new(),
            next_seq: 0,
        }
    }

    /// Queue a load unless one is already outstanding. The priority is fixed
    /// by the first request; later calls only mark the request as still wanted.
    pub fn request_load(&mut self, key: TileKey, priority: f64, frame: u64) -> RequestOutcome {
        if self.in_flight.contains_key(&key) {
            return RequestOutcome::InFlight;
        }
        if let Some(p) = self.pending.get_mut(&key) {
            p.last_requested_frame = p.last_requested_frame.max(frame);
            return RequestOutcome::AlreadyPending;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending.insert(
            key,
            PendingLoad {
                priority,
                submitted_frame: frame,
                last_requested_frame: frame,
                seq,
            },
        );
        RequestOutcome::Enqueued
    }

    /// Move the best pending requests to in-flight, filling free slots.
    pub fn dispatch(&mut self) -> Vec<LoadRequest> {
        let slots = self.free_slots();
        if slots == 0 || self.pending.is_empty() {
            return Vec::new();
        }
        let mut ready: Vec<(TileKey, PendingLoad)> =
            self.pending.iter().map(|(k, p)| (*k, *p)).collect();
        ready.sort_by(|a, b| a.1.priority.total_cmp(&b.1.priority).then(a.1.seq.cmp(&b.1.seq)));
        ready.truncate(slots);

        ready
            .into_iter()
            .map(|(key, p)| {
                self.pending.remove(&key);
                self.in_flight.insert(key, p.priority);
                LoadRequest {
                    key,
                    priority: p.priority,
                    submitted_frame: p.submitted_frame,
                }
            })
            .collect()
    }

    /// Retire an in-flight request, whatever its outcome. Frees its slot.
    pub fn complete(&mut self, key: TileKey) -> bool {
        self.in_flight.remove(&key).is_some()
    }

    /// Cancel a pending request. In-flight requests are left alone.
    pub fn cancel(&mut self, key: TileKey) -> bool {
        self.pending.remove(&key).is_some()
    }

    /// Cancel pending requests nobody asked for during the last `unused_frames` frames.
    pub fn cancel_stale(&mut self, frame: u64, unused_frames: u64) -> Vec<TileKey> {
        let mut cancelled: Vec<TileKey> = self
            .pending
            .iter()
            .filter(|(_, p)| frame.saturating_sub(p.last_requested_frame) >= unused_frames)
            .map(|(k, _)| *k)
            .collect();
        cancelled.sort();
        for key in &cancelled {
            self.pending.remove(key);
        }
        cancelled
    }

    /// Drop every pending request belonging to `pred`, e.g. a hidden tileset.
    pub fn cancel_where(&mut self, mut pred: impl FnMut(TileKey) -> bool) -> Vec<TileKey> {
        let mut cancelled: Vec<TileKey> = self.pending.keys().copied().filter(|k| pred(*k)).collect();
        cancelled.sort();
        for key in &cancelled {
            self.pending.remove(key);
        }
        cancelled
    }

    /// Priority a pending or in-flight request was enqueued with.
    pub fn priority_of(&self, key: TileKey) -> Option<f64> {
        self.pending
            .get(&key)
            .map(|p| p.priority)
            .or_else(|| self.in_flight.get(&key).copied())
    }

    pub fn is_outstanding(&self, key: TileKey) -> bool {
        self.is_pending(key) || self.is_in_flight(key)
    }

    pub fn is_pending(&self, key: TileKey) -> bool {
        self.pending.contains_key(&key)
    }

    pub fn is_in_flight(&self, key: TileKey) -> bool {
        self.in_flight.contains_key(&key)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn in_flight_keys(&self) -> HashSet<TileKey> {
        self.in_flight.keys().copied().collect()
    }

    pub fn free_slots(&self) -> usize {
        self.max_concurrent.saturating_sub(self.in_flight.len())
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Lowering the limit never interrupts loads already in flight; it only
    /// holds back dispatch until enough complete.
    pub fn set_max_concurrent(&mut self, max_concurrent: usize) {
        self.max_concurrent = max_concurrent;
    }
}
