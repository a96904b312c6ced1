//! Decoded tile payloads with least-recently-used eviction.
//!
//! Recency is the frame a tile was last used by traversal. Entries touched
//! in the current frame are never evicted, and the total cost never exceeds
//! the hard maximum.

use std::collections::{BTreeSet, HashMap};

use tilestream_common::TileKey;

use crate::budget::FrameAllowance;
use crate::config::SceneOptions;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CacheError {
    #[error("cache is at its hard maximum of {hard_max}; cannot insert tile {key}")]
    CapacityExceeded { key: TileKey, hard_max: usize },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheLimits {
    pub target_size: usize,
    pub hard_max: usize,
    pub max_unload_ratio: f32,
}

impl CacheLimits {
    pub fn from_options(options: &SceneOptions) -> Self {
        Self {
            target_size: options.lru_cache_target_size,
            hard_max: options.lru_cache_max_size,
            max_unload_ratio: options.lru_max_frame_unload_ratio,
        }
    }

    /// `floor(max_unload_ratio * hard_max)`.
    pub fn max_unloads_per_pass(&self) -> usize {
        (self.max_unload_ratio.max(0.0) * self.hard_max as f32).floor() as usize
    }
}

/// Outcome of one eviction pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvictionReport {
    pub evicted: Vec<TileKey>,
    /// The per-frame unload cap stopped the pass above target.
    pub capped: bool,
    /// Only entries used this frame were left above target.
    pub blocked_by_used: bool,
}

struct CacheEntry<C> {
    content: C,
    last_used: u64,
    cost: usize,
}

pub struct TileCache<C> {
    limits: CacheLimits,
    entries: HashMap<TileKey, CacheEntry<C>>,
    /// (last used frame, key), oldest first.
    recency: BTreeSet<(u64, TileKey)>,
    total_cost: usize,
    frame: u64,
    last_pass: Option<u64>,
}

impl<C> TileCache<C> {
    pub fn new(limits: CacheLimits) -> Self {
        Self {
            limits,
            entries: HashMap::new(),
            recency: BTreeSet::new(),
            total_cost: 0,
            frame: 0,
            last_pass: None,
        }
    }

    pub fn limits(&self) -> &CacheLimits {
        &self.limits
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Start a new frame. Frames never go backwards.
    pub fn begin_frame(&mut self, frame: u64) {
        self.frame = self.frame.max(frame);
    }

    /// Mark an entry as used in the current frame. Returns whether it exists.
    pub fn touch(&mut self, key: TileKey) -> bool {
        let Some(entry) = self.entries.get_mut(&key) else {
            return false;
        };
        if entry.last_used < self.frame {
            self.recency.remove(&(entry.last_used, key));
            entry.last_used = self.frame;
            self.recency.insert((self.frame, key));
        }
        true
    }

    pub fn get(&self, key: TileKey) -> Option<&C> {
        self.entries.get(&key).map(|e| &e.content)
    }

    pub fn contains(&self, key: TileKey) -> bool {
        self.entries.contains_key(&key)
    }

    pub fn last_used(&self, key: TileKey) -> Option<u64> {
        self.entries.get(&key).map(|e| e.last_used)
    }

    pub fn insert(&mut self, key: TileKey, content: C) -> Result<Vec<TileKey>, CacheError> {
        self.insert_with_cost(key, content, 1)
    }

    /// Insert content, evicting least-recently-used entries not used this
    /// frame if the hard maximum would be exceeded. Returns the keys evicted
    /// to make room. The new entry counts as not yet used this frame.
    pub fn insert_with_cost(
        &mut self,
        key: TileKey,
        content: C,
        cost: usize,
    ) -> Result<Vec<TileKey>, CacheError> {
        let replaced_cost = self.entries.get(&key).map_or(0, |e| e.cost);
        let needed = (self.total_cost - replaced_cost + cost).saturating_sub(self.limits.hard_max);

        let mut victims = Vec::new();
        if needed > 0 {
            let mut freed = 0;
            for &(last_used, victim) in &self.recency {
                if freed >= needed || last_used >= self.frame {
                    break;
                }
                if victim == key {
                    continue;
                }
                freed += self.entries.get(&victim).map_or(0, |e| e.cost);
                victims.push(victim);
            }
            if freed < needed {
                return Err(CacheError::CapacityExceeded {
                    key,
                    hard_max: self.limits.hard_max,
                });
            }
        }
        for &victim in &victims {
            self.remove(victim);
            tracing::debug!(%victim, "evicted to make room");
        }

        let stamp = self.frame.saturating_sub(1);
        let last_used = match self.entries.remove(&key) {
            Some(old) => {
                self.recency.remove(&(old.last_used, key));
                self.total_cost -= old.cost;
                old.last_used.max(stamp)
            }
            None => stamp,
        };
        self.entries.insert(
            key,
            CacheEntry {
                content,
                last_used,
                cost,
            },
        );
        self.recency.insert((last_used, key));
        self.total_cost += cost;
        Ok(victims)
    }

    /// Remove an entry, releasing its content to the caller.
    pub fn remove(&mut self, key: TileKey) -> Option<C> {
        let entry = self.entries.remove(&key)?;
        self.recency.remove(&(entry.last_used, key));
        self.total_cost -= entry.cost;
        Some(entry.content)
    }

    /// Shrink towards the target size, oldest first, never touching entries
    /// used this frame and stopping at the per-frame unload cap. Runs at most
    /// once per frame; later calls in the same frame do nothing.
    pub fn eviction_pass(&mut self) -> EvictionReport {
        let mut report = EvictionReport::default();
        if self.last_pass == Some(self.frame) {
            return report;
        }
        self.last_pass = Some(self.frame);

        let mut allowance = FrameAllowance::new(self.limits.max_unloads_per_pass());
        while self.total_cost > self.limits.target_size {
            let Some(&(last_used, key)) = self.recency.first() else {
                break;
            };
            if last_used >= self.frame {
                report.blocked_by_used = true;
                break;
            }
            if !allowance.try_spend() {
                report.capped = true;
                break;
            }
            // Content is dropped here, synchronously.
            self.remove(key);
            report.evicted.push(key);
        }
        if !report.evicted.is_empty() {
            tracing::debug!(
                evicted = report.evicted.len(),
                remaining = self.entries.len(),
                capped = report.capped,
                "eviction pass"
            );
        }
        report
    }

    pub fn oldest(&self) -> Option<TileKey> {
        self.recency.first().map(|&(_, key)| key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_cost(&self) -> usize {
        self.total_cost
    }

    pub fn keys(&self) -> impl Iterator<Item = TileKey> + '_ {
        self.entries.keys().copied()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.recency.clear();
        self.total_cost = 0;
    }
}
