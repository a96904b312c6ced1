//! Per-frame orchestration over one or more tilesets sharing a cache and a
//! load scheduler.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use tilestream_common::{TileId, TileKey, TilesetId, Viewpoint};
use tilestream_hierarchy::{HierarchyError, TileDescriptor, TileTree};

use crate::budget::DeferredQueue;
use crate::cache::{CacheLimits, TileCache};
use crate::config::{ConfigError, SceneOptions, TilesetOptions};
use crate::error_model::{PerspectiveErrorModel, ScreenSpaceErrorModel};
use crate::loader::{LoadCompletion, LoadJob, LoadQueue};
use crate::priority::{DepthDistancePriority, PriorityInput, TilePriority};
use crate::runtime::{LoadStatus, RuntimeTable};
use crate::scheduler::{LoadScheduler, RequestOutcome};
use crate::traversal::{FrameTraversal, LoadCandidate};

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("hierarchy error: {0}")]
    Hierarchy(#[from] HierarchyError),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("unknown tileset {0:?}")]
    UnknownTileset(TilesetId),
    #[error("a scene holds at most {max} tilesets")]
    TooManyTilesets { max: usize },
}

/// A tileset waiting to be added to a [`Scene`].
pub struct TilesetEntry {
    tree: TileTree,
    options: TilesetOptions,
    priority: Box<dyn TilePriority>,
    error_model: Box<dyn ScreenSpaceErrorModel>,
}

impl TilesetEntry {
    pub fn new(tree: TileTree, options: TilesetOptions) -> Self {
        Self {
            tree,
            options,
            priority: Box::new(DepthDistancePriority),
            error_model: Box::new(PerspectiveErrorModel),
        }
    }

    pub fn from_descriptors(
        descriptors: Vec<TileDescriptor>,
        options: TilesetOptions,
    ) -> Result<Self, StreamError> {
        Ok(Self::new(TileTree::from_descriptors(descriptors)?, options))
    }

    pub fn with_priority(mut self, priority: impl TilePriority + 'static) -> Self {
        self.priority = Box::new(priority);
        self
    }

    pub fn with_error_model(mut self, model: impl ScreenSpaceErrorModel + 'static) -> Self {
        self.error_model = Box::new(model);
        self
    }
}

/// A tileset owned by a scene, with its runtime state.
pub struct Tileset {
    tree: TileTree,
    options: TilesetOptions,
    priority: Box<dyn TilePriority>,
    error_model: Box<dyn ScreenSpaceErrorModel>,
    runtime: RuntimeTable,
    visible: bool,
}

impl Tileset {
    pub fn tree(&self) -> &TileTree {
        &self.tree
    }

    pub fn options(&self) -> &TilesetOptions {
        &self.options
    }

    pub fn runtime(&self) -> &RuntimeTable {
        &self.runtime
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    /// Tiles currently in `status`, in id order.
    pub fn tiles_with_status(&self, status: LoadStatus) -> Vec<TileId> {
        self.tree
            .iter()
            .filter(|node| self.runtime.status(node.id) == status)
            .map(|node| node.id)
            .collect()
    }
}

/// Counters for one [`Scene::update`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameStats {
    pub visited: usize,
    pub culled: usize,
    pub selected: usize,
    pub rendered: usize,
    /// Requests newly enqueued this frame.
    pub requested: usize,
    pub dispatched: usize,
    pub cancelled: usize,
    pub completed: usize,
    pub failed: usize,
    /// Loads that finished but did not fit in the cache.
    pub rejected: usize,
    pub evicted: usize,
    pub processed: usize,
    pub cache_len: usize,
    pub cache_cost: usize,
    pub pending: usize,
    pub in_flight: usize,
    pub traversal_time: Duration,
}

/// What the host needs from a frame.
#[derive(Debug, Clone, Default)]
pub struct FrameReport {
    pub frame: u64,
    /// Tiles to draw, content available through [`Scene::content`].
    pub render: Vec<TileKey>,
    /// Newly loaded tiles cleared for collider creation this frame.
    pub processed: Vec<TileKey>,
    /// Tiles whose content was dropped this frame.
    pub evicted: Vec<TileKey>,
    pub stats: FrameStats,
}

pub struct Scene<C> {
    options: SceneOptions,
    tilesets: Vec<Tileset>,
    cache: TileCache<C>,
    scheduler: LoadScheduler,
    processing: DeferredQueue<TileKey>,
    frame: u64,
}

impl<C> Scene<C> {
    pub fn new(options: SceneOptions) -> Result<Self, StreamError> {
        options.validate()?;
        Ok(Self {
            cache: TileCache::new(CacheLimits::from_options(&options)),
            scheduler: LoadScheduler::new(options.max_concurrent_requests),
            processing: DeferredQueue::new(),
            tilesets: Vec::new(),
            options,
            frame: 0,
        })
    }

    pub fn add_tileset(&mut self, entry: TilesetEntry) -> Result<TilesetId, StreamError> {
        entry.options.validate()?;
        let index = self.tilesets.len();
        let id = u16::try_from(index).map_err(|_| StreamError::TooManyTilesets {
            max: usize::from(u16::MAX) + 1,
        })?;
        tracing::debug!(
            tileset = index,
            name = %entry.options.name,
            tiles = entry.tree.len(),
            max_depth = entry.tree.max_depth(),
            "tileset added"
        );
        self.tilesets.push(Tileset {
            runtime: RuntimeTable::new(entry.tree.len()),
            visible: entry.options.show,
            tree: entry.tree,
            options: entry.options,
            priority: entry.priority,
            error_model: entry.error_model,
        });
        Ok(TilesetId(id))
    }

    pub fn tileset(&self, id: TilesetId) -> Option<&Tileset> {
        self.tilesets.get(usize::from(id.0))
    }

    pub fn tilesets(&self) -> impl Iterator<Item = (TilesetId, &Tileset)> {
        self.tilesets
            .iter()
            .enumerate()
            .map(|(i, t)| (TilesetId(i as u16), t))
    }

    fn tileset_mut(&mut self, id: TilesetId) -> Result<&mut Tileset, StreamError> {
        self.tilesets
            .get_mut(usize::from(id.0))
            .ok_or(StreamError::UnknownTileset(id))
    }

    /// Hidden tilesets are not traversed; their pending requests are dropped
    /// and their cached tiles age out.
    pub fn set_visible(&mut self, id: TilesetId, visible: bool) -> Result<(), StreamError> {
        self.tileset_mut(id)?.visible = visible;
        if !visible {
            let cancelled = self.scheduler.cancel_where(|k| k.tileset == id);
            if let Ok(tileset) = self.tileset_mut(id) {
                for key in &cancelled {
                    tileset.runtime.set_status(key.tile, LoadStatus::Unloaded);
                }
            }
            tracing::debug!(tileset = id.0, cancelled = cancelled.len(), "tileset hidden");
        }
        Ok(())
    }

    /// Make every failed tile of a tileset loadable again.
    pub fn retry_failed(&mut self, id: TilesetId) -> Result<usize, StreamError> {
        let frame = self.frame;
        Ok(self.tileset_mut(id)?.runtime.reset_failed(frame, None))
    }

    pub fn content(&self, key: TileKey) -> Option<&C> {
        self.cache.get(key)
    }

    pub fn status(&self, key: TileKey) -> LoadStatus {
        self.tileset(key.tileset)
            .map(|t| t.runtime.status(key.tile))
            .unwrap_or_default()
    }

    pub fn options(&self) -> &SceneOptions {
        &self.options
    }

    pub fn cache(&self) -> &TileCache<C> {
        &self.cache
    }

    pub fn scheduler(&self) -> &LoadScheduler {
        &self.scheduler
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Newly loaded tiles still waiting for their processing turn.
    pub fn processing_backlog(&self) -> usize {
        self.processing.len()
    }

    /// Advance one frame: traverse, apply finished loads, request and
    /// dispatch loads, then evict.
    ///
    /// Finished loads are applied only after traversal has touched every
    /// tile it uses, so making room for new content can never push out a
    /// tile this frame renders.
    pub fn update<Q>(&mut self, viewpoints: &[Viewpoint], loads: &mut Q) -> FrameReport
    where
        Q: LoadQueue<C> + ?Sized,
    {
        self.frame += 1;
        let frame = self.frame;
        let _span = tracing::info_span!("scene_update", frame).entered();
        self.cache.begin_frame(frame);

        let mut report = FrameReport {
            frame,
            ..FrameReport::default()
        };

        for tileset in &mut self.tilesets {
            if let Some(after) = tileset.options.retry_failed_after_frames {
                let reset = tileset.runtime.reset_failed(frame, Some(after));
                if reset > 0 {
                    tracing::debug!(tileset = %tileset.options.name, reset, "retrying failed tiles");
                }
            }
        }

        let candidates = self.traverse(viewpoints, &mut report);

        for completion in loads.poll_completed() {
            self.apply_completion(completion, &mut report);
        }

        self.request(&candidates, &mut report.stats);

        let cancelled = self
            .scheduler
            .cancel_stale(frame, self.options.cancel_unused_requests_after_frames);
        for &key in &cancelled {
            self.set_status(key, LoadStatus::Unloaded);
            tracing::debug!(%key, "stale request cancelled");
        }
        report.stats.cancelled = cancelled.len();

        self.dispatch(loads, &mut report.stats);

        let eviction = self.cache.eviction_pass();
        self.unload(&eviction.evicted);
        report.evicted.extend(eviction.evicted);

        report.processed = self
            .processing
            .drain_frame(self.options.maximum_tiles_to_process_per_frame);

        let stats = &mut report.stats;
        stats.rendered = report.render.len();
        stats.evicted = report.evicted.len();
        stats.processed = report.processed.len();
        stats.cache_len = self.cache.len();
        stats.cache_cost = self.cache.total_cost();
        stats.pending = self.scheduler.pending_len();
        stats.in_flight = self.scheduler.in_flight_len();

        tracing::trace!(
            visited = stats.visited,
            rendered = stats.rendered,
            requested = stats.requested,
            dispatched = stats.dispatched,
            completed = stats.completed,
            failed = stats.failed,
            evicted = stats.evicted,
            cache = stats.cache_len,
            pending = stats.pending,
            in_flight = stats.in_flight,
            "scene update complete"
        );
        report
    }

    fn apply_completion(&mut self, completion: LoadCompletion<C>, report: &mut FrameReport) {
        let LoadCompletion { key, result, cost } = completion;
        let priority = self.scheduler.priority_of(key).unwrap_or(0.0);
        self.scheduler.complete(key);
        report.stats.completed += 1;

        let Some(tileset) = self.tilesets.get_mut(usize::from(key.tileset.0)) else {
            tracing::warn!(%key, "completion for unknown tileset dropped");
            return;
        };
        let content = match result {
            Ok(content) => content,
            Err(err) => {
                tileset.runtime.mark_failed(key.tile, self.frame);
                report.stats.failed += 1;
                tracing::warn!(%key, %err, "tile load failed");
                return;
            }
        };
        match self.cache.insert_with_cost(key, content, cost) {
            Ok(victims) => {
                tileset.runtime.set_status(key.tile, LoadStatus::Loaded);
                // Selected while still loading: keep it through this frame's pass.
                if tileset
                    .runtime
                    .get(key.tile)
                    .is_some_and(|state| state.used_in(self.frame))
                {
                    self.cache.touch(key);
                }
                if tileset.options.create_colliders {
                    self.processing.push(priority, key);
                }
                self.unload(&victims);
                report.evicted.extend(victims);
            }
            Err(err) => {
                tileset.runtime.set_status(key.tile, LoadStatus::Unloaded);
                report.stats.rejected += 1;
                tracing::debug!(%key, %err, "loaded tile rejected by cache");
            }
        }
    }

    fn traverse(
        &mut self,
        viewpoints: &[Viewpoint],
        report: &mut FrameReport,
    ) -> Vec<(TilesetId, LoadCandidate)> {
        let mut candidates = Vec::new();
        for (index, tileset) in self.tilesets.iter_mut().enumerate() {
            if !tileset.visible {
                continue;
            }
            let id = TilesetId(index as u16);
            let _span = tracing::debug_span!("traverse", tileset = index).entered();
            let started = Instant::now();
            let out = FrameTraversal {
                tree: &tileset.tree,
                options: &tileset.options,
                error_model: tileset.error_model.as_ref(),
                viewpoints,
                frame: self.frame,
            }
            .run(&mut tileset.runtime);
            report.stats.traversal_time += started.elapsed();

            for &tile in &out.used {
                self.cache.touch(TileKey::new(id, tile));
            }
            report
                .render
                .extend(out.render.iter().map(|&tile| TileKey::new(id, tile)));
            candidates.extend(out.load.into_iter().map(|c| (id, c)));

            let stats = &mut report.stats;
            stats.visited += out.visited;
            stats.culled += out.culled;
            stats.selected += out.selected.len();
        }
        candidates
    }

    fn request(&mut self, candidates: &[(TilesetId, LoadCandidate)], stats: &mut FrameStats) {
        for &(id, candidate) in candidates {
            let Some(tileset) = self.tilesets.get_mut(usize::from(id.0)) else {
                continue;
            };
            let status = tileset.runtime.status(candidate.tile);
            if !matches!(status, LoadStatus::Unloaded | LoadStatus::Queued) {
                continue;
            }
            let key = TileKey::new(id, candidate.tile);
            let priority = tileset.priority.score(&PriorityInput {
                key,
                depth: candidate.depth,
                distance: candidate.distance,
                screen_space_error: candidate.screen_space_error,
                sibling: candidate.sibling,
            });
            if self.scheduler.request_load(key, priority, self.frame) == RequestOutcome::Enqueued {
                tileset.runtime.set_status(candidate.tile, LoadStatus::Queued);
                stats.requested += 1;
            }
        }
    }

    fn dispatch<Q>(&mut self, loads: &mut Q, stats: &mut FrameStats)
    where
        Q: LoadQueue<C> + ?Sized,
    {
        for request in self.scheduler.dispatch() {
            let key = request.key;
            let content = self
                .tilesets
                .get(usize::from(key.tileset.0))
                .and_then(|t| t.tree.get(key.tile))
                .and_then(|node| node.content.clone());
            let Some(content) = content else {
                self.scheduler.complete(key);
                continue;
            };
            self.set_status(key, LoadStatus::Loading);
            tracing::debug!(%key, %content, priority = request.priority, "load dispatched");
            loads.submit(LoadJob {
                key,
                content,
                priority: request.priority,
            });
            stats.dispatched += 1;
        }
    }

    fn unload(&mut self, keys: &[TileKey]) {
        if keys.is_empty() {
            return;
        }
        for &key in keys {
            self.set_status(key, LoadStatus::Unloaded);
        }
        let gone: HashSet<TileKey> = keys.iter().copied().collect();
        self.processing.retain(|k| !gone.contains(k));
    }

    fn set_status(&mut self, key: TileKey, status: LoadStatus) {
        if let Some(tileset) = self.tilesets.get_mut(usize::from(key.tileset.0)) {
            tileset.runtime.set_status(key.tile, status);
        }
    }
}
