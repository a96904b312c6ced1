//! Streaming core: frame traversal, LRU tile cache, load scheduling and
//! frame budgets.
//!
//! A [`Scene`] owns one or more tilesets and, once per frame, decides which
//! tiles to draw, which to load next and which to drop.
//!
//! # Invariants
//! - A tile is refined only when its screen-space error exceeds the
//!   tileset's threshold; ties render.
//! - Tiles used in the current frame are never evicted.
//! - The cache never holds more than its hard maximum.
//! - At most one load is outstanding per tile, and no more than the
//!   concurrency limit are in flight.
//! - Load results only touch scene state when drained on the frame thread.

mod budget;
mod cache;
mod config;
mod error_model;
mod loader;
mod priority;
mod runtime;
mod scene;
mod scheduler;
mod traversal;

pub use budget::{DeferredQueue, FrameAllowance};
pub use cache::{CacheError, CacheLimits, EvictionReport, TileCache};
pub use config::{ConfigError, SceneOptions, StreamConfig, TilesetOptions};
pub use error_model::{PerspectiveErrorModel, ScreenSpaceErrorModel};
pub use loader::{
    ContentLoader, InlineLoads, LoadCompletion, LoadError, LoadJob, LoadQueue, WorkerPool,
};
pub use priority::{DepthDistancePriority, PriorityInput, TilePriority};
pub use runtime::{FrameState, LoadStatus, RuntimeTable, TileState};
pub use scene::{FrameReport, FrameStats, Scene, StreamError, Tileset, TilesetEntry};
pub use scheduler::{LoadRequest, LoadScheduler, RequestOutcome};
pub use traversal::{FrameTraversal, LoadCandidate, TraversalOutput};

pub fn crate_info() -> &'static str {
    "tilestream-stream v0.1.0"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crate_loads() {
        assert!(crate_info().contains("stream"));
    }
}
