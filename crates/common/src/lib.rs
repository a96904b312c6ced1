//! Shared value types for tileset streaming.
//!
//! # Invariants
//! - `TileId` is a stable arena index; it never changes for the life of a tree.
//! - Bounding volumes are in the tile's local frame until transformed.

mod bounds;
mod types;
mod viewpoint;

pub use bounds::BoundingVolume;
pub use types::{ContentRef, TileId, TileKey, TilesetId};
pub use viewpoint::{Frustum, Viewpoint};

pub fn crate_info() -> &'static str {
    "tilestream-common v0.1.0"
}
