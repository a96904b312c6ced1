//! Tile hierarchy: the static tree a tileset streams from.
//!
//! # Invariants
//! - Depth increases by exactly one from parent to child; the root is 0.
//! - Geometric error never increases from parent to child.
//! - The tree is acyclic with a single root; violations fail the whole tileset.

pub mod synthetic;
mod tree;

pub use tree::{DepthFirst, HierarchyError, TileDescriptor, TileNode, TileTree, TileTreeBuilder};

pub fn crate_info() -> &'static str {
    "tilestream-hierarchy v0.1.0"
}
