//! Procedural hierarchies for demos, tests and benchmarks.

use glam::Vec3;
use tilestream_common::{BoundingVolume, ContentRef};

use crate::tree::{HierarchyError, TileDescriptor, TileTree};

/// Parameters for a complete quadtree over a square footprint on the XZ plane.
#[derive(Debug, Clone)]
pub struct QuadtreeParams {
    /// Number of levels including the root. 1 produces a single tile.
    pub levels: u32,
    /// Edge length of the root footprint, centered on the origin.
    pub size: f32,
    /// Vertical half extent of every tile box.
    pub height: f32,
    /// Geometric error of the root; halves at each level, 0 at the leaves.
    pub root_error: f64,
    /// Give the root no content, as many real tilesets do.
    pub empty_root: bool,
}

impl Default for QuadtreeParams {
    fn default() -> Self {
        Self {
            levels: 5,
            size: 1024.0,
            height: 16.0,
            root_error: 256.0,
            empty_root: false,
        }
    }
}

/// Deepest quadtree [`quadtree`] will build.
pub const MAX_QUADTREE_LEVELS: u32 = 12;

/// Build a complete quadtree. Node count is `(4^levels - 1) / 3`.
pub fn quadtree(params: &QuadtreeParams) -> Result<TileTree, HierarchyError> {
    if params.levels > MAX_QUADTREE_LEVELS {
        return Err(HierarchyError::TooManyLevels {
            levels: params.levels,
            max: MAX_QUADTREE_LEVELS,
        });
    }
    let levels = params.levels.max(1);
    let mut descriptors = Vec::new();
    // (parent index, level, x, z) in breadth-first order.
    let mut frontier = vec![(None, 0u32, 0u32, 0u32)];
    while !frontier.is_empty() {
        let mut next = Vec::new();
        for (parent, level, x, z) in frontier {
            let cells = 1u32 << level;
            let edge = params.size / cells as f32;
            let min_x = -params.size * 0.5 + x as f32 * edge;
            let min_z = -params.size * 0.5 + z as f32 * edge;
            let center = Vec3::new(min_x + edge * 0.5, 0.0, min_z + edge * 0.5);
            let is_leaf = level + 1 == levels;
            let geometric_error = if is_leaf {
                0.0
            } else {
                params.root_error / f64::from(cells)
            };
            let content = if level == 0 && params.empty_root {
                None
            } else {
                Some(ContentRef::new(format!("quad/{level}/{x}_{z}.glb")))
            };
            let index = descriptors.len();
            descriptors.push(TileDescriptor {
                parent,
                bounds: BoundingVolume::aabb(
                    center,
                    Vec3::new(edge * 0.5, params.height, edge * 0.5),
                ),
                geometric_error,
                content,
                transform: None,
            });
            if !is_leaf {
                for (dx, dz) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
                    next.push((Some(index), level + 1, x * 2 + dx, z * 2 + dz));
                }
            }
        }
        frontier = next;
    }
    TileTree::from_descriptors(descriptors)
}
