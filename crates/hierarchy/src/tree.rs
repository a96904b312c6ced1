use glam::Mat4;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tilestream_common::{BoundingVolume, ContentRef, TileId};

/// Errors that make a hierarchy unusable. Any of these fails the whole
/// tileset at load time.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum HierarchyError {
    #[error("hierarchy has no tiles")]
    Empty,
    #[error("hierarchy has no root tile")]
    MissingRoot,
    #[error("hierarchy has {count} root tiles, expected exactly one")]
    MultipleRoots { count: usize },
    #[error("tile {tile:?} references missing parent {parent}")]
    DanglingParent { tile: TileId, parent: usize },
    #[error("tile {tile:?} is part of a parent cycle")]
    Cycle { tile: TileId },
    #[error("tile {tile:?} has invalid geometric error {error}")]
    InvalidGeometricError { tile: TileId, error: f64 },
    #[error("tile {child:?} error {child_error} exceeds parent {parent:?} error {parent_error}")]
    NonMonotonicError {
        parent: TileId,
        child: TileId,
        parent_error: f64,
        child_error: f64,
    },
    #[error("{levels} levels exceeds the limit of {max}")]
    TooManyLevels { levels: u32, max: u32 },
}

/// Flat description of one tile, as produced by a manifest parser.
/// `parent` indexes into the same descriptor list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileDescriptor {
    pub parent: Option<usize>,
    pub bounds: BoundingVolume,
    pub geometric_error: f64,
    pub content: Option<ContentRef>,
    #[serde(default)]
    pub transform: Option<Mat4>,
}

/// A node of the static hierarchy. Read-only once the tree is built.
#[derive(Debug, Clone, PartialEq)]
pub struct TileNode {
    pub id: TileId,
    /// Bounds in the node's local frame (before `transform`).
    pub bounds: BoundingVolume,
    /// Transform from this node's frame into its parent's frame.
    pub transform: Option<Mat4>,
    pub geometric_error: f64,
    pub parent: Option<TileId>,
    pub children: Vec<TileId>,
    pub content: Option<ContentRef>,
    pub depth: u32,
}

impl TileNode {
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    pub fn has_content(&self) -> bool {
        self.content.is_some()
    }
}

/// Arena of tile nodes. Children are owned through the arena; parent links
/// are plain ids and never keep anything alive.
#[derive(Debug, Clone)]
pub struct TileTree {
    nodes: Vec<TileNode>,
    root: TileId,
    max_depth: u32,
}

impl TileTree {
    /// Build and validate a tree from flat descriptors. Child order follows
    /// descriptor order; depths are computed from the parent links.
    pub fn from_descriptors(descriptors: Vec<TileDescriptor>) -> Result<Self, HierarchyError> {
        if descriptors.is_empty() {
            return Err(HierarchyError::Empty);
        }
        let len = descriptors.len();

        let mut roots = Vec::new();
        let mut children: Vec<Vec<TileId>> = vec![Vec::new(); len];
        for (i, d) in descriptors.iter().enumerate() {
            let id = TileId(i as u32);
            if !d.geometric_error.is_finite() || d.geometric_error < 0.0 {
                return Err(HierarchyError::InvalidGeometricError {
                    tile: id,
                    error: d.geometric_error,
                });
            }
            match d.parent {
                None => roots.push(id),
                Some(p) if p >= len => {
                    return Err(HierarchyError::DanglingParent { tile: id, parent: p });
                }
                Some(p) if p == i => return Err(HierarchyError::Cycle { tile: id }),
                Some(p) => children[p].push(id),
            }
        }
        let root = match roots.as_slice() {
            [] => return Err(HierarchyError::MissingRoot),
            [root] => *root,
            many => return Err(HierarchyError::MultipleRoots { count: many.len() }),
        };

        // Breadth-first from the root; anything not reached hangs off a cycle.
        let mut depths: Vec<Option<u32>> = vec![None; len];
        depths[root.index()] = Some(0);
        let mut queue = VecDeque::from([root]);
        let mut reached = 1;
        let mut max_depth = 0;
        while let Some(id) = queue.pop_front() {
            let depth = depths[id.index()].unwrap_or_default();
            let parent_error = descriptors[id.index()].geometric_error;
            for &child in &children[id.index()] {
                let child_error = descriptors[child.index()].geometric_error;
                if child_error > parent_error {
                    return Err(HierarchyError::NonMonotonicError {
                        parent: id,
                        child,
                        parent_error,
                        child_error,
                    });
                }
                depths[child.index()] = Some(depth + 1);
                max_depth = max_depth.max(depth + 1);
                reached += 1;
                queue.push_back(child);
            }
        }
        if reached != len {
            let stray = depths.iter().position(Option::is_none).unwrap_or_default();
            return Err(HierarchyError::Cycle {
                tile: TileId(stray as u32),
            });
        }

        let nodes = descriptors
            .into_iter()
            .zip(children)
            .enumerate()
            .map(|(i, (d, children))| TileNode {
                id: TileId(i as u32),
                bounds: d.bounds,
                transform: d.transform,
                geometric_error: d.geometric_error,
                parent: d.parent.map(|p| TileId(p as u32)),
                children,
                content: d.content,
                depth: depths[i].unwrap_or_default(),
            })
            .collect();

        tracing::debug!(tiles = len, max_depth, "tile hierarchy built");
        Ok(Self {
            nodes,
            root,
            max_depth,
        })
    }

    pub fn root(&self) -> TileId {
        self.root
    }

    pub fn get(&self, id: TileId) -> Option<&TileNode> {
        self.nodes.get(id.index())
    }

    /// Node by id. Ids handed out by this tree are always valid; an id from
    /// another tree may panic.
    pub fn node(&self, id: TileId) -> &TileNode {
        &self.nodes[id.index()]
    }

    pub fn children(&self, id: TileId) -> &[TileId] {
        self.get(id).map(|n| n.children.as_slice()).unwrap_or(&[])
    }

    pub fn parent(&self, id: TileId) -> Option<TileId> {
        self.get(id).and_then(|n| n.parent)
    }

    /// The other children of `id`'s parent, in child order.
    pub fn siblings(&self, id: TileId) -> impl Iterator<Item = TileId> + '_ {
        self.parent(id)
            .map(|p| self.children(p))
            .unwrap_or(&[])
            .iter()
            .copied()
            .filter(move |&s| s != id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn max_depth(&self) -> u32 {
        self.max_depth
    }

    pub fn leaf_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_leaf()).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TileNode> {
        self.nodes.iter()
    }

    /// Pre-order walk from the root, children in declaration order.
    pub fn depth_first(&self) -> DepthFirst<'_> {
        DepthFirst {
            tree: self,
            stack: vec![self.root],
        }
    }
}

pub struct DepthFirst<'a> {
    tree: &'a TileTree,
    stack: Vec<TileId>,
}

impl<'a> Iterator for DepthFirst<'a> {
    type Item = &'a TileNode;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.stack.pop()?;
        let node = self.tree.node(id);
        self.stack.extend(node.children.iter().rev());
        Some(node)
    }
}

/// Incremental construction on top of [`TileTree::from_descriptors`].
#[derive(Debug, Default)]
pub struct TileTreeBuilder {
    descriptors: Vec<TileDescriptor>,
}

impl TileTreeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a parentless tile. Adding more than one makes `build` fail.
    pub fn root(
        &mut self,
        bounds: BoundingVolume,
        geometric_error: f64,
        content: Option<ContentRef>,
    ) -> TileId {
        self.push(None, bounds, geometric_error, content)
    }

    pub fn child(
        &mut self,
        parent: TileId,
        bounds: BoundingVolume,
        geometric_error: f64,
        content: Option<ContentRef>,
    ) -> TileId {
        self.push(Some(parent.index()), bounds, geometric_error, content)
    }

    /// Set the local transform of an already added tile.
    pub fn set_transform(&mut self, id: TileId, transform: Mat4) {
        if let Some(d) = self.descriptors.get_mut(id.index()) {
            d.transform = Some(transform);
        }
    }

    pub fn build(self) -> Result<TileTree, HierarchyError> {
        TileTree::from_descriptors(self.descriptors)
    }

    fn push(
        &mut self,
        parent: Option<usize>,
        bounds: BoundingVolume,
        geometric_error: f64,
        content: Option<ContentRef>,
    ) -> TileId {
        let id = TileId(self.descriptors.len() as u32);
        self.descriptors.push(TileDescriptor {
            parent,
            bounds,
            geometric_error,
            content,
            transform: None,
        });
        id
    }
}
