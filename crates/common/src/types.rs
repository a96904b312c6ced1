use serde::{Deserialize, Serialize};
use std::fmt;

/// Index of a node inside its tile tree arena.
///
/// Ids are dense: a tree with `n` nodes uses `0..n`, and the id never
/// changes for the lifetime of the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileId(pub u32);

impl TileId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Index of a tileset inside a scene.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TilesetId(pub u16);

/// Scene-wide tile identity. The cache and the load scheduler are shared by
/// every tileset in a scene, so they key on the pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileKey {
    pub tileset: TilesetId,
    pub tile: TileId,
}

impl TileKey {
    pub fn new(tileset: TilesetId, tile: TileId) -> Self {
        Self { tileset, tile }
    }
}

impl fmt::Display for TileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tileset.0, self.tile.0)
    }
}

/// Opaque reference to a tile's payload (a URL, a path, an archive entry).
/// Only the content loader interprets it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentRef(pub String);

impl ContentRef {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
