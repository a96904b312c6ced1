use tilestream_common::TileId;

/// Where a tile's content is in its load lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LoadStatus {
    #[default]
    Unloaded,
    Queued,
    Loading,
    Loaded,
    Failed,
}

/// Values traversal computed for a tile in the frame it was last visited.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FrameState {
    pub visited_frame: u64,
    pub screen_space_error: f64,
    /// Distance from the nearest viewpoint that can see the tile.
    pub distance: f64,
}

/// Mutable streaming state for one tile, kept beside the immutable node.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TileState {
    pub status: LoadStatus,
    pub last_used_frame: Option<u64>,
    pub failed_frame: Option<u64>,
    pub frame: FrameState,
}

impl TileState {
    pub fn used_in(&self, frame: u64) -> bool {
        self.last_used_frame == Some(frame)
    }
}

/// Side table of [`TileState`] indexed by tile id.
#[derive(Debug, Clone)]
pub struct RuntimeTable {
    states: Vec<TileState>,
}

impl RuntimeTable {
    pub fn new(len: usize) -> Self {
        Self {
            states: vec![TileState::default(); len],
        }
    }

    pub fn get(&self, id: TileId) -> Option<&TileState> {
        self.states.get(id.index())
    }

    pub fn get_mut(&mut self, id: TileId) -> Option<&mut TileState> {
        self.states.get_mut(id.index())
    }

    pub fn status(&self, id: TileId) -> LoadStatus {
        self.get(id).map(|s| s.status).unwrap_or_default()
    }

    pub fn set_status(&mut self, id: TileId, status: LoadStatus) {
        if let Some(state) = self.get_mut(id) {
            state.status = status;
        }
    }

    /// Record a failed load in `frame`.
    pub fn mark_failed(&mut self, id: TileId, frame: u64) {
        if let Some(state) = self.get_mut(id) {
            state.status = LoadStatus::Failed;
            state.failed_frame = Some(frame);
        }
    }

    /// Stamp a tile as used in `frame`. Stamps never move backwards.
    /// Returns true only the first time the tile is marked in this frame.
    pub fn mark_used(&mut self, id: TileId, frame: u64) -> bool {
        let Some(state) = self.get_mut(id) else {
            return false;
        };
        match state.last_used_frame {
            Some(last) if last >= frame => false,
            _ => {
                state.last_used_frame = Some(frame);
                true
            }
        }
    }

    /// Make failed tiles loadable again. With `after`, only tiles that failed
    /// at least that many frames before `frame`. Returns how many were reset.
    pub fn reset_failed(&mut self, frame: u64, after: Option<u64>) -> usize {
        let mut reset = 0;
        for state in &mut self.states {
            if state.status != LoadStatus::Failed {
                continue;
            }
            let due = match (after, state.failed_frame) {
                (None, _) | (_, None) => true,
                (Some(after), Some(failed)) => frame.saturating_sub(failed) >= after,
            };
            if due {
                state.status = LoadStatus::Unloaded;
                state.failed_frame = None;
                reset += 1;
            }
        }
        reset
    }

    pub fn count(&self, status: LoadStatus) -> usize {
        self.states.iter().filter(|s| s.status == status).count()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}
