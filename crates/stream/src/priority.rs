use tilestream_common::TileKey;

/// What a priority strategy may look at when scoring a load request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriorityInput {
    pub key: TileKey,
    pub depth: u32,
    /// Distance to the nearest viewpoint that sees the tile.
    pub distance: f64,
    pub screen_space_error: f64,
    /// Requested only because a sibling is rendered.
    pub sibling: bool,
}

/// Scores load requests. Lower scores are dispatched first.
pub trait TilePriority: Send + Sync {
    fn score(&self, input: &PriorityInput) -> f64;
}

impl<F> TilePriority for F
where
    F: Fn(&PriorityInput) -> f64 + Send + Sync,
{
    fn score(&self, input: &PriorityInput) -> f64 {
        self(input)
    }
}

/// `depth - 1 / distance`: shallow tiles first, closer tiles first within a level.
#[derive(Debug, Clone, Copy, Default)]
pub struct DepthDistancePriority;

impl TilePriority for DepthDistancePriority {
    fn score(&self, input: &PriorityInput) -> f64 {
        let distance = input.distance.max(1e-3);
        f64::from(input.depth) - 1.0 / distance
    }
}
