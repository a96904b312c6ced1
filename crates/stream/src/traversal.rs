//! Per-frame walk of the tile tree.
//!
//! Decides, for every visible node, whether it is rendered, refined past, or
//! skipped, and collects the tiles whose content should be loaded. The walk
//! only writes runtime state (used stamps and frame values); cache and
//! scheduler updates are left to the caller.

use std::collections::HashSet;

use glam::Mat4;
use tilestream_common::{Frustum, TileId, Viewpoint};
use tilestream_hierarchy::{TileNode, TileTree};

use crate::config::TilesetOptions;
use crate::error_model::ScreenSpaceErrorModel;
use crate::runtime::{FrameState, LoadStatus, RuntimeTable};

/// A tile traversal wants loaded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadCandidate {
    pub tile: TileId,
    pub depth: u32,
    pub distance: f64,
    pub screen_space_error: f64,
    /// Wanted only as the sibling of a rendered tile.
    pub sibling: bool,
}

#[derive(Debug, Clone, Default)]
pub struct TraversalOutput {
    /// Tiles whose detail is adequate this frame, loaded or not.
    pub selected: Vec<TileId>,
    /// Tiles to draw: loaded selections plus loaded ancestors standing in
    /// for selections that are not loaded yet.
    pub render: Vec<TileId>,
    /// Tiles stamped as used this frame, each listed once.
    pub used: Vec<TileId>,
    pub load: Vec<LoadCandidate>,
    pub visited: usize,
    pub culled: usize,
}

struct StackEntry {
    tile: TileId,
    parent_world: Mat4,
    /// Nearest loaded ancestor, drawn if this branch's selection is not ready.
    fallback: Option<TileId>,
}

struct Evaluation {
    screen_space_error: f64,
    distance: f64,
}

pub struct FrameTraversal<'a> {
    pub tree: &'a TileTree,
    pub options: &'a TilesetOptions,
    pub error_model: &'a dyn ScreenSpaceErrorModel,
    pub viewpoints: &'a [Viewpoint],
    pub frame: u64,
}

impl FrameTraversal<'_> {
    pub fn run(&self, runtime: &mut RuntimeTable) -> TraversalOutput {
        let mut walk = Walk {
            traversal: self,
            frusta: self.viewpoints.iter().map(Viewpoint::frustum).collect(),
            out: TraversalOutput::default(),
            rendered: HashSet::new(),
            requested: HashSet::new(),
        };
        if self.viewpoints.is_empty() {
            return walk.out;
        }

        let threshold = self.options.maximum_screen_space_error;
        let skip_threshold = self.options.skip_threshold();
        let mut stack = vec![StackEntry {
            tile: self.tree.root(),
            parent_world: self.options.transform,
            fallback: None,
        }];

        while let Some(entry) = stack.pop() {
            let node = self.tree.node(entry.tile);
            let world = world_transform(node, &entry.parent_world);
            let Some(eval) = walk.evaluate(node, &world) else {
                walk.out.culled += 1;
                continue;
            };
            walk.out.visited += 1;

            let status = runtime.status(node.id);
            if let Some(state) = runtime.get_mut(node.id) {
                state.frame = FrameState {
                    visited_frame: self.frame,
                    screen_space_error: eval.screen_space_error,
                    distance: eval.distance,
                };
            }

            let depth_limited = self.options.max_depth > 0 && node.depth >= self.options.max_depth;
            let leaf = node.is_leaf() || depth_limited || status == LoadStatus::Failed;

            // Ties go to rendering so refinement cannot run away at the threshold.
            if leaf || eval.screen_space_error <= threshold {
                walk.select(node, status, &eval, entry.fallback, runtime);
                if self.options.load_siblings {
                    walk.load_siblings(node, &entry.parent_world, runtime);
                }
                continue;
            }

            // Refined past, but close enough to be worth having as a stand-in.
            if node.has_content() && eval.screen_space_error <= skip_threshold {
                walk.mark_used(node.id, runtime);
                if matches!(status, LoadStatus::Unloaded | LoadStatus::Queued) {
                    walk.request(node, &eval, false);
                }
            }
            let loaded = status == LoadStatus::Loaded && node.has_content();
            let fallback = if loaded { Some(node.id) } else { entry.fallback };
            for &child in node.children.iter().rev() {
                stack.push(StackEntry {
                    tile: child,
                    parent_world: world,
                    fallback,
                });
            }
        }

        tracing::trace!(
            frame = self.frame,
            visited = walk.out.visited,
            culled = walk.out.culled,
            selected = walk.out.selected.len(),
            render = walk.out.render.len(),
            load = walk.out.load.len(),
            "traversal complete"
        );
        walk.out
    }
}

fn world_transform(node: &TileNode, parent_world: &Mat4) -> Mat4 {
    match node.transform {
        Some(local) => *parent_world * local,
        None => *parent_world,
    }
}

struct Walk<'t, 'a> {
    traversal: &'t FrameTraversal<'a>,
    frusta: Vec<Frustum>,
    out: TraversalOutput,
    rendered: HashSet<TileId>,
    requested: HashSet<TileId>,
}

impl Walk<'_, '_> {
    /// Best (lowest) screen-space error over the viewpoints that can see the
    /// node, or `None` when culling is on and none can.
    fn evaluate(&self, node: &TileNode, world: &Mat4) -> Option<Evaluation> {
        self.measure(node, world, self.traversal.options.frustum_culling)
    }

    fn measure(&self, node: &TileNode, world: &Mat4, cull: bool) -> Option<Evaluation> {
        let bounds = node.bounds.transformed(world);
        let mut best: Option<Evaluation> = None;
        for (viewpoint, frustum) in self.traversal.viewpoints.iter().zip(&self.frusta) {
            if cull && !frustum.intersects(&bounds) {
                continue;
            }
            let distance = f64::from(bounds.distance_to(viewpoint.position));
            let sse = self.traversal.error_model.screen_space_error(
                node.geometric_error,
                distance,
                viewpoint,
            );
            best = Some(match best {
                None => Evaluation {
                    screen_space_error: sse,
                    distance,
                },
                Some(b) => Evaluation {
                    screen_space_error: b.screen_space_error.min(sse),
                    distance: b.distance.min(distance),
                },
            });
        }
        best
    }

    fn mark_used(&mut self, tile: TileId, runtime: &mut RuntimeTable) {
        if runtime.mark_used(tile, self.traversal.frame) {
            self.out.used.push(tile);
        }
    }

    fn render(&mut self, tile: TileId, runtime: &mut RuntimeTable) {
        if self.rendered.insert(tile) {
            self.out.render.push(tile);
        }
        self.mark_used(tile, runtime);
    }

    fn request(&mut self, node: &TileNode, eval: &Evaluation, sibling: bool) {
        if self.requested.insert(node.id) {
            self.out.load.push(LoadCandidate {
                tile: node.id,
                depth: node.depth,
                distance: eval.distance,
                screen_space_error: eval.screen_space_error,
                sibling,
            });
        }
    }

    fn select(
        &mut self,
        node: &TileNode,
        status: LoadStatus,
        eval: &Evaluation,
        fallback: Option<TileId>,
        runtime: &mut RuntimeTable,
    ) {
        self.out.selected.push(node.id);
        self.mark_used(node.id, runtime);
        if !node.has_content() {
            return;
        }
        match status {
            LoadStatus::Loaded => {
                self.render(node.id, runtime);
                return;
            }
            LoadStatus::Unloaded | LoadStatus::Queued => self.request(node, eval, false),
            LoadStatus::Loading | LoadStatus::Failed => {}
        }
        if let Some(ancestor) = fallback {
            self.render(ancestor, runtime);
        }
    }

    /// Keep the siblings of a rendered tile resident (and loading) without
    /// drawing them, so queries just outside the view still hit geometry.
    fn load_siblings(&mut self, node: &TileNode, parent_world: &Mat4, runtime: &mut RuntimeTable) {
        let tree = self.traversal.tree;
        for sibling in tree.siblings(node.id) {
            let sibling = tree.node(sibling);
            self.mark_used(sibling.id, runtime);
            if !sibling.has_content() {
                continue;
            }
            if !matches!(
                runtime.status(sibling.id),
                LoadStatus::Unloaded | LoadStatus::Queued
            ) {
                continue;
            }
            let world = world_transform(sibling, parent_world);
            if let Some(eval) = self.measure(sibling, &world, false) {
                self.request(sibling, &eval, true);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;
    use tilestream_common::{BoundingVolume, ContentRef};
    use tilestream_hierarchy::TileTreeBuilder;

    /// Screen-space error equal to geometric error, whatever the distance.
    fn passthrough(error: f64, _distance: f64, _vp: &Viewpoint) -> f64 {
        error
    }

    fn unit() -> BoundingVolume {
        BoundingVolume::sphere(Vec3::ZERO, 1.0)
    }

    fn content(name: &str) -> Option<ContentRef> {
        Some(ContentRef::new(name))
    }

    fn no_culling() -> TilesetOptions {
        TilesetOptions {
            frustum_culling: false,
            load_siblings: false,
            ..TilesetOptions::default()
        }
    }

    /// root(1000) -> a(300) -> b(40) -> c(10) -> d(5)
    fn chain() -> TileTree {
        let mut b = TileTreeBuilder::new();
        let root = b.root(unit(), 1000.0, content("root"));
        let a = b.child(root, unit(), 300.0, content("a"));
        let bb = b.child(a, unit(), 40.0, content("b"));
        let c = b.child(bb, unit(), 10.0, content("c"));
        b.child(c, unit(), 5.0, content("d"));
        b.build().unwrap()
    }

    const ROOT: TileId = TileId(0);
    const A: TileId = TileId(1);
    const B: TileId = TileId(2);
    const C: TileId = TileId(3);
    const D: TileId = TileId(4);

    fn run(
        tree: &TileTree,
        options: &TilesetOptions,
        runtime: &mut RuntimeTable,
        viewpoints: &[Viewpoint],
        frame: u64,
    ) -> TraversalOutput {
        FrameTraversal {
            tree,
            options,
            error_model: &passthrough,
            viewpoints,
            frame,
        }
        .run(runtime)
    }

    #[test]
    fn threshold_scenario_selects_refines_and_skips() {
        let tree = chain();
        let options = no_culling();
        let mut runtime = RuntimeTable::new(tree.len());
        let out = run(&tree, &options, &mut runtime, &[Viewpoint::default()], 1);

        // c (error 10 at depth 3) renders; d is never reached.
        assert_eq!(tree.node(C).depth, 3);
        assert_eq!(out.selected, vec![C]);
        assert_eq!(out.visited, 4);
        assert!(runtime.get(D).unwrap().last_used_frame.is_none());

        // b (40) is refined past but still fetched; a (300) and root are skipped.
        let loads: Vec<TileId> = out.load.iter().map(|l| l.tile).collect();
        assert_eq!(loads, vec![B, C]);
        assert!(!loads.contains(&A));
        assert!(!loads.contains(&ROOT));
        assert!(out.render.is_empty());
        assert_eq!(out.used, vec![B, C]);
    }

    #[test]
    fn boundary_error_renders() {
        let mut b = TileTreeBuilder::new();
        let root = b.root(unit(), 16.0, content("root"));
        b.child(root, unit(), 1.0, content("child"));
        let tree = b.build().unwrap();
        let mut runtime = RuntimeTable::new(tree.len());
        let out = run(&tree, &no_culling(), &mut runtime, &[Viewpoint::default()], 1);
        assert_eq!(out.selected, vec![ROOT]);
    }

    #[test]
    fn loaded_selection_renders() {
        let tree = chain();
        let mut runtime = RuntimeTable::new(tree.len());
        runtime.set_status(C, LoadStatus::Loaded);
        let out = run(&tree, &no_culling(), &mut runtime, &[Viewpoint::default()], 1);
        assert_eq!(out.render, vec![C]);
        assert!(!out.load.iter().any(|l| l.tile == C));
    }

    #[test]
    fn refined_loaded_parent_stays_resident_and_stands_in() {
        let tree = chain();
        let mut runtime = RuntimeTable::new(tree.len());
        runtime.set_status(B, LoadStatus::Loaded);
        let out = run(&tree, &no_culling(), &mut runtime, &[Viewpoint::default()], 1);
        // b (40) is within the skip band: kept used, drawn while c loads.
        assert!(runtime.get(B).unwrap().used_in(1));
        assert_eq!(out.render, vec![B]);
        assert_eq!(out.load[0].tile, C);
    }

    #[test]
    fn wider_skip_band_fetches_more_ancestors() {
        let tree = chain();
        let options = TilesetOptions {
            skip_screen_space_error_multiplier: 20.0,
            ..no_culling()
        };
        let mut runtime = RuntimeTable::new(tree.len());
        let out = run(&tree, &options, &mut runtime, &[Viewpoint::default()], 1);
        // E x M = 320: a (300) and b (40) are in the band, root (1000) is not.
        let loads: Vec<TileId> = out.load.iter().map(|l| l.tile).collect();
        assert_eq!(loads, vec![A, B, C]);
        let a = out.load.iter().find(|l| l.tile == A).unwrap();
        assert_eq!(a.depth, 1);
        assert_eq!(a.screen_space_error, 300.0);
        assert!(!a.sibling);
        assert!(out.render.is_empty());
        assert_eq!(out.selected, vec![C]);
    }

    #[test]
    fn skipped_loaded_ancestor_is_not_kept_unless_drawn() {
        let tree = chain();
        let mut runtime = RuntimeTable::new(tree.len());
        runtime.set_status(A, LoadStatus::Loaded);
        runtime.set_status(C, LoadStatus::Loaded);
        let out = run(&tree, &no_culling(), &mut runtime, &[Viewpoint::default()], 1);
        assert_eq!(out.render, vec![C]);
        assert!(!runtime.get(A).unwrap().used_in(1));
    }

    #[test]
    fn coarse_ancestor_draws_for_failed_selection() {
        let tree = chain();
        let mut runtime = RuntimeTable::new(tree.len());
        runtime.set_status(A, LoadStatus::Loaded);
        runtime.mark_failed(C, 1);
        let out = run(&tree, &no_culling(), &mut runtime, &[Viewpoint::default()], 2);
        assert_eq!(out.selected, vec![C]);
        let loads: Vec<TileId> = out.load.iter().map(|l| l.tile).collect();
        assert_eq!(loads, vec![B]);
        assert_eq!(out.render, vec![A]);
        assert!(runtime.get(A).unwrap().used_in(2));
    }

    #[test]
    fn failed_tile_is_a_leaf() {
        let tree = chain();
        let mut runtime = RuntimeTable::new(tree.len());
        runtime.mark_failed(B, 1);
        let out = run(&tree, &no_culling(), &mut runtime, &[Viewpoint::default()], 2);
        assert_eq!(out.selected, vec![B]);
        assert!(out.load.is_empty());
        assert_eq!(out.visited, 3);
    }

    #[test]
    fn leaf_with_large_error_is_still_selected() {
        let mut b = TileTreeBuilder::new();
        b.root(unit(), 500.0, content("only"));
        let tree = b.build().unwrap();
        let mut runtime = RuntimeTable::new(tree.len());
        let out = run(&tree, &no_culling(), &mut runtime, &[Viewpoint::default()], 1);
        assert_eq!(out.selected, vec![ROOT]);
        assert_eq!(out.load.len(), 1);
    }

    #[test]
    fn max_depth_stops_refinement() {
        let tree = chain();
        let options = TilesetOptions {
            max_depth: 2,
            ..no_culling()
        };
        let mut runtime = RuntimeTable::new(tree.len());
        let out = run(&tree, &options, &mut runtime, &[Viewpoint::default()], 1);
        assert_eq!(out.selected, vec![B]);
        assert_eq!(out.visited, 3);
    }

    #[test]
    fn loading_tiles_are_not_requested_again() {
        let tree = chain();
        let mut runtime = RuntimeTable::new(tree.len());
        runtime.set_status(B, LoadStatus::Loading);
        runtime.set_status(C, LoadStatus::Loading);
        let out = run(&tree, &no_culling(), &mut runtime, &[Viewpoint::default()], 1);
        assert!(out.load.is_empty());
        runtime.set_status(C, LoadStatus::Queued);
        let out = run(&tree, &no_culling(), &mut runtime, &[Viewpoint::default()], 2);
        let loads: Vec<TileId> = out.load.iter().map(|l| l.tile).collect();
        assert_eq!(loads, vec![C]);
    }

    #[test]
    fn siblings_are_loaded_but_not_rendered() {
        // root(100) -> [p(10), q(50) -> [q0(5), q1(5)]]
        let mut b = TileTreeBuilder::new();
        let root = b.root(unit(), 100.0, content("root"));
        let p = b.child(root, unit(), 10.0, content("p"));
        let q = b.child(root, unit(), 50.0, content("q"));
        b.child(q, unit(), 5.0, content("q0"));
        b.child(q, unit(), 5.0, content("q1"));
        let tree = b.build().unwrap();
        let options = TilesetOptions {
            load_siblings: true,
            ..no_culling()
        };
        let mut runtime = RuntimeTable::new(tree.len());
        runtime.set_status(p, LoadStatus::Loaded);
        let out = run(&tree, &options, &mut runtime, &[Viewpoint::default()], 1);

        assert_eq!(out.render, vec![p]);
        let q_load = out.load.iter().find(|l| l.tile == q).unwrap();
        assert!(q_load.sibling);
        assert!(runtime.get(q).unwrap().used_in(1));
        // q0 and q1 are selected themselves; each is requested exactly once.
        let q0_requests = out.load.iter().filter(|l| l.tile == TileId(3)).count();
        assert_eq!(q0_requests, 1);
        assert!(!out.load.iter().find(|l| l.tile == TileId(3)).unwrap().sibling);
        let mut used = out.used.clone();
        used.sort();
        used.dedup();
        assert_eq!(used.len(), out.used.len());
    }

    #[test]
    fn culled_root_visits_nothing() {
        let tree = chain();
        let options = TilesetOptions {
            frustum_culling: true,
            ..TilesetOptions::default()
        };
        let away = Viewpoint::looking_at(Vec3::new(0.0, 0.0, 10.0), Vec3::new(0.0, 0.0, 20.0));
        let mut runtime = RuntimeTable::new(tree.len());
        let out = run(&tree, &options, &mut runtime, &[away], 1);
        assert_eq!(out.visited, 0);
        assert_eq!(out.culled, 1);
        assert!(out.selected.is_empty());
    }

    #[test]
    fn root_transform_moves_the_tileset() {
        let mut b = TileTreeBuilder::new();
        b.root(unit(), 0.0, content("only"));
        let tree = b.build().unwrap();
        let options = TilesetOptions {
            transform: Mat4::from_translation(Vec3::new(0.0, 0.0, -100.0)),
            ..TilesetOptions::default()
        };
        let toward = Viewpoint::looking_at(Vec3::ZERO, Vec3::new(0.0, 0.0, -1.0));
        let away = Viewpoint::looking_at(Vec3::ZERO, Vec3::new(0.0, 0.0, 1.0));
        let mut runtime = RuntimeTable::new(tree.len());
        assert_eq!(run(&tree, &options, &mut runtime, &[away], 1).visited, 0);
        let out = run(&tree, &options, &mut runtime, &[toward], 2);
        assert_eq!(out.selected, vec![ROOT]);
        let distance = runtime.get(ROOT).unwrap().frame.distance;
        assert!((distance - 99.0).abs() < 1e-3);
    }

    #[test]
    fn best_error_across_viewpoints_wins() {
        let mut b = TileTreeBuilder::new();
        let root = b.root(BoundingVolume::sphere(Vec3::ZERO, 0.0), 10.0, content("root"));
        b.child(root, unit(), 0.0, content("leaf"));
        let tree = b.build().unwrap();
        let by_distance = |error: f64, distance: f64, _vp: &Viewpoint| error * 100.0 / distance;
        let near = Viewpoint::new(Vec3::new(10.0, 0.0, 0.0), Vec3::NEG_X);
        let far = Viewpoint::new(Vec3::new(1000.0, 0.0, 0.0), Vec3::NEG_X);
        let options = no_culling();
        let mut runtime = RuntimeTable::new(tree.len());

        let out = FrameTraversal {
            tree: &tree,
            options: &options,
            error_model: &by_distance,
            viewpoints: &[near],
            frame: 1,
        }
        .run(&mut runtime);
        // Near alone: 10 * 100 / 10 = 100 > 16, refine.
        assert_eq!(out.selected, vec![TileId(1)]);

        let out = FrameTraversal {
            tree: &tree,
            options: &options,
            error_model: &by_distance,
            viewpoints: &[near, far],
            frame: 2,
        }
        .run(&mut runtime);
        // Far: 10 * 100 / 1000 = 1, the minimum, so the root suffices.
        assert_eq!(out.selected, vec![ROOT]);
        let state = runtime.get(ROOT).unwrap().frame;
        assert!((state.screen_space_error - 1.0).abs() < 1e-9);
        assert!((state.distance - 10.0).abs() < 1e-3);
    }

    #[test]
    fn no_viewpoints_no_work() {
        let tree = chain();
        let mut runtime = RuntimeTable::new(tree.len());
        let out = run(&tree, &no_culling(), &mut runtime, &[], 1);
        assert_eq!(out.visited, 0);
        assert!(out.selected.is_empty());
    }

    #[test]
    fn used_stamps_track_the_latest_frame() {
        let tree = chain();
        let mut runtime = RuntimeTable::new(tree.len());
        for frame in 1..=3 {
            run(&tree, &no_culling(), &mut runtime, &[Viewpoint::default()], frame);
        }
        assert_eq!(runtime.get(C).unwrap().last_used_frame, Some(3));
    }

    #[test]
    fn content_less_selection_requests_nothing() {
        let mut b = TileTreeBuilder::new();
        b.root(unit(), 5.0, None);
        let tree = b.build().unwrap();
        let mut runtime = RuntimeTable::new(tree.len());
        let out = run(&tree, &no_culling(), &mut runtime, &[Viewpoint::default()], 1);
        assert_eq!(out.selected, vec![ROOT]);
        assert!(out.load.is_empty());
        assert!(out.render.is_empty());
    }
}
