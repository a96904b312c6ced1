use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, Subcommand};
use glam::Vec3;
use tilestream_common::Viewpoint;
use tilestream_hierarchy::TileTree;
use tilestream_hierarchy::synthetic::{QuadtreeParams, quadtree};
use tilestream_stream::{
    ContentLoader, InlineLoads, LoadError, LoadJob, LoadQueue, Scene, StreamConfig, TilesetEntry,
    WorkerPool,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tilestream-cli", about = "CLI tool for tileset streaming")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print version and crate info
    Info,
    /// Describe a synthetic quadtree tileset
    Inspect {
        /// Levels including the root
        #[arg(short, long, default_value = "5")]
        levels: u32,
        /// Give the root no content
        #[arg(long)]
        empty_root: bool,
    },
    /// Write the default streaming options as JSON
    DefaultConfig {
        /// Output path
        path: PathBuf,
    },
    /// Stream a synthetic tileset past an orbiting camera
    Simulate {
        /// Levels including the root
        #[arg(short, long, default_value = "5")]
        levels: u32,
        /// Number of frames to run
        #[arg(short, long, default_value = "120")]
        frames: u64,
        /// JSON options file (see `default-config`)
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Load on the frame thread instead of a worker pool
        #[arg(long)]
        inline: bool,
        /// Worker threads for the load pool
        #[arg(short, long, default_value = "4")]
        threads: usize,
        /// Fail every Nth tile load
        #[arg(long)]
        fail_every: Option<u32>,
        /// Simulated per-load latency in milliseconds
        #[arg(long, default_value = "2")]
        latency_ms: u64,
        /// Wall time per frame in milliseconds when using the worker pool
        #[arg(long, default_value = "16")]
        frame_ms: u64,
    },
}

/// Stand-in payload for a decoded tile.
#[derive(Debug)]
struct SyntheticTile {
    bytes: usize,
}

struct SyntheticLoader {
    fail_every: Option<u32>,
    latency: Duration,
}

impl ContentLoader for SyntheticLoader {
    type Content = SyntheticTile;

    fn load(&self, job: &LoadJob) -> Result<SyntheticTile, LoadError> {
        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }
        let failing = self
            .fail_every
            .is_some_and(|n| n > 0 && (job.key.tile.0 + 1) % n == 0);
        if failing {
            return Err(LoadError::Transport {
                content: job.content.clone(),
                reason: "simulated network failure".into(),
            });
        }
        Ok(SyntheticTile {
            bytes: 4096 + job.content.as_str().len() * 64,
        })
    }
}

#[derive(Debug, Default)]
struct Totals {
    frames: u64,
    dispatched: usize,
    completed: usize,
    failed: usize,
    rejected: usize,
    cancelled: usize,
    evicted: usize,
    processed: usize,
    max_cache: usize,
    max_rendered: usize,
    max_in_flight: usize,
    traversal: Duration,
}

fn orbit(frame: u64, radius: f32) -> Viewpoint {
    let angle = frame as f32 * 0.02;
    let eye = Vec3::new(angle.cos() * radius, radius * 0.35, angle.sin() * radius);
    Viewpoint::looking_at(eye, Vec3::ZERO)
}

fn run_frames<Q>(
    scene: &mut Scene<SyntheticTile>,
    loads: &mut Q,
    frames: u64,
    frame_time: Option<Duration>,
) -> Totals
where
    Q: LoadQueue<SyntheticTile>,
{
    let mut totals = Totals::default();
    for frame in 0..frames {
        let started = Instant::now();
        let report = scene.update(&[orbit(frame, 800.0)], loads);
        let stats = &report.stats;

        totals.frames += 1;
        totals.dispatched += stats.dispatched;
        totals.completed += stats.completed;
        totals.failed += stats.failed;
        totals.rejected += stats.rejected;
        totals.cancelled += stats.cancelled;
        totals.evicted += stats.evicted;
        totals.processed += stats.processed;
        totals.max_cache = totals.max_cache.max(stats.cache_len);
        totals.max_rendered = totals.max_rendered.max(stats.rendered);
        totals.max_in_flight = totals.max_in_flight.max(stats.in_flight);
        totals.traversal += stats.traversal_time;

        if report.frame % 30 == 0 {
            let bytes: usize = report
                .render
                .iter()
                .filter_map(|&key| scene.content(key))
                .map(|tile| tile.bytes)
                .sum();
            tracing::info!(
                frame = report.frame,
                rendered = stats.rendered,
                render_bytes = bytes,
                cache = stats.cache_len,
                pending = stats.pending,
                in_flight = stats.in_flight,
                "frame"
            );
        }

        if let Some(rest) = frame_time.and_then(|budget| budget.checked_sub(started.elapsed())) {
            std::thread::sleep(rest);
        }
    }
    totals
}

fn inspect(tree: &TileTree) {
    println!("tiles: {}", tree.len());
    println!("leaves: {}", tree.leaf_count());
    println!("max depth: {}", tree.max_depth());
    let with_content = tree.iter().filter(|n| n.has_content()).count();
    println!("with content: {with_content}");
    for depth in 0..=tree.max_depth() {
        let level: Vec<_> = tree.iter().filter(|n| n.depth == depth).collect();
        let error = level.first().map_or(0.0, |n| n.geometric_error);
        println!("  depth {depth}: {} tiles, geometric error {error}", level.len());
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match cli.command {
        Commands::Info => {
            println!("tilestream-cli v{}", env!("CARGO_PKG_VERSION"));
            println!("common: {}", tilestream_common::crate_info());
            println!("hierarchy: {}", tilestream_hierarchy::crate_info());
            println!("stream: {}", tilestream_stream::crate_info());
        }
        Commands::Inspect { levels, empty_root } => {
            let tree = quadtree(&QuadtreeParams {
                levels,
                empty_root,
                ..QuadtreeParams::default()
            })?;
            inspect(&tree);
        }
        Commands::DefaultConfig { path } => {
            let mut config = StreamConfig::default();
            config.tilesets.push(Default::default());
            config
                .save(&path)
                .with_context(|| format!("writing {}", path.display()))?;
            println!("wrote {}", path.display());
        }
        Commands::Simulate {
            levels,
            frames,
            config,
            inline,
            threads,
            fail_every,
            latency_ms,
            frame_ms,
        } => {
            let config = match config {
                Some(path) => StreamConfig::load(&path)
                    .with_context(|| format!("reading {}", path.display()))?,
                None => StreamConfig::default(),
            };
            let tileset_options = config.tilesets.first().cloned().unwrap_or_default();
            let tree = quadtree(&QuadtreeParams {
                levels,
                empty_root: true,
                ..QuadtreeParams::default()
            })?;
            println!(
                "Simulating {frames} frames over {} tiles ({} loads)",
                tree.len(),
                if inline { "inline" } else { "pooled" }
            );

            let mut scene = Scene::new(config.scene)?;
            scene.add_tileset(TilesetEntry::new(tree, tileset_options))?;
            let loader = SyntheticLoader {
                fail_every,
                latency: Duration::from_millis(latency_ms),
            };

            let started = Instant::now();
            let totals = if inline {
                let mut loads = InlineLoads::new(loader);
                run_frames(&mut scene, &mut loads, frames, None)
            } else {
                let mut pool = WorkerPool::new(Arc::new(loader), threads)
                    .context("starting load workers")?;
                run_frames(
                    &mut scene,
                    &mut pool,
                    frames,
                    Some(Duration::from_millis(frame_ms)),
                )
            };

            println!("Done in {:?}", started.elapsed());
            println!(
                "frames={} dispatched={} completed={} failed={} rejected={} cancelled={}",
                totals.frames,
                totals.dispatched,
                totals.completed,
                totals.failed,
                totals.rejected,
                totals.cancelled
            );
            println!(
                "evicted={} processed={} max_cache={} max_rendered={} max_in_flight={}",
                totals.evicted,
                totals.processed,
                totals.max_cache,
                totals.max_rendered,
                totals.max_in_flight
            );
            let per_frame = totals.traversal / totals.frames.max(1) as u32;
            println!("traversal: {per_frame:?}/frame");
        }
    }

    Ok(())
}
