use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, Subcommand};
use glam::Vec3;
use tracing_subscriber::EnvFilter;
use viewspace_common::{Bounds, CellAttributes, CellId, Identity, Transform, ViewerId};
use viewspace_stream::{ImmediateScheduler, InMemoryCacheManager, SpatialConfig, Universe};

#[derive(Parser)]
#[command(name = "viewspace-cli", about = "CLI tool for viewspace operations")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print version and default tuning
    Info,
    /// Walk viewers through a grid of cells and report what each one loaded
    Simulate {
        /// Number of viewers to log in
        #[arg(long, default_value = "2")]
        viewers: usize,
        /// Number of cells to spawn
        #[arg(long, default_value = "100")]
        cells: usize,
        /// Number of movement steps per viewer
        #[arg(long, default_value = "50")]
        steps: usize,
        /// YAML or JSON config file
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Load and validate a config file
    CheckConfig {
        /// YAML or JSON config file
        file: PathBuf,
    },
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<SpatialConfig> {
    match path {
        Some(path) => SpatialConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => Ok(SpatialConfig::default()),
    }
}

fn print_config(config: &SpatialConfig) {
    println!("space_size: {}", config.space_size);
    println!("proximity_radius: {}", config.proximity_radius);
    println!("hysteresis_radius: {}", config.hysteresis_radius());
    println!("batch_window: {:?}", config.batch_window());
    println!("retry_backoff: {:?}", config.retry_backoff());
    println!("max_root_spaces: {}", config.max_root_spaces);
}

fn simulate(viewers: usize, cells: usize, steps: usize, config: SpatialConfig) -> anyhow::Result<()> {
    let spacing = config.space_size / 2.0;
    let settle = config.batch_window() * 4 + Duration::from_millis(50);
    let manager = Arc::new(InMemoryCacheManager::new());
    let universe = Universe::new(config, Arc::new(ImmediateScheduler), manager.clone())?;

    let side = (cells as f32).sqrt().ceil().max(1.0) as usize;
    for i in 0..cells {
        let at = Vec3::new((i % side) as f32 * spacing, 0.0, (i / side) as f32 * spacing);
        universe.insert_cell(
            CellId::new(),
            CellAttributes::default(),
            Bounds::sphere(Vec3::ZERO, 1.0),
            Transform::from_position(at),
        )?;
    }
    println!("Spawned {cells} cells on a {side}x{side} grid, spacing {spacing}");

    let extent = side as f32 * spacing;
    let mut ids = Vec::with_capacity(viewers);
    for v in 0..viewers {
        let id = ViewerId::new();
        let lane = (v as f32 + 0.5) / viewers.max(1) as f32 * extent;
        universe.viewer_login(
            id,
            Identity::new(format!("viewer-{v}")),
            &Transform::from_position(Vec3::new(0.0, 0.0, lane)),
        )?;
        ids.push((id, lane));
    }

    let start = Instant::now();
    for step in 0..steps {
        let x = (step + 1) as f32 / steps.max(1) as f32 * extent;
        for (id, lane) in &ids {
            universe.viewer_moved(*id, &Transform::from_position(Vec3::new(x, 0.0, *lane)))?;
        }
    }
    tracing::info!(elapsed = ?start.elapsed(), steps, "walk finished");

    let deadline = Instant::now() + settle;
    while Instant::now() < deadline {
        let pending: usize = ids
            .iter()
            .map(|(id, _)| universe.cache_stats(*id).map(|s| s.pending_changes).unwrap_or(0))
            .sum();
        if pending == 0 {
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    std::thread::sleep(settle);

    for (id, _) in &ids {
        let stats = universe.cache_stats(*id)?;
        let health = universe.cache_health(*id)?;
        println!(
            "viewer {:?}: spaces={}, visible_roots={}, revalidations={}, loaded={}, batches={}, failures={}, smoothed_latency={:?}",
            id.0,
            stats.spaces,
            stats.visible_roots,
            stats.revalidations,
            manager.loaded_count(*id),
            health.dispatched_batches,
            health.total_failures,
            health.smoothed_latency,
        );
    }
    println!(
        "spaces={}, root placements={}",
        universe.partition().space_count(),
        universe.partition().total_root_placements()
    );

    universe.shutdown();
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match cli.command {
        Commands::Info => {
            println!("viewspace-cli v{}", env!("CARGO_PKG_VERSION"));
            println!("stream: {}", viewspace_stream::crate_info());
            println!("bounds: {}", viewspace_bounds::crate_info());
            println!();
            print_config(&SpatialConfig::default());
        }
        Commands::Simulate {
            viewers,
            cells,
            steps,
            config,
        } => {
            let config = load_config(config.as_ref())?;
            simulate(viewers, cells, steps, config)?;
        }
        Commands::CheckConfig { file } => {
            let config = load_config(Some(&file))?;
            println!("{}: OK", file.display());
            print_config(&config);
        }
    }

    Ok(())
}
