use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use worldgrid_common::{Difficulty, WorldPosition};
use worldgrid_kernel::{
    ManualClock, MapEntry, MapManager, MapType, ScriptLibrary, SimContext, WorldConfig, WorldObject,
};
use worldgrid_persist::FilePersistence;
use worldgrid_stream::{GridCoord, MAX_NUMBER_OF_GRIDS, SIZE_OF_GRIDS};
use worldgrid_terrain::{MAP_ALL_LIQUIDS, TerrainKey, TerrainLoader};

#[derive(Parser)]
#[command(name = "worldgrid-cli", about = "CLI tool for worldgrid operations")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print version and grid geometry
    Info,
    /// Inspect the terrain page covering a world position
    Terrain {
        /// Directory holding maps/ and vmaps/
        #[arg(short, long, default_value = "data")]
        data: PathBuf,
        #[arg(short, long, default_value = "0")]
        map: u32,
        #[arg(short, long, default_value = "0", allow_hyphen_values = true)]
        x: f32,
        #[arg(short, long, default_value = "0", allow_hyphen_values = true)]
        y: f32,
        #[arg(short, long, default_value = "0", allow_hyphen_values = true)]
        z: f32,
    },
    /// Load a world config and report its map catalog
    ValidateConfig {
        /// .yaml/.yml or .json file
        path: PathBuf,
        /// Optional script library to load alongside
        #[arg(long)]
        scripts: Option<PathBuf>,
    },
    /// Run a headless simulation of players entering maps
    Simulate {
        /// World config; a small built-in catalog is used when omitted
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Store directory for instance saves and binds; in-memory when omitted
        #[arg(short, long)]
        store: Option<PathBuf>,
        /// Map every player enters
        #[arg(short, long, default_value = "0")]
        map: u32,
        #[arg(short, long, default_value = "5")]
        players: u32,
        #[arg(short, long, default_value = "100")]
        ticks: u64,
        /// Milliseconds per tick
        #[arg(long, default_value = "100")]
        tick_ms: u32,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match cli.command {
        Commands::Info => {
            println!("worldgrid-cli v{}", env!("CARGO_PKG_VERSION"));
            println!(
                "grids: {MAX_NUMBER_OF_GRIDS}x{MAX_NUMBER_OF_GRIDS}, {SIZE_OF_GRIDS:.2} units per grid"
            );
        }
        Commands::Terrain { data, map, x, y, z } => inspect_terrain(data, map, x, y, z)?,
        Commands::ValidateConfig { path, scripts } => {
            let config = WorldConfig::load(&path).with_context(|| format!("loading {}", path.display()))?;
            println!("{}: {} maps", path.display(), config.maps.len());
            for entry in &config.maps {
                println!(
                    "  {:>4} {:<24} {:?} max_players={} reset={}s",
                    entry.id,
                    entry.name,
                    entry.map_type,
                    entry.max_players(Difficulty::REGULAR),
                    entry.max_reset_delay(Difficulty::REGULAR),
                );
            }
            if let Some(scripts) = scripts {
                let library =
                    ScriptLibrary::load(&scripts).with_context(|| format!("loading {}", scripts.display()))?;
                println!("{}: {} script steps", scripts.display(), library.len());
            }
        }
        Commands::Simulate {
            config,
            store,
            map,
            players,
            ticks,
            tick_ms,
        } => {
            let config = match config {
                Some(path) => WorldConfig::load(&path).with_context(|| format!("loading {}", path.display()))?,
                None => demo_config(),
            };
            simulate(config, store, map, players, ticks, tick_ms)?;
        }
    }

    Ok(())
}

fn inspect_terrain(data: PathBuf, map: u32, x: f32, y: f32, z: f32) -> anyhow::Result<()> {
    let grid = GridCoord::from_world(x, y).context("position outside the map")?;
    let (tile_x, tile_y) = grid.terrain_tile();
    let key = TerrainKey::new(map, tile_x, tile_y);
    let loader = TerrainLoader::new(data, Vec::new());
    let path = loader.map_file_path(key);
    println!("grid {grid} -> {}", path.display());
    if !loader.exists(key) {
        println!("no usable terrain page");
        return Ok(());
    }

    let page = loader.load_page(key);
    let (status, liquid) = page.liquid_status(x, y, z, MAP_ALL_LIQUIDS);
    println!("area:          {}", page.area(x, y));
    println!("height:        {:.3}", page.height(x, y));
    println!("liquid level:  {:.3}", page.liquid_level(x, y));
    println!("terrain type:  {:#04x}", page.terrain_type(x, y));
    println!("liquid status: {status:?}");
    if let Some(liquid) = liquid {
        println!("liquid:        {liquid:?}");
    }
    Ok(())
}

fn demo_config() -> WorldConfig {
    WorldConfig {
        instance_unload_delay_ms: 5_000,
        maps: vec![
            MapEntry::new(0, "Eastern Kingdoms", MapType::Common),
            MapEntry::new(36, "Deadmines", MapType::Dungeon).with_difficulty(10, 0),
            MapEntry::new(249, "Onyxia's Lair", MapType::Raid).with_difficulty(40, 432_000),
        ],
        ..WorldConfig::default()
    }
}

fn simulate(
    config: WorldConfig,
    store: Option<PathBuf>,
    map: u32,
    players: u32,
    ticks: u64,
    tick_ms: u32,
) -> anyhow::Result<()> {
    anyhow::ensure!(config.map_entry(map).is_some(), "map {map} is not in the catalog");

    let clock = Arc::new(ManualClock::new(0));
    let mut ctx = SimContext::new(config).with_clock(clock.clone());
    let persistence = match store {
        Some(path) => {
            let persistence =
                Arc::new(FilePersistence::open(&path).with_context(|| format!("opening {}", path.display()))?.buffered());
            ctx = ctx.with_persistence(persistence.clone());
            Some(persistence)
        }
        None => None,
    };

    let mut manager = MapManager::new(ctx);
    let mut refused = 0;
    for low in 1..=players {
        let spread = (low as f32) * 12.0;
        let at = WorldPosition::new(map, 0, spread, -spread, 0.0, 0.0);
        if let Err(rejected) = manager.enter(WorldObject::player(low, format!("player{low}"), at), Difficulty::REGULAR) {
            tracing::info!(player = low, reason = %rejected.reason, "player refused");
            refused += 1;
        }
    }

    let mut elapsed_ms = 0u64;
    for _ in 0..ticks {
        for rejected in manager.update(tick_ms) {
            tracing::info!(guid = %rejected.object.guid(), reason = %rejected.reason, "transfer refused");
        }
        elapsed_ms += u64::from(tick_ms);
        clock.set(elapsed_ms / 1000);
    }

    let stats = manager.tick_stats();
    println!(
        "simulated {ticks} ticks of {tick_ms} ms: {} maps ({} instances), {refused} players refused",
        manager.map_count(),
        manager.instance_count()
    );
    println!(
        "tick time: last {:?}, average {:?}, max {:?}",
        stats.last, stats.average, stats.max
    );
    if let Some(shared) = manager.find_map(map, 0) {
        let m = shared.lock();
        println!(
            "map {map}: {} objects, {} players, {} grids created",
            m.object_count(),
            m.player_count(),
            m.created_grid_count()
        );
    }

    manager.unload_all();
    if let Some(persistence) = persistence {
        persistence.checkpoint().context("writing store checkpoint")?;
    }
    Ok(())
}
