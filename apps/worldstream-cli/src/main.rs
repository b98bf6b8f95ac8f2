use std::cell::Cell;
use std::path::PathBuf;
use std::rc::Rc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use glam::DVec3;
use tracing_subscriber::EnvFilter;
use worldstream_common::{ActorId, ActorKind, Placement};
use worldstream_stream::{Actor, Streamer, StreamerConfig};

#[derive(Parser)]
#[command(name = "worldstream-cli", about = "CLI tool for worldstream operations")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// JSON streamer configuration; defaults apply to missing fields
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print crate info and the effective configuration
    Info,
    /// Run a deterministic streaming simulation
    Simulate {
        /// Number of wandering players
        #[arg(short, long, default_value = "4")]
        players: usize,
        /// Number of streamed objects
        #[arg(short, long, default_value = "200")]
        objects: usize,
        /// Number of ticks to simulate
        #[arg(short, long, default_value = "10")]
        ticks: u64,
        /// RNG seed for placement and movement
        #[arg(short, long, default_value = "42")]
        seed: u64,
    },
}

/// Deterministic 64-bit generator (splitmix64).
struct SplitMix64(u64);

impl SplitMix64 {
    fn next_u64(&mut self) -> u64 {
        self.0 = self.0.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = self.0;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }

    /// Uniform in `[-1, 1)`.
    fn signed_unit(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64 * 2.0 - 1.0
    }
}

/// A pooled entity that counts the show/hide calls it receives.
struct DemoActor {
    id: ActorId,
    kind: ActorKind,
    owner: Option<ActorId>,
    placement: Cell<Placement>,
    visible: Cell<bool>,
    shows: Cell<u32>,
    hides: Cell<u32>,
}

impl DemoActor {
    fn new(id: ActorId, kind: ActorKind, owner: Option<ActorId>, placement: Placement) -> Rc<Self> {
        Rc::new(Self {
            id,
            kind,
            owner,
            placement: Cell::new(placement),
            visible: Cell::new(false),
            shows: Cell::new(0),
            hides: Cell::new(0),
        })
    }

    fn step(&self, rng: &mut SplitMix64, stride: f64) {
        let mut p = self.placement.get();
        p.location += DVec3::new(rng.signed_unit(), 0.0, rng.signed_unit()) * stride;
        self.placement.set(p);
    }
}

impl Actor for DemoActor {
    fn id(&self) -> ActorId {
        self.id
    }

    fn kind(&self) -> ActorKind {
        self.kind
    }

    fn placement(&self) -> Placement {
        self.placement.get()
    }

    fn owner(&self) -> Option<ActorId> {
        self.owner
    }

    fn show(&self) {
        self.visible.set(true);
        self.shows.set(self.shows.get() + 1);
    }

    fn hide(&self) {
        self.visible.set(false);
        self.hides.set(self.hides.get() + 1);
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<StreamerConfig> {
    match path {
        Some(path) => StreamerConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => Ok(StreamerConfig::default()),
    }
}

/// Objects cycle through the counted kinds; personal objects belong to a player.
fn object_kind(i: usize) -> ActorKind {
    match i % 4 {
        0 => ActorKind::Vehicle,
        1 => ActorKind::GlobalObject,
        2 => ActorKind::UniversalObject,
        _ => ActorKind::PersonalObject,
    }
}

fn simulate(
    config: StreamerConfig,
    players: usize,
    objects: usize,
    ticks: u64,
    seed: u64,
) -> anyhow::Result<()> {
    println!(
        "Streaming simulation: players={players}, objects={objects}, ticks={ticks}, seed={seed}"
    );
    let mut rng = SplitMix64(seed);
    let mut streamer = Streamer::new(config)?;
    let spread = config.visibility_distance * 4.0;
    let stride = config.visibility_distance / 4.0;
    let mut next_id = u128::from(seed) << 64;
    let mut fresh_id = || {
        next_id += 1;
        ActorId::from_u128(next_id)
    };
    let scatter = |rng: &mut SplitMix64| {
        let offset = DVec3::new(rng.signed_unit(), 0.0, rng.signed_unit()) * spread;
        Placement::at(config.grid.center + offset)
    };

    let player_pool: Vec<Rc<DemoActor>> = (0..players)
        .map(|_| DemoActor::new(fresh_id(), ActorKind::Player, None, scatter(&mut rng)))
        .collect();
    let object_pool: Vec<Rc<DemoActor>> = (0..objects)
        .map(|i| {
            let kind = object_kind(i);
            let owner = match kind {
                ActorKind::PersonalObject if !player_pool.is_empty() => {
                    Some(player_pool[i % player_pool.len()].id)
                }
                _ => None,
            };
            DemoActor::new(fresh_id(), kind, owner, scatter(&mut rng))
        })
        .collect();

    for actor in player_pool.iter().chain(&object_pool) {
        let actor: Rc<dyn Actor> = actor.clone();
        streamer.when_actor_joins_map(&actor)?;
    }
    tracing::info!(
        actors = streamer.actor_count(),
        cells = streamer.grid().leaf_count(),
        "population joined"
    );
    let visible = object_pool.iter().filter(|a| a.visible.get()).count();
    println!(
        "Joined: actors={}, cells={}, visible objects={visible}",
        streamer.actor_count(),
        streamer.grid().leaf_count()
    );

    for tick in 1..=ticks {
        for player in &player_pool {
            player.step(&mut rng, stride);
        }
        for vehicle in object_pool.iter().filter(|a| a.kind == ActorKind::Vehicle) {
            vehicle.step(&mut rng, stride / 2.0);
        }
        let stats = streamer.update()?;
        tracing::debug!(tick, moves = stats.placement_changes, frame_time = ?stats.frame_time, "tick streamed");
        println!("tick {tick}: {stats}");
    }

    let shows: u32 = object_pool.iter().map(|a| a.shows.get()).sum();
    let hides: u32 = object_pool.iter().map(|a| a.hides.get()).sum();
    let visible = object_pool.iter().filter(|a| a.visible.get()).count();
    println!("Totals: shows={shows}, hides={hides}, visible objects={visible}");

    for actor in player_pool.iter().chain(&object_pool) {
        streamer.when_actor_leaves_map(actor.id)?;
    }
    if streamer.grid().leaf_count() > 0 {
        tracing::warn!(cells = streamer.grid().leaf_count(), "cells left after teardown");
    }
    let leftover = object_pool.iter().filter(|a| a.visible.get()).count();
    println!(
        "After teardown: actors={}, cells={}, visible objects={leftover}",
        streamer.actor_count(),
        streamer.grid().leaf_count()
    );
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Info => {
            println!("worldstream-cli v{}", env!("CARGO_PKG_VERSION"));
            println!("stream: {}", worldstream_stream::crate_info());
            let grid = &config.grid;
            println!(
                "grid: center={}, half_extent={}, arity={}, depth={}",
                grid.center, grid.half_extent, grid.arity, grid.depth
            );
            println!(
                "leaves: {} per axis, leaf size {}",
                grid.cells_per_axis(),
                grid.leaf_size()
            );
            println!(
                "streaming: visibility_distance={}, significant_distance={}",
                config.visibility_distance, config.significant_distance
            );
        }
        Commands::Simulate {
            players,
            objects,
            ticks,
            seed,
        } => simulate(config, players, objects, ticks, seed)?,
    }

    Ok(())
}
