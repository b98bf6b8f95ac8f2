//! Streaming: divisible spatial grid and reference-counted actor visibility.
//!
//! # Invariants
//! - Every streamed actor is held by exactly one chunk, the one containing its
//!   streaming placement, or the overflow chunk when it is outside the grid.
//! - A counted actor's visibility counter equals the number of players whose
//!   streaming placement sees it; it never goes negative.
//! - A moving player credits its destination before debiting its origin, so
//!   actors seen from both never flicker.
//! - Empty cells are pruned; the overflow chunk never is.

mod actor;
mod chunk;
mod config;
mod error;
mod grid;
mod stats;
mod streamer;
mod tracker;

pub use actor::{Actor, ActorWrapper, Observer, Transition, Underflow, VisibilityCounter};
pub use chunk::{Chunk, ChunkId, VisibilityChanges};
pub use config::{GridConfig, StreamerConfig};
pub use error::{ConfigError, GridError, StreamError};
pub use grid::{LeafCoord, SpatialGrid};
pub use stats::{PassRecord, Phase, StreamStats};
pub use streamer::{PassHook, Streamer};
pub use tracker::{PlacementChange, PlacementTracker};

pub fn crate_info() -> &'static str {
    concat!("worldstream-stream v", env!("CARGO_PKG_VERSION"))
}
