use glam::DVec3;
use worldstream_common::ActorId;

use crate::chunk::ChunkId;

/// Errors from grid addressing.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GridError {
    #[error("point ({}, {}, {}) lies outside the grid bounds", point.x, point.y, point.z)]
    OutOfBounds { point: DVec3 },
    #[error("grid node {index} is missing from its arena")]
    StaleNode { index: u32 },
}

/// Errors from streamer bookkeeping.
///
/// None of these are recoverable locally: each one means the server's view of
/// who sees what has drifted from what was actually sent to players.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StreamError {
    #[error(transparent)]
    Grid(#[from] GridError),
    #[error("visibility counter underflow for actor {actor}")]
    VisibilityUnderflow { actor: ActorId },
    #[error("actor {actor} is not present in chunk {chunk}")]
    MissingActor { actor: ActorId, chunk: ChunkId },
    #[error("actor {actor} already joined the map")]
    AlreadyJoined { actor: ActorId },
    #[error("actor {actor} is not in the map")]
    UnknownActor { actor: ActorId },
    #[error("actor {actor} was dropped while still streamed")]
    ActorDropped { actor: ActorId },
}

/// Errors from loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
