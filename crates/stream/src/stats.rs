use std::time::Duration;

use crate::chunk::ChunkId;

/// Streaming counters since the start of the last [`update`](crate::Streamer::update).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamStats {
    pub joins: usize,
    pub leaves: usize,
    pub placement_changes: usize,
    pub counters_raised: usize,
    pub counters_lowered: usize,
    pub chunks_applied: usize,
    pub shown: usize,
    pub hidden: usize,
    pub streamed_actors: usize,
    pub live_cells: usize,
    pub frame_time: Duration,
}

impl std::fmt::Display for StreamStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "actors={} cells={} moves={} +{}/-{} credit shown={} hidden={} applied={} in {:?}",
            self.streamed_actors,
            self.live_cells,
            self.placement_changes,
            self.counters_raised,
            self.counters_lowered,
            self.shown,
            self.hidden,
            self.chunks_applied,
            self.frame_time
        )
    }
}

/// Chunks visited by the most recent placement change, in visiting order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassRecord {
    pub credited: Vec<ChunkId>,
    pub debited: Vec<ChunkId>,
    pub applied: Vec<ChunkId>,
}

/// Points inside a placement change at which a hook is called.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Credited,
    Debited,
    Applied,
}
