use worldstream_common::{ActorId, Placement};

use crate::error::StreamError;
use crate::streamer::Streamer;

/// A placement change worth recomputing visibility for.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlacementChange {
    pub previous: Placement,
    pub current: Placement,
}

/// Filters an actor's placement updates down to the significant ones.
///
/// Small moves are measured against the last forwarded placement, so jitter
/// accumulates until it crosses the threshold instead of being lost.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlacementTracker {
    actor: ActorId,
    last: Placement,
    threshold: f64,
}

impl PlacementTracker {
    pub fn new(actor: ActorId, initial: Placement, threshold: f64) -> Self {
        Self {
            actor,
            last: initial,
            threshold,
        }
    }

    pub fn actor(&self) -> ActorId {
        self.actor
    }

    /// Last placement forwarded to the streamer.
    pub fn last(&self) -> Placement {
        self.last
    }

    /// Restart tracking from `placement`, e.g. after a change forwarded by
    /// another path.
    pub fn reset(&mut self, placement: Placement) {
        self.last = placement;
    }

    /// A world or interior change, or a move of at least the threshold.
    pub fn is_significant(&self, previous: &Placement, current: &Placement) -> bool {
        !previous.same_space(current) || previous.distance_to(current) >= self.threshold
    }

    /// Record `current`; returns the change if it should be forwarded.
    pub fn observe(&mut self, current: Placement) -> Option<PlacementChange> {
        if !self.is_significant(&self.last, &current) {
            return None;
        }
        let previous = std::mem::replace(&mut self.last, current);
        Some(PlacementChange { previous, current })
    }

    /// Hand `current` to `streamer`, which judges it against the placement
    /// it last applied for this actor. Returns whether anything was forwarded.
    ///
    /// The streamer's tracker is the one that counts; this copy is resynced
    /// from it afterwards, so moves applied through other paths are never
    /// measured against a stale baseline.
    pub fn forward(
        &mut self,
        streamer: &mut Streamer,
        current: Placement,
    ) -> Result<bool, StreamError> {
        let forwarded = streamer.placement_updated(self.actor, current)?;
        if let Some(synced) = streamer.tracker_for(self.actor) {
            self.last = synced.last;
        }
        Ok(forwarded)
    }
}
