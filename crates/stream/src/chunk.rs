use worldstream_common::{ActorId, ActorKind};

use crate::actor::{ActorWrapper, Observer, Transition};
use crate::error::StreamError;
use crate::grid::LeafCoord;

/// Identity of a chunk: a grid cell, or the catch-all for everything outside
/// the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChunkId {
    Cell(LeafCoord),
    Overflow,
}

impl std::fmt::Display for ChunkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChunkId::Cell(coord) => write!(f, "cell {coord}"),
            ChunkId::Overflow => write!(f, "overflow"),
        }
    }
}

/// Shown/hidden transitions committed by one or more `apply_visibility` calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VisibilityChanges {
    pub shown: usize,
    pub hidden: usize,
}

impl VisibilityChanges {
    pub fn record(&mut self, transition: Transition) {
        match transition {
            Transition::Show => self.shown += 1,
            Transition::Hide => self.hidden += 1,
        }
    }

    pub fn merge(&mut self, other: VisibilityChanges) {
        self.shown += other.shown;
        self.hidden += other.hidden;
    }
}

/// The actors located in one cell, one collection per kind.
///
/// A chunk does not know who sees its actors; it only forwards observer
/// credit to the wrappers it holds.
#[derive(Debug)]
pub struct Chunk {
    id: ChunkId,
    actors: [Vec<ActorWrapper>; ActorKind::COUNT],
}

impl Chunk {
    pub fn new(id: ChunkId) -> Self {
        Self {
            id,
            actors: Default::default(),
        }
    }

    pub fn id(&self) -> ChunkId {
        self.id
    }

    /// Take ownership of `wrapper` and point it back at this chunk.
    pub fn intercept(&mut self, mut wrapper: ActorWrapper) {
        wrapper.attach(self.id);
        self.actors[wrapper.kind().index()].push(wrapper);
    }

    /// Hand the wrapper for `actor` back to the caller, detached.
    pub fn release(&mut self, actor: ActorId) -> Result<ActorWrapper, StreamError> {
        for bucket in &mut self.actors {
            if let Some(pos) = bucket.iter().position(|w| w.id() == actor) {
                let mut wrapper = bucket.swap_remove(pos);
                wrapper.detach();
                return Ok(wrapper);
            }
        }
        Err(StreamError::MissingActor {
            actor,
            chunk: self.id,
        })
    }

    /// Credit every counted actor here that `observer` can see.
    /// Returns the number of counters raised.
    pub fn add_score_around_player(&mut self, observer: &Observer, radius: f64) -> usize {
        let mut touched = 0;
        for wrapper in self.counted_mut() {
            if wrapper.zone_contains(observer, radius) {
                wrapper.visibility_enter();
                touched += 1;
            }
        }
        touched
    }

    /// Withdraw the credit `observer` gave from its placement.
    /// Returns the number of counters lowered.
    pub fn subtract_score_around_player(
        &mut self,
        observer: &Observer,
        radius: f64,
    ) -> Result<usize, StreamError> {
        let mut touched = 0;
        for wrapper in self.counted_mut() {
            if wrapper.zone_contains(observer, radius) {
                wrapper.visibility_leave()?;
                touched += 1;
            }
        }
        Ok(touched)
    }

    /// Commit pending shown/hidden changes for every counted actor here.
    pub fn apply_visibility(&mut self) -> Result<VisibilityChanges, StreamError> {
        let mut changes = VisibilityChanges::default();
        for wrapper in self.counted_mut() {
            if let Some(transition) = wrapper.apply_visibility()? {
                changes.record(transition);
            }
        }
        Ok(changes)
    }

    pub fn is_empty(&self) -> bool {
        self.actors.iter().all(Vec::is_empty)
    }

    pub fn len(&self) -> usize {
        self.actors.iter().map(Vec::len).sum()
    }

    pub fn actors(&self, kind: ActorKind) -> &[ActorWrapper] {
        &self.actors[kind.index()]
    }

    pub fn wrapper(&self, actor: ActorId) -> Option<&ActorWrapper> {
        self.actors.iter().flatten().find(|w| w.id() == actor)
    }

    pub fn wrapper_mut(&mut self, actor: ActorId) -> Option<&mut ActorWrapper> {
        self.actors.iter_mut().flatten().find(|w| w.id() == actor)
    }

    /// Players in this chunk, as observers at their streaming placement.
    pub fn observers(&self) -> impl Iterator<Item = Observer> + '_ {
        self.actors(ActorKind::Player)
            .iter()
            .filter_map(ActorWrapper::as_observer)
    }

    fn counted_mut(&mut self) -> impl Iterator<Item = &mut ActorWrapper> {
        self.actors
            .iter_mut()
            .flatten()
            .filter(|w| w.is_counted())
    }
}
