use std::rc::{Rc, Weak};

use worldstream_common::{ActorId, ActorKind, Placement};

use crate::chunk::ChunkId;
use crate::error::StreamError;

/// What the streamer needs from a game entity.
///
/// Entities are owned by their pools; the streamer only holds weak references.
pub trait Actor {
    fn id(&self) -> ActorId;

    fn kind(&self) -> ActorKind;

    /// Current authoritative placement, read fresh on every call.
    fn placement(&self) -> Placement;

    /// Owning player, for personal objects.
    fn owner(&self) -> Option<ActorId> {
        None
    }

    /// Make the actor visible to clients. Only called for counted kinds.
    fn show(&self);

    /// Hide the actor from clients. Only called for counted kinds.
    fn hide(&self);
}

/// A player's point of view, as used by the visibility passes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observer {
    pub id: ActorId,
    pub placement: Placement,
}

/// Shown/hidden change produced by [`VisibilityCounter::settle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Show,
    Hide,
}

/// How many players currently see an actor, and whether it is shown.
///
/// Leaving more often than entering is a bookkeeping bug and is reported,
/// never clamped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VisibilityCounter {
    count: u32,
    shown: bool,
}

/// Returned when a counter would drop below zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Underflow;

impl VisibilityCounter {
    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn is_shown(&self) -> bool {
        self.shown
    }

    pub fn enter(&mut self) {
        self.count += 1;
    }

    pub fn leave(&mut self) -> Result<(), Underflow> {
        self.count = self.count.checked_sub(1).ok_or(Underflow)?;
        Ok(())
    }

    /// Reconcile the shown flag with the count. Only 0 <-> non-zero crossings
    /// produce a transition.
    pub fn settle(&mut self) -> Option<Transition> {
        match (self.count > 0, self.shown) {
            (true, false) => {
                self.shown = true;
                Some(Transition::Show)
            }
            (false, true) => {
                self.shown = false;
                Some(Transition::Hide)
            }
            _ => None,
        }
    }
}

/// An actor as held by a chunk.
///
/// `placement` is the placement the streamer last applied for the actor, which
/// may lag behind the actor's live position until the change is significant.
#[derive(Debug)]
pub struct ActorWrapper {
    actor: Weak<dyn Actor>,
    id: ActorId,
    kind: ActorKind,
    owner: Option<ActorId>,
    placement: Placement,
    chunk: Option<ChunkId>,
    visibility: Option<VisibilityCounter>,
}

impl ActorWrapper {
    /// Wrap `actor` at its current placement. Not owned by any chunk yet.
    pub fn new(actor: &Rc<dyn Actor>) -> Self {
        let kind = actor.kind();
        Self {
            actor: Rc::downgrade(actor),
            id: actor.id(),
            kind,
            owner: actor.owner(),
            placement: actor.placement(),
            chunk: None,
            visibility: kind.is_counted().then(VisibilityCounter::default),
        }
    }

    pub fn id(&self) -> ActorId {
        self.id
    }

    pub fn kind(&self) -> ActorKind {
        self.kind
    }

    pub fn placement(&self) -> Placement {
        self.placement
    }

    pub(crate) fn set_placement(&mut self, placement: Placement) {
        self.placement = placement;
    }

    /// Chunk currently holding this wrapper.
    pub fn chunk(&self) -> Option<ChunkId> {
        self.chunk
    }

    pub(crate) fn attach(&mut self, chunk: ChunkId) {
        self.chunk = Some(chunk);
    }

    pub(crate) fn detach(&mut self) {
        self.chunk = None;
    }

    pub fn actor(&self) -> Option<Rc<dyn Actor>> {
        self.actor.upgrade()
    }

    pub fn visibility(&self) -> Option<&VisibilityCounter> {
        self.visibility.as_ref()
    }

    pub fn is_counted(&self) -> bool {
        self.visibility.is_some()
    }

    /// The observer view of this wrapper, for players.
    pub fn as_observer(&self) -> Option<Observer> {
        (self.kind == ActorKind::Player).then_some(Observer {
            id: self.id,
            placement: self.placement,
        })
    }

    /// Whether `observer` sees this actor at its streaming placement.
    pub fn zone_contains(&self, observer: &Observer, radius: f64) -> bool {
        self.zone_contains_from(&self.placement, observer, radius)
    }

    /// Whether `observer` would see this actor if it stood at `at`.
    pub fn zone_contains_from(&self, at: &Placement, observer: &Observer, radius: f64) -> bool {
        if !self.is_counted() || observer.id == self.id {
            return false;
        }
        if self.kind == ActorKind::PersonalObject && self.owner != Some(observer.id) {
            return false;
        }
        if self.kind.requires_same_space() && !at.same_space(&observer.placement) {
            return false;
        }
        at.distance_to(&observer.placement) <= radius
    }

    /// One more player sees this actor.
    pub fn visibility_enter(&mut self) {
        if let Some(counter) = self.visibility.as_mut() {
            counter.enter();
        }
    }

    /// One player fewer sees this actor.
    pub fn visibility_leave(&mut self) -> Result<(), StreamError> {
        if let Some(counter) = self.visibility.as_mut() {
            counter
                .leave()
                .map_err(|Underflow| StreamError::VisibilityUnderflow { actor: self.id })?;
        }
        Ok(())
    }

    /// Push a pending shown/hidden change to the actor.
    pub fn apply_visibility(&mut self) -> Result<Option<Transition>, StreamError> {
        let Some(counter) = self.visibility.as_mut() else {
            return Ok(None);
        };
        let Some(transition) = counter.settle() else {
            return Ok(None);
        };
        let actor = self
            .actor
            .upgrade()
            .ok_or(StreamError::ActorDropped { actor: self.id })?;
        match transition {
            Transition::Show => actor.show(),
            Transition::Hide => actor.hide(),
        }
        tracing::trace!(actor = %self.id, ?transition, "visibility changed");
        Ok(Some(transition))
    }

    /// Force the actor hidden, regardless of observers. Used on despawn.
    /// Returns whether it was shown.
    pub(crate) fn hide_now(&mut self) -> Result<bool, StreamError> {
        let Some(counter) = self.visibility.as_mut() else {
            return Ok(false);
        };
        if !counter.shown {
            return Ok(false);
        }
        counter.shown = false;
        let actor = self
            .actor
            .upgrade()
            .ok_or(StreamError::ActorDropped { actor: self.id })?;
        actor.hide();
        Ok(true)
    }
}
