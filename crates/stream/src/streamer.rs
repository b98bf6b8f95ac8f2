use std::collections::{BTreeMap, BTreeSet};
use std::rc::{Rc, Weak};
use std::time::Instant;

use glam::DVec3;
use worldstream_common::{ActorId, ActorKind, Placement};

use crate::actor::{Actor, ActorWrapper, Observer};
use crate::chunk::{Chunk, ChunkId, VisibilityChanges};
use crate::config::StreamerConfig;
use crate::error::{ConfigError, GridError, StreamError};
use crate::grid::SpatialGrid;
use crate::stats::{PassRecord, Phase, StreamStats};
use crate::tracker::PlacementTracker;

/// Hook called between the passes of a placement change.
pub type PassHook = Box<dyn FnMut(Phase, &Streamer)>;

/// Bookkeeping for one streamed actor.
struct Entry {
    actor: Weak<dyn Actor>,
    kind: ActorKind,
    chunk: ChunkId,
    tracker: PlacementTracker,
}

/// Decides which actors are visible to which players.
///
/// Every streamed actor lives in exactly one chunk: the grid cell containing
/// its streaming placement, or the overflow chunk when it is outside the grid.
/// Counted actors carry one credit per player that sees them; moving players
/// add their new credit before withdrawing the old one, so an actor seen from
/// both places never drops to zero in between.
pub struct Streamer {
    config: StreamerConfig,
    grid: SpatialGrid<Chunk>,
    overflow: Chunk,
    entries: BTreeMap<ActorId, Entry>,
    stats: StreamStats,
    last_pass: PassRecord,
    hook: Option<PassHook>,
}

impl Streamer {
    pub fn new(config: StreamerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            grid: SpatialGrid::new(config.grid)?,
            config,
            overflow: Chunk::new(ChunkId::Overflow),
            entries: BTreeMap::new(),
            stats: StreamStats::default(),
            last_pass: PassRecord::default(),
            hook: None,
        })
    }

    pub fn config(&self) -> &StreamerConfig {
        &self.config
    }

    pub fn grid(&self) -> &SpatialGrid<Chunk> {
        &self.grid
    }

    /// The catch-all chunk for actors outside the grid. Never pruned.
    pub fn overflow(&self) -> &Chunk {
        &self.overflow
    }

    pub fn stats(&self) -> &StreamStats {
        &self.stats
    }

    /// Chunks visited by the most recent join, leave or placement change.
    pub fn last_pass(&self) -> &PassRecord {
        &self.last_pass
    }

    /// Install a hook called after each pass of a placement change.
    pub fn set_pass_hook(&mut self, hook: impl FnMut(Phase, &Streamer) + 'static) {
        self.hook = Some(Box::new(hook));
    }

    pub fn clear_pass_hook(&mut self) {
        self.hook = None;
    }

    pub fn actor_count(&self) -> usize {
        self.entries.len()
    }

    pub fn contains(&self, actor: ActorId) -> bool {
        self.entries.contains_key(&actor)
    }

    pub fn chunk(&self, id: ChunkId) -> Option<&Chunk> {
        match id {
            ChunkId::Overflow => Some(&self.overflow),
            ChunkId::Cell(coord) => self.grid.get_at(coord),
        }
    }

    fn chunk_mut(&mut self, id: ChunkId) -> Option<&mut Chunk> {
        match id {
            ChunkId::Overflow => Some(&mut self.overflow),
            ChunkId::Cell(coord) => self.grid.get_at_mut(coord),
        }
    }

    /// Chunk holding the actors at `location`, if any exists there.
    pub fn chunk_at(&self, location: DVec3) -> Option<&Chunk> {
        self.chunk(self.home_of(location))
    }

    /// Chunk the actor is currently assigned to.
    pub fn chunk_of(&self, actor: ActorId) -> Option<ChunkId> {
        self.entries.get(&actor).map(|e| e.chunk)
    }

    pub fn wrapper(&self, actor: ActorId) -> Option<&ActorWrapper> {
        let chunk = self.chunk_of(actor)?;
        self.chunk(chunk)?.wrapper(actor)
    }

    fn wrapper_mut(&mut self, actor: ActorId) -> Result<&mut ActorWrapper, StreamError> {
        let chunk = self
            .chunk_of(actor)
            .ok_or(StreamError::UnknownActor { actor })?;
        self.chunk_mut(chunk)
            .and_then(|c| c.wrapper_mut(actor))
            .ok_or(StreamError::MissingActor { actor, chunk })
    }

    /// Number of players currently seeing a counted actor.
    pub fn visibility_count(&self, actor: ActorId) -> Option<u32> {
        self.wrapper(actor)?.visibility().map(|v| v.count())
    }

    pub fn is_shown(&self, actor: ActorId) -> Option<bool> {
        self.wrapper(actor)?.visibility().map(|v| v.is_shown())
    }

    /// The tracker for `actor`, synced with the streamer's own copy.
    ///
    /// The returned tracker judges nothing on its own: [`PlacementTracker::forward`]
    /// goes through [`placement_updated`](Self::placement_updated), so moves
    /// applied by `update` are never measured against a stale baseline.
    pub fn tracker_for(&self, actor: ActorId) -> Option<PlacementTracker> {
        self.entries.get(&actor).map(|e| e.tracker)
    }

    /// Chunk that a placement at `location` belongs to.
    fn home_of(&self, location: DVec3) -> ChunkId {
        self.grid
            .leaf_coord(location)
            .map(ChunkId::Cell)
            .unwrap_or(ChunkId::Overflow)
    }

    /// Every chunk that may hold an actor within `radius` of `location`.
    ///
    /// Cells are tested against the cube around `location` rather than the
    /// sphere, so the result can include cells slightly out of range. The
    /// overflow chunk is included whenever the cube reaches outside the grid.
    pub fn chunks_in_radius(&self, location: DVec3, radius: f64) -> Vec<ChunkId> {
        let mut out: Vec<ChunkId> = self
            .grid
            .leaves_in_cube(location, radius)
            .into_iter()
            .map(ChunkId::Cell)
            .collect();
        out.sort_unstable();
        if !self.grid.contains_cube(location, radius) {
            out.push(ChunkId::Overflow);
        }
        out
    }

    /// Actors whose streaming placement is within `radius` of `location`.
    pub fn actors_near(&self, location: DVec3, radius: f64) -> Vec<ActorId> {
        self.chunks_in_radius(location, radius)
            .into_iter()
            .filter_map(|id| self.chunk(id))
            .flat_map(|chunk| {
                ActorKind::ALL
                    .into_iter()
                    .flat_map(move |kind| chunk.actors(kind).iter())
            })
            .filter(|w| w.placement().location.distance(location) <= radius)
            .map(ActorWrapper::id)
            .collect()
    }

    /// Start streaming `actor` at its current placement.
    pub fn when_actor_joins_map(&mut self, actor: &Rc<dyn Actor>) -> Result<ChunkId, StreamError> {
        let id = actor.id();
        if self.entries.contains_key(&id) {
            return Err(StreamError::AlreadyJoined { actor: id });
        }
        let wrapper = ActorWrapper::new(actor);
        let kind = wrapper.kind();
        let placement = wrapper.placement();
        let chunk = self.place(wrapper)?;
        self.entries.insert(
            id,
            Entry {
                actor: Rc::downgrade(actor),
                kind,
                chunk,
                tracker: PlacementTracker::new(id, placement, self.config.significant_distance),
            },
        );
        self.stats.joins += 1;
        self.last_pass = PassRecord::default();
        tracing::debug!(actor = %id, ?kind, %chunk, "actor joined map");

        let radius = self.config.visibility_distance;
        let nearby = self.chunks_in_radius(placement.location, radius);
        if kind == ActorKind::Player {
            let observer = Observer { id, placement };
            self.credit(&nearby, &observer);
            self.apply(nearby)?;
        } else {
            let seen_by = self.observers_seeing(id, &nearby, &placement)?;
            let wrapper = self.wrapper_mut(id)?;
            for _ in 0..seen_by {
                wrapper.visibility_enter();
            }
            self.stats.counters_raised += seen_by;
            self.last_pass.credited = nearby;
            self.apply([chunk])?;
        }
        Ok(chunk)
    }

    /// Stop streaming `actor`: withdraw its credit, hide it and drop its wrapper.
    ///
    /// The actor is removed even when hiding fails because its owner already
    /// dropped it; that case is still reported as `ActorDropped`.
    pub fn when_actor_leaves_map(&mut self, actor: ActorId) -> Result<(), StreamError> {
        let chunk = self
            .chunk_of(actor)
            .ok_or(StreamError::UnknownActor { actor })?;
        let mut wrapper = self.release(actor, chunk)?;
        self.entries.remove(&actor);
        self.stats.leaves += 1;
        self.last_pass = PassRecord::default();
        tracing::debug!(actor = %actor, %chunk, "actor left map");

        if let Some(observer) = wrapper.as_observer() {
            let nearby = self.chunks_in_radius(observer.placement.location, self.config.visibility_distance);
            self.debit(&nearby, &observer)?;
            self.apply(nearby)?;
        } else if wrapper.hide_now()? {
            self.stats.hidden += 1;
        }
        Ok(())
    }

    /// Feed a fresh placement for `actor` through its tracker. Returns whether
    /// the change was significant and got applied.
    pub fn placement_updated(&mut self, actor: ActorId, current: Placement) -> Result<bool, StreamError> {
        let entry = self
            .entries
            .get_mut(&actor)
            .ok_or(StreamError::UnknownActor { actor })?;
        match entry.tracker.observe(current) {
            Some(change) => {
                self.when_placement_changes(actor, change.previous, change.current)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Recompute visibility after `actor` moved from `previous` to `current`.
    ///
    /// The credit withdrawn is the credit given at the actor's streaming
    /// placement; a `previous` that disagrees with it is logged and ignored.
    pub fn when_placement_changes(
        &mut self,
        actor: ActorId,
        previous: Placement,
        current: Placement,
    ) -> Result<(), StreamError> {
        let old_chunk = self
            .chunk_of(actor)
            .ok_or(StreamError::UnknownActor { actor })?;
        let streamed = self
            .wrapper(actor)
            .ok_or(StreamError::MissingActor {
                actor,
                chunk: old_chunk,
            })?
            .placement();
        if streamed != previous {
            tracing::warn!(
                actor = %actor,
                ?previous,
                ?streamed,
                "previous placement differs from streamed placement"
            );
        }
        let previous = streamed;
        let radius = self.config.visibility_distance;

        let new_chunk = self.rehome(actor, old_chunk, current)?;
        let kind = match self.entries.get_mut(&actor) {
            Some(entry) => {
                entry.chunk = new_chunk;
                entry.tracker.reset(current);
                entry.kind
            }
            None => return Err(StreamError::UnknownActor { actor }),
        };
        self.stats.placement_changes += 1;

        let chunks_prev = self.chunks_in_radius(previous.location, radius);
        let chunks_curr = self.chunks_in_radius(current.location, radius);
        self.last_pass = PassRecord::default();

        if kind == ActorKind::Player {
            self.credit(&chunks_curr, &Observer { id: actor, placement: current });
            self.notify(Phase::Credited);
            self.debit(&chunks_prev, &Observer { id: actor, placement: previous })?;
            self.notify(Phase::Debited);
        } else {
            let gained = self.observers_seeing(actor, &chunks_curr, &current)?;
            let lost = self.observers_seeing(actor, &chunks_prev, &previous)?;

            let wrapper = self.wrapper_mut(actor)?;
            for _ in 0..gained {
                wrapper.visibility_enter();
            }
            self.stats.counters_raised += gained;
            self.last_pass.credited = chunks_curr.clone();
            self.notify(Phase::Credited);

            let wrapper = self.wrapper_mut(actor)?;
            for _ in 0..lost {
                wrapper.visibility_leave()?;
            }
            self.stats.counters_lowered += lost;
            self.last_pass.debited = chunks_prev.clone();
            self.notify(Phase::Debited);
        }

        let touched: BTreeSet<ChunkId> = chunks_prev
            .into_iter()
            .chain(chunks_curr)
            .chain([new_chunk])
            .collect();
        self.apply(touched)?;
        self.notify(Phase::Applied);

        tracing::trace!(
            actor = %actor,
            credited = self.last_pass.credited.len(),
            debited = self.last_pass.debited.len(),
            applied = self.last_pass.applied.len(),
            "placement change applied"
        );
        Ok(())
    }

    /// Per-tick driver: read every actor's live placement and forward the
    /// significant changes. Players go first so objects moving in the same
    /// tick are counted against current observers.
    ///
    /// Actors dropped by their owner without leaving the map are skipped for
    /// the rest of the pass and reported as `ActorDropped` once it completes.
    /// They keep failing every tick until `when_actor_leaves_map` removes them.
    pub fn update(&mut self) -> Result<&StreamStats, StreamError> {
        let _span = tracing::info_span!("stream_update").entered();
        let frame_start = Instant::now();
        self.stats = StreamStats::default();

        let mut order: Vec<(bool, ActorId, Weak<dyn Actor>)> = self
            .entries
            .iter()
            .map(|(id, e)| (e.kind != ActorKind::Player, *id, e.actor.clone()))
            .collect();
        order.sort_by_key(|(object, id, _)| (*object, *id));

        let mut dropped = Vec::new();
        for (_, id, actor) in order {
            match actor.upgrade() {
                Some(actor) => {
                    self.placement_updated(id, actor.placement())?;
                }
                None => dropped.push(id),
            }
        }

        self.stats.streamed_actors = self.entries.len();
        self.stats.live_cells = self.grid.leaf_count();
        self.stats.frame_time = frame_start.elapsed();
        tracing::trace!(
            moves = self.stats.placement_changes,
            shown = self.stats.shown,
            hidden = self.stats.hidden,
            cells = self.stats.live_cells,
            "stream update complete"
        );
        if let Some(&actor) = dropped.first() {
            tracing::warn!(count = dropped.len(), first = %actor, "dropped actors still streamed");
            return Err(StreamError::ActorDropped { actor });
        }
        Ok(&self.stats)
    }

    /// Put `wrapper` in the chunk for its streaming placement.
    fn place(&mut self, wrapper: ActorWrapper) -> Result<ChunkId, StreamError> {
        let location = wrapper.placement().location;
        let chunk = match self
            .grid
            .require_with(location, |coord| Chunk::new(ChunkId::Cell(coord)))
        {
            Ok(chunk) => chunk,
            Err(GridError::OutOfBounds { .. }) => &mut self.overflow,
            Err(err) => return Err(err.into()),
        };
        let id = chunk.id();
        chunk.intercept(wrapper);
        Ok(id)
    }

    /// Take the wrapper for `actor` out of `chunk`, pruning the cell if that
    /// left it empty.
    fn release(&mut self, actor: ActorId, chunk: ChunkId) -> Result<ActorWrapper, StreamError> {
        let holder = self
            .chunk_mut(chunk)
            .ok_or(StreamError::MissingActor { actor, chunk })?;
        let wrapper = holder.release(actor)?;
        let vacated = holder.is_empty();
        if let (true, ChunkId::Cell(coord)) = (vacated, chunk) {
            self.grid.remove_at(coord);
            tracing::debug!(%chunk, "pruned empty chunk");
        }
        Ok(wrapper)
    }

    /// Update the streaming placement of `actor`, moving it between chunks if
    /// needed. Returns its chunk afterwards.
    fn rehome(&mut self, actor: ActorId, from: ChunkId, current: Placement) -> Result<ChunkId, StreamError> {
        if self.home_of(current.location) == from {
            self.wrapper_mut(actor)?.set_placement(current);
            return Ok(from);
        }
        let mut wrapper = self.release(actor, from)?;
        wrapper.set_placement(current);
        let to = self.place(wrapper)?;
        tracing::debug!(actor = %actor, %from, %to, "actor changed chunk");
        Ok(to)
    }

    /// How many players in `chunks` would see `actor` standing at `at`.
    fn observers_seeing(&self, actor: ActorId, chunks: &[ChunkId], at: &Placement) -> Result<usize, StreamError> {
        let wrapper = self.wrapper(actor).ok_or(StreamError::UnknownActor { actor })?;
        let radius = self.config.visibility_distance;
        Ok(chunks
            .iter()
            .filter_map(|id| self.chunk(*id))
            .flat_map(Chunk::observers)
            .filter(|o| wrapper.zone_contains_from(at, o, radius))
            .count())
    }

    fn credit(&mut self, chunks: &[ChunkId], observer: &Observer) {
        let radius = self.config.visibility_distance;
        let mut raised = 0;
        for &id in chunks {
            if let Some(chunk) = self.chunk_mut(id) {
                raised += chunk.add_score_around_player(observer, radius);
                self.last_pass.credited.push(id);
            }
        }
        self.stats.counters_raised += raised;
    }

    fn debit(&mut self, chunks: &[ChunkId], observer: &Observer) -> Result<(), StreamError> {
        let radius = self.config.visibility_distance;
        let mut lowered = 0;
        for &id in chunks {
            if let Some(chunk) = self.chunk_mut(id) {
                lowered += chunk.subtract_score_around_player(observer, radius)?;
                self.last_pass.debited.push(id);
            }
        }
        self.stats.counters_lowered += lowered;
        Ok(())
    }

    /// Commit visibility once per chunk in `chunks`.
    fn apply(&mut self, chunks: impl IntoIterator<Item = ChunkId>) -> Result<VisibilityChanges, StreamError> {
        let mut changes = VisibilityChanges::default();
        for id in chunks {
            if let Some(chunk) = self.chunk_mut(id) {
                changes.merge(chunk.apply_visibility()?);
                self.last_pass.applied.push(id);
                self.stats.chunks_applied += 1;
            }
        }
        self.stats.shown += changes.shown;
        self.stats.hidden += changes.hidden;
        Ok(changes)
    }

    fn notify(&mut self, phase: Phase) {
        if let Some(mut hook) = self.hook.take() {
            hook(phase, self);
            self.hook = Some(hook);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::tests::TestActor;
    use crate::actor::Transition;
    use proptest::prelude::*;
    use std::cell::{Cell, RefCell};

    type Log = Rc<RefCell<Vec<(ActorId, Transition)>>>;

    fn streamer() -> Streamer {
        Streamer::new(StreamerConfig::default()).unwrap()
    }

    fn join(s: &mut Streamer, kind: ActorKind, at: DVec3, log: &Log) -> Rc<TestActor> {
        let actor = TestActor::spawn(kind, at, log);
        let dyn_actor: Rc<dyn Actor> = actor.clone();
        s.when_actor_joins_map(&dyn_actor).unwrap();
        actor
    }

    fn x(v: f64) -> DVec3 {
        DVec3::new(v, 0.0, 0.0)
    }

    fn cell(s: &Streamer, at: DVec3) -> ChunkId {
        ChunkId::Cell(s.grid().leaf_coord(at).unwrap())
    }

    #[test]
    fn joining_player_reveals_nearby_objects() {
        let mut s = streamer();
        let log: Log = Rc::default();
        let vehicle = join(&mut s, ActorKind::Vehicle, x(100.0), &log);
        let far = join(&mut s, ActorKind::GlobalObject, x(1_000.0), &log);
        assert_eq!(s.is_shown(vehicle.id), Some(false));

        let player = join(&mut s, ActorKind::Player, DVec3::ZERO, &log);
        assert_eq!(s.visibility_count(vehicle.id), Some(1));
        assert_eq!(s.visibility_count(far.id), Some(0));
        assert_eq!(*log.borrow(), vec![(vehicle.id, Transition::Show)]);
        assert_eq!(s.visibility_count(player.id), None);
    }

    #[test]
    fn joining_object_counts_players_already_present() {
        let mut s = streamer();
        let log: Log = Rc::default();
        join(&mut s, ActorKind::Player, DVec3::ZERO, &log);
        join(&mut s, ActorKind::Player, x(50.0), &log);
        let vehicle = join(&mut s, ActorKind::Vehicle, x(20.0), &log);
        assert_eq!(s.visibility_count(vehicle.id), Some(2));
        assert_eq!(s.is_shown(vehicle.id), Some(true));
    }

    #[test]
    fn duplicate_join_and_unknown_leave_fail() {
        let mut s = streamer();
        let log: Log = Rc::default();
        let vehicle = join(&mut s, ActorKind::Vehicle, DVec3::ZERO, &log);
        let again: Rc<dyn Actor> = vehicle.clone();
        assert_eq!(
            s.when_actor_joins_map(&again),
            Err(StreamError::AlreadyJoined { actor: vehicle.id })
        );
        let stranger = ActorId::new();
        assert_eq!(
            s.when_actor_leaves_map(stranger),
            Err(StreamError::UnknownActor { actor: stranger })
        );
    }

    #[test]
    fn leaving_player_hides_what_it_saw() {
        let mut s = streamer();
        let log: Log = Rc::default();
        let vehicle = join(&mut s, ActorKind::Vehicle, x(100.0), &log);
        let player = join(&mut s, ActorKind::Player, DVec3::ZERO, &log);

        s.when_actor_leaves_map(player.id).unwrap();
        assert_eq!(s.visibility_count(vehicle.id), Some(0));
        assert_eq!(log.borrow().last(), Some(&(vehicle.id, Transition::Hide)));
        assert!(!s.contains(player.id));
    }

    #[test]
    fn leaving_shown_object_is_hidden_and_cell_pruned() {
        let mut s = streamer();
        let log: Log = Rc::default();
        join(&mut s, ActorKind::Player, DVec3::ZERO, &log);
        let vehicle = join(&mut s, ActorKind::Vehicle, x(1_000.0), &log);
        let object = join(&mut s, ActorKind::GlobalObject, x(10.0), &log);
        assert_eq!(s.grid().leaf_count(), 2);

        s.when_actor_leaves_map(object.id).unwrap();
        assert_eq!(log.borrow().last(), Some(&(object.id, Transition::Hide)));

        s.when_actor_leaves_map(vehicle.id).unwrap();
        assert!(s.chunk_at(x(1_000.0)).is_none());
        assert_eq!(s.grid().leaf_count(), 1);
    }

    #[test]
    fn moving_far_credits_destination_before_debiting_origin() {
        // Root half-extent 1_638_400, arity 4, depth 7: 100-unit leaf half-extent.
        let mut s = streamer();
        assert_eq!(s.grid().leaf_half_extent(), 100.0);
        let log: Log = Rc::default();
        let here = join(&mut s, ActorKind::Vehicle, DVec3::ZERO, &log);
        let there = join(&mut s, ActorKind::Vehicle, x(5_000.0), &log);
        let player = join(&mut s, ActorKind::Player, DVec3::ZERO, &log);
        assert_eq!(s.is_shown(here.id), Some(true));

        let phases = Rc::new(RefCell::new(Vec::new()));
        let seen = Rc::clone(&phases);
        let (a, b) = (here.id, there.id);
        s.set_pass_hook(move |phase, s| {
            let counts = (s.visibility_count(a).unwrap(), s.visibility_count(b).unwrap());
            seen.borrow_mut().push((phase, counts));
        });

        s.when_placement_changes(player.id, Placement::at(DVec3::ZERO), Placement::at(x(5_000.0)))
            .unwrap();

        assert_eq!(
            *phases.borrow(),
            vec![
                (Phase::Credited, (1, 1)),
                (Phase::Debited, (0, 1)),
                (Phase::Applied, (0, 1)),
            ]
        );
        let origin = cell(&s, DVec3::ZERO);
        let destination = cell(&s, x(5_000.0));
        let pass = s.last_pass();
        assert_eq!(pass.credited, vec![destination]);
        assert_eq!(pass.debited, vec![origin]);
        assert_eq!(pass.applied, vec![origin, destination]);
        assert_eq!(s.is_shown(here.id), Some(false));
        assert_eq!(s.is_shown(there.id), Some(true));
        assert_eq!(s.chunk_of(player.id), Some(destination));

        s.clear_pass_hook();
        s.when_placement_changes(player.id, Placement::at(x(5_000.0)), Placement::at(DVec3::ZERO))
            .unwrap();
        assert_eq!(phases.borrow().len(), 3);
        assert_eq!(s.is_shown(here.id), Some(true));
        assert_eq!(s.is_shown(there.id), Some(false));
    }

    #[test]
    fn slow_move_never_drops_shared_actors_to_zero() {
        let mut s = streamer();
        let log: Log = Rc::default();
        let ahead = join(&mut s, ActorKind::Vehicle, x(250.0), &log);
        let behind = join(&mut s, ActorKind::GlobalObject, x(-150.0), &log);
        let player = join(&mut s, ActorKind::Player, x(100.0), &log);
        let shown_before = log.borrow().len();
        assert_eq!(shown_before, 2);

        let low = Rc::new(Cell::new(u32::MAX));
        let watch = Rc::clone(&low);
        let (a, b) = (ahead.id, behind.id);
        s.set_pass_hook(move |_, s| {
            let least = s.visibility_count(a).unwrap().min(s.visibility_count(b).unwrap());
            watch.set(watch.get().min(least));
        });

        s.when_placement_changes(player.id, Placement::at(x(100.0)), Placement::at(x(150.0)))
            .unwrap();

        assert!(low.get() >= 1);
        let pass = s.last_pass();
        assert!(pass.credited.iter().any(|c| pass.debited.contains(c)));
        assert_eq!(log.borrow().len(), shown_before, "no show/hide flicker");
        assert_eq!(s.visibility_count(ahead.id), Some(1));
        assert_eq!(s.visibility_count(behind.id), Some(1));
    }

    #[test]
    fn moving_object_gains_and_loses_observers() {
        let mut s = streamer();
        let log: Log = Rc::default();
        join(&mut s, ActorKind::Player, DVec3::ZERO, &log);
        let vehicle = join(&mut s, ActorKind::Vehicle, x(2_000.0), &log);
        assert_eq!(s.visibility_count(vehicle.id), Some(0));

        vehicle.move_to(Placement::at(x(100.0)));
        assert!(s.placement_updated(vehicle.id, vehicle.placement()).unwrap());
        assert_eq!(s.visibility_count(vehicle.id), Some(1));
        assert_eq!(s.is_shown(vehicle.id), Some(true));

        // Jitter below the threshold is not forwarded.
        assert!(!s.placement_updated(vehicle.id, Placement::at(x(104.0))).unwrap());
        assert_eq!(s.wrapper(vehicle.id).unwrap().placement().location, x(100.0));

        s.placement_updated(vehicle.id, Placement::at(x(3_000.0))).unwrap();
        assert_eq!(s.visibility_count(vehicle.id), Some(0));
        assert_eq!(
            *log.borrow(),
            vec![(vehicle.id, Transition::Show), (vehicle.id, Transition::Hide)]
        );
    }

    #[test]
    fn world_change_hides_objects_from_other_worlds() {
        let mut s = streamer();
        let log: Log = Rc::default();
        let vehicle = join(&mut s, ActorKind::Vehicle, x(10.0), &log);
        let universal = join(&mut s, ActorKind::UniversalObject, x(20.0), &log);
        let player = join(&mut s, ActorKind::Player, DVec3::ZERO, &log);

        assert!(s.placement_updated(player.id, Placement::new(DVec3::ZERO, 5, 0)).unwrap());
        assert_eq!(s.visibility_count(vehicle.id), Some(0));
        assert_eq!(s.visibility_count(universal.id), Some(1));
    }

    #[test]
    fn personal_objects_follow_their_owner() {
        let mut s = streamer();
        let log: Log = Rc::default();
        let owner = join(&mut s, ActorKind::Player, DVec3::ZERO, &log);
        join(&mut s, ActorKind::Player, x(5.0), &log);
        let personal = Rc::new(TestActor {
            id: ActorId::new(),
            kind: ActorKind::PersonalObject,
            owner: Some(owner.id),
            placement: Cell::new(Placement::at(x(30.0))),
            log: Rc::clone(&log),
        });
        let dyn_personal: Rc<dyn Actor> = personal.clone();
        s.when_actor_joins_map(&dyn_personal).unwrap();
        assert_eq!(s.visibility_count(personal.id), Some(1));
    }

    #[test]
    fn outside_actors_use_the_overflow_chunk() {
        let mut s = streamer();
        let log: Log = Rc::default();
        let edge = 1_638_400.0;
        let outside = join(&mut s, ActorKind::Vehicle, x(edge + 100.0), &log);
        assert_eq!(s.chunk_of(outside.id), Some(ChunkId::Overflow));

        let player = join(&mut s, ActorKind::Player, x(edge - 50.0), &log);
        assert!(s
            .chunks_in_radius(x(edge - 50.0), 300.0)
            .contains(&ChunkId::Overflow));
        assert_eq!(s.is_shown(outside.id), Some(true));

        s.when_actor_leaves_map(player.id).unwrap();
        s.when_actor_leaves_map(outside.id).unwrap();
        // The overflow chunk outlives its last actor.
        assert!(s.chunk(ChunkId::Overflow).is_some());
        assert!(s.overflow().is_empty());
    }

    #[test]
    fn query_outside_grid_returns_overflow() {
        let s = streamer();
        assert_eq!(s.chunks_in_radius(x(5_000_000.0), 300.0), vec![ChunkId::Overflow]);
        assert!(s.chunks_in_radius(DVec3::ZERO, 300.0).is_empty());
    }

    #[test]
    fn rejoining_lands_in_the_same_chunk() {
        let mut s = streamer();
        let log: Log = Rc::default();
        let at = DVec3::new(123.0, 45.0, 6.0);
        let first = join(&mut s, ActorKind::Vehicle, at, &log);
        let original = s.chunk_of(first.id).unwrap();

        s.when_actor_leaves_map(first.id).unwrap();
        assert_eq!(s.grid().leaf_count(), 0);

        let dyn_first: Rc<dyn Actor> = first.clone();
        assert_eq!(s.when_actor_joins_map(&dyn_first).unwrap(), original);
        assert_eq!(s.wrapper(first.id).unwrap().chunk(), Some(original));
    }

    #[test]
    fn update_forwards_live_moves() {
        let mut s = streamer();
        let log: Log = Rc::default();
        let vehicle = join(&mut s, ActorKind::Vehicle, x(600.0), &log);
        let player = join(&mut s, ActorKind::Player, DVec3::ZERO, &log);
        assert_eq!(s.is_shown(vehicle.id), Some(false));

        player.move_to(Placement::at(x(400.0)));
        let stats = s.update().unwrap().clone();
        assert_eq!(stats.placement_changes, 1);
        assert_eq!(stats.shown, 1);
        assert_eq!(stats.streamed_actors, 2);
        assert_eq!(s.tracker_for(player.id).unwrap().last().location, x(400.0));

        let quiet = s.update().unwrap();
        assert_eq!(quiet.placement_changes, 0);
    }

    #[test]
    fn update_reports_dropped_actors() {
        let mut s = streamer();
        let log: Log = Rc::default();
        let vehicle = join(&mut s, ActorKind::Vehicle, DVec3::ZERO, &log);
        let id = vehicle.id;
        drop(vehicle);
        assert_eq!(s.update().unwrap_err(), StreamError::ActorDropped { actor: id });
    }

    #[test]
    fn external_tracker_forwards_through_streamer() {
        let mut s = streamer();
        let log: Log = Rc::default();
        let vehicle = join(&mut s, ActorKind::Vehicle, x(900.0), &log);
        join(&mut s, ActorKind::Player, DVec3::ZERO, &log);

        let mut tracker = s.tracker_for(vehicle.id).unwrap();
        assert!(!tracker.forward(&mut s, Placement::at(x(905.0))).unwrap());
        assert!(tracker.forward(&mut s, Placement::at(x(50.0))).unwrap());
        assert_eq!(s.is_shown(vehicle.id), Some(true));
    }

    #[test]
    fn tracker_stays_in_step_with_streamer_moves() {
        let mut s = streamer();
        let log: Log = Rc::default();
        let vehicle = join(&mut s, ActorKind::Vehicle, x(900.0), &log);
        join(&mut s, ActorKind::Player, DVec3::ZERO, &log);

        let mut tracker = s.tracker_for(vehicle.id).unwrap();
        assert!(s.placement_updated(vehicle.id, Placement::at(x(50.0))).unwrap());
        assert_eq!(s.is_shown(vehicle.id), Some(true));

        // Back near the old baseline, but far from where the streamer put it.
        assert!(tracker.forward(&mut s, Placement::at(x(895.0))).unwrap());
        assert_eq!(s.wrapper(vehicle.id).unwrap().placement().location, x(895.0));
        assert_eq!(s.is_shown(vehicle.id), Some(false));
        assert_eq!(tracker.last().location, x(895.0));

        // Moves applied by update are picked up as well.
        vehicle.move_to(Placement::at(x(60.0)));
        s.update().unwrap();
        assert!(!tracker.forward(&mut s, Placement::at(x(63.0))).unwrap());
        assert_eq!(tracker.last().location, x(60.0));
        assert_eq!(s.is_shown(vehicle.id), Some(true));
    }

    #[test]
    fn update_finishes_the_pass_before_reporting_dropped_actors() {
        let mut s = streamer();
        let log: Log = Rc::default();
        let gone = join(&mut s, ActorKind::GlobalObject, x(-2_000.0), &log);
        let vehicle = join(&mut s, ActorKind::Vehicle, x(600.0), &log);
        let player = join(&mut s, ActorKind::Player, DVec3::ZERO, &log);
        let gone_id = gone.id;
        drop(gone);

        player.move_to(Placement::at(x(400.0)));
        assert_eq!(s.update().unwrap_err(), StreamError::ActorDropped { actor: gone_id });
        assert_eq!(s.is_shown(vehicle.id), Some(true));
        assert_eq!(s.stats().placement_changes, 1);

        // Still streamed, so the next tick reports it again.
        assert!(s.update().is_err());
        s.when_actor_leaves_map(gone_id).unwrap();
        assert!(s.update().is_ok());
    }

    #[test]
    fn leaving_dropped_shown_actor_still_removes_it() {
        let mut s = streamer();
        let log: Log = Rc::default();
        join(&mut s, ActorKind::Player, DVec3::ZERO, &log);
        let vehicle = join(&mut s, ActorKind::Vehicle, x(10.0), &log);
        let id = vehicle.id;
        assert_eq!(s.is_shown(id), Some(true));
        drop(vehicle);

        assert_eq!(
            s.when_actor_leaves_map(id),
            Err(StreamError::ActorDropped { actor: id })
        );
        assert!(!s.contains(id));
        assert_eq!(s.actor_count(), 1);
    }

    #[test]
    fn actors_near_uses_exact_distance() {
        let mut s = streamer();
        let log: Log = Rc::default();
        let near = join(&mut s, ActorKind::Vehicle, x(250.0), &log);
        join(&mut s, ActorKind::Vehicle, DVec3::new(250.0, 250.0, 0.0), &log);
        assert_eq!(s.actors_near(DVec3::ZERO, 300.0), vec![near.id]);
    }

    proptest! {
        #[test]
        fn radius_query_covers_every_cell_in_range(
            points in proptest::collection::vec((-3000.0f64..3000.0, -3000.0f64..3000.0, -3000.0f64..3000.0), 1..40),
            query in (-3000.0f64..3000.0, -3000.0f64..3000.0, -3000.0f64..3000.0),
            radius in 50.0f64..600.0,
        ) {
            let mut s = streamer();
            let log: Log = Rc::default();
            let mut actors = Vec::new();
            for (px, py, pz) in points {
                actors.push(join(&mut s, ActorKind::Vehicle, DVec3::new(px, py, pz), &log));
            }
            let loc = DVec3::new(query.0, query.1, query.2);
            let found = s.chunks_in_radius(loc, radius);

            for (coord, _) in s.grid().iter() {
                let (lo, hi) = s.grid().leaf_bounds(coord);
                let nearest = loc.clamp(lo, hi);
                if nearest.distance(loc) <= radius {
                    prop_assert!(found.contains(&ChunkId::Cell(coord)));
                }
            }
            for actor in &actors {
                if actor.placement().location.distance(loc) <= radius {
                    prop_assert!(found.contains(&s.chunk_of(actor.id).unwrap()));
                }
            }
        }
    }
}
