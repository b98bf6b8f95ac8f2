use glam::DVec3;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a streamed actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActorId(pub Uuid);

impl ActorId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Deterministic id, for replays and simulations.
    pub fn from_u128(value: u128) -> Self {
        Self(Uuid::from_u128(value))
    }
}

impl Default for ActorId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ActorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.8}", self.0.simple().to_string())
    }
}

/// The closed set of actors the streamer knows about.
///
/// Players observe; every other kind is observed and carries a visibility
/// counter. The kinds differ only in who may observe them:
/// vehicles and global objects need the same world and interior, universal
/// objects ignore both, personal objects are seen by their owner alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ActorKind {
    Player,
    Vehicle,
    GlobalObject,
    UniversalObject,
    PersonalObject,
}

impl ActorKind {
    pub const COUNT: usize = 5;

    pub const ALL: [ActorKind; Self::COUNT] = [
        ActorKind::Player,
        ActorKind::Vehicle,
        ActorKind::GlobalObject,
        ActorKind::UniversalObject,
        ActorKind::PersonalObject,
    ];

    /// Dense index, used to pick a per-kind collection.
    pub fn index(self) -> usize {
        match self {
            ActorKind::Player => 0,
            ActorKind::Vehicle => 1,
            ActorKind::GlobalObject => 2,
            ActorKind::UniversalObject => 3,
            ActorKind::PersonalObject => 4,
        }
    }

    /// Whether actors of this kind are shown or hidden by observer counting.
    pub fn is_counted(self) -> bool {
        !matches!(self, ActorKind::Player)
    }

    /// Whether world and interior must match for this kind to be observed.
    pub fn requires_same_space(self) -> bool {
        !matches!(self, ActorKind::UniversalObject)
    }
}

/// Where an actor is: location plus virtual world and interior.
///
/// Coordinates are kept in double precision so that world-scale positions
/// resolve to the right grid cell.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Placement {
    pub location: DVec3,
    pub world: i32,
    pub interior: i32,
}

impl Placement {
    pub fn new(location: DVec3, world: i32, interior: i32) -> Self {
        Self {
            location,
            world,
            interior,
        }
    }

    /// Placement in the default world and interior.
    pub fn at(location: DVec3) -> Self {
        Self::new(location, 0, 0)
    }

    /// Placement built from single-precision game coordinates.
    pub fn from_f32(location: glam::Vec3, world: i32, interior: i32) -> Self {
        Self::new(location.as_dvec3(), world, interior)
    }

    pub fn distance_to(&self, other: &Placement) -> f64 {
        self.location.distance(other.location)
    }

    /// Same virtual world and same interior.
    pub fn same_space(&self, other: &Placement) -> bool {
        self.world == other.world && self.interior == other.interior
    }
}

impl Default for Placement {
    fn default() -> Self {
        Self::at(DVec3::ZERO)
    }
}
