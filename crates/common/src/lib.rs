//! Shared value types: actor identity, actor kinds and placements.
//!
//! # Invariants
//! - `Placement` is an immutable value; a fresh one is read on every query.
//! - `ActorKind` is a closed set. Adding a kind means touching every `match`.

mod types;

pub use types::{ActorId, ActorKind, Placement};
