//! Bounds index: the authoritative spatial mirror of world objects.
//!
//! # Invariants
//! - Enclosure: a parent's computed world bounds enclose every child's,
//!   transitively to the root. Bounds may be stale-large, never stale-small.
//! - Single parent: a node has at most one parent; attach never forms a cycle.
//! - A rejected mutation leaves the index unchanged.

pub mod index;
pub mod node;

pub use index::{Attached, BoundsError, BoundsIndex, Detached, RootDelta};
pub use node::BoundsNode;

pub fn crate_info() -> &'static str {
    "viewspace-bounds v0.1.0"
}
