//! Shared types: cell and viewer ids, transforms, bounding volumes and the
//! read-only cell description handed to code outside the index.

mod bounds;
mod description;
mod types;

pub use bounds::{Aabb, Bounds};
pub use description::{CellAttributes, CellDescription, CellKind, MetadataRef};
pub use types::{CellId, Identity, Transform, ViewerId};
