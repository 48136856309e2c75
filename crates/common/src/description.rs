use serde::{Deserialize, Serialize};

use crate::{CellId, Transform};

/// Class of world object a cell mirrors, e.g. `"avatar"` or `"whiteboard"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CellKind(pub String);

impl CellKind {
    pub fn new(kind: impl Into<String>) -> Self {
        Self(kind.into())
    }
}

impl Default for CellKind {
    fn default() -> Self {
        Self("cell".to_owned())
    }
}

/// Opaque reference to a cell's static setup data in the external store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetadataRef(pub u64);

/// Static attributes supplied when a cell is inserted into the index.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CellAttributes {
    pub kind: CellKind,
    pub priority: i16,
    pub movable: bool,
    pub metadata: Option<MetadataRef>,
}

/// Read-only view of an indexed cell.
///
/// Copied out of the index under its lock; holding one never pins or
/// mutates index state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellDescription {
    pub id: CellId,
    pub kind: CellKind,
    pub priority: i16,
    pub movable: bool,
    /// World transform at the time the description was taken.
    pub transform: Transform,
    pub metadata: Option<MetadataRef>,
}
