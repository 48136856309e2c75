use serde::{Deserialize, Serialize};
use viewspace_common::{Bounds, CellAttributes, CellDescription, CellId, Transform};

/// Mirror of one world object's spatial state.
///
/// Parent and children are stored as ids into the owning index's arena, so
/// a node never owns another node. Clones handed out by the index are
/// snapshots; mutating them does not affect the index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundsNode {
    id: CellId,
    attributes: CellAttributes,
    local_bounds: Bounds,
    transform: Transform,
    local_to_world: Transform,
    computed_world_bounds: Bounds,
    parent: Option<CellId>,
    children: Vec<CellId>,
    transform_version: u64,
    contents_version: u64,
}

impl BoundsNode {
    /// A fresh root node. World state is filled in by the index on insert.
    pub(crate) fn new(
        id: CellId,
        attributes: CellAttributes,
        local_bounds: Bounds,
        transform: Transform,
    ) -> Self {
        Self {
            id,
            attributes,
            local_bounds,
            transform,
            local_to_world: transform,
            computed_world_bounds: local_bounds.transformed(&transform),
            parent: None,
            children: Vec::new(),
            transform_version: 0,
            contents_version: 0,
        }
    }

    pub fn id(&self) -> CellId {
        self.id
    }

    pub fn attributes(&self) -> &CellAttributes {
        &self.attributes
    }

    pub fn local_bounds(&self) -> Bounds {
        self.local_bounds
    }

    pub fn transform(&self) -> Transform {
        self.transform
    }

    pub fn local_to_world(&self) -> Transform {
        self.local_to_world
    }

    /// Bounds enclosing this node and its whole subtree, in world space.
    pub fn computed_world_bounds(&self) -> Bounds {
        self.computed_world_bounds
    }

    /// This node's own local bounds mapped into world space, without children.
    pub fn cached_world_bounds(&self) -> Bounds {
        self.local_bounds.transformed(&self.local_to_world)
    }

    pub fn parent(&self) -> Option<CellId> {
        self.parent
    }

    pub fn children(&self) -> &[CellId] {
        &self.children
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn transform_version(&self) -> u64 {
        self.transform_version
    }

    /// Bumped when this node's local bounds or children change, or when a
    /// change anywhere below it reaches this node.
    pub fn contents_version(&self) -> u64 {
        self.contents_version
    }

    pub fn describe(&self) -> CellDescription {
        CellDescription {
            id: self.id,
            kind: self.attributes.kind.clone(),
            priority: self.attributes.priority,
            movable: self.attributes.movable,
            transform: self.local_to_world,
            metadata: self.attributes.metadata,
        }
    }

    pub(crate) fn set_transform(&mut self, transform: Transform) {
        self.transform = transform;
        self.transform_version += 1;
    }

    pub(crate) fn set_local_bounds(&mut self, bounds: Bounds) {
        self.local_bounds = bounds;
        self.contents_version += 1;
    }

    pub(crate) fn set_local_to_world(&mut self, transform: Transform) {
        self.local_to_world = transform;
    }

    pub(crate) fn set_computed_world_bounds(&mut self, bounds: Bounds) {
        self.computed_world_bounds = bounds;
    }

    /// Widen computed bounds because a descendant no longer fit.
    pub(crate) fn grow_computed_world_bounds(&mut self, bounds: Bounds) {
        self.computed_world_bounds = bounds;
        self.contents_version += 1;
    }

    pub(crate) fn bump_contents_version(&mut self) {
        self.contents_version += 1;
    }

    pub(crate) fn set_parent(&mut self, parent: Option<CellId>) {
        self.parent = parent;
    }

    pub(crate) fn add_child(&mut self, child: CellId) {
        self.children.push(child);
        self.contents_version += 1;
    }

    /// Returns false if `child` was not a child of this node.
    pub(crate) fn remove_child(&mut self, child: CellId) -> bool {
        let before = self.children.len();
        self.children.retain(|c| *c != child);
        let removed = self.children.len() != before;
        if removed {
            self.contents_version += 1;
        }
        removed
    }
}
