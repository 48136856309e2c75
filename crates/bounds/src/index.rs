use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use viewspace_common::{Bounds, CellAttributes, CellDescription, CellId, Transform};

use crate::node::BoundsNode;

/// Errors from structural or lookup operations on the index.
///
/// Every variant is reported before any state is touched.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BoundsError {
    #[error("cell {0:?} not found")]
    UnknownCell(CellId),
    #[error("cell {0:?} is already indexed")]
    DuplicateCell(CellId),
    #[error("cell {child:?} already has parent {parent:?}")]
    MultipleParent { child: CellId, parent: CellId },
    #[error("attaching {child:?} under {parent:?} would create a cycle")]
    Cycle { parent: CellId, child: CellId },
    #[error("cell {child:?} is not a child of {parent:?}")]
    NotChild { parent: CellId, child: CellId },
    #[error("cell {0:?} still has children")]
    HasChildren(CellId),
}

/// Root cells affected by a mutation.
///
/// `moved` roots have new computed world bounds (or have just become roots);
/// `removed` ids stopped being roots and must leave every space.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RootDelta {
    pub moved: Vec<CellId>,
    pub removed: Vec<CellId>,
}

impl RootDelta {
    fn moved(root: CellId) -> Self {
        Self {
            moved: vec![root],
            removed: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.moved.is_empty() && self.removed.is_empty()
    }
}

/// Result of linking a subtree under a new parent.
#[derive(Debug, Clone)]
pub struct Attached {
    /// Root of the tree the subtree now belongs to.
    pub root: CellId,
    /// The attached subtree, pre-order, as seen after the attach.
    pub cells: Vec<CellDescription>,
    pub delta: RootDelta,
}

/// Result of unlinking a subtree from its tree, or destroying a cell.
#[derive(Debug, Clone)]
pub struct Detached {
    /// Root of the tree the cells belonged to before the change.
    pub former_root: CellId,
    /// Cells that left that tree, pre-order.
    pub cells: Vec<CellId>,
    pub delta: RootDelta,
}

#[derive(Debug, Default)]
struct IndexInner {
    nodes: HashMap<CellId, BoundsNode>,
}

/// Forest of bounds nodes with transform and bounds propagation.
///
/// The whole arena sits behind one read/write lock. Queries and root walks
/// share the read side; every mutation, structural or not, is exclusive.
#[derive(Debug, Default)]
pub struct BoundsIndex {
    inner: RwLock<IndexInner>,
}

impl BoundsIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, IndexInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, IndexInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.read().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().nodes.is_empty()
    }

    pub fn contains(&self, id: CellId) -> bool {
        self.read().nodes.contains_key(&id)
    }

    /// Snapshot copy of a node.
    pub fn node(&self, id: CellId) -> Option<BoundsNode> {
        self.read().nodes.get(&id).cloned()
    }

    /// Ids of all current root cells.
    pub fn roots(&self) -> Vec<CellId> {
        self.read()
            .nodes
            .values()
            .filter(|n| n.is_root())
            .map(BoundsNode::id)
            .collect()
    }

    pub fn root_of(&self, id: CellId) -> Result<CellId, BoundsError> {
        self.read().root_of(id)
    }

    pub fn world_bounds(&self, id: CellId) -> Result<Bounds, BoundsError> {
        Ok(self.read().get(id)?.computed_world_bounds())
    }

    pub fn describe(&self, id: CellId) -> Result<CellDescription, BoundsError> {
        Ok(self.read().get(id)?.describe())
    }

    /// Ids of `id` and all its descendants, parents before children.
    pub fn subtree(&self, id: CellId) -> Result<Vec<CellId>, BoundsError> {
        let inner = self.read();
        inner.get(id)?;
        let mut out = Vec::new();
        inner.collect_subtree(id, &mut out);
        Ok(out)
    }

    pub fn subtree_descriptions(&self, id: CellId) -> Result<Vec<CellDescription>, BoundsError> {
        let inner = self.read();
        inner.get(id)?;
        Ok(inner.describe_subtree(id))
    }

    /// Add a new cell as a root.
    pub fn insert(
        &self,
        id: CellId,
        attributes: CellAttributes,
        local_bounds: Bounds,
        transform: Transform,
    ) -> Result<RootDelta, BoundsError> {
        let mut inner = self.write();
        if inner.nodes.contains_key(&id) {
            tracing::warn!(?id, "rejecting duplicate insert");
            return Err(BoundsError::DuplicateCell(id));
        }
        inner
            .nodes
            .insert(id, BoundsNode::new(id, attributes, local_bounds, transform));
        tracing::debug!(?id, "cell inserted");
        Ok(RootDelta::moved(id))
    }

    /// Destroy a childless cell, unlinking it from its parent first.
    ///
    /// The former parent's bounds are not shrunk.
    pub fn remove(&self, id: CellId) -> Result<Detached, BoundsError> {
        let mut inner = self.write();
        let node = inner.get(id)?;
        if !node.children().is_empty() {
            tracing::warn!(?id, "rejecting removal of cell with children");
            return Err(BoundsError::HasChildren(id));
        }
        let parent = node.parent();
        let former_root = inner.root_of(id)?;
        if let Some(parent) = parent {
            inner.get_mut(parent)?.remove_child(id);
            inner.touch_ancestors(parent);
        }
        inner.nodes.remove(&id);
        tracing::debug!(?id, ?former_root, "cell removed");

        let delta = if parent.is_none() {
            RootDelta {
                moved: Vec::new(),
                removed: vec![id],
            }
        } else {
            RootDelta::default()
        };
        Ok(Detached {
            former_root,
            cells: vec![id],
            delta,
        })
    }

    /// Store a new object-to-parent transform and propagate it.
    ///
    /// The whole subtree under `id` gets fresh local-to-world transforms and
    /// tight bounds; ancestors only grow, and the climb stops at the first
    /// ancestor that already encloses its child.
    pub fn set_transform(&self, id: CellId, transform: Transform) -> Result<RootDelta, BoundsError> {
        let _span = tracing::debug_span!("set_transform", ?id).entered();
        let mut inner = self.write();
        let node = inner.get_mut(id)?;
        node.set_transform(transform);
        let parent = node.parent();
        let parent_to_world = match parent {
            Some(p) => Some(inner.get(p)?.local_to_world()),
            None => None,
        };
        inner.propagate(id, parent_to_world);
        inner.fix_ancestors(id);
        Ok(RootDelta::moved(inner.root_of(id)?))
    }

    /// Store new local bounds; children are untouched, ancestors may grow.
    pub fn set_local_bounds(&self, id: CellId, bounds: Bounds) -> Result<RootDelta, BoundsError> {
        let _span = tracing::debug_span!("set_local_bounds", ?id).entered();
        let mut inner = self.write();
        inner.get_mut(id)?.set_local_bounds(bounds);

        let node = inner.get(id)?;
        let own = node.cached_world_bounds();
        let children = node
            .children()
            .iter()
            .map(|child| Ok(inner.get(*child)?.computed_world_bounds()))
            .collect::<Result<Vec<_>, BoundsError>>()?;
        inner.get_mut(id)?.set_computed_world_bounds(cover(own, &children));
        inner.touch_ancestors(id);
        inner.fix_ancestors(id);
        Ok(RootDelta::moved(inner.root_of(id)?))
    }

    /// Link `child` (currently a root) under `parent`.
    ///
    /// The child's transform is reinterpreted relative to the new parent.
    pub fn attach(&self, parent: CellId, child: CellId) -> Result<Attached, BoundsError> {
        let _span = tracing::debug_span!("attach", ?parent, ?child).entered();
        let mut inner = self.write();
        inner.get(parent)?;
        if let Some(existing) = inner.get(child)?.parent() {
            tracing::warn!(?child, ?existing, "rejecting attach of parented cell");
            return Err(BoundsError::MultipleParent {
                child,
                parent: existing,
            });
        }
        if inner.is_ancestor_or_self(child, parent) {
            tracing::warn!(?parent, ?child, "rejecting attach that would form a cycle");
            return Err(BoundsError::Cycle { parent, child });
        }

        inner.get_mut(parent)?.add_child(child);
        inner.get_mut(child)?.set_parent(Some(parent));
        inner.touch_ancestors(parent);
        let parent_to_world = inner.get(parent)?.local_to_world();
        inner.propagate(child, Some(parent_to_world));
        inner.fix_ancestors(child);

        let root = inner.root_of(parent)?;
        Ok(Attached {
            root,
            cells: inner.describe_subtree(child),
            delta: RootDelta {
                moved: vec![root],
                removed: vec![child],
            },
        })
    }

    /// Unlink `child` from `parent`; the child becomes a root.
    ///
    /// The child's transform is reinterpreted as a world transform. The former
    /// parent and its ancestors keep their bounds until their next change or
    /// an explicit [`retighten`](Self::retighten).
    pub fn detach(&self, parent: CellId, child: CellId) -> Result<Detached, BoundsError> {
        let _span = tracing::debug_span!("detach", ?parent, ?child).entered();
        let mut inner = self.write();
        inner.get(parent)?;
        if inner.get(child)?.parent() != Some(parent) {
            tracing::warn!(?parent, ?child, "rejecting detach of non-child");
            return Err(BoundsError::NotChild { parent, child });
        }

        let former_root = inner.root_of(parent)?;
        let mut cells = Vec::new();
        inner.collect_subtree(child, &mut cells);

        inner.get_mut(parent)?.remove_child(child);
        inner.get_mut(child)?.set_parent(None);
        inner.touch_ancestors(parent);
        inner.propagate(child, None);

        Ok(Detached {
            former_root,
            cells,
            delta: RootDelta::moved(child),
        })
    }

    /// Recompute the subtree under `id` from scratch so its bounds are tight
    /// again after detaches or removals.
    pub fn retighten(&self, id: CellId) -> Result<RootDelta, BoundsError> {
        let _span = tracing::debug_span!("retighten", ?id).entered();
        let mut inner = self.write();
        let parent_to_world = match inner.get(id)?.parent() {
            Some(p) => Some(inner.get(p)?.local_to_world()),
            None => None,
        };
        inner.propagate(id, parent_to_world);
        inner.fix_ancestors(id);
        Ok(RootDelta::moved(inner.root_of(id)?))
    }

    /// All nodes under `id` (inclusive) whose computed world bounds intersect
    /// `volume`, parents before children. Subtrees whose bounds miss the
    /// volume are pruned.
    pub fn query(&self, id: CellId, volume: &Bounds) -> Result<Vec<CellDescription>, BoundsError> {
        let inner = self.read();
        inner.get(id)?;
        let mut out = Vec::new();
        inner.query(id, volume, &mut out);
        tracing::trace!(?id, hits = out.len(), "bounds query");
        Ok(out)
    }
}

/// Merge `own` with every child volume. A sphere merge can shift the center
/// enough to uncover a child merged earlier, so the result is checked again.
fn cover(own: Bounds, children: &[Bounds]) -> Bounds {
    let mut bounds = children.iter().fold(own, |acc, child| acc.merge(child));
    for child in children {
        if !bounds.encloses(child) {
            bounds = bounds.merge(child);
        }
    }
    bounds
}

impl IndexInner {
    fn get(&self, id: CellId) -> Result<&BoundsNode, BoundsError> {
        self.nodes.get(&id).ok_or(BoundsError::UnknownCell(id))
    }

    fn get_mut(&mut self, id: CellId) -> Result<&mut BoundsNode, BoundsError> {
        self.nodes.get_mut(&id).ok_or(BoundsError::UnknownCell(id))
    }

    fn root_of(&self, id: CellId) -> Result<CellId, BoundsError> {
        let mut current = id;
        while let Some(parent) = self.get(current)?.parent() {
            current = parent;
        }
        Ok(current)
    }

    /// True if `ancestor` is `id` or lies on the parent chain above it.
    fn is_ancestor_or_self(&self, ancestor: CellId, id: CellId) -> bool {
        let mut current = Some(id);
        while let Some(c) = current {
            if c == ancestor {
                return true;
            }
            current = self.nodes.get(&c).and_then(BoundsNode::parent);
        }
        false
    }

    fn collect_subtree(&self, id: CellId, out: &mut Vec<CellId>) {
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let Some(node) = self.nodes.get(&current) else {
                continue;
            };
            out.push(current);
            stack.extend(node.children().iter().rev().copied());
        }
    }

    fn describe_subtree(&self, id: CellId) -> Vec<CellDescription> {
        let mut ids = Vec::new();
        self.collect_subtree(id, &mut ids);
        ids.iter()
            .filter_map(|c| self.nodes.get(c))
            .map(BoundsNode::describe)
            .collect()
    }

    /// Recompute local-to-world and computed world bounds for the subtree
    /// under `id`. Returns the subtree's new computed bounds.
    fn propagate(&mut self, id: CellId, parent_to_world: Option<Transform>) -> Option<Bounds> {
        let node = self.nodes.get_mut(&id)?;
        let local_to_world = match parent_to_world {
            Some(p) => p.mul(&node.transform()),
            None => node.transform(),
        };
        node.set_local_to_world(local_to_world);
        let own = node.cached_world_bounds();
        let children = node.children().to_vec();

        let child_bounds: Vec<Bounds> = children
            .into_iter()
            .filter_map(|child| self.propagate(child, Some(local_to_world)))
            .collect();
        let bounds = cover(own, &child_bounds);
        self.nodes.get_mut(&id)?.set_computed_world_bounds(bounds);
        tracing::trace!(?id, ?bounds, "propagated");
        Some(bounds)
    }

    /// Bump the contents version of every strict ancestor of `id`.
    fn touch_ancestors(&mut self, id: CellId) {
        let mut current = self.nodes.get(&id).and_then(BoundsNode::parent);
        while let Some(ancestor) = current {
            let Some(node) = self.nodes.get_mut(&ancestor) else {
                return;
            };
            node.bump_contents_version();
            current = node.parent();
        }
    }

    /// Walk up from `id`, growing each ancestor until one already encloses
    /// the child below it.
    fn fix_ancestors(&mut self, id: CellId) {
        let mut current = id;
        loop {
            let Some(node) = self.nodes.get(&current) else {
                return;
            };
            let Some(parent_id) = node.parent() else {
                return;
            };
            let child_bounds = node.computed_world_bounds();
            let Some(parent) = self.nodes.get_mut(&parent_id) else {
                return;
            };
            let parent_bounds = parent.computed_world_bounds();
            if parent_bounds.encloses(&child_bounds) {
                tracing::trace!(?parent_id, "enclosure holds, stopping climb");
                return;
            }
            parent.grow_computed_world_bounds(parent_bounds.merge(&child_bounds));
            current = parent_id;
        }
    }

    fn query(&self, id: CellId, volume: &Bounds, out: &mut Vec<CellDescription>) {
        let Some(node) = self.nodes.get(&id) else {
            return;
        };
        if !volume.intersects(&node.computed_world_bounds()) {
            return;
        }
        out.push(node.describe());
        for child in node.children() {
            self.query(*child, volume, out);
        }
    }
}
