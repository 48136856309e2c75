use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};

use viewspace_common::CellId;

use crate::external::{TransformChangeListener, ViewUpdateListener};

type Registry<L> = RwLock<HashMap<CellId, Vec<Arc<L>>>>;

/// Listeners registered against cells.
///
/// View-update listeners are copied into every view cache that can see the
/// cell's root, and follow the root in and out of view. Transform listeners
/// are fired directly when the cell moves.
#[derive(Default)]
pub struct CellListeners {
    view: Registry<dyn ViewUpdateListener>,
    transform: Registry<dyn TransformChangeListener>,
}

impl std::fmt::Debug for CellListeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CellListeners")
            .field("view_cells", &read(&self.view).len())
            .field("transform_cells", &read(&self.transform).len())
            .finish()
    }
}

fn read<L: ?Sized>(map: &Registry<L>) -> RwLockReadGuard<'_, HashMap<CellId, Vec<Arc<L>>>> {
    map.read().unwrap_or_else(PoisonError::into_inner)
}

fn add<L: ?Sized>(map: &Registry<L>, cell: CellId, listener: Arc<L>) -> bool {
    let mut map = map.write().unwrap_or_else(PoisonError::into_inner);
    let entry = map.entry(cell).or_default();
    if entry.iter().any(|l| Arc::ptr_eq(l, &listener)) {
        return false;
    }
    entry.push(listener);
    true
}

fn remove<L: ?Sized>(map: &Registry<L>, cell: CellId, listener: &Arc<L>) -> bool {
    let mut map = map.write().unwrap_or_else(PoisonError::into_inner);
    let Some(entry) = map.get_mut(&cell) else {
        return false;
    };
    let before = entry.len();
    entry.retain(|l| !Arc::ptr_eq(l, listener));
    let removed = entry.len() != before;
    if entry.is_empty() {
        map.remove(&cell);
    }
    removed
}

fn collect<L: ?Sized>(map: &Registry<L>, cells: &[CellId]) -> Vec<(CellId, Arc<L>)> {
    let map = read(map);
    if map.is_empty() {
        return Vec::new();
    }
    cells
        .iter()
        .filter_map(|cell| map.get(cell).map(|ls| (*cell, ls)))
        .flat_map(|(cell, ls)| ls.iter().map(move |l| (cell, Arc::clone(l))))
        .collect()
}

impl CellListeners {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the listener was already registered for `cell`.
    pub fn add_view_listener(&self, cell: CellId, listener: Arc<dyn ViewUpdateListener>) -> bool {
        add(&self.view, cell, listener)
    }

    pub fn remove_view_listener(&self, cell: CellId, listener: &Arc<dyn ViewUpdateListener>) -> bool {
        remove(&self.view, cell, listener)
    }

    /// View-update listeners of any of `cells`, paired with their cell.
    pub fn view_listeners(&self, cells: &[CellId]) -> Vec<(CellId, Arc<dyn ViewUpdateListener>)> {
        collect(&self.view, cells)
    }

    pub fn add_transform_listener(&self, cell: CellId, listener: Arc<dyn TransformChangeListener>) -> bool {
        add(&self.transform, cell, listener)
    }

    pub fn remove_transform_listener(
        &self,
        cell: CellId,
        listener: &Arc<dyn TransformChangeListener>,
    ) -> bool {
        remove(&self.transform, cell, listener)
    }

    pub fn has_transform_listeners(&self) -> bool {
        !read(&self.transform).is_empty()
    }

    pub fn transform_listeners(&self, cells: &[CellId]) -> Vec<(CellId, Arc<dyn TransformChangeListener>)> {
        collect(&self.transform, cells)
    }

    /// Drop every listener of a destroyed cell.
    pub fn forget(&self, cell: CellId) {
        self.view
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&cell);
        self.transform
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&cell);
    }
}
