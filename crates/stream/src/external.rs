//! Seams to the transactional object store and the per-viewer cache manager
//! that streams cells to clients.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use viewspace_common::{CellDescription, CellId, Identity, Transform, ViewerId};

/// Failure of a scheduled transaction. All variants are transient: the work
/// had no effect and may be submitted again.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransactionError {
    #[error("transaction timed out")]
    Timeout,
    #[error("transaction conflicted with a concurrent writer")]
    Conflict,
    #[error("transaction aborted: {0}")]
    Aborted(String),
}

/// Work run inside one transaction.
pub type Task = Box<dyn FnOnce() -> Result<(), TransactionError> + Send>;

/// Runs work with all-or-nothing semantics under an identity.
pub trait TransactionScheduler: Send + Sync {
    /// Returns once the task has committed or aborted.
    fn schedule_transaction(&self, identity: &Identity, task: Task) -> Result<(), TransactionError>;
}

/// Runs each task inline on the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImmediateScheduler;

impl TransactionScheduler for ImmediateScheduler {
    fn schedule_transaction(&self, identity: &Identity, task: Task) -> Result<(), TransactionError> {
        tracing::trace!(identity = %identity.0, "running transaction inline");
        task()
    }
}

/// Receiver of visibility changes for each viewer. Both entry points are
/// called from inside a scheduled transaction and must be idempotent.
pub trait CellCacheManager: Send + Sync {
    fn notify_load(&self, viewer: ViewerId, cells: &[CellDescription]) -> Result<(), TransactionError>;
    fn notify_unload(&self, viewer: ViewerId, cells: &[CellId]) -> Result<(), TransactionError>;
}

/// Cache manager that only remembers what each viewer has loaded.
#[derive(Debug, Default)]
pub struct InMemoryCacheManager {
    loaded: Mutex<HashMap<ViewerId, HashMap<CellId, CellDescription>>>,
}

impl InMemoryCacheManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ViewerId, HashMap<CellId, CellDescription>>> {
        self.loaded.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn loaded_cells(&self, viewer: ViewerId) -> HashSet<CellId> {
        self.lock()
            .get(&viewer)
            .map(|cells| cells.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn is_loaded(&self, viewer: ViewerId, cell: CellId) -> bool {
        self.lock()
            .get(&viewer)
            .is_some_and(|cells| cells.contains_key(&cell))
    }

    pub fn loaded_count(&self, viewer: ViewerId) -> usize {
        self.lock().get(&viewer).map_or(0, HashMap::len)
    }
}

impl CellCacheManager for InMemoryCacheManager {
    fn notify_load(&self, viewer: ViewerId, cells: &[CellDescription]) -> Result<(), TransactionError> {
        let mut loaded = self.lock();
        let entry = loaded.entry(viewer).or_default();
        for cell in cells {
            entry.insert(cell.id, cell.clone());
        }
        tracing::debug!(?viewer, count = cells.len(), "cells loaded");
        Ok(())
    }

    fn notify_unload(&self, viewer: ViewerId, cells: &[CellId]) -> Result<(), TransactionError> {
        let mut loaded = self.lock();
        if let Some(entry) = loaded.get_mut(&viewer) {
            for id in cells {
                entry.remove(id);
            }
        }
        tracing::debug!(?viewer, count = cells.len(), "cells unloaded");
        Ok(())
    }
}

/// Listener for the world transform of viewers near a cell.
pub trait ViewUpdateListener: Send + Sync {
    /// `cell` is the id the listener registered against.
    fn view_transform_changed(&self, cell: CellId, viewer: ViewerId, transform: &Transform);
}

/// Listener for one cell's own movement. Fired for the cell and for every
/// descendant carried along with it.
pub trait TransformChangeListener: Send + Sync {
    fn transform_changed(&self, cell: CellId, local: &Transform, world: &Transform);
}
