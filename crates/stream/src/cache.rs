use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use glam::Vec3;
use viewspace_bounds::BoundsIndex;
use viewspace_common::{Bounds, CellDescription, CellId, Identity, Transform, ViewerId};

use crate::config::SpatialConfig;
use crate::external::{TransactionScheduler, ViewUpdateListener};
use crate::health::{CacheHealth, HealthTracker};
use crate::listeners::CellListeners;
use crate::queue::{CellChange, ChangeQueue};
use crate::space::{SpaceKey, SpacePartition};

/// Lifecycle of a view cache. Disconnected is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Active,
    Disconnected,
}

/// Point-in-time counters for one viewer.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheStats {
    pub viewer: ViewerId,
    pub status: CacheStatus,
    pub spaces: usize,
    pub visible_roots: usize,
    pub pending_changes: usize,
    pub revalidations: u64,
}

#[derive(Debug)]
struct CacheState {
    status: CacheStatus,
    /// Roots obtained through each current space.
    spaces: HashMap<SpaceKey, HashSet<CellId>>,
    /// Number of current spaces each visible root was obtained through.
    visible_roots: HashMap<CellId, u32>,
    last_revalidation_point: Option<Vec3>,
    revalidations: u64,
}

type Listener = (CellId, Arc<dyn ViewUpdateListener>);

/// Per-viewer visibility state.
///
/// Tracks which spaces the viewer overlaps, reference-counts the root cells
/// reachable through them, and queues load/unload changes for the
/// dispatcher. A root enters when its count goes 0 to 1 and exits when it
/// goes 1 to 0, so a root reachable through several spaces is only
/// unloaded when the last of them is left.
///
/// View-update listeners registered against cells follow the same rule:
/// they are attached while the cell's root is visible and dropped when it
/// leaves view.
pub struct ViewCache {
    viewer: ViewerId,
    identity: Identity,
    proximity_radius: f32,
    hysteresis_radius: f32,
    index: Arc<BoundsIndex>,
    partition: Arc<SpacePartition>,
    scheduler: Arc<dyn TransactionScheduler>,
    cell_listeners: Arc<CellListeners>,
    queue: ChangeQueue,
    state: Mutex<CacheState>,
    listeners: Mutex<Vec<Listener>>,
    health: Mutex<HealthTracker>,
}

impl std::fmt::Debug for ViewCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewCache")
            .field("viewer", &self.viewer)
            .field("identity", &self.identity)
            .field("pending", &self.queue.len())
            .finish_non_exhaustive()
    }
}

impl ViewCache {
    pub fn new(
        viewer: ViewerId,
        identity: Identity,
        config: &SpatialConfig,
        index: Arc<BoundsIndex>,
        partition: Arc<SpacePartition>,
        scheduler: Arc<dyn TransactionScheduler>,
        cell_listeners: Arc<CellListeners>,
    ) -> Self {
        Self {
            viewer,
            identity,
            proximity_radius: config.proximity_radius,
            hysteresis_radius: config.hysteresis_radius(),
            index,
            partition,
            scheduler,
            cell_listeners,
            queue: ChangeQueue::new(),
            state: Mutex::new(CacheState {
                status: CacheStatus::Active,
                spaces: HashMap::new(),
                visible_roots: HashMap::new(),
                last_revalidation_point: None,
                revalidations: 0,
            }),
            listeners: Mutex::new(Vec::new()),
            health: Mutex::new(HealthTracker::new()),
        }
    }

    pub fn viewer(&self) -> ViewerId {
        self.viewer
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Pending load/unload changes, drained by the dispatcher.
    pub fn queue(&self) -> &ChangeQueue {
        &self.queue
    }

    /// Changes are queued while this lock is held, so per-cell order in the
    /// queue matches the order of state transitions.
    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_listeners(&self) -> MutexGuard<'_, Vec<Listener>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_health(&self) -> MutexGuard<'_, HealthTracker> {
        self.health.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self) -> CacheStatus {
        self.lock().status
    }

    /// Handle a viewer move.
    ///
    /// Spaces are recomputed only when the viewer has moved further than the
    /// hysteresis radius from the last revalidation point. Listeners are
    /// notified on every move. Returns true if the spaces were recomputed.
    pub fn on_viewer_moved(&self, transform: &Transform) -> bool {
        let revalidated = self.revalidate(transform.position);
        self.notify_listeners(transform);
        revalidated
    }

    /// Recompute spaces if the viewer left its hysteresis sphere. Listeners
    /// are not notified.
    pub(crate) fn revalidate(&self, position: Vec3) -> bool {
        let mut state = self.lock();
        if state.status == CacheStatus::Disconnected {
            return false;
        }
        if let Some(last) = state.last_revalidation_point {
            if last.distance_squared(position) <= self.hysteresis_radius * self.hysteresis_radius {
                return false;
            }
        }

        let _span = tracing::info_span!("revalidate", viewer = ?self.viewer).entered();
        let mut wanted: HashSet<SpaceKey> = self
            .partition
            .spaces_overlapping(&Bounds::sphere(position, self.proximity_radius))
            .into_iter()
            .collect();
        wanted.insert(SpaceKey::OVERFLOW);
        let left: Vec<SpaceKey> = state
            .spaces
            .keys()
            .filter(|key| !wanted.contains(*key))
            .copied()
            .collect();
        let entered: Vec<SpaceKey> = wanted
            .iter()
            .filter(|key| !state.spaces.contains_key(*key))
            .copied()
            .collect();

        // Enter before leaving so a root reachable through both an old and a
        // new space never drops to zero.
        let mut changes = Vec::new();
        for key in &entered {
            let roots = self
                .partition
                .register_viewer(*key, self.viewer)
                .unwrap_or_default();
            let obtained = state.spaces.entry(*key).or_default();
            obtained.extend(roots.iter().copied());
            for root in roots {
                self.acquire(&mut state, root, &mut changes);
            }
        }
        for key in &left {
            self.partition.unregister_viewer(*key, self.viewer);
            if let Some(roots) = state.spaces.remove(key) {
                for root in roots {
                    self.release(&mut state, root, &mut changes);
                }
            }
        }

        state.last_revalidation_point = Some(position);
        state.revalidations += 1;
        tracing::debug!(
            entered = entered.len(),
            left = left.len(),
            spaces = state.spaces.len(),
            visible = state.visible_roots.len(),
            "spaces revalidated"
        );
        self.queue.extend(changes);
        true
    }

    fn acquire(&self, state: &mut CacheState, root: CellId, changes: &mut Vec<CellChange>) {
        let count = state.visible_roots.entry(root).or_insert(0);
        *count += 1;
        if *count == 1 {
            match self.index.subtree_descriptions(root) {
                Ok(cells) => {
                    let ids: Vec<CellId> = cells.iter().map(|c| c.id).collect();
                    self.attach_listeners(self.cell_listeners.view_listeners(&ids));
                    changes.extend(cells.into_iter().map(CellChange::Load));
                }
                Err(err) => tracing::debug!(?root, %err, "entered root no longer indexed"),
            }
        }
    }

    fn release(&self, state: &mut CacheState, root: CellId, changes: &mut Vec<CellChange>) {
        let Some(count) = state.visible_roots.get_mut(&root) else {
            return;
        };
        *count -= 1;
        if *count > 0 {
            return;
        }
        state.visible_roots.remove(&root);
        let cells = self.index.subtree(root).unwrap_or_else(|_| vec![root]);
        self.detach_listeners(&cells);
        changes.extend(cells.into_iter().map(CellChange::Unload));
    }

    fn attach_listeners(&self, routed: Vec<Listener>) {
        if routed.is_empty() {
            return;
        }
        let mut listeners = self.lock_listeners();
        for (cell, listener) in routed {
            if !listeners
                .iter()
                .any(|(c, l)| *c == cell && Arc::ptr_eq(l, &listener))
            {
                listeners.push((cell, listener));
            }
        }
    }

    fn detach_listeners(&self, cells: &[CellId]) {
        let cells: HashSet<&CellId> = cells.iter().collect();
        self.lock_listeners().retain(|(c, _)| !cells.contains(c));
    }

    /// A root was registered in `space` after this viewer joined it.
    pub fn root_added(&self, space: SpaceKey, root: CellId) {
        let mut state = self.lock();
        let Some(obtained) = state.spaces.get_mut(&space) else {
            return;
        };
        if !obtained.insert(root) {
            return;
        }
        let mut changes = Vec::new();
        self.acquire(&mut state, root, &mut changes);
        self.queue.extend(changes);
    }

    /// A root left `space` while this viewer was in it.
    pub fn root_removed(&self, space: SpaceKey, root: CellId) {
        let mut state = self.lock();
        let Some(obtained) = state.spaces.get_mut(&space) else {
            return;
        };
        if !obtained.remove(&root) {
            return;
        }
        let mut changes = Vec::new();
        self.release(&mut state, root, &mut changes);
        self.queue.extend(changes);
    }

    /// Cells joined the subtree of `root`.
    pub fn cells_added(&self, root: CellId, cells: &[CellDescription]) {
        let state = self.lock();
        if !state.visible_roots.contains_key(&root) {
            return;
        }
        let ids: Vec<CellId> = cells.iter().map(|c| c.id).collect();
        self.attach_listeners(self.cell_listeners.view_listeners(&ids));
        self.queue
            .extend(cells.iter().cloned().map(CellChange::Load));
    }

    /// Cells left the subtree of `root`.
    pub fn cells_removed(&self, root: CellId, cells: &[CellId]) {
        let state = self.lock();
        if !state.visible_roots.contains_key(&root) {
            return;
        }
        self.detach_listeners(cells);
        self.queue
            .extend(cells.iter().copied().map(CellChange::Unload));
    }

    pub fn is_visible(&self, root: CellId) -> bool {
        self.lock().visible_roots.contains_key(&root)
    }

    /// Visible roots and the number of current spaces each was obtained through.
    pub fn visible_roots(&self) -> HashMap<CellId, u32> {
        self.lock().visible_roots.clone()
    }

    /// Grid spaces the viewer is registered in, sorted. The overflow space
    /// is not listed.
    pub fn current_spaces(&self) -> Vec<SpaceKey> {
        let mut keys: Vec<SpaceKey> = self
            .lock()
            .spaces
            .keys()
            .filter(|key| !key.is_overflow())
            .copied()
            .collect();
        keys.sort();
        keys
    }

    pub fn last_revalidation_point(&self) -> Option<Vec3> {
        self.lock().last_revalidation_point
    }

    /// Attach a listener to this cache only. Like a routed listener, it is
    /// dropped when `cell` leaves view through a visible root.
    pub fn add_listener(&self, cell: CellId, listener: Arc<dyn ViewUpdateListener>) {
        let _state = self.lock();
        self.attach_listeners(vec![(cell, listener)]);
    }

    /// Attach a routed listener if `root` is visible right now. Returns true
    /// if it was attached.
    pub(crate) fn adopt_listener(
        &self,
        root: CellId,
        cell: CellId,
        listener: Arc<dyn ViewUpdateListener>,
    ) -> bool {
        let state = self.lock();
        if !state.visible_roots.contains_key(&root) {
            return false;
        }
        self.attach_listeners(vec![(cell, listener)]);
        true
    }

    /// Remove a listener registered against `cell`. Listeners are matched by
    /// identity, not by value.
    pub fn remove_listener(&self, cell: CellId, listener: &Arc<dyn ViewUpdateListener>) -> bool {
        let _state = self.lock();
        let mut listeners = self.lock_listeners();
        let before = listeners.len();
        listeners.retain(|(c, l)| !(*c == cell && Arc::ptr_eq(l, listener)));
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.lock_listeners().len()
    }

    pub(crate) fn notify_listeners(&self, transform: &Transform) {
        let listeners = self.lock_listeners().clone();
        for (cell, listener) in listeners {
            let viewer = self.viewer;
            let transform = *transform;
            let result = self.scheduler.schedule_transaction(
                &self.identity,
                Box::new(move || {
                    listener.view_transform_changed(cell, viewer, &transform);
                    Ok(())
                }),
            );
            if let Err(err) = result {
                tracing::warn!(viewer = ?self.viewer, ?cell, %err, "view update notification failed");
            }
        }
    }

    /// Tear down: stop accepting changes, leave every space, forget all state.
    /// Pending changes are discarded, not flushed.
    pub fn disconnect(&self) {
        self.queue.close();
        let mut state = self.lock();
        if state.status == CacheStatus::Disconnected {
            return;
        }
        for key in state.spaces.keys() {
            self.partition.unregister_viewer(*key, self.viewer);
        }
        state.spaces.clear();
        state.visible_roots.clear();
        state.last_revalidation_point = None;
        state.status = CacheStatus::Disconnected;
        drop(state);
        self.lock_listeners().clear();
        tracing::debug!(viewer = ?self.viewer, "view cache disconnected");
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.lock();
        CacheStats {
            viewer: self.viewer,
            status: state.status,
            spaces: state.spaces.keys().filter(|key| !key.is_overflow()).count(),
            visible_roots: state.visible_roots.len(),
            pending_changes: self.queue.len(),
            revalidations: state.revalidations,
        }
    }

    pub fn health(&self) -> CacheHealth {
        self.lock_health().snapshot()
    }

    pub(crate) fn record_dispatch_success(&self, changes: usize, latency: Duration) {
        self.lock_health().record_success(changes, latency);
    }

    pub(crate) fn record_dispatch_failure(&self) {
        self.lock_health().record_failure();
    }
}
