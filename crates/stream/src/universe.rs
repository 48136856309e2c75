use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use viewspace_bounds::{BoundsError, BoundsIndex, RootDelta};
use viewspace_common::{
    Bounds, CellAttributes, CellDescription, CellId, Identity, Transform, ViewerId,
};

use crate::cache::{CacheStats, ViewCache};
use crate::config::{ConfigError, SpatialConfig};
use crate::dispatch::{DispatchConfig, DispatcherHandle, UpdateDispatcher};
use crate::external::{
    CellCacheManager, TransactionScheduler, TransformChangeListener, ViewUpdateListener,
};
use crate::health::CacheHealth;
use crate::listeners::CellListeners;
use crate::space::{SpaceKey, SpacePartition};

/// Errors from [`Universe`] operations.
#[derive(Debug, thiserror::Error)]
pub enum UniverseError {
    #[error(transparent)]
    Bounds(#[from] BoundsError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("viewer {0:?} is not logged in")]
    UnknownViewer(ViewerId),
    #[error("viewer {0:?} is already logged in")]
    ViewerExists(ViewerId),
    #[error("failed to start dispatcher: {0}")]
    Dispatcher(#[from] std::io::Error),
}

struct ViewerEntry {
    cache: Arc<ViewCache>,
    dispatcher: DispatcherHandle,
}

/// One independent world: the bounds index, the space partition, and every
/// logged-in viewer with its dispatch loop.
///
/// Index mutations go through here so root membership in spaces and viewer
/// caches follow them. Membership is resynced from the index's current
/// bounds under a single lock, so concurrent movers of the same root cannot
/// leave it registered in stale spaces. Structural changes (attach, detach,
/// remove) and viewer revalidation run entirely under that lock, so the
/// events they produce reach each cache in the order the tree changed.
///
/// Lock order: root-space map, then the index write lock or the viewer map,
/// then a cache. The index write lock is never held across the others.
pub struct Universe {
    config: SpatialConfig,
    identity: Identity,
    index: Arc<BoundsIndex>,
    partition: Arc<SpacePartition>,
    scheduler: Arc<dyn TransactionScheduler>,
    manager: Arc<dyn CellCacheManager>,
    cell_listeners: Arc<CellListeners>,
    viewers: RwLock<HashMap<ViewerId, ViewerEntry>>,
    root_spaces: Mutex<HashMap<CellId, Vec<SpaceKey>>>,
}

impl Universe {
    pub fn new(
        config: SpatialConfig,
        scheduler: Arc<dyn TransactionScheduler>,
        manager: Arc<dyn CellCacheManager>,
    ) -> Result<Self, UniverseError> {
        config.validate()?;
        tracing::info!(
            space_size = config.space_size,
            proximity = config.proximity_radius,
            hysteresis = config.hysteresis_radius(),
            "universe created"
        );
        Ok(Self {
            partition: Arc::new(SpacePartition::new(config.space_size)),
            index: Arc::new(BoundsIndex::new()),
            config,
            identity: Identity::new("viewspace"),
            scheduler,
            manager,
            cell_listeners: Arc::new(CellListeners::new()),
            viewers: RwLock::new(HashMap::new()),
            root_spaces: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &SpatialConfig {
        &self.config
    }

    pub fn index(&self) -> &BoundsIndex {
        &self.index
    }

    pub fn partition(&self) -> &SpacePartition {
        &self.partition
    }

    /// Spaces a root cell is currently registered in.
    pub fn root_spaces(&self, root: CellId) -> Vec<SpaceKey> {
        self.lock_roots().get(&root).cloned().unwrap_or_default()
    }

    fn lock_roots(&self) -> MutexGuard<'_, HashMap<CellId, Vec<SpaceKey>>> {
        self.root_spaces.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cache(&self, viewer: ViewerId) -> Result<Arc<ViewCache>, UniverseError> {
        self.viewers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&viewer)
            .map(|entry| Arc::clone(&entry.cache))
            .ok_or(UniverseError::UnknownViewer(viewer))
    }

    fn all_caches(&self) -> Vec<Arc<ViewCache>> {
        self.viewers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|entry| Arc::clone(&entry.cache))
            .collect()
    }

    fn caches_of(&self, viewers: impl IntoIterator<Item = ViewerId>) -> Vec<Arc<ViewCache>> {
        let map = self.viewers.read().unwrap_or_else(PoisonError::into_inner);
        viewers
            .into_iter()
            .filter_map(|v| map.get(&v).map(|entry| Arc::clone(&entry.cache)))
            .collect()
    }

    /// Viewers registered in any space the root is in.
    fn viewers_of_root(&self, roots: &HashMap<CellId, Vec<SpaceKey>>, root: CellId) -> Vec<Arc<ViewCache>> {
        let mut viewers = HashSet::new();
        for key in roots.get(&root).into_iter().flatten() {
            viewers.extend(self.partition.viewers(*key));
        }
        self.caches_of(viewers)
    }

    fn unregister_root(&self, key: SpaceKey, root: CellId) {
        if let Some(viewers) = self.partition.unregister_root(key, root) {
            for cache in self.caches_of(viewers) {
                cache.root_removed(key, root);
            }
        }
    }

    fn register_root(&self, key: SpaceKey, root: CellId) {
        if let Some(viewers) = self.partition.register_root(key, root) {
            for cache in self.caches_of(viewers) {
                cache.root_added(key, root);
            }
        }
    }

    /// Bring space membership of the affected roots in line with the index.
    fn apply_delta(&self, roots: &mut HashMap<CellId, Vec<SpaceKey>>, delta: &RootDelta) {
        for id in &delta.removed {
            for key in roots.remove(id).unwrap_or_default() {
                self.unregister_root(key, *id);
            }
        }
        for id in &delta.moved {
            let wanted = match self.index.node(*id) {
                Some(node) if node.is_root() => self.placement(*id, &node.computed_world_bounds()),
                _ => Vec::new(),
            };
            let current = roots.remove(id).unwrap_or_default();
            for key in current.iter().filter(|k| !wanted.contains(*k)) {
                self.unregister_root(*key, *id);
            }
            for key in wanted.iter().filter(|k| !current.contains(*k)) {
                self.register_root(*key, *id);
            }
            if !wanted.is_empty() {
                tracing::trace!(root = ?id, spaces = wanted.len(), "root placed");
                roots.insert(*id, wanted);
            }
        }
    }

    /// Spaces a root with these bounds belongs in.
    fn placement(&self, root: CellId, bounds: &Bounds) -> Vec<SpaceKey> {
        let span = self.partition.span(bounds);
        if span > self.config.max_root_spaces {
            tracing::warn!(
                ?root,
                spaces = span,
                cap = self.config.max_root_spaces,
                "root too large for the grid, placing in overflow space"
            );
            return vec![SpaceKey::OVERFLOW];
        }
        self.partition.spaces_overlapping(bounds)
    }

    /// Deliver the new transforms of `id` and its descendants to their
    /// transform listeners, one transaction per listener.
    fn notify_transform_listeners(&self, id: CellId) {
        if !self.cell_listeners.has_transform_listeners() {
            return;
        }
        let Ok(cells) = self.index.subtree(id) else {
            return;
        };
        for (cell, listener) in self.cell_listeners.transform_listeners(&cells) {
            let Some(node) = self.index.node(cell) else {
                continue;
            };
            let (local, world) = (node.transform(), node.local_to_world());
            let result = self.scheduler.schedule_transaction(
                &self.identity,
                Box::new(move || {
                    listener.transform_changed(cell, &local, &world);
                    Ok(())
                }),
            );
            if let Err(err) = result {
                tracing::warn!(?cell, %err, "transform change notification failed");
            }
        }
    }

    fn sync(&self, delta: &RootDelta) {
        if delta.is_empty() {
            return;
        }
        let mut roots = self.lock_roots();
        self.apply_delta(&mut roots, delta);
    }

    /// Add a new root cell and place it in the spaces its bounds touch.
    pub fn insert_cell(
        &self,
        id: CellId,
        attributes: CellAttributes,
        local_bounds: Bounds,
        transform: Transform,
    ) -> Result<(), UniverseError> {
        let delta = self.index.insert(id, attributes, local_bounds, transform)?;
        self.sync(&delta);
        Ok(())
    }

    /// Destroy a childless cell.
    pub fn remove_cell(&self, id: CellId) -> Result<(), UniverseError> {
        let mut roots = self.lock_roots();
        let removed = self.index.remove(id)?;
        self.cell_listeners.forget(id);
        if removed.delta.removed.is_empty() {
            for cache in self.viewers_of_root(&roots, removed.former_root) {
                cache.cells_removed(removed.former_root, &removed.cells);
            }
        }
        self.apply_delta(&mut roots, &removed.delta);
        Ok(())
    }

    pub fn set_transform(&self, id: CellId, transform: Transform) -> Result<(), UniverseError> {
        let delta = self.index.set_transform(id, transform)?;
        self.sync(&delta);
        self.notify_transform_listeners(id);
        Ok(())
    }

    pub fn set_local_bounds(&self, id: CellId, bounds: Bounds) -> Result<(), UniverseError> {
        let delta = self.index.set_local_bounds(id, bounds)?;
        self.sync(&delta);
        Ok(())
    }

    /// Link root `child` under `parent`. The child stops being a root; its
    /// subtree is loaded for viewers of the new root.
    pub fn attach(&self, parent: CellId, child: CellId) -> Result<(), UniverseError> {
        {
            let mut roots = self.lock_roots();
            let attached = self.index.attach(parent, child)?;
            self.apply_delta(&mut roots, &attached.delta);
            for cache in self.viewers_of_root(&roots, attached.root) {
                cache.cells_added(attached.root, &attached.cells);
            }
        }
        self.notify_transform_listeners(child);
        Ok(())
    }

    /// Unlink `child` from `parent`; the child becomes a root of its own.
    pub fn detach(&self, parent: CellId, child: CellId) -> Result<(), UniverseError> {
        {
            let mut roots = self.lock_roots();
            let detached = self.index.detach(parent, child)?;
            for cache in self.viewers_of_root(&roots, detached.former_root) {
                cache.cells_removed(detached.former_root, &detached.cells);
            }
            self.apply_delta(&mut roots, &detached.delta);
        }
        self.notify_transform_listeners(child);
        Ok(())
    }

    /// Make the bounds under `id` tight again and shrink its root's space
    /// membership to match.
    pub fn retighten(&self, id: CellId) -> Result<(), UniverseError> {
        let delta = self.index.retighten(id)?;
        self.sync(&delta);
        Ok(())
    }

    /// Connect a viewer, start its dispatch loop and compute its initial
    /// visible set.
    pub fn viewer_login(
        &self,
        viewer: ViewerId,
        identity: Identity,
        transform: &Transform,
    ) -> Result<Arc<ViewCache>, UniverseError> {
        let cache = {
            let mut viewers = self.viewers.write().unwrap_or_else(PoisonError::into_inner);
            if viewers.contains_key(&viewer) {
                return Err(UniverseError::ViewerExists(viewer));
            }
            let cache = Arc::new(ViewCache::new(
                viewer,
                identity,
                &self.config,
                Arc::clone(&self.index),
                Arc::clone(&self.partition),
                Arc::clone(&self.scheduler),
                Arc::clone(&self.cell_listeners),
            ));
            let dispatcher = UpdateDispatcher::new(
                Arc::clone(&cache),
                Arc::clone(&self.manager),
                Arc::clone(&self.scheduler),
                DispatchConfig::from(&self.config),
            )
            .spawn()?;
            viewers.insert(
                viewer,
                ViewerEntry {
                    cache: Arc::clone(&cache),
                    dispatcher,
                },
            );
            cache
        };
        tracing::info!(?viewer, identity = %cache.identity().0, "viewer logged in");
        self.move_viewer(&cache, transform);
        Ok(cache)
    }

    /// Returns true if the viewer's spaces were recomputed.
    pub fn viewer_moved(&self, viewer: ViewerId, transform: &Transform) -> Result<bool, UniverseError> {
        Ok(self.move_viewer(&*self.cache(viewer)?, transform))
    }

    fn move_viewer(&self, cache: &ViewCache, transform: &Transform) -> bool {
        let revalidated = {
            let _roots = self.lock_roots();
            cache.revalidate(transform.position)
        };
        cache.notify_listeners(transform);
        revalidated
    }

    /// Disconnect a viewer: stop its loop, leave all spaces, drop pending
    /// changes.
    pub fn viewer_logout(&self, viewer: ViewerId) -> Result<(), UniverseError> {
        let entry = self
            .viewers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&viewer)
            .ok_or(UniverseError::UnknownViewer(viewer))?;
        entry.cache.disconnect();
        entry.dispatcher.join();
        tracing::info!(?viewer, "viewer logged out");
        Ok(())
    }

    pub fn viewers(&self) -> Vec<ViewerId> {
        let mut ids: Vec<ViewerId> = self
            .viewers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        ids.sort();
        ids
    }

    /// Notify `listener` with the transform of every viewer that can see
    /// `cell`, on each of that viewer's moves. Viewers that see the cell's
    /// root later pick the listener up when they do. Returns false if the
    /// listener was already registered for `cell`.
    pub fn add_view_update_listener(
        &self,
        cell: CellId,
        listener: Arc<dyn ViewUpdateListener>,
    ) -> Result<bool, UniverseError> {
        let _roots = self.lock_roots();
        let root = self.index.root_of(cell)?;
        if !self.cell_listeners.add_view_listener(cell, Arc::clone(&listener)) {
            return Ok(false);
        }
        let mut attached = 0;
        for cache in self.all_caches() {
            if cache.adopt_listener(root, cell, Arc::clone(&listener)) {
                attached += 1;
            }
        }
        tracing::debug!(?cell, ?root, caches = attached, "view update listener added");
        Ok(true)
    }

    pub fn remove_view_update_listener(
        &self,
        cell: CellId,
        listener: &Arc<dyn ViewUpdateListener>,
    ) -> bool {
        let _roots = self.lock_roots();
        let removed = self.cell_listeners.remove_view_listener(cell, listener);
        for cache in self.all_caches() {
            cache.remove_listener(cell, listener);
        }
        removed
    }

    /// Notify `listener` whenever `cell` moves, directly or with an ancestor.
    pub fn add_transform_change_listener(
        &self,
        cell: CellId,
        listener: Arc<dyn TransformChangeListener>,
    ) -> Result<bool, UniverseError> {
        if !self.index.contains(cell) {
            return Err(BoundsError::UnknownCell(cell).into());
        }
        Ok(self.cell_listeners.add_transform_listener(cell, listener))
    }

    pub fn remove_transform_change_listener(
        &self,
        cell: CellId,
        listener: &Arc<dyn TransformChangeListener>,
    ) -> bool {
        self.cell_listeners.remove_transform_listener(cell, listener)
    }

    /// Cells under `root` whose world bounds intersect `volume`.
    pub fn get_visible_cells(&self, root: CellId, volume: &Bounds) -> Result<Vec<CellDescription>, UniverseError> {
        Ok(self.index.query(root, volume)?)
    }

    pub fn cache_stats(&self, viewer: ViewerId) -> Result<CacheStats, UniverseError> {
        Ok(self.cache(viewer)?.stats())
    }

    pub fn cache_health(&self, viewer: ViewerId) -> Result<CacheHealth, UniverseError> {
        Ok(self.cache(viewer)?.health())
    }

    /// Log out every viewer.
    pub fn shutdown(&self) {
        let entries: Vec<(ViewerId, ViewerEntry)> = self
            .viewers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        if entries.is_empty() {
            return;
        }
        tracing::info!(viewers = entries.len(), "shutting down");
        for (_, entry) in entries {
            entry.cache.disconnect();
            entry.dispatcher.join();
        }
    }
}

impl Drop for Universe {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    use crate::external::{ImmediateScheduler, InMemoryCacheManager};

    fn universe() -> (Universe, Arc<InMemoryCacheManager>) {
        let manager = Arc::new(InMemoryCacheManager::new());
        let config = SpatialConfig {
            space_size: 10.0,
            proximity_radius: 5.0,
            batch_window_ms: 0,
            retry_backoff_ms: 5,
            ..SpatialConfig::default()
        };
        let universe = Universe::new(config, Arc::new(ImmediateScheduler), manager.clone()).unwrap();
        (universe, manager)
    }

    fn cell(universe: &Universe, at: Vec3, radius: f32) -> CellId {
        let id = CellId::new();
        universe
            .insert_cell(
                id,
                CellAttributes::default(),
                Bounds::sphere(Vec3::ZERO, radius),
                Transform::from_position(at),
            )
            .unwrap();
        id
    }

    #[test]
    fn insert_places_root_in_touched_spaces() {
        let (universe, _) = universe();
        let id = cell(&universe, Vec3::splat(5.0), 1.0);
        assert_eq!(universe.root_spaces(id), vec![SpaceKey::new(0, 0, 0)]);

        universe
            .set_transform(id, Transform::from_position(Vec3::new(15.0, 5.0, 5.0)))
            .unwrap();
        assert_eq!(universe.root_spaces(id), vec![SpaceKey::new(1, 0, 0)]);
        assert!(universe.partition().root_cells(SpaceKey::new(0, 0, 0)).is_empty());
    }

    #[test]
    fn attach_moves_membership_to_new_root() {
        let (universe, _) = universe();
        let parent = cell(&universe, Vec3::splat(5.0), 1.0);
        let child = cell(&universe, Vec3::new(25.0, 5.0, 5.0), 1.0);
        universe.attach(parent, child).unwrap();

        assert!(universe.root_spaces(child).is_empty());
        assert!(!universe.root_spaces(parent).is_empty());
        assert!(!universe
            .partition()
            .root_cells(SpaceKey::new(2, 0, 0))
            .contains(&child));

        universe.detach(parent, child).unwrap();
        assert!(!universe.root_spaces(child).is_empty());
    }

    #[test]
    fn rejected_attach_is_reported() {
        let (universe, _) = universe();
        let a = cell(&universe, Vec3::ZERO, 1.0);
        let b = cell(&universe, Vec3::ZERO, 1.0);
        universe.attach(a, b).unwrap();
        let err = universe.attach(b, a).unwrap_err();
        assert!(matches!(err, UniverseError::Bounds(BoundsError::Cycle { .. })));
    }

    #[test]
    fn duplicate_login_and_unknown_viewer() {
        let (universe, _) = universe();
        let viewer = ViewerId::new();
        universe
            .viewer_login(viewer, Identity::new("v"), &Transform::default())
            .unwrap();
        let err = universe
            .viewer_login(viewer, Identity::new("v"), &Transform::default())
            .unwrap_err();
        assert!(matches!(err, UniverseError::ViewerExists(_)));

        universe.viewer_logout(viewer).unwrap();
        assert!(matches!(
            universe.viewer_logout(viewer),
            Err(UniverseError::UnknownViewer(_))
        ));
        assert!(matches!(
            universe.viewer_moved(viewer, &Transform::default()),
            Err(UniverseError::UnknownViewer(_))
        ));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = SpatialConfig {
            space_size: -1.0,
            ..SpatialConfig::default()
        };
        let result = Universe::new(
            config,
            Arc::new(ImmediateScheduler),
            Arc::new(InMemoryCacheManager::new()),
        );
        assert!(matches!(result, Err(UniverseError::Config(_))));
    }

    #[test]
    fn get_visible_cells_queries_index() {
        let (universe, _) = universe();
        let id = cell(&universe, Vec3::ZERO, 1.0);
        let hits = universe
            .get_visible_cells(id, &Bounds::sphere(Vec3::ZERO, 2.0))
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, id);
    }

    struct Seen(Mutex<Vec<(CellId, ViewerId)>>);

    impl Seen {
        fn take(&self) -> Vec<(CellId, ViewerId)> {
            std::mem::take(&mut *self.0.lock().unwrap())
        }
    }

    impl ViewUpdateListener for Seen {
        fn view_transform_changed(&self, cell: CellId, viewer: ViewerId, _: &Transform) {
            self.0.lock().unwrap().push((cell, viewer));
        }
    }

    #[test]
    fn cell_listener_follows_its_root_in_and_out_of_view() {
        let (universe, _) = universe();
        let root = cell(&universe, Vec3::splat(5.0), 1.0);
        let leaf = cell(&universe, Vec3::splat(0.5), 0.5);
        universe.attach(root, leaf).unwrap();

        let seen = Arc::new(Seen(Mutex::new(Vec::new())));
        let listener: Arc<dyn ViewUpdateListener> = seen.clone();
        assert!(universe.add_view_update_listener(leaf, Arc::clone(&listener)).unwrap());
        assert!(!universe.add_view_update_listener(leaf, Arc::clone(&listener)).unwrap());

        let near = ViewerId::new();
        let far = ViewerId::new();
        universe
            .viewer_login(near, Identity::new("near"), &Transform::from_position(Vec3::splat(5.0)))
            .unwrap();
        universe
            .viewer_login(far, Identity::new("far"), &Transform::from_position(Vec3::splat(500.0)))
            .unwrap();
        assert_eq!(seen.take(), vec![(leaf, near)]);

        universe
            .viewer_moved(far, &Transform::from_position(Vec3::splat(6.0)))
            .unwrap();
        assert_eq!(seen.take(), vec![(leaf, far)]);

        universe
            .viewer_moved(near, &Transform::from_position(Vec3::splat(500.0)))
            .unwrap();
        assert!(seen.take().is_empty());

        assert!(universe.remove_view_update_listener(leaf, &listener));
        assert!(!universe.remove_view_update_listener(leaf, &listener));
        universe
            .viewer_moved(far, &Transform::from_position(Vec3::splat(5.0)))
            .unwrap();
        assert!(seen.take().is_empty());
    }

    #[test]
    fn listener_added_while_visible_is_attached_at_once() {
        let (universe, _) = universe();
        let root = cell(&universe, Vec3::splat(5.0), 1.0);
        let viewer = ViewerId::new();
        universe
            .viewer_login(viewer, Identity::new("v"), &Transform::from_position(Vec3::splat(5.0)))
            .unwrap();

        let seen = Arc::new(Seen(Mutex::new(Vec::new())));
        universe.add_view_update_listener(root, seen.clone()).unwrap();
        universe
            .viewer_moved(viewer, &Transform::from_position(Vec3::splat(5.5)))
            .unwrap();
        assert_eq!(seen.take(), vec![(root, viewer)]);

        assert!(matches!(
            universe.add_view_update_listener(CellId::new(), seen.clone()),
            Err(UniverseError::Bounds(BoundsError::UnknownCell(_)))
        ));
    }

    struct Moves(Mutex<Vec<(CellId, Vec3)>>);

    impl TransformChangeListener for Moves {
        fn transform_changed(&self, cell: CellId, _: &Transform, world: &Transform) {
            self.0.lock().unwrap().push((cell, world.position));
        }
    }

    #[test]
    fn transform_listeners_fire_for_carried_descendants() {
        let (universe, _) = universe();
        let root = cell(&universe, Vec3::splat(5.0), 1.0);
        let child = cell(&universe, Vec3::new(1.0, 0.0, 0.0), 0.5);
        universe.attach(root, child).unwrap();

        let moves = Arc::new(Moves(Mutex::new(Vec::new())));
        let listener: Arc<dyn TransformChangeListener> = moves.clone();
        assert!(universe.add_transform_change_listener(child, Arc::clone(&listener)).unwrap());

        universe
            .set_transform(root, Transform::from_position(Vec3::new(15.0, 5.0, 5.0)))
            .unwrap();
        assert_eq!(
            *moves.0.lock().unwrap(),
            vec![(child, Vec3::new(16.0, 5.0, 5.0))]
        );

        assert!(universe.remove_transform_change_listener(child, &listener));
        universe
            .set_transform(root, Transform::from_position(Vec3::splat(5.0)))
            .unwrap();
        assert_eq!(moves.0.lock().unwrap().len(), 1);
        assert!(universe
            .add_transform_change_listener(CellId::new(), listener)
            .is_err());
    }

    #[test]
    fn oversized_root_is_placed_in_overflow_space() {
        let config = SpatialConfig {
            space_size: 10.0,
            proximity_radius: 5.0,
            batch_window_ms: 0,
            max_root_spaces: 64,
            ..SpatialConfig::default()
        };
        let universe = Universe::new(
            config,
            Arc::new(ImmediateScheduler),
            Arc::new(InMemoryCacheManager::new()),
        )
        .unwrap();
        let huge = cell(&universe, Vec3::ZERO, 1_000.0);
        assert_eq!(universe.root_spaces(huge), vec![SpaceKey::OVERFLOW]);
        assert_eq!(universe.partition().space_count(), 1);

        let cache = universe
            .viewer_login(
                ViewerId::new(),
                Identity::new("v"),
                &Transform::from_position(Vec3::splat(5_000.0)),
            )
            .unwrap();
        assert!(cache.is_visible(huge));
        assert!(!cache.current_spaces().contains(&SpaceKey::OVERFLOW));

        universe
            .set_local_bounds(huge, Bounds::sphere(Vec3::ZERO, 1.0))
            .unwrap();
        assert_eq!(universe.root_spaces(huge).len(), 8);
        assert!(!cache.is_visible(huge));
    }

    #[test]
    fn shutdown_logs_everyone_out() {
        let (universe, _) = universe();
        for _ in 0..3 {
            universe
                .viewer_login(ViewerId::new(), Identity::new("v"), &Transform::default())
                .unwrap();
        }
        assert_eq!(universe.viewers().len(), 3);
        universe.shutdown();
        assert!(universe.viewers().is_empty());
        assert_eq!(universe.partition().viewers(SpaceKey::new(0, 0, 0)).len(), 0);
    }
}
