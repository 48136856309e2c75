use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use glam::Vec3;
use viewspace_common::{Aabb, Bounds, CellId, ViewerId};

/// Integer coordinate of one cubic space in the world grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpaceKey {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl SpaceKey {
    /// Holds roots too large to place cell by cell. Every active viewer is
    /// registered here. No grid position maps to it.
    pub const OVERFLOW: SpaceKey = SpaceKey {
        x: i32::MIN,
        y: i32::MIN,
        z: i32::MIN,
    };

    pub fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    pub fn is_overflow(&self) -> bool {
        *self == Self::OVERFLOW
    }
}

fn grid_coord(value: f32, space_size: f32) -> i32 {
    (f64::from(value) / f64::from(space_size))
        .floor()
        .clamp(f64::from(i32::MIN + 1), f64::from(i32::MAX)) as i32
}

#[derive(Debug, Default)]
struct SpaceSets {
    root_cells: HashSet<CellId>,
    view_caches: HashSet<ViewerId>,
}

/// One grid region: the root cells whose bounds touch it and the viewers
/// currently interested in it. Both sets share one lock, so a snapshot of
/// one is always consistent with a change to the other.
#[derive(Debug)]
pub struct Space {
    key: SpaceKey,
    sets: Mutex<SpaceSets>,
}

impl Space {
    fn new(key: SpaceKey) -> Self {
        Self {
            key,
            sets: Mutex::new(SpaceSets::default()),
        }
    }

    pub fn key(&self) -> SpaceKey {
        self.key
    }

    fn lock(&self) -> MutexGuard<'_, SpaceSets> {
        self.sets.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Fixed-size cubic partitioning of the world.
///
/// Spaces are created lazily on first registration and never dropped; an
/// empty space costs one map entry.
#[derive(Debug)]
pub struct SpacePartition {
    space_size: f32,
    spaces: RwLock<HashMap<SpaceKey, Arc<Space>>>,
}

impl SpacePartition {
    /// Create a partition with the given space side length.
    pub fn new(space_size: f32) -> Self {
        assert!(space_size > 0.0, "space_size must be positive");
        Self {
            space_size,
            spaces: RwLock::new(HashMap::new()),
        }
    }

    pub fn space_size(&self) -> f32 {
        self.space_size
    }

    /// Space containing a world position. Coordinates beyond the grid are
    /// clamped to its edge.
    pub fn key_for(&self, pos: Vec3) -> SpaceKey {
        SpaceKey {
            x: grid_coord(pos.x, self.space_size),
            y: grid_coord(pos.y, self.space_size),
            z: grid_coord(pos.z, self.space_size),
        }
    }

    /// Number of grid spaces in the axis-aligned hull of `volume`, an upper
    /// bound on what [`spaces_overlapping`](Self::spaces_overlapping) returns.
    pub fn span(&self, volume: &Bounds) -> u64 {
        let hull = volume.aabb();
        let lo = self.key_for(hull.min);
        let hi = self.key_for(hull.max);
        let extent = |a: i32, b: i32| (i64::from(b) - i64::from(a) + 1).max(0) as u64;
        extent(lo.x, hi.x)
            .saturating_mul(extent(lo.y, hi.y))
            .saturating_mul(extent(lo.z, hi.z))
    }

    /// World-space box covered by a space.
    pub fn space_bounds(&self, key: SpaceKey) -> Aabb {
        let min = Vec3::new(key.x as f32, key.y as f32, key.z as f32) * self.space_size;
        Aabb::new(min, min + Vec3::splat(self.space_size))
    }

    /// Keys of every space whose box intersects `volume`, in ascending order.
    pub fn spaces_overlapping(&self, volume: &Bounds) -> Vec<SpaceKey> {
        let hull = volume.aabb();
        let lo = self.key_for(hull.min);
        let hi = self.key_for(hull.max);
        let mut keys = Vec::new();
        for x in lo.x..=hi.x {
            for y in lo.y..=hi.y {
                for z in lo.z..=hi.z {
                    let key = SpaceKey::new(x, y, z);
                    if Bounds::Box(self.space_bounds(key)).intersects(volume) {
                        keys.push(key);
                    }
                }
            }
        }
        keys
    }

    fn space(&self, key: SpaceKey) -> Arc<Space> {
        if let Some(space) = self
            .spaces
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            return Arc::clone(space);
        }
        let mut spaces = self.spaces.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            spaces
                .entry(key)
                .or_insert_with(|| Arc::new(Space::new(key))),
        )
    }

    fn existing(&self, key: SpaceKey) -> Option<Arc<Space>> {
        self.spaces
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .cloned()
    }

    /// Add a root cell to a space. When it was not already there, returns the
    /// viewers registered at that moment, which must be told about it.
    pub fn register_root(&self, key: SpaceKey, root: CellId) -> Option<Vec<ViewerId>> {
        let space = self.space(key);
        let mut sets = space.lock();
        if !sets.root_cells.insert(root) {
            return None;
        }
        tracing::trace!(?key, ?root, "root registered");
        Some(sets.view_caches.iter().copied().collect())
    }

    /// Remove a root cell from a space. When it was there, returns the
    /// viewers registered at that moment.
    pub fn unregister_root(&self, key: SpaceKey, root: CellId) -> Option<Vec<ViewerId>> {
        let space = self.existing(key)?;
        let mut sets = space.lock();
        if !sets.root_cells.remove(&root) {
            return None;
        }
        tracing::trace!(?key, ?root, "root unregistered");
        Some(sets.view_caches.iter().copied().collect())
    }

    /// Register a viewer with a space. When it was not already registered,
    /// returns the root cells present at that moment.
    pub fn register_viewer(&self, key: SpaceKey, viewer: ViewerId) -> Option<Vec<CellId>> {
        let space = self.space(key);
        let mut sets = space.lock();
        if !sets.view_caches.insert(viewer) {
            return None;
        }
        Some(sets.root_cells.iter().copied().collect())
    }

    /// Returns true if the viewer was registered.
    pub fn unregister_viewer(&self, key: SpaceKey, viewer: ViewerId) -> bool {
        self.existing(key)
            .is_some_and(|space| space.lock().view_caches.remove(&viewer))
    }

    pub fn root_cells(&self, key: SpaceKey) -> HashSet<CellId> {
        self.existing(key)
            .map(|space| space.lock().root_cells.clone())
            .unwrap_or_default()
    }

    pub fn viewers(&self, key: SpaceKey) -> HashSet<ViewerId> {
        self.existing(key)
            .map(|space| space.lock().view_caches.clone())
            .unwrap_or_default()
    }

    /// Number of spaces created so far.
    pub fn space_count(&self) -> usize {
        self.spaces
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Total number of root placements across all spaces.
    pub fn total_root_placements(&self) -> usize {
        self.spaces
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|s| s.lock().root_cells.len())
            .sum()
    }
}
