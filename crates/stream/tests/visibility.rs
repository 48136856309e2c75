use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use glam::Vec3;
use viewspace_common::{Bounds, CellAttributes, CellId, Identity, Transform, ViewerId};
use viewspace_stream::{
    ImmediateScheduler, InMemoryCacheManager, SpaceKey, SpatialConfig, Task, TransactionError,
    TransactionScheduler, Universe,
};

fn config() -> SpatialConfig {
    SpatialConfig {
        space_size: 10.0,
        proximity_radius: 5.0,
        hysteresis_radius: None,
        batch_window_ms: 0,
        retry_backoff_ms: 5,
        ..SpatialConfig::default()
    }
}

fn universe_with(scheduler: Arc<dyn TransactionScheduler>) -> (Universe, Arc<InMemoryCacheManager>) {
    let manager = Arc::new(InMemoryCacheManager::new());
    let universe = Universe::new(config(), scheduler, manager.clone()).unwrap();
    (universe, manager)
}

fn universe() -> (Universe, Arc<InMemoryCacheManager>) {
    universe_with(Arc::new(ImmediateScheduler))
}

fn spawn_cell(universe: &Universe, at: Vec3) -> CellId {
    let id = CellId::new();
    universe
        .insert_cell(
            id,
            CellAttributes::default(),
            Bounds::sphere(Vec3::ZERO, 1.0),
            Transform::from_position(at),
        )
        .unwrap();
    id
}

fn wait_until(mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    done()
}

#[test]
fn scenario_viewer_registration_and_hysteresis() {
    let (universe, _) = universe();
    let viewer = ViewerId::new();
    let cache = universe
        .viewer_login(viewer, Identity::new("v"), &Transform::default())
        .unwrap();

    let spaces = cache.current_spaces();
    assert_eq!(spaces.len(), 8);
    for key in &spaces {
        assert!(universe.partition().viewers(*key).contains(&viewer));
    }
    let created = universe.partition().space_count();

    let moved = universe
        .viewer_moved(viewer, &Transform::from_position(Vec3::new(1.0, 0.0, 0.0)))
        .unwrap();
    assert!(!moved);
    assert_eq!(cache.current_spaces(), spaces);
    assert_eq!(universe.cache_stats(viewer).unwrap().revalidations, 1);
    assert_eq!(universe.partition().space_count(), created);
}

#[test]
fn cells_stream_in_and_out_as_viewer_moves() {
    let (universe, manager) = universe();
    let near = spawn_cell(&universe, Vec3::splat(5.0));
    let far = spawn_cell(&universe, Vec3::new(205.0, 5.0, 5.0));
    let viewer = ViewerId::new();
    universe
        .viewer_login(viewer, Identity::new("walker"), &Transform::from_position(Vec3::splat(5.0)))
        .unwrap();

    assert!(wait_until(|| manager.is_loaded(viewer, near)));
    assert!(!manager.is_loaded(viewer, far));

    universe
        .viewer_moved(viewer, &Transform::from_position(Vec3::new(205.0, 5.0, 5.0)))
        .unwrap();
    assert!(wait_until(|| {
        manager.is_loaded(viewer, far) && !manager.is_loaded(viewer, near)
    }));
    assert!(universe.cache_health(viewer).unwrap().last_success.is_some());
}

#[test]
fn scenario_root_reachable_through_two_spaces() {
    let (universe, manager) = universe();
    let viewer = ViewerId::new();
    let cache = universe
        .viewer_login(viewer, Identity::new("v"), &Transform::from_position(Vec3::new(10.0, 5.0, 5.0)))
        .unwrap();

    // Straddles the x = 10 boundary.
    let root = spawn_cell(&universe, Vec3::new(10.0, 5.0, 5.0));
    assert_eq!(
        universe.root_spaces(root),
        vec![SpaceKey::new(0, 0, 0), SpaceKey::new(1, 0, 0)]
    );
    assert_eq!(cache.visible_roots().get(&root), Some(&2));
    assert!(wait_until(|| manager.is_loaded(viewer, root)));
    assert!(wait_until(|| {
        universe.cache_health(viewer).unwrap().dispatched_batches == 1
    }));
    let batches = 1;

    universe
        .set_transform(root, Transform::from_position(Vec3::new(15.0, 5.0, 5.0)))
        .unwrap();
    assert_eq!(cache.visible_roots().get(&root), Some(&1));
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(universe.cache_health(viewer).unwrap().dispatched_batches, batches);
    assert!(manager.is_loaded(viewer, root));

    universe
        .set_transform(root, Transform::from_position(Vec3::new(105.0, 5.0, 5.0)))
        .unwrap();
    assert!(!cache.is_visible(root));
    assert!(wait_until(|| !manager.is_loaded(viewer, root)));
    assert!(wait_until(|| {
        universe.cache_health(viewer).unwrap().dispatched_batches == batches + 1
    }));
}

#[test]
fn attach_and_detach_follow_the_tree() {
    let (universe, manager) = universe();
    let parent = spawn_cell(&universe, Vec3::splat(5.0));
    let child = spawn_cell(&universe, Vec3::new(35.0, 5.0, 5.0));
    let viewer = ViewerId::new();
    universe
        .viewer_login(viewer, Identity::new("v"), &Transform::from_position(Vec3::splat(5.0)))
        .unwrap();
    assert!(wait_until(|| manager.is_loaded(viewer, parent)));
    assert!(!manager.is_loaded(viewer, child));

    universe.attach(parent, child).unwrap();
    assert!(wait_until(|| manager.is_loaded(viewer, child)));

    universe.detach(parent, child).unwrap();
    assert!(wait_until(|| !manager.is_loaded(viewer, child)));
    assert!(manager.is_loaded(viewer, parent));

    universe.remove_cell(child).unwrap();
    universe.remove_cell(parent).unwrap();
    assert!(wait_until(|| manager.loaded_count(viewer) == 0));
}

#[test]
fn removing_a_leaf_unloads_it() {
    let (universe, manager) = universe();
    let parent = spawn_cell(&universe, Vec3::splat(5.0));
    let leaf = spawn_cell(&universe, Vec3::splat(5.5));
    universe.attach(parent, leaf).unwrap();
    let viewer = ViewerId::new();
    universe
        .viewer_login(viewer, Identity::new("v"), &Transform::from_position(Vec3::splat(5.0)))
        .unwrap();
    assert!(wait_until(|| manager.is_loaded(viewer, leaf)));

    universe.remove_cell(leaf).unwrap();
    assert!(wait_until(|| !manager.is_loaded(viewer, leaf)));
    assert!(manager.is_loaded(viewer, parent));
}

#[test]
fn logout_leaves_every_space() {
    let (universe, _) = universe();
    let viewer = ViewerId::new();
    let cache = universe
        .viewer_login(viewer, Identity::new("v"), &Transform::default())
        .unwrap();
    let spaces = cache.current_spaces();

    universe.viewer_logout(viewer).unwrap();
    for key in spaces {
        assert!(!universe.partition().viewers(key).contains(&viewer));
    }
    assert!(cache.queue().is_closed());
    assert!(universe.cache_stats(viewer).is_err());
}

/// Fails the first `failures` transactions submitted under `identity`.
struct FailFor {
    identity: Identity,
    failures: AtomicUsize,
}

impl TransactionScheduler for FailFor {
    fn schedule_transaction(&self, identity: &Identity, task: Task) -> Result<(), TransactionError> {
        if *identity == self.identity
            && self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(TransactionError::Conflict);
        }
        task()
    }
}

#[test]
fn failing_viewer_does_not_stall_others() {
    let scheduler = Arc::new(FailFor {
        identity: Identity::new("flaky"),
        failures: AtomicUsize::new(3),
    });
    let (universe, manager) = universe_with(scheduler);
    let cell = spawn_cell(&universe, Vec3::splat(5.0));
    let flaky = ViewerId::new();
    let steady = ViewerId::new();
    let at = Transform::from_position(Vec3::splat(5.0));
    universe.viewer_login(flaky, Identity::new("flaky"), &at).unwrap();
    universe.viewer_login(steady, Identity::new("steady"), &at).unwrap();

    assert!(wait_until(|| manager.is_loaded(steady, cell)));
    assert!(wait_until(|| manager.is_loaded(flaky, cell)));
    assert!(wait_until(|| {
        universe.cache_health(flaky).unwrap().dispatched_batches == 1
    }));

    let flaky_health = universe.cache_health(flaky).unwrap();
    assert_eq!(flaky_health.total_failures, 3);
    assert!(flaky_health.is_healthy());
    assert_eq!(universe.cache_health(steady).unwrap().total_failures, 0);
    assert_eq!(manager.loaded_count(flaky), 1);
}
