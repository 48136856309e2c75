use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::cache::ViewCache;
use crate::config::SpatialConfig;
use crate::external::{CellCacheManager, TransactionError, TransactionScheduler};
use crate::queue::ChangeBatch;

/// Timing for one dispatch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchConfig {
    pub batch_window: Duration,
    pub retry_backoff: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self::from(&SpatialConfig::default())
    }
}

impl From<&SpatialConfig> for DispatchConfig {
    fn from(config: &SpatialConfig) -> Self {
        Self {
            batch_window: config.batch_window(),
            retry_backoff: config.retry_backoff(),
        }
    }
}

/// Background worker that delivers one viewer's queued changes to the cache
/// manager.
///
/// Sleeps until the queue has work, gathers for `batch_window`, coalesces
/// and submits one transaction per batch. A failed batch goes back to the
/// head of the queue and is retried after `retry_backoff`. Exits when the
/// queue is closed.
pub struct UpdateDispatcher {
    cache: Arc<ViewCache>,
    manager: Arc<dyn CellCacheManager>,
    scheduler: Arc<dyn TransactionScheduler>,
    config: DispatchConfig,
}

impl UpdateDispatcher {
    pub fn new(
        cache: Arc<ViewCache>,
        manager: Arc<dyn CellCacheManager>,
        scheduler: Arc<dyn TransactionScheduler>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            cache,
            manager,
            scheduler,
            config,
        }
    }

    /// Start the loop on its own named thread.
    pub fn spawn(self) -> std::io::Result<DispatcherHandle> {
        let cache = Arc::clone(&self.cache);
        let thread = std::thread::Builder::new()
            .name(format!("cache-dispatch-{}", cache.identity().0))
            .spawn(move || self.run())?;
        Ok(DispatcherHandle {
            cache,
            thread: Some(thread),
        })
    }

    /// Run the loop on the current thread until the queue closes.
    pub fn run(self) {
        let _span = tracing::info_span!("dispatch", viewer = ?self.cache.viewer()).entered();
        let queue = self.cache.queue();
        while let Some(changes) = queue.wait_for_changes(self.config.batch_window) {
            let batch = ChangeBatch::coalesce(changes);
            if batch.is_empty() {
                continue;
            }
            let started = Instant::now();
            match self.submit(&batch) {
                Ok(()) => {
                    tracing::debug!(
                        load = batch.load.len(),
                        unload = batch.unload.len(),
                        "batch dispatched"
                    );
                    self.cache
                        .record_dispatch_success(batch.len(), started.elapsed());
                }
                Err(err) => {
                    tracing::warn!(%err, changes = batch.len(), "dispatch failed, batch requeued");
                    self.cache.record_dispatch_failure();
                    queue.requeue_front(batch);
                    if queue.wait_closed(self.config.retry_backoff) {
                        break;
                    }
                }
            }
        }
        tracing::debug!("dispatch loop stopped");
    }

    fn submit(&self, batch: &ChangeBatch) -> Result<(), TransactionError> {
        let manager = Arc::clone(&self.manager);
        let viewer = self.cache.viewer();
        let load = batch.load.clone();
        let unload = batch.unload.clone();
        self.scheduler.schedule_transaction(
            self.cache.identity(),
            Box::new(move || {
                if !unload.is_empty() {
                    manager.notify_unload(viewer, &unload)?;
                }
                if !load.is_empty() {
                    manager.notify_load(viewer, &load)?;
                }
                Ok(())
            }),
        )
    }
}

/// Owner of a running dispatch thread.
pub struct DispatcherHandle {
    cache: Arc<ViewCache>,
    thread: Option<JoinHandle<()>>,
}

impl DispatcherHandle {
    /// Close the queue, discarding pending changes. The loop exits after
    /// any in-flight transaction returns.
    pub fn stop(&self) {
        self.cache.queue().close();
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Stop and wait for the thread.
    pub fn join(mut self) {
        self.stop();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!(viewer = ?self.cache.viewer(), "dispatch thread panicked");
            }
        }
    }
}

impl Drop for DispatcherHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use viewspace_bounds::BoundsIndex;
    use viewspace_common::{CellId, Identity, ViewerId};

    use crate::external::{ImmediateScheduler, InMemoryCacheManager, Task};
    use crate::listeners::CellListeners;
    use crate::queue::CellChange;
    use crate::space::SpacePartition;

    fn cache() -> Arc<ViewCache> {
        Arc::new(ViewCache::new(
            ViewerId::new(),
            Identity::new("dispatch-test"),
            &SpatialConfig::default(),
            Arc::new(BoundsIndex::new()),
            Arc::new(SpacePartition::new(32.0)),
            Arc::new(ImmediateScheduler),
            Arc::new(CellListeners::new()),
        ))
    }

    fn fast() -> DispatchConfig {
        DispatchConfig {
            batch_window: Duration::from_millis(5),
            retry_backoff: Duration::from_millis(5),
        }
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

    /// Fails the first `failures` transactions, then runs tasks inline.
    struct FlakyScheduler {
        failures: AtomicUsize,
        attempts: AtomicUsize,
    }

    impl TransactionScheduler for FlakyScheduler {
        fn schedule_transaction(&self, _identity: &Identity, task: Task) -> Result<(), TransactionError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(TransactionError::Timeout);
            }
            task()
        }
    }

    #[test]
    fn queued_unload_reaches_manager() {
        let cache = cache();
        let manager = Arc::new(InMemoryCacheManager::new());
        let cell = CellId::new();
        manager
            .notify_load(cache.viewer(), &[cache_desc(cell)])
            .unwrap();

        let handle = UpdateDispatcher::new(
            Arc::clone(&cache),
            manager.clone(),
            Arc::new(ImmediateScheduler),
            fast(),
        )
        .spawn()
        .unwrap();
        cache.queue().push(CellChange::Unload(cell));

        assert!(wait_until(|| !manager.is_loaded(cache.viewer(), cell)));
        assert!(wait_until(|| cache.health().dispatched_batches == 1));
        handle.join();
    }

    #[test]
    fn failed_batch_is_retried_without_loss() {
        let cache = cache();
        let manager = Arc::new(InMemoryCacheManager::new());
        let scheduler = Arc::new(FlakyScheduler {
            failures: AtomicUsize::new(2),
            attempts: AtomicUsize::new(0),
        });
        let cell = CellId::new();
        cache.queue().push(CellChange::Load(cache_desc(cell)));

        let handle = UpdateDispatcher::new(
            Arc::clone(&cache),
            manager.clone(),
            scheduler.clone(),
            fast(),
        )
        .spawn()
        .unwrap();

        assert!(wait_until(|| manager.is_loaded(cache.viewer(), cell)));
        assert!(wait_until(|| cache.health().dispatched_batches == 1));
        let health = cache.health();
        assert_eq!(health.total_failures, 2);
        assert_eq!(health.consecutive_failures, 0);
        assert_eq!(scheduler.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(manager.loaded_count(cache.viewer()), 1);
        handle.join();
    }

    #[test]
    fn stop_exits_promptly_during_backoff() {
        let cache = cache();
        let scheduler = Arc::new(FlakyScheduler {
            failures: AtomicUsize::new(usize::MAX),
            attempts: AtomicUsize::new(0),
        });
        cache.queue().push(CellChange::Unload(CellId::new()));
        let handle = UpdateDispatcher::new(
            Arc::clone(&cache),
            Arc::new(InMemoryCacheManager::new()),
            scheduler,
            DispatchConfig {
                batch_window: Duration::ZERO,
                retry_backoff: Duration::from_secs(60),
            },
        )
        .spawn()
        .unwrap();

        assert!(wait_until(|| cache.health().total_failures >= 1));
        let started = Instant::now();
        handle.join();
        assert!(started.elapsed() < Duration::from_secs(30));
        assert!(cache.queue().is_empty());
        assert!(cache.health().last_success.is_none());
    }

    fn cache_desc(id: CellId) -> viewspace_common::CellDescription {
        viewspace_common::CellDescription {
            id,
            kind: Default::default(),
            priority: 0,
            movable: true,
            transform: Default::default(),
            metadata: None,
        }
    }
}
