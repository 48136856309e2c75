//! Streaming: space partition, per-viewer view caches, load/unload dispatch.
//!
//! # Invariants
//! - A root cell is visible to a viewer while at least one of the viewer's
//!   current spaces holds it; it is unloaded only when the last one is left.
//! - Changes for one viewer reach the cache manager in the order they were
//!   queued, coalesced per cell.
//! - A failed dispatch is retried, never dropped; disconnect discards.
//! - One viewer's failing dispatch never stalls another's.

mod cache;
mod config;
mod dispatch;
mod external;
mod health;
mod listeners;
mod queue;
mod space;
mod universe;

pub use cache::{CacheStats, CacheStatus, ViewCache};
pub use config::{ConfigError, SpatialConfig};
pub use dispatch::{DispatchConfig, DispatcherHandle, UpdateDispatcher};
pub use external::{
    CellCacheManager, ImmediateScheduler, InMemoryCacheManager, Task, TransactionError,
    TransactionScheduler, TransformChangeListener, ViewUpdateListener,
};
pub use health::CacheHealth;
pub use listeners::CellListeners;
pub use queue::{CellChange, ChangeBatch, ChangeQueue};
pub use space::{Space, SpaceKey, SpacePartition};
pub use universe::{Universe, UniverseError};

pub fn crate_info() -> &'static str {
    "viewspace-stream v0.1.0"
}
