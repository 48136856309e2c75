use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use viewspace_common::{CellDescription, CellId};

/// One pending membership change for a viewer.
#[derive(Debug, Clone, PartialEq)]
pub enum CellChange {
    Load(CellDescription),
    Unload(CellId),
}

impl CellChange {
    pub fn id(&self) -> CellId {
        match self {
            Self::Load(desc) => desc.id,
            Self::Unload(id) => *id,
        }
    }
}

/// Net effect of a run of changes: one entry per cell, the last change for
/// each cell wins.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeBatch {
    pub load: Vec<CellDescription>,
    pub unload: Vec<CellId>,
}

impl ChangeBatch {
    pub fn coalesce(changes: impl IntoIterator<Item = CellChange>) -> Self {
        let mut slots: Vec<CellChange> = Vec::new();
        let mut position: HashMap<CellId, usize> = HashMap::new();
        for change in changes {
            match position.get(&change.id()) {
                Some(&i) => slots[i] = change,
                None => {
                    position.insert(change.id(), slots.len());
                    slots.push(change);
                }
            }
        }

        let mut batch = Self::default();
        for change in slots {
            match change {
                CellChange::Load(desc) => batch.load.push(desc),
                CellChange::Unload(id) => batch.unload.push(id),
            }
        }
        batch
    }

    pub fn is_empty(&self) -> bool {
        self.load.is_empty() && self.unload.is_empty()
    }

    pub fn len(&self) -> usize {
        self.load.len() + self.unload.len()
    }

    fn into_changes(self) -> impl Iterator<Item = CellChange> {
        self.unload
            .into_iter()
            .map(CellChange::Unload)
            .chain(self.load.into_iter().map(CellChange::Load))
    }
}

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<CellChange>,
    closed: bool,
}

/// FIFO of pending changes for one viewer.
///
/// Producers never block on the consumer. The single consumer sleeps on a
/// condition variable until the queue becomes non-empty or is closed.
#[derive(Debug, Default)]
pub struct ChangeQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
}

impl ChangeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append changes. Dropped if the queue is closed.
    pub fn extend(&self, changes: impl IntoIterator<Item = CellChange>) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        let before = state.items.len();
        state.items.extend(changes);
        if state.items.len() != before {
            self.ready.notify_all();
        }
    }

    pub fn push(&self, change: CellChange) {
        self.extend(std::iter::once(change));
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Copy of the pending changes, oldest first.
    pub fn snapshot(&self) -> Vec<CellChange> {
        self.lock().items.iter().cloned().collect()
    }

    /// Take every pending change, leaving the queue empty.
    pub fn drain(&self) -> Vec<CellChange> {
        std::mem::take(&mut self.lock().items).into()
    }

    /// Put a batch that failed to dispatch back at the head of the queue.
    /// Changes queued since then come after it and so still override it when
    /// the queue is next coalesced.
    pub fn requeue_front(&self, batch: ChangeBatch) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        let newer = std::mem::take(&mut state.items);
        state.items.extend(batch.into_changes());
        state.items.extend(newer);
        if !state.items.is_empty() {
            self.ready.notify_all();
        }
    }

    /// Discard pending changes and wake the consumer for good.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.items.clear();
        self.ready.notify_all();
    }

    /// Block until changes are pending, then wait `window` for more to
    /// arrive and drain them all. Returns `None` once the queue is closed.
    pub fn wait_for_changes(&self, window: Duration) -> Option<Vec<CellChange>> {
        let mut state = self
            .ready
            .wait_while(self.lock(), |s| s.items.is_empty() && !s.closed)
            .unwrap_or_else(PoisonError::into_inner);
        if !window.is_zero() && !state.closed {
            state = self
                .ready
                .wait_timeout_while(state, window, |s| !s.closed)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        if state.closed {
            return None;
        }
        Some(std::mem::take(&mut state.items).into())
    }

    /// Sleep up to `timeout`, returning early with true if the queue closes.
    pub fn wait_closed(&self, timeout: Duration) -> bool {
        let (state, _) = self
            .ready
            .wait_timeout_while(self.lock(), timeout, |s| !s.closed)
            .unwrap_or_else(PoisonError::into_inner);
        state.closed
    }
}
