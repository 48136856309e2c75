use std::time::{Duration, Instant};

/// Liveness of one viewer's dispatch loop.
///
/// A viewer whose batches keep failing shows a growing
/// `consecutive_failures` and a `last_success` that stops advancing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheHealth {
    pub last_success: Option<Instant>,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub dispatched_batches: u64,
    pub dispatched_changes: u64,
    /// Exponential moving average of successful dispatch latency.
    pub smoothed_latency: Duration,
    pub max_latency: Duration,
    pub last_latency: Option<Duration>,
}

impl CacheHealth {
    /// True while the last attempt, if any, succeeded.
    pub fn is_healthy(&self) -> bool {
        self.consecutive_failures == 0
    }

    /// Time since the last successful dispatch.
    pub fn since_last_success(&self) -> Option<Duration> {
        self.last_success.map(|t| t.elapsed())
    }
}

#[derive(Debug)]
pub(crate) struct HealthTracker {
    last_success: Option<Instant>,
    consecutive_failures: u32,
    total_failures: u64,
    dispatched_batches: u64,
    dispatched_changes: u64,
    smoothed_latency: Option<Duration>,
    max_latency: Duration,
    last_latency: Option<Duration>,
}

impl HealthTracker {
    /// Weight of the newest sample in the moving average, as 1/N.
    const SMOOTHING: u32 = 8;

    pub(crate) fn new() -> Self {
        Self {
            last_success: None,
            consecutive_failures: 0,
            total_failures: 0,
            dispatched_batches: 0,
            dispatched_changes: 0,
            smoothed_latency: None,
            max_latency: Duration::ZERO,
            last_latency: None,
        }
    }

    pub(crate) fn record_success(&mut self, changes: usize, latency: Duration) {
        self.last_success = Some(Instant::now());
        self.consecutive_failures = 0;
        self.dispatched_batches += 1;
        self.dispatched_changes += changes as u64;
        self.smoothed_latency = Some(match self.smoothed_latency {
            None => latency,
            Some(avg) => avg - avg / Self::SMOOTHING + latency / Self::SMOOTHING,
        });
        self.max_latency = self.max_latency.max(latency);
        self.last_latency = Some(latency);
    }

    pub(crate) fn record_failure(&mut self) {
        self.consecutive_failures += 1;
        self.total_failures += 1;
    }

    pub(crate) fn snapshot(&self) -> CacheHealth {
        CacheHealth {
            last_success: self.last_success,
            consecutive_failures: self.consecutive_failures,
            total_failures: self.total_failures,
            dispatched_batches: self.dispatched_batches,
            dispatched_changes: self.dispatched_changes,
            smoothed_latency: self.smoothed_latency.unwrap_or_default(),
            max_latency: self.max_latency,
            last_latency: self.last_latency,
        }
    }
}
