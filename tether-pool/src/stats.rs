//! Pool counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Cumulative pool counters.
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Streams created by the factory
    pub created: AtomicU64,
    /// Streams disposed
    pub destroyed: AtomicU64,
    /// Abandoned streams returned to the pool by an emancipation scan
    pub reclaimed: AtomicU64,
    /// Acquisitions that timed out
    pub timeouts: AtomicU64,
    /// Times the pool entered the error state
    pub aborts: AtomicU64,
    /// Idle streams evicted by sweeps
    pub evicted: AtomicU64,
}

impl PoolStats {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time view of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatsSnapshot {
    /// Streams owned by the pool, idle or leased
    pub count: usize,
    /// Streams available for immediate checkout
    pub idle: usize,
    /// Callers waiting for a stream, including queued async requests
    pub waiters: usize,
    /// Streams created by the factory
    pub created: u64,
    /// Streams disposed
    pub destroyed: u64,
    /// Abandoned streams reclaimed
    pub reclaimed: u64,
    /// Acquisitions that timed out
    pub timeouts: u64,
    /// Times the pool entered the error state
    pub aborts: u64,
    /// Idle streams evicted by sweeps
    pub evicted: u64,
}

impl PoolStats {
    pub(crate) fn snapshot(&self, count: usize, idle: usize, waiters: usize) -> PoolStatsSnapshot {
        PoolStatsSnapshot {
            count,
            idle,
            waiters,
            created: self.created.load(Ordering::Relaxed),
            destroyed: self.destroyed.load(Ordering::Relaxed),
            reclaimed: self.reclaimed.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            aborts: self.aborts.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
        }
    }
}
