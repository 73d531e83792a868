use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free counters for one backend's unit pool
#[derive(Debug, Default)]
pub struct PoolStats {
    dials: AtomicU64,
    dial_failures: AtomicU64,
    reused: AtomicU64,
    returned: AtomicU64,
    discarded: AtomicU64,
    overflow_closed: AtomicU64,
}

/// Snapshot of pool counters at a point in time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStatsSnapshot {
    /// Successful dials
    pub dials: u64,
    /// Failed dial attempts, one per attempt
    pub dial_failures: u64,
    /// Gets served by an idle connection
    pub reused: u64,
    /// Puts that parked a live connection
    pub returned: u64,
    /// Puts that freed a slot for a broken connection
    pub discarded: u64,
    /// Live connections closed because every slot was taken
    pub overflow_closed: u64,
}

impl PoolStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_dial(&self) {
        self.dials.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dial_failure(&self) {
        self.dial_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reuse(&self) {
        self.reused.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_return(&self) {
        self.returned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_discard(&self) {
        self.discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_overflow_close(&self) {
        self.overflow_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PoolStatsSnapshot {
        PoolStatsSnapshot {
            dials: self.dials.load(Ordering::Relaxed),
            dial_failures: self.dial_failures.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            returned: self.returned.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            overflow_closed: self.overflow_closed.load(Ordering::Relaxed),
        }
    }
}
