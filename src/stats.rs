//! Pool statistics: atomic counters a caller can sample without
//! synchronizing with the pool itself.
//!
//! The engine is single-threaded (§5), but the counters are still atomic
//! so a pool can be inspected from a monitoring thread without taking a
//! lock on the pool proper.
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// A single running/peak counter pair.
#[derive(Debug, Default)]
pub struct StatCount {
    current: AtomicI64,
    peak: AtomicI64,
}

impl StatCount {
    fn update(&self, amount: i64) {
        if amount == 0 {
            return;
        }
        let current = self.current.fetch_add(amount, Ordering::Relaxed) + amount;
        self.peak.fetch_max(current, Ordering::Relaxed);
    }

    pub fn current(&self) -> i64 {
        self.current.load(Ordering::Relaxed)
    }

    pub fn peak(&self) -> i64 {
        self.peak.load(Ordering::Relaxed)
    }
}

/// Counters for one pool: bytes handed to callers, pages held, and a
/// breakdown of which allocator paths were taken.
#[derive(Debug, Default)]
pub struct Stats {
    pub bytes_allocated: StatCount,
    pub pages_in_use: StatCount,
    pub alloc_calls: AtomicU64,
    pub free_calls: AtomicU64,
    pub splits: AtomicU64,
    pub coalesces: AtomicU64,
    pub pages_acquired: AtomicU64,
    pub pages_released: AtomicU64,
}

impl Stats {
    pub fn record_alloc(&self, block_bytes: usize) {
        self.bytes_allocated.update(block_bytes as i64);
        self.alloc_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_free(&self, block_bytes: usize) {
        self.bytes_allocated.update(-(block_bytes as i64));
        self.free_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_split(&self) {
        self.splits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_coalesce(&self) {
        self.coalesces.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_page_acquired(&self) {
        self.pages_in_use.update(1);
        self.pages_acquired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_page_released(&self) {
        self.pages_in_use.update(-1);
        self.pages_released.fetch_add(1, Ordering::Relaxed);
    }
}
