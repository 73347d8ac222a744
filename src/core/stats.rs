//! Record lifecycle counters
//!
//! Counters are plain atomics updated next to the page mutations they
//! describe, without taking page locks. They are read-consistent, not
//! linearizable with individual record operations: monitoring data only.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Point-in-time counter snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageStats {
    pub records_allocated: u32,
    pub records_relocated: u32,
    pub records_deleted: u32,
    pub live_records: u32,
    pub live_payload_bytes: u64,
    pub live_capacity_bytes: u64,
}

impl StorageStats {
    /// Share of reserved capacity actually holding payload, as a percentage
    pub fn utilization(&self) -> f64 {
        if self.live_capacity_bytes == 0 {
            0.0
        } else {
            (self.live_payload_bytes as f64 / self.live_capacity_bytes as f64) * 100.0
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct StorageCounters {
    records_allocated: AtomicU32,
    records_relocated: AtomicU32,
    records_deleted: AtomicU32,
    live_payload_bytes: AtomicU64,
    live_capacity_bytes: AtomicU64,
}

fn add(counter: &AtomicU64, delta: usize) {
    counter.fetch_add(delta as u64, Ordering::Relaxed);
}

fn sub(counter: &AtomicU64, delta: usize) {
    counter.fetch_sub(delta as u64, Ordering::Relaxed);
}

impl StorageCounters {
    /// Counters restored from a persisted header
    pub fn restore(stats: StorageStats) -> Self {
        StorageCounters {
            records_allocated: AtomicU32::new(stats.records_allocated),
            records_relocated: AtomicU32::new(stats.records_relocated),
            records_deleted: AtomicU32::new(stats.records_deleted),
            live_payload_bytes: AtomicU64::new(stats.live_payload_bytes),
            live_capacity_bytes: AtomicU64::new(stats.live_capacity_bytes),
        }
    }

    pub fn record_allocated(&self, length: usize, capacity: usize) {
        self.records_allocated.fetch_add(1, Ordering::Relaxed);
        add(&self.live_payload_bytes, length);
        add(&self.live_capacity_bytes, capacity);
    }

    pub fn payload_resized(&self, old_length: usize, new_length: usize) {
        if new_length >= old_length {
            add(&self.live_payload_bytes, new_length - old_length);
        } else {
            sub(&self.live_payload_bytes, old_length - new_length);
        }
    }

    /// The old copy of a relocated record stops being live
    pub fn record_relocated(&self, old_length: usize, old_capacity: usize, leave_redirect: bool) {
        if leave_redirect {
            self.records_relocated.fetch_add(1, Ordering::Relaxed);
        } else {
            self.records_deleted.fetch_add(1, Ordering::Relaxed);
        }
        sub(&self.live_payload_bytes, old_length);
        sub(&self.live_capacity_bytes, old_capacity);
    }

    pub fn record_deleted(&self, length: usize, capacity: usize) {
        self.records_deleted.fetch_add(1, Ordering::Relaxed);
        sub(&self.live_payload_bytes, length);
        sub(&self.live_capacity_bytes, capacity);
    }

    pub fn snapshot(&self) -> StorageStats {
        let records_allocated = self.records_allocated.load(Ordering::Relaxed);
        let records_relocated = self.records_relocated.load(Ordering::Relaxed);
        let records_deleted = self.records_deleted.load(Ordering::Relaxed);
        StorageStats {
            records_allocated,
            records_relocated,
            records_deleted,
            live_records: records_allocated
                .saturating_sub(records_relocated)
                .saturating_sub(records_deleted),
            live_payload_bytes: self.live_payload_bytes.load(Ordering::Relaxed),
            live_capacity_bytes: self.live_capacity_bytes.load(Ordering::Relaxed),
        }
    }
}
