//! Scratch buffer pool for record inserts
//!
//! New record content is first written into a scratch buffer, because its
//! final size (and therefore its slot) is unknown until the writer finishes.
//! Buffers are borrowed from a bounded lock-free queue and handed back after
//! the record is placed. Buffers that grew far beyond the default size are
//! dropped instead of being pooled.

use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicU64, Ordering};

/// Scratch pool statistics
#[derive(Debug, Clone, Copy)]
pub struct ScratchPoolStats {
    /// Acquisitions served from the pool
    pub hits: u64,
    /// Acquisitions that had to allocate
    pub misses: u64,
    /// Buffers currently pooled
    pub pooled: usize,
    /// Maximum number of pooled buffers
    pub capacity: usize,
}

impl ScratchPoolStats {
    /// Calculate hit rate as a percentage
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

/// Bounded pool of reusable byte buffers
#[derive(Debug)]
pub struct ScratchPool {
    buffers: ArrayQueue<Vec<u8>>,
    default_size: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ScratchPool {
    /// Create a pool holding at most `capacity` idle buffers of `default_size` bytes
    pub fn new(capacity: usize, default_size: usize) -> Self {
        ScratchPool {
            buffers: ArrayQueue::new(capacity.max(1)),
            default_size,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn default_size(&self) -> usize {
        self.default_size
    }

    /// Borrow a buffer of exactly `max(default_size, size_hint)` bytes
    ///
    /// Contents are unspecified.
    pub fn acquire(&self, size_hint: Option<usize>) -> Vec<u8> {
        let wanted = self.default_size.max(size_hint.unwrap_or(0));
        if let Some(mut buffer) = self.buffers.pop() {
            if buffer.capacity() >= wanted {
                self.hits.fetch_add(1, Ordering::Relaxed);
                buffer.resize(wanted, 0);
                return buffer;
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        vec![0u8; wanted]
    }

    /// Return a buffer to the pool
    pub fn release(&self, buffer: Vec<u8>) {
        if buffer.capacity() <= self.default_size * 2 {
            // Full pool: the buffer is simply dropped
            let _ = self.buffers.push(buffer);
        }
    }

    pub fn stats(&self) -> ScratchPoolStats {
        ScratchPoolStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            pooled: self.buffers.len(),
            capacity: self.buffers.capacity(),
        }
    }
}
