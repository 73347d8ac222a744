//! Space allocation strategies
//!
//! A strategy decides how much payload capacity a new (or relocated) record
//! reserves, given the length actually written and the capacity of the buffer
//! the writer produced it in.

use crate::core::layout::MAX_CAPACITY;
use crate::error::{BlobStoreError, Result};
use std::fmt;

/// Capacity policy for newly allocated records
pub trait SpaceAllocationStrategy: fmt::Debug + fmt::Display + Send + Sync {
    /// Scratch buffer size used when the caller gives no size hint
    fn default_capacity(&self) -> usize;

    /// Capacity to reserve for `actual_length` bytes written into a buffer of
    /// `current_capacity` bytes. Never below `actual_length`, never above
    /// [`MAX_CAPACITY`].
    fn capacity(&self, actual_length: usize, current_capacity: usize) -> Result<usize>;
}

fn check_arguments(actual_length: usize, current_capacity: usize) -> Result<()> {
    if actual_length > MAX_CAPACITY {
        return Err(BlobStoreError::LengthOutOfRange {
            length: actual_length,
            max: MAX_CAPACITY,
        });
    }
    if current_capacity < actual_length {
        return Err(BlobStoreError::CapacityBelowLength {
            capacity: current_capacity,
            length: actual_length,
        });
    }
    Ok(())
}

/// Reserve exactly what the writer's buffer held
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterDecidesStrategy {
    default_capacity: usize,
}

impl WriterDecidesStrategy {
    pub fn new(default_capacity: usize) -> Result<Self> {
        if default_capacity == 0 || default_capacity > MAX_CAPACITY {
            return Err(BlobStoreError::InvalidConfig(format!(
                "default_capacity ({}) must be in [1, {}]",
                default_capacity, MAX_CAPACITY
            )));
        }
        Ok(Self { default_capacity })
    }
}

impl SpaceAllocationStrategy for WriterDecidesStrategy {
    fn default_capacity(&self) -> usize {
        self.default_capacity
    }

    fn capacity(&self, actual_length: usize, current_capacity: usize) -> Result<usize> {
        check_arguments(actual_length, current_capacity)?;
        Ok(current_capacity.min(MAX_CAPACITY))
    }
}

impl fmt::Display for WriterDecidesStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WriterDecides{{default: {}}}", self.default_capacity)
    }
}

/// Reserve the written length plus a fixed percentage, with a floor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataLengthPlusFixedPercentStrategy {
    default_capacity: usize,
    min_capacity: usize,
    percent_on_top: usize,
}

impl DataLengthPlusFixedPercentStrategy {
    pub fn new(default_capacity: usize, min_capacity: usize, percent_on_top: usize) -> Result<Self> {
        if default_capacity == 0 || default_capacity > MAX_CAPACITY {
            return Err(BlobStoreError::InvalidConfig(format!(
                "default_capacity ({}) must be in [1, {}]",
                default_capacity, MAX_CAPACITY
            )));
        }
        if min_capacity == 0 || min_capacity > default_capacity {
            return Err(BlobStoreError::InvalidConfig(format!(
                "min_capacity ({}) must be in [1, default_capacity ({})]",
                min_capacity, default_capacity
            )));
        }
        Ok(Self {
            default_capacity,
            min_capacity,
            percent_on_top,
        })
    }
}

impl SpaceAllocationStrategy for DataLengthPlusFixedPercentStrategy {
    fn default_capacity(&self) -> usize {
        self.default_capacity
    }

    fn capacity(&self, actual_length: usize, current_capacity: usize) -> Result<usize> {
        check_arguments(actual_length, current_capacity)?;
        // ceil(length * (1 + pct/100)) in integer arithmetic
        let extra = (actual_length as u64 * self.percent_on_top as u64).div_ceil(100);
        let advised = (actual_length as u64 + extra).max(self.min_capacity as u64);
        Ok(advised.min(MAX_CAPACITY as u64) as usize)
    }
}

impl fmt::Display for DataLengthPlusFixedPercentStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DataLengthPlusFixedPercent{{length + {}%, min: {}, default: {}}}",
            self.percent_on_top, self.min_capacity, self.default_capacity
        )
    }
}
