//! On-disk format and the pieces of the engine that don't touch pages:
//! record layout, header block, addressing and allocation, capacity
//! strategies, counters and scratch buffers.

pub mod allocator;
pub mod buffer_pool;
pub mod header;
pub mod layout;
pub mod stats;
pub mod strategy;
