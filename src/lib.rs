//! # blobstore-rs - Page-Aligned Binary Blob Record Store
//!
//! `blobstore-rs` maps small integer record ids straight to variable-length
//! byte payloads inside a flat, paged file. There is no index: a record id
//! *is* the record's position in the file.
//!
//! - **Compact headers**: 2 bytes for records up to 254 bytes, 5 bytes up to 1 MiB
//! - **Growth in place** while the payload fits the record's capacity
//! - **Relocation** with optional forwarding, so old ids keep resolving
//! - **Deletion** with tombstones, and full-file scanning
//! - **Three engines** over one format: page-locked, lock-free-per-page and
//!   memory-mapped
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use blobstore_rs::{PagedBlobStorage, Result, StorageConfig};
//!
//! # fn main() -> Result<()> {
//! let storage = PagedBlobStorage::open("records.blob", &StorageConfig::default())?;
//!
//! let id = storage.insert(b"Hello, World!")?;
//! assert_eq!(storage.read_to_vec(id)?, b"Hello, World!");
//!
//! // Outgrowing the record moves it; the old id keeps forwarding
//! let moved = storage.update(id, &[0u8; 4096], true)?;
//! assert_eq!(storage.resolve_record(id)?, Some(moved));
//!
//! storage.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Writers
//!
//! ```rust,no_run
//! use blobstore_rs::{BlobStorage, MappedBlobStorage, Result, StorageConfig, WriteAction, WriteOptions, NULL_ID};
//!
//! # fn main() -> Result<()> {
//! let mut storage = MappedBlobStorage::open("records.mm", &StorageConfig::default())?;
//!
//! // Writers fill the record directly; returning Keep aborts the write
//! let id = storage.write_to_record(
//!     NULL_ID,
//!     |content| {
//!         content.extend_from_slice(b"header:");
//!         content.resize(64, b'.');
//!         WriteAction::Commit
//!     },
//!     WriteOptions::new().size_hint(64),
//! )?;
//!
//! let live = storage.for_each(|record| {
//!     println!("{} -> {} bytes", record.id, record.length);
//!     true
//! })?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod engine;
pub mod error;
pub mod storage;

pub use crate::config::{AllocationConfig, StorageConfig, DEFAULT_PAGE_SIZE};
pub use crate::core::{
    allocator::{RecordId, NULL_ID},
    header::{FileStatus, Header, HEADER_SIZE, STORAGE_VERSION},
    layout::{ByteOrder, RecordHeader, RecordKind, MAX_CAPACITY, MAX_LENGTH},
    stats::StorageStats,
    strategy::{DataLengthPlusFixedPercentStrategy, SpaceAllocationStrategy, WriterDecidesStrategy},
};
pub use crate::engine::{
    BlobStorage, LockFreeBlobStorage, MappedBlobStorage, PagedBlobStorage, RecordContent,
    ScannedRecord, WriteAction, WriteOptions,
};
pub use crate::error::{BlobStoreError, Result};
