//! Record storage engines
//!
//! Three engines share one on-disk format and one set of record operations:
//!
//! - [`PagedBlobStorage`]: page cache, each page behind its own lock. An
//!   update holds its record's page for the whole write, relocation included.
//! - [`LockFreeBlobStorage`]: no lock spans a whole operation. Every page
//!   touch goes through the underlying storage, which serializes per page.
//! - [`MappedBlobStorage`]: memory-mapped file, single owner.
//!
//! The shared engines expose `&self` inherent methods and can be used from
//! many threads behind an `Arc`; all three implement [`BlobStorage`].

mod common;
pub mod content;
pub mod lock_free;
pub mod mapped;
pub mod paged;

pub use content::{RecordContent, WriteAction};
pub use lock_free::LockFreeBlobStorage;
pub use mapped::MappedBlobStorage;
pub use paged::PagedBlobStorage;

use crate::core::allocator::{RecordId, NULL_ID};
use crate::core::stats::StorageStats;
use crate::error::Result;

/// Options for [`BlobStorage::write_to_record`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOptions {
    /// Expected payload size, used to size the insert buffer
    pub size_hint: Option<usize>,
    /// On relocation, keep the old id as a forwarder to the new one
    pub leave_redirect: bool,
}

impl WriteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn size_hint(mut self, size_hint: usize) -> Self {
        self.size_hint = Some(size_hint);
        self
    }

    pub fn leave_redirect(mut self, leave_redirect: bool) -> Self {
        self.leave_redirect = leave_redirect;
        self
    }
}

/// A record visited by [`BlobStorage::for_each`]
#[derive(Debug, Clone, Copy)]
pub struct ScannedRecord<'a> {
    pub id: RecordId,
    pub capacity: usize,
    /// Payload length, or -1 for a moved or deleted record
    pub length: i32,
    /// Empty for moved or deleted records
    pub payload: &'a [u8],
}

impl ScannedRecord<'_> {
    pub fn is_actual(&self) -> bool {
        self.length >= 0
    }
}

/// Record-level storage operations
pub trait BlobStorage {
    fn storage_version(&self) -> Result<u32>;

    /// Opaque client-defined version stored in the header
    fn data_format_version(&self) -> Result<u32>;

    fn set_data_format_version(&mut self, version: u32) -> Result<()>;

    /// True if `id` resolves (through redirects) to a live record
    fn has_record(&self, id: RecordId) -> Result<bool> {
        Ok(self.resolve_record(id)?.is_some())
    }

    /// Id of the live record `id` resolves to, following redirects
    fn resolve_record(&self, id: RecordId) -> Result<Option<RecordId>>;

    /// Run `reader` over the payload of record `id`
    fn read_record<T, F>(&self, id: RecordId, reader: F) -> Result<T>
    where
        F: FnOnce(&[u8]) -> T,
    {
        self.read_record_resolved(id, reader).map(|(value, _)| value)
    }

    /// Like [`read_record`](Self::read_record), also returning the id the
    /// payload was actually found at
    fn read_record_resolved<T, F>(&self, id: RecordId, reader: F) -> Result<(T, RecordId)>
    where
        F: FnOnce(&[u8]) -> T;

    /// Insert (`id == NULL_ID`) or update a record through `writer`
    ///
    /// Returns the id now holding the content: a new id on insert or
    /// relocation, `id` itself for in-place updates, and `NULL_ID` for an
    /// insert the writer declined.
    fn write_to_record<W>(&mut self, id: RecordId, writer: W, options: WriteOptions) -> Result<RecordId>
    where
        W: FnOnce(&mut RecordContent<'_>) -> WriteAction;

    fn delete_record(&mut self, id: RecordId) -> Result<()>;

    /// Visit every ACTUAL and MOVED record in file order until `processor`
    /// returns false. Returns the number of records visited.
    fn for_each<F>(&self, processor: F) -> Result<usize>
    where
        F: FnMut(&ScannedRecord<'_>) -> bool;

    fn live_records_count(&self) -> u32 {
        self.stats().live_records
    }

    fn stats(&self) -> StorageStats;

    fn size_in_bytes(&self) -> u64;

    fn is_dirty(&self) -> bool;

    /// Persist the header and flush everything to disk
    fn force(&mut self) -> Result<()>;

    /// Flush and release the storage. Idempotent.
    fn close(&mut self) -> Result<()>;

    /// Largest payload a single record can hold
    fn max_payload_supported(&self) -> usize;

    fn insert(&mut self, payload: &[u8]) -> Result<RecordId> {
        self.write_to_record(
            NULL_ID,
            |content| {
                content.replace(payload);
                WriteAction::Commit
            },
            WriteOptions::new().size_hint(payload.len()),
        )
    }

    /// Replace the payload of `id`
    fn update(&mut self, id: RecordId, payload: &[u8], leave_redirect: bool) -> Result<RecordId> {
        self.write_to_record(
            id,
            |content| {
                content.replace(payload);
                WriteAction::Commit
            },
            WriteOptions::new().leave_redirect(leave_redirect),
        )
    }

    fn read_to_vec(&self, id: RecordId) -> Result<Vec<u8>> {
        self.read_record(id, |payload| payload.to_vec())
    }
}
