//! Page-locked engine over a [`PageCache`]
//!
//! A write locks the page of the record it resolves to and keeps it locked
//! until the write is complete, relocation included. Relocation targets are
//! always appended after existing records, so a writer holding one page only
//! ever waits for pages further into the file.
//!
//! Writers and readers run while a page lock is held and must not call back
//! into the storage.

use crate::config::StorageConfig;
use crate::core::allocator::{RecordId, NULL_ID};
use crate::core::buffer_pool::ScratchPoolStats;
use crate::core::header::{FileStatus, HEADER_SIZE};
use crate::core::stats::StorageStats;
use crate::engine::common::{EngineCore, HeldPage, Resolved, WriteOutcome};
use crate::engine::{BlobStorage, RecordContent, ScannedRecord, WriteAction, WriteOptions};
use crate::error::{BlobStoreError, Result};
use crate::storage::{PageCache, PagedStorage};
use std::path::Path;
use tracing::{debug, info, warn};

/// Redirect hops followed before a chain is considered corrupt
pub const MAX_REDIRECTS: usize = 1024;

#[derive(Debug)]
pub struct PagedBlobStorage {
    pages: PageCache,
    core: EngineCore,
}

impl PagedBlobStorage {
    /// Open (or create) a storage file
    pub fn open<P: AsRef<Path>>(path: P, config: &StorageConfig) -> Result<Self> {
        config.validate()?;
        let pages = PageCache::open(path, config.page_size, config.byte_order)?
            .with_cache_limit(config.cache_pages);
        Self::with_pages(pages, config)
    }

    /// Storage with no backing file
    pub fn in_memory(config: &StorageConfig) -> Result<Self> {
        config.validate()?;
        Self::with_pages(
            PageCache::in_memory(config.page_size, config.byte_order),
            config,
        )
    }

    fn with_pages(pages: PageCache, config: &StorageConfig) -> Result<Self> {
        let core = EngineCore::open(&pages, pages.length(), config, MAX_REDIRECTS)?;
        let storage = PagedBlobStorage { pages, core };
        // on disk the file stays "opened" until the next force or close
        storage.write_header(FileStatus::Opened)?;
        storage.pages.flush()?;
        Ok(storage)
    }

    fn write_header(&self, status: FileStatus) -> Result<()> {
        let bytes = self.core.header_bytes(status);
        self.pages
            .with_page_mut(0, |page| page[..HEADER_SIZE].copy_from_slice(&bytes))?;
        self.pages.region_written(HEADER_SIZE as u64);
        Ok(())
    }

    pub fn path(&self) -> Option<&Path> {
        self.pages.path()
    }

    pub fn page_size(&self) -> usize {
        self.core.page_size()
    }

    /// Pages currently resident in the page cache
    pub fn cached_pages(&self) -> usize {
        self.pages.cached_pages()
    }

    pub fn scratch_stats(&self) -> ScratchPoolStats {
        self.core.scratch().stats()
    }

    pub fn storage_version(&self) -> Result<u32> {
        self.core.check_open()?;
        Ok(self.core.storage_version())
    }

    pub fn data_format_version(&self) -> Result<u32> {
        self.core.check_open()?;
        Ok(self.core.data_format_version())
    }

    pub fn set_data_format_version(&self, version: u32) -> Result<()> {
        self.core.check_open()?;
        self.core.set_data_format_version(version);
        self.write_header(self.core.session_status())
    }

    pub fn has_record(&self, id: RecordId) -> Result<bool> {
        Ok(self.resolve_record(id)?.is_some())
    }

    pub fn resolve_record(&self, id: RecordId) -> Result<Option<RecordId>> {
        self.core.resolve_record(&self.pages, id)
    }

    pub fn read_record<T, F>(&self, id: RecordId, reader: F) -> Result<T>
    where
        F: FnOnce(&[u8]) -> T,
    {
        self.read_record_resolved(id, reader).map(|(value, _)| value)
    }

    pub fn read_record_resolved<T, F>(&self, id: RecordId, reader: F) -> Result<(T, RecordId)>
    where
        F: FnOnce(&[u8]) -> T,
    {
        self.core.read_record(&self.pages, id, reader)
    }

    pub fn read_to_vec(&self, id: RecordId) -> Result<Vec<u8>> {
        self.read_record(id, |payload| payload.to_vec())
    }

    pub fn write_to_record<W>(&self, id: RecordId, writer: W, options: WriteOptions) -> Result<RecordId>
    where
        W: FnOnce(&mut RecordContent<'_>) -> WriteAction,
    {
        self.core.check_open()?;
        if id == NULL_ID {
            return self
                .core
                .insert_with(&mut HeldPage::new(&self.pages), writer, options);
        }
        self.core.check_record_id(id)?;

        let mut current = id;
        for hop in 0..self.core.max_redirects() {
            let position = self.core.position_of(current);
            let handle = self.pages.page(position.page)?;
            let mut page = handle.write();

            let record = match self.core.resolve(page.bytes(), position, current, hop > 0)? {
                Resolved::Actual(record) => record,
                Resolved::Redirect(next) => {
                    current = next;
                    continue;
                }
                Resolved::Deleted => return Err(BlobStoreError::RecordDeleted(current)),
            };

            return match self
                .core
                .update_in_place(page.bytes_mut(), position, record, writer)?
            {
                WriteOutcome::Unchanged => Ok(current),
                WriteOutcome::Updated { end } => {
                    self.pages.region_written(end);
                    Ok(current)
                }
                WriteOutcome::Relocate {
                    record,
                    payload,
                    capacity,
                } => {
                    let mut sink = HeldPage::holding(&self.pages, position.page, page.bytes_mut());
                    self.core.relocate(
                        &mut sink,
                        current,
                        position,
                        record,
                        &payload,
                        capacity,
                        options.leave_redirect,
                    )
                }
            };
        }
        Err(self.core.chain_too_long(id))
    }

    pub fn insert(&self, payload: &[u8]) -> Result<RecordId> {
        self.write_to_record(
            NULL_ID,
            |content| {
                content.replace(payload);
                WriteAction::Commit
            },
            WriteOptions::new().size_hint(payload.len()),
        )
    }

    pub fn update(&self, id: RecordId, payload: &[u8], leave_redirect: bool) -> Result<RecordId> {
        self.write_to_record(
            id,
            |content| {
                content.replace(payload);
                WriteAction::Commit
            },
            WriteOptions::new().leave_redirect(leave_redirect),
        )
    }

    /// Tombstone exactly the record at `id`; redirects are not followed
    pub fn delete_record(&self, id: RecordId) -> Result<()> {
        self.core.check_open()?;
        self.core.check_record_id(id)?;
        let position = self.core.position_of(id);
        let end = self
            .pages
            .with_page_mut(position.page, |page| {
                self.core.delete_in_page(page, position, id)
            })??;
        self.pages.region_written(end);
        Ok(())
    }

    pub fn for_each<F>(&self, processor: F) -> Result<usize>
    where
        F: FnMut(&ScannedRecord<'_>) -> bool,
    {
        self.core.for_each(&self.pages, processor)
    }

    pub fn live_records_count(&self) -> u32 {
        self.core.stats().live_records
    }

    pub fn stats(&self) -> StorageStats {
        self.core.stats()
    }

    pub fn size_in_bytes(&self) -> u64 {
        self.pages.length()
    }

    pub fn is_dirty(&self) -> bool {
        self.pages.is_dirty()
    }

    pub fn max_payload_supported(&self) -> usize {
        self.core.max_payload()
    }

    /// Write the header and flush every dirty page
    pub fn force(&self) -> Result<()> {
        self.core.check_open()?;
        self.write_header(self.core.closing_status())?;
        self.pages.flush()?;
        debug!(length = self.pages.length(), "forced blob storage");
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        if !self.core.begin_close() {
            return Ok(());
        }
        self.write_header(self.core.closing_status())?;
        self.pages.close()?;
        info!(
            length = self.pages.length(),
            live_records = self.core.stats().live_records,
            corrupted = self.core.is_corrupted(),
            "closed blob storage"
        );
        Ok(())
    }
}

impl BlobStorage for PagedBlobStorage {
    fn storage_version(&self) -> Result<u32> {
        PagedBlobStorage::storage_version(self)
    }

    fn data_format_version(&self) -> Result<u32> {
        PagedBlobStorage::data_format_version(self)
    }

    fn set_data_format_version(&mut self, version: u32) -> Result<()> {
        PagedBlobStorage::set_data_format_version(self, version)
    }

    fn resolve_record(&self, id: RecordId) -> Result<Option<RecordId>> {
        PagedBlobStorage::resolve_record(self, id)
    }

    fn read_record_resolved<T, F>(&self, id: RecordId, reader: F) -> Result<(T, RecordId)>
    where
        F: FnOnce(&[u8]) -> T,
    {
        PagedBlobStorage::read_record_resolved(self, id, reader)
    }

    fn write_to_record<W>(&mut self, id: RecordId, writer: W, options: WriteOptions) -> Result<RecordId>
    where
        W: FnOnce(&mut RecordContent<'_>) -> WriteAction,
    {
        PagedBlobStorage::write_to_record(self, id, writer, options)
    }

    fn delete_record(&mut self, id: RecordId) -> Result<()> {
        PagedBlobStorage::delete_record(self, id)
    }

    fn for_each<F>(&self, processor: F) -> Result<usize>
    where
        F: FnMut(&ScannedRecord<'_>) -> bool,
    {
        PagedBlobStorage::for_each(self, processor)
    }

    fn stats(&self) -> StorageStats {
        PagedBlobStorage::stats(self)
    }

    fn size_in_bytes(&self) -> u64 {
        PagedBlobStorage::size_in_bytes(self)
    }

    fn is_dirty(&self) -> bool {
        PagedBlobStorage::is_dirty(self)
    }

    fn force(&mut self) -> Result<()> {
        PagedBlobStorage::force(self)
    }

    fn close(&mut self) -> Result<()> {
        PagedBlobStorage::close(self)
    }

    fn max_payload_supported(&self) -> usize {
        PagedBlobStorage::max_payload_supported(self)
    }
}

impl Drop for PagedBlobStorage {
    fn drop(&mut self) {
        if let Err(err) = PagedBlobStorage::close(self) {
            warn!(error = %err, "failed to close blob storage on drop");
        }
    }
}
