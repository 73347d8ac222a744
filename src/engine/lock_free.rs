//! Engine over any [`PagedStorage`], driven purely through its closures
//!
//! The engine takes no locks of its own: every page touch is a
//! [`PagedStorage::with_page_mut`] call and relies on the storage's per-page
//! serialization. Redirect hops release the page before moving on. A write
//! runs entirely inside the closure of the page its record resolves to, so
//! a relocation places the new copy and the forwarder while that page is
//! still held, and a concurrent delete of the same record waits for it.
//! New records only ever land at or after the held page, so pages are
//! entered in ascending order.

use crate::config::StorageConfig;
use crate::core::allocator::{RecordId, NULL_ID};
use crate::core::header::{FileStatus, HEADER_SIZE};
use crate::core::stats::StorageStats;
use crate::engine::common::{EngineCore, HeldPage, Hop, Resolved, WriteOutcome};
use crate::engine::{BlobStorage, RecordContent, ScannedRecord, WriteAction, WriteOptions};
use crate::error::{BlobStoreError, Result};
use crate::storage::{PageCache, PagedStorage};
use std::path::Path;
use tracing::{debug, info, warn};

pub const MAX_REDIRECTS: usize = 256;

#[derive(Debug)]
pub struct LockFreeBlobStorage<S: PagedStorage = PageCache> {
    storage: S,
    core: EngineCore,
}

impl LockFreeBlobStorage<PageCache> {
    pub fn open<P: AsRef<Path>>(path: P, config: &StorageConfig) -> Result<Self> {
        config.validate()?;
        Self::new(
            PageCache::open(path, config.page_size, config.byte_order)?
                .with_cache_limit(config.cache_pages),
            config,
        )
    }

    pub fn in_memory(config: &StorageConfig) -> Result<Self> {
        config.validate()?;
        Self::new(
            PageCache::in_memory(config.page_size, config.byte_order),
            config,
        )
    }
}

impl<S: PagedStorage> LockFreeBlobStorage<S> {
    /// Run the engine over an already opened paged storage
    pub fn new(storage: S, config: &StorageConfig) -> Result<Self> {
        let core = EngineCore::open(&storage, storage.length(), config, MAX_REDIRECTS)?;
        let engine = LockFreeBlobStorage { storage, core };
        engine.write_header(FileStatus::Opened)?;
        engine.storage.flush()?;
        Ok(engine)
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    fn write_header(&self, status: FileStatus) -> Result<()> {
        let bytes = self.core.header_bytes(status);
        self.storage
            .with_page_mut(0, |page| page[..HEADER_SIZE].copy_from_slice(&bytes))?;
        self.storage.region_written(HEADER_SIZE as u64);
        Ok(())
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
        self.core.resolve_record(&self.storage, id)
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
        self.core.read_record(&self.storage, id, reader)
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
                .insert_with(&mut HeldPage::new(&self.storage), writer, options);
        }
        self.core.check_record_id(id)?;

        let core = &self.core;
        let storage = &self.storage;
        let leave_redirect = options.leave_redirect;
        let mut writer = writer;
        let mut current = id;
        for hop in 0..core.max_redirects() {
            let position = core.position_of(current);
            let step = storage.with_page_mut(
                position.page,
                move |page| -> Result<Hop<RecordId, W>> {
                    let record = match core.resolve(page, position, current, hop > 0)? {
                        Resolved::Actual(record) => record,
                        Resolved::Redirect(next) => return Ok(Hop::Next(writer, next)),
                        Resolved::Deleted => return Err(BlobStoreError::RecordDeleted(current)),
                    };

                    match core.update_in_place(page, position, record, writer)? {
                        WriteOutcome::Unchanged => Ok(Hop::Done(current)),
                        WriteOutcome::Updated { end } => {
                            storage.region_written(end);
                            Ok(Hop::Done(current))
                        }
                        WriteOutcome::Relocate {
                            record,
                            payload,
                            capacity,
                        } => {
                            // the new copy and the forwarder are written before
                            // this page is released
                            let mut sink = HeldPage::holding(storage, position.page, page);
                            core.relocate(
                                &mut sink,
                                current,
                                position,
                                record,
                                &payload,
                                capacity,
                                leave_redirect,
                            )
                            .map(Hop::Done)
                        }
                    }
                },
            )??;

            match step {
                Hop::Done(written) => return Ok(written),
                Hop::Next(returned, next) => {
                    writer = returned;
                    current = next;
                }
            }
        }
        Err(core.chain_too_long(id))
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
        let end = self.storage.with_page_mut(position.page, |page| {
            self.core.delete_in_page(page, position, id)
        })??;
        self.storage.region_written(end);
        Ok(())
    }

    pub fn for_each<F>(&self, processor: F) -> Result<usize>
    where
        F: FnMut(&ScannedRecord<'_>) -> bool,
    {
        self.core.for_each(&self.storage, processor)
    }

    pub fn live_records_count(&self) -> u32 {
        self.core.stats().live_records
    }

    pub fn stats(&self) -> StorageStats {
        self.core.stats()
    }

    pub fn size_in_bytes(&self) -> u64 {
        self.storage.length()
    }

    pub fn is_dirty(&self) -> bool {
        self.storage.is_dirty()
    }

    pub fn max_payload_supported(&self) -> usize {
        self.core.max_payload()
    }

    pub fn force(&self) -> Result<()> {
        self.core.check_open()?;
        self.write_header(self.core.closing_status())?;
        self.storage.flush()?;
        debug!(length = self.storage.length(), "forced blob storage");
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        if !self.core.begin_close() {
            return Ok(());
        }
        self.write_header(self.core.closing_status())?;
        self.storage.close()?;
        info!(
            length = self.storage.length(),
            live_records = self.core.stats().live_records,
            corrupted = self.core.is_corrupted(),
            "closed blob storage"
        );
        Ok(())
    }
}

impl<S: PagedStorage> BlobStorage for LockFreeBlobStorage<S> {
    fn storage_version(&self) -> Result<u32> {
        LockFreeBlobStorage::storage_version(self)
    }

    fn data_format_version(&self) -> Result<u32> {
        LockFreeBlobStorage::data_format_version(self)
    }

    fn set_data_format_version(&mut self, version: u32) -> Result<()> {
        LockFreeBlobStorage::set_data_format_version(self, version)
    }

    fn resolve_record(&self, id: RecordId) -> Result<Option<RecordId>> {
        LockFreeBlobStorage::resolve_record(self, id)
    }

    fn read_record_resolved<T, F>(&self, id: RecordId, reader: F) -> Result<(T, RecordId)>
    where
        F: FnOnce(&[u8]) -> T,
    {
        LockFreeBlobStorage::read_record_resolved(self, id, reader)
    }

    fn write_to_record<W>(&mut self, id: RecordId, writer: W, options: WriteOptions) -> Result<RecordId>
    where
        W: FnOnce(&mut RecordContent<'_>) -> WriteAction,
    {
        LockFreeBlobStorage::write_to_record(self, id, writer, options)
    }

    fn delete_record(&mut self, id: RecordId) -> Result<()> {
        LockFreeBlobStorage::delete_record(self, id)
    }

    fn for_each<F>(&self, processor: F) -> Result<usize>
    where
        F: FnMut(&ScannedRecord<'_>) -> bool,
    {
        LockFreeBlobStorage::for_each(self, processor)
    }

    fn stats(&self) -> StorageStats {
        LockFreeBlobStorage::stats(self)
    }

    fn size_in_bytes(&self) -> u64 {
        LockFreeBlobStorage::size_in_bytes(self)
    }

    fn is_dirty(&self) -> bool {
        LockFreeBlobStorage::is_dirty(self)
    }

    fn force(&mut self) -> Result<()> {
        LockFreeBlobStorage::force(self)
    }

    fn close(&mut self) -> Result<()> {
        LockFreeBlobStorage::close(self)
    }

    fn max_payload_supported(&self) -> usize {
        LockFreeBlobStorage::max_payload_supported(self)
    }
}

impl<S: PagedStorage> Drop for LockFreeBlobStorage<S> {
    fn drop(&mut self) {
        if let Err(err) = LockFreeBlobStorage::close(self) {
            warn!(error = %err, "failed to close blob storage on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::layout::{ByteOrder, RecordHeader};
    use crate::storage::PageRead;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::Duration;

    /// Page cache that, once armed, starts a reader of page 0 the first time
    /// the engine writes any later page, and notes whether that reader was
    /// still waiting when the write went ahead
    #[derive(Debug)]
    struct WatchedPages {
        inner: Arc<PageCache>,
        armed: AtomicBool,
        page0_read: Arc<AtomicBool>,
        reader_waited: AtomicBool,
        reader: Mutex<Option<thread::JoinHandle<Vec<u8>>>>,
    }

    impl WatchedPages {
        fn new(page_size: usize) -> Self {
            WatchedPages {
                inner: Arc::new(PageCache::in_memory(page_size, ByteOrder::Little)),
                armed: AtomicBool::new(false),
                page0_read: Arc::new(AtomicBool::new(false)),
                reader_waited: AtomicBool::new(false),
                reader: Mutex::new(None),
            }
        }
    }

    impl PageRead for WatchedPages {
        fn page_size(&self) -> usize {
            self.inner.page_size()
        }

        fn byte_order(&self) -> ByteOrder {
            self.inner.byte_order()
        }

        fn with_page<R>(&self, index: u64, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
            self.inner.with_page(index, f)
        }
    }

    impl PagedStorage for WatchedPages {
        fn with_page_mut<R>(&self, index: u64, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
            if index > 0 && self.armed.swap(false, Ordering::AcqRel) {
                let inner = Arc::clone(&self.inner);
                let page0_read = Arc::clone(&self.page0_read);
                *self.reader.lock() = Some(thread::spawn(move || {
                    let head = inner
                        .with_page(0, |page| page[HEADER_SIZE..HEADER_SIZE + 8].to_vec())
                        .unwrap();
                    page0_read.store(true, Ordering::Release);
                    head
                }));
                thread::sleep(Duration::from_millis(100));
                self.reader_waited
                    .store(!self.page0_read.load(Ordering::Acquire), Ordering::Release);
            }
            self.inner.with_page_mut(index, f)
        }

        fn length(&self) -> u64 {
            self.inner.length()
        }

        fn region_written(&self, end_offset: u64) {
            self.inner.region_written(end_offset)
        }

        fn is_dirty(&self) -> bool {
            self.inner.is_dirty()
        }

        fn flush(&self) -> Result<()> {
            self.inner.flush()
        }

        fn close(&self) -> Result<()> {
            self.inner.close()
        }
    }

    fn storage() -> LockFreeBlobStorage {
        LockFreeBlobStorage::in_memory(&StorageConfig::new().with_page_size(4096)).unwrap()
    }

    #[test]
    fn test_runs_over_caller_supplied_storage() {
        let pages = PageCache::in_memory(4096, crate::core::layout::ByteOrder::Little);
        let storage = LockFreeBlobStorage::new(pages, &StorageConfig::new().with_page_size(4096))
            .unwrap();
        let id = storage.insert(b"abc").unwrap();
        assert_eq!(storage.read_to_vec(id).unwrap(), b"abc");
        assert!(storage.storage().cached_pages() >= 1);
    }

    #[test]
    fn test_writer_follows_redirects() {
        let storage = storage();
        let id = storage.insert(&[1u8; 8]).unwrap();
        let moved = storage.update(id, &[2u8; 600], true).unwrap();
        assert_ne!(moved, id);

        // writing through the old id reaches the relocated record
        let written = storage
            .write_to_record(
                id,
                |content| {
                    content.as_mut_slice()[0] = 9;
                    WriteAction::Commit
                },
                WriteOptions::new(),
            )
            .unwrap();
        assert_eq!(written, moved);
        assert_eq!(storage.read_record(id, |payload| payload[0]).unwrap(), 9);
    }

    #[test]
    fn test_write_through_tombstone_fails() {
        let storage = storage();
        let id = storage.insert(b"gone").unwrap();
        storage.delete_record(id).unwrap();
        assert!(matches!(
            storage.update(id, b"back", false),
            Err(BlobStoreError::RecordDeleted(_))
        ));
    }

    #[test]
    fn test_concurrent_updates_of_distinct_records() {
        let storage = Arc::new(storage());
        let ids: Vec<RecordId> = (0..8u8).map(|i| storage.insert(&[i; 4]).unwrap()).collect();

        let threads: Vec<_> = ids
            .iter()
            .copied()
            .enumerate()
            .map(|(i, id)| {
                let storage = Arc::clone(&storage);
                thread::spawn(move || {
                    for round in 1..=20usize {
                        storage
                            .update(id, &vec![i as u8; 4 + round * 16], true)
                            .unwrap();
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        for (i, id) in ids.into_iter().enumerate() {
            let payload = storage.read_to_vec(id).unwrap();
            assert_eq!(payload, vec![i as u8; 4 + 20 * 16]);
        }
        assert_eq!(storage.live_records_count(), 8);
    }

    #[test]
    fn test_relocation_keeps_source_page_until_forwarded() {
        let config = StorageConfig::new().with_page_size(4096);
        let storage = LockFreeBlobStorage::new(WatchedPages::new(4096), &config).unwrap();
        let id = storage.insert(&[1u8; 16]).unwrap();
        // fills the rest of page 0, so the relocated copy lands further on
        storage.insert(&[2u8; 4000]).unwrap();

        storage.storage().armed.store(true, Ordering::Release);
        let moved = storage.update(id, &[9u8; 1000], true).unwrap();
        assert!(!storage.storage().armed.load(Ordering::Acquire));
        assert!(storage.storage().reader_waited.load(Ordering::Acquire));

        // the reader got page 0 only after the forwarder was in place
        let reader = storage.storage().reader.lock().take().unwrap();
        let head = reader.join().unwrap();
        assert!(matches!(
            RecordHeader::decode(&head, ByteOrder::Little),
            Ok(RecordHeader::Moved { redirect_to, .. }) if redirect_to == moved
        ));
        assert_eq!(storage.read_to_vec(id).unwrap(), vec![9u8; 1000]);
    }

    #[test]
    fn test_delete_racing_relocation_stays_deleted() {
        for _ in 0..50 {
            let storage = Arc::new(storage());
            let id = storage.insert(&[1u8; 16]).unwrap();
            let barrier = Arc::new(Barrier::new(2));

            let updater = {
                let storage = Arc::clone(&storage);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    storage.update(id, &[9u8; 1000], true)
                })
            };
            barrier.wait();
            let deleted = storage.delete_record(id);
            let updated = updater.join().unwrap();

            match updated {
                // relocated first: the delete tombstoned the forwarder
                Ok(_) => assert!(deleted.is_ok()),
                // deleted first: nothing moved
                Err(err) => assert!(matches!(err, BlobStoreError::RecordDeleted(_))),
            }
            assert_eq!(storage.resolve_record(id).unwrap(), None);

            let stats = storage.stats();
            assert!(stats.live_payload_bytes <= stats.live_capacity_bytes);
            assert_eq!(
                stats.live_records,
                stats.records_allocated - stats.records_relocated - stats.records_deleted
            );
        }
    }
}
