//! Record operations shared by the engines
//!
//! [`EngineCore`] owns everything that is not page access: header state,
//! the allocator, counters, the capacity strategy and the scratch pool. The
//! engines differ only in how they hand pages to it.
//!
//! Redirect chains are followed with a bounded loop. Read closures cannot
//! run more than once, so a page visit that lands on a MOVED record gives
//! the closure back ([`Hop::Next`]) and the loop carries it to the next page.

use crate::config::StorageConfig;
use crate::core::allocator::{
    Addressing, PagePosition, PaddingRegion, RecordAllocator, RecordId, NULL_ID,
};
use crate::core::buffer_pool::ScratchPool;
use crate::core::header::{FileStatus, Header, HEADER_SIZE};
use crate::core::layout::{
    put_length, put_redirect_to, ActualRecord, ByteOrder, RecordHeader, RecordKind, SizeClass,
    LARGE_HEADER_SIZE, MAX_CAPACITY, MAX_LENGTH, MOVED_HEADER_SIZE, PADDING_HEADER_SIZE,
};
use crate::core::stats::{StorageCounters, StorageStats};
use crate::core::strategy::SpaceAllocationStrategy;
use crate::engine::content::{RecordContent, WriteAction, Written};
use crate::engine::{ScannedRecord, WriteOptions};
use crate::error::{BlobStoreError, Result};
use crate::storage::{MappedFile, PageRead, PagedStorage};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tracing::{debug, error, info, trace};

/// Mutable page access used by the write paths
pub(crate) trait PageSink {
    fn with_page_mut<R>(&mut self, index: u64, f: impl FnOnce(&mut [u8]) -> Result<R>) -> Result<R>;

    fn region_written(&mut self, end_offset: u64);
}

/// Shared storage, optionally with one page already locked by the caller
///
/// Writes to the held page go straight to it; anything else goes through
/// the storage's own locking.
pub(crate) struct HeldPage<'a, S: PagedStorage> {
    storage: &'a S,
    held: Option<(u64, &'a mut [u8])>,
}

impl<'a, S: PagedStorage> HeldPage<'a, S> {
    pub fn new(storage: &'a S) -> Self {
        HeldPage {
            storage,
            held: None,
        }
    }

    pub fn holding(storage: &'a S, index: u64, page: &'a mut [u8]) -> Self {
        HeldPage {
            storage,
            held: Some((index, page)),
        }
    }
}

impl<S: PagedStorage> PageSink for HeldPage<'_, S> {
    fn with_page_mut<R>(&mut self, index: u64, f: impl FnOnce(&mut [u8]) -> Result<R>) -> Result<R> {
        if let Some((held_index, page)) = self.held.as_mut() {
            if *held_index == index {
                return f(&mut page[..]);
            }
        }
        self.storage.with_page_mut(index, f)?
    }

    fn region_written(&mut self, end_offset: u64) {
        self.storage.region_written(end_offset);
    }
}

impl PageSink for MappedFile {
    fn with_page_mut<R>(&mut self, index: u64, f: impl FnOnce(&mut [u8]) -> Result<R>) -> Result<R> {
        f(self.page_mut(index)?)
    }

    fn region_written(&mut self, end_offset: u64) {
        MappedFile::region_written(self, end_offset);
    }
}

/// Where a record id leads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Resolved {
    Actual(ActualRecord),
    Redirect(RecordId),
    Deleted,
}

/// One step of a redirect walk
pub(crate) enum Hop<T, C> {
    Done(T),
    Next(C, RecordId),
}

/// Result of running a writer over an existing record
#[derive(Debug)]
pub(crate) enum WriteOutcome {
    Unchanged,
    /// Updated in place; bytes up to `end` now hold data
    Updated { end: u64 },
    /// Content outgrew the record and must move
    Relocate {
        record: ActualRecord,
        payload: Vec<u8>,
        capacity: usize,
    },
}

#[derive(Debug)]
pub(crate) struct EngineCore {
    page_size: usize,
    byte_order: ByteOrder,
    allocator: RecordAllocator,
    counters: StorageCounters,
    strategy: Box<dyn SpaceAllocationStrategy>,
    scratch: ScratchPool,
    max_redirects: usize,
    max_payload: usize,
    storage_version: u32,
    data_format_version: AtomicU32,
    corrupted: AtomicBool,
    closed: AtomicBool,
}

impl EngineCore {
    /// Read and check the header of `pages`, or start a fresh storage when
    /// `length` is zero
    pub fn open<P: PageRead>(
        pages: &P,
        length: u64,
        config: &StorageConfig,
        max_redirects: usize,
    ) -> Result<Self> {
        config.validate()?;
        if pages.page_size() != config.page_size || pages.byte_order() != config.byte_order {
            return Err(BlobStoreError::InvalidConfig(format!(
                "storage opened with page_size {} / {:?}, config asks for {} / {:?}",
                pages.page_size(),
                pages.byte_order(),
                config.page_size,
                config.byte_order
            )));
        }

        let page_size = config.page_size;
        let byte_order = config.byte_order;
        let addressing = Addressing::new(HEADER_SIZE);

        if length > addressing.max_file_length() {
            return Err(BlobStoreError::FileTooLarge {
                length,
                max: addressing.max_file_length(),
            });
        }

        let header = if length == 0 {
            Header::new(page_size as u32, addressing.first_record_id())
        } else if length < HEADER_SIZE as u64 {
            return Err(BlobStoreError::TruncatedHeader(length as usize));
        } else {
            let header =
                pages.with_page(0, |page| Header::from_bytes(&page[..HEADER_SIZE], byte_order))??;
            header.check_openable(page_size)?;
            header
        };

        let strategy = config.allocation.build()?;
        let scratch = ScratchPool::new(config.scratch_buffers, strategy.default_capacity());
        let core = EngineCore {
            page_size,
            byte_order,
            allocator: RecordAllocator::new(addressing, page_size, header.next_record_id),
            counters: StorageCounters::restore(header.stats()),
            strategy,
            scratch,
            max_redirects,
            max_payload: (page_size - LARGE_HEADER_SIZE).min(MAX_CAPACITY),
            storage_version: header.storage_version,
            data_format_version: AtomicU32::new(header.data_format_version),
            corrupted: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        };

        info!(
            page_size,
            next_record_id = header.next_record_id,
            live_records = core.counters.snapshot().live_records,
            strategy = %core.strategy,
            "opened blob storage"
        );
        Ok(core)
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    pub fn max_redirects(&self) -> usize {
        self.max_redirects
    }

    pub fn storage_version(&self) -> u32 {
        self.storage_version
    }

    pub fn data_format_version(&self) -> u32 {
        self.data_format_version.load(Ordering::Acquire)
    }

    pub fn set_data_format_version(&self, version: u32) {
        self.data_format_version.store(version, Ordering::Release);
    }

    pub fn stats(&self) -> StorageStats {
        self.counters.snapshot()
    }

    pub fn scratch(&self) -> &ScratchPool {
        &self.scratch
    }

    /// Header bytes reflecting the in-memory state
    pub fn header_bytes(&self, status: FileStatus) -> [u8; HEADER_SIZE] {
        let mut header = Header::new(self.page_size as u32, self.allocator.next_record_id());
        header.status = status;
        header.set_stats(self.counters.snapshot());
        header.data_format_version = self.data_format_version();
        header.to_bytes(self.byte_order)
    }

    /// Status to persist while the storage is open
    pub fn session_status(&self) -> FileStatus {
        if self.corrupted.load(Ordering::Acquire) {
            FileStatus::Corrupted
        } else {
            FileStatus::Opened
        }
    }

    /// Status to persist on force or close
    pub fn closing_status(&self) -> FileStatus {
        if self.corrupted.load(Ordering::Acquire) {
            FileStatus::Corrupted
        } else {
            FileStatus::SafelyClosed
        }
    }

    pub fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BlobStoreError::Closed);
        }
        Ok(())
    }

    /// Mark closed; false if it already was
    pub fn begin_close(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    pub fn is_corrupted(&self) -> bool {
        self.corrupted.load(Ordering::Acquire)
    }

    /// Pass `err` through, flagging the storage as corrupted if it is an
    /// integrity failure
    pub fn integrity(&self, err: BlobStoreError) -> BlobStoreError {
        if err.is_corruption() && !self.corrupted.swap(true, Ordering::AcqRel) {
            error!(error = %err, "storage integrity violated, marking file corrupted");
        }
        err
    }

    pub fn check_record_id(&self, id: RecordId) -> Result<()> {
        if id == NULL_ID {
            return Err(BlobStoreError::InvalidRecordId(id));
        }
        let next_record_id = self.allocator.next_record_id();
        if id >= next_record_id {
            return Err(BlobStoreError::RecordNotAllocated {
                record_id: id,
                next_record_id,
            });
        }
        Ok(())
    }

    pub fn position_of(&self, id: RecordId) -> PagePosition {
        PagePosition::of(self.allocator.addressing().id_to_offset(id), self.page_size)
    }

    fn absolute(&self, position: PagePosition) -> u64 {
        position.page * self.page_size as u64 + position.offset as u64
    }

    /// Decode the header of record `id` at `position`
    ///
    /// `followed` is false when `id` came straight from the caller. A header
    /// that does not decode there means the id does not address a record,
    /// which is a usage error and leaves the file's integrity flag alone.
    fn decode_at(
        &self,
        page: &[u8],
        position: PagePosition,
        id: RecordId,
        followed: bool,
    ) -> Result<RecordHeader> {
        let decoded = RecordHeader::decode(&page[position.offset..], self.byte_order)
            .and_then(|header| {
                if position.offset + header.footprint() > self.page_size {
                    return Err(BlobStoreError::RecordCrossesPage {
                        offset: self.absolute(position),
                        footprint: header.footprint(),
                    });
                }
                Ok(header)
            });
        decoded.map_err(|err| self.classify(err, id, followed))
    }

    fn classify(&self, err: BlobStoreError, id: RecordId, followed: bool) -> BlobStoreError {
        if followed || !err.is_corruption() {
            return self.integrity(err);
        }
        debug!(id, error = %err, "record id does not address a record header");
        BlobStoreError::InvalidRecordId(id)
    }

    /// Decode the record at `position` (id `id`) and say where it leads.
    /// `followed` is true once `id` was reached through a redirect.
    pub fn resolve(
        &self,
        page: &[u8],
        position: PagePosition,
        id: RecordId,
        followed: bool,
    ) -> Result<Resolved> {
        match self.decode_at(page, position, id, followed)? {
            RecordHeader::Actual(record) => Ok(Resolved::Actual(record)),
            RecordHeader::Moved {
                redirect_to: NULL_ID,
                ..
            } => Ok(Resolved::Deleted),
            RecordHeader::Moved { redirect_to, .. } => {
                if self.allocator.is_allocated(redirect_to) {
                    Ok(Resolved::Redirect(redirect_to))
                } else {
                    Err(self.integrity(BlobStoreError::DanglingRedirect {
                        record_id: id,
                        redirect_to,
                    }))
                }
            }
            RecordHeader::Padding { .. } => Err(self.classify(
                BlobStoreError::UnexpectedRecordKind {
                    record_id: id,
                    kind: RecordKind::Padding,
                },
                id,
                followed,
            )),
        }
    }

    pub fn chain_too_long(&self, id: RecordId) -> BlobStoreError {
        self.integrity(BlobStoreError::RedirectChainTooLong {
            record_id: id,
            max_redirects: self.max_redirects,
        })
    }

    pub fn read_record<P, T, F>(&self, pages: &P, id: RecordId, reader: F) -> Result<(T, RecordId)>
    where
        P: PageRead,
        F: FnOnce(&[u8]) -> T,
    {
        self.check_open()?;
        self.check_record_id(id)?;

        let mut reader = reader;
        let mut current = id;
        for hop in 0..self.max_redirects {
            let position = self.position_of(current);
            let step = pages.with_page(position.page, move |page| -> Result<Hop<T, F>> {
                match self.resolve(page, position, current, hop > 0)? {
                    Resolved::Actual(record) => {
                        let start = position.offset + record.header_size();
                        Ok(Hop::Done(reader(&page[start..start + record.length])))
                    }
                    Resolved::Redirect(next) => Ok(Hop::Next(reader, next)),
                    Resolved::Deleted => Err(BlobStoreError::RecordDeleted(current)),
                }
            })??;

            match step {
                Hop::Done(value) => return Ok((value, current)),
                Hop::Next(returned, next) => {
                    reader = returned;
                    current = next;
                }
            }
        }
        Err(self.chain_too_long(id))
    }

    pub fn resolve_record<P: PageRead>(&self, pages: &P, id: RecordId) -> Result<Option<RecordId>> {
        self.check_open()?;
        if !self.allocator.is_allocated(id) {
            return Ok(None);
        }

        let mut current = id;
        for hop in 0..self.max_redirects {
            let position = self.position_of(current);
            let resolved = pages.with_page(position.page, |page| {
                self.resolve(page, position, current, hop > 0)
            })??;
            match resolved {
                Resolved::Actual(_) => return Ok(Some(current)),
                Resolved::Deleted => return Ok(None),
                Resolved::Redirect(next) => current = next,
            }
        }
        Err(self.chain_too_long(id))
    }

    pub fn for_each<P, F>(&self, pages: &P, mut processor: F) -> Result<usize>
    where
        P: PageRead,
        F: FnMut(&ScannedRecord<'_>) -> bool,
    {
        self.check_open()?;

        let addressing = self.allocator.addressing();
        let end = self.allocator.end_of_records();
        let mut offset = addressing.records_start();
        let mut visited = 0;

        while offset < end {
            let position = PagePosition::of(offset, self.page_size);
            let id = addressing.offset_to_id(offset)?;
            let (footprint, proceed) = pages.with_page(position.page, |page| -> Result<_> {
                let header = self.decode_at(page, position, id, true)?;
                let proceed = match header {
                    RecordHeader::Padding { .. } => None,
                    RecordHeader::Actual(record) => {
                        let start = position.offset + record.header_size();
                        Some(processor(&ScannedRecord {
                            id,
                            capacity: record.capacity,
                            length: record.length as i32,
                            payload: &page[start..start + record.length],
                        }))
                    }
                    RecordHeader::Moved { capacity, .. } => Some(processor(&ScannedRecord {
                        id,
                        capacity,
                        length: -1,
                        payload: &[],
                    })),
                };
                Ok((header.footprint(), proceed))
            })??;

            match proceed {
                Some(true) => visited += 1,
                Some(false) => return Ok(visited + 1),
                None => {}
            }
            offset += footprint as u64;
        }
        Ok(visited)
    }

    /// Size class and capacity for a new record holding `length` bytes
    fn plan_capacity(&self, length: usize, buffer_capacity: usize) -> Result<(SizeClass, usize)> {
        if length > MAX_LENGTH {
            return Err(BlobStoreError::LengthOutOfRange {
                length,
                max: MAX_LENGTH,
            });
        }
        if length > self.max_payload {
            return Err(BlobStoreError::RecordTooLargeForPage {
                size: length + LARGE_HEADER_SIZE,
                page_size: self.page_size,
            });
        }

        let requested = self.strategy.capacity(length, buffer_capacity.max(length))?;
        if requested < length {
            return Err(BlobStoreError::CapacityBelowLength {
                capacity: requested,
                length,
            });
        }
        let capacity = requested.min(self.max_payload);
        Ok((SizeClass::for_capacity(capacity), capacity))
    }

    fn write_padding<S: PageSink>(&self, sink: &mut S, padding: PaddingRegion) -> Result<()> {
        let header = RecordHeader::padding(padding.size - PADDING_HEADER_SIZE)?;
        let position = PagePosition::of(padding.offset, self.page_size);
        let order = self.byte_order;
        sink.with_page_mut(position.page, |page| {
            header.encode(&mut page[position.offset..], order)
        })?;
        sink.region_written(padding.offset + PADDING_HEADER_SIZE as u64);
        Ok(())
    }

    /// Allocate a record for `payload` and write it out
    pub fn insert_record<S: PageSink>(
        &self,
        sink: &mut S,
        payload: &[u8],
        buffer_capacity: usize,
    ) -> Result<RecordId> {
        let (size_class, capacity) = self.plan_capacity(payload.len(), buffer_capacity)?;
        let slot = self.allocator.allocate(size_class.header_size() + capacity)?;
        if let Some(padding) = slot.padding {
            self.write_padding(sink, padding)?;
        }

        let record = ActualRecord {
            size_class,
            capacity: slot.size - size_class.header_size(),
            length: payload.len(),
        };
        let header = RecordHeader::Actual(record);
        let position = PagePosition::of(slot.offset, self.page_size);
        let order = self.byte_order;
        sink.with_page_mut(position.page, |page| {
            let bytes = &mut page[position.offset..position.offset + slot.size];
            header.encode(bytes, order)?;
            bytes[record.header_size()..record.header_size() + payload.len()]
                .copy_from_slice(payload);
            Ok(())
        })?;
        sink.region_written(slot.offset + (record.header_size() + payload.len()) as u64);

        self.counters.record_allocated(record.length, record.capacity);
        trace!(
            id = slot.id,
            length = record.length,
            capacity = record.capacity,
            "inserted record"
        );
        Ok(slot.id)
    }

    /// Run `writer` over a scratch buffer and insert what it produced
    pub fn insert_with<S, W>(&self, sink: &mut S, writer: W, options: WriteOptions) -> Result<RecordId>
    where
        S: PageSink,
        W: FnOnce(&mut RecordContent<'_>) -> WriteAction,
    {
        self.check_open()?;
        let mut scratch = self.scratch.acquire(options.size_hint);
        let result = self.insert_from_scratch(sink, &mut scratch, writer);
        self.scratch.release(scratch);
        result
    }

    fn insert_from_scratch<S, W>(&self, sink: &mut S, scratch: &mut [u8], writer: W) -> Result<RecordId>
    where
        S: PageSink,
        W: FnOnce(&mut RecordContent<'_>) -> WriteAction,
    {
        let mut content = RecordContent::new(scratch, 0);
        if writer(&mut content) == WriteAction::Keep {
            return Ok(NULL_ID);
        }
        match content.finish() {
            Written::InPlace(length) => {
                let capacity = scratch.len();
                self.insert_record(sink, &scratch[..length], capacity)
            }
            Written::Spilled { data, capacity } => self.insert_record(sink, &data, capacity),
        }
    }

    /// Run `writer` over the payload region of `record`, which sits at
    /// `position` on `page`
    ///
    /// Unless the outcome is [`WriteOutcome::Updated`], the payload bytes are
    /// put back as they were: a writer that returns `Keep` or fails validation
    /// leaves no trace, and a record about to be relocated keeps its old
    /// content until the forwarder replaces it.
    pub fn update_in_place<W>(
        &self,
        page: &mut [u8],
        position: PagePosition,
        record: ActualRecord,
        writer: W,
    ) -> Result<WriteOutcome>
    where
        W: FnOnce(&mut RecordContent<'_>) -> WriteAction,
    {
        let start = position.offset + record.header_size();
        let mut saved = self.scratch.acquire(Some(record.length));
        saved[..record.length].copy_from_slice(&page[start..start + record.length]);

        let outcome = self.run_writer(page, position, record, writer);
        if !matches!(outcome, Ok(WriteOutcome::Updated { .. })) {
            page[start..start + record.length].copy_from_slice(&saved[..record.length]);
        }
        self.scratch.release(saved);
        outcome
    }

    fn run_writer<W>(
        &self,
        page: &mut [u8],
        position: PagePosition,
        record: ActualRecord,
        writer: W,
    ) -> Result<WriteOutcome>
    where
        W: FnOnce(&mut RecordContent<'_>) -> WriteAction,
    {
        let start = position.offset + record.header_size();
        let region = &mut page[start..start + record.capacity];
        let mut content = RecordContent::new(region, record.length);
        if writer(&mut content) == WriteAction::Keep {
            return Ok(WriteOutcome::Unchanged);
        }

        let length = match content.finish() {
            Written::InPlace(length) => length,
            Written::Spilled { data, .. } if data.len() <= record.capacity => {
                page[start..start + data.len()].copy_from_slice(&data);
                data.len()
            }
            Written::Spilled { data, capacity } => {
                // reject content no record can hold before anything moves
                self.plan_capacity(data.len(), capacity)?;
                return Ok(WriteOutcome::Relocate {
                    record,
                    payload: data,
                    capacity,
                });
            }
        };

        put_length(&mut page[position.offset..], self.byte_order, record.size_class, length);
        self.counters.payload_resized(record.length, length);
        Ok(WriteOutcome::Updated {
            end: self.absolute(position) + (record.header_size() + length) as u64,
        })
    }

    /// Move `record` (id `id`, at `position`) to a new slot holding `payload`
    /// and leave a MOVED header of the same footprint behind
    #[allow(clippy::too_many_arguments)]
    pub fn relocate<S: PageSink>(
        &self,
        sink: &mut S,
        id: RecordId,
        position: PagePosition,
        record: ActualRecord,
        payload: &[u8],
        capacity: usize,
        leave_redirect: bool,
    ) -> Result<RecordId> {
        let new_id = self.insert_record(sink, payload, capacity)?;
        let redirect_to = if leave_redirect { new_id } else { NULL_ID };
        let moved = RecordHeader::moved(record.footprint() - MOVED_HEADER_SIZE, redirect_to)?;

        let order = self.byte_order;
        sink.with_page_mut(position.page, |page| {
            moved.encode(&mut page[position.offset..], order)
        })?;
        sink.region_written(self.absolute(position) + MOVED_HEADER_SIZE as u64);

        self.counters
            .record_relocated(record.length, record.capacity, leave_redirect);
        debug!(
            from = id,
            to = new_id,
            length = payload.len(),
            leave_redirect,
            "relocated record"
        );
        Ok(new_id)
    }

    /// Tombstone the record at `position`. Returns the end of the bytes
    /// touched.
    pub fn delete_in_page(&self, page: &mut [u8], position: PagePosition, id: RecordId) -> Result<u64> {
        match self.decode_at(page, position, id, false)? {
            RecordHeader::Actual(record) => {
                let tombstone = RecordHeader::moved(record.footprint() - MOVED_HEADER_SIZE, NULL_ID)?;
                tombstone.encode(&mut page[position.offset..], self.byte_order)?;
                self.counters.record_deleted(record.length, record.capacity);
            }
            RecordHeader::Moved {
                redirect_to: NULL_ID,
                ..
            } => return Err(BlobStoreError::RecordAlreadyDeleted(id)),
            RecordHeader::Moved { .. } => {
                put_redirect_to(&mut page[position.offset..], self.byte_order, NULL_ID);
            }
            RecordHeader::Padding { .. } => {
                debug!(id, "record id addresses padding");
                return Err(BlobStoreError::InvalidRecordId(id));
            }
        }
        trace!(id, "deleted record");
        Ok(self.absolute(position) + MOVED_HEADER_SIZE as u64)
    }
}
