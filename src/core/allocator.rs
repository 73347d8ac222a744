//! Record id addressing and append-only slot allocation
//!
//! Record ids map to file offsets in units of [`OFFSET_BUCKET`]:
//! `offset(id) = records_start + (id - 1) * OFFSET_BUCKET`. A 32-bit id thus
//! addresses eight times more bytes than a plain 32-bit offset would.
//!
//! Slots are handed out by bumping a single `next_record_id` cursor. The
//! allocation mutex is the only place ids are issued; the cursor itself is an
//! atomic so readers can check "is this id allocated" without locking.

use crate::core::layout::{OFFSET_BUCKET, PADDING_MIN_CAPACITY, PADDING_HEADER_SIZE};
use crate::error::{BlobStoreError, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::trace;

pub type RecordId = u32;

/// Reserved id meaning "no record"
pub const NULL_ID: RecordId = 0;

/// Location of a byte offset within paged storage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PagePosition {
    pub page: u64,
    pub offset: usize,
}

impl PagePosition {
    pub fn of(offset: u64, page_size: usize) -> Self {
        PagePosition {
            page: offset / page_size as u64,
            offset: (offset % page_size as u64) as usize,
        }
    }
}

/// Maps record ids to file offsets and back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Addressing {
    records_start: u64,
}

impl Addressing {
    /// Records begin at the first bucket boundary after the header
    pub fn new(header_size: usize) -> Self {
        Addressing {
            records_start: header_size.div_ceil(OFFSET_BUCKET) as u64 * OFFSET_BUCKET as u64,
        }
    }

    pub fn records_start(&self) -> u64 {
        self.records_start
    }

    pub fn first_record_id(&self) -> RecordId {
        1
    }

    pub fn id_to_offset(&self, id: RecordId) -> u64 {
        debug_assert!(id != NULL_ID);
        self.records_start + (id as u64 - 1) * OFFSET_BUCKET as u64
    }

    /// `offset` must be bucket-aligned and at or after the first record.
    pub fn offset_to_id(&self, offset: u64) -> Result<RecordId> {
        debug_assert!(offset >= self.records_start);
        debug_assert!(offset % OFFSET_BUCKET as u64 == 0);
        let id = (offset - self.records_start) / OFFSET_BUCKET as u64 + 1;
        RecordId::try_from(id).map_err(|_| BlobStoreError::AddressSpaceExhausted(offset))
    }

    /// Largest file length the id space can address
    pub fn max_file_length(&self) -> u64 {
        self.id_to_offset(RecordId::MAX)
    }
}

/// Filler written over the unusable tail of a page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaddingRegion {
    pub offset: u64,
    pub size: usize,
}

/// A freshly reserved record slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub id: RecordId,
    pub offset: u64,
    /// Granted footprint (header + capacity), at least the requested size
    pub size: usize,
    /// Page tail skipped to keep the record on a single page; the caller
    /// must fill it with a PADDING record.
    pub padding: Option<PaddingRegion>,
}

/// Round `raw_size` up to the bucket size. If the rounded record would leave
/// fewer than [`OFFSET_BUCKET`] bytes at the end of its page, those bytes
/// are absorbed into the record.
pub fn round_size_up_to_bucket(offset_in_page: usize, page_size: usize, raw_size: usize) -> usize {
    let rounded = raw_size.div_ceil(OFFSET_BUCKET) * OFFSET_BUCKET;
    let remaining_on_page = page_size - offset_in_page;
    if rounded < remaining_on_page && remaining_on_page - rounded < OFFSET_BUCKET {
        remaining_on_page
    } else {
        rounded
    }
}

/// Append-only slot allocator
#[derive(Debug)]
pub struct RecordAllocator {
    addressing: Addressing,
    page_size: usize,
    next_record_id: AtomicU32,
    allocation_lock: Mutex<()>,
}

impl RecordAllocator {
    pub fn new(addressing: Addressing, page_size: usize, next_record_id: RecordId) -> Self {
        RecordAllocator {
            addressing,
            page_size,
            next_record_id: AtomicU32::new(next_record_id),
            allocation_lock: Mutex::new(()),
        }
    }

    pub fn addressing(&self) -> Addressing {
        self.addressing
    }

    pub fn next_record_id(&self) -> RecordId {
        self.next_record_id.load(Ordering::Acquire)
    }

    pub fn is_allocated(&self, id: RecordId) -> bool {
        id != NULL_ID && id < self.next_record_id()
    }

    /// Offset just past the last allocated slot
    pub fn end_of_records(&self) -> u64 {
        self.addressing.id_to_offset(self.next_record_id())
    }

    /// Reserve a slot with a footprint of at least `record_size` bytes
    pub fn allocate(&self, record_size: usize) -> Result<Allocation> {
        if record_size == 0 || record_size > self.page_size {
            return Err(BlobStoreError::RecordTooLargeForPage {
                size: record_size,
                page_size: self.page_size,
            });
        }

        let _guard = self.allocation_lock.lock();
        let mut padding = None;

        // At most two rounds: after skipping to a fresh page the record fits.
        loop {
            let id = self.next_record_id.load(Ordering::Relaxed);
            let offset = self.addressing.id_to_offset(id);
            let position = PagePosition::of(offset, self.page_size);
            let size = round_size_up_to_bucket(position.offset, self.page_size, record_size);

            if position.offset + size <= self.page_size {
                let next = self.addressing.offset_to_id(offset + size as u64)?;
                self.next_record_id.store(next, Ordering::Release);
                return Ok(Allocation {
                    id,
                    offset,
                    size,
                    padding,
                });
            }

            let remaining = self.page_size - position.offset;
            debug_assert!(remaining >= PADDING_HEADER_SIZE + PADDING_MIN_CAPACITY);
            trace!(offset, remaining, "padding page tail");
            padding = Some(PaddingRegion {
                offset,
                size: remaining,
            });
            let next_page = offset + remaining as u64;
            self.next_record_id
                .store(self.addressing.offset_to_id(next_page)?, Ordering::Release);
        }
    }
}
