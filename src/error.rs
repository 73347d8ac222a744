use crate::core::layout::RecordKind;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BlobStoreError {
    // Format errors
    #[error("Invalid magic number in header")]
    InvalidMagic,

    #[error("Unsupported storage version: {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },

    #[error("Page size mismatch: file uses {found}, storage configured for {expected}")]
    PageSizeMismatch { found: u32, expected: u32 },

    #[error("Header checksum verification failed")]
    HeaderChecksumMismatch,

    #[error("Truncated header: {0} bytes available")]
    TruncatedHeader(usize),

    #[error("Unknown file status: {0}")]
    UnknownFileStatus(u32),

    #[error("Storage was not safely closed (status {0})")]
    NotSafelyClosed(u32),

    #[error("Storage is marked as corrupted")]
    MarkedCorrupted,

    #[error("PARTIAL records are not supported")]
    PartialRecordUnsupported,

    #[error("Record length {length} exceeds its capacity {capacity}")]
    LengthExceedsCapacity { length: usize, capacity: usize },

    #[error("Truncated record header: need {needed} bytes, have {available}")]
    TruncatedRecord { needed: usize, available: usize },

    #[error("File too large for record addressing: {length} bytes (max {max})")]
    FileTooLarge { length: u64, max: u64 },

    // Integrity errors
    #[error("Redirect chain from record {record_id} exceeds {max_redirects} hops")]
    RedirectChainTooLong { record_id: u32, max_redirects: usize },

    #[error("Record {record_id} redirects to unallocated record {redirect_to}")]
    DanglingRedirect { record_id: u32, redirect_to: u32 },

    #[error("Unexpected {kind:?} record at id {record_id}")]
    UnexpectedRecordKind { record_id: u32, kind: RecordKind },

    #[error("Record at offset {offset} (footprint {footprint}) crosses a page boundary")]
    RecordCrossesPage { offset: u64, footprint: usize },

    // Usage errors
    #[error("Invalid record id: {0}")]
    InvalidRecordId(u32),

    #[error("Record {record_id} is not allocated (next record id is {next_record_id})")]
    RecordNotAllocated { record_id: u32, next_record_id: u32 },

    #[error("Record {0} is deleted")]
    RecordDeleted(u32),

    #[error("Record {0} is already deleted")]
    RecordAlreadyDeleted(u32),

    #[error("Capacity {capacity} out of range [{min}, {max}]")]
    CapacityOutOfRange {
        capacity: usize,
        min: usize,
        max: usize,
    },

    #[error("Capacity {capacity} is not aligned for a {header_size}-byte header")]
    MisalignedCapacity { capacity: usize, header_size: usize },

    #[error("Length {length} out of range (max {max})")]
    LengthOutOfRange { length: usize, max: usize },

    #[error("Record of {size} bytes does not fit a {page_size}-byte page")]
    RecordTooLargeForPage { size: usize, page_size: usize },

    #[error("Allocation strategy returned capacity {capacity} below length {length}")]
    CapacityBelowLength { capacity: usize, length: usize },

    #[error("Record id space exhausted at offset {0}")]
    AddressSpaceExhausted(u64),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Resource errors
    #[error("Storage is closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),
}

impl BlobStoreError {
    /// True for format and integrity errors: the file can't be trusted any more.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            BlobStoreError::InvalidMagic
                | BlobStoreError::UnsupportedVersion { .. }
                | BlobStoreError::HeaderChecksumMismatch
                | BlobStoreError::TruncatedHeader(_)
                | BlobStoreError::UnknownFileStatus(_)
                | BlobStoreError::MarkedCorrupted
                | BlobStoreError::PartialRecordUnsupported
                | BlobStoreError::LengthExceedsCapacity { .. }
                | BlobStoreError::TruncatedRecord { .. }
                | BlobStoreError::FileTooLarge { .. }
                | BlobStoreError::RedirectChainTooLong { .. }
                | BlobStoreError::DanglingRedirect { .. }
                | BlobStoreError::UnexpectedRecordKind { .. }
                | BlobStoreError::RecordCrossesPage { .. }
        )
    }

    /// True for argument validation failures; nothing was mutated.
    pub fn is_usage(&self) -> bool {
        matches!(
            self,
            BlobStoreError::InvalidRecordId(_)
                | BlobStoreError::RecordNotAllocated { .. }
                | BlobStoreError::RecordDeleted(_)
                | BlobStoreError::RecordAlreadyDeleted(_)
                | BlobStoreError::CapacityOutOfRange { .. }
                | BlobStoreError::MisalignedCapacity { .. }
                | BlobStoreError::LengthOutOfRange { .. }
                | BlobStoreError::RecordTooLargeForPage { .. }
                | BlobStoreError::CapacityBelowLength { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, BlobStoreError>;
