use crate::core::layout::ByteOrder;
use crate::core::stats::StorageStats;
use crate::error::{BlobStoreError, Result};

pub const MAGIC: [u8; 4] = *b"BLOB";
pub const STORAGE_VERSION: u32 = 1;
pub const HEADER_SIZE: usize = 64;

const CHECKSUM_OFFSET: usize = 52;

/// Lifecycle status stored in the header
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    Opened = 0,
    SafelyClosed = 1,
    Corrupted = 2,
}

impl FileStatus {
    pub fn from_u32(value: u32) -> Result<Self> {
        match value {
            0 => Ok(FileStatus::Opened),
            1 => Ok(FileStatus::SafelyClosed),
            2 => Ok(FileStatus::Corrupted),
            other => Err(BlobStoreError::UnknownFileStatus(other)),
        }
    }
}

/// Storage header block (first 64 bytes of page 0)
///
/// ```text
/// 0   magic "BLOB"               4 bytes
/// 4   storage version            u32
/// 8   page size                  u32
/// 12  file status                u32
/// 16  next record id             u32
/// 20  records allocated          u32
/// 24  records relocated          u32
/// 28  records deleted            u32
/// 32  live payload bytes         u64
/// 40  live capacity bytes        u64
/// 48  client data format version u32
/// 52  CRC-32 of bytes 0..52      u32
/// 56  reserved                   8 bytes
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub magic: [u8; 4],
    pub storage_version: u32,
    pub page_size: u32,
    pub status: FileStatus,
    pub next_record_id: u32,
    pub records_allocated: u32,
    pub records_relocated: u32,
    pub records_deleted: u32,
    pub live_payload_bytes: u64,
    pub live_capacity_bytes: u64,
    pub data_format_version: u32,
}

impl Header {
    /// Header of an empty storage
    pub fn new(page_size: u32, first_record_id: u32) -> Self {
        Header {
            magic: MAGIC,
            storage_version: STORAGE_VERSION,
            page_size,
            status: FileStatus::Opened,
            next_record_id: first_record_id,
            records_allocated: 0,
            records_relocated: 0,
            records_deleted: 0,
            live_payload_bytes: 0,
            live_capacity_bytes: 0,
            data_format_version: 0,
        }
    }

    /// Validate magic and storage version
    pub fn validate(&self) -> Result<()> {
        if self.magic != MAGIC {
            return Err(BlobStoreError::InvalidMagic);
        }

        if self.storage_version != STORAGE_VERSION {
            return Err(BlobStoreError::UnsupportedVersion {
                found: self.storage_version,
                expected: STORAGE_VERSION,
            });
        }

        Ok(())
    }

    /// Check this header may be opened for a storage with `page_size` pages
    pub fn check_openable(&self, page_size: usize) -> Result<()> {
        if self.page_size as usize != page_size {
            return Err(BlobStoreError::PageSizeMismatch {
                found: self.page_size,
                expected: page_size as u32,
            });
        }

        match self.status {
            FileStatus::SafelyClosed => Ok(()),
            FileStatus::Corrupted => Err(BlobStoreError::MarkedCorrupted),
            FileStatus::Opened => Err(BlobStoreError::NotSafelyClosed(self.status as u32)),
        }
    }

    pub fn stats(&self) -> StorageStats {
        StorageStats {
            records_allocated: self.records_allocated,
            records_relocated: self.records_relocated,
            records_deleted: self.records_deleted,
            live_records: self
                .records_allocated
                .saturating_sub(self.records_relocated)
                .saturating_sub(self.records_deleted),
            live_payload_bytes: self.live_payload_bytes,
            live_capacity_bytes: self.live_capacity_bytes,
        }
    }

    pub fn set_stats(&mut self, stats: StorageStats) {
        self.records_allocated = stats.records_allocated;
        self.records_relocated = stats.records_relocated;
        self.records_deleted = stats.records_deleted;
        self.live_payload_bytes = stats.live_payload_bytes;
        self.live_capacity_bytes = stats.live_capacity_bytes;
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self, order: ByteOrder) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];

        bytes[0..4].copy_from_slice(&self.magic);
        order.write_u32(&mut bytes[4..], self.storage_version);
        order.write_u32(&mut bytes[8..], self.page_size);
        order.write_u32(&mut bytes[12..], self.status as u32);
        order.write_u32(&mut bytes[16..], self.next_record_id);
        order.write_u32(&mut bytes[20..], self.records_allocated);
        order.write_u32(&mut bytes[24..], self.records_relocated);
        order.write_u32(&mut bytes[28..], self.records_deleted);
        order.write_u64(&mut bytes[32..], self.live_payload_bytes);
        order.write_u64(&mut bytes[40..], self.live_capacity_bytes);
        order.write_u32(&mut bytes[48..], self.data_format_version);

        let checksum = crc32fast::hash(&bytes[..CHECKSUM_OFFSET]);
        order.write_u32(&mut bytes[CHECKSUM_OFFSET..], checksum);

        bytes
    }

    /// Deserialize header from bytes
    pub fn from_bytes(bytes: &[u8], order: ByteOrder) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(BlobStoreError::TruncatedHeader(bytes.len()));
        }

        let mut magic = [0u8; 4];
        magic.copy_from_slice(&bytes[0..4]);
        if magic != MAGIC {
            return Err(BlobStoreError::InvalidMagic);
        }

        let stored = order.read_u32(&bytes[CHECKSUM_OFFSET..]);
        if stored != crc32fast::hash(&bytes[..CHECKSUM_OFFSET]) {
            return Err(BlobStoreError::HeaderChecksumMismatch);
        }

        let header = Header {
            magic,
            storage_version: order.read_u32(&bytes[4..]),
            page_size: order.read_u32(&bytes[8..]),
            status: FileStatus::from_u32(order.read_u32(&bytes[12..]))?,
            next_record_id: order.read_u32(&bytes[16..]),
            records_allocated: order.read_u32(&bytes[20..]),
            records_relocated: order.read_u32(&bytes[24..]),
            records_deleted: order.read_u32(&bytes[28..]),
            live_payload_bytes: order.read_u64(&bytes[32..]),
            live_capacity_bytes: order.read_u64(&bytes[40..]),
            data_format_version: order.read_u32(&bytes[48..]),
        };

        header.validate()?;

        Ok(header)
    }
}
