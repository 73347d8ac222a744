//! Record layout codec
//!
//! Every record starts with a bit-packed header whose top two bits (bit 0 is
//! the most significant bit of the first byte) carry the record type tag:
//!
//! ```text
//! 00  PADDING   3-byte header: tag | capacity code (22 bits)
//! 01  ACTUAL    small: 2-byte header: tag | size class 0 | capacity code (5 bits) | length (8 bits)
//!               large: 5-byte header: tag | size class 1 | capacity code (17 bits) | length (20 bits)
//! 10  MOVED     7-byte header: tag | capacity code (22 bits) | redirect-to id (32 bits)
//! 11  PARTIAL   reserved, never written
//! ```
//!
//! Capacity is stored as `code * OFFSET_BUCKET + (OFFSET_BUCKET - header_size)`,
//! so a record's footprint (header + capacity) is always bucket-aligned.
//! Multi-byte fields after the first byte follow the storage's [`ByteOrder`].
//!
//! A zero-filled region decodes as a stream of minimal padding records.

use crate::error::{BlobStoreError, Result};
use serde::{Deserialize, Serialize};

/// Record offsets are quantized to this many bytes.
pub const OFFSET_BUCKET: usize = 8;

pub const SMALL_HEADER_SIZE: usize = 2;
pub const LARGE_HEADER_SIZE: usize = 5;
pub const MOVED_HEADER_SIZE: usize = 7;
pub const PADDING_HEADER_SIZE: usize = 3;

const TAG_SHIFT: u32 = 6;
const TAG_PADDING: u8 = 0b00;
const TAG_ACTUAL: u8 = 0b01;
const TAG_MOVED: u8 = 0b10;
const TAG_PARTIAL: u8 = 0b11;

/// Bit 2 of the first byte: ACTUAL size class.
const LARGE_CLASS_BIT: u8 = 0b0010_0000;

const SMALL_CAPACITY_BITS: u32 = 5;
const LARGE_CAPACITY_BITS: u32 = 17;
const LARGE_LENGTH_BITS: u32 = 20;
/// MOVED and PADDING share the 22-bit capacity code.
const WIDE_CAPACITY_BITS: u32 = 22;

const LARGE_LENGTH_MASK: u32 = (1 << LARGE_LENGTH_BITS) - 1;

const fn min_capacity_for(header_size: usize) -> usize {
    OFFSET_BUCKET - header_size
}

const fn max_capacity_for(header_size: usize, code_bits: u32) -> usize {
    ((1usize << code_bits) - 1) * OFFSET_BUCKET + min_capacity_for(header_size)
}

pub const SMALL_MIN_CAPACITY: usize = min_capacity_for(SMALL_HEADER_SIZE);
pub const SMALL_MAX_CAPACITY: usize = max_capacity_for(SMALL_HEADER_SIZE, SMALL_CAPACITY_BITS);
pub const LARGE_MIN_CAPACITY: usize = min_capacity_for(LARGE_HEADER_SIZE);
pub const LARGE_MAX_CAPACITY: usize = max_capacity_for(LARGE_HEADER_SIZE, LARGE_CAPACITY_BITS);
pub const LARGE_MAX_LENGTH: usize = (1 << LARGE_LENGTH_BITS) - 1;
pub const MOVED_MIN_CAPACITY: usize = min_capacity_for(MOVED_HEADER_SIZE);
pub const MOVED_MAX_CAPACITY: usize = max_capacity_for(MOVED_HEADER_SIZE, WIDE_CAPACITY_BITS);
pub const PADDING_MIN_CAPACITY: usize = min_capacity_for(PADDING_HEADER_SIZE);
pub const PADDING_MAX_CAPACITY: usize = max_capacity_for(PADDING_HEADER_SIZE, WIDE_CAPACITY_BITS);

/// Largest payload capacity any record can have.
pub const MAX_CAPACITY: usize = LARGE_MAX_CAPACITY;

/// Hard payload length limit (length never exceeds capacity).
pub const MAX_LENGTH: usize = MAX_CAPACITY;

/// Byte order of multi-byte header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ByteOrder {
    #[default]
    Little,
    Big,
}

impl ByteOrder {
    /// Byte order of the current platform
    pub fn native() -> Self {
        if cfg!(target_endian = "big") {
            ByteOrder::Big
        } else {
            ByteOrder::Little
        }
    }

    pub fn read_u16(self, bytes: &[u8]) -> u16 {
        let raw = [bytes[0], bytes[1]];
        match self {
            ByteOrder::Little => u16::from_le_bytes(raw),
            ByteOrder::Big => u16::from_be_bytes(raw),
        }
    }

    pub fn read_u32(self, bytes: &[u8]) -> u32 {
        let raw = [bytes[0], bytes[1], bytes[2], bytes[3]];
        match self {
            ByteOrder::Little => u32::from_le_bytes(raw),
            ByteOrder::Big => u32::from_be_bytes(raw),
        }
    }

    pub fn read_u64(self, bytes: &[u8]) -> u64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&bytes[..8]);
        match self {
            ByteOrder::Little => u64::from_le_bytes(raw),
            ByteOrder::Big => u64::from_be_bytes(raw),
        }
    }

    pub fn write_u16(self, bytes: &mut [u8], value: u16) {
        let raw = match self {
            ByteOrder::Little => value.to_le_bytes(),
            ByteOrder::Big => value.to_be_bytes(),
        };
        bytes[..2].copy_from_slice(&raw);
    }

    pub fn write_u32(self, bytes: &mut [u8], value: u32) {
        let raw = match self {
            ByteOrder::Little => value.to_le_bytes(),
            ByteOrder::Big => value.to_be_bytes(),
        };
        bytes[..4].copy_from_slice(&raw);
    }

    pub fn write_u64(self, bytes: &mut [u8], value: u64) {
        let raw = match self {
            ByteOrder::Little => value.to_le_bytes(),
            ByteOrder::Big => value.to_be_bytes(),
        };
        bytes[..8].copy_from_slice(&raw);
    }
}

/// Record type, from the 2-bit tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Padding,
    Actual,
    Moved,
    Partial,
}

impl RecordKind {
    /// Reads the tag from the first header byte
    pub fn from_first_byte(byte: u8) -> Self {
        match byte >> TAG_SHIFT {
            TAG_PADDING => RecordKind::Padding,
            TAG_ACTUAL => RecordKind::Actual,
            TAG_MOVED => RecordKind::Moved,
            _ => RecordKind::Partial,
        }
    }

    fn tag(self) -> u8 {
        let tag = match self {
            RecordKind::Padding => TAG_PADDING,
            RecordKind::Actual => TAG_ACTUAL,
            RecordKind::Moved => TAG_MOVED,
            RecordKind::Partial => TAG_PARTIAL,
        };
        tag << TAG_SHIFT
    }
}

/// Sub-encoding of an ACTUAL record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeClass {
    Small,
    Large,
}

impl SizeClass {
    /// Smallest header able to describe `capacity`.
    pub fn for_capacity(capacity: usize) -> Self {
        if capacity <= SMALL_MAX_CAPACITY {
            SizeClass::Small
        } else {
            SizeClass::Large
        }
    }

    pub const fn header_size(self) -> usize {
        match self {
            SizeClass::Small => SMALL_HEADER_SIZE,
            SizeClass::Large => LARGE_HEADER_SIZE,
        }
    }

    pub const fn min_capacity(self) -> usize {
        match self {
            SizeClass::Small => SMALL_MIN_CAPACITY,
            SizeClass::Large => LARGE_MIN_CAPACITY,
        }
    }

    pub const fn max_capacity(self) -> usize {
        match self {
            SizeClass::Small => SMALL_MAX_CAPACITY,
            SizeClass::Large => LARGE_MAX_CAPACITY,
        }
    }

    /// Largest value the length field can hold
    pub const fn max_length(self) -> usize {
        match self {
            SizeClass::Small => u8::MAX as usize,
            SizeClass::Large => LARGE_MAX_LENGTH,
        }
    }
}

/// Decoded header of a record holding a payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActualRecord {
    pub size_class: SizeClass,
    pub capacity: usize,
    pub length: usize,
}

impl ActualRecord {
    pub fn header_size(&self) -> usize {
        self.size_class.header_size()
    }

    pub fn footprint(&self) -> usize {
        self.header_size() + self.capacity
    }
}

/// Decoded record header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordHeader {
    Actual(ActualRecord),
    /// `redirect_to == 0` marks a deleted record.
    Moved { capacity: usize, redirect_to: u32 },
    Padding { capacity: usize },
}

fn check_capacity(capacity: usize, header_size: usize, max: usize) -> Result<()> {
    let min = min_capacity_for(header_size);
    if capacity < min || capacity > max {
        return Err(BlobStoreError::CapacityOutOfRange { capacity, min, max });
    }
    if (capacity + header_size) % OFFSET_BUCKET != 0 {
        return Err(BlobStoreError::MisalignedCapacity {
            capacity,
            header_size,
        });
    }
    Ok(())
}

fn capacity_code(capacity: usize, header_size: usize) -> u32 {
    ((capacity - min_capacity_for(header_size)) / OFFSET_BUCKET) as u32
}

fn capacity_from_code(code: u32, header_size: usize) -> usize {
    code as usize * OFFSET_BUCKET + min_capacity_for(header_size)
}

fn ensure_available(buf: &[u8], needed: usize) -> Result<()> {
    if buf.len() < needed {
        return Err(BlobStoreError::TruncatedRecord {
            needed,
            available: buf.len(),
        });
    }
    Ok(())
}

impl RecordHeader {
    /// ACTUAL header; the size class follows from `capacity`.
    pub fn actual(capacity: usize, length: usize) -> Result<Self> {
        let size_class = SizeClass::for_capacity(capacity);
        let header = RecordHeader::Actual(ActualRecord {
            size_class,
            capacity,
            length,
        });
        header.validate()?;
        Ok(header)
    }

    pub fn moved(capacity: usize, redirect_to: u32) -> Result<Self> {
        let header = RecordHeader::Moved {
            capacity,
            redirect_to,
        };
        header.validate()?;
        Ok(header)
    }

    pub fn padding(capacity: usize) -> Result<Self> {
        let header = RecordHeader::Padding { capacity };
        header.validate()?;
        Ok(header)
    }

    pub fn kind(&self) -> RecordKind {
        match self {
            RecordHeader::Actual(_) => RecordKind::Actual,
            RecordHeader::Moved { .. } => RecordKind::Moved,
            RecordHeader::Padding { .. } => RecordKind::Padding,
        }
    }

    pub fn header_size(&self) -> usize {
        match self {
            RecordHeader::Actual(actual) => actual.header_size(),
            RecordHeader::Moved { .. } => MOVED_HEADER_SIZE,
            RecordHeader::Padding { .. } => PADDING_HEADER_SIZE,
        }
    }

    pub fn capacity(&self) -> usize {
        match *self {
            RecordHeader::Actual(actual) => actual.capacity,
            RecordHeader::Moved { capacity, .. } => capacity,
            RecordHeader::Padding { capacity } => capacity,
        }
    }

    /// Total bytes the record occupies on disk
    pub fn footprint(&self) -> usize {
        self.header_size() + self.capacity()
    }

    /// Payload length, for ACTUAL records only
    pub fn length(&self) -> Option<usize> {
        match self {
            RecordHeader::Actual(actual) => Some(actual.length),
            _ => None,
        }
    }

    /// Checks every field against the limits of its encoding
    pub fn validate(&self) -> Result<()> {
        match *self {
            RecordHeader::Actual(actual) => {
                check_capacity(
                    actual.capacity,
                    actual.header_size(),
                    actual.size_class.max_capacity(),
                )?;
                let max = actual.capacity.min(actual.size_class.max_length());
                if actual.length > max {
                    return Err(BlobStoreError::LengthOutOfRange {
                        length: actual.length,
                        max,
                    });
                }
                Ok(())
            }
            RecordHeader::Moved { capacity, .. } => {
                check_capacity(capacity, MOVED_HEADER_SIZE, MOVED_MAX_CAPACITY)
            }
            RecordHeader::Padding { capacity } => {
                check_capacity(capacity, PADDING_HEADER_SIZE, PADDING_MAX_CAPACITY)
            }
        }
    }

    /// Encode the header at the start of `buf`
    ///
    /// Nothing is written unless every field is valid.
    pub fn encode(&self, buf: &mut [u8], order: ByteOrder) -> Result<()> {
        self.validate()?;
        ensure_available(buf, self.header_size())?;

        match *self {
            RecordHeader::Actual(actual) => {
                let code = capacity_code(actual.capacity, actual.header_size());
                match actual.size_class {
                    SizeClass::Small => {
                        buf[0] = RecordKind::Actual.tag() | code as u8;
                        buf[1] = actual.length as u8;
                    }
                    SizeClass::Large => {
                        buf[0] = RecordKind::Actual.tag() | LARGE_CLASS_BIT | (code >> 12) as u8;
                        let word = ((code & 0xFFF) << LARGE_LENGTH_BITS) | actual.length as u32;
                        order.write_u32(&mut buf[1..5], word);
                    }
                }
            }
            RecordHeader::Moved {
                capacity,
                redirect_to,
            } => {
                let code = capacity_code(capacity, MOVED_HEADER_SIZE);
                buf[0] = RecordKind::Moved.tag() | (code >> 16) as u8;
                order.write_u16(&mut buf[1..3], (code & 0xFFFF) as u16);
                order.write_u32(&mut buf[3..7], redirect_to);
            }
            RecordHeader::Padding { capacity } => {
                let code = capacity_code(capacity, PADDING_HEADER_SIZE);
                buf[0] = RecordKind::Padding.tag() | (code >> 16) as u8;
                order.write_u16(&mut buf[1..3], (code & 0xFFFF) as u16);
            }
        }

        Ok(())
    }

    /// Decode the header at the start of `buf`
    pub fn decode(buf: &[u8], order: ByteOrder) -> Result<Self> {
        ensure_available(buf, 1)?;
        let first = buf[0];

        match RecordKind::from_first_byte(first) {
            RecordKind::Actual if first & LARGE_CLASS_BIT == 0 => {
                ensure_available(buf, SMALL_HEADER_SIZE)?;
                let code = (first & ((1 << SMALL_CAPACITY_BITS) - 1)) as u32;
                let actual = ActualRecord {
                    size_class: SizeClass::Small,
                    capacity: capacity_from_code(code, SMALL_HEADER_SIZE),
                    length: buf[1] as usize,
                };
                check_length(actual)
            }
            RecordKind::Actual => {
                ensure_available(buf, LARGE_HEADER_SIZE)?;
                let word = order.read_u32(&buf[1..5]);
                let code = (((first & 0b1_1111) as u32) << 12) | (word >> LARGE_LENGTH_BITS);
                let actual = ActualRecord {
                    size_class: SizeClass::Large,
                    capacity: capacity_from_code(code, LARGE_HEADER_SIZE),
                    length: (word & LARGE_LENGTH_MASK) as usize,
                };
                check_length(actual)
            }
            RecordKind::Moved => {
                ensure_available(buf, MOVED_HEADER_SIZE)?;
                Ok(RecordHeader::Moved {
                    capacity: capacity_from_code(wide_code(buf, order), MOVED_HEADER_SIZE),
                    redirect_to: order.read_u32(&buf[3..7]),
                })
            }
            RecordKind::Padding => {
                ensure_available(buf, PADDING_HEADER_SIZE)?;
                Ok(RecordHeader::Padding {
                    capacity: capacity_from_code(wide_code(buf, order), PADDING_HEADER_SIZE),
                })
            }
            RecordKind::Partial => Err(BlobStoreError::PartialRecordUnsupported),
        }
    }
}

fn wide_code(buf: &[u8], order: ByteOrder) -> u32 {
    (((buf[0] & 0b11_1111) as u32) << 16) | order.read_u16(&buf[1..3]) as u32
}

fn check_length(actual: ActualRecord) -> Result<RecordHeader> {
    if actual.length > actual.capacity {
        return Err(BlobStoreError::LengthExceedsCapacity {
            length: actual.length,
            capacity: actual.capacity,
        });
    }
    Ok(RecordHeader::Actual(actual))
}

/// Rewrite only the length field of an ACTUAL header.
pub fn put_length(buf: &mut [u8], order: ByteOrder, size_class: SizeClass, length: usize) {
    match size_class {
        SizeClass::Small => buf[1] = length as u8,
        SizeClass::Large => {
            let word = order.read_u32(&buf[1..5]);
            let word = (word & !LARGE_LENGTH_MASK) | (length as u32 & LARGE_LENGTH_MASK);
            order.write_u32(&mut buf[1..5], word);
        }
    }
}

/// Rewrite only the redirect-to field of a MOVED header.
pub fn put_redirect_to(buf: &mut [u8], order: ByteOrder, redirect_to: u32) {
    order.write_u32(&mut buf[3..7], redirect_to);
}
