//! Paged storage underneath the record engines
//!
//! The engines see storage as a sequence of fixed-size pages addressed by
//! index. Access is closure based so that each implementation decides how a
//! page is locked while the closure runs.

pub mod mmap;
pub mod page_cache;

pub use mmap::MappedFile;
pub use page_cache::{PageBuf, PageCache, PageHandle};

use crate::core::layout::ByteOrder;
use crate::error::Result;

/// Read access to pages
pub trait PageRead {
    fn page_size(&self) -> usize;

    /// Byte order the storage was opened with
    fn byte_order(&self) -> ByteOrder;

    /// Run `f` over the contents of page `index`
    ///
    /// Pages past the end of the storage read as zeros.
    fn with_page<R>(&self, index: u64, f: impl FnOnce(&[u8]) -> R) -> Result<R>;
}

/// Shared, internally synchronized paged storage
pub trait PagedStorage: PageRead + Send + Sync {
    /// Run `f` with exclusive access to page `index`. The page is marked dirty.
    ///
    /// `f` may access other pages of the same storage, never `index` itself.
    fn with_page_mut<R>(&self, index: u64, f: impl FnOnce(&mut [u8]) -> R) -> Result<R>;

    /// Logical storage length in bytes
    fn length(&self) -> u64;

    /// Report that bytes up to `end_offset` now hold data
    fn region_written(&self, end_offset: u64);

    /// True if anything was written since the last flush
    fn is_dirty(&self) -> bool;

    /// Write dirty pages back and fsync
    fn flush(&self) -> Result<()>;

    /// Flush and release the storage. Later page access fails.
    fn close(&self) -> Result<()>;
}
