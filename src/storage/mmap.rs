//! Memory-mapped storage file
//!
//! The whole file is mapped read-write. The mapping always covers a whole
//! number of pages and grows (file extension + remap) when a page past its end
//! is written. Single owner, no internal locking: mutation needs `&mut self`.

use crate::core::layout::ByteOrder;
use crate::error::{BlobStoreError, Result};
use crate::storage::PageRead;
use memmap2::{MmapMut, MmapOptions};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug)]
pub struct MappedFile {
    file: File,
    path: PathBuf,
    map: Option<MmapMut>,
    mapped_length: u64,
    page_size: usize,
    byte_order: ByteOrder,
    length: u64,
    dirty: bool,
}

fn map_file(file: &File, length: u64) -> Result<MmapMut> {
    // SAFETY: the file is opened read-write by this process and is only
    // resized through `MappedFile`, which drops the mapping first.
    let map = unsafe { MmapOptions::new().len(length as usize).map_mut(file)? };
    Ok(map)
}

impl MappedFile {
    /// Open (or create) and map a storage file
    pub fn open<P: AsRef<Path>>(path: P, page_size: usize, byte_order: ByteOrder) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let length = file.metadata()?.len();
        let pages = length.div_ceil(page_size as u64).max(1);
        let mapped_length = pages * page_size as u64;
        if length < mapped_length {
            file.set_len(mapped_length)?;
        }
        let map = map_file(&file, mapped_length)?;

        debug!(
            path = %path.as_ref().display(),
            length,
            mapped_length,
            "mapped storage file"
        );

        Ok(MappedFile {
            file,
            path: path.as_ref().to_path_buf(),
            map: Some(map),
            mapped_length,
            page_size,
            byte_order,
            length,
            dirty: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes currently mapped (whole pages)
    pub fn mapped_length(&self) -> u64 {
        self.mapped_length
    }

    /// Logical length: end of the furthest region written
    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn map(&self) -> Result<&MmapMut> {
        self.map.as_ref().ok_or(BlobStoreError::Closed)
    }

    fn ensure_mapped(&mut self, end: u64) -> Result<()> {
        if self.map.is_none() {
            return Err(BlobStoreError::Closed);
        }
        if end <= self.mapped_length {
            return Ok(());
        }

        let page_size = self.page_size as u64;
        let wanted = end.max(self.mapped_length * 2).div_ceil(page_size) * page_size;

        self.map = None;
        self.file.set_len(wanted)?;
        self.map = Some(map_file(&self.file, wanted)?);
        debug!(from = self.mapped_length, to = wanted, "grew mapping");
        self.mapped_length = wanted;
        Ok(())
    }

    /// Mutable view of page `index`, growing the mapping if needed
    pub fn page_mut(&mut self, index: u64) -> Result<&mut [u8]> {
        let start = index * self.page_size as u64;
        self.ensure_mapped(start + self.page_size as u64)?;
        self.dirty = true;

        let page_size = self.page_size;
        let map = self.map.as_mut().ok_or(BlobStoreError::Closed)?;
        let start = start as usize;
        Ok(&mut map[start..start + page_size])
    }

    pub fn region_written(&mut self, end_offset: u64) {
        self.length = self.length.max(end_offset);
        self.dirty = true;
    }

    /// msync the mapping and fsync the file
    pub fn flush(&mut self) -> Result<()> {
        self.map()?.flush()?;
        self.file.sync_all()?;
        self.dirty = false;
        Ok(())
    }

    /// Flush, unmap and trim the file to its logical length
    pub fn close(&mut self) -> Result<()> {
        if self.map.is_none() {
            return Ok(());
        }
        self.flush()?;
        self.map = None;
        self.file.set_len(self.length)?;
        self.file.sync_all()?;
        debug!(path = %self.path.display(), length = self.length, "unmapped storage file");
        Ok(())
    }
}

impl PageRead for MappedFile {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }

    fn with_page<R>(&self, index: u64, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let map = self.map()?;
        let start = index * self.page_size as u64;
        if start + self.page_size as u64 > self.mapped_length {
            return Ok(f(&vec![0u8; self.page_size]));
        }
        let start = start as usize;
        Ok(f(&map[start..start + self.page_size]))
    }
}
