//! Page cache over a file (or over nothing, for in-memory storages)
//!
//! Pages are loaded on first touch. Each page sits behind its own `RwLock`;
//! the page map has a separate lock that is never held while a page lock is
//! being acquired. Dirty pages are written back on [`PagedStorage::flush`],
//! after which the file is trimmed to the logical length and fsynced.
//!
//! A file-backed cache keeps at most [`PageCache::with_cache_limit`] pages
//! resident, dropping the least recently used ones. Only clean pages that no
//! caller holds a handle to can go, so dirty pages pile up until the next
//! flush. In-memory caches never evict.

use crate::core::layout::ByteOrder;
use crate::error::{BlobStoreError, Result};
use crate::storage::{PageRead, PagedStorage};
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Contents of one cached page
#[derive(Debug)]
pub struct PageBuf {
    bytes: Box<[u8]>,
    dirty: bool,
}

impl PageBuf {
    fn new(bytes: Box<[u8]>) -> Self {
        PageBuf {
            bytes,
            dirty: false,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Mutable contents; marks the page dirty
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        self.dirty = true;
        &mut self.bytes
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

pub type PageHandle = Arc<RwLock<PageBuf>>;

/// File-backed or in-memory page cache
#[derive(Debug)]
pub struct PageCache {
    file: Option<Mutex<File>>,
    path: Option<PathBuf>,
    page_size: usize,
    byte_order: ByteOrder,
    pages: Mutex<LruCache<u64, PageHandle>>,
    cache_limit: usize,
    length: AtomicU64,
    dirty: AtomicBool,
    closed: AtomicBool,
}

impl PageCache {
    /// Open (or create) a file-backed cache
    pub fn open<P: AsRef<Path>>(path: P, page_size: usize, byte_order: ByteOrder) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let length = file.metadata()?.len();

        debug!(
            path = %path.as_ref().display(),
            length,
            page_size,
            "opened page cache"
        );

        Ok(PageCache {
            file: Some(Mutex::new(file)),
            path: Some(path.as_ref().to_path_buf()),
            page_size,
            byte_order,
            pages: Mutex::new(LruCache::unbounded()),
            cache_limit: usize::MAX,
            length: AtomicU64::new(length),
            dirty: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// Cache with no backing file; flushing only clears the dirty flag
    pub fn in_memory(page_size: usize, byte_order: ByteOrder) -> Self {
        PageCache {
            file: None,
            path: None,
            page_size,
            byte_order,
            pages: Mutex::new(LruCache::unbounded()),
            cache_limit: usize::MAX,
            length: AtomicU64::new(0),
            dirty: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Keep at most `pages` pages resident (unbounded by default)
    pub fn with_cache_limit(mut self, pages: usize) -> Self {
        self.cache_limit = pages.max(1);
        self
    }

    /// Backing file path, if any
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn cached_pages(&self) -> usize {
        self.pages.lock().len()
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BlobStoreError::Closed);
        }
        Ok(())
    }

    /// Handle to page `index`, loading it on a miss
    pub fn page(&self, index: u64) -> Result<PageHandle> {
        self.check_open()?;

        // Misses load under the map lock, so a page cannot be evicted and
        // reloaded from an older copy of the file in between.
        let mut pages = self.pages.lock();
        if let Some(handle) = pages.get(&index) {
            return Ok(Arc::clone(handle));
        }

        let handle = Arc::new(RwLock::new(PageBuf::new(self.load_page(index)?)));
        pages.put(index, Arc::clone(&handle));
        self.evict_clean(&mut pages);
        Ok(handle)
    }

    /// Drop least recently used pages beyond the cache limit
    ///
    /// A page is only dropped when the map holds the sole handle to it and
    /// it is clean, so its bytes are already in the file.
    fn evict_clean(&self, pages: &mut LruCache<u64, PageHandle>) {
        if self.file.is_none() || pages.len() <= self.cache_limit {
            return;
        }

        let excess = pages.len() - self.cache_limit;
        let victims: Vec<u64> = pages
            .iter()
            .rev()
            .filter(|&(_, handle)| {
                Arc::strong_count(handle) == 1
                    && handle.try_read().is_some_and(|page| !page.dirty)
            })
            .map(|(index, _)| *index)
            .take(excess)
            .collect();

        for index in &victims {
            pages.pop(index);
        }
        if !victims.is_empty() {
            trace!(evicted = victims.len(), resident = pages.len(), "evicted clean pages");
        }
    }

    fn load_page(&self, index: u64) -> Result<Box<[u8]>> {
        let mut bytes = vec![0u8; self.page_size].into_boxed_slice();

        if let Some(file) = &self.file {
            let offset = index * self.page_size as u64;
            let mut file = file.lock();
            let file_length = file.metadata()?.len();
            if offset < file_length {
                let available = (file_length - offset).min(self.page_size as u64) as usize;
                file.seek(SeekFrom::Start(offset))?;
                file.read_exact(&mut bytes[..available])?;
            }
        }

        Ok(bytes)
    }

    fn write_back(&self) -> Result<()> {
        self.dirty.store(false, Ordering::Release);

        let Some(file) = &self.file else {
            return Ok(());
        };

        let mut handles: Vec<(u64, PageHandle)> = self
            .pages
            .lock()
            .iter()
            .map(|(index, handle)| (*index, Arc::clone(handle)))
            .collect();
        handles.sort_by_key(|(index, _)| *index);

        let mut written = 0usize;
        for (index, handle) in handles {
            // Copy under the page lock, write under the file lock: the two
            // are never held together.
            let copy = {
                let mut page = handle.write();
                if !page.dirty {
                    continue;
                }
                page.dirty = false;
                page.bytes.to_vec()
            };

            let result = {
                let mut file = file.lock();
                file.seek(SeekFrom::Start(index * self.page_size as u64))
                    .and_then(|_| file.write_all(&copy))
            };
            if let Err(err) = result {
                handle.write().dirty = true;
                self.dirty.store(true, Ordering::Release);
                return Err(err.into());
            }
            written += 1;
        }

        let length = self.length.load(Ordering::Acquire);
        {
            let file = file.lock();
            file.set_len(length)?;
            file.sync_all()?;
        }

        self.evict_clean(&mut self.pages.lock());
        debug!(pages = written, length, "flushed page cache");
        Ok(())
    }
}

impl PageRead for PageCache {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }

    fn with_page<R>(&self, index: u64, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let handle = self.page(index)?;
        let page = handle.read();
        Ok(f(page.bytes()))
    }
}

impl PagedStorage for PageCache {
    fn with_page_mut<R>(&self, index: u64, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        let handle = self.page(index)?;
        let mut page = handle.write();
        self.dirty.store(true, Ordering::Release);
        Ok(f(page.bytes_mut()))
    }

    fn length(&self) -> u64 {
        self.length.load(Ordering::Acquire)
    }

    fn region_written(&self, end_offset: u64) {
        self.length.fetch_max(end_offset, Ordering::AcqRel);
        self.dirty.store(true, Ordering::Release);
    }

    fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    fn flush(&self) -> Result<()> {
        self.check_open()?;
        self.write_back()
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let result = self.write_back();
        self.pages.lock().clear();
        result
    }
}
