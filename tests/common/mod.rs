//! Helpers shared by the integration tests
#![allow(dead_code)]

use blobstore_rs::{
    AllocationConfig, BlobStorage, LockFreeBlobStorage, MappedBlobStorage, PagedBlobStorage,
    Result, StorageConfig,
};
use std::path::Path;

/// An engine that can be opened over a file path
pub trait Engine: BlobStorage + Sized {
    const NAME: &'static str;

    fn open_at(path: &Path, config: &StorageConfig) -> Result<Self>;
}

impl Engine for PagedBlobStorage {
    const NAME: &'static str = "paged";

    fn open_at(path: &Path, config: &StorageConfig) -> Result<Self> {
        PagedBlobStorage::open(path, config)
    }
}

impl Engine for LockFreeBlobStorage {
    const NAME: &'static str = "lock-free";

    fn open_at(path: &Path, config: &StorageConfig) -> Result<Self> {
        LockFreeBlobStorage::open(path, config)
    }
}

impl Engine for MappedBlobStorage {
    const NAME: &'static str = "mmap";

    fn open_at(path: &Path, config: &StorageConfig) -> Result<Self> {
        MappedBlobStorage::open(path, config)
    }
}

pub fn config(page_size: usize) -> StorageConfig {
    StorageConfig::new().with_page_size(page_size)
}

/// Records sized to their payload: a 10-byte insert gets a 2-byte header
pub fn tight_config(page_size: usize) -> StorageConfig {
    config(page_size).with_allocation(AllocationConfig::WriterDecides {
        default_capacity: 16,
    })
}
