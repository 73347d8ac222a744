//! Engine over a memory-mapped file
//!
//! Single owner: mutation goes through `&mut self`, so no page locking is
//! needed. Wrap it in a mutex to share it between threads.

use crate::config::StorageConfig;
use crate::core::allocator::{RecordId, NULL_ID};
use crate::core::header::{FileStatus, HEADER_SIZE};
use crate::core::stats::StorageStats;
use crate::engine::common::{EngineCore, Resolved, WriteOutcome};
use crate::engine::{BlobStorage, RecordContent, ScannedRecord, WriteAction, WriteOptions};
use crate::error::{BlobStoreError, Result};
use crate::storage::MappedFile;
use std::path::Path;
use tracing::{debug, info, warn};

pub const MAX_REDIRECTS: usize = 256;

#[derive(Debug)]
pub struct MappedBlobStorage {
    file: MappedFile,
    core: EngineCore,
}

impl MappedBlobStorage {
    pub fn open<P: AsRef<Path>>(path: P, config: &StorageConfig) -> Result<Self> {
        config.validate()?;
        let mut file = MappedFile::open(path, config.page_size, config.byte_order)?;
        let core = match EngineCore::open(&file, file.length(), config, MAX_REDIRECTS) {
            Ok(core) => core,
            Err(err) => {
                // undo the page-size extension done for mapping
                if let Err(close_err) = file.close() {
                    warn!(error = %close_err, "failed to release storage file");
                }
                return Err(err);
            }
        };

        let mut storage = MappedBlobStorage { file, core };
        storage.write_header(FileStatus::Opened)?;
        storage.file.flush()?;
        Ok(storage)
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    fn write_header(&mut self, status: FileStatus) -> Result<()> {
        let bytes = self.core.header_bytes(status);
        self.file.page_mut(0)?[..HEADER_SIZE].copy_from_slice(&bytes);
        self.file.region_written(HEADER_SIZE as u64);
        Ok(())
    }
}

impl BlobStorage for MappedBlobStorage {
    fn storage_version(&self) -> Result<u32> {
        self.core.check_open()?;
        Ok(self.core.storage_version())
    }

    fn data_format_version(&self) -> Result<u32> {
        self.core.check_open()?;
        Ok(self.core.data_format_version())
    }

    fn set_data_format_version(&mut self, version: u32) -> Result<()> {
        self.core.check_open()?;
        self.core.set_data_format_version(version);
        self.write_header(self.core.session_status())
    }

    fn resolve_record(&self, id: RecordId) -> Result<Option<RecordId>> {
        self.core.resolve_record(&self.file, id)
    }

    fn read_record_resolved<T, F>(&self, id: RecordId, reader: F) -> Result<(T, RecordId)>
    where
        F: FnOnce(&[u8]) -> T,
    {
        self.core.read_record(&self.file, id, reader)
    }

    fn write_to_record<W>(&mut self, id: RecordId, writer: W, options: WriteOptions) -> Result<RecordId>
    where
        W: FnOnce(&mut RecordContent<'_>) -> WriteAction,
    {
        self.core.check_open()?;
        if id == NULL_ID {
            return self.core.insert_with(&mut self.file, writer, options);
        }
        self.core.check_record_id(id)?;

        let mut current = id;
        for hop in 0..self.core.max_redirects() {
            let position = self.core.position_of(current);
            let page = self.file.page_mut(position.page)?;
            let record = match self.core.resolve(page, position, current, hop > 0)? {
                Resolved::Actual(record) => record,
                Resolved::Redirect(next) => {
                    current = next;
                    continue;
                }
                Resolved::Deleted => return Err(BlobStoreError::RecordDeleted(current)),
            };

            return match self.core.update_in_place(page, position, record, writer)? {
                WriteOutcome::Unchanged => Ok(current),
                WriteOutcome::Updated { end } => {
                    self.file.region_written(end);
                    Ok(current)
                }
                WriteOutcome::Relocate {
                    record,
                    payload,
                    capacity,
                } => self.core.relocate(
                    &mut self.file,
                    current,
                    position,
                    record,
                    &payload,
                    capacity,
                    options.leave_redirect,
                ),
            };
        }
        Err(self.core.chain_too_long(id))
    }

    fn delete_record(&mut self, id: RecordId) -> Result<()> {
        self.core.check_open()?;
        self.core.check_record_id(id)?;
        let position = self.core.position_of(id);
        let page = self.file.page_mut(position.page)?;
        let end = self.core.delete_in_page(page, position, id)?;
        self.file.region_written(end);
        Ok(())
    }

    fn for_each<F>(&self, processor: F) -> Result<usize>
    where
        F: FnMut(&ScannedRecord<'_>) -> bool,
    {
        self.core.for_each(&self.file, processor)
    }

    fn stats(&self) -> StorageStats {
        self.core.stats()
    }

    fn size_in_bytes(&self) -> u64 {
        self.file.length()
    }

    fn is_dirty(&self) -> bool {
        self.file.is_dirty()
    }

    fn force(&mut self) -> Result<()> {
        self.core.check_open()?;
        self.write_header(self.core.closing_status())?;
        self.file.flush()?;
        debug!(length = self.file.length(), "forced blob storage");
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if !self.core.begin_close() {
            return Ok(());
        }
        self.write_header(self.core.closing_status())?;
        self.file.close()?;
        info!(
            path = %self.file.path().display(),
            length = self.file.length(),
            live_records = self.core.stats().live_records,
            corrupted = self.core.is_corrupted(),
            "closed blob storage"
        );
        Ok(())
    }

    fn max_payload_supported(&self) -> usize {
        self.core.max_payload()
    }
}

impl Drop for MappedBlobStorage {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(error = %err, "failed to close blob storage on drop");
        }
    }
}
