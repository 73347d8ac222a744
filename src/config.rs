//! Storage configuration
//!
//! Configuration can be built in code or loaded from TOML:
//!
//! ```toml
//! page_size = 1048576
//! byte_order = "little"
//! scratch_buffers = 16
//! cache_pages = 256
//!
//! [allocation]
//! strategy = "length-plus-percent"
//! default_capacity = 256
//! min_capacity = 64
//! percent_on_top = 30
//! ```

use crate::core::header::HEADER_SIZE;
use crate::core::layout::{ByteOrder, OFFSET_BUCKET};
use crate::core::strategy::{
    DataLengthPlusFixedPercentStrategy, SpaceAllocationStrategy, WriterDecidesStrategy,
};
use crate::error::{BlobStoreError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_PAGE_SIZE: usize = 1024 * 1024;
pub const MIN_PAGE_SIZE: usize = 2 * HEADER_SIZE;
pub const DEFAULT_CAPACITY: usize = 256;
pub const DEFAULT_SCRATCH_BUFFERS: usize = 16;
pub const DEFAULT_CACHE_PAGES: usize = 256;

/// How new records size their capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "kebab-case")]
pub enum AllocationConfig {
    /// Capacity equals the writer's buffer size
    WriterDecides { default_capacity: usize },
    /// Capacity is the payload length plus a percentage, never below a floor
    LengthPlusPercent {
        default_capacity: usize,
        min_capacity: usize,
        percent_on_top: usize,
    },
}

impl Default for AllocationConfig {
    fn default() -> Self {
        AllocationConfig::WriterDecides {
            default_capacity: DEFAULT_CAPACITY,
        }
    }
}

impl AllocationConfig {
    pub fn build(&self) -> Result<Box<dyn SpaceAllocationStrategy>> {
        Ok(match *self {
            AllocationConfig::WriterDecides { default_capacity } => {
                Box::new(WriterDecidesStrategy::new(default_capacity)?)
            }
            AllocationConfig::LengthPlusPercent {
                default_capacity,
                min_capacity,
                percent_on_top,
            } => Box::new(DataLengthPlusFixedPercentStrategy::new(
                default_capacity,
                min_capacity,
                percent_on_top,
            )?),
        })
    }
}

/// Storage-wide settings, fixed for the lifetime of a file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Page size in bytes; records never span pages
    pub page_size: usize,
    /// Byte order of all multi-byte on-disk fields
    pub byte_order: ByteOrder,
    /// Idle scratch buffers kept for inserts
    pub scratch_buffers: usize,
    /// Pages the page cache keeps resident; dirty pages may exceed it until flushed
    pub cache_pages: usize,
    pub allocation: AllocationConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            page_size: DEFAULT_PAGE_SIZE,
            byte_order: ByteOrder::Little,
            scratch_buffers: DEFAULT_SCRATCH_BUFFERS,
            cache_pages: DEFAULT_CACHE_PAGES,
            allocation: AllocationConfig::default(),
        }
    }
}

impl StorageConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_byte_order(mut self, byte_order: ByteOrder) -> Self {
        self.byte_order = byte_order;
        self
    }

    pub fn with_allocation(mut self, allocation: AllocationConfig) -> Self {
        self.allocation = allocation;
        self
    }

    pub fn with_scratch_buffers(mut self, scratch_buffers: usize) -> Self {
        self.scratch_buffers = scratch_buffers;
        self
    }

    pub fn with_cache_pages(mut self, cache_pages: usize) -> Self {
        self.cache_pages = cache_pages;
        self
    }

    /// Parse a TOML document; missing keys take their defaults
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: StorageConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    pub fn validate(&self) -> Result<()> {
        if self.page_size < MIN_PAGE_SIZE || self.page_size % OFFSET_BUCKET != 0 {
            return Err(BlobStoreError::InvalidConfig(format!(
                "page_size ({}) must be a multiple of {} and at least {}",
                self.page_size, OFFSET_BUCKET, MIN_PAGE_SIZE
            )));
        }
        if self.page_size > u32::MAX as usize {
            return Err(BlobStoreError::InvalidConfig(format!(
                "page_size ({}) must fit in 32 bits",
                self.page_size
            )));
        }
        if self.cache_pages == 0 {
            return Err(BlobStoreError::InvalidConfig(
                "cache_pages must be at least 1".to_string(),
            ));
        }
        // Catches bad strategy parameters early
        self.allocation.build()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = StorageConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.page_size, DEFAULT_PAGE_SIZE);
        assert_eq!(config.byte_order, ByteOrder::Little);
    }

    #[test]
    fn test_builder() {
        let config = StorageConfig::new()
            .with_page_size(4096)
            .with_byte_order(ByteOrder::Big)
            .with_scratch_buffers(2)
            .with_cache_pages(8);
        assert_eq!(config.page_size, 4096);
        assert_eq!(config.byte_order, ByteOrder::Big);
        assert_eq!(config.scratch_buffers, 2);
        assert_eq!(config.cache_pages, 8);
        assert!(matches!(
            config.with_cache_pages(0).validate(),
            Err(BlobStoreError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_page_size_validation() {
        for bad in [0, 64, 100, 4097] {
            let config = StorageConfig::new().with_page_size(bad);
            assert!(matches!(
                config.validate(),
                Err(BlobStoreError::InvalidConfig(_))
            ));
        }
        assert!(StorageConfig::new().with_page_size(128).validate().is_ok());
    }

    #[test]
    fn test_from_toml() {
        let config = StorageConfig::from_toml_str(
            r#"
            page_size = 4096
            byte_order = "big"

            [allocation]
            strategy = "length-plus-percent"
            default_capacity = 128
            min_capacity = 16
            percent_on_top = 20
            "#,
        )
        .unwrap();

        assert_eq!(config.page_size, 4096);
        assert_eq!(config.byte_order, ByteOrder::Big);
        assert_eq!(config.scratch_buffers, DEFAULT_SCRATCH_BUFFERS);
        assert_eq!(config.cache_pages, DEFAULT_CACHE_PAGES);
        assert_eq!(
            config.allocation,
            AllocationConfig::LengthPlusPercent {
                default_capacity: 128,
                min_capacity: 16,
                percent_on_top: 20,
            }
        );
        let strategy = config.allocation.build().unwrap();
        assert_eq!(strategy.capacity(100, 128).unwrap(), 120);
    }

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config = StorageConfig::from_toml_str("").unwrap();
        assert_eq!(config, StorageConfig::default());
    }

    #[test]
    fn test_invalid_toml() {
        assert!(matches!(
            StorageConfig::from_toml_str("page_size = \"large\""),
            Err(BlobStoreError::ConfigParse(_))
        ));
        assert!(matches!(
            StorageConfig::from_toml_str("[allocation]\nstrategy = \"writer-decides\"\ndefault_capacity = 0"),
            Err(BlobStoreError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage.toml");
        std::fs::write(&path, "page_size = 8192\n").unwrap();
        let config = StorageConfig::load(&path).unwrap();
        assert_eq!(config.page_size, 8192);
    }

    #[test]
    fn test_toml_round_trip() {
        let config = StorageConfig::new().with_page_size(65536);
        let text = toml::to_string(&config).unwrap();
        assert_eq!(StorageConfig::from_toml_str(&text).unwrap(), config);
    }
}
