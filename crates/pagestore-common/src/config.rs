//! Configuration types for pagestore
//!
//! All page-size and alignment configuration is supplied at open time;
//! nothing is persisted in the storage file itself.

use crate::error::{Error, Result};
use crate::types::{effective_page_size, DEFAULT_PAGE_SIZE, MIN_PAGE_SIZE};
use serde::{Deserialize, Serialize};

/// Root configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Defaults for storages opened by tools
    #[serde(default)]
    pub storage: StorageConfig,
    /// Shared page and channel cache configuration
    #[serde(default)]
    pub cache: CacheConfig,
}

impl Config {
    /// Validate every section
    pub fn validate(&self) -> Result<()> {
        self.storage.validate()?;
        self.cache.validate()
    }
}

/// Per-storage open options
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Page size in bytes; 0 selects the default, values below 8 KB are raised
    pub page_size: usize,
    /// Typed values never straddle a page boundary (enables single-page fast path)
    pub values_aligned: bool,
    /// Encode typed values in native byte order instead of big-endian
    pub native_byte_order: bool,
    /// Reject every mutating call
    pub read_only: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            values_aligned: false,
            native_byte_order: false,
            read_only: false,
        }
    }
}

impl StorageConfig {
    /// Builder-style page size override
    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Builder-style alignment mode
    #[must_use]
    pub fn with_values_aligned(mut self, aligned: bool) -> Self {
        self.values_aligned = aligned;
        self
    }

    /// Builder-style byte order
    #[must_use]
    pub fn with_native_byte_order(mut self, native: bool) -> Self {
        self.native_byte_order = native;
        self
    }

    /// Builder-style read-only flag
    #[must_use]
    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Page size after applying the default and the floor
    #[must_use]
    pub fn effective_page_size(&self) -> usize {
        effective_page_size(self.page_size)
    }

    pub fn validate(&self) -> Result<()> {
        // u32 offsets within a page are assumed throughout the engine
        if self.effective_page_size() > u32::MAX as usize {
            return Err(Error::configuration(format!(
                "page size {} exceeds {}",
                self.page_size,
                u32::MAX
            )));
        }
        Ok(())
    }
}

/// Shared cache configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Upper bound on resident page bytes across all storages
    pub capacity_bytes: usize,
    /// Optional upper bound on resident page count (0 = bytes bound only)
    pub max_pages: usize,
    /// Number of open file handles kept by the channel cache
    pub channel_cache_size: usize,
    /// Pool open file handles; when off every access opens a one-shot handle
    pub use_channel_cache: bool,
    /// Flushes slower than this are reported (0 disables the report)
    pub slow_flush_threshold_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: 256 * 1024 * 1024, // 256 MB
            max_pages: 0,
            channel_cache_size: 150,
            use_channel_cache: true,
            slow_flush_threshold_ms: 500,
        }
    }
}

impl CacheConfig {
    /// Configuration sized for a handful of pages (tests, tools)
    #[must_use]
    pub fn with_capacity(capacity_bytes: usize) -> Self {
        Self {
            capacity_bytes,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.capacity_bytes < MIN_PAGE_SIZE {
            return Err(Error::configuration(format!(
                "cache capacity {} is smaller than one page ({})",
                self.capacity_bytes, MIN_PAGE_SIZE
            )));
        }
        if self.use_channel_cache && self.channel_cache_size == 0 {
            return Err(Error::configuration(
                "channel cache enabled with zero size",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.storage.effective_page_size(), DEFAULT_PAGE_SIZE);
        assert!(config.cache.use_channel_cache);
    }

    #[test]
    fn test_page_size_floor() {
        let cfg = StorageConfig::default().with_page_size(1024);
        assert_eq!(cfg.effective_page_size(), MIN_PAGE_SIZE);
    }

    #[test]
    fn test_cache_too_small() {
        let cfg = CacheConfig::with_capacity(100);
        assert!(matches!(cfg.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_parse_partial_toml() {
        let text = r#"
            [storage]
            page_size = 16384
            values_aligned = true

            [cache]
            capacity_bytes = 1048576
            use_channel_cache = false
        "#;
        let config: Config = toml::from_str(text).unwrap();
        assert_eq!(config.storage.page_size, 16384);
        assert!(config.storage.values_aligned);
        assert!(!config.storage.read_only);
        assert_eq!(config.cache.capacity_bytes, 1024 * 1024);
        assert!(!config.cache.use_channel_cache);
        assert_eq!(config.cache.channel_cache_size, 150);
        assert!(config.validate().is_ok());
    }
}
