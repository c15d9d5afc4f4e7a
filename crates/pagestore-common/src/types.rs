//! Core type definitions and constants for pagestore

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};

/// Floor applied to every configured page size (8 KB)
pub const MIN_PAGE_SIZE: usize = 8 * 1024;

/// Page size used when the caller does not specify one (1 MB)
pub const DEFAULT_PAGE_SIZE: usize = 1024 * 1024;

/// Exclusive upper bound on page indices within one storage
pub const MAX_PAGES_COUNT: u64 = u32::MAX as u64;

/// Chunk size used when zero-filling a grown file
pub const MAX_FILLER_SIZE: usize = 8192;

/// Opaque per-storage handle issued by the buffer cache.
///
/// Combined with a page number it forms the cache key of a resident page.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, From, Into,
)]
#[display("storage#{_0}")]
pub struct StorageId(u32);

impl StorageId {
    /// Create from a raw index
    #[must_use]
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    /// Get the raw index
    #[must_use]
    pub const fn index(self) -> u32 {
        self.0
    }
}

/// Normalize a requested page size: `0` selects the default, and any value
/// below the floor is raised to [`MIN_PAGE_SIZE`].
#[must_use]
pub fn effective_page_size(requested: usize) -> usize {
    let size = if requested > 0 {
        requested
    } else {
        DEFAULT_PAGE_SIZE
    };
    size.max(MIN_PAGE_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_page_size() {
        assert_eq!(effective_page_size(0), DEFAULT_PAGE_SIZE);
        assert_eq!(effective_page_size(512), MIN_PAGE_SIZE);
        assert_eq!(effective_page_size(64 * 1024), 64 * 1024);
    }

    #[test]
    fn test_storage_id_display() {
        let id = StorageId::new(7);
        assert_eq!(id.to_string(), "storage#7");
        assert_eq!(u32::from(id), 7);
    }
}
