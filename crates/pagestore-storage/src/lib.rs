//! pagestore storage engine - paged access to flat files
//!
//! This crate implements the engine behind `PagedFileStorage`:
//! - Pooled file handles (channel cache)
//! - Page buffers with lock counts and dirty tracking
//! - A bounded page cache shared across storages, with LRU eviction
//! - A per-storage fast cache of the most recently touched pages
//! - A reentrant read/write lock context shared by groups of storages

pub mod buffer;
pub mod cache;
pub mod channel;
pub mod fast_cache;
pub mod lock;
pub mod storage;

// Re-exports
pub use buffer::{BufferWrapper, ByteOrder};
pub use cache::{BufferCache, CacheCapacity, CacheStats, PageKey, PageOwner};
pub use channel::{Channel, ChannelCache, ChannelGuard, ChannelStats, DEFAULT_CHANNEL_CACHE_SIZE};
pub use fast_cache::{FAST_CACHE_SLOTS, FastPageCache};
pub use lock::{StorageLockContext, StorageReadGuard, StorageWriteGuard};
pub use storage::{FileReader, IoStats, PageGuard, PagedFileStorage};
