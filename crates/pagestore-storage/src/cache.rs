//! Shared page cache
//!
//! All open storages share one bounded pool of page buffers. Pages are keyed
//! by `(storage id, page index)`; a reverse index per storage supports bulk
//! flush and unmap when a storage is forced, resized or closed.
//!
//! Eviction picks the least recently used page that nobody holds locked. A
//! dirty victim is written back synchronously before its memory is
//! reclaimed, and a failed write-back is reported to the caller that needed
//! the room: silently dropping a dirty page would lose data.

use crate::buffer::BufferWrapper;
use pagestore_common::{CacheConfig, Error, Result, StorageId};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use tracing::{debug, warn};

/// The file behind a set of cached pages.
///
/// Implemented by the paged storage; the cache only holds weak references
/// to owners.
pub trait PageOwner: Send + Sync {
    fn path(&self) -> &Path;

    fn is_read_only(&self) -> bool;

    /// Fill `buf` from the file at `position`; returns bytes actually read
    /// (short at EOF, zero past it)
    fn read_page(&self, position: u64, buf: &mut [u8]) -> Result<usize>;

    /// Write `data` to the file at `position`
    fn write_page(&self, position: u64, data: &[u8]) -> Result<()>;
}

/// Cache key uniquely identifies a page across all storages
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageKey {
    pub storage: StorageId,
    pub page: u64,
}

impl PageKey {
    pub fn new(storage: StorageId, page: u64) -> Self {
        Self { storage, page }
    }
}

impl fmt::Display for PageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/page#{}", self.storage, self.page)
    }
}

/// Cache capacity can be specified by page count or memory size
#[derive(Debug, Clone, Copy)]
pub enum CacheCapacity {
    /// Maximum number of resident pages
    Entries(usize),
    /// Maximum resident page bytes
    Bytes(usize),
}

impl Default for CacheCapacity {
    fn default() -> Self {
        CacheCapacity::Bytes(CacheConfig::default().capacity_bytes)
    }
}

/// Cache statistics for monitoring
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Lookups served from the shared cache
    pub hits: AtomicU64,
    /// Lookups that had to load the page
    pub misses: AtomicU64,
    /// Lookups served by a storage's own fast cache
    pub fast_cache_hits: AtomicU64,
    /// File accesses that bypassed the channel cache
    pub uncached_file_accesses: AtomicU64,
    /// Pages read from storage files
    pub loads: AtomicU64,
    /// Pages reclaimed to make room
    pub evictions: AtomicU64,
    /// Dirty pages written back to their file
    pub writebacks: AtomicU64,
    /// Loads admitted over capacity because every resident page was locked
    pub overflows: AtomicU64,
}

impl CacheStats {
    /// Calculate hit ratio (0.0 to 1.0), counting fast-cache hits as hits
    pub fn hit_ratio(&self) -> f64 {
        let hits =
            self.hits.load(Ordering::Relaxed) + self.fast_cache_hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            return 0.0;
        }
        hits as f64 / total as f64
    }

    /// Reset all statistics
    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.fast_cache_hits.store(0, Ordering::Relaxed);
        self.uncached_file_accesses.store(0, Ordering::Relaxed);
        self.loads.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
        self.writebacks.store(0, Ordering::Relaxed);
        self.overflows.store(0, Ordering::Relaxed);
    }
}

struct OwnerEntry {
    owner: Weak<dyn PageOwner>,
    page_size: usize,
    pages: BTreeSet<u64>,
    /// Bumped whenever a page of this owner is written back and dropped;
    /// a load started before the bump may have read stale bytes
    generation: u64,
}

#[derive(Default)]
struct CacheState {
    pages: HashMap<PageKey, Arc<BufferWrapper>>,
    owners: HashMap<StorageId, OwnerEntry>,
    resident_bytes: usize,
    next_index: u32,
    free_indices: Vec<u32>,
}

impl CacheState {
    fn remove_page(&mut self, key: PageKey) -> Option<Arc<BufferWrapper>> {
        let wrapper = self.pages.remove(&key)?;
        self.resident_bytes = self.resident_bytes.saturating_sub(wrapper.len());
        if let Some(owner) = self.owners.get_mut(&key.storage) {
            owner.pages.remove(&key.page);
        }
        Some(wrapper)
    }

    /// Drop a released wrapper from the map and free its bytes
    fn reclaim(&mut self, wrapper: &BufferWrapper, written_back: bool) {
        let key = wrapper.key();
        self.remove_page(key);
        if written_back {
            if let Some(owner) = self.owners.get_mut(&key.storage) {
                owner.generation += 1;
            }
        }
        wrapper.discard();
    }
}

/// Bounded page cache shared by every storage of a lock context
pub struct BufferCache {
    state: RwLock<CacheState>,
    capacity: CacheCapacity,
    /// Logical clock for LRU ordering
    clock: AtomicU64,
    stats: CacheStats,
}

impl BufferCache {
    /// Create a new cache with the given capacity
    pub fn new(capacity: CacheCapacity) -> Self {
        Self {
            state: RwLock::new(CacheState::default()),
            capacity,
            clock: AtomicU64::new(0),
            stats: CacheStats::default(),
        }
    }

    /// Create a cache from configuration; a page-count bound wins over bytes
    pub fn from_config(config: &CacheConfig) -> Self {
        let capacity = if config.max_pages > 0 {
            CacheCapacity::Entries(config.max_pages)
        } else {
            CacheCapacity::Bytes(config.capacity_bytes)
        };
        Self::new(capacity)
    }

    /// Process-wide cache used by the default lock context
    pub fn global() -> Arc<BufferCache> {
        static GLOBAL: OnceLock<Arc<BufferCache>> = OnceLock::new();
        GLOBAL
            .get_or_init(|| Arc::new(BufferCache::from_config(&CacheConfig::default())))
            .clone()
    }

    pub fn capacity(&self) -> CacheCapacity {
        self.capacity
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Number of resident pages
    pub fn len(&self) -> usize {
        self.state.read().pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().pages.is_empty()
    }

    /// Total bytes of resident pages
    pub fn resident_bytes(&self) -> usize {
        self.state.read().resident_bytes
    }

    pub fn contains(&self, key: &PageKey) -> bool {
        self.state.read().pages.contains_key(key)
    }

    /// Number of resident pages owned by `storage`
    pub fn pages_for(&self, storage: StorageId) -> usize {
        self.state
            .read()
            .owners
            .get(&storage)
            .map_or(0, |owner| owner.pages.len())
    }

    pub fn is_registered(&self, storage: StorageId) -> bool {
        self.state.read().owners.contains_key(&storage)
    }

    pub fn increment_fast_cache_hits_count(&self) {
        self.stats.fast_cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_uncached_file_access(&self) {
        self.stats
            .uncached_file_accesses
            .fetch_add(1, Ordering::Relaxed);
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Register a storage and assign the id that prefixes its page keys
    pub fn register_storage(&self, owner: Weak<dyn PageOwner>, page_size: usize) -> StorageId {
        let mut state = self.state.write();
        let index = match state.free_indices.pop() {
            Some(index) => index,
            None => {
                let index = state.next_index;
                state.next_index += 1;
                index
            }
        };
        let id = StorageId::new(index);
        state.owners.insert(
            id,
            OwnerEntry {
                owner,
                page_size,
                pages: BTreeSet::new(),
                generation: 0,
            },
        );
        id
    }

    /// Forget a storage and recycle its id.
    ///
    /// Pages still resident are dropped without write-back; callers unmap
    /// first.
    pub fn remove_storage(&self, storage: StorageId) {
        let mut state = self.state.write();
        let Some(owner) = state.owners.remove(&storage) else {
            return;
        };
        if !owner.pages.is_empty() {
            warn!(
                "Removing {} with {} resident page(s) still mapped",
                storage,
                owner.pages.len()
            );
            for page in owner.pages {
                if let Some(wrapper) = state.pages.remove(&PageKey::new(storage, page)) {
                    state.resident_bytes = state.resident_bytes.saturating_sub(wrapper.len());
                }
            }
        }
        state.free_indices.push(storage.index());
    }

    /// Return the resident wrapper for `key`, loading it from the owner on
    /// a miss.
    ///
    /// The wrapper is returned unlocked; callers must `try_lock` it and
    /// resolve again if that fails. `check_access` controls whether the
    /// lookup counts as a use for LRU ordering.
    ///
    /// On a miss the page is read from the owner without holding the cache
    /// lock. The read is discarded if another thread installed the page
    /// meanwhile, and repeated if a page of the same owner was written back
    /// and dropped while it ran.
    pub fn get(&self, key: PageKey, read_only: bool, check_access: bool) -> Result<Arc<BufferWrapper>> {
        loop {
            let (weak_owner, page_size, generation) = {
                let state = self.state.read();
                if let Some(wrapper) = self.resident(&state, key, check_access) {
                    return Ok(wrapper);
                }
                let entry = Self::owner_entry(&state, key.storage)?;
                (entry.owner.clone(), entry.page_size, entry.generation)
            };

            let owner = weak_owner.upgrade().ok_or_else(|| {
                Error::storage(format!("owner of {} has been dropped", key.storage))
            })?;
            if !read_only && owner.is_read_only() {
                return Err(Error::ReadOnly {
                    path: owner.path().to_path_buf(),
                });
            }

            let position = key.page * page_size as u64;
            let mut data = vec![0u8; page_size].into_boxed_slice();
            let valid_len = owner.read_page(position, &mut data)?;
            self.stats.loads.fetch_add(1, Ordering::Relaxed);

            let mut state = self.state.write();
            // Another thread may have loaded it meanwhile
            if let Some(wrapper) = self.resident(&state, key, true) {
                return Ok(wrapper);
            }
            if Self::owner_entry(&state, key.storage)?.generation != generation {
                debug!("Reloading {} after a concurrent write-back", key);
                continue;
            }
            self.stats.misses.fetch_add(1, Ordering::Relaxed);

            self.make_room(&mut state, page_size)?;

            let wrapper = Arc::new(BufferWrapper::new(
                key,
                position,
                data,
                valid_len,
                weak_owner,
                self.tick(),
            ));
            state.pages.insert(key, wrapper.clone());
            state.resident_bytes += page_size;
            if let Some(entry) = state.owners.get_mut(&key.storage) {
                entry.pages.insert(key.page);
            }
            return Ok(wrapper);
        }
    }

    fn resident(&self, state: &CacheState, key: PageKey, check_access: bool) -> Option<Arc<BufferWrapper>> {
        let wrapper = state.pages.get(&key).filter(|wrapper| !wrapper.is_released())?;
        if check_access {
            wrapper.touch(self.tick());
        }
        self.stats.hits.fetch_add(1, Ordering::Relaxed);
        Some(wrapper.clone())
    }

    fn owner_entry(state: &CacheState, storage: StorageId) -> Result<&OwnerEntry> {
        state.owners.get(&storage).ok_or_else(|| {
            Error::storage(format!("{storage} is not registered with the page cache"))
        })
    }

    fn over_capacity(&self, state: &CacheState, incoming: usize) -> bool {
        match self.capacity {
            CacheCapacity::Entries(max) => state.pages.len() + 1 > max,
            CacheCapacity::Bytes(max) => state.resident_bytes + incoming > max,
        }
    }

    /// Evict unlocked pages until `incoming` more bytes fit
    fn make_room(&self, state: &mut CacheState, incoming: usize) -> Result<()> {
        while self.over_capacity(state, incoming) {
            let victim = state
                .pages
                .values()
                .filter(|wrapper| !wrapper.is_locked() && !wrapper.is_released())
                .min_by_key(|wrapper| wrapper.last_access())
                .cloned();

            let Some(victim) = victim else {
                self.stats.overflows.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "All {} resident pages are locked, admitting page over capacity",
                    state.pages.len()
                );
                break;
            };

            // Lost a race with a locker; pick again
            if !victim.try_release() {
                continue;
            }

            let written_back = match victim.flush() {
                Ok(written_back) => written_back,
                Err(e) => {
                    victim.restore();
                    warn!("Failed to write back page {}: {}", victim.key(), e);
                    return Err(e);
                }
            };
            if written_back {
                self.stats.writebacks.fetch_add(1, Ordering::Relaxed);
                debug!("Wrote back dirty page {} before eviction", victim.key());
            }

            state.reclaim(&victim, written_back);
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Write back every dirty page of `storage`, keeping pages resident.
    ///
    /// Every page is attempted; the first failure is returned.
    pub fn flush_buffers_for_owner(&self, storage: StorageId) -> Result<usize> {
        let wrappers = self.owner_wrappers(storage);

        let mut flushed = 0;
        let mut first_error = None;
        for wrapper in wrappers {
            match wrapper.flush() {
                Ok(true) => flushed += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!("Failed to flush page {}: {}", wrapper.key(), e);
                    first_error.get_or_insert(e);
                }
            }
        }
        self.stats
            .writebacks
            .fetch_add(flushed as u64, Ordering::Relaxed);

        match first_error {
            Some(e) => Err(e),
            None => Ok(flushed),
        }
    }

    /// Write back and remove every resident page of `storage`.
    ///
    /// Locked pages stay mapped and are reported as an error, so bytes
    /// written through a live lock are never orphaned. Unlocked pages are
    /// removed even when their write-back fails. The first failure is
    /// returned.
    pub fn unmap_buffers_for_owner(&self, storage: StorageId) -> Result<()> {
        let mut state = self.state.write();
        let pages: Vec<u64> = match state.owners.get(&storage) {
            Some(owner) => owner.pages.iter().copied().collect(),
            None => return Ok(()),
        };

        let mut first_error = None;
        for page in pages {
            let Some(wrapper) = state.pages.get(&PageKey::new(storage, page)).cloned() else {
                continue;
            };
            if !wrapper.try_release() {
                warn!("Page {} is locked, leaving it mapped", wrapper.key());
                first_error.get_or_insert_with(|| {
                    Error::storage(format!("page {} is locked and can't be unmapped", wrapper.key()))
                });
                continue;
            }
            let written_back = match wrapper.flush() {
                Ok(written_back) => written_back,
                Err(e) => {
                    warn!("Failed to write back page {} on unmap: {}", wrapper.key(), e);
                    first_error.get_or_insert(e);
                    false
                }
            };
            if written_back {
                self.stats.writebacks.fetch_add(1, Ordering::Relaxed);
            }
            state.reclaim(&wrapper, written_back);
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn owner_wrappers(&self, storage: StorageId) -> Vec<Arc<BufferWrapper>> {
        let state = self.state.read();
        let Some(owner) = state.owners.get(&storage) else {
            return Vec::new();
        };
        owner
            .pages
            .iter()
            .filter_map(|page| state.pages.get(&PageKey::new(storage, *page)).cloned())
            .collect()
    }
}

impl Default for BufferCache {
    fn default() -> Self {
        Self::new(CacheCapacity::default())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicBool;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    /// In-memory page owner recording every write-back
    pub(crate) struct MemoryOwner {
        pub path: PathBuf,
        pub read_only: bool,
        pub content: Mutex<Vec<u8>>,
        pub writes: Mutex<Vec<(u64, Vec<u8>)>>,
        pub fail_writes: AtomicBool,
        /// The next read at this position blocks until `release_read` is set
        pub hold_read_at: Mutex<Option<u64>>,
        pub read_held: AtomicBool,
        pub release_read: AtomicBool,
    }

    impl MemoryOwner {
        pub fn wait_for_held_read(&self) {
            while !self.read_held.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(1));
            }
        }
    }

    impl Default for MemoryOwner {
        fn default() -> Self {
            Self {
                path: PathBuf::from("/memory/owner"),
                read_only: false,
                content: Mutex::new(Vec::new()),
                writes: Mutex::new(Vec::new()),
                fail_writes: AtomicBool::new(false),
                hold_read_at: Mutex::new(None),
                read_held: AtomicBool::new(false),
                release_read: AtomicBool::new(false),
            }
        }
    }

    impl PageOwner for MemoryOwner {
        fn path(&self) -> &Path {
            &self.path
        }

        fn is_read_only(&self) -> bool {
            self.read_only
        }

        fn read_page(&self, position: u64, buf: &mut [u8]) -> Result<usize> {
            let content = self.content.lock().clone();
            let hold = {
                let mut hold_at = self.hold_read_at.lock();
                let hold = *hold_at == Some(position);
                if hold {
                    *hold_at = None;
                }
                hold
            };
            if hold {
                self.read_held.store(true, Ordering::SeqCst);
                while !self.release_read.load(Ordering::SeqCst) {
                    thread::sleep(Duration::from_millis(1));
                }
            }
            let start = (position as usize).min(content.len());
            let end = (start + buf.len()).min(content.len());
            buf[..end - start].copy_from_slice(&content[start..end]);
            Ok(end - start)
        }

        fn write_page(&self, position: u64, data: &[u8]) -> Result<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(Error::storage("injected write failure"));
            }
            let mut content = self.content.lock();
            let end = position as usize + data.len();
            if content.len() < end {
                content.resize(end, 0);
            }
            content[position as usize..end].copy_from_slice(data);
            self.writes.lock().push((position, data.to_vec()));
            Ok(())
        }
    }

    const PAGE: usize = 64;

    fn register(cache: &BufferCache, owner: &Arc<MemoryOwner>) -> StorageId {
        let weak: Weak<dyn PageOwner> = Arc::downgrade(owner) as Weak<dyn PageOwner>;
        cache.register_storage(weak, PAGE)
    }

    fn locked(cache: &BufferCache, key: PageKey) -> Arc<BufferWrapper> {
        let wrapper = cache.get(key, false, true).unwrap();
        assert!(wrapper.try_lock());
        wrapper
    }

    #[test]
    fn test_load_reads_owner_content() {
        let cache = BufferCache::new(CacheCapacity::Entries(8));
        let owner = Arc::new(MemoryOwner::default());
        *owner.content.lock() = (0..100u8).collect();
        let id = register(&cache, &owner);

        let first = cache.get(PageKey::new(id, 0), true, true).unwrap();
        assert_eq!(first.get(10), 10);
        assert_eq!(first.valid_len(), PAGE);

        // Page 1 is short, page 2 lies past EOF
        let second = cache.get(PageKey::new(id, 1), true, true).unwrap();
        assert_eq!(second.valid_len(), 100 - PAGE);
        assert_eq!(second.get(0), PAGE as u8);
        let third = cache.get(PageKey::new(id, 2), false, true).unwrap();
        assert_eq!(third.valid_len(), 0);
        assert_eq!(third.get(0), 0);

        assert_eq!(cache.stats().misses.load(Ordering::Relaxed), 3);
        cache.get(PageKey::new(id, 0), true, true).unwrap();
        assert_eq!(cache.stats().hits.load(Ordering::Relaxed), 1);
        assert_eq!(cache.pages_for(id), 3);
    }

    #[test]
    fn test_lru_eviction_skips_locked() {
        let cache = BufferCache::new(CacheCapacity::Entries(2));
        let owner = Arc::new(MemoryOwner::default());
        let id = register(&cache, &owner);

        let pinned = locked(&cache, PageKey::new(id, 0));
        cache.get(PageKey::new(id, 1), false, true).unwrap();
        cache.get(PageKey::new(id, 2), false, true).unwrap();

        // Page 0 is older but locked, so page 1 went
        assert!(cache.contains(&PageKey::new(id, 0)));
        assert!(!cache.contains(&PageKey::new(id, 1)));
        assert!(cache.contains(&PageKey::new(id, 2)));
        assert_eq!(cache.len(), 2);
        pinned.unlock();
    }

    #[test]
    fn test_lru_ordering() {
        let cache = BufferCache::new(CacheCapacity::Entries(2));
        let owner = Arc::new(MemoryOwner::default());
        let id = register(&cache, &owner);

        cache.get(PageKey::new(id, 1), false, true).unwrap();
        cache.get(PageKey::new(id, 2), false, true).unwrap();
        // Touch page 1 so page 2 becomes the LRU
        cache.get(PageKey::new(id, 1), false, true).unwrap();
        cache.get(PageKey::new(id, 3), false, true).unwrap();

        assert!(cache.contains(&PageKey::new(id, 1)));
        assert!(!cache.contains(&PageKey::new(id, 2)));
    }

    #[test]
    fn test_unchecked_access_does_not_promote() {
        let cache = BufferCache::new(CacheCapacity::Entries(2));
        let owner = Arc::new(MemoryOwner::default());
        let id = register(&cache, &owner);

        cache.get(PageKey::new(id, 1), false, true).unwrap();
        cache.get(PageKey::new(id, 2), false, true).unwrap();
        cache.get(PageKey::new(id, 1), true, false).unwrap();
        cache.get(PageKey::new(id, 3), false, true).unwrap();

        assert!(!cache.contains(&PageKey::new(id, 1)));
        assert!(cache.contains(&PageKey::new(id, 2)));
    }

    #[test]
    fn test_dirty_eviction_writes_back() {
        let cache = BufferCache::new(CacheCapacity::Entries(1));
        let owner = Arc::new(MemoryOwner::default());
        let id = register(&cache, &owner);

        let page = locked(&cache, PageKey::new(id, 3));
        page.put_from_slice(0, b"dirty");
        page.unlock();

        cache.get(PageKey::new(id, 4), false, true).unwrap();

        assert!(page.is_released());
        assert_eq!(cache.stats().writebacks.load(Ordering::Relaxed), 1);
        assert_eq!(cache.stats().evictions.load(Ordering::Relaxed), 1);
        let content = owner.content.lock();
        assert_eq!(&content[3 * PAGE..3 * PAGE + 5], b"dirty");
    }

    #[test]
    fn test_failed_write_back_propagates() {
        let cache = BufferCache::new(CacheCapacity::Entries(1));
        let owner = Arc::new(MemoryOwner::default());
        let id = register(&cache, &owner);

        let page = locked(&cache, PageKey::new(id, 0));
        page.put(0, 7);
        page.unlock();

        owner.fail_writes.store(true, Ordering::SeqCst);
        assert!(cache.get(PageKey::new(id, 1), false, true).is_err());

        // Victim kept, still dirty and usable
        assert!(cache.contains(&PageKey::new(id, 0)));
        assert!(page.is_dirty());
        assert!(page.try_lock());
        page.unlock();

        owner.fail_writes.store(false, Ordering::SeqCst);
        assert!(cache.get(PageKey::new(id, 1), false, true).is_ok());
        assert_eq!(owner.content.lock()[0], 7);
    }

    #[test]
    fn test_overflow_when_everything_locked() {
        let cache = BufferCache::new(CacheCapacity::Entries(1));
        let owner = Arc::new(MemoryOwner::default());
        let id = register(&cache, &owner);

        let a = locked(&cache, PageKey::new(id, 0));
        let b = locked(&cache, PageKey::new(id, 1));

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.stats().overflows.load(Ordering::Relaxed), 1);
        a.unlock();
        b.unlock();

        // Next load brings the cache back within bounds
        cache.get(PageKey::new(id, 2), false, true).unwrap();
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_byte_capacity_mixed_page_sizes() {
        let cache = BufferCache::new(CacheCapacity::Bytes(4 * PAGE));
        let small = Arc::new(MemoryOwner::default());
        let big = Arc::new(MemoryOwner::default());
        let small_id = register(&cache, &small);
        let big_weak: Weak<dyn PageOwner> = Arc::downgrade(&big) as Weak<dyn PageOwner>;
        let big_id = cache.register_storage(big_weak, 3 * PAGE);

        cache.get(PageKey::new(small_id, 0), false, true).unwrap();
        cache.get(PageKey::new(small_id, 1), false, true).unwrap();
        cache.get(PageKey::new(big_id, 0), false, true).unwrap();

        assert!(cache.resident_bytes() <= 4 * PAGE);
        assert!(cache.contains(&PageKey::new(big_id, 0)));
        assert_eq!(cache.pages_for(small_id), 1);
    }

    #[test]
    fn test_flush_for_owner_keeps_pages() {
        let cache = BufferCache::new(CacheCapacity::Entries(8));
        let a = Arc::new(MemoryOwner::default());
        let b = Arc::new(MemoryOwner::default());
        let id_a = register(&cache, &a);
        let id_b = register(&cache, &b);

        for (id, byte) in [(id_a, 1u8), (id_b, 2u8)] {
            let page = locked(&cache, PageKey::new(id, 0));
            page.put(0, byte);
            page.unlock();
        }

        assert_eq!(cache.flush_buffers_for_owner(id_a).unwrap(), 1);
        assert_eq!(a.writes.lock().len(), 1);
        assert!(b.writes.lock().is_empty());
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.flush_buffers_for_owner(id_a).unwrap(), 0);
    }

    #[test]
    fn test_unmap_for_owner_writes_back_and_removes() {
        let cache = BufferCache::new(CacheCapacity::Entries(8));
        let owner = Arc::new(MemoryOwner::default());
        let id = register(&cache, &owner);

        for page in 0..3 {
            let wrapper = locked(&cache, PageKey::new(id, page));
            wrapper.put(1, page as u8 + 10);
            wrapper.unlock();
        }

        cache.unmap_buffers_for_owner(id).unwrap();
        assert_eq!(cache.pages_for(id), 0);
        assert!(cache.is_empty());
        assert_eq!(owner.writes.lock().len(), 3);
        assert_eq!(owner.content.lock()[2 * PAGE + 1], 12);
    }

    #[test]
    fn test_register_recycles_ids() {
        let cache = BufferCache::new(CacheCapacity::Entries(8));
        let owner = Arc::new(MemoryOwner::default());
        let first = register(&cache, &owner);
        let second = register(&cache, &owner);
        assert_ne!(first, second);

        cache.get(PageKey::new(first, 0), false, true).unwrap();
        cache.remove_storage(first);
        assert!(!cache.is_registered(first));
        assert!(cache.is_empty());
        assert!(cache.get(PageKey::new(first, 0), false, true).is_err());

        assert_eq!(register(&cache, &owner), first);
    }

    #[test]
    fn test_read_only_owner_rejects_write_load() {
        let cache = BufferCache::new(CacheCapacity::Entries(8));
        let owner = Arc::new(MemoryOwner {
            read_only: true,
            ..MemoryOwner::default()
        });
        let id = register(&cache, &owner);

        let err = cache.get(PageKey::new(id, 0), false, true).unwrap_err();
        assert!(matches!(err, Error::ReadOnly { .. }));
        assert!(cache.get(PageKey::new(id, 0), true, true).is_ok());
    }

    #[test]
    fn test_hit_ratio_counts_fast_hits() {
        let cache = BufferCache::new(CacheCapacity::Entries(8));
        let owner = Arc::new(MemoryOwner::default());
        let id = register(&cache, &owner);

        cache.get(PageKey::new(id, 0), false, true).unwrap();
        cache.increment_fast_cache_hits_count();
        assert!((cache.stats().hit_ratio() - 0.5).abs() < 0.01);

        cache.stats().reset();
        assert_eq!(cache.stats().hit_ratio(), 0.0);
    }

    #[test]
    fn test_evicted_page_memory_is_freed() {
        let cache = BufferCache::new(CacheCapacity::Entries(2));
        let owner = Arc::new(MemoryOwner::default());
        let id = register(&cache, &owner);

        // Hold on to every wrapper the way a storage's fast cache does
        let mut held = Vec::new();
        for page in 0..6 {
            let wrapper = locked(&cache, PageKey::new(id, page));
            wrapper.put(0, page as u8 + 1);
            wrapper.unlock();
            held.push(wrapper);
        }

        let retained: usize = held
            .iter()
            .filter(|wrapper| wrapper.is_released())
            .map(|wrapper| wrapper.len())
            .sum();
        assert_eq!(held.iter().filter(|wrapper| wrapper.is_released()).count(), 4);
        assert_eq!(retained, 0);
        assert_eq!(cache.resident_bytes(), 2 * PAGE);
        assert_eq!(owner.content.lock()[3 * PAGE], 4);
    }

    #[test]
    fn test_unmap_keeps_locked_pages() {
        let cache = BufferCache::new(CacheCapacity::Entries(8));
        let owner = Arc::new(MemoryOwner::default());
        let id = register(&cache, &owner);

        let busy = locked(&cache, PageKey::new(id, 0));
        let idle = locked(&cache, PageKey::new(id, 1));
        idle.put(0, 1);
        idle.unlock();

        assert!(cache.unmap_buffers_for_owner(id).is_err());
        assert!(cache.contains(&PageKey::new(id, 0)));
        assert!(!cache.contains(&PageKey::new(id, 1)));
        assert!(idle.is_empty());

        // Bytes written through the surviving lock still reach the owner
        busy.put(5, 9);
        busy.unlock();
        cache.unmap_buffers_for_owner(id).unwrap();
        assert!(cache.is_empty());
        assert_eq!(owner.content.lock()[5], 9);
    }

    #[test]
    fn test_miss_reads_outside_cache_lock() {
        let cache = BufferCache::new(CacheCapacity::Entries(8));
        let owner = Arc::new(MemoryOwner::default());
        let id = register(&cache, &owner);
        cache.get(PageKey::new(id, 0), false, true).unwrap();

        *owner.hold_read_at.lock() = Some(PAGE as u64);
        thread::scope(|s| {
            s.spawn(|| cache.get(PageKey::new(id, 1), false, true).unwrap());
            owner.wait_for_held_read();

            // Hits and other loads proceed while page 1 is being read
            let (tx, rx) = mpsc::channel();
            let cache = &cache;
            s.spawn(move || {
                let hit = cache.get(PageKey::new(id, 0), false, true).is_ok();
                let load = cache.get(PageKey::new(id, 2), false, true).is_ok();
                let _ = tx.send(hit && load);
            });
            let served = rx.recv_timeout(Duration::from_secs(5));
            owner.release_read.store(true, Ordering::SeqCst);
            assert_eq!(served, Ok(true));
        });
        assert!(cache.contains(&PageKey::new(id, 1)));
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn test_load_retries_after_concurrent_write_back() {
        let cache = BufferCache::new(CacheCapacity::Entries(1));
        let owner = Arc::new(MemoryOwner::default());
        let id = register(&cache, &owner);

        *owner.hold_read_at.lock() = Some(PAGE as u64);
        let reloaded = thread::scope(|s| {
            let slow = s.spawn(|| cache.get(PageKey::new(id, 1), true, true).unwrap());
            owner.wait_for_held_read();

            // While the slow read holds stale bytes, page 1 is loaded,
            // written and evicted with a write-back
            let page = locked(&cache, PageKey::new(id, 1));
            page.put(0, 42);
            page.unlock();
            cache.get(PageKey::new(id, 2), false, true).unwrap();
            assert!(page.is_released());

            owner.release_read.store(true, Ordering::SeqCst);
            slow.join().unwrap()
        });
        assert_eq!(reloaded.get(0), 42);
    }
}
