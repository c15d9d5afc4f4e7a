//! Pooled file handles
//!
//! Opening and closing a file for every page load is expensive, so open
//! handles ("channels") are pooled by path with a reference count. A handle
//! is only closed once nobody is using it and it is either evicted to make
//! room or closed explicitly.
//!
//! All access is scoped: [`ChannelCache::use_channel`] acquires a
//! [`ChannelGuard`] which gives the handle back to the pool when dropped, on
//! every exit path.

use pagestore_common::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

/// Default number of pooled handles
pub const DEFAULT_CHANNEL_CACHE_SIZE: usize = 150;

/// An open file handle with positional I/O
#[derive(Debug)]
pub struct Channel {
    file: File,
    path: PathBuf,
    writable: bool,
}

impl Channel {
    /// Open a handle. `read` opens read-only (the file must exist); otherwise
    /// the file is opened for read and write and created if missing.
    pub fn open(path: &Path, read: bool) -> Result<Self> {
        let mut options = OpenOptions::new();
        options.read(true);
        if !read {
            options.write(true).create(true);
        }
        let file = options.open(path)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            writable: !read,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Current size of the underlying file
    pub fn size(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Read into `buf` starting at `offset`, stopping early only at EOF.
    ///
    /// Returns the number of bytes read.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let mut total = 0;
        while total < buf.len() {
            let n = self.file.read_at(&mut buf[total..], offset + total as u64)?;
            if n == 0 {
                break;
            }
            total += n;
        }
        Ok(total)
    }

    /// Write the whole of `buf` at `offset`
    pub fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(Error::storage(format!(
                "channel for {} is read-only",
                self.path.display()
            )));
        }
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    /// Truncate (or extend) the file to `size` bytes
    pub fn truncate(&self, size: u64) -> Result<()> {
        if !self.writable {
            return Err(Error::storage(format!(
                "channel for {} is read-only",
                self.path.display()
            )));
        }
        self.file.set_len(size)?;
        Ok(())
    }

    /// Sync data only (not metadata) to disk
    pub fn sync_data(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

/// Channel cache statistics
#[derive(Debug, Default)]
pub struct ChannelStats {
    /// Acquisitions served by an already open handle
    pub hits: AtomicU64,
    /// Handles opened into the pool
    pub opens: AtomicU64,
    /// Handles opened for a single call
    pub uncached_opens: AtomicU64,
    /// Idle handles closed to make room
    pub evictions: AtomicU64,
}

struct CachedChannel {
    channel: Arc<Channel>,
    ref_count: usize,
    last_used: u64,
}

/// Reference-counted pool of open handles keyed by path
pub struct ChannelCache {
    channels: Mutex<HashMap<PathBuf, CachedChannel>>,
    capacity: usize,
    clock: AtomicU64,
    stats: ChannelStats,
}

impl ChannelCache {
    /// Create a pool keeping at most `capacity` idle handles open
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
            clock: AtomicU64::new(0),
            stats: ChannelStats::default(),
        }
    }

    /// Process-wide pool used by the default lock context
    pub fn global() -> Arc<ChannelCache> {
        static GLOBAL: OnceLock<Arc<ChannelCache>> = OnceLock::new();
        GLOBAL
            .get_or_init(|| Arc::new(ChannelCache::new(DEFAULT_CHANNEL_CACHE_SIZE)))
            .clone()
    }

    pub fn stats(&self) -> &ChannelStats {
        &self.stats
    }

    /// Number of handles currently pooled
    pub fn len(&self) -> usize {
        self.channels.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.lock().is_empty()
    }

    /// Check whether a handle for `path` is pooled
    pub fn contains(&self, path: &Path) -> bool {
        self.channels.lock().contains_key(path)
    }

    /// Run `processor` with a pooled handle for `path`.
    ///
    /// The handle is returned to the pool before this function returns,
    /// whether `processor` succeeds or fails.
    pub fn use_channel<R>(
        &self,
        path: &Path,
        read: bool,
        processor: impl FnOnce(&Channel) -> Result<R>,
    ) -> Result<R> {
        let guard = self.acquire(path, read)?;
        processor(guard.channel())
    }

    /// Run `processor` with a handle opened for this call only.
    ///
    /// The handle is closed before returning, on every exit path.
    pub fn use_uncached<R>(
        &self,
        path: &Path,
        read: bool,
        processor: impl FnOnce(&Channel) -> Result<R>,
    ) -> Result<R> {
        self.stats.uncached_opens.fetch_add(1, Ordering::Relaxed);
        let channel = Channel::open(path, read)?;
        processor(&channel)
    }

    /// Acquire a handle for `path`, opening it if needed
    pub fn acquire(&self, path: &Path, read: bool) -> Result<ChannelGuard<'_>> {
        let clock = self.clock.fetch_add(1, Ordering::Relaxed) + 1;
        let mut channels = self.channels.lock();

        if let Some(entry) = channels.get_mut(path) {
            if read || entry.channel.is_writable() {
                entry.ref_count += 1;
                entry.last_used = clock;
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(ChannelGuard {
                    cache: self,
                    channel: entry.channel.clone(),
                    pooled: true,
                });
            }

            if entry.ref_count > 0 {
                // Pooled handle is read-only and busy; serve this writer separately
                drop(channels);
                self.stats.uncached_opens.fetch_add(1, Ordering::Relaxed);
                let channel = Arc::new(Channel::open(path, false)?);
                return Ok(ChannelGuard {
                    cache: self,
                    channel,
                    pooled: false,
                });
            }

            // Idle read-only handle: reopen for writing
            channels.remove(path);
        }

        self.evict_idle(&mut channels);

        let channel = Arc::new(Channel::open(path, read)?);
        self.stats.opens.fetch_add(1, Ordering::Relaxed);
        channels.insert(
            path.to_path_buf(),
            CachedChannel {
                channel: channel.clone(),
                ref_count: 1,
                last_used: clock,
            },
        );

        Ok(ChannelGuard {
            cache: self,
            channel,
            pooled: true,
        })
    }

    /// Close the pooled handle for `path` regardless of its reference count.
    ///
    /// Holders that still use the handle keep it alive until they release
    /// it; an error is reported in that case since the caller expected
    /// exclusive use.
    pub fn close_channel(&self, path: &Path) -> Result<()> {
        let removed = self.channels.lock().remove(path);
        match removed {
            Some(entry) if entry.ref_count > 0 => {
                warn!(
                    "Closing channel for {} while {} user(s) still hold it",
                    path.display(),
                    entry.ref_count
                );
                Err(Error::storage(format!(
                    "channel for {} is still in use by {} holder(s)",
                    path.display(),
                    entry.ref_count
                )))
            }
            Some(_) => {
                debug!("Closed channel for {}", path.display());
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Close every idle pooled handle
    pub fn clear(&self) {
        self.channels.lock().retain(|_, entry| entry.ref_count > 0);
    }

    /// Make room for one more handle by closing least recently used idle ones
    fn evict_idle(&self, channels: &mut HashMap<PathBuf, CachedChannel>) {
        while channels.len() >= self.capacity {
            let victim = channels
                .iter()
                .filter(|(_, entry)| entry.ref_count == 0)
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(path, _)| path.clone());

            match victim {
                Some(path) => {
                    channels.remove(&path);
                    self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                    debug!("Evicted idle channel for {}", path.display());
                }
                // Every handle is in use; grow past capacity
                None => break,
            }
        }
    }

    fn release(&self, channel: &Arc<Channel>) {
        let mut channels = self.channels.lock();
        if let Some(entry) = channels.get_mut(channel.path()) {
            // The entry may have been closed and reopened meanwhile
            if Arc::ptr_eq(&entry.channel, channel) {
                entry.ref_count = entry.ref_count.saturating_sub(1);
            }
        }
    }
}

impl Default for ChannelCache {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CACHE_SIZE)
    }
}

/// Scoped use of a channel; releases it back to the pool on drop
pub struct ChannelGuard<'a> {
    cache: &'a ChannelCache,
    channel: Arc<Channel>,
    pooled: bool,
}

impl ChannelGuard<'_> {
    pub fn channel(&self) -> &Channel {
        &self.channel
    }
}

impl Drop for ChannelGuard<'_> {
    fn drop(&mut self) {
        if self.pooled {
            self.cache.release(&self.channel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_use_channel_pools_handle() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.dat");
        let cache = ChannelCache::new(4);

        cache
            .use_channel(&path, false, |ch| ch.write_all_at(0, b"hello"))
            .unwrap();
        let mut buf = [0u8; 5];
        let n = cache
            .use_channel(&path, true, |ch| ch.read_at(0, &mut buf))
            .unwrap();

        assert_eq!(n, 5);
        assert_eq!(&buf, b"hello");
        assert_eq!(cache.stats().opens.load(Ordering::Relaxed), 1);
        assert_eq!(cache.stats().hits.load(Ordering::Relaxed), 1);
        assert!(cache.contains(&path));
    }

    #[test]
    fn test_guard_released_on_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("b.dat");
        let cache = ChannelCache::new(4);

        let result: Result<()> =
            cache.use_channel(&path, false, |_| Err(Error::storage("processor failed")));
        assert!(result.is_err());

        // Reference count went back to zero, so closing is clean
        assert!(cache.close_channel(&path).is_ok());
        assert!(!cache.contains(&path));
    }

    #[test]
    fn test_close_channel_in_use_reports_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("c.dat");
        let cache = ChannelCache::new(4);

        let guard = cache.acquire(&path, false).unwrap();
        assert!(cache.close_channel(&path).is_err());

        // The holder can keep using its handle
        guard.channel().write_all_at(0, b"x").unwrap();
        drop(guard);
        assert!(!cache.contains(&path));
    }

    #[test]
    fn test_idle_eviction_respects_capacity() {
        let dir = tempdir().unwrap();
        let cache = ChannelCache::new(2);

        for i in 0..4 {
            let path = dir.path().join(format!("{i}.dat"));
            cache.use_channel(&path, false, |_| Ok(())).unwrap();
        }

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.stats().evictions.load(Ordering::Relaxed), 2);
        assert!(cache.contains(&dir.path().join("3.dat")));
        assert!(!cache.contains(&dir.path().join("0.dat")));
    }

    #[test]
    fn test_busy_handles_are_not_evicted() {
        let dir = tempdir().unwrap();
        let cache = ChannelCache::new(1);

        let first = dir.path().join("first.dat");
        let second = dir.path().join("second.dat");
        let guard = cache.acquire(&first, false).unwrap();
        cache.use_channel(&second, false, |_| Ok(())).unwrap();

        assert!(cache.contains(&first));
        assert!(cache.contains(&second));
        drop(guard);
    }

    #[test]
    fn test_read_only_handle_upgraded_for_write() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("d.dat");
        std::fs::write(&path, b"abc").unwrap();
        let cache = ChannelCache::new(4);

        cache.use_channel(&path, true, |ch| {
            assert!(!ch.is_writable());
            Ok(())
        })
        .unwrap();
        cache
            .use_channel(&path, false, |ch| {
                assert!(ch.is_writable());
                ch.write_all_at(3, b"d")
            })
            .unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"abcd");
        assert_eq!(cache.stats().opens.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_uncached_missing_file_for_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing.dat");
        let cache = ChannelCache::new(4);

        let err = cache.use_uncached(&path, true, |_| Ok(())).unwrap_err();
        match err {
            Error::Io(e) => assert_eq!(e.kind(), std::io::ErrorKind::NotFound),
            other => panic!("unexpected error: {other}"),
        }
        assert!(cache.is_empty());
        assert_eq!(cache.stats().uncached_opens.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_read_at_stops_at_eof() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("e.dat");
        std::fs::write(&path, b"0123").unwrap();

        let channel = Channel::open(&path, true).unwrap();
        let mut buf = [0xFFu8; 8];
        assert_eq!(channel.read_at(2, &mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"23");
        assert!(channel.write_all_at(0, b"x").is_err());
    }
}
