//! Lock context shared by a group of storages
//!
//! A [`StorageLockContext`] bundles the services a storage needs (the page
//! cache and the channel cache) with a coarse read/write lock. Callers use
//! the lock to make multi-step sequences, and structural operations such as
//! resize and close, atomic with respect to other threads sharing the
//! context. Page-level locking inside the engine is finer grained and does
//! not replace it.
//!
//! The lock is reentrant: a thread holding the write lock may take it again
//! or take the read lock, and read locks nest freely. Upgrading a held read
//! lock to a write lock is not supported and deadlocks.

use crate::cache::BufferCache;
use crate::channel::ChannelCache;
use pagestore_common::CacheConfig;
use parking_lot::{Condvar, Mutex};
use std::sync::{Arc, OnceLock};
use std::thread::{self, ThreadId};
use std::time::Duration;

#[derive(Debug, Default)]
struct LockState {
    readers: usize,
    writer: Option<ThreadId>,
    write_holds: usize,
}

/// Reentrant read/write lock plus the shared caches
pub struct StorageLockContext {
    state: Mutex<LockState>,
    released: Condvar,
    buffer_cache: Arc<BufferCache>,
    channel_cache: Arc<ChannelCache>,
    use_channel_cache: bool,
    slow_flush_threshold: Option<Duration>,
}

impl StorageLockContext {
    pub fn new(
        buffer_cache: Arc<BufferCache>,
        channel_cache: Arc<ChannelCache>,
        use_channel_cache: bool,
    ) -> Self {
        Self {
            state: Mutex::new(LockState::default()),
            released: Condvar::new(),
            buffer_cache,
            channel_cache,
            use_channel_cache,
            slow_flush_threshold: None,
        }
    }

    /// Build a context with its own caches sized from `config`
    pub fn from_config(config: &CacheConfig) -> Self {
        let mut context = Self::new(
            Arc::new(BufferCache::from_config(config)),
            Arc::new(ChannelCache::new(config.channel_cache_size)),
            config.use_channel_cache,
        );
        context.slow_flush_threshold = match config.slow_flush_threshold_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };
        context
    }

    /// Process-wide context over the global caches, used when a storage is
    /// opened without one
    pub fn default_context() -> Arc<StorageLockContext> {
        static DEFAULT: OnceLock<Arc<StorageLockContext>> = OnceLock::new();
        DEFAULT
            .get_or_init(|| {
                let config = CacheConfig::default();
                let mut context = StorageLockContext::new(
                    BufferCache::global(),
                    ChannelCache::global(),
                    config.use_channel_cache,
                );
                context.slow_flush_threshold =
                    Some(Duration::from_millis(config.slow_flush_threshold_ms));
                Arc::new(context)
            })
            .clone()
    }

    pub fn buffer_cache(&self) -> &Arc<BufferCache> {
        &self.buffer_cache
    }

    pub fn channel_cache(&self) -> &Arc<ChannelCache> {
        &self.channel_cache
    }

    pub fn use_channel_cache(&self) -> bool {
        self.use_channel_cache
    }

    /// Flushes slower than this are reported
    pub fn slow_flush_threshold(&self) -> Option<Duration> {
        self.slow_flush_threshold
    }

    /// Block until no other thread holds the write lock
    pub fn lock_read(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        while state.writer.is_some_and(|writer| writer != me) {
            self.released.wait(&mut state);
        }
        state.readers += 1;
    }

    pub fn unlock_read(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.readers > 0, "unlock_read without lock_read");
        state.readers = state.readers.saturating_sub(1);
        if state.readers == 0 {
            self.released.notify_all();
        }
    }

    /// Block until this thread is the only lock holder
    pub fn lock_write(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        loop {
            match state.writer {
                Some(writer) if writer == me => break,
                None if state.readers == 0 => break,
                _ => self.released.wait(&mut state),
            }
        }
        state.writer = Some(me);
        state.write_holds += 1;
    }

    pub fn unlock_write(&self) {
        let mut state = self.state.lock();
        debug_assert_eq!(
            state.writer,
            Some(thread::current().id()),
            "unlock_write from a thread not holding the lock"
        );
        state.write_holds = state.write_holds.saturating_sub(1);
        if state.write_holds == 0 {
            state.writer = None;
            self.released.notify_all();
        }
    }

    /// Take the read lock until the guard is dropped
    pub fn read(&self) -> StorageReadGuard<'_> {
        self.lock_read();
        StorageReadGuard { context: self }
    }

    /// Take the write lock until the guard is dropped
    pub fn write(&self) -> StorageWriteGuard<'_> {
        self.lock_write();
        StorageWriteGuard { context: self }
    }

    pub fn is_write_locked_by_current_thread(&self) -> bool {
        self.state.lock().writer == Some(thread::current().id())
    }

    /// Number of read holds across all threads
    pub fn read_lock_count(&self) -> usize {
        self.state.lock().readers
    }
}

impl std::fmt::Debug for StorageLockContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageLockContext")
            .field("lock", &*self.state.lock())
            .field("use_channel_cache", &self.use_channel_cache)
            .finish()
    }
}

pub struct StorageReadGuard<'a> {
    context: &'a StorageLockContext,
}

impl Drop for StorageReadGuard<'_> {
    fn drop(&mut self) {
        self.context.unlock_read();
    }
}

pub struct StorageWriteGuard<'a> {
    context: &'a StorageLockContext,
}

impl Drop for StorageWriteGuard<'_> {
    fn drop(&mut self) {
        self.context.unlock_write();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn context() -> StorageLockContext {
        StorageLockContext::from_config(&CacheConfig::with_capacity(1024 * 1024))
    }

    #[test]
    fn test_write_is_reentrant() {
        let ctx = context();
        let outer = ctx.write();
        {
            let _inner = ctx.write();
            let _read = ctx.read();
            assert!(ctx.is_write_locked_by_current_thread());
        }
        assert!(ctx.is_write_locked_by_current_thread());
        drop(outer);
        assert!(!ctx.is_write_locked_by_current_thread());
        assert_eq!(ctx.read_lock_count(), 0);
    }

    #[test]
    fn test_readers_share() {
        let ctx = context();
        let _first = ctx.read();
        thread::scope(|s| {
            s.spawn(|| {
                let _second = ctx.read();
                assert_eq!(ctx.read_lock_count(), 2);
            });
        });
        assert_eq!(ctx.read_lock_count(), 1);
    }

    #[test]
    fn test_writer_excludes_readers() {
        let ctx = context();
        let reader_done = AtomicBool::new(false);

        let guard = ctx.write();
        thread::scope(|s| {
            s.spawn(|| {
                let _read = ctx.read();
                reader_done.store(true, Ordering::SeqCst);
            });
            thread::sleep(Duration::from_millis(50));
            assert!(!reader_done.load(Ordering::SeqCst));
            drop(guard);
        });
        assert!(reader_done.load(Ordering::SeqCst));
    }

    #[test]
    fn test_writers_serialize() {
        let ctx = context();
        let inside = AtomicUsize::new(0);
        let max_inside = AtomicUsize::new(0);

        thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..50 {
                        let _w = ctx.write();
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_inside.fetch_max(now, Ordering::SeqCst);
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                });
            }
        });
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_explicit_lock_unlock() {
        let ctx = context();
        ctx.lock_read();
        ctx.lock_read();
        assert_eq!(ctx.read_lock_count(), 2);
        ctx.unlock_read();
        ctx.unlock_read();

        ctx.lock_write();
        assert!(ctx.is_write_locked_by_current_thread());
        ctx.unlock_write();
        assert!(!ctx.is_write_locked_by_current_thread());
    }

    #[test]
    fn test_default_context_is_shared() {
        let a = StorageLockContext::default_context();
        let b = StorageLockContext::default_context();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(a.buffer_cache(), &BufferCache::global()));
        assert!(a.use_channel_cache());
    }
}
