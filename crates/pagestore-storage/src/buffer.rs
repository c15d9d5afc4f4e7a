//! In-memory page buffers
//!
//! A [`BufferWrapper`] holds one page of a storage file. Access is guarded by
//! a lock count: callers must [`try_lock`](BufferWrapper::try_lock) before
//! touching the bytes and [`unlock`](BufferWrapper::unlock) afterwards. The
//! buffer cache may only reclaim a wrapper whose lock count is zero, and does
//! so by atomically swapping the count to a "released" sentinel. Once
//! released, `try_lock` fails forever and the caller must resolve the page
//! again.

use crate::cache::{PageKey, PageOwner};
use bytes::Buf;
use pagestore_common::{Error, Result};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Weak;

/// Lock count value marking a wrapper reclaimed by the cache
const RELEASED: u32 = u32::MAX;

/// Byte order used for typed values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ByteOrder {
    /// Big-endian, the portable on-disk default
    #[default]
    BigEndian,
    /// Whatever the host uses
    Native,
}

impl ByteOrder {
    #[inline]
    pub fn encode_i32(self, value: i32) -> [u8; 4] {
        match self {
            ByteOrder::BigEndian => value.to_be_bytes(),
            ByteOrder::Native => value.to_ne_bytes(),
        }
    }

    #[inline]
    pub fn decode_i32(self, bytes: [u8; 4]) -> i32 {
        match self {
            ByteOrder::BigEndian => i32::from_be_bytes(bytes),
            ByteOrder::Native => i32::from_ne_bytes(bytes),
        }
    }

    #[inline]
    pub fn encode_i64(self, value: i64) -> [u8; 8] {
        match self {
            ByteOrder::BigEndian => value.to_be_bytes(),
            ByteOrder::Native => value.to_ne_bytes(),
        }
    }

    #[inline]
    pub fn decode_i64(self, bytes: [u8; 8]) -> i64 {
        match self {
            ByteOrder::BigEndian => i64::from_be_bytes(bytes),
            ByteOrder::Native => i64::from_ne_bytes(bytes),
        }
    }
}

/// One page of a storage file resident in memory
pub struct BufferWrapper {
    key: PageKey,
    /// Byte position of the page within the file
    position: u64,
    data: RwLock<Box<[u8]>>,
    /// Bytes backed by file content or by writes; flushes never go past it
    valid_len: AtomicUsize,
    dirty: AtomicBool,
    lock_count: AtomicU32,
    last_access: AtomicU64,
    owner: Weak<dyn PageOwner>,
}

impl BufferWrapper {
    /// Create a wrapper whose first `valid_len` bytes of `data` mirror the file
    pub(crate) fn new(
        key: PageKey,
        position: u64,
        data: Box<[u8]>,
        valid_len: usize,
        owner: Weak<dyn PageOwner>,
        clock: u64,
    ) -> Self {
        Self {
            key,
            position,
            valid_len: AtomicUsize::new(valid_len.min(data.len())),
            data: RwLock::new(data),
            dirty: AtomicBool::new(false),
            lock_count: AtomicU32::new(0),
            last_access: AtomicU64::new(clock),
            owner,
        }
    }

    #[inline]
    pub fn key(&self) -> PageKey {
        self.key
    }

    /// Page index within the owning storage
    #[inline]
    pub fn page(&self) -> u64 {
        self.key.page
    }

    /// Byte position of the page within the file
    #[inline]
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Page size in bytes
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of bytes that will be written back by a flush
    pub fn valid_len(&self) -> usize {
        self.valid_len.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Current lock count (0 when idle)
    pub fn lock_count(&self) -> u32 {
        match self.lock_count.load(Ordering::Acquire) {
            RELEASED => 0,
            n => n,
        }
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.lock_count() > 0
    }

    /// True once the cache has reclaimed this wrapper
    #[inline]
    pub fn is_released(&self) -> bool {
        self.lock_count.load(Ordering::Acquire) == RELEASED
    }

    /// Take a lock on the page unless it has been released.
    ///
    /// Never blocks: a `false` return means the wrapper is being reclaimed
    /// and the page must be resolved again.
    pub fn try_lock(&self) -> bool {
        let mut current = self.lock_count.load(Ordering::Acquire);
        loop {
            if current == RELEASED || current == RELEASED - 1 {
                return false;
            }
            match self.lock_count.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Release one lock taken by [`try_lock`](Self::try_lock)
    pub fn unlock(&self) {
        let old = self.lock_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(old > 0 && old != RELEASED, "unlocked page {} with count {old}", self.key);
    }

    /// Claim the wrapper for reclamation. Succeeds only when unlocked.
    pub(crate) fn try_release(&self) -> bool {
        self.lock_count
            .compare_exchange(0, RELEASED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Undo a [`try_release`](Self::try_release) whose write-back failed
    pub(crate) fn restore(&self) {
        let _ = self
            .lock_count
            .compare_exchange(RELEASED, 0, Ordering::AcqRel, Ordering::Acquire);
    }

    /// Free the page bytes of a released wrapper.
    ///
    /// Stale references (a storage's fast cache, a losing `try_lock` caller)
    /// may outlive the cache entry; they only keep the empty shell alive.
    pub(crate) fn discard(&self) {
        debug_assert!(self.is_released(), "discarding live page {}", self.key);
        *self.data.write() = Box::default();
        self.valid_len.store(0, Ordering::Release);
    }

    pub(crate) fn touch(&self, clock: u64) {
        self.last_access.store(clock, Ordering::Relaxed);
    }

    pub(crate) fn last_access(&self) -> u64 {
        self.last_access.load(Ordering::Relaxed)
    }

    pub fn get(&self, offset: usize) -> u8 {
        self.data.read()[offset]
    }

    pub fn put(&self, offset: usize, value: u8) {
        self.put_from_slice(offset, &[value]);
    }

    pub fn get_int(&self, offset: usize, order: ByteOrder) -> i32 {
        let mut bytes = [0u8; 4];
        self.read_to_slice(offset, &mut bytes);
        order.decode_i32(bytes)
    }

    pub fn put_int(&self, offset: usize, value: i32, order: ByteOrder) {
        self.put_from_slice(offset, &order.encode_i32(value));
    }

    pub fn get_long(&self, offset: usize, order: ByteOrder) -> i64 {
        let mut bytes = [0u8; 8];
        self.read_to_slice(offset, &mut bytes);
        order.decode_i64(bytes)
    }

    pub fn put_long(&self, offset: usize, value: i64, order: ByteOrder) {
        self.put_from_slice(offset, &order.encode_i64(value));
    }

    /// Copy `dst.len()` bytes starting at `offset` into `dst`
    pub fn read_to_slice(&self, offset: usize, dst: &mut [u8]) {
        let data = self.data.read();
        dst.copy_from_slice(&data[offset..offset + dst.len()]);
    }

    /// Copy `src` into the page at `offset` as one atomic step
    pub fn put_from_slice(&self, offset: usize, src: &[u8]) {
        let mut data = self.data.write();
        data[offset..offset + src.len()].copy_from_slice(src);
        self.mark_written(offset + src.len());
    }

    /// Drain `src` into the page at `offset`.
    ///
    /// Fails without copying anything when the remaining bytes of `src` do
    /// not fit in the page.
    pub fn put_from_buf(&self, offset: usize, src: &mut impl Buf) -> Result<usize> {
        let len = src.remaining();
        let mut data = self.data.write();
        if offset + len > data.len() {
            return Err(Error::storage(format!(
                "{len} bytes at offset {offset} overflow page {} of {} bytes",
                self.key,
                data.len()
            )));
        }
        src.copy_to_slice(&mut data[offset..offset + len]);
        self.mark_written(offset + len);
        Ok(len)
    }

    /// Run `f` over the page bytes
    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.data.read())
    }

    /// Run `f` over the page bytes mutably; the whole page becomes valid
    pub fn with_bytes_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut data = self.data.write();
        let result = f(&mut data);
        self.mark_written(data.len());
        result
    }

    // Called with the data write lock held
    fn mark_written(&self, end: usize) {
        self.valid_len.fetch_max(end, Ordering::AcqRel);
        self.dirty.store(true, Ordering::Release);
    }

    /// Write the page back to its owner if dirty.
    ///
    /// Returns `true` if bytes were written. On failure the page stays dirty.
    pub fn flush(&self) -> Result<bool> {
        let data = self.data.read();
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(false);
        }

        let Some(owner) = self.owner.upgrade() else {
            self.dirty.store(true, Ordering::Release);
            return Err(Error::storage(format!(
                "owner of dirty page {} is gone",
                self.key
            )));
        };

        let len = self.valid_len.load(Ordering::Acquire);
        if let Err(e) = owner.write_page(self.position, &data[..len]) {
            self.dirty.store(true, Ordering::Release);
            return Err(e);
        }
        Ok(true)
    }
}

impl std::fmt::Debug for BufferWrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferWrapper")
            .field("key", &self.key)
            .field("position", &self.position)
            .field("valid_len", &self.valid_len())
            .field("dirty", &self.is_dirty())
            .field("lock_count", &self.lock_count())
            .field("released", &self.is_released())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::tests::MemoryOwner;
    use pagestore_common::StorageId;
    use std::sync::Arc;

    fn wrapper(owner: &Arc<MemoryOwner>, page: u64, size: usize) -> BufferWrapper {
        let weak: Weak<dyn PageOwner> = Arc::downgrade(owner) as Weak<dyn PageOwner>;
        BufferWrapper::new(
            PageKey::new(StorageId::new(1), page),
            page * size as u64,
            vec![0u8; size].into_boxed_slice(),
            0,
            weak,
            0,
        )
    }

    #[test]
    fn test_lock_and_release() {
        let owner = Arc::new(MemoryOwner::default());
        let w = wrapper(&owner, 0, 64);

        assert!(w.try_lock());
        assert!(w.try_lock());
        assert_eq!(w.lock_count(), 2);

        // Locked wrappers can't be reclaimed
        assert!(!w.try_release());

        w.unlock();
        w.unlock();
        assert!(!w.is_locked());
        assert!(w.try_release());
        assert!(w.is_released());
        assert!(!w.try_lock());

        w.restore();
        assert!(w.try_lock());
        w.unlock();
    }

    #[test]
    fn test_discard_frees_bytes() {
        let owner = Arc::new(MemoryOwner::default());
        let w = wrapper(&owner, 0, 64);
        w.put(3, 1);
        assert!(w.flush().unwrap());

        assert!(w.try_release());
        w.discard();
        assert!(w.is_empty());
        assert_eq!(w.valid_len(), 0);
        assert!(!w.try_lock());
    }

    #[test]
    fn test_typed_access_both_orders() {
        let owner = Arc::new(MemoryOwner::default());
        let w = wrapper(&owner, 0, 64);

        w.put_int(0, 0x0102_0304, ByteOrder::BigEndian);
        w.with_bytes(|b| assert_eq!(&b[..4], &[1, 2, 3, 4]));
        assert_eq!(w.get_int(0, ByteOrder::BigEndian), 0x0102_0304);

        w.put_long(8, -42, ByteOrder::Native);
        assert_eq!(w.get_long(8, ByteOrder::Native), -42);
        assert_eq!(w.valid_len(), 16);
        assert!(w.is_dirty());
    }

    #[test]
    fn test_put_from_buf_bounds() {
        let owner = Arc::new(MemoryOwner::default());
        let w = wrapper(&owner, 0, 16);

        let mut src = bytes::Bytes::from_static(b"abcd");
        assert_eq!(w.put_from_buf(12, &mut src).unwrap(), 4);
        assert_eq!(src.remaining(), 0);
        assert_eq!(w.get(15), b'd');

        let mut too_big = bytes::Bytes::from_static(b"abcdef");
        assert!(w.put_from_buf(12, &mut too_big).is_err());
        assert_eq!(too_big.remaining(), 6);
    }

    #[test]
    fn test_flush_writes_valid_prefix_once() {
        let owner = Arc::new(MemoryOwner::default());
        let w = wrapper(&owner, 2, 32);

        assert!(!w.flush().unwrap());

        w.put_from_slice(4, b"xyz");
        assert!(w.flush().unwrap());
        assert!(!w.is_dirty());
        assert!(!w.flush().unwrap());

        let writes = owner.writes.lock();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].0, 64);
        assert_eq!(writes[0].1.len(), 7);
        assert_eq!(&writes[0].1[4..], b"xyz");
    }

    #[test]
    fn test_flush_failure_keeps_dirty() {
        let owner = Arc::new(MemoryOwner::default());
        let w = wrapper(&owner, 0, 32);
        w.put(0, 1);

        owner.fail_writes.store(true, Ordering::SeqCst);
        assert!(w.flush().is_err());
        assert!(w.is_dirty());

        owner.fail_writes.store(false, Ordering::SeqCst);
        assert!(w.flush().unwrap());
    }

    #[test]
    fn test_flush_without_owner() {
        let owner = Arc::new(MemoryOwner::default());
        let w = wrapper(&owner, 0, 32);
        w.put(0, 1);
        drop(owner);

        assert!(w.flush().is_err());
        assert!(w.is_dirty());
    }
}
