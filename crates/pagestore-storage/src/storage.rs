//! Paged file storage
//!
//! [`PagedFileStorage`] presents a flat file as a byte-addressable space.
//! Logical address `a` lives at offset `a % page_size` of page
//! `a / page_size`; there is no header and no embedded metadata, so page size
//! and alignment must be supplied identically on every open.
//!
//! Every access resolves its page through a tiny per-storage fast cache and
//! then the shared [`BufferCache`](crate::BufferCache), locks the page
//! wrapper for the duration of the access and unlocks it on every exit path.
//! Resolution never blocks on a page: if the wrapper is being reclaimed the
//! lookup is simply repeated.

use crate::buffer::{BufferWrapper, ByteOrder};
use crate::cache::{PageKey, PageOwner};
use crate::channel::Channel;
use crate::fast_cache::FastPageCache;
use crate::lock::{StorageLockContext, StorageReadGuard, StorageWriteGuard};
use bytes::Buf;
use pagestore_common::{Error, MAX_FILLER_SIZE, MAX_PAGES_COUNT, Result, StorageConfig, StorageId};
use parking_lot::Mutex;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Storage index of a closed storage, and cached size when unknown
const UNSET: i64 = -1;

/// Failed lock attempts spent spinning before yielding the thread
const SPIN_LIMIT: u32 = 64;

/// Per-storage I/O counters
#[derive(Debug, Default)]
pub struct IoStats {
    /// Page loads that went to the file
    pub page_reads: AtomicU64,
    /// Page write-backs that went to the file
    pub page_writes: AtomicU64,
    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
}

/// File-facing half of a storage; the cache reaches it through `PageOwner`
struct StorageFile {
    path: PathBuf,
    read_only: bool,
    context: Arc<StorageLockContext>,
    /// Cached logical length, `UNSET` until computed
    size: AtomicI64,
    io: IoStats,
}

impl StorageFile {
    /// Run `processor` over a handle opened in the storage's access mode
    fn use_channel<R>(&self, processor: impl FnOnce(&Channel) -> Result<R>) -> Result<R> {
        let channels = self.context.channel_cache();
        if self.context.use_channel_cache() {
            channels.use_channel(&self.path, self.read_only, processor)
        } else {
            self.context.buffer_cache().increment_uncached_file_access();
            channels.use_uncached(&self.path, self.read_only, processor)
        }
    }

    fn length(&self) -> Result<u64> {
        let cached = self.size.load(Ordering::Acquire);
        if cached >= 0 {
            return Ok(cached as u64);
        }
        let size = self.length_on_disk()?;
        // Writes may have raised it meanwhile
        let _ = self
            .size
            .compare_exchange(UNSET, size as i64, Ordering::AcqRel, Ordering::Acquire);
        Ok(self.size.load(Ordering::Acquire).max(0) as u64)
    }

    fn length_on_disk(&self) -> Result<u64> {
        match fs::metadata(&self.path) {
            Ok(metadata) => Ok(metadata.len()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn ensure_cached_size_at_least(&self, size: u64) -> Result<()> {
        if self.size.load(Ordering::Acquire) < 0 {
            self.length()?;
        }
        self.size.fetch_max(size as i64, Ordering::AcqRel);
        Ok(())
    }
}

impl PageOwner for StorageFile {
    fn path(&self) -> &Path {
        &self.path
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn read_page(&self, position: u64, buf: &mut [u8]) -> Result<usize> {
        let n = self.use_channel(|channel| channel.read_at(position, buf))?;
        self.io.page_reads.fetch_add(1, Ordering::Relaxed);
        self.io.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }

    fn write_page(&self, position: u64, data: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly {
                path: self.path.clone(),
            });
        }
        self.use_channel(|channel| channel.write_all_at(position, data))?;
        self.io.page_writes.fetch_add(1, Ordering::Relaxed);
        self.io
            .bytes_written
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(())
    }
}

/// A file accessed page by page through the shared buffer cache
pub struct PagedFileStorage {
    file: Arc<StorageFile>,
    /// Id issued by the buffer cache, `UNSET` once closed
    storage_index: AtomicI64,
    page_size: usize,
    values_aligned: bool,
    byte_order: ByteOrder,
    dirty: AtomicBool,
    fast_cache: FastPageCache,
    stream_lock: Mutex<()>,
}

impl PagedFileStorage {
    /// Open a storage over `path`.
    ///
    /// The file itself is not touched until the first access. When no
    /// `context` is given the process-wide default is used.
    pub fn open(
        path: impl AsRef<Path>,
        config: &StorageConfig,
        context: Option<Arc<StorageLockContext>>,
    ) -> Result<Self> {
        config.validate()?;
        let context = context.unwrap_or_else(StorageLockContext::default_context);
        let page_size = config.effective_page_size();

        let file = Arc::new(StorageFile {
            path: path.as_ref().to_path_buf(),
            read_only: config.read_only,
            context,
            size: AtomicI64::new(UNSET),
            io: IoStats::default(),
        });
        let owner: Weak<dyn PageOwner> = Arc::downgrade(&file) as Weak<dyn PageOwner>;
        let id = file
            .context
            .buffer_cache()
            .register_storage(owner, page_size);
        debug!(
            "Opened {} as {} (page size {}, aligned {}, read-only {})",
            file.path.display(),
            id,
            page_size,
            config.values_aligned,
            config.read_only
        );

        Ok(Self {
            file,
            storage_index: AtomicI64::new(i64::from(id.index())),
            page_size,
            values_aligned: config.values_aligned,
            byte_order: if config.native_byte_order {
                ByteOrder::Native
            } else {
                ByteOrder::BigEndian
            },
            dirty: AtomicBool::new(false),
            fast_cache: FastPageCache::new(),
            stream_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.file.path
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn is_read_only(&self) -> bool {
        self.file.read_only
    }

    pub fn is_values_aligned(&self) -> bool {
        self.values_aligned
    }

    pub fn is_native_byte_order(&self) -> bool {
        self.byte_order == ByteOrder::Native
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }

    /// True when writes have not been forced to the file yet
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.storage_index.load(Ordering::Acquire) == UNSET
    }

    pub fn storage_lock_context(&self) -> &Arc<StorageLockContext> {
        &self.file.context
    }

    pub fn io_stats(&self) -> &IoStats {
        &self.file.io
    }

    /// Offset of `addr` within its page
    pub fn offset_in_page(&self, addr: u64) -> usize {
        (addr % self.page_size as u64) as usize
    }

    pub fn lock_read(&self) {
        self.file.context.lock_read();
    }

    pub fn unlock_read(&self) {
        self.file.context.unlock_read();
    }

    pub fn lock_write(&self) {
        self.file.context.lock_write();
    }

    pub fn unlock_write(&self) {
        self.file.context.unlock_write();
    }

    /// Hold the context's read lock until the guard is dropped
    pub fn read_lock(&self) -> StorageReadGuard<'_> {
        self.file.context.read()
    }

    /// Hold the context's write lock until the guard is dropped
    pub fn write_lock(&self) -> StorageWriteGuard<'_> {
        self.file.context.write()
    }

    pub fn put_int(&self, addr: u64, value: i32) -> Result<()> {
        let bytes = self.byte_order.encode_i32(value);
        if let Some((page, offset)) = self.aligned_slot(addr, bytes.len()) {
            return self.page_guard(page, true, true)?.put_int(offset, value);
        }
        self.put_slice(addr, &bytes)
    }

    pub fn get_int(&self, addr: u64) -> Result<i32> {
        if let Some((page, offset)) = self.aligned_slot(addr, 4) {
            return Ok(self.page_guard(page, false, true)?.get_int(offset));
        }
        let mut bytes = [0u8; 4];
        self.get_slice(addr, &mut bytes, true)?;
        Ok(self.byte_order.decode_i32(bytes))
    }

    pub fn put_long(&self, addr: u64, value: i64) -> Result<()> {
        let bytes = self.byte_order.encode_i64(value);
        if let Some((page, offset)) = self.aligned_slot(addr, bytes.len()) {
            return self.page_guard(page, true, true)?.put_long(offset, value);
        }
        self.put_slice(addr, &bytes)
    }

    pub fn get_long(&self, addr: u64) -> Result<i64> {
        if let Some((page, offset)) = self.aligned_slot(addr, 8) {
            return Ok(self.page_guard(page, false, true)?.get_long(offset));
        }
        let mut bytes = [0u8; 8];
        self.get_slice(addr, &mut bytes, true)?;
        Ok(self.byte_order.decode_i64(bytes))
    }

    /// Read one byte. `check_access` controls whether the read refreshes the
    /// page's position in the cache's eviction order.
    pub fn get(&self, addr: u64, check_access: bool) -> Result<u8> {
        let (page, offset) = self.split(addr);
        Ok(self.page_guard(page, false, check_access)?.get(offset))
    }

    pub fn put(&self, addr: u64, value: u8) -> Result<()> {
        let (page, offset) = self.split(addr);
        self.page_guard(page, true, true)?.put(offset, value)
    }

    /// Fill `dst` from `addr` on, crossing page boundaries as needed
    pub fn get_slice(&self, addr: u64, dst: &mut [u8], check_access: bool) -> Result<()> {
        let mut done = 0;
        while done < dst.len() {
            let (page, offset) = self.split(addr + done as u64);
            let n = (dst.len() - done).min(self.page_size - offset);
            self.page_guard(page, false, check_access)?
                .read_to_slice(offset, &mut dst[done..done + n]);
            done += n;
        }
        Ok(())
    }

    /// Write `src` at `addr`, crossing page boundaries as needed.
    ///
    /// Each page's share is copied atomically; a range spanning pages is
    /// not atomic as a whole.
    pub fn put_slice(&self, addr: u64, src: &[u8]) -> Result<()> {
        let mut done = 0;
        while done < src.len() {
            let (page, offset) = self.split(addr + done as u64);
            let n = (src.len() - done).min(self.page_size - offset);
            self.page_guard(page, true, true)?
                .put_from_slice(offset, &src[done..done + n])?;
            done += n;
        }
        Ok(())
    }

    /// Copy the remaining bytes of `src` into the page holding `index`.
    ///
    /// Only available on value-aligned storages, and the bytes must fit in
    /// that single page. Returns the number of bytes copied.
    pub fn put_buffer(&self, index: u64, src: &mut impl Buf) -> Result<usize> {
        if !self.values_aligned {
            return Err(Error::unsupported(format!(
                "put_buffer on unaligned storage {}",
                self.path().display()
            )));
        }
        let (page, offset) = self.split(index);
        self.page_guard(page, true, true)?.put_from_buf(offset, src)
    }

    /// Lock the page covering `addr` for direct access.
    ///
    /// The page stays locked, and therefore resident, until the guard is
    /// dropped. With `modify` unset the guard only permits reads.
    pub fn get_byte_buffer(&self, addr: u64, modify: bool) -> Result<PageGuard<'_>> {
        self.page_guard(self.split(addr).0, modify, true)
    }

    /// Logical length: the file size, raised by any write past it
    pub fn length(&self) -> Result<u64> {
        self.storage_id()?;
        self.file.length()
    }

    /// Raise the cached logical length to at least `size`
    pub fn ensure_cached_size_at_least(&self, size: u64) -> Result<()> {
        self.file.ensure_cached_size_at_least(size)
    }

    /// Grow or shrink the backing file to `new_size` bytes.
    ///
    /// Grown bytes read as zero. Shrinking discards every byte past
    /// `new_size`, including bytes only resident in the cache. A shrink
    /// fails without truncating while any page of the storage is locked
    /// through a [`PageGuard`]; callers sharing the storage across threads
    /// hold the context write lock around it.
    pub fn resize(&self, new_size: u64) -> Result<()> {
        self.check_writable()?;
        let id = self.storage_id()?;
        self.flush_pages(id)?;

        let old_size = match fs::metadata(self.path()) {
            Ok(metadata) => metadata.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if let Some(parent) = self.path().parent() {
                    fs::create_dir_all(parent)?;
                }
                0
            }
            Err(e) => return Err(e.into()),
        };
        if old_size == new_size && self.file.size.load(Ordering::Acquire) == new_size as i64 {
            return Ok(());
        }

        let started = Instant::now();
        self.file.size.store(UNSET, Ordering::Release);

        if new_size > old_size {
            // Writing the last byte allocates the whole range
            self.file
                .use_channel(|channel| channel.write_all_at(new_size - 1, &[0]))?;
            self.file.size.store(new_size as i64, Ordering::Release);
            self.fill_with_zeros(old_size, new_size)?;
        } else if new_size < old_size {
            let cache = self.file.context.buffer_cache();
            cache.unmap_buffers_for_owner(id)?;
            self.fast_cache.clear();
            self.file.use_channel(|channel| channel.truncate(new_size))?;
            self.file.size.store(new_size as i64, Ordering::Release);
        } else {
            self.file.size.store(new_size as i64, Ordering::Release);
        }

        info!(
            "Resized {} from {} to {} bytes in {:?}",
            self.path().display(),
            old_size,
            new_size,
            started.elapsed()
        );
        Ok(())
    }

    fn fill_with_zeros(&self, from: u64, to: u64) -> Result<()> {
        let zeros = [0u8; MAX_FILLER_SIZE];
        let mut addr = from;
        while addr < to {
            let n = ((to - addr) as usize).min(MAX_FILLER_SIZE);
            self.put_slice(addr, &zeros[..n])?;
            addr += n as u64;
        }
        Ok(())
    }

    /// Write back every dirty page of this storage.
    ///
    /// Does no I/O at all when nothing was written since the last force.
    pub fn force(&self) -> Result<()> {
        if !self.is_dirty() {
            return Ok(());
        }
        let id = self.storage_id()?;
        self.flush_pages(id)
    }

    fn flush_pages(&self, id: StorageId) -> Result<()> {
        // Cleared first so a write racing with the flush marks it again
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        let started = Instant::now();
        let flushed = match self.file.context.buffer_cache().flush_buffers_for_owner(id) {
            Ok(flushed) => flushed,
            Err(e) => {
                self.dirty.store(true, Ordering::Release);
                return Err(e);
            }
        };

        let elapsed = started.elapsed();
        if let Some(threshold) = self.file.context.slow_flush_threshold() {
            if elapsed > threshold {
                warn!(
                    "Slow flush of {}: {} page(s) in {:?}",
                    self.path().display(),
                    flushed,
                    elapsed
                );
            }
        }
        Ok(())
    }

    /// Flush, drop every resident page and release the file handle.
    ///
    /// All steps run even when an earlier one fails; the failures are
    /// returned together. Closing twice is a no-op. Pages still locked
    /// through a [`PageGuard`] are reported and dropped without write-back,
    /// so callers sharing the storage across threads hold the context write
    /// lock around it.
    pub fn close(&self) -> Result<()> {
        let index = self.storage_index.swap(UNSET, Ordering::AcqRel);
        if index == UNSET {
            return Ok(());
        }
        let id = StorageId::new(index as u32);
        let context = &self.file.context;
        let mut errors = Vec::new();

        if let Err(e) = self.flush_pages(id) {
            errors.push(e);
        }
        if let Err(e) = context.buffer_cache().unmap_buffers_for_owner(id) {
            errors.push(e);
        }
        self.fast_cache.clear();
        if let Err(e) = context.channel_cache().close_channel(self.path()) {
            errors.push(e);
        }
        context.buffer_cache().remove_storage(id);

        match Error::from_many(errors) {
            None => {
                debug!("Closed {} ({})", self.path().display(), id);
                Ok(())
            }
            Some(e) => {
                warn!("Failed to close {} cleanly: {}", self.path().display(), e);
                Err(e)
            }
        }
    }

    /// Hand the whole file to `consumer` as a byte stream from offset 0.
    ///
    /// Pending writes are forced first. Stream reads of one storage are
    /// serialized. A missing file reads as an empty stream.
    pub fn read_input_stream<R>(&self, consumer: impl FnOnce(&mut dyn Read) -> Result<R>) -> Result<R> {
        self.read_channel(|reader| consumer(&mut io::BufReader::new(reader)))
    }

    /// Like [`read_input_stream`](Self::read_input_stream) but exposes the
    /// positional reader directly
    pub fn read_channel<R>(&self, consumer: impl FnOnce(&mut FileReader<'_>) -> Result<R>) -> Result<R> {
        let _serial = self.stream_lock.lock();
        self.storage_id()?;
        self.force()?;

        let mut consumer = Some(consumer);
        let result = self.file.use_channel(|channel| match consumer.take() {
            Some(consumer) => consumer(&mut FileReader::new(Some(channel))),
            None => Err(Error::storage("stream consumer already ran")),
        });
        match (result, consumer.take()) {
            (Err(Error::Io(e)), Some(consumer)) if e.kind() == io::ErrorKind::NotFound => {
                consumer(&mut FileReader::new(None))
            }
            (result, _) => result,
        }
    }

    fn storage_id(&self) -> Result<StorageId> {
        match self.storage_index.load(Ordering::Acquire) {
            UNSET => Err(Error::Closed {
                path: self.path().to_path_buf(),
            }),
            index => Ok(StorageId::new(index as u32)),
        }
    }

    fn check_writable(&self) -> Result<()> {
        if self.file.read_only {
            return Err(Error::ReadOnly {
                path: self.path().to_path_buf(),
            });
        }
        Ok(())
    }

    #[inline]
    fn split(&self, addr: u64) -> (u64, usize) {
        (addr / self.page_size as u64, self.offset_in_page(addr))
    }

    /// Page and offset for a typed value that fits in one page of an
    /// aligned storage; `None` sends the access down the generic path
    #[inline]
    fn aligned_slot(&self, addr: u64, len: usize) -> Option<(u64, usize)> {
        if !self.values_aligned {
            return None;
        }
        let (page, offset) = self.split(addr);
        (offset + len <= self.page_size).then_some((page, offset))
    }

    fn page_guard(&self, page: u64, modify: bool, check_access: bool) -> Result<PageGuard<'_>> {
        if modify {
            self.check_writable()?;
        }
        let wrapper = self.lock_page(page, modify, check_access)?;
        Ok(PageGuard {
            storage: self,
            wrapper,
            modify,
        })
    }

    /// Resolve `page` and lock its wrapper, retrying while the wrapper
    /// found is being reclaimed
    fn lock_page(&self, page: u64, modify: bool, check_access: bool) -> Result<Arc<BufferWrapper>> {
        let mut attempts = 0u32;
        loop {
            let wrapper = self.resolve_page(page, !modify, check_access)?;
            if wrapper.try_lock() {
                return Ok(wrapper);
            }
            attempts += 1;
            if attempts < SPIN_LIMIT {
                std::hint::spin_loop();
            } else {
                thread::yield_now();
            }
        }
    }

    fn resolve_page(&self, page: u64, read_only: bool, check_access: bool) -> Result<Arc<BufferWrapper>> {
        let cache = self.file.context.buffer_cache();
        if let Some(wrapper) = self.fast_cache.get(page) {
            cache.increment_fast_cache_hits_count();
            return Ok(wrapper);
        }
        if page >= MAX_PAGES_COUNT {
            return Err(Error::PageOutOfRange {
                page,
                max: MAX_PAGES_COUNT,
            });
        }
        let id = self.storage_id()?;
        let wrapper = cache.get(PageKey::new(id, page), read_only, check_access)?;
        self.fast_cache.update(page, wrapper.clone());
        Ok(wrapper)
    }

    fn mark_written(&self, end: u64) -> Result<()> {
        self.dirty.store(true, Ordering::Release);
        self.file.ensure_cached_size_at_least(end)
    }
}

impl Drop for PagedFileStorage {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Error closing {} on drop: {}", self.path().display(), e);
        }
    }
}

impl std::fmt::Debug for PagedFileStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PagedFileStorage")
            .field("path", &self.file.path)
            .field("storage_index", &self.storage_index.load(Ordering::Relaxed))
            .field("page_size", &self.page_size)
            .field("values_aligned", &self.values_aligned)
            .field("read_only", &self.file.read_only)
            .field("dirty", &self.is_dirty())
            .finish()
    }
}

/// A locked page of a storage; unlocks when dropped.
///
/// Offsets are relative to the start of the page and panic when out of
/// bounds, like slice indexing.
pub struct PageGuard<'a> {
    storage: &'a PagedFileStorage,
    wrapper: Arc<BufferWrapper>,
    modify: bool,
}

impl PageGuard<'_> {
    pub fn page(&self) -> u64 {
        self.wrapper.page()
    }

    /// Byte position of the page within the file
    pub fn position(&self) -> u64 {
        self.wrapper.position()
    }

    pub fn len(&self) -> usize {
        self.wrapper.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wrapper.is_empty()
    }

    pub fn is_modifiable(&self) -> bool {
        self.modify
    }

    pub fn get(&self, offset: usize) -> u8 {
        self.wrapper.get(offset)
    }

    pub fn get_int(&self, offset: usize) -> i32 {
        self.wrapper.get_int(offset, self.storage.byte_order)
    }

    pub fn get_long(&self, offset: usize) -> i64 {
        self.wrapper.get_long(offset, self.storage.byte_order)
    }

    pub fn read_to_slice(&self, offset: usize, dst: &mut [u8]) {
        self.wrapper.read_to_slice(offset, dst);
    }

    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        self.wrapper.with_bytes(f)
    }

    pub fn put(&self, offset: usize, value: u8) -> Result<()> {
        self.check_modifiable()?;
        self.wrapper.put(offset, value);
        self.written(offset + 1)
    }

    pub fn put_int(&self, offset: usize, value: i32) -> Result<()> {
        self.check_modifiable()?;
        self.wrapper.put_int(offset, value, self.storage.byte_order);
        self.written(offset + 4)
    }

    pub fn put_long(&self, offset: usize, value: i64) -> Result<()> {
        self.check_modifiable()?;
        self.wrapper.put_long(offset, value, self.storage.byte_order);
        self.written(offset + 8)
    }

    pub fn put_from_slice(&self, offset: usize, src: &[u8]) -> Result<()> {
        self.check_modifiable()?;
        self.wrapper.put_from_slice(offset, src);
        self.written(offset + src.len())
    }

    pub fn put_from_buf(&self, offset: usize, src: &mut impl Buf) -> Result<usize> {
        self.check_modifiable()?;
        let n = self.wrapper.put_from_buf(offset, src)?;
        self.written(offset + n)?;
        Ok(n)
    }

    /// Mutate the page in place. The whole page counts as written.
    pub fn with_bytes_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        self.check_modifiable()?;
        let result = self.wrapper.with_bytes_mut(f);
        self.written(self.wrapper.len())?;
        Ok(result)
    }

    fn check_modifiable(&self) -> Result<()> {
        if !self.modify {
            return Err(Error::storage(format!(
                "page {} was not locked for modification",
                self.wrapper.key()
            )));
        }
        Ok(())
    }

    fn written(&self, end: usize) -> Result<()> {
        self.storage.mark_written(self.wrapper.position() + end as u64)
    }
}

impl Drop for PageGuard<'_> {
    fn drop(&mut self) {
        self.wrapper.unlock();
    }
}

/// Sequential reader over a storage file; empty when the file is missing
pub struct FileReader<'a> {
    channel: Option<&'a Channel>,
    position: u64,
}

impl<'a> FileReader<'a> {
    fn new(channel: Option<&'a Channel>) -> Self {
        Self {
            channel,
            position: 0,
        }
    }

    /// File size, zero for a missing file
    pub fn size(&self) -> Result<u64> {
        self.channel.map_or(Ok(0), Channel::size)
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Read at `offset` without moving the stream position
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        match self.channel {
            Some(channel) => channel.read_at(offset, buf),
            None => Ok(0),
        }
    }
}

impl Read for FileReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.read_at(self.position, buf).map_err(|e| match e {
            Error::Io(e) => e,
            other => io::Error::other(other),
        })?;
        self.position += n as u64;
        Ok(n)
    }
}
