//! Page buffer cache
//!
//! Every tree page lives in a frame owned by the cache. Callers never hold
//! raw references into a frame: they pin a page and receive a guard that
//! carries either a read or a write latch. Dropping the guard releases the
//! latch and unpins the frame.
//!
//! ```text
//!   BufferCache
//!     files: FileId -> PageFile
//!                        backing: Memory | Disk(File)
//!                        frames:  PageId -> Frame { latch, pin_count, dirty }
//! ```
//!
//! Memory-backed files hold the pages of memory components; they are never
//! evicted and are reset in place when a component is recycled. Disk-backed
//! files hold immutable disk components; their clean, unpinned frames are
//! evicted once the resident count exceeds the configured capacity.

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{RawRwLock, RwLock};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::ops::{Deref, DerefMut};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use strata_common::{Error, FileId, PageId, Result};
use tracing::{debug, warn};

/// Cache statistics for monitoring
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Pins served from a resident frame
    pub hits: AtomicU64,
    /// Pins that had to read the page from disk
    pub misses: AtomicU64,
    /// Frames evicted to stay within capacity
    pub evictions: AtomicU64,
    /// Dirty frames written back to their file
    pub writebacks: AtomicU64,
}

impl CacheStats {
    /// Calculate hit ratio (0.0 to 1.0)
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            return 0.0;
        }
        hits as f64 / total as f64
    }
}

struct Frame {
    page: PageId,
    latch: Arc<RwLock<Box<[u8]>>>,
    pin_count: AtomicUsize,
    dirty: AtomicBool,
    last_access: AtomicU64,
}

impl Frame {
    fn new(page: PageId, data: Box<[u8]>, tick: u64) -> Self {
        Self {
            page,
            latch: Arc::new(RwLock::new(data)),
            pin_count: AtomicUsize::new(0),
            dirty: AtomicBool::new(false),
            last_access: AtomicU64::new(tick),
        }
    }

    fn pin(&self, tick: u64) {
        self.pin_count.fetch_add(1, Ordering::AcqRel);
        self.last_access.store(tick, Ordering::Relaxed);
    }

    fn unpin(&self) {
        self.pin_count.fetch_sub(1, Ordering::AcqRel);
    }

    fn is_evictable(&self) -> bool {
        self.pin_count.load(Ordering::Acquire) == 0 && !self.dirty.load(Ordering::Acquire)
    }
}

enum Backing {
    Memory,
    Disk { path: PathBuf, file: File },
}

struct PageFile {
    backing: Backing,
    frames: RwLock<HashMap<PageId, Arc<Frame>>>,
    page_count: AtomicU32,
}

impl PageFile {
    const fn is_disk(&self) -> bool {
        matches!(self.backing, Backing::Disk { .. })
    }

    /// Pin a resident frame. The pin is taken under the map lock so an
    /// evictor holding the write lock never removes a frame being pinned.
    fn pin_resident(&self, page: PageId, tick: u64) -> Option<Arc<Frame>> {
        let frames = self.frames.read();
        frames.get(&page).map(|frame| {
            frame.pin(tick);
            Arc::clone(frame)
        })
    }
}

/// Read-latched, pinned page
pub struct PageReadGuard {
    frame: Arc<Frame>,
    data: ArcRwLockReadGuard<RawRwLock, Box<[u8]>>,
}

impl PageReadGuard {
    #[must_use]
    pub fn page_id(&self) -> PageId {
        self.frame.page
    }
}

impl Deref for PageReadGuard {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl Drop for PageReadGuard {
    fn drop(&mut self) {
        self.frame.unpin();
    }
}

/// Write-latched, pinned page; marks the frame dirty if it was modified
pub struct PageWriteGuard {
    frame: Arc<Frame>,
    data: ArcRwLockWriteGuard<RawRwLock, Box<[u8]>>,
    modified: bool,
}

impl PageWriteGuard {
    #[must_use]
    pub fn page_id(&self) -> PageId {
        self.frame.page
    }
}

impl Deref for PageWriteGuard {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for PageWriteGuard {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.modified = true;
        &mut self.data
    }
}

impl Drop for PageWriteGuard {
    fn drop(&mut self) {
        if self.modified {
            self.frame.dirty.store(true, Ordering::Release);
        }
        self.frame.unpin();
    }
}

/// Shared page cache for every tree of every index in the process
pub struct BufferCache {
    page_size: usize,
    capacity_pages: usize,
    files: RwLock<HashMap<FileId, Arc<PageFile>>>,
    next_file: AtomicU32,
    clock: AtomicU64,
    resident_disk_pages: AtomicUsize,
    stats: CacheStats,
}

impl BufferCache {
    /// Create a cache for pages of `page_size` bytes
    #[must_use]
    pub fn new(page_size: usize, capacity_pages: usize) -> Self {
        Self {
            page_size,
            capacity_pages: capacity_pages.max(1),
            files: RwLock::new(HashMap::new()),
            next_file: AtomicU32::new(1),
            clock: AtomicU64::new(0),
            resident_disk_pages: AtomicUsize::new(0),
            stats: CacheStats::default(),
        }
    }

    #[must_use]
    pub const fn page_size(&self) -> usize {
        self.page_size
    }

    #[must_use]
    pub const fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Disk pages currently resident
    #[must_use]
    pub fn resident_disk_pages(&self) -> usize {
        self.resident_disk_pages.load(Ordering::Relaxed)
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    fn register(&self, backing: Backing, page_count: u32) -> FileId {
        let id = FileId::new(self.next_file.fetch_add(1, Ordering::Relaxed));
        let file = PageFile {
            backing,
            frames: RwLock::new(HashMap::new()),
            page_count: AtomicU32::new(page_count),
        };
        self.files.write().insert(id, Arc::new(file));
        id
    }

    fn file(&self, id: FileId) -> Result<Arc<PageFile>> {
        self.files
            .read()
            .get(&id)
            .cloned()
            .ok_or(Error::FileNotFound(id))
    }

    /// Register a memory-resident page file
    pub fn create_memory_file(&self) -> FileId {
        self.register(Backing::Memory, 0)
    }

    /// Create a new, empty disk-backed page file
    pub fn create_file(&self, path: &Path) -> Result<FileId> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| Error::Storage(format!("failed to create {}: {}", path.display(), e)))?;
        Ok(self.register(
            Backing::Disk {
                path: path.to_path_buf(),
                file,
            },
            0,
        ))
    }

    /// Open an existing disk-backed page file
    pub fn open_file(&self, path: &Path) -> Result<FileId> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| Error::Storage(format!("failed to open {}: {}", path.display(), e)))?;
        let len = file.metadata()?.len();
        let page_size = self.page_size as u64;
        if len % page_size != 0 {
            return Err(Error::corruption(format!(
                "{} is {} bytes, not a multiple of the {} byte page size",
                path.display(),
                len,
                page_size
            )));
        }
        let pages = u32::try_from(len / page_size)
            .map_err(|_| Error::corruption(format!("{} has too many pages", path.display())))?;
        Ok(self.register(
            Backing::Disk {
                path: path.to_path_buf(),
                file,
            },
            pages,
        ))
    }

    /// Number of allocated pages in a file
    pub fn page_count(&self, id: FileId) -> Result<u32> {
        Ok(self.file(id)?.page_count.load(Ordering::Acquire))
    }

    fn pin(&self, id: FileId, page: PageId) -> Result<Arc<Frame>> {
        let file = self.file(id)?;
        let tick = self.tick();
        if let Some(frame) = file.pin_resident(page, tick) {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(frame);
        }

        let Backing::Disk { file: handle, .. } = &file.backing else {
            return Err(Error::PageNotFound { file: id, page });
        };
        if page.as_u32() >= file.page_count.load(Ordering::Acquire) {
            return Err(Error::PageNotFound { file: id, page });
        }

        let mut data = vec![0u8; self.page_size].into_boxed_slice();
        handle
            .read_exact_at(&mut data, page.offset(self.page_size))
            .map_err(|e| Error::Storage(format!("failed to read page {id}/{page}: {e}")))?;
        self.stats.misses.fetch_add(1, Ordering::Relaxed);

        let frame = {
            let mut frames = file.frames.write();
            let frame = frames.entry(page).or_insert_with(|| {
                self.resident_disk_pages.fetch_add(1, Ordering::Relaxed);
                Arc::new(Frame::new(page, data, tick))
            });
            frame.pin(tick);
            Arc::clone(frame)
        };
        self.evict_if_needed();
        Ok(frame)
    }

    /// Pin a page and take its read latch
    pub fn pin_read(&self, file: FileId, page: PageId) -> Result<PageReadGuard> {
        let frame = self.pin(file, page)?;
        let data = frame.latch.read_arc();
        Ok(PageReadGuard { frame, data })
    }

    /// Pin a page and take its write latch
    pub fn pin_write(&self, file: FileId, page: PageId) -> Result<PageWriteGuard> {
        let frame = self.pin(file, page)?;
        let data = frame.latch.write_arc();
        Ok(PageWriteGuard {
            frame,
            data,
            modified: false,
        })
    }

    /// Allocate a zeroed page at the end of the file and return it
    /// write-latched
    pub fn new_page(&self, id: FileId) -> Result<PageWriteGuard> {
        let file = self.file(id)?;
        let tick = self.tick();
        let page = PageId::new(file.page_count.fetch_add(1, Ordering::AcqRel));
        let data = vec![0u8; self.page_size].into_boxed_slice();
        let frame = Arc::new(Frame::new(page, data, tick));
        frame.pin(tick);
        frame.dirty.store(true, Ordering::Release);
        let latch = frame.latch.write_arc();
        file.frames.write().insert(page, Arc::clone(&frame));
        if file.is_disk() {
            self.resident_disk_pages.fetch_add(1, Ordering::Relaxed);
        }
        Ok(PageWriteGuard {
            frame,
            data: latch,
            modified: true,
        })
    }

    /// Write every dirty frame of a disk file back and sync it
    pub fn flush_file(&self, id: FileId) -> Result<()> {
        let file = self.file(id)?;
        let Backing::Disk { file: handle, path } = &file.backing else {
            return Ok(());
        };
        let frames: Vec<Arc<Frame>> = file
            .frames
            .read()
            .values()
            .filter(|f| f.dirty.load(Ordering::Acquire))
            .cloned()
            .collect();
        for frame in frames {
            let data = frame.latch.read();
            handle
                .write_all_at(&data, frame.page.offset(self.page_size))
                .map_err(|e| {
                    Error::Storage(format!("failed to write page {}/{}: {}", id, frame.page, e))
                })?;
            frame.dirty.store(false, Ordering::Release);
            self.stats.writebacks.fetch_add(1, Ordering::Relaxed);
        }
        handle
            .sync_all()
            .map_err(|e| Error::Storage(format!("failed to sync {}: {}", path.display(), e)))?;
        self.evict_if_needed();
        Ok(())
    }

    /// Drop every page of a memory file so it can be rebuilt from scratch
    pub fn reset_file(&self, id: FileId) -> Result<()> {
        let file = self.file(id)?;
        if file.is_disk() {
            return Err(Error::storage(format!("cannot reset disk file {id}")));
        }
        let mut frames = file.frames.write();
        if frames
            .values()
            .any(|f| f.pin_count.load(Ordering::Acquire) > 0)
        {
            return Err(Error::storage(format!("cannot reset {id}: pages still pinned")));
        }
        frames.clear();
        file.page_count.store(0, Ordering::Release);
        Ok(())
    }

    /// Unregister a file, optionally deleting its backing file from disk
    pub fn drop_file(&self, id: FileId, delete: bool) -> Result<()> {
        let Some(file) = self.files.write().remove(&id) else {
            return Err(Error::FileNotFound(id));
        };
        if let Backing::Disk { path, .. } = &file.backing {
            let resident = file.frames.read().len();
            self.resident_disk_pages.fetch_sub(resident, Ordering::Relaxed);
            if delete {
                std::fs::remove_file(path).map_err(|e| {
                    Error::Storage(format!("failed to remove {}: {}", path.display(), e))
                })?;
                debug!(file = %id, path = %path.display(), "deleted page file");
            }
        }
        Ok(())
    }

    /// Evict clean, unpinned disk frames, least recently used first, until
    /// the resident count is back under capacity
    fn evict_if_needed(&self) {
        let resident = self.resident_disk_pages.load(Ordering::Relaxed);
        if resident <= self.capacity_pages {
            return;
        }
        let target = resident - self.capacity_pages + self.capacity_pages / 16;

        let files: Vec<Arc<PageFile>> = self
            .files
            .read()
            .values()
            .filter(|f| f.is_disk())
            .cloned()
            .collect();
        let mut candidates: Vec<(u64, usize, PageId)> = Vec::new();
        for (index, file) in files.iter().enumerate() {
            for frame in file.frames.read().values() {
                if frame.is_evictable() {
                    candidates.push((frame.last_access.load(Ordering::Relaxed), index, frame.page));
                }
            }
        }
        candidates.sort_unstable_by_key(|(access, _, _)| *access);

        let mut evicted = 0;
        for (_, index, page) in candidates {
            if evicted >= target {
                break;
            }
            let mut frames = files[index].frames.write();
            if frames.get(&page).is_some_and(|f| f.is_evictable()) {
                frames.remove(&page);
                evicted += 1;
            }
        }
        if evicted > 0 {
            self.resident_disk_pages.fetch_sub(evicted, Ordering::Relaxed);
            self.stats
                .evictions
                .fetch_add(evicted as u64, Ordering::Relaxed);
        } else {
            warn!(resident, capacity = self.capacity_pages, "buffer cache over capacity with no evictable pages");
        }
    }
}

impl std::fmt::Debug for BufferCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferCache")
            .field("page_size", &self.page_size)
            .field("capacity_pages", &self.capacity_pages)
            .field("files", &self.files.read().len())
            .field("resident_disk_pages", &self.resident_disk_pages())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_memory_file_pages() {
        let cache = BufferCache::new(512, 16);
        let file = cache.create_memory_file();

        {
            let mut page = cache.new_page(file).unwrap();
            assert_eq!(page.page_id(), PageId::new(0));
            page[0] = 7;
        }
        let second = cache.new_page(file).unwrap().page_id();
        assert_eq!(second, PageId::new(1));
        assert_eq!(cache.page_count(file).unwrap(), 2);

        let page = cache.pin_read(file, PageId::new(0)).unwrap();
        assert_eq!(page[0], 7);
        assert_eq!(page.len(), 512);
        drop(page);

        assert!(matches!(
            cache.pin_read(file, PageId::new(9)),
            Err(Error::PageNotFound { .. })
        ));
    }

    #[test]
    fn test_concurrent_readers_share_a_page() {
        let cache = BufferCache::new(512, 16);
        let file = cache.create_memory_file();
        drop(cache.new_page(file).unwrap());

        let a = cache.pin_read(file, PageId::ROOT).unwrap();
        let b = cache.pin_read(file, PageId::ROOT).unwrap();
        assert_eq!(a[..], b[..]);
    }

    #[test]
    fn test_reset_requires_unpinned_pages() {
        let cache = BufferCache::new(512, 16);
        let file = cache.create_memory_file();
        drop(cache.new_page(file).unwrap());

        let guard = cache.pin_read(file, PageId::ROOT).unwrap();
        assert!(cache.reset_file(file).is_err());
        drop(guard);

        cache.reset_file(file).unwrap();
        assert_eq!(cache.page_count(file).unwrap(), 0);
        assert_eq!(cache.new_page(file).unwrap().page_id(), PageId::ROOT);
    }

    #[test]
    fn test_disk_file_flush_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pages.tree");
        let cache = BufferCache::new(512, 16);

        let file = cache.create_file(&path).unwrap();
        for i in 0..4u8 {
            let mut page = cache.new_page(file).unwrap();
            page[10] = i + 1;
        }
        cache.flush_file(file).unwrap();
        cache.drop_file(file, false).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 4 * 512);

        let reopened = cache.open_file(&path).unwrap();
        assert_eq!(cache.page_count(reopened).unwrap(), 4);
        let page = cache.pin_read(reopened, PageId::new(2)).unwrap();
        assert_eq!(page[10], 3);
        drop(page);
        assert_eq!(cache.stats().misses.load(Ordering::Relaxed), 1);

        cache.drop_file(reopened, true).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_create_file_refuses_existing_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dup.tree");
        std::fs::write(&path, b"").unwrap();
        let cache = BufferCache::new(512, 16);
        assert!(cache.create_file(&path).is_err());
    }

    #[test]
    fn test_eviction_skips_pinned_pages() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("evict.tree");
        let cache = BufferCache::new(512, 4);

        let file = cache.create_file(&path).unwrap();
        for _ in 0..8 {
            drop(cache.new_page(file).unwrap());
        }
        cache.flush_file(file).unwrap();
        assert!(cache.resident_disk_pages() <= 4);

        let pinned = cache.pin_read(file, PageId::new(0)).unwrap();
        for i in 1..8 {
            drop(cache.pin_read(file, PageId::new(i)).unwrap());
        }
        assert!(cache.stats().evictions.load(Ordering::Relaxed) > 0);
        // The pinned frame survives every eviction round
        let again = cache.pin_read(file, PageId::new(0)).unwrap();
        assert_eq!(again[..], pinned[..]);
    }
}
