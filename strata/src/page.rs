//! The in-memory page: one fixed frame of the buffer pool, carrying the
//! raw bytes plus the metadata the pager needs for pinning and eviction.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{RawRwLock, RwLock, RwLockReadGuard};

use crate::{PageNum, NO_PAGE, PAGE_SIZE};

/// A page-sized, page-aligned byte buffer. The alignment keeps frames
/// usable with direct I/O without a custom allocator.
#[repr(align(4096))]
pub struct PageBuf(pub [u8; PAGE_SIZE]);

impl PageBuf {
    fn zeroed() -> Self {
        PageBuf([0; PAGE_SIZE])
    }
}

impl Deref for PageBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl DerefMut for PageBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

/// Owned read guard over a page's bytes. Owned guards let cursors and
/// lock-crabbing descents carry page locks across call boundaries.
pub type PageReadGuard = ArcRwLockReadGuard<RawRwLock, PageBuf>;
/// Owned write guard over a page's bytes.
pub type PageWriteGuard = ArcRwLockWriteGuard<RawRwLock, PageBuf>;

/// A page caches one on-disk page and tracks the metadata the pager uses
/// to decide when the frame can be evicted.
///
/// Pin-count protocol: a page is handed out pinned; every `get` must be
/// balanced by a `put`; eviction is legal only at pin count zero.
pub struct Page {
    page_num: AtomicI64,
    pin_count: AtomicI64,
    dirty: AtomicBool,
    data: Arc<RwLock<PageBuf>>,
}

impl Page {
    pub(crate) fn new() -> Self {
        Page {
            page_num: AtomicI64::new(NO_PAGE),
            pin_count: AtomicI64::new(0),
            dirty: AtomicBool::new(false),
            data: Arc::new(RwLock::new(PageBuf::zeroed())),
        }
    }

    /// The page's position in the backing file, or [`NO_PAGE`] when the
    /// frame is unbound.
    pub fn page_num(&self) -> PageNum {
        self.page_num.load(Ordering::SeqCst)
    }

    pub(crate) fn set_page_num(&self, page_num: PageNum) {
        self.page_num.store(page_num, Ordering::SeqCst);
    }

    /// Whether the page holds changes not yet written to disk.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    pub(crate) fn set_dirty(&self, dirty: bool) {
        self.dirty.store(dirty, Ordering::SeqCst);
    }

    pub(crate) fn set_pin_count(&self, count: i64) {
        self.pin_count.store(count, Ordering::SeqCst);
    }

    /// Increments the pin count, returning the new value.
    pub(crate) fn pin(&self) -> i64 {
        self.pin_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Decrements the pin count, returning the new value.
    pub(crate) fn unpin(&self) -> i64 {
        self.pin_count.fetch_add(-1, Ordering::SeqCst) - 1
    }

    /// Takes a read lock on the page's bytes.
    pub fn read(&self) -> PageReadGuard {
        self.data.read_arc()
    }

    /// Takes a write lock on the page's bytes and marks the page dirty.
    pub fn write(&self) -> PageWriteGuard {
        self.set_dirty(true);
        self.data.write_arc()
    }

    /// Write access for the pager itself (rebinding or filling a frame);
    /// does not touch the dirty flag.
    pub(crate) fn frame_write(&self) -> PageWriteGuard {
        self.data.write_arc()
    }

    /// Read access used while flushing. Recursive so a flush is safe while
    /// the caller already holds this page's read lock (the checkpoint path).
    pub(crate) fn read_for_flush(&self) -> RwLockReadGuard<'_, PageBuf> {
        self.data.read_recursive()
    }
}
