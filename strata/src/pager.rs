//! The pager maps a file of fixed-size pages into a bounded pool of
//! in-memory frames, with pin-count based eviction.
//!
//! Every frame is in exactly one of three sets at all times: free (never
//! bound to a page, or evicted), unpinned (resident, pin count zero,
//! eviction candidate) or pinned (resident and in use). The page table
//! points only at resident frames. Eviction is strict LRU over the
//! unpinned queue.

use std::collections::HashMap;
use std::fs::{create_dir_all, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, trace};

use crate::page::{Page, PageReadGuard};
use crate::{Error, PageNum, Result, MAX_PAGES_IN_BUFFER, NO_PAGE, PAGE_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameState {
    Free,
    Unpinned,
    Pinned,
}

/// Index-based doubly-linked queue over the fixed frame set. Gives the
/// O(1) push-tail, pop-head and unlink that eviction and promotion need.
struct LruQueue {
    head: i64,
    tail: i64,
    prev: Vec<i64>,
    next: Vec<i64>,
}

impl LruQueue {
    fn new(capacity: usize) -> Self {
        LruQueue {
            head: -1,
            tail: -1,
            prev: vec![-1; capacity],
            next: vec![-1; capacity],
        }
    }

    fn push_tail(&mut self, idx: usize) {
        let idx_i = idx as i64;
        self.prev[idx] = self.tail;
        self.next[idx] = -1;
        if self.tail >= 0 {
            self.next[self.tail as usize] = idx_i;
        } else {
            self.head = idx_i;
        }
        self.tail = idx_i;
    }

    fn pop_head(&mut self) -> Option<usize> {
        if self.head < 0 {
            return None;
        }
        let idx = self.head as usize;
        self.unlink(idx);
        Some(idx)
    }

    /// Removes `idx` from the queue. The frame must currently be linked.
    fn unlink(&mut self, idx: usize) {
        let (prev, next) = (self.prev[idx], self.next[idx]);
        if prev >= 0 {
            self.next[prev as usize] = next;
        } else {
            self.head = next;
        }
        if next >= 0 {
            self.prev[next as usize] = prev;
        } else {
            self.tail = prev;
        }
        self.prev[idx] = -1;
        self.next[idx] = -1;
    }
}

struct PagerInner {
    file: Option<File>,
    num_pages: i64,
    page_table: HashMap<PageNum, usize>,
    state: Vec<FrameState>,
    free: Vec<usize>,
    unpinned: LruQueue,
    pinned: usize,
}

/// A bounded frame pool over a page-granular file.
pub struct Pager {
    path: PathBuf,
    frames: Vec<Arc<Page>>,
    inner: Mutex<PagerInner>,
}

impl Pager {
    /// Opens (or creates) the backing file at `path`, rejecting files whose
    /// size is not a multiple of the page size, and pre-allocates the
    /// frame pool with every frame on the free list.
    pub fn new(path: impl AsRef<Path>) -> Result<Pager> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let file_size = file.metadata()?.len();
        if file_size % PAGE_SIZE as u64 != 0 {
            return Err(Error::CorruptedFile);
        }
        let num_pages = (file_size / PAGE_SIZE as u64) as i64;
        trace!(?path, num_pages, "opened pager file");

        let frames: Vec<Arc<Page>> = (0..MAX_PAGES_IN_BUFFER)
            .map(|_| Arc::new(Page::new()))
            .collect();
        Ok(Pager {
            path,
            frames,
            inner: Mutex::new(PagerInner {
                file: Some(file),
                num_pages,
                page_table: HashMap::new(),
                state: vec![FrameState::Free; MAX_PAGES_IN_BUFFER],
                free: (0..MAX_PAGES_IN_BUFFER).collect(),
                unpinned: LruQueue::new(MAX_PAGES_IN_BUFFER),
                pinned: 0,
            }),
        })
    }

    /// The path of the backing file.
    pub fn file_path(&self) -> &Path {
        &self.path
    }

    /// The number of pages this pager has access to, on disk and in memory.
    pub fn num_pages(&self) -> i64 {
        self.inner.lock().num_pages
    }

    fn file(inner: &mut PagerInner) -> Result<&mut File> {
        inner
            .file
            .as_mut()
            .ok_or_else(|| Error::Io(io::Error::other("pager is closed")))
    }

    /// Allocates a fresh page numbered after the current end of the file,
    /// returned pinned and dirty.
    pub fn get_new_page(&self) -> Result<Arc<Page>> {
        let mut inner = self.inner.lock();
        let idx = self.acquire_frame(&mut inner)?;
        let page = &self.frames[idx];
        let page_num = inner.num_pages;
        page.set_page_num(page_num);
        page.set_pin_count(1);
        page.set_dirty(true);
        page.frame_write().0.fill(0);
        inner.state[idx] = FrameState::Pinned;
        inner.pinned += 1;
        inner.page_table.insert(page_num, idx);
        inner.num_pages += 1;
        trace!(page = page_num, "allocated new page");
        Ok(Arc::clone(page))
    }

    /// Returns the existing page `page_num`, reading it in from disk if it
    /// is not already resident. The page comes back with one extra pin.
    pub fn get_page(&self, page_num: PageNum) -> Result<Arc<Page>> {
        let mut inner = self.inner.lock();
        if page_num < 0 || page_num > inner.num_pages - 1 {
            return Err(Error::InvalidPageNum(page_num));
        }

        if let Some(&idx) = inner.page_table.get(&page_num) {
            if inner.state[idx] == FrameState::Unpinned {
                inner.unpinned.unlink(idx);
                inner.state[idx] = FrameState::Pinned;
                inner.pinned += 1;
            }
            let page = &self.frames[idx];
            page.pin();
            return Ok(Arc::clone(page));
        }

        let idx = self.acquire_frame(&mut inner)?;
        let page = &self.frames[idx];
        page.set_page_num(page_num);
        page.set_pin_count(1);
        page.set_dirty(false);
        if let Err(err) = Self::fill_from_disk(&mut inner, page) {
            // Roll the in-flight frame back onto the free list.
            page.set_page_num(NO_PAGE);
            page.set_pin_count(0);
            inner.state[idx] = FrameState::Free;
            inner.free.push(idx);
            return Err(err);
        }
        inner.state[idx] = FrameState::Pinned;
        inner.pinned += 1;
        inner.page_table.insert(page_num, idx);
        Ok(Arc::clone(page))
    }

    /// Releases one reference to `page`. At pin count zero the frame moves
    /// to the tail of the unpinned queue; below zero is a protocol error.
    pub fn put_page(&self, page: &Page) -> Result<()> {
        let mut inner = self.inner.lock();
        let count = page.unpin();
        if count == 0 {
            if let Some(&idx) = inner.page_table.get(&page.page_num()) {
                inner.state[idx] = FrameState::Unpinned;
                inner.pinned -= 1;
                inner.unpinned.push_tail(idx);
            }
        }
        if count < 0 {
            return Err(Error::PinUnderflow(page.page_num()));
        }
        Ok(())
    }

    /// Writes `page` back to its file offset if it is dirty.
    pub fn flush_page(&self, page: &Page) -> Result<()> {
        let mut inner = self.inner.lock();
        self.flush_frame(&mut inner, page)
    }

    /// Flushes every resident page.
    pub fn flush_all_pages(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        self.flush_all_locked(&mut inner)
    }

    /// Flushes everything and closes the backing file. Fails while any
    /// frame is still pinned.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.pinned > 0 {
            return Err(Error::PagesStillPinned);
        }
        self.flush_all_locked(&mut inner)?;
        if let Some(file) = inner.file.take() {
            file.sync_all()?;
        }
        Ok(())
    }

    /// Read-locks every resident page, holding the pager mutex for the
    /// duration of the returned guard. Used by the checkpoint path so pages
    /// can be flushed while no writer is mid-update.
    pub fn lock_all_pages(&self) -> AllPagesGuard<'_> {
        let inner = self.inner.lock();
        let guards = inner
            .page_table
            .values()
            .map(|&idx| {
                let page = Arc::clone(&self.frames[idx]);
                let guard = page.read();
                (page, guard)
            })
            .collect();
        AllPagesGuard { inner, guards }
    }

    /// Grabs a frame to (re)bind: free list first, then evict the head of
    /// the unpinned queue after flushing it. The pager mutex must be held.
    fn acquire_frame(&self, inner: &mut PagerInner) -> Result<usize> {
        if let Some(idx) = inner.free.pop() {
            return Ok(idx);
        }
        if let Some(idx) = inner.unpinned.pop_head() {
            let page = &self.frames[idx];
            self.flush_frame(inner, page)?;
            inner.page_table.remove(&page.page_num());
            debug!(page = page.page_num(), "evicted page from buffer pool");
            return Ok(idx);
        }
        Err(Error::OutOfPages)
    }

    fn flush_frame(&self, inner: &mut PagerInner, page: &Page) -> Result<()> {
        if !page.is_dirty() {
            return Ok(());
        }
        let buf = page.read_for_flush();
        let offset = page.page_num() as u64 * PAGE_SIZE as u64;
        let file = Self::file(inner)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&buf.0)?;
        page.set_dirty(false);
        Ok(())
    }

    fn flush_all_locked(&self, inner: &mut PagerInner) -> Result<()> {
        let resident: Vec<usize> = inner.page_table.values().copied().collect();
        for idx in resident {
            self.flush_frame(inner, &self.frames[idx])?;
        }
        Ok(())
    }

    fn fill_from_disk(inner: &mut PagerInner, page: &Page) -> Result<()> {
        let offset = page.page_num() as u64 * PAGE_SIZE as u64;
        let file = Self::file(inner)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = page.frame_write();
        let mut filled = 0;
        while filled < PAGE_SIZE {
            let n = file.read(&mut buf.0[filled..])?;
            if n == 0 {
                buf.0[filled..].fill(0);
                break;
            }
            filled += n;
        }
        Ok(())
    }
}

/// Holds the pager mutex plus read guards on every resident page.
pub struct AllPagesGuard<'a> {
    inner: MutexGuard<'a, PagerInner>,
    guards: Vec<(Arc<Page>, PageReadGuard)>,
}

impl AllPagesGuard<'_> {
    /// Flushes every dirty resident page through the held guards.
    pub fn flush(&mut self) -> Result<()> {
        for (page, guard) in &self.guards {
            if !page.is_dirty() {
                continue;
            }
            let offset = page.page_num() as u64 * PAGE_SIZE as u64;
            let file = Pager::file(&mut self.inner)?;
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(&guard.0)?;
            page.set_dirty(false);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn new_page_survives_flush_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        let pager = Pager::new(&path).unwrap();
        let page = pager.get_new_page().unwrap();
        assert_eq!(page.page_num(), 0);
        page.write().0[..5].copy_from_slice(b"hello");
        pager.put_page(&page).unwrap();
        pager.flush_page(&page).unwrap();
        pager.close().unwrap();

        let pager = Pager::new(&path).unwrap();
        assert_eq!(pager.num_pages(), 1);
        let page = pager.get_page(0).unwrap();
        assert_eq!(&page.read().0[..5], b"hello");
        pager.put_page(&page).unwrap();
        pager.close().unwrap();
    }

    #[test]
    fn rejects_misaligned_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        std::fs::write(&path, [0u8; 100]).unwrap();
        assert!(matches!(Pager::new(&path), Err(Error::CorruptedFile)));
    }

    #[test]
    fn evicts_least_recently_unpinned_first() {
        let dir = tempdir().unwrap();
        let pager = Pager::new(dir.path().join("test.db")).unwrap();

        // Fill every frame, then release them in order.
        let mut pages = Vec::new();
        for _ in 0..MAX_PAGES_IN_BUFFER {
            pages.push(pager.get_new_page().unwrap());
        }
        for page in &pages {
            pager.put_page(page).unwrap();
        }

        // Touch page 0 so page 1 becomes the eviction candidate.
        let page = pager.get_page(0).unwrap();
        pager.put_page(&page).unwrap();

        let fresh = pager.get_new_page().unwrap();
        assert_eq!(fresh.page_num(), MAX_PAGES_IN_BUFFER as i64);
        assert!(pager.get_page(1).is_ok()); // page 1 was evicted, read back in
        assert!(pager.get_page(0).is_ok()); // page 0 stayed resident
    }
}
