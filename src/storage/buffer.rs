//! Page cache: a fixed-capacity in-memory cache of file pages.
//!
//! Pages are fetched through RAII guards that hold the page's read/write lock
//! and pin the frame for as long as they live; dropping the guard unpins it.
//! Unpinned frames are evicted by a pluggable [`Replacer`] policy, with dirty
//! victims written back to the [`PageFile`] first. Fetching a page past the
//! end of file for writing yields a zeroed frame; the file grows when that
//! page is flushed.

pub mod lru;
pub mod replacer;

use crate::storage::disk::{PageFile, PageId};
use crate::storage::error::{StorageError, StorageResult};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Mutex, RawRwLock, RwLock};
use replacer::{FrameId, Replacer};
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// One cached page. The buffer lock is the per-page read/write lock callers
/// hold (through the guards) while decoding or mutating page bytes.
struct Frame {
    buf: Arc<RwLock<FrameBuf>>,
    pin_count: AtomicU32,
}

struct FrameBuf {
    data: Box<[u8]>,
    page_id: Option<PageId>,
    dirty: bool,
}

impl Frame {
    fn new(page_size: usize) -> Self {
        Self {
            buf: Arc::new(RwLock::new(FrameBuf {
                data: vec![0u8; page_size].into_boxed_slice(),
                page_id: None,
                dirty: false,
            })),
            pin_count: AtomicU32::new(0),
        }
    }
}

#[derive(Clone)]
pub struct PageCache {
    inner: Arc<PageCacheInner>,
}

struct PageCacheInner {
    page_table: DashMap<PageId, FrameId>,
    frames: RwLock<HashMap<FrameId, Arc<Frame>>>,
    replacer: Mutex<Box<dyn Replacer>>,
    file: Mutex<PageFile>,
    next_frame_id: AtomicU32,
    max_frames: usize,
    page_size: usize,
}

impl PageCache {
    pub fn new(file: PageFile, replacer: Box<dyn Replacer>, max_frames: usize) -> Self {
        let page_size = file.page_size();
        Self {
            inner: Arc::new(PageCacheInner {
                page_table: DashMap::new(),
                frames: RwLock::new(HashMap::with_capacity(max_frames)),
                replacer: Mutex::new(replacer),
                file: Mutex::new(file),
                next_frame_id: AtomicU32::new(0),
                max_frames,
                page_size,
            }),
        }
    }

    pub fn page_size(&self) -> usize {
        self.inner.page_size
    }

    /// Length of the backing file on disk, in bytes.
    pub fn len(&self) -> StorageResult<u64> {
        self.inner.file.lock().len()
    }

    pub fn path(&self) -> PathBuf {
        self.inner.file.lock().path().to_path_buf()
    }

    /// Fetches a page for reading. The page must exist on disk or in cache.
    pub fn fetch_page(&self, page_id: PageId) -> StorageResult<PageReadGuard> {
        loop {
            if let Some((frame_id, frame)) = self.lookup(page_id) {
                self.pin(frame_id, &frame);
                let guard = frame.buf.read_arc();
                if guard.page_id == Some(page_id) {
                    return Ok(PageReadGuard {
                        inner: self.inner.clone(),
                        frame_id,
                        frame,
                        guard,
                    });
                }
                // the frame was recycled between the table lookup and the lock
                drop(guard);
                self.unpin(frame_id, &frame);
                continue;
            }

            if let Some((frame_id, frame, guard)) = self.load_page(page_id, false)? {
                let guard = ArcRwLockWriteGuard::downgrade(guard);
                return Ok(PageReadGuard {
                    inner: self.inner.clone(),
                    frame_id,
                    frame,
                    guard,
                });
            }
            // lost the load race to another thread; retry through the table
        }
    }

    /// Fetches a page for writing, creating a zeroed page if it is past the
    /// end of file. Marks the page dirty.
    pub fn fetch_page_write(&self, page_id: PageId) -> StorageResult<PageWriteGuard> {
        loop {
            if let Some((frame_id, frame)) = self.lookup(page_id) {
                self.pin(frame_id, &frame);
                let mut guard = frame.buf.write_arc();
                if guard.page_id == Some(page_id) {
                    guard.dirty = true;
                    return Ok(PageWriteGuard {
                        inner: self.inner.clone(),
                        frame_id,
                        frame,
                        guard,
                    });
                }
                drop(guard);
                self.unpin(frame_id, &frame);
                continue;
            }

            if let Some((frame_id, frame, mut guard)) = self.load_page(page_id, true)? {
                guard.dirty = true;
                return Ok(PageWriteGuard {
                    inner: self.inner.clone(),
                    frame_id,
                    frame,
                    guard,
                });
            }
        }
    }

    /// Writes the page back to disk if it is cached and dirty.
    pub fn flush_page(&self, page_id: PageId) -> StorageResult<()> {
        if let Some((_, frame)) = self.lookup(page_id) {
            let mut buf = frame.buf.write();
            if buf.dirty && buf.page_id == Some(page_id) {
                self.inner.file.lock().write_page(page_id, &buf.data)?;
                buf.dirty = false;
            }
        }
        Ok(())
    }

    /// Writes every dirty page back to disk.
    pub fn flush_all(&self) -> StorageResult<()> {
        let frames: Vec<Arc<Frame>> = self.inner.frames.read().values().cloned().collect();
        for frame in frames {
            let mut buf = frame.buf.write();
            if buf.dirty {
                if let Some(page_id) = buf.page_id {
                    self.inner.file.lock().write_page(page_id, &buf.data)?;
                    buf.dirty = false;
                }
            }
        }
        Ok(())
    }

    /// Flushes all dirty pages and syncs the file to durable storage.
    pub fn sync(&self) -> StorageResult<()> {
        self.flush_all()?;
        self.inner.file.lock().sync()
    }

    pub fn is_dirty(&self) -> bool {
        let frames = self.inner.frames.read();
        frames.values().any(|f| f.buf.read().dirty)
    }

    fn lookup(&self, page_id: PageId) -> Option<(FrameId, Arc<Frame>)> {
        let frame_id = self.inner.page_table.get(&page_id).map(|e| *e.value())?;
        let frames = self.inner.frames.read();
        let frame = frames.get(&frame_id)?.clone();
        Some((frame_id, frame))
    }

    fn pin(&self, frame_id: FrameId, frame: &Frame) {
        frame.pin_count.fetch_add(1, Ordering::SeqCst);
        self.inner.replacer.lock().pin(frame_id);
    }

    fn unpin(&self, frame_id: FrameId, frame: &Frame) {
        if frame.pin_count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.replacer.lock().unpin(frame_id);
        }
    }

    /// Loads a page from disk into a free frame, holding its write lock.
    /// Returns None if another thread published the page first.
    #[allow(clippy::type_complexity)]
    fn load_page(
        &self,
        page_id: PageId,
        create_if_missing: bool,
    ) -> StorageResult<Option<(FrameId, Arc<Frame>, ArcRwLockWriteGuard<RawRwLock, FrameBuf>)>>
    {
        let (frame_id, frame) = self.free_frame()?;
        self.pin(frame_id, &frame);
        let mut buf = frame.buf.write_arc();

        // publish the mapping unless someone beat us to this page
        let already_mapped = match self.inner.page_table.entry(page_id) {
            Entry::Occupied(_) => true,
            Entry::Vacant(e) => {
                e.insert(frame_id);
                false
            }
        };
        if already_mapped {
            drop(buf);
            self.unpin(frame_id, &frame);
            return Ok(None);
        }

        let offset = page_id.0 as u64 * self.inner.page_size as u64;
        let load_result = {
            let mut file = self.inner.file.lock();
            if offset < file.len()? {
                file.read_page(page_id, &mut buf.data)
            } else if create_if_missing {
                buf.data.fill(0);
                Ok(())
            } else {
                Err(StorageError::PageNotFound { page_id: page_id.0 })
            }
        };
        if let Err(e) = load_result {
            self.inner.page_table.remove(&page_id);
            drop(buf);
            self.unpin(frame_id, &frame);
            return Err(e);
        }

        buf.page_id = Some(page_id);
        buf.dirty = false;
        Ok(Some((frame_id, frame, buf)))
    }

    /// Finds a frame with no page assigned: a fresh one while under the frame
    /// limit, otherwise an evicted victim (flushed first if dirty).
    fn free_frame(&self) -> StorageResult<(FrameId, Arc<Frame>)> {
        {
            let frames = self.inner.frames.read();
            if frames.len() < self.inner.max_frames {
                drop(frames);
                let mut frames = self.inner.frames.write();
                // double-check after taking the write lock
                if frames.len() < self.inner.max_frames {
                    let frame_id = self.inner.next_frame_id.fetch_add(1, Ordering::SeqCst);
                    let frame = Arc::new(Frame::new(self.inner.page_size));
                    frames.insert(frame_id, frame.clone());
                    return Ok((frame_id, frame));
                }
            }
        }

        // evict. The replacer never offers a frame whose guard is still
        // held, so taking the data lock here only waits out a racer that
        // pinned the frame after it was popped; that racer revalidates the
        // frame's page id under the lock and retries through the table.
        loop {
            let Some(frame_id) = self.inner.replacer.lock().evict() else {
                return Err(StorageError::CacheFull);
            };
            let frame = {
                let frames = self.inner.frames.read();
                match frames.get(&frame_id) {
                    Some(f) => f.clone(),
                    None => continue,
                }
            };
            let mut buf = frame.buf.write();
            if let Some(page_id) = buf.page_id {
                // flush before unmapping, so a concurrent reload of this
                // page cannot read stale bytes off the disk
                if buf.dirty {
                    self.inner.file.lock().write_page(page_id, &buf.data)?;
                    buf.dirty = false;
                }
                self.inner.page_table.remove(&page_id);
            }
            buf.page_id = None;
            buf.dirty = false;
            drop(buf);
            return Ok((frame_id, frame));
        }
    }
}

pub struct PageReadGuard {
    inner: Arc<PageCacheInner>,
    frame_id: FrameId,
    frame: Arc<Frame>,
    guard: ArcRwLockReadGuard<RawRwLock, FrameBuf>,
}

impl Deref for PageReadGuard {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.guard.data
    }
}

impl Drop for PageReadGuard {
    fn drop(&mut self) {
        // the data lock itself is released when `guard` drops right after
        if self.frame.pin_count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.replacer.lock().unpin(self.frame_id);
        }
    }
}

pub struct PageWriteGuard {
    inner: Arc<PageCacheInner>,
    frame_id: FrameId,
    frame: Arc<Frame>,
    guard: ArcRwLockWriteGuard<RawRwLock, FrameBuf>,
}

impl Deref for PageWriteGuard {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.guard.data
    }
}

impl DerefMut for PageWriteGuard {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.guard.data
    }
}

impl Drop for PageWriteGuard {
    fn drop(&mut self) {
        if self.frame.pin_count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.replacer.lock().unpin(self.frame_id);
        }
    }
}
