use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;

use log::debug;
use parking_lot::{Mutex, RwLock};

use crate::common::types::{FrameId, Page, PageId, PagePtr, INVALID_PAGE_ID};
use crate::storage::buffer::error::BufferPoolError;
use crate::storage::buffer::replacer::LruReplacer;
use crate::storage::disk::DiskManager;

/// One slot of the buffer pool. The page contents live behind the page's
/// own latch; the bookkeeping here is guarded by the pool mutex.
struct Frame {
    page: PagePtr,
    page_id: PageId,
    pin_count: u32,
    is_dirty: bool,
}

struct PoolInner {
    frames: Vec<Frame>,
    page_table: HashMap<PageId, FrameId>,
    free_list: VecDeque<FrameId>,
}

/// Fixed-capacity page cache over the disk manager's heap file.
///
/// Callers get a pinned view of a page and must `unpin_page` it when done;
/// a page with a positive pin count is never evicted. All bookkeeping is
/// serialized on one pool mutex, and disk I/O happens while it is held.
pub struct BufferPoolManager {
    pool_size: usize,
    disk_manager: Arc<DiskManager>,
    replacer: LruReplacer,
    latch: Mutex<PoolInner>,
}

impl BufferPoolManager {
    pub fn new(pool_size: usize, db_path: impl AsRef<Path>) -> Result<Self, BufferPoolError> {
        let disk_manager = Arc::new(DiskManager::new(db_path)?);
        Ok(Self::with_disk_manager(pool_size, disk_manager))
    }

    pub fn with_disk_manager(pool_size: usize, disk_manager: Arc<DiskManager>) -> Self {
        let mut frames = Vec::with_capacity(pool_size);
        let mut free_list = VecDeque::with_capacity(pool_size);
        for frame_id in 0..pool_size {
            frames.push(Frame {
                page: Arc::new(RwLock::new(Page::new(INVALID_PAGE_ID))),
                page_id: INVALID_PAGE_ID,
                pin_count: 0,
                is_dirty: false,
            });
            free_list.push_back(frame_id);
        }

        Self {
            pool_size,
            disk_manager,
            replacer: LruReplacer::new(pool_size),
            latch: Mutex::new(PoolInner {
                frames,
                page_table: HashMap::new(),
                free_list,
            }),
        }
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    pub fn disk_manager(&self) -> &Arc<DiskManager> {
        &self.disk_manager
    }

    /// Fetch a page, pinning it. Resident pages are served from their
    /// frame; otherwise a victim frame is recycled and the page is read
    /// from disk.
    pub fn fetch_page(&self, page_id: PageId) -> Result<PagePtr, BufferPoolError> {
        if page_id < 0 {
            return Err(BufferPoolError::InvalidPageId(page_id));
        }

        let mut inner = self.latch.lock();

        if let Some(&frame_id) = inner.page_table.get(&page_id) {
            let frame = &mut inner.frames[frame_id];
            frame.pin_count += 1;
            self.replacer.pin(frame_id);
            return Ok(frame.page.clone());
        }

        let frame_id = self.find_victim(&mut inner)?;
        self.evict_frame(&mut inner, frame_id)?;

        {
            let frame = &mut inner.frames[frame_id];
            let mut page = frame.page.write();
            self.disk_manager.read_page(page_id, &mut page.data)?;
            page.page_id = page_id;
            frame.page_id = page_id;
            frame.pin_count = 1;
            frame.is_dirty = false;
        }
        inner.page_table.insert(page_id, frame_id);
        self.replacer.pin(frame_id);

        Ok(inner.frames[frame_id].page.clone())
    }

    /// Allocate a fresh page, pinned and zeroed. The victim frame is found
    /// before the page id is allocated so that a full pool does not waste
    /// id space.
    pub fn new_page(&self) -> Result<(PagePtr, PageId), BufferPoolError> {
        let mut inner = self.latch.lock();

        let frame_id = self.find_victim(&mut inner)?;
        self.evict_frame(&mut inner, frame_id)?;

        let page_id = self.disk_manager.allocate_page()?;
        {
            let frame = &mut inner.frames[frame_id];
            let mut page = frame.page.write();
            page.reset();
            page.page_id = page_id;
            frame.page_id = page_id;
            frame.pin_count = 1;
            frame.is_dirty = false;
        }
        inner.page_table.insert(page_id, frame_id);
        self.replacer.pin(frame_id);

        Ok((inner.frames[frame_id].page.clone(), page_id))
    }

    /// Drop one pin. The dirty flag is sticky: once set it stays until the
    /// page is flushed. A pin count reaching zero makes the frame an
    /// eviction candidate.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> Result<(), BufferPoolError> {
        let mut inner = self.latch.lock();

        let frame_id = match inner.page_table.get(&page_id) {
            Some(&frame_id) => frame_id,
            None => return Err(BufferPoolError::PageNotResident(page_id)),
        };

        let frame = &mut inner.frames[frame_id];
        if frame.pin_count == 0 {
            return Err(BufferPoolError::PinCountZero(page_id));
        }

        frame.pin_count -= 1;
        if is_dirty {
            frame.is_dirty = true;
        }
        if frame.pin_count == 0 {
            self.replacer.unpin(frame_id);
        }
        Ok(())
    }

    /// Write a resident page to disk and clear its dirty flag. Pin state is
    /// unchanged.
    pub fn flush_page(&self, page_id: PageId) -> Result<(), BufferPoolError> {
        let mut inner = self.latch.lock();

        let frame_id = match inner.page_table.get(&page_id) {
            Some(&frame_id) => frame_id,
            None => return Err(BufferPoolError::PageNotResident(page_id)),
        };

        let frame = &mut inner.frames[frame_id];
        {
            let page = frame.page.read();
            self.disk_manager.write_page(page_id, &page.data)?;
        }
        frame.is_dirty = false;
        Ok(())
    }

    /// Write every resident dirty page to disk.
    pub fn flush_all_pages(&self) -> Result<(), BufferPoolError> {
        let mut inner = self.latch.lock();
        for frame in inner.frames.iter_mut() {
            if frame.page_id != INVALID_PAGE_ID && frame.is_dirty {
                let page = frame.page.read();
                self.disk_manager.write_page(frame.page_id, &page.data)?;
                drop(page);
                frame.is_dirty = false;
            }
        }
        Ok(())
    }

    /// Remove a page from the pool and deallocate it. Succeeds trivially if
    /// the page is not resident; fails if it is still pinned.
    pub fn delete_page(&self, page_id: PageId) -> Result<(), BufferPoolError> {
        let mut inner = self.latch.lock();

        let frame_id = match inner.page_table.get(&page_id) {
            Some(&frame_id) => frame_id,
            None => return Ok(()),
        };

        if inner.frames[frame_id].pin_count > 0 {
            return Err(BufferPoolError::PagePinned(page_id));
        }

        self.disk_manager.deallocate_page(page_id);
        inner.page_table.remove(&page_id);
        self.replacer.pin(frame_id);

        let frame = &mut inner.frames[frame_id];
        frame.page.write().reset();
        frame.page_id = INVALID_PAGE_ID;
        frame.pin_count = 0;
        frame.is_dirty = false;
        inner.free_list.push_back(frame_id);
        Ok(())
    }

    /// Victim frame for a new resident page: free list first, then LRU.
    fn find_victim(&self, inner: &mut PoolInner) -> Result<FrameId, BufferPoolError> {
        if let Some(frame_id) = inner.free_list.pop_front() {
            return Ok(frame_id);
        }
        self.replacer.victim().ok_or(BufferPoolError::BufferPoolFull)
    }

    /// Write back the frame's old page if dirty and drop its mapping.
    fn evict_frame(&self, inner: &mut PoolInner, frame_id: FrameId) -> Result<(), BufferPoolError> {
        let (old_page_id, is_dirty, page_ptr) = {
            let frame = &inner.frames[frame_id];
            (frame.page_id, frame.is_dirty, frame.page.clone())
        };

        if old_page_id != INVALID_PAGE_ID {
            if is_dirty {
                debug!("evicting dirty page {}", old_page_id);
                let page = page_ptr.read();
                self.disk_manager.write_page(old_page_id, &page.data)?;
            }
            inner.page_table.remove(&old_page_id);
        }

        let frame = &mut inner.frames[frame_id];
        frame.page_id = INVALID_PAGE_ID;
        frame.pin_count = 0;
        frame.is_dirty = false;
        Ok(())
    }
}
