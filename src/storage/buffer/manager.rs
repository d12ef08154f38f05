use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use log::{debug, trace};
use parking_lot::Mutex;

use crate::common::types::{FrameId, Page, PageId, PagePtr, INVALID_PAGE_ID};
use crate::storage::buffer::error::BufferPoolError;
use crate::storage::buffer::replacer::LruReplacer;
use crate::storage::disk::DiskManager;

/// Frame metadata. Lives under the pool mutex, never under the page latch.
struct FrameMeta {
    page_id: PageId,
    pin_count: u32,
    is_dirty: bool,
}

impl FrameMeta {
    fn new() -> Self {
        Self {
            page_id: INVALID_PAGE_ID,
            pin_count: 0,
            is_dirty: false,
        }
    }
}

/// Everything the single pool mutex serializes: the page table, the free
/// list, the replacer and all frame metadata. Page byte buffers are outside,
/// latched individually by callers.
struct PoolState {
    page_table: HashMap<PageId, FrameId>,
    free_list: VecDeque<FrameId>,
    replacer: LruReplacer,
    metas: Vec<FrameMeta>,
}

/// Buffer pool manager - a fixed-size page cache over the disk file.
///
/// Every page access is bracketed by `fetch_page`/`new_page` (which return
/// the page pinned) and `unpin_page`. A page with a nonzero pin count is
/// never evicted; unpinned pages become replacement candidates in LRU order.
pub struct BufferPoolManager {
    pool_size: usize,
    frames: Vec<PagePtr>,
    state: Mutex<PoolState>,
    disk_manager: Arc<DiskManager>,
}

impl BufferPoolManager {
    pub fn new(pool_size: usize, db_path: impl AsRef<Path>) -> Result<Self, BufferPoolError> {
        let disk_manager = Arc::new(DiskManager::new(db_path)?);
        Ok(Self::with_disk_manager(pool_size, disk_manager))
    }

    pub fn with_disk_manager(pool_size: usize, disk_manager: Arc<DiskManager>) -> Self {
        let mut frames = Vec::with_capacity(pool_size);
        let mut metas = Vec::with_capacity(pool_size);
        let mut free_list = VecDeque::with_capacity(pool_size);

        // Initially, every frame is in the free list.
        for frame_id in 0..pool_size {
            frames.push(Arc::new(parking_lot::RwLock::new(Page::new(INVALID_PAGE_ID))));
            metas.push(FrameMeta::new());
            free_list.push_back(frame_id);
        }

        Self {
            pool_size,
            frames,
            state: Mutex::new(PoolState {
                page_table: HashMap::new(),
                free_list,
                replacer: LruReplacer::new(pool_size),
                metas,
            }),
            disk_manager,
        }
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    pub fn disk_manager(&self) -> &Arc<DiskManager> {
        &self.disk_manager
    }

    /// Fetch a page, pinning it. Returns `PoolExhausted` when the page is not
    /// resident and every frame is pinned.
    pub fn fetch_page(&self, page_id: PageId) -> Result<PagePtr, BufferPoolError> {
        if page_id == INVALID_PAGE_ID {
            return Err(BufferPoolError::InvalidPageId(page_id));
        }

        let mut state = self.state.lock();

        // Already resident: pin and hand out.
        if let Some(&frame_id) = state.page_table.get(&page_id) {
            state.replacer.pin(frame_id);
            state.metas[frame_id].pin_count += 1;
            return Ok(self.frames[frame_id].clone());
        }

        // Not resident: free list first, then the replacer.
        let frame_id = self.find_victim(&mut state)?;
        self.evict_frame(&mut state, frame_id)?;

        {
            let mut page = self.frames[frame_id].write();
            self.disk_manager.read_page(page_id, &mut page)?;
        }

        let meta = &mut state.metas[frame_id];
        meta.page_id = page_id;
        meta.pin_count = 1;
        meta.is_dirty = false;
        state.page_table.insert(page_id, frame_id);

        Ok(self.frames[frame_id].clone())
    }

    /// Allocate a brand new page, returned pinned and zeroed. The caller is
    /// responsible for writing it (and unpinning dirty).
    pub fn new_page(&self) -> Result<(PagePtr, PageId), BufferPoolError> {
        let mut state = self.state.lock();

        // Victim selection happens before the id allocation so that an
        // exhausted pool does not burn page ids.
        let frame_id = self.find_victim(&mut state)?;
        self.evict_frame(&mut state, frame_id)?;

        let page_id = self.disk_manager.allocate_page();

        {
            let mut page = self.frames[frame_id].write();
            page.reset();
            page.page_id = page_id;
        }

        let meta = &mut state.metas[frame_id];
        meta.page_id = page_id;
        meta.pin_count = 1;
        meta.is_dirty = false;
        state.page_table.insert(page_id, frame_id);

        Ok((self.frames[frame_id].clone(), page_id))
    }

    /// Drop one pin. The dirty flag only ever latches on here; it is cleared
    /// by flushing or eviction. Returns false if the page is not resident or
    /// not pinned.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool {
        let mut state = self.state.lock();

        let frame_id = match state.page_table.get(&page_id) {
            Some(&frame_id) => frame_id,
            None => {
                debug!("unpin of non-resident page {}", page_id);
                return false;
            }
        };

        let meta = &mut state.metas[frame_id];
        if meta.pin_count == 0 {
            debug!("unpin of unpinned page {}", page_id);
            return false;
        }

        meta.pin_count -= 1;
        if is_dirty {
            meta.is_dirty = true;
        }
        if meta.pin_count == 0 {
            state.replacer.unpin(frame_id);
        }

        true
    }

    /// Write a resident page to disk regardless of its pin count and clear
    /// the dirty flag. Returns Ok(false) when the page is not resident.
    pub fn flush_page(&self, page_id: PageId) -> Result<bool, BufferPoolError> {
        let mut state = self.state.lock();

        let frame_id = match state.page_table.get(&page_id) {
            Some(&frame_id) => frame_id,
            None => return Ok(false),
        };

        {
            let page = self.frames[frame_id].read();
            self.disk_manager.write_page(&page)?;
        }
        state.metas[frame_id].is_dirty = false;

        Ok(true)
    }

    /// Write every resident page to disk.
    pub fn flush_all_pages(&self) -> Result<(), BufferPoolError> {
        let mut state = self.state.lock();

        let frame_ids: Vec<FrameId> = state.page_table.values().copied().collect();
        for frame_id in frame_ids {
            {
                let page = self.frames[frame_id].read();
                self.disk_manager.write_page(&page)?;
            }
            state.metas[frame_id].is_dirty = false;
        }

        Ok(())
    }

    /// Remove a page from the pool and return its id to the disk allocator.
    /// Ok(false) when the page is pinned; deleting a non-resident page only
    /// deallocates the id.
    pub fn delete_page(&self, page_id: PageId) -> Result<bool, BufferPoolError> {
        if page_id == INVALID_PAGE_ID {
            return Err(BufferPoolError::InvalidPageId(page_id));
        }

        let mut state = self.state.lock();

        let frame_id = match state.page_table.get(&page_id) {
            Some(&frame_id) => frame_id,
            None => {
                self.disk_manager.deallocate_page(page_id);
                return Ok(true);
            }
        };

        if state.metas[frame_id].pin_count > 0 {
            debug!(
                "delete of pinned page {} (pin_count {})",
                page_id, state.metas[frame_id].pin_count
            );
            return Ok(false);
        }

        state.replacer.pin(frame_id);
        state.page_table.remove(&page_id);

        let meta = &mut state.metas[frame_id];
        meta.page_id = INVALID_PAGE_ID;
        meta.is_dirty = false;

        self.frames[frame_id].write().reset();
        state.free_list.push_back(frame_id);
        self.disk_manager.deallocate_page(page_id);

        Ok(true)
    }

    /// Pick a reusable frame: free list front, else LRU victim.
    fn find_victim(&self, state: &mut PoolState) -> Result<FrameId, BufferPoolError> {
        if let Some(frame_id) = state.free_list.pop_front() {
            return Ok(frame_id);
        }
        state.replacer.victim().ok_or(BufferPoolError::PoolExhausted)
    }

    /// Write back the frame's current page if dirty and drop it from the
    /// page table, leaving the frame blank.
    fn evict_frame(&self, state: &mut PoolState, frame_id: FrameId) -> Result<(), BufferPoolError> {
        let old_page_id = state.metas[frame_id].page_id;
        if old_page_id == INVALID_PAGE_ID {
            return Ok(());
        }

        if state.metas[frame_id].is_dirty {
            trace!("evicting dirty page {}", old_page_id);
            let page = self.frames[frame_id].read();
            self.disk_manager.write_page(&page)?;
        }

        state.page_table.remove(&old_page_id);
        let meta = &mut state.metas[frame_id];
        meta.page_id = INVALID_PAGE_ID;
        meta.is_dirty = false;

        Ok(())
    }
}
