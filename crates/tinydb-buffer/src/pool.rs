//! Buffer pool manager.

use crate::disk::DiskManager;
use crate::page::{FrameId, Page, PageReadLatch, PageWriteLatch};
use crate::replacer::{LruReplacer, Replacer};
use parking_lot::Mutex;
use std::cell::Cell;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use sysinfo::System;
use tinydb_common::{PageHeader, PageId, Result, TinyDbError, PAGE_SIZE};
use tinydb_wal::{LogManager, Lsn};

/// Configuration for the buffer pool.
#[derive(Debug, Clone)]
pub struct BufferPoolConfig {
    /// Number of frames in the pool.
    pub pool_size: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self { pool_size: 1024 }
    }
}

/// Buffer pool manager.
///
/// Caches pages of the database file in a fixed set of frames. A single
/// mutex serializes the state transitions over the page table, free
/// list, and replacer; per-page latches are left to callers. Before a
/// dirty page is written back, the log manager is told to flush through
/// the page's header LSN (write-ahead logging).
pub struct BufferPoolManager {
    pool_size: usize,
    frames: Vec<Arc<Page>>,
    state: Mutex<PoolState>,
    disk: Arc<DiskManager>,
    log: Option<Arc<LogManager>>,
    /// Cumulative time spent waiting on WAL flushes.
    flush_wait: Mutex<Duration>,
}

struct PoolState {
    page_table: HashMap<PageId, FrameId>,
    free_list: Vec<FrameId>,
    replacer: LruReplacer,
}

impl BufferPoolManager {
    /// Creates a buffer pool over the given disk and log managers.
    ///
    /// A `None` log manager disables the write-ahead flush (recovery
    /// disabled).
    pub fn new(
        config: BufferPoolConfig,
        disk: Arc<DiskManager>,
        log: Option<Arc<LogManager>>,
    ) -> Self {
        let pool_size = config.pool_size;
        let frames: Vec<_> = (0..pool_size)
            .map(|i| Arc::new(Page::new(FrameId(i as u32))))
            .collect();
        // Initially every frame is in the free list; popping from the
        // back hands out low frame ids first.
        let free_list: Vec<_> = (0..pool_size).rev().map(|i| FrameId(i as u32)).collect();

        Self {
            pool_size,
            frames,
            state: Mutex::new(PoolState {
                page_table: HashMap::with_capacity(pool_size),
                free_list,
                replacer: LruReplacer::new(pool_size),
            }),
            disk,
            log,
            flush_wait: Mutex::new(Duration::ZERO),
        }
    }

    /// Creates a buffer pool sized to 25% of available system RAM, with
    /// a floor of 1,000 frames.
    pub fn auto_sized(disk: Arc<DiskManager>, log: Option<Arc<LogManager>>) -> Self {
        let mut sys = System::new_all();
        sys.refresh_memory();

        let target_bytes = sys.available_memory() as usize / 4;
        let pool_size = (target_bytes / PAGE_SIZE).max(1_000);
        Self::new(BufferPoolConfig { pool_size }, disk, log)
    }

    /// Returns the number of frames in the pool.
    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Returns the number of free frames.
    pub fn free_count(&self) -> usize {
        self.state.lock().free_list.len()
    }

    /// Returns the number of resident pages.
    pub fn page_count(&self) -> usize {
        self.state.lock().page_table.len()
    }

    /// Checks whether a page is resident.
    pub fn contains(&self, page_id: PageId) -> bool {
        self.state.lock().page_table.contains_key(&page_id)
    }

    /// Fetches a page, pinning it.
    ///
    /// Returns `None` when no frame can be obtained (free list empty and
    /// nothing evictable). Reading a never-written page zero-fills the
    /// frame unless `outbound_is_error` is set. Disk faults propagate as
    /// errors.
    pub fn fetch_page(
        &self,
        page_id: PageId,
        outbound_is_error: bool,
    ) -> Result<Option<PinnedPage<'_>>> {
        if !page_id.is_valid() {
            return Err(TinyDbError::LogicError(
                "fetch of the invalid page id".to_string(),
            ));
        }
        let mut state = self.state.lock();

        if let Some(&frame_id) = state.page_table.get(&page_id) {
            let frame = &self.frames[frame_id.0 as usize];
            state.replacer.pin(frame_id);
            frame.pin();
            return Ok(Some(PinnedPage::new(self, Arc::clone(frame), page_id)));
        }

        let Some(frame_id) = self.obtain_frame(&mut state)? else {
            return Ok(None);
        };
        let frame = &self.frames[frame_id.0 as usize];
        {
            let mut data = frame.write_data();
            if let Err(e) = self.disk.read_page(page_id, &mut data[..], outbound_is_error) {
                drop(data);
                frame.reset();
                state.free_list.push(frame_id);
                return Err(e);
            }
        }
        frame.set_page_id(page_id);
        frame.set_dirty(false);
        frame.pin();
        state.page_table.insert(page_id, frame_id);

        Ok(Some(PinnedPage::new(self, Arc::clone(frame), page_id)))
    }

    /// Allocates a fresh page on disk and pins a zeroed frame for it.
    ///
    /// Returns `None` only when no frame is obtainable.
    pub fn new_page(&self) -> Result<Option<PinnedPage<'_>>> {
        let mut state = self.state.lock();

        if state.free_list.is_empty() && state.replacer.is_empty() {
            return Ok(None);
        }

        let page_id = self.disk.allocate_page()?;
        let Some(frame_id) = self.obtain_frame(&mut state)? else {
            self.disk.deallocate_page(page_id);
            return Ok(None);
        };

        let frame = &self.frames[frame_id.0 as usize];
        // obtain_frame handed us a reset (zeroed) frame.
        frame.set_page_id(page_id);
        frame.set_dirty(false);
        frame.pin();
        state.page_table.insert(page_id, frame_id);

        Ok(Some(PinnedPage::new(self, Arc::clone(frame), page_id)))
    }

    /// Unpins a page, OR-ing `is_dirty` into its dirty flag.
    ///
    /// Returns false if the page is not resident or was not pinned.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool {
        let mut state = self.state.lock();
        let Some(&frame_id) = state.page_table.get(&page_id) else {
            return false;
        };
        let frame = &self.frames[frame_id.0 as usize];

        if is_dirty {
            frame.set_dirty(true);
        }
        if frame.pin_count() == 0 {
            return false;
        }
        if frame.unpin() == 0 {
            state.replacer.unpin(frame_id);
        }
        true
    }

    /// Flushes a resident page to disk; returns false if not resident.
    pub fn flush_page(&self, page_id: PageId) -> Result<bool> {
        let state = self.state.lock();
        let Some(&frame_id) = state.page_table.get(&page_id) else {
            return Ok(false);
        };
        self.flush_frame(&self.frames[frame_id.0 as usize])?;
        Ok(true)
    }

    /// Flushes every resident page.
    pub fn flush_all_pages(&self) -> Result<()> {
        let state = self.state.lock();
        for &frame_id in state.page_table.values() {
            self.flush_frame(&self.frames[frame_id.0 as usize])?;
        }
        Ok(())
    }

    /// Deallocates a page.
    ///
    /// The disk manager is informed unconditionally. Returns true if the
    /// page was not resident or was removed from the pool; false if it
    /// is still pinned (in which case nothing else changes).
    pub fn delete_page(&self, page_id: PageId) -> bool {
        let mut state = self.state.lock();
        self.disk.deallocate_page(page_id);

        let Some(&frame_id) = state.page_table.get(&page_id) else {
            return true;
        };
        let frame = &self.frames[frame_id.0 as usize];
        if frame.pin_count() > 0 {
            return false;
        }

        frame.reset();
        state.page_table.remove(&page_id);
        state.free_list.push(frame_id);
        state.replacer.pin(frame_id);
        true
    }

    /// Verifies that no resident page holds a pin. Diagnostic for
    /// quiescent points; offenders are logged.
    pub fn check_pin_count(&self) -> bool {
        let state = self.state.lock();
        let mut clean = true;
        for (&page_id, &frame_id) in state.page_table.iter() {
            let pins = self.frames[frame_id.0 as usize].pin_count();
            if pins != 0 {
                log::error!("{} still has pin count {}", page_id, pins);
                clean = false;
            }
        }
        clean
    }

    /// Cumulative time spent waiting on WAL flushes in the flush helper.
    pub fn flush_wait_time(&self) -> Duration {
        *self.flush_wait.lock()
    }

    /// Returns statistics about the buffer pool.
    pub fn stats(&self) -> BufferPoolStats {
        let state = self.state.lock();
        let mut pinned_frames = 0;
        let mut dirty_frames = 0;
        for &frame_id in state.page_table.values() {
            let frame = &self.frames[frame_id.0 as usize];
            if frame.is_pinned() {
                pinned_frames += 1;
            }
            if frame.is_dirty() {
                dirty_frames += 1;
            }
        }
        BufferPoolStats {
            pool_size: self.pool_size,
            free_frames: state.free_list.len(),
            used_frames: state.page_table.len(),
            pinned_frames,
            dirty_frames,
        }
    }

    /// Obtains a frame for a new resident page: free list first, then
    /// eviction. The returned frame is reset. Returns `None` when the
    /// pool is exhausted.
    fn obtain_frame(&self, state: &mut PoolState) -> Result<Option<FrameId>> {
        if let Some(frame_id) = state.free_list.pop() {
            return Ok(Some(frame_id));
        }

        let Some(victim) = state.replacer.evict() else {
            return Ok(None);
        };
        let frame = &self.frames[victim.0 as usize];
        if frame.is_dirty() {
            if let Err(e) = self.flush_frame(frame) {
                // Failed mid-eviction: leave the victim eligible again.
                state.replacer.unpin(victim);
                return Err(e);
            }
        }
        let old_page_id = frame.page_id();
        if old_page_id.is_valid() {
            state.page_table.remove(&old_page_id);
        }
        frame.reset();
        Ok(Some(victim))
    }

    /// Write-ahead-log discipline: flush the log through the page's
    /// header LSN, then write the page and clear its dirty bit.
    fn flush_frame(&self, frame: &Page) -> Result<()> {
        let page_id = frame.page_id();
        if !page_id.is_valid() {
            return Err(TinyDbError::LogicError(
                "flush of an empty frame".to_string(),
            ));
        }
        let data = frame.read_data();
        if let Some(log) = &self.log {
            let lsn = Lsn(PageHeader::lsn_of(&data[..]));
            let start = Instant::now();
            log.flush(lsn, true)?;
            *self.flush_wait.lock() += start.elapsed();
        }
        self.disk.write_page(page_id, &data[..])?;
        drop(data);
        frame.set_dirty(false);
        Ok(())
    }
}

/// Statistics about the buffer pool.
#[derive(Debug, Clone)]
pub struct BufferPoolStats {
    pub pool_size: usize,
    pub free_frames: usize,
    pub used_frames: usize,
    pub pinned_frames: usize,
    pub dirty_frames: usize,
}

/// RAII pin handle: unpins the page on drop, carrying the dirty hint.
///
/// Fetching does not acquire the page latch; callers latch explicitly
/// through this handle when they touch the data.
pub struct PinnedPage<'a> {
    pool: &'a BufferPoolManager,
    page: Arc<Page>,
    page_id: PageId,
    dirty: Cell<bool>,
}

impl<'a> PinnedPage<'a> {
    fn new(pool: &'a BufferPoolManager, page: Arc<Page>, page_id: PageId) -> Self {
        Self {
            pool,
            page,
            page_id,
            dirty: Cell::new(false),
        }
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn page(&self) -> &Arc<Page> {
        &self.page
    }

    /// Records that this pin modified the page; applied at unpin.
    pub fn mark_dirty(&self) {
        self.dirty.set(true);
    }

    /// Acquires the page read latch.
    pub fn latch_read(&self) -> PageReadLatch {
        self.page.latch_read()
    }

    /// Acquires the page write latch.
    pub fn latch_write(&self) -> PageWriteLatch {
        self.page.latch_write()
    }
}

impl Drop for PinnedPage<'_> {
    fn drop(&mut self) {
        self.pool.unpin_page(self.page_id, self.dirty.get());
    }
}

impl std::fmt::Debug for PinnedPage<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinnedPage")
            .field("page_id", &self.page_id)
            .field("dirty", &self.dirty.get())
            .finish()
    }
}
