//! Buffer frames: in-memory pages with pin, dirty, and latch state.

use parking_lot::{ArcRwLockReadGuard, ArcRwLockWriteGuard, RawRwLock, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tinydb_common::{PageId, INVALID_PAGE_ID, PAGE_SIZE};

/// The data buffer of a page.
pub type PageData = Box<[u8; PAGE_SIZE]>;

/// Owned read guard on a page's data: the page read latch.
pub type PageReadLatch = ArcRwLockReadGuard<RawRwLock, PageData>;

/// Owned write guard on a page's data: the page write latch.
pub type PageWriteLatch = ArcRwLockWriteGuard<RawRwLock, PageData>;

/// Unique identifier for a frame in the buffer pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameId(pub u32);

impl std::fmt::Display for FrameId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "frame:{}", self.0)
    }
}

/// A page resident in a buffer pool frame.
///
/// Carries the frame metadata (pin count, dirty bit) plus the page
/// latch. The pool mutex governs the metadata transitions; the latch
/// governs the data bytes and is acquired explicitly by index code
/// after a fetch, never by the pool itself.
pub struct Page {
    frame_id: FrameId,
    /// Resident page id; INVALID_PAGE_ID while the frame is free.
    page_id: AtomicU32,
    /// Number of users currently holding this page.
    pin_count: AtomicU32,
    /// Whether the page differs from its on-disk image.
    is_dirty: AtomicBool,
    /// Page data behind the page latch. Arc'd so latch guards can be
    /// held across call frames by an index execution context.
    data: Arc<RwLock<PageData>>,
}

impl Page {
    /// Creates an empty frame.
    pub fn new(frame_id: FrameId) -> Self {
        Self {
            frame_id,
            page_id: AtomicU32::new(INVALID_PAGE_ID.0),
            pin_count: AtomicU32::new(0),
            is_dirty: AtomicBool::new(false),
            data: Arc::new(RwLock::new(Box::new([0u8; PAGE_SIZE]))),
        }
    }

    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    /// Returns the resident page id (INVALID_PAGE_ID if the frame is free).
    pub fn page_id(&self) -> PageId {
        PageId(self.page_id.load(Ordering::Acquire))
    }

    pub fn set_page_id(&self, page_id: PageId) {
        self.page_id.store(page_id.0, Ordering::Release);
    }

    pub fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::Acquire)
    }

    /// Increments the pin count; returns the previous value.
    pub fn pin(&self) -> u32 {
        self.pin_count.fetch_add(1, Ordering::AcqRel)
    }

    /// Decrements the pin count; returns the new value. A frame at zero
    /// stays at zero.
    pub fn unpin(&self) -> u32 {
        let prev = self.pin_count.fetch_sub(1, Ordering::AcqRel);
        if prev == 0 {
            self.pin_count.store(0, Ordering::Release);
            return 0;
        }
        prev - 1
    }

    pub fn is_pinned(&self) -> bool {
        self.pin_count() > 0
    }

    pub fn is_dirty(&self) -> bool {
        self.is_dirty.load(Ordering::Acquire)
    }

    pub fn set_dirty(&self, dirty: bool) {
        self.is_dirty.store(dirty, Ordering::Release);
    }

    /// Borrowed read access to the data (pool-internal flushing).
    pub fn read_data(&self) -> parking_lot::RwLockReadGuard<'_, PageData> {
        self.data.read()
    }

    /// Borrowed write access to the data (pool-internal population).
    pub fn write_data(&self) -> parking_lot::RwLockWriteGuard<'_, PageData> {
        self.data.write()
    }

    /// Acquires the page read latch as an owned guard.
    pub fn latch_read(&self) -> PageReadLatch {
        RwLock::read_arc(&self.data)
    }

    /// Acquires the page write latch as an owned guard.
    pub fn latch_write(&self) -> PageWriteLatch {
        RwLock::write_arc(&self.data)
    }

    /// Resets the frame to the free state, zeroing its data.
    pub fn reset(&self) {
        self.page_id.store(INVALID_PAGE_ID.0, Ordering::Release);
        self.pin_count.store(0, Ordering::Release);
        self.is_dirty.store(false, Ordering::Release);
        self.data.write().fill(0);
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("frame_id", &self.frame_id)
            .field("page_id", &self.page_id())
            .field("pin_count", &self.pin_count())
            .field("is_dirty", &self.is_dirty())
            .finish()
    }
}
