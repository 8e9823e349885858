//! Index execution context: the latch crab's working state.

use parking_lot::{RwLockReadGuard, RwLockWriteGuard};
use tinydb_buffer::{PageReadLatch, PageWriteLatch, PinnedPage};
use tinydb_common::{PageId, Result, TinyDbError};

/// A held page latch of either mode.
pub(crate) enum PageLatch {
    Read(PageReadLatch),
    Write(PageWriteLatch),
}

/// A page on the crab path: its latch plus the pin that keeps it
/// resident. Field order matters: the latch drops before the pin.
pub(crate) struct LatchedPage<'a> {
    latch: PageLatch,
    pin: PinnedPage<'a>,
}

impl<'a> LatchedPage<'a> {
    pub fn read(latch: PageReadLatch, pin: PinnedPage<'a>) -> Self {
        Self {
            latch: PageLatch::Read(latch),
            pin,
        }
    }

    pub fn write(latch: PageWriteLatch, pin: PinnedPage<'a>) -> Self {
        Self {
            latch: PageLatch::Write(latch),
            pin,
        }
    }

    pub fn page_id(&self) -> PageId {
        self.pin.page_id()
    }

    pub fn mark_dirty(&self) {
        self.pin.mark_dirty();
    }

    pub fn data(&self) -> &[u8] {
        match &self.latch {
            PageLatch::Read(guard) => guard.as_slice(),
            PageLatch::Write(guard) => guard.as_slice(),
        }
    }

    pub fn data_mut(&mut self) -> Result<&mut [u8]> {
        match &mut self.latch {
            PageLatch::Write(guard) => Ok(guard.as_mut_slice()),
            PageLatch::Read(_) => Err(TinyDbError::LogicError(
                "write access under a read latch".to_string(),
            )),
        }
    }
}

/// The root-pointer latch, taken before the root page latch.
pub(crate) enum RootLatch<'a> {
    Read(#[allow(dead_code)] RwLockReadGuard<'a, PageId>),
    Write(RwLockWriteGuard<'a, PageId>),
}

/// Working state of one index operation: the latched-page set (in
/// descent order) plus the ids of pages the operation deallocated.
/// Deleted ids are handed to the buffer pool only after every latch and
/// pin here has been released.
pub(crate) struct IndexContext<'a> {
    pub root: Option<RootLatch<'a>>,
    pub pages: Vec<LatchedPage<'a>>,
    pub deleted: Vec<PageId>,
}

impl<'a> IndexContext<'a> {
    pub fn new() -> Self {
        Self {
            root: None,
            pages: Vec::new(),
            deleted: Vec::new(),
        }
    }

    /// Releases the root-pointer latch and every latched page except the
    /// most recent one. Called once the current child is known safe.
    pub fn release_ancestors(&mut self) {
        self.root = None;
        if self.pages.len() > 1 {
            self.pages.drain(..self.pages.len() - 1);
        }
    }

    pub fn top(&self) -> Result<&LatchedPage<'a>> {
        self.pages
            .last()
            .ok_or_else(|| TinyDbError::LogicError("empty latch set".to_string()))
    }

    pub fn top_mut(&mut self) -> Result<&mut LatchedPage<'a>> {
        self.pages
            .last_mut()
            .ok_or_else(|| TinyDbError::LogicError("empty latch set".to_string()))
    }

    /// Swings the root pointer; requires the write root latch.
    pub fn set_root(&mut self, page_id: PageId) -> Result<()> {
        match &mut self.root {
            Some(RootLatch::Write(guard)) => {
                **guard = page_id;
                Ok(())
            }
            _ => Err(TinyDbError::LogicError(
                "root update without the write root latch".to_string(),
            )),
        }
    }

    pub fn take_deleted(&mut self) -> Vec<PageId> {
        std::mem::take(&mut self.deleted)
    }
}
