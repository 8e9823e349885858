//! Disk manager for page-level file I/O.

use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tinydb_common::{PageId, Result, TinyDbError, PAGE_SIZE};

/// Configuration for the disk manager.
#[derive(Debug, Clone)]
pub struct DiskManagerConfig {
    /// Path of the database file.
    pub db_path: PathBuf,
    /// Enable fsync after writes.
    pub fsync_enabled: bool,
}

impl Default for DiskManagerConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/tinydb.db"),
            fsync_enabled: true,
        }
    }
}

/// Manages reading and writing pages of a single database file.
///
/// Pages are indexed from 0 and addressed at `page_id * PAGE_SIZE`.
/// The allocator hands out monotonically increasing ids and reuses
/// deallocated ones; its state survives restarts through a sidecar file
/// whose format is private to this type.
pub struct DiskManager {
    config: DiskManagerConfig,
    inner: Mutex<DiskInner>,
}

struct DiskInner {
    file: File,
    /// High-water mark: the next never-allocated page id.
    next_page: u32,
    /// Deallocated ids available for reuse.
    free_pages: Vec<PageId>,
}

impl DiskManager {
    /// Opens (or creates) the database file and restores allocator state.
    pub fn new(config: DiskManagerConfig) -> Result<Self> {
        if let Some(parent) = config.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&config.db_path)?;

        let (next_page, free_pages) = match Self::load_alloc_state(&config.db_path) {
            Some(state) => state,
            None => {
                let file_size = file.metadata()?.len();
                ((file_size / PAGE_SIZE as u64) as u32, Vec::new())
            }
        };

        Ok(Self {
            config,
            inner: Mutex::new(DiskInner {
                file,
                next_page,
                free_pages,
            }),
        })
    }

    /// Returns the database file path.
    pub fn db_path(&self) -> &Path {
        &self.config.db_path
    }

    /// Allocates a page id, preferring previously deallocated ids.
    pub fn allocate_page(&self) -> Result<PageId> {
        let mut inner = self.inner.lock();
        if let Some(page_id) = inner.free_pages.pop() {
            return Ok(page_id);
        }
        let page_id = PageId(inner.next_page);
        inner.next_page += 1;
        Ok(page_id)
    }

    /// Returns a page id to the allocator for reuse.
    pub fn deallocate_page(&self, page_id: PageId) {
        if !page_id.is_valid() {
            return;
        }
        self.inner.lock().free_pages.push(page_id);
    }

    /// Reads a page into `buf`.
    ///
    /// A page that has never been written reads back as zeros, unless
    /// `outbound_is_error` is set, in which case the read fails.
    pub fn read_page(&self, page_id: PageId, buf: &mut [u8], outbound_is_error: bool) -> Result<()> {
        if buf.len() < PAGE_SIZE {
            return Err(TinyDbError::LogicError(format!(
                "read buffer holds {} bytes, page is {}",
                buf.len(),
                PAGE_SIZE
            )));
        }
        let mut inner = self.inner.lock();
        let offset = page_id.0 as u64 * PAGE_SIZE as u64;
        let file_size = inner.file.metadata()?.len();

        if offset >= file_size {
            if outbound_is_error {
                return Err(TinyDbError::IoMsg(format!(
                    "read of unwritten {}",
                    page_id
                )));
            }
            buf[..PAGE_SIZE].fill(0);
            return Ok(());
        }

        let available = ((file_size - offset) as usize).min(PAGE_SIZE);
        inner.file.seek(SeekFrom::Start(offset))?;
        inner.file.read_exact(&mut buf[..available])?;
        buf[available..PAGE_SIZE].fill(0);
        Ok(())
    }

    /// Writes a page, extending the file if needed.
    pub fn write_page(&self, page_id: PageId, data: &[u8]) -> Result<()> {
        if data.len() < PAGE_SIZE {
            return Err(TinyDbError::LogicError(format!(
                "write buffer holds {} bytes, page is {}",
                data.len(),
                PAGE_SIZE
            )));
        }
        let mut inner = self.inner.lock();
        let offset = page_id.0 as u64 * PAGE_SIZE as u64;
        inner.file.seek(SeekFrom::Start(offset))?;
        inner.file.write_all(&data[..PAGE_SIZE])?;
        if self.config.fsync_enabled {
            inner.file.sync_all()?;
        }
        if page_id.0 >= inner.next_page {
            inner.next_page = page_id.0 + 1;
        }
        Ok(())
    }

    /// Returns the number of page ids handed out so far (including freed).
    pub fn num_pages(&self) -> u32 {
        self.inner.lock().next_page
    }

    /// Syncs the file and persists allocator state.
    pub fn flush(&self) -> Result<()> {
        let inner = self.inner.lock();
        inner.file.sync_all()?;
        self.persist_alloc_state(&inner)
    }

    fn alloc_path(db_path: &Path) -> PathBuf {
        let mut os = db_path.as_os_str().to_owned();
        os.push(".alloc");
        PathBuf::from(os)
    }

    fn load_alloc_state(db_path: &Path) -> Option<(u32, Vec<PageId>)> {
        let raw = std::fs::read(Self::alloc_path(db_path)).ok()?;
        if raw.len() < 8 {
            return None;
        }
        let next_page = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        let count = u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]) as usize;
        if raw.len() < 8 + count * 4 {
            return None;
        }
        let mut free_pages = Vec::with_capacity(count);
        for i in 0..count {
            let at = 8 + i * 4;
            free_pages.push(PageId(u32::from_le_bytes([
                raw[at],
                raw[at + 1],
                raw[at + 2],
                raw[at + 3],
            ])));
        }
        Some((next_page, free_pages))
    }

    fn persist_alloc_state(&self, inner: &DiskInner) -> Result<()> {
        let mut raw = Vec::with_capacity(8 + inner.free_pages.len() * 4);
        raw.extend_from_slice(&inner.next_page.to_le_bytes());
        raw.extend_from_slice(&(inner.free_pages.len() as u32).to_le_bytes());
        for page_id in &inner.free_pages {
            raw.extend_from_slice(&page_id.0.to_le_bytes());
        }
        std::fs::write(Self::alloc_path(&self.config.db_path), raw)?;
        Ok(())
    }
}

impl Drop for DiskManager {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            log::error!("disk manager close failed: {}", e);
        }
    }
}
