//! Log manager: LSN assignment, append buffering, and the flush contract.

use crate::record::{LogRecord, Lsn};
use bytes::BytesMut;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use tinydb_common::Result;

/// Configuration for the log manager.
#[derive(Debug, Clone)]
pub struct LogManagerConfig {
    /// Path of the log file.
    pub log_path: PathBuf,
    /// Enable fsync on flush.
    pub fsync_enabled: bool,
}

impl Default for LogManagerConfig {
    fn default() -> Self {
        Self {
            log_path: PathBuf::from("./data/tinydb.wal"),
            fsync_enabled: true,
        }
    }
}

/// Thread-safe log manager.
///
/// Appends buffer in memory; `flush(up_to, force)` blocks until every
/// record with `lsn <= up_to` is durable. Recovery replay is handled by
/// a separate subsystem and is not part of this crate.
pub struct LogManager {
    config: LogManagerConfig,
    inner: Mutex<LogInner>,
    /// Next LSN to assign.
    next_lsn: AtomicU32,
    /// Highest LSN known to be durable.
    flushed_lsn: AtomicU32,
}

struct LogInner {
    file: File,
    /// Serialized records not yet written to the file.
    buffer: BytesMut,
    /// Highest LSN sitting in the buffer.
    last_lsn: Lsn,
}

impl LogManager {
    /// Opens (or creates) the log file and positions the LSN counter.
    pub fn new(config: LogManagerConfig) -> Result<Self> {
        if let Some(parent) = config.log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&config.log_path)?;

        Ok(Self {
            config,
            inner: Mutex::new(LogInner {
                file,
                buffer: BytesMut::new(),
                last_lsn: Lsn::INVALID,
            }),
            next_lsn: AtomicU32::new(Lsn::FIRST.0),
            flushed_lsn: AtomicU32::new(Lsn::INVALID.0),
        })
    }

    /// Returns the next LSN that will be assigned.
    pub fn next_lsn(&self) -> Lsn {
        Lsn(self.next_lsn.load(Ordering::SeqCst))
    }

    /// Returns the highest durable LSN.
    pub fn flushed_lsn(&self) -> Lsn {
        Lsn(self.flushed_lsn.load(Ordering::SeqCst))
    }

    /// Appends a record, assigning its LSN. The record is buffered; call
    /// `flush` to make it durable.
    pub fn append(&self, record: &mut LogRecord) -> Result<Lsn> {
        let mut inner = self.inner.lock();
        // Assign under the buffer lock so LSN order matches buffer order.
        let lsn = Lsn(self.next_lsn.fetch_add(1, Ordering::SeqCst));
        record.lsn = lsn;
        record.serialize_to(&mut inner.buffer);
        inner.last_lsn = lsn;
        Ok(lsn)
    }

    /// Makes every record with `lsn <= up_to` durable.
    ///
    /// With `force` the buffer is written and synced even if `up_to` is
    /// already durable. Callers pass the page-header LSN here before a
    /// dirty page is written to disk.
    pub fn flush(&self, up_to: Lsn, force: bool) -> Result<()> {
        if !force && self.flushed_lsn() >= up_to {
            return Ok(());
        }

        let mut inner = self.inner.lock();
        if inner.buffer.is_empty() {
            return Ok(());
        }

        let batch = inner.buffer.split();
        inner.file.write_all(&batch)?;
        if self.config.fsync_enabled {
            inner.file.sync_all()?;
        }
        let durable = inner.last_lsn;
        self.flushed_lsn.store(durable.0, Ordering::SeqCst);
        log::debug!("wal flushed through {}", durable);
        Ok(())
    }
}
