//! Write-Ahead Log (WAL) for TinyDB.
//!
//! Provides the ordering guarantee the buffer pool relies on: before a
//! dirty page reaches disk, every log record up to the page's LSN is
//! durable.

pub mod manager;
pub mod record;

pub use manager::{LogManager, LogManagerConfig};
pub use record::{LogRecord, LogRecordType, Lsn, INVALID_TXN_ID};
