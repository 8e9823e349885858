//! WAL log record format.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tinydb_common::{Result, TinyDbError};

/// Transaction id used by internal mutations that run outside any
/// transaction.
pub const INVALID_TXN_ID: u32 = 0;

/// Log Sequence Number.
///
/// A monotonically increasing identifier of a log record. The page
/// header stores the LSN of the last record describing a modification
/// to that page.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Lsn(pub u32);

impl Lsn {
    /// Invalid/uninitialized LSN.
    pub const INVALID: Lsn = Lsn(0);

    /// First LSN handed out by the log manager.
    pub const FIRST: Lsn = Lsn(1);

    /// Returns true if this is a valid LSN.
    pub fn is_valid(&self) -> bool {
        self.0 > 0
    }
}

impl std::fmt::Display for Lsn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "lsn:{}", self.0)
    }
}

/// Types of log records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum LogRecordType {
    /// Invalid/padding record.
    Invalid = 0,
    /// Transaction begin.
    Begin = 1,
    /// Transaction commit.
    Commit = 2,
    /// Transaction abort.
    Abort = 3,
    /// Index entry insertion.
    IndexInsert = 10,
    /// Index entry deletion.
    IndexDelete = 11,
}

impl TryFrom<u8> for LogRecordType {
    type Error = TinyDbError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(LogRecordType::Invalid),
            1 => Ok(LogRecordType::Begin),
            2 => Ok(LogRecordType::Commit),
            3 => Ok(LogRecordType::Abort),
            10 => Ok(LogRecordType::IndexInsert),
            11 => Ok(LogRecordType::IndexDelete),
            _ => Err(TinyDbError::Conversion(format!(
                "invalid log record type: {}",
                value
            ))),
        }
    }
}

/// A single log record in the WAL.
///
/// Record format on disk:
/// - total_len: 4 bytes (header + payload)
/// - lsn: 4 bytes
/// - prev_lsn: 4 bytes (transaction chaining)
/// - txn_id: 4 bytes
/// - record_type: 1 byte
/// - payload: variable length
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    /// LSN of this record (assigned by the log manager on append).
    pub lsn: Lsn,
    /// LSN of the previous record of the same transaction.
    pub prev_lsn: Lsn,
    /// Owning transaction.
    pub txn_id: u32,
    /// Kind of record.
    pub record_type: LogRecordType,
    /// Type-specific payload.
    pub payload: Bytes,
}

impl LogRecord {
    /// Fixed header size on disk (total_len + lsn + prev_lsn + txn_id + type).
    pub const HEADER_SIZE: usize = 17;

    /// Creates a record; the LSN is assigned on append.
    pub fn new(record_type: LogRecordType, txn_id: u32, payload: Bytes) -> Self {
        Self {
            lsn: Lsn::INVALID,
            prev_lsn: Lsn::INVALID,
            txn_id,
            record_type,
            payload,
        }
    }

    /// Size of this record on disk.
    pub fn size_on_disk(&self) -> usize {
        Self::HEADER_SIZE + self.payload.len()
    }

    /// Serializes the record into `buf`.
    pub fn serialize_to(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.size_on_disk() as u32);
        buf.put_u32_le(self.lsn.0);
        buf.put_u32_le(self.prev_lsn.0);
        buf.put_u32_le(self.txn_id);
        buf.put_u8(self.record_type as u8);
        buf.put_slice(&self.payload);
    }

    /// Deserializes one record from the front of `buf`, advancing it.
    pub fn deserialize_from(buf: &mut Bytes) -> Result<LogRecord> {
        if buf.len() < Self::HEADER_SIZE {
            return Err(TinyDbError::Conversion(format!(
                "log record header truncated: {} bytes",
                buf.len()
            )));
        }
        let total_len = buf.get_u32_le() as usize;
        if total_len < Self::HEADER_SIZE || buf.len() + 4 < total_len {
            return Err(TinyDbError::Conversion(format!(
                "log record length {} is corrupt",
                total_len
            )));
        }
        let lsn = Lsn(buf.get_u32_le());
        let prev_lsn = Lsn(buf.get_u32_le());
        let txn_id = buf.get_u32_le();
        let record_type = LogRecordType::try_from(buf.get_u8())?;
        let payload = buf.split_to(total_len - Self::HEADER_SIZE);
        Ok(LogRecord {
            lsn,
            prev_lsn,
            txn_id,
            record_type,
            payload,
        })
    }
}
