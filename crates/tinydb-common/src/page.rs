//! Page identifiers and the on-disk page header layout.

use crate::error::{Result, TinyDbError};
use serde::{Deserialize, Serialize};

/// Page size in bytes (4 KB).
pub const PAGE_SIZE: usize = 4096;

/// Reserved sentinel meaning "no page".
pub const INVALID_PAGE_ID: PageId = PageId(u32::MAX);

/// Unique identifier for a page within the database file.
///
/// Pages are indexed from 0; the page's byte offset in the file is
/// `page_id * PAGE_SIZE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PageId(pub u32);

impl PageId {
    /// Returns true if this is not the reserved invalid id.
    pub fn is_valid(&self) -> bool {
        *self != INVALID_PAGE_ID
    }
}

impl std::fmt::Display for PageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_valid() {
            write!(f, "page:{}", self.0)
        } else {
            write!(f, "page:invalid")
        }
    }
}

/// Page types stored in the page header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum PageType {
    /// Unallocated or not yet initialized.
    Invalid = 0,
    /// B+Tree leaf page.
    Leaf = 1,
    /// B+Tree internal page.
    Internal = 2,
}

impl TryFrom<u32> for PageType {
    type Error = TinyDbError;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            0 => Ok(PageType::Invalid),
            1 => Ok(PageType::Leaf),
            2 => Ok(PageType::Internal),
            _ => Err(TinyDbError::Unreachable(format!(
                "invalid page type tag: {}",
                value
            ))),
        }
    }
}

/// Header structure at the beginning of every page.
///
/// Layout (24 bytes, all fields little-endian u32):
///
/// ```text
/// offset  field
/// 0       page_id
/// 4       lsn
/// 8       size
/// 12      max_size
/// 16      parent_page_id  (INVALID_PAGE_ID when root)
/// 20      page_type       (0 invalid, 1 leaf, 2 internal)
/// ```
///
/// Payload begins at offset 24. All access to header bytes goes through
/// the typed accessors below; nothing reinterprets the buffer in place.
#[derive(Debug, Clone, Copy)]
pub struct PageHeader {
    /// Id of the page this header belongs to.
    pub page_id: PageId,
    /// LSN of the last log record describing a modification to this page.
    pub lsn: u32,
    /// Number of entries currently stored in the payload.
    pub size: u32,
    /// Maximum number of entries before the page must split.
    pub max_size: u32,
    /// Parent page id; INVALID_PAGE_ID for the root.
    pub parent_page_id: PageId,
    /// Kind of page.
    pub page_type: PageType,
}

impl PageHeader {
    /// Size of the page header in bytes.
    pub const SIZE: usize = 24;

    /// Creates a header for a freshly initialized page.
    pub fn new(page_id: PageId, page_type: PageType, max_size: u32) -> Self {
        Self {
            page_id,
            lsn: 0,
            size: 0,
            max_size,
            parent_page_id: INVALID_PAGE_ID,
            page_type,
        }
    }

    /// Serializes the header to bytes.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.page_id.0.to_le_bytes());
        buf[4..8].copy_from_slice(&self.lsn.to_le_bytes());
        buf[8..12].copy_from_slice(&self.size.to_le_bytes());
        buf[12..16].copy_from_slice(&self.max_size.to_le_bytes());
        buf[16..20].copy_from_slice(&self.parent_page_id.0.to_le_bytes());
        buf[20..24].copy_from_slice(&(self.page_type as u32).to_le_bytes());
        buf
    }

    /// Deserializes the header from the leading bytes of a page.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(TinyDbError::LogicError(format!(
                "page header needs {} bytes, got {}",
                Self::SIZE,
                buf.len()
            )));
        }
        Ok(Self {
            page_id: PageId(read_u32(buf, 0)),
            lsn: read_u32(buf, 4),
            size: read_u32(buf, 8),
            max_size: read_u32(buf, 12),
            parent_page_id: PageId(read_u32(buf, 16)),
            page_type: PageType::try_from(read_u32(buf, 20))?,
        })
    }

    // Field accessors over raw page bytes. These are the only way header
    // fields are read or written once a page is materialized.

    pub fn page_id_of(data: &[u8]) -> PageId {
        PageId(read_u32(data, 0))
    }

    pub fn set_page_id(data: &mut [u8], page_id: PageId) {
        write_u32(data, 0, page_id.0);
    }

    pub fn lsn_of(data: &[u8]) -> u32 {
        read_u32(data, 4)
    }

    pub fn set_lsn(data: &mut [u8], lsn: u32) {
        write_u32(data, 4, lsn);
    }

    pub fn size_of(data: &[u8]) -> u32 {
        read_u32(data, 8)
    }

    pub fn set_size(data: &mut [u8], size: u32) {
        write_u32(data, 8, size);
    }

    pub fn max_size_of(data: &[u8]) -> u32 {
        read_u32(data, 12)
    }

    pub fn set_max_size(data: &mut [u8], max_size: u32) {
        write_u32(data, 12, max_size);
    }

    pub fn parent_of(data: &[u8]) -> PageId {
        PageId(read_u32(data, 16))
    }

    pub fn set_parent(data: &mut [u8], parent: PageId) {
        write_u32(data, 16, parent.0);
    }

    pub fn page_type_of(data: &[u8]) -> Result<PageType> {
        PageType::try_from(read_u32(data, 20))
    }

    pub fn set_page_type(data: &mut [u8], page_type: PageType) {
        write_u32(data, 20, page_type as u32);
    }
}

#[inline]
fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

#[inline]
fn write_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}
