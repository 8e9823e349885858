//! B+Tree index implementation.
//!
//! The tree maps fixed-width keys to RIDs on top of the buffer pool.
//! Pages are navigated by id through [`tinydb_buffer::BufferPoolManager`];
//! concurrency is latch crabbing over per-page reader/writer latches.

mod context;
mod key;
mod page;
mod tree;

pub use key::{GenericComparator, GenericKey};
pub use page::{internal_capacity, leaf_capacity, InternalPage, LeafPage};
pub use tree::BPlusTree;
