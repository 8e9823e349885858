//! Storage engine for TinyDB.
//!
//! This crate provides:
//! - Tuple representation and serialization over typed schemas
//! - Fixed-width index keys and the schema-aware comparator
//! - A latch-crabbing B+Tree index over the buffer pool
//! - The type-erased index facade and builder

mod btree;
mod index;
mod tuple;

pub use btree::{
    internal_capacity, leaf_capacity, BPlusTree, GenericComparator, GenericKey, InternalPage,
    LeafPage,
};
pub use index::{BPlusTreeIndex, Index, IndexBuilder, IndexMetadata};
pub use tuple::Tuple;
