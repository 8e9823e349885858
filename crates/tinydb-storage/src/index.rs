//! Index metadata, the type-erased index surface, and the builder.

use crate::btree::{BPlusTree, GenericComparator, GenericKey};
use crate::tuple::Tuple;
use std::sync::Arc;
use tinydb_buffer::BufferPoolManager;
use tinydb_common::{Result, Rid, Schema, TinyDbError};
use tinydb_wal::LogManager;

/// Metadata of an index: the key schema it maintains over a table.
#[derive(Debug, Clone)]
pub struct IndexMetadata {
    index_name: String,
    table_name: String,
    tuple_schema: Arc<Schema>,
    key_schema: Arc<Schema>,
    key_attrs: Vec<usize>,
    unique: bool,
}

impl IndexMetadata {
    /// Builds metadata, deriving the key schema from the tuple schema
    /// and the indexed attributes.
    pub fn new(
        index_name: impl Into<String>,
        table_name: impl Into<String>,
        tuple_schema: Arc<Schema>,
        key_attrs: Vec<usize>,
        unique: bool,
    ) -> Result<Self> {
        let key_schema = Arc::new(Schema::copy_schema(&tuple_schema, &key_attrs)?);
        Ok(Self {
            index_name: index_name.into(),
            table_name: table_name.into(),
            tuple_schema,
            key_schema,
            key_attrs,
            unique,
        })
    }

    pub fn index_name(&self) -> &str {
        &self.index_name
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn tuple_schema(&self) -> &Arc<Schema> {
        &self.tuple_schema
    }

    pub fn key_schema(&self) -> &Arc<Schema> {
        &self.key_schema
    }

    pub fn key_attrs(&self) -> &[usize] {
        &self.key_attrs
    }

    pub fn index_column_count(&self) -> usize {
        self.key_schema.column_count()
    }

    /// Storage size of a key under the key schema; drives the width
    /// dispatch in [`IndexBuilder`].
    pub fn key_size(&self) -> usize {
        self.key_schema.length() as usize
    }

    pub fn is_unique(&self) -> bool {
        self.unique
    }
}

impl std::fmt::Display for IndexMetadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "IndexMetadata[Name = {}, Table = {}] :: {}",
            self.index_name, self.table_name, self.key_schema
        )
    }
}

/// Type-erased index surface.
///
/// Callers pass full table tuples; the index projects them into its
/// fixed-width key form internally.
pub trait Index: Send + Sync {
    fn metadata(&self) -> &IndexMetadata;

    /// Inserts an entry. Returns false on a duplicate key in a unique
    /// index.
    fn insert_entry(&self, tuple: &Tuple, rid: Rid) -> Result<bool>;

    /// Deletes the entry matching both key and RID. Returns false when
    /// no such entry exists.
    fn delete_entry(&self, tuple: &Tuple, rid: Rid) -> Result<bool>;

    /// Appends every RID stored under the tuple's key.
    fn scan_key(&self, tuple: &Tuple, results: &mut Vec<Rid>) -> Result<()>;
}

/// B+Tree-backed index specialized for one key width.
pub struct BPlusTreeIndex<const N: usize> {
    metadata: IndexMetadata,
    tree: BPlusTree<N>,
}

impl<const N: usize> BPlusTreeIndex<N> {
    pub fn new(
        metadata: IndexMetadata,
        bpm: Arc<BufferPoolManager>,
        log: Option<Arc<LogManager>>,
    ) -> Result<Self> {
        let comparator = GenericComparator::new(Arc::clone(metadata.key_schema()))?;
        let tree = BPlusTree::new(
            metadata.index_name().to_string(),
            bpm,
            log,
            comparator,
            BPlusTree::<N>::default_leaf_max_size(),
            BPlusTree::<N>::default_internal_max_size(),
            !metadata.is_unique(),
        )?;
        Ok(Self { metadata, tree })
    }

    pub fn tree(&self) -> &BPlusTree<N> {
        &self.tree
    }

    /// Projects a table tuple into the fixed-width key buffer.
    ///
    /// Indexes reject NULLs: any NULL key column is a logic error.
    fn project_key(&self, tuple: &Tuple) -> Result<GenericKey<N>> {
        let key_tuple = tuple.key_from_tuple(
            &self.metadata.tuple_schema,
            &self.metadata.key_schema,
            &self.metadata.key_attrs,
        )?;
        for idx in 0..self.metadata.key_schema.column_count() {
            if key_tuple.is_null(&self.metadata.key_schema, idx)? {
                return Err(TinyDbError::LogicError(format!(
                    "index {} cannot index a NULL key column",
                    self.metadata.index_name
                )));
            }
        }
        GenericKey::from_tuple(&key_tuple)
    }
}

impl<const N: usize> Index for BPlusTreeIndex<N> {
    fn metadata(&self) -> &IndexMetadata {
        &self.metadata
    }

    fn insert_entry(&self, tuple: &Tuple, rid: Rid) -> Result<bool> {
        let key = self.project_key(tuple)?;
        self.tree.insert(&key, rid)
    }

    fn delete_entry(&self, tuple: &Tuple, rid: Rid) -> Result<bool> {
        let key = self.project_key(tuple)?;
        self.tree.delete(&key, rid)
    }

    fn scan_key(&self, tuple: &Tuple, results: &mut Vec<Rid>) -> Result<()> {
        let key = self.project_key(tuple)?;
        self.tree.scan(&key, results)
    }
}

/// Builds a concrete B+Tree specialization for the metadata's key width.
pub struct IndexBuilder;

impl IndexBuilder {
    /// Key widths ∈ {4, 8, 16, 32, 64} bytes are supported; anything
    /// else is not implemented.
    pub fn build(
        metadata: IndexMetadata,
        bpm: Arc<BufferPoolManager>,
        log: Option<Arc<LogManager>>,
    ) -> Result<Box<dyn Index>> {
        match metadata.key_size() {
            4 => Ok(Box::new(BPlusTreeIndex::<4>::new(metadata, bpm, log)?)),
            8 => Ok(Box::new(BPlusTreeIndex::<8>::new(metadata, bpm, log)?)),
            16 => Ok(Box::new(BPlusTreeIndex::<16>::new(metadata, bpm, log)?)),
            32 => Ok(Box::new(BPlusTreeIndex::<32>::new(metadata, bpm, log)?)),
            64 => Ok(Box::new(BPlusTreeIndex::<64>::new(metadata, bpm, log)?)),
            other => Err(TinyDbError::NotImplemented(format!(
                "key size {} not supported",
                other
            ))),
        }
    }
}
