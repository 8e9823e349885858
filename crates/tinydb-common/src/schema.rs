//! Column and schema definitions.

use crate::error::{Result, TinyDbError};
use crate::types::TypeId;
use serde::{Deserialize, Serialize};

/// A single column in a schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    /// Column name.
    name: String,
    /// Column type.
    type_id: TypeId,
    /// Byte offset of the column's inline slot within a tuple.
    offset: u32,
}

impl Column {
    /// Creates a column. The offset is assigned by the owning schema.
    pub fn new(name: impl Into<String>, type_id: TypeId) -> Self {
        Self {
            name: name.into(),
            type_id,
            offset: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Offset of the inline slot within the tuple's fixed region.
    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// Inline slot width (the offset slot width for varlen columns).
    pub fn inline_size(&self) -> u32 {
        self.type_id.inline_size() as u32
    }

    pub fn is_inlined(&self) -> bool {
        self.type_id.is_inlined()
    }
}

/// An ordered collection of columns with computed inline offsets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    columns: Vec<Column>,
    /// Total size of the inline (fixed) region in bytes.
    length: u32,
    /// Indices of columns whose payload lives in the tail region.
    uninlined: Vec<usize>,
}

impl Schema {
    /// Builds a schema, assigning each column its inline offset.
    pub fn new(mut columns: Vec<Column>) -> Self {
        let mut offset = 0u32;
        let mut uninlined = Vec::new();
        for (idx, column) in columns.iter_mut().enumerate() {
            column.offset = offset;
            offset += column.inline_size();
            if !column.is_inlined() {
                uninlined.push(idx);
            }
        }
        Self {
            columns,
            length: offset,
            uninlined,
        }
    }

    /// Builds a key schema by projecting `attrs` out of `schema`.
    pub fn copy_schema(schema: &Schema, attrs: &[usize]) -> Result<Schema> {
        let mut columns = Vec::with_capacity(attrs.len());
        for &attr in attrs {
            let column = schema.column(attr)?;
            columns.push(Column::new(column.name.clone(), column.type_id));
        }
        Ok(Schema::new(columns))
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column(&self, idx: usize) -> Result<&Column> {
        self.columns.get(idx).ok_or_else(|| {
            TinyDbError::OutOfRange(format!(
                "column index {} out of bounds ({} columns)",
                idx,
                self.columns.len()
            ))
        })
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Size of the inline region of a tuple with this schema.
    pub fn length(&self) -> u32 {
        self.length
    }

    /// Indices of variable-length columns.
    pub fn uninlined_columns(&self) -> &[usize] {
        &self.uninlined
    }
}

impl std::fmt::Display for Schema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Schema(")?;
        for (i, column) in self.columns.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}:{}", column.name, column.type_id)?;
        }
        write!(f, ")")
    }
}
