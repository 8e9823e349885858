//! Tuple representation and serialization.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tinydb_common::value::VARCHAR_NULL_OFFSET;
use tinydb_common::{Result, Rid, Schema, TinyDbError, Value};

/// A row of typed values in its canonical byte form.
///
/// Payload layout:
/// - one fixed-size slot per column: fixed-size columns store the value
///   directly, variable-size columns store a 4-byte offset into the tail
/// - variable-size payloads follow in declaration order
///
/// Two tuples built from identical (schema, values) produce identical
/// bytes, so equality is byte-level equality.
#[derive(Debug, Clone, Default)]
pub struct Tuple {
    rid: Rid,
    data: Vec<u8>,
}

impl Tuple {
    /// The default tuple is invalid: it holds no data.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a tuple from values matching the schema's columns.
    pub fn from_values(values: &[Value], schema: &Schema) -> Result<Tuple> {
        if values.len() != schema.column_count() {
            return Err(TinyDbError::LogicError(format!(
                "{} values for {} columns",
                values.len(),
                schema.column_count()
            )));
        }

        let mut size = schema.length() as usize;
        for &idx in schema.uninlined_columns() {
            match &values[idx] {
                Value::Varchar(Some(s)) => size += 4 + s.len(),
                Value::Varchar(None) => {}
                other => {
                    return Err(TinyDbError::MismatchType {
                        expected: schema.column(idx)?.type_id().to_string(),
                        actual: other.type_id().to_string(),
                    });
                }
            }
        }

        let mut data = vec![0u8; size];
        let mut tail = schema.length() as usize;
        for (value, column) in values.iter().zip(schema.columns()) {
            let offset = column.offset() as usize;
            if column.is_inlined() {
                if value.type_id() != column.type_id() {
                    return Err(TinyDbError::MismatchType {
                        expected: column.type_id().to_string(),
                        actual: value.type_id().to_string(),
                    });
                }
                let width = column.inline_size() as usize;
                value.serialize_inline(&mut data[offset..offset + width])?;
            } else {
                match value {
                    Value::Varchar(Some(s)) => {
                        data[offset..offset + 4]
                            .copy_from_slice(&(tail as u32).to_le_bytes());
                        data[tail..tail + 4]
                            .copy_from_slice(&(s.len() as u32).to_le_bytes());
                        data[tail + 4..tail + 4 + s.len()].copy_from_slice(s.as_bytes());
                        tail += 4 + s.len();
                    }
                    Value::Varchar(None) => {
                        data[offset..offset + 4]
                            .copy_from_slice(&VARCHAR_NULL_OFFSET.to_le_bytes());
                    }
                    other => {
                        return Err(TinyDbError::MismatchType {
                            expected: column.type_id().to_string(),
                            actual: other.type_id().to_string(),
                        });
                    }
                }
            }
        }

        Ok(Tuple {
            rid: Rid::INVALID,
            data,
        })
    }

    pub fn rid(&self) -> Rid {
        self.rid
    }

    pub fn set_rid(&mut self, rid: Rid) {
        self.rid = rid;
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Tuple length including varlen payloads.
    pub fn size(&self) -> u32 {
        self.data.len() as u32
    }

    /// A default-constructed tuple is invalid.
    pub fn is_valid(&self) -> bool {
        !self.data.is_empty()
    }

    /// Decodes the value of one column.
    pub fn get_value(&self, schema: &Schema, column_idx: usize) -> Result<Value> {
        let column = schema.column(column_idx)?;
        let offset = column.offset() as usize;
        if column.is_inlined() {
            let width = column.inline_size() as usize;
            if self.data.len() < offset + width {
                return Err(TinyDbError::OutOfRange(format!(
                    "tuple of {} bytes has no column at offset {}",
                    self.data.len(),
                    offset
                )));
            }
            Value::deserialize_inline(column.type_id(), &self.data[offset..])
        } else {
            read_varchar(&self.data, offset)
        }
    }

    /// Returns true if the column's value is NULL.
    pub fn is_null(&self, schema: &Schema, column_idx: usize) -> Result<bool> {
        Ok(self.get_value(schema, column_idx)?.is_null())
    }

    /// Projects this tuple into a key tuple: the columns listed in
    /// `key_attrs` re-encoded under `key_schema`.
    pub fn key_from_tuple(
        &self,
        schema: &Schema,
        key_schema: &Schema,
        key_attrs: &[usize],
    ) -> Result<Tuple> {
        let mut values = Vec::with_capacity(key_attrs.len());
        for &attr in key_attrs {
            values.push(self.get_value(schema, attr)?);
        }
        Tuple::from_values(&values, key_schema)
    }

    /// Serializes with a leading 4-byte length.
    pub fn serialize_to_with_size(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.data.len() as u32);
        buf.put_slice(&self.data);
    }

    /// Deserializes a tuple written by `serialize_to_with_size`,
    /// advancing `buf` past it.
    pub fn deserialize_from_with_size(buf: &mut Bytes) -> Result<Tuple> {
        if buf.len() < 4 {
            return Err(TinyDbError::Conversion(
                "tuple length prefix truncated".to_string(),
            ));
        }
        let size = buf.get_u32_le() as usize;
        if buf.len() < size {
            return Err(TinyDbError::Conversion(format!(
                "tuple payload truncated: {} of {} bytes",
                buf.len(),
                size
            )));
        }
        let data = buf.split_to(size).to_vec();
        Ok(Tuple {
            rid: Rid::INVALID,
            data,
        })
    }

    /// Serializes the bare payload into `buf` (caller stores the size).
    pub fn serialize_to(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() < self.data.len() {
            return Err(TinyDbError::OutOfRange(format!(
                "{} bytes available for a {} byte tuple",
                buf.len(),
                self.data.len()
            )));
        }
        buf[..self.data.len()].copy_from_slice(&self.data);
        Ok(())
    }

    /// Deserializes a bare payload of known size.
    pub fn deserialize_from(buf: &[u8], size: u32) -> Result<Tuple> {
        let size = size as usize;
        if buf.len() < size {
            return Err(TinyDbError::Conversion(format!(
                "tuple payload truncated: {} of {} bytes",
                buf.len(),
                size
            )));
        }
        Ok(Tuple {
            rid: Rid::INVALID,
            data: buf[..size].to_vec(),
        })
    }

    /// Size needed by `serialize_to_with_size`.
    pub fn serialization_size(&self) -> usize {
        4 + self.data.len()
    }

    /// Renders the tuple's values for debugging.
    pub fn to_string_with(&self, schema: &Schema) -> Result<String> {
        let mut out = String::from("(");
        for idx in 0..schema.column_count() {
            if idx > 0 {
                out.push_str(", ");
            }
            out.push_str(&self.get_value(schema, idx)?.to_string());
        }
        out.push(')');
        Ok(out)
    }
}

impl PartialEq for Tuple {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

impl Eq for Tuple {}

/// Decodes a varchar whose 4-byte offset slot sits at `slot_offset`.
pub(crate) fn read_varchar(data: &[u8], slot_offset: usize) -> Result<Value> {
    if data.len() < slot_offset + 4 {
        return Err(TinyDbError::OutOfRange(format!(
            "no varchar slot at offset {}",
            slot_offset
        )));
    }
    let payload_offset = u32::from_le_bytes([
        data[slot_offset],
        data[slot_offset + 1],
        data[slot_offset + 2],
        data[slot_offset + 3],
    ]);
    if payload_offset == VARCHAR_NULL_OFFSET {
        return Ok(Value::Varchar(None));
    }
    let payload_offset = payload_offset as usize;
    if data.len() < payload_offset + 4 {
        return Err(TinyDbError::OutOfRange(format!(
            "varchar payload offset {} out of bounds",
            payload_offset
        )));
    }
    let len = u32::from_le_bytes([
        data[payload_offset],
        data[payload_offset + 1],
        data[payload_offset + 2],
        data[payload_offset + 3],
    ]) as usize;
    if data.len() < payload_offset + 4 + len {
        return Err(TinyDbError::OutOfRange(format!(
            "varchar of {} bytes overruns the tuple",
            len
        )));
    }
    let raw = data[payload_offset + 4..payload_offset + 4 + len].to_vec();
    let s = String::from_utf8(raw).map_err(|e| TinyDbError::Conversion(e.to_string()))?;
    Ok(Value::Varchar(Some(s)))
}
