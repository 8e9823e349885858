//! Fixed-width index keys and the schema-aware comparator.

use crate::tuple::{read_varchar, Tuple};
use std::cmp::Ordering;
use std::sync::Arc;
use tinydb_common::{Column, Result, Schema, TinyDbError, Value};

/// A `N`-byte inline key buffer.
///
/// Holds the canonical byte form of a key tuple, zero-padded to the
/// buffer width. Ordering is defined by [`GenericComparator`], never by
/// raw bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenericKey<const N: usize> {
    data: [u8; N],
}

impl<const N: usize> GenericKey<N> {
    /// The zero key.
    pub fn zeroed() -> Self {
        Self { data: [0u8; N] }
    }

    /// Builds a key from a key tuple's payload.
    pub fn from_tuple(tuple: &Tuple) -> Result<Self> {
        Self::from_bytes(tuple.data())
    }

    /// Builds a key from raw bytes (at most `N` of them).
    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        if raw.len() > N {
            return Err(TinyDbError::OutOfRange(format!(
                "key of {} bytes exceeds the {} byte key buffer",
                raw.len(),
                N
            )));
        }
        let mut data = [0u8; N];
        data[..raw.len()].copy_from_slice(raw);
        Ok(Self { data })
    }

    /// Reads a key back out of a page slot (exactly `N` bytes).
    pub fn from_slice(slot: &[u8]) -> Self {
        let mut data = [0u8; N];
        data.copy_from_slice(&slot[..N]);
        Self { data }
    }

    pub fn as_bytes(&self) -> &[u8; N] {
        &self.data
    }
}

/// Schema-aware ordering over fixed-width key buffers.
///
/// Compares column by column in schema order: integers numerically,
/// strings byte-lexicographically. NULL ordering is undefined because
/// the index facade rejects NULL key columns up front.
#[derive(Debug, Clone)]
pub struct GenericComparator<const N: usize> {
    key_schema: Arc<Schema>,
}

impl<const N: usize> GenericComparator<N> {
    /// Creates a comparator; the schema's inline region must fit the
    /// key width.
    pub fn new(key_schema: Arc<Schema>) -> Result<Self> {
        if key_schema.length() as usize > N {
            return Err(TinyDbError::OutOfRange(format!(
                "key schema needs {} bytes, key buffer holds {}",
                key_schema.length(),
                N
            )));
        }
        Ok(Self { key_schema })
    }

    pub fn key_schema(&self) -> &Arc<Schema> {
        &self.key_schema
    }

    /// Three-valued ordering of two key buffers.
    pub fn compare(&self, lhs: &GenericKey<N>, rhs: &GenericKey<N>) -> Result<Ordering> {
        for column in self.key_schema.columns() {
            let a = self.value_at(lhs, column)?;
            let b = self.value_at(rhs, column)?;
            match a.compare(&b)? {
                Ordering::Equal => continue,
                ord => return Ok(ord),
            }
        }
        Ok(Ordering::Equal)
    }

    fn value_at(&self, key: &GenericKey<N>, column: &Column) -> Result<Value> {
        let data = &key.as_bytes()[..];
        let offset = column.offset() as usize;
        if column.is_inlined() {
            Value::deserialize_inline(column.type_id(), &data[offset..])
        } else {
            read_varchar(data, offset)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tinydb_common::TypeId;

    fn int_comparator() -> GenericComparator<8> {
        let schema = Arc::new(Schema::new(vec![Column::new("k", TypeId::BigInt)]));
        GenericComparator::new(schema).unwrap()
    }

    fn int_key(v: i64) -> GenericKey<8> {
        let schema = Schema::new(vec![Column::new("k", TypeId::BigInt)]);
        let tuple = Tuple::from_values(&[Value::BigInt(Some(v))], &schema).unwrap();
        GenericKey::from_tuple(&tuple).unwrap()
    }

    #[test]
    fn test_key_padding_and_roundtrip() {
        let key = GenericKey::<8>::from_bytes(&[1, 2, 3]).unwrap();
        assert_eq!(key.as_bytes(), &[1, 2, 3, 0, 0, 0, 0, 0]);

        let copy = GenericKey::<8>::from_slice(key.as_bytes());
        assert_eq!(copy, key);
    }

    #[test]
    fn test_key_too_large() {
        let raw = [0u8; 9];
        assert!(GenericKey::<8>::from_bytes(&raw).is_err());
    }

    #[test]
    fn test_integer_comparison_is_numeric() {
        let cmp = int_comparator();
        // Byte-wise, -1 (0xFF...) would sort above 1; numerically it must not.
        assert_eq!(
            cmp.compare(&int_key(-1), &int_key(1)).unwrap(),
            Ordering::Less
        );
        assert_eq!(
            cmp.compare(&int_key(5), &int_key(5)).unwrap(),
            Ordering::Equal
        );
        assert_eq!(
            cmp.compare(&int_key(9), &int_key(2)).unwrap(),
            Ordering::Greater
        );
    }

    #[test]
    fn test_multi_column_ordering() {
        let schema = Arc::new(Schema::new(vec![
            Column::new("a", TypeId::Integer),
            Column::new("b", TypeId::Integer),
        ]));
        let cmp = GenericComparator::<8>::new(Arc::clone(&schema)).unwrap();

        let key = |a: i32, b: i32| {
            let tuple = Tuple::from_values(
                &[Value::Integer(Some(a)), Value::Integer(Some(b))],
                &schema,
            )
            .unwrap();
            GenericKey::<8>::from_tuple(&tuple).unwrap()
        };

        assert_eq!(cmp.compare(&key(1, 9), &key(2, 0)).unwrap(), Ordering::Less);
        assert_eq!(cmp.compare(&key(2, 1), &key(2, 3)).unwrap(), Ordering::Less);
        assert_eq!(cmp.compare(&key(2, 3), &key(2, 3)).unwrap(), Ordering::Equal);
    }

    #[test]
    fn test_varchar_keys_compare_byte_lexicographically() {
        let schema = Arc::new(Schema::new(vec![Column::new("s", TypeId::Varchar)]));
        let cmp = GenericComparator::<16>::new(Arc::clone(&schema)).unwrap();

        let key = |s: &str| {
            let tuple =
                Tuple::from_values(&[Value::Varchar(Some(s.to_string()))], &schema).unwrap();
            GenericKey::<16>::from_tuple(&tuple).unwrap()
        };

        assert_eq!(cmp.compare(&key("ab"), &key("b")).unwrap(), Ordering::Less);
        assert_eq!(cmp.compare(&key("ab"), &key("ab")).unwrap(), Ordering::Equal);
        assert_eq!(
            cmp.compare(&key("abc"), &key("ab")).unwrap(),
            Ordering::Greater
        );
    }

    #[test]
    fn test_comparator_rejects_oversized_schema() {
        let schema = Arc::new(Schema::new(vec![
            Column::new("a", TypeId::BigInt),
            Column::new("b", TypeId::BigInt),
        ]));
        assert!(GenericComparator::<8>::new(schema).is_err());
    }
}
