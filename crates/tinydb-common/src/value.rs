//! Value representation for the type subsystem.
//!
//! The original design routed every operation through a singleton type
//! table with virtual dispatch per type id. Here a value is a tagged
//! variant and each capability (compare, serialize) is a match on the
//! tag.

use crate::error::{Result, TinyDbError};
use crate::types::TypeId;
use std::cmp::Ordering;

/// NULL sentinel for TINYINT and BOOLEAN storage.
pub const TINYINT_NULL: i8 = i8::MIN;
/// NULL sentinel for SMALLINT storage.
pub const SMALLINT_NULL: i16 = i16::MIN;
/// NULL sentinel for INTEGER storage.
pub const INTEGER_NULL: i32 = i32::MIN;
/// NULL sentinel for BIGINT storage.
pub const BIGINT_NULL: i64 = i64::MIN;
/// NULL sentinel for DECIMAL storage.
pub const DECIMAL_NULL: f64 = f64::MIN;
/// NULL sentinel for a VARCHAR offset slot.
pub const VARCHAR_NULL_OFFSET: u32 = u32::MAX;

/// A single typed value; `None` in the payload position means SQL NULL.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Boolean(Option<bool>),
    TinyInt(Option<i8>),
    SmallInt(Option<i16>),
    Integer(Option<i32>),
    BigInt(Option<i64>),
    Decimal(Option<f64>),
    Varchar(Option<String>),
}

impl Value {
    /// Returns the type tag of this value.
    pub fn type_id(&self) -> TypeId {
        match self {
            Value::Boolean(_) => TypeId::Boolean,
            Value::TinyInt(_) => TypeId::TinyInt,
            Value::SmallInt(_) => TypeId::SmallInt,
            Value::Integer(_) => TypeId::Integer,
            Value::BigInt(_) => TypeId::BigInt,
            Value::Decimal(_) => TypeId::Decimal,
            Value::Varchar(_) => TypeId::Varchar,
        }
    }

    /// Returns the NULL value of the given type.
    pub fn null(type_id: TypeId) -> Result<Value> {
        match type_id {
            TypeId::Boolean => Ok(Value::Boolean(None)),
            TypeId::TinyInt => Ok(Value::TinyInt(None)),
            TypeId::SmallInt => Ok(Value::SmallInt(None)),
            TypeId::Integer => Ok(Value::Integer(None)),
            TypeId::BigInt => Ok(Value::BigInt(None)),
            TypeId::Decimal => Ok(Value::Decimal(None)),
            TypeId::Varchar => Ok(Value::Varchar(None)),
            TypeId::Invalid => Err(TinyDbError::IncompatibleType(
                "no NULL for the invalid type".to_string(),
            )),
        }
    }

    /// Returns true if this value is NULL.
    pub fn is_null(&self) -> bool {
        match self {
            Value::Boolean(v) => v.is_none(),
            Value::TinyInt(v) => v.is_none(),
            Value::SmallInt(v) => v.is_none(),
            Value::Integer(v) => v.is_none(),
            Value::BigInt(v) => v.is_none(),
            Value::Decimal(v) => v.is_none(),
            Value::Varchar(v) => v.is_none(),
        }
    }

    /// Compares two values of the same type.
    ///
    /// Integers compare numerically, strings byte-lexicographically.
    /// Comparing values of different types is a type mismatch; NULL
    /// ordering is not defined because indexes reject NULL keys.
    pub fn compare(&self, other: &Value) -> Result<Ordering> {
        match (self, other) {
            (Value::Boolean(Some(a)), Value::Boolean(Some(b))) => Ok(a.cmp(b)),
            (Value::TinyInt(Some(a)), Value::TinyInt(Some(b))) => Ok(a.cmp(b)),
            (Value::SmallInt(Some(a)), Value::SmallInt(Some(b))) => Ok(a.cmp(b)),
            (Value::Integer(Some(a)), Value::Integer(Some(b))) => Ok(a.cmp(b)),
            (Value::BigInt(Some(a)), Value::BigInt(Some(b))) => Ok(a.cmp(b)),
            (Value::Decimal(Some(a)), Value::Decimal(Some(b))) => Ok(a.total_cmp(b)),
            (Value::Varchar(Some(a)), Value::Varchar(Some(b))) => {
                Ok(a.as_bytes().cmp(b.as_bytes()))
            }
            (lhs, rhs) if lhs.type_id() != rhs.type_id() => Err(TinyDbError::MismatchType {
                expected: lhs.type_id().to_string(),
                actual: rhs.type_id().to_string(),
            }),
            _ => Err(TinyDbError::LogicError(
                "comparison against NULL is undefined".to_string(),
            )),
        }
    }

    /// Serializes an inlined value into `buf` at the type's inline width.
    ///
    /// NULLs are stored as type-specific sentinels. Varchar is not
    /// inlined; its offset slot is written by the tuple codec.
    pub fn serialize_inline(&self, buf: &mut [u8]) -> Result<()> {
        let width = self.type_id().inline_size();
        if buf.len() < width {
            return Err(TinyDbError::OutOfRange(format!(
                "{} bytes available for a {} byte value",
                buf.len(),
                width
            )));
        }
        match self {
            Value::Boolean(v) => {
                let raw = match v {
                    Some(true) => 1i8,
                    Some(false) => 0i8,
                    None => TINYINT_NULL,
                };
                buf[0] = raw as u8;
            }
            Value::TinyInt(v) => {
                buf[0] = v.unwrap_or(TINYINT_NULL) as u8;
            }
            Value::SmallInt(v) => {
                buf[..2].copy_from_slice(&v.unwrap_or(SMALLINT_NULL).to_le_bytes());
            }
            Value::Integer(v) => {
                buf[..4].copy_from_slice(&v.unwrap_or(INTEGER_NULL).to_le_bytes());
            }
            Value::BigInt(v) => {
                buf[..8].copy_from_slice(&v.unwrap_or(BIGINT_NULL).to_le_bytes());
            }
            Value::Decimal(v) => {
                buf[..8].copy_from_slice(&v.unwrap_or(DECIMAL_NULL).to_le_bytes());
            }
            Value::Varchar(_) => {
                return Err(TinyDbError::IncompatibleType(
                    "varchar has no inline representation".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Deserializes an inlined value of the given type from `buf`.
    pub fn deserialize_inline(type_id: TypeId, buf: &[u8]) -> Result<Value> {
        let width = type_id.inline_size();
        if buf.len() < width {
            return Err(TinyDbError::OutOfRange(format!(
                "{} bytes available for a {} byte value",
                buf.len(),
                width
            )));
        }
        match type_id {
            TypeId::Boolean => {
                let raw = buf[0] as i8;
                Ok(Value::Boolean(if raw == TINYINT_NULL {
                    None
                } else {
                    Some(raw != 0)
                }))
            }
            TypeId::TinyInt => {
                let raw = buf[0] as i8;
                Ok(Value::TinyInt((raw != TINYINT_NULL).then_some(raw)))
            }
            TypeId::SmallInt => {
                let raw = i16::from_le_bytes([buf[0], buf[1]]);
                Ok(Value::SmallInt((raw != SMALLINT_NULL).then_some(raw)))
            }
            TypeId::Integer => {
                let raw = i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
                Ok(Value::Integer((raw != INTEGER_NULL).then_some(raw)))
            }
            TypeId::BigInt => {
                let raw = i64::from_le_bytes([
                    buf[0], buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7],
                ]);
                Ok(Value::BigInt((raw != BIGINT_NULL).then_some(raw)))
            }
            TypeId::Decimal => {
                let raw = f64::from_le_bytes([
                    buf[0], buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7],
                ]);
                Ok(Value::Decimal((raw != DECIMAL_NULL).then_some(raw)))
            }
            TypeId::Varchar => Err(TinyDbError::IncompatibleType(
                "varchar has no inline representation".to_string(),
            )),
            TypeId::Invalid => Err(TinyDbError::IncompatibleType(
                "cannot deserialize the invalid type".to_string(),
            )),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_null() {
            return write!(f, "NULL");
        }
        match self {
            Value::Boolean(Some(v)) => write!(f, "{}", v),
            Value::TinyInt(Some(v)) => write!(f, "{}", v),
            Value::SmallInt(Some(v)) => write!(f, "{}", v),
            Value::Integer(Some(v)) => write!(f, "{}", v),
            Value::BigInt(Some(v)) => write!(f, "{}", v),
            Value::Decimal(Some(v)) => write!(f, "{}", v),
            Value::Varchar(Some(v)) => write!(f, "{}", v),
            _ => write!(f, "NULL"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_id() {
        assert_eq!(Value::Integer(Some(1)).type_id(), TypeId::Integer);
        assert_eq!(Value::Varchar(None).type_id(), TypeId::Varchar);
    }

    #[test]
    fn test_null() {
        assert!(Value::null(TypeId::Integer).unwrap().is_null());
        assert!(Value::null(TypeId::Invalid).is_err());
        assert!(!Value::Integer(Some(0)).is_null());
    }

    #[test]
    fn test_compare_integers() {
        let a = Value::Integer(Some(1));
        let b = Value::Integer(Some(2));
        assert_eq!(a.compare(&b).unwrap(), Ordering::Less);
        assert_eq!(b.compare(&a).unwrap(), Ordering::Greater);
        assert_eq!(a.compare(&a).unwrap(), Ordering::Equal);
    }

    #[test]
    fn test_compare_varchar_is_byte_lexicographic() {
        let a = Value::Varchar(Some("abc".to_string()));
        let b = Value::Varchar(Some("abd".to_string()));
        let c = Value::Varchar(Some("ab".to_string()));
        assert_eq!(a.compare(&b).unwrap(), Ordering::Less);
        assert_eq!(a.compare(&c).unwrap(), Ordering::Greater);
    }

    #[test]
    fn test_compare_mismatched_types() {
        let a = Value::Integer(Some(1));
        let b = Value::BigInt(Some(1));
        assert!(matches!(
            a.compare(&b),
            Err(TinyDbError::MismatchType { .. })
        ));
    }

    #[test]
    fn test_compare_null_is_error() {
        let a = Value::Integer(None);
        let b = Value::Integer(Some(1));
        assert!(a.compare(&b).is_err());
    }

    #[test]
    fn test_inline_roundtrip() {
        let cases = [
            Value::Boolean(Some(true)),
            Value::Boolean(Some(false)),
            Value::TinyInt(Some(-5)),
            Value::SmallInt(Some(1234)),
            Value::Integer(Some(-100_000)),
            Value::BigInt(Some(1i64 << 40)),
            Value::Decimal(Some(2.5)),
        ];
        for value in cases {
            let mut buf = [0u8; 8];
            value.serialize_inline(&mut buf).unwrap();
            let back = Value::deserialize_inline(value.type_id(), &buf).unwrap();
            assert_eq!(value, back);
        }
    }

    #[test]
    fn test_inline_null_sentinels() {
        for type_id in [
            TypeId::Boolean,
            TypeId::TinyInt,
            TypeId::SmallInt,
            TypeId::Integer,
            TypeId::BigInt,
            TypeId::Decimal,
        ] {
            let value = Value::null(type_id).unwrap();
            let mut buf = [0u8; 8];
            value.serialize_inline(&mut buf).unwrap();
            let back = Value::deserialize_inline(type_id, &buf).unwrap();
            assert!(back.is_null(), "{} null did not round-trip", type_id);
        }
    }

    #[test]
    fn test_varchar_has_no_inline_form() {
        let value = Value::Varchar(Some("x".to_string()));
        let mut buf = [0u8; 8];
        assert!(value.serialize_inline(&mut buf).is_err());
        assert!(Value::deserialize_inline(TypeId::Varchar, &buf).is_err());
    }

    #[test]
    fn test_short_buffer() {
        let value = Value::BigInt(Some(1));
        let mut buf = [0u8; 4];
        assert!(value.serialize_inline(&mut buf).is_err());
        assert!(Value::deserialize_inline(TypeId::BigInt, &buf).is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(Value::Integer(Some(7)).to_string(), "7");
        assert_eq!(Value::Integer(None).to_string(), "NULL");
        assert_eq!(Value::Varchar(Some("hi".to_string())).to_string(), "hi");
    }
}
