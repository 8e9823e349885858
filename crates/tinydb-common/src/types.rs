//! Type identifiers for TinyDB data types.

use serde::{Deserialize, Serialize};

/// Identifier for all supported data types in TinyDB.
///
/// Type IDs are stored in schemas to identify the type of each column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TypeId {
    Invalid = 0,
    Boolean = 1,
    TinyInt = 2,
    SmallInt = 3,
    Integer = 4,
    BigInt = 5,
    Decimal = 6,
    Varchar = 7,
}

impl TypeId {
    /// Returns the inline storage size of this type in bytes.
    ///
    /// Variable-length types store a 4-byte offset inline; the payload
    /// lives in the tuple's tail region.
    pub fn inline_size(&self) -> usize {
        match self {
            TypeId::Invalid => 0,
            TypeId::Boolean | TypeId::TinyInt => 1,
            TypeId::SmallInt => 2,
            TypeId::Integer => 4,
            TypeId::BigInt | TypeId::Decimal => 8,
            TypeId::Varchar => 4,
        }
    }

    /// Returns true if values of this type are stored inline in full.
    pub fn is_inlined(&self) -> bool {
        !matches!(self, TypeId::Varchar)
    }

    /// Returns true if this type is numeric.
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            TypeId::TinyInt
                | TypeId::SmallInt
                | TypeId::Integer
                | TypeId::BigInt
                | TypeId::Decimal
        )
    }
}

impl std::fmt::Display for TypeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TypeId::Invalid => "INVALID",
            TypeId::Boolean => "BOOLEAN",
            TypeId::TinyInt => "TINYINT",
            TypeId::SmallInt => "SMALLINT",
            TypeId::Integer => "INTEGER",
            TypeId::BigInt => "BIGINT",
            TypeId::Decimal => "DECIMAL",
            TypeId::Varchar => "VARCHAR",
        };
        write!(f, "{}", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inline_sizes() {
        assert_eq!(TypeId::Boolean.inline_size(), 1);
        assert_eq!(TypeId::TinyInt.inline_size(), 1);
        assert_eq!(TypeId::SmallInt.inline_size(), 2);
        assert_eq!(TypeId::Integer.inline_size(), 4);
        assert_eq!(TypeId::BigInt.inline_size(), 8);
        assert_eq!(TypeId::Decimal.inline_size(), 8);
        assert_eq!(TypeId::Varchar.inline_size(), 4);
    }

    #[test]
    fn test_is_inlined() {
        assert!(TypeId::Integer.is_inlined());
        assert!(TypeId::Boolean.is_inlined());
        assert!(!TypeId::Varchar.is_inlined());
    }

    #[test]
    fn test_is_numeric() {
        assert!(TypeId::TinyInt.is_numeric());
        assert!(TypeId::Integer.is_numeric());
        assert!(TypeId::Decimal.is_numeric());
        assert!(!TypeId::Boolean.is_numeric());
        assert!(!TypeId::Varchar.is_numeric());
    }

    #[test]
    fn test_display() {
        assert_eq!(TypeId::Integer.to_string(), "INTEGER");
        assert_eq!(TypeId::Varchar.to_string(), "VARCHAR");
        assert_eq!(TypeId::Decimal.to_string(), "DECIMAL");
    }

    #[test]
    fn test_serde_roundtrip() {
        for type_id in [
            TypeId::Boolean,
            TypeId::TinyInt,
            TypeId::SmallInt,
            TypeId::Integer,
            TypeId::BigInt,
            TypeId::Decimal,
            TypeId::Varchar,
        ] {
            let serialized = serde_json::to_string(&type_id).unwrap();
            let deserialized: TypeId = serde_json::from_str(&serialized).unwrap();
            assert_eq!(type_id, deserialized);
        }
    }
}
