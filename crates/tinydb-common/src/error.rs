//! Error types for TinyDB.

use thiserror::Error;

/// Result type alias using TinyDbError.
pub type Result<T> = std::result::Result<T, TinyDbError>;

/// Errors that can occur in TinyDB operations.
///
/// The buffer pool reports expected exhaustion or precondition outcomes
/// through `Option`/`bool` returns; these variants are reserved for
/// genuine faults.
#[derive(Debug, Error)]
pub enum TinyDbError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("I/O error: {0}")]
    IoMsg(String),

    // Type subsystem errors
    #[error("value out of range: {0}")]
    OutOfRange(String),

    #[error("division by zero")]
    DivideByZero,

    #[error("type mismatch: expected {expected}, got {actual}")]
    MismatchType { expected: String, actual: String },

    #[error("incompatible type: {0}")]
    IncompatibleType(String),

    #[error("conversion failed: {0}")]
    Conversion(String),

    // Resource errors
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    // Programming errors
    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error("logic error: {0}")]
    LogicError(String),

    #[error("unreachable: {0}")]
    Unreachable(String),
}
