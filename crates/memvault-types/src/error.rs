//! Shared error types for the Memvault store.

use thiserror::Error;

/// Top-level error type for memory store operations.
///
/// "Not found" is deliberately absent: lookups return `Option`/`bool`.
/// Import conflicts are reported inside `ImportResult`, not raised.
#[derive(Error, Debug)]
pub enum MemoryError {
    /// A caller-supplied option or argument was rejected before any mutation.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A payload could not be encoded, decoded, decrypted or recognised.
    #[error("Format error: {0}")]
    Format(String),

    /// The operation could not be configured (e.g. undetectable import format).
    #[error("Configuration error: {0}")]
    Config(String),

    /// Storing the entry would exceed the configured memory budget.
    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// The persistence backend failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// An internal error occurred (poisoned lock, broken invariant).
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Alias for Result with MemoryError.
pub type MemoryResult<T> = Result<T, MemoryError>;

impl MemoryError {
    /// Whether the error was raised by input validation, before any mutation.
    pub fn is_validation(&self) -> bool {
        matches!(self, MemoryError::Validation(_))
    }
}
