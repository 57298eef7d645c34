//! Error types for wallet storage operations.
//!
//! Every operation in the engine returns one of these variants; the host
//! runtime translates the stable integer code (`StorageError::code`) into
//! its own error domain. Errors are descriptive at this level; no retry or
//! backoff happens here.

use thiserror::Error;

/// Result type alias for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Error taxonomy for the storage engine.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Unknown storage, record, metadata, or search handle
    #[error("Invalid handle: {0}")]
    InvalidHandle(i64),

    /// Wallet already exists on create
    #[error("Wallet already exists: {0}")]
    AlreadyExists(String),

    /// Wallet missing on open
    #[error("Wallet not found: {0}")]
    NotFound(String),

    /// Record or search item missing, including cursor exhaustion
    #[error("Item not found")]
    ItemNotFound,

    /// Duplicate (type, id) on add
    #[error("Item already exists: {0}")]
    ItemAlreadyExists(String),

    /// Backend I/O or transaction failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Malformed JSON or unexpected value shape
    #[error("Invalid input: {0}")]
    Input(String),

    /// Malformed WQL or invalid operand for a numeric operator
    #[error("Query error: {0}")]
    Query(String),

    /// Internal invariant violated; signals an engine bug, not caller error
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl StorageError {
    /// Stable integer code marshalled to the host as the provider error code.
    pub fn code(&self) -> i32 {
        match self {
            StorageError::InvalidHandle(_) => 101,
            StorageError::AlreadyExists(_) => 102,
            StorageError::NotFound(_) => 103,
            StorageError::ItemNotFound => 104,
            StorageError::ItemAlreadyExists(_) => 105,
            StorageError::Storage(_) => 106,
            StorageError::Input(_) => 107,
            StorageError::Query(_) => 108,
            StorageError::InvalidState(_) => 109,
        }
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        StorageError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Input(err.to_string())
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Storage(err.to_string())
    }
}
