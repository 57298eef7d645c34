//! Storage backend trait definitions.
//!
//! `StorageBackend` manages wallet lifecycles; `WalletSession` is one open
//! wallet. The WQL combinator logic is shared (see `crate::wql`), so a
//! backend only decides how a tag clause resolves to a record-id set —
//! SQL subquery for the relational backend, index lookup for the in-memory
//! one.

use crate::error::Result;
use crate::wql::Query;

use super::types::{Record, RecordOptions, Tag};

/// A pluggable wallet storage backend.
///
/// All implementations must ensure:
/// - Wallets are fully partitioned: operations on different wallets never
///   observe or block each other.
/// - Multi-step mutations are atomic; a record is never visible without
///   its tags, or vice versa.
/// - Record and tag values stay opaque: the backend compares and orders
///   bytes/strings but never interprets them.
pub trait StorageBackend: Send + Sync + 'static {
    type Session: WalletSession + 'static;

    /// Create a wallet and persist its metadata blob.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::AlreadyExists` if the wallet already has
    /// stored metadata; `Input` if the wallet id fails the identifier
    /// whitelist or the config JSON is malformed.
    fn create_wallet(
        &self,
        wallet_id: &str,
        config: &str,
        credentials: &str,
        metadata: &str,
    ) -> Result<()>;

    /// Open an existing wallet.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if the wallet's metadata cannot be
    /// located.
    fn open_wallet(&self, wallet_id: &str, config: &str, credentials: &str)
        -> Result<Self::Session>;

    /// Remove the wallet's metadata, records, and tags in one logical
    /// operation.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Storage` if the wallet does not exist.
    fn delete_wallet(&self, wallet_id: &str, config: &str, credentials: &str) -> Result<()>;
}

/// One open wallet.
///
/// Sessions are shared across caller threads behind `Arc`, so every
/// operation takes `&self`; backends use interior locking at wallet
/// granularity.
pub trait WalletSession: Send + Sync {
    fn wallet_id(&self) -> &str;

    /// Insert a record with its tags atomically.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::ItemAlreadyExists` if `(type, name)` is
    /// already present in this wallet.
    fn add_record(&self, record_type: &str, name: &str, value: &[u8], tags: &[Tag]) -> Result<()>;

    /// Replace a record's value.
    fn update_record_value(&self, record_type: &str, name: &str, value: &[u8]) -> Result<()>;

    /// Replace the record's full tag set.
    fn update_record_tags(&self, record_type: &str, name: &str, tags: &[Tag]) -> Result<()>;

    /// Merge tags into the record; an existing tag name is overwritten.
    fn add_record_tags(&self, record_type: &str, name: &str, tags: &[Tag]) -> Result<()>;

    /// Remove the named tags; an empty list removes all tags.
    fn delete_record_tags(&self, record_type: &str, name: &str, tag_names: &[String])
        -> Result<()>;

    /// Remove the record, cascading tag removal.
    fn delete_record(&self, record_type: &str, name: &str) -> Result<()>;

    /// Snapshot one record.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::ItemNotFound` if no record matches.
    fn get_record(&self, record_type: &str, name: &str, options: &RecordOptions)
        -> Result<Record>;

    /// Read the wallet's metadata blob.
    fn get_metadata(&self) -> Result<String>;

    /// Replace the wallet's metadata blob.
    fn set_metadata(&self, metadata: &str) -> Result<()>;

    /// Evaluate a parsed WQL query against records of `record_type`,
    /// returning matches in record insertion order.
    fn search(&self, record_type: &str, query: &Query, options: &RecordOptions)
        -> Result<Vec<Record>>;

    /// All records of the wallet, every type, in insertion order.
    fn search_all(&self) -> Result<Vec<Record>>;
}
