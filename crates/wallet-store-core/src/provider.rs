//! The synchronous operation surface the host runtime calls into.
//!
//! `StorageProvider` is an explicit object owned by whoever registers it
//! with the host; nothing here is a module-level singleton, so several
//! providers (or backends) can coexist in one process.
//!
//! Handles are the engine's resource-ownership contract: `open`,
//! `get_record`, `get_storage_metadata`, `open_search`, and
//! `fetch_search_next` allocate them, and each has a matching free
//! operation. Nothing is reference counted or garbage collected; a handle
//! the caller never frees stays in the registry.
//!
//! Every operation returns `Result<_, StorageError>`; the host marshals
//! `StorageError::code()` as its provider error code.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::error::{Result, StorageError};
use crate::registry::Registry;
use crate::storage::types::{
    options_from_json, tags_from_json, tags_to_json, Record, RecordOptions, SearchOptions,
};
use crate::storage::{StorageBackend, WalletSession};
use crate::wql;

/// A search result materialized once at open time.
///
/// `total` is fixed at open and never changes as the cursor advances;
/// `None` means the caller opted out of counting.
struct SearchCursor {
    records: Vec<Record>,
    position: AtomicUsize,
    total: Option<usize>,
}

/// Handle-based storage provider over a pluggable backend.
pub struct StorageProvider<B: StorageBackend> {
    backend: B,
    sessions: Registry<Arc<B::Session>>,
    records: Registry<Arc<Record>>,
    metadata: Registry<Arc<String>>,
    searches: Registry<Arc<SearchCursor>>,
}

impl<B: StorageBackend> StorageProvider<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            sessions: Registry::new(),
            records: Registry::new(),
            metadata: Registry::new(),
            searches: Registry::new(),
        }
    }

    fn session(&self, handle: i64) -> Result<Arc<B::Session>> {
        self.sessions
            .get(handle)
            .ok_or(StorageError::InvalidHandle(handle))
    }

    fn record(&self, record_handle: i64) -> Result<Arc<Record>> {
        self.records
            .get(record_handle)
            .ok_or(StorageError::InvalidHandle(record_handle))
    }

    fn search(&self, search_handle: i64) -> Result<Arc<SearchCursor>> {
        self.searches
            .get(search_handle)
            .ok_or(StorageError::InvalidHandle(search_handle))
    }

    // --- Wallet lifecycle ---

    pub fn create(
        &self,
        wallet_id: &str,
        config: &str,
        credentials: &str,
        metadata: &str,
    ) -> Result<()> {
        self.backend
            .create_wallet(wallet_id, config, credentials, metadata)
    }

    /// Open a wallet, allocating a storage handle.
    pub fn open(&self, wallet_id: &str, config: &str, credentials: &str) -> Result<i64> {
        let session = self.backend.open_wallet(wallet_id, config, credentials)?;
        let handle = self.sessions.insert(Arc::new(session));
        debug!(wallet_id, handle, "opened wallet");
        Ok(handle)
    }

    /// Release a storage handle. Other open handles to the same wallet are
    /// unaffected, and the wallet's data stays put.
    pub fn close(&self, handle: i64) -> Result<()> {
        self.sessions
            .remove(handle)
            .map(|_| ())
            .ok_or(StorageError::InvalidHandle(handle))
    }

    /// Destroy a wallet. Refused while any session for it is open.
    pub fn delete(&self, wallet_id: &str, config: &str, credentials: &str) -> Result<()> {
        let open = self
            .sessions
            .values()
            .iter()
            .any(|session| session.wallet_id() == wallet_id);
        if open {
            return Err(StorageError::Storage(format!(
                "wallet '{}' is open",
                wallet_id
            )));
        }
        self.backend.delete_wallet(wallet_id, config, credentials)
    }

    // --- Record mutation ---

    pub fn add_record(
        &self,
        handle: i64,
        record_type: &str,
        id: &str,
        value: &[u8],
        tags_json: &str,
    ) -> Result<()> {
        let session = self.session(handle)?;
        let tags = tags_from_json(tags_json)?;
        session.add_record(record_type, id, value, &tags)
    }

    pub fn update_record_value(
        &self,
        handle: i64,
        record_type: &str,
        id: &str,
        value: &[u8],
    ) -> Result<()> {
        self.session(handle)?
            .update_record_value(record_type, id, value)
    }

    pub fn update_record_tags(
        &self,
        handle: i64,
        record_type: &str,
        id: &str,
        tags_json: &str,
    ) -> Result<()> {
        let session = self.session(handle)?;
        let tags = tags_from_json(tags_json)?;
        session.update_record_tags(record_type, id, &tags)
    }

    pub fn add_record_tags(
        &self,
        handle: i64,
        record_type: &str,
        id: &str,
        tags_json: &str,
    ) -> Result<()> {
        let session = self.session(handle)?;
        let tags = tags_from_json(tags_json)?;
        session.add_record_tags(record_type, id, &tags)
    }

    pub fn delete_record_tags(
        &self,
        handle: i64,
        record_type: &str,
        id: &str,
        tag_names_json: &str,
    ) -> Result<()> {
        let session = self.session(handle)?;
        let tag_names = tag_names_from_json(tag_names_json)?;
        session.delete_record_tags(record_type, id, &tag_names)
    }

    pub fn delete_record(&self, handle: i64, record_type: &str, id: &str) -> Result<()> {
        self.session(handle)?.delete_record(record_type, id)
    }

    // --- Record snapshots ---

    /// Snapshot a record into a fresh record handle.
    pub fn get_record(
        &self,
        handle: i64,
        record_type: &str,
        id: &str,
        options_json: &str,
    ) -> Result<i64> {
        let session = self.session(handle)?;
        let options: RecordOptions = options_from_json(options_json)?;
        let record = session.get_record(record_type, id, &options)?;
        Ok(self.records.insert(Arc::new(record)))
    }

    /// The record's caller-supplied external id.
    pub fn get_record_id(&self, handle: i64, record_handle: i64) -> Result<String> {
        self.session(handle)?;
        Ok(self.record(record_handle)?.name.clone())
    }

    pub fn get_record_type(&self, handle: i64, record_handle: i64) -> Result<String> {
        self.session(handle)?;
        self.record(record_handle)?
            .record_type
            .clone()
            .ok_or_else(|| StorageError::Input("record type was not retrieved".to_string()))
    }

    pub fn get_record_value(&self, handle: i64, record_handle: i64) -> Result<Vec<u8>> {
        self.session(handle)?;
        self.record(record_handle)?
            .value
            .clone()
            .ok_or_else(|| StorageError::Input("record value was not retrieved".to_string()))
    }

    /// The record's tags as a JSON object string.
    pub fn get_record_tags(&self, handle: i64, record_handle: i64) -> Result<String> {
        self.session(handle)?;
        let record = self.record(record_handle)?;
        let tags = record
            .tags
            .as_ref()
            .ok_or_else(|| StorageError::Input("record tags were not retrieved".to_string()))?;
        tags_to_json(tags)
    }

    pub fn free_record(&self, handle: i64, record_handle: i64) -> Result<()> {
        self.session(handle)?;
        self.records
            .remove(record_handle)
            .map(|_| ())
            .ok_or(StorageError::InvalidHandle(record_handle))
    }

    // --- Wallet metadata ---

    /// Read the wallet's metadata blob, allocating a metadata handle the
    /// caller must free.
    pub fn get_storage_metadata(&self, handle: i64) -> Result<(String, i64)> {
        let metadata = self.session(handle)?.get_metadata()?;
        let metadata_handle = self.metadata.insert(Arc::new(metadata.clone()));
        Ok((metadata, metadata_handle))
    }

    pub fn set_storage_metadata(&self, handle: i64, metadata: &str) -> Result<()> {
        self.session(handle)?.set_metadata(metadata)
    }

    pub fn free_storage_metadata(&self, handle: i64, metadata_handle: i64) -> Result<()> {
        self.session(handle)?;
        self.metadata
            .remove(metadata_handle)
            .map(|_| ())
            .ok_or(StorageError::InvalidHandle(metadata_handle))
    }

    // --- Search ---

    /// Parse and evaluate a WQL query, materializing the full result list
    /// once; returns a search handle positioned before the first match.
    pub fn open_search(
        &self,
        handle: i64,
        record_type: &str,
        query_json: &str,
        options_json: &str,
    ) -> Result<i64> {
        let session = self.session(handle)?;
        let options: SearchOptions = options_from_json(options_json)?;
        let query = wql::parse_str(query_json)?;

        let matches = session.search(record_type, &query, &options.record_options())?;
        let total = options.retrieve_total_count.then_some(matches.len());
        let records = if options.retrieve_records {
            matches
        } else {
            Vec::new()
        };

        debug!(handle, record_type, ?total, "opened search");
        Ok(self.searches.insert(Arc::new(SearchCursor {
            records,
            position: AtomicUsize::new(0),
            total,
        })))
    }

    /// Search with the implicit match-everything query, across all types.
    pub fn open_search_all(&self, handle: i64) -> Result<i64> {
        let session = self.session(handle)?;
        let records = session.search_all()?;
        let total = Some(records.len());
        Ok(self.searches.insert(Arc::new(SearchCursor {
            records,
            position: AtomicUsize::new(0),
            total,
        })))
    }

    /// Materialized match count; stable regardless of cursor position.
    pub fn get_search_total_count(&self, handle: i64, search_handle: i64) -> Result<usize> {
        self.session(handle)?;
        self.search(search_handle)?
            .total
            .ok_or_else(|| StorageError::Input("total count was not retrieved".to_string()))
    }

    /// Advance the cursor, snapshotting the next match into a fresh,
    /// independent record handle.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::ItemNotFound` once the cursor is exhausted.
    pub fn fetch_search_next(&self, handle: i64, search_handle: i64) -> Result<i64> {
        self.session(handle)?;
        let cursor = self.search(search_handle)?;

        let position = cursor.position.fetch_add(1, Ordering::SeqCst);
        let record = cursor
            .records
            .get(position)
            .ok_or(StorageError::ItemNotFound)?;
        Ok(self.records.insert(Arc::new(record.clone())))
    }

    pub fn free_search(&self, handle: i64, search_handle: i64) -> Result<()> {
        self.session(handle)?;
        self.searches
            .remove(search_handle)
            .map(|_| ())
            .ok_or(StorageError::InvalidHandle(search_handle))
    }
}

/// Parse a tag-name list JSON document (an array of strings).
fn tag_names_from_json(json: &str) -> Result<Vec<String>> {
    let value: serde_json::Value = serde_json::from_str(json)?;
    let items = value
        .as_array()
        .ok_or_else(|| StorageError::Input("tag names must be a JSON array".to_string()))?;
    items
        .iter()
        .map(|item| {
            item.as_str()
                .map(str::to_string)
                .ok_or_else(|| StorageError::Input("tag names must be strings".to_string()))
        })
        .collect()
}
