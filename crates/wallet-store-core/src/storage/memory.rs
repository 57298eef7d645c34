//! Transient in-memory wallet storage.
//!
//! Per wallet: a record map keyed by ascending record id (so iteration
//! order is insertion order) plus two `(name, value) -> id set` tag
//! indices, one per tag class. WQL runs through the shared evaluator in
//! `crate::wql::eval`; only clause resolution is backend-specific.
//!
//! Every wallet sits behind its own `RwLock`, held for the whole span of a
//! mutation. A reader therefore never observes a record without its tags
//! mid-mutation, and wallets never contend with each other.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use dashmap::DashMap;
use tracing::debug;

use crate::error::{Result, StorageError};
use crate::wql::eval::{evaluate, value_matches, ClauseResolver};
use crate::wql::{CompareOp, Query, TagClause};

use super::traits::{StorageBackend, WalletSession};
use super::types::{validate_wallet_id, Record, RecordId, RecordOptions, Tag};

#[derive(Debug, Clone)]
struct StoredRecord {
    record_type: String,
    name: String,
    value: Vec<u8>,
    tags: Vec<Tag>,
}

#[derive(Debug, Default)]
struct WalletState {
    metadata: String,
    next_id: RecordId,
    records: BTreeMap<RecordId, StoredRecord>,
    /// (type, name) -> record id; enforces the live-record uniqueness
    /// invariant.
    names: HashMap<(String, String), RecordId>,
    /// (tag name, tag value) -> record ids, per tag class.
    plaintext: HashMap<(String, String), BTreeSet<RecordId>>,
    encrypted: HashMap<(String, String), BTreeSet<RecordId>>,
}

impl WalletState {
    fn record_id(&self, record_type: &str, name: &str) -> Result<RecordId> {
        self.names
            .get(&(record_type.to_string(), name.to_string()))
            .copied()
            .ok_or(StorageError::ItemNotFound)
    }

    fn index_of(&mut self, plaintext: bool) -> &mut HashMap<(String, String), BTreeSet<RecordId>> {
        if plaintext {
            &mut self.plaintext
        } else {
            &mut self.encrypted
        }
    }

    fn index_tag(&mut self, id: RecordId, tag: &Tag) {
        self.index_of(tag.is_plaintext())
            .entry((tag.name.clone(), tag.value.clone()))
            .or_default()
            .insert(id);
    }

    fn unindex_tag(&mut self, id: RecordId, tag: &Tag) {
        let index = self.index_of(tag.is_plaintext());
        let key = (tag.name.clone(), tag.value.clone());
        if let Some(ids) = index.get_mut(&key) {
            ids.remove(&id);
            if ids.is_empty() {
                index.remove(&key);
            }
        }
    }

    fn snapshot(&self, record: &StoredRecord, options: &RecordOptions) -> Record {
        Record {
            name: record.name.clone(),
            record_type: options.retrieve_type.then(|| record.record_type.clone()),
            value: options.retrieve_value.then(|| record.value.clone()),
            tags: options.retrieve_tags.then(|| record.tags.clone()),
        }
    }
}

/// Transient storage backend over concurrent maps.
pub struct MemoryBackend {
    wallets: DashMap<String, Arc<RwLock<WalletState>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            wallets: DashMap::new(),
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageBackend for MemoryBackend {
    type Session = MemorySession;

    fn create_wallet(
        &self,
        wallet_id: &str,
        _config: &str,
        _credentials: &str,
        metadata: &str,
    ) -> Result<()> {
        validate_wallet_id(wallet_id)?;

        match self.wallets.entry(wallet_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(StorageError::AlreadyExists(wallet_id.to_string()))
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(Arc::new(RwLock::new(WalletState {
                    metadata: metadata.to_string(),
                    next_id: 1,
                    ..WalletState::default()
                })));
                debug!(wallet_id, "created in-memory wallet");
                Ok(())
            }
        }
    }

    fn open_wallet(
        &self,
        wallet_id: &str,
        _config: &str,
        _credentials: &str,
    ) -> Result<MemorySession> {
        validate_wallet_id(wallet_id)?;

        let state = self
            .wallets
            .get(wallet_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| StorageError::NotFound(wallet_id.to_string()))?;

        Ok(MemorySession {
            wallet_id: wallet_id.to_string(),
            state,
        })
    }

    fn delete_wallet(&self, wallet_id: &str, _config: &str, _credentials: &str) -> Result<()> {
        validate_wallet_id(wallet_id)?;

        if self.wallets.remove(wallet_id).is_none() {
            return Err(StorageError::Storage(format!(
                "wallet '{}' does not exist",
                wallet_id
            )));
        }
        debug!(wallet_id, "deleted in-memory wallet");
        Ok(())
    }
}

/// One open in-memory wallet.
#[derive(Debug)]
pub struct MemorySession {
    wallet_id: String,
    state: Arc<RwLock<WalletState>>,
}

impl MemorySession {
    fn read_state(&self) -> Result<RwLockReadGuard<'_, WalletState>> {
        self.state
            .read()
            .map_err(|_| StorageError::Storage("wallet state poisoned".to_string()))
    }

    fn write_state(&self) -> Result<RwLockWriteGuard<'_, WalletState>> {
        self.state
            .write()
            .map_err(|_| StorageError::Storage("wallet state poisoned".to_string()))
    }
}

/// Clause resolution over one wallet's tag indices, restricted to the
/// queried type's candidate universe.
struct TypeResolver<'a> {
    state: &'a WalletState,
    universe: BTreeSet<RecordId>,
}

impl<'a> TypeResolver<'a> {
    fn new(state: &'a WalletState, record_type: &str) -> Self {
        let universe = state
            .records
            .iter()
            .filter(|(_, record)| record.record_type == record_type)
            .map(|(id, _)| *id)
            .collect();
        Self { state, universe }
    }

    fn index(&self, plaintext: bool) -> &HashMap<(String, String), BTreeSet<RecordId>> {
        if plaintext {
            &self.state.plaintext
        } else {
            &self.state.encrypted
        }
    }

    fn lookup(&self, plaintext: bool, name: &str, value: &str) -> BTreeSet<RecordId> {
        self.index(plaintext)
            .get(&(name.to_string(), value.to_string()))
            .map(|ids| ids.intersection(&self.universe).copied().collect())
            .unwrap_or_default()
    }
}

impl ClauseResolver for TypeResolver<'_> {
    fn universe(&self) -> Result<BTreeSet<RecordId>> {
        Ok(self.universe.clone())
    }

    fn resolve(&self, clause: &TagClause) -> Result<BTreeSet<RecordId>> {
        let plaintext = clause.is_plaintext();
        match &clause.op {
            // Point lookups go straight to the index slice.
            CompareOp::Eq(value) => Ok(self.lookup(plaintext, &clause.name, value)),
            CompareOp::In(values) => {
                let mut matched = BTreeSet::new();
                for value in values {
                    matched.extend(self.lookup(plaintext, &clause.name, value));
                }
                Ok(matched)
            }
            // Everything else scans the slices under the tag name.
            _ => {
                let mut matched = BTreeSet::new();
                for ((name, value), ids) in self.index(plaintext) {
                    if name != &clause.name {
                        continue;
                    }
                    let in_universe: BTreeSet<RecordId> =
                        ids.intersection(&self.universe).copied().collect();
                    if in_universe.is_empty() {
                        continue;
                    }
                    // May fail the whole query for ordering operators on a
                    // non-integer stored value; that is the contract.
                    if value_matches(clause, value)? {
                        matched.extend(in_universe);
                    }
                }
                Ok(matched)
            }
        }
    }
}

impl WalletSession for MemorySession {
    fn wallet_id(&self) -> &str {
        &self.wallet_id
    }

    fn add_record(&self, record_type: &str, name: &str, value: &[u8], tags: &[Tag]) -> Result<()> {
        let mut state = self.write_state()?;

        let key = (record_type.to_string(), name.to_string());
        if state.names.contains_key(&key) {
            return Err(StorageError::ItemAlreadyExists(format!(
                "({}, {})",
                record_type, name
            )));
        }

        let id = state.next_id;
        state.next_id += 1;
        state.records.insert(
            id,
            StoredRecord {
                record_type: record_type.to_string(),
                name: name.to_string(),
                value: value.to_vec(),
                tags: tags.to_vec(),
            },
        );
        state.names.insert(key, id);
        for tag in tags {
            state.index_tag(id, tag);
        }
        Ok(())
    }

    fn update_record_value(&self, record_type: &str, name: &str, value: &[u8]) -> Result<()> {
        let mut state = self.write_state()?;
        let id = state.record_id(record_type, name)?;
        let record = state
            .records
            .get_mut(&id)
            .ok_or_else(|| StorageError::InvalidState(format!("record {} unindexed", id)))?;
        record.value = value.to_vec();
        Ok(())
    }

    fn update_record_tags(&self, record_type: &str, name: &str, tags: &[Tag]) -> Result<()> {
        let mut state = self.write_state()?;
        let id = state.record_id(record_type, name)?;

        let old_tags = match state.records.get_mut(&id) {
            Some(record) => std::mem::replace(&mut record.tags, tags.to_vec()),
            None => {
                return Err(StorageError::InvalidState(format!(
                    "record {} unindexed",
                    id
                )))
            }
        };
        for tag in &old_tags {
            state.unindex_tag(id, tag);
        }
        for tag in tags {
            state.index_tag(id, tag);
        }
        Ok(())
    }

    fn add_record_tags(&self, record_type: &str, name: &str, tags: &[Tag]) -> Result<()> {
        let mut state = self.write_state()?;
        let id = state.record_id(record_type, name)?;

        // Merge: a new tag overwrites an existing tag of the same name.
        let mut replaced = Vec::new();
        let record = state
            .records
            .get_mut(&id)
            .ok_or_else(|| StorageError::InvalidState(format!("record {} unindexed", id)))?;
        for tag in tags {
            if let Some(position) = record.tags.iter().position(|t| t.name == tag.name) {
                replaced.push(record.tags.remove(position));
            }
            record.tags.push(tag.clone());
        }
        for tag in &replaced {
            state.unindex_tag(id, tag);
        }
        for tag in tags {
            state.index_tag(id, tag);
        }
        Ok(())
    }

    fn delete_record_tags(
        &self,
        record_type: &str,
        name: &str,
        tag_names: &[String],
    ) -> Result<()> {
        let mut state = self.write_state()?;
        let id = state.record_id(record_type, name)?;

        let removed = {
            let record = state
                .records
                .get_mut(&id)
                .ok_or_else(|| StorageError::InvalidState(format!("record {} unindexed", id)))?;
            if tag_names.is_empty() {
                // Empty list clears all tags.
                std::mem::take(&mut record.tags)
            } else {
                let mut removed = Vec::new();
                record.tags.retain(|tag| {
                    if tag_names.contains(&tag.name) {
                        removed.push(tag.clone());
                        false
                    } else {
                        true
                    }
                });
                removed
            }
        };
        for tag in &removed {
            state.unindex_tag(id, tag);
        }
        Ok(())
    }

    fn delete_record(&self, record_type: &str, name: &str) -> Result<()> {
        let mut state = self.write_state()?;
        let id = state.record_id(record_type, name)?;

        let record = state
            .records
            .remove(&id)
            .ok_or_else(|| StorageError::InvalidState(format!("record {} unindexed", id)))?;
        state
            .names
            .remove(&(record.record_type.clone(), record.name.clone()));
        for tag in &record.tags {
            state.unindex_tag(id, tag);
        }
        Ok(())
    }

    fn get_record(
        &self,
        record_type: &str,
        name: &str,
        options: &RecordOptions,
    ) -> Result<Record> {
        let state = self.read_state()?;
        let id = state.record_id(record_type, name)?;
        let record = state
            .records
            .get(&id)
            .ok_or_else(|| StorageError::InvalidState(format!("record {} unindexed", id)))?;
        Ok(state.snapshot(record, options))
    }

    fn get_metadata(&self) -> Result<String> {
        Ok(self.read_state()?.metadata.clone())
    }

    fn set_metadata(&self, metadata: &str) -> Result<()> {
        self.write_state()?.metadata = metadata.to_string();
        Ok(())
    }

    fn search(
        &self,
        record_type: &str,
        query: &Query,
        options: &RecordOptions,
    ) -> Result<Vec<Record>> {
        let state = self.read_state()?;
        let resolver = TypeResolver::new(&state, record_type);
        let matched = evaluate(&resolver, query)?;

        let mut records = Vec::with_capacity(matched.len());
        for id in matched {
            let record = state
                .records
                .get(&id)
                .ok_or_else(|| StorageError::InvalidState(format!("record {} unindexed", id)))?;
            records.push(state.snapshot(record, options));
        }
        Ok(records)
    }

    fn search_all(&self) -> Result<Vec<Record>> {
        let state = self.read_state()?;
        let options = RecordOptions::default();
        Ok(state
            .records
            .values()
            .map(|record| state.snapshot(record, &options))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wql::parse_str;

    fn open_fixture(backend: &MemoryBackend) -> MemorySession {
        backend
            .create_wallet("w1", "", "", "meta")
            .expect("create should succeed");
        backend.open_wallet("w1", "", "").expect("open should succeed")
    }

    #[test]
    fn test_create_twice_fails() {
        let backend = MemoryBackend::new();
        backend.create_wallet("w1", "", "", "meta").unwrap();
        let err = backend.create_wallet("w1", "", "", "meta").unwrap_err();
        assert_eq!(err.code(), 102);
    }

    #[test]
    fn test_open_missing_wallet_fails() {
        let backend = MemoryBackend::new();
        let err = backend.open_wallet("nope", "", "").unwrap_err();
        assert_eq!(err.code(), 103);
    }

    #[test]
    fn test_add_and_get_round_trip() {
        let backend = MemoryBackend::new();
        let session = open_fixture(&backend);

        let tags = vec![Tag::new("~plain", "a"), Tag::new("enc", "b")];
        session
            .add_record("schema", "s1", b"v1", &tags)
            .expect("add should succeed");

        let record = session
            .get_record("schema", "s1", &RecordOptions::default())
            .expect("get should succeed");
        assert_eq!(record.name, "s1");
        assert_eq!(record.value.as_deref(), Some(&b"v1"[..]));
        let mut got = record.tags.expect("tags retrieved");
        got.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(got, vec![Tag::new("enc", "b"), Tag::new("~plain", "a")]);
    }

    #[test]
    fn test_tag_merge_overwrites_same_name() {
        let backend = MemoryBackend::new();
        let session = open_fixture(&backend);
        session
            .add_record("t", "r", b"v", &[Tag::new("~a", "1")])
            .unwrap();
        session
            .add_record_tags("t", "r", &[Tag::new("~a", "2"), Tag::new("~b", "3")])
            .unwrap();

        let record = session
            .get_record("t", "r", &RecordOptions::default())
            .unwrap();
        let tags = record.tags.unwrap();
        assert_eq!(tags.len(), 2);
        assert!(tags.contains(&Tag::new("~a", "2")));

        // The index no longer matches the old value.
        let query = parse_str(r#"{"~a": "1"}"#).unwrap();
        let hits = session
            .search("t", &query, &RecordOptions::default())
            .unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn test_delete_record_unindexes_tags() {
        let backend = MemoryBackend::new();
        let session = open_fixture(&backend);
        session
            .add_record("t", "r", b"v", &[Tag::new("~a", "1")])
            .unwrap();
        session.delete_record("t", "r").unwrap();

        assert_eq!(
            session
                .get_record("t", "r", &RecordOptions::default())
                .unwrap_err()
                .code(),
            104
        );
        let query = parse_str(r#"{"~a": "1"}"#).unwrap();
        assert!(session
            .search("t", &query, &RecordOptions::default())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_search_is_type_scoped_and_ordered() {
        let backend = MemoryBackend::new();
        let session = open_fixture(&backend);
        session
            .add_record("a", "r1", b"1", &[Tag::new("~x", "1")])
            .unwrap();
        session
            .add_record("b", "r2", b"2", &[Tag::new("~x", "1")])
            .unwrap();
        session
            .add_record("a", "r3", b"3", &[Tag::new("~x", "1")])
            .unwrap();

        let query = parse_str(r#"{"~x": "1"}"#).unwrap();
        let hits = session
            .search("a", &query, &RecordOptions::default())
            .unwrap();
        let names: Vec<&str> = hits.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["r1", "r3"]);
    }

    #[test]
    fn test_metadata_round_trip() {
        let backend = MemoryBackend::new();
        let session = open_fixture(&backend);
        assert_eq!(session.get_metadata().unwrap(), "meta");
        session.set_metadata("meta2").unwrap();
        assert_eq!(session.get_metadata().unwrap(), "meta2");
    }
}
