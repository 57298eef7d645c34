//! Relational wallet storage over SQLite.
//!
//! Each wallet maps to its own database file under the configured base
//! directory — SQLite's equivalent of a schema per wallet. That keeps
//! wallets fully partitioned on disk and lets writes to different wallets
//! proceed without sharing a connection or a lock.
//!
//! Wallet ids are validated against the identifier whitelist before any
//! path is built. Inside a wallet database the four-table layout is fixed:
//! `metadata`, `items`, `tags_encrypted`, `tags_plaintext`, with tag rows
//! cascading on item deletion. Every multi-table mutation runs in a single
//! transaction.

use std::fs;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension};
use serde::Deserialize;
use tracing::debug;

use crate::error::{Result, StorageError};
use crate::wql::sql::{compile, SqlFilter};
use crate::wql::Query;

use super::traits::{StorageBackend, WalletSession};
use super::types::{validate_wallet_id, Record, RecordId, RecordOptions, Tag};

/// Backend configuration, deserialized from the caller's config JSON.
#[derive(Debug, Clone, Deserialize)]
pub struct SqliteConfig {
    /// Base directory holding one `<wallet_id>.db` file per wallet.
    pub path: PathBuf,
}

impl SqliteConfig {
    fn from_json(config: &str) -> Result<Self> {
        if config.trim().is_empty() {
            return Err(StorageError::Input(
                "sqlite backend requires a config with a 'path'".to_string(),
            ));
        }
        serde_json::from_str(config)
            .map_err(|e| StorageError::Input(format!("invalid config JSON: {}", e)))
    }

    fn wallet_path(&self, wallet_id: &str) -> PathBuf {
        self.path.join(format!("{}.db", wallet_id))
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS metadata (
    wallet_id TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS items (
    wallet_id TEXT NOT NULL,
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    type TEXT NOT NULL,
    name TEXT NOT NULL,
    value BLOB NOT NULL,
    key TEXT NOT NULL DEFAULT '',

    UNIQUE(wallet_id, type, name)
);

CREATE TABLE IF NOT EXISTS tags_encrypted (
    wallet_id TEXT NOT NULL,
    name TEXT NOT NULL,
    value TEXT NOT NULL,
    item_id INTEGER NOT NULL REFERENCES items(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS ix_tags_encrypted_name ON tags_encrypted (name, value);
CREATE INDEX IF NOT EXISTS ix_tags_encrypted_item ON tags_encrypted (item_id);

CREATE TABLE IF NOT EXISTS tags_plaintext (
    wallet_id TEXT NOT NULL,
    name TEXT NOT NULL,
    value TEXT NOT NULL,
    item_id INTEGER NOT NULL REFERENCES items(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS ix_tags_plaintext_name ON tags_plaintext (name, value);
CREATE INDEX IF NOT EXISTS ix_tags_plaintext_item ON tags_plaintext (item_id);
"#;

/// Persistent SQLite storage backend.
pub struct SqliteBackend;

impl SqliteBackend {
    pub fn new() -> Self {
        Self
    }

    fn open_connection(path: &PathBuf) -> Result<Connection> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        // Same-wallet writers queue on the file lock instead of failing;
        // the engine itself has no timeout policy.
        conn.busy_timeout(Duration::from_secs(3600))?;
        Ok(conn)
    }
}

impl Default for SqliteBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageBackend for SqliteBackend {
    type Session = SqliteSession;

    fn create_wallet(
        &self,
        wallet_id: &str,
        config: &str,
        _credentials: &str,
        metadata: &str,
    ) -> Result<()> {
        validate_wallet_id(wallet_id)?;
        let config = SqliteConfig::from_json(config)?;
        fs::create_dir_all(&config.path)?;

        let path = config.wallet_path(wallet_id);
        if path.exists() {
            return Err(StorageError::AlreadyExists(wallet_id.to_string()));
        }

        let conn = Self::open_connection(&path)?;
        conn.execute_batch(SCHEMA)?;

        let existing: Option<String> = conn
            .query_row(
                "SELECT value FROM metadata WHERE wallet_id = ?",
                [wallet_id],
                |row| row.get(0),
            )
            .optional()?;
        if existing.is_some() {
            return Err(StorageError::AlreadyExists(wallet_id.to_string()));
        }

        conn.execute(
            "INSERT INTO metadata (wallet_id, value) VALUES (?, ?)",
            (wallet_id, metadata),
        )?;

        debug!(wallet_id, "created sqlite wallet");
        Ok(())
    }

    fn open_wallet(
        &self,
        wallet_id: &str,
        config: &str,
        _credentials: &str,
    ) -> Result<SqliteSession> {
        validate_wallet_id(wallet_id)?;
        let config = SqliteConfig::from_json(config)?;

        let path = config.wallet_path(wallet_id);
        if !path.exists() {
            return Err(StorageError::NotFound(wallet_id.to_string()));
        }

        let conn = Self::open_connection(&path)?;
        let metadata: Option<String> = conn
            .query_row(
                "SELECT value FROM metadata WHERE wallet_id = ?",
                [wallet_id],
                |row| row.get(0),
            )
            .optional()?;
        if metadata.is_none() {
            return Err(StorageError::NotFound(wallet_id.to_string()));
        }

        Ok(SqliteSession {
            wallet_id: wallet_id.to_string(),
            conn: Mutex::new(conn),
        })
    }

    fn delete_wallet(&self, wallet_id: &str, config: &str, _credentials: &str) -> Result<()> {
        validate_wallet_id(wallet_id)?;
        let config = SqliteConfig::from_json(config)?;

        let path = config.wallet_path(wallet_id);
        if !path.exists() {
            return Err(StorageError::Storage(format!(
                "wallet '{}' does not exist",
                wallet_id
            )));
        }

        // Metadata, records, and tags live in one file; removing it is the
        // single logical delete. WAL side files go with it.
        fs::remove_file(&path)?;
        for suffix in ["-wal", "-shm"] {
            let mut side = path.clone().into_os_string();
            side.push(suffix);
            let _ = fs::remove_file(PathBuf::from(side));
        }

        debug!(wallet_id, "deleted sqlite wallet");
        Ok(())
    }
}

/// One open wallet database.
#[derive(Debug)]
pub struct SqliteSession {
    wallet_id: String,
    conn: Mutex<Connection>,
}

impl SqliteSession {
    /// Lock the connection, returning an error if the mutex is poisoned.
    fn lock_conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StorageError::Storage("SQLite connection poisoned".to_string()))
    }

    /// Resolve `(type, name)` to the unique record id.
    ///
    /// Zero rows is `ItemNotFound`; more than one row would mean the
    /// uniqueness invariant is broken and surfaces as `InvalidState`.
    fn record_id(&self, conn: &Connection, record_type: &str, name: &str) -> Result<RecordId> {
        let mut stmt =
            conn.prepare("SELECT id FROM items WHERE wallet_id = ? AND type = ? AND name = ?")?;
        let mut rows = stmt.query((self.wallet_id.as_str(), record_type, name))?;

        let first: RecordId = match rows.next()? {
            Some(row) => row.get(0)?,
            None => return Err(StorageError::ItemNotFound),
        };
        if rows.next()?.is_some() {
            return Err(StorageError::InvalidState(format!(
                "multiple records for ({}, {})",
                record_type, name
            )));
        }
        Ok(first)
    }

    fn insert_tags(&self, conn: &Connection, item_id: RecordId, tags: &[Tag]) -> Result<()> {
        for tag in tags {
            let table = if tag.is_plaintext() {
                "tags_plaintext"
            } else {
                "tags_encrypted"
            };
            conn.execute(
                &format!(
                    "INSERT INTO {} (wallet_id, name, value, item_id) VALUES (?, ?, ?, ?)",
                    table
                ),
                (
                    self.wallet_id.as_str(),
                    tag.name.as_str(),
                    tag.value.as_str(),
                    item_id,
                ),
            )?;
        }
        Ok(())
    }

    fn load_tags(&self, conn: &Connection, item_id: RecordId) -> Result<Vec<Tag>> {
        let mut tags = Vec::new();
        for table in ["tags_plaintext", "tags_encrypted"] {
            let mut stmt = conn.prepare(&format!(
                "SELECT name, value FROM {} WHERE item_id = ?",
                table
            ))?;
            let rows = stmt.query_map([item_id], |row| {
                Ok(Tag::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            for row in rows {
                tags.push(row?);
            }
        }
        Ok(tags)
    }

    /// The SQL path cannot raise from inside a `WHERE` fragment, so before
    /// running a query with ordering operators we check that every stored
    /// value under the queried tag names (within this type's universe) is a
    /// canonical integer — the same rule the in-memory evaluator enforces.
    fn validate_numeric_tags(
        &self,
        conn: &Connection,
        record_type: &str,
        numeric_tags: &[String],
    ) -> Result<()> {
        for tag_name in numeric_tags {
            let invalid: i64 = conn.query_row(
                "SELECT COUNT(*) FROM tags_plaintext t \
                 JOIN items i ON i.id = t.item_id \
                 WHERE i.wallet_id = ? AND i.type = ? AND t.name = ? \
                   AND CAST(CAST(t.value AS INTEGER) AS TEXT) != t.value",
                (self.wallet_id.as_str(), record_type, tag_name.as_str()),
                |row| row.get(0),
            )?;
            if invalid > 0 {
                return Err(StorageError::Query(format!(
                    "tag '{}' has non-integer values",
                    tag_name
                )));
            }
        }
        Ok(())
    }

    fn record_from_row(
        &self,
        conn: &Connection,
        id: RecordId,
        record_type: &str,
        name: String,
        value: Vec<u8>,
        options: &RecordOptions,
    ) -> Result<Record> {
        Ok(Record {
            name,
            record_type: options.retrieve_type.then(|| record_type.to_string()),
            value: options.retrieve_value.then_some(value),
            tags: if options.retrieve_tags {
                Some(self.load_tags(conn, id)?)
            } else {
                None
            },
        })
    }
}

impl WalletSession for SqliteSession {
    fn wallet_id(&self) -> &str {
        &self.wallet_id
    }

    fn add_record(&self, record_type: &str, name: &str, value: &[u8], tags: &[Tag]) -> Result<()> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;

        let existing: Option<RecordId> = tx
            .query_row(
                "SELECT id FROM items WHERE wallet_id = ? AND type = ? AND name = ?",
                (self.wallet_id.as_str(), record_type, name),
                |row| row.get(0),
            )
            .optional()?;
        if existing.is_some() {
            return Err(StorageError::ItemAlreadyExists(format!(
                "({}, {})",
                record_type, name
            )));
        }

        // A concurrent session can slip past the probe above; the UNIQUE
        // constraint on (wallet_id, type, name) is the arbiter then.
        tx.execute(
            "INSERT INTO items (wallet_id, type, name, value, key) VALUES (?, ?, ?, ?, '')",
            (self.wallet_id.as_str(), record_type, name, value),
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(failure, _)
                if failure.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                StorageError::ItemAlreadyExists(format!("({}, {})", record_type, name))
            }
            other => other.into(),
        })?;
        let item_id = tx.last_insert_rowid();
        self.insert_tags(&tx, item_id, tags)?;

        tx.commit()?;
        Ok(())
    }

    fn update_record_value(&self, record_type: &str, name: &str, value: &[u8]) -> Result<()> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;

        let id = self.record_id(&tx, record_type, name)?;
        tx.execute("UPDATE items SET value = ? WHERE id = ?", (value, id))?;

        tx.commit()?;
        Ok(())
    }

    fn update_record_tags(&self, record_type: &str, name: &str, tags: &[Tag]) -> Result<()> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;

        let id = self.record_id(&tx, record_type, name)?;
        tx.execute("DELETE FROM tags_plaintext WHERE item_id = ?", [id])?;
        tx.execute("DELETE FROM tags_encrypted WHERE item_id = ?", [id])?;
        self.insert_tags(&tx, id, tags)?;

        tx.commit()?;
        Ok(())
    }

    fn add_record_tags(&self, record_type: &str, name: &str, tags: &[Tag]) -> Result<()> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;

        let id = self.record_id(&tx, record_type, name)?;
        for tag in tags {
            let table = if tag.is_plaintext() {
                "tags_plaintext"
            } else {
                "tags_encrypted"
            };
            tx.execute(
                &format!("DELETE FROM {} WHERE item_id = ? AND name = ?", table),
                (id, tag.name.as_str()),
            )?;
        }
        self.insert_tags(&tx, id, tags)?;

        tx.commit()?;
        Ok(())
    }

    fn delete_record_tags(
        &self,
        record_type: &str,
        name: &str,
        tag_names: &[String],
    ) -> Result<()> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;

        let id = self.record_id(&tx, record_type, name)?;
        if tag_names.is_empty() {
            tx.execute("DELETE FROM tags_plaintext WHERE item_id = ?", [id])?;
            tx.execute("DELETE FROM tags_encrypted WHERE item_id = ?", [id])?;
        } else {
            for tag_name in tag_names {
                let table = if tag_name.starts_with('~') {
                    "tags_plaintext"
                } else {
                    "tags_encrypted"
                };
                tx.execute(
                    &format!("DELETE FROM {} WHERE item_id = ? AND name = ?", table),
                    (id, tag_name.as_str()),
                )?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    fn delete_record(&self, record_type: &str, name: &str) -> Result<()> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;

        let id = self.record_id(&tx, record_type, name)?;
        // Tag rows cascade via the item_id foreign keys.
        tx.execute("DELETE FROM items WHERE id = ?", [id])?;

        tx.commit()?;
        Ok(())
    }

    fn get_record(
        &self,
        record_type: &str,
        name: &str,
        options: &RecordOptions,
    ) -> Result<Record> {
        let conn = self.lock_conn()?;

        let id = self.record_id(&conn, record_type, name)?;
        let value: Vec<u8> =
            conn.query_row("SELECT value FROM items WHERE id = ?", [id], |row| {
                row.get(0)
            })?;

        self.record_from_row(&conn, id, record_type, name.to_string(), value, options)
    }

    fn get_metadata(&self) -> Result<String> {
        let conn = self.lock_conn()?;
        let metadata: Option<String> = conn
            .query_row(
                "SELECT value FROM metadata WHERE wallet_id = ?",
                [self.wallet_id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        metadata.ok_or_else(|| {
            StorageError::InvalidState(format!("metadata row missing for '{}'", self.wallet_id))
        })
    }

    fn set_metadata(&self, metadata: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        let updated = conn.execute(
            "UPDATE metadata SET value = ? WHERE wallet_id = ?",
            (metadata, self.wallet_id.as_str()),
        )?;
        if updated == 0 {
            return Err(StorageError::InvalidState(format!(
                "metadata row missing for '{}'",
                self.wallet_id
            )));
        }
        Ok(())
    }

    fn search(
        &self,
        record_type: &str,
        query: &Query,
        options: &RecordOptions,
    ) -> Result<Vec<Record>> {
        let SqlFilter {
            fragment,
            params,
            numeric_tags,
        } = compile(query)?;

        let conn = self.lock_conn()?;
        self.validate_numeric_tags(&conn, record_type, &numeric_tags)?;

        let sql = format!(
            "SELECT i.id, i.name, i.value FROM items i \
             WHERE i.wallet_id = ? AND i.type = ? AND ({}) \
             ORDER BY i.id",
            fragment
        );
        let mut bound: Vec<&str> = vec![self.wallet_id.as_str(), record_type];
        bound.extend(params.iter().map(String::as_str));

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(bound), |row| {
            Ok((
                row.get::<_, RecordId>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Vec<u8>>(2)?,
            ))
        })?;

        let mut matches = Vec::new();
        for row in rows {
            matches.push(row?);
        }
        drop(stmt);

        let mut records = Vec::with_capacity(matches.len());
        for (id, name, value) in matches {
            records.push(self.record_from_row(&conn, id, record_type, name, value, options)?);
        }
        Ok(records)
    }

    fn search_all(&self) -> Result<Vec<Record>> {
        let conn = self.lock_conn()?;

        let mut stmt = conn.prepare(
            "SELECT id, type, name, value FROM items WHERE wallet_id = ? ORDER BY id",
        )?;
        let rows = stmt.query_map([self.wallet_id.as_str()], |row| {
            Ok((
                row.get::<_, RecordId>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Vec<u8>>(3)?,
            ))
        })?;

        let mut matches = Vec::new();
        for row in rows {
            matches.push(row?);
        }
        drop(stmt);

        let options = RecordOptions::default();
        let mut records = Vec::with_capacity(matches.len());
        for (id, record_type, name, value) in matches {
            records.push(self.record_from_row(&conn, id, &record_type, name, value, &options)?);
        }
        Ok(records)
    }
}
