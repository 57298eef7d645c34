//! Storage backends and the record/tag data model.
//!
//! Two interchangeable realizations of the same backend interface:
//!
//! - [`sqlite`]: persistent relational storage, one database file per
//!   wallet, WQL compiled to parameterized SQL.
//! - [`memory`]: transient in-process storage over concurrent maps, WQL
//!   evaluated directly against tag indices.
//!
//! Both must return identical record sets for identical (query, data)
//! pairs; `tests/cross_backend.rs` holds that contract.

pub mod memory;
pub mod sqlite;
pub mod traits;
pub mod types;

pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;
pub use traits::{StorageBackend, WalletSession};
pub use types::{Record, RecordId, RecordOptions, SearchOptions, Tag};
