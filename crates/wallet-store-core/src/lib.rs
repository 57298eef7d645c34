//! # Wallet Store Core
//!
//! A pluggable record-storage engine for an identity wallet. The engine
//! stores opaque encrypted records keyed by `(type, id)`, associates each
//! record with plaintext and encrypted tags, and answers boolean tag
//! queries written in WQL. The host runtime owns cryptography and call
//! marshalling; this crate only defines what happens once a request
//! arrives.
//!
//! ## Architecture
//!
//! - **provider**: the fixed synchronous, handle-based operation surface
//! - **storage**: the record/tag data model plus two backends — relational
//!   SQLite (persistent, one database file per wallet) and in-memory
//!   (transient, concurrent maps)
//! - **wql**: the query AST, its SQL compiler, and the shared set-algebra
//!   evaluator
//! - **registry**: integer handle allocation and lookup
//!
//! Both backends must return identical record sets for identical
//! (query, data) pairs; that contract is pinned by the cross-backend
//! integration tests.

pub mod error;
pub mod provider;
pub mod registry;
pub mod storage;
pub mod wql;

pub use error::{Result, StorageError};
pub use provider::StorageProvider;
pub use storage::{MemoryBackend, SqliteBackend, StorageBackend, WalletSession};

/// Core version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
