//! The primary cross-backend contract: for identical (query, data) pairs,
//! the relational and in-memory backends return identical record sets.

use tempfile::TempDir;

use wallet_store_core::storage::types::{RecordOptions, Tag};
use wallet_store_core::storage::{MemoryBackend, SqliteBackend, StorageBackend, WalletSession};
use wallet_store_core::wql;
use wallet_store_core::Result;

/// Records seeded identically into both backends.
///
/// `r4` has no `~grade` tag at all, which exercises `$not` complement
/// semantics; `enc` is an encrypted-class tag.
fn seed(session: &impl WalletSession) {
    let rows: &[(&str, &[(&str, &str)])] = &[
        ("r1", &[("~grade", "1"), ("~color", "red"), ("enc", "aa")]),
        ("r2", &[("~grade", "2"), ("~color", "red"), ("enc", "bb")]),
        ("r3", &[("~grade", "3"), ("~color", "blue"), ("enc", "aa")]),
        ("r4", &[("~color", "green-ish")]),
    ];
    for (name, tags) in rows {
        let tags: Vec<Tag> = tags.iter().map(|(n, v)| Tag::new(*n, *v)).collect();
        session
            .add_record("cred", name, name.as_bytes(), &tags)
            .expect("seed add should succeed");
    }
    // A different type sharing tag names must never leak into results.
    session
        .add_record("other", "x1", b"x", &[Tag::new("~color", "red")])
        .expect("seed add should succeed");
}

fn names(session: &impl WalletSession, query_json: &str) -> Result<Vec<String>> {
    let query = wql::parse_str(query_json)?;
    Ok(session
        .search("cred", &query, &RecordOptions::default())?
        .into_iter()
        .map(|record| record.name)
        .collect())
}

#[test]
fn test_backends_agree_on_query_battery() {
    let dir = TempDir::new().expect("temp dir");
    let config = format!(
        r#"{{"path": {:?}}}"#,
        dir.path().to_str().expect("utf-8 temp path")
    );

    let sqlite = SqliteBackend::new();
    sqlite.create_wallet("w1", &config, "", "meta").unwrap();
    let sqlite_session = sqlite.open_wallet("w1", &config, "").unwrap();
    seed(&sqlite_session);

    let memory = MemoryBackend::new();
    memory.create_wallet("w1", "", "", "meta").unwrap();
    let memory_session = memory.open_wallet("w1", "", "").unwrap();
    seed(&memory_session);

    let queries = [
        ("{}", vec!["r1", "r2", "r3", "r4"]),
        (r#"{"~color": "red"}"#, vec!["r1", "r2"]),
        (r#"{"enc": "aa"}"#, vec!["r1", "r3"]),
        (r#"{"~grade": {"$gte": "2"}}"#, vec!["r2", "r3"]),
        (r#"{"~grade": {"$lt": "3"}}"#, vec!["r1", "r2"]),
        (r#"{"~color": {"$neq": "red"}}"#, vec!["r3", "r4"]),
        (r#"{"~color": {"$like": "re"}}"#, vec!["r1", "r2", "r4"]),
        (r#"{"~color": {"$in": ["blue", "green-ish"]}}"#, vec!["r3", "r4"]),
        (r#"{"~color": {"$in": []}}"#, vec![]),
        // Implicit conjunction of two clauses on one object.
        (r#"{"~color": "red", "enc": "aa"}"#, vec!["r1"]),
        (
            r#"{"$or": [{"~color": "red"}, {"~grade": {"$lte": "2"}}]}"#,
            vec!["r1", "r2"],
        ),
        (
            r#"{"$and": [{"~color": "red"}, {"~color": "blue"}]}"#,
            vec![],
        ),
        // Complement within the type universe: r4 has no ~grade tag and
        // still appears.
        (r#"{"$not": {"~grade": "2"}}"#, vec!["r1", "r3", "r4"]),
        (
            r#"{"$not": [{"~color": "red"}, {"enc": "aa"}]}"#,
            vec!["r2", "r3", "r4"],
        ),
        (
            r#"{"$or": [{"~color": "red"}, {"$not": {"enc": "aa"}}]}"#,
            vec!["r1", "r2", "r4"],
        ),
    ];

    for (query, expected) in queries {
        let from_sqlite = names(&sqlite_session, query).expect(query);
        let from_memory = names(&memory_session, query).expect(query);
        assert_eq!(from_sqlite, from_memory, "backends diverged on {}", query);
        let got: Vec<&str> = from_sqlite.iter().map(String::as_str).collect();
        assert_eq!(got, expected, "unexpected result for {}", query);
    }
}

#[test]
fn test_backends_agree_on_numeric_rejections() {
    let dir = TempDir::new().expect("temp dir");
    let config = format!(
        r#"{{"path": {:?}}}"#,
        dir.path().to_str().expect("utf-8 temp path")
    );

    let sqlite = SqliteBackend::new();
    sqlite.create_wallet("w1", &config, "", "meta").unwrap();
    let sqlite_session = sqlite.open_wallet("w1", &config, "").unwrap();

    let memory = MemoryBackend::new();
    memory.create_wallet("w1", "", "", "meta").unwrap();
    let memory_session = memory.open_wallet("w1", "", "").unwrap();

    for session in [&sqlite_session as &dyn WalletSession, &memory_session] {
        session
            .add_record("cred", "r1", b"v", &[Tag::new("~n", "7")])
            .unwrap();
        session
            .add_record("cred", "r2", b"v", &[Tag::new("~n", "007")])
            .unwrap();

        // A non-canonical stored integer fails the query on both paths.
        let query = wql::parse_str(r#"{"~n": {"$gte": "1"}}"#).unwrap();
        let err = session
            .search("cred", &query, &RecordOptions::default())
            .unwrap_err();
        assert_eq!(err.code(), 108);

        // Equality still treats the stored value as an opaque string.
        let query = wql::parse_str(r#"{"~n": "007"}"#).unwrap();
        let hits = session
            .search("cred", &query, &RecordOptions::default())
            .unwrap();
        assert_eq!(hits.len(), 1);
    }
}

#[test]
fn test_union_deduplicates_multi_branch_matches() {
    let memory = MemoryBackend::new();
    memory.create_wallet("w1", "", "", "meta").unwrap();
    let session = memory.open_wallet("w1", "", "").unwrap();
    session
        .add_record(
            "cred",
            "both",
            b"v",
            &[Tag::new("~a", "1"), Tag::new("~b", "2")],
        )
        .unwrap();

    let query = wql::parse_str(r#"{"$or": [{"~a": "1"}, {"~b": "2"}]}"#).unwrap();
    let hits = session
        .search("cred", &query, &RecordOptions::default())
        .unwrap();
    assert_eq!(hits.len(), 1);
}
