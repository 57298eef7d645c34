//! Core data types for the storage layer.

use serde::Deserialize;
use serde_json::Value;

use crate::error::{Result, StorageError};

/// Engine-internal record identifier.
///
/// Monotonically increasing per wallet and stable for the record's
/// lifetime. Distinct from the caller-supplied external id, which lives in
/// [`Record::name`].
pub type RecordId = i64;

/// A single tag attached to a record.
///
/// Names are stored verbatim: a leading `~` marks a plaintext tag whose
/// value this engine may compare and order; any other name is an encrypted
/// tag whose value is opaque beyond equality.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub name: String,
    pub value: String,
}

impl Tag {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Plaintext tags carry the `~` prefix; everything else is encrypted.
    pub fn is_plaintext(&self) -> bool {
        self.name.starts_with('~')
    }
}

/// Parse a tags JSON document: an object mapping tag name to string value.
///
/// Any other shape (non-object, non-string value) is rejected before any
/// mutation is attempted.
pub fn tags_from_json(json: &str) -> Result<Vec<Tag>> {
    let value: Value = serde_json::from_str(json)?;
    let map = value
        .as_object()
        .ok_or_else(|| StorageError::Input("tags must be a JSON object".to_string()))?;

    let mut tags = Vec::with_capacity(map.len());
    for (name, tag_value) in map {
        let tag_value = tag_value.as_str().ok_or_else(|| {
            StorageError::Input(format!("tag '{}' value must be a string", name))
        })?;
        tags.push(Tag::new(name.clone(), tag_value));
    }
    Ok(tags)
}

/// Serialize tags back to the JSON object form handed to the caller.
pub fn tags_to_json(tags: &[Tag]) -> Result<String> {
    let mut map = serde_json::Map::with_capacity(tags.len());
    for tag in tags {
        map.insert(tag.name.clone(), Value::String(tag.value.clone()));
    }
    serde_json::to_string(&Value::Object(map))
        .map_err(|e| StorageError::InvalidState(format!("tag serialization failed: {}", e)))
}

/// A record snapshot surfaced through a record handle.
///
/// Fields other than `name` are optional because retrieve options control
/// which of them the backend loads.
#[derive(Debug, Clone)]
pub struct Record {
    /// Caller-supplied external id.
    pub name: String,
    pub record_type: Option<String>,
    pub value: Option<Vec<u8>>,
    pub tags: Option<Vec<Tag>>,
}

/// Options for `get_record`, parsed from the caller's options JSON.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RecordOptions {
    pub retrieve_type: bool,
    pub retrieve_value: bool,
    pub retrieve_tags: bool,
}

impl Default for RecordOptions {
    fn default() -> Self {
        Self {
            retrieve_type: true,
            retrieve_value: true,
            retrieve_tags: true,
        }
    }
}

/// Options for `open_search`; a superset of [`RecordOptions`].
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SearchOptions {
    pub retrieve_records: bool,
    pub retrieve_total_count: bool,
    pub retrieve_type: bool,
    pub retrieve_value: bool,
    pub retrieve_tags: bool,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            retrieve_records: true,
            retrieve_total_count: true,
            retrieve_type: true,
            retrieve_value: true,
            retrieve_tags: true,
        }
    }
}

impl SearchOptions {
    pub fn record_options(&self) -> RecordOptions {
        RecordOptions {
            retrieve_type: self.retrieve_type,
            retrieve_value: self.retrieve_value,
            retrieve_tags: self.retrieve_tags,
        }
    }
}

/// Parse an options JSON string, treating empty input as defaults.
pub fn options_from_json<'a, T>(json: &'a str) -> Result<T>
where
    T: Deserialize<'a> + Default,
{
    if json.trim().is_empty() {
        return Ok(T::default());
    }
    serde_json::from_str(json)
        .map_err(|e| StorageError::Input(format!("invalid options JSON: {}", e)))
}

/// Validate a wallet id against the identifier whitelist.
///
/// Wallet ids become file names and are inlined into error text; they must
/// be rejected before any path or SQL is constructed from them.
pub fn validate_wallet_id(wallet_id: &str) -> Result<()> {
    if wallet_id.is_empty() {
        return Err(StorageError::Input("wallet id is empty".to_string()));
    }
    if !wallet_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(StorageError::Input(format!(
            "wallet id '{}' contains invalid characters",
            wallet_id
        )));
    }
    Ok(())
}
