//! Memory entry types: identifiers, access levels, and store/retrieve options.

use crate::error::MemoryError;
use crate::serde_compat::{map_lenient, string_list};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Namespace used when the caller does not name one.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Owner recorded when the caller does not name one.
pub const DEFAULT_OWNER: &str = "system";

/// Unique identifier for a memory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntryId(pub Uuid);

impl EntryId {
    /// Create a new random EntryId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EntryId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for EntryId {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(EntryId)
            .map_err(|e| MemoryError::Validation(format!("invalid entry id '{s}': {e}")))
    }
}

/// Who may read an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessLevel {
    /// Only the owner.
    Private,
    /// Owner and cooperating agents.
    #[default]
    Shared,
    /// Anyone.
    Public,
}

impl AccessLevel {
    /// Canonical lower-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessLevel::Private => "private",
            AccessLevel::Shared => "shared",
            AccessLevel::Public => "public",
        }
    }
}

impl std::fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AccessLevel {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "private" => Ok(AccessLevel::Private),
            "shared" => Ok(AccessLevel::Shared),
            "public" => Ok(AccessLevel::Public),
            other => Err(MemoryError::Validation(format!(
                "invalid access level '{other}' (expected private, shared or public)"
            ))),
        }
    }
}

/// A single stored record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryEntry {
    /// Unique ID, immutable once assigned.
    pub id: EntryId,
    /// Caller-supplied key, unique within its namespace.
    pub key: String,
    /// Logical partition scoping key uniqueness.
    pub namespace: String,
    /// Free-form classification tag.
    #[serde(rename = "type")]
    pub entry_type: String,
    /// The payload, always in its logical (decompressed) form.
    pub value: serde_json::Value,
    /// Tags in insertion order, without duplicates.
    #[serde(default, deserialize_with = "string_list")]
    pub tags: Vec<String>,
    /// Owning principal.
    pub owner: String,
    /// Visibility of the entry.
    #[serde(default)]
    pub access_level: AccessLevel,
    /// Byte length of the serialized value.
    pub size: u64,
    /// Bumped on every update, starting at 1.
    pub version: u64,
    /// Whether the value is held compressed by the store.
    #[serde(default)]
    pub compressed: bool,
    /// When the entry was first stored.
    pub created_at: DateTime<Utc>,
    /// When the entry was last written.
    pub updated_at: DateTime<Utc>,
    /// When the entry was last read with access tracking.
    pub last_accessed_at: DateTime<Utc>,
    /// Logical expiry; `None` means the entry never expires.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    /// Additional caller-supplied pairs.
    #[serde(default, deserialize_with = "map_lenient")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl MemoryEntry {
    /// Whether the entry is logically expired at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| now >= exp)
    }

    /// Whether the entry is logically expired right now.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

/// Options accepted by `store`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreOptions {
    /// Target namespace (defaults to `"default"`).
    pub namespace: Option<String>,
    /// Entry type; auto-detected from the value on creation when absent.
    #[serde(rename = "type")]
    pub entry_type: Option<String>,
    /// Replacement tag set.
    pub tags: Option<Vec<String>>,
    /// Owner (defaults to `"system"` on creation).
    pub owner: Option<String>,
    /// Access level (defaults to `shared` on creation).
    pub access_level: Option<AccessLevel>,
    /// Time-to-live in milliseconds. Negative values are rejected.
    pub ttl_ms: Option<i64>,
    /// Force compression regardless of size.
    #[serde(default)]
    pub compress: bool,
    /// Replacement metadata map.
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

impl StoreOptions {
    /// Options targeting a namespace.
    pub fn namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            ..Default::default()
        }
    }

    /// Set the entry type.
    pub fn with_type(mut self, entry_type: impl Into<String>) -> Self {
        self.entry_type = Some(entry_type.into());
        self
    }

    /// Set the tag list.
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = Some(tags.into_iter().map(Into::into).collect());
        self
    }

    /// Set the owner.
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    /// Set a TTL in milliseconds.
    pub fn with_ttl_ms(mut self, ttl_ms: i64) -> Self {
        self.ttl_ms = Some(ttl_ms);
        self
    }
}

/// Options accepted by `retrieve`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrieveOptions {
    /// Namespace to look in (defaults to `"default"`).
    pub namespace: Option<String>,
    /// Bump `lastAccessedAt` on a hit.
    #[serde(default)]
    pub update_last_accessed: bool,
    /// Treat logically expired entries as misses.
    #[serde(default)]
    pub exclude_expired: bool,
}

impl RetrieveOptions {
    /// Options targeting a namespace.
    pub fn namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            ..Default::default()
        }
    }
}

/// Infer a type name from the JSON shape of a value.
pub fn infer_entry_type(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

/// Parse raw CLI-style input: JSON when it parses, otherwise a plain string.
pub fn parse_value(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}

/// Push tags into `tags`, skipping blanks and duplicates, keeping order.
pub fn push_unique_tags<I, S>(tags: &mut Vec<String>, incoming: I)
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    for tag in incoming {
        let tag = tag.as_ref().trim();
        if !tag.is_empty() && !tags.iter().any(|t| t == tag) {
            tags.push(tag.to_string());
        }
    }
}
