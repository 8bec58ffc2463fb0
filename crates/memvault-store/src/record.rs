//! Internal entry representation.
//!
//! A [`StoredEntry`] holds its value as a [`StoredValue`]: either plain JSON or
//! the gzip bytes of its JSON serialization. The logical size is fixed at
//! construction, so `size` never depends on whether the value is compressed.
//! Text search runs against a lazily computed string projection.

use crate::codec::envelope;
use chrono::{DateTime, Utc};
use memvault_types::entry::{AccessLevel, EntryId, MemoryEntry};
use memvault_types::error::{MemoryError, MemoryResult};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tracing::warn;

/// `(namespace, key)`: the identity callers address entries by.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryKey {
    pub namespace: String,
    pub key: String,
}

impl EntryKey {
    pub fn new(namespace: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            key: key.into(),
        }
    }
}

impl std::fmt::Display for EntryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.key)
    }
}

#[derive(Debug, Clone)]
enum Payload {
    Plain(serde_json::Value),
    Gzip(Vec<u8>),
}

/// A value as held by the repository.
#[derive(Debug, Clone)]
pub struct StoredValue {
    payload: Payload,
    size: u64,
    projection: OnceLock<Arc<str>>,
}

impl StoredValue {
    /// Hold a value uncompressed.
    pub fn plain(value: serde_json::Value) -> MemoryResult<Self> {
        let size = serialized_len(&value)?;
        Ok(Self {
            payload: Payload::Plain(value),
            size,
            projection: OnceLock::new(),
        })
    }

    /// Hold a value as gzip bytes of its JSON serialization.
    pub fn compressed(value: &serde_json::Value) -> MemoryResult<Self> {
        let json =
            serde_json::to_vec(value).map_err(|e| MemoryError::Serialization(e.to_string()))?;
        let bytes = envelope::gzip(&json)?;
        Ok(Self {
            payload: Payload::Gzip(bytes),
            size: json.len() as u64,
            projection: OnceLock::new(),
        })
    }

    /// Rebuild from raw gzip bytes (persistence load). The size is recomputed.
    pub fn from_gzip(bytes: Vec<u8>) -> MemoryResult<Self> {
        let json = envelope::gunzip(&bytes)?;
        Ok(Self {
            payload: Payload::Gzip(bytes),
            size: json.len() as u64,
            projection: OnceLock::new(),
        })
    }

    /// Build either form.
    pub fn new(value: serde_json::Value, compress: bool) -> MemoryResult<Self> {
        if compress {
            Self::compressed(&value)
        } else {
            Self::plain(value)
        }
    }

    /// The logical value, decompressing when needed.
    pub fn value(&self) -> MemoryResult<serde_json::Value> {
        match &self.payload {
            Payload::Plain(v) => Ok(v.clone()),
            Payload::Gzip(bytes) => {
                let json = envelope::gunzip(bytes)?;
                serde_json::from_slice(&json)
                    .map_err(|e| MemoryError::Format(format!("corrupted compressed value: {e}")))
            }
        }
    }

    /// Raw gzip bytes, when compressed.
    pub fn gzip_bytes(&self) -> Option<&[u8]> {
        match &self.payload {
            Payload::Gzip(bytes) => Some(bytes),
            Payload::Plain(_) => None,
        }
    }

    /// Byte length of the serialized logical value.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Bytes actually held in memory for the payload.
    pub fn stored_len(&self) -> u64 {
        match &self.payload {
            Payload::Plain(_) => self.size,
            Payload::Gzip(bytes) => bytes.len() as u64,
        }
    }

    pub fn is_compressed(&self) -> bool {
        matches!(self.payload, Payload::Gzip(_))
    }

    /// Text used for substring and full-text search.
    ///
    /// Strings project to themselves, everything else to compact JSON.
    /// A compressed value that fails to decode projects to the empty string.
    pub fn projection(&self) -> &str {
        self.projection.get_or_init(|| match self.value() {
            Ok(serde_json::Value::String(s)) => Arc::from(s.as_str()),
            Ok(other) => Arc::from(other.to_string().as_str()),
            Err(e) => {
                warn!(error = %e, "Could not project compressed value for search");
                Arc::from("")
            }
        })
    }

    /// Whether the payload decodes and matches its recorded size.
    pub fn is_intact(&self) -> bool {
        match &self.payload {
            Payload::Plain(_) => true,
            Payload::Gzip(bytes) => envelope::gunzip(bytes)
                .map(|json| {
                    json.len() as u64 == self.size
                        && serde_json::from_slice::<serde_json::Value>(&json).is_ok()
                })
                .unwrap_or(false),
        }
    }
}

/// Byte length of a value's compact JSON serialization.
pub fn serialized_len(value: &serde_json::Value) -> MemoryResult<u64> {
    serde_json::to_vec(value)
        .map(|v| v.len() as u64)
        .map_err(|e| MemoryError::Serialization(e.to_string()))
}

/// An entry as held by the repository.
#[derive(Debug, Clone)]
pub struct StoredEntry {
    pub id: EntryId,
    pub key: String,
    pub namespace: String,
    pub entry_type: String,
    pub value: StoredValue,
    pub tags: Vec<String>,
    pub owner: String,
    pub access_level: AccessLevel,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl StoredEntry {
    pub fn entry_key(&self) -> EntryKey {
        EntryKey::new(self.namespace.clone(), self.key.clone())
    }

    pub fn size(&self) -> u64 {
        self.value.size()
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| now >= exp)
    }

    /// Approximate resident footprint: payload, identifiers, tags, metadata.
    pub fn resident_bytes(&self) -> u64 {
        let tags: usize = self.tags.iter().map(String::len).sum();
        let metadata: usize = self
            .metadata
            .iter()
            .map(|(k, v)| k.len() + v.to_string().len())
            .sum();
        self.value.stored_len()
            + (self.key.len()
                + self.namespace.len()
                + self.entry_type.len()
                + self.owner.len()
                + tags
                + metadata) as u64
    }

    /// Materialize the public form.
    pub fn to_entry(&self) -> MemoryResult<MemoryEntry> {
        Ok(MemoryEntry {
            id: self.id,
            key: self.key.clone(),
            namespace: self.namespace.clone(),
            entry_type: self.entry_type.clone(),
            value: self.value.value()?,
            tags: self.tags.clone(),
            owner: self.owner.clone(),
            access_level: self.access_level,
            size: self.value.size(),
            version: self.version,
            compressed: self.value.is_compressed(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            last_accessed_at: self.last_accessed_at,
            expires_at: self.expires_at,
            metadata: self.metadata.clone(),
        })
    }

    /// Adopt a public entry as-is (import, persistence), honouring its
    /// `compressed` flag. The incoming `size` is ignored and recomputed.
    pub fn from_entry(entry: MemoryEntry) -> MemoryResult<Self> {
        let value = StoredValue::new(entry.value, entry.compressed)?;
        Ok(Self {
            id: entry.id,
            key: entry.key,
            namespace: entry.namespace,
            entry_type: entry.entry_type,
            value,
            tags: entry.tags,
            owner: entry.owner,
            access_level: entry.access_level,
            version: entry.version.max(1),
            created_at: entry.created_at,
            updated_at: entry.updated_at,
            last_accessed_at: entry.last_accessed_at,
            expires_at: entry.expires_at,
            metadata: entry.metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_size_independent_of_compression() {
        let value = json!({"text": "abc ".repeat(100)});
        let plain = StoredValue::plain(value.clone()).unwrap();
        let packed = StoredValue::compressed(&value).unwrap();
        assert_eq!(plain.size(), packed.size());
        assert!(packed.stored_len() < packed.size());
        assert_eq!(packed.value().unwrap(), value);
        assert!(packed.is_compressed());
        assert!(packed.is_intact());
    }

    #[test]
    fn test_projection_of_string_is_raw() {
        let v = StoredValue::plain(json!("Hello World")).unwrap();
        assert_eq!(v.projection(), "Hello World");
        let o = StoredValue::compressed(&json!({"a": 1})).unwrap();
        assert_eq!(o.projection(), r#"{"a":1}"#);
    }

    #[test]
    fn test_size_is_serialized_length() {
        let v = StoredValue::plain(json!("1")).unwrap();
        assert_eq!(v.size(), 3);
    }

    #[test]
    fn test_from_gzip_recomputes_size() {
        let packed = StoredValue::compressed(&json!([1, 2, 3])).unwrap();
        let bytes = packed.gzip_bytes().unwrap().to_vec();
        let restored = StoredValue::from_gzip(bytes).unwrap();
        assert_eq!(restored.size(), 7);
        assert!(StoredValue::from_gzip(vec![1, 2, 3]).is_err());
    }
}
