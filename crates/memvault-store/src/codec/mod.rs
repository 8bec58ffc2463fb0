//! Format adapters used by export and import.
//!
//! Each format implements [`EntryCodec`]; [`CodecRegistry`] maps an
//! [`ExportFormat`] to its codec. Byte-level compression and encryption live
//! in [`envelope`] and wrap whatever a codec produces.

pub mod csv;
pub mod envelope;
pub mod json;
pub mod xml;
pub mod yaml;

use chrono::{DateTime, Utc};
use memvault_types::entry::{
    infer_entry_type, parse_value, AccessLevel, EntryId, MemoryEntry, DEFAULT_NAMESPACE,
    DEFAULT_OWNER,
};
use memvault_types::error::{MemoryError, MemoryResult};
use memvault_types::transfer::ExportFormat;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

/// One result per record, in document order.
pub type DecodedEntries = Vec<MemoryResult<MemoryEntry>>;

/// Symmetric encoder/decoder for one serialization format.
///
/// `decode` fails as a whole only when the document itself is unreadable.
/// A record with bad field values yields an `Err` in its own slot.
pub trait EntryCodec: Send + Sync {
    fn format(&self) -> ExportFormat;
    fn encode(&self, entries: &[MemoryEntry]) -> MemoryResult<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> MemoryResult<DecodedEntries>;

    /// Decode, failing on the first bad record.
    fn decode_strict(&self, bytes: &[u8]) -> MemoryResult<Vec<MemoryEntry>> {
        self.decode(bytes)?.into_iter().collect()
    }
}

/// Codecs keyed by format.
#[derive(Clone)]
pub struct CodecRegistry {
    codecs: HashMap<ExportFormat, Arc<dyn EntryCodec>>,
}

impl Default for CodecRegistry {
    fn default() -> Self {
        let mut registry = Self {
            codecs: HashMap::new(),
        };
        registry.register(Arc::new(json::JsonCodec));
        registry.register(Arc::new(csv::CsvCodec));
        registry.register(Arc::new(xml::XmlCodec));
        registry.register(Arc::new(yaml::YamlCodec));
        registry
    }
}

impl CodecRegistry {
    /// Add or replace the codec for its format.
    pub fn register(&mut self, codec: Arc<dyn EntryCodec>) {
        self.codecs.insert(codec.format(), codec);
    }

    pub fn get(&self, format: ExportFormat) -> MemoryResult<&dyn EntryCodec> {
        self.codecs
            .get(&format)
            .map(|c| c.as_ref())
            .ok_or_else(|| MemoryError::Format(format!("no codec registered for {format}")))
    }
}

/// Document shapes accepted by the structured (JSON, YAML) decoders: a bare
/// list of entries, or an object wrapping them under `entries`. Items stay
/// untyped until [`EntryDocument::into_entries`] so one bad item fails alone.
#[derive(Deserialize)]
#[serde(untagged)]
pub(crate) enum EntryDocument {
    List(Vec<serde_json::Value>),
    Wrapped { entries: Vec<serde_json::Value> },
}

impl EntryDocument {
    pub(crate) fn into_entries(self) -> DecodedEntries {
        let items = match self {
            EntryDocument::List(items) | EntryDocument::Wrapped { entries: items } => items,
        };
        items.into_iter().map(entry_from_value).collect()
    }
}

fn entry_from_value(item: serde_json::Value) -> MemoryResult<MemoryEntry> {
    let key = item
        .get("key")
        .and_then(serde_json::Value::as_str)
        .map(str::to_string);
    serde_json::from_value(item).map_err(|e| match key {
        Some(key) => MemoryError::Format(format!("invalid record '{key}': {e}")),
        None => MemoryError::Format(format!("invalid record: {e}")),
    })
}

/// Column order shared by the flat (CSV, XML) formats.
pub(crate) const COLUMNS: [&str; 16] = [
    "id",
    "key",
    "namespace",
    "type",
    "value",
    "tags",
    "owner",
    "accessLevel",
    "size",
    "version",
    "compressed",
    "createdAt",
    "updatedAt",
    "lastAccessedAt",
    "expiresAt",
    "metadata",
];

/// An entry flattened to text fields. `value` and `metadata` hold embedded
/// JSON; tags are kept as a list and laid out by each format.
#[derive(Debug, Default)]
pub(crate) struct FlatRecord {
    fields: HashMap<String, String>,
    pub tags: Vec<String>,
}

fn json_text<T: serde::Serialize>(value: &T) -> MemoryResult<String> {
    serde_json::to_string(value).map_err(|e| MemoryError::Serialization(e.to_string()))
}

fn parse_time(column: &str, raw: Option<&str>) -> MemoryResult<Option<DateTime<Utc>>> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(s) => DateTime::parse_from_rfc3339(s)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|e| MemoryError::Format(format!("invalid {column} '{s}': {e}"))),
    }
}

impl FlatRecord {
    pub(crate) fn from_entry(entry: &MemoryEntry) -> MemoryResult<Self> {
        let mut fields = HashMap::with_capacity(COLUMNS.len());
        let mut put = |k: &str, v: String| {
            fields.insert(k.to_string(), v);
        };
        put("id", entry.id.to_string());
        put("key", entry.key.clone());
        put("namespace", entry.namespace.clone());
        put("type", entry.entry_type.clone());
        put("value", json_text(&entry.value)?);
        put("owner", entry.owner.clone());
        put("accessLevel", entry.access_level.to_string());
        put("size", entry.size.to_string());
        put("version", entry.version.to_string());
        put("compressed", entry.compressed.to_string());
        put("createdAt", entry.created_at.to_rfc3339());
        put("updatedAt", entry.updated_at.to_rfc3339());
        put("lastAccessedAt", entry.last_accessed_at.to_rfc3339());
        put(
            "expiresAt",
            entry.expires_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
        );
        put("metadata", json_text(&entry.metadata)?);
        Ok(Self {
            fields,
            tags: entry.tags.clone(),
        })
    }

    pub(crate) fn get(&self, column: &str) -> Option<&str> {
        self.fields.get(column).map(String::as_str)
    }

    pub(crate) fn set(&mut self, column: &str, value: String) {
        self.fields.insert(column.to_string(), value);
    }

    /// Rebuild an entry. Missing optional fields take defaults; `size` is
    /// not trusted and is recomputed by the store.
    pub(crate) fn into_entry(self) -> MemoryResult<MemoryEntry> {
        let key = self
            .get("key")
            .map(str::to_string)
            .ok_or_else(|| MemoryError::Format("record has no key".into()))?;
        let id = match self.get("id").map(str::trim).filter(|s| !s.is_empty()) {
            Some(raw) => raw
                .parse::<EntryId>()
                .map_err(|e| MemoryError::Format(e.to_string()))?,
            None => EntryId::new(),
        };
        let value = parse_value(self.get("value").unwrap_or("null"));
        let entry_type = self
            .get("type")
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| infer_entry_type(&value).to_string());
        let access_level = match self.get("accessLevel").filter(|s| !s.trim().is_empty()) {
            Some(raw) => raw
                .parse::<AccessLevel>()
                .map_err(|e| MemoryError::Format(e.to_string()))?,
            None => AccessLevel::default(),
        };
        let metadata = match self.get("metadata").map(str::trim).filter(|s| !s.is_empty()) {
            Some(raw) => serde_json::from_str(raw)
                .map_err(|e| MemoryError::Format(format!("invalid metadata for '{key}': {e}")))?,
            None => HashMap::new(),
        };
        let number = |column: &str, default: u64| -> MemoryResult<u64> {
            match self.get(column).map(str::trim).filter(|s| !s.is_empty()) {
                Some(raw) => raw
                    .parse()
                    .map_err(|_| MemoryError::Format(format!("invalid {column} '{raw}'"))),
                None => Ok(default),
            }
        };
        let compressed = match self.get("compressed").map(str::trim) {
            Some("true") => true,
            Some("false") | Some("") | None => false,
            Some(other) => {
                return Err(MemoryError::Format(format!("invalid compressed '{other}'")))
            }
        };
        let now = Utc::now();
        let created_at = parse_time("createdAt", self.get("createdAt"))?.unwrap_or(now);

        Ok(MemoryEntry {
            id,
            namespace: self
                .get("namespace")
                .map(str::to_string)
                .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
            entry_type,
            tags: self.tags.clone(),
            owner: self
                .get("owner")
                .map(str::to_string)
                .unwrap_or_else(|| DEFAULT_OWNER.to_string()),
            access_level,
            size: number("size", 0)?,
            version: number("version", 1)?,
            compressed,
            created_at,
            updated_at: parse_time("updatedAt", self.get("updatedAt"))?.unwrap_or(created_at),
            last_accessed_at: parse_time("lastAccessedAt", self.get("lastAccessedAt"))?
                .unwrap_or(created_at),
            expires_at: parse_time("expiresAt", self.get("expiresAt"))?,
            metadata,
            value,
            key,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_has_every_format() {
        let registry = CodecRegistry::default();
        for format in ExportFormat::ALL {
            assert_eq!(registry.get(format).unwrap().format(), format);
        }
    }

    #[test]
    fn test_flat_record_defaults() {
        let mut record = FlatRecord::default();
        record.set("key", "k".into());
        record.set("value", "[1,2]".into());
        let entry = record.into_entry().unwrap();
        assert_eq!(entry.namespace, DEFAULT_NAMESPACE);
        assert_eq!(entry.entry_type, "array");
        assert_eq!(entry.version, 1);
        assert!(entry.expires_at.is_none());
    }

    #[test]
    fn test_flat_record_rejects_bad_fields() {
        let mut record = FlatRecord::default();
        record.set("key", "k".into());
        record.set("accessLevel", "secret".into());
        assert!(matches!(record.into_entry(), Err(MemoryError::Format(_))));

        let record = FlatRecord::default();
        assert!(matches!(record.into_entry(), Err(MemoryError::Format(_))));
    }
}
