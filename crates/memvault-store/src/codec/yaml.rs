//! YAML codec via `serde_yaml`.

use super::{DecodedEntries, EntryCodec, EntryDocument};
use memvault_types::entry::MemoryEntry;
use memvault_types::error::{MemoryError, MemoryResult};
use memvault_types::transfer::ExportFormat;

pub struct YamlCodec;

impl EntryCodec for YamlCodec {
    fn format(&self) -> ExportFormat {
        ExportFormat::Yaml
    }

    fn encode(&self, entries: &[MemoryEntry]) -> MemoryResult<Vec<u8>> {
        serde_yaml::to_string(entries)
            .map(String::into_bytes)
            .map_err(|e| MemoryError::Serialization(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> MemoryResult<DecodedEntries> {
        serde_yaml::from_slice::<EntryDocument>(bytes)
            .map(EntryDocument::into_entries)
            .map_err(|e| MemoryError::Format(format!("invalid YAML payload: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::fixtures;

    #[test]
    fn test_round_trip() {
        fixtures::assert_round_trip(&YamlCodec);
    }

    #[test]
    fn test_hand_written_document() {
        let doc = r#"
- id: 6f1c2b0e-7a57-4c0a-9f0e-3b1d2c4e5f60
  key: greeting
  namespace: default
  type: string
  value: hi
  tags: a, b
  owner: system
  size: 4
  version: 1
  createdAt: 2024-05-01T10:00:00Z
  updatedAt: 2024-05-01T10:00:00Z
  lastAccessedAt: 2024-05-01T10:00:00Z
"#;
        let entries = YamlCodec.decode_strict(doc.as_bytes()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].tags, vec!["a", "b"]);
        assert_eq!(entries[0].value, serde_json::json!("hi"));
        assert!(entries[0].metadata.is_empty());
    }
}
