//! JSON codec: a pretty-printed array of entries.

use super::{DecodedEntries, EntryCodec, EntryDocument};
use memvault_types::entry::MemoryEntry;
use memvault_types::error::{MemoryError, MemoryResult};
use memvault_types::transfer::ExportFormat;

pub struct JsonCodec;

impl EntryCodec for JsonCodec {
    fn format(&self) -> ExportFormat {
        ExportFormat::Json
    }

    fn encode(&self, entries: &[MemoryEntry]) -> MemoryResult<Vec<u8>> {
        serde_json::to_vec_pretty(entries).map_err(|e| MemoryError::Serialization(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> MemoryResult<DecodedEntries> {
        serde_json::from_slice::<EntryDocument>(bytes)
            .map(EntryDocument::into_entries)
            .map_err(|e| MemoryError::Format(format!("invalid JSON payload: {e}")))
    }
}
