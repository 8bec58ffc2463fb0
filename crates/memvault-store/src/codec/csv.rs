//! CSV codec, read and written with the `csv` crate.
//!
//! One header row naming the columns, then one row per entry. `value` and
//! `metadata` cells hold embedded JSON. Tags share one cell, joined with `;`,
//! with `\;` and `\\` escaping separators and backslashes inside a tag.
//! Decoding maps cells by header name, so column order is free and unknown
//! columns are ignored. A ragged row or a bad cell fails only its own record.

use super::{DecodedEntries, EntryCodec, FlatRecord, COLUMNS};
use memvault_types::entry::MemoryEntry;
use memvault_types::error::{MemoryError, MemoryResult};
use memvault_types::transfer::ExportFormat;

pub struct CsvCodec;

const TAG_SEPARATOR: char = ';';

fn csv_err(e: csv::Error) -> MemoryError {
    MemoryError::Format(format!("CSV error: {e}"))
}

/// Join tags into one cell.
pub fn join_tags(tags: &[String]) -> String {
    let mut out = String::new();
    for (i, tag) in tags.iter().enumerate() {
        if i > 0 {
            out.push(TAG_SEPARATOR);
        }
        for c in tag.chars() {
            if c == '\\' || c == TAG_SEPARATOR {
                out.push('\\');
            }
            out.push(c);
        }
    }
    out
}

/// Split a tag cell produced by [`join_tags`].
pub fn split_tags(cell: &str) -> Vec<String> {
    let mut tags = Vec::new();
    let mut current = String::new();
    let mut chars = cell.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            TAG_SEPARATOR => tags.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    if !current.is_empty() || !tags.is_empty() {
        tags.push(current);
    }
    tags.retain(|t| !t.is_empty());
    tags
}

impl EntryCodec for CsvCodec {
    fn format(&self) -> ExportFormat {
        ExportFormat::Csv
    }

    fn encode(&self, entries: &[MemoryEntry]) -> MemoryResult<Vec<u8>> {
        let mut writer = csv::WriterBuilder::new()
            .terminator(csv::Terminator::CRLF)
            .from_writer(Vec::new());
        writer.write_record(COLUMNS).map_err(csv_err)?;
        for entry in entries {
            let record = FlatRecord::from_entry(entry)?;
            let tags = join_tags(&record.tags);
            let cells = COLUMNS.iter().map(|column| match *column {
                "tags" => tags.as_str(),
                other => record.get(other).unwrap_or_default(),
            });
            writer.write_record(cells).map_err(csv_err)?;
        }
        writer
            .into_inner()
            .map_err(|e| MemoryError::Serialization(format!("CSV error: {e}")))
    }

    fn decode(&self, bytes: &[u8]) -> MemoryResult<DecodedEntries> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| MemoryError::Format(format!("CSV payload is not UTF-8: {e}")))?;
        let text = text.strip_prefix('\u{feff}').unwrap_or(text);
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_reader(text.as_bytes());
        let header: Vec<String> = reader
            .headers()
            .map_err(csv_err)?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();
        if header.is_empty() {
            return Ok(Vec::new());
        }
        if !header.iter().any(|h| h == "key") {
            return Err(MemoryError::Format("CSV header has no 'key' column".into()));
        }

        let mut entries = Vec::new();
        for (n, row) in reader.records().enumerate() {
            let row = match row {
                Ok(row) => row,
                Err(e) => {
                    entries.push(Err(csv_err(e)));
                    continue;
                }
            };
            if row.len() != header.len() {
                entries.push(Err(MemoryError::Format(format!(
                    "CSV row {} has {} cells, header has {}",
                    n + 2,
                    row.len(),
                    header.len()
                ))));
                continue;
            }
            let mut record = FlatRecord::default();
            for (column, cell) in header.iter().zip(row.iter()) {
                match column.as_str() {
                    "tags" => record.tags = split_tags(cell),
                    name => record.set(name, cell.to_string()),
                }
            }
            entries.push(record.into_entry());
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::fixtures;

    #[test]
    fn test_round_trip() {
        fixtures::assert_round_trip(&CsvCodec);
    }

    #[test]
    fn test_tag_escaping() {
        let tags = vec!["a;b".to_string(), "c\\d".to_string(), "e".to_string()];
        let cell = join_tags(&tags);
        assert_eq!(cell, "a\\;b;c\\\\d;e");
        assert_eq!(split_tags(&cell), tags);
        assert!(split_tags("").is_empty());
    }

    #[test]
    fn test_awkward_cells_are_quoted() {
        let entries = fixtures::sample_entries();
        let text = String::from_utf8(CsvCodec.encode(&entries[1..2]).unwrap()).unwrap();
        assert!(text.starts_with("id,key,namespace,"));
        assert!(text.contains("\"comma, \"\"quote\"\" <tag> & ;semi\""));
        assert!(text.ends_with("\r\n"));
    }

    #[test]
    fn test_blank_lines_and_bom_ignored() {
        let csv = "\u{feff}key,value\n\na,1\n\nb,2\n";
        let entries = CsvCodec.decode_strict(csv.as_bytes()).unwrap();
        let keys: Vec<&str> = entries.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "b"]);
        assert!(CsvCodec.decode(b"").unwrap().is_empty());
    }

    #[test]
    fn test_minimal_columns_any_order() {
        let csv = "value,key,tags\n\"{\"\"a\"\":1}\",cfg,x;y\n";
        let entries = CsvCodec.decode_strict(csv.as_bytes()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key, "cfg");
        assert_eq!(entries[0].value, serde_json::json!({"a": 1}));
        assert_eq!(entries[0].tags, vec!["x", "y"]);
        assert_eq!(entries[0].entry_type, "object");
    }

    #[test]
    fn test_bad_rows_fail_alone() {
        let csv = "key,value,accessLevel\ngood,1,shared\nshort\nbad,2,secret\nalso,3,\n";
        let decoded = CsvCodec.decode(csv.as_bytes()).unwrap();
        assert_eq!(decoded.len(), 4);
        assert_eq!(decoded[0].as_ref().unwrap().key, "good");
        assert!(matches!(decoded[1], Err(MemoryError::Format(_))));
        assert!(decoded[2].is_err());
        assert_eq!(decoded[3].as_ref().unwrap().key, "also");
    }

    #[test]
    fn test_header_without_key_rejected() {
        let err = CsvCodec.decode(b"name,value\na,1\n").unwrap_err();
        assert!(matches!(err, MemoryError::Format(_)));
    }
}
