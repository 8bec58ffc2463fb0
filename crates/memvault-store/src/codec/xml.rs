//! XML codec.
//!
//! ```xml
//! <memory_export>
//!   <entry>
//!     <id>..</id><key>..</key> ... <value>{embedded json}</value>
//!     <tags><tag>a</tag><tag>b</tag></tags>
//!     ... <metadata>{embedded json}</metadata>
//!   </entry>
//! </memory_export>
//! ```

use super::{DecodedEntries, EntryCodec, FlatRecord, COLUMNS};
use memvault_types::entry::MemoryEntry;
use memvault_types::error::{MemoryError, MemoryResult};
use memvault_types::transfer::ExportFormat;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

const ROOT: &str = "memory_export";
const ENTRY: &str = "entry";
const TAGS: &str = "tags";
const TAG: &str = "tag";

pub struct XmlCodec;

fn xml_err(e: impl std::fmt::Display) -> MemoryError {
    MemoryError::Format(format!("XML error: {e}"))
}

fn write_text_element<W: std::io::Write>(
    writer: &mut Writer<W>,
    name: &str,
    text: &str,
) -> MemoryResult<()> {
    if text.is_empty() {
        return writer
            .write_event(Event::Empty(BytesStart::new(name)))
            .map_err(xml_err);
    }
    writer
        .write_event(Event::Start(BytesStart::new(name)))
        .map_err(xml_err)?;
    writer
        .write_event(Event::Text(BytesText::new(text)))
        .map_err(xml_err)?;
    writer
        .write_event(Event::End(BytesEnd::new(name)))
        .map_err(xml_err)?;
    Ok(())
}

fn element_name(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).into_owned()
}

impl EntryCodec for XmlCodec {
    fn format(&self) -> ExportFormat {
        ExportFormat::Xml
    }

    fn encode(&self, entries: &[MemoryEntry]) -> MemoryResult<Vec<u8>> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
            .map_err(xml_err)?;
        writer
            .write_event(Event::Start(BytesStart::new(ROOT)))
            .map_err(xml_err)?;
        for entry in entries {
            let record = FlatRecord::from_entry(entry)?;
            writer
                .write_event(Event::Start(BytesStart::new(ENTRY)))
                .map_err(xml_err)?;
            for column in COLUMNS {
                if column == TAGS {
                    writer
                        .write_event(Event::Start(BytesStart::new(TAGS)))
                        .map_err(xml_err)?;
                    for tag in &record.tags {
                        write_text_element(&mut writer, TAG, tag)?;
                    }
                    writer
                        .write_event(Event::End(BytesEnd::new(TAGS)))
                        .map_err(xml_err)?;
                } else {
                    write_text_element(&mut writer, column, record.get(column).unwrap_or_default())?;
                }
            }
            writer
                .write_event(Event::End(BytesEnd::new(ENTRY)))
                .map_err(xml_err)?;
        }
        writer
            .write_event(Event::End(BytesEnd::new(ROOT)))
            .map_err(xml_err)?;
        Ok(writer.into_inner())
    }

    fn decode(&self, bytes: &[u8]) -> MemoryResult<DecodedEntries> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| MemoryError::Format(format!("XML payload is not UTF-8: {e}")))?;
        let mut reader = Reader::from_str(text);

        let mut entries = Vec::new();
        let mut seen_root = false;
        let mut record: Option<FlatRecord> = None;
        let mut field: Option<String> = None;
        let mut in_tags = false;
        let mut buffer = String::new();

        loop {
            match reader.read_event().map_err(xml_err)? {
                Event::Start(start) => {
                    let name = element_name(start.name().as_ref());
                    match (name.as_str(), record.is_some()) {
                        (ROOT, false) => seen_root = true,
                        (ENTRY, false) if seen_root => record = Some(FlatRecord::default()),
                        (TAGS, true) => in_tags = true,
                        (_, true) if field.is_none() => {
                            field = Some(name);
                            buffer.clear();
                        }
                        _ => {
                            return Err(MemoryError::Format(format!(
                                "unexpected <{name}> element"
                            )))
                        }
                    }
                }
                Event::Empty(empty) => {
                    let name = element_name(empty.name().as_ref());
                    match (name.as_str(), record.as_mut()) {
                        (ROOT, None) => seen_root = true,
                        (ENTRY, None) if seen_root => {
                            return Err(MemoryError::Format("empty <entry> element".into()))
                        }
                        (TAGS, Some(_)) => {}
                        (TAG, Some(_)) if in_tags => {}
                        (column, Some(rec)) => rec.set(column, String::new()),
                        _ => {
                            return Err(MemoryError::Format(format!(
                                "unexpected <{name}/> element"
                            )))
                        }
                    }
                }
                Event::Text(t) => {
                    if field.is_some() {
                        buffer.push_str(&t.unescape().map_err(xml_err)?);
                    }
                }
                Event::CData(c) => {
                    if field.is_some() {
                        buffer.push_str(&String::from_utf8_lossy(&c.into_inner()));
                    }
                }
                Event::End(end) => {
                    let name = element_name(end.name().as_ref());
                    match name.as_str() {
                        ENTRY => {
                            let rec = record
                                .take()
                                .ok_or_else(|| MemoryError::Format("stray </entry>".into()))?;
                            entries.push(rec.into_entry());
                        }
                        TAGS if field.is_none() => in_tags = false,
                        ROOT => {}
                        _ => {
                            if let (Some(column), Some(rec)) = (field.take(), record.as_mut()) {
                                let value = std::mem::take(&mut buffer);
                                if in_tags && column == TAG {
                                    rec.tags.push(value);
                                } else {
                                    rec.set(&column, value);
                                }
                            }
                        }
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if !seen_root {
            return Err(MemoryError::Format(format!("missing <{ROOT}> root element")));
        }
        if record.is_some() {
            return Err(MemoryError::Format("unterminated <entry> element".into()));
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
        fixtures::assert_round_trip(&XmlCodec);
    }

    #[test]
    fn test_layout() {
        let entries = fixtures::sample_entries();
        let xml = String::from_utf8(XmlCodec.encode(&entries[..1]).unwrap()).unwrap();
        assert!(xml.starts_with("<?xml"));
        assert!(xml.contains("<memory_export>"));
        assert!(xml.contains("<tag>a</tag>"));
        assert!(xml.contains("<key>plain</key>"));
    }

    #[test]
    fn test_hand_written_with_empty_elements() {
        let xml = r#"<memory_export>
  <entry>
    <key>k &amp; v</key>
    <value>[1,2]</value>
    <tags><tag>t1</tag><tag>t2</tag></tags>
    <expiresAt/>
  </entry>
</memory_export>"#;
        let entries = XmlCodec.decode_strict(xml.as_bytes()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key, "k & v");
        assert_eq!(entries[0].tags, vec!["t1", "t2"]);
        assert_eq!(entries[0].value, serde_json::json!([1, 2]));
        assert!(entries[0].expires_at.is_none());
    }

    #[test]
    fn test_bad_entry_fails_alone() {
        let xml = r#"<memory_export>
  <entry><key>ok</key><value>1</value></entry>
  <entry><key>bad</key><createdAt>yesterday</createdAt></entry>
</memory_export>"#;
        let decoded = XmlCodec.decode(xml.as_bytes()).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].as_ref().unwrap().key, "ok");
        assert!(matches!(decoded[1], Err(MemoryError::Format(_))));
    }

    #[test]
    fn test_missing_root_is_format_error() {
        let err = XmlCodec.decode(b"<other/>").unwrap_err();
        assert!(matches!(err, MemoryError::Format(_)));
    }
}
