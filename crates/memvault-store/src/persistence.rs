//! SQLite snapshot of the entry collection.
//!
//! The in-memory repository is authoritative; this table mirrors it. Rows are
//! loaded once at open and written back in dirty batches.

use crate::migration::run_migrations;
use crate::record::{StoredEntry, StoredValue};
use crate::repository::DirtyBatch;
use chrono::{DateTime, Utc};
use memvault_types::entry::{AccessLevel, EntryId};
use memvault_types::error::{MemoryError, MemoryResult};
use rusqlite::{Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

fn storage_err(e: rusqlite::Error) -> MemoryError {
    MemoryError::Storage(e.to_string())
}

/// One row as read from SQLite, before validation.
struct RawRow {
    id: String,
    namespace: String,
    key: String,
    entry_type: String,
    value: Vec<u8>,
    compressed: bool,
    tags: String,
    owner: String,
    access_level: String,
    version: i64,
    created_at: String,
    updated_at: String,
    last_accessed_at: String,
    expires_at: Option<String>,
    metadata: String,
}

fn parse_time(field: &str, raw: &str) -> MemoryResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| MemoryError::Serialization(format!("invalid {field} '{raw}': {e}")))
}

impl RawRow {
    fn into_entry(self) -> MemoryResult<StoredEntry> {
        let value = if self.compressed {
            StoredValue::from_gzip(self.value)?
        } else {
            let plain: serde_json::Value = rmp_serde::from_slice(&self.value)
                .map_err(|e| MemoryError::Serialization(e.to_string()))?;
            StoredValue::plain(plain)?
        };
        let tags: Vec<String> = serde_json::from_str(&self.tags)
            .map_err(|e| MemoryError::Serialization(format!("invalid tags: {e}")))?;
        let metadata: HashMap<String, serde_json::Value> = serde_json::from_str(&self.metadata)
            .map_err(|e| MemoryError::Serialization(format!("invalid metadata: {e}")))?;
        Ok(StoredEntry {
            id: self
                .id
                .parse::<EntryId>()
                .map_err(|e| MemoryError::Serialization(e.to_string()))?,
            key: self.key,
            namespace: self.namespace,
            entry_type: self.entry_type,
            value,
            tags,
            owner: self.owner,
            access_level: self
                .access_level
                .parse::<AccessLevel>()
                .map_err(|e| MemoryError::Serialization(e.to_string()))?,
            version: u64::try_from(self.version).unwrap_or(1).max(1),
            created_at: parse_time("created_at", &self.created_at)?,
            updated_at: parse_time("updated_at", &self.updated_at)?,
            last_accessed_at: parse_time("last_accessed_at", &self.last_accessed_at)?,
            expires_at: self
                .expires_at
                .as_deref()
                .map(|raw| parse_time("expires_at", raw))
                .transpose()?,
            metadata,
        })
    }
}

/// SQLite-backed snapshot store.
#[derive(Clone)]
pub struct SnapshotStore {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl SnapshotStore {
    /// Open (or create) the database at `path` and migrate it.
    pub fn open(path: &Path) -> MemoryResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(storage_err)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .map_err(storage_err)?;
        run_migrations(&conn).map_err(storage_err)?;
        info!(path = %path.display(), "Opened memory snapshot database");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path.to_path_buf()),
        })
    }

    /// An in-memory database, for tests.
    pub fn open_in_memory() -> MemoryResult<Self> {
        let conn = Connection::open_in_memory().map_err(storage_err)?;
        run_migrations(&conn).map_err(storage_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    fn lock(&self) -> MemoryResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| MemoryError::Internal(e.to_string()))
    }

    /// Every row that decodes. Bad rows are logged and skipped.
    pub fn load_all(&self) -> MemoryResult<Vec<StoredEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, namespace, key, entry_type, value, compressed, tags, owner,
                        access_level, version, created_at, updated_at, last_accessed_at,
                        expires_at, metadata
                 FROM memory_entries",
            )
            .map_err(storage_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(RawRow {
                    id: row.get(0)?,
                    namespace: row.get(1)?,
                    key: row.get(2)?,
                    entry_type: row.get(3)?,
                    value: row.get(4)?,
                    compressed: row.get::<_, i64>(5)? != 0,
                    tags: row.get(6)?,
                    owner: row.get(7)?,
                    access_level: row.get(8)?,
                    version: row.get(9)?,
                    created_at: row.get(10)?,
                    updated_at: row.get(11)?,
                    last_accessed_at: row.get(12)?,
                    expires_at: row.get(13)?,
                    metadata: row.get(14)?,
                })
            })
            .map_err(storage_err)?;

        let mut entries = Vec::new();
        for row in rows {
            let raw = match row {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(error = %e, "Skipping unreadable memory row");
                    continue;
                }
            };
            let id = raw.id.clone();
            match raw.into_entry() {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(id = %id, error = %e, "Skipping corrupt memory row"),
            }
        }
        debug!(count = entries.len(), "Loaded memory rows");
        Ok(entries)
    }

    /// Apply a dirty batch in one transaction: deletes first, then upserts.
    pub fn flush(&self, batch: &DirtyBatch) -> MemoryResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(storage_err)?;
        {
            let mut delete = tx
                .prepare("DELETE FROM memory_entries WHERE id = ?1")
                .map_err(storage_err)?;
            for id in &batch.deletes {
                delete.execute([id.to_string()]).map_err(storage_err)?;
            }

            let mut upsert = tx
                .prepare(
                    "INSERT OR REPLACE INTO memory_entries
                     (id, namespace, key, entry_type, value, compressed, tags, owner,
                      access_level, version, created_at, updated_at, last_accessed_at,
                      expires_at, metadata)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                )
                .map_err(storage_err)?;
            for entry in &batch.upserts {
                let (blob, compressed) = match entry.value.gzip_bytes() {
                    Some(bytes) => (bytes.to_vec(), true),
                    None => (
                        // Named encoding keeps map keys readable across versions.
                        rmp_serde::to_vec_named(&entry.value.value()?)
                            .map_err(|e| MemoryError::Serialization(e.to_string()))?,
                        false,
                    ),
                };
                let tags = serde_json::to_string(&entry.tags)
                    .map_err(|e| MemoryError::Serialization(e.to_string()))?;
                let metadata = serde_json::to_string(&entry.metadata)
                    .map_err(|e| MemoryError::Serialization(e.to_string()))?;
                upsert
                    .execute(rusqlite::params![
                        entry.id.to_string(),
                        entry.namespace,
                        entry.key,
                        entry.entry_type,
                        blob,
                        compressed as i64,
                        tags,
                        entry.owner,
                        entry.access_level.to_string(),
                        i64::try_from(entry.version).unwrap_or(i64::MAX),
                        entry.created_at.to_rfc3339(),
                        entry.updated_at.to_rfc3339(),
                        entry.last_accessed_at.to_rfc3339(),
                        entry.expires_at.map(|t| t.to_rfc3339()),
                        metadata,
                    ])
                    .map_err(storage_err)?;
            }
        }
        tx.commit().map_err(storage_err)?;
        debug!(
            upserts = batch.upserts.len(),
            deletes = batch.deletes.len(),
            "Flushed memory snapshot"
        );
        Ok(())
    }

    /// Number of persisted rows.
    pub fn count(&self) -> MemoryResult<u64> {
        let conn = self.lock()?;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM memory_entries", [], |row| row.get(0))
            .map_err(storage_err)?;
        Ok(count as u64)
    }

    /// Whether a row exists for `id`.
    pub fn contains(&self, id: EntryId) -> MemoryResult<bool> {
        let conn = self.lock()?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM memory_entries WHERE id = ?1",
                [id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(storage_err)?;
        Ok(found.is_some())
    }

    /// Bytes on disk, including the write-ahead log. Zero in memory.
    pub fn disk_usage(&self) -> u64 {
        let Some(path) = &self.path else {
            return 0;
        };
        let mut wal = path.clone().into_os_string();
        wal.push("-wal");
        [path.clone(), PathBuf::from(wal)]
            .iter()
            .filter_map(|p| std::fs::metadata(p).ok())
            .map(|m| m.len())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(key: &str, value: serde_json::Value, compress: bool) -> StoredEntry {
        let now = Utc::now();
        StoredEntry {
            id: EntryId::new(),
            key: key.into(),
            namespace: "ns".into(),
            entry_type: "object".into(),
            value: StoredValue::new(value, compress).unwrap(),
            tags: vec!["a".into(), "b".into()],
            owner: "system".into(),
            access_level: AccessLevel::Private,
            version: 3,
            created_at: now,
            updated_at: now,
            last_accessed_at: now,
            expires_at: Some(now + chrono::Duration::hours(1)),
            metadata: HashMap::from([("src".to_string(), json!("test"))]),
        }
    }

    #[test]
    fn test_flush_and_load() {
        let store = SnapshotStore::open_in_memory().unwrap();
        let plain = entry("plain", json!({"x": [1, 2, 3], "y": "z"}), false);
        let packed = entry("packed", json!("long ".repeat(100)), true);
        store
            .flush(&DirtyBatch {
                upserts: vec![plain.clone(), packed.clone()],
                deletes: vec![],
            })
            .unwrap();
        assert_eq!(store.count().unwrap(), 2);

        let mut loaded = store.load_all().unwrap();
        loaded.sort_by(|a, b| a.key.cmp(&b.key));
        assert_eq!(loaded[0].to_entry().unwrap(), packed.to_entry().unwrap());
        assert_eq!(loaded[1].to_entry().unwrap(), plain.to_entry().unwrap());
        assert!(loaded[0].value.is_compressed());
    }

    #[test]
    fn test_deletes_and_replace_on_key() {
        let store = SnapshotStore::open_in_memory().unwrap();
        let first = entry("k", json!(1), false);
        store
            .flush(&DirtyBatch {
                upserts: vec![first.clone()],
                deletes: vec![],
            })
            .unwrap();

        let second = entry("k", json!(2), false);
        store
            .flush(&DirtyBatch {
                upserts: vec![second.clone()],
                deletes: vec![first.id],
            })
            .unwrap();
        assert_eq!(store.count().unwrap(), 1);
        assert!(!store.contains(first.id).unwrap());
        assert!(store.contains(second.id).unwrap());
    }

    #[test]
    fn test_corrupt_row_skipped() {
        let store = SnapshotStore::open_in_memory().unwrap();
        let good = entry("good", json!(true), false);
        store
            .flush(&DirtyBatch {
                upserts: vec![good.clone()],
                deletes: vec![],
            })
            .unwrap();
        {
            let conn = store.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO memory_entries
                 (id, namespace, key, entry_type, value, compressed, owner, access_level,
                  created_at, updated_at, last_accessed_at)
                 VALUES ('not-a-uuid', 'ns', 'bad', 'x', X'00', 1, 'o', 'shared', 'a', 'b', 'c')",
                [],
            )
            .unwrap();
        }
        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, good.id);
    }

    #[test]
    fn test_file_database_reports_disk_usage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("memory.db");
        let store = SnapshotStore::open(&path).unwrap();
        store
            .flush(&DirtyBatch {
                upserts: vec![entry("k", json!(1), false)],
                deletes: vec![],
            })
            .unwrap();
        assert!(store.disk_usage() > 0);
        assert_eq!(SnapshotStore::open_in_memory().unwrap().disk_usage(), 0);
    }
}
