//! The `MemoryStore` facade.
//!
//! Every caller-facing operation goes through here. The facade reads the
//! live configuration, times operations for the performance counters, and
//! flushes the SQLite snapshot after bulk mutations.

use crate::cleanup::CleanupEngine;
use crate::codec::CodecRegistry;
use crate::config::{apply_update, load_config};
use crate::persistence::SnapshotStore;
use crate::query::{self, Narrowing};
use crate::repository::{EntryRepository, WritePolicy};
use crate::stats::{self, PerformanceTracker};
use crate::transfer;
use chrono::Utc;
use memvault_types::cleanup::{CleanupOptions, CleanupResult};
use memvault_types::config::StoreConfig;
use memvault_types::entry::{EntryId, MemoryEntry, RetrieveOptions, StoreOptions};
use memvault_types::error::{MemoryError, MemoryResult};
use memvault_types::query::{QueryOptions, QueryResult};
use memvault_types::stats::Statistics;
use memvault_types::transfer::{ExportOptions, ExportResult, ImportOptions, ImportResult};
use std::path::Path;
use std::sync::RwLock;
use std::time::Instant;
use tracing::{debug, info, warn};

/// An indexed, queryable, optionally persisted memory store.
///
/// `Send + Sync`; share it as `Arc<MemoryStore>`. Pending mutations are
/// flushed to the snapshot when the last handle is dropped.
pub struct MemoryStore {
    repo: EntryRepository,
    config: RwLock<StoreConfig>,
    codecs: CodecRegistry,
    tracker: PerformanceTracker,
    snapshot: Option<SnapshotStore>,
}

impl MemoryStore {
    /// Build a store from `config`. With persistence enabled, the SQLite
    /// snapshot is opened (and created if missing) and its rows loaded.
    pub fn new(config: StoreConfig) -> MemoryResult<Self> {
        config.validate()?;
        let repo = EntryRepository::new();
        let snapshot = if config.persistence_enabled {
            let path = config.resolved_persistence_path();
            let snapshot = SnapshotStore::open(&path)?;
            let loaded = repo.load(snapshot.load_all()?)?;
            repo.enable_dirty_tracking();
            info!(path = %path.display(), entries = loaded, "Loaded persisted memory entries");
            Some(snapshot)
        } else {
            None
        };
        info!(
            persistence = config.persistence_enabled,
            indexing = config.indexing_enabled,
            "Memory store opened"
        );
        Ok(Self {
            repo,
            config: RwLock::new(config),
            codecs: CodecRegistry::default(),
            tracker: PerformanceTracker::new(),
            snapshot,
        })
    }

    /// A store with no persistence and no background cleanup.
    pub fn in_memory() -> MemoryResult<Self> {
        Self::new(StoreConfig::in_memory())
    }

    /// Build a store from a TOML config file (defaults when unusable).
    pub fn from_config_file(path: Option<&Path>) -> MemoryResult<Self> {
        Self::new(load_config(path))
    }

    /// Replace the codec registry, e.g. to add a custom format adapter.
    pub fn with_codecs(mut self, codecs: CodecRegistry) -> Self {
        self.codecs = codecs;
        self
    }

    /// The underlying repository.
    pub fn repository(&self) -> &EntryRepository {
        &self.repo
    }

    fn config_read(&self) -> MemoryResult<std::sync::RwLockReadGuard<'_, StoreConfig>> {
        self.config
            .read()
            .map_err(|e| MemoryError::Internal(e.to_string()))
    }

    fn write_policy(&self) -> MemoryResult<WritePolicy> {
        let config = self.config_read()?;
        Ok(WritePolicy {
            max_memory_size: config.max_memory_size,
            auto_compress: config.auto_compress,
            compression_threshold: config.compression_threshold,
        })
    }

    /// Create or update the entry at `(namespace, key)`.
    pub fn store(
        &self,
        key: &str,
        value: serde_json::Value,
        options: &StoreOptions,
    ) -> MemoryResult<EntryId> {
        let started = Instant::now();
        let policy = self.write_policy()?;
        let id = self.repo.store(key, value, options, policy, Utc::now())?;
        self.tracker.record_write(started.elapsed())?;
        Ok(id)
    }

    /// Look up `(namespace, key)`. Expired entries are returned unless
    /// `exclude_expired` is set.
    pub fn retrieve(&self, key: &str, options: &RetrieveOptions) -> MemoryResult<Option<MemoryEntry>> {
        let found = self.repo.retrieve(key, options, Utc::now())?;
        self.tracker.record_retrieve(found.is_some());
        Ok(found)
    }

    /// Delete by id. `false` when no such entry exists.
    pub fn delete_entry(&self, id: EntryId) -> MemoryResult<bool> {
        let deleted = self.repo.delete_by_id(id)?;
        debug!(%id, deleted, "Delete entry");
        Ok(deleted)
    }

    pub fn query(&self, options: &QueryOptions) -> MemoryResult<QueryResult> {
        let started = Instant::now();
        let use_indexes = self.config_read()?.indexing_enabled;
        let (result, narrowing) = query::execute(&self.repo, options, use_indexes, Utc::now())?;
        self.tracker
            .record_query(started.elapsed(), narrowing == Narrowing::Index)?;
        Ok(result)
    }

    pub fn export(&self, destination: &Path, options: &ExportOptions) -> MemoryResult<ExportResult> {
        transfer::export(&self.repo, &self.codecs, destination, options, Utc::now())
    }

    pub fn import(&self, source: &Path, options: &ImportOptions) -> MemoryResult<ImportResult> {
        let policy = self.write_policy()?;
        let result = transfer::import(&self.repo, &self.codecs, source, options, policy, Utc::now())?;
        if !options.dry_run {
            self.flush_after("import");
        }
        Ok(result)
    }

    pub fn cleanup(&self, options: &CleanupOptions) -> MemoryResult<CleanupResult> {
        let policy = self.write_policy()?;
        let result = CleanupEngine::new(&self.repo, policy).run(options, Utc::now())?;
        if !options.dry_run {
            self.flush_after("cleanup");
        }
        Ok(result)
    }

    pub fn statistics(&self) -> MemoryResult<Statistics> {
        let threshold = self.config_read()?.compression_threshold;
        let disk = self.snapshot.as_ref().map_or(0, SnapshotStore::disk_usage);
        stats::statistics(&self.repo, &self.tracker, threshold, disk, Utc::now())
    }

    pub fn list_namespaces(&self) -> MemoryResult<Vec<String>> {
        self.repo.list_namespaces()
    }

    pub fn list_types(&self) -> MemoryResult<Vec<String>> {
        self.repo.list_types()
    }

    pub fn list_tags(&self) -> MemoryResult<Vec<String>> {
        self.repo.list_tags()
    }

    /// Current configuration.
    pub fn configuration(&self) -> MemoryResult<StoreConfig> {
        Ok(self.config_read()?.clone())
    }

    /// Deep-merge a partial JSON object into the configuration, validate it,
    /// and swap it in. Persistence settings apply on the next open.
    pub fn update_configuration(&self, patch: &serde_json::Value) -> MemoryResult<StoreConfig> {
        let mut config = self
            .config
            .write()
            .map_err(|e| MemoryError::Internal(e.to_string()))?;
        let next = apply_update(&config, patch)?;
        if next.persistence_enabled != config.persistence_enabled
            || next.persistence_path != config.persistence_path
        {
            info!("Persistence settings changed; they take effect when the store is reopened");
        }
        *config = next.clone();
        info!("Configuration updated");
        Ok(next)
    }

    /// Whether a SQLite snapshot backs this store.
    pub fn is_persistent(&self) -> bool {
        self.snapshot.is_some()
    }

    /// Write pending mutations to the snapshot. Returns how many rows were
    /// written or deleted. On failure the pending set is kept for the next
    /// flush.
    pub fn flush(&self) -> MemoryResult<usize> {
        let Some(snapshot) = &self.snapshot else {
            return Ok(0);
        };
        let batch = self.repo.take_dirty()?;
        if batch.is_empty() {
            return Ok(0);
        }
        match snapshot.flush(&batch) {
            Ok(()) => Ok(batch.upserts.len() + batch.deletes.len()),
            Err(e) => {
                self.repo.restore_dirty(&batch)?;
                Err(e)
            }
        }
    }

    fn flush_after(&self, operation: &str) {
        if let Err(e) = self.flush() {
            warn!(operation, error = %e, "Snapshot flush failed; will retry on next flush");
        }
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        self.flush_after("drop");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_store_retrieve_version_two() {
        let store = MemoryStore::in_memory().unwrap();
        let ns = StoreOptions::namespace("ns1");
        store.store("a", json!("1"), &ns).unwrap();
        store.store("a", json!("2"), &ns).unwrap();
        let got = store
            .retrieve("a", &RetrieveOptions::namespace("ns1"))
            .unwrap()
            .unwrap();
        assert_eq!(got.value, json!("2"));
        assert_eq!(got.version, 2);
    }

    #[test]
    fn test_counters_follow_operations() {
        let store = MemoryStore::in_memory().unwrap();
        store.store("k", json!(1), &StoreOptions::default()).unwrap();
        store.retrieve("k", &RetrieveOptions::default()).unwrap();
        store.retrieve("missing", &RetrieveOptions::default()).unwrap();
        store
            .query(&QueryOptions {
                namespace: Some("default".into()),
                ..Default::default()
            })
            .unwrap();
        store.query(&QueryOptions::default()).unwrap();

        let perf = store.statistics().unwrap().performance;
        assert_eq!(perf.total_writes, 1);
        assert_eq!(perf.total_queries, 2);
        assert!((perf.cache_hit_ratio - 0.5).abs() < 1e-9);
        assert!((perf.index_efficiency - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_indexing_disabled_still_answers() {
        let store = MemoryStore::in_memory().unwrap();
        store
            .store("k", json!(1), &StoreOptions::namespace("ns"))
            .unwrap();
        store
            .update_configuration(&json!({"indexingEnabled": false}))
            .unwrap();
        let result = store
            .query(&QueryOptions {
                namespace: Some("ns".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(result.total, 1);
        assert_eq!(store.statistics().unwrap().performance.index_efficiency, 0.0);
    }

    #[test]
    fn test_update_configuration_changes_write_policy() {
        let store = MemoryStore::in_memory().unwrap();
        store
            .update_configuration(&json!({"maxMemorySize": 64}))
            .unwrap();
        let err = store
            .store("big", json!("z".repeat(500)), &StoreOptions::default())
            .unwrap_err();
        assert!(matches!(err, MemoryError::CapacityExceeded(_)));

        let err = store
            .update_configuration(&json!({"maxMemorySize": 0}))
            .unwrap_err();
        assert!(err.is_validation());
        assert_eq!(store.configuration().unwrap().max_memory_size, 64);
    }

    #[test]
    fn test_flush_without_persistence_is_noop() {
        let store = MemoryStore::in_memory().unwrap();
        store.store("k", json!(1), &StoreOptions::default()).unwrap();
        assert!(!store.is_persistent());
        assert_eq!(store.flush().unwrap(), 0);
    }
}
