//! The canonical entry collection and its lifecycle.
//!
//! Entries live in a sharded [`DashMap`] keyed by `(namespace, key)`. A
//! mutation holds the write lock of the entry's shard for its whole
//! read-modify-write, and updates the index while that lock is still held.
//! Lock order is always: snapshot gate (read) -> shard -> index -> dirty set.
//! Nothing else may be acquired in between, and no map operation on
//! `entries` may run while a shard guard is held.

use crate::index::IndexManager;
use crate::record::{EntryKey, StoredEntry, StoredValue};
use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use memvault_types::entry::{
    infer_entry_type, push_unique_tags, EntryId, MemoryEntry, RetrieveOptions, StoreOptions,
    DEFAULT_NAMESPACE, DEFAULT_OWNER,
};
use memvault_types::error::{MemoryError, MemoryResult};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

/// Write-time settings taken from the live configuration.
#[derive(Debug, Clone, Copy)]
pub struct WritePolicy {
    pub max_memory_size: u64,
    pub auto_compress: bool,
    pub compression_threshold: u64,
}

impl WritePolicy {
    /// Whether a value of `size` bytes should be stored compressed.
    pub fn should_compress(&self, size: u64, forced: bool) -> bool {
        forced || (self.auto_compress && size > self.compression_threshold)
    }
}

/// What a write closure decided to do with the slot it was given.
pub enum WriteOutcome<T> {
    /// Replace (or create) the entry and return `T`.
    Put(StoredEntry, T),
    /// Leave the slot untouched and return `T`.
    Keep(T),
}

/// Dirty-set snapshot handed to persistence.
#[derive(Debug, Default)]
pub struct DirtyBatch {
    pub upserts: Vec<StoredEntry>,
    pub deletes: Vec<EntryId>,
}

impl DirtyBatch {
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.deletes.is_empty()
    }
}

/// Entry storage plus its secondary indexes.
pub struct EntryRepository {
    entries: DashMap<EntryKey, StoredEntry>,
    index: RwLock<IndexManager>,
    /// Mutations hold it shared; a consistent snapshot holds it exclusively.
    gate: RwLock<()>,
    dirty: Mutex<HashSet<EntryId>>,
    track_dirty: AtomicBool,
    resident: AtomicU64,
}

impl Default for EntryRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl EntryRepository {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            index: RwLock::new(IndexManager::new()),
            gate: RwLock::new(()),
            dirty: Mutex::new(HashSet::new()),
            track_dirty: AtomicBool::new(false),
            resident: AtomicU64::new(0),
        }
    }

    /// Start recording mutated ids for persistence.
    pub fn enable_dirty_tracking(&self) {
        self.track_dirty.store(true, Ordering::SeqCst);
    }

    fn gate_shared(&self) -> MemoryResult<RwLockReadGuard<'_, ()>> {
        self.gate
            .read()
            .map_err(|e| MemoryError::Internal(e.to_string()))
    }

    pub fn index_read(&self) -> MemoryResult<RwLockReadGuard<'_, IndexManager>> {
        self.index
            .read()
            .map_err(|e| MemoryError::Internal(e.to_string()))
    }

    fn index_write(&self) -> MemoryResult<RwLockWriteGuard<'_, IndexManager>> {
        self.index
            .write()
            .map_err(|e| MemoryError::Internal(e.to_string()))
    }

    fn mark_dirty(&self, id: EntryId) -> MemoryResult<()> {
        if !self.track_dirty.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.dirty
            .lock()
            .map_err(|e| MemoryError::Internal(e.to_string()))?
            .insert(id);
        Ok(())
    }

    /// Account for a resident-size change, refusing growth past `max`.
    fn reserve(&self, old: u64, new: u64, max: u64) -> MemoryResult<()> {
        if new <= old {
            self.resident.fetch_sub(old - new, Ordering::SeqCst);
            return Ok(());
        }
        let grow = new - old;
        self.resident
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                current.checked_add(grow).filter(|next| *next <= max)
            })
            .map(|_| ())
            .map_err(|current| {
                MemoryError::CapacityExceeded(format!(
                    "storing {grow} more bytes would exceed maxMemorySize ({current} of {max} in use)"
                ))
            })
    }

    /// Run a read-modify-write on one `(namespace, key)` slot under its
    /// shard lock. The closure sees the current entry, if any.
    pub fn write<T, F>(&self, key: EntryKey, max_bytes: u64, f: F) -> MemoryResult<T>
    where
        F: FnOnce(Option<&StoredEntry>) -> MemoryResult<WriteOutcome<T>>,
    {
        let _gate = self.gate_shared()?;
        match self.entries.entry(key) {
            Entry::Occupied(mut slot) => match f(Some(slot.get()))? {
                WriteOutcome::Keep(out) => Ok(out),
                WriteOutcome::Put(next, out) => {
                    let mut index = self.index_write()?;
                    let previous = slot.get();
                    self.reserve(previous.resident_bytes(), next.resident_bytes(), max_bytes)?;
                    if previous.id != next.id {
                        index.remove(previous.id);
                        self.mark_dirty(previous.id)?;
                    }
                    index.upsert(&next);
                    self.mark_dirty(next.id)?;
                    slot.insert(next);
                    Ok(out)
                }
            },
            Entry::Vacant(slot) => match f(None)? {
                WriteOutcome::Keep(out) => Ok(out),
                WriteOutcome::Put(next, out) => {
                    let mut index = self.index_write()?;
                    self.reserve(0, next.resident_bytes(), max_bytes)?;
                    index.upsert(&next);
                    self.mark_dirty(next.id)?;
                    slot.insert(next);
                    Ok(out)
                }
            },
        }
    }

    /// Remove the entry at `key` if `pred` accepts it. Returns the removed entry.
    pub fn remove_if<P>(&self, key: &EntryKey, pred: P) -> MemoryResult<Option<StoredEntry>>
    where
        P: FnOnce(&StoredEntry) -> bool,
    {
        let _gate = self.gate_shared()?;
        match self.entries.entry(key.clone()) {
            Entry::Occupied(slot) => {
                if !pred(slot.get()) {
                    return Ok(None);
                }
                let mut index = self.index_write()?;
                let removed = slot.remove();
                index.remove(removed.id);
                self.resident
                    .fetch_sub(removed.resident_bytes(), Ordering::SeqCst);
                self.mark_dirty(removed.id)?;
                Ok(Some(removed))
            }
            Entry::Vacant(_) => Ok(None),
        }
    }

    /// Delete by id. False if the id is unknown.
    pub fn delete_by_id(&self, id: EntryId) -> MemoryResult<bool> {
        let key = match self.index_read()?.key_of(id) {
            Some(key) => key.clone(),
            None => return Ok(false),
        };
        Ok(self.remove_if(&key, |e| e.id == id)?.is_some())
    }

    /// Whether `id` is already indexed under a key other than `key`.
    pub fn id_taken_elsewhere(&self, id: EntryId, key: &EntryKey) -> MemoryResult<bool> {
        Ok(self.index_read()?.key_of(id).is_some_and(|k| k != key))
    }

    pub fn contains(&self, key: &EntryKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Clone of the entry at `key`.
    pub fn read(&self, key: &EntryKey) -> Option<StoredEntry> {
        self.entries.get(key).map(|e| e.value().clone())
    }

    /// Bump `last_accessed_at` in place.
    pub fn touch(&self, key: &EntryKey, now: DateTime<Utc>) -> MemoryResult<Option<StoredEntry>> {
        let _gate = self.gate_shared()?;
        let touched = match self.entries.get_mut(key) {
            Some(mut entry) => {
                entry.last_accessed_at = now;
                Some(entry.value().clone())
            }
            None => None,
        };
        if let Some(entry) = &touched {
            self.mark_dirty(entry.id)?;
        }
        Ok(touched)
    }

    /// Clones of the entries whose ids the index resolves. Ids with no live
    /// entry, or whose slot now holds a different id, are dropped.
    pub fn read_ids(&self, ids: impl IntoIterator<Item = EntryId>) -> MemoryResult<Vec<StoredEntry>> {
        let keys: Vec<(EntryId, EntryKey)> = {
            let index = self.index_read()?;
            ids.into_iter()
                .filter_map(|id| index.key_of(id).map(|k| (id, k.clone())))
                .collect()
        };
        Ok(keys
            .into_iter()
            .filter_map(|(id, key)| self.read(&key).filter(|e| e.id == id))
            .collect())
    }

    /// Clone every entry, shard by shard. Not a point-in-time view.
    pub fn snapshot(&self) -> Vec<StoredEntry> {
        self.entries.iter().map(|e| e.value().clone()).collect()
    }

    /// Clone every entry while mutations are excluded.
    pub fn consistent_snapshot(&self) -> MemoryResult<Vec<StoredEntry>> {
        let _gate = self
            .gate
            .write()
            .map_err(|e| MemoryError::Internal(e.to_string()))?;
        Ok(self.snapshot())
    }

    /// Keys of every entry.
    pub fn keys(&self) -> Vec<EntryKey> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Estimated resident bytes across all entries.
    pub fn resident_bytes(&self) -> u64 {
        self.resident.load(Ordering::SeqCst)
    }

    /// Bulk-insert entries read back from persistence. No capacity check and
    /// no dirty marking.
    pub fn load(&self, entries: Vec<StoredEntry>) -> MemoryResult<usize> {
        let _gate = self.gate_shared()?;
        let mut loaded = 0;
        for entry in entries {
            let added = entry.resident_bytes();
            match self.entries.entry(entry.entry_key()) {
                Entry::Occupied(mut slot) => {
                    let mut index = self.index_write()?;
                    index.remove(slot.get().id);
                    index.upsert(&entry);
                    self.resident
                        .fetch_sub(slot.get().resident_bytes(), Ordering::SeqCst);
                    slot.insert(entry);
                }
                Entry::Vacant(slot) => {
                    self.index_write()?.upsert(&entry);
                    slot.insert(entry);
                }
            }
            self.resident.fetch_add(added, Ordering::SeqCst);
            loaded += 1;
        }
        Ok(loaded)
    }

    /// Drain the dirty set into a batch. Entries are read after the dirty
    /// lock is released.
    pub fn take_dirty(&self) -> MemoryResult<DirtyBatch> {
        let ids: Vec<EntryId> = {
            let mut dirty = self
                .dirty
                .lock()
                .map_err(|e| MemoryError::Internal(e.to_string()))?;
            dirty.drain().collect()
        };
        let mut batch = DirtyBatch::default();
        let live = self.read_ids(ids.iter().copied())?;
        let live_ids: HashSet<EntryId> = live.iter().map(|e| e.id).collect();
        batch.deletes = ids.into_iter().filter(|id| !live_ids.contains(id)).collect();
        batch.upserts = live;
        Ok(batch)
    }

    /// Put ids back after a failed flush.
    pub fn restore_dirty(&self, batch: &DirtyBatch) -> MemoryResult<()> {
        let mut dirty = self
            .dirty
            .lock()
            .map_err(|e| MemoryError::Internal(e.to_string()))?;
        dirty.extend(batch.upserts.iter().map(|e| e.id));
        dirty.extend(batch.deletes.iter().copied());
        Ok(())
    }

    /// Create or update the entry at `(namespace, key)`.
    pub fn store(
        &self,
        key: &str,
        value: serde_json::Value,
        options: &StoreOptions,
        policy: WritePolicy,
        now: DateTime<Utc>,
    ) -> MemoryResult<EntryId> {
        if key.trim().is_empty() {
            return Err(MemoryError::Validation("key must not be empty".into()));
        }
        if let Some(ttl) = options.ttl_ms {
            if ttl < 0 {
                return Err(MemoryError::Validation(format!(
                    "ttl must not be negative (got {ttl}ms)"
                )));
            }
        }
        let namespace = match options.namespace.as_deref() {
            Some(ns) if ns.trim().is_empty() => {
                return Err(MemoryError::Validation("namespace must not be empty".into()))
            }
            Some(ns) => ns,
            None => DEFAULT_NAMESPACE,
        };
        if options.owner.as_deref().is_some_and(|o| o.trim().is_empty()) {
            return Err(MemoryError::Validation("owner must not be empty".into()));
        }

        let expires_at = options.ttl_ms.map(|ttl| now + Duration::milliseconds(ttl));
        let tags = options.tags.as_ref().map(|incoming| {
            let mut tags = Vec::with_capacity(incoming.len());
            push_unique_tags(&mut tags, incoming);
            tags
        });

        let size = crate::record::serialized_len(&value)?;
        let stored = StoredValue::new(value, policy.should_compress(size, options.compress))?;
        let entry_key = EntryKey::new(namespace, key);

        self.write(entry_key, policy.max_memory_size, |existing| {
            let next = match existing {
                Some(prev) => StoredEntry {
                    id: prev.id,
                    key: prev.key.clone(),
                    namespace: prev.namespace.clone(),
                    entry_type: options
                        .entry_type
                        .clone()
                        .unwrap_or_else(|| prev.entry_type.clone()),
                    value: stored,
                    tags: tags.unwrap_or_else(|| prev.tags.clone()),
                    owner: options.owner.clone().unwrap_or_else(|| prev.owner.clone()),
                    access_level: options.access_level.unwrap_or(prev.access_level),
                    version: prev.version + 1,
                    created_at: prev.created_at,
                    updated_at: now,
                    last_accessed_at: now,
                    expires_at: expires_at.or(prev.expires_at),
                    metadata: options
                        .metadata
                        .clone()
                        .unwrap_or_else(|| prev.metadata.clone()),
                },
                None => {
                    let entry_type = match &options.entry_type {
                        Some(t) => t.clone(),
                        None => infer_entry_type(&stored.value()?).to_string(),
                    };
                    StoredEntry {
                        id: EntryId::new(),
                        key: key.to_string(),
                        namespace: namespace.to_string(),
                        entry_type,
                        value: stored,
                        tags: tags.unwrap_or_default(),
                        owner: options
                            .owner
                            .clone()
                            .unwrap_or_else(|| DEFAULT_OWNER.to_string()),
                        access_level: options.access_level.unwrap_or_default(),
                        version: 1,
                        created_at: now,
                        updated_at: now,
                        last_accessed_at: now,
                        expires_at,
                        metadata: options.metadata.clone().unwrap_or_default(),
                    }
                }
            };
            debug!(
                namespace = %next.namespace,
                key = %next.key,
                version = next.version,
                compressed = next.value.is_compressed(),
                "Stored entry"
            );
            let id = next.id;
            Ok(WriteOutcome::Put(next, id))
        })
    }

    /// Look up `(namespace, key)`, optionally bumping `last_accessed_at`.
    pub fn retrieve(
        &self,
        key: &str,
        options: &RetrieveOptions,
        now: DateTime<Utc>,
    ) -> MemoryResult<Option<MemoryEntry>> {
        let entry_key = EntryKey::new(options.namespace.as_deref().unwrap_or(DEFAULT_NAMESPACE), key);
        let found = match self.read(&entry_key) {
            Some(e) if options.exclude_expired && e.is_expired_at(now) => None,
            Some(_) if options.update_last_accessed => self.touch(&entry_key, now)?,
            other => other,
        };
        found.map(|e| e.to_entry()).transpose()
    }

    pub fn list_namespaces(&self) -> MemoryResult<Vec<String>> {
        Ok(self.index_read()?.namespaces())
    }

    pub fn list_types(&self) -> MemoryResult<Vec<String>> {
        Ok(self.index_read()?.types())
    }

    pub fn list_tags(&self) -> MemoryResult<Vec<String>> {
        Ok(self.index_read()?.tags())
    }
}
