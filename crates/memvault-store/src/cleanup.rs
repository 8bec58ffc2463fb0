//! Retention and cleanup.
//!
//! A pass first plans one action per affected entry from a snapshot, then
//! applies the plan one entry at a time. Every removal and rewrite is
//! re-validated under the entry's shard lock (same id, same version), so an
//! entry changed since planning is left alone. Removals also require the
//! same last access, so an entry read since planning is kept.

use crate::codec::json::JsonCodec;
use crate::codec::EntryCodec;
use crate::index::IndexManager;
use crate::record::{EntryKey, StoredEntry, StoredValue};
use crate::repository::{EntryRepository, WriteOutcome, WritePolicy};
use chrono::{DateTime, Duration, Utc};
use memvault_types::cleanup::{ArchivePolicy, CleanupOptions, CleanupResult};
use memvault_types::entry::EntryId;
use memvault_types::error::MemoryResult;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Why an entry is removed outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    Expired,
    TooOld,
    Unaccessed,
    Orphaned,
    Duplicate,
}

impl RemovalReason {
    fn as_str(self) -> &'static str {
        match self {
            RemovalReason::Expired => "expired",
            RemovalReason::TooOld => "older than retention age",
            RemovalReason::Unaccessed => "not accessed within retention window",
            RemovalReason::Orphaned => "orphaned",
            RemovalReason::Duplicate => "duplicate",
        }
    }
}

/// The single action planned for one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlannedAction {
    Remove(RemovalReason),
    Archive,
    Compress,
}

/// One entry's planned action, pinned to the state it was planned against.
#[derive(Debug, Clone)]
pub struct Planned {
    pub key: EntryKey,
    pub id: EntryId,
    pub version: u64,
    pub last_accessed_at: DateTime<Utc>,
    pub action: PlannedAction,
}

impl Planned {
    /// Whether `entry` is still the one this removal was planned against.
    fn still_removable(&self, entry: &StoredEntry) -> bool {
        entry.id == self.id
            && entry.version == self.version
            && entry.last_accessed_at == self.last_accessed_at
    }

    fn describe(&self, dry_run: bool) -> String {
        let verb = match (self.action, dry_run) {
            (PlannedAction::Remove(_), true) => "would remove",
            (PlannedAction::Remove(_), false) => "removed",
            (PlannedAction::Archive, true) => "would archive",
            (PlannedAction::Archive, false) => "archived",
            (PlannedAction::Compress, true) => "would compress",
            (PlannedAction::Compress, false) => "compressed",
        };
        match self.action {
            PlannedAction::Remove(reason) => format!("{verb} {} ({})", self.key, reason.as_str()),
            _ => format!("{verb} {}", self.key),
        }
    }
}

/// Upper bound keeping day arithmetic inside chrono's range.
const MAX_ARCHIVE_DAYS: i64 = 1_000_000;

fn age_at_least(since: DateTime<Utc>, now: DateTime<Utc>, ms: u64) -> bool {
    let threshold = Duration::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX));
    now.signed_duration_since(since) >= threshold
}

fn archive_due(policy: &ArchivePolicy, entry: &StoredEntry, now: DateTime<Utc>) -> bool {
    let days = i64::try_from(policy.older_than).unwrap_or(i64::MAX).min(MAX_ARCHIVE_DAYS);
    policy.enabled && now.signed_duration_since(entry.created_at) >= Duration::days(days)
}

/// Whether the entry's index references disagree with it, or it lacks an
/// owner or namespace.
pub fn is_orphaned(index: &IndexManager, entry: &StoredEntry) -> bool {
    entry.owner.trim().is_empty() || entry.namespace.trim().is_empty() || !index.is_consistent(entry)
}

/// Ids of entries sharing `(namespace, type, value)` with an earlier one.
/// The earliest by `created_at` (then id) in each group is kept.
pub fn duplicate_ids<'a>(entries: impl IntoIterator<Item = &'a StoredEntry>) -> HashSet<EntryId> {
    let mut groups: HashMap<(String, String, String), Vec<&StoredEntry>> = HashMap::new();
    for entry in entries {
        let value = match entry.value.value() {
            Ok(v) => v.to_string(),
            Err(e) => {
                warn!(key = %entry.entry_key(), error = %e, "Skipping unreadable value in duplicate scan");
                continue;
            }
        };
        groups
            .entry((entry.namespace.clone(), entry.entry_type.clone(), value))
            .or_default()
            .push(entry);
    }
    let mut duplicates = HashSet::new();
    for mut group in groups.into_values().filter(|g| g.len() > 1) {
        group.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        duplicates.extend(group.iter().skip(1).map(|e| e.id));
    }
    duplicates
}

/// Retention engine over one repository.
pub struct CleanupEngine<'a> {
    repo: &'a EntryRepository,
    policy: WritePolicy,
}

impl<'a> CleanupEngine<'a> {
    pub fn new(repo: &'a EntryRepository, policy: WritePolicy) -> Self {
        Self { repo, policy }
    }

    /// Decide the action for every affected entry. Removal rules are checked
    /// in order and the first match wins; archival comes next, then
    /// compression. Duplicates are judged among the entries no earlier
    /// removal rule claimed.
    pub fn plan(&self, options: &CleanupOptions, now: DateTime<Utc>) -> MemoryResult<Vec<Planned>> {
        let mut entries = self.repo.snapshot();
        entries.sort_by(|a, b| a.entry_key().cmp(&b.entry_key()));

        let orphaned: HashSet<EntryId> = if options.remove_orphaned {
            let index = self.repo.index_read()?;
            entries
                .iter()
                .filter(|e| is_orphaned(&index, e))
                .map(|e| e.id)
                .collect()
        } else {
            HashSet::new()
        };

        let mut removals: HashMap<EntryId, RemovalReason> = HashMap::new();
        for entry in &entries {
            let reason = if options.remove_expired && entry.is_expired_at(now) {
                Some(RemovalReason::Expired)
            } else if options
                .remove_older_than
                .is_some_and(|ms| age_at_least(entry.created_at, now, ms))
            {
                Some(RemovalReason::TooOld)
            } else if options
                .remove_unaccessed
                .is_some_and(|ms| age_at_least(entry.last_accessed_at, now, ms))
            {
                Some(RemovalReason::Unaccessed)
            } else if orphaned.contains(&entry.id) {
                Some(RemovalReason::Orphaned)
            } else {
                None
            };
            if let Some(reason) = reason {
                removals.insert(entry.id, reason);
            }
        }

        if options.remove_duplicates {
            let survivors = entries.iter().filter(|e| !removals.contains_key(&e.id));
            for id in duplicate_ids(survivors) {
                removals.insert(id, RemovalReason::Duplicate);
            }
        }

        let archive = options.archive_old.as_ref();
        let plan = entries
            .iter()
            .filter_map(|entry| {
                let action = if let Some(reason) = removals.get(&entry.id) {
                    PlannedAction::Remove(*reason)
                } else if archive.is_some_and(|p| archive_due(p, entry, now)) {
                    PlannedAction::Archive
                } else if options.compress_eligible
                    && !entry.value.is_compressed()
                    && entry.size() > self.policy.compression_threshold
                {
                    PlannedAction::Compress
                } else {
                    return None;
                };
                Some(Planned {
                    key: entry.entry_key(),
                    id: entry.id,
                    version: entry.version,
                    last_accessed_at: entry.last_accessed_at,
                    action,
                })
            })
            .collect();
        Ok(plan)
    }

    /// Run one cleanup pass.
    pub fn run(&self, options: &CleanupOptions, now: DateTime<Utc>) -> MemoryResult<CleanupResult> {
        let plan = self.plan(options, now)?;
        self.apply(&plan, options, now)
    }

    /// Carry out `plan`, or only describe it on a dry run.
    pub fn apply(
        &self,
        plan: &[Planned],
        options: &CleanupOptions,
        now: DateTime<Utc>,
    ) -> MemoryResult<CleanupResult> {
        let mut result = CleanupResult::default();

        if options.dry_run {
            result.actions = plan.iter().map(|p| p.describe(true)).collect();
            info!(planned = plan.len(), "Cleanup dry run finished");
            return Ok(result);
        }

        if let Some(policy) = options.archive_old.as_ref() {
            let due: Vec<&Planned> = plan
                .iter()
                .filter(|p| p.action == PlannedAction::Archive)
                .collect();
            self.archive(policy, &due, now, &mut result)?;
        }

        for planned in plan {
            match planned.action {
                PlannedAction::Remove(_) => {
                    let removed = self
                        .repo
                        .remove_if(&planned.key, |e| planned.still_removable(e))?;
                    match removed {
                        Some(entry) => {
                            result.entries_removed += 1;
                            result.space_saved += entry.value.stored_len();
                            result.actions.push(planned.describe(false));
                        }
                        None => debug!(key = %planned.key, "Entry changed since planning; kept"),
                    }
                }
                PlannedAction::Compress => match self.compress(planned) {
                    Ok(Some(saved)) => {
                        result.entries_compressed += 1;
                        result.space_saved += saved;
                        result.actions.push(planned.describe(false));
                    }
                    Ok(None) => debug!(key = %planned.key, "Entry changed since planning; not compressed"),
                    Err(e) => warn!(key = %planned.key, error = %e, "Failed to compress entry"),
                },
                PlannedAction::Archive => {}
            }
        }

        info!(
            removed = result.entries_removed,
            archived = result.entries_archived,
            compressed = result.entries_compressed,
            space_saved = result.space_saved,
            "Cleanup finished"
        );
        Ok(result)
    }

    /// Re-encode one entry compressed. Returns the bytes saved, or `None` if
    /// the entry changed since planning. Compaction does not bump `version`.
    fn compress(&self, planned: &Planned) -> MemoryResult<Option<u64>> {
        self.repo
            .write(planned.key.clone(), self.policy.max_memory_size, |existing| {
                let current = match existing {
                    Some(e)
                        if e.id == planned.id
                            && e.version == planned.version
                            && !e.value.is_compressed() =>
                    {
                        e
                    }
                    _ => return Ok(WriteOutcome::Keep(None)),
                };
                let value = StoredValue::compressed(&current.value.value()?)?;
                let saved = current.value.stored_len().saturating_sub(value.stored_len());
                let next = StoredEntry {
                    value,
                    ..current.clone()
                };
                Ok(WriteOutcome::Put(next, Some(saved)))
            })
    }

    /// Write the due entries to an archive file, then remove each one that is
    /// still unchanged and still old enough. The file is written with no
    /// entry lock held; a write failure aborts before anything is removed.
    fn archive(
        &self,
        policy: &ArchivePolicy,
        due: &[&Planned],
        now: DateTime<Utc>,
        result: &mut CleanupResult,
    ) -> MemoryResult<()> {
        let snapshot: Vec<StoredEntry> = due
            .iter()
            .filter_map(|p| self.repo.read(&p.key).filter(|e| e.id == p.id && e.version == p.version))
            .collect();
        if snapshot.is_empty() {
            return Ok(());
        }
        let entries = snapshot
            .iter()
            .map(StoredEntry::to_entry)
            .collect::<MemoryResult<Vec<_>>>()?;
        let bytes = JsonCodec.encode(&entries)?;
        std::fs::create_dir_all(&policy.archive_path)?;
        let path = archive_file(&policy.archive_path, now);
        std::fs::write(&path, &bytes)?;
        info!(path = %path.display(), entries = entries.len(), "Wrote cleanup archive");

        for entry in &snapshot {
            let removed = self.repo.remove_if(&entry.entry_key(), |e| {
                e.id == entry.id && e.version == entry.version && archive_due(policy, e, now)
            })?;
            if let Some(removed) = removed {
                result.entries_archived += 1;
                result.space_saved += removed.value.stored_len();
                result.actions.push(format!(
                    "archived {} to {}",
                    removed.entry_key(),
                    path.display()
                ));
            }
        }
        Ok(())
    }
}

/// A fresh archive file name under `dir`.
fn archive_file(dir: &Path, now: DateTime<Utc>) -> PathBuf {
    let stamp = now.format("%Y%m%dT%H%M%S%3f");
    let mut path = dir.join(format!("memory-archive-{stamp}.json"));
    let mut n = 1;
    while path.exists() {
        path = dir.join(format!("memory-archive-{stamp}-{n}.json"));
        n += 1;
    }
    path
}

#[cfg(test)]
mod tests {
    use super::*;
    use memvault_types::entry::{MemoryEntry, StoreOptions};
    use serde_json::json;

    fn policy() -> WritePolicy {
        WritePolicy {
            max_memory_size: 1024 * 1024,
            auto_compress: false,
            compression_threshold: 64,
        }
    }

    fn store(repo: &EntryRepository, key: &str, value: serde_json::Value, at: DateTime<Utc>) {
        repo.store(key, value, &StoreOptions::namespace("ns"), policy(), at)
            .unwrap();
    }

    #[test]
    fn test_remove_older_than_zero() {
        let repo = EntryRepository::new();
        let now = Utc::now();
        for i in 0..5 {
            store(&repo, &format!("k{i}"), json!(i), now);
        }
        let engine = CleanupEngine::new(&repo, policy());
        let opts = CleanupOptions {
            remove_older_than: Some(0),
            ..CleanupOptions::dry_run()
        };
        let dry = engine.run(&opts, now).unwrap();
        assert_eq!(dry.entries_removed, 0);
        assert_eq!(dry.actions.len(), 5);
        assert_eq!(repo.len(), 5);

        let real = engine
            .run(&CleanupOptions { dry_run: false, ..opts }, now)
            .unwrap();
        assert_eq!(real.entries_removed, 5);
        assert!(repo.is_empty());
        assert_eq!(repo.resident_bytes(), 0);
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let repo = EntryRepository::new();
        let now = Utc::now();
        repo.store(
            "k",
            json!(1),
            &StoreOptions::namespace("ns").with_ttl_ms(0),
            policy(),
            now,
        )
        .unwrap();
        let opts = CleanupOptions {
            remove_older_than: Some(0),
            ..CleanupOptions::dry_run()
        };
        let result = CleanupEngine::new(&repo, policy()).run(&opts, now).unwrap();
        assert_eq!(result.actions, vec!["would remove ns/k (expired)"]);
    }

    #[test]
    fn test_unaccessed_and_expired_defaults() {
        let repo = EntryRepository::new();
        let old = Utc::now() - Duration::hours(2);
        store(&repo, "stale", json!("s"), old);
        store(&repo, "fresh", json!("f"), Utc::now());
        let opts = CleanupOptions {
            remove_unaccessed: Some(60 * 60 * 1000),
            ..Default::default()
        };
        let result = CleanupEngine::new(&repo, policy())
            .run(&opts, Utc::now())
            .unwrap();
        assert_eq!(result.entries_removed, 1);
        assert!(!repo.contains(&EntryKey::new("ns", "stale")));
        assert!(repo.contains(&EntryKey::new("ns", "fresh")));
    }

    #[test]
    fn test_duplicates_keep_earliest() {
        let repo = EntryRepository::new();
        let t0 = Utc::now() - Duration::minutes(3);
        store(&repo, "first", json!({"a": 1}), t0);
        store(&repo, "second", json!({"a": 1}), t0 + Duration::minutes(1));
        store(&repo, "other", json!({"a": 2}), t0 + Duration::minutes(2));
        let opts = CleanupOptions {
            remove_duplicates: true,
            ..Default::default()
        };
        let result = CleanupEngine::new(&repo, policy())
            .run(&opts, Utc::now())
            .unwrap();
        assert_eq!(result.entries_removed, 1);
        assert!(repo.contains(&EntryKey::new("ns", "first")));
        assert!(!repo.contains(&EntryKey::new("ns", "second")));
        assert!(repo.contains(&EntryKey::new("ns", "other")));
    }

    #[test]
    fn test_orphan_with_blank_owner() {
        let repo = EntryRepository::new();
        let now = Utc::now();
        let entry = MemoryEntry {
            id: EntryId::new(),
            key: "ghost".into(),
            namespace: "ns".into(),
            entry_type: "number".into(),
            value: json!(1),
            tags: vec![],
            owner: "".into(),
            access_level: Default::default(),
            size: 0,
            version: 1,
            compressed: false,
            created_at: now,
            updated_at: now,
            last_accessed_at: now,
            expires_at: None,
            metadata: Default::default(),
        };
        repo.load(vec![StoredEntry::from_entry(entry).unwrap()])
            .unwrap();
        store(&repo, "fine", json!(2), now);

        let result = CleanupEngine::new(&repo, policy())
            .run(&CleanupOptions::default(), now)
            .unwrap();
        assert_eq!(result.entries_removed, 1);
        assert_eq!(result.actions, vec!["removed ns/ghost (orphaned)"]);
        assert_eq!(repo.len(), 1);
    }

    #[test]
    fn test_compress_eligible_saves_space() {
        let repo = EntryRepository::new();
        let now = Utc::now();
        let big = json!("abc".repeat(200));
        store(&repo, "big", big.clone(), now);
        store(&repo, "small", json!("x"), now);

        let result = CleanupEngine::new(&repo, policy())
            .run(&CleanupOptions::default(), now)
            .unwrap();
        assert_eq!(result.entries_compressed, 1);
        assert_eq!(result.entries_removed, 0);
        assert!(result.space_saved > 0);

        let entry = repo.read(&EntryKey::new("ns", "big")).unwrap();
        assert!(entry.value.is_compressed());
        assert_eq!(entry.version, 1);
        assert_eq!(entry.value.value().unwrap(), big);
    }

    #[test]
    fn test_archive_writes_file_then_removes() {
        let dir = tempfile::tempdir().unwrap();
        let repo = EntryRepository::new();
        let now = Utc::now();
        store(&repo, "ancient", json!("old"), now - Duration::days(40));
        store(&repo, "recent", json!("new"), now - Duration::days(1));

        let opts = CleanupOptions {
            archive_old: Some(ArchivePolicy {
                enabled: true,
                older_than: 30,
                archive_path: dir.path().to_path_buf(),
            }),
            ..Default::default()
        };
        let result = CleanupEngine::new(&repo, policy()).run(&opts, now).unwrap();
        assert_eq!(result.entries_archived, 1);
        assert_eq!(result.entries_removed, 0);
        assert!(!repo.contains(&EntryKey::new("ns", "ancient")));
        assert!(repo.contains(&EntryKey::new("ns", "recent")));

        let files: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(files.len(), 1);
        let path = files[0].as_ref().unwrap().path();
        let archived = JsonCodec.decode_strict(&std::fs::read(path).unwrap()).unwrap();
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].key, "ancient");
    }

    #[test]
    fn test_changed_entry_is_not_removed() {
        let repo = EntryRepository::new();
        let now = Utc::now();
        store(&repo, "k", json!(1), now);
        let engine = CleanupEngine::new(&repo, policy());
        let opts = CleanupOptions {
            remove_older_than: Some(0),
            ..Default::default()
        };
        let plan = engine.plan(&opts, now).unwrap();
        assert_eq!(plan.len(), 1);

        store(&repo, "k", json!(2), now);
        let result = engine.apply(&plan, &opts, now).unwrap();
        assert_eq!(result.entries_removed, 0);
        assert!(repo.contains(&EntryKey::new("ns", "k")));
    }

    #[test]
    fn test_entry_read_after_planning_is_kept() {
        let repo = EntryRepository::new();
        let old = Utc::now() - Duration::hours(2);
        store(&repo, "stale", json!("s"), old);
        store(&repo, "idle", json!("i"), old);
        let engine = CleanupEngine::new(&repo, policy());
        let opts = CleanupOptions {
            remove_unaccessed: Some(60 * 60 * 1000),
            ..Default::default()
        };
        let now = Utc::now();
        let plan = engine.plan(&opts, now).unwrap();
        assert_eq!(plan.len(), 2);

        repo.touch(&EntryKey::new("ns", "stale"), now).unwrap();
        let result = engine.apply(&plan, &opts, now).unwrap();
        assert_eq!(result.entries_removed, 1);
        assert!(repo.contains(&EntryKey::new("ns", "stale")));
        assert!(!repo.contains(&EntryKey::new("ns", "idle")));
    }
}
