//! Export and import pipeline.
//!
//! Export: filter a point-in-time snapshot, encode, optionally gzip and
//! encrypt, write, checksum. Import: read, decrypt/decompress as detected,
//! decode, then resolve each entry against the store under the requested
//! conflict strategy. Import mutates one entry at a time and recovers per
//! entry.

use crate::codec::{envelope, CodecRegistry};
use crate::query;
use crate::record::{serialized_len, EntryKey, StoredEntry, StoredValue};
use crate::repository::{EntryRepository, WriteOutcome, WritePolicy};
use chrono::{DateTime, Utc};
use memvault_types::entry::{push_unique_tags, EntryId, MemoryEntry};
use memvault_types::error::{MemoryError, MemoryResult};
use memvault_types::query::{QueryOptions, SortOrder};
use memvault_types::transfer::{
    ConflictResolution, ExportFormat, ExportOptions, ExportResult, ImportConflict, ImportOptions,
    ImportResult,
};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info, warn};

/// Hex SHA-256 of a byte slice.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Export format: declared, else from the extension, else JSON.
pub fn export_format(destination: &Path, declared: Option<ExportFormat>) -> ExportFormat {
    declared
        .or_else(|| ExportFormat::from_path(destination))
        .unwrap_or(ExportFormat::Json)
}

/// Import format: declared, else from the extension. Undeterminable is a
/// configuration error.
pub fn import_format(source: &Path, declared: Option<ExportFormat>) -> MemoryResult<ExportFormat> {
    declared
        .or_else(|| ExportFormat::from_path(source))
        .ok_or_else(|| {
            MemoryError::Config(format!(
                "cannot determine import format for '{}'; pass a format explicitly",
                source.display()
            ))
        })
}

/// The query an export runs against its snapshot.
fn export_filter(opts: &ExportOptions) -> QueryOptions {
    let mut filter = opts.filtering.clone().unwrap_or_else(|| QueryOptions {
        include_expired: true,
        sort_by: Some("key".into()),
        sort_order: Some(SortOrder::Asc),
        ..Default::default()
    });
    if opts.namespace.is_some() {
        filter.namespace = opts.namespace.clone();
    }
    if opts.entry_type.is_some() {
        filter.entry_type = opts.entry_type.clone();
    }
    filter
}

pub fn export(
    repo: &EntryRepository,
    codecs: &CodecRegistry,
    destination: &Path,
    opts: &ExportOptions,
    now: DateTime<Utc>,
) -> MemoryResult<ExportResult> {
    let format = export_format(destination, opts.format);
    let passphrase = envelope::passphrase(opts.encryption.as_ref())?;
    let codec = codecs.get(format)?;
    let filter = export_filter(opts);

    let snapshot = repo.consistent_snapshot()?;
    let selected = query::filter_entries(snapshot, &filter, now)?;
    let selected = query::page(selected, filter.offset, filter.limit);

    let strip_metadata =
        opts.include_metadata == Some(false) || filter.include_metadata == Some(false);
    let entries = selected
        .iter()
        .map(|e| {
            let mut entry = e.to_entry()?;
            if strip_metadata {
                entry.metadata.clear();
            }
            Ok(entry)
        })
        .collect::<MemoryResult<Vec<_>>>()?;

    let encoded = codec.encode(&entries)?;
    let bytes = envelope::seal(encoded, opts.compression, passphrase)?;

    if let Some(parent) = destination.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(destination, &bytes)?;

    let result = ExportResult {
        entries_exported: entries.len(),
        file_size: bytes.len() as u64,
        checksum: sha256_hex(&bytes),
    };
    info!(
        path = %destination.display(),
        %format,
        entries = result.entries_exported,
        bytes = result.file_size,
        compressed = opts.compression,
        encrypted = passphrase.is_some(),
        "Export complete"
    );
    Ok(result)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Applied {
    Imported,
    Updated,
    Skipped,
}

struct Resolved {
    applied: Applied,
    conflict: Option<ImportConflict>,
}

impl Resolved {
    fn clean(applied: Applied) -> Self {
        Self {
            applied,
            conflict: None,
        }
    }

    fn conflicted(
        applied: Applied,
        key: &EntryKey,
        strategy: ConflictResolution,
        what: String,
    ) -> Self {
        Self {
            applied,
            conflict: Some(ImportConflict {
                namespace: key.namespace.clone(),
                key: key.key.clone(),
                resolution: strategy,
                description: format!("{key} already exists; {what}"),
            }),
        }
    }
}

/// Rules `store` enforces on every entry. Imports apply them regardless of
/// the `validation` option.
fn check_identity(entry: &MemoryEntry) -> Result<(), String> {
    if entry.key.trim().is_empty() {
        return Err("empty key".into());
    }
    if entry.namespace.trim().is_empty() {
        return Err(format!("'{}' has an empty namespace", entry.key));
    }
    if entry.owner.trim().is_empty() {
        return Err(format!("'{}' has an empty owner", entry.key));
    }
    Ok(())
}

/// Stricter checks applied when `validation` is requested.
fn validate(entry: &MemoryEntry) -> Result<(), String> {
    check_identity(entry)?;
    if entry.entry_type.trim().is_empty() {
        return Err(format!("'{}' has an empty type", entry.key));
    }
    if entry.version == 0 {
        return Err(format!("'{}' has version 0", entry.key));
    }
    Ok(())
}

/// `<key>_<n>` for the smallest `n >= 1` that `taken` rejects.
fn renamed_key(key: &EntryKey, mut taken: impl FnMut(&EntryKey) -> bool) -> EntryKey {
    let mut n: u64 = 1;
    loop {
        let candidate = EntryKey::new(key.namespace.clone(), format!("{}_{n}", key.key));
        if !taken(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

/// Turn an incoming entry into the stored form for `key`. When replacing
/// `previous`, identity and version history continue from it.
fn adopt(
    repo: &EntryRepository,
    incoming: &MemoryEntry,
    key: &EntryKey,
    previous: Option<&StoredEntry>,
    policy: WritePolicy,
    now: DateTime<Utc>,
) -> MemoryResult<StoredEntry> {
    let mut entry = incoming.clone();
    entry.namespace = key.namespace.clone();
    entry.key = key.key.clone();
    let size = serialized_len(&entry.value)?;
    entry.compressed = policy.should_compress(size, entry.compressed);
    match previous {
        Some(prev) => {
            entry.id = prev.id;
            entry.version = prev.version + 1;
            entry.created_at = prev.created_at;
            entry.updated_at = now;
        }
        None => {
            if repo.id_taken_elsewhere(entry.id, key)? {
                entry.id = EntryId::new();
            }
        }
    }
    StoredEntry::from_entry(entry)
}

/// Union tags and metadata into `previous`; value, type and owner come from
/// `incoming`.
fn merge(
    previous: &StoredEntry,
    incoming: &MemoryEntry,
    policy: WritePolicy,
    now: DateTime<Utc>,
) -> MemoryResult<StoredEntry> {
    let mut tags = previous.tags.clone();
    push_unique_tags(&mut tags, &incoming.tags);
    let mut metadata = previous.metadata.clone();
    metadata.extend(incoming.metadata.clone());
    let size = serialized_len(&incoming.value)?;
    let value = StoredValue::new(
        incoming.value.clone(),
        policy.should_compress(size, incoming.compressed),
    )?;
    Ok(StoredEntry {
        id: previous.id,
        key: previous.key.clone(),
        namespace: previous.namespace.clone(),
        entry_type: incoming.entry_type.clone(),
        value,
        tags,
        owner: incoming.owner.clone(),
        access_level: previous.access_level,
        version: previous.version + 1,
        created_at: previous.created_at,
        updated_at: now,
        last_accessed_at: previous.last_accessed_at,
        expires_at: previous.expires_at,
        metadata,
    })
}

/// Decide an entry's fate without touching the store. `planned` holds keys
/// earlier entries of the same dry run would have created.
fn plan(
    repo: &EntryRepository,
    key: &EntryKey,
    strategy: ConflictResolution,
    planned: &mut HashSet<EntryKey>,
) -> Resolved {
    let taken = |planned: &HashSet<EntryKey>, k: &EntryKey| planned.contains(k) || repo.contains(k);
    if !taken(planned, key) {
        planned.insert(key.clone());
        return Resolved::clean(Applied::Imported);
    }
    match strategy {
        ConflictResolution::Skip => {
            Resolved::conflicted(Applied::Skipped, key, strategy, "would skip".into())
        }
        ConflictResolution::Overwrite => {
            Resolved::conflicted(Applied::Updated, key, strategy, "would overwrite".into())
        }
        ConflictResolution::Merge => Resolved::conflicted(
            Applied::Updated,
            key,
            strategy,
            "would merge tags and metadata".into(),
        ),
        ConflictResolution::Rename => {
            let renamed = renamed_key(key, |k| taken(planned, k));
            let what = format!("would import as '{}'", renamed.key);
            planned.insert(renamed);
            Resolved::conflicted(Applied::Imported, key, strategy, what)
        }
    }
}

/// Resolve and apply one entry under its shard lock.
fn apply(
    repo: &EntryRepository,
    key: &EntryKey,
    incoming: &MemoryEntry,
    strategy: ConflictResolution,
    policy: WritePolicy,
    now: DateTime<Utc>,
) -> MemoryResult<Resolved> {
    let max = policy.max_memory_size;
    let resolved = repo.write(key.clone(), max, |existing| {
        let Some(prev) = existing else {
            let entry = adopt(repo, incoming, key, None, policy, now)?;
            return Ok(WriteOutcome::Put(entry, Some(Resolved::clean(Applied::Imported))));
        };
        Ok(match strategy {
            ConflictResolution::Skip => WriteOutcome::Keep(Some(Resolved::conflicted(
                Applied::Skipped,
                key,
                strategy,
                "skipped".into(),
            ))),
            ConflictResolution::Overwrite => WriteOutcome::Put(
                adopt(repo, incoming, key, Some(prev), policy, now)?,
                Some(Resolved::conflicted(
                    Applied::Updated,
                    key,
                    strategy,
                    "overwritten".into(),
                )),
            ),
            ConflictResolution::Merge => WriteOutcome::Put(
                merge(prev, incoming, policy, now)?,
                Some(Resolved::conflicted(
                    Applied::Updated,
                    key,
                    strategy,
                    "merged tags and metadata".into(),
                )),
            ),
            // Resolved below, one candidate slot at a time.
            ConflictResolution::Rename => WriteOutcome::Keep(None),
        })
    })?;
    if let Some(resolved) = resolved {
        return Ok(resolved);
    }

    let mut n: u64 = 1;
    loop {
        let candidate = EntryKey::new(key.namespace.clone(), format!("{}_{n}", key.key));
        let placed = repo.write(candidate.clone(), max, |existing| {
            if existing.is_some() {
                return Ok(WriteOutcome::Keep(false));
            }
            let entry = adopt(repo, incoming, &candidate, None, policy, now)?;
            Ok(WriteOutcome::Put(entry, true))
        })?;
        if placed {
            return Ok(Resolved::conflicted(
                Applied::Imported,
                key,
                strategy,
                format!("imported as '{}'", candidate.key),
            ));
        }
        n += 1;
    }
}

fn skip_invalid(result: &mut ImportResult, n: usize, reason: &str) {
    warn!(index = n, %reason, "Skipping invalid imported entry");
    result.errors.push(format!("entry {}: {reason}", n + 1));
    result.entries_skipped += 1;
}

pub fn import(
    repo: &EntryRepository,
    codecs: &CodecRegistry,
    source: &Path,
    opts: &ImportOptions,
    policy: WritePolicy,
    now: DateTime<Utc>,
) -> MemoryResult<ImportResult> {
    let format = import_format(source, opts.format)?;
    let passphrase = envelope::passphrase(opts.encryption.as_ref())?;
    let codec = codecs.get(format)?;

    let raw = std::fs::read(source)?;
    let bytes = envelope::open(raw, passphrase)?;
    let decoded = codec.decode(&bytes)?;
    debug!(path = %source.display(), %format, entries = decoded.len(), "Decoded import payload");

    let mut result = ImportResult::default();
    let mut planned = HashSet::new();
    for (n, decoded) in decoded.into_iter().enumerate() {
        let mut incoming = match decoded {
            Ok(entry) => entry,
            Err(e) => {
                skip_invalid(&mut result, n, &e.to_string());
                continue;
            }
        };
        if let Some(ns) = &opts.namespace {
            incoming.namespace = ns.clone();
        }
        let checked = if opts.validation {
            validate(&incoming)
        } else {
            check_identity(&incoming)
        };
        if let Err(reason) = checked {
            skip_invalid(&mut result, n, &reason);
            continue;
        }

        let key = EntryKey::new(incoming.namespace.clone(), incoming.key.clone());
        let resolved = if opts.dry_run {
            Ok(plan(repo, &key, opts.conflict_resolution, &mut planned))
        } else {
            apply(repo, &key, &incoming, opts.conflict_resolution, policy, now)
        };
        match resolved {
            Ok(resolved) => {
                match resolved.applied {
                    Applied::Imported => result.entries_imported += 1,
                    Applied::Updated => result.entries_updated += 1,
                    Applied::Skipped => result.entries_skipped += 1,
                }
                if let Some(conflict) = resolved.conflict {
                    debug!(%key, description = %conflict.description, "Import conflict");
                    result.conflicts.push(conflict);
                }
            }
            Err(e) => {
                warn!(%key, error = %e, "Failed to import entry");
                result.errors.push(format!("{key}: {e}"));
            }
        }
    }

    info!(
        path = %source.display(),
        %format,
        imported = result.entries_imported,
        updated = result.entries_updated,
        skipped = result.entries_skipped,
        conflicts = result.conflicts.len(),
        errors = result.errors.len(),
        dry_run = opts.dry_run,
        "Import complete"
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::json::JsonCodec;
    use crate::codec::EntryCodec;
    use memvault_types::entry::{RetrieveOptions, StoreOptions};
    use memvault_types::transfer::EncryptionOptions;
    use serde_json::json;
    use std::path::PathBuf;

    fn policy() -> WritePolicy {
        WritePolicy {
            max_memory_size: u64::MAX,
            auto_compress: false,
            compression_threshold: 0,
        }
    }

    /// Tags are given comma-separated.
    fn repo_with(entries: &[(&str, &str, serde_json::Value, &str)]) -> EntryRepository {
        let repo = EntryRepository::new();
        for (ns, key, value, tags) in entries {
            let tags = tags.split(',').filter(|t| !t.is_empty());
            let opts = StoreOptions::namespace(*ns).with_tags(tags);
            repo.store(key, value.clone(), &opts, policy(), Utc::now())
                .unwrap();
        }
        repo
    }

    fn write_payload(dir: &Path, name: &str, entries: &[MemoryEntry]) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, JsonCodec.encode(entries).unwrap()).unwrap();
        path
    }

    fn entries_of(repo: &EntryRepository) -> Vec<MemoryEntry> {
        repo.snapshot().iter().map(|e| e.to_entry().unwrap()).collect()
    }

    #[test]
    fn test_format_detection() {
        assert_eq!(export_format(Path::new("x.unknown"), None), ExportFormat::Json);
        assert_eq!(export_format(Path::new("x.yml"), None), ExportFormat::Yaml);
        assert_eq!(
            export_format(Path::new("x.yml"), Some(ExportFormat::Csv)),
            ExportFormat::Csv
        );
        let err = import_format(Path::new("x.dat"), None).unwrap_err();
        assert!(matches!(err, MemoryError::Config(_)));
    }

    #[test]
    fn test_export_checksum_matches_file() {
        let dir = tempfile::tempdir().unwrap();
        let repo = repo_with(&[("ns", "a", json!(1), ""), ("ns", "b", json!(2), "")]);
        let path = dir.path().join("nested/out/data.csv");
        let result = export(
            &repo,
            &CodecRegistry::default(),
            &path,
            &ExportOptions::default(),
            Utc::now(),
        )
        .unwrap();
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(result.entries_exported, 2);
        assert_eq!(result.file_size, bytes.len() as u64);
        assert_eq!(result.checksum, sha256_hex(&bytes));
        assert!(String::from_utf8(bytes).unwrap().starts_with("id,key,"));
    }

    #[test]
    fn test_export_encryption_requires_key() {
        let dir = tempfile::tempdir().unwrap();
        let repo = repo_with(&[("ns", "a", json!(1), "")]);
        let opts = ExportOptions {
            encryption: Some(EncryptionOptions {
                enabled: true,
                key: None,
            }),
            ..Default::default()
        };
        let path = dir.path().join("x.json");
        let err = export(&repo, &CodecRegistry::default(), &path, &opts, Utc::now()).unwrap_err();
        assert!(err.is_validation());
        assert!(!path.exists());
    }

    #[test]
    fn test_compressed_encrypted_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let source = repo_with(&[("ns", "a", json!({"deep": [1, 2]}), "t")]);
        let path = dir.path().join("secure.yaml");
        let opts = ExportOptions {
            compression: true,
            encryption: Some(EncryptionOptions::with_key("pw")),
            ..Default::default()
        };
        export(&source, &CodecRegistry::default(), &path, &opts, Utc::now()).unwrap();
        assert!(envelope::is_encrypted(&std::fs::read(&path).unwrap()));

        let target = EntryRepository::new();
        let import_opts = ImportOptions {
            encryption: Some(EncryptionOptions::with_key("pw")),
            ..Default::default()
        };
        let result = import(
            &target,
            &CodecRegistry::default(),
            &path,
            &import_opts,
            policy(),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(result.entries_imported, 1);
        let got = target
            .retrieve("a", &RetrieveOptions::namespace("ns"), Utc::now())
            .unwrap()
            .unwrap();
        assert_eq!(got.value, json!({"deep": [1, 2]}));
        assert_eq!(got.tags, vec!["t"]);

        let no_key = import(
            &target,
            &CodecRegistry::default(),
            &path,
            &ImportOptions::default(),
            policy(),
            Utc::now(),
        );
        assert!(matches!(no_key, Err(MemoryError::Format(_))));
    }

    #[test]
    fn test_skip_records_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let repo = repo_with(&[("ns", "a", json!("old"), "")]);
        let incoming = entries_of(&repo_with(&[("ns", "a", json!("new"), ""), ("ns", "b", json!(1), "")]));
        let path = write_payload(dir.path(), "in.json", &incoming);

        let result = import(
            &repo,
            &CodecRegistry::default(),
            &path,
            &ImportOptions::default(),
            policy(),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(result.entries_skipped, 1);
        assert_eq!(result.entries_imported, 1);
        assert_eq!(result.conflicts.len(), 1);
        assert_eq!(result.conflicts[0].key, "a");
        let a = repo
            .retrieve("a", &RetrieveOptions::namespace("ns"), Utc::now())
            .unwrap()
            .unwrap();
        assert_eq!(a.value, json!("old"));
    }

    #[test]
    fn test_merge_unions_tags() {
        let dir = tempfile::tempdir().unwrap();
        let repo = repo_with(&[("ns", "k", json!(1), "a")]);
        let incoming = entries_of(&repo_with(&[("ns", "k", json!(2), "b")]));
        let path = write_payload(dir.path(), "in.json", &incoming);

        let opts = ImportOptions {
            conflict_resolution: ConflictResolution::Merge,
            ..Default::default()
        };
        let result = import(&repo, &CodecRegistry::default(), &path, &opts, policy(), Utc::now())
            .unwrap();
        assert_eq!(result.entries_updated, 1);
        let got = repo
            .retrieve("k", &RetrieveOptions::namespace("ns"), Utc::now())
            .unwrap()
            .unwrap();
        assert_eq!(got.tags, vec!["a", "b"]);
        assert_eq!(got.value, json!(2));
        assert_eq!(got.version, 2);
    }

    #[test]
    fn test_rename_picks_smallest_free_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let repo = repo_with(&[("ns", "k", json!(0), ""), ("ns", "k_1", json!(1), "")]);
        let incoming = entries_of(&repo_with(&[("ns", "k", json!(9), "")]));
        let path = write_payload(dir.path(), "in.json", &incoming);
        let opts = ImportOptions {
            conflict_resolution: ConflictResolution::Rename,
            ..Default::default()
        };

        let dry = import(
            &repo,
            &CodecRegistry::default(),
            &path,
            &ImportOptions {
                dry_run: true,
                ..opts.clone()
            },
            policy(),
            Utc::now(),
        )
        .unwrap();
        let real = import(&repo, &CodecRegistry::default(), &path, &opts, policy(), Utc::now())
            .unwrap();
        assert_eq!(dry.entries_imported, real.entries_imported);
        assert!(real.conflicts[0].description.contains("k_2"));
        let got = repo
            .retrieve("k_2", &RetrieveOptions::namespace("ns"), Utc::now())
            .unwrap()
            .unwrap();
        assert_eq!(got.value, json!(9));
        assert_eq!(repo.len(), 3);
    }

    #[test]
    fn test_dry_run_does_not_mutate() {
        let dir = tempfile::tempdir().unwrap();
        let repo = repo_with(&[("ns", "a", json!(1), "")]);
        let incoming = entries_of(&repo_with(&[("ns", "a", json!(2), ""), ("ns", "b", json!(3), "")]));
        let path = write_payload(dir.path(), "in.json", &incoming);
        let opts = ImportOptions {
            conflict_resolution: ConflictResolution::Overwrite,
            dry_run: true,
            ..Default::default()
        };
        let result = import(&repo, &CodecRegistry::default(), &path, &opts, policy(), Utc::now())
            .unwrap();
        assert_eq!(result.entries_updated, 1);
        assert_eq!(result.entries_imported, 1);
        assert_eq!(repo.len(), 1);
        let a = repo
            .retrieve("a", &RetrieveOptions::namespace("ns"), Utc::now())
            .unwrap()
            .unwrap();
        assert_eq!(a.value, json!(1));
    }

    #[test]
    fn test_validation_and_namespace_retarget() {
        let dir = tempfile::tempdir().unwrap();
        let mut incoming = entries_of(&repo_with(&[("ns", "good", json!(1), ""), ("ns", "bad", json!(2), "")]));
        for e in incoming.iter_mut().filter(|e| e.key == "bad") {
            e.owner = String::new();
        }
        let path = write_payload(dir.path(), "in.json", &incoming);
        let repo = EntryRepository::new();
        let opts = ImportOptions {
            namespace: Some("moved".into()),
            validation: true,
            ..Default::default()
        };
        let result = import(&repo, &CodecRegistry::default(), &path, &opts, policy(), Utc::now())
            .unwrap();
        assert_eq!(result.entries_imported, 1);
        assert_eq!(result.errors.len(), 1);
        assert!(repo
            .retrieve("good", &RetrieveOptions::namespace("moved"), Utc::now())
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_blank_identity_rejected_without_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.csv");
        std::fs::write(&path, "key,value,owner,namespace\n,1,,\nkept,2,alice,ns\nnobody,3,,ns\n")
            .unwrap();
        let repo = EntryRepository::new();
        let result = import(
            &repo,
            &CodecRegistry::default(),
            &path,
            &ImportOptions::default(),
            policy(),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(result.entries_imported, 1);
        assert_eq!(result.entries_skipped, 2);
        assert_eq!(result.errors.len(), 2);
        assert_eq!(repo.len(), 1);
        assert!(repo.contains(&EntryKey::new("ns", "kept")));
    }

    #[test]
    fn test_undecodable_records_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.csv");
        std::fs::write(&path, "key,value,accessLevel\ngood,1,shared\nbad,2,secret\n").unwrap();
        let repo = EntryRepository::new();
        let result = import(
            &repo,
            &CodecRegistry::default(),
            &path,
            &ImportOptions::default(),
            policy(),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(result.entries_imported, 1);
        assert_eq!(result.entries_skipped, 1);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].starts_with("entry 2:"));
        assert!(repo.contains(&EntryKey::new("default", "good")));
    }

    #[test]
    fn test_reimport_under_new_namespace_gets_fresh_ids() {
        let dir = tempfile::tempdir().unwrap();
        let repo = repo_with(&[("ns", "a", json!(1), "")]);
        let path = write_payload(dir.path(), "in.json", &entries_of(&repo));
        let opts = ImportOptions {
            namespace: Some("copy".into()),
            ..Default::default()
        };
        import(&repo, &CodecRegistry::default(), &path, &opts, policy(), Utc::now()).unwrap();
        let original = repo
            .retrieve("a", &RetrieveOptions::namespace("ns"), Utc::now())
            .unwrap()
            .unwrap();
        let copy = repo
            .retrieve("a", &RetrieveOptions::namespace("copy"), Utc::now())
            .unwrap()
            .unwrap();
        assert_ne!(original.id, copy.id);
        let snapshot = repo.snapshot();
        let index = repo.index_read().unwrap();
        for e in snapshot {
            assert!(index.is_consistent(&e));
        }
    }
}
