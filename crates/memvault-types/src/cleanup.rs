//! Retention policy options and cleanup results.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default age, in days, past which entries are archived.
pub const DEFAULT_ARCHIVE_AGE_DAYS: u64 = 365;

/// Archive-before-remove policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ArchivePolicy {
    pub enabled: bool,
    /// Entries older than this many days (since `createdAt`) are archived.
    pub older_than: u64,
    /// Directory the JSON archive file is written into.
    pub archive_path: PathBuf,
}

impl Default for ArchivePolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            older_than: DEFAULT_ARCHIVE_AGE_DAYS,
            archive_path: PathBuf::from("./memory/archive"),
        }
    }
}

/// Retention policy for a cleanup pass. Each rule is independently toggleable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CleanupOptions {
    /// Compute and report, but apply nothing.
    pub dry_run: bool,
    pub remove_expired: bool,
    /// Remove entries at least this many milliseconds old (since `createdAt`).
    pub remove_older_than: Option<u64>,
    /// Remove entries unaccessed for at least this many milliseconds.
    pub remove_unaccessed: Option<u64>,
    pub remove_orphaned: bool,
    pub remove_duplicates: bool,
    /// Compress uncompressed entries above the configured threshold.
    pub compress_eligible: bool,
    pub archive_old: Option<ArchivePolicy>,
}

impl Default for CleanupOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            remove_expired: true,
            remove_older_than: None,
            remove_unaccessed: None,
            remove_orphaned: true,
            remove_duplicates: false,
            compress_eligible: true,
            archive_old: None,
        }
    }
}

impl CleanupOptions {
    /// The default policy in dry-run mode.
    pub fn dry_run() -> Self {
        Self {
            dry_run: true,
            ..Default::default()
        }
    }
}

/// Result of a cleanup pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupResult {
    pub entries_removed: usize,
    pub entries_archived: usize,
    pub entries_compressed: usize,
    /// Bytes reclaimed by compression and removal.
    pub space_saved: u64,
    /// One human-readable line per affected entry (what was, or would be, done).
    pub actions: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let opts = CleanupOptions::default();
        assert!(opts.remove_expired);
        assert!(opts.remove_orphaned);
        assert!(!opts.remove_duplicates);
        assert!(opts.compress_eligible);
        assert!(opts.archive_old.is_none());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let opts: CleanupOptions =
            serde_json::from_str(r#"{"removeOlderThan": 0, "dryRun": true}"#).unwrap();
        assert!(opts.dry_run);
        assert_eq!(opts.remove_older_than, Some(0));
        assert!(opts.remove_expired);
    }

    #[test]
    fn test_archive_policy_defaults() {
        let policy: ArchivePolicy = serde_json::from_str(r#"{"olderThan": 30}"#).unwrap();
        assert!(policy.enabled);
        assert_eq!(policy.older_than, 30);
        assert_eq!(policy.archive_path, PathBuf::from("./memory/archive"));
    }
}
