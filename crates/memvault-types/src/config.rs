//! Store configuration schema.

use crate::error::{MemoryError, MemoryResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Name of the directory under the user's home that holds store files.
pub const HOME_DIR_NAME: &str = ".memvault";

/// Configuration for a `MemoryStore`.
///
/// Every field has a default, so partial TOML files and partial JSON updates
/// deserialize cleanly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreConfig {
    /// Upper bound on resident stored bytes.
    pub max_memory_size: u64,
    /// Compress values above `compression_threshold` on write.
    pub auto_compress: bool,
    /// Logical value size, in bytes, above which a value is compression-eligible.
    pub compression_threshold: u64,
    /// Let the background service run periodic cleanup passes.
    pub auto_cleanup: bool,
    pub cleanup_interval_secs: u64,
    /// Use secondary indexes to narrow queries.
    pub indexing_enabled: bool,
    pub persistence_enabled: bool,
    /// SQLite snapshot location; defaults to `~/.memvault/memory.db`.
    pub persistence_path: Option<PathBuf>,
    pub flush_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_memory_size: 1024 * 1024 * 1024,
            auto_compress: true,
            compression_threshold: 10 * 1024,
            auto_cleanup: true,
            cleanup_interval_secs: 3600,
            indexing_enabled: true,
            persistence_enabled: false,
            persistence_path: None,
            flush_interval_secs: 30,
        }
    }
}

impl StoreConfig {
    /// Config for a purely in-memory store (no persistence, no auto-cleanup).
    pub fn in_memory() -> Self {
        Self {
            auto_cleanup: false,
            persistence_enabled: false,
            ..Default::default()
        }
    }

    /// Effective persistence path.
    pub fn resolved_persistence_path(&self) -> PathBuf {
        self.persistence_path
            .clone()
            .unwrap_or_else(|| default_home_dir().join("memory.db"))
    }

    /// Reject values that would make the store misbehave.
    pub fn validate(&self) -> MemoryResult<()> {
        if self.max_memory_size == 0 {
            return Err(MemoryError::Validation(
                "maxMemorySize must be greater than zero".into(),
            ));
        }
        if self.auto_cleanup && self.cleanup_interval_secs == 0 {
            return Err(MemoryError::Validation(
                "cleanupIntervalSecs must be greater than zero when autoCleanup is on".into(),
            ));
        }
        if self.persistence_enabled && self.flush_interval_secs == 0 {
            return Err(MemoryError::Validation(
                "flushIntervalSecs must be greater than zero when persistence is on".into(),
            ));
        }
        Ok(())
    }
}

/// `~/.memvault`, or `./.memvault` when no home directory is known.
pub fn default_home_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(HOME_DIR_NAME)
}
