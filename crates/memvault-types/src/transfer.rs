//! Export/import options, formats, and results.

use crate::error::MemoryError;
use crate::query::QueryOptions;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Serialization format for export and import payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Json,
    Csv,
    Xml,
    Yaml,
}

impl ExportFormat {
    /// All supported formats.
    pub const ALL: [ExportFormat; 4] = [
        ExportFormat::Json,
        ExportFormat::Csv,
        ExportFormat::Xml,
        ExportFormat::Yaml,
    ];

    /// Canonical lower-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Csv => "csv",
            ExportFormat::Xml => "xml",
            ExportFormat::Yaml => "yaml",
        }
    }

    /// Preferred file extension.
    pub fn extension(&self) -> &'static str {
        self.as_str()
    }

    /// Map a file extension to a format (`.yml` and `.yaml` both map to YAML).
    pub fn from_path(path: &Path) -> Option<ExportFormat> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "json" => Some(ExportFormat::Json),
            "csv" => Some(ExportFormat::Csv),
            "xml" => Some(ExportFormat::Xml),
            "yaml" | "yml" => Some(ExportFormat::Yaml),
            _ => None,
        }
    }
}

impl std::fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExportFormat {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            "xml" => Ok(ExportFormat::Xml),
            "yaml" | "yml" => Ok(ExportFormat::Yaml),
            other => Err(MemoryError::Format(format!("unsupported format '{other}'"))),
        }
    }
}

/// Symmetric encryption settings for an export/import payload.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptionOptions {
    pub enabled: bool,
    /// Passphrase the AES key is derived from.
    pub key: Option<String>,
}

impl EncryptionOptions {
    /// Enabled encryption with the given passphrase.
    pub fn with_key(key: impl Into<String>) -> Self {
        Self {
            enabled: true,
            key: Some(key.into()),
        }
    }
}

impl std::fmt::Debug for EncryptionOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionOptions")
            .field("enabled", &self.enabled)
            .field("key", &self.key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Options for `export`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExportOptions {
    /// Output format; detected from the destination extension when absent.
    pub format: Option<ExportFormat>,
    pub namespace: Option<String>,
    #[serde(rename = "type")]
    pub entry_type: Option<String>,
    /// When `Some(false)`, metadata maps are emptied in the payload.
    pub include_metadata: Option<bool>,
    /// Gzip the encoded payload.
    pub compression: bool,
    pub encryption: Option<EncryptionOptions>,
    /// Arbitrary query narrowing; without it, expired entries are exported too.
    pub filtering: Option<QueryOptions>,
}

/// Result of `export`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportResult {
    pub entries_exported: usize,
    /// Size in bytes of the written file.
    pub file_size: u64,
    /// Hex SHA-256 of the written bytes.
    pub checksum: String,
}

/// Strategy when an imported entry's `(namespace, key)` already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictResolution {
    Overwrite,
    #[default]
    Skip,
    Merge,
    Rename,
}

impl std::str::FromStr for ConflictResolution {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "overwrite" => Ok(ConflictResolution::Overwrite),
            "skip" => Ok(ConflictResolution::Skip),
            "merge" => Ok(ConflictResolution::Merge),
            "rename" => Ok(ConflictResolution::Rename),
            other => Err(MemoryError::Validation(format!(
                "invalid conflict resolution '{other}' (expected overwrite, skip, merge or rename)"
            ))),
        }
    }
}

/// Options for `import`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ImportOptions {
    /// Payload format; detected from the source extension when absent.
    pub format: Option<ExportFormat>,
    /// Retarget every imported entry into this namespace.
    pub namespace: Option<String>,
    pub conflict_resolution: ConflictResolution,
    /// Reject entries with empty keys or namespaces instead of importing them.
    pub validation: bool,
    pub dry_run: bool,
    /// Passphrase for encrypted payloads.
    pub encryption: Option<EncryptionOptions>,
}

/// A conflict met during import, kept in the result rather than raised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportConflict {
    pub namespace: String,
    pub key: String,
    pub resolution: ConflictResolution,
    pub description: String,
}

impl std::fmt::Display for ImportConflict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.description)
    }
}

/// Result of `import`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportResult {
    pub entries_imported: usize,
    pub entries_updated: usize,
    pub entries_skipped: usize,
    pub conflicts: Vec<ImportConflict>,
    /// Per-entry failures that did not abort the import.
    pub errors: Vec<String>,
}
