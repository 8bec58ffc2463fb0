//! Query request and result types.

use crate::entry::{AccessLevel, MemoryEntry};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Fields a query can be sorted by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SortField {
    #[serde(rename = "key")]
    Key,
    #[serde(rename = "createdAt")]
    CreatedAt,
    #[serde(rename = "updatedAt")]
    UpdatedAt,
    #[serde(rename = "lastAccessedAt")]
    LastAccessedAt,
    #[serde(rename = "size")]
    Size,
    #[serde(rename = "type")]
    Type,
}

impl SortField {
    /// Parse a sort field name. Accepts camelCase and snake_case spellings.
    pub fn parse(name: &str) -> Option<SortField> {
        match name.trim() {
            "key" => Some(SortField::Key),
            "createdAt" | "created_at" => Some(SortField::CreatedAt),
            "updatedAt" | "updated_at" => Some(SortField::UpdatedAt),
            "lastAccessedAt" | "last_accessed_at" => Some(SortField::LastAccessedAt),
            "size" => Some(SortField::Size),
            "type" => Some(SortField::Type),
            _ => None,
        }
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// Dimension a query can aggregate over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateField {
    Namespace,
    Type,
    Owner,
    Tags,
}

impl AggregateField {
    /// Name used as the key of the aggregation map.
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateField::Namespace => "namespace",
            AggregateField::Type => "type",
            AggregateField::Owner => "owner",
            AggregateField::Tags => "tags",
        }
    }
}

/// Filter, sort, paging and aggregation options for `query`.
///
/// Every field is optional; an empty `QueryOptions` selects all live,
/// unexpired entries sorted by `updatedAt` descending.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueryOptions {
    pub namespace: Option<String>,
    #[serde(rename = "type")]
    pub entry_type: Option<String>,
    /// Matches entries carrying any of these tags.
    pub tags: Option<Vec<String>>,
    pub owner: Option<String>,
    pub access_level: Option<AccessLevel>,
    /// Regular expression matched against the key.
    pub key_pattern: Option<String>,
    /// Case-insensitive substring matched against the value's text projection.
    pub value_search: Option<String>,
    /// Token search over key and value; empty means no full-text filter.
    pub full_text_search: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub updated_after: Option<DateTime<Utc>>,
    pub updated_before: Option<DateTime<Utc>>,
    /// Exclusive lower size bound, in bytes.
    pub size_greater_than: Option<u64>,
    /// Exclusive upper size bound, in bytes.
    pub size_less_than: Option<u64>,
    pub include_expired: bool,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    /// Sort field name; unknown names fall back to `updatedAt desc`.
    pub sort_by: Option<String>,
    pub sort_order: Option<SortOrder>,
    pub aggregate_by: Option<AggregateField>,
    /// When `Some(false)`, returned entries carry an empty metadata map.
    pub include_metadata: Option<bool>,
}

impl QueryOptions {
    /// Query a single namespace.
    pub fn namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            ..Default::default()
        }
    }

    /// Resolve the effective sort field and order.
    pub fn resolved_sort(&self) -> (SortField, SortOrder) {
        match self.sort_by.as_deref() {
            None => (
                SortField::UpdatedAt,
                self.sort_order.unwrap_or(SortOrder::Desc),
            ),
            Some(name) => match SortField::parse(name) {
                Some(field) => (field, self.sort_order.unwrap_or_default()),
                None => (SortField::UpdatedAt, SortOrder::Desc),
            },
        }
    }
}

/// Per-bucket rollup in an aggregation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregationBucket {
    pub count: u64,
    pub total_size: u64,
}

/// Aggregations keyed by dimension name, then by bucket value.
pub type Aggregations = BTreeMap<String, BTreeMap<String, AggregationBucket>>;

/// Result of `query`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    /// The requested page.
    pub entries: Vec<MemoryEntry>,
    /// Filtered count before paging.
    pub total: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregations: Option<Aggregations>,
}
