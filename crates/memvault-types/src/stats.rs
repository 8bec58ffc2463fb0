//! Statistics report types.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Count and size for one distribution bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributionBucket {
    pub count: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverviewStats {
    pub total_entries: u64,
    /// Sum of logical value sizes.
    pub total_size: u64,
    pub compressed_entries: u64,
    /// Fraction of logical bytes saved by compression (0.0 - 1.0).
    pub compression_ratio: f64,
    /// Estimated bytes held by the secondary indexes.
    pub index_size: u64,
    /// Estimated resident bytes (stored payloads, keys, tags, metadata).
    pub memory_usage: u64,
    /// Size of the persistence file, 0 when persistence is disabled.
    pub disk_usage: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributionStats {
    pub by_namespace: BTreeMap<String, DistributionBucket>,
    pub by_type: BTreeMap<String, DistributionBucket>,
    pub by_owner: BTreeMap<String, DistributionBucket>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceStats {
    /// Rolling average query latency, in milliseconds.
    pub average_query_time: f64,
    /// Rolling average write latency, in milliseconds.
    pub average_write_time: f64,
    /// Fraction of `retrieve` calls that found an entry.
    pub cache_hit_ratio: f64,
    /// Fraction of queries narrowed by an index instead of a full scan.
    pub index_efficiency: f64,
    pub total_queries: u64,
    pub total_writes: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStats {
    pub expired_entries: u64,
    pub orphaned_references: u64,
    pub duplicate_keys: u64,
    pub corrupted_entries: u64,
    pub recommended_cleanup: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PotentialSavings {
    pub compression: u64,
    pub cleanup: u64,
    pub deduplication: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizationStats {
    pub suggestions: Vec<String>,
    pub potential_savings: PotentialSavings,
}

/// Full statistics report returned by `statistics()`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Statistics {
    pub overview: OverviewStats,
    pub distribution: DistributionStats,
    pub performance: PerformanceStats,
    pub health: HealthStats,
    pub optimization: OptimizationStats,
}
