//! Statistics: on-demand reports plus running performance counters.

use crate::cleanup::{duplicate_ids, is_orphaned};
use crate::record::StoredEntry;
use crate::repository::EntryRepository;
use chrono::{DateTime, Utc};
use memvault_types::entry::EntryId;
use memvault_types::error::{MemoryError, MemoryResult};
use memvault_types::stats::{
    DistributionBucket, DistributionStats, HealthStats, OptimizationStats, OverviewStats,
    PerformanceStats, PotentialSavings, Statistics,
};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Weight of the newest sample in the rolling latency averages.
const LATENCY_SMOOTHING: f64 = 0.1;

/// Assumed fraction of bytes gzip saves on an eligible value.
const ESTIMATED_COMPRESSION_SAVING: f64 = 0.5;

#[derive(Debug, Default)]
struct Latencies {
    query_ms: Option<f64>,
    write_ms: Option<f64>,
}

fn smooth(current: Option<f64>, sample: f64) -> f64 {
    match current {
        Some(avg) => avg + LATENCY_SMOOTHING * (sample - avg),
        None => sample,
    }
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

/// Running counters maintained by the store facade.
#[derive(Debug, Default)]
pub struct PerformanceTracker {
    latencies: Mutex<Latencies>,
    queries: AtomicU64,
    indexed_queries: AtomicU64,
    writes: AtomicU64,
    retrieve_hits: AtomicU64,
    retrieve_misses: AtomicU64,
}

impl PerformanceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn latencies(&self) -> MemoryResult<std::sync::MutexGuard<'_, Latencies>> {
        self.latencies
            .lock()
            .map_err(|e| MemoryError::Internal(e.to_string()))
    }

    pub fn record_query(&self, elapsed: Duration, used_index: bool) -> MemoryResult<()> {
        self.queries.fetch_add(1, Ordering::Relaxed);
        if used_index {
            self.indexed_queries.fetch_add(1, Ordering::Relaxed);
        }
        let mut lat = self.latencies()?;
        lat.query_ms = Some(smooth(lat.query_ms, elapsed.as_secs_f64() * 1000.0));
        Ok(())
    }

    pub fn record_write(&self, elapsed: Duration) -> MemoryResult<()> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let mut lat = self.latencies()?;
        lat.write_ms = Some(smooth(lat.write_ms, elapsed.as_secs_f64() * 1000.0));
        Ok(())
    }

    pub fn record_retrieve(&self, hit: bool) {
        let counter = if hit {
            &self.retrieve_hits
        } else {
            &self.retrieve_misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MemoryResult<PerformanceStats> {
        let lat = self.latencies()?;
        let queries = self.queries.load(Ordering::Relaxed);
        let hits = self.retrieve_hits.load(Ordering::Relaxed);
        let misses = self.retrieve_misses.load(Ordering::Relaxed);
        Ok(PerformanceStats {
            average_query_time: lat.query_ms.unwrap_or(0.0),
            average_write_time: lat.write_ms.unwrap_or(0.0),
            cache_hit_ratio: ratio(hits, hits + misses),
            index_efficiency: ratio(self.indexed_queries.load(Ordering::Relaxed), queries),
            total_queries: queries,
            total_writes: self.writes.load(Ordering::Relaxed),
        })
    }
}

fn add_to(map: &mut BTreeMap<String, DistributionBucket>, key: &str, size: u64) {
    let bucket = map.entry(key.to_string()).or_default();
    bucket.count += 1;
    bucket.size += size;
}

fn distribution(entries: &[StoredEntry]) -> DistributionStats {
    let mut dist = DistributionStats::default();
    for entry in entries {
        let size = entry.size();
        add_to(&mut dist.by_namespace, &entry.namespace, size);
        add_to(&mut dist.by_type, &entry.entry_type, size);
        add_to(&mut dist.by_owner, &entry.owner, size);
    }
    dist
}

/// Build the full report.
pub fn statistics(
    repo: &EntryRepository,
    tracker: &PerformanceTracker,
    compression_threshold: u64,
    disk_usage: u64,
    now: DateTime<Utc>,
) -> MemoryResult<Statistics> {
    let entries = repo.snapshot();
    let live: HashSet<EntryId> = entries.iter().map(|e| e.id).collect();

    // Index ids with no live entry, plus entries the index disagrees with.
    let (index_size, dangling, orphaned) = {
        let index = repo.index_read()?;
        let dangling = index.ids().filter(|id| !live.contains(id)).count();
        let orphaned: HashSet<EntryId> = entries
            .iter()
            .filter(|e| is_orphaned(&index, e))
            .map(|e| e.id)
            .collect();
        (index.estimated_size(), dangling, orphaned)
    };

    let total_size: u64 = entries.iter().map(StoredEntry::size).sum();
    let compressed: Vec<&StoredEntry> = entries.iter().filter(|e| e.value.is_compressed()).collect();
    let compression_saved: u64 = compressed
        .iter()
        .map(|e| e.size().saturating_sub(e.value.stored_len()))
        .sum();

    let expired: Vec<&StoredEntry> = entries.iter().filter(|e| e.is_expired_at(now)).collect();
    let corrupted: Vec<&StoredEntry> = entries.iter().filter(|e| !e.value.is_intact()).collect();
    let duplicates = duplicate_ids(&entries);

    let mut reclaimable: HashSet<EntryId> = expired.iter().map(|e| e.id).collect();
    reclaimable.extend(orphaned.iter().copied());
    reclaimable.extend(corrupted.iter().map(|e| e.id));

    let stored_len_of = |ids: &HashSet<EntryId>| -> u64 {
        entries
            .iter()
            .filter(|e| ids.contains(&e.id))
            .map(|e| e.value.stored_len())
            .sum()
    };
    let eligible: Vec<&StoredEntry> = entries
        .iter()
        .filter(|e| !e.value.is_compressed() && e.size() > compression_threshold)
        .collect();
    let savings = PotentialSavings {
        compression: eligible
            .iter()
            .map(|e| (e.size() as f64 * ESTIMATED_COMPRESSION_SAVING) as u64)
            .sum(),
        cleanup: stored_len_of(&reclaimable),
        deduplication: stored_len_of(&duplicates),
    };

    let health = HealthStats {
        expired_entries: expired.len() as u64,
        orphaned_references: (dangling + orphaned.len()) as u64,
        duplicate_keys: duplicates.len() as u64,
        corrupted_entries: corrupted.len() as u64,
        recommended_cleanup: !expired.is_empty()
            || dangling > 0
            || !orphaned.is_empty()
            || !corrupted.is_empty()
            || !duplicates.is_empty(),
    };

    let mut suggestions = Vec::new();
    if !expired.is_empty() {
        suggestions.push(format!(
            "Run cleanup to remove {} expired entries",
            expired.len()
        ));
    }
    if !eligible.is_empty() {
        suggestions.push(format!(
            "Compress {} entries larger than {compression_threshold} bytes",
            eligible.len()
        ));
    }
    if !duplicates.is_empty() {
        suggestions.push(format!(
            "Remove {} duplicate entries with removeDuplicates",
            duplicates.len()
        ));
    }
    if dangling > 0 || !orphaned.is_empty() {
        suggestions.push("Remove orphaned entries to restore index consistency".to_string());
    }
    if !corrupted.is_empty() {
        suggestions.push(format!(
            "{} entries failed integrity checks; restore them from an export",
            corrupted.len()
        ));
    }

    Ok(Statistics {
        overview: OverviewStats {
            total_entries: entries.len() as u64,
            total_size,
            compressed_entries: compressed.len() as u64,
            compression_ratio: ratio(compression_saved, total_size),
            index_size,
            memory_usage: repo.resident_bytes(),
            disk_usage,
        },
        distribution: distribution(&entries),
        performance: tracker.snapshot()?,
        health,
        optimization: OptimizationStats {
            suggestions,
            potential_savings: savings,
        },
    })
}
