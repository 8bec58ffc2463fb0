//! Query engine: index narrowing, predicate filtering, sorting, paging and
//! aggregation over the repository.
//!
//! A full-text query with no explicit `sortBy` is ordered by relevance, most
//! relevant first.

use crate::index::{entry_tokens, token_score, tokenize, IndexFilter};
use crate::record::StoredEntry;
use crate::repository::EntryRepository;
use chrono::{DateTime, Utc};
use memvault_types::error::{MemoryError, MemoryResult};
use memvault_types::query::{
    AggregateField, AggregationBucket, Aggregations, QueryOptions, QueryResult, SortField,
    SortOrder,
};
use regex_lite::Regex;
use std::cmp::{Ordering, Reverse};
use std::collections::BTreeMap;
use tracing::debug;

/// How the candidate set was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Narrowing {
    Index,
    FullScan,
}

/// Predicates compiled once per query.
struct Predicates<'a> {
    opts: &'a QueryOptions,
    key_pattern: Option<Regex>,
    value_search: Option<String>,
    full_text: Vec<String>,
    now: DateTime<Utc>,
}

impl<'a> Predicates<'a> {
    fn compile(opts: &'a QueryOptions, now: DateTime<Utc>) -> MemoryResult<Self> {
        let key_pattern = opts
            .key_pattern
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|e| MemoryError::Validation(format!("invalid key pattern: {e}")))?;
        Ok(Self {
            opts,
            key_pattern,
            value_search: opts
                .value_search
                .as_deref()
                .filter(|s| !s.is_empty())
                .map(str::to_lowercase),
            full_text: opts
                .full_text_search
                .as_deref()
                .map(tokenize)
                .unwrap_or_default(),
            now,
        })
    }

    fn matches(&self, e: &StoredEntry) -> bool {
        let o = self.opts;
        if o.namespace.as_deref().is_some_and(|ns| ns != e.namespace) {
            return false;
        }
        if o.entry_type.as_deref().is_some_and(|t| t != e.entry_type) {
            return false;
        }
        if let Some(tags) = o.tags.as_ref().filter(|t| !t.is_empty()) {
            if !tags.iter().any(|t| e.tags.contains(t)) {
                return false;
            }
        }
        if o.owner.as_deref().is_some_and(|owner| owner != e.owner) {
            return false;
        }
        if o.access_level.is_some_and(|level| level != e.access_level) {
            return false;
        }
        if !o.include_expired && e.is_expired_at(self.now) {
            return false;
        }
        if let Some(re) = &self.key_pattern {
            if !re.is_match(&e.key) {
                return false;
            }
        }
        if o.created_after.is_some_and(|t| e.created_at <= t)
            || o.created_before.is_some_and(|t| e.created_at >= t)
            || o.updated_after.is_some_and(|t| e.updated_at <= t)
            || o.updated_before.is_some_and(|t| e.updated_at >= t)
        {
            return false;
        }
        let size = e.size();
        if o.size_greater_than.is_some_and(|min| size <= min)
            || o.size_less_than.is_some_and(|max| size >= max)
        {
            return false;
        }
        if let Some(needle) = &self.value_search {
            if !e.value.projection().to_lowercase().contains(needle.as_str()) {
                return false;
            }
        }
        if !self.full_text.is_empty() && self.relevance(e).is_none() {
            return false;
        }
        true
    }

    /// Summed best token scores, the same ones the token index computes.
    /// `None` when some query token matches nothing.
    fn relevance(&self, e: &StoredEntry) -> Option<u32> {
        let tokens = entry_tokens(e);
        self.full_text.iter().try_fold(0, |total, q| {
            let best = tokens.iter().map(|t| token_score(q, t)).max().unwrap_or(0);
            (best > 0).then_some(total + best)
        })
    }
}

fn compare(a: &StoredEntry, b: &StoredEntry, field: SortField) -> Ordering {
    match field {
        SortField::Key => a.key.cmp(&b.key),
        SortField::CreatedAt => a.created_at.cmp(&b.created_at),
        SortField::UpdatedAt => a.updated_at.cmp(&b.updated_at),
        SortField::LastAccessedAt => a.last_accessed_at.cmp(&b.last_accessed_at),
        SortField::Size => a.size().cmp(&b.size()),
        SortField::Type => a.entry_type.cmp(&b.entry_type),
    }
}

/// Sort in place; ties always break on id ascending.
pub fn sort_entries(entries: &mut [StoredEntry], field: SortField, order: SortOrder) {
    entries.sort_by(|a, b| {
        let primary = compare(a, b, field);
        let primary = match order {
            SortOrder::Asc => primary,
            SortOrder::Desc => primary.reverse(),
        };
        primary.then_with(|| a.id.cmp(&b.id))
    });
}

/// Per-bucket count and total size over `entries`.
pub fn aggregate(entries: &[StoredEntry], field: AggregateField) -> Aggregations {
    let mut buckets: BTreeMap<String, AggregationBucket> = BTreeMap::new();
    let mut add = |name: &str, size: u64| {
        let bucket = buckets.entry(name.to_string()).or_default();
        bucket.count += 1;
        bucket.total_size += size;
    };
    for e in entries {
        match field {
            AggregateField::Namespace => add(&e.namespace, e.size()),
            AggregateField::Type => add(&e.entry_type, e.size()),
            AggregateField::Owner => add(&e.owner, e.size()),
            AggregateField::Tags => {
                for tag in &e.tags {
                    add(tag, e.size());
                }
            }
        }
    }
    let mut out = Aggregations::new();
    out.insert(field.as_str().to_string(), buckets);
    out
}

/// Filter and sort, without paging. Returns the narrowing used.
pub fn select(
    repo: &EntryRepository,
    opts: &QueryOptions,
    use_indexes: bool,
    now: DateTime<Utc>,
) -> MemoryResult<(Vec<StoredEntry>, Narrowing)> {
    let predicates = Predicates::compile(opts, now)?;

    let candidates = if use_indexes {
        let filter = IndexFilter {
            namespace: opts.namespace.as_deref(),
            entry_type: opts.entry_type.as_deref(),
            tags: opts.tags.as_deref(),
            owner: opts.owner.as_deref(),
        };
        // The index lock is released before any entry is read.
        let ids = {
            let index = repo.index_read()?;
            match index.candidates(&filter) {
                Some(ids) => {
                    let text = opts.full_text_search.as_deref().unwrap_or_default();
                    match index.search(text) {
                        Some(hits) => Some(
                            ids.into_iter()
                                .filter(|id| hits.contains_key(id))
                                .collect::<Vec<_>>(),
                        ),
                        None => Some(ids.into_iter().collect()),
                    }
                }
                None => opts
                    .full_text_search
                    .as_deref()
                    .and_then(|text| index.search(text))
                    .map(|hits| hits.into_keys().collect()),
            }
        };
        match ids {
            Some(ids) => Some(repo.read_ids(ids)?),
            None => None,
        }
    } else {
        None
    };

    let narrowing = if candidates.is_some() {
        Narrowing::Index
    } else {
        Narrowing::FullScan
    };
    let entries = apply(
        &predicates,
        candidates.unwrap_or_else(|| repo.snapshot()),
        opts,
    );
    debug!(matched = entries.len(), ?narrowing, "Query selected entries");
    Ok((entries, narrowing))
}

fn apply(
    predicates: &Predicates<'_>,
    entries: Vec<StoredEntry>,
    opts: &QueryOptions,
) -> Vec<StoredEntry> {
    let mut entries: Vec<StoredEntry> = entries
        .into_iter()
        .filter(|e| predicates.matches(e))
        .collect();
    if !predicates.full_text.is_empty() && opts.sort_by.is_none() {
        entries.sort_by_cached_key(|e| {
            (
                Reverse(predicates.relevance(e).unwrap_or(0)),
                Reverse(e.updated_at),
                e.id,
            )
        });
    } else {
        let (field, order) = opts.resolved_sort();
        sort_entries(&mut entries, field, order);
    }
    entries
}

/// Filter and sort an already-taken set of entries (no index narrowing).
pub fn filter_entries(
    entries: Vec<StoredEntry>,
    opts: &QueryOptions,
    now: DateTime<Utc>,
) -> MemoryResult<Vec<StoredEntry>> {
    let predicates = Predicates::compile(opts, now)?;
    Ok(apply(&predicates, entries, opts))
}

/// Apply `offset`/`limit`.
pub fn page<T>(items: Vec<T>, offset: Option<usize>, limit: Option<usize>) -> Vec<T> {
    items
        .into_iter()
        .skip(offset.unwrap_or(0))
        .take(limit.unwrap_or(usize::MAX))
        .collect()
}

/// Run a full query: select, aggregate, page, materialize.
pub fn execute(
    repo: &EntryRepository,
    opts: &QueryOptions,
    use_indexes: bool,
    now: DateTime<Utc>,
) -> MemoryResult<(QueryResult, Narrowing)> {
    let (selected, narrowing) = select(repo, opts, use_indexes, now)?;
    let total = selected.len();
    let aggregations = opts.aggregate_by.map(|field| aggregate(&selected, field));

    let offset = opts.offset.unwrap_or(0);
    let limit = opts.limit.unwrap_or(usize::MAX);
    let strip_metadata = opts.include_metadata == Some(false);
    let entries = selected
        .iter()
        .skip(offset)
        .take(limit)
        .map(|e| {
            let mut entry = e.to_entry()?;
            if strip_metadata {
                entry.metadata.clear();
            }
            Ok(entry)
        })
        .collect::<MemoryResult<Vec<_>>>()?;

    Ok((
        QueryResult {
            entries,
            total,
            aggregations,
        },
        narrowing,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::WritePolicy;
    use chrono::Duration;
    use memvault_types::entry::StoreOptions;
    use serde_json::json;

    fn policy() -> WritePolicy {
        WritePolicy {
            max_memory_size: u64::MAX,
            auto_compress: false,
            compression_threshold: 0,
        }
    }

    fn seeded() -> (EntryRepository, DateTime<Utc>) {
        let repo = EntryRepository::new();
        let base = Utc::now();
        let rows = [
            ("alpha", "ns1", "config", vec!["x"], json!("Hello World")),
            ("beta", "ns1", "note", vec!["y"], json!({"n": 12345})),
            ("gamma", "ns2", "config", vec!["x", "y"], json!("hello there")),
            ("delta", "ns2", "note", vec![], json!([1, 2, 3])),
        ];
        for (i, (key, ns, ty, tags, value)) in rows.into_iter().enumerate() {
            let opts = StoreOptions::namespace(ns).with_type(ty).with_tags(tags);
            repo.store(key, value, &opts, policy(), base + Duration::seconds(i as i64))
                .unwrap();
        }
        (repo, base + Duration::seconds(10))
    }

    fn keys(result: &QueryResult) -> Vec<&str> {
        result.entries.iter().map(|e| e.key.as_str()).collect()
    }

    #[test]
    fn test_default_sort_is_updated_desc() {
        let (repo, now) = seeded();
        let (res, narrowing) = execute(&repo, &QueryOptions::default(), true, now).unwrap();
        assert_eq!(keys(&res), vec!["delta", "gamma", "beta", "alpha"]);
        assert_eq!(res.total, 4);
        assert_eq!(narrowing, Narrowing::FullScan);
    }

    #[test]
    fn test_index_narrowing_matches_scan() {
        let (repo, now) = seeded();
        let tags = vec!["y".to_string()];
        let opts = QueryOptions {
            namespace: Some("ns1".into()),
            tags: Some(tags),
            ..Default::default()
        };
        let (indexed, n1) = execute(&repo, &opts, true, now).unwrap();
        let (scanned, n2) = execute(&repo, &opts, false, now).unwrap();
        assert_eq!(n1, Narrowing::Index);
        assert_eq!(n2, Narrowing::FullScan);
        assert_eq!(keys(&indexed), vec!["beta"]);
        assert_eq!(keys(&indexed), keys(&scanned));
    }

    #[test]
    fn test_paging_slices_sorted_set() {
        let (repo, now) = seeded();
        let full = QueryOptions {
            sort_by: Some("key".into()),
            ..Default::default()
        };
        let (all, _) = execute(&repo, &full, true, now).unwrap();
        let paged = QueryOptions {
            limit: Some(2),
            offset: Some(1),
            ..full.clone()
        };
        let (page, _) = execute(&repo, &paged, true, now).unwrap();
        assert_eq!(keys(&page), keys(&all)[1..3].to_vec());
        assert_eq!(page.total, all.total);
    }

    #[test]
    fn test_full_text_and_value_search() {
        let (repo, now) = seeded();
        let opts = QueryOptions {
            full_text_search: Some("hello world".into()),
            ..Default::default()
        };
        let (res, narrowing) = execute(&repo, &opts, true, now).unwrap();
        assert_eq!(keys(&res), vec!["alpha"]);
        assert_eq!(narrowing, Narrowing::Index);

        let opts = QueryOptions {
            value_search: Some("HELLO".into()),
            sort_by: Some("key".into()),
            ..Default::default()
        };
        let (res, _) = execute(&repo, &opts, false, now).unwrap();
        assert_eq!(keys(&res), vec!["alpha", "gamma"]);

        let opts = QueryOptions {
            full_text_search: Some(String::new()),
            ..Default::default()
        };
        assert_eq!(execute(&repo, &opts, true, now).unwrap().0.total, 4);
    }

    #[test]
    fn test_full_text_orders_by_relevance() {
        let repo = EntryRepository::new();
        let base = Utc::now();
        let rows = [
            ("exact", json!("apple pie")),
            ("partial", json!("pineapple tart")),
            ("unrelated", json!("pear")),
        ];
        let opts = StoreOptions::default();
        for (i, (key, value)) in rows.into_iter().enumerate() {
            repo.store(key, value, &opts, policy(), base + Duration::seconds(i as i64))
                .unwrap();
        }
        let now = base + Duration::seconds(10);
        let opts = QueryOptions {
            full_text_search: Some("apple".into()),
            ..Default::default()
        };
        for use_indexes in [true, false] {
            let (res, _) = execute(&repo, &opts, use_indexes, now).unwrap();
            assert_eq!(keys(&res), vec!["exact", "partial"]);
        }

        let by_key_desc = QueryOptions {
            sort_by: Some("key".into()),
            sort_order: Some(SortOrder::Desc),
            ..opts
        };
        let (res, _) = execute(&repo, &by_key_desc, true, now).unwrap();
        assert_eq!(keys(&res), vec!["partial", "exact"]);
    }

    #[test]
    fn test_key_pattern_and_bad_regex() {
        let (repo, now) = seeded();
        let opts = QueryOptions {
            key_pattern: Some("^(a|g)".into()),
            sort_by: Some("key".into()),
            ..Default::default()
        };
        let (res, _) = execute(&repo, &opts, true, now).unwrap();
        assert_eq!(keys(&res), vec!["alpha", "gamma"]);

        let bad = QueryOptions {
            key_pattern: Some("(".into()),
            ..Default::default()
        };
        assert!(execute(&repo, &bad, true, now).unwrap_err().is_validation());
    }

    #[test]
    fn test_size_bounds_are_exclusive() {
        let (repo, now) = seeded();
        // "[1,2,3]" serializes to 7 bytes.
        let opts = QueryOptions {
            size_greater_than: Some(6),
            size_less_than: Some(8),
            ..Default::default()
        };
        let (res, _) = execute(&repo, &opts, true, now).unwrap();
        assert_eq!(keys(&res), vec!["delta"]);
        let opts = QueryOptions {
            size_greater_than: Some(7),
            size_less_than: Some(8),
            ..Default::default()
        };
        assert_eq!(execute(&repo, &opts, true, now).unwrap().0.total, 0);
    }

    #[test]
    fn test_aggregation_over_unpaged_set() {
        let (repo, now) = seeded();
        let opts = QueryOptions {
            aggregate_by: Some(AggregateField::Tags),
            limit: Some(1),
            ..Default::default()
        };
        let (res, _) = execute(&repo, &opts, true, now).unwrap();
        let aggregations = res.aggregations.unwrap();
        let tags = &aggregations["tags"];
        assert_eq!(tags["x"].count, 2);
        assert_eq!(tags["y"].count, 2);
        assert_eq!(res.entries.len(), 1);
    }

    #[test]
    fn test_expired_hidden_unless_requested() {
        let (repo, now) = seeded();
        repo.store(
            "ephemeral",
            json!(1),
            &StoreOptions::namespace("ns1").with_ttl_ms(1000),
            policy(),
            now,
        )
        .unwrap();
        let later = now + Duration::seconds(5);
        let (res, _) = execute(&repo, &QueryOptions::namespace("ns1"), true, later).unwrap();
        assert!(!keys(&res).contains(&"ephemeral"));
        let opts = QueryOptions {
            include_expired: true,
            ..QueryOptions::namespace("ns1")
        };
        let (res, _) = execute(&repo, &opts, true, later).unwrap();
        assert!(keys(&res).contains(&"ephemeral"));
    }

    #[test]
    fn test_include_metadata_false_strips() {
        let repo = EntryRepository::new();
        let now = Utc::now();
        let mut opts = StoreOptions::default();
        opts.metadata = Some([("source".to_string(), json!("cli"))].into());
        repo.store("k", json!(1), &opts, policy(), now).unwrap();
        let q = QueryOptions {
            include_metadata: Some(false),
            ..Default::default()
        };
        let (res, _) = execute(&repo, &q, true, now).unwrap();
        assert!(res.entries[0].metadata.is_empty());
        let (res, _) = execute(&repo, &QueryOptions::default(), true, now).unwrap();
        assert_eq!(res.entries[0].metadata["source"], "cli");
    }
}
