//! Secondary indexes over the entry repository.
//!
//! Every bucket maps a field value to the set of entry ids carrying it. The
//! manager also remembers, per id, exactly which buckets it put the id in, so
//! a re-index or removal always clears stale references before adding new
//! ones. Indexes are derived data: the repository is authoritative.

use crate::record::{EntryKey, StoredEntry};
use memvault_types::entry::EntryId;
use std::borrow::Cow;
use std::collections::{HashMap, HashSet};

/// Equality filters the index can narrow on.
#[derive(Debug, Default, Clone, Copy)]
pub struct IndexFilter<'a> {
    pub namespace: Option<&'a str>,
    pub entry_type: Option<&'a str>,
    /// Any-of tag match.
    pub tags: Option<&'a [String]>,
    pub owner: Option<&'a str>,
}

/// What the manager recorded for one id.
#[derive(Debug, Clone)]
struct Indexed {
    key: EntryKey,
    entry_type: String,
    owner: String,
    tags: Vec<String>,
    tokens: Vec<String>,
}

type Buckets = HashMap<String, HashSet<EntryId>>;

/// Namespace, type, owner, tag and full-text indexes.
#[derive(Debug, Default)]
pub struct IndexManager {
    keys: HashMap<EntryKey, EntryId>,
    fields: HashMap<EntryId, Indexed>,
    by_namespace: Buckets,
    by_type: Buckets,
    by_owner: Buckets,
    by_tag: Buckets,
    tokens: Buckets,
}

fn bucket_insert(buckets: &mut Buckets, value: &str, id: EntryId) {
    buckets.entry(value.to_string()).or_default().insert(id);
}

fn bucket_remove(buckets: &mut Buckets, value: &str, id: EntryId) {
    if let Some(ids) = buckets.get_mut(value) {
        ids.remove(&id);
        if ids.is_empty() {
            buckets.remove(value);
        }
    }
}

fn bucket_has(buckets: &Buckets, value: &str, id: EntryId) -> bool {
    buckets.get(value).is_some_and(|ids| ids.contains(&id))
}

fn sorted_keys(buckets: &Buckets) -> Vec<String> {
    let mut keys: Vec<String> = buckets.keys().cloned().collect();
    keys.sort();
    keys
}

/// Split text on non-alphanumeric boundaries, lower-cased, deduplicated.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .filter(|t| seen.insert(t.clone()))
        .collect()
}

/// Tokens an entry is searchable by: its key plus its value projection.
pub fn entry_tokens(entry: &StoredEntry) -> Vec<String> {
    let mut tokens = tokenize(&entry.key);
    for token in tokenize(entry.value.projection()) {
        if !tokens.contains(&token) {
            tokens.push(token);
        }
    }
    tokens
}

/// Score of one query token against one entry token: exact beats substring.
pub fn token_score(query_token: &str, entry_token: &str) -> u32 {
    if query_token == entry_token {
        2
    } else if entry_token.contains(query_token) {
        1
    } else {
        0
    }
}

impl IndexManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of indexed ids.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Index (or re-index) an entry. Stale references for the same id, and
    /// for any other id previously holding the same `(namespace, key)`, are
    /// dropped first.
    pub fn upsert(&mut self, entry: &StoredEntry) {
        self.remove(entry.id);
        let key = entry.entry_key();
        if let Some(previous) = self.keys.get(&key).copied() {
            self.remove(previous);
        }

        let tokens = entry_tokens(entry);
        bucket_insert(&mut self.by_namespace, &entry.namespace, entry.id);
        bucket_insert(&mut self.by_type, &entry.entry_type, entry.id);
        bucket_insert(&mut self.by_owner, &entry.owner, entry.id);
        for tag in &entry.tags {
            bucket_insert(&mut self.by_tag, tag, entry.id);
        }
        for token in &tokens {
            bucket_insert(&mut self.tokens, token, entry.id);
        }
        self.keys.insert(key.clone(), entry.id);
        self.fields.insert(
            entry.id,
            Indexed {
                key,
                entry_type: entry.entry_type.clone(),
                owner: entry.owner.clone(),
                tags: entry.tags.clone(),
                tokens,
            },
        );
    }

    /// Drop every reference to an id. Returns false if it was not indexed.
    pub fn remove(&mut self, id: EntryId) -> bool {
        let Some(indexed) = self.fields.remove(&id) else {
            return false;
        };
        if self.keys.get(&indexed.key) == Some(&id) {
            self.keys.remove(&indexed.key);
        }
        bucket_remove(&mut self.by_namespace, &indexed.key.namespace, id);
        bucket_remove(&mut self.by_type, &indexed.entry_type, id);
        bucket_remove(&mut self.by_owner, &indexed.owner, id);
        for tag in &indexed.tags {
            bucket_remove(&mut self.by_tag, tag, id);
        }
        for token in &indexed.tokens {
            bucket_remove(&mut self.tokens, token, id);
        }
        true
    }

    /// The `(namespace, key)` an id is indexed under.
    pub fn key_of(&self, id: EntryId) -> Option<&EntryKey> {
        self.fields.get(&id).map(|f| &f.key)
    }

    pub fn id_of(&self, key: &EntryKey) -> Option<EntryId> {
        self.keys.get(key).copied()
    }

    /// All indexed ids.
    pub fn ids(&self) -> impl Iterator<Item = EntryId> + '_ {
        self.fields.keys().copied()
    }

    /// Ids matching every index-eligible filter, intersected smallest first.
    /// `None` when the filter names no indexed field (caller must scan).
    pub fn candidates(&self, filter: &IndexFilter<'_>) -> Option<HashSet<EntryId>> {
        let empty = HashSet::new();
        let mut sets: Vec<Cow<'_, HashSet<EntryId>>> = Vec::new();

        if let Some(ns) = filter.namespace {
            sets.push(Cow::Borrowed(
                self.by_namespace.get(ns).unwrap_or(&empty),
            ));
        }
        if let Some(t) = filter.entry_type {
            sets.push(Cow::Borrowed(
                self.by_type.get(t).unwrap_or(&empty),
            ));
        }
        if let Some(tags) = filter.tags.filter(|t| !t.is_empty()) {
            let mut any = HashSet::new();
            for tag in tags {
                if let Some(ids) = self.by_tag.get(tag) {
                    any.extend(ids.iter().copied());
                }
            }
            sets.push(Cow::Owned(any));
        }
        if let Some(owner) = filter.owner {
            sets.push(Cow::Borrowed(
                self.by_owner.get(owner).unwrap_or(&empty),
            ));
        }

        if sets.is_empty() {
            return None;
        }
        sets.sort_by_key(|s| s.len());
        let (first, rest) = sets.split_first()?;
        Some(
            first
                .iter()
                .filter(|id| rest.iter().all(|s| s.contains(*id)))
                .copied()
                .collect(),
        )
    }

    /// Full-text search. Every query token must match (exactly or as a
    /// substring) at least one entry token; scores are summed best matches.
    /// `None` for a term with no tokens, meaning no full-text filter.
    pub fn search(&self, term: &str) -> Option<HashMap<EntryId, u32>> {
        let query = tokenize(term);
        if query.is_empty() {
            return None;
        }

        let mut totals: Option<HashMap<EntryId, u32>> = None;
        for q in &query {
            let mut best: HashMap<EntryId, u32> = HashMap::new();
            for (token, ids) in &self.tokens {
                let score = token_score(q, token);
                if score == 0 {
                    continue;
                }
                for id in ids {
                    let slot = best.entry(*id).or_insert(0);
                    *slot = (*slot).max(score);
                }
            }
            totals = Some(match totals {
                None => best,
                Some(prev) => prev
                    .into_iter()
                    .filter_map(|(id, s)| best.get(&id).map(|b| (id, s + b)))
                    .collect(),
            });
        }
        totals
    }

    /// Whether the index holds exactly the references this entry implies.
    pub fn is_consistent(&self, entry: &StoredEntry) -> bool {
        let Some(indexed) = self.fields.get(&entry.id) else {
            return false;
        };
        let key = entry.entry_key();
        indexed.key == key
            && self.keys.get(&key) == Some(&entry.id)
            && indexed.entry_type == entry.entry_type
            && indexed.owner == entry.owner
            && indexed.tags == entry.tags
            && bucket_has(&self.by_namespace, &entry.namespace, entry.id)
            && bucket_has(&self.by_type, &entry.entry_type, entry.id)
            && bucket_has(&self.by_owner, &entry.owner, entry.id)
            && entry.tags.iter().all(|t| bucket_has(&self.by_tag, t, entry.id))
    }

    pub fn namespaces(&self) -> Vec<String> {
        sorted_keys(&self.by_namespace)
    }

    pub fn types(&self) -> Vec<String> {
        sorted_keys(&self.by_type)
    }

    pub fn tags(&self) -> Vec<String> {
        sorted_keys(&self.by_tag)
    }

    /// Rough byte footprint of all buckets.
    pub fn estimated_size(&self) -> u64 {
        let id_size = std::mem::size_of::<EntryId>();
        let buckets = [
            &self.by_namespace,
            &self.by_type,
            &self.by_owner,
            &self.by_tag,
            &self.tokens,
        ];
        let bucket_bytes: usize = buckets
            .iter()
            .flat_map(|b| b.iter())
            .map(|(k, ids)| k.len() + ids.len() * id_size)
            .sum();
        let key_bytes: usize = self
            .keys
            .keys()
            .map(|k| k.namespace.len() + k.key.len() + id_size)
            .sum();
        (bucket_bytes + key_bytes) as u64
    }
}
