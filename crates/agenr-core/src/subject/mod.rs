//! Subject Index
//!
//! In-memory multimap `subject_key -> {entry_id}` over active entries,
//! rebuilt lazily from the database and incrementally maintained on insert,
//! supersede, retire, and delete. The index is a denormalized cache: ids are
//! plain values, and truth lives in the database.
//!
//! Lookup modes:
//! - exact: the canonical key string
//! - fuzzy: same entity, token-overlap on the attribute
//! - cross-entity: same attribute, different entity

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::memory::SubjectKey;

/// Attribute tokens that carry no identity (dropped before overlap scoring)
const NOISE_TOKENS: &[&str] = &["change", "changes", "ownership"];

/// Default token-overlap threshold for fuzzy lookup
pub const DEFAULT_FUZZY_THRESHOLD: f64 = 0.6;

// ============================================================================
// SUBJECT INDEX
// ============================================================================

/// Rebuildable multimap from subject key to active entry ids
#[derive(Debug, Default)]
pub struct SubjectIndex {
    keys: HashMap<String, HashSet<String>>,
    built: bool,
}

impl SubjectIndex {
    /// Empty, unbuilt index
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the lazy build has happened
    pub fn is_built(&self) -> bool {
        self.built
    }

    /// Replace contents from a full scan of `(subject_key, entry_id)` pairs
    pub fn rebuild<I>(&mut self, pairs: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        self.keys.clear();
        for (key, id) in pairs {
            self.insert_normalized(&key, id);
        }
        self.built = true;
    }

    /// Number of distinct keys
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the index holds no keys
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Register an entry id under a key
    pub fn add(&mut self, key: &str, entry_id: impl Into<String>) {
        self.insert_normalized(key, entry_id.into());
    }

    /// Remove an entry id from a key; empty key sets are dropped
    pub fn remove(&mut self, key: &str, entry_id: &str) {
        let normalized = normalize_key(key);
        if let Some(ids) = self.keys.get_mut(&normalized) {
            ids.remove(entry_id);
            if ids.is_empty() {
                self.keys.remove(&normalized);
            }
        }
    }

    /// Drop everything, including the built flag
    pub fn clear(&mut self) {
        self.keys.clear();
        self.built = false;
    }

    /// Exact lookup by key
    pub fn lookup(&self, key: &str) -> Vec<String> {
        self.keys
            .get(&normalize_key(key))
            .map(|ids| {
                let mut v: Vec<String> = ids.iter().cloned().collect();
                v.sort();
                v
            })
            .unwrap_or_default()
    }

    /// Same entity, attribute token-overlap at or above `threshold`
    ///
    /// Includes exact matches. Keys with no `entity/attribute` structure
    /// only ever match exactly.
    pub fn fuzzy_lookup(&self, key: &str, threshold: f64) -> Vec<String> {
        let mut out: BTreeSet<String> = self.lookup(key).into_iter().collect();

        if let Some(target) = SubjectKey::parse(key) {
            let target_tokens = attribute_tokens(&target.attribute);
            for (candidate_key, ids) in &self.keys {
                if let Some(candidate) = SubjectKey::parse(candidate_key) {
                    if candidate.entity != target.entity {
                        continue;
                    }
                    let candidate_tokens = attribute_tokens(&candidate.attribute);
                    if token_overlap(&target_tokens, &candidate_tokens) >= threshold {
                        out.extend(ids.iter().cloned());
                    }
                }
            }
        }

        out.into_iter().collect()
    }

    /// Same attribute, different entity
    pub fn cross_entity_lookup(&self, key: &str) -> Vec<String> {
        let Some(target) = SubjectKey::parse(key) else {
            return Vec::new();
        };

        let mut out: BTreeSet<String> = BTreeSet::new();
        for (candidate_key, ids) in &self.keys {
            if let Some(candidate) = SubjectKey::parse(candidate_key) {
                if candidate.attribute == target.attribute && candidate.entity != target.entity {
                    out.extend(ids.iter().cloned());
                }
            }
        }
        out.into_iter().collect()
    }

    fn insert_normalized(&mut self, key: &str, entry_id: String) {
        self.keys
            .entry(normalize_key(key))
            .or_default()
            .insert(entry_id);
    }
}

/// Canonicalize a raw key: structured keys through [`SubjectKey`], everything
/// else lowercased as-is so exact lookup still works
fn normalize_key(key: &str) -> String {
    SubjectKey::parse(key)
        .map(|k| k.canonical())
        .unwrap_or_else(|| key.trim().to_lowercase())
}

/// Attribute split into identity-bearing tokens
fn attribute_tokens(attribute: &str) -> BTreeSet<String> {
    attribute
        .split(|c: char| !c.is_alphanumeric())
        .map(str::to_lowercase)
        .filter(|t| !t.is_empty() && !NOISE_TOKENS.contains(&t.as_str()))
        .map(|t| match t.strip_suffix("ary") {
            Some(stem) if stem.len() >= 3 => stem.to_string(),
            _ => t,
        })
        .collect()
}

/// Jaccard overlap of two token sets
fn token_overlap(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    intersection / union
}

// ============================================================================
// TESTS
// ============================================================================
