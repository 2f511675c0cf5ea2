//! Online Dedup Classifier
//!
//! Classifies each incoming entry against the existing corpus before it is
//! written. Cheap deterministic gates run first (content hash, canonical
//! key, source recency), then cosine-similarity bands against the nearest
//! neighbor decide between skip, reinforce, relate, insert, or handing the
//! call to the LLM conflict resolver.
//!
//! All reads here go through the storage reader; the resulting decision is
//! applied later inside the batch transaction.

pub mod conflict;

use chrono::{DateTime, Duration, Utc};

use crate::embedding::cosine_similarity;
use crate::memory::{normalize_subject, EntryType, KnowledgeEntry, RelationType, StoredEntry};
use crate::storage::{Result, Storage};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Similarity bands and guard windows
#[derive(Debug, Clone)]
pub struct DedupConfig {
    /// Above this cosine the new entry is a near-exact duplicate
    pub skip_threshold: f64,
    /// Lower edge of the reinforce band
    pub reinforce_low: f64,
    /// Lower edge of the LLM-classification band
    pub classify_low: f64,
    /// Whether LLM conflict classification is available
    pub llm_enabled: bool,
    /// Same `(subject, type, source_file)` younger than this reinforces
    pub recency_guard_hours: i64,
    /// Token-overlap threshold for the fuzzy same-subject test
    pub fuzzy_subject_threshold: f64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            skip_threshold: 0.98,
            reinforce_low: 0.92,
            classify_low: 0.80,
            llm_enabled: true,
            recency_guard_hours: 24,
            fuzzy_subject_threshold: 0.6,
        }
    }
}

impl DedupConfig {
    /// Apply the `dedup` config-file section
    pub fn with_overrides(mut self, aggressive: bool, threshold: Option<f64>) -> Self {
        if let Some(threshold) = threshold {
            self.classify_low = threshold.clamp(0.0, 1.0);
        }
        if aggressive {
            // Aggressive mode widens the LLM band downward
            self.classify_low = self.classify_low.min(0.75);
        }
        self
    }
}

// ============================================================================
// DECISION
// ============================================================================

/// Outcome of classifying one incoming entry
#[derive(Debug, Clone, PartialEq)]
pub enum DedupDecision {
    /// Insert as a new entry
    Insert,
    /// Drop the entry
    Skip {
        /// Why it was dropped
        reason: String,
    },
    /// Bump confirmations on an existing entry instead of inserting
    Reinforce {
        /// The reinforced entry
        entry_id: String,
    },
    /// Insert, then record a relation edge to an existing entry
    InsertWithRelation {
        /// The related entry
        entry_id: String,
        /// Edge kind
        relation: RelationType,
    },
    /// Insert, then auto-supersede an existing entry (completion gate)
    InsertSuperseding {
        /// The completed todo
        entry_id: String,
    },
    /// Insert, then run the LLM conflict resolver against these candidates
    Classify {
        /// Nearest-neighbor ids worth classifying
        candidate_ids: Vec<String>,
    },
}

// ============================================================================
// CLASSIFIER
// ============================================================================

/// Nearest-neighbor count when the LLM band is live
const CANDIDATES_WITH_LLM: usize = 10;

/// Online classifier over the live corpus
pub struct DedupClassifier<'a> {
    storage: &'a Storage,
    config: DedupConfig,
}

impl<'a> DedupClassifier<'a> {
    /// Classifier over a storage handle
    pub fn new(storage: &'a Storage, config: DedupConfig) -> Self {
        Self { storage, config }
    }

    /// Classify one incoming entry with its resolved embedding
    pub fn classify(
        &self,
        entry: &KnowledgeEntry,
        vector: &[f32],
        now: DateTime<Utc>,
    ) -> Result<DedupDecision> {
        // 1. Content-hash guard: exact (source_file, content) re-ingest
        if self
            .storage
            .find_by_content_hash(&entry.content_hash())?
            .is_some()
        {
            return Ok(DedupDecision::Skip {
                reason: "idempotent content hash match".to_string(),
            });
        }

        // 2. Canonical-key shortcut
        if let Some(key) = &entry.canonical_key {
            let matches = self.storage.find_active_by_canonical_key(key)?;
            if let Some(existing) = matches.first() {
                // Completion gate: an event with completion wording closes
                // a todo carrying the same canonical key. Runs before the
                // LLM resolver (see DESIGN.md).
                if entry.entry_type == EntryType::Event
                    && existing.entry_type == EntryType::Todo
                    && is_completion_event(&entry.content)
                {
                    return Ok(DedupDecision::InsertSuperseding {
                        entry_id: existing.id.clone(),
                    });
                }
                if existing.entry_type == entry.entry_type {
                    return Ok(DedupDecision::Reinforce {
                        entry_id: existing.id.clone(),
                    });
                }
                return Ok(DedupDecision::InsertWithRelation {
                    entry_id: existing.id.clone(),
                    relation: RelationType::Related,
                });
            }
        }

        // 3. Source-file recency guard: same (subject, type, source_file)
        //    younger than the window is a rewording, not new knowledge
        if let Some(source_file) = &entry.source.file {
            let cutoff = now - Duration::hours(self.config.recency_guard_hours);
            if let Some(existing) = self.storage.find_recent_same_source(
                &entry.subject,
                entry.entry_type,
                source_file,
                cutoff,
            )? {
                return Ok(DedupDecision::Reinforce {
                    entry_id: existing.id,
                });
            }
        }

        // 4. Similarity bands on the nearest neighbor
        let k = if self.config.llm_enabled {
            CANDIDATES_WITH_LLM
        } else {
            1
        };
        let neighbors = self.storage.vector_search(vector, k)?;
        let Some((top_id, _)) = neighbors.first() else {
            return Ok(DedupDecision::Insert);
        };

        let Some(top) = self.storage.get_entry(top_id)? else {
            return Ok(DedupDecision::Insert);
        };
        // Exact cosine from the stored vector; the ANN distance is only a
        // candidate-ordering signal
        let similarity = match self.storage.embedding_of(top_id)? {
            Some(stored) => cosine_similarity(vector, &stored) as f64,
            None => return Ok(DedupDecision::Insert),
        };

        let same_subject = self.same_subject(entry, &top);
        let same_type = entry.entry_type == top.entry_type;

        if similarity > self.config.skip_threshold {
            return Ok(DedupDecision::Skip {
                reason: "near-exact semantic duplicate".to_string(),
            });
        }

        if similarity >= self.config.reinforce_low && same_subject {
            if same_type {
                return Ok(DedupDecision::Reinforce { entry_id: top.id });
            }
            return Ok(DedupDecision::InsertWithRelation {
                entry_id: top.id,
                relation: RelationType::Related,
            });
        }

        if similarity >= self.config.classify_low && same_subject && self.config.llm_enabled {
            let candidate_ids = neighbors
                .iter()
                .map(|(id, _)| id.clone())
                .collect::<Vec<_>>();
            return Ok(DedupDecision::Classify { candidate_ids });
        }

        Ok(DedupDecision::Insert)
    }

    /// Fuzzy same-subject test: normalized equality, word-set overlap, or
    /// subject-key fuzzy match on the same entity
    fn same_subject(&self, entry: &KnowledgeEntry, existing: &StoredEntry) -> bool {
        let a = normalize_subject(&entry.subject);
        let b = normalize_subject(&existing.subject);
        if a == b {
            return true;
        }
        if word_overlap(&a, &b) >= self.config.fuzzy_subject_threshold {
            return true;
        }

        if let (Some(key_a), Some(key_b)) = (
            entry
                .subject_key
                .as_deref()
                .and_then(crate::memory::SubjectKey::parse),
            existing.parsed_subject_key(),
        ) {
            if key_a.entity == key_b.entity {
                return true;
            }
        }
        false
    }
}

/// Jaccard overlap of the word sets of two normalized subjects
fn word_overlap(a: &str, b: &str) -> f64 {
    let set_a: std::collections::BTreeSet<&str> = a.split(' ').filter(|w| !w.is_empty()).collect();
    let set_b: std::collections::BTreeSet<&str> = b.split(' ').filter(|w| !w.is_empty()).collect();
    if set_a.is_empty() || set_b.is_empty() {
        return 0.0;
    }
    let intersection = set_a.intersection(&set_b).count() as f64;
    let union = set_a.union(&set_b).count() as f64;
    intersection / union
}

// ============================================================================
// COMPLETION DETECTION
// ============================================================================

const COMPLETION_TOKENS: &[&str] = &["done", "fixed", "completed", "resolved", "shipped", "merged"];
const NEGATION_TOKENS: &[&str] = &["not", "never", "isn't", "isnt"];
/// Words scanned before a completion token for a negation
const NEGATION_WINDOW: usize = 3;

/// Whether event wording reports a completion (with a negation guard: "not
/// fixed" and "no longer done" do not count)
pub fn is_completion_event(content: &str) -> bool {
    let words: Vec<String> = content
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '\'')
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect();

    for (i, word) in words.iter().enumerate() {
        if COMPLETION_TOKENS.contains(&word.as_str()) {
            let start = i.saturating_sub(NEGATION_WINDOW);
            let window = &words[start..i];
            let negated = window.iter().any(|w| NEGATION_TOKENS.contains(&w.as_str()))
                || window
                    .windows(2)
                    .any(|pair| pair[0] == "no" && pair[1] == "longer");
            if !negated {
                return true;
            }
        }
    }
    false
}

// ============================================================================
// TESTS
// ============================================================================
