//! Recall Engine
//!
//! Hybrid retrieval over the entry store:
//! - Vector path: embed the query text, ANN top-K, exact filters in Rust
//! - Keyword path: FTS5, used for short queries and no-embedding mode
//! - Browse path: recent active entries, used when the query has no text
//!   and for session-start
//!
//! Candidates are scored by [`scoring::score`], session-start results are
//! categorized and budgeted by [`session`], and recall metadata for every
//! returned entry updates in one atomic transaction.

pub mod scoring;
pub mod session;

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use lru::LruCache;
use serde::Serialize;

use crate::embedding::EmbeddingProvider;
use crate::memory::{EntryType, Expiry, Scope, StoredEntry};
use crate::storage::{EntryFilter, Result, Storage, StorageError};

pub use scoring::{ScoreBreakdown, ScoringConfig};
pub use session::{SessionConfig, SessionSections};

/// Query embeddings cached per process
const QUERY_CACHE_SIZE: usize = 100;

/// Queries shorter than this go to the keyword path
const MIN_VECTOR_QUERY_LEN: usize = 4;

// ============================================================================
// QUERY TYPES
// ============================================================================

/// Recall context; matched against `suppressed_contexts`
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RecallContext {
    /// Plain recall
    #[default]
    Default,
    /// Session-start curation
    SessionStart,
    /// Browse without query text
    Browse,
    /// Topic-scoped recall
    Topic(String),
}

impl RecallContext {
    /// Label stored in `suppressed_contexts`
    pub fn label(&self) -> String {
        match self {
            RecallContext::Default => "default".to_string(),
            RecallContext::SessionStart => "session-start".to_string(),
            RecallContext::Browse => "browse".to_string(),
            RecallContext::Topic(topic) => format!("topic:{topic}"),
        }
    }
}

/// A recall query
#[derive(Debug, Clone)]
pub struct RecallQuery {
    /// Query text; absent means browse
    pub text: Option<String>,
    /// Result cap (ignored by budgeted session-start)
    pub limit: usize,
    /// Restrict to these types
    pub types: Option<Vec<EntryType>>,
    /// Require at least one of these tags
    pub tags: Option<Vec<String>>,
    /// Importance floor
    pub min_importance: Option<i64>,
    /// Only entries created at or after this instant
    pub since: Option<DateTime<Utc>>,
    /// Restrict to these expiry classes
    pub expiry: Option<Vec<Expiry>>,
    /// Restrict to this scope
    pub scope: Option<Scope>,
    /// Restrict to this platform
    pub platform: Option<String>,
    /// Restrict to these projects
    pub projects: Option<Vec<String>>,
    /// Exclude these projects
    pub exclude_projects: Option<Vec<String>>,
    /// With `projects`, also exclude entries with no project
    pub strict: bool,
    /// Recall context
    pub context: RecallContext,
    /// Session-start token budget
    pub budget: Option<usize>,
    /// Score is raw similarity only
    pub no_boost: bool,
    /// Skip the recall-metadata update
    pub no_update: bool,
    /// Skip the vector path even when text is long enough
    pub no_embedding: bool,
    /// Include superseded and retired entries
    pub include_inactive: bool,
}

impl Default for RecallQuery {
    fn default() -> Self {
        Self {
            text: None,
            limit: 10,
            types: None,
            tags: None,
            min_importance: None,
            since: None,
            expiry: None,
            scope: None,
            platform: None,
            projects: None,
            exclude_projects: None,
            strict: false,
            context: RecallContext::Default,
            budget: None,
            no_boost: false,
            no_update: false,
            no_embedding: false,
            include_inactive: false,
        }
    }
}

/// One recall hit with its score breakdown
#[derive(Debug, Clone, Serialize)]
pub struct RecallResult {
    /// The entry
    pub entry: StoredEntry,
    /// Final score
    pub score: f64,
    /// Per-factor breakdown
    pub scores: ScoreBreakdown,
}

// ============================================================================
// ENGINE
// ============================================================================

/// The recall engine
pub struct RecallEngine {
    storage: Arc<Storage>,
    embedder: Arc<dyn EmbeddingProvider>,
    scoring: ScoringConfig,
    session: SessionConfig,
    query_cache: Mutex<LruCache<String, Vec<f32>>>,
}

impl RecallEngine {
    /// Engine over a storage handle and an embedding provider
    pub fn new(storage: Arc<Storage>, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            storage,
            embedder,
            scoring: ScoringConfig::default(),
            session: SessionConfig::default(),
            query_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(QUERY_CACHE_SIZE).expect("cache size is non-zero"),
            )),
        }
    }

    /// Override the scoring configuration
    pub fn with_scoring_config(mut self, config: ScoringConfig) -> Self {
        self.scoring = config;
        self
    }

    /// Override the session-start configuration
    pub fn with_session_config(mut self, config: SessionConfig) -> Self {
        self.session = config;
        self
    }

    /// Execute a recall query
    pub async fn recall(&self, query: &RecallQuery) -> Result<Vec<RecallResult>> {
        let now = Utc::now();
        let session_start = query.context == RecallContext::SessionStart;

        let effective_text = query.text.clone().or_else(|| match &query.context {
            RecallContext::Topic(topic) => Some(topic.clone()),
            _ => None,
        });

        let generated = match effective_text.as_deref().map(str::trim) {
            Some(text)
                if !text.is_empty()
                    && !query.no_embedding
                    && text.len() >= MIN_VECTOR_QUERY_LEN
                    && !session_start =>
            {
                match self.vector_candidates(text, query).await {
                    Err(StorageError::Embedding(e)) => {
                        tracing::warn!("query embedding failed ({e}); falling back to keyword search");
                        self.keyword_candidates(text, query)
                    }
                    other => other,
                }
            }
            Some(text) if !text.is_empty() && !session_start => self.keyword_candidates(text, query),
            _ => self.browse_candidates(query, now),
        };

        // A transient read failure yields an empty result with a
        // diagnostic; recall metadata is left untouched
        let candidates = match generated {
            Ok(candidates) => candidates,
            Err(e) => {
                tracing::warn!("recall candidate generation failed: {e}");
                return Ok(Vec::new());
            }
        };

        let mut results: Vec<RecallResult> = candidates
            .into_iter()
            .filter(|(entry, _)| self.passes_filters(entry, query, now))
            .map(|(entry, similarity)| {
                if query.no_boost {
                    RecallResult {
                        score: similarity,
                        scores: ScoreBreakdown {
                            similarity,
                            total: similarity,
                            ..Default::default()
                        },
                        entry,
                    }
                } else {
                    let breakdown = scoring::score(&entry, similarity, now, &self.scoring);
                    RecallResult {
                        score: breakdown.total,
                        scores: breakdown,
                        entry,
                    }
                }
            })
            .collect();

        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let results = if session_start {
            let sections = session::categorize(results, self.scoring.dead_band);
            session::allocate_budget(sections, query.budget, &self.session)
        } else {
            results.truncate(query.limit);
            results
        };

        if !query.no_update && !results.is_empty() {
            let ids: Vec<String> = results.iter().map(|r| r.entry.id.clone()).collect();
            self.storage.update_recall_metadata(&ids)?;
        }

        Ok(results)
    }

    // ========================================================================
    // CANDIDATE GENERATION
    // ========================================================================

    async fn vector_candidates(
        &self,
        text: &str,
        query: &RecallQuery,
    ) -> Result<Vec<(StoredEntry, f64)>> {
        let vector = self.query_embedding(text).await?;
        let k = query.limit.max(1) * 3;

        let mut candidates = Vec::new();
        for (id, similarity) in self.storage.vector_search(&vector, k)? {
            if let Some(entry) = self.storage.get_entry(&id)? {
                candidates.push((entry, similarity as f64));
            }
        }

        // The ANN index only holds active entries; surface inactive ones
        // through a scan when explicitly asked for
        if query.include_inactive {
            let inactive = self.storage.entries(&EntryFilter {
                include_inactive: true,
                limit: Some(k),
                ..Default::default()
            })?;
            for entry in inactive {
                if !entry.is_active() && candidates.iter().all(|(e, _)| e.id != entry.id) {
                    candidates.push((entry, 0.0));
                }
            }
        }

        Ok(candidates)
    }

    async fn query_embedding(&self, text: &str) -> Result<Vec<f32>> {
        if let Some(cached) = self
            .query_cache
            .lock()
            .map_err(|_| StorageError::LockPoisoned("query cache"))?
            .get(text)
        {
            return Ok(cached.clone());
        }

        let mut vectors = self.embedder.embed(&[text.to_string()]).await?;
        let vector = vectors
            .pop()
            .ok_or(crate::embedding::EmbeddingError::ShapeMismatch {
                sent: 1,
                received: 0,
            })?;

        self.query_cache
            .lock()
            .map_err(|_| StorageError::LockPoisoned("query cache"))?
            .put(text.to_string(), vector.clone());
        Ok(vector)
    }

    fn keyword_candidates(
        &self,
        text: &str,
        query: &RecallQuery,
    ) -> Result<Vec<(StoredEntry, f64)>> {
        let k = query.limit.max(1) * 3;
        let hits = self.storage.keyword_search(text, k)?;
        let total = hits.len().max(1);

        let mut candidates = Vec::new();
        for (rank, (id, _bm25)) in hits.into_iter().enumerate() {
            if let Some(entry) = self.storage.get_entry(&id)? {
                // Keyword rank mapped into the similarity slot
                let pseudo = 0.5 * (1.0 - rank as f64 / total as f64);
                candidates.push((entry, pseudo));
            }
        }
        Ok(candidates)
    }

    fn browse_candidates(
        &self,
        query: &RecallQuery,
        now: DateTime<Utc>,
    ) -> Result<Vec<(StoredEntry, f64)>> {
        let session_start = query.context == RecallContext::SessionStart;
        let (window_days, limit) = if session_start {
            (
                self.session.permanent_window_days,
                self.session.candidate_limit,
            )
        } else {
            (self.session.permanent_window_days, query.limit.max(1) * 3)
        };

        let since = query.since.or(Some(now - Duration::days(window_days)));
        let mut entries = self.storage.entries(&EntryFilter {
            types: query.types.clone(),
            tags: query.tags.clone(),
            min_importance: query.min_importance,
            since,
            expiry: query.expiry.clone(),
            platform: query.platform.clone(),
            projects: query.projects.clone(),
            exclude_projects: query.exclude_projects.clone(),
            strict_project: query.strict,
            include_inactive: query.include_inactive,
            limit: Some(limit),
        })?;

        if session_start {
            // Temporary entries use their own shorter window
            let temporary_cutoff = now - Duration::days(self.session.temporary_window_days);
            entries.retain(|e| e.expiry != Expiry::Temporary || e.created_at >= temporary_cutoff);

            // Core entries are always candidates regardless of the window
            let core = self.storage.entries(&EntryFilter {
                expiry: Some(vec![Expiry::Core]),
                ..Default::default()
            })?;
            for entry in core {
                if entries.iter().all(|e| e.id != entry.id) {
                    entries.push(entry);
                }
            }
        }

        Ok(entries.into_iter().map(|e| (e, 0.0)).collect())
    }

    // ========================================================================
    // FILTERS
    // ========================================================================

    fn passes_filters(&self, entry: &StoredEntry, query: &RecallQuery, _now: DateTime<Utc>) -> bool {
        if !query.include_inactive && !entry.is_active() {
            return false;
        }

        // Suppression always applies
        let context_label = query.context.label();
        if entry.suppressed_contexts.iter().any(|c| c == &context_label) {
            return false;
        }

        if let Some(types) = &query.types {
            if !types.contains(&entry.entry_type) {
                return false;
            }
        }
        if let Some(expiry) = &query.expiry {
            if !expiry.contains(&entry.expiry) {
                return false;
            }
        }
        if let Some(scope) = query.scope {
            if entry.scope != scope {
                return false;
            }
        }
        if let Some(min) = query.min_importance {
            if entry.importance < min {
                return false;
            }
        }
        if let Some(since) = query.since {
            if entry.created_at < since {
                return false;
            }
        }
        if let Some(platform) = &query.platform {
            if entry.platform.as_deref() != Some(platform.as_str()) {
                return false;
            }
        }
        if let Some(projects) = &query.projects {
            match &entry.project {
                Some(project) => {
                    if !projects.contains(project) {
                        return false;
                    }
                }
                None => {
                    if query.strict {
                        return false;
                    }
                }
            }
        }
        if let Some(excluded) = &query.exclude_projects {
            if let Some(project) = &entry.project {
                if excluded.contains(project) {
                    return false;
                }
            }
        }
        if let Some(tags) = &query.tags {
            if !tags.iter().any(|t| entry.tags.contains(t)) {
                return false;
            }
        }

        true
    }
}

// ============================================================================
// TESTS
// ============================================================================
