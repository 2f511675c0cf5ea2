//! Store Pipeline
//!
//! `store_entries` is the single write path for knowledge entries:
//!
//! 1. Within-batch dedup collapses `(subject, type, source_file)` repeats.
//! 2. Embeddings resolve in one provider call through the batch cache.
//! 3. Each survivor is classified against the corpus (dedup bands); entries
//!    in the LLM band get a conflict plan from the resolver.
//! 4. Every decision is applied inside ONE transaction per batch, followed
//!    by an ingest-log row. `dry_run` rolls the transaction back.
//! 5. After commit, the in-process vector and subject indexes are updated.
//!
//! Suspension points (embedding, LLM) all happen before the transaction
//! opens, so the writer lock is never held across an await.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use uuid::Uuid;

use crate::dedup::conflict::{ConflictConfig, ConflictResolver, ConflictVerdict, PlannedAction};
use crate::dedup::{DedupClassifier, DedupConfig, DedupDecision};
use crate::embedding::{EmbeddingCache, EmbeddingProvider};
use crate::llm::LlmClient;
use crate::memory::{normalize_subject, KnowledgeEntry, RelationType};
use crate::storage::{self, Result, RetirementLedger, Storage};

// ============================================================================
// OPTIONS / RESULT
// ============================================================================

/// Decision callback: `(input_index, decision)`, fired in input order
pub type DecisionHook = Box<dyn Fn(usize, &DedupDecision) + Send + Sync>;

/// Per-batch options
#[derive(Default)]
pub struct StoreOptions {
    /// Classify and report, then roll back
    pub dry_run: bool,
    /// Transcript path recorded in the ingest log
    pub file_path: Option<String>,
    /// Hash of the ingested slice recorded in the ingest log
    pub file_hash: Option<String>,
    /// Observer for per-entry decisions
    pub on_decision: Option<DecisionHook>,
}

/// Batch outcome
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct StoreResult {
    /// Entries inserted
    pub added: usize,
    /// Entries that reinforced an existing one
    pub updated: usize,
    /// Entries dropped (idempotent, duplicate, near-exact)
    pub skipped: usize,
    /// Relation edges recorded
    pub relations_created: usize,
    /// Total rows in the database after the batch
    pub total_entries: i64,
    /// Wall-clock batch duration
    pub duration_ms: i64,
}

// ============================================================================
// INTERNAL PLAN
// ============================================================================

/// What Phase B applies for one surviving entry
enum PlanStep {
    Skip,
    Reinforce {
        entry_id: String,
    },
    Insert {
        entry: KnowledgeEntry,
        vector: Vec<f32>,
        relation: Option<(String, RelationType)>,
        supersede: Option<String>,
        verdicts: Vec<ConflictVerdict>,
        retired_reason: Option<String>,
    },
}

/// Post-commit index work for one inserted entry
struct IndexUpdate {
    new_id: String,
    vector: Vec<f32>,
    subject_key: Option<String>,
    active: bool,
    removed: Vec<(String, Option<String>)>,
}

// ============================================================================
// PIPELINE
// ============================================================================

/// The single write path for knowledge entries
pub struct StorePipeline {
    storage: Arc<Storage>,
    embedder: Arc<dyn EmbeddingProvider>,
    llm: Option<Arc<dyn LlmClient>>,
    dedup_config: DedupConfig,
    conflict_config: ConflictConfig,
    embed_cache: tokio::sync::Mutex<EmbeddingCache>,
    retirements: std::sync::Mutex<Option<RetirementLedger>>,
}

impl StorePipeline {
    /// Pipeline without LLM classification (bands degrade to insert)
    pub fn new(storage: Arc<Storage>, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            storage,
            embedder,
            llm: None,
            dedup_config: DedupConfig {
                llm_enabled: false,
                ..Default::default()
            },
            conflict_config: ConflictConfig::default(),
            embed_cache: tokio::sync::Mutex::new(EmbeddingCache::new()),
            retirements: std::sync::Mutex::new(None),
        }
    }

    /// Attach an LLM client, enabling the classification band
    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self.dedup_config.llm_enabled = true;
        self
    }

    /// Override the dedup thresholds
    pub fn with_dedup_config(mut self, config: DedupConfig) -> Self {
        self.dedup_config = config;
        self
    }

    /// Override the conflict-resolver knobs
    pub fn with_conflict_config(mut self, config: ConflictConfig) -> Self {
        self.conflict_config = config;
        self
    }

    /// Attach a retirement ledger so re-ingested retired entries stay retired
    pub fn with_retirement_ledger(self, ledger: RetirementLedger) -> Self {
        *self.retirements.lock().expect("ledger lock") = Some(ledger);
        self
    }

    /// The storage handle this pipeline writes to
    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Store a batch of entries; exactly one transaction, all-or-nothing
    pub async fn store_entries(
        &self,
        entries: Vec<KnowledgeEntry>,
        options: &StoreOptions,
    ) -> Result<StoreResult> {
        let started = Instant::now();
        let now = Utc::now();

        for entry in &entries {
            entry.validate()?;
        }

        // ---- Phase A: dedup + embeddings + conflict plans (no tx) ----

        // Within-batch dedup first; collapsed entries never reach the
        // per-entry guards
        let mut seen_batch_keys: HashSet<(String, String, Option<String>)> = HashSet::new();
        let mut result = StoreResult::default();
        let mut survivors: Vec<(usize, KnowledgeEntry)> = Vec::new();

        for (index, entry) in entries.into_iter().enumerate() {
            let key = (
                normalize_subject(&entry.subject),
                entry.entry_type.as_str().to_string(),
                entry.source.file.clone(),
            );
            if seen_batch_keys.insert(key) {
                survivors.push((index, entry));
            } else {
                result.skipped += 1;
                self.notify(options, index, &DedupDecision::Skip {
                    reason: "duplicate within batch".to_string(),
                });
            }
        }

        let texts: Vec<String> = survivors.iter().map(|(_, e)| e.embed_text()).collect();
        let vectors = {
            let mut cache = self.embed_cache.lock().await;
            cache.resolve(self.embedder.as_ref(), &texts).await?
        };

        let classifier = DedupClassifier::new(&self.storage, self.dedup_config.clone());
        let mut steps: Vec<PlanStep> = Vec::with_capacity(survivors.len());

        for ((index, entry), vector) in survivors.into_iter().zip(vectors) {
            let decision = classifier.classify(&entry, &vector, now)?;
            self.notify(options, index, &decision);

            let retired_reason = self.ledger_match(&entry);

            let step = match decision {
                DedupDecision::Skip { .. } => {
                    result.skipped += 1;
                    PlanStep::Skip
                }
                DedupDecision::Reinforce { entry_id } => PlanStep::Reinforce { entry_id },
                DedupDecision::Insert => PlanStep::Insert {
                    entry,
                    vector,
                    relation: None,
                    supersede: None,
                    verdicts: Vec::new(),
                    retired_reason,
                },
                DedupDecision::InsertWithRelation { entry_id, relation } => PlanStep::Insert {
                    entry,
                    vector,
                    relation: Some((entry_id, relation)),
                    supersede: None,
                    verdicts: Vec::new(),
                    retired_reason,
                },
                DedupDecision::InsertSuperseding { entry_id } => PlanStep::Insert {
                    entry,
                    vector,
                    relation: None,
                    supersede: Some(entry_id),
                    verdicts: Vec::new(),
                    retired_reason,
                },
                DedupDecision::Classify { candidate_ids } => {
                    let verdicts = match &self.llm {
                        Some(llm) => {
                            let resolver = ConflictResolver::new(
                                &self.storage,
                                llm.as_ref(),
                                self.conflict_config.clone(),
                            );
                            resolver.resolve(&entry, &vector, &candidate_ids).await?
                        }
                        None => Vec::new(),
                    };
                    PlanStep::Insert {
                        entry,
                        vector,
                        relation: None,
                        supersede: None,
                        verdicts,
                        retired_reason,
                    }
                }
            };
            steps.push(step);
        }

        // ---- Phase B: one transaction per batch ----

        let mut index_updates: Vec<IndexUpdate> = Vec::new();

        let (added, updated, relations_created) =
            self.storage
                .write_transaction(options.dry_run, |conn| {
                    let mut added = 0usize;
                    let mut updated = 0usize;
                    let mut relations = 0usize;

                    for step in &steps {
                        match step {
                            PlanStep::Skip => {}
                            PlanStep::Reinforce { entry_id } => {
                                storage::reinforce_row(conn, entry_id, now)?;
                                updated += 1;
                            }
                            PlanStep::Insert {
                                entry,
                                vector,
                                relation,
                                supersede,
                                verdicts,
                                retired_reason,
                            } => {
                                let new_id = Uuid::new_v4().to_string();
                                let created_at = entry.created_at.unwrap_or(now);
                                storage::insert_entry_row(
                                    conn,
                                    entry,
                                    &new_id,
                                    &entry.content_hash(),
                                    Some(vector),
                                    created_at,
                                    now,
                                )?;
                                storage::insert_tags_rows(conn, &new_id, &entry.tags)?;
                                added += 1;

                                let mut removed: Vec<(String, Option<String>)> = Vec::new();

                                if let Some(reason) = retired_reason {
                                    storage::set_retired_row(conn, &new_id, reason, now)?;
                                }

                                if let Some((target, relation_type)) = relation {
                                    if storage::insert_relation_row(
                                        conn, &new_id, target, *relation_type, now,
                                    )? {
                                        relations += 1;
                                    }
                                }

                                if let Some(old_id) = supersede {
                                    storage::set_superseded_row(conn, old_id, &new_id, now)?;
                                    if storage::insert_relation_row(
                                        conn,
                                        &new_id,
                                        old_id,
                                        RelationType::Supersedes,
                                        now,
                                    )? {
                                        relations += 1;
                                    }
                                    removed.push(subject_key_of(conn, old_id)?);
                                }

                                for verdict in verdicts {
                                    match verdict.action {
                                        PlannedAction::AutoSupersede => {
                                            storage::set_superseded_row(
                                                conn,
                                                &verdict.existing_id,
                                                &new_id,
                                                now,
                                            )?;
                                            if storage::insert_relation_row(
                                                conn,
                                                &new_id,
                                                &verdict.existing_id,
                                                RelationType::Supersedes,
                                                now,
                                            )? {
                                                relations += 1;
                                            }
                                            removed
                                                .push(subject_key_of(conn, &verdict.existing_id)?);
                                        }
                                        PlannedAction::FlagContradiction => {
                                            storage::add_contradiction_row(
                                                conn,
                                                &verdict.existing_id,
                                                now,
                                            )?;
                                            if storage::insert_relation_row(
                                                conn,
                                                &new_id,
                                                &verdict.existing_id,
                                                RelationType::Contradicts,
                                                now,
                                            )? {
                                                relations += 1;
                                            }
                                        }
                                        PlannedAction::FlagForReview | PlannedAction::Coexist => {}
                                    }
                                    storage::insert_conflict_row(
                                        conn,
                                        &new_id,
                                        &verdict.existing_id,
                                        verdict.relation.as_str(),
                                        verdict.confidence,
                                        verdict.resolution,
                                        now,
                                    )?;
                                }

                                index_updates.push(IndexUpdate {
                                    new_id,
                                    vector: vector.clone(),
                                    subject_key: entry.normalized_subject_key(),
                                    active: retired_reason.is_none(),
                                    removed,
                                });
                            }
                        }
                    }

                    storage::append_ingest_log_row(
                        conn,
                        options.file_path.as_deref(),
                        options.file_hash.as_deref(),
                        added as i64,
                        updated as i64,
                        result.skipped as i64,
                        started.elapsed().as_millis() as i64,
                        now,
                    )?;

                    Ok((added, updated, relations))
                })?;

        result.added = added;
        result.updated = updated;
        result.relations_created = relations_created;

        // ---- Phase C: post-commit index maintenance ----

        if !options.dry_run {
            for update in index_updates {
                if update.active {
                    self.storage.vector_index_add(&update.new_id, &update.vector)?;
                    if let Some(key) = &update.subject_key {
                        self.storage.subject_index_add(key, &update.new_id)?;
                    }
                }
                for (old_id, old_key) in update.removed {
                    self.storage.vector_index_remove(&old_id)?;
                    if let Some(key) = old_key {
                        self.storage.subject_index_remove(&key, &old_id)?;
                    }
                }
            }
        }

        result.total_entries = self.storage.stats()?.total_entries;
        result.duration_ms = started.elapsed().as_millis() as i64;

        tracing::info!(
            added = result.added,
            updated = result.updated,
            skipped = result.skipped,
            relations = result.relations_created,
            dry_run = options.dry_run,
            "store batch finished in {}ms",
            result.duration_ms
        );

        Ok(result)
    }

    /// Retire an entry; with `persist` the retirement lands in the ledger
    /// and survives re-ingest of the same source
    pub fn retire(
        &self,
        entry_id: &str,
        reason: &str,
        persist: bool,
    ) -> Result<crate::memory::StoredEntry> {
        let mut guard = self
            .retirements
            .lock()
            .map_err(|_| crate::storage::StorageError::LockPoisoned("retirement ledger"))?;
        let ledger = if persist { guard.as_mut() } else { None };
        self.storage.retire(entry_id, reason, ledger)
    }

    fn notify(&self, options: &StoreOptions, index: usize, decision: &DedupDecision) {
        if let Some(hook) = &options.on_decision {
            hook(index, decision);
        }
    }

    /// Retirement-ledger probe for `(subject, type, content_hash)`
    fn ledger_match(&self, entry: &KnowledgeEntry) -> Option<String> {
        let guard = self.retirements.lock().ok()?;
        let ledger = guard.as_ref()?;
        ledger
            .find(&entry.subject, entry.entry_type, &entry.content_hash())
            .map(|r| r.reason.clone())
    }
}

/// `(id, subject_key)` of an entry inside the transaction
fn subject_key_of(
    conn: &rusqlite::Connection,
    entry_id: &str,
) -> Result<(String, Option<String>)> {
    use rusqlite::OptionalExtension;
    let key: Option<String> = conn
        .query_row(
            "SELECT subject_key FROM entries WHERE id = ?1",
            rusqlite::params![entry_id],
            |row| row.get(0),
        )
        .optional()?
        .flatten();
    Ok((entry_id.to_string(), key))
}

// ============================================================================
// TESTS
// ============================================================================
