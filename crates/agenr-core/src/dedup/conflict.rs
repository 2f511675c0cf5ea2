//! Conflict Resolver
//!
//! For an incoming entry in the LLM band, builds a candidate set (subject
//! index + ANN, always both), asks the LLM to classify each pair via a
//! strict tool call, and maps each verdict to an action through a fixed
//! policy table. The resolver only *plans*; the store pipeline applies the
//! plan inside its batch transaction and writes a conflict-log row per
//! verdict.
//!
//! Any LLM failure degrades to `unrelated` with confidence 0 - a conflict
//! call can never fail an insert.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::llm::{LlmClient, LlmOutput, LlmRequest, ToolSpec};
use crate::memory::{EntryType, KnowledgeEntry, StoredEntry};
use crate::storage::{ConflictResolution, Result, Storage};

// ============================================================================
// CLASSIFICATION
// ============================================================================

/// Relation returned by the classifier tool call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictRelation {
    /// New entry replaces the existing one
    Supersedes,
    /// New entry contradicts the existing one
    Contradicts,
    /// Both can stand
    Coexists,
    /// Not actually about the same thing
    Unrelated,
}

impl ConflictRelation {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictRelation::Supersedes => "supersedes",
            ConflictRelation::Contradicts => "contradicts",
            ConflictRelation::Coexists => "coexists",
            ConflictRelation::Unrelated => "unrelated",
        }
    }

    fn parse_lenient(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "supersedes" => ConflictRelation::Supersedes,
            "contradicts" => ConflictRelation::Contradicts,
            "coexists" => ConflictRelation::Coexists,
            _ => ConflictRelation::Unrelated,
        }
    }
}

/// Validated classifier verdict
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictClassification {
    /// Relation between new and existing
    pub relation: ConflictRelation,
    /// Classifier confidence in [0, 1]
    pub confidence: f64,
    /// Free-text rationale
    pub explanation: Option<String>,
}

impl ConflictClassification {
    /// The safe fallback: no relation, zero confidence
    pub fn unrelated() -> Self {
        Self {
            relation: ConflictRelation::Unrelated,
            confidence: 0.0,
            explanation: None,
        }
    }

    /// Tool definition the model is forced to answer with
    pub fn tool_spec() -> ToolSpec {
        ToolSpec {
            name: "classify_conflict".to_string(),
            schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "relation": {
                        "type": "string",
                        "enum": ["supersedes", "contradicts", "coexists", "unrelated"]
                    },
                    "confidence": {"type": "number", "minimum": 0.0, "maximum": 1.0},
                    "explanation": {"type": "string"}
                },
                "required": ["relation", "confidence"]
            }),
        }
    }

    /// Validate a model output against the tool schema; any shape mismatch
    /// degrades to [`ConflictClassification::unrelated`]
    pub fn from_output(output: &LlmOutput) -> Self {
        let Some(call) = output.tool_call() else {
            return Self::unrelated();
        };
        if call.name != "classify_conflict" {
            return Self::unrelated();
        }

        let relation = match call.arguments.get("relation").and_then(|v| v.as_str()) {
            Some(s) => ConflictRelation::parse_lenient(s),
            None => return Self::unrelated(),
        };
        let confidence = call
            .arguments
            .get("confidence")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0)
            .clamp(0.0, 1.0);
        let explanation = call
            .arguments
            .get("explanation")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        Self {
            relation,
            confidence,
            explanation,
        }
    }
}

// ============================================================================
// POLICY
// ============================================================================

/// What the store pipeline should do about one verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlannedAction {
    /// Supersede the existing entry with the new one
    AutoSupersede,
    /// Log for operator review, no data change
    FlagForReview,
    /// Log for review, bump contradictions, add a contradicts edge
    FlagContradiction,
    /// Keep both, nothing recorded beyond the log row
    Coexist,
}

/// A planned verdict against one existing entry
#[derive(Debug, Clone)]
pub struct ConflictVerdict {
    /// The existing entry the verdict is about
    pub existing_id: String,
    /// Classifier relation
    pub relation: ConflictRelation,
    /// Classifier confidence
    pub confidence: f64,
    /// Action for the pipeline
    pub action: PlannedAction,
    /// Conflict-log resolution tag
    pub resolution: ConflictResolution,
}

/// The action policy table (rule order matters: supersede gates first,
/// then type immutability, then contradiction/uncertainty flags)
pub fn action_policy(
    classification: &ConflictClassification,
    existing: &StoredEntry,
    new_importance: i64,
    auto_supersede_confidence: f64,
    coexist_flag_confidence: f64,
) -> (PlannedAction, ConflictResolution) {
    let relation = classification.relation;
    let confidence = classification.confidence;
    let supersedable = matches!(existing.entry_type, EntryType::Fact | EntryType::Preference);

    if relation == ConflictRelation::Supersedes
        && confidence > auto_supersede_confidence
        && supersedable
    {
        if new_importance >= existing.importance {
            return (PlannedAction::AutoSupersede, ConflictResolution::AutoSuperseded);
        }
        // Confident supersession but the new entry matters less: a human
        // should look at it
        return (PlannedAction::FlagForReview, ConflictResolution::Pending);
    }

    if existing.entry_type == EntryType::Event {
        // Events are immutable
        return (PlannedAction::Coexist, ConflictResolution::Coexist);
    }

    if relation == ConflictRelation::Contradicts {
        return (PlannedAction::FlagContradiction, ConflictResolution::Pending);
    }

    if relation == ConflictRelation::Coexists && confidence <= coexist_flag_confidence {
        return (PlannedAction::FlagForReview, ConflictResolution::Pending);
    }

    if matches!(existing.entry_type, EntryType::Decision | EntryType::Lesson)
        && relation != ConflictRelation::Unrelated
    {
        return (PlannedAction::FlagForReview, ConflictResolution::Pending);
    }

    (PlannedAction::Coexist, ConflictResolution::Coexist)
}

// ============================================================================
// RESOLVER
// ============================================================================

/// Candidate-set and confidence knobs
#[derive(Debug, Clone)]
pub struct ConflictConfig {
    /// Auto-supersede requires confidence above this
    pub auto_supersede_confidence: f64,
    /// Coexists verdicts at or below this confidence are flagged
    pub coexist_flag_confidence: f64,
    /// Subject-index candidates are capped here (newest first)
    pub candidate_cap: usize,
    /// ANN candidates fetched per resolution
    pub vector_top_k: usize,
    /// Fuzzy threshold for the subject-index lookups
    pub fuzzy_threshold: f64,
    /// Only ANN hits at or above this similarity are candidates
    pub min_candidate_similarity: f32,
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            auto_supersede_confidence: 0.85,
            coexist_flag_confidence: 0.75,
            candidate_cap: 8,
            vector_top_k: 10,
            fuzzy_threshold: 0.6,
            min_candidate_similarity: 0.80,
        }
    }
}

/// Plans conflict actions for entries in the LLM band
pub struct ConflictResolver<'a> {
    storage: &'a Storage,
    llm: &'a dyn LlmClient,
    config: ConflictConfig,
}

impl<'a> ConflictResolver<'a> {
    /// Resolver over a storage handle and an LLM client
    pub fn new(storage: &'a Storage, llm: &'a dyn LlmClient, config: ConflictConfig) -> Self {
        Self {
            storage,
            llm,
            config,
        }
    }

    /// Plan verdicts for one incoming entry
    ///
    /// `seed_candidates` are the dedup classifier's nearest neighbors; the
    /// resolver widens them with subject-index and fresh ANN lookups so
    /// recent recontextualizations surface.
    pub async fn resolve(
        &self,
        incoming: &KnowledgeEntry,
        vector: &[f32],
        seed_candidates: &[String],
    ) -> Result<Vec<ConflictVerdict>> {
        let candidates = self.candidate_set(incoming, vector, seed_candidates)?;
        let mut verdicts = Vec::with_capacity(candidates.len());

        for existing in candidates {
            let classification = self.classify_pair(incoming, &existing).await;
            let (action, resolution) = action_policy(
                &classification,
                &existing,
                incoming.importance,
                self.config.auto_supersede_confidence,
                self.config.coexist_flag_confidence,
            );
            verdicts.push(ConflictVerdict {
                existing_id: existing.id,
                relation: classification.relation,
                confidence: classification.confidence,
                action,
                resolution,
            });
        }

        Ok(verdicts)
    }

    /// Union of subject-index matches (fuzzy + cross-entity, capped newest
    /// first) and ANN top-K. The vector search always runs, even when the
    /// subject side fills the cap.
    fn candidate_set(
        &self,
        incoming: &KnowledgeEntry,
        vector: &[f32],
        seed_candidates: &[String],
    ) -> Result<Vec<StoredEntry>> {
        let mut ids: BTreeSet<String> = seed_candidates.iter().cloned().collect();

        if let Some(key) = incoming.normalized_subject_key() {
            let mut subject_ids = self
                .storage
                .subject_fuzzy_lookup(&key, self.config.fuzzy_threshold)?;
            subject_ids.extend(self.storage.subject_cross_entity_lookup(&key)?);

            if subject_ids.len() > self.config.candidate_cap {
                // Above cap: keep the newest
                let mut loaded: Vec<StoredEntry> = Vec::new();
                for id in &subject_ids {
                    if let Some(entry) = self.storage.get_entry(id)? {
                        loaded.push(entry);
                    }
                }
                loaded.sort_by(|a, b| b.created_at.cmp(&a.created_at));
                loaded.truncate(self.config.candidate_cap);
                ids.extend(loaded.into_iter().map(|e| e.id));
            } else {
                ids.extend(subject_ids);
            }
        }

        for (id, similarity) in self.storage.vector_search(vector, self.config.vector_top_k)? {
            if similarity >= self.config.min_candidate_similarity {
                ids.insert(id);
            }
        }

        let mut candidates = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(entry) = self.storage.get_entry(&id)? {
                if entry.is_active() {
                    candidates.push(entry);
                }
            }
        }
        Ok(candidates)
    }

    /// One classifier call; every failure path is the unrelated fallback
    async fn classify_pair(
        &self,
        incoming: &KnowledgeEntry,
        existing: &StoredEntry,
    ) -> ConflictClassification {
        let request = LlmRequest {
            system: Some(
                "You compare two knowledge entries about the same subject and decide how the NEW \
                 one relates to the EXISTING one. Answer only with the classify_conflict tool."
                    .to_string(),
            ),
            prompt: format!(
                "EXISTING ({} / importance {}):\n{}\n{}\n\nNEW ({} / importance {}):\n{}\n{}",
                existing.entry_type,
                existing.importance,
                existing.subject,
                existing.content,
                incoming.entry_type,
                incoming.importance,
                incoming.subject,
                incoming.content,
            ),
            tool: Some(ConflictClassification::tool_spec()),
            timeout_secs: None,
        };

        match self.llm.run(request).await {
            Ok(output) => ConflictClassification::from_output(&output),
            Err(e) => {
                tracing::warn!("conflict classification unavailable ({e}); treating as unrelated");
                ConflictClassification::unrelated()
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
