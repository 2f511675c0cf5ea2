//! Consolidator
//!
//! Offline cluster-and-merge over the whole corpus. Runs as an exclusive
//! job (callers serialize it through the write queue) in passes:
//!
//! 1. Report (read-only): counts, duplicate-cluster estimate, forgetting
//!    candidates.
//! 2. Rule-based cleanup: merge exact canonical-key groups and
//!    `(subject_key, type)` pairs at cosine >= 0.95.
//! 3. Phase 1 clustering at 0.82 (max cluster 8), each cluster classified
//!    in one batched LLM call producing merge instructions.
//! 4. Phase 2 at max(threshold, 0.88) (max cluster 6).
//! 5. Forgetting pass: scored candidates are deleted only with `forget`
//!    set (and forgetting enabled in config), otherwise reported.
//! 6. WAL checkpoint; VACUUM when enough rows were reclaimed.
//!
//! Entries with different non-null projects are never merged; this
//! implementation requires equal project values outright. A checkpoint
//! file records the cluster cursor so `batch`-limited runs resume
//! deterministically.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::config::ForgettingSection;
use crate::embedding::cosine_similarity;
use crate::llm::{LlmClient, LlmRequest, ToolSpec};
use crate::memory::{RelationType, StoredEntry};
use crate::storage::{EntryFilter, Result, Storage};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Consolidation knobs
#[derive(Debug, Clone)]
pub struct ConsolidateConfig {
    /// Phase-1 similarity threshold
    pub phase1_threshold: f32,
    /// Phase-1 cluster size cap
    pub phase1_max_cluster: usize,
    /// Phase-2 similarity floor (raised to at least this)
    pub phase2_threshold: f32,
    /// Phase-2 cluster size cap
    pub phase2_max_cluster: usize,
    /// Rule-based `(subject_key, type)` merge threshold
    pub rule_merge_threshold: f32,
    /// Clusters processed per run; None = all
    pub batch: Option<usize>,
    /// Resume from the checkpoint cursor (`--no-resume` clears it)
    pub resume: bool,
    /// Actually delete forgetting candidates (`--forget`)
    pub forget: bool,
    /// VACUUM only when at least this many rows were deleted
    pub vacuum_min_deletes: usize,
}

impl Default for ConsolidateConfig {
    fn default() -> Self {
        Self {
            phase1_threshold: 0.82,
            phase1_max_cluster: 8,
            phase2_threshold: 0.88,
            phase2_max_cluster: 6,
            rule_merge_threshold: 0.95,
            batch: None,
            resume: true,
            forget: false,
            vacuum_min_deletes: 10,
        }
    }
}

// ============================================================================
// REPORT
// ============================================================================

/// What a consolidation run did (or, in report mode, would do)
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConsolidateReport {
    /// All rows at start
    pub total_entries: i64,
    /// Active rows at start
    pub active_entries: i64,
    /// Rule-based merges applied (entries superseded)
    pub rule_merged: usize,
    /// Duplicate clusters found across both phases
    pub clusters_found: usize,
    /// Clusters actually classified this run (batch-limited)
    pub clusters_processed: usize,
    /// Entries superseded by cluster merges
    pub cluster_merged: usize,
    /// Forgetting candidates (ids)
    pub forgetting_candidates: Vec<String>,
    /// Entries actually deleted by the forgetting pass
    pub forgotten: usize,
    /// Wall-clock duration
    pub duration_ms: i64,
}

/// Checkpoint file: cluster cursor for resumable runs
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Checkpoint {
    cursor: usize,
}

impl Checkpoint {
    fn load(path: &PathBuf) -> Self {
        std::fs::read_to_string(path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }

    fn save(&self, path: &PathBuf) -> std::io::Result<()> {
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_string(self)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

// ============================================================================
// CONSOLIDATOR
// ============================================================================

fn merge_cluster_tool() -> ToolSpec {
    ToolSpec {
        name: "merge_cluster".to_string(),
        schema: serde_json::json!({
            "type": "object",
            "properties": {
                "merges": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "keep": {"type": "integer"},
                            "absorb": {"type": "array", "items": {"type": "integer"}}
                        },
                        "required": ["keep", "absorb"]
                    }
                }
            },
            "required": ["merges"]
        }),
    }
}

/// The offline consolidator
pub struct Consolidator {
    storage: Arc<Storage>,
    llm: Option<Arc<dyn LlmClient>>,
    config: ConsolidateConfig,
    forgetting: ForgettingSection,
    checkpoint_path: Option<PathBuf>,
    lock_path: Option<PathBuf>,
}

impl Consolidator {
    /// Consolidator over a storage handle
    pub fn new(storage: Arc<Storage>, config: ConsolidateConfig) -> Self {
        Self {
            storage,
            llm: None,
            config,
            forgetting: ForgettingSection::default(),
            checkpoint_path: None,
            lock_path: None,
        }
    }

    /// Attach an LLM for cluster classification
    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    /// Use the config-file forgetting section
    pub fn with_forgetting(mut self, forgetting: ForgettingSection) -> Self {
        self.forgetting = forgetting;
        self
    }

    /// Persist the cluster cursor here
    pub fn with_checkpoint(mut self, path: PathBuf) -> Self {
        self.checkpoint_path = Some(path);
        self
    }

    /// Warn-on-concurrency lock marker
    pub fn with_lock_marker(mut self, path: PathBuf) -> Self {
        self.lock_path = Some(path);
        self
    }

    /// Read-only report: what a full run would do
    pub fn report(&self) -> Result<ConsolidateReport> {
        let started = std::time::Instant::now();
        let stats = self.storage.stats()?;
        let entries = self.active_with_embeddings()?;

        let clusters = cluster(
            &entries,
            self.config.phase1_threshold,
            self.config.phase1_max_cluster,
        );

        let now = Utc::now();
        let forgetting_candidates = entries
            .iter()
            .filter(|(e, _)| self.is_forgetting_candidate(e, now))
            .map(|(e, _)| e.id.clone())
            .collect();

        Ok(ConsolidateReport {
            total_entries: stats.total_entries,
            active_entries: stats.active_entries,
            clusters_found: clusters.len(),
            forgetting_candidates,
            duration_ms: started.elapsed().as_millis() as i64,
            ..Default::default()
        })
    }

    /// Full consolidation run
    pub async fn run(&self) -> Result<ConsolidateReport> {
        let started = std::time::Instant::now();
        let _lock = self.acquire_lock();

        let stats = self.storage.stats()?;
        let mut report = ConsolidateReport {
            total_entries: stats.total_entries,
            active_entries: stats.active_entries,
            ..Default::default()
        };

        // Rule-based cleanup first; it shrinks the clustering input
        report.rule_merged = self.rule_based_cleanup()?;

        // Two clustering phases, phase 2 at the raised threshold
        let phase2_threshold = self.config.phase2_threshold.max(self.config.phase1_threshold);
        let phases = [
            (self.config.phase1_threshold, self.config.phase1_max_cluster),
            (phase2_threshold, self.config.phase2_max_cluster),
        ];

        for (threshold, max_cluster) in phases {
            let entries = self.active_with_embeddings()?;
            let clusters = cluster(&entries, threshold, max_cluster);
            report.clusters_found += clusters.len();

            let (processed, merged) = self.classify_clusters(&entries, clusters).await?;
            report.clusters_processed += processed;
            report.cluster_merged += merged;
        }

        // Forgetting pass
        let now = Utc::now();
        let entries = self.active_with_embeddings()?;
        let candidates: Vec<String> = entries
            .iter()
            .filter(|(e, _)| self.is_forgetting_candidate(e, now))
            .map(|(e, _)| e.id.clone())
            .collect();

        if self.config.forget && self.forgetting.enabled && !candidates.is_empty() {
            report.forgotten = self.storage.delete_entries(&candidates)?;
            tracing::info!("forgetting pass deleted {} entries", report.forgotten);
        }
        report.forgetting_candidates = candidates;

        self.storage.wal_checkpoint()?;
        if report.forgotten + report.cluster_merged >= self.config.vacuum_min_deletes {
            self.storage.vacuum()?;
        }

        self.release_lock();
        report.duration_ms = started.elapsed().as_millis() as i64;
        tracing::info!(
            rule_merged = report.rule_merged,
            cluster_merged = report.cluster_merged,
            forgotten = report.forgotten,
            "consolidation finished in {}ms",
            report.duration_ms
        );
        Ok(report)
    }

    // ========================================================================
    // RULE-BASED CLEANUP
    // ========================================================================

    /// Exact canonical-key groups and near-identical `(subject_key, type)`
    /// pairs collapse without the LLM
    fn rule_based_cleanup(&self) -> Result<usize> {
        let entries = self.active_with_embeddings()?;
        let mut merged = 0usize;
        let mut superseded: HashSet<String> = HashSet::new();

        // Exact canonical key
        let mut by_canonical: std::collections::HashMap<String, Vec<usize>> =
            std::collections::HashMap::new();
        for (index, (entry, _)) in entries.iter().enumerate() {
            if let Some(key) = &entry.canonical_key {
                by_canonical.entry(key.clone()).or_default().push(index);
            }
        }
        for group in by_canonical.values() {
            merged += self.merge_group(&entries, group, &mut superseded)?;
        }

        // (subject_key, type) groups above the cosine floor
        let mut by_subject: std::collections::HashMap<(String, &str), Vec<usize>> =
            std::collections::HashMap::new();
        for (index, (entry, _)) in entries.iter().enumerate() {
            if superseded.contains(&entry.id) {
                continue;
            }
            if let Some(key) = &entry.subject_key {
                by_subject
                    .entry((key.clone(), entry.entry_type.as_str()))
                    .or_default()
                    .push(index);
            }
        }
        for group in by_subject.values() {
            if group.len() < 2 {
                continue;
            }
            // Sub-cluster the group at the rule floor so a fresh outlier
            // cannot mask a genuine duplicate pair
            let subgroup: Vec<(StoredEntry, Vec<f32>)> = group
                .iter()
                .map(|&i| (entries[i].0.clone(), entries[i].1.clone()))
                .collect();
            for sub in cluster(&subgroup, self.config.rule_merge_threshold, group.len()) {
                merged += self.merge_group(&subgroup, &sub, &mut superseded)?;
            }
        }

        Ok(merged)
    }

    /// Supersede everything in the group by its newest member; skips
    /// mixed-project groups entirely
    fn merge_group(
        &self,
        entries: &[(StoredEntry, Vec<f32>)],
        group: &[usize],
        superseded: &mut HashSet<String>,
    ) -> Result<usize> {
        let mut live: Vec<&StoredEntry> = group
            .iter()
            .map(|&i| &entries[i].0)
            .filter(|e| !superseded.contains(&e.id))
            .collect();
        if live.len() < 2 {
            return Ok(0);
        }
        if !same_project(&live) {
            return Ok(0);
        }

        live.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let keeper = live[0];

        let mut merged = 0;
        for loser in &live[1..] {
            self.storage.supersede_entry(&loser.id, &keeper.id)?;
            self.storage
                .add_relation(&keeper.id, &loser.id, RelationType::Supersedes)?;
            self.storage.reinforce_entry(&keeper.id)?;
            superseded.insert(loser.id.clone());
            merged += 1;
        }
        Ok(merged)
    }

    // ========================================================================
    // CLUSTER CLASSIFICATION
    // ========================================================================

    /// Classify clusters (batch-limited, checkpoint-resumable); returns
    /// `(clusters processed, entries merged)`
    async fn classify_clusters(
        &self,
        entries: &[(StoredEntry, Vec<f32>)],
        clusters: Vec<Vec<usize>>,
    ) -> Result<(usize, usize)> {
        let Some(llm) = &self.llm else {
            return Ok((0, 0));
        };
        if clusters.is_empty() {
            return Ok((0, 0));
        }

        let mut checkpoint = match (&self.checkpoint_path, self.config.resume) {
            (Some(path), true) => Checkpoint::load(path),
            _ => Checkpoint::default(),
        };
        if checkpoint.cursor >= clusters.len() {
            checkpoint.cursor = 0;
        }

        let remaining = clusters.len() - checkpoint.cursor;
        let to_process = self.config.batch.unwrap_or(remaining).min(remaining);

        let mut merged = 0usize;
        let mut processed = 0usize;

        for cluster_indices in clusters.iter().skip(checkpoint.cursor).take(to_process) {
            let members: Vec<&StoredEntry> =
                cluster_indices.iter().map(|&i| &entries[i].0).collect();
            merged += self.classify_one_cluster(llm.as_ref(), &members).await?;
            processed += 1;
            checkpoint.cursor += 1;

            if let Some(path) = &self.checkpoint_path {
                if let Err(e) = checkpoint.save(path) {
                    tracing::warn!("consolidation checkpoint save failed: {e}");
                }
            }
        }

        // A completed pass clears the cursor
        if checkpoint.cursor >= clusters.len() {
            if let Some(path) = &self.checkpoint_path {
                let _ = std::fs::remove_file(path);
            }
        }

        Ok((processed, merged))
    }

    /// One batched LLM call per cluster; failure leaves the cluster alone
    async fn classify_one_cluster(
        &self,
        llm: &dyn LlmClient,
        members: &[&StoredEntry],
    ) -> Result<usize> {
        if !same_project(members) {
            return Ok(0);
        }

        let listing = members
            .iter()
            .enumerate()
            .map(|(i, e)| format!("{i}: [{}] {} - {}", e.entry_type, e.subject, e.content))
            .collect::<Vec<_>>()
            .join("\n");

        let request = LlmRequest {
            system: Some(
                "These memory entries were clustered by semantic similarity. Decide which are \
                 redundant restatements of the same knowledge. Answer only with the \
                 merge_cluster tool; a merge keeps one entry and absorbs its restatements. \
                 Entries adding genuinely new information stay unmerged."
                    .to_string(),
            ),
            prompt: listing,
            tool: Some(merge_cluster_tool()),
            timeout_secs: None,
        };

        let output = match llm.run(request).await {
            Ok(output) => output,
            Err(e) => {
                tracing::warn!("cluster classification unavailable ({e}); cluster left alone");
                return Ok(0);
            }
        };

        let Some(call) = output.tool_call() else {
            return Ok(0);
        };
        let Some(merges) = call.arguments.get("merges").and_then(|v| v.as_array()) else {
            return Ok(0);
        };

        let mut merged = 0usize;
        let mut touched: HashSet<usize> = HashSet::new();

        for merge in merges {
            let Some(keep) = merge.get("keep").and_then(|v| v.as_u64()).map(|n| n as usize) else {
                continue;
            };
            let Some(absorb) = merge.get("absorb").and_then(|v| v.as_array()) else {
                continue;
            };
            if keep >= members.len() || touched.contains(&keep) {
                continue;
            }
            touched.insert(keep);

            for index in absorb.iter().filter_map(|v| v.as_u64()).map(|n| n as usize) {
                if index == keep || index >= members.len() || touched.contains(&index) {
                    continue;
                }
                touched.insert(index);
                self.storage
                    .supersede_entry(&members[index].id, &members[keep].id)?;
                self.storage.add_relation(
                    &members[keep].id,
                    &members[index].id,
                    RelationType::Supersedes,
                )?;
                self.storage.reinforce_entry(&members[keep].id)?;
                merged += 1;
            }
        }

        Ok(merged)
    }

    // ========================================================================
    // FORGETTING
    // ========================================================================

    /// Forgetting score in [0, 1]: old, unimportant, never recalled, and
    /// long unconfirmed entries score high
    pub fn forgetting_score(&self, entry: &StoredEntry, now: chrono::DateTime<Utc>) -> f64 {
        let age_days = entry.age_days(now);
        let age_factor = (age_days / self.forgetting.max_age_days.max(1) as f64).min(1.0);
        let importance_factor = 1.0 - entry.importance as f64 / 10.0;
        let recall_factor = 1.0 / (1.0 + entry.recall_count as f64);
        let unconfirmed_days = (now - entry.updated_at).num_days();
        let confirmation_factor = if unconfirmed_days > 30 { 1.0 } else { 0.0 };

        0.4 * age_factor + 0.3 * importance_factor + 0.2 * recall_factor + 0.1 * confirmation_factor
    }

    fn is_forgetting_candidate(&self, entry: &StoredEntry, now: chrono::DateTime<Utc>) -> bool {
        if entry.expiry == crate::memory::Expiry::Core {
            return false;
        }
        if self.is_protected(entry) {
            return false;
        }
        self.forgetting_score(entry, now) >= self.forgetting.score_threshold
    }

    /// `forgetting.protect` patterns match as substrings of the subject,
    /// canonical key, or tags
    fn is_protected(&self, entry: &StoredEntry) -> bool {
        self.forgetting.protect.iter().any(|pattern| {
            let pattern = pattern.to_lowercase();
            entry.subject.to_lowercase().contains(&pattern)
                || entry
                    .canonical_key
                    .as_deref()
                    .map(|k| k.to_lowercase().contains(&pattern))
                    .unwrap_or(false)
                || entry.tags.iter().any(|t| t.contains(&pattern))
        })
    }

    // ========================================================================
    // LOCK / HELPERS
    // ========================================================================

    fn acquire_lock(&self) -> Option<PathBuf> {
        let path = self.lock_path.clone()?;
        if path.exists() {
            tracing::warn!(
                "consolidation lock marker {} already present; another run may be active",
                path.display()
            );
        } else if let Err(e) = std::fs::write(&path, std::process::id().to_string()) {
            tracing::warn!("failed to write consolidation lock marker: {e}");
        }
        Some(path)
    }

    fn release_lock(&self) {
        if let Some(path) = &self.lock_path {
            let _ = std::fs::remove_file(path);
        }
    }

    /// Active entries paired with their stored vectors; entries without
    /// an embedding never consolidate
    fn active_with_embeddings(&self) -> Result<Vec<(StoredEntry, Vec<f32>)>> {
        let mut out = Vec::new();
        for entry in self.storage.entries(&EntryFilter::default())? {
            if !entry.has_embedding {
                continue;
            }
            if let Some(vector) = self.storage.embedding_of(&entry.id)? {
                out.push((entry, vector));
            }
        }
        Ok(out)
    }
}

/// No merge may span different non-null projects; this implementation
/// requires equal project values
fn same_project(entries: &[&StoredEntry]) -> bool {
    let first = entries.first().and_then(|e| e.project.as_deref());
    entries.iter().all(|e| e.project.as_deref() == first)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmOutput, ToolCall};
    use crate::memory::KnowledgeEntry;
    use async_trait::async_trait;
    use chrono::Duration;

    const DIMS: usize = 8;

    fn unit(v: [f32; DIMS]) -> Vec<f32> {
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        v.iter().map(|x| x / norm).collect()
    }

    fn seed(
        storage: &Arc<Storage>,
        subject: &str,
        vector: &[f32],
        mutate: impl FnOnce(&mut KnowledgeEntry),
    ) -> String {
        let mut entry = KnowledgeEntry {
            subject: subject.to_string(),
            content: format!("content for {subject}"),
            ..Default::default()
        };
        mutate(&mut entry);
        storage.insert_single(&entry, Some(vector)).unwrap().id
    }

    /// LLM that merges every cluster into its first member
    struct MergeAllLlm;

    #[async_trait]
    impl crate::llm::LlmClient for MergeAllLlm {
        async fn run(&self, request: LlmRequest) -> crate::llm::Result<LlmOutput> {
            let members = request.prompt.lines().count();
            let absorb: Vec<usize> = (1..members).collect();
            Ok(LlmOutput::ToolCall(ToolCall {
                name: "merge_cluster".into(),
                arguments: serde_json::json!({
                    "merges": [{"keep": 0, "absorb": absorb}]
                }),
            }))
        }
    }

    #[tokio::test]
    async fn test_rule_merge_by_canonical_key() {
        let storage = Arc::new(Storage::open_in_memory(DIMS).unwrap());
        let older = seed(&storage, "pm choice", &unit([1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]), |e| {
            e.canonical_key = Some("preferred-package-manager".into());
            e.created_at = Some(Utc::now() - Duration::days(10));
        });
        let newer = seed(&storage, "pm preference", &unit([0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]), |e| {
            e.canonical_key = Some("preferred-package-manager".into());
        });

        let consolidator = Consolidator::new(storage.clone(), ConsolidateConfig::default());
        let report = consolidator.run().await.unwrap();
        assert_eq!(report.rule_merged, 1);

        let old_row = storage.get_entry(&older).unwrap().unwrap();
        assert_eq!(old_row.superseded_by.as_deref(), Some(newer.as_str()));
        let keeper = storage.get_entry(&newer).unwrap().unwrap();
        assert_eq!(keeper.confirmations, 1);
    }

    #[tokio::test]
    async fn test_rule_merge_by_subject_key_needs_high_cosine() {
        let storage = Arc::new(Storage::open_in_memory(DIMS).unwrap());
        let base = unit([1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
        // cosine ~0.995 with base
        let near = unit([1.0, 0.1, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
        // cosine ~0.85 with base: under the 0.95 rule floor
        let mid = unit([1.0, 0.62, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]);

        let a = seed(&storage, "alex weight a", &base, |e| {
            e.subject_key = Some("alex/weight".into());
            e.created_at = Some(Utc::now() - Duration::days(5));
        });
        let b = seed(&storage, "alex weight b", &near, |e| {
            e.subject_key = Some("alex/weight".into());
            e.created_at = Some(Utc::now() - Duration::days(1));
        });
        let c = seed(&storage, "alex weight c", &mid, |e| {
            e.subject_key = Some("alex/weight".into());
        });

        let consolidator = Consolidator::new(storage.clone(), ConsolidateConfig::default());
        let report = consolidator.run().await.unwrap();

        // a merged into the newest close member; c stays (cosine too low)
        assert_eq!(report.rule_merged, 1);
        assert!(storage.get_entry(&a).unwrap().unwrap().superseded_by.is_some()
            || storage.get_entry(&b).unwrap().unwrap().superseded_by.is_some());
        assert!(storage.get_entry(&c).unwrap().unwrap().is_active());
    }

    #[tokio::test]
    async fn test_no_cross_project_merges() {
        let storage = Arc::new(Storage::open_in_memory(DIMS).unwrap());
        let v = unit([1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
        seed(&storage, "same thing", &v, |e| {
            e.canonical_key = Some("the-thing".into());
            e.project = Some("alpha".into());
        });
        seed(&storage, "same thing again", &v, |e| {
            e.canonical_key = Some("the-thing".into());
            e.project = Some("beta".into());
        });

        let consolidator = Consolidator::new(storage.clone(), ConsolidateConfig::default())
            .with_llm(Arc::new(MergeAllLlm));
        let report = consolidator.run().await.unwrap();

        assert_eq!(report.rule_merged, 0);
        assert_eq!(report.cluster_merged, 0);
        assert_eq!(storage.stats().unwrap().active_entries, 2);
    }

    #[tokio::test]
    async fn test_cluster_merge_via_llm() {
        let storage = Arc::new(Storage::open_in_memory(DIMS).unwrap());
        let base = unit([1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
        // cosine ~0.85: inside phase 1, outside the rule floor
        let close = unit([1.0, 0.62, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
        let orthogonal = unit([0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0]);

        let a = seed(&storage, "build cache slow", &base, |e| {
            e.created_at = Some(Utc::now() - Duration::days(3));
        });
        let b = seed(&storage, "build cache still slow", &close, |_| {});
        let c = seed(&storage, "unrelated topic", &orthogonal, |_| {});

        let consolidator = Consolidator::new(storage.clone(), ConsolidateConfig::default())
            .with_llm(Arc::new(MergeAllLlm));
        let report = consolidator.run().await.unwrap();

        assert_eq!(report.cluster_merged, 1);
        // The seed (oldest) is kept, the close one absorbed
        assert!(storage.get_entry(&a).unwrap().unwrap().is_active());
        assert_eq!(
            storage.get_entry(&b).unwrap().unwrap().superseded_by.as_deref(),
            Some(a.as_str())
        );
        assert!(storage.get_entry(&c).unwrap().unwrap().is_active());
    }

    #[tokio::test]
    async fn test_no_llm_no_cluster_merges() {
        let storage = Arc::new(Storage::open_in_memory(DIMS).unwrap());
        let base = unit([1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
        let close = unit([1.0, 0.62, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
        seed(&storage, "one", &base, |_| {});
        seed(&storage, "two", &close, |_| {});

        let consolidator = Consolidator::new(storage.clone(), ConsolidateConfig::default());
        let report = consolidator.run().await.unwrap();
        assert!(report.clusters_found >= 1);
        assert_eq!(report.cluster_merged, 0);
    }

    #[tokio::test]
    async fn test_forgetting_reports_without_flag_and_deletes_with() {
        let storage = Arc::new(Storage::open_in_memory(DIMS).unwrap());
        let v = unit([1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
        let stale = seed(&storage, "ancient trivia", &v, |e| {
            e.importance = 2;
            e.created_at = Some(Utc::now() - Duration::days(300));
        });
        let protected = seed(
            &storage,
            "release process trivia",
            &unit([0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]),
            |e| {
                e.importance = 2;
                e.created_at = Some(Utc::now() - Duration::days(300));
            },
        );

        let forgetting = ForgettingSection {
            enabled: true,
            protect: vec!["release".into()],
            ..Default::default()
        };

        // Report-only: candidates listed, nothing deleted
        let consolidator = Consolidator::new(storage.clone(), ConsolidateConfig::default())
            .with_forgetting(forgetting.clone());
        let report = consolidator.run().await.unwrap();
        assert_eq!(report.forgetting_candidates, vec![stale.clone()]);
        assert_eq!(report.forgotten, 0);
        assert!(storage.get_entry(&stale).unwrap().is_some());

        // --forget actually deletes, protect patterns survive
        let consolidator = Consolidator::new(
            storage.clone(),
            ConsolidateConfig {
                forget: true,
                ..Default::default()
            },
        )
        .with_forgetting(forgetting);
        let report = consolidator.run().await.unwrap();
        assert_eq!(report.forgotten, 1);
        assert!(storage.get_entry(&stale).unwrap().is_none());
        assert!(storage.get_entry(&protected).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_batch_resume_across_runs() {
        let storage = Arc::new(Storage::open_in_memory(DIMS).unwrap());
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = dir.path().join("consolidation-checkpoint.json");

        // Two disjoint pairs at cosine ~0.85 (phase 1 only)
        let pairs = [
            (unit([1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]), unit([1.0, 0.62, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0])),
            (unit([0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0]), unit([0.0, 0.0, 1.0, 0.62, 0.0, 0.0, 0.0, 0.0])),
        ];
        for (i, (a, b)) in pairs.iter().enumerate() {
            seed(&storage, &format!("pair {i} seed"), a, |e| {
                e.created_at = Some(Utc::now() - Duration::days(2 + i as i64));
            });
            seed(&storage, &format!("pair {i} echo"), b, |_| {});
        }

        let make = || {
            Consolidator::new(
                storage.clone(),
                ConsolidateConfig {
                    batch: Some(1),
                    ..Default::default()
                },
            )
            .with_llm(Arc::new(MergeAllLlm))
            .with_checkpoint(checkpoint.clone())
        };

        // First run merges one cluster and parks the cursor
        let first = make().run().await.unwrap();
        assert_eq!(first.cluster_merged, 1);
        assert_eq!(storage.stats().unwrap().active_entries, 3);

        // Second run resumes and merges the remaining cluster
        let second = make().run().await.unwrap();
        assert_eq!(second.cluster_merged, 1);
        assert_eq!(storage.stats().unwrap().active_entries, 2);
    }

    #[tokio::test]
    async fn test_report_is_read_only() {
        let storage = Arc::new(Storage::open_in_memory(DIMS).unwrap());
        let base = unit([1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
        let close = unit([1.0, 0.62, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
        seed(&storage, "one", &base, |_| {});
        seed(&storage, "two", &close, |_| {});

        let consolidator = Consolidator::new(storage.clone(), ConsolidateConfig::default())
            .with_llm(Arc::new(MergeAllLlm));
        let report = consolidator.report().unwrap();

        assert_eq!(report.active_entries, 2);
        assert_eq!(report.clusters_found, 1);
        assert_eq!(storage.stats().unwrap().active_entries, 2);
    }

    #[tokio::test]
    async fn test_lock_marker_lifecycle() {
        let storage = Arc::new(Storage::open_in_memory(DIMS).unwrap());
        let dir = tempfile::tempdir().unwrap();
        let lock = dir.path().join("consolidation.lock");

        let consolidator = Consolidator::new(storage, ConsolidateConfig::default())
            .with_lock_marker(lock.clone());
        consolidator.run().await.unwrap();
        assert!(!lock.exists());
    }
}

/// Greedy single-link clustering over `(entry, vector)` pairs: entries are
/// visited in creation order (oldest first, stable); each unassigned entry
/// seeds a cluster and pulls in unassigned entries at or above the
/// threshold, up to the cap. Only clusters of size >= 2 are returned, as
/// index lists - deterministic, so the checkpoint cursor is stable.
fn cluster(
    entries: &[(StoredEntry, Vec<f32>)],
    threshold: f32,
    max_cluster: usize,
) -> Vec<Vec<usize>> {
    let mut order: Vec<usize> = (0..entries.len()).collect();
    order.sort_by(|&a, &b| {
        entries[a]
            .0
            .created_at
            .cmp(&entries[b].0.created_at)
            .then_with(|| entries[a].0.id.cmp(&entries[b].0.id))
    });

    let mut assigned = vec![false; entries.len()];
    let mut clusters = Vec::new();

    for &seed in &order {
        if assigned[seed] {
            continue;
        }
        assigned[seed] = true;
        let mut members = vec![seed];

        for &candidate in &order {
            if members.len() >= max_cluster {
                break;
            }
            if assigned[candidate] {
                continue;
            }
            let similarity = cosine_similarity(&entries[seed].1, &entries[candidate].1);
            if similarity >= threshold {
                assigned[candidate] = true;
                members.push(candidate);
            }
        }

        if members.len() >= 2 {
            clusters.push(members);
        }
    }

    clusters
}
