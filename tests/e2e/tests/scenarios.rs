//! Scenario suite: batch dedup, recency guards, similarity
//! bands, LLM supersession, session budgets, and recall metadata.

use std::sync::Arc;

use agenr_core::{
    DataRoot, EntryFilter, EntryType, Expiry, KnowledgeEntry, MemoryEngine, RecallContext,
    RecallQuery, StoreOptions, StorePipeline, Storage,
};
use agenr_e2e_tests::mocks::{entry, DeterministicEmbedder, ScriptedLlm, EMBED_DIMS};

fn engine(dir: &tempfile::TempDir, embedder: Arc<DeterministicEmbedder>) -> MemoryEngine {
    MemoryEngine::open_in_memory(DataRoot::at(dir.path()), embedder, None).unwrap()
}

#[tokio::test]
async fn within_batch_dedup_collapses_repeats() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(&dir, Arc::new(DeterministicEmbedder::new()));

    let batch = vec![
        entry("version 0.7.1 release", "released 0.7.1", "/tmp/s.jsonl"),
        entry("version 0.7.1 release", "0.7.1 is out", "/tmp/s.jsonl"),
    ];
    let result = engine
        .store_entries(batch, &StoreOptions::default())
        .await
        .unwrap();

    assert_eq!(result.added, 1);
    assert_eq!(result.skipped, 1);
}

#[tokio::test]
async fn recency_guard_reinforces_same_source() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(&dir, Arc::new(DeterministicEmbedder::new()));

    engine
        .store_entries(
            vec![entry("bar", "bar is x", "/tmp/s.jsonl")],
            &StoreOptions::default(),
        )
        .await
        .unwrap();

    let second = engine
        .store_entries(
            vec![entry("bar", "bar is x, in other words", "/tmp/s.jsonl")],
            &StoreOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(second.added, 0);
    assert_eq!(second.updated, 1);

    let rows = engine.storage().entries(&EntryFilter::default()).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].confirmations, 1);
}

#[tokio::test]
async fn different_source_keeps_both() {
    let dir = tempfile::tempdir().unwrap();
    let embedder = Arc::new(DeterministicEmbedder::new());
    // Keep the two wordings semantically apart so only the source differs
    let mut a = [0.0; EMBED_DIMS];
    a[0] = 1.0;
    let mut b = [0.0; EMBED_DIMS];
    b[1] = 1.0;
    embedder.pin("bar\nbar is x\n", a);
    embedder.pin("bar\nbar is x, in other words\n", b);
    let engine = engine(&dir, embedder);

    engine
        .store_entries(
            vec![entry("bar", "bar is x", "/tmp/a.jsonl")],
            &StoreOptions::default(),
        )
        .await
        .unwrap();

    let second = engine
        .store_entries(
            vec![entry("bar", "bar is x, in other words", "/tmp/b.jsonl")],
            &StoreOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(second.added, 1);
    assert_eq!(second.updated, 0);
}

#[tokio::test]
async fn similarity_bands_decide_outcomes() {
    let embedder = Arc::new(DeterministicEmbedder::new());

    // Base vector plus candidates at controlled cosines against it
    let base = {
        let mut v = [0.0; EMBED_DIMS];
        v[0] = 1.0;
        v
    };
    let at = |axis: usize, t: f32| {
        let mut v = [0.0; EMBED_DIMS];
        v[0] = 1.0;
        v[axis] = t;
        v
    };
    embedder.pin("alex weight\nalex weighs 200\n", base);
    // cosine 1/sqrt(1+t^2): 0.04 -> ~0.999, 0.36 -> ~0.941, 0.51 -> ~0.891, 0.88 -> ~0.751
    // (distinct off-axes keep the candidates apart from each other)
    embedder.pin("alex weight\nalex weighs about 200\n", at(1, 0.04));
    embedder.pin("alex weight\nalex's weight is two hundred\n", at(2, 0.36));
    embedder.pin("alex weight\nalex now weighs 180\n", at(3, 0.51));
    embedder.pin("alex weight\nloosely weight-adjacent note\n", at(4, 0.88));

    // LLM in the classify band confirms reinforcement
    let llm = Arc::new(
        ScriptedLlm::new().respond_with(
            "classify_conflict",
            serde_json::json!({"relation": "coexists", "confidence": 0.9}),
        ),
    );
    let storage = Arc::new(Storage::open_in_memory(EMBED_DIMS).unwrap());
    let pipeline = StorePipeline::new(storage.clone(), embedder).with_llm(llm);

    pipeline
        .store_entries(
            vec![entry("alex weight", "alex weighs 200", "/tmp/a.jsonl")],
            &StoreOptions::default(),
        )
        .await
        .unwrap();

    // ~0.999: near-exact duplicate skips
    let r = pipeline
        .store_entries(
            vec![entry("alex weight", "alex weighs about 200", "/tmp/b.jsonl")],
            &StoreOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!((r.added, r.updated, r.skipped), (0, 0, 1));

    // ~0.94 same subject + type: reinforce
    let r = pipeline
        .store_entries(
            vec![entry(
                "alex weight",
                "alex's weight is two hundred",
                "/tmp/c.jsonl",
            )],
            &StoreOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!((r.added, r.updated, r.skipped), (0, 1, 0));

    // ~0.89: classify band inserts and logs the coexist verdict
    let r = pipeline
        .store_entries(
            vec![entry("alex weight", "alex now weighs 180", "/tmp/d.jsonl")],
            &StoreOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!((r.added, r.updated, r.skipped), (1, 0, 0));

    // ~0.75: below every band, plain insert
    let r = pipeline
        .store_entries(
            vec![entry(
                "alex weight",
                "loosely weight-adjacent note",
                "/tmp/e.jsonl",
            )],
            &StoreOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!((r.added, r.updated, r.skipped), (1, 0, 0));
}

#[tokio::test]
async fn llm_supersession_updates_lifecycle() {
    let embedder = Arc::new(DeterministicEmbedder::new());
    let mut base = [0.0; EMBED_DIMS];
    base[0] = 1.0;
    let mut close = [0.0; EMBED_DIMS];
    close[0] = 1.0;
    close[1] = 0.51;
    embedder.pin("alex weight\nalex weighs 200\n", base);
    embedder.pin("alex weight\nalex now weighs 180\n", close);

    let llm = Arc::new(
        ScriptedLlm::new().respond_with(
            "classify_conflict",
            serde_json::json!({"relation": "supersedes", "confidence": 0.93}),
        ),
    );
    let storage = Arc::new(Storage::open_in_memory(EMBED_DIMS).unwrap());
    let pipeline = StorePipeline::new(storage.clone(), embedder).with_llm(llm);

    let mut old = entry("alex weight", "alex weighs 200", "/tmp/a.jsonl");
    old.subject_key = Some("alex/weight".into());
    pipeline
        .store_entries(vec![old], &StoreOptions::default())
        .await
        .unwrap();

    let mut new = entry("alex weight", "alex now weighs 180", "/tmp/b.jsonl");
    new.subject_key = Some("alex/weight".into());
    pipeline
        .store_entries(vec![new], &StoreOptions::default())
        .await
        .unwrap();

    let all = storage
        .entries(&EntryFilter {
            include_inactive: true,
            ..Default::default()
        })
        .unwrap();
    let old_row = all.iter().find(|e| e.content.contains("200")).unwrap();
    let new_row = all.iter().find(|e| e.content.contains("180")).unwrap();

    assert_eq!(old_row.superseded_by.as_deref(), Some(new_row.id.as_str()));

    let relations = storage.relations_of(&new_row.id).unwrap();
    assert!(relations
        .iter()
        .any(|r| r.relation_type == agenr_core::RelationType::Supersedes
            && r.target_id == old_row.id));

    // Subject index no longer lists the superseded entry
    let listed = storage.subject_lookup("alex/weight").unwrap();
    assert!(listed.contains(&new_row.id));
    assert!(!listed.contains(&old_row.id));
}

#[tokio::test]
async fn session_start_respects_budget() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(&dir, Arc::new(DeterministicEmbedder::new()));

    // A mixed corpus of 50 active entries
    let mut batch = Vec::new();
    let mut core = entry("who the user is", "a rust engineer shipping agent tools", "/tmp/seed.jsonl");
    core.expiry = Expiry::Core;
    batch.push(core);
    for i in 0..15 {
        let mut todo = entry(
            &format!("todo number {i}"),
            "finish the migration and update the runbook notes",
            "/tmp/seed.jsonl",
        );
        todo.entry_type = EntryType::Todo;
        batch.push(todo);
    }
    for i in 0..15 {
        let mut pref = entry(
            &format!("preference number {i}"),
            "always run the linter before pushing anything",
            "/tmp/seed.jsonl",
        );
        pref.entry_type = EntryType::Preference;
        batch.push(pref);
    }
    for i in 0..19 {
        batch.push(entry(
            &format!("background fact {i}"),
            "a piece of recent background context worth keeping",
            "/tmp/seed.jsonl",
        ));
    }
    let stored = engine
        .store_entries(batch, &StoreOptions::default())
        .await
        .unwrap();
    assert_eq!(stored.added, 50);

    let budget = 2000;
    let results = engine
        .recall(&RecallQuery {
            context: RecallContext::SessionStart,
            budget: Some(budget),
            no_update: true,
            ..Default::default()
        })
        .await
        .unwrap();

    // Core listed first, outside the budget
    assert_eq!(results[0].entry.expiry, Expiry::Core);

    // Budget bound over everything non-core
    let cost: usize = results
        .iter()
        .filter(|r| r.entry.expiry != Expiry::Core)
        .map(|r| agenr_core::recall::session::estimate_tokens(&r.entry, 1.3))
        .sum();
    assert!(cost <= budget, "estimated cost {cost} exceeds budget {budget}");

    // All three budgeted sections represented
    assert!(results.iter().any(|r| r.entry.entry_type == EntryType::Todo));
    assert!(results
        .iter()
        .any(|r| r.entry.entry_type == EntryType::Preference));
    assert!(results
        .iter()
        .any(|r| r.entry.entry_type == EntryType::Fact && r.entry.expiry != Expiry::Core));
}

#[tokio::test]
async fn recall_metadata_updates_atomically() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(&dir, Arc::new(DeterministicEmbedder::new()));

    let batch: Vec<KnowledgeEntry> = (0..5)
        .map(|i| {
            entry(
                &format!("fact number {i}"),
                &format!("the content of fact number {i}"),
                "/tmp/s.jsonl",
            )
        })
        .collect();
    engine
        .store_entries(batch, &StoreOptions::default())
        .await
        .unwrap();

    let results = engine
        .recall(&RecallQuery {
            context: RecallContext::Browse,
            limit: 5,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(results.len(), 5);

    for r in &results {
        let fresh = engine.storage().get_entry(&r.entry.id).unwrap().unwrap();
        assert_eq!(fresh.recall_count, 1);
        assert_eq!(fresh.recall_intervals.len(), 1);
        assert!(fresh.last_recalled_at.is_some());

        // Unix seconds: not an ISO string (type-checked) and not millis
        let stamp = fresh.recall_intervals[0];
        let now = chrono::Utc::now().timestamp();
        assert!(
            (now - stamp).abs() < 120,
            "stamp {stamp} is not seconds-scale (now {now})"
        );
    }

    // All five share one timestamp
    let stamps: Vec<_> = results
        .iter()
        .map(|r| {
            engine
                .storage()
                .get_entry(&r.entry.id)
                .unwrap()
                .unwrap()
                .last_recalled_at
                .unwrap()
        })
        .collect();
    assert!(stamps.windows(2).all(|w| w[0] == w[1]));
}
