//! Journey: store a working set, recall it, consolidate the corpus.

use std::sync::Arc;

use agenr_core::{
    ConsolidateConfig, DataRoot, EntryFilter, EntryType, MemoryEngine, QueueConfig, RecallQuery,
    StoreOptions,
};
use agenr_e2e_tests::mocks::{entry, DeterministicEmbedder, ScriptedLlm, EMBED_DIMS};

#[tokio::test]
async fn full_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let embedder = Arc::new(DeterministicEmbedder::new());
    let llm = Arc::new(
        ScriptedLlm::new()
            .respond_with(
                "classify_conflict",
                serde_json::json!({"relation": "coexists", "confidence": 0.9}),
            )
            .respond_with("merge_cluster", serde_json::json!({"merges": []})),
    );

    let engine = MemoryEngine::open_in_memory(
        DataRoot::at(dir.path()),
        embedder.clone(),
        Some(llm),
    )
    .unwrap();

    // The ci entry and the later recall query share one pinned vector
    let ci_vector = {
        let mut v = [0.0; EMBED_DIMS];
        v[60] = 1.0;
        v
    };
    embedder.pin("ci provider\n", ci_vector);
    embedder.pin("ci runs on the self-hosted runner pool", ci_vector);

    // --- Ingest a working set ---
    let mut batch = vec![
        entry(
            "build system",
            "the project builds with cargo workspaces",
            "/tmp/day1.jsonl",
        ),
        entry(
            "ci provider",
            "ci runs on the self-hosted runner pool",
            "/tmp/day1.jsonl",
        ),
    ];
    let mut todo = entry(
        "migrate ci runner",
        "move ci off the deprecated runner image",
        "/tmp/day1.jsonl",
    );
    todo.entry_type = EntryType::Todo;
    todo.canonical_key = Some("ci-runner-migration".into());
    todo.importance = 8;
    batch.push(todo);

    let result = engine
        .store_entries(batch, &StoreOptions::default())
        .await
        .unwrap();
    assert_eq!(result.added, 3);

    // --- Recall by topic ---
    let hits = engine
        .recall(&RecallQuery {
            text: Some("ci runs on the self-hosted runner pool".into()),
            limit: 3,
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(!hits.is_empty());

    // Recall bumped metadata
    let recalled = engine.storage().get_entry(&hits[0].entry.id).unwrap().unwrap();
    assert_eq!(recalled.recall_count, 1);

    // --- A completion event closes the todo via its canonical key ---
    let mut done = entry(
        "ci migration finished",
        "the runner migration is done and merged",
        "/tmp/day2.jsonl",
    );
    done.entry_type = EntryType::Event;
    done.canonical_key = Some("ci-runner-migration".into());
    let result = engine
        .store_entries(vec![done], &StoreOptions::default())
        .await
        .unwrap();
    assert_eq!(result.added, 1);

    let all = engine
        .storage()
        .entries(&EntryFilter {
            include_inactive: true,
            ..Default::default()
        })
        .unwrap();
    let todo_row = all
        .iter()
        .find(|e| e.entry_type == EntryType::Todo)
        .unwrap();
    assert!(todo_row.superseded_by.is_some());

    // --- Consolidate through the exclusive write-queue slot ---
    let queue = engine.spawn_write_queue(QueueConfig::default());
    let consolidator = Arc::new(engine.consolidator(ConsolidateConfig::default()));
    let report = queue
        .run_exclusive({
            let consolidator = consolidator.clone();
            move || async move { consolidator.run().await }
        })
        .await
        .unwrap()
        .unwrap();

    assert_eq!(report.total_entries, 4);
    // Nothing mergeable is left; the corpus stays intact
    assert_eq!(report.forgotten, 0);
    queue.destroy().await;
}
