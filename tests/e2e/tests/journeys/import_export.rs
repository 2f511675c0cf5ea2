//! Journey: export the corpus as JSON, wipe, import, and verify the
//! round-trip law - tag sets, relations, and counters survive; embeddings
//! are recomputed afterwards.

use std::collections::BTreeSet;
use std::sync::Arc;

use agenr_core::{
    EmbeddingProvider, EntryFilter, RelationType, Storage, StoreOptions, StorePipeline,
};
use agenr_e2e_tests::mocks::{entry, DeterministicEmbedder, EMBED_DIMS};

#[tokio::test]
async fn export_wipe_import_roundtrip() {
    let storage = Arc::new(Storage::open_in_memory(EMBED_DIMS).unwrap());
    let embedder = Arc::new(DeterministicEmbedder::new());
    let pipeline = StorePipeline::new(storage.clone(), embedder.clone());

    // Seed a corpus with tags, relations, and recall history
    let mut batch = Vec::new();
    for i in 0..4 {
        let mut e = entry(
            &format!("seed subject {i}"),
            &format!("seed content number {i}"),
            "/tmp/seed.jsonl",
        );
        e.tags = vec![format!("tag-{i}"), "shared".to_string()];
        batch.push(e);
    }
    pipeline
        .store_entries(batch, &StoreOptions::default())
        .await
        .unwrap();

    let rows = storage.entries(&EntryFilter::default()).unwrap();
    storage
        .add_relation(&rows[0].id, &rows[1].id, RelationType::Elaborates)
        .unwrap();
    storage
        .add_relation(&rows[2].id, &rows[3].id, RelationType::Related)
        .unwrap();
    storage
        .update_recall_metadata(&[rows[0].id.clone(), rows[1].id.clone()])
        .unwrap();

    let before = storage
        .entries(&EntryFilter {
            include_inactive: true,
            ..Default::default()
        })
        .unwrap();

    // --- Export, wipe into a fresh database, import ---
    let export = storage.export().unwrap();
    let json = serde_json::to_string(&export).unwrap();

    let fresh = Storage::open_in_memory(EMBED_DIMS).unwrap();
    let parsed = serde_json::from_str(&json).unwrap();
    assert_eq!(fresh.import(&parsed).unwrap(), 4);

    // --- Entry sets equal modulo embeddings ---
    let after = fresh
        .entries(&EntryFilter {
            include_inactive: true,
            ..Default::default()
        })
        .unwrap();
    assert_eq!(before.len(), after.len());

    for original in &before {
        let restored = after.iter().find(|e| e.id == original.id).unwrap();
        assert_eq!(restored.subject, original.subject);
        assert_eq!(restored.content, original.content);
        assert_eq!(restored.content_hash, original.content_hash);
        assert_eq!(restored.tags, original.tags);
        assert_eq!(restored.recall_count, original.recall_count);
        assert_eq!(restored.recall_intervals, original.recall_intervals);
        assert_eq!(restored.confirmations, original.confirmations);
        assert_eq!(restored.contradictions, original.contradictions);
        assert!(!restored.has_embedding);
    }

    // Relations preserved
    let relations: BTreeSet<(String, String, RelationType)> = after
        .iter()
        .flat_map(|e| fresh.relations_of(&e.id).unwrap())
        .map(|r| (r.source_id, r.target_id, r.relation_type))
        .collect();
    assert_eq!(relations.len(), 2);

    // --- Embedding recomputation backfills the vector index ---
    let missing = fresh.entries_missing_embedding().unwrap();
    assert_eq!(missing.len(), 4);
    for id in missing {
        let row = fresh.get_entry(&id).unwrap().unwrap();
        let vectors = embedder.embed(&[row.embed_text()]).await.unwrap();
        fresh.set_embedding(&id, &vectors[0]).unwrap();
    }
    assert!(fresh.entries_missing_embedding().unwrap().is_empty());

    // Hash uniqueness still holds after the round trip
    let hashes: BTreeSet<&str> = after.iter().map(|e| e.content_hash.as_str()).collect();
    assert_eq!(hashes.len(), after.len());
}
