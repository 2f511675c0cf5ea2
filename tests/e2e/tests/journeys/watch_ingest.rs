//! Journey: watcher reads an appended transcript, the extraction scheduler
//! turns it into entries, and the write queue lands them in storage.

use std::sync::Arc;
use std::time::Duration;

use agenr_core::{
    DataRoot, EntryFilter, ExtractConfig, MemoryEngine, QueueConfig, ShutdownHandle,
    TranscriptIngestSink, WatchState, WatchTarget,
};
use agenr_e2e_tests::mocks::{DeterministicEmbedder, ScriptedLlm};

#[tokio::test]
async fn watch_extract_store() {
    let dir = tempfile::tempdir().unwrap();
    let root = DataRoot::at(dir.path());
    root.ensure().unwrap();

    let transcript = dir.path().join("session.jsonl");
    std::fs::write(
        &transcript,
        concat!(
            r#"{"role": "user", "content": "lets use pnpm from now on"}"#,
            "\n",
            r#"{"role": "assistant", "content": "noted, pnpm it is"}"#,
            "\n",
        ),
    )
    .unwrap();

    let llm = Arc::new(
        ScriptedLlm::new().respond_with(
            "save_memories",
            serde_json::json!({
                "entries": [{
                    "type": "preference",
                    "subject": "package manager",
                    "content": "use pnpm for all node work",
                    "importance": 8
                }]
            }),
        ),
    );

    let engine = Arc::new(
        MemoryEngine::open_in_memory(
            root.clone(),
            Arc::new(DeterministicEmbedder::new()),
            Some(llm),
        )
        .unwrap(),
    );

    let queue = engine.spawn_write_queue(QueueConfig::default());
    let scheduler = engine
        .extraction_scheduler(ExtractConfig::default())
        .expect("engine has an llm");
    let sink = Arc::new(TranscriptIngestSink::new(scheduler, queue.clone()));

    let shutdown = ShutdownHandle::new();
    let mut watcher = engine.watcher(WatchTarget::File(transcript.clone()), sink, shutdown.clone());

    let handle = tokio::spawn(async move { watcher.run().await });

    // Wait for the extracted entry to land
    let mut stored = Vec::new();
    for _ in 0..500 {
        stored = engine.storage().entries(&EntryFilter::default()).unwrap();
        if !stored.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    shutdown.request();
    handle.await.unwrap().unwrap();
    queue.destroy().await;

    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].subject, "package manager");
    assert_eq!(
        stored[0].source_file.as_deref(),
        Some(transcript.to_string_lossy().as_ref())
    );

    // Byte accounting: the offset equals the transcript length
    let state = WatchState::load(&root.watch_state_path());
    let progress = state.progress(&transcript).unwrap();
    assert_eq!(
        progress.byte_offset,
        std::fs::metadata(&transcript).unwrap().len()
    );
    assert_eq!(progress.entries_stored, 1);

    // Single-writer lock released; ingest log written by the queue path
    assert!(!root.watcher_pid_path().exists());
    let logs = engine.storage().recent_ingest_logs(5).unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].added, 1);
}
