//! Write Queue
//!
//! A bounded, single-consumer queue serializing all writes to one database.
//! Producers push batches keyed by source file; the consumer loop feeds the
//! store pipeline in sub-batches, retrying once on failure. Exclusive jobs
//! (consolidation, maintenance) run on the same consumer with nothing else
//! in flight.
//!
//! Semantics:
//! - per-file-key FIFO (a single consumer pops in submission order)
//! - high-watermark backpressure on pending entry count (non-busy wait)
//! - `cancel(file_key)` rejects queued items for the key and awaits any
//!   in-flight batch for it
//! - `destroy()` rejects everything queued with `Shutdown` and stops the
//!   consumer

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{oneshot, Mutex, Notify};

use crate::ingest::{StoreOptions, StorePipeline, StoreResult};
use crate::memory::KnowledgeEntry;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Queue rejection reasons
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum QueueError {
    /// The item was cancelled before dispatch
    #[error("batch cancelled")]
    Cancelled,
    /// The queue is shutting down
    #[error("queue shut down")]
    Shutdown,
    /// The store pipeline failed (after the retry, when enabled)
    #[error("store failed: {0}")]
    Store(String),
}

/// Result of one pushed batch
pub type BatchWriteResult = std::result::Result<StoreResult, QueueError>;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Queue knobs
#[derive(Clone)]
pub struct QueueConfig {
    /// Sub-batch size handed to the store pipeline
    pub batch_size: usize,
    /// Pending entry count above which `push` waits
    pub high_watermark: usize,
    /// Retry a failed sub-batch once
    pub retry_on_failure: bool,
    /// Backoff before the retry
    pub retry_backoff_ms: u64,
    /// Checked between items; true forces queue drain (signal handling)
    pub shutdown_requested: Option<Arc<dyn Fn() -> bool + Send + Sync>>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            batch_size: 40,
            high_watermark: 500,
            retry_on_failure: true,
            retry_backoff_ms: 2000,
            shutdown_requested: None,
        }
    }
}

impl std::fmt::Debug for QueueConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueConfig")
            .field("batch_size", &self.batch_size)
            .field("high_watermark", &self.high_watermark)
            .field("retry_on_failure", &self.retry_on_failure)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .field("shutdown_requested", &self.shutdown_requested.is_some())
            .finish()
    }
}

// ============================================================================
// ITEMS / STATE
// ============================================================================

type ExclusiveJob = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

enum QueueItem {
    Write {
        entries: Vec<KnowledgeEntry>,
        file_key: String,
        file_hash: Option<String>,
        reply: oneshot::Sender<BatchWriteResult>,
    },
    Exclusive {
        job: ExclusiveJob,
    },
}

#[derive(Default)]
struct QueueState {
    items: VecDeque<QueueItem>,
    pending_entries: usize,
    in_flight_key: Option<String>,
    in_flight: bool,
    destroyed: bool,
}

struct Inner {
    pipeline: Arc<StorePipeline>,
    config: QueueConfig,
    state: Mutex<QueueState>,
    /// Wakes the consumer when items arrive or destroy is requested
    work: Notify,
    /// Wakes producers waiting on the watermark
    space: Notify,
    /// Wakes drain/cancel waiters when an item finishes
    idle: Notify,
}

/// Wait (without busy-looping) until `cond` holds over the queue state
async fn wait_until<F>(inner: &Inner, notify: &Notify, cond: F)
where
    F: Fn(&QueueState) -> bool,
{
    loop {
        let notified = notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if cond(&*inner.state.lock().await) {
            return;
        }
        notified.await;
    }
}

// ============================================================================
// WRITE QUEUE
// ============================================================================

/// A ticket for a pushed batch; await it for the batch outcome
pub struct BatchTicket {
    rx: oneshot::Receiver<BatchWriteResult>,
}

impl BatchTicket {
    /// Wait for the batch to complete, be cancelled, or be shut down
    pub async fn wait(self) -> BatchWriteResult {
        self.rx.await.unwrap_or(Err(QueueError::Shutdown))
    }
}

/// The single-consumer write queue
pub struct WriteQueue {
    inner: Arc<Inner>,
    consumer: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl WriteQueue {
    /// Spawn the queue and its consumer task
    pub fn new(pipeline: Arc<StorePipeline>, config: QueueConfig) -> Self {
        let inner = Arc::new(Inner {
            pipeline,
            config,
            state: Mutex::new(QueueState::default()),
            work: Notify::new(),
            space: Notify::new(),
            idle: Notify::new(),
        });

        let consumer_inner = inner.clone();
        let handle = tokio::spawn(async move {
            consumer_loop(consumer_inner).await;
        });

        Self {
            inner,
            consumer: Mutex::new(Some(handle)),
        }
    }

    /// Enqueue a batch; waits (non-busy) while the queue is above its
    /// high watermark, then returns a ticket for the batch outcome
    pub async fn push(
        &self,
        entries: Vec<KnowledgeEntry>,
        file_key: impl Into<String>,
        file_hash: Option<String>,
    ) -> Result<BatchTicket, QueueError> {
        let file_key = file_key.into();
        let batch_len = entries.len();
        let watermark = self.inner.config.high_watermark;

        // Backpressure: wait until the new batch fits (or shutdown)
        wait_until(&self.inner, &self.inner.space, |state| {
            state.destroyed || state.pending_entries + batch_len <= watermark
        })
        .await;

        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.inner.state.lock().await;
            if state.destroyed {
                return Err(QueueError::Shutdown);
            }
            state.pending_entries += batch_len;
            state.items.push_back(QueueItem::Write {
                entries,
                file_key,
                file_hash,
                reply: tx,
            });
        }
        self.inner.work.notify_waiters();

        Ok(BatchTicket { rx })
    }

    /// Run a job on the consumer with no concurrent writes before or
    /// during it; resolves with the job's output
    pub async fn run_exclusive<T, F, Fut>(&self, f: F) -> Result<T, QueueError>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.inner.state.lock().await;
            if state.destroyed {
                return Err(QueueError::Shutdown);
            }
            let job: ExclusiveJob = Box::new(move || {
                Box::pin(async move {
                    let _ = tx.send(f().await);
                })
            });
            state.items.push_back(QueueItem::Exclusive { job });
        }
        self.inner.work.notify_waiters();

        rx.await.map_err(|_| QueueError::Shutdown)
    }

    /// Drop queued (not yet dispatched) items for a file key, each
    /// completing with `Cancelled`; returns once no batch for the key is
    /// in flight
    pub async fn cancel(&self, file_key: &str) {
        {
            let mut state = self.inner.state.lock().await;
            let mut kept = VecDeque::with_capacity(state.items.len());
            let mut released = 0usize;
            for item in state.items.drain(..) {
                match item {
                    QueueItem::Write {
                        entries,
                        file_key: key,
                        reply,
                        ..
                    } if key == file_key => {
                        released += entries.len();
                        let _ = reply.send(Err(QueueError::Cancelled));
                    }
                    other => kept.push_back(other),
                }
            }
            state.items = kept;
            state.pending_entries = state.pending_entries.saturating_sub(released);
        }
        self.inner.space.notify_waiters();
        self.inner.idle.notify_waiters();

        // Await any in-flight batch for this key
        let key = file_key.to_string();
        wait_until(&self.inner, &self.inner.idle, |state| {
            state.in_flight_key.as_deref() != Some(key.as_str())
        })
        .await;
    }

    /// Completes when the queue is idle: nothing pending, nothing in flight
    pub async fn drain(&self) {
        wait_until(&self.inner, &self.inner.idle, |state| {
            state.items.is_empty() && !state.in_flight
        })
        .await;
    }

    /// Reject all queued items with `Shutdown`, wake every waiter, and
    /// stop the consumer
    pub async fn destroy(&self) {
        {
            let mut state = self.inner.state.lock().await;
            state.destroyed = true;
            reject_all(&mut state, QueueError::Shutdown);
        }
        self.inner.work.notify_waiters();
        self.inner.space.notify_waiters();
        self.inner.idle.notify_waiters();

        let handle = self.consumer.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Pending entry count (diagnostics)
    pub async fn pending_entries(&self) -> usize {
        self.inner.state.lock().await.pending_entries
    }
}

fn reject_all(state: &mut QueueState, error: QueueError) {
    for item in state.items.drain(..) {
        if let QueueItem::Write { reply, .. } = item {
            let _ = reply.send(Err(error.clone()));
        }
    }
    state.pending_entries = 0;
}

// ============================================================================
// CONSUMER
// ============================================================================

async fn consumer_loop(inner: Arc<Inner>) {
    loop {
        // Signal check between items forces queue drain
        if let Some(check) = &inner.config.shutdown_requested {
            if check() {
                let mut state = inner.state.lock().await;
                state.destroyed = true;
                reject_all(&mut state, QueueError::Shutdown);
                drop(state);
                inner.space.notify_waiters();
                inner.idle.notify_waiters();
                tracing::info!("write queue draining on shutdown signal");
                return;
            }
        }

        let item = {
            let mut state = inner.state.lock().await;
            match state.items.pop_front() {
                Some(item) => {
                    state.in_flight = true;
                    state.in_flight_key = match &item {
                        QueueItem::Write { file_key, .. } => Some(file_key.clone()),
                        QueueItem::Exclusive { .. } => None,
                    };
                    Some(item)
                }
                None if state.destroyed => return,
                None => None,
            }
        };

        let Some(item) = item else {
            wait_until(&inner, &inner.work, |state| {
                !state.items.is_empty() || state.destroyed
            })
            .await;
            continue;
        };

        let released = match item {
            QueueItem::Write {
                entries,
                file_key,
                file_hash,
                reply,
            } => {
                let count = entries.len();
                let result = process_write(&inner, entries, &file_key, file_hash).await;
                let _ = reply.send(result);
                count
            }
            QueueItem::Exclusive { job } => {
                job().await;
                0
            }
        };

        {
            let mut state = inner.state.lock().await;
            state.in_flight = false;
            state.in_flight_key = None;
            state.pending_entries = state.pending_entries.saturating_sub(released);
        }
        inner.space.notify_waiters();
        inner.idle.notify_waiters();
    }
}

/// Split a pushed batch into sub-batches, each retried at most once
async fn process_write(
    inner: &Inner,
    entries: Vec<KnowledgeEntry>,
    file_key: &str,
    file_hash: Option<String>,
) -> BatchWriteResult {
    let mut totals = StoreResult::default();
    let batch_size = inner.config.batch_size.max(1);

    let mut remaining = entries;
    while !remaining.is_empty() {
        let tail = remaining.split_off(batch_size.min(remaining.len()));
        let chunk = std::mem::replace(&mut remaining, tail);

        let options = StoreOptions {
            file_path: Some(file_key.to_string()),
            file_hash: file_hash.clone(),
            ..Default::default()
        };

        let mut outcome = inner.pipeline.store_entries(chunk.clone(), &options).await;
        if outcome.is_err() && inner.config.retry_on_failure {
            tracing::warn!(
                "sub-batch for {file_key} failed ({}); retrying once",
                outcome.as_ref().err().map(|e| e.to_string()).unwrap_or_default()
            );
            tokio::time::sleep(std::time::Duration::from_millis(
                inner.config.retry_backoff_ms,
            ))
            .await;
            outcome = inner.pipeline.store_entries(chunk, &options).await;
        }

        match outcome {
            Ok(result) => {
                totals.added += result.added;
                totals.updated += result.updated;
                totals.skipped += result.skipped;
                totals.relations_created += result.relations_created;
                totals.total_entries = result.total_entries;
                totals.duration_ms += result.duration_ms;
            }
            Err(e) => return Err(QueueError::Store(e.to_string())),
        }
    }

    Ok(totals)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::{Embedding, EmbeddingError, EmbeddingProvider};
    use crate::memory::SourceRef;
    use crate::storage::Storage;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    const DIMS: usize = 16;

    /// Embedder that can be armed to fail its next N calls; every distinct
    /// text gets its own orthogonal one-hot vector so dedup bands never
    /// fire accidentally
    struct FlakyEmbedder {
        failures_left: AtomicUsize,
        registry: std::sync::Mutex<std::collections::HashMap<String, usize>>,
    }

    impl FlakyEmbedder {
        fn reliable() -> Self {
            Self::failing(0)
        }

        fn failing(times: usize) -> Self {
            Self {
                failures_left: AtomicUsize::new(times),
                registry: std::sync::Mutex::new(std::collections::HashMap::new()),
            }
        }
    }

    #[async_trait]
    impl EmbeddingProvider for FlakyEmbedder {
        async fn embed(&self, texts: &[String]) -> crate::embedding::Result<Vec<Vec<f32>>> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(EmbeddingError::Provider("transient outage".into()));
            }
            let mut registry = self.registry.lock().unwrap();
            Ok(texts
                .iter()
                .map(|t| {
                    let next = registry.len() % DIMS;
                    let slot = *registry.entry(t.clone()).or_insert(next);
                    let mut v = vec![0.0_f32; DIMS];
                    v[slot] = 1.0;
                    let mut e = Embedding::new(v);
                    e.normalize();
                    e.vector
                })
                .collect())
        }

        fn dimensions(&self) -> usize {
            DIMS
        }
    }

    fn entry(subject: &str, source: &str) -> KnowledgeEntry {
        KnowledgeEntry {
            subject: subject.to_string(),
            content: format!("content about {subject}"),
            source: SourceRef {
                file: Some(source.to_string()),
                context: None,
            },
            ..Default::default()
        }
    }

    fn pipeline(embedder: FlakyEmbedder) -> Arc<StorePipeline> {
        let storage = Arc::new(Storage::open_in_memory(DIMS).unwrap());
        Arc::new(StorePipeline::new(storage, Arc::new(embedder)))
    }

    #[tokio::test]
    async fn test_push_and_complete() {
        let queue = WriteQueue::new(pipeline(FlakyEmbedder::reliable()), QueueConfig::default());

        let ticket = queue
            .push(
                vec![entry("one", "/tmp/a.jsonl"), entry("two", "/tmp/a.jsonl")],
                "/tmp/a.jsonl",
                None,
            )
            .await
            .unwrap();

        let result = ticket.wait().await.unwrap();
        assert_eq!(result.added, 2);
        queue.destroy().await;
    }

    #[tokio::test]
    async fn test_batch_splitting_aggregates() {
        let p = pipeline(FlakyEmbedder::reliable());
        let queue = WriteQueue::new(
            p.clone(),
            QueueConfig {
                batch_size: 2,
                ..Default::default()
            },
        );

        let entries: Vec<_> = (0..5)
            .map(|i| entry(&format!("subject {i}"), "/tmp/a.jsonl"))
            .collect();
        let result = queue
            .push(entries, "/tmp/a.jsonl", None)
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(result.added, 5);

        // Three sub-batches -> three ingest-log rows
        assert_eq!(p.storage().recent_ingest_logs(10).unwrap().len(), 3);
        queue.destroy().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_once_on_failure() {
        // One transient embedding failure: retry succeeds
        let queue = WriteQueue::new(
            pipeline(FlakyEmbedder::failing(1)),
            QueueConfig {
                retry_backoff_ms: 2000,
                ..Default::default()
            },
        );

        let ticket = queue
            .push(vec![entry("one", "/tmp/a.jsonl")], "/tmp/a.jsonl", None)
            .await
            .unwrap();
        let result = ticket.wait().await.unwrap();
        assert_eq!(result.added, 1);
        queue.destroy().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_failure_fails_batch() {
        let queue = WriteQueue::new(
            pipeline(FlakyEmbedder::failing(10)),
            QueueConfig::default(),
        );

        let ticket = queue
            .push(vec![entry("one", "/tmp/a.jsonl")], "/tmp/a.jsonl", None)
            .await
            .unwrap();
        match ticket.wait().await {
            Err(QueueError::Store(_)) => {}
            other => panic!("expected store failure, got {other:?}"),
        }
        queue.destroy().await;
    }

    #[tokio::test]
    async fn test_fifo_per_file_key() {
        let p = pipeline(FlakyEmbedder::reliable());
        let queue = WriteQueue::new(p.clone(), QueueConfig::default());

        let t1 = queue
            .push(vec![entry("first", "/tmp/a.jsonl")], "/tmp/a.jsonl", None)
            .await
            .unwrap();
        let t2 = queue
            .push(vec![entry("second", "/tmp/a.jsonl")], "/tmp/a.jsonl", None)
            .await
            .unwrap();

        let (r1, r2) = tokio::join!(t1.wait(), t2.wait());
        r1.unwrap();
        r2.unwrap();

        // Submission order is visible in the ingest log (rowid order)
        let logs = p.storage().recent_ingest_logs(10).unwrap();
        assert_eq!(logs.len(), 2);
        assert!(logs[0].id > logs[1].id);
        queue.destroy().await;
    }

    /// Park the consumer behind a spawned exclusive job; returns the
    /// release flag and the join handle
    fn park_consumer(
        queue: &Arc<WriteQueue>,
    ) -> (
        Arc<AtomicBool>,
        tokio::task::JoinHandle<Result<(), QueueError>>,
    ) {
        let release = Arc::new(AtomicBool::new(false));
        let release_clone = release.clone();
        let handle = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .run_exclusive(move || async move {
                        while !release_clone.load(Ordering::SeqCst) {
                            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                        }
                    })
                    .await
            })
        };
        (release, handle)
    }

    #[tokio::test]
    async fn test_cancel_rejects_queued_for_key() {
        let queue = Arc::new(WriteQueue::new(
            pipeline(FlakyEmbedder::reliable()),
            QueueConfig::default(),
        ));

        let (release, blocker) = park_consumer(&queue);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let doomed = queue
            .push(vec![entry("one", "/tmp/doomed.jsonl")], "/tmp/doomed.jsonl", None)
            .await
            .unwrap();
        let survivor = queue
            .push(vec![entry("two", "/tmp/other.jsonl")], "/tmp/other.jsonl", None)
            .await
            .unwrap();

        // Nothing for this key is in flight, so cancel returns promptly
        queue.cancel("/tmp/doomed.jsonl").await;
        assert_eq!(doomed.wait().await, Err(QueueError::Cancelled));

        release.store(true, Ordering::SeqCst);
        blocker.await.unwrap().unwrap();

        assert!(survivor.wait().await.is_ok());
        queue.destroy().await;
    }

    #[tokio::test]
    async fn test_drain_waits_for_idle() {
        let queue = WriteQueue::new(pipeline(FlakyEmbedder::reliable()), QueueConfig::default());

        let ticket = queue
            .push(vec![entry("one", "/tmp/a.jsonl")], "/tmp/a.jsonl", None)
            .await
            .unwrap();
        queue.drain().await;
        assert_eq!(queue.pending_entries().await, 0);
        // The batch completed before drain returned
        assert!(ticket.wait().await.is_ok());
        queue.destroy().await;
    }

    #[tokio::test]
    async fn test_destroy_rejects_queued() {
        let queue = Arc::new(WriteQueue::new(
            pipeline(FlakyEmbedder::reliable()),
            QueueConfig::default(),
        ));

        let (release, blocker) = park_consumer(&queue);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let doomed = queue
            .push(vec![entry("one", "/tmp/a.jsonl")], "/tmp/a.jsonl", None)
            .await
            .unwrap();

        release.store(true, Ordering::SeqCst);
        queue.destroy().await;
        blocker.await.unwrap().unwrap();

        assert_eq!(doomed.wait().await, Err(QueueError::Shutdown));

        // Further pushes are rejected immediately
        let rejected = queue
            .push(vec![entry("two", "/tmp/a.jsonl")], "/tmp/a.jsonl", None)
            .await;
        assert!(matches!(rejected, Err(QueueError::Shutdown)));
    }

    #[tokio::test]
    async fn test_watermark_backpressure() {
        let queue = Arc::new(WriteQueue::new(
            pipeline(FlakyEmbedder::reliable()),
            QueueConfig {
                high_watermark: 2,
                ..Default::default()
            },
        ));

        // Block the consumer so pending stays high
        let release = Arc::new(AtomicBool::new(false));
        let release_clone = release.clone();
        let blocker = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .run_exclusive(move || async move {
                        while !release_clone.load(Ordering::SeqCst) {
                            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                        }
                    })
                    .await
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let _t1 = queue
            .push(
                vec![entry("one", "/tmp/a.jsonl"), entry("two", "/tmp/a.jsonl")],
                "/tmp/a.jsonl",
                None,
            )
            .await
            .unwrap();

        // The next push exceeds the watermark and must block
        let queue_clone = queue.clone();
        let mut second = tokio::spawn(async move {
            queue_clone
                .push(vec![entry("three", "/tmp/a.jsonl")], "/tmp/a.jsonl", None)
                .await
        });

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!second.is_finished(), "push should wait above the watermark");

        // Unblock the consumer; the queue drains and the push proceeds
        release.store(true, Ordering::SeqCst);
        blocker.await.unwrap().unwrap();

        let ticket = (&mut second).await.unwrap().unwrap();
        assert!(ticket.wait().await.is_ok());
        queue.destroy().await;
    }
}
