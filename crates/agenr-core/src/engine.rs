//! Memory Engine Facade
//!
//! Wires the subsystems into the object outer surfaces (CLI, MCP server,
//! editor adapters) consume: storage + store pipeline + recall + signals,
//! with factories for the write queue, watcher, extraction scheduler, and
//! consolidator.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{DataRoot, EngineConfig};
use crate::consolidate::{ConsolidateConfig, Consolidator};
use crate::dedup::DedupConfig;
use crate::embedding::EmbeddingProvider;
use crate::extract::{ExtractConfig, ExtractionScheduler};
use crate::ingest::{StoreOptions, StorePipeline, StoreResult};
use crate::llm::LlmClient;
use crate::memory::{KnowledgeEntry, StoredEntry};
use crate::queue::{QueueConfig, WriteQueue};
use crate::recall::{RecallEngine, RecallQuery, RecallResult};
use crate::signals::{self, SignalEngine};
use crate::storage::{Result, RetirementLedger, Storage, StorageError};
use crate::transcript::{self, TranscriptMessage};
use crate::watcher::{IngestSink, ShutdownHandle, WatchTarget, Watcher, WatcherConfig};

// ============================================================================
// ENGINE
// ============================================================================

/// The assembled memory engine
pub struct MemoryEngine {
    root: DataRoot,
    config: EngineConfig,
    storage: Arc<Storage>,
    pipeline: Arc<StorePipeline>,
    recall: RecallEngine,
    signals: SignalEngine,
    embedder: Arc<dyn EmbeddingProvider>,
    llm: Option<Arc<dyn LlmClient>>,
}

impl MemoryEngine {
    /// Open the engine over a data root (config, database, and ledgers
    /// live under it)
    pub fn open(
        root: DataRoot,
        embedder: Arc<dyn EmbeddingProvider>,
        llm: Option<Arc<dyn LlmClient>>,
    ) -> Result<Self> {
        let config = EngineConfig::load(&root).map_err(|e| StorageError::Init(e.to_string()))?;
        root.ensure()?;
        let storage = Arc::new(Storage::open(
            config.db_path(&root),
            embedder.dimensions(),
        )?);
        Self::assemble(root, config, storage, embedder, llm)
    }

    /// Open over an in-memory database (tests, dry runs); the root still
    /// hosts the ledgers and state files
    pub fn open_in_memory(
        root: DataRoot,
        embedder: Arc<dyn EmbeddingProvider>,
        llm: Option<Arc<dyn LlmClient>>,
    ) -> Result<Self> {
        let config = EngineConfig::load(&root).map_err(|e| StorageError::Init(e.to_string()))?;
        root.ensure()?;
        let storage = Arc::new(Storage::open_in_memory(embedder.dimensions())?);
        Self::assemble(root, config, storage, embedder, llm)
    }

    fn assemble(
        root: DataRoot,
        config: EngineConfig,
        storage: Arc<Storage>,
        embedder: Arc<dyn EmbeddingProvider>,
        llm: Option<Arc<dyn LlmClient>>,
    ) -> Result<Self> {
        let dedup = DedupConfig {
            llm_enabled: llm.is_some(),
            ..Default::default()
        }
        .with_overrides(config.dedup.aggressive, config.dedup.threshold);

        let ledger = RetirementLedger::load(root.retirements_path())?;

        let mut pipeline = StorePipeline::new(storage.clone(), embedder.clone())
            .with_retirement_ledger(ledger);
        if let Some(llm) = &llm {
            pipeline = pipeline.with_llm(llm.clone());
        }
        let pipeline = Arc::new(pipeline.with_dedup_config(dedup));

        let recall = RecallEngine::new(storage.clone(), embedder.clone());
        let signals = SignalEngine::new(storage.clone(), config.signals.clone());

        Ok(Self {
            root,
            config,
            storage,
            pipeline,
            recall,
            signals,
            embedder,
            llm,
        })
    }

    /// The data root this engine lives under
    pub fn root(&self) -> &DataRoot {
        &self.root
    }

    /// The loaded configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The storage handle
    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// The store pipeline
    pub fn pipeline(&self) -> &Arc<StorePipeline> {
        &self.pipeline
    }

    // ========================================================================
    // CORE OPERATIONS
    // ========================================================================

    /// Store a batch of entries through the dedup pipeline
    pub async fn store_entries(
        &self,
        entries: Vec<KnowledgeEntry>,
        options: &StoreOptions,
    ) -> Result<StoreResult> {
        self.pipeline.store_entries(entries, options).await
    }

    /// Execute a recall query
    pub async fn recall(&self, query: &RecallQuery) -> Result<Vec<RecallResult>> {
        self.recall.recall(query).await
    }

    /// Retire an entry; `persist` writes the retirement ledger
    pub fn retire(&self, entry_id: &str, reason: &str, persist: bool) -> Result<StoredEntry> {
        self.pipeline.retire(entry_id, reason, persist)
    }

    /// Poll high-importance signals for a consumer
    pub fn poll_signals(&self, consumer: &str, session_id: &str) -> Result<Vec<StoredEntry>> {
        self.signals.poll(consumer, session_id)
    }

    /// Session-end handoff: persist a summary event through the pipeline
    pub async fn write_handoff(
        &self,
        session_id: &str,
        messages: &[TranscriptMessage],
    ) -> Result<StoreResult> {
        signals::write_handoff(
            &self.pipeline,
            self.llm.as_deref(),
            session_id,
            messages,
        )
        .await
    }

    // ========================================================================
    // FACTORIES
    // ========================================================================

    /// Spawn the single-consumer write queue over this engine's pipeline
    pub fn spawn_write_queue(&self, config: QueueConfig) -> Arc<WriteQueue> {
        Arc::new(WriteQueue::new(self.pipeline.clone(), config))
    }

    /// Build the extraction scheduler (pre-fetch reads this engine's
    /// corpus); requires an LLM
    pub fn extraction_scheduler(&self, config: ExtractConfig) -> Option<ExtractionScheduler> {
        let llm = self.llm.clone()?;
        Some(ExtractionScheduler::new(
            llm,
            self.storage.clone(),
            self.embedder.clone(),
            config,
        ))
    }

    /// Build the consolidator, wired to this engine's checkpoint, lock,
    /// and forgetting settings. Run it through
    /// [`WriteQueue::run_exclusive`] so nothing writes concurrently.
    pub fn consolidator(&self, config: ConsolidateConfig) -> Consolidator {
        let mut consolidator = Consolidator::new(self.storage.clone(), config)
            .with_forgetting(self.config.forgetting.clone())
            .with_checkpoint(self.root.consolidation_checkpoint_path())
            .with_lock_marker(self.root.consolidation_lock_path());
        if let Some(llm) = &self.llm {
            consolidator = consolidator.with_llm(llm.clone());
        }
        consolidator
    }

    /// Build a watcher feeding the given sink
    pub fn watcher(
        &self,
        target: WatchTarget,
        sink: Arc<dyn IngestSink>,
        shutdown: ShutdownHandle,
    ) -> Watcher {
        let config = WatcherConfig {
            wal_checkpoint_interval_ms: self.config.wal_checkpoint_interval_ms,
            ..Default::default()
        };
        Watcher::new(
            self.root.clone(),
            self.storage.clone(),
            sink,
            target,
            config,
            shutdown,
        )
    }
}

// ============================================================================
// TRANSCRIPT SINK
// ============================================================================

/// Transcript parser: bytes from a session file to ordered messages
pub type TranscriptParser =
    Arc<dyn Fn(&Path, &[u8]) -> Vec<TranscriptMessage> + Send + Sync>;

/// The production ingest sink: parse appended bytes, extract entries, and
/// push them through the write queue
pub struct TranscriptIngestSink {
    parser: TranscriptParser,
    scheduler: ExtractionScheduler,
    queue: Arc<WriteQueue>,
}

impl TranscriptIngestSink {
    /// Sink with the default lenient JSONL parser
    pub fn new(scheduler: ExtractionScheduler, queue: Arc<WriteQueue>) -> Self {
        Self {
            parser: Arc::new(|source, data| transcript::parse_jsonl(source, data)),
            scheduler,
            queue,
        }
    }

    /// Sink with a platform-specific parser
    pub fn with_parser(
        parser: TranscriptParser,
        scheduler: ExtractionScheduler,
        queue: Arc<WriteQueue>,
    ) -> Self {
        Self {
            parser,
            scheduler,
            queue,
        }
    }
}

#[async_trait]
impl IngestSink for TranscriptIngestSink {
    async fn ingest(&self, source: &Path, data: &[u8]) -> std::result::Result<u64, String> {
        let messages = (self.parser)(source, data);
        if messages.is_empty() {
            return Ok(0);
        }

        let entries = self
            .scheduler
            .extract(messages)
            .await
            .map_err(|e| e.to_string())?;
        if entries.is_empty() {
            return Ok(0);
        }

        let ticket = self
            .queue
            .push(entries, source.to_string_lossy().into_owned(), None)
            .await
            .map_err(|e| e.to_string())?;
        let result = ticket.wait().await.map_err(|e| e.to_string())?;
        Ok((result.added + result.updated) as u64)
    }
}

// ============================================================================
// TESTS
// ============================================================================
