//! # Agenr Core
//!
//! Local-first memory engine for AI agents. Ingests conversation
//! transcripts, extracts structured knowledge entries via an external LLM,
//! stores them in an embedded SQLite database with vector and full-text
//! indexes, and serves recall queries that blend semantic similarity,
//! recency, importance, and spaced-repetition reinforcement.
//!
//! - **Storage + dedup**: content-hash idempotency, canonical-key
//!   reinforcement, cosine-similarity bands, LLM conflict classification
//!   with supersession and contradiction accounting
//! - **Recall**: hybrid vector/FTS5 retrieval, multi-factor scoring with a
//!   spacing factor over recall intervals, budget-aware session-start
//!   curation, atomic recall-metadata updates
//! - **Watch/ingest**: crash-safe byte-offset transcript watching, a
//!   bounded single-consumer write queue, and a per-chunk extraction
//!   scheduler with elaborative pre-fetch
//! - **Maintenance**: offline consolidation (cluster-and-merge plus a
//!   forgetting pass), signal watermarks, session-end handoff
//!
//! The LLM and embedding providers are external collaborators behind the
//! [`LlmClient`] and [`EmbeddingProvider`] traits; transcript parsing for
//! proprietary formats is an adapter concern outside the core.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use agenr_core::{DataRoot, MemoryEngine, KnowledgeEntry, RecallQuery};
//!
//! let engine = MemoryEngine::open(DataRoot::default_location()?, embedder, Some(llm))?;
//!
//! // Store extracted knowledge
//! let entry = KnowledgeEntry {
//!     subject: "package manager".into(),
//!     content: "Prefers pnpm for all node work".into(),
//!     ..Default::default()
//! };
//! engine.store_entries(vec![entry], &Default::default()).await?;
//!
//! // Recall it later
//! let hits = engine.recall(&RecallQuery {
//!     text: Some("which package manager?".into()),
//!     ..Default::default()
//! }).await?;
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(rustdoc::missing_crate_level_docs)]

// ============================================================================
// MODULES
// ============================================================================

pub mod config;
pub mod consolidate;
pub mod dedup;
pub mod embedding;
mod engine;
pub mod extract;
pub mod ingest;
pub mod llm;
pub mod memory;
pub mod queue;
pub mod recall;
pub mod search;
pub mod signals;
pub mod storage;
pub mod subject;
pub mod transcript;
pub mod watcher;

// ============================================================================
// PUBLIC API RE-EXPORTS
// ============================================================================

// Engine facade
pub use engine::{MemoryEngine, TranscriptIngestSink, TranscriptParser};

// Entry model
pub use memory::{
    content_hash, normalize_subject, normalize_tag, EntryError, EntryType, Expiry, KnowledgeEntry,
    RelationType, Scope, SourceRef, StoredEntry, SubjectKey, DEFAULT_IMPORTANCE,
};

// Configuration
pub use config::{
    ConfigError, DataRoot, DbSection, DedupSection, EngineConfig, ForgettingSection,
    SignalSettings, DEFAULT_EMBEDDING_DIMENSIONS,
};

// Storage layer
pub use storage::{
    ConflictLogRow, ConflictResolution, EntryFilter, ExportFile, ExportedRelation, IngestLogRow,
    Relation, Result, RetirementLedger, RetirementRecord, Storage, StorageError, StorageStats,
};

// Embedding layer
pub use embedding::{cosine_similarity, Embedding, EmbeddingCache, EmbeddingError, EmbeddingProvider};

// LLM contract
pub use llm::{LlmClient, LlmError, LlmOutput, LlmRequest, ToolCall, ToolSpec};

// Dedup + conflict resolution
pub use dedup::conflict::{
    ConflictClassification, ConflictConfig, ConflictRelation, ConflictResolver, ConflictVerdict,
    PlannedAction,
};
pub use dedup::{DedupClassifier, DedupConfig, DedupDecision};

// Store pipeline
pub use ingest::{StoreOptions, StorePipeline, StoreResult};

// Recall engine
pub use recall::{
    RecallContext, RecallEngine, RecallQuery, RecallResult, ScoreBreakdown, ScoringConfig,
    SessionConfig, SessionSections,
};

// Consolidation
pub use consolidate::{ConsolidateConfig, ConsolidateReport, Consolidator};

// Write queue
pub use queue::{BatchTicket, BatchWriteResult, QueueConfig, QueueError, WriteQueue};

// Watcher
pub use watcher::{
    is_watcher_running, Heartbeat, IngestSink, PidFile, ShutdownHandle, WatchState, WatchTarget,
    Watcher, WatcherConfig, WatcherError,
};

// Extraction scheduler
pub use extract::{
    ExtractConfig, ExtractError, ExtractionScheduler, PreFetchConfig, WholeFileMode,
};

// Signals & handoff
pub use signals::{write_handoff, SignalEngine};

// Transcripts
pub use transcript::{chunk_messages, estimate_tokens, parse_jsonl, Chunk, TranscriptMessage};

// ============================================================================
// VERSION INFO
// ============================================================================

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// ============================================================================
// PRELUDE
// ============================================================================

/// Convenient imports for common usage
pub mod prelude {
    pub use crate::{
        DataRoot, EngineConfig, EntryType, Expiry, KnowledgeEntry, MemoryEngine, RecallContext,
        RecallQuery, RecallResult, Result, Scope, StoreOptions, StoreResult, Storage, StorageError,
        StoredEntry,
    };

    pub use crate::{EmbeddingProvider, LlmClient};

    pub use crate::{
        ConsolidateConfig, Consolidator, QueueConfig, ShutdownHandle, WatchTarget, Watcher,
        WriteQueue,
    };
}
