//! Extraction Scheduler
//!
//! Turns transcript chunks into candidate knowledge entries via the LLM:
//!
//! - **Whole-file mode**: when the estimated token footprint fits the
//!   model's usable window (context minus output and system budgets), the
//!   whole file becomes a single chunk. `Force` insists (and errors when
//!   it cannot fit); `Never` always chunks.
//! - **Chunked mode**: per-chunk extraction with a concurrency cap,
//!   exponential rate-limit backoff, and a per-chunk timeout.
//! - **Elaborative pre-fetch**: before each chunk, related active entries
//!   are vector-searched and injected into the prompt as reference-only
//!   context. Best effort with a hard timeout; any failure degrades to an
//!   empty reference block. The references never feed back into dedup
//!   thresholds.
//! - **Post-extraction dedup** (optional): one LLM pass merges near-variant
//!   entries across the file before handoff to the write queue.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;

use crate::embedding::EmbeddingProvider;
use crate::llm::{LlmClient, LlmError, LlmOutput, LlmRequest, ToolSpec};
use crate::memory::KnowledgeEntry;
use crate::storage::Storage;
use crate::transcript::{chunk_messages, estimate_message_tokens, Chunk, TranscriptMessage};

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Extraction errors (chunk-level failures degrade; these are fatal to
/// the file)
#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    /// Whole-file mode was forced on an empty message list
    #[error("cannot extract from an empty transcript")]
    Empty,
    /// Whole-file mode was forced but the estimate exceeds the window
    #[error("transcript estimate ({estimated} tokens) exceeds the usable window ({usable} tokens)")]
    TooLarge {
        /// Estimated transcript tokens
        estimated: usize,
        /// Usable window after budgets
        usable: usize,
    },
    /// Storage failure while preparing extraction
    #[error(transparent)]
    Storage(#[from] crate::storage::StorageError),
}

/// Extraction result type
pub type Result<T> = std::result::Result<T, ExtractError>;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Whole-file mode selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WholeFileMode {
    /// Whole-file when it fits, chunked otherwise
    #[default]
    Auto,
    /// Whole-file or error
    Force,
    /// Always chunk
    Never,
}

/// Pre-fetch knobs
#[derive(Debug, Clone)]
pub struct PreFetchConfig {
    /// Master switch (`--no-pre-fetch`)
    pub enabled: bool,
    /// Similarity floor for related entries
    pub threshold: f32,
    /// ANN candidates fetched
    pub candidate_limit: usize,
    /// References injected into the prompt
    pub max_injected: usize,
    /// Databases below this active-entry count skip pre-fetch
    pub min_corpus: i64,
    /// Hard cap on the whole pre-fetch step
    pub timeout_secs: u64,
}

impl Default for PreFetchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 0.72,
            candidate_limit: 15,
            max_injected: 5,
            min_corpus: 20,
            timeout_secs: 5,
        }
    }
}

/// Scheduler knobs
#[derive(Debug, Clone)]
pub struct ExtractConfig {
    /// Parallel chunk extractions
    pub concurrency: usize,
    /// Model context window (tokens)
    pub context_window_tokens: usize,
    /// Reserved for model output
    pub output_budget_tokens: usize,
    /// Reserved for the system prompt
    pub system_prompt_budget_tokens: usize,
    /// Chunk size in chunked mode
    pub chunk_max_tokens: usize,
    /// Whole-file mode
    pub whole_file: WholeFileMode,
    /// Warn when a file yields more entries than this
    pub entry_warn_threshold: usize,
    /// Per-chunk LLM timeout
    pub chunk_timeout_secs: u64,
    /// Rate-limit retries per chunk (exponential backoff)
    pub max_rate_limit_retries: u32,
    /// Base backoff for rate limits
    pub backoff_base_ms: u64,
    /// Pre-fetch knobs
    pub pre_fetch: PreFetchConfig,
    /// Run the post-extraction LLM dedup pass
    pub llm_dedup_pass: bool,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            context_window_tokens: 200_000,
            output_budget_tokens: 16_384,
            system_prompt_budget_tokens: 4_000,
            chunk_max_tokens: 12_000,
            whole_file: WholeFileMode::Auto,
            entry_warn_threshold: 500,
            chunk_timeout_secs: 120,
            max_rate_limit_retries: 5,
            backoff_base_ms: 1_000,
            pre_fetch: PreFetchConfig::default(),
            llm_dedup_pass: false,
        }
    }
}

impl ExtractConfig {
    /// Tokens available for transcript text
    pub fn usable_window(&self) -> usize {
        self.context_window_tokens
            .saturating_sub(self.output_budget_tokens)
            .saturating_sub(self.system_prompt_budget_tokens)
    }
}

// ============================================================================
// PROMPTS / TOOLS
// ============================================================================

const EXTRACTOR_SYSTEM_PROMPT: &str = "You distill conversation transcripts into durable \
knowledge entries for an agent memory. Extract only things worth remembering across sessions: \
stable facts, decisions with their reasons, user preferences, open todos, hard-won lessons, and \
notable events. Answer only with the save_memories tool. Reference entries shown under \
REFERENCE are context for grounding; never re-extract them.";

fn save_memories_tool() -> ToolSpec {
    ToolSpec {
        name: "save_memories".to_string(),
        schema: serde_json::json!({
            "type": "object",
            "properties": {
                "entries": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "type": {"type": "string", "enum": ["fact", "decision", "preference", "todo", "lesson", "event"]},
                            "subject": {"type": "string"},
                            "content": {"type": "string"},
                            "canonical_key": {"type": "string"},
                            "subject_key": {"type": "string"},
                            "importance": {"type": "integer", "minimum": 1, "maximum": 10},
                            "expiry": {"type": "string", "enum": ["core", "permanent", "temporary", "session-only"]},
                            "tags": {"type": "array", "items": {"type": "string"}}
                        },
                        "required": ["type", "subject", "content"]
                    }
                }
            },
            "required": ["entries"]
        }),
    }
}

fn dedup_tool() -> ToolSpec {
    ToolSpec {
        name: "merge_duplicates".to_string(),
        schema: serde_json::json!({
            "type": "object",
            "properties": {
                "keep": {
                    "type": "array",
                    "items": {"type": "integer"},
                    "description": "Indices of entries to keep, near-variants dropped"
                }
            },
            "required": ["keep"]
        }),
    }
}

// ============================================================================
// SCHEDULER
// ============================================================================

/// Per-chunk extraction scheduler
pub struct ExtractionScheduler {
    llm: Arc<dyn LlmClient>,
    storage: Arc<Storage>,
    embedder: Arc<dyn EmbeddingProvider>,
    config: ExtractConfig,
}

impl ExtractionScheduler {
    /// Scheduler over an LLM client and the live corpus (for pre-fetch)
    pub fn new(
        llm: Arc<dyn LlmClient>,
        storage: Arc<Storage>,
        embedder: Arc<dyn EmbeddingProvider>,
        config: ExtractConfig,
    ) -> Self {
        Self {
            llm,
            storage,
            embedder,
            config,
        }
    }

    /// Extract candidate entries from a message sequence
    pub async fn extract(&self, messages: Vec<TranscriptMessage>) -> Result<Vec<KnowledgeEntry>> {
        let chunks = self.plan_chunks(messages)?;
        if chunks.is_empty() {
            return Ok(Vec::new());
        }

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut handles = Vec::with_capacity(chunks.len());

        for chunk in chunks {
            let semaphore = semaphore.clone();
            let llm = self.llm.clone();
            let storage = self.storage.clone();
            let embedder = self.embedder.clone();
            let config = self.config.clone();

            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire().await.expect("semaphore never closed");
                extract_chunk(&*llm, &storage, &*embedder, &config, &chunk).await
            }));
        }

        let mut entries = Vec::new();
        for handle in handles {
            match handle.await {
                Ok(chunk_entries) => entries.extend(chunk_entries),
                Err(e) => tracing::warn!("extraction task panicked: {e}"),
            }
        }

        if entries.len() > self.config.entry_warn_threshold {
            tracing::warn!(
                "extraction produced {} entries (threshold {}); consider tightening the extractor",
                entries.len(),
                self.config.entry_warn_threshold
            );
        }

        if self.config.llm_dedup_pass && entries.len() > 1 {
            entries = self.dedup_pass(entries).await;
        }

        Ok(entries)
    }

    /// Whole-file vs chunked planning
    fn plan_chunks(&self, messages: Vec<TranscriptMessage>) -> Result<Vec<Chunk>> {
        if messages.is_empty() {
            return match self.config.whole_file {
                WholeFileMode::Force => Err(ExtractError::Empty),
                _ => Ok(Vec::new()),
            };
        }

        let estimated = estimate_message_tokens(&messages);
        let usable = self.config.usable_window();

        match self.config.whole_file {
            WholeFileMode::Force => {
                if estimated > usable {
                    return Err(ExtractError::TooLarge { estimated, usable });
                }
                Ok(vec![Chunk { index: 0, messages }])
            }
            WholeFileMode::Auto if estimated <= usable => Ok(vec![Chunk { index: 0, messages }]),
            _ => Ok(chunk_messages(messages, self.config.chunk_max_tokens)),
        }
    }

    /// One merge pass over a file's extracted entries; any failure keeps
    /// the originals
    async fn dedup_pass(&self, entries: Vec<KnowledgeEntry>) -> Vec<KnowledgeEntry> {
        let listing = entries
            .iter()
            .enumerate()
            .map(|(i, e)| format!("{i}: [{}] {} - {}", e.entry_type, e.subject, e.content))
            .collect::<Vec<_>>()
            .join("\n");

        let request = LlmRequest {
            system: Some(
                "You deduplicate freshly extracted memory entries. Identify near-variants that \
                 say the same thing and answer with the merge_duplicates tool, keeping the best \
                 phrasing of each."
                    .to_string(),
            ),
            prompt: listing,
            tool: Some(dedup_tool()),
            timeout_secs: Some(self.config.chunk_timeout_secs),
        };

        match self.llm.run(request).await {
            Ok(output) => {
                let Some(call) = output.tool_call() else {
                    return entries;
                };
                let Some(keep) = call.arguments.get("keep").and_then(|v| v.as_array()) else {
                    return entries;
                };
                let keep: Vec<usize> = keep
                    .iter()
                    .filter_map(|v| v.as_u64().map(|n| n as usize))
                    .filter(|&i| i < entries.len())
                    .collect();
                if keep.is_empty() {
                    return entries;
                }
                let dropped = entries.len() - keep.len();
                if dropped > 0 {
                    tracing::info!("post-extraction dedup dropped {dropped} near-variants");
                }
                entries
                    .into_iter()
                    .enumerate()
                    .filter(|(i, _)| keep.contains(i))
                    .map(|(_, e)| e)
                    .collect()
            }
            Err(e) => {
                tracing::warn!("post-extraction dedup unavailable ({e}); keeping all entries");
                entries
            }
        }
    }
}

/// Extract one chunk: pre-fetch, prompt, backoff, parse. Chunk failures
/// degrade to an empty entry list after retries.
async fn extract_chunk(
    llm: &dyn LlmClient,
    storage: &Arc<Storage>,
    embedder: &dyn EmbeddingProvider,
    config: &ExtractConfig,
    chunk: &Chunk,
) -> Vec<KnowledgeEntry> {
    let transcript_text = chunk.render();

    let references = if config.pre_fetch.enabled {
        pre_fetch_references(storage, embedder, config, &transcript_text).await
    } else {
        Vec::new()
    };

    let mut prompt = String::new();
    if !references.is_empty() {
        prompt.push_str("REFERENCE (known related memories, do not re-extract):\n");
        for reference in &references {
            prompt.push_str(reference);
            prompt.push('\n');
        }
        prompt.push('\n');
    }
    prompt.push_str("TRANSCRIPT:\n");
    prompt.push_str(&transcript_text);

    let request = LlmRequest {
        system: Some(EXTRACTOR_SYSTEM_PROMPT.to_string()),
        prompt,
        tool: Some(save_memories_tool()),
        timeout_secs: Some(config.chunk_timeout_secs),
    };

    let mut attempt = 0u32;
    loop {
        let call = tokio::time::timeout(
            Duration::from_secs(config.chunk_timeout_secs),
            llm.run(request.clone()),
        )
        .await;

        match call {
            Ok(Ok(output)) => {
                return parse_extracted(&output, chunk);
            }
            Ok(Err(LlmError::RateLimited { retry_after_secs }))
                if attempt < config.max_rate_limit_retries =>
            {
                let backoff = retry_after_secs
                    .map(|s| s * 1000)
                    .unwrap_or(config.backoff_base_ms << attempt);
                tracing::warn!(
                    "chunk {} rate limited; backing off {}ms (attempt {})",
                    chunk.index,
                    backoff,
                    attempt + 1
                );
                tokio::time::sleep(Duration::from_millis(backoff)).await;
                attempt += 1;
            }
            Ok(Err(e)) => {
                tracing::warn!("chunk {} extraction failed: {e}", chunk.index);
                return Vec::new();
            }
            Err(_) => {
                tracing::warn!(
                    "chunk {} extraction timed out after {}s",
                    chunk.index,
                    config.chunk_timeout_secs
                );
                return Vec::new();
            }
        }
    }
}

/// Best-effort related-memory lookup with a hard timeout; errors degrade
/// to no references
async fn pre_fetch_references(
    storage: &Arc<Storage>,
    embedder: &dyn EmbeddingProvider,
    config: &ExtractConfig,
    transcript_text: &str,
) -> Vec<String> {
    let prefetch = &config.pre_fetch;

    let attempt = async {
        let active = storage.stats().ok()?.active_entries;
        if active < prefetch.min_corpus {
            return None;
        }

        let vectors = embedder
            .embed(&[transcript_text.to_string()])
            .await
            .ok()?;
        let vector = vectors.first()?;

        let hits = storage
            .vector_search(vector, prefetch.candidate_limit)
            .ok()?;
        let mut references = Vec::new();
        for (id, similarity) in hits {
            if similarity < prefetch.threshold || references.len() >= prefetch.max_injected {
                break;
            }
            if let Ok(Some(entry)) = storage.get_entry(&id) {
                references.push(format!(
                    "- [{}] {}: {}",
                    entry.entry_type, entry.subject, entry.content
                ));
            }
        }
        Some(references)
    };

    match tokio::time::timeout(Duration::from_secs(prefetch.timeout_secs), attempt).await {
        Ok(Some(references)) => references,
        Ok(None) => Vec::new(),
        Err(_) => {
            tracing::debug!("pre-fetch timed out; extracting without references");
            Vec::new()
        }
    }
}

/// Parse the save_memories tool call; malformed elements are skipped
fn parse_extracted(output: &LlmOutput, chunk: &Chunk) -> Vec<KnowledgeEntry> {
    let Some(call) = output.tool_call() else {
        tracing::warn!("chunk {} extractor returned text instead of a tool call", chunk.index);
        return Vec::new();
    };
    let Some(raw_entries) = call.arguments.get("entries").and_then(|v| v.as_array()) else {
        tracing::warn!("chunk {} save_memories call had no entries array", chunk.index);
        return Vec::new();
    };

    let source_file = chunk
        .messages
        .first()
        .and_then(|m| m.source_file.clone());

    raw_entries
        .iter()
        .filter_map(|raw| match serde_json::from_value::<KnowledgeEntry>(raw.clone()) {
            Ok(mut entry) => {
                if entry.source.file.is_none() {
                    entry.source.file = source_file.clone();
                }
                if entry.validate().is_ok() {
                    Some(entry)
                } else {
                    tracing::warn!("dropping invalid extracted entry for {:?}", entry.subject);
                    None
                }
            }
            Err(e) => {
                tracing::warn!("dropping unparseable extracted entry: {e}");
                None
            }
        })
        .collect()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::Embedding;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    const DIMS: usize = 8;

    struct UnitEmbedder;

    #[async_trait]
    impl EmbeddingProvider for UnitEmbedder {
        async fn embed(&self, texts: &[String]) -> crate::embedding::Result<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .map(|t| {
                    let mut v = vec![0.0_f32; DIMS];
                    v[(t.len()) % DIMS] = 1.0;
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

    /// LLM returning a fixed save_memories payload, optionally rate
    /// limiting its first calls; records prompts for inspection
    struct ScriptedExtractor {
        rate_limits_left: AtomicUsize,
        calls: AtomicUsize,
        prompts: Mutex<Vec<String>>,
    }

    impl ScriptedExtractor {
        fn new(rate_limits: usize) -> Self {
            Self {
                rate_limits_left: AtomicUsize::new(rate_limits),
                calls: AtomicUsize::new(0),
                prompts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedExtractor {
        async fn run(&self, request: LlmRequest) -> crate::llm::Result<LlmOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.prompts.lock().unwrap().push(request.prompt.clone());
            if self
                .rate_limits_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(LlmError::RateLimited {
                    retry_after_secs: None,
                });
            }
            Ok(LlmOutput::ToolCall(crate::llm::ToolCall {
                name: "save_memories".into(),
                arguments: serde_json::json!({
                    "entries": [
                        {
                            "type": "preference",
                            "subject": "package manager",
                            "content": "prefers pnpm for node work",
                            "importance": 8
                        },
                        {"type": "bogus-type", "subject": "x", "content": "y"}
                    ]
                }),
            }))
        }
    }

    fn messages(count: usize, words_each: usize) -> Vec<TranscriptMessage> {
        (0..count)
            .map(|i| TranscriptMessage {
                index: i,
                role: "user".to_string(),
                content: vec!["word"; words_each].join(" "),
                timestamp: None,
                source_file: Some("/tmp/session.jsonl".to_string()),
            })
            .collect()
    }

    fn scheduler(llm: Arc<ScriptedExtractor>, config: ExtractConfig) -> ExtractionScheduler {
        let storage = Arc::new(Storage::open_in_memory(DIMS).unwrap());
        ExtractionScheduler::new(llm, storage, Arc::new(UnitEmbedder), config)
    }

    #[tokio::test]
    async fn test_whole_file_single_call() {
        let llm = Arc::new(ScriptedExtractor::new(0));
        let s = scheduler(llm.clone(), ExtractConfig::default());

        let entries = s.extract(messages(10, 5)).await.unwrap();
        // One chunk, one call; malformed element dropped
        assert_eq!(llm.calls.load(Ordering::SeqCst), 1);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].subject, "package manager");
        // Source file propagated from the chunk
        assert_eq!(entries[0].source.file.as_deref(), Some("/tmp/session.jsonl"));
    }

    #[tokio::test]
    async fn test_never_mode_chunks() {
        let llm = Arc::new(ScriptedExtractor::new(0));
        let config = ExtractConfig {
            whole_file: WholeFileMode::Never,
            chunk_max_tokens: 30,
            ..Default::default()
        };
        let s = scheduler(llm.clone(), config);

        s.extract(messages(10, 20)).await.unwrap();
        assert!(llm.calls.load(Ordering::SeqCst) > 1);
    }

    #[tokio::test]
    async fn test_force_mode_errors() {
        let llm = Arc::new(ScriptedExtractor::new(0));

        // Empty transcript
        let s = scheduler(
            llm.clone(),
            ExtractConfig {
                whole_file: WholeFileMode::Force,
                ..Default::default()
            },
        );
        assert!(matches!(s.extract(vec![]).await, Err(ExtractError::Empty)));

        // Estimate exceeds the usable window
        let s = scheduler(
            llm,
            ExtractConfig {
                whole_file: WholeFileMode::Force,
                context_window_tokens: 21_000,
                ..Default::default()
            },
        );
        // usable = 21000 - 16384 - 4000 = 616 tokens
        match s.extract(messages(100, 50)).await {
            Err(ExtractError::TooLarge { usable, .. }) => assert_eq!(usable, 616),
            other => panic!("expected TooLarge, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_backoff_retries() {
        let llm = Arc::new(ScriptedExtractor::new(2));
        let s = scheduler(llm.clone(), ExtractConfig::default());

        let entries = s.extract(messages(3, 5)).await.unwrap();
        assert_eq!(entries.len(), 1);
        // Two rate-limited calls plus the success
        assert_eq!(llm.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_prefetch_skipped_below_corpus_floor() {
        let llm = Arc::new(ScriptedExtractor::new(0));
        let s = scheduler(llm.clone(), ExtractConfig::default());

        // Fresh database: corpus under the 20-entry floor, no REFERENCE
        s.extract(messages(3, 5)).await.unwrap();
        let prompts = llm.prompts.lock().unwrap();
        assert!(!prompts[0].contains("REFERENCE"));
    }

    #[tokio::test]
    async fn test_prefetch_injects_references() {
        let llm = Arc::new(ScriptedExtractor::new(0));
        let storage = Arc::new(Storage::open_in_memory(DIMS).unwrap());

        // Seed past the corpus floor; every entry shares the transcript's
        // embedding bucket so ANN hits at similarity 1.0
        let probe_text = messages(3, 5)
            .iter()
            .map(|m| m.render())
            .collect::<Vec<_>>()
            .join("\n");
        let mut v = vec![0.0_f32; DIMS];
        v[probe_text.len() % DIMS] = 1.0;
        for i in 0..25 {
            let entry = KnowledgeEntry {
                subject: format!("known fact {i}"),
                content: format!("background knowledge number {i}"),
                ..Default::default()
            };
            storage.insert_single(&entry, Some(&v)).unwrap();
        }

        let s = ExtractionScheduler::new(
            llm.clone(),
            storage,
            Arc::new(UnitEmbedder),
            ExtractConfig::default(),
        );
        s.extract(messages(3, 5)).await.unwrap();

        let prompts = llm.prompts.lock().unwrap();
        assert!(prompts[0].contains("REFERENCE"));
        // At most max_injected references
        let reference_lines = prompts[0]
            .lines()
            .filter(|l| l.starts_with("- ["))
            .count();
        assert!(reference_lines <= 5);
    }

    #[tokio::test]
    async fn test_dedup_pass_keeps_selected() {
        struct DedupLlm;

        #[async_trait]
        impl LlmClient for DedupLlm {
            async fn run(&self, request: LlmRequest) -> crate::llm::Result<LlmOutput> {
                if request.tool.as_ref().map(|t| t.name.as_str()) == Some("merge_duplicates") {
                    return Ok(LlmOutput::ToolCall(crate::llm::ToolCall {
                        name: "merge_duplicates".into(),
                        arguments: serde_json::json!({"keep": [0]}),
                    }));
                }
                Ok(LlmOutput::ToolCall(crate::llm::ToolCall {
                    name: "save_memories".into(),
                    arguments: serde_json::json!({
                        "entries": [
                            {"type": "fact", "subject": "a", "content": "first variant"},
                            {"type": "fact", "subject": "a", "content": "second variant"}
                        ]
                    }),
                }))
            }
        }

        let storage = Arc::new(Storage::open_in_memory(DIMS).unwrap());
        let s = ExtractionScheduler::new(
            Arc::new(DedupLlm),
            storage,
            Arc::new(UnitEmbedder),
            ExtractConfig {
                llm_dedup_pass: true,
                pre_fetch: PreFetchConfig {
                    enabled: false,
                    ..Default::default()
                },
                ..Default::default()
            },
        );

        let entries = s.extract(messages(2, 5)).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].content, "first variant");
    }
}
