//! Deterministic provider mocks
//!
//! The embedder assigns every distinct text an orthogonal one-hot vector,
//! with explicit pins for tests that need controlled cosines. The LLM
//! returns scripted tool-call payloads per tool name.

use std::collections::HashMap;
use std::sync::Mutex;

use agenr_core::{
    Embedding, EmbeddingProvider, KnowledgeEntry, LlmClient, LlmError, LlmOutput, LlmRequest,
    SourceRef, ToolCall,
};
use async_trait::async_trait;

/// Embedding dimensionality used across the suite (large enough that the
/// one-hot registry never wraps within a single test corpus)
pub const EMBED_DIMS: usize = 64;

// ============================================================================
// EMBEDDER
// ============================================================================

/// Deterministic embedder: pinned prefixes first, otherwise each distinct
/// text gets the next one-hot slot (orthogonal to everything else)
#[derive(Default)]
pub struct DeterministicEmbedder {
    pins: Mutex<Vec<(String, Vec<f32>)>>,
    registry: Mutex<HashMap<String, usize>>,
}

impl DeterministicEmbedder {
    /// Fresh embedder
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin every text starting with `prefix` to a fixed (normalized) vector
    pub fn pin(&self, prefix: &str, raw: [f32; EMBED_DIMS]) {
        let mut e = Embedding::new(raw.to_vec());
        e.normalize();
        self.pins.lock().unwrap().push((prefix.to_string(), e.vector));
    }

    fn vector_for(&self, text: &str) -> Vec<f32> {
        if let Some((_, vector)) = self
            .pins
            .lock()
            .unwrap()
            .iter()
            .find(|(prefix, _)| text.starts_with(prefix.as_str()))
        {
            return vector.clone();
        }

        let mut registry = self.registry.lock().unwrap();
        let next = registry.len() % EMBED_DIMS;
        let slot = *registry.entry(text.to_string()).or_insert(next);
        let mut v = vec![0.0_f32; EMBED_DIMS];
        v[slot] = 1.0;
        v
    }
}

#[async_trait]
impl EmbeddingProvider for DeterministicEmbedder {
    async fn embed(
        &self,
        texts: &[String],
    ) -> std::result::Result<Vec<Vec<f32>>, agenr_core::EmbeddingError> {
        Ok(texts.iter().map(|t| self.vector_for(t)).collect())
    }

    fn dimensions(&self) -> usize {
        EMBED_DIMS
    }
}

// ============================================================================
// LLM
// ============================================================================

/// Scripted LLM: fixed tool-call arguments per tool name, plus an optional
/// text completion for untooled prompts
#[derive(Default)]
pub struct ScriptedLlm {
    tool_responses: Mutex<HashMap<String, serde_json::Value>>,
    text: Mutex<Option<String>>,
}

impl ScriptedLlm {
    /// Fresh scripted client
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer calls for `tool_name` with these arguments
    pub fn respond_with(self, tool_name: &str, arguments: serde_json::Value) -> Self {
        self.tool_responses
            .lock()
            .unwrap()
            .insert(tool_name.to_string(), arguments);
        self
    }

    /// Answer untooled prompts with this text
    pub fn with_text(self, text: &str) -> Self {
        *self.text.lock().unwrap() = Some(text.to_string());
        self
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn run(&self, request: LlmRequest) -> std::result::Result<LlmOutput, LlmError> {
        match request.tool {
            Some(tool) => {
                let responses = self.tool_responses.lock().unwrap();
                match responses.get(&tool.name) {
                    Some(arguments) => Ok(LlmOutput::ToolCall(ToolCall {
                        name: tool.name,
                        arguments: arguments.clone(),
                    })),
                    None => Err(LlmError::Provider(format!(
                        "no scripted response for tool {}",
                        tool.name
                    ))),
                }
            }
            None => match self.text.lock().unwrap().clone() {
                Some(text) => Ok(LlmOutput::Text(text)),
                None => Err(LlmError::Provider("no scripted text".into())),
            },
        }
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

/// Entry fixture with a source file
pub fn entry(subject: &str, content: &str, source: &str) -> KnowledgeEntry {
    KnowledgeEntry {
        subject: subject.to_string(),
        content: content.to_string(),
        source: SourceRef {
            file: Some(source.to_string()),
            context: None,
        },
        ..Default::default()
    }
}
