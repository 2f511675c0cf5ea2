//! LLM Client Contract
//!
//! The LLM provider (extractor, conflict classifier, summarizer) is an
//! external collaborator. The engine only depends on this transport
//! contract: run a prompt with an optional tool definition, get back either
//! a tool call (name + JSON arguments) or plain text.
//!
//! Callers must treat every failure as degradable - no LLM error may fail
//! an insert (the conflict resolver coexists, the extractor retries or
//! skips the chunk).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

// ============================================================================
// ERROR TYPES
// ============================================================================

/// LLM transport errors
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    /// Provider rejected or failed the call
    #[error("llm provider error: {0}")]
    Provider(String),
    /// Provider asked us to slow down
    #[error("llm rate limited{}", retry_after_secs.map(|s| format!(" (retry after {s}s)")).unwrap_or_default())]
    RateLimited {
        /// Suggested backoff, when the provider sent one
        retry_after_secs: Option<u64>,
    },
    /// Per-call timeout elapsed
    #[error("llm call timed out after {0}s")]
    Timeout(u64),
    /// Response could not be decoded at the transport level
    #[error("llm response malformed: {0}")]
    Malformed(String),
}

impl LlmError {
    /// Whether a retry with backoff is worthwhile
    pub fn is_retryable(&self) -> bool {
        matches!(self, LlmError::RateLimited { .. } | LlmError::Timeout(_))
    }
}

/// LLM result type
pub type Result<T> = std::result::Result<T, LlmError>;

// ============================================================================
// REQUEST / RESPONSE
// ============================================================================

/// A tool the model is instructed to call, with its JSON schema
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Tool name the model must call
    pub name: String,
    /// JSON schema of the arguments
    pub schema: serde_json::Value,
}

/// One prompt execution
#[derive(Debug, Clone, Default)]
pub struct LlmRequest {
    /// System prompt
    pub system: Option<String>,
    /// User prompt
    pub prompt: String,
    /// When present, the model is forced to answer via this tool
    pub tool: Option<ToolSpec>,
    /// Per-call timeout in seconds; provider default when None
    pub timeout_secs: Option<u64>,
}

/// A structured tool call returned by the model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Tool name the model called
    pub name: String,
    /// Raw JSON arguments; callers validate against their schema
    pub arguments: serde_json::Value,
}

/// Model output: a tool call when a tool was requested, else text
#[derive(Debug, Clone)]
pub enum LlmOutput {
    /// Plain text completion
    Text(String),
    /// Structured tool call
    ToolCall(ToolCall),
}

impl LlmOutput {
    /// The tool call, if the model produced one
    pub fn tool_call(&self) -> Option<&ToolCall> {
        match self {
            LlmOutput::ToolCall(call) => Some(call),
            LlmOutput::Text(_) => None,
        }
    }

    /// The text, if the model produced text
    pub fn text(&self) -> Option<&str> {
        match self {
            LlmOutput::Text(t) => Some(t),
            LlmOutput::ToolCall(_) => None,
        }
    }
}

// ============================================================================
// CLIENT TRAIT
// ============================================================================

/// External LLM provider contract
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Run one prompt, returning tool-call arguments or text
    async fn run(&self, request: LlmRequest) -> Result<LlmOutput>;
}

// ============================================================================
// TESTS
// ============================================================================
