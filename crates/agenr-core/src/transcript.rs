//! Transcript Types
//!
//! Session transcripts are parsed by adapter code outside the core; the
//! engine only sees ordered [`TranscriptMessage`]s. This module carries the
//! message type, a token estimator, chunk splitting for the extraction
//! scheduler, and a lenient JSONL parser used as the default adapter.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Rough tokens-per-character ratio for budget math
const CHARS_PER_TOKEN: usize = 4;

// ============================================================================
// MESSAGE
// ============================================================================

/// One transcript message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptMessage {
    /// Position within the session
    pub index: usize,
    /// Speaker role (user, assistant, tool, ...)
    pub role: String,
    /// Message text
    pub content: String,
    /// When the message was produced
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// Transcript the message came from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_file: Option<String>,
}

impl TranscriptMessage {
    /// Rendered form used in extraction prompts
    pub fn render(&self) -> String {
        format!("[{}] {}", self.role, self.content)
    }
}

/// Estimate tokens for budget math (4 chars/token heuristic)
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(CHARS_PER_TOKEN)
}

/// Estimated tokens for a message sequence
pub fn estimate_message_tokens(messages: &[TranscriptMessage]) -> usize {
    messages.iter().map(|m| estimate_tokens(&m.render())).sum()
}

// ============================================================================
// CHUNKS
// ============================================================================

/// A contiguous slice of messages handed to one extraction call
#[derive(Debug, Clone)]
pub struct Chunk {
    /// Chunk position within the file
    pub index: usize,
    /// Messages in order
    pub messages: Vec<TranscriptMessage>,
}

impl Chunk {
    /// Rendered transcript text for the extractor prompt
    pub fn render(&self) -> String {
        self.messages
            .iter()
            .map(TranscriptMessage::render)
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Estimated token footprint
    pub fn estimated_tokens(&self) -> usize {
        estimate_message_tokens(&self.messages)
    }
}

/// Split messages into chunks of at most `max_tokens` (always at message
/// boundaries; an oversized single message becomes its own chunk)
pub fn chunk_messages(messages: Vec<TranscriptMessage>, max_tokens: usize) -> Vec<Chunk> {
    let mut chunks: Vec<Chunk> = Vec::new();
    let mut current: Vec<TranscriptMessage> = Vec::new();
    let mut current_tokens = 0usize;

    for message in messages {
        let tokens = estimate_tokens(&message.render());
        if !current.is_empty() && current_tokens + tokens > max_tokens {
            chunks.push(Chunk {
                index: chunks.len(),
                messages: std::mem::take(&mut current),
            });
            current_tokens = 0;
        }
        current_tokens += tokens;
        current.push(message);
    }

    if !current.is_empty() {
        chunks.push(Chunk {
            index: chunks.len(),
            messages: current,
        });
    }

    chunks
}

// ============================================================================
// DEFAULT PARSER
// ============================================================================

/// Lenient JSONL adapter: one `{role, content, timestamp?}` object per
/// line; anything unparseable is skipped. Real platform adapters replace
/// this with format-specific parsing.
pub fn parse_jsonl(source: &Path, data: &[u8]) -> Vec<TranscriptMessage> {
    #[derive(Deserialize)]
    struct Line {
        role: String,
        content: String,
        #[serde(default)]
        timestamp: Option<DateTime<Utc>>,
    }

    let text = String::from_utf8_lossy(data);
    let source_str = source.to_string_lossy().into_owned();

    text.lines()
        .filter_map(|line| serde_json::from_str::<Line>(line.trim()).ok())
        .enumerate()
        .map(|(index, line)| TranscriptMessage {
            index,
            role: line.role,
            content: line.content,
            timestamp: line.timestamp,
            source_file: Some(source_str.clone()),
        })
        .collect()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn message(index: usize, content: &str) -> TranscriptMessage {
        TranscriptMessage {
            index,
            role: "user".to_string(),
            content: content.to_string(),
            timestamp: None,
            source_file: None,
        }
    }

    #[test]
    fn test_token_estimate() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn test_chunking_respects_budget() {
        // Each message renders to ~[user] + 40 chars -> ~12 tokens
        let messages: Vec<_> = (0..10)
            .map(|i| message(i, &"x".repeat(40)))
            .collect();
        let chunks = chunk_messages(messages, 30);

        assert!(chunks.len() > 1);
        for chunk in &chunks {
            // Only an oversized single message may exceed the budget
            assert!(chunk.estimated_tokens() <= 30 || chunk.messages.len() == 1);
        }

        // Order and coverage preserved
        let indexes: Vec<usize> = chunks
            .iter()
            .flat_map(|c| c.messages.iter().map(|m| m.index))
            .collect();
        assert_eq!(indexes, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_oversized_message_gets_own_chunk() {
        let messages = vec![message(0, &"y".repeat(400)), message(1, "small")];
        let chunks = chunk_messages(messages, 20);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].messages.len(), 1);
    }

    #[test]
    fn test_parse_jsonl_lenient() {
        let data = br#"{"role": "user", "content": "hello"}
not json at all
{"role": "assistant", "content": "hi", "timestamp": "2026-07-01T12:00:00Z"}
"#;
        let messages = parse_jsonl(Path::new("/tmp/s.jsonl"), data);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "user");
        assert_eq!(messages[1].index, 1);
        assert!(messages[1].timestamp.is_some());
        assert_eq!(messages[0].source_file.as_deref(), Some("/tmp/s.jsonl"));
    }
}
