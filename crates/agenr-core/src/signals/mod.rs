//! Signals & Handoff
//!
//! Watermark-based "since last surfaced" notifications plus the
//! session-end handoff entry.
//!
//! Each consumer tracks the last `entries.rowid` it has been shown. A
//! signal poll surfaces new high-importance entries beyond the watermark,
//! gated by a recency window, a per-session cooldown, and a session cap.
//! Polls that surface nothing consume neither cooldown nor cap.
//!
//! On session end, a merged transcript summary is stored as an `event` of
//! importance 9 tagged `handoff`, with a canonical key derived from the
//! session id so a paired begin-session signal dedupes against it. The LLM
//! summary is an upgrade; its failure never prevents the deterministic
//! fallback write.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};

use crate::config::SignalSettings;
use crate::ingest::{StoreOptions, StorePipeline, StoreResult};
use crate::llm::{LlmClient, LlmRequest};
use crate::memory::{EntryType, Expiry, KnowledgeEntry, SourceRef, StoredEntry};
use crate::storage::{Result, Storage, StorageError};
use crate::transcript::TranscriptMessage;

/// Turns included in the deterministic fallback summary
const FALLBACK_TURNS: usize = 10;

/// Handoff entries carry this importance
const HANDOFF_IMPORTANCE: i64 = 9;

// ============================================================================
// SIGNAL ENGINE
// ============================================================================

#[derive(Debug, Default, Clone)]
struct SessionGate {
    last_signal_at: Option<DateTime<Utc>>,
    signals_sent: usize,
}

/// Watermarked signal polling
pub struct SignalEngine {
    storage: Arc<Storage>,
    settings: SignalSettings,
    sessions: Mutex<HashMap<String, SessionGate>>,
}

impl SignalEngine {
    /// Engine over a storage handle
    pub fn new(storage: Arc<Storage>, settings: SignalSettings) -> Self {
        Self {
            storage,
            settings,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Surface high-importance entries the consumer has not seen yet
    ///
    /// Advances the consumer's watermark past everything returned. Gated
    /// by the cooldown and session cap; empty polls consume neither.
    pub fn poll(&self, consumer: &str, session_id: &str) -> Result<Vec<StoredEntry>> {
        if !self.settings.signals_enabled {
            return Ok(Vec::new());
        }

        let now = Utc::now();
        {
            let sessions = self
                .sessions
                .lock()
                .map_err(|_| StorageError::LockPoisoned("signal sessions"))?;
            if let Some(gate) = sessions.get(session_id) {
                if gate.signals_sent >= self.settings.signal_max_per_session {
                    return Ok(Vec::new());
                }
                if let Some(last) = gate.last_signal_at {
                    let cooldown = Duration::milliseconds(self.settings.signal_cooldown_ms as i64);
                    if now - last < cooldown {
                        return Ok(Vec::new());
                    }
                }
            }
        }

        let watermark = self.storage.signal_watermark(consumer)?;
        let window_start = now - Duration::seconds(self.settings.signal_max_age_sec);
        let rows = self.storage.entries_since_rowid(
            watermark,
            self.settings.signal_min_importance,
            window_start,
            self.settings.signal_max_per_signal,
        )?;

        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let max_rowid = rows.iter().map(|(rowid, _)| *rowid).max().unwrap_or(watermark);
        self.storage.set_signal_watermark(consumer, max_rowid)?;

        {
            let mut sessions = self
                .sessions
                .lock()
                .map_err(|_| StorageError::LockPoisoned("signal sessions"))?;
            let gate = sessions.entry(session_id.to_string()).or_default();
            gate.last_signal_at = Some(now);
            gate.signals_sent += 1;
        }

        Ok(rows.into_iter().map(|(_, entry)| entry).collect())
    }
}

// ============================================================================
// HANDOFF
// ============================================================================

/// Deterministic fallback: the last N turns, verbatim
fn fallback_summary(messages: &[TranscriptMessage]) -> String {
    let start = messages.len().saturating_sub(FALLBACK_TURNS);
    let excerpt = messages[start..]
        .iter()
        .map(TranscriptMessage::render)
        .collect::<Vec<_>>()
        .join("\n");
    format!("Session ended. Last {} turns:\n{excerpt}", messages.len() - start)
}

/// Summarize the session with the LLM; any failure falls back
async fn summarize(
    llm: Option<&dyn LlmClient>,
    messages: &[TranscriptMessage],
) -> String {
    if let Some(llm) = llm {
        let transcript = messages
            .iter()
            .map(TranscriptMessage::render)
            .collect::<Vec<_>>()
            .join("\n");
        let request = LlmRequest {
            system: Some(
                "Summarize this agent session for a future session picking up the work: state \
                 of the task, decisions made, and immediate next steps. Be concise."
                    .to_string(),
            ),
            prompt: transcript,
            tool: None,
            timeout_secs: None,
        };
        match llm.run(request).await {
            Ok(output) => {
                if let Some(text) = output.text() {
                    if !text.trim().is_empty() {
                        return text.trim().to_string();
                    }
                }
                tracing::warn!("handoff summary came back empty; using the fallback excerpt");
            }
            Err(e) => {
                tracing::warn!("handoff summary unavailable ({e}); using the fallback excerpt");
            }
        }
    }
    fallback_summary(messages)
}

/// Store the session-end handoff entry through the normal store pipeline
/// (the canonical key dedupes it against a paired begin-session signal)
pub async fn write_handoff(
    pipeline: &StorePipeline,
    llm: Option<&dyn LlmClient>,
    session_id: &str,
    messages: &[TranscriptMessage],
) -> Result<StoreResult> {
    let summary = summarize(llm, messages).await;
    let source_file = messages.iter().rev().find_map(|m| m.source_file.clone());

    let entry = KnowledgeEntry {
        entry_type: EntryType::Event,
        subject: format!("session {session_id} handoff"),
        content: summary,
        canonical_key: Some(format!("session-handoff/{session_id}")),
        importance: HANDOFF_IMPORTANCE,
        expiry: Expiry::Permanent,
        tags: vec!["handoff".to_string()],
        source: SourceRef {
            file: source_file,
            context: Some(format!("session-end hook ({session_id})")),
        },
        ..Default::default()
    };

    pipeline
        .store_entries(
            vec![entry],
            &StoreOptions {
                file_path: Some(format!("session:{session_id}")),
                ..Default::default()
            },
        )
        .await
}

// ============================================================================
// TESTS
// ============================================================================
