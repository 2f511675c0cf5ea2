//! Retirement Ledger
//!
//! `retire(id, reason, persist)` hides an entry from recall. With `persist`
//! the retirement is also appended to a file-backed ledger keyed by
//! `(subject, type, content_hash)`, so re-ingesting the same source does not
//! resurrect the entry: the store pipeline consults the ledger and inserts
//! matching entries already retired.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::memory::{normalize_subject, EntryType, StoredEntry};

use super::{Result, Storage};

// ============================================================================
// LEDGER
// ============================================================================

/// One persisted retirement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetirementRecord {
    /// Subject at retirement time (normalized for matching)
    pub subject: String,
    /// Entry type
    #[serde(rename = "type")]
    pub entry_type: EntryType,
    /// Content hash at retirement time
    pub content_hash: String,
    /// Operator-supplied reason
    pub reason: String,
    /// When the retirement happened
    pub retired_at: DateTime<Utc>,
}

/// File-backed retirement ledger (`retirements.json`)
#[derive(Debug)]
pub struct RetirementLedger {
    path: PathBuf,
    records: Vec<RetirementRecord>,
}

impl RetirementLedger {
    /// Load the ledger; a missing file is an empty ledger
    pub fn load(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let records = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            serde_json::from_str(&raw).unwrap_or_else(|e| {
                tracing::warn!("retirement ledger at {} unreadable ({e}); starting empty", path.display());
                Vec::new()
            })
        } else {
            Vec::new()
        };
        Ok(Self { path, records })
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the ledger is empty
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Look up a retirement for `(subject, type, content_hash)`
    pub fn find(
        &self,
        subject: &str,
        entry_type: EntryType,
        content_hash: &str,
    ) -> Option<&RetirementRecord> {
        let wanted = normalize_subject(subject);
        self.records.iter().find(|r| {
            r.entry_type == entry_type
                && r.content_hash == content_hash
                && normalize_subject(&r.subject) == wanted
        })
    }

    /// Append a record and persist atomically (temp file + rename)
    pub fn append(&mut self, record: RetirementRecord) -> std::io::Result<()> {
        self.records.push(record);
        let json = serde_json::to_string_pretty(&self.records)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

// ============================================================================
// STORAGE WRAPPER
// ============================================================================

impl Storage {
    /// Retire an entry; with a ledger the retirement survives re-ingest
    pub fn retire(
        &self,
        entry_id: &str,
        reason: &str,
        ledger: Option<&mut RetirementLedger>,
    ) -> Result<StoredEntry> {
        let retired = self.retire_entry(entry_id, reason)?;
        if let Some(ledger) = ledger {
            ledger.append(RetirementRecord {
                subject: retired.subject.clone(),
                entry_type: retired.entry_type,
                content_hash: retired.content_hash.clone(),
                reason: reason.to_string(),
                retired_at: retired.retired_at.unwrap_or_else(Utc::now),
            })?;
        }
        Ok(retired)
    }
}

// ============================================================================
// TESTS
// ============================================================================
