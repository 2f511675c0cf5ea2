//! Ingest Log, Conflict Log, Meta, Signal Watermarks
//!
//! Small bookkeeping tables around the entry store.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use super::{Result, Storage};

// ============================================================================
// TYPES
// ============================================================================

/// One row per batch ingestion
#[derive(Debug, Clone, Serialize)]
pub struct IngestLogRow {
    /// Rowid
    pub id: i64,
    /// Transcript path the batch came from
    pub file_path: Option<String>,
    /// Hash of the ingested slice, when the caller tracked one
    pub content_hash: Option<String>,
    /// When the batch landed
    pub ingested_at: DateTime<Utc>,
    /// Entries inserted
    pub added: i64,
    /// Entries reinforced
    pub updated: i64,
    /// Entries skipped
    pub skipped: i64,
    /// Wall-clock duration of the batch
    pub duration_ms: i64,
}

/// Outcome tag of a conflict-log row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictResolution {
    /// Awaiting operator review
    Pending,
    /// Old entry superseded automatically
    AutoSuperseded,
    /// Both entries kept, no action
    Coexist,
    /// Operator kept the new entry
    KeepNew,
    /// Operator kept the old entry
    KeepOld,
    /// Operator kept both
    KeepBoth,
}

impl ConflictResolution {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictResolution::Pending => "pending",
            ConflictResolution::AutoSuperseded => "auto-superseded",
            ConflictResolution::Coexist => "coexist",
            ConflictResolution::KeepNew => "keep-new",
            ConflictResolution::KeepOld => "keep-old",
            ConflictResolution::KeepBoth => "keep-both",
        }
    }

    /// Parse from string name; unknown tags read back as Pending
    pub fn parse_name(s: &str) -> Self {
        match s {
            "auto-superseded" => ConflictResolution::AutoSuperseded,
            "coexist" => ConflictResolution::Coexist,
            "keep-new" => ConflictResolution::KeepNew,
            "keep-old" => ConflictResolution::KeepOld,
            "keep-both" => ConflictResolution::KeepBoth,
            _ => ConflictResolution::Pending,
        }
    }
}

/// One row per conflict-classifier verdict
#[derive(Debug, Clone, Serialize)]
pub struct ConflictLogRow {
    /// Rowid
    pub id: i64,
    /// Incoming entry
    pub entry_a: String,
    /// Existing entry
    pub entry_b: String,
    /// Classifier relation (supersedes, contradicts, coexists, unrelated)
    pub relation: String,
    /// Classifier confidence
    pub confidence: f64,
    /// Outcome tag
    pub resolution: ConflictResolution,
    /// When the verdict was recorded
    pub created_at: DateTime<Utc>,
    /// When an operator resolved it
    pub resolved_at: Option<DateTime<Utc>>,
}

// ============================================================================
// CONNECTION-LEVEL OPS
// ============================================================================

/// Append an ingest-log row; returns its id
#[allow(clippy::too_many_arguments)]
pub(crate) fn append_ingest_log(
    conn: &Connection,
    file_path: Option<&str>,
    content_hash: Option<&str>,
    added: i64,
    updated: i64,
    skipped: i64,
    duration_ms: i64,
    now: DateTime<Utc>,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO ingest_log (file_path, content_hash, ingested_at, added, updated, skipped, duration_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![file_path, content_hash, now, added, updated, skipped, duration_ms],
    )?;
    Ok(conn.last_insert_rowid())
}

fn map_ingest_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<IngestLogRow> {
    Ok(IngestLogRow {
        id: row.get(0)?,
        file_path: row.get(1)?,
        content_hash: row.get(2)?,
        ingested_at: row.get(3)?,
        added: row.get(4)?,
        updated: row.get(5)?,
        skipped: row.get(6)?,
        duration_ms: row.get(7)?,
    })
}

/// Record a conflict-classifier verdict; returns the row id
pub(crate) fn insert_conflict(
    conn: &Connection,
    entry_a: &str,
    entry_b: &str,
    relation: &str,
    confidence: f64,
    resolution: ConflictResolution,
    now: DateTime<Utc>,
) -> Result<i64> {
    let resolved_at = match resolution {
        ConflictResolution::Pending => None,
        _ => Some(now),
    };
    conn.execute(
        "INSERT INTO conflict_log (entry_a, entry_b, relation, confidence, resolution, created_at, resolved_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![entry_a, entry_b, relation, confidence, resolution.as_str(), now, resolved_at],
    )?;
    Ok(conn.last_insert_rowid())
}

fn map_conflict_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConflictLogRow> {
    let resolution_raw: String = row.get(5)?;
    Ok(ConflictLogRow {
        id: row.get(0)?,
        entry_a: row.get(1)?,
        entry_b: row.get(2)?,
        relation: row.get(3)?,
        confidence: row.get(4)?,
        resolution: ConflictResolution::parse_name(&resolution_raw),
        created_at: row.get(6)?,
        resolved_at: row.get(7)?,
    })
}

pub(crate) fn meta_get(conn: &Connection, key: &str) -> Result<Option<String>> {
    Ok(conn
        .query_row("SELECT value FROM _meta WHERE key = ?1", params![key], |r| {
            r.get(0)
        })
        .optional()?)
}

pub(crate) fn meta_set(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO _meta (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}

pub(crate) fn watermark_get(conn: &Connection, consumer: &str) -> Result<i64> {
    Ok(conn
        .query_row(
            "SELECT last_rowid FROM signal_watermarks WHERE consumer = ?1",
            params![consumer],
            |r| r.get(0),
        )
        .optional()?
        .unwrap_or(0))
}

pub(crate) fn watermark_set(
    conn: &Connection,
    consumer: &str,
    rowid: i64,
    now: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO signal_watermarks (consumer, last_rowid, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(consumer) DO UPDATE SET last_rowid = excluded.last_rowid,
                                             updated_at = excluded.updated_at",
        params![consumer, rowid, now],
    )?;
    Ok(())
}

// ============================================================================
// STORAGE WRAPPERS
// ============================================================================

impl Storage {
    /// Last `limit` ingest-log rows, newest first
    pub fn recent_ingest_logs(&self, limit: usize) -> Result<Vec<IngestLogRow>> {
        self.with_reader(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id, file_path, content_hash, ingested_at, added, updated, skipped, duration_ms
                 FROM ingest_log ORDER BY id DESC LIMIT ?1",
            )?;
            let rows = stmt
                .query_map(params![limit as i64], map_ingest_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    /// Pending conflict-log rows, oldest first
    pub fn pending_conflicts(&self, limit: usize) -> Result<Vec<ConflictLogRow>> {
        self.with_reader(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id, entry_a, entry_b, relation, confidence, resolution, created_at, resolved_at
                 FROM conflict_log WHERE resolution = 'pending' ORDER BY id LIMIT ?1",
            )?;
            let rows = stmt
                .query_map(params![limit as i64], map_conflict_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    /// Resolve a pending conflict-log row
    pub fn resolve_conflict(&self, conflict_id: i64, resolution: ConflictResolution) -> Result<()> {
        self.with_writer(|conn| {
            conn.execute(
                "UPDATE conflict_log SET resolution = ?2, resolved_at = ?3 WHERE id = ?1",
                params![conflict_id, resolution.as_str(), Utc::now()],
            )?;
            Ok(())
        })
    }

    /// Read a `_meta` value
    pub fn meta(&self, key: &str) -> Result<Option<String>> {
        self.with_reader(|conn| meta_get(conn, key))
    }

    /// Write a `_meta` value
    pub fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        self.with_writer(|conn| meta_set(conn, key, value))
    }

    /// Last surfaced rowid for a signal consumer (0 when never surfaced)
    pub fn signal_watermark(&self, consumer: &str) -> Result<i64> {
        self.with_reader(|conn| watermark_get(conn, consumer))
    }

    /// Advance a signal consumer's watermark
    pub fn set_signal_watermark(&self, consumer: &str, rowid: i64) -> Result<()> {
        self.with_writer(|conn| watermark_set(conn, consumer, rowid, Utc::now()))
    }
}

// ============================================================================
// TESTS
// ============================================================================
