//! Export / Import
//!
//! JSON round trip of the full entry set. Relations are exported against
//! content hashes (stable across databases) rather than ids, so
//! export -> wipe -> import preserves tag sets, relations, and counters;
//! ids survive as written and embeddings are recomputed lazily afterwards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::embedding::Embedding;
use crate::memory::{RelationType, StoredEntry};

use super::entries::{self, EntryFilter};
use super::{Result, Storage, StorageError};

/// Export format version
pub const EXPORT_VERSION: u32 = 1;

// ============================================================================
// TYPES
// ============================================================================

/// A relation edge keyed by content hash instead of entry id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportedRelation {
    /// Content hash of the edge source
    pub source_hash: String,
    /// Content hash of the edge target
    pub target_hash: String,
    /// Edge kind
    pub relation_type: RelationType,
    /// When the edge was recorded
    pub created_at: DateTime<Utc>,
}

/// The export document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportFile {
    /// Format version
    pub version: u32,
    /// When the export was taken
    pub exported_at: DateTime<Utc>,
    /// All entries, lifecycle state and counters included
    pub entries: Vec<StoredEntry>,
    /// All relation edges
    pub relations: Vec<ExportedRelation>,
}

// ============================================================================
// STORAGE OPS
// ============================================================================

impl Storage {
    /// Export every entry (including superseded and retired) and every
    /// relation edge
    pub fn export(&self) -> Result<ExportFile> {
        let entries = self.entries(&EntryFilter {
            include_inactive: true,
            ..Default::default()
        })?;

        let relations = self.with_reader(|conn| {
            let mut stmt = conn.prepare(
                "SELECT s.content_hash, t.content_hash, r.relation_type, r.created_at
                 FROM relations r
                 JOIN entries s ON s.id = r.source_id
                 JOIN entries t ON t.id = r.target_id
                 ORDER BY r.created_at",
            )?;
            let relations = stmt
                .query_map([], |row| {
                    let relation_raw: String = row.get(2)?;
                    Ok(ExportedRelation {
                        source_hash: row.get(0)?,
                        target_hash: row.get(1)?,
                        relation_type: RelationType::parse_name(&relation_raw).map_err(|e| {
                            rusqlite::Error::FromSqlConversionFailure(
                                2,
                                rusqlite::types::Type::Text,
                                Box::new(e),
                            )
                        })?,
                        created_at: row.get(3)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(relations)
        })?;

        Ok(ExportFile {
            version: EXPORT_VERSION,
            exported_at: Utc::now(),
            entries,
            relations,
        })
    }

    /// Import an export document into an empty (or wiped) database
    ///
    /// Rows are written verbatim (ids, counters, lifecycle, recall
    /// intervals); embeddings are left NULL for recomputation. Returns the
    /// number of entries written.
    pub fn import(&self, export: &ExportFile) -> Result<usize> {
        if export.version != EXPORT_VERSION {
            return Err(StorageError::Init(format!(
                "unsupported export version {}",
                export.version
            )));
        }

        let written = self.write_transaction(false, |conn| {
            for entry in &export.entries {
                conn.execute(
                    "INSERT INTO entries (
                        id, type, subject, content, canonical_key, subject_key,
                        importance, expiry, scope, platform, project,
                        source_file, source_context, content_hash,
                        created_at, updated_at, last_recalled_at,
                        recall_count, confirmations, contradictions, recall_intervals,
                        superseded_by, retired, retired_at, retired_reason, suppressed_contexts
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                              ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26)",
                    rusqlite::params![
                        entry.id,
                        entry.entry_type.as_str(),
                        entry.subject,
                        entry.content,
                        entry.canonical_key,
                        entry.subject_key,
                        entry.importance,
                        entry.expiry.as_str(),
                        entry.scope.as_str(),
                        entry.platform,
                        entry.project,
                        entry.source_file,
                        entry.source_context,
                        entry.content_hash,
                        entry.created_at,
                        entry.updated_at,
                        entry.last_recalled_at,
                        entry.recall_count,
                        entry.confirmations,
                        entry.contradictions,
                        serde_json::to_string(&entry.recall_intervals)?,
                        entry.superseded_by,
                        entry.retired as i64,
                        entry.retired_at,
                        entry.retired_reason,
                        serde_json::to_string(&entry.suppressed_contexts)?,
                    ],
                )?;
                entries::insert_tags(conn, &entry.id, &entry.tags)?;
            }

            for relation in &export.relations {
                let resolve = |hash: &str| -> Result<Option<String>> {
                    Ok(entries::entry_by_content_hash(conn, hash)?.map(|e| e.id))
                };
                if let (Some(source), Some(target)) = (
                    resolve(&relation.source_hash)?,
                    resolve(&relation.target_hash)?,
                ) {
                    entries::insert_relation(
                        conn,
                        &source,
                        &target,
                        relation.relation_type,
                        relation.created_at,
                    )?;
                }
            }

            Ok(export.entries.len())
        })?;

        self.rebuild_subject_index()?;
        self.rebuild_vector_index()?;
        Ok(written)
    }

    /// Ids of entries without a stored embedding
    pub fn entries_missing_embedding(&self) -> Result<Vec<String>> {
        self.with_reader(|conn| {
            let mut stmt =
                conn.prepare("SELECT id FROM entries WHERE embedding IS NULL ORDER BY rowid")?;
            let ids = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(ids)
        })
    }

    /// Backfill an embedding (import recovery, provider migration)
    pub fn set_embedding(&self, entry_id: &str, vector: &[f32]) -> Result<()> {
        let bytes = Embedding::new(vector.to_vec()).to_bytes();
        let changed = self.with_writer(|conn| {
            Ok(conn.execute(
                "UPDATE entries SET embedding = ?2 WHERE id = ?1",
                rusqlite::params![entry_id, bytes],
            )?)
        })?;
        if changed == 0 {
            return Err(StorageError::NotFound(entry_id.to_string()));
        }

        let entry = self.get_entry(entry_id)?;
        if entry.map(|e| e.is_active()).unwrap_or(false) {
            self.vector_index_add(entry_id, vector)?;
        }
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================
