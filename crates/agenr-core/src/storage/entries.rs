//! Entry Row Operations
//!
//! Connection-level helpers shared by the store pipeline (inside its batch
//! transaction) and the public `Storage` methods. All lifecycle mutations
//! that affect "active" status have matching in-process index updates in
//! the `Storage` wrappers.

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, Connection, OptionalExtension};

use crate::embedding::Embedding;
use crate::memory::{
    normalize_subject, EntryType, Expiry, KnowledgeEntry, RelationType, Scope, StoredEntry,
};
use crate::search::sanitize_fts5_query;

use super::{Result, Storage, StorageError};

/// Column list matching [`map_entry_row`]
pub(crate) const ENTRY_COLUMNS: &str = "id, type, subject, content, canonical_key, subject_key, \
     importance, expiry, scope, platform, project, source_file, source_context, content_hash, \
     created_at, updated_at, last_recalled_at, recall_count, confirmations, contradictions, \
     recall_intervals, superseded_by, retired, retired_at, retired_reason, suppressed_contexts, \
     embedding IS NOT NULL";

// ============================================================================
// TYPES
// ============================================================================

/// A directed relation edge between two entries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relation {
    /// Edge source
    pub source_id: String,
    /// Edge target
    pub target_id: String,
    /// Edge kind
    pub relation_type: RelationType,
    /// When the edge was recorded
    pub created_at: DateTime<Utc>,
}

/// Filter for entry scans (browse recall, consolidation, export)
#[derive(Debug, Clone, Default)]
pub struct EntryFilter {
    /// Restrict to these types
    pub types: Option<Vec<EntryType>>,
    /// Require at least one of these tags
    pub tags: Option<Vec<String>>,
    /// Importance floor
    pub min_importance: Option<i64>,
    /// Only entries created at or after this instant
    pub since: Option<DateTime<Utc>>,
    /// Restrict to these expiry classes
    pub expiry: Option<Vec<Expiry>>,
    /// Restrict to this platform
    pub platform: Option<String>,
    /// Restrict to these projects (NULL project still included unless strict)
    pub projects: Option<Vec<String>>,
    /// Exclude these projects (NULL project never excluded)
    pub exclude_projects: Option<Vec<String>>,
    /// With `projects`, also exclude entries with no project
    pub strict_project: bool,
    /// Include superseded and retired entries
    pub include_inactive: bool,
    /// Row cap
    pub limit: Option<usize>,
}

// ============================================================================
// ROW MAPPING
// ============================================================================

fn parse_error(idx: usize, err: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
}

/// Map a row selected with [`ENTRY_COLUMNS`]; tags are loaded separately
pub(crate) fn map_entry_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredEntry> {
    let type_raw: String = row.get(1)?;
    let expiry_raw: String = row.get(7)?;
    let scope_raw: String = row.get(8)?;
    let intervals_raw: String = row.get(20)?;
    let suppressed_raw: String = row.get(25)?;

    Ok(StoredEntry {
        id: row.get(0)?,
        entry_type: EntryType::parse_name(&type_raw).map_err(|e| parse_error(1, e))?,
        subject: row.get(2)?,
        content: row.get(3)?,
        canonical_key: row.get(4)?,
        subject_key: row.get(5)?,
        importance: row.get(6)?,
        expiry: Expiry::parse_name(&expiry_raw).map_err(|e| parse_error(7, e))?,
        scope: Scope::parse_name(&scope_raw).map_err(|e| parse_error(8, e))?,
        platform: row.get(9)?,
        project: row.get(10)?,
        tags: Vec::new(),
        source_file: row.get(11)?,
        source_context: row.get(12)?,
        content_hash: row.get(13)?,
        created_at: row.get(14)?,
        updated_at: row.get(15)?,
        last_recalled_at: row.get(16)?,
        recall_count: row.get(17)?,
        confirmations: row.get(18)?,
        contradictions: row.get(19)?,
        recall_intervals: serde_json::from_str(&intervals_raw).map_err(|e| parse_error(20, e))?,
        superseded_by: row.get(21)?,
        retired: row.get::<_, i64>(22)? != 0,
        retired_at: row.get(23)?,
        retired_reason: row.get(24)?,
        suppressed_contexts: serde_json::from_str(&suppressed_raw)
            .map_err(|e| parse_error(25, e))?,
        has_embedding: row.get(26)?,
    })
}

/// Fill the `tags` field for a batch of entries in one query
pub(crate) fn load_tags(conn: &Connection, entries: &mut [StoredEntry]) -> Result<()> {
    let mut stmt = conn.prepare_cached("SELECT tag FROM tags WHERE entry_id = ?1 ORDER BY tag")?;
    for entry in entries.iter_mut() {
        let tags = stmt
            .query_map([&entry.id], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        entry.tags = tags;
    }
    Ok(())
}

// ============================================================================
// WRITES
// ============================================================================

/// Insert a fully resolved entry row
#[allow(clippy::too_many_arguments)]
pub(crate) fn insert_entry(
    conn: &Connection,
    entry: &KnowledgeEntry,
    id: &str,
    content_hash: &str,
    vector: Option<&[f32]>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
) -> Result<()> {
    let embedding_bytes = vector.map(|v| Embedding::new(v.to_vec()).to_bytes());
    let subject_key = entry.normalized_subject_key();

    conn.execute(
        "INSERT INTO entries (
            id, type, subject, content, canonical_key, subject_key,
            importance, expiry, scope, platform, project,
            source_file, source_context, content_hash, embedding,
            created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
        params![
            id,
            entry.entry_type.as_str(),
            entry.subject,
            entry.content,
            entry.canonical_key,
            subject_key,
            entry.importance,
            entry.expiry.as_str(),
            entry.scope.unwrap_or_default().as_str(),
            entry.platform,
            entry.project,
            entry.source.file,
            entry.source.context,
            content_hash,
            embedding_bytes,
            created_at,
            updated_at,
        ],
    )?;
    Ok(())
}

/// Upsert tags for an entry (lowercased, trimmed, deduped by UNIQUE)
pub(crate) fn insert_tags(conn: &Connection, entry_id: &str, tags: &[String]) -> Result<usize> {
    let mut stmt =
        conn.prepare_cached("INSERT OR IGNORE INTO tags (entry_id, tag) VALUES (?1, ?2)")?;
    let mut inserted = 0;
    for raw in tags {
        if let Some(tag) = crate::memory::normalize_tag(raw) {
            inserted += stmt.execute(params![entry_id, tag])?;
        }
    }
    Ok(inserted)
}

/// Record a relation edge; Ok(false) when the edge already existed
pub(crate) fn insert_relation(
    conn: &Connection,
    source_id: &str,
    target_id: &str,
    relation_type: RelationType,
    now: DateTime<Utc>,
) -> Result<bool> {
    let changed = conn.execute(
        "INSERT OR IGNORE INTO relations (source_id, target_id, relation_type, created_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![source_id, target_id, relation_type.as_str(), now],
    )?;
    Ok(changed > 0)
}

/// Reinforce: bump confirmations and freshness
pub(crate) fn reinforce(conn: &Connection, entry_id: &str, now: DateTime<Utc>) -> Result<()> {
    let changed = conn.execute(
        "UPDATE entries SET confirmations = confirmations + 1, updated_at = ?2 WHERE id = ?1",
        params![entry_id, now],
    )?;
    if changed == 0 {
        return Err(StorageError::NotFound(entry_id.to_string()));
    }
    Ok(())
}

/// Count a contradiction against an entry
pub(crate) fn add_contradiction(
    conn: &Connection,
    entry_id: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "UPDATE entries SET contradictions = contradictions + 1, updated_at = ?2 WHERE id = ?1",
        params![entry_id, now],
    )?;
    Ok(())
}

/// Mark an entry as superseded by another
pub(crate) fn set_superseded(
    conn: &Connection,
    entry_id: &str,
    superseded_by: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    let changed = conn.execute(
        "UPDATE entries SET superseded_by = ?2, updated_at = ?3 WHERE id = ?1",
        params![entry_id, superseded_by, now],
    )?;
    if changed == 0 {
        return Err(StorageError::NotFound(entry_id.to_string()));
    }
    Ok(())
}

/// Mark an entry retired
pub(crate) fn set_retired(
    conn: &Connection,
    entry_id: &str,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    let changed = conn.execute(
        "UPDATE entries SET retired = 1, retired_at = ?2, retired_reason = ?3, updated_at = ?2
         WHERE id = ?1",
        params![entry_id, now, reason],
    )?;
    if changed == 0 {
        return Err(StorageError::NotFound(entry_id.to_string()));
    }
    Ok(())
}

/// Add a context to `suppressed_contexts` if not already present
pub(crate) fn suppress_context(
    conn: &Connection,
    entry_id: &str,
    context: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "UPDATE entries SET suppressed_contexts = (
            CASE WHEN EXISTS (SELECT 1 FROM json_each(suppressed_contexts) WHERE value = ?2)
                 THEN suppressed_contexts
                 ELSE json_insert(suppressed_contexts, '$[#]', ?2)
            END
        ), updated_at = ?3 WHERE id = ?1",
        params![entry_id, context, now],
    )?;
    Ok(())
}

/// Atomic recall-metadata update: one interval stamp, one counter bump,
/// one shared `last_recalled_at`, per id. The JSON append happens inside
/// SQLite so there is no read-modify-write window.
pub(crate) fn update_recall_metadata(
    conn: &Connection,
    entry_ids: &[String],
    now: DateTime<Utc>,
) -> Result<()> {
    let unix_seconds = now.timestamp();
    let mut stmt = conn.prepare_cached(
        "UPDATE entries SET
            recall_intervals = json_insert(recall_intervals, '$[#]', ?2),
            last_recalled_at = ?3,
            recall_count = recall_count + 1
         WHERE id = ?1",
    )?;
    for id in entry_ids {
        stmt.execute(params![id, unix_seconds, now])?;
    }
    Ok(())
}

/// Hard-delete an entry row (consolidator only); cascades tags/relations
pub(crate) fn delete_entry(conn: &Connection, entry_id: &str) -> Result<bool> {
    let changed = conn.execute("DELETE FROM entries WHERE id = ?1", params![entry_id])?;
    Ok(changed > 0)
}

// ============================================================================
// READS
// ============================================================================

/// Fetch one entry with its tags
pub(crate) fn get_entry(conn: &Connection, entry_id: &str) -> Result<Option<StoredEntry>> {
    let entry = conn
        .query_row(
            &format!("SELECT {ENTRY_COLUMNS} FROM entries WHERE id = ?1"),
            params![entry_id],
            map_entry_row,
        )
        .optional()?;

    match entry {
        Some(entry) => {
            let mut entries = vec![entry];
            load_tags(conn, &mut entries)?;
            Ok(entries.pop())
        }
        None => Ok(None),
    }
}

/// Any row (active or not) with this content hash
pub(crate) fn entry_by_content_hash(
    conn: &Connection,
    content_hash: &str,
) -> Result<Option<StoredEntry>> {
    Ok(conn
        .query_row(
            &format!("SELECT {ENTRY_COLUMNS} FROM entries WHERE content_hash = ?1 LIMIT 1"),
            params![content_hash],
            map_entry_row,
        )
        .optional()?)
}

/// Active entries sharing a canonical key, newest first
pub(crate) fn active_by_canonical_key(
    conn: &Connection,
    canonical_key: &str,
) -> Result<Vec<StoredEntry>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {ENTRY_COLUMNS} FROM entries
         WHERE canonical_key = ?1 AND superseded_by IS NULL AND retired = 0
         ORDER BY created_at DESC"
    ))?;
    let entries = stmt
        .query_map(params![canonical_key], map_entry_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(entries)
}

/// Active entry sharing `(subject, type, source_file)` created after
/// `cutoff` - the source-file recency guard probe
pub(crate) fn recent_same_source(
    conn: &Connection,
    subject: &str,
    entry_type: EntryType,
    source_file: &str,
    cutoff: DateTime<Utc>,
) -> Result<Option<StoredEntry>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {ENTRY_COLUMNS} FROM entries
         WHERE type = ?1 AND source_file = ?2 AND created_at >= ?3
           AND superseded_by IS NULL AND retired = 0
         ORDER BY created_at DESC"
    ))?;
    let candidates = stmt
        .query_map(params![entry_type.as_str(), source_file, cutoff], map_entry_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let wanted = normalize_subject(subject);
    Ok(candidates
        .into_iter()
        .find(|e| normalize_subject(&e.subject) == wanted))
}

/// Stored embedding vector for an entry
pub(crate) fn get_embedding(conn: &Connection, entry_id: &str) -> Result<Option<Vec<f32>>> {
    let bytes: Option<Vec<u8>> = conn
        .query_row(
            "SELECT embedding FROM entries WHERE id = ?1",
            params![entry_id],
            |row| row.get(0),
        )
        .optional()?
        .flatten();
    Ok(bytes
        .as_deref()
        .and_then(Embedding::from_bytes)
        .map(|e| e.vector))
}

/// `(subject_key, id)` pairs for every active entry with a subject key
pub(crate) fn active_subject_pairs(conn: &Connection) -> Result<Vec<(String, String)>> {
    let mut stmt = conn.prepare(
        "SELECT subject_key, id FROM entries
         WHERE subject_key IS NOT NULL AND superseded_by IS NULL AND retired = 0",
    )?;
    let pairs = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(pairs)
}

/// Relations where the entry is source or target
pub(crate) fn relations_of(conn: &Connection, entry_id: &str) -> Result<Vec<Relation>> {
    let mut stmt = conn.prepare_cached(
        "SELECT source_id, target_id, relation_type, created_at FROM relations
         WHERE source_id = ?1 OR target_id = ?1
         ORDER BY created_at",
    )?;
    let relations = stmt
        .query_map(params![entry_id], |row| {
            let relation_raw: String = row.get(2)?;
            Ok(Relation {
                source_id: row.get(0)?,
                target_id: row.get(1)?,
                relation_type: RelationType::parse_name(&relation_raw)
                    .map_err(|e| parse_error(2, e))?,
                created_at: row.get(3)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(relations)
}

/// Filtered entry scan, newest first
pub(crate) fn select_entries(conn: &Connection, filter: &EntryFilter) -> Result<Vec<StoredEntry>> {
    let mut clauses: Vec<String> = Vec::new();
    let mut values: Vec<Value> = Vec::new();

    if !filter.include_inactive {
        clauses.push("superseded_by IS NULL AND retired = 0".to_string());
    }

    if let Some(types) = &filter.types {
        if !types.is_empty() {
            let placeholders = push_values(
                &mut values,
                types.iter().map(|t| Value::from(t.as_str().to_string())),
            );
            clauses.push(format!("type IN ({placeholders})"));
        }
    }

    if let Some(expiry) = &filter.expiry {
        if !expiry.is_empty() {
            let placeholders = push_values(
                &mut values,
                expiry.iter().map(|e| Value::from(e.as_str().to_string())),
            );
            clauses.push(format!("expiry IN ({placeholders})"));
        }
    }

    if let Some(min) = filter.min_importance {
        values.push(Value::from(min));
        clauses.push(format!("importance >= ?{}", values.len()));
    }

    if let Some(since) = filter.since {
        values.push(Value::from(since.to_rfc3339()));
        clauses.push(format!("created_at >= ?{}", values.len()));
    }

    if let Some(platform) = &filter.platform {
        values.push(Value::from(platform.clone()));
        clauses.push(format!("platform = ?{}", values.len()));
    }

    if let Some(projects) = &filter.projects {
        if !projects.is_empty() {
            let placeholders =
                push_values(&mut values, projects.iter().map(|p| Value::from(p.clone())));
            if filter.strict_project {
                clauses.push(format!("project IN ({placeholders})"));
            } else {
                clauses.push(format!("(project IS NULL OR project IN ({placeholders}))"));
            }
        }
    }

    if let Some(excluded) = &filter.exclude_projects {
        if !excluded.is_empty() {
            let placeholders =
                push_values(&mut values, excluded.iter().map(|p| Value::from(p.clone())));
            clauses.push(format!(
                "(project IS NULL OR project NOT IN ({placeholders}))"
            ));
        }
    }

    if let Some(tags) = &filter.tags {
        if !tags.is_empty() {
            let placeholders = push_values(&mut values, tags.iter().map(|t| Value::from(t.clone())));
            clauses.push(format!(
                "EXISTS (SELECT 1 FROM tags t WHERE t.entry_id = entries.id AND t.tag IN ({placeholders}))"
            ));
        }
    }

    let mut sql = format!("SELECT {ENTRY_COLUMNS} FROM entries");
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY created_at DESC");
    if let Some(limit) = filter.limit {
        sql.push_str(&format!(" LIMIT {limit}"));
    }

    let mut stmt = conn.prepare(&sql)?;
    let mut entries = stmt
        .query_map(rusqlite::params_from_iter(values), map_entry_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    load_tags(conn, &mut entries)?;
    Ok(entries)
}

fn push_values(values: &mut Vec<Value>, items: impl Iterator<Item = Value>) -> String {
    let mut placeholders = Vec::new();
    for item in items {
        values.push(item);
        placeholders.push(format!("?{}", values.len()));
    }
    placeholders.join(", ")
}

/// FTS5 keyword search; returns `(entry_id, bm25_rank)`, best first
/// (bm25 is a cost, lower is better)
pub(crate) fn fts_search(
    conn: &Connection,
    raw_query: &str,
    limit: usize,
) -> Result<Vec<(String, f64)>> {
    let Some(match_expr) = sanitize_fts5_query(raw_query) else {
        return Ok(Vec::new());
    };

    let mut stmt = conn.prepare_cached(
        "SELECT e.id, bm25(entries_fts) AS rank
         FROM entries_fts
         JOIN entries e ON e.rowid = entries_fts.rowid
         WHERE entries_fts MATCH ?1
         ORDER BY rank
         LIMIT ?2",
    )?;
    let results = stmt
        .query_map(params![match_expr, limit as i64], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(results)
}

/// Highest `entries.rowid`, 0 when empty
pub(crate) fn max_rowid(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row("SELECT COALESCE(MAX(rowid), 0) FROM entries", [], |row| {
        row.get(0)
    })?)
}

/// Active entries with rowid beyond a watermark, importance floor, and
/// recency window; returns `(rowid, entry)` oldest first so the watermark
/// can advance monotonically
pub(crate) fn entries_since_rowid(
    conn: &Connection,
    after_rowid: i64,
    min_importance: i64,
    created_after: DateTime<Utc>,
    cap: usize,
) -> Result<Vec<(i64, StoredEntry)>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT rowid, {ENTRY_COLUMNS} FROM entries
         WHERE rowid > ?1 AND importance >= ?2 AND created_at >= ?3
           AND superseded_by IS NULL AND retired = 0
         ORDER BY rowid
         LIMIT ?4"
    ))?;
    let rows = stmt
        .query_map(
            params![after_rowid, min_importance, created_after, cap as i64],
            |row| {
                let rowid: i64 = row.get(0)?;
                // Shift the entry columns by one
                let entry = map_shifted_entry_row(row)?;
                Ok((rowid, entry))
            },
        )?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// [`map_entry_row`] for a SELECT with one leading extra column
fn map_shifted_entry_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredEntry> {
    let type_raw: String = row.get(2)?;
    let expiry_raw: String = row.get(8)?;
    let scope_raw: String = row.get(9)?;
    let intervals_raw: String = row.get(21)?;
    let suppressed_raw: String = row.get(26)?;

    Ok(StoredEntry {
        id: row.get(1)?,
        entry_type: EntryType::parse_name(&type_raw).map_err(|e| parse_error(2, e))?,
        subject: row.get(3)?,
        content: row.get(4)?,
        canonical_key: row.get(5)?,
        subject_key: row.get(6)?,
        importance: row.get(7)?,
        expiry: Expiry::parse_name(&expiry_raw).map_err(|e| parse_error(8, e))?,
        scope: Scope::parse_name(&scope_raw).map_err(|e| parse_error(9, e))?,
        platform: row.get(10)?,
        project: row.get(11)?,
        tags: Vec::new(),
        source_file: row.get(12)?,
        source_context: row.get(13)?,
        content_hash: row.get(14)?,
        created_at: row.get(15)?,
        updated_at: row.get(16)?,
        last_recalled_at: row.get(17)?,
        recall_count: row.get(18)?,
        confirmations: row.get(19)?,
        contradictions: row.get(20)?,
        recall_intervals: serde_json::from_str(&intervals_raw).map_err(|e| parse_error(21, e))?,
        superseded_by: row.get(22)?,
        retired: row.get::<_, i64>(23)? != 0,
        retired_at: row.get(24)?,
        retired_reason: row.get(25)?,
        suppressed_contexts: serde_json::from_str(&suppressed_raw)
            .map_err(|e| parse_error(26, e))?,
        has_embedding: row.get(27)?,
    })
}

// ============================================================================
// STORAGE WRAPPERS
// ============================================================================

/// Aggregate entry counts
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct StorageStats {
    /// All rows
    pub total_entries: i64,
    /// Neither superseded nor retired
    pub active_entries: i64,
    /// Retired rows
    pub retired_entries: i64,
    /// Superseded rows
    pub superseded_entries: i64,
    /// Relation edges
    pub relations: i64,
}

impl Storage {
    /// Insert a single entry outside a batch (handoff events, tests),
    /// maintaining both in-process indexes
    pub fn insert_single(
        &self,
        entry: &KnowledgeEntry,
        vector: Option<&[f32]>,
    ) -> Result<StoredEntry> {
        entry.validate()?;
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let created_at = entry.created_at.unwrap_or(now);
        let content_hash = entry.content_hash();

        self.write_transaction(false, |conn| {
            insert_entry(conn, entry, &id, &content_hash, vector, created_at, now)?;
            insert_tags(conn, &id, &entry.tags)?;
            Ok(())
        })?;

        if let Some(vector) = vector {
            self.vector_index_add(&id, vector)?;
        }
        if let Some(key) = entry.normalized_subject_key() {
            self.subject_index_add(&key, &id)?;
        }

        self.get_entry(&id)?
            .ok_or_else(|| StorageError::NotFound(id))
    }

    /// Fetch one entry with tags
    pub fn get_entry(&self, entry_id: &str) -> Result<Option<StoredEntry>> {
        self.with_reader(|conn| get_entry(conn, entry_id))
    }

    /// Active entry sharing `(subject, type, source_file)` created after
    /// `cutoff` - the dedup recency-guard probe
    pub fn find_recent_same_source(
        &self,
        subject: &str,
        entry_type: EntryType,
        source_file: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<Option<StoredEntry>> {
        self.with_reader(|conn| recent_same_source(conn, subject, entry_type, source_file, cutoff))
    }

    /// Any row with this content hash (active or not)
    pub fn find_by_content_hash(&self, content_hash: &str) -> Result<Option<StoredEntry>> {
        self.with_reader(|conn| entry_by_content_hash(conn, content_hash))
    }

    /// Active entries sharing a canonical key, newest first
    pub fn find_active_by_canonical_key(&self, canonical_key: &str) -> Result<Vec<StoredEntry>> {
        self.with_reader(|conn| active_by_canonical_key(conn, canonical_key))
    }

    /// Filtered scan, newest first
    pub fn entries(&self, filter: &EntryFilter) -> Result<Vec<StoredEntry>> {
        self.with_reader(|conn| select_entries(conn, filter))
    }

    /// Stored embedding for an entry
    pub fn embedding_of(&self, entry_id: &str) -> Result<Option<Vec<f32>>> {
        self.with_reader(|conn| get_embedding(conn, entry_id))
    }

    /// FTS5 keyword search over subject + content
    pub fn keyword_search(&self, query: &str, limit: usize) -> Result<Vec<(String, f64)>> {
        self.with_reader(|conn| fts_search(conn, query, limit))
    }

    /// Relations touching an entry
    pub fn relations_of(&self, entry_id: &str) -> Result<Vec<Relation>> {
        self.with_reader(|conn| relations_of(conn, entry_id))
    }

    /// Record a relation edge outside a batch
    pub fn add_relation(
        &self,
        source_id: &str,
        target_id: &str,
        relation_type: RelationType,
    ) -> Result<bool> {
        self.with_writer(|conn| insert_relation(conn, source_id, target_id, relation_type, Utc::now()))
    }

    /// Reinforce an entry (confirmation bump) outside a batch
    pub fn reinforce_entry(&self, entry_id: &str) -> Result<()> {
        self.with_writer(|conn| reinforce(conn, entry_id, Utc::now()))
    }

    /// Supersede `entry_id` with `superseded_by`, maintaining both indexes
    pub fn supersede_entry(&self, entry_id: &str, superseded_by: &str) -> Result<()> {
        let entry = self
            .get_entry(entry_id)?
            .ok_or_else(|| StorageError::NotFound(entry_id.to_string()))?;
        self.with_writer(|conn| set_superseded(conn, entry_id, superseded_by, Utc::now()))?;
        if let Some(key) = &entry.subject_key {
            self.subject_index_remove(key, entry_id)?;
        }
        self.vector_index_remove(entry_id)?;
        Ok(())
    }

    /// Retire an entry, maintaining both indexes
    pub fn retire_entry(&self, entry_id: &str, reason: &str) -> Result<StoredEntry> {
        let entry = self
            .get_entry(entry_id)?
            .ok_or_else(|| StorageError::NotFound(entry_id.to_string()))?;
        self.with_writer(|conn| set_retired(conn, entry_id, reason, Utc::now()))?;
        if let Some(key) = &entry.subject_key {
            self.subject_index_remove(key, entry_id)?;
        }
        self.vector_index_remove(entry_id)?;
        self.get_entry(entry_id)?
            .ok_or_else(|| StorageError::NotFound(entry_id.to_string()))
    }

    /// Suppress an entry in a recall context
    pub fn suppress_entry_context(&self, entry_id: &str, context: &str) -> Result<()> {
        self.with_writer(|conn| suppress_context(conn, entry_id, context, Utc::now()))
    }

    /// Atomic recall-metadata update for a result set
    pub fn update_recall_metadata(&self, entry_ids: &[String]) -> Result<()> {
        if entry_ids.is_empty() {
            return Ok(());
        }
        self.write_transaction(false, |conn| {
            update_recall_metadata(conn, entry_ids, Utc::now())
        })
    }

    /// Hard-delete entries (consolidator), maintaining both indexes
    pub fn delete_entries(&self, entry_ids: &[String]) -> Result<usize> {
        let mut victims = Vec::new();
        for id in entry_ids {
            if let Some(entry) = self.get_entry(id)? {
                victims.push(entry);
            }
        }

        let deleted = self.write_transaction(false, |conn| {
            let mut deleted = 0;
            for entry in &victims {
                if delete_entry(conn, &entry.id)? {
                    deleted += 1;
                }
            }
            Ok(deleted)
        })?;

        for entry in &victims {
            if let Some(key) = &entry.subject_key {
                self.subject_index_remove(key, &entry.id)?;
            }
            self.vector_index_remove(&entry.id)?;
        }
        Ok(deleted)
    }

    /// Aggregate counts
    pub fn stats(&self) -> Result<StorageStats> {
        self.with_reader(|conn| {
            let total: i64 = conn.query_row("SELECT COUNT(*) FROM entries", [], |r| r.get(0))?;
            let retired: i64 =
                conn.query_row("SELECT COUNT(*) FROM entries WHERE retired = 1", [], |r| {
                    r.get(0)
                })?;
            let superseded: i64 = conn.query_row(
                "SELECT COUNT(*) FROM entries WHERE superseded_by IS NOT NULL",
                [],
                |r| r.get(0),
            )?;
            let active: i64 = conn.query_row(
                "SELECT COUNT(*) FROM entries WHERE superseded_by IS NULL AND retired = 0",
                [],
                |r| r.get(0),
            )?;
            let relations: i64 =
                conn.query_row("SELECT COUNT(*) FROM relations", [], |r| r.get(0))?;
            Ok(StorageStats {
                total_entries: total,
                active_entries: active,
                retired_entries: retired,
                superseded_entries: superseded,
                relations,
            })
        })
    }

    /// Highest `entries.rowid`
    pub fn max_rowid(&self) -> Result<i64> {
        self.with_reader(max_rowid)
    }

    /// Active entries beyond a watermark with an importance floor and a
    /// recency window, oldest first as `(rowid, entry)`
    pub fn entries_since_rowid(
        &self,
        after_rowid: i64,
        min_importance: i64,
        created_after: DateTime<Utc>,
        cap: usize,
    ) -> Result<Vec<(i64, StoredEntry)>> {
        self.with_reader(|conn| {
            entries_since_rowid(conn, after_rowid, min_importance, created_after, cap)
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================
