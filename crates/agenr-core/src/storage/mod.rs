//! Storage Module
//!
//! SQLite-backed storage with:
//! - FTS5 full-text search over subject + content
//! - Embedding vectors in the `embedding` column, mirrored into an
//!   in-process HNSW index
//! - An in-process subject-key index over active entries
//!
//! Uses separate reader/writer connections behind mutexes so all methods
//! take `&self` and `Storage` is `Send + Sync`. Writers are expected to be
//! serialized by the write queue; the mutexes are the last line of defense,
//! not the scheduling mechanism.

mod entries;
mod export;
mod logs;
mod retire;
pub mod schema;

pub use entries::{EntryFilter, Relation, StorageStats};
pub use export::{ExportFile, ExportedRelation};
pub use logs::{ConflictLogRow, ConflictResolution, IngestLogRow};
pub use retire::{RetirementLedger, RetirementRecord};

// Row-level helpers the store pipeline uses inside its batch transaction
pub(crate) use entries::{
    add_contradiction as add_contradiction_row, insert_entry as insert_entry_row,
    insert_relation as insert_relation_row, insert_tags as insert_tags_rows,
    reinforce as reinforce_row, set_retired as set_retired_row,
    set_superseded as set_superseded_row,
};
pub(crate) use logs::{
    append_ingest_log as append_ingest_log_row, insert_conflict as insert_conflict_row,
};

use std::path::{Path, PathBuf};
use std::sync::{Mutex, Once};

use rusqlite::{Connection, OpenFlags};

use crate::embedding::{Embedding, EmbeddingError};
use crate::memory::EntryError;
use crate::search::{VectorIndex, VectorIndexConfig, VectorSearchError};
use crate::subject::SubjectIndex;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Storage error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// JSON (de)serialization error
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    /// Embedding provider or shape error
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),
    /// Wire-boundary validation error
    #[error(transparent)]
    Validation(#[from] EntryError),
    /// Vector index error
    #[error(transparent)]
    Vector(#[from] VectorSearchError),
    /// Entry not found
    #[error("entry not found: {0}")]
    NotFound(String),
    /// Initialization error
    #[error("initialization error: {0}")]
    Init(String),
    /// A mutex was poisoned by a panicking holder
    #[error("lock poisoned: {0}")]
    LockPoisoned(&'static str),
}

/// Storage result type
pub type Result<T> = std::result::Result<T, StorageError>;

// ============================================================================
// STORAGE
// ============================================================================

static VECTOR_CORRUPTION_WARNING: Once = Once::new();

/// Warn once per process that the vector data needs a rebuild
pub(crate) fn warn_vector_corruption(detail: &str) {
    VECTOR_CORRUPTION_WARNING.call_once(|| {
        tracing::warn!(
            "vector index appears corrupt ({detail}); run rebuild-index to recreate it from the embedding column"
        );
    });
}

/// SQLite storage with integrated vector and subject indexes
pub struct Storage {
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
    vector_index: Mutex<VectorIndex>,
    subject_index: Mutex<SubjectIndex>,
    dimensions: usize,
    file_backed: bool,
    path: Option<PathBuf>,
}

impl Storage {
    /// Open (or create) a file-backed database and bring it to the current
    /// schema version
    pub fn open(path: impl AsRef<Path>, dimensions: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let writer = Connection::open(&path)?;
        Self::configure_connection(&writer, true)?;
        schema::apply_migrations(&writer)?;

        let reader = Connection::open(&path)?;
        Self::configure_connection(&reader, true)?;

        let storage = Self::assemble(writer, reader, dimensions, true, Some(path))?;
        storage.startup_quick_check();
        storage.rebuild_vector_index()?;
        Ok(storage)
    }

    /// Open an isolated in-memory database (tests, dry runs)
    ///
    /// Uses a shared-cache URI so the reader and writer connections see the
    /// same data. `busy_timeout` and `wal_autocheckpoint` are skipped - they
    /// only mean something for a file.
    pub fn open_in_memory(dimensions: usize) -> Result<Self> {
        let uri = format!(
            "file:agenr-mem-{}?mode=memory&cache=shared",
            uuid::Uuid::new_v4()
        );
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let writer = Connection::open_with_flags(&uri, flags)?;
        Self::configure_connection(&writer, false)?;
        schema::apply_migrations(&writer)?;

        let reader = Connection::open_with_flags(&uri, flags)?;
        Self::configure_connection(&reader, false)?;

        Self::assemble(writer, reader, dimensions, false, None)
    }

    fn assemble(
        writer: Connection,
        reader: Connection,
        dimensions: usize,
        file_backed: bool,
        path: Option<PathBuf>,
    ) -> Result<Self> {
        let vector_index = VectorIndex::new(VectorIndexConfig::with_dimensions(dimensions))
            .map_err(|e| StorageError::Init(format!("failed to create vector index: {e}")))?;

        Ok(Self {
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
            vector_index: Mutex::new(vector_index),
            subject_index: Mutex::new(SubjectIndex::new()),
            dimensions,
            file_backed,
            path,
        })
    }

    /// Apply connection PRAGMAs
    fn configure_connection(conn: &Connection, file_backed: bool) -> Result<()> {
        if file_backed {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA busy_timeout = 3000;
                 PRAGMA wal_autocheckpoint = 1000;
                 PRAGMA cache_size = -32000;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = ON;",
            )?;
        } else {
            conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        }
        Ok(())
    }

    /// Embedding dimensionality this database was opened with
    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Database file path, when file-backed
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// `PRAGMA quick_check` on startup; corruption warns once per process
    fn startup_quick_check(&self) {
        let result: Result<String> = self.with_reader(|conn| {
            Ok(conn.query_row("PRAGMA quick_check(1)", [], |row| row.get(0))?)
        });
        match result {
            Ok(verdict) if verdict == "ok" => {}
            Ok(verdict) => warn_vector_corruption(&verdict),
            Err(e) => warn_vector_corruption(&e.to_string()),
        }
    }

    // ========================================================================
    // CONNECTION ACCESS
    // ========================================================================

    /// Run a read-only closure on the reader connection
    pub(crate) fn with_reader<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self
            .reader
            .lock()
            .map_err(|_| StorageError::LockPoisoned("reader"))?;
        f(&conn)
    }

    /// Run a closure on the writer connection (no transaction)
    pub(crate) fn with_writer<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self
            .writer
            .lock()
            .map_err(|_| StorageError::LockPoisoned("writer"))?;
        f(&conn)
    }

    /// Run a closure inside a single write transaction
    ///
    /// Commits on Ok, rolls back on Err. With `dry_run` the transaction
    /// always rolls back, but the closure's result is still returned.
    pub fn write_transaction<T>(
        &self,
        dry_run: bool,
        f: impl FnOnce(&Connection) -> Result<T>,
    ) -> Result<T> {
        let conn = self
            .writer
            .lock()
            .map_err(|_| StorageError::LockPoisoned("writer"))?;
        conn.execute_batch("BEGIN IMMEDIATE;")?;
        match f(&conn) {
            Ok(value) => {
                if dry_run {
                    conn.execute_batch("ROLLBACK;")?;
                } else {
                    conn.execute_batch("COMMIT;")?;
                }
                Ok(value)
            }
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK;");
                Err(e)
            }
        }
    }

    /// Truncate the WAL; no-op for in-memory databases
    pub fn wal_checkpoint(&self) -> Result<()> {
        if !self.file_backed {
            return Ok(());
        }
        self.with_writer(|conn| {
            conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
            Ok(())
        })
    }

    /// Reclaim space after bulk deletes
    pub fn vacuum(&self) -> Result<()> {
        self.with_writer(|conn| {
            conn.execute_batch("VACUUM;")?;
            Ok(())
        })
    }

    /// Drop all user objects and re-run migrations, then rebuild both
    /// in-process indexes
    pub fn reset(&self) -> Result<()> {
        self.with_writer(|conn| {
            schema::reset(conn)?;
            Ok(())
        })?;
        self.rebuild_vector_index()?;
        self.rebuild_subject_index()?;
        Ok(())
    }

    // ========================================================================
    // VECTOR INDEX
    // ========================================================================

    /// Drop and recreate the ANN index from the `embedding` column of
    /// active entries; returns how many vectors were indexed
    pub fn rebuild_vector_index(&self) -> Result<usize> {
        let rows = self.with_reader(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, embedding FROM entries
                 WHERE embedding IS NOT NULL AND superseded_by IS NULL AND retired = 0",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;

        let mut index = self
            .vector_index
            .lock()
            .map_err(|_| StorageError::LockPoisoned("vector index"))?;
        index.clear()?;

        let mut indexed = 0;
        for (id, bytes) in rows {
            match Embedding::from_bytes(&bytes) {
                Some(embedding) if embedding.dimensions() == self.dimensions => {
                    index.add(&id, &embedding.vector)?;
                    indexed += 1;
                }
                _ => warn_vector_corruption(&format!("undecodable embedding for entry {id}")),
            }
        }

        tracing::info!("vector index rebuilt with {indexed} vectors");
        Ok(indexed)
    }

    /// Top-`limit` active entry ids by cosine similarity
    pub fn vector_search(&self, query: &[f32], limit: usize) -> Result<Vec<(String, f32)>> {
        let index = self
            .vector_index
            .lock()
            .map_err(|_| StorageError::LockPoisoned("vector index"))?;
        Ok(index.search(query, limit)?)
    }

    /// Add or replace a vector in the ANN index
    pub(crate) fn vector_index_add(&self, entry_id: &str, vector: &[f32]) -> Result<()> {
        let mut index = self
            .vector_index
            .lock()
            .map_err(|_| StorageError::LockPoisoned("vector index"))?;
        index.add(entry_id, vector)?;
        Ok(())
    }

    /// Remove a vector from the ANN index
    pub(crate) fn vector_index_remove(&self, entry_id: &str) -> Result<()> {
        let mut index = self
            .vector_index
            .lock()
            .map_err(|_| StorageError::LockPoisoned("vector index"))?;
        index.remove(entry_id)?;
        Ok(())
    }

    // ========================================================================
    // SUBJECT INDEX
    // ========================================================================

    /// Rebuild the subject index from active entries; returns distinct keys
    pub fn rebuild_subject_index(&self) -> Result<usize> {
        let pairs = self.with_reader(entries::active_subject_pairs)?;
        let mut index = self
            .subject_index
            .lock()
            .map_err(|_| StorageError::LockPoisoned("subject index"))?;
        index.rebuild(pairs);
        Ok(index.len())
    }

    fn ensure_subject_index(&self) -> Result<()> {
        let needs_build = {
            let index = self
                .subject_index
                .lock()
                .map_err(|_| StorageError::LockPoisoned("subject index"))?;
            !index.is_built()
        };
        if needs_build {
            self.rebuild_subject_index()?;
        }
        Ok(())
    }

    /// Exact subject-key lookup over active entries
    pub fn subject_lookup(&self, key: &str) -> Result<Vec<String>> {
        self.ensure_subject_index()?;
        let index = self
            .subject_index
            .lock()
            .map_err(|_| StorageError::LockPoisoned("subject index"))?;
        Ok(index.lookup(key))
    }

    /// Fuzzy subject-key lookup (same entity, overlapping attribute)
    pub fn subject_fuzzy_lookup(&self, key: &str, threshold: f64) -> Result<Vec<String>> {
        self.ensure_subject_index()?;
        let index = self
            .subject_index
            .lock()
            .map_err(|_| StorageError::LockPoisoned("subject index"))?;
        Ok(index.fuzzy_lookup(key, threshold))
    }

    /// Cross-entity subject-key lookup (same attribute, other entity)
    pub fn subject_cross_entity_lookup(&self, key: &str) -> Result<Vec<String>> {
        self.ensure_subject_index()?;
        let index = self
            .subject_index
            .lock()
            .map_err(|_| StorageError::LockPoisoned("subject index"))?;
        Ok(index.cross_entity_lookup(key))
    }

    pub(crate) fn subject_index_add(&self, key: &str, entry_id: &str) -> Result<()> {
        let mut index = self
            .subject_index
            .lock()
            .map_err(|_| StorageError::LockPoisoned("subject index"))?;
        if index.is_built() {
            index.add(key, entry_id);
        }
        Ok(())
    }

    pub(crate) fn subject_index_remove(&self, key: &str, entry_id: &str) -> Result<()> {
        let mut index = self
            .subject_index
            .lock()
            .map_err(|_| StorageError::LockPoisoned("subject index"))?;
        if index.is_built() {
            index.remove(key, entry_id);
        }
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_in_memory_shares_data() {
        let storage = Storage::open_in_memory(8).unwrap();
        storage
            .with_writer(|conn| {
                conn.execute(
                    "INSERT INTO entries (id, subject, content, content_hash, created_at, updated_at)
                     VALUES ('e1', 's', 'c', 'h', datetime('now'), datetime('now'))",
                    [],
                )?;
                Ok(())
            })
            .unwrap();

        let count: i64 = storage
            .with_reader(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM entries", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_open_file_backed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("knowledge.db");
        let storage = Storage::open(&path, 8).unwrap();
        assert_eq!(storage.dimensions(), 8);
        assert!(path.exists());

        let timeout: i64 = storage
            .with_reader(|conn| Ok(conn.query_row("PRAGMA busy_timeout", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(timeout, 3000);
    }

    #[test]
    fn test_write_transaction_rolls_back_on_error() {
        let storage = Storage::open_in_memory(8).unwrap();
        let result: Result<()> = storage.write_transaction(false, |conn| {
            conn.execute(
                "INSERT INTO entries (id, subject, content, content_hash, created_at, updated_at)
                 VALUES ('e1', 's', 'c', 'h', datetime('now'), datetime('now'))",
                [],
            )?;
            Err(StorageError::Init("boom".into()))
        });
        assert!(result.is_err());

        let count: i64 = storage
            .with_reader(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM entries", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_dry_run_rolls_back_but_returns() {
        let storage = Storage::open_in_memory(8).unwrap();
        let value = storage
            .write_transaction(true, |conn| {
                conn.execute(
                    "INSERT INTO entries (id, subject, content, content_hash, created_at, updated_at)
                     VALUES ('e1', 's', 'c', 'h', datetime('now'), datetime('now'))",
                    [],
                )?;
                Ok(42)
            })
            .unwrap();
        assert_eq!(value, 42);

        let count: i64 = storage
            .with_reader(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM entries", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(count, 0);
    }
}
