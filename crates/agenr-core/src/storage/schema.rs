//! Schema & Migrations
//!
//! Idempotent schema initialization with a version stamp in `_meta`.
//! Migrations run inside `execute_batch` so multi-statement definitions
//! (FTS triggers) apply atomically per version.

use rusqlite::Connection;

/// A database migration
#[derive(Debug, Clone)]
pub struct Migration {
    /// Version number
    pub version: u32,
    /// Description
    pub description: &'static str,
    /// SQL to apply
    pub up: &'static str,
}

/// Migration definitions
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "Initial schema: entries, tags, relations, ingest log, FTS",
        up: MIGRATION_V1_UP,
    },
    Migration {
        version: 2,
        description: "Conflict log and signal watermarks",
        up: MIGRATION_V2_UP,
    },
    Migration {
        version: 3,
        description: "Retirement flags and per-context suppression",
        up: MIGRATION_V3_UP,
    },
];

/// V1: Initial schema
const MIGRATION_V1_UP: &str = r#"
CREATE TABLE IF NOT EXISTS entries (
    id TEXT PRIMARY KEY,
    type TEXT NOT NULL DEFAULT 'fact',
    subject TEXT NOT NULL,
    content TEXT NOT NULL,
    canonical_key TEXT,
    subject_key TEXT,
    importance INTEGER NOT NULL DEFAULT 7,
    expiry TEXT NOT NULL DEFAULT 'permanent',
    scope TEXT NOT NULL DEFAULT 'private',
    platform TEXT,
    project TEXT,
    source_file TEXT,
    source_context TEXT,
    content_hash TEXT NOT NULL,

    -- Embedding vector (little-endian f32 blob, fixed dimension per database)
    embedding BLOB,

    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    last_recalled_at TEXT,

    recall_count INTEGER NOT NULL DEFAULT 0,
    confirmations INTEGER NOT NULL DEFAULT 0,
    contradictions INTEGER NOT NULL DEFAULT 0,

    -- Unix-second recall timestamps, append-only JSON array
    recall_intervals TEXT NOT NULL DEFAULT '[]',

    superseded_by TEXT REFERENCES entries(id)
);

CREATE INDEX IF NOT EXISTS idx_entries_created ON entries(created_at);
CREATE INDEX IF NOT EXISTS idx_entries_importance ON entries(importance);
CREATE INDEX IF NOT EXISTS idx_entries_type ON entries(type);
CREATE INDEX IF NOT EXISTS idx_entries_expiry ON entries(expiry);
CREATE INDEX IF NOT EXISTS idx_entries_platform ON entries(platform);
CREATE INDEX IF NOT EXISTS idx_entries_project ON entries(project);
CREATE INDEX IF NOT EXISTS idx_entries_superseded ON entries(superseded_by);
CREATE INDEX IF NOT EXISTS idx_entries_subject_key ON entries(subject_key);
CREATE INDEX IF NOT EXISTS idx_entries_canonical_key ON entries(canonical_key);
CREATE INDEX IF NOT EXISTS idx_entries_content_hash ON entries(content_hash);

CREATE TABLE IF NOT EXISTS tags (
    entry_id TEXT NOT NULL REFERENCES entries(id) ON DELETE CASCADE,
    tag TEXT NOT NULL,
    UNIQUE(entry_id, tag)
);

CREATE INDEX IF NOT EXISTS idx_tags_tag ON tags(tag);

CREATE TABLE IF NOT EXISTS relations (
    source_id TEXT NOT NULL REFERENCES entries(id) ON DELETE CASCADE,
    target_id TEXT NOT NULL REFERENCES entries(id) ON DELETE CASCADE,
    relation_type TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE(source_id, target_id, relation_type)
);

CREATE INDEX IF NOT EXISTS idx_relations_source ON relations(source_id);
CREATE INDEX IF NOT EXISTS idx_relations_target ON relations(target_id);

CREATE TABLE IF NOT EXISTS ingest_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    file_path TEXT,
    content_hash TEXT,
    ingested_at TEXT NOT NULL,
    added INTEGER NOT NULL DEFAULT 0,
    updated INTEGER NOT NULL DEFAULT 0,
    skipped INTEGER NOT NULL DEFAULT 0,
    duration_ms INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_ingest_log_at ON ingest_log(ingested_at);

CREATE TABLE IF NOT EXISTS _meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

-- FTS5 over subject + content, kept in sync by triggers
CREATE VIRTUAL TABLE IF NOT EXISTS entries_fts USING fts5(
    subject, content,
    content='entries',
    content_rowid='rowid',
    tokenize='porter ascii'
);

CREATE TRIGGER IF NOT EXISTS entries_fts_ai AFTER INSERT ON entries BEGIN
    INSERT INTO entries_fts(rowid, subject, content)
    VALUES (NEW.rowid, NEW.subject, NEW.content);
END;

CREATE TRIGGER IF NOT EXISTS entries_fts_ad AFTER DELETE ON entries BEGIN
    INSERT INTO entries_fts(entries_fts, rowid, subject, content)
    VALUES ('delete', OLD.rowid, OLD.subject, OLD.content);
END;

CREATE TRIGGER IF NOT EXISTS entries_fts_au AFTER UPDATE ON entries BEGIN
    INSERT INTO entries_fts(entries_fts, rowid, subject, content)
    VALUES ('delete', OLD.rowid, OLD.subject, OLD.content);
    INSERT INTO entries_fts(rowid, subject, content)
    VALUES (NEW.rowid, NEW.subject, NEW.content);
END;

INSERT OR IGNORE INTO _meta (key, value) VALUES ('db_created_at', datetime('now'));
INSERT OR IGNORE INTO _meta (key, value) VALUES ('schema_version', '1');
UPDATE _meta SET value = '1' WHERE key = 'schema_version';
"#;

/// V2: Conflict log + signal watermarks
const MIGRATION_V2_UP: &str = r#"
CREATE TABLE IF NOT EXISTS conflict_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    entry_a TEXT NOT NULL,
    entry_b TEXT NOT NULL,
    relation TEXT NOT NULL,
    confidence REAL NOT NULL DEFAULT 0.0,
    resolution TEXT NOT NULL DEFAULT 'pending',
    created_at TEXT NOT NULL,
    resolved_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_conflict_log_resolution ON conflict_log(resolution);
CREATE INDEX IF NOT EXISTS idx_conflict_log_entries ON conflict_log(entry_a, entry_b);

-- Last entries.rowid surfaced to each signal consumer
CREATE TABLE IF NOT EXISTS signal_watermarks (
    consumer TEXT PRIMARY KEY,
    last_rowid INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL
);

UPDATE _meta SET value = '2' WHERE key = 'schema_version';
"#;

/// V3: Retirement + suppression
const MIGRATION_V3_UP: &str = r#"
ALTER TABLE entries ADD COLUMN retired INTEGER NOT NULL DEFAULT 0;
ALTER TABLE entries ADD COLUMN retired_at TEXT;
ALTER TABLE entries ADD COLUMN retired_reason TEXT;
ALTER TABLE entries ADD COLUMN suppressed_contexts TEXT NOT NULL DEFAULT '[]';

CREATE INDEX IF NOT EXISTS idx_entries_retired ON entries(retired);

UPDATE _meta SET value = '3' WHERE key = 'schema_version';
"#;

/// Current schema version from `_meta`; 0 when uninitialized
pub fn current_version(conn: &Connection) -> rusqlite::Result<u32> {
    conn.query_row(
        "SELECT CAST(value AS INTEGER) FROM _meta WHERE key = 'schema_version'",
        [],
        |row| row.get(0),
    )
    .or(Ok(0))
}

/// Apply pending migrations; returns how many were applied
pub fn apply_migrations(conn: &Connection) -> rusqlite::Result<u32> {
    let version = current_version(conn)?;
    let mut applied = 0;

    for migration in MIGRATIONS {
        if migration.version > version {
            tracing::info!(
                "applying migration v{}: {}",
                migration.version,
                migration.description
            );
            conn.execute_batch(migration.up)?;
            applied += 1;
        }
    }

    Ok(applied)
}

/// Drop every user table, index, and trigger, then re-run all migrations
///
/// FTS shadow tables go down with their virtual table, so they are filtered
/// out of the drop list; `DROP ... IF EXISTS` absorbs any ordering slack.
pub fn reset(conn: &Connection) -> rusqlite::Result<()> {
    let triggers: Vec<String> = collect_names(conn, "trigger")?;
    for name in triggers {
        conn.execute_batch(&format!("DROP TRIGGER IF EXISTS \"{name}\";"))?;
    }

    let tables: Vec<String> = collect_names(conn, "table")?
        .into_iter()
        .filter(|name| !is_fts_shadow(name))
        .collect();

    // Virtual table first so its shadow tables disappear with it
    if tables.iter().any(|t| t == "entries_fts") {
        conn.execute_batch("DROP TABLE IF EXISTS entries_fts;")?;
    }
    for name in tables.iter().filter(|t| t.as_str() != "entries_fts") {
        conn.execute_batch(&format!("DROP TABLE IF EXISTS \"{name}\";"))?;
    }

    apply_migrations(conn)?;
    conn.execute_batch("VACUUM;")?;
    Ok(())
}

fn collect_names(conn: &Connection, kind: &str) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master WHERE type = ?1 AND name NOT LIKE 'sqlite_%'",
    )?;
    let names = stmt
        .query_map([kind], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(names)
}

fn is_fts_shadow(name: &str) -> bool {
    name.starts_with("entries_fts_")
}

// ============================================================================
// TESTS
// ============================================================================
