//! SQLite schema and migrations for the memory store.

use rusqlite::{Connection, Result as SqliteResult};

/// Current schema version.
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema.
pub fn initialize_schema(conn: &Connection) -> SqliteResult<()> {
    // WAL lets readers proceed while another process writes
    conn.pragma_update(None, "journal_mode", "WAL")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    let current_version: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current_version < 1 {
        apply_v1_schema(conn)?;
    }

    Ok(())
}

/// Apply version 1 schema.
fn apply_v1_schema(conn: &Connection) -> SqliteResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS memories (
            id TEXT PRIMARY KEY,
            content TEXT NOT NULL,
            embedding BLOB,
            tier TEXT NOT NULL DEFAULT 'short_term',
            importance REAL NOT NULL DEFAULT 0.2,
            tags TEXT NOT NULL DEFAULT '[]',
            source_agent TEXT NOT NULL DEFAULT '',
            metadata TEXT,
            chunk_type TEXT NOT NULL DEFAULT 'agent_response',
            turn_id TEXT NOT NULL DEFAULT '',
            chunk_index INTEGER NOT NULL DEFAULT 0,
            total_chunks INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            access_count INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;

    // No foreign keys: links may outlive the records they reference
    conn.execute(
        "CREATE TABLE IF NOT EXISTS memory_links (
            memory_id_a TEXT NOT NULL,
            memory_id_b TEXT NOT NULL,
            relation_type TEXT NOT NULL,
            strength REAL NOT NULL DEFAULT 1.0,
            UNIQUE (memory_id_a, memory_id_b, relation_type)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS knowledge_cache (
            id TEXT PRIMARY KEY,
            fact TEXT NOT NULL,
            embedding BLOB,
            source TEXT NOT NULL,
            verified_by TEXT NOT NULL,
            verified_at TEXT NOT NULL,
            confidence REAL NOT NULL,
            metadata TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_memories_tier_created ON memories(tier, created_at)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_memories_created ON memories(created_at)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_links_a ON memory_links(memory_id_a)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_links_b ON memory_links(memory_id_b)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_knowledge_verified ON knowledge_cache(verified_at)",
        [],
    )?;

    conn.execute("INSERT INTO schema_version (version) VALUES (1)", [])?;

    Ok(())
}

/// Get the current schema version.
pub fn get_schema_version(conn: &Connection) -> SqliteResult<i32> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
}

/// Check if the schema is initialized.
pub fn is_initialized(conn: &Connection) -> bool {
    conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='memories'",
        [],
        |row| row.get::<_, i32>(0),
    )
    .map(|count| count > 0)
    .unwrap_or(false)
}
