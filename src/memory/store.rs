//! SQLite-backed memory store implementation.

use crate::embedding::{deserialize_embedding, serialize_embedding};
use crate::error::{Error, Result};
use crate::memory::schema::{initialize_schema, is_initialized};
use crate::memory::types::*;
use crate::retry::RetryPolicy;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info, warn};

const MEMORY_COLUMNS: &str = "id, content, embedding, tier, importance, tags, source_agent, metadata,
     chunk_type, turn_id, chunk_index, total_chunks, created_at, updated_at, access_count";

const FACT_COLUMNS: &str =
    "id, fact, embedding, source, verified_by, verified_at, confidence, metadata";

/// How long a connection waits on another writer's lock before reporting busy.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// How the store ended up being opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBacking {
    /// The database file opened normally.
    File,
    /// The file was unusable and has been replaced with an empty database.
    Recreated,
    /// Nothing could be opened on disk; data will not survive the process.
    InMemory,
}

/// SQLite-backed memory store.
#[derive(Clone)]
pub struct SqliteMemoryStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteMemoryStore {
    /// Open or create a memory store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_timeout(path, DEFAULT_BUSY_TIMEOUT)
    }

    /// Open or create a memory store, waiting up to `busy_timeout` for
    /// locks held by other connections.
    pub fn open_with_timeout(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self> {
        let conn = Connection::open(path).map_err(Error::from_sqlite)?;
        conn.busy_timeout(busy_timeout).map_err(Error::from_sqlite)?;

        if !is_initialized(&conn) {
            initialize_schema(&conn).map_err(Error::from_sqlite)?;
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory store (for testing, or as a last resort).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(Error::from_sqlite)?;
        initialize_schema(&conn).map_err(Error::from_sqlite)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open `path`, replacing an unreadable file with a fresh database and
    /// falling back to an in-memory store when the disk is unusable.
    ///
    /// A busy or locked database is retried under `retry` and never replaced;
    /// if it stays busy the error is returned and the file is left alone.
    pub fn open_with_fallback(
        path: impl AsRef<Path>,
        busy_timeout: Duration,
        retry: &RetryPolicy,
    ) -> Result<(Self, StoreBacking)> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!(path = %parent.display(), error = %e, "could not create database directory");
            }
        }

        match retry.run_blocking("open_store", || Self::open_with_timeout(path, busy_timeout)) {
            Ok(store) => return Ok((store, StoreBacking::File)),
            Err(e) if e.is_transient() => {
                error!(path = %path.display(), error = %e, "memory database stayed busy, leaving it in place");
                return Err(e);
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "failed to open memory database, creating fresh");
            }
        }

        let recreated = std::fs::remove_file(path)
            .or_else(|e| match e.kind() {
                std::io::ErrorKind::NotFound => Ok(()),
                _ => Err(e),
            })
            .map_err(|e| Error::MemoryStorage(e.to_string()))
            .and_then(|_| Self::open_with_timeout(path, busy_timeout));

        match recreated {
            Ok(store) => {
                info!(path = %path.display(), "recreated memory database");
                Ok((store, StoreBacking::Recreated))
            }
            Err(e) => {
                error!(error = %e, "could not create fresh database, using in-memory store");
                Ok((Self::in_memory()?, StoreBacking::InMemory))
            }
        }
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| Error::Internal(format!("Failed to lock connection: {}", e)))?;
        f(&conn).map_err(Error::from_sqlite)
    }

    fn with_conn_mut<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> rusqlite::Result<T>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| Error::Internal(format!("Failed to lock connection: {}", e)))?;
        f(&mut conn).map_err(Error::from_sqlite)
    }

    // ==================== Memory Operations ====================

    /// Insert a memory record.
    pub fn insert_memory(&self, record: &MemoryRecord) -> Result<()> {
        let tags = serde_json::to_string(&record.tags)?;
        let metadata = serde_json::to_string(&record.metadata)?;
        self.with_conn(|conn| insert_memory_row(conn, record, &tags, &metadata))
    }

    /// Get a memory by ID.
    pub fn get_memory(&self, id: &MemoryId) -> Result<Option<MemoryRecord>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {} FROM memories WHERE id = ?1", MEMORY_COLUMNS),
                params![id.as_str()],
                row_to_memory,
            )
            .optional()
        })
    }

    /// Delete a memory. Links referencing it are left in place.
    pub fn delete_memory(&self, id: &MemoryId) -> Result<bool> {
        self.with_conn(|conn| {
            let rows = conn.execute("DELETE FROM memories WHERE id = ?1", params![id.as_str()])?;
            Ok(rows > 0)
        })
    }

    /// Records eligible for similarity ranking: those with an embedding,
    /// optionally restricted to memories carrying any of `tags`.
    pub fn ranking_candidates(&self, tags: Option<&[String]>) -> Result<Vec<MemoryRecord>> {
        self.with_conn(|conn| {
            let mut sql = format!(
                "SELECT {} FROM memories WHERE embedding IS NOT NULL",
                MEMORY_COLUMNS
            );
            let tags = tags.filter(|t| !t.is_empty()).unwrap_or(&[]);
            if !tags.is_empty() {
                let placeholders = vec!["?"; tags.len()].join(",");
                sql.push_str(&format!(
                    " AND EXISTS (SELECT 1 FROM json_each(memories.tags) WHERE json_each.value IN ({}))",
                    placeholders
                ));
            }

            let mut stmt = conn.prepare(&sql)?;
            let records = stmt
                .query_map(params_from_iter(tags.iter()), row_to_memory)?
                .filter_map(|r| r.ok())
                .collect();
            Ok(records)
        })
    }

    /// The `limit` most recently created embeddings.
    pub fn recent_embeddings(&self, limit: usize) -> Result<Vec<(MemoryId, Vec<f32>)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, embedding FROM memories
                 WHERE embedding IS NOT NULL
                 ORDER BY created_at DESC, rowid DESC
                 LIMIT ?1",
            )?;
            let rows = stmt
                .query_map(params![limit as i64], |row| {
                    let id: String = row.get(0)?;
                    let blob: Vec<u8> = row.get(1)?;
                    Ok((MemoryId::from(id), deserialize_embedding(&blob)))
                })?
                .filter_map(|r| r.ok())
                .collect();
            Ok(rows)
        })
    }

    /// Raise importance (capped at 1.0) and count an access.
    pub fn boost_importance(&self, id: &MemoryId, delta: f64) -> Result<bool> {
        let now = format_ts(Utc::now());
        self.with_conn(|conn| {
            let rows = conn.execute(
                "UPDATE memories SET importance = MIN(importance + ?1, 1.0),
                     updated_at = ?2, access_count = access_count + 1
                 WHERE id = ?3",
                params![delta, now, id.as_str()],
            )?;
            Ok(rows > 0)
        })
    }

    /// Shift importance by `delta`, clamped to `[0, 1]`.
    pub fn adjust_importance(&self, id: &MemoryId, delta: f64) -> Result<bool> {
        let now = format_ts(Utc::now());
        self.with_conn(|conn| {
            let rows = conn.execute(
                "UPDATE memories SET importance = MAX(0.0, MIN(importance + ?1, 1.0)),
                     updated_at = ?2
                 WHERE id = ?3",
                params![delta, now, id.as_str()],
            )?;
            Ok(rows > 0)
        })
    }

    /// Increment access counts and refresh `updated_at` for each id.
    pub fn record_access(&self, ids: &[MemoryId]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let now = format_ts(Utc::now());
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "UPDATE memories SET access_count = access_count + 1, updated_at = ?1
                     WHERE id = ?2",
                )?;
                for id in ids {
                    stmt.execute(params![now, id.as_str()])?;
                }
            }
            tx.commit()
        })
    }

    /// Memories whose content contains any token, case-insensitively.
    pub fn keyword_search(&self, tokens: &[String], limit: usize) -> Result<Vec<MemoryRecord>> {
        if tokens.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        self.with_conn(|conn| {
            let clause = vec!["instr(lower(content), ?) > 0"; tokens.len()].join(" OR ");
            let sql = format!(
                "SELECT {} FROM memories WHERE {} ORDER BY created_at DESC LIMIT {}",
                MEMORY_COLUMNS, clause, limit
            );
            let lowered: Vec<String> = tokens.iter().map(|t| t.to_lowercase()).collect();
            let mut stmt = conn.prepare(&sql)?;
            let records = stmt
                .query_map(params_from_iter(lowered.iter()), row_to_memory)?
                .filter_map(|r| r.ok())
                .collect();
            Ok(records)
        })
    }

    /// Short-term memories created before `cutoff`, in insertion order.
    pub fn short_term_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<MemoryRecord>> {
        let cutoff = format_ts(cutoff);
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM memories
                 WHERE tier = 'short_term' AND created_at < ?1
                 ORDER BY rowid",
                MEMORY_COLUMNS
            ))?;
            let records = stmt
                .query_map(params![cutoff], row_to_memory)?
                .filter_map(|r| r.ok())
                .collect();
            Ok(records)
        })
    }

    /// Atomically insert `summary`, link every member to it and delete the
    /// members. Nothing is written if any step fails.
    pub fn replace_cluster(&self, summary: &MemoryRecord, members: &[MemoryId]) -> Result<()> {
        let tags = serde_json::to_string(&summary.tags)?;
        let metadata = serde_json::to_string(&summary.metadata)?;
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            insert_memory_row(&tx, summary, &tags, &metadata)?;
            for member in members {
                insert_link_row(
                    &tx,
                    &MemoryLink::new(
                        member.clone(),
                        summary.id.clone(),
                        RelationType::ConsolidatedInto,
                        1.0,
                    ),
                )?;
                tx.execute("DELETE FROM memories WHERE id = ?1", params![member.as_str()])?;
            }
            tx.commit()
        })
    }

    /// Delete short-term memories with importance below `threshold`.
    pub fn prune_short_term(&self, threshold: f64) -> Result<usize> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM memories WHERE tier = 'short_term' AND importance < ?1",
                params![threshold],
            )
        })
    }

    // ==================== Link Operations ====================

    /// Insert a link. Returns false if an identical link already exists.
    pub fn insert_link(&self, link: &MemoryLink) -> Result<bool> {
        self.with_conn(|conn| insert_link_row(conn, link).map(|rows| rows > 0))
    }

    /// All links with `id` at either end.
    pub fn links_for(&self, id: &MemoryId) -> Result<Vec<MemoryLink>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT memory_id_a, memory_id_b, relation_type, strength
                 FROM memory_links WHERE memory_id_a = ?1 OR memory_id_b = ?1
                 ORDER BY rowid",
            )?;
            let links = stmt
                .query_map(params![id.as_str()], |row| {
                    Ok(MemoryLink {
                        memory_id_a: MemoryId::from(row.get::<_, String>(0)?),
                        memory_id_b: MemoryId::from(row.get::<_, String>(1)?),
                        relation_type: RelationType::parse(&row.get::<_, String>(2)?),
                        strength: row.get(3)?,
                    })
                })?
                .filter_map(|r| r.ok())
                .collect();
            Ok(links)
        })
    }

    // ==================== Knowledge Operations ====================

    /// Insert a knowledge fact.
    pub fn insert_fact(&self, fact: &KnowledgeFact) -> Result<()> {
        let metadata = serde_json::to_string(&fact.metadata)?;
        self.with_conn(|conn| {
            conn.execute(
                &format!(
                    "INSERT INTO knowledge_cache ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    FACT_COLUMNS
                ),
                params![
                    fact.id.as_str(),
                    fact.fact,
                    fact.embedding.as_deref().map(serialize_embedding),
                    fact.source_agent,
                    fact.verified_by,
                    format_ts(fact.verified_at),
                    fact.confidence,
                    metadata,
                ],
            )?;
            Ok(())
        })
    }

    /// Get a fact by ID.
    pub fn get_fact(&self, id: &FactId) -> Result<Option<KnowledgeFact>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {} FROM knowledge_cache WHERE id = ?1", FACT_COLUMNS),
                params![id.as_str()],
                row_to_fact,
            )
            .optional()
        })
    }

    /// The `limit` most recently verified facts that have an embedding.
    pub fn recent_facts(&self, limit: usize) -> Result<Vec<KnowledgeFact>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM knowledge_cache
                 WHERE embedding IS NOT NULL
                 ORDER BY verified_at DESC
                 LIMIT ?1",
                FACT_COLUMNS
            ))?;
            let facts = stmt
                .query_map(params![limit as i64], row_to_fact)?
                .filter_map(|r| r.ok())
                .collect();
            Ok(facts)
        })
    }

    /// Overwrite a fact's confidence.
    pub fn update_fact_confidence(&self, id: &FactId, confidence: f64) -> Result<bool> {
        self.with_conn(|conn| {
            let rows = conn.execute(
                "UPDATE knowledge_cache SET confidence = ?1 WHERE id = ?2",
                params![confidence, id.as_str()],
            )?;
            Ok(rows > 0)
        })
    }

    // ==================== Stats ====================

    /// Get statistics about the memory store.
    pub fn stats(&self) -> Result<MemoryStats> {
        self.with_conn(|conn| {
            let count = |sql: &str| conn.query_row(sql, [], |row| row.get::<_, i64>(0));

            Ok(MemoryStats {
                total_memories: count("SELECT COUNT(*) FROM memories")? as u64,
                short_term: count("SELECT COUNT(*) FROM memories WHERE tier = 'short_term'")?
                    as u64,
                long_term: count("SELECT COUNT(*) FROM memories WHERE tier = 'long_term'")? as u64,
                without_embedding: count("SELECT COUNT(*) FROM memories WHERE embedding IS NULL")?
                    as u64,
                total_links: count("SELECT COUNT(*) FROM memory_links")? as u64,
                total_facts: count("SELECT COUNT(*) FROM knowledge_cache")? as u64,
            })
        })
    }
}

#[cfg(test)]
impl SqliteMemoryStore {
    /// Run arbitrary SQL against the underlying connection.
    pub(crate) fn execute_raw(&self, sql: &str) -> Result<()> {
        self.with_conn(|conn| conn.execute_batch(sql))
    }
}

fn insert_memory_row(
    conn: &Connection,
    record: &MemoryRecord,
    tags: &str,
    metadata: &str,
) -> rusqlite::Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO memories ({}) VALUES
             (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            MEMORY_COLUMNS
        ),
        params![
            record.id.as_str(),
            record.content,
            record.embedding.as_deref().map(serialize_embedding),
            record.tier.to_string(),
            record.importance,
            tags,
            record.source_agent,
            metadata,
            record.chunk_type.to_string(),
            record.turn_id.as_str(),
            record.chunk_index,
            record.total_chunks,
            format_ts(record.created_at),
            format_ts(record.updated_at),
            record.access_count as i64,
        ],
    )?;
    Ok(())
}

fn insert_link_row(conn: &Connection, link: &MemoryLink) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT OR IGNORE INTO memory_links (memory_id_a, memory_id_b, relation_type, strength)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            link.memory_id_a.as_str(),
            link.memory_id_b.as_str(),
            link.relation_type.to_string(),
            link.strength,
        ],
    )
}

fn row_to_memory(row: &rusqlite::Row) -> rusqlite::Result<MemoryRecord> {
    let embedding = row
        .get::<_, Option<Vec<u8>>>(2)?
        .map(|bytes| deserialize_embedding(&bytes));

    let tags: Vec<String> = row
        .get::<_, Option<String>>(5)?
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default();

    Ok(MemoryRecord {
        id: MemoryId::from(row.get::<_, String>(0)?),
        content: row.get(1)?,
        embedding,
        tier: Tier::parse(&row.get::<_, String>(3)?),
        importance: row.get(4)?,
        tags,
        source_agent: row.get(6)?,
        metadata: parse_metadata(row.get(7)?),
        chunk_type: ChunkType::parse(&row.get::<_, String>(8)?),
        turn_id: TurnId::from(row.get::<_, String>(9)?),
        chunk_index: row.get(10)?,
        total_chunks: row.get(11)?,
        created_at: parse_datetime(row.get::<_, String>(12)?),
        updated_at: parse_datetime(row.get::<_, String>(13)?),
        access_count: row.get::<_, i64>(14)?.max(0) as u64,
    })
}

fn row_to_fact(row: &rusqlite::Row) -> rusqlite::Result<KnowledgeFact> {
    Ok(KnowledgeFact {
        id: FactId::from(row.get::<_, String>(0)?),
        fact: row.get(1)?,
        embedding: row
            .get::<_, Option<Vec<u8>>>(2)?
            .map(|bytes| deserialize_embedding(&bytes)),
        source_agent: row.get(3)?,
        verified_by: row.get(4)?,
        verified_at: parse_datetime(row.get::<_, String>(5)?),
        confidence: row.get(6)?,
        metadata: parse_metadata(row.get(7)?),
    })
}

/// Malformed or missing metadata reads as an empty map.
fn parse_metadata(raw: Option<String>) -> HashMap<String, Value> {
    raw.and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default()
}

/// Fixed-width UTC timestamps so that string order matches time order.
pub(crate) fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_datetime(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
