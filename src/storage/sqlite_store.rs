//! SQLite backend with an FTS5 shadow index
//!
//! One connection per store behind a mutex, WAL journaling for readers
//! during a write, cached prepared statements. Embeddings are stored as
//! a `u32` little-endian count followed by little-endian `f32` values.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info, warn};

use super::{prepare_save, sync_semantic_index, MemoryStore, StorageKind, StorageStats};
use crate::core::entry::{sort_by_score, MemoryEntry, Operation, OperationLogEntry, SearchQuery, SearchResult};
use crate::core::error::{MemoryError, Result};
use crate::core::paths::ensure_parent_dir;
use crate::search::engine::field_score;
use crate::search::semantic::SemanticSearchEngine;

/// Result cap for full-text and substring queries without an explicit limit
pub const DEFAULT_SEARCH_LIMIT: usize = 50;

/// Floor score for substring hits that match no single field signal
const LIKE_MIN_SCORE: f64 = 0.1;

const COLUMNS: &str =
    "m.id, m.category, m.key, m.value, m.tags, m.created_at, m.updated_at, m.embedding, m.embedding_hash";

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = 10000;
PRAGMA temp_store = MEMORY;
PRAGMA mmap_size = 268435456;

CREATE TABLE IF NOT EXISTS memories (
    id TEXT PRIMARY KEY,
    category TEXT NOT NULL,
    key TEXT,
    value TEXT NOT NULL,
    tags TEXT NOT NULL DEFAULT '[]',
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    embedding BLOB,
    embedding_hash TEXT
);

CREATE INDEX IF NOT EXISTS idx_memories_category ON memories(category);
CREATE INDEX IF NOT EXISTS idx_memories_key ON memories(key) WHERE key IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_memories_created_at ON memories(created_at DESC);
CREATE INDEX IF NOT EXISTS idx_memories_updated_at ON memories(updated_at DESC);
CREATE INDEX IF NOT EXISTS idx_memories_embedding_hash ON memories(embedding_hash) WHERE embedding_hash IS NOT NULL;

CREATE TABLE IF NOT EXISTS operation_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp INTEGER NOT NULL,
    operation_id TEXT NOT NULL,
    operation TEXT NOT NULL,
    memory_key TEXT,
    memory_id TEXT,
    before_data TEXT,
    after_data TEXT,
    success BOOLEAN NOT NULL,
    error TEXT
);

CREATE INDEX IF NOT EXISTS idx_operation_logs_timestamp ON operation_logs(timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_operation_logs_operation ON operation_logs(operation);
CREATE INDEX IF NOT EXISTS idx_operation_logs_memory_id ON operation_logs(memory_id);
"#;

// External-content table: triggers must hand the old row back with the
// 'delete' command or the index keeps stale terms.
const FTS_SCHEMA: &str = r#"
CREATE VIRTUAL TABLE IF NOT EXISTS memories_fts USING fts5(
    id UNINDEXED,
    category,
    key,
    value,
    tags,
    content='memories',
    content_rowid='rowid',
    tokenize='unicode61 remove_diacritics 2'
);

CREATE TRIGGER IF NOT EXISTS memories_fts_insert AFTER INSERT ON memories BEGIN
    INSERT INTO memories_fts(rowid, id, category, key, value, tags)
    VALUES (new.rowid, new.id, new.category, new.key, new.value, new.tags);
END;

CREATE TRIGGER IF NOT EXISTS memories_fts_delete AFTER DELETE ON memories BEGIN
    INSERT INTO memories_fts(memories_fts, rowid, id, category, key, value, tags)
    VALUES ('delete', old.rowid, old.id, old.category, old.key, old.value, old.tags);
END;

CREATE TRIGGER IF NOT EXISTS memories_fts_update AFTER UPDATE ON memories BEGIN
    INSERT INTO memories_fts(memories_fts, rowid, id, category, key, value, tags)
    VALUES ('delete', old.rowid, old.id, old.category, old.key, old.value, old.tags);
    INSERT INTO memories_fts(rowid, id, category, key, value, tags)
    VALUES (new.rowid, new.id, new.category, new.key, new.value, new.tags);
END;
"#;

lazy_static! {
    static ref FTS_TOKEN: Regex = Regex::new(r"[\p{L}\p{N}_]+").unwrap();
}

pub struct SqliteMemoryStore {
    conn: Mutex<Connection>,
    fts_enabled: bool,
    semantic: RwLock<Option<Arc<SemanticSearchEngine>>>,
}

impl SqliteMemoryStore {
    /// Open or create the database file and its schema
    pub fn open(path: &Path) -> Result<Self> {
        ensure_parent_dir(path)?;
        let conn = Connection::open(path)?;
        let store = Self::init(conn)?;
        info!("SQLite store opened at {}", path.display());
        Ok(store)
    }

    /// Private in-memory database
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)
            .map_err(|e| MemoryError::persistence(format!("failed to initialize schema: {}", e)))?;

        let fts_enabled = match init_fts(&conn) {
            Ok(()) => true,
            Err(e) => {
                warn!("FTS5 unavailable, using substring search: {}", e);
                false
            }
        };

        Ok(Self {
            conn: Mutex::new(conn),
            fts_enabled,
            semantic: RwLock::new(None),
        })
    }

    pub fn fts_enabled(&self) -> bool {
        self.fts_enabled
    }

    /// Number of stored entries
    pub fn count(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM memories", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    /// Save keeping the entry's own `created_at`/`updated_at` for new rows
    pub fn import(&self, entry: MemoryEntry) -> Result<String> {
        self.write(entry, false)
    }

    fn write(&self, entry: MemoryEntry, touch: bool) -> Result<String> {
        let key = entry.key.clone();
        let mut conn = self.conn.lock();

        match upsert(&mut conn, entry, touch) {
            Ok((operation, before, saved)) => {
                record(&conn, &OperationLogEntry::succeeded(operation, before.as_ref(), Some(&saved)));
                drop(conn);
                sync_semantic_index(self.semantic_engine(), &saved);
                debug!("Saved memory {} ({})", saved.id, operation);
                Ok(saved.id)
            }
            Err(e) => {
                record(&conn, &OperationLogEntry::failed(Operation::Save, &key, &e));
                Err(e)
            }
        }
    }

    fn remove(&self, column: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock();
        let existing = query_one(&conn, column, value)?.ok_or_else(|| MemoryError::not_found(value))?;

        if let Err(e) = conn
            .prepare_cached("DELETE FROM memories WHERE id = ?1")
            .and_then(|mut stmt| stmt.execute(params![existing.id]))
        {
            let e = MemoryError::from(e);
            record(&conn, &OperationLogEntry::failed(Operation::Delete, &existing.key, &e));
            return Err(e);
        }

        record(&conn, &OperationLogEntry::succeeded(Operation::Delete, Some(&existing), None));
        drop(conn);

        if let Some(engine) = self.semantic_engine() {
            engine.remove_embedding(&existing.id);
        }
        debug!("Deleted memory {}", existing.id);
        Ok(())
    }

    /// Ranked FTS5 hits, or `None` when the query has no indexable tokens
    fn fts_search(&self, query: &SearchQuery) -> Result<Option<Vec<SearchResult>>> {
        let Some(expression) = fts_expression(&query.query) else {
            return Ok(None);
        };
        let limit = query.limit.unwrap_or(DEFAULT_SEARCH_LIMIT) as i64;
        let category = query.category();

        let sql = format!(
            "SELECT {}, fts.rank FROM memories_fts fts JOIN memories m ON m.rowid = fts.rowid \
             WHERE memories_fts MATCH ?1 AND (?2 = '' OR m.category = ?2) \
             ORDER BY fts.rank LIMIT ?3",
            COLUMNS
        );

        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(params![expression, category, limit], |row| {
            Ok((row_to_entry(row)?, row.get::<_, f64>(9)?))
        })?;

        let mut hits = Vec::new();
        for row in rows {
            hits.push(row?);
        }
        Ok(Some(rank_to_scores(hits)))
    }

    fn like_search(&self, query: &SearchQuery) -> Result<Vec<SearchResult>> {
        let pattern = like_pattern(query.query.trim());
        let limit = query.limit.unwrap_or(DEFAULT_SEARCH_LIMIT) as i64;

        let sql = format!(
            r"SELECT {} FROM memories m
              WHERE (m.value LIKE ?1 ESCAPE '\' OR m.key LIKE ?1 ESCAPE '\'
                     OR m.category LIKE ?1 ESCAPE '\' OR m.tags LIKE ?1 ESCAPE '\')
                AND (?2 = '' OR m.category = ?2)
              ORDER BY m.updated_at DESC LIMIT ?3",
            COLUMNS
        );

        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(params![pattern, query.category(), limit], row_to_entry)?;

        let normalized = query.normalized();
        let mut results = Vec::new();
        for row in rows {
            let entry = row?;
            let score = field_score(&entry, &normalized).max(LIKE_MIN_SCORE);
            results.push(SearchResult::new(entry, score));
        }

        sort_by_score(&mut results);
        Ok(results)
    }
}

impl MemoryStore for SqliteMemoryStore {
    fn kind(&self) -> StorageKind {
        StorageKind::Sqlite
    }

    fn save(&self, entry: MemoryEntry) -> Result<String> {
        self.write(entry, true)
    }

    fn get(&self, key: &str) -> Result<MemoryEntry> {
        if key.is_empty() {
            return Err(MemoryError::not_found(key));
        }
        let conn = self.conn.lock();
        query_one(&conn, "key", key)?.ok_or_else(|| MemoryError::not_found(key))
    }

    fn get_by_id(&self, id: &str) -> Result<MemoryEntry> {
        let conn = self.conn.lock();
        query_one(&conn, "id", id)?.ok_or_else(|| MemoryError::not_found(id))
    }

    fn list(&self, category: &str) -> Result<Vec<MemoryEntry>> {
        let sql = if category.is_empty() {
            format!("SELECT {} FROM memories m ORDER BY m.created_at DESC", COLUMNS)
        } else {
            format!("SELECT {} FROM memories m WHERE m.category = ?1 ORDER BY m.created_at DESC", COLUMNS)
        };

        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = if category.is_empty() {
            stmt.query_map([], row_to_entry)?.collect::<rusqlite::Result<Vec<_>>>()?
        } else {
            stmt.query_map(params![category], row_to_entry)?
                .collect::<rusqlite::Result<Vec<_>>>()?
        };
        Ok(rows)
    }

    fn search(&self, query: &SearchQuery) -> Result<Vec<SearchResult>> {
        if let Some(engine) = self.semantic_engine() {
            return engine.search(self, query);
        }

        if query.is_match_all() {
            let all = self
                .list(query.category())?
                .into_iter()
                .map(|entry| SearchResult::new(entry, 1.0))
                .collect();
            return Ok(query.finish(all));
        }

        if self.fts_enabled {
            match self.fts_search(query) {
                Ok(Some(results)) => return Ok(query.finish(results)),
                Ok(None) => {}
                Err(e) => warn!("FTS5 search failed, falling back to substring search: {}", e),
            }
        }

        Ok(query.finish(self.like_search(query)?))
    }

    fn delete(&self, key: &str) -> Result<()> {
        if key.is_empty() {
            return Err(MemoryError::not_found(key));
        }
        self.remove("key", key)
    }

    fn delete_by_id(&self, id: &str) -> Result<()> {
        self.remove("id", id)
    }

    fn log_operation(&self, entry: &OperationLogEntry) -> Result<()> {
        let conn = self.conn.lock();
        insert_log(&conn, entry)
    }

    fn set_semantic_engine(&self, engine: Arc<SemanticSearchEngine>) {
        *self.semantic.write() = Some(engine);
    }

    fn semantic_engine(&self) -> Option<Arc<SemanticSearchEngine>> {
        self.semantic.read().clone()
    }

    fn semantic_stats(&self) -> Result<StorageStats> {
        let (total, with_embeddings) = {
            let conn = self.conn.lock();
            let total: i64 = conn.query_row("SELECT COUNT(*) FROM memories", [], |row| row.get(0))?;
            let with_embeddings: i64 = conn.query_row(
                "SELECT COUNT(*) FROM memories WHERE embedding IS NOT NULL AND length(embedding) > 0",
                [],
                |row| row.get(0),
            )?;
            (total as usize, with_embeddings as usize)
        };

        let engine = self.semantic_engine();
        Ok(StorageStats::new(self.kind(), engine.as_deref(), total, with_embeddings))
    }
}

fn init_fts(conn: &Connection) -> Result<()> {
    let existed: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'memories_fts'",
        [],
        |row| row.get(0),
    )?;

    conn.execute_batch(FTS_SCHEMA)?;

    // Rows written before the index existed
    if existed == 0 {
        conn.execute("INSERT INTO memories_fts(memories_fts) VALUES ('rebuild')", [])?;
    }
    Ok(())
}

fn upsert(
    conn: &mut Connection,
    entry: MemoryEntry,
    touch: bool,
) -> Result<(Operation, Option<MemoryEntry>, MemoryEntry)> {
    let tx = conn.transaction()?;

    let existing = match (entry.key.is_empty(), entry.id.is_empty()) {
        (false, _) => match query_one(&tx, "key", &entry.key)? {
            Some(found) => Some(found),
            None if !entry.id.is_empty() => query_one(&tx, "id", &entry.id)?,
            None => None,
        },
        (true, false) => query_one(&tx, "id", &entry.id)?,
        (true, true) => None,
    };

    let (operation, saved) = prepare_save(entry, existing.as_ref(), touch);
    let tags = serde_json::to_string(&saved.tags)?;
    let key = (!saved.key.is_empty()).then_some(saved.key.as_str());
    let embedding = saved.embedding.as_deref().filter(|e| !e.is_empty()).map(encode_embedding);
    let created_at = to_nanos(saved.created_at)?;
    let updated_at = to_nanos(saved.updated_at)?;

    match operation {
        Operation::Update => {
            tx.prepare_cached(
                "UPDATE memories SET category = ?1, key = ?2, value = ?3, tags = ?4, created_at = ?5, \
                 updated_at = ?6, embedding = ?7, embedding_hash = ?8 WHERE id = ?9",
            )?
            .execute(params![
                saved.category,
                key,
                saved.value,
                tags,
                created_at,
                updated_at,
                embedding,
                saved.embedding_hash,
                saved.id,
            ])?;
        }
        _ => {
            tx.prepare_cached(
                "INSERT INTO memories (id, category, key, value, tags, created_at, updated_at, embedding, embedding_hash) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?
            .execute(params![
                saved.id,
                saved.category,
                key,
                saved.value,
                tags,
                created_at,
                updated_at,
                embedding,
                saved.embedding_hash,
            ])?;
        }
    }

    tx.commit()?;
    Ok((operation, existing, saved))
}

fn query_one(conn: &Connection, column: &str, value: &str) -> Result<Option<MemoryEntry>> {
    let sql = format!("SELECT {} FROM memories m WHERE m.{} = ?1 LIMIT 1", COLUMNS, column);
    let entry = conn
        .prepare_cached(&sql)?
        .query_row(params![value], row_to_entry)
        .optional()?;
    Ok(entry)
}

/// Best-effort log append; failures never undo the mutation
fn record(conn: &Connection, log: &OperationLogEntry) {
    if let Err(e) = insert_log(conn, log) {
        warn!("Failed to log {} operation: {}", log.operation, e);
    }
}

fn insert_log(conn: &Connection, log: &OperationLogEntry) -> Result<()> {
    let before = log.before.as_ref().map(serde_json::to_string).transpose()?;
    let after = log.after.as_ref().map(serde_json::to_string).transpose()?;

    conn.prepare_cached(
        "INSERT INTO operation_logs (timestamp, operation_id, operation, memory_key, memory_id, \
         before_data, after_data, success, error) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
    )?
    .execute(params![
        to_nanos(log.timestamp)?,
        log.operation_id,
        log.operation.as_str(),
        log.key,
        log.memory_id,
        before,
        after,
        log.success,
        log.error,
    ])?;
    Ok(())
}

fn row_to_entry(row: &Row) -> rusqlite::Result<MemoryEntry> {
    let id: String = row.get(0)?;

    let tags = match row.get::<_, Option<String>>(4)? {
        Some(raw) if !raw.is_empty() => serde_json::from_str(&raw).unwrap_or_else(|e| {
            warn!("Unreadable tags on memory {}: {}", id, e);
            Vec::new()
        }),
        _ => Vec::new(),
    };

    let embedding = match row.get::<_, Option<Vec<u8>>>(7)? {
        Some(blob) if !blob.is_empty() => match decode_embedding(&blob) {
            Ok(v) if !v.is_empty() => Some(v),
            Ok(_) => None,
            Err(e) => {
                warn!("Dropping embedding of memory {}: {}", id, e);
                None
            }
        },
        _ => None,
    };

    Ok(MemoryEntry {
        category: row.get(1)?,
        key: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
        value: row.get(3)?,
        tags,
        created_at: from_nanos(row.get(5)?),
        updated_at: from_nanos(row.get(6)?),
        embedding,
        embedding_hash: row.get(8)?,
        id,
    })
}

/// Nanosecond column value; only years 1677 to 2262 fit
fn to_nanos(ts: DateTime<Utc>) -> Result<i64> {
    ts.timestamp_nanos_opt()
        .ok_or_else(|| MemoryError::validation(format!("timestamp {} is outside the storable range", ts)))
}

fn from_nanos(nanos: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_nanos(nanos)
}

/// `u32` LE length prefix followed by LE `f32` values
pub fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + embedding.len() * 4);
    buf.extend_from_slice(&(embedding.len() as u32).to_le_bytes());
    for value in embedding {
        buf.extend_from_slice(&value.to_le_bytes());
    }
    buf
}

/// Inverse of [`encode_embedding`]; JSON arrays from older files are accepted too
pub fn decode_embedding(blob: &[u8]) -> Result<Vec<f32>> {
    if let Some(prefix) = blob.get(..4) {
        let count = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
        if count.checked_mul(4).and_then(|n| n.checked_add(4)) == Some(blob.len()) {
            return Ok(blob[4..]
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect());
        }
    }

    serde_json::from_slice(blob)
        .map_err(|_| MemoryError::validation(format!("malformed embedding blob ({} bytes)", blob.len())))
}

/// Quoted tokens joined with implicit AND, so user input never reaches
/// the FTS5 query grammar
fn fts_expression(query: &str) -> Option<String> {
    let tokens: Vec<String> = FTS_TOKEN
        .find_iter(query)
        .map(|m| format!("\"{}\"", m.as_str()))
        .collect();
    (!tokens.is_empty()).then(|| tokens.join(" "))
}

/// bm25 ranks are negative, lower is better. Scores are relevance relative
/// to the best hit, so the top result is `1.0`.
fn rank_to_scores(hits: Vec<(MemoryEntry, f64)>) -> Vec<SearchResult> {
    let best = hits.iter().map(|(_, rank)| -rank).fold(0.0f64, f64::max);

    hits.into_iter()
        .map(|(entry, rank)| {
            let score = if best > 0.0 { (-rank / best).clamp(0.0, 1.0) } else { 1.0 };
            SearchResult::new(entry, score)
        })
        .collect()
}

fn like_pattern(query: &str) -> String {
    let escaped = query.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_");
    format!("%{}%", escaped)
}
