//! Storage backends behind one contract
//!
//! - [`json_store::JsonMemoryStore`]: one pretty-printed JSON array, rewritten on every write
//! - [`sqlite_store::SqliteMemoryStore`]: SQLite table with an FTS5 shadow index
//!
//! The backend is picked once at startup from [`StorageKind`].

pub mod json_store;
pub mod migration;
pub mod sqlite_store;

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::{info, warn};

use crate::core::config::{SemanticConfig, StorageConfig};
use crate::core::entry::{generate_id, MemoryEntry, Operation, OperationLogEntry, SearchQuery, SearchResult};
use crate::core::error::{MemoryError, Result};
use crate::search::semantic::{SemanticSearchEngine, SemanticStats};

pub use json_store::JsonMemoryStore;
pub use sqlite_store::SqliteMemoryStore;

/// Backend selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageKind {
    #[default]
    Json,
    Sqlite,
}

impl StorageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Sqlite => "sqlite",
        }
    }

    /// Case-insensitive parse; anything unknown falls back to JSON
    pub fn parse_lossy(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "json" => Self::Json,
            "sqlite" | "sqlite3" => Self::Sqlite,
            other => {
                warn!("Unknown storage type '{}', falling back to json", other);
                Self::Json
            }
        }
    }
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for StorageKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for StorageKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::parse_lossy(&raw))
    }
}

/// Outcome of a bulk embedding pass
#[derive(Debug, Clone, Default, Serialize)]
pub struct EmbeddingReport {
    pub processed: usize,
    pub generated: usize,
    pub unchanged: usize,
    pub failed: usize,
}

/// Backend and semantic-index statistics
#[derive(Debug, Clone, Serialize)]
pub struct StorageStats {
    pub storage_type: StorageKind,
    pub semantic_engine_available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub semantic: Option<SemanticStats>,
    pub total_memories: usize,
    pub memories_with_embeddings: usize,
    /// Fraction of memories with an embedding (0.0 - 1.0)
    pub embedding_coverage: f64,
}

impl StorageStats {
    fn new(
        storage_type: StorageKind,
        engine: Option<&SemanticSearchEngine>,
        total_memories: usize,
        memories_with_embeddings: usize,
    ) -> Self {
        let embedding_coverage = if total_memories == 0 {
            0.0
        } else {
            memories_with_embeddings as f64 / total_memories as f64
        };
        Self {
            storage_type,
            semantic_engine_available: engine.is_some(),
            semantic: engine.map(SemanticSearchEngine::stats),
            total_memories,
            memories_with_embeddings,
            embedding_coverage,
        }
    }
}

/// The storage contract shared by both backends
pub trait MemoryStore: Send + Sync {
    fn kind(&self) -> StorageKind;

    /// Insert or update-in-place (matched by key, then id); returns the final id
    fn save(&self, entry: MemoryEntry) -> Result<String>;

    fn get(&self, key: &str) -> Result<MemoryEntry>;

    fn get_by_id(&self, id: &str) -> Result<MemoryEntry>;

    /// Entries in `category` (all when empty), newest `created_at` first
    fn list(&self, category: &str) -> Result<Vec<MemoryEntry>>;

    fn search(&self, query: &SearchQuery) -> Result<Vec<SearchResult>>;

    fn delete(&self, key: &str) -> Result<()>;

    fn delete_by_id(&self, id: &str) -> Result<()>;

    /// Append one record to the operation log
    fn log_operation(&self, entry: &OperationLogEntry) -> Result<()>;

    fn set_semantic_engine(&self, engine: Arc<SemanticSearchEngine>);

    fn semantic_engine(&self) -> Option<Arc<SemanticSearchEngine>>;

    /// Embed every entry whose text changed and persist the result
    fn generate_embeddings(&self) -> Result<EmbeddingReport> {
        let engine = self
            .semantic_engine()
            .ok_or_else(|| MemoryError::validation("semantic engine not initialized"))?;

        let entries = self.list("")?;
        info!("Processing {} memories for embedding generation", entries.len());

        let mut report = EmbeddingReport::default();
        for mut entry in entries {
            report.processed += 1;
            match engine.generate_embedding(&mut entry) {
                Ok(true) => {
                    let id = entry.id.clone();
                    match self.save(entry) {
                        Ok(_) => report.generated += 1,
                        Err(e) => {
                            warn!("Failed to save memory {} with embedding: {}", id, e);
                            report.failed += 1;
                        }
                    }
                }
                Ok(false) => report.unchanged += 1,
                Err(e) => {
                    warn!("Failed to generate embedding for memory {}: {}", entry.id, e);
                    report.failed += 1;
                }
            }
        }

        info!(
            "Embedding generation finished: {} generated, {} unchanged, {} failed",
            report.generated, report.unchanged, report.failed
        );
        Ok(report)
    }

    fn semantic_stats(&self) -> Result<StorageStats> {
        let entries = self.list("")?;
        let with_embeddings = entries.iter().filter(|e| e.has_embedding()).count();
        let engine = self.semantic_engine();
        Ok(StorageStats::new(self.kind(), engine.as_deref(), entries.len(), with_embeddings))
    }
}

/// Merge an incoming entry with the stored one it replaces.
///
/// Returns the operation to log and the entry to persist. `touch` refreshes
/// `updated_at`; imports pass `false` to keep the source timestamps.
pub(crate) fn prepare_save(mut entry: MemoryEntry, existing: Option<&MemoryEntry>, touch: bool) -> (Operation, MemoryEntry) {
    let operation = match existing {
        Some(current) => {
            entry.id = current.id.clone();
            entry.created_at = if current.is_unstamped() { Utc::now() } else { current.created_at };
            Operation::Update
        }
        None => {
            if entry.id.is_empty() {
                entry.id = generate_id();
            }
            if entry.is_unstamped() {
                entry.created_at = Utc::now();
            }
            Operation::Save
        }
    };

    if touch || entry.updated_at < entry.created_at {
        entry.updated_at = Utc::now().max(entry.created_at);
    }
    (operation, entry)
}

/// Keep an attached engine's vector for `saved` in step with what was persisted
pub(crate) fn sync_semantic_index(engine: Option<Arc<SemanticSearchEngine>>, saved: &MemoryEntry) {
    if let Some(engine) = engine {
        engine.sync_embedding(saved);
    }
}

/// Open the configured backend
pub fn create_store(config: &StorageConfig) -> Result<Arc<dyn MemoryStore>> {
    match config.kind {
        StorageKind::Json => {
            info!("Using JSON storage at {}", config.json_path.display());
            Ok(Arc::new(JsonMemoryStore::new(&config.json_path, &config.log_path)))
        }
        StorageKind::Sqlite => {
            info!("Using SQLite storage at {}", config.sqlite_path.display());
            Ok(Arc::new(SqliteMemoryStore::open(&config.sqlite_path)?))
        }
    }
}

/// Build the semantic engine, warm it from persisted embeddings, and attach it
pub fn attach_semantic_engine(store: &dyn MemoryStore, config: &SemanticConfig) -> Result<Arc<SemanticSearchEngine>> {
    let engine = Arc::new(SemanticSearchEngine::from_config(config)?);
    let indexed = engine.index_existing(&store.list("")?);
    info!(
        "Semantic search {} ({} vectors loaded)",
        if engine.is_enabled() { "enabled" } else { "disabled" },
        indexed
    );
    store.set_semantic_engine(engine.clone());
    Ok(engine)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::EmbeddingProviderKind;
    use crate::search::embedding::{EmbeddingProvider, HtpClient};
    use crate::search::vectordb::VectorStore;
    use chrono::Duration;
    use std::path::PathBuf;

    #[test]
    fn test_storage_kind_parse() {
        assert_eq!(StorageKind::parse_lossy("SQLITE"), StorageKind::Sqlite);
        assert_eq!(StorageKind::parse_lossy(" json "), StorageKind::Json);
        assert_eq!(StorageKind::parse_lossy("redis"), StorageKind::Json);
        assert_eq!(serde_json::to_string(&StorageKind::Sqlite).unwrap(), "\"sqlite\"");
    }

    #[test]
    fn test_prepare_save_update_carries_identity() {
        let mut existing = MemoryEntry::new("personal", "birthday", "1990-05-15").with_id("memory_1");
        existing.created_at = Utc::now() - Duration::days(3);

        let incoming = MemoryEntry::new("personal", "birthday", "1990-05-16");
        let (op, saved) = prepare_save(incoming, Some(&existing), true);

        assert_eq!(op, Operation::Update);
        assert_eq!(saved.id, "memory_1");
        assert_eq!(saved.created_at, existing.created_at);
        assert!(saved.updated_at >= saved.created_at);
        assert_eq!(saved.value, "1990-05-16");
    }

    #[test]
    fn test_prepare_save_insert_assigns_id() {
        let (op, saved) = prepare_save(MemoryEntry::new("c", "", "v"), None, true);
        assert_eq!(op, Operation::Save);
        assert!(saved.id.starts_with("memory_"));

        let (_, kept) = prepare_save(MemoryEntry::new("c", "", "v").with_id("memory_7"), None, true);
        assert_eq!(kept.id, "memory_7");
    }

    #[test]
    fn test_prepare_save_import_keeps_timestamps() {
        let mut entry = MemoryEntry::new("c", "k", "v").with_id("memory_9");
        entry.created_at = Utc::now() - Duration::days(10);
        entry.updated_at = Utc::now() - Duration::days(5);
        let before = entry.updated_at;

        let (_, saved) = prepare_save(entry, None, false);
        assert_eq!(saved.updated_at, before);
    }

    #[test]
    fn test_prepare_save_stamps_missing_timestamps() -> Result<()> {
        let entry: MemoryEntry =
            serde_json::from_str(r#"{"id": "memory_3", "category": "c", "key": "k", "value": "v"}"#)?;
        assert!(entry.is_unstamped());

        let before = Utc::now();
        let (_, saved) = prepare_save(entry, None, false);
        assert!(saved.created_at >= before);
        assert!(saved.updated_at >= saved.created_at);
        Ok(())
    }

    #[test]
    fn test_create_store_and_attach_engine() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = StorageConfig {
            kind: StorageKind::Sqlite,
            json_path: dir.path().join("m.json"),
            sqlite_path: dir.path().join("m.db"),
            log_path: dir.path().join("ops.log"),
        };
        let store = create_store(&config)?;
        assert_eq!(store.kind(), StorageKind::Sqlite);

        let mut entry = MemoryEntry::new("c", "k", "v");
        entry.embedding = Some(vec![0.5, 0.5]);
        store.save(entry)?;

        let semantic = SemanticConfig {
            enabled: true,
            provider: EmbeddingProviderKind::Htp,
            ..SemanticConfig::default()
        };
        let engine = attach_semantic_engine(store.as_ref(), &semantic)?;
        assert_eq!(engine.stats().vector_count, 1);
        assert!(store.semantic_engine().is_some());

        let stats = store.semantic_stats()?;
        assert!(stats.semantic_engine_available);
        assert_eq!(stats.total_memories, 1);
        assert_eq!(stats.embedding_coverage, 1.0);
        Ok(())
    }

    fn both_backends(dir: &tempfile::TempDir) -> Result<Vec<Box<dyn MemoryStore>>> {
        Ok(vec![
            Box::new(JsonMemoryStore::new(dir.path().join("memories.json"), dir.path().join("ops.log"))),
            Box::new(SqliteMemoryStore::open(&dir.path().join("memories.db"))?),
        ])
    }

    #[test]
    fn test_backends_agree_on_update_search_delete() -> Result<()> {
        let dir = tempfile::tempdir()?;
        for store in both_backends(&dir)? {
            let kind = store.kind();

            let first = store.save(MemoryEntry::new("personal", "birthday", "1990-05-15"))?;
            let second = store.save(MemoryEntry::new("personal", "birthday", "1990-05-16"))?;
            assert_eq!(first, second, "{kind}");
            assert_eq!(store.get("birthday")?.value, "1990-05-16", "{kind}");
            assert_eq!(store.list("personal")?.len(), 1, "{kind}");

            store.save(MemoryEntry::new("skills", "rust", "Rust programming language"))?;
            store.save(MemoryEntry::new("skills", "python", "Python programming"))?;
            store.save(MemoryEntry::new("food", "pizza", "likes pizza"))?;

            let results = store.search(&SearchQuery::new("programming"))?;
            assert_eq!(results.len(), 2, "{kind}");
            assert!(results.iter().all(|r| r.entry.category == "skills"), "{kind}");
            assert!(results.iter().all(|r| r.score > 0.0 && r.score <= 1.0), "{kind}");

            let everything_food = store.search(&SearchQuery::new("").in_category("food"))?;
            assert_eq!(everything_food.len(), 1, "{kind}");
            assert_eq!(everything_food[0].score, 1.0, "{kind}");

            let scoped = store.search(&SearchQuery::new("programming").in_category("food"))?;
            assert!(scoped.is_empty(), "{kind}");

            store.delete("pizza")?;
            assert!(store.get("pizza").err().is_some_and(|e| e.is_not_found()), "{kind}");
            assert!(store.delete("pizza").err().is_some_and(|e| e.is_not_found()), "{kind}");
        }
        Ok(())
    }

    #[test]
    fn test_generate_embeddings_on_both_backends() -> Result<()> {
        let dir = tempfile::tempdir()?;
        for store in both_backends(&dir)? {
            let kind = store.kind();
            assert!(store.generate_embeddings().is_err(), "{kind}");

            store.save(MemoryEntry::new("skills", "rust", "systems language"))?;
            store.save(MemoryEntry::new("food", "pizza", "likes pizza"))?;

            let provider = EmbeddingProvider::new(Box::new(HtpClient::new()));
            let engine = SemanticSearchEngine::new(Arc::new(provider), Arc::new(VectorStore::new()), 0.7, 0.0);
            store.set_semantic_engine(Arc::new(engine));

            let report = store.generate_embeddings()?;
            assert_eq!((report.processed, report.generated, report.failed), (2, 2, 0), "{kind}");
            assert!(store.get("rust")?.has_embedding(), "{kind}");

            let again = store.generate_embeddings()?;
            assert_eq!((again.generated, again.unchanged), (0, 2), "{kind}");

            let stats = store.semantic_stats()?;
            assert_eq!(stats.memories_with_embeddings, 2, "{kind}");
            assert_eq!(stats.embedding_coverage, 1.0, "{kind}");
            assert_eq!(stats.semantic.map(|s| s.vector_count), Some(2), "{kind}");

            let results = store.search(&SearchQuery::new("rust"))?;
            assert!(results.iter().any(|r| r.entry.key == "rust"), "{kind}");
            assert!(results.iter().all(|r| (0.0..=1.0).contains(&r.score)), "{kind}");
            assert!(results.windows(2).all(|w| w[0].score >= w[1].score), "{kind}");
        }
        Ok(())
    }

    #[test]
    fn test_update_drops_stale_vector_on_both_backends() -> Result<()> {
        let dir = tempfile::tempdir()?;
        for store in both_backends(&dir)? {
            let kind = store.kind();
            let provider = EmbeddingProvider::new(Box::new(HtpClient::new()));
            let engine = Arc::new(SemanticSearchEngine::new(Arc::new(provider), Arc::new(VectorStore::new()), 1.0, 0.5));
            store.set_semantic_engine(engine.clone());

            store.save(MemoryEntry::new("notes", "k", "quantum chromodynamics lecture"))?;
            store.generate_embeddings()?;
            assert_eq!(engine.stats().vector_count, 1, "{kind}");

            // unchanged text with its embedding keeps the vector
            store.save(store.get("k")?)?;
            assert_eq!(engine.stats().vector_count, 1, "{kind}");

            store.save(MemoryEntry::new("notes", "k", "grocery list eggs"))?;
            assert!(!store.get("k")?.has_embedding(), "{kind}");
            assert_eq!(engine.stats().vector_count, 0, "{kind}");
            assert!(store.search(&SearchQuery::new("quantum chromodynamics"))?.is_empty(), "{kind}");

            store.generate_embeddings()?;
            assert_eq!(engine.stats().vector_count, 1, "{kind}");
        }
        Ok(())
    }

    #[test]
    fn test_openai_provider_requires_key() {
        let semantic = SemanticConfig {
            enabled: true,
            ..SemanticConfig::default()
        };
        let store = JsonMemoryStore::new(PathBuf::from("unused.json"), PathBuf::from("unused.log"));
        let err = attach_semantic_engine(&store, &semantic).err();
        assert!(matches!(err, Some(MemoryError::Config(_))));
    }
}
