//! mory library
//!
//! Durable local key/value memory store with keyword and hybrid semantic search.
//!
//! # Modules
//!
//! - `core`: Entries, queries, errors, configuration
//! - `search`: Lexical scoring, embeddings, vector store, hybrid fusion
//! - `storage`: JSON and SQLite backends, JSON to SQLite migration

pub mod core;
pub mod search;
pub mod storage;

// Re-exports for convenience
pub use core::config::Config;
pub use core::entry::{MemoryEntry, Operation, OperationLogEntry, SearchQuery, SearchResult};
pub use core::error::{MemoryError, Result};
pub use search::{LexicalSearchEngine, SemanticSearchEngine};
pub use storage::migration::{MigrationOptions, MigrationResult, Migrator};
pub use storage::{create_store, JsonMemoryStore, MemoryStore, SqliteMemoryStore, StorageKind};
