//! Error types for the memory store

use thiserror::Error;

use crate::storage::migration::MigrationStage;

/// Errors that can occur in the memory store
#[derive(Debug, Error)]
pub enum MemoryError {
    /// Lookup by key or id missed
    #[error("Memory not found: {0}")]
    NotFound(String),

    /// Malformed input reached a backend
    #[error("Validation error: {0}")]
    Validation(String),

    /// I/O failure while reading or writing a backend file
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// SQLite failure
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// JSON (de)serialization failure
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Other persistence failure
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Embedding provider call failed
    #[error("External service error: {0}")]
    ExternalService(String),

    /// Vectors of different length compared
    #[error("Vector dimensions don't match: {0} vs {1}")]
    DimensionMismatch(usize, usize),

    /// Per-entry failures accumulated during a migration
    #[error("Migration finished with {failed} of {total} entries failed")]
    MigrationPartialFailure { failed: usize, total: usize },

    /// A migration stage aborted the whole run
    #[error("Migration failed while {stage}: {reason}")]
    Migration { stage: MigrationStage, reason: String },

    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(String),
}

impl MemoryError {
    /// Create a not found error
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a persistence error
    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::Persistence(msg.into())
    }

    /// Create an external service error
    pub fn external(msg: impl Into<String>) -> Self {
        Self::ExternalService(msg.into())
    }

    /// Create a migration stage error
    pub fn migration(stage: MigrationStage, reason: impl ToString) -> Self {
        Self::Migration {
            stage,
            reason: reason.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Result type for memory store operations
pub type Result<T> = std::result::Result<T, MemoryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert!(MemoryError::not_found("birthday").is_not_found());
        assert!(!MemoryError::persistence("disk full").is_not_found());

        let io = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        assert!(matches!(MemoryError::from(io), MemoryError::Io(_)));
    }

    #[test]
    fn test_migration_error_message() {
        let err = MemoryError::migration(MigrationStage::LoadingSource, "no such file");
        assert_eq!(
            err.to_string(),
            "Migration failed while loading source: no such file"
        );
    }
}
