//! Memory entry model shared by every backend and search engine

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Last timestamp handed out by [`next_stamp`]
static LAST_STAMP: AtomicI64 = AtomicI64::new(0);

/// A single stored memory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    #[serde(default)]
    pub id: String,
    pub category: String,
    #[serde(default)]
    pub key: String,
    pub value: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Missing in older files; the epoch marks it unset until the first save
    #[serde(default)]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_hash: Option<String>,
}

impl MemoryEntry {
    /// New unsaved entry; `id` is assigned on first save
    pub fn new(category: impl Into<String>, key: impl Into<String>, value: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: String::new(),
            category: category.into(),
            key: key.into(),
            value: value.into(),
            tags: Vec::new(),
            created_at: now,
            updated_at: now,
            embedding: None,
            embedding_hash: None,
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Whether `created_at` was never set (absent from the source it was read from)
    pub fn is_unstamped(&self) -> bool {
        self.created_at == DateTime::<Utc>::default()
    }

    pub fn has_embedding(&self) -> bool {
        self.embedding.as_ref().map(|e| !e.is_empty()).unwrap_or(false)
    }

    /// Whether this entry belongs to `category` (empty filter matches all)
    pub fn in_category(&self, category: &str) -> bool {
        category.is_empty() || self.category == category
    }
}

/// Kind of mutation recorded in the operation log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Save,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Save => "save",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only audit record of a mutating store call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationLogEntry {
    pub timestamp: DateTime<Utc>,
    pub operation_id: String,
    pub operation: Operation,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub memory_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<MemoryEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<MemoryEntry>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl OperationLogEntry {
    /// Successful operation record; `memory_id` is taken from whichever snapshot exists
    pub fn succeeded(
        operation: Operation,
        before: Option<&MemoryEntry>,
        after: Option<&MemoryEntry>,
    ) -> Self {
        let subject = after.or(before);
        Self {
            timestamp: Utc::now(),
            operation_id: generate_operation_id(),
            operation,
            key: subject.map(|m| m.key.clone()).unwrap_or_default(),
            memory_id: subject.map(|m| m.id.clone()).unwrap_or_default(),
            before: before.cloned(),
            after: after.cloned(),
            success: true,
            error: None,
        }
    }

    /// Failed operation record
    pub fn failed(operation: Operation, key: &str, error: impl ToString) -> Self {
        Self {
            timestamp: Utc::now(),
            operation_id: generate_operation_id(),
            operation,
            key: key.to_string(),
            memory_id: String::new(),
            before: None,
            after: None,
            success: false,
            error: Some(error.to_string()),
        }
    }
}

/// Search parameters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchQuery {
    /// Free text; empty matches everything
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub category: Option<String>,
    /// Maximum number of results, unbounded when `None`
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub min_score: f64,
}

impl SearchQuery {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }

    pub fn in_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_min_score(mut self, min_score: f64) -> Self {
        self.min_score = min_score;
        self
    }

    /// Category filter, empty when unset
    pub fn category(&self) -> &str {
        self.category.as_deref().unwrap_or("")
    }

    /// Lowercased, trimmed query text
    pub fn normalized(&self) -> String {
        self.query.trim().to_lowercase()
    }

    pub fn is_match_all(&self) -> bool {
        self.query.trim().is_empty()
    }

    /// Apply `min_score` and `limit` to an already ranked list
    pub fn finish(&self, mut results: Vec<SearchResult>) -> Vec<SearchResult> {
        if self.min_score > 0.0 {
            results.retain(|r| r.score >= self.min_score);
        }
        if let Some(limit) = self.limit {
            results.truncate(limit);
        }
        results
    }
}

/// Search hit with relevance in `[0, 1]`
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub entry: MemoryEntry,
    pub score: f64,
}

impl SearchResult {
    pub fn new(entry: MemoryEntry, score: f64) -> Self {
        Self { entry, score }
    }
}

/// Sort by descending score, keeping input order for ties
pub fn sort_by_score(results: &mut [SearchResult]) {
    results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
}

/// Strictly increasing nanosecond stamp, unique within the process
fn next_stamp() -> i64 {
    let now = Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX);
    let mut last = LAST_STAMP.load(Ordering::Relaxed);
    loop {
        let next = if now > last { now } else { last + 1 };
        match LAST_STAMP.compare_exchange_weak(last, next, Ordering::SeqCst, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(actual) => last = actual,
        }
    }
}

/// Generate a new memory id (`memory_<nanos>`)
pub fn generate_id() -> String {
    format!("memory_{}", next_stamp())
}

/// Generate a new operation id (`op_<nanos>`)
pub fn generate_operation_id() -> String {
    format!("op_{}", next_stamp())
}
