//! Lexical search engine - additive field-priority scoring
//!
//! Works on whatever a backend's `list` returns, so it serves the flat-file
//! store directly and acts as the keyword half of hybrid search.

use crate::core::entry::{sort_by_score, MemoryEntry, SearchQuery, SearchResult};
use crate::core::error::Result;
use crate::storage::MemoryStore;

const KEY_EXACT: f64 = 1.0;
const KEY_PARTIAL: f64 = 0.8;
const VALUE_EXACT: f64 = 0.9;
const VALUE_PARTIAL: f64 = 0.6;
const CATEGORY_EXACT: f64 = 0.7;
const CATEGORY_PARTIAL: f64 = 0.5;
const TAG_EXACT: f64 = 0.6;
const TAG_PARTIAL: f64 = 0.4;
const KEY_WORD_BONUS: f64 = 0.3;
const VALUE_WORD_BONUS: f64 = 0.2;

/// Stateless keyword scorer
#[derive(Debug, Clone, Copy, Default)]
pub struct LexicalSearchEngine;

impl LexicalSearchEngine {
    pub fn new() -> Self {
        Self
    }

    /// Ranked results with `min_score` and `limit` applied
    pub fn search(&self, store: &dyn MemoryStore, query: &SearchQuery) -> Result<Vec<SearchResult>> {
        Ok(query.finish(self.score(store, query)?))
    }

    /// Every matching in-scope entry, ranked but not truncated
    pub fn score(&self, store: &dyn MemoryStore, query: &SearchQuery) -> Result<Vec<SearchResult>> {
        let entries = store.list(query.category())?;
        Ok(self.rank(entries, &query.normalized()))
    }

    /// Score `entries` against an already lowercased, trimmed query.
    ///
    /// An empty query keeps every entry at `1.0` in input order.
    pub fn rank(&self, entries: Vec<MemoryEntry>, query: &str) -> Vec<SearchResult> {
        if query.is_empty() {
            return entries.into_iter().map(|e| SearchResult::new(e, 1.0)).collect();
        }

        let mut results: Vec<SearchResult> = entries
            .into_iter()
            .filter_map(|entry| {
                let score = relevance(&entry, query);
                (score > 0.0).then(|| SearchResult::new(entry, score))
            })
            .collect();

        sort_by_score(&mut results);
        results
    }
}

/// Full lexical relevance: field signals plus word bonuses, clamped to 1.0
pub fn relevance(entry: &MemoryEntry, query: &str) -> f64 {
    let key = entry.key.to_lowercase();
    let value = entry.value.to_lowercase();

    let mut score = field_signals(entry, query);
    for word in query.split_whitespace() {
        if any_word_contains(&key, word) {
            score += KEY_WORD_BONUS;
        }
        if any_word_contains(&value, word) {
            score += VALUE_WORD_BONUS;
        }
    }

    score.min(1.0)
}

/// Equality and substring signals only, clamped to 1.0
pub fn field_score(entry: &MemoryEntry, query: &str) -> f64 {
    field_signals(entry, query).min(1.0)
}

fn field_signals(entry: &MemoryEntry, query: &str) -> f64 {
    let mut score = graded(&entry.key.to_lowercase(), query, KEY_EXACT, KEY_PARTIAL)
        + graded(&entry.value.to_lowercase(), query, VALUE_EXACT, VALUE_PARTIAL)
        + graded(&entry.category.to_lowercase(), query, CATEGORY_EXACT, CATEGORY_PARTIAL);

    for tag in &entry.tags {
        score += graded(&tag.to_lowercase(), query, TAG_EXACT, TAG_PARTIAL);
    }
    score
}

fn graded(field: &str, query: &str, exact: f64, partial: f64) -> f64 {
    if field == query {
        exact
    } else if field.contains(query) {
        partial
    } else {
        0.0
    }
}

fn any_word_contains(text: &str, word: &str) -> bool {
    text.split_whitespace().any(|w| w.contains(word))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(category: &str, key: &str, value: &str, tags: &[&str]) -> MemoryEntry {
        MemoryEntry::new(category, key, value).with_tags(tags.iter().copied())
    }

    #[test]
    fn test_field_weights() {
        let e = entry("work", "standup", "daily standup at ten", &[]);
        // exact key + partial value + key word + value word
        assert_eq!(relevance(&e, "standup"), 1.0);

        let e = entry("work", "", "meeting notes", &[]);
        // partial value 0.6 + value word 0.2
        assert!((relevance(&e, "notes") - 0.8).abs() < 1e-9);

        let e = entry("programming", "", "x", &[]);
        assert!((relevance(&e, "programming") - 0.7).abs() < 1e-9);
        assert!((relevance(&e, "program") - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_tags_sum_and_clamp() {
        let e = entry("c", "", "v", &["rust", "rustacean"]);
        // exact 0.6 + partial 0.4
        assert!((field_score(&e, "rust") - 1.0).abs() < 1e-9);

        let e = entry("c", "", "v", &["go"]);
        assert!((field_score(&e, "go") - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_field_score_excludes_word_bonus() {
        let e = entry("misc", "", "learning rust today", &[]);
        assert!((field_score(&e, "rust") - 0.6).abs() < 1e-9);
        assert!((relevance(&e, "rust") - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_rank_filters_and_sorts() {
        let engine = LexicalSearchEngine::new();
        let entries = vec![
            entry("personal", "birthday", "1990-05-15", &[]),
            entry("programming", "lang", "rust", &[]),
            entry("programming", "editor", "helix", &[]),
        ];

        let results = engine.rank(entries, "programming");
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.entry.category == "programming"));
        assert!(results.windows(2).all(|w| w[0].score >= w[1].score));
        // ties keep input order
        assert_eq!(results[0].entry.key, "lang");
    }

    #[test]
    fn test_rank_empty_query_returns_all() {
        let engine = LexicalSearchEngine::new();
        let entries = vec![entry("a", "1", "x", &[]), entry("b", "2", "y", &[])];
        let results = engine.rank(entries, "");
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.score == 1.0));
        assert_eq!(results[0].entry.key, "1");
    }

    #[test]
    fn test_scores_stay_in_bounds() {
        let e = entry("rust", "rust", "rust", &["rust", "rust", "rust"]);
        for q in ["rust", "r", "ust", "rust rust"] {
            let s = relevance(&e, q);
            assert!((0.0..=1.0).contains(&s), "{} scored {}", q, s);
        }
    }
}
