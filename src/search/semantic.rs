//! Hybrid search - lexical scores fused with embedding similarity

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use super::embedding::{embedding_text, text_hash, EmbeddingClient, EmbeddingProvider, HtpClient, OpenAiClient};
use super::engine::LexicalSearchEngine;
use super::vectordb::{VectorMatch, VectorStore};
use crate::core::config::{EmbeddingProviderKind, SemanticConfig};
use crate::core::entry::{sort_by_score, MemoryEntry, SearchQuery, SearchResult};
use crate::core::error::{MemoryError, Result};
use crate::storage::MemoryStore;

/// Candidates pulled from the vector store per query
const SEMANTIC_TOP_K: usize = 50;

/// Engine settings and counters reported by `stats`
#[derive(Debug, Clone, Serialize)]
pub struct SemanticStats {
    pub enabled: bool,
    pub model: String,
    pub hybrid_weight: f64,
    pub similarity_threshold: f64,
    pub vector_count: usize,
    pub cached_embeddings: usize,
}

pub struct SemanticSearchEngine {
    lexical: LexicalSearchEngine,
    embedder: Arc<EmbeddingProvider>,
    vectors: Arc<VectorStore>,
    hybrid_weight: f64,
    threshold: f64,
    enabled: bool,
}

impl SemanticSearchEngine {
    pub fn new(embedder: Arc<EmbeddingProvider>, vectors: Arc<VectorStore>, hybrid_weight: f64, threshold: f64) -> Self {
        Self {
            lexical: LexicalSearchEngine::new(),
            embedder,
            vectors,
            hybrid_weight: hybrid_weight.clamp(0.0, 1.0),
            threshold,
            enabled: true,
        }
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Engine with the configured embedding client and an empty vector store
    pub fn from_config(config: &SemanticConfig) -> Result<Self> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let client: Box<dyn EmbeddingClient> = match config.provider {
            EmbeddingProviderKind::OpenAi => {
                let api_key = config
                    .api_key
                    .as_deref()
                    .ok_or_else(|| MemoryError::Config("the openai embedding provider needs MORY_OPENAI_API_KEY".into()))?;
                Box::new(OpenAiClient::new(api_key, &config.base_url, &config.embedding_model, timeout)?)
            }
            EmbeddingProviderKind::Htp => Box::new(HtpClient::new()),
        };

        let provider = EmbeddingProvider::new(client)
            .with_cache_ttl(Duration::from_secs(config.cache_ttl_secs))
            .with_max_batch_size(config.max_batch_size);

        Ok(Self::new(
            Arc::new(provider),
            Arc::new(VectorStore::new()),
            config.hybrid_weight,
            config.similarity_threshold,
        )
        .with_enabled(config.enabled))
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Lexical search, fused with vector similarity when enabled.
    ///
    /// Embedding or vector failures degrade to the lexical ranking.
    pub fn search(&self, store: &dyn MemoryStore, query: &SearchQuery) -> Result<Vec<SearchResult>> {
        let lexical = self.lexical.score(store, query)?;

        if !self.enabled || query.is_match_all() {
            return Ok(query.finish(lexical));
        }

        match self.semantic_matches(query.query.trim()) {
            Ok(matches) => Ok(query.finish(self.fuse(store, query, lexical, &matches))),
            Err(e) => {
                warn!("Semantic search failed, falling back to keyword results: {}", e);
                Ok(query.finish(lexical))
            }
        }
    }

    fn semantic_matches(&self, text: &str) -> Result<Vec<VectorMatch>> {
        let embedding = self.embedder.embed(text)?;
        let mut matches = self.vectors.search(&embedding, SEMANTIC_TOP_K)?;
        matches.retain(|m| m.score >= self.threshold);
        Ok(matches)
    }

    fn blend(&self, lexical: f64, semantic: f64) -> f64 {
        (1.0 - self.hybrid_weight) * lexical + self.hybrid_weight * semantic
    }

    fn fuse(
        &self,
        store: &dyn MemoryStore,
        query: &SearchQuery,
        lexical: Vec<SearchResult>,
        matches: &[VectorMatch],
    ) -> Vec<SearchResult> {
        let semantic: HashMap<&str, f64> = matches.iter().map(|m| (m.id.as_str(), m.score)).collect();
        let mut seen: HashSet<String> = HashSet::with_capacity(lexical.len());
        let mut fused = Vec::with_capacity(lexical.len() + matches.len());

        for hit in lexical {
            let semantic_score = semantic.get(hit.entry.id.as_str()).copied().unwrap_or(0.0);
            let score = self.blend(hit.score, semantic_score);
            seen.insert(hit.entry.id.clone());
            fused.push(SearchResult::new(hit.entry, score));
        }

        for m in matches.iter().filter(|m| !seen.contains(&m.id)) {
            match store.get_by_id(&m.id) {
                Ok(entry) if entry.in_category(query.category()) => {
                    fused.push(SearchResult::new(entry, self.blend(0.0, m.score)));
                }
                Ok(_) => {}
                Err(e) if e.is_not_found() => {
                    debug!("Dropping stale vector {}", m.id);
                    self.vectors.delete(&m.id);
                }
                Err(e) => warn!("Failed to resolve semantic match {}: {}", m.id, e),
            }
        }

        sort_by_score(&mut fused);
        fused
    }

    /// Refresh `entry.embedding` if its text changed; returns whether an
    /// embedding was requested. The caller persists the entry.
    pub fn generate_embedding(&self, entry: &mut MemoryEntry) -> Result<bool> {
        if !self.enabled {
            return Ok(false);
        }

        let text = embedding_text(entry);
        let hash = text_hash(&text);

        if entry.embedding_hash.as_deref() == Some(hash.as_str()) && entry.has_embedding() {
            if let Some(embedding) = entry.embedding.as_deref() {
                if !entry.id.is_empty() && !self.vectors.contains(&entry.id) {
                    self.vectors.store(&entry.id, embedding)?;
                }
            }
            return Ok(false);
        }

        let embedding = self.embedder.embed(&text)?;
        if entry.id.is_empty() {
            debug!("Entry has no id yet, vector not indexed");
        } else {
            self.vectors.store(&entry.id, &embedding)?;
        }

        entry.embedding = Some(embedding);
        entry.embedding_hash = Some(hash);
        Ok(true)
    }

    pub fn remove_embedding(&self, id: &str) {
        self.vectors.delete(id);
    }

    /// Match the indexed vector to a freshly persisted entry: keep it only
    /// while the stored embedding still belongs to the entry's text.
    pub fn sync_embedding(&self, entry: &MemoryEntry) {
        if entry.id.is_empty() {
            return;
        }

        let current = entry
            .embedding
            .as_deref()
            .filter(|e| !e.is_empty())
            .filter(|_| entry.embedding_hash.as_deref() == Some(text_hash(&embedding_text(entry)).as_str()));

        match current {
            Some(embedding) => {
                if let Err(e) = self.vectors.store(&entry.id, embedding) {
                    debug!("Dropping vector of {}: {}", entry.id, e);
                    self.vectors.delete(&entry.id);
                }
            }
            None => self.vectors.delete(&entry.id),
        }
    }

    /// Load persisted embeddings into the vector store; returns how many
    pub fn index_existing(&self, entries: &[MemoryEntry]) -> usize {
        let mut indexed = 0;
        for entry in entries {
            let Some(embedding) = entry.embedding.as_deref() else {
                continue;
            };
            match self.vectors.store(&entry.id, embedding) {
                Ok(()) => indexed += 1,
                Err(e) => debug!("Skipping embedding of {}: {}", entry.id, e),
            }
        }
        indexed
    }

    pub fn stats(&self) -> SemanticStats {
        SemanticStats {
            enabled: self.enabled,
            model: self.embedder.model().to_string(),
            hybrid_weight: self.hybrid_weight,
            similarity_threshold: self.threshold,
            vector_count: self.vectors.size(),
            cached_embeddings: self.embedder.cached_count(),
        }
    }
}
