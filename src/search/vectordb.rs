//! In-memory vector store with exact cosine top-K search
//!
//! Every search is a brute-force scan. Fine for the few thousand entries a
//! personal memory store holds.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::Serialize;

use crate::core::error::{MemoryError, Result};

/// Similarity search hit
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VectorMatch {
    pub id: String,
    /// Cosine similarity clamped to `[0, 1]`
    pub score: f64,
}

/// id -> embedding map guarded by a read/write lock
#[derive(Debug, Default)]
pub struct VectorStore {
    vectors: RwLock<HashMap<String, Vec<f32>>>,
}

impl VectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the vector for `id` (the slice is copied)
    pub fn store(&self, id: &str, embedding: &[f32]) -> Result<()> {
        if embedding.is_empty() {
            return Err(MemoryError::validation("embedding cannot be empty"));
        }
        self.vectors.write().insert(id.to_string(), embedding.to_vec());
        Ok(())
    }

    /// Top `top_k` vectors by similarity to `query`; `top_k == 0` returns all
    pub fn search(&self, query: &[f32], top_k: usize) -> Result<Vec<VectorMatch>> {
        if query.is_empty() {
            return Err(MemoryError::validation("query embedding cannot be empty"));
        }

        let vectors = self.vectors.read();
        let mut results: Vec<VectorMatch> = Vec::with_capacity(vectors.len());

        for (id, vector) in vectors.iter() {
            match cosine_similarity(query, vector) {
                Ok(score) => results.push(VectorMatch {
                    id: id.clone(),
                    score,
                }),
                Err(e) => tracing::debug!("Skipping vector {}: {}", id, e),
            }
        }
        drop(vectors);

        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        if top_k > 0 {
            results.truncate(top_k);
        }

        Ok(results)
    }

    /// Remove `id`; missing ids are ignored
    pub fn delete(&self, id: &str) {
        self.vectors.write().remove(id);
    }

    pub fn size(&self) -> usize {
        self.vectors.read().len()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.vectors.read().contains_key(id)
    }
}

/// Cosine similarity clamped to `[0, 1]`.
///
/// Mismatched lengths are an error; a zero-norm vector yields `0.0`.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f64> {
    if a.len() != b.len() {
        return Err(MemoryError::DimensionMismatch(a.len(), b.len()));
    }
    if a.is_empty() {
        return Err(MemoryError::validation("vectors cannot be empty"));
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return Ok(0.0);
    }

    let similarity = dot / (norm_a.sqrt() * norm_b.sqrt());
    Ok(similarity.clamp(0.0, 1.0))
}

/// Scale to unit length; zero vectors are returned unchanged
pub fn normalize(vector: &[f32]) -> Vec<f32> {
    let norm = vector.iter().map(|v| (*v as f64) * (*v as f64)).sum::<f64>().sqrt();
    if norm == 0.0 {
        return vector.to_vec();
    }
    vector.iter().map(|v| (*v as f64 / norm) as f32).collect()
}
