//! Embedding provider with a content-hash cache
//!
//! The provider turns entry text into vectors through an [`EmbeddingClient`]:
//! - [`OpenAiClient`]: OpenAI-compatible `/v1/embeddings` endpoint
//! - [`HtpClient`]: Harmonic Token Projection, deterministic and offline
//!   ("Harmonic Token Projection: A Vocabulary-Free, Training-Free,
//!   Deterministic, and Reversible Embedding Methodology",
//!   https://arxiv.org/html/2511.20665)
//!
//! Results are cached by `sha256(model + ":" + normalized text)` for a fixed
//! TTL. Expired entries are evicted lazily on lookup.

use std::collections::HashMap;
use std::f64::consts::PI;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::vectordb::normalize;
use crate::core::entry::MemoryEntry;
use crate::core::error::{MemoryError, Result};

/// Default cache lifetime
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Default number of inputs per external call
pub const DEFAULT_MAX_BATCH_SIZE: usize = 100;

/// Raw embedding backend. One call per batch, no caching, no retry.
pub trait EmbeddingClient: Send + Sync {
    /// Embed every input, preserving order
    fn create_embeddings(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Model identifier (part of the cache key)
    fn model(&self) -> &str;
}

/// Text that represents an entry for embedding: key, value, space-joined tags
pub fn embedding_text(entry: &MemoryEntry) -> String {
    let tags = entry.tags.join(" ");
    [entry.key.as_str(), entry.value.as_str(), tags.as_str()]
        .iter()
        .filter(|part| !part.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Content hash used to detect stale embeddings
pub fn text_hash(text: &str) -> String {
    hex_sha256(text.trim().as_bytes())
}

fn hex_sha256(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

#[derive(Debug, Clone)]
struct CachedEmbedding {
    embedding: Vec<f32>,
    created_at: Instant,
}

/// TTL cache keyed by content hash
#[derive(Debug)]
pub struct EmbeddingCache {
    entries: Mutex<HashMap<String, CachedEmbedding>>,
    ttl: Duration,
}

impl EmbeddingCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Cached embedding, evicting it if expired
    pub fn get(&self, key: &str) -> Option<Vec<f32>> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(cached) if cached.created_at.elapsed() <= self.ttl => Some(cached.embedding.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, key: String, embedding: Vec<f32>) {
        self.entries.lock().insert(
            key,
            CachedEmbedding {
                embedding,
                created_at: Instant::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Cached embedding provider
pub struct EmbeddingProvider {
    client: Box<dyn EmbeddingClient>,
    cache: EmbeddingCache,
    max_batch_size: usize,
}

impl EmbeddingProvider {
    pub fn new(client: Box<dyn EmbeddingClient>) -> Self {
        Self {
            client,
            cache: EmbeddingCache::new(DEFAULT_CACHE_TTL),
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
        }
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache = EmbeddingCache::new(ttl);
        self
    }

    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size.max(1);
        self
    }

    pub fn model(&self) -> &str {
        self.client.model()
    }

    pub fn cached_count(&self) -> usize {
        self.cache.len()
    }

    fn cache_key(&self, text: &str) -> String {
        let normalized = text.trim().to_lowercase();
        hex_sha256(format!("{}:{}", self.client.model(), normalized).as_bytes())
    }

    /// Embed a single text
    pub fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let key = self.cache_key(text);
        if let Some(embedding) = self.cache.get(&key) {
            return Ok(embedding);
        }

        let embedding = self
            .client
            .create_embeddings(&[text.to_string()])?
            .pop()
            .ok_or_else(|| MemoryError::external("no embedding data returned"))?;

        self.cache.insert(key, embedding.clone());
        Ok(embedding)
    }

    /// Embed many texts; only uncached ones are sent, `max_batch_size` per call
    pub fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut results: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        let mut pending = Vec::new();

        for (i, text) in texts.iter().enumerate() {
            match self.cache.get(&self.cache_key(text)) {
                Some(embedding) => results[i] = Some(embedding),
                None => pending.push(i),
            }
        }

        for chunk in pending.chunks(self.max_batch_size) {
            let inputs: Vec<String> = chunk.iter().map(|&i| texts[i].clone()).collect();
            let embeddings = self.client.create_embeddings(&inputs)?;

            if embeddings.len() != inputs.len() {
                return Err(MemoryError::external(format!(
                    "embedding count mismatch: expected {}, got {}",
                    inputs.len(),
                    embeddings.len()
                )));
            }

            for (&i, embedding) in chunk.iter().zip(embeddings) {
                self.cache.insert(self.cache_key(&texts[i]), embedding.clone());
                results[i] = Some(embedding);
            }
        }

        Ok(results.into_iter().map(Option::unwrap_or_default).collect())
    }
}

// ===== OpenAI-compatible HTTP client =====

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

/// Blocking client for `/v1/embeddings`
pub struct OpenAiClient {
    http: reqwest::blocking::Client,
    api_key: String,
    endpoint: String,
    model: String,
    timeout: Duration,
}

impl OpenAiClient {
    /// `timeout` bounds single-text calls; batch calls get twice as long
    pub fn new(api_key: &str, base_url: &str, model: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .build()
            .map_err(|e| MemoryError::external(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            api_key: api_key.to_string(),
            endpoint: embeddings_endpoint(base_url),
            model: model.to_string(),
            timeout,
        })
    }
}

impl EmbeddingClient for OpenAiClient {
    fn create_embeddings(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        let request = EmbeddingRequest {
            model: &self.model,
            input: inputs,
        };

        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .timeout(if inputs.len() > 1 { self.timeout * 2 } else { self.timeout })
            .json(&request)
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| MemoryError::external(format!("failed to create embeddings: {}", e)))?;

        let mut body: EmbeddingResponse = response
            .json()
            .map_err(|e| MemoryError::external(format!("invalid embedding response: {}", e)))?;

        body.data.sort_by_key(|d| d.index);
        Ok(body.data.into_iter().map(|d| d.embedding).collect())
    }

    fn model(&self) -> &str {
        &self.model
    }
}

fn embeddings_endpoint(base_url: &str) -> String {
    let base = base_url.trim_end_matches('/');
    if base.ends_with("/embeddings") {
        return base.to_string();
    }
    let versioned = base
        .rsplit('/')
        .next()
        .and_then(|seg| seg.strip_prefix('v'))
        .map(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()))
        .unwrap_or(false);
    if versioned {
        format!("{}/embeddings", base)
    } else {
        format!("{}/v1/embeddings", base)
    }
}

// ===== Harmonic Token Projection =====

/// Output dimension (two components per modulus)
pub const HTP_DIM: usize = 384;

/// Longest token prefix (in code points) folded into the token integer
const HTP_MAX_TOKEN_CHARS: usize = 64;

/// Deterministic, training-free embedding client.
///
/// Each token is read as a base-2^16 integer `N` over its code points and
/// projected onto the unit circle once per prime modulus `m`:
/// `[sin(2π·(N mod m)/m), cos(2π·(N mod m)/m)]`. Token vectors are
/// mean-pooled and L2-normalized.
pub struct HtpClient {
    primes: Vec<u64>,
    model: String,
}

impl HtpClient {
    pub fn new() -> Self {
        Self {
            primes: first_primes(HTP_DIM / 2),
            model: "htp-384".to_string(),
        }
    }

    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let tokens: Vec<String> = text
            .split(|c: char| c.is_whitespace() || c.is_ascii_punctuation())
            .filter(|t| !t.is_empty())
            .map(str::to_lowercase)
            .collect();

        if tokens.is_empty() {
            return vec![0.0; HTP_DIM];
        }

        let mut pooled = vec![0.0f64; HTP_DIM];
        for token in &tokens {
            let n = token
                .chars()
                .take(HTP_MAX_TOKEN_CHARS)
                .fold(0u64, |acc, c| acc.wrapping_mul(65536).wrapping_add(c as u64));

            for (slot, &m) in self.primes.iter().enumerate() {
                let theta = 2.0 * PI * ((n % m) as f64) / (m as f64);
                pooled[2 * slot] += theta.sin();
                pooled[2 * slot + 1] += theta.cos();
            }
        }

        let count = tokens.len() as f64;
        let mean: Vec<f32> = pooled.iter().map(|v| (v / count) as f32).collect();
        normalize(&mean)
    }
}

impl Default for HtpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl EmbeddingClient for HtpClient {
    fn create_embeddings(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(inputs.iter().map(|t| self.embed_text(t)).collect())
    }

    fn model(&self) -> &str {
        &self.model
    }
}

fn first_primes(count: usize) -> Vec<u64> {
    let mut primes: Vec<u64> = Vec::with_capacity(count);
    let mut candidate = 2u64;
    while primes.len() < count {
        if primes
            .iter()
            .take_while(|&&p| p * p <= candidate)
            .all(|&p| candidate % p != 0)
        {
            primes.push(candidate);
        }
        candidate += 1;
    }
    primes
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    /// Call-counting client producing bag-of-words vectors
    pub struct CountingClient {
        pub calls: Arc<AtomicUsize>,
        pub inputs: Arc<AtomicUsize>,
        pub fail: bool,
    }

    impl CountingClient {
        pub fn new() -> Self {
            Self {
                calls: Arc::new(AtomicUsize::new(0)),
                inputs: Arc::new(AtomicUsize::new(0)),
                fail: false,
            }
        }

        pub fn failing() -> Self {
            Self {
                fail: true,
                ..Self::new()
            }
        }
    }

    impl EmbeddingClient for CountingClient {
        fn create_embeddings(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inputs.fetch_add(inputs.len(), Ordering::SeqCst);
            if self.fail {
                return Err(MemoryError::external("service unavailable"));
            }
            Ok(inputs.iter().map(|t| bag_of_words(t)).collect())
        }

        fn model(&self) -> &str {
            "counting-test"
        }
    }

    /// 16-dim vector counting hashed lowercase words
    pub fn bag_of_words(text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; 16];
        for word in text.split_whitespace() {
            let h = word
                .to_lowercase()
                .bytes()
                .fold(7usize, |acc, b| acc.wrapping_mul(31).wrapping_add(b as usize));
            v[h % 16] += 1.0;
        }
        v
    }
}

#[cfg(test)]
mod tests {
    use super::testing::CountingClient;
    use super::*;
    use crate::search::vectordb::cosine_similarity;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_embedding_text_omits_empty_fields() {
        let entry = MemoryEntry::new("personal", "birthday", "1990-05-15").with_tags(["date", "family"]);
        assert_eq!(embedding_text(&entry), "birthday 1990-05-15 date family");

        let keyless = MemoryEntry::new("personal", "", "just a value");
        assert_eq!(embedding_text(&keyless), "just a value");
    }

    #[test]
    fn test_text_hash_trims() {
        assert_eq!(text_hash("  hello "), text_hash("hello"));
        assert_ne!(text_hash("hello"), text_hash("Hello"));
        assert_eq!(text_hash("x").len(), 64);
    }

    #[test]
    fn test_embed_uses_cache() -> Result<()> {
        let client = CountingClient::new();
        let calls = client.calls.clone();
        let provider = EmbeddingProvider::new(Box::new(client));

        let a = provider.embed("Rust ownership")?;
        let b = provider.embed("  rust OWNERSHIP ")?;
        assert_eq!(a, b);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(provider.cached_count(), 1);
        Ok(())
    }

    #[test]
    fn test_cache_expires() -> Result<()> {
        let client = CountingClient::new();
        let calls = client.calls.clone();
        let provider = EmbeddingProvider::new(Box::new(client)).with_cache_ttl(Duration::ZERO);

        provider.embed("hello")?;
        std::thread::sleep(Duration::from_millis(2));
        provider.embed("hello")?;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[test]
    fn test_batch_chunks_only_uncached() -> Result<()> {
        let client = CountingClient::new();
        let calls = client.calls.clone();
        let sent = client.inputs.clone();
        let provider = EmbeddingProvider::new(Box::new(client)).with_max_batch_size(2);

        provider.embed("b")?;
        let texts: Vec<String> = ["a", "b", "c", "d", "e"].iter().map(|s| s.to_string()).collect();
        let out = provider.embed_batch(&texts)?;

        assert_eq!(out.len(), 5);
        for (text, embedding) in texts.iter().zip(&out) {
            assert_eq!(embedding, &testing::bag_of_words(text));
        }
        // 1 single call + 4 uncached inputs in chunks of 2
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(sent.load(Ordering::SeqCst), 5);
        Ok(())
    }

    #[test]
    fn test_failures_propagate_without_retry() {
        let client = CountingClient::failing();
        let calls = client.calls.clone();
        let provider = EmbeddingProvider::new(Box::new(client));

        let err = provider.embed("hello").unwrap_err();
        assert!(matches!(err, MemoryError::ExternalService(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(provider.cached_count(), 0);
    }

    #[test]
    fn test_endpoint_resolution() {
        assert_eq!(embeddings_endpoint("https://api.openai.com"), "https://api.openai.com/v1/embeddings");
        assert_eq!(embeddings_endpoint("https://host/v1/"), "https://host/v1/embeddings");
        assert_eq!(embeddings_endpoint("https://host/api/v4"), "https://host/api/v4/embeddings");
        assert_eq!(embeddings_endpoint("https://host/v1/embeddings"), "https://host/v1/embeddings");
    }

    #[test]
    fn test_htp_deterministic_and_normalized() {
        let a = HtpClient::new();
        let b = HtpClient::new();
        let e1 = a.embed_text("hello world");
        assert_eq!(e1, b.embed_text("hello world"));
        assert_ne!(e1, a.embed_text("goodbye moon"));
        assert_eq!(e1.len(), HTP_DIM);

        let norm: f32 = e1.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 0.01);

        assert!(a.embed_text("  ... ").iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_htp_shared_tokens_are_closer() -> Result<()> {
        let htp = HtpClient::new();
        let base = htp.embed_text("GPU memory sharing");
        let related = htp.embed_text("GPU memory pooling");
        let unrelated = htp.embed_text("cooking pasta recipes");
        assert!(cosine_similarity(&base, &related)? > cosine_similarity(&base, &unrelated)?);
        Ok(())
    }

    #[test]
    fn test_first_primes() {
        assert_eq!(first_primes(6), vec![2, 3, 5, 7, 11, 13]);
        assert_eq!(first_primes(192).len(), 192);
    }
}
