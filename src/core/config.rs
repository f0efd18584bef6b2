//! Configuration: optional YAML file, then `MORY_*` environment overrides

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::error::{MemoryError, Result};
use crate::storage::StorageKind;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: String,
    pub storage: StorageConfig,
    pub semantic: SemanticConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            storage: StorageConfig::default(),
            semantic: SemanticConfig::default(),
        }
    }
}

/// Storage backend selection and file locations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    #[serde(rename = "type")]
    pub kind: StorageKind,
    pub json_path: PathBuf,
    pub sqlite_path: PathBuf,
    pub log_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            kind: StorageKind::Json,
            json_path: PathBuf::from("data/memories.json"),
            sqlite_path: PathBuf::from("data/memories.db"),
            log_path: PathBuf::from("data/operations.log"),
        }
    }
}

/// Which embedding client backs the semantic engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProviderKind {
    /// OpenAI-compatible `/v1/embeddings` endpoint
    OpenAi,
    /// Offline harmonic token projection
    Htp,
}

/// Hybrid semantic search settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SemanticConfig {
    pub enabled: bool,
    pub provider: EmbeddingProviderKind,
    pub api_key: Option<String>,
    pub base_url: String,
    pub embedding_model: String,
    pub max_batch_size: usize,
    /// Weight of the semantic score in fused results (0.0 - 1.0)
    pub hybrid_weight: f64,
    /// Minimum cosine similarity kept from the vector search
    pub similarity_threshold: f64,
    pub timeout_secs: u64,
    pub cache_ttl_secs: u64,
}

impl Default for SemanticConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: EmbeddingProviderKind::OpenAi,
            api_key: None,
            base_url: "https://api.openai.com".to_string(),
            embedding_model: "text-embedding-3-small".to_string(),
            max_batch_size: 100,
            hybrid_weight: 0.7,
            similarity_threshold: 0.3,
            timeout_secs: 30,
            cache_ttl_secs: 24 * 60 * 60,
        }
    }
}

impl Config {
    /// Load from an optional YAML file and the process environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) if p.exists() => Self::from_yaml_file(p)?,
            Some(p) => {
                warn!("Config file {} not found, using defaults", p.display());
                Self::default()
            }
            None => Self::default(),
        };

        config.apply_env(|name| std::env::var(name).ok());
        config.finalize();
        Ok(config)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| MemoryError::Config(format!("{}: {}", path.display(), e)))?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Apply `MORY_*` overrides using `lookup` to read variables
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(level) = var("MORY_LOG_LEVEL") {
            self.log_level = level;
        }

        if let Some(kind) = var("MORY_STORAGE_TYPE") {
            self.storage.kind = StorageKind::parse_lossy(&kind);
        }
        if let Some(p) = var("MORY_JSON_PATH") {
            self.storage.json_path = PathBuf::from(p);
        }
        if let Some(p) = var("MORY_SQLITE_PATH") {
            self.storage.sqlite_path = PathBuf::from(p);
        }
        if let Some(p) = var("MORY_LOG_PATH") {
            self.storage.log_path = PathBuf::from(p);
        }

        let semantic = &mut self.semantic;
        if let Some(key) = var("MORY_OPENAI_API_KEY") {
            semantic.api_key = Some(key);
        }
        if let Some(model) = var("MORY_EMBEDDING_MODEL") {
            semantic.embedding_model = model;
        }
        if let Some(url) = var("MORY_EMBEDDING_BASE_URL") {
            semantic.base_url = url;
        }
        if let Some(provider) = var("MORY_EMBEDDING_PROVIDER") {
            match provider.to_lowercase().as_str() {
                "openai" => semantic.provider = EmbeddingProviderKind::OpenAi,
                "htp" => semantic.provider = EmbeddingProviderKind::Htp,
                other => warn!("Unknown embedding provider '{}', keeping {:?}", other, semantic.provider),
            }
        }
        if let Some(size) = var("MORY_MAX_BATCH_SIZE").and_then(|v| v.parse().ok()) {
            semantic.max_batch_size = size;
        }
        if let Some(weight) = var("MORY_HYBRID_WEIGHT").and_then(|v| v.parse().ok()) {
            semantic.hybrid_weight = weight;
        }
        if let Some(threshold) = var("MORY_SIMILARITY_THRESHOLD").and_then(|v| v.parse().ok()) {
            semantic.similarity_threshold = threshold;
        }
        if let Some(enabled) = var("MORY_SEMANTIC_ENABLED").and_then(|v| parse_bool(&v)) {
            semantic.enabled = enabled;
        }
    }

    /// Derived settings: auto-enable with an API key, clamp weights
    pub fn finalize(&mut self) {
        let semantic = &mut self.semantic;
        if semantic.api_key.is_some() && !semantic.enabled {
            semantic.enabled = true;
        }
        semantic.hybrid_weight = semantic.hybrid_weight.clamp(0.0, 1.0);
        semantic.similarity_threshold = semantic.similarity_threshold.clamp(0.0, 1.0);
        if semantic.max_batch_size == 0 {
            semantic.max_batch_size = SemanticConfig::default().max_batch_size;
        }
    }
}

fn parse_bool(v: &str) -> Option<bool> {
    match v.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.storage.kind, StorageKind::Json);
        assert_eq!(config.storage.json_path, PathBuf::from("data/memories.json"));
        assert!(!config.semantic.enabled);
        assert_eq!(config.semantic.hybrid_weight, 0.7);
        assert_eq!(config.semantic.similarity_threshold, 0.3);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_env(env(&[
            ("MORY_STORAGE_TYPE", "SQLite"),
            ("MORY_SQLITE_PATH", "/tmp/m.db"),
            ("MORY_HYBRID_WEIGHT", "0.4"),
            ("MORY_MAX_BATCH_SIZE", "not-a-number"),
        ]));
        config.finalize();

        assert_eq!(config.storage.kind, StorageKind::Sqlite);
        assert_eq!(config.storage.sqlite_path, PathBuf::from("/tmp/m.db"));
        assert_eq!(config.semantic.hybrid_weight, 0.4);
        assert_eq!(config.semantic.max_batch_size, 100);
    }

    #[test]
    fn test_api_key_auto_enables_semantic() {
        let mut config = Config::default();
        config.apply_env(env(&[("MORY_OPENAI_API_KEY", "sk-test")]));
        config.finalize();
        assert!(config.semantic.enabled);
    }

    #[test]
    fn test_unknown_storage_type_falls_back_to_json() {
        let mut config = Config::default();
        config.storage.kind = StorageKind::Sqlite;
        config.apply_env(env(&[("MORY_STORAGE_TYPE", "postgres")]));
        assert_eq!(config.storage.kind, StorageKind::Json);
    }

    #[test]
    fn test_weights_are_clamped() {
        let mut config = Config::default();
        config.apply_env(env(&[("MORY_HYBRID_WEIGHT", "1.7"), ("MORY_SIMILARITY_THRESHOLD", "-2")]));
        config.finalize();
        assert_eq!(config.semantic.hybrid_weight, 1.0);
        assert_eq!(config.semantic.similarity_threshold, 0.0);
    }

    #[test]
    fn test_yaml_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("mory.yaml");
        std::fs::write(
            &path,
            "storage:\n  type: sqlite\n  sqlite_path: store.db\nsemantic:\n  provider: htp\n  enabled: true\n",
        )?;

        let config = Config::from_yaml_file(&path)?;
        assert_eq!(config.storage.kind, StorageKind::Sqlite);
        assert_eq!(config.storage.sqlite_path, PathBuf::from("store.db"));
        assert_eq!(config.storage.json_path, PathBuf::from("data/memories.json"));
        assert_eq!(config.semantic.provider, EmbeddingProviderKind::Htp);
        assert!(config.semantic.enabled);
        Ok(())
    }
}
