//! Search: lexical scoring, embeddings, vector similarity and hybrid fusion

pub mod embedding;
pub mod engine;
pub mod semantic;
pub mod vectordb;

pub use embedding::{EmbeddingClient, EmbeddingProvider, HtpClient, OpenAiClient};
pub use engine::LexicalSearchEngine;
pub use semantic::{SemanticSearchEngine, SemanticStats};
pub use vectordb::{VectorMatch, VectorStore};
