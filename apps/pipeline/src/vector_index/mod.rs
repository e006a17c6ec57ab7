//! Vector index holding embedded resume passages, scoped per document.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod qdrant;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("vector has {got} dimensions, collection expects {expected}")]
    Dimension { expected: usize, got: usize },

    #[error("invalid vector index configuration: {0}")]
    Config(String),
}

/// Payload stored next to every vector. `document_id` scopes retrieval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkPayload {
    pub document_id: String,
    pub owner_id: String,
    pub text: String,
    pub chunk_index: usize,
    pub char_start: usize,
    pub char_end: usize,
}

#[derive(Debug, Clone)]
pub struct IndexedChunk {
    pub vector: Vec<f32>,
    pub payload: ChunkPayload,
}

#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub score: f32,
    pub payload: ChunkPayload,
}

/// Carried as `Arc<dyn VectorIndex>`. Every write is scoped by document id.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Creates the collection and payload index if they do not exist.
    async fn ensure_ready(&self) -> Result<(), IndexError>;

    /// Removes every chunk of `document_id`, then stores `chunks`.
    /// Returns the number of chunks stored.
    async fn replace_document(
        &self,
        document_id: &str,
        chunks: Vec<IndexedChunk>,
    ) -> Result<usize, IndexError>;

    /// Top-`limit` chunks of `document_id` nearest to `vector`, best first.
    async fn search(
        &self,
        document_id: &str,
        vector: &[f32],
        limit: usize,
    ) -> Result<Vec<ScoredChunk>, IndexError>;

    async fn count(&self, document_id: &str) -> Result<usize, IndexError>;

    async fn delete_document(&self, document_id: &str) -> Result<(), IndexError>;
}
