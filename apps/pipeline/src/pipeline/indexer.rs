//! Chunk Indexer. Splits text, embeds every passage, and replaces the
//! document's chunk set in the vector index.

use std::sync::Arc;

use tracing::info;

use crate::embeddings::Embedder;
use crate::errors::PipelineError;
use crate::pipeline::chunker::Chunker;
use crate::vector_index::{ChunkPayload, IndexedChunk, VectorIndex};

pub struct ChunkIndexer {
    chunker: Chunker,
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
}

impl ChunkIndexer {
    pub fn new(chunker: Chunker, embedder: Arc<dyn Embedder>, index: Arc<dyn VectorIndex>) -> Self {
        Self {
            chunker,
            embedder,
            index,
        }
    }

    /// Returns the number of chunks now stored for `document_id`.
    pub async fn index(
        &self,
        document_id: &str,
        owner_id: &str,
        text: &str,
    ) -> Result<usize, PipelineError> {
        let chunks = self.chunker.split(text);
        if chunks.is_empty() {
            self.index.delete_document(document_id).await?;
            return Ok(0);
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = self.embedder.embed(&texts).await?;
        if vectors.len() != chunks.len() {
            return Err(PipelineError::Upstream(format!(
                "embedding provider returned {} vectors for {} chunks",
                vectors.len(),
                chunks.len()
            )));
        }

        let points: Vec<IndexedChunk> = chunks
            .into_iter()
            .zip(vectors)
            .map(|(chunk, vector)| IndexedChunk {
                vector,
                payload: ChunkPayload {
                    document_id: document_id.to_string(),
                    owner_id: owner_id.to_string(),
                    text: chunk.text,
                    chunk_index: chunk.index,
                    char_start: chunk.start,
                    char_end: chunk.end,
                },
            })
            .collect();

        let stored = self.index.replace_document(document_id, points).await?;
        info!("Indexed {stored} chunks for document {document_id}");
        Ok(stored)
    }
}
