//! Chat/Query Service: grounded, single-turn answers about one document.
//!
//! The stored analysis and the nearest indexed passages are fetched
//! concurrently. Missing data on either side degrades to an empty context;
//! only embedding, vector search, or model failures are errors.

use std::sync::Arc;

use tracing::{debug, info};

use crate::chat::prompts::{CHAT_PROMPT_TEMPLATE, CHAT_SYSTEM, EXCERPT_SEPARATOR, NO_EXCERPTS};
use crate::embeddings::Embedder;
use crate::errors::PipelineError;
use crate::llm_client::{render_prompt, ChatModel};
use crate::models::analysis::AnalysisResult;
use crate::store::RecordStore;
use crate::vector_index::{ScoredChunk, VectorIndex};

pub const MIN_TOP_K: usize = 3;
pub const MAX_TOP_K: usize = 5;

pub struct ChatService {
    store: Arc<dyn RecordStore>,
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    model: Arc<dyn ChatModel>,
    top_k: usize,
}

impl ChatService {
    pub fn new(
        store: Arc<dyn RecordStore>,
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        model: Arc<dyn ChatModel>,
        top_k: usize,
    ) -> Self {
        Self {
            store,
            embedder,
            index,
            model,
            top_k: top_k.clamp(MIN_TOP_K, MAX_TOP_K),
        }
    }

    pub async fn answer(&self, document_id: &str, question: &str) -> Result<String, PipelineError> {
        let (analysis, passages) = tokio::join!(
            self.store.get_analysis(document_id),
            self.retrieve(document_id, question)
        );
        let analysis = analysis?;
        let passages = passages?;
        info!(
            "Answering question for document {document_id} (analysis: {}, passages: {})",
            analysis.is_some(),
            passages.len()
        );

        let prompt = build_chat_prompt(analysis.as_ref(), &passages, question);
        let answer = self.model.complete(CHAT_SYSTEM, &prompt).await?;
        debug!("Chat model returned {} bytes", answer.len());
        Ok(answer)
    }

    async fn retrieve(
        &self,
        document_id: &str,
        question: &str,
    ) -> Result<Vec<ScoredChunk>, PipelineError> {
        let vector = self.embedder.embed_query(question).await?;
        Ok(self.index.search(document_id, &vector, self.top_k).await?)
    }
}

pub fn build_chat_prompt(
    analysis: Option<&AnalysisResult>,
    passages: &[ScoredChunk],
    question: &str,
) -> String {
    let analysis = analysis
        .and_then(|a| serde_json::to_string_pretty(a).ok())
        .unwrap_or_else(|| "{}".to_string());
    let excerpts = if passages.is_empty() {
        NO_EXCERPTS.to_string()
    } else {
        passages
            .iter()
            .map(|p| p.payload.text.as_str())
            .collect::<Vec<_>>()
            .join(EXCERPT_SEPARATOR)
    };

    render_prompt(
        CHAT_PROMPT_TEMPLATE,
        &[
            ("analysis", analysis.as_str()),
            ("excerpts", excerpts.as_str()),
            ("question", question.trim()),
        ],
    )
}
