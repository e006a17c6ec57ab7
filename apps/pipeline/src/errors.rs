use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::embeddings::EmbeddingError;
use crate::llm_client::LlmError;
use crate::queue::QueueError;
use crate::vector_index::IndexError;

/// Errors raised while processing a document or answering a question about it.
///
/// Workers classify these to decide between a queue-level retry and marking
/// the document as `error`.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Failed to fetch document from {url}: {reason}")]
    Fetch {
        url: String,
        reason: String,
        transient: bool,
    },

    #[error("Failed to extract text: {0}")]
    Extraction(String),

    #[error("Extracted text is too short: {chars} characters (minimum {min})")]
    InsufficientContent { chars: usize, min: usize },

    #[error("Analysis output violates schema: {0}")]
    SchemaViolation(String),

    #[error("Upstream call failed: {0}")]
    Upstream(String),

    #[error("Document {0} not found")]
    DocumentNotFound(String),

    #[error("Record store error: {0}")]
    Store(#[from] sqlx::Error),
}

impl PipelineError {
    /// Whether the queue should redeliver the job instead of failing the document.
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::Fetch { transient, .. } => *transient,
            PipelineError::Upstream(_) | PipelineError::Store(_) => true,
            PipelineError::Extraction(_)
            | PipelineError::InsufficientContent { .. }
            | PipelineError::SchemaViolation(_)
            | PipelineError::DocumentNotFound(_) => false,
        }
    }

    /// Short stable label used in logs and dead-letter entries.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Fetch { .. } => "fetch_error",
            PipelineError::Extraction(_) => "extraction_error",
            PipelineError::InsufficientContent { .. } => "insufficient_content",
            PipelineError::SchemaViolation(_) => "schema_violation",
            PipelineError::Upstream(_) => "upstream_error",
            PipelineError::DocumentNotFound(_) => "document_not_found",
            PipelineError::Store(_) => "store_error",
        }
    }
}

impl From<LlmError> for PipelineError {
    fn from(e: LlmError) -> Self {
        PipelineError::Upstream(format!("chat model: {e}"))
    }
}

impl From<EmbeddingError> for PipelineError {
    fn from(e: EmbeddingError) -> Self {
        PipelineError::Upstream(format!("embedding provider: {e}"))
    }
}

impl From<IndexError> for PipelineError {
    fn from(e: IndexError) -> Self {
        PipelineError::Upstream(format!("vector index: {e}"))
    }
}

/// Application-level error type.
/// Implements `IntoResponse` so Axum handlers can return `Result<T, AppError>`.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<PipelineError> for AppError {
    fn from(e: PipelineError) -> Self {
        match e {
            PipelineError::Store(e) => AppError::Database(e),
            PipelineError::DocumentNotFound(id) => {
                AppError::NotFound(format!("Document {id} not found"))
            }
            PipelineError::Upstream(msg) => AppError::Upstream(msg),
            other => AppError::Internal(anyhow::Error::new(other)),
        }
    }
}

impl From<QueueError> for AppError {
    fn from(e: QueueError) -> Self {
        AppError::Queue(e.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone()),
            AppError::Database(e) => {
                tracing::error!("Database error: {e}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "DATABASE_ERROR",
                    "A database error occurred".to_string(),
                )
            }
            AppError::Upstream(msg) => {
                tracing::error!("Upstream error: {msg}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "UPSTREAM_ERROR",
                    "An AI processing error occurred".to_string(),
                )
            }
            AppError::Queue(msg) => {
                tracing::error!("Queue error: {msg}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "QUEUE_ERROR",
                    "Failed to schedule document processing".to_string(),
                )
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {e:?}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal server error occurred".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message
            }
        }));

        (status, body).into_response()
    }
}
