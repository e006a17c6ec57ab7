use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::errors::AppError;
use crate::models::document::{Document, NewDocument};
use crate::pipeline::fetch::is_supported_source;
use crate::queue::Job;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RegisterDocumentRequest {
    pub resume_id: Option<String>,
    pub user_id: Option<String>,
    pub file_url: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DocumentEnvelope {
    pub document: Document,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentStatusResponse {
    pub document: Document,
    pub ats_score: Option<f64>,
}

fn required(value: Option<String>, field: &str) -> Result<String, AppError> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::Validation(format!("{field} is required")))
}

/// Pushes one job per stage. A document whose jobs could not be queued is
/// marked `error` so it can be reprocessed later.
async fn enqueue_stages(state: &AppState, document: &Document) -> Result<(), AppError> {
    let job = Job::new(&document.id, &document.owner_id, &document.source_url);
    for queue in [&state.queues.analysis, &state.queues.indexing] {
        if let Err(e) = state.queue.enqueue(queue, &job).await {
            error!("Failed to enqueue document {} on {queue}: {e}", document.id);
            state
                .store
                .fail_document(&document.id, &format!("enqueue failed: {e}"))
                .await?;
            return Err(e.into());
        }
    }
    Ok(())
}

/// POST /api/v1/documents
pub async fn handle_register_document(
    State(state): State<AppState>,
    payload: Result<Json<RegisterDocumentRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<DocumentEnvelope>), AppError> {
    let Json(req) = payload.map_err(|e| AppError::Validation(e.body_text()))?;
    let new = NewDocument {
        id: required(req.resume_id, "resumeId")?,
        owner_id: required(req.user_id, "userId")?,
        source_url: required(req.file_url, "fileUrl")?,
    };
    if !is_supported_source(&new.source_url) {
        return Err(AppError::Validation(format!(
            "fileUrl must be an http(s):// or s3://bucket/key URL, got '{}'",
            new.source_url
        )));
    }

    let document = state
        .store
        .create_document(&new)
        .await?
        .ok_or_else(|| AppError::Conflict(format!("Document {} already exists", new.id)))?;
    enqueue_stages(&state, &document).await?;

    info!("Registered document {} for owner {}", document.id, document.owner_id);
    Ok((StatusCode::CREATED, Json(DocumentEnvelope { document })))
}

/// GET /api/v1/documents/:id
pub async fn handle_get_document(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DocumentStatusResponse>, AppError> {
    let document = state
        .store
        .get_document(&id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Document {id} not found")))?;
    let ats_score = state
        .store
        .get_analysis(&id)
        .await?
        .and_then(|analysis| analysis.ats_score);
    Ok(Json(DocumentStatusResponse {
        document,
        ats_score,
    }))
}

/// POST /api/v1/documents/:id/reprocess
pub async fn handle_reprocess_document(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<DocumentEnvelope>), AppError> {
    let current = state
        .store
        .get_document(&id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Document {id} not found")))?;
    let document = state.store.reset_for_reprocess(&id).await?.ok_or_else(|| {
        AppError::Conflict(format!(
            "Document {id} is still {}; only completed or failed documents can be reprocessed",
            current.status
        ))
    })?;
    enqueue_stages(&state, &document).await?;

    info!("Re-enqueued document {id} for processing");
    Ok((StatusCode::ACCEPTED, Json(DocumentEnvelope { document })))
}
