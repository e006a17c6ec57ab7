use axum::{
    extract::{rejection::JsonRejection, Path, State},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::errors::AppError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub question: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub answer: String,
}

/// POST /chat/:document_id
pub async fn handle_chat(
    State(state): State<AppState>,
    Path(document_id): Path<String>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Json<ChatResponse>, AppError> {
    let Json(req) = payload.map_err(|e| AppError::Validation(e.body_text()))?;
    if document_id.trim().is_empty() {
        return Err(AppError::Validation("documentId is required".to_string()));
    }
    let question = req
        .question
        .filter(|q| !q.trim().is_empty())
        .ok_or_else(|| AppError::Validation("question is required".to_string()))?;

    let answer = state.chat.answer(&document_id, &question).await?;
    Ok(Json(ChatResponse { answer }))
}

/// POST /chat with no document id.
pub async fn handle_chat_without_document() -> AppError {
    AppError::Validation("documentId is required".to_string())
}
