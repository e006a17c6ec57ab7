pub mod health;

use axum::{
    routing::{get, post},
    Router,
};

use crate::chat::handlers as chat;
use crate::documents::handlers as documents;
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        // Query API
        .route("/chat/:document_id", post(chat::handle_chat))
        .route("/chat", post(chat::handle_chat_without_document))
        .route("/chat/", post(chat::handle_chat_without_document))
        // Document API
        .route(
            "/api/v1/documents",
            post(documents::handle_register_document),
        )
        .route("/api/v1/documents/:id", get(documents::handle_get_document))
        .route(
            "/api/v1/documents/:id/reprocess",
            post(documents::handle_reprocess_document),
        )
        .with_state(state)
}
