use std::sync::Arc;

use crate::chat::service::ChatService;
use crate::queue::JobQueue;
use crate::store::RecordStore;

/// Shared application state injected into all route handlers via Axum extractors.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn RecordStore>,
    pub queue: Arc<dyn JobQueue>,
    pub chat: Arc<ChatService>,
    pub queues: QueueNames,
}

/// Names of the two stage queues every uploaded document is enqueued on.
#[derive(Debug, Clone)]
pub struct QueueNames {
    pub analysis: String,
    pub indexing: String,
}
