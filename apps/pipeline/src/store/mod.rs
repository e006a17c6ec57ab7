//! Record store, the single source of truth for document status and analyses.

use async_trait::async_trait;

use crate::errors::PipelineError;
use crate::models::analysis::AnalysisResult;
use crate::models::document::{Document, NewDocument, Stage};

pub mod postgres;

/// Carried as `Arc<dyn RecordStore>`.
///
/// Status writes are atomic per document: `begin_stage` and `complete_stage`
/// are conditional updates, so two workers finishing the same document
/// concurrently converge on one `completed` write.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Inserts a new document in `uploaded`. Returns `None` if the id exists.
    async fn create_document(&self, new: &NewDocument) -> Result<Option<Document>, PipelineError>;

    async fn get_document(&self, id: &str) -> Result<Option<Document>, PipelineError>;

    /// Moves `uploaded → parsing` and returns the document as it now stands.
    async fn begin_stage(&self, id: &str) -> Result<Option<Document>, PipelineError>;

    /// Sets `stage`'s completion flag and derives the joined status.
    async fn complete_stage(&self, id: &str, stage: Stage) -> Result<Document, PipelineError>;

    /// Marks the document as `error` unless it already completed.
    async fn fail_document(&self, id: &str, message: &str) -> Result<(), PipelineError>;

    /// Resets a terminal document to `uploaded` with both stage flags cleared.
    /// Returns `None` when the document is missing or still in flight.
    async fn reset_for_reprocess(&self, id: &str) -> Result<Option<Document>, PipelineError>;

    /// Insert-or-update keyed by document id.
    async fn upsert_analysis(
        &self,
        document_id: &str,
        result: &AnalysisResult,
    ) -> Result<(), PipelineError>;

    async fn get_analysis(&self, document_id: &str)
        -> Result<Option<AnalysisResult>, PipelineError>;
}
