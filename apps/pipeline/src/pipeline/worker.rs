//! Analysis and indexing workers: one job, one document, one stage.
//!
//! Flow: begin_stage → fetch → extract → (analyze → upsert | chunk → index)
//!       → complete_stage. Every write is idempotent, so a redelivered job
//!       can rerun from scratch.

use std::sync::Arc;

use tracing::{info, instrument};

use crate::errors::PipelineError;
use crate::models::document::{DocumentStatus, Stage};
use crate::pipeline::analyzer::Analyzer;
use crate::pipeline::extractor::{extract_text, DocumentExtractor};
use crate::pipeline::fetch::DocumentFetcher;
use crate::pipeline::indexer::ChunkIndexer;
use crate::queue::Job;
use crate::store::RecordStore;

/// What a worker did with a job that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// The stage ran; carries the document status after the join.
    Completed(DocumentStatus),
    /// The document was already terminal; nothing was done.
    Skipped(DocumentStatus),
}

enum StageTask {
    Analysis(Analyzer),
    Indexing(ChunkIndexer),
}

/// Collaborators shared by both workers.
#[derive(Clone)]
pub struct WorkerDeps {
    pub store: Arc<dyn RecordStore>,
    pub fetcher: Arc<dyn DocumentFetcher>,
    pub extractor: Arc<dyn DocumentExtractor>,
    pub min_text_chars: usize,
}

pub struct DocumentWorker {
    deps: WorkerDeps,
    task: StageTask,
}

impl DocumentWorker {
    pub fn analysis(deps: WorkerDeps, analyzer: Analyzer) -> Self {
        Self {
            deps,
            task: StageTask::Analysis(analyzer),
        }
    }

    pub fn indexing(deps: WorkerDeps, indexer: ChunkIndexer) -> Self {
        Self {
            deps,
            task: StageTask::Indexing(indexer),
        }
    }

    pub fn stage(&self) -> Stage {
        match self.task {
            StageTask::Analysis(_) => Stage::Analysis,
            StageTask::Indexing(_) => Stage::Indexing,
        }
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.deps.store
    }

    #[instrument(skip_all, fields(stage = %self.stage(), document_id = %job.resume_id, attempt = job.attempt))]
    pub async fn handle(&self, job: &Job) -> Result<JobOutcome, PipelineError> {
        let document = self
            .deps
            .store
            .begin_stage(&job.resume_id)
            .await?
            .ok_or_else(|| PipelineError::DocumentNotFound(job.resume_id.clone()))?;

        if document.status.is_terminal() {
            info!("Document is {}, skipping job", document.status);
            return Ok(JobOutcome::Skipped(document.status));
        }

        let bytes = self.deps.fetcher.fetch(&job.file_url).await?;
        let text = extract_text(
            self.deps.extractor.as_ref(),
            bytes,
            self.deps.min_text_chars,
        )
        .await?;
        info!("Extracted {} characters", text.chars().count());

        match &self.task {
            StageTask::Analysis(analyzer) => {
                let result = analyzer.analyze(&text).await?;
                self.deps
                    .store
                    .upsert_analysis(&job.resume_id, &result)
                    .await?;
            }
            StageTask::Indexing(indexer) => {
                indexer.index(&job.resume_id, &job.user_id, &text).await?;
            }
        }

        let document = self
            .deps
            .store
            .complete_stage(&job.resume_id, self.stage())
            .await?;
        let sibling = self.stage().sibling();
        if !document.status.is_terminal() && !document.stage_done(sibling) {
            info!("Waiting on {sibling} stage");
        }
        Ok(JobOutcome::Completed(document.status))
    }
}
