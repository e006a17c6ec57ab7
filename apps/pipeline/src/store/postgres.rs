use async_trait::async_trait;
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::errors::PipelineError;
use crate::models::analysis::{AnalysisResult, AnalysisRow};
use crate::models::document::{Document, DocumentRow, NewDocument, Stage};
use crate::store::RecordStore;

/// PostgreSQL-backed record store.
#[derive(Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn into_document(row: DocumentRow) -> Result<Document, PipelineError> {
    Document::try_from(row).map_err(|e| PipelineError::Store(sqlx::Error::Decode(e.into())))
}

/// One UPDATE sets the stage flag and derives the status from the sibling
/// flag on the same row version, so the join needs no read-then-write.
fn complete_stage_sql(stage: Stage) -> String {
    format!(
        r#"
        UPDATE documents
        SET {flag} = TRUE,
            status = CASE
                WHEN status IN ('error', 'completed') THEN status
                WHEN {sibling} THEN 'completed'
                ELSE 'analyzing'
            END,
            updated_at = NOW()
        WHERE id = $1
        RETURNING *
        "#,
        flag = stage.flag_column(),
        sibling = stage.sibling().flag_column(),
    )
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn create_document(&self, new: &NewDocument) -> Result<Option<Document>, PipelineError> {
        let row: Option<DocumentRow> = sqlx::query_as(
            r#"
            INSERT INTO documents (id, owner_id, source_url, status)
            VALUES ($1, $2, $3, 'uploaded')
            ON CONFLICT (id) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(&new.id)
        .bind(&new.owner_id)
        .bind(&new.source_url)
        .fetch_optional(&self.pool)
        .await?;
        row.map(into_document).transpose()
    }

    async fn get_document(&self, id: &str) -> Result<Option<Document>, PipelineError> {
        let row: Option<DocumentRow> = sqlx::query_as("SELECT * FROM documents WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(into_document).transpose()
    }

    async fn begin_stage(&self, id: &str) -> Result<Option<Document>, PipelineError> {
        let moved = sqlx::query(
            "UPDATE documents SET status = 'parsing', updated_at = NOW() WHERE id = $1 AND status = 'uploaded'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        if moved.rows_affected() > 0 {
            info!("Document {id}: uploaded -> parsing");
        }
        self.get_document(id).await
    }

    async fn complete_stage(&self, id: &str, stage: Stage) -> Result<Document, PipelineError> {
        let row: Option<DocumentRow> = sqlx::query_as(&complete_stage_sql(stage))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        let document = row
            .map(into_document)
            .transpose()?
            .ok_or_else(|| PipelineError::DocumentNotFound(id.to_string()))?;
        info!(
            "Document {id}: {stage} stage complete, status now {}",
            document.status
        );
        Ok(document)
    }

    async fn fail_document(&self, id: &str, message: &str) -> Result<(), PipelineError> {
        let updated = sqlx::query(
            r#"
            UPDATE documents
            SET status = 'error', error_message = $2, updated_at = NOW()
            WHERE id = $1 AND status <> 'completed'
            "#,
        )
        .bind(id)
        .bind(message)
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() == 0 {
            warn!("Document {id}: error status not written (missing or already completed)");
        }
        Ok(())
    }

    async fn reset_for_reprocess(&self, id: &str) -> Result<Option<Document>, PipelineError> {
        let row: Option<DocumentRow> = sqlx::query_as(
            r#"
            UPDATE documents
            SET status = 'uploaded', analysis_done = FALSE, indexing_done = FALSE,
                error_message = NULL, updated_at = NOW()
            WHERE id = $1 AND status IN ('completed', 'error')
            RETURNING *
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(into_document).transpose()
    }

    async fn upsert_analysis(
        &self,
        document_id: &str,
        result: &AnalysisResult,
    ) -> Result<(), PipelineError> {
        let analysis = serde_json::to_value(result)
            .map_err(|e| PipelineError::SchemaViolation(format!("unserializable analysis: {e}")))?;
        sqlx::query(
            r#"
            INSERT INTO resume_analyses (id, resume_id, ats_score, analysis)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (resume_id) DO UPDATE
            SET ats_score = EXCLUDED.ats_score,
                analysis = EXCLUDED.analysis,
                updated_at = NOW()
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(document_id)
        .bind(result.ats_score)
        .bind(&analysis)
        .execute(&self.pool)
        .await?;
        info!("Analysis saved for document {document_id}");
        Ok(())
    }

    async fn get_analysis(
        &self,
        document_id: &str,
    ) -> Result<Option<AnalysisResult>, PipelineError> {
        let row: Option<AnalysisRow> =
            sqlx::query_as("SELECT * FROM resume_analyses WHERE resume_id = $1")
                .bind(document_id)
                .fetch_optional(&self.pool)
                .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        match serde_json::from_value::<AnalysisResult>(row.analysis) {
            Ok(result) => Ok(Some(result)),
            Err(e) => {
                warn!("Stored analysis for {document_id} no longer matches the schema: {e}");
                Ok(None)
            }
        }
    }
}
