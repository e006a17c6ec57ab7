//! Document Extractor: binary document in, plain text out.

use async_trait::async_trait;
use bytes::Bytes;

use crate::errors::PipelineError;

/// Carried as `Arc<dyn DocumentExtractor>`.
#[async_trait]
pub trait DocumentExtractor: Send + Sync {
    /// Raw text of the document, before normalization and the length check.
    async fn extract(&self, document: Bytes) -> Result<String, PipelineError>;
}

/// PDF text extraction via `pdf-extract`, run on the blocking pool.
#[derive(Debug, Clone, Copy, Default)]
pub struct PdfExtractor;

#[async_trait]
impl DocumentExtractor for PdfExtractor {
    async fn extract(&self, document: Bytes) -> Result<String, PipelineError> {
        // pdf-extract can panic on malformed input; the join error captures it.
        tokio::task::spawn_blocking(move || pdf_extract::extract_text_from_mem(&document))
            .await
            .map_err(|e| PipelineError::Extraction(format!("PDF parser aborted: {e}")))?
            .map_err(|e| PipelineError::Extraction(format!("unreadable PDF: {e}")))
    }
}

/// Extracts, normalizes, and enforces the minimum-length policy.
pub async fn extract_text(
    extractor: &dyn DocumentExtractor,
    document: Bytes,
    min_chars: usize,
) -> Result<String, PipelineError> {
    let raw = extractor.extract(document).await?;
    accept_text(&raw, min_chars)
}

/// Collapses page boundaries and blank lines, then rejects text that is
/// empty or shorter than `min_chars` characters.
pub fn accept_text(raw: &str, min_chars: usize) -> Result<String, PipelineError> {
    let text = normalize_text(raw);
    if text.is_empty() {
        return Err(PipelineError::Extraction(
            "document contains no extractable text (may be image-based)".to_string(),
        ));
    }
    let chars = text.chars().count();
    if chars < min_chars {
        return Err(PipelineError::InsufficientContent {
            chars,
            min: min_chars,
        });
    }
    Ok(text)
}

fn normalize_text(raw: &str) -> String {
    raw.replace('\u{c}', "\n")
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}
