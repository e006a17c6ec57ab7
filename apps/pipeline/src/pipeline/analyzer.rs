//! Structured Analyzer: resume text in, schema-valid `AnalysisResult` out.
//!
//! Parse-or-reject: model output that does not match the schema is a
//! `SchemaViolation`, never patched. Every accepted result is re-validated
//! independently before it is handed to the record store.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::errors::PipelineError;
use crate::llm_client::prompts::JSON_ONLY_SYSTEM;
use crate::llm_client::{render_prompt, strip_json_fences, ChatModel};
use crate::models::analysis::AnalysisResult;
use crate::pipeline::prompts::{ANALYSIS_PROMPT_TEMPLATE, ANALYSIS_SCHEMA};

pub struct Analyzer {
    model: Arc<dyn ChatModel>,
}

impl Analyzer {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self { model }
    }

    pub async fn analyze(&self, text: &str) -> Result<AnalysisResult, PipelineError> {
        let prompt = build_analysis_prompt(text);
        let output = self.model.complete(JSON_ONLY_SYSTEM, &prompt).await?;
        debug!("Analysis model returned {} bytes", output.len());

        let result = parse_analysis(&output).inspect_err(|e| {
            warn!("Rejected analysis output: {e}");
        })?;
        revalidate(&result)?;
        Ok(result)
    }
}

pub fn build_analysis_prompt(text: &str) -> String {
    render_prompt(
        ANALYSIS_PROMPT_TEMPLATE,
        &[("schema", ANALYSIS_SCHEMA), ("resume_text", text)],
    )
}

/// First validation pass: the model's text must be schema-shaped JSON.
pub fn parse_analysis(output: &str) -> Result<AnalysisResult, PipelineError> {
    let body = strip_json_fences(output);
    let result: AnalysisResult = serde_json::from_str(body)
        .map_err(|e| PipelineError::SchemaViolation(format!("invalid analysis JSON: {e}")))?;
    result
        .check_constraints()
        .map_err(PipelineError::SchemaViolation)?;
    Ok(result)
}

/// Second, independent pass over the value about to be persisted: it must
/// survive serialization and re-parse unchanged under the same rules.
pub fn revalidate(result: &AnalysisResult) -> Result<(), PipelineError> {
    let value = serde_json::to_value(result)
        .map_err(|e| PipelineError::SchemaViolation(format!("unserializable analysis: {e}")))?;
    let reparsed: AnalysisResult = serde_json::from_value(value)
        .map_err(|e| PipelineError::SchemaViolation(format!("re-validation failed: {e}")))?;
    reparsed
        .check_constraints()
        .map_err(PipelineError::SchemaViolation)?;
    if &reparsed != result {
        return Err(PipelineError::SchemaViolation(
            "analysis changed across re-validation".to_string(),
        ));
    }
    Ok(())
}
