use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

pub const ATS_SCORE_MIN: f64 = 0.0;
pub const ATS_SCORE_MAX: f64 = 100.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GrammarError {
    pub error: String,
    pub suggestion: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SpellingError {
    pub word: String,
    pub suggestion: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FormattingIssue {
    pub issue: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

/// Structured resume analysis produced by the model.
///
/// Field names match the persisted JSON (`camelCase`). Unknown fields are a
/// schema violation; absent arrays default to empty. `ats_score` absent means
/// "unscored" and is never coerced to 0.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AnalysisResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ats_score: Option<f64>,
    #[serde(default)]
    pub grammar_errors: Vec<GrammarError>,
    #[serde(default)]
    pub spelling_errors: Vec<SpellingError>,
    #[serde(default)]
    pub formatting_issues: Vec<FormattingIssue>,
    #[serde(default)]
    pub impact_words: Vec<String>,
    #[serde(default)]
    pub missing_keywords: Vec<String>,
    #[serde(default)]
    pub matching_keywords: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl AnalysisResult {
    /// Checks the constraints serde cannot express. Returns the violation message.
    pub fn check_constraints(&self) -> Result<(), String> {
        if let Some(score) = self.ats_score {
            if !score.is_finite() {
                return Err("atsScore must be a finite number".to_string());
            }
            if !(ATS_SCORE_MIN..=ATS_SCORE_MAX).contains(&score) {
                return Err(format!(
                    "atsScore {score} is outside [{ATS_SCORE_MIN}, {ATS_SCORE_MAX}]"
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct AnalysisRow {
    pub id: Uuid,
    pub resume_id: String,
    pub ats_score: Option<f64>,
    pub analysis: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
