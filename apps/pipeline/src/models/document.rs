use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Processing status of an uploaded document.
///
/// `uploaded → parsing → analyzing → completed`, with `error` reachable from
/// any in-flight state. `analyzing` marks that exactly one of the two stages
/// has finished and the other is still running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Uploaded,
    Parsing,
    Analyzing,
    Completed,
    Error,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Uploaded => "uploaded",
            DocumentStatus::Parsing => "parsing",
            DocumentStatus::Analyzing => "analyzing",
            DocumentStatus::Completed => "completed",
            DocumentStatus::Error => "error",
        }
    }

    /// Terminal states are only left through an explicit reprocess request.
    pub fn is_terminal(&self) -> bool {
        matches!(self, DocumentStatus::Completed | DocumentStatus::Error)
    }

    /// Status after a worker picks up a job for this document.
    pub fn on_stage_started(self) -> Self {
        match self {
            DocumentStatus::Uploaded => DocumentStatus::Parsing,
            other => other,
        }
    }

    /// Status after one stage reports success. `sibling_done` is the other
    /// stage's flag as seen by the same atomic update.
    pub fn on_stage_completed(self, sibling_done: bool) -> Self {
        match self {
            DocumentStatus::Error | DocumentStatus::Completed => self,
            _ if sibling_done => DocumentStatus::Completed,
            _ => DocumentStatus::Analyzing,
        }
    }

    /// Status after a fatal stage failure. A completed document stays completed.
    pub fn on_stage_failed(self) -> Self {
        match self {
            DocumentStatus::Completed => self,
            _ => DocumentStatus::Error,
        }
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uploaded" => Ok(DocumentStatus::Uploaded),
            "parsing" => Ok(DocumentStatus::Parsing),
            "analyzing" => Ok(DocumentStatus::Analyzing),
            "completed" => Ok(DocumentStatus::Completed),
            "error" => Ok(DocumentStatus::Error),
            other => Err(format!("unknown document status '{other}'")),
        }
    }
}

/// The two independent halves of the pipeline that must both succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Analysis,
    Indexing,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Analysis => "analysis",
            Stage::Indexing => "indexing",
        }
    }

    /// Column holding this stage's completion flag.
    pub fn flag_column(&self) -> &'static str {
        match self {
            Stage::Analysis => "analysis_done",
            Stage::Indexing => "indexing_done",
        }
    }

    pub fn sibling(&self) -> Stage {
        match self {
            Stage::Analysis => Stage::Indexing,
            Stage::Indexing => Stage::Analysis,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct DocumentRow {
    pub id: String,
    pub owner_id: String,
    pub source_url: String,
    pub status: String,
    pub analysis_done: bool,
    pub indexing_done: bool,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: String,
    pub owner_id: String,
    pub source_url: String,
    pub status: DocumentStatus,
    pub analysis_done: bool,
    pub indexing_done: bool,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    pub fn stage_done(&self, stage: Stage) -> bool {
        match stage {
            Stage::Analysis => self.analysis_done,
            Stage::Indexing => self.indexing_done,
        }
    }
}

impl TryFrom<DocumentRow> for Document {
    type Error = String;

    fn try_from(row: DocumentRow) -> Result<Self, Self::Error> {
        Ok(Document {
            status: row.status.parse()?,
            id: row.id,
            owner_id: row.owner_id,
            source_url: row.source_url,
            analysis_done: row.analysis_done,
            indexing_done: row.indexing_done,
            error_message: row.error_message,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Fields supplied when a document is registered after upload.
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub id: String,
    pub owner_id: String,
    pub source_url: String,
}
