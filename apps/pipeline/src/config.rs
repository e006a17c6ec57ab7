use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Context, Result};

/// Which parts of the pipeline this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    All,
    Api,
    AnalysisWorker,
    IndexingWorker,
}

impl Role {
    pub fn serves_api(&self) -> bool {
        matches!(self, Role::All | Role::Api)
    }

    pub fn runs_analysis(&self) -> bool {
        matches!(self, Role::All | Role::AnalysisWorker)
    }

    pub fn runs_indexing(&self) -> bool {
        matches!(self, Role::All | Role::IndexingWorker)
    }
}

impl FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "all" => Ok(Role::All),
            "api" => Ok(Role::Api),
            "analysis-worker" => Ok(Role::AnalysisWorker),
            "indexing-worker" => Ok(Role::IndexingWorker),
            other => bail!(
                "PIPELINE_ROLE must be one of all, api, analysis-worker, indexing-worker (got '{other}')"
            ),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::All => "all",
            Role::Api => "api",
            Role::AnalysisWorker => "analysis-worker",
            Role::IndexingWorker => "indexing-worker",
        })
    }
}

/// Application configuration loaded from environment variables.
/// Startup fails if required variables are missing or malformed.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,
    pub s3_endpoint: String,
    pub aws_access_key_id: String,
    pub aws_secret_access_key: String,
    pub anthropic_api_key: String,
    pub port: u16,
    pub rust_log: String,
    pub role: Role,

    pub qdrant_url: String,
    pub qdrant_api_key: Option<String>,
    pub qdrant_collection: String,

    pub embedding_api_key: String,
    pub embedding_base_url: String,
    pub embedding_model: String,
    pub embedding_dimensions: usize,

    pub analysis_queue: String,
    pub indexing_queue: String,
    pub analysis_concurrency: usize,
    pub indexing_concurrency: usize,
    pub job_max_attempts: u32,
    /// Seconds a worker's claim on its in-flight jobs survives without renewal.
    pub queue_lease_secs: u64,

    pub min_text_chars: usize,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub chat_top_k: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let require = |key: &str| {
            lookup(key).with_context(|| format!("Required environment variable '{key}' is not set"))
        };
        let or_default = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let config = Config {
            database_url: require("DATABASE_URL")?,
            redis_url: require("REDIS_URL")?,
            s3_endpoint: require("S3_ENDPOINT")?,
            aws_access_key_id: require("AWS_ACCESS_KEY_ID")?,
            aws_secret_access_key: require("AWS_SECRET_ACCESS_KEY")?,
            anthropic_api_key: require("ANTHROPIC_API_KEY")?,
            port: parse_var(&lookup, "PORT", 8080)?,
            rust_log: or_default("RUST_LOG", "info"),
            role: or_default("PIPELINE_ROLE", "all").parse()?,

            qdrant_url: or_default("QDRANT_URL", "http://localhost:6333"),
            qdrant_api_key: lookup("QDRANT_API_KEY").filter(|k| !k.is_empty()),
            qdrant_collection: or_default("QDRANT_COLLECTION", "resume-chunks"),

            embedding_api_key: require("EMBEDDING_API_KEY")?,
            embedding_base_url: or_default("EMBEDDING_BASE_URL", "https://api.openai.com/v1"),
            embedding_model: or_default("EMBEDDING_MODEL", "text-embedding-3-small"),
            embedding_dimensions: parse_var(&lookup, "EMBEDDING_DIMENSIONS", 1536)?,

            analysis_queue: or_default("ANALYSIS_QUEUE", "resume-analyse"),
            indexing_queue: or_default("INDEXING_QUEUE", "resume-processing"),
            analysis_concurrency: parse_var(&lookup, "ANALYSIS_CONCURRENCY", 5)?,
            indexing_concurrency: parse_var(&lookup, "INDEXING_CONCURRENCY", 100)?,
            job_max_attempts: parse_var(&lookup, "JOB_MAX_ATTEMPTS", 3)?,
            queue_lease_secs: parse_var(&lookup, "QUEUE_LEASE_SECS", 30)?,

            min_text_chars: parse_var(&lookup, "MIN_TEXT_CHARS", 50)?,
            chunk_size: parse_var(&lookup, "CHUNK_SIZE", 1000)?,
            chunk_overlap: parse_var(&lookup, "CHUNK_OVERLAP", 200)?,
            chat_top_k: parse_var(&lookup, "CHAT_TOP_K", 5)?,
        };

        if config.chunk_overlap >= config.chunk_size {
            bail!(
                "CHUNK_OVERLAP ({}) must be smaller than CHUNK_SIZE ({})",
                config.chunk_overlap,
                config.chunk_size
            );
        }
        if config.job_max_attempts == 0 {
            bail!("JOB_MAX_ATTEMPTS must be at least 1");
        }
        if config.queue_lease_secs < 3 {
            bail!("QUEUE_LEASE_SECS must be at least 3");
        }
        Ok(config)
    }
}

fn parse_var<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("{key} must be a valid number (got '{raw}')")),
        None => Ok(default),
    }
}
