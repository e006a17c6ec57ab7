//! In-memory stand-ins for the external services, shared by unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;

use crate::embeddings::{Embedder, EmbeddingError};
use crate::errors::PipelineError;
use crate::llm_client::{ChatModel, LlmError};
use crate::models::analysis::AnalysisResult;
use crate::models::document::{Document, DocumentStatus, NewDocument, Stage};
use crate::pipeline::extractor::DocumentExtractor;
use crate::pipeline::fetch::DocumentFetcher;
use crate::queue::{Job, JobQueue, QueueError, Reservation};
use crate::store::RecordStore;
use crate::vector_index::{ChunkPayload, IndexError, IndexedChunk, ScoredChunk, VectorIndex};

pub const VALID_ANALYSIS: &str = r#"{
    "atsScore": 82,
    "grammarErrors": [{"error": "Responsible of", "suggestion": "Responsible for"}],
    "spellingErrors": [{"word": "Kubernets", "suggestion": "Kubernetes"}],
    "formattingIssues": [{"issue": "Inconsistent date format", "suggestion": "Use MMM YYYY"}],
    "impactWords": ["Led", "Reduced"],
    "missingKeywords": ["Terraform"],
    "matchingKeywords": ["Rust", "Postgres"],
    "summary": "Experienced backend engineer."
}"#;

pub fn resume_text() -> String {
    [
        "Jane Doe, Senior Backend Engineer.",
        "Experience: Led the payments team at Acme, building Rust services on Tokio and Postgres.",
        "Reduced checkout latency by 40 percent by moving hot paths to Redis.",
        "Skills: Rust, Go, Postgres, Redis, Kubernets, AWS.",
        "Education: BSc Computer Science, University of Somewhere.",
    ]
    .join("\n")
}

// ---------------------------------------------------------------------------
// Record store
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryStore {
    documents: Mutex<HashMap<String, Document>>,
    analyses: Mutex<HashMap<String, AnalysisResult>>,
    /// Number of upcoming `complete_stage` calls that fail with a store error.
    failing_completions: AtomicUsize,
    /// Number of upcoming `fail_document` calls that fail with a store error.
    failing_error_writes: AtomicUsize,
}

impl MemoryStore {
    pub fn analysis_count(&self) -> usize {
        self.analyses.lock().unwrap().len()
    }

    pub fn fail_next_completions(&self, n: usize) {
        self.failing_completions.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_error_writes(&self, n: usize) {
        self.failing_error_writes.store(n, Ordering::SeqCst);
    }

    pub fn status(&self, id: &str) -> Option<DocumentStatus> {
        self.documents.lock().unwrap().get(id).map(|d| d.status)
    }

    fn update<F>(&self, id: &str, f: F) -> Option<Document>
    where
        F: FnOnce(&mut Document),
    {
        let mut documents = self.documents.lock().unwrap();
        let document = documents.get_mut(id)?;
        f(document);
        document.updated_at = Utc::now();
        Some(document.clone())
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn create_document(&self, new: &NewDocument) -> Result<Option<Document>, PipelineError> {
        let mut documents = self.documents.lock().unwrap();
        if documents.contains_key(&new.id) {
            return Ok(None);
        }
        let now = Utc::now();
        let document = Document {
            id: new.id.clone(),
            owner_id: new.owner_id.clone(),
            source_url: new.source_url.clone(),
            status: DocumentStatus::Uploaded,
            analysis_done: false,
            indexing_done: false,
            error_message: None,
            created_at: now,
            updated_at: now,
        };
        documents.insert(new.id.clone(), document.clone());
        Ok(Some(document))
    }

    async fn get_document(&self, id: &str) -> Result<Option<Document>, PipelineError> {
        Ok(self.documents.lock().unwrap().get(id).cloned())
    }

    async fn begin_stage(&self, id: &str) -> Result<Option<Document>, PipelineError> {
        Ok(self.update(id, |d| d.status = d.status.on_stage_started()))
    }

    async fn complete_stage(&self, id: &str, stage: Stage) -> Result<Document, PipelineError> {
        let pending = self.failing_completions.load(Ordering::SeqCst);
        if pending > 0 {
            self.failing_completions.store(pending - 1, Ordering::SeqCst);
            return Err(PipelineError::Store(sqlx::Error::PoolTimedOut));
        }
        self.update(id, |d| {
            match stage {
                Stage::Analysis => d.analysis_done = true,
                Stage::Indexing => d.indexing_done = true,
            }
            d.status = d.status.on_stage_completed(d.stage_done(stage.sibling()));
        })
        .ok_or_else(|| PipelineError::DocumentNotFound(id.to_string()))
    }

    async fn fail_document(&self, id: &str, message: &str) -> Result<(), PipelineError> {
        let pending = self.failing_error_writes.load(Ordering::SeqCst);
        if pending > 0 {
            self.failing_error_writes.store(pending - 1, Ordering::SeqCst);
            return Err(PipelineError::Store(sqlx::Error::PoolTimedOut));
        }
        self.update(id, |d| {
            if d.status != DocumentStatus::Completed {
                d.status = d.status.on_stage_failed();
                d.error_message = Some(message.to_string());
            }
        });
        Ok(())
    }

    async fn reset_for_reprocess(&self, id: &str) -> Result<Option<Document>, PipelineError> {
        let terminal = self.status(id).is_some_and(|s| s.is_terminal());
        if !terminal {
            return Ok(None);
        }
        Ok(self.update(id, |d| {
            d.status = DocumentStatus::Uploaded;
            d.analysis_done = false;
            d.indexing_done = false;
            d.error_message = None;
        }))
    }

    async fn upsert_analysis(
        &self,
        document_id: &str,
        result: &AnalysisResult,
    ) -> Result<(), PipelineError> {
        if !self.documents.lock().unwrap().contains_key(document_id) {
            return Err(PipelineError::DocumentNotFound(document_id.to_string()));
        }
        self.analyses
            .lock()
            .unwrap()
            .insert(document_id.to_string(), result.clone());
        Ok(())
    }

    async fn get_analysis(
        &self,
        document_id: &str,
    ) -> Result<Option<AnalysisResult>, PipelineError> {
        Ok(self.analyses.lock().unwrap().get(document_id).cloned())
    }
}

// ---------------------------------------------------------------------------
// Vector index + embeddings
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryIndex {
    chunks: Mutex<HashMap<String, Vec<IndexedChunk>>>,
}

impl MemoryIndex {
    pub fn payloads(&self, document_id: &str) -> Vec<ChunkPayload> {
        self.chunks
            .lock()
            .unwrap()
            .get(document_id)
            .map(|chunks| chunks.iter().map(|c| c.payload.clone()).collect())
            .unwrap_or_default()
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm = |v: &[f32]| v.iter().map(|x| x * x).sum::<f32>().sqrt();
    let denom = norm(a) * norm(b);
    if denom == 0.0 {
        0.0
    } else {
        dot / denom
    }
}

#[async_trait]
impl VectorIndex for MemoryIndex {
    async fn ensure_ready(&self) -> Result<(), IndexError> {
        Ok(())
    }

    async fn replace_document(
        &self,
        document_id: &str,
        chunks: Vec<IndexedChunk>,
    ) -> Result<usize, IndexError> {
        let stored = chunks.len();
        self.chunks
            .lock()
            .unwrap()
            .insert(document_id.to_string(), chunks);
        Ok(stored)
    }

    async fn search(
        &self,
        document_id: &str,
        vector: &[f32],
        limit: usize,
    ) -> Result<Vec<ScoredChunk>, IndexError> {
        let chunks = self.chunks.lock().unwrap();
        let mut scored: Vec<ScoredChunk> = chunks
            .get(document_id)
            .map(|chunks| {
                chunks
                    .iter()
                    .map(|c| ScoredChunk {
                        score: cosine(&c.vector, vector),
                        payload: c.payload.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(limit);
        Ok(scored)
    }

    async fn count(&self, document_id: &str) -> Result<usize, IndexError> {
        Ok(self
            .chunks
            .lock()
            .unwrap()
            .get(document_id)
            .map_or(0, Vec::len))
    }

    async fn delete_document(&self, document_id: &str) -> Result<(), IndexError> {
        self.chunks.lock().unwrap().remove(document_id);
        Ok(())
    }
}

const HASH_DIMENSIONS: usize = 32;

/// Bag-of-words vectors: each lowercase word bumps one hashed bucket.
#[derive(Default)]
pub struct HashEmbedder {
    fail: bool,
}

impl HashEmbedder {
    pub fn failing() -> Self {
        Self { fail: true }
    }

    fn vector(text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; HASH_DIMENSIONS];
        for word in text.split_whitespace() {
            let word = word
                .trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase();
            if word.is_empty() {
                continue;
            }
            let bucket = word
                .bytes()
                .fold(17usize, |h, b| h.wrapping_mul(31).wrapping_add(b as usize))
                % HASH_DIMENSIONS;
            v[bucket] += 1.0;
        }
        v
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if self.fail {
            return Err(EmbeddingError::Api {
                status: 503,
                message: "embedding service unavailable".into(),
            });
        }
        Ok(inputs.iter().map(|t| Self::vector(t)).collect())
    }
}

// ---------------------------------------------------------------------------
// Chat model
// ---------------------------------------------------------------------------

/// Replies with a fixed string, optionally after a number of failures.
pub struct ScriptedModel {
    reply: Option<String>,
    failures_left: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedModel {
    pub fn replying(reply: &str) -> Self {
        Self::flaky(0, reply)
    }

    pub fn failing() -> Self {
        Self {
            reply: None,
            failures_left: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Fails the first `failures` calls, then replies.
    pub fn flaky(failures: usize, reply: &str) -> Self {
        Self {
            reply: Some(reply.to_string()),
            failures_left: AtomicUsize::new(failures),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    pub fn last_prompt(&self) -> Option<String> {
        self.prompts.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    async fn complete(&self, _system: &str, prompt: &str) -> Result<String, LlmError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(LlmError::RateLimited { retries: 3 });
        }
        self.reply.clone().ok_or(LlmError::Api {
            status: 500,
            message: "model unavailable".into(),
        })
    }
}

// ---------------------------------------------------------------------------
// Fetch + extract
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryFetcher {
    files: HashMap<String, Bytes>,
}

impl MemoryFetcher {
    pub fn with(url: &str, text: &str) -> Self {
        let mut fetcher = Self::default();
        fetcher
            .files
            .insert(url.to_string(), Bytes::from(text.to_string()));
        fetcher
    }
}

#[async_trait]
impl DocumentFetcher for MemoryFetcher {
    async fn fetch(&self, source_url: &str) -> Result<Bytes, PipelineError> {
        self.files
            .get(source_url)
            .cloned()
            .ok_or_else(|| PipelineError::Fetch {
                url: source_url.to_string(),
                reason: "not found".into(),
                transient: false,
            })
    }
}

/// Treats the document bytes as UTF-8 text.
pub struct PlainTextExtractor;

#[async_trait]
impl DocumentExtractor for PlainTextExtractor {
    async fn extract(&self, document: Bytes) -> Result<String, PipelineError> {
        String::from_utf8(document.to_vec()).map_err(|e| PipelineError::Extraction(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Job queue
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Lists {
    pending: VecDeque<String>,
    /// Reserved by this consumer.
    processing: Vec<String>,
    /// Left in flight by a consumer whose lease lapsed.
    abandoned: Vec<String>,
    failed: Vec<String>,
    heartbeats: usize,
}

#[derive(Default)]
pub struct MemoryQueue {
    queues: Mutex<HashMap<String, Lists>>,
    /// Number of upcoming `enqueue` calls that fail.
    failing_enqueues: AtomicUsize,
}

impl MemoryQueue {
    pub fn pending(&self, queue: &str) -> Vec<Job> {
        self.with(queue, |l| {
            l.pending
                .iter()
                .filter_map(|raw| serde_json::from_str(raw).ok())
                .collect()
        })
    }

    pub fn in_flight(&self, queue: &str) -> usize {
        self.with(queue, |l| l.processing.len() + l.abandoned.len())
    }

    pub fn failed(&self, queue: &str) -> Vec<String> {
        self.with(queue, |l| l.failed.clone())
    }

    pub fn heartbeats(&self, queue: &str) -> usize {
        self.with(queue, |l| l.heartbeats)
    }

    pub fn fail_next_enqueues(&self, n: usize) {
        self.failing_enqueues.store(n, Ordering::SeqCst);
    }

    /// Hands every live reservation over to a consumer that has died.
    pub fn abandon_in_flight(&self, queue: &str) {
        self.with(queue, |l| {
            let live: Vec<String> = l.processing.drain(..).collect();
            l.abandoned.extend(live);
        });
    }

    fn with<T>(&self, queue: &str, f: impl FnOnce(&mut Lists) -> T) -> T {
        let mut queues = self.queues.lock().unwrap();
        f(queues.entry(queue.to_string()).or_default())
    }

    fn release(lists: &mut Lists, raw: &str) {
        if let Some(pos) = lists.processing.iter().position(|r| r == raw) {
            lists.processing.remove(pos);
        }
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(&self, queue: &str, job: &Job) -> Result<(), QueueError> {
        let pending = self.failing_enqueues.load(Ordering::SeqCst);
        if pending > 0 {
            self.failing_enqueues.store(pending - 1, Ordering::SeqCst);
            return Err(QueueError::Redis(redis::RedisError::from((
                redis::ErrorKind::IoError,
                "connection refused",
            ))));
        }
        let raw = serde_json::to_string(job)?;
        self.with(queue, |l| l.pending.push_back(raw));
        Ok(())
    }

    async fn reserve(
        &self,
        queue: &str,
        timeout: Duration,
    ) -> Result<Option<Reservation>, QueueError> {
        let raw = self.with(queue, |l| {
            let raw = l.pending.pop_front()?;
            l.processing.push(raw.clone());
            Some(raw)
        });
        match raw {
            Some(raw) => Ok(Some(Reservation {
                job: serde_json::from_str(&raw)?,
                raw,
            })),
            None => {
                tokio::time::sleep(timeout.min(Duration::from_millis(5))).await;
                Ok(None)
            }
        }
    }

    async fn ack(&self, queue: &str, reservation: &Reservation) -> Result<(), QueueError> {
        self.with(queue, |l| Self::release(l, &reservation.raw));
        Ok(())
    }

    async fn retry(
        &self,
        queue: &str,
        reservation: &Reservation,
        job: &Job,
    ) -> Result<(), QueueError> {
        let raw = serde_json::to_string(job)?;
        self.with(queue, |l| {
            Self::release(l, &reservation.raw);
            l.pending.push_back(raw);
        });
        Ok(())
    }

    async fn dead_letter(
        &self,
        queue: &str,
        reservation: &Reservation,
        reason: &str,
    ) -> Result<(), QueueError> {
        self.with(queue, |l| {
            Self::release(l, &reservation.raw);
            l.failed.push(format!("{reason}: {}", reservation.raw));
        });
        Ok(())
    }

    async fn heartbeat(&self, queue: &str) -> Result<(), QueueError> {
        self.with(queue, |l| l.heartbeats += 1);
        Ok(())
    }

    async fn recover_in_flight(&self, queue: &str) -> Result<usize, QueueError> {
        self.heartbeat(queue).await?;
        Ok(self.with(queue, |l| {
            let orphaned: Vec<String> = l.abandoned.drain(..).collect();
            let n = orphaned.len();
            l.pending.extend(orphaned);
            n
        }))
    }
}
