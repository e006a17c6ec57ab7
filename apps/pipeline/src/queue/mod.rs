//! Job queue with durable, at-least-once delivery of per-document work items.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod redis;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("Job payload error: {0}")]
    Payload(#[from] serde_json::Error),
}

/// One unit of queued work for a single uploaded document.
///
/// Wire shape matches the upload handler's payload; `attempt` is absent on
/// first delivery and incremented by the runner on each retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub file_url: String,
    pub user_id: String,
    pub resume_id: String,
    #[serde(default)]
    pub attempt: u32,
}

impl Job {
    pub fn new(resume_id: &str, user_id: &str, file_url: &str) -> Self {
        Self {
            file_url: file_url.to_string(),
            user_id: user_id.to_string(),
            resume_id: resume_id.to_string(),
            attempt: 0,
        }
    }

    pub fn next_attempt(&self) -> Job {
        Job {
            attempt: self.attempt + 1,
            ..self.clone()
        }
    }
}

/// A job taken off a queue but not yet acknowledged.
///
/// `raw` is the exact payload as stored, needed to remove it from the
/// in-flight list.
#[derive(Debug, Clone)]
pub struct Reservation {
    pub job: Job,
    pub raw: String,
}

/// Carried as `Arc<dyn JobQueue>`.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, queue: &str, job: &Job) -> Result<(), QueueError>;

    /// Blocks up to `timeout` for the next job. The job stays in flight until
    /// acknowledged, retried, or dead-lettered.
    async fn reserve(&self, queue: &str, timeout: Duration)
        -> Result<Option<Reservation>, QueueError>;

    async fn ack(&self, queue: &str, reservation: &Reservation) -> Result<(), QueueError>;

    /// Replaces the in-flight job with `job` at the back of the queue.
    async fn retry(
        &self,
        queue: &str,
        reservation: &Reservation,
        job: &Job,
    ) -> Result<(), QueueError>;

    /// Moves the in-flight job to the queue's failed list.
    async fn dead_letter(
        &self,
        queue: &str,
        reservation: &Reservation,
        reason: &str,
    ) -> Result<(), QueueError>;

    /// Renews this consumer's lease on `queue`. Jobs it holds in flight are
    /// only recoverable by others once the lease lapses.
    async fn heartbeat(&self, queue: &str) -> Result<(), QueueError>;

    /// Returns jobs held by consumers whose lease has lapsed to the queue.
    /// Jobs in flight with live consumers, this one included, are left alone.
    async fn recover_in_flight(&self, queue: &str) -> Result<usize, QueueError>;
}
