//! Redis reliable-queue backend.
//!
//! `queue:{name}` holds pending jobs (LPUSH / BRPOPLPUSH, so FIFO) and
//! `queue:{name}:failed` holds dead-lettered jobs with their failure reason.
//! Every consumer reserves into its own `queue:{name}:processing:{consumer}`
//! list and keeps a `queue:{name}:lease:{consumer}` key alive while it runs.
//! Consumers are registered in `queue:{name}:consumers`; a consumer whose
//! lease has expired is dead, and its processing list goes back to pending.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::Client as RedisClient;
use serde_json::json;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{Job, JobQueue, QueueError, Reservation};

pub struct RedisJobQueue {
    client: RedisClient,
    /// Shared, reconnecting connection for every non-blocking command.
    commands: ConnectionManager,
    /// One connection per queue for BRPOPLPUSH.
    blocking: Mutex<HashMap<String, MultiplexedConnection>>,
    consumer: String,
    lease: Duration,
}

impl RedisJobQueue {
    pub async fn connect(client: RedisClient, lease: Duration) -> Result<Self, QueueError> {
        let commands = ConnectionManager::new(client.clone()).await?;
        Ok(Self {
            client,
            commands,
            blocking: Mutex::new(HashMap::new()),
            consumer: Uuid::new_v4().to_string(),
            lease,
        })
    }

    pub fn consumer_id(&self) -> &str {
        &self.consumer
    }

    async fn blocking_connection(&self, queue: &str) -> Result<MultiplexedConnection, QueueError> {
        let cached = self
            .blocking
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(queue)
            .cloned();
        if let Some(conn) = cached {
            return Ok(conn);
        }
        let conn = self.client.get_multiplexed_async_connection().await?;
        self.blocking
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(queue.to_string(), conn.clone());
        Ok(conn)
    }

    fn drop_blocking_connection(&self, queue: &str) {
        self.blocking
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(queue);
    }

    fn processing(&self, queue: &str) -> String {
        processing_key(queue, &self.consumer)
    }

    /// Drops `raw` from this consumer's processing list in the same
    /// transaction as `pipe`'s other commands.
    async fn settle(
        &self,
        queue: &str,
        raw: &str,
        mut pipe: redis::Pipeline,
    ) -> Result<(), QueueError> {
        pipe.cmd("LREM")
            .arg(self.processing(queue))
            .arg(1)
            .arg(raw)
            .ignore();
        let mut conn = self.commands.clone();
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    /// Moves everything in `consumer`'s processing list back to pending.
    async fn requeue_consumer(&self, queue: &str, consumer: &str) -> Result<usize, QueueError> {
        let mut conn = self.commands.clone();
        let mut moved = 0usize;
        loop {
            let job: Option<String> = redis::cmd("RPOPLPUSH")
                .arg(processing_key(queue, consumer))
                .arg(pending_key(queue))
                .query_async(&mut conn)
                .await?;
            if job.is_none() {
                break;
            }
            moved += 1;
        }
        redis::cmd("SREM")
            .arg(consumers_key(queue))
            .arg(consumer)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(moved)
    }
}

fn pending_key(queue: &str) -> String {
    format!("queue:{queue}")
}

fn processing_key(queue: &str, consumer: &str) -> String {
    format!("queue:{queue}:processing:{consumer}")
}

fn lease_key(queue: &str, consumer: &str) -> String {
    format!("queue:{queue}:lease:{consumer}")
}

fn consumers_key(queue: &str) -> String {
    format!("queue:{queue}:consumers")
}

fn failed_key(queue: &str) -> String {
    format!("queue:{queue}:failed")
}

/// BRPOPLPUSH takes whole seconds; zero would block forever.
fn blocking_timeout_secs(timeout: Duration) -> u64 {
    timeout.as_secs().max(1)
}

fn lease_millis(lease: Duration) -> u64 {
    u64::try_from(lease.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn enqueue(&self, queue: &str, job: &Job) -> Result<(), QueueError> {
        let payload = serde_json::to_string(job)?;
        let mut conn = self.commands.clone();
        redis::cmd("LPUSH")
            .arg(pending_key(queue))
            .arg(payload)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn reserve(
        &self,
        queue: &str,
        timeout: Duration,
    ) -> Result<Option<Reservation>, QueueError> {
        let mut conn = self.blocking_connection(queue).await?;
        let reserved: Result<Option<String>, _> = redis::cmd("BRPOPLPUSH")
            .arg(pending_key(queue))
            .arg(self.processing(queue))
            .arg(blocking_timeout_secs(timeout))
            .query_async(&mut conn)
            .await;
        let raw = match reserved {
            Ok(Some(raw)) => raw,
            Ok(None) => return Ok(None),
            Err(e) => {
                self.drop_blocking_connection(queue);
                return Err(e.into());
            }
        };

        match serde_json::from_str::<Job>(&raw) {
            Ok(job) => Ok(Some(Reservation { job, raw })),
            Err(e) => {
                warn!("Dropping malformed job on '{queue}': {e}");
                let entry = json!({ "raw": raw, "reason": format!("malformed payload: {e}") });
                let mut pipe = redis::pipe();
                pipe.atomic()
                    .cmd("LPUSH")
                    .arg(failed_key(queue))
                    .arg(entry.to_string())
                    .ignore();
                self.settle(queue, &raw, pipe).await?;
                Ok(None)
            }
        }
    }

    async fn ack(&self, queue: &str, reservation: &Reservation) -> Result<(), QueueError> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        self.settle(queue, &reservation.raw, pipe).await
    }

    async fn retry(
        &self,
        queue: &str,
        reservation: &Reservation,
        job: &Job,
    ) -> Result<(), QueueError> {
        let payload = serde_json::to_string(job)?;
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("LPUSH")
            .arg(pending_key(queue))
            .arg(payload)
            .ignore();
        self.settle(queue, &reservation.raw, pipe).await
    }

    async fn dead_letter(
        &self,
        queue: &str,
        reservation: &Reservation,
        reason: &str,
    ) -> Result<(), QueueError> {
        let entry = json!({
            "job": reservation.job,
            "reason": reason,
            "failedAt": chrono::Utc::now().to_rfc3339(),
        });
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("LPUSH")
            .arg(failed_key(queue))
            .arg(entry.to_string())
            .ignore();
        self.settle(queue, &reservation.raw, pipe).await
    }

    async fn heartbeat(&self, queue: &str) -> Result<(), QueueError> {
        let mut conn = self.commands.clone();
        redis::pipe()
            .cmd("SADD")
            .arg(consumers_key(queue))
            .arg(&self.consumer)
            .ignore()
            .cmd("SET")
            .arg(lease_key(queue, &self.consumer))
            .arg(1)
            .arg("PX")
            .arg(lease_millis(self.lease))
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn recover_in_flight(&self, queue: &str) -> Result<usize, QueueError> {
        self.heartbeat(queue).await?;
        let mut conn = self.commands.clone();
        let consumers: Vec<String> = redis::cmd("SMEMBERS")
            .arg(consumers_key(queue))
            .query_async(&mut conn)
            .await?;

        let mut recovered = 0usize;
        for consumer in consumers.iter().filter(|c| **c != self.consumer) {
            let alive: bool = redis::cmd("EXISTS")
                .arg(lease_key(queue, consumer))
                .query_async(&mut conn)
                .await?;
            if alive {
                continue;
            }
            let moved = self.requeue_consumer(queue, consumer).await?;
            debug!("Consumer {consumer} on '{queue}' is gone; requeued {moved} jobs");
            recovered += moved;
        }
        Ok(recovered)
    }
}
