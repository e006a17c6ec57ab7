//! Queue consumer loop: reserve → handle → ack | retry | dead-letter.
//!
//! Concurrency is bounded by a semaphore; each reserved job runs on its own
//! task holding one permit until the worker returns. Retry backoff runs after
//! the permit is released. A maintenance task renews this consumer's lease
//! and requeues jobs held by consumers whose lease lapsed. On shutdown the
//! loop stops reserving and waits for in-flight jobs to settle.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::errors::PipelineError;
use crate::pipeline::worker::{DocumentWorker, JobOutcome};
use crate::queue::{Job, JobQueue, QueueError, Reservation};

const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);
const QUEUE_ERROR_BACKOFF: Duration = Duration::from_secs(1);
const MIN_LEASE_RENEWAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub queue: String,
    pub concurrency: usize,
    /// Total deliveries per job, first attempt included.
    pub max_attempts: u32,
    pub retry_base_delay: Duration,
    pub reserve_timeout: Duration,
    /// How often the consumer lease is renewed and lapsed consumers swept.
    pub lease_renewal: Duration,
}

/// How a handled job leaves the queue.
#[derive(Debug, PartialEq)]
enum Settlement {
    Ack,
    Retry { job: Job, delay: Duration },
    DeadLetter { reason: String },
}

pub struct JobRunner {
    config: RunnerConfig,
    queue: Arc<dyn JobQueue>,
    worker: DocumentWorker,
}

impl JobRunner {
    pub fn new(config: RunnerConfig, queue: Arc<dyn JobQueue>, worker: DocumentWorker) -> Self {
        Self {
            config,
            queue,
            worker,
        }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<(), QueueError> {
        let name = self.config.queue.clone();
        let recovered = self.queue.recover_in_flight(&name).await?;
        if recovered > 0 {
            warn!("Recovered {recovered} in-flight jobs on queue {name}");
        }
        info!(
            "{} worker consuming {name} (concurrency {})",
            self.worker.stage(),
            self.config.concurrency
        );

        let maintenance = tokio::spawn(self.clone().maintain_lease());
        let permits = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut tasks = JoinSet::new();

        loop {
            if *shutdown.borrow() {
                break;
            }

            let permit = tokio::select! {
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown.changed() => break,
            };

            let reserved = tokio::select! {
                reserved = self.queue.reserve(&name, self.config.reserve_timeout) => reserved,
                _ = shutdown.changed() => break,
            };

            match reserved {
                Ok(Some(reservation)) => {
                    let runner = self.clone();
                    let mut stop = shutdown.clone();
                    tasks.spawn(async move {
                        let settlement = runner.execute(&reservation.job).await;
                        drop(permit);
                        runner.settle(&reservation, settlement, &mut stop).await;
                    });
                }
                Ok(None) => {}
                Err(e) => {
                    error!("Failed to reserve from {name}: {e}");
                    tokio::time::sleep(QUEUE_ERROR_BACKOFF).await;
                }
            }

            while let Some(joined) = tasks.try_join_next() {
                if let Err(e) = joined {
                    error!("Job task on {name} panicked: {e}");
                }
            }
        }

        info!("Stopping {name}; waiting for {} in-flight jobs", tasks.len());
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("Job task on {name} panicked: {e}");
            }
        }
        maintenance.abort();
        Ok(())
    }

    /// Keeps the lease alive for as long as `run` holds jobs in flight.
    async fn maintain_lease(self: Arc<Self>) {
        let name = &self.config.queue;
        let mut ticks = tokio::time::interval(self.config.lease_renewal.max(MIN_LEASE_RENEWAL));
        ticks.tick().await;
        loop {
            ticks.tick().await;
            match self.queue.recover_in_flight(name).await {
                Ok(0) => {}
                Ok(n) => warn!("Requeued {n} jobs from lapsed consumers on {name}"),
                Err(e) => error!("Failed to renew lease on {name}: {e}"),
            }
        }
    }

    /// Runs one reserved job to completion and settles it on the queue.
    #[cfg(test)]
    pub(crate) async fn process(&self, reservation: Reservation) {
        let (_running, mut stop) = watch::channel(false);
        let settlement = self.execute(&reservation.job).await;
        self.settle(&reservation, settlement, &mut stop).await;
    }

    /// Runs the worker and decides how the job leaves the queue.
    async fn execute(&self, job: &Job) -> Settlement {
        let err = match self.worker.handle(job).await {
            Ok(JobOutcome::Completed(status)) => {
                info!(
                    "{} finished for document {} (status {status})",
                    self.worker.stage(),
                    job.resume_id
                );
                return Settlement::Ack;
            }
            Ok(JobOutcome::Skipped(status)) => {
                info!("Skipped job for {} document {}", status, job.resume_id);
                return Settlement::Ack;
            }
            Err(err) => err,
        };

        if err.is_retryable() && job.attempt + 1 < self.config.max_attempts {
            let delay = self.retry_delay(job.attempt);
            warn!(
                "{} attempt {} failed for document {}, retrying in {:?}: {err}",
                self.worker.stage(),
                job.attempt + 1,
                job.resume_id,
                delay
            );
            return Settlement::Retry {
                job: job.next_attempt(),
                delay,
            };
        }

        error!(
            "{} failed for document {} ({}): {err}",
            self.worker.stage(),
            job.resume_id,
            err.kind()
        );
        if let Err(e) = self.record_failure(&job.resume_id, &err).await {
            // The job stays queued until the document carries its error.
            let delay = self.retry_delay(job.attempt);
            error!(
                "Failed to mark document {} as error, requeueing in {:?}: {e}",
                job.resume_id, delay
            );
            return Settlement::Retry {
                job: job.clone(),
                delay,
            };
        }
        Settlement::DeadLetter {
            reason: format!("{}: {err}", err.kind()),
        }
    }

    async fn settle(
        &self,
        reservation: &Reservation,
        settlement: Settlement,
        shutdown: &mut watch::Receiver<bool>,
    ) {
        let name = &self.config.queue;
        let settled = match settlement {
            Settlement::Ack => self.queue.ack(name, reservation).await,
            Settlement::Retry { job, delay } => {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.wait_for(|stop| *stop) => {}
                }
                self.queue.retry(name, reservation, &job).await
            }
            Settlement::DeadLetter { reason } => {
                self.queue.dead_letter(name, reservation, &reason).await
            }
        };

        if let Err(e) = settled {
            error!(
                "Failed to settle job for document {} on {name}: {e}",
                reservation.job.resume_id
            );
        }
    }

    async fn record_failure(
        &self,
        document_id: &str,
        err: &PipelineError,
    ) -> Result<(), PipelineError> {
        if matches!(err, PipelineError::DocumentNotFound(_)) {
            return Ok(());
        }
        self.worker
            .store()
            .fail_document(document_id, &err.to_string())
            .await
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.config
            .retry_base_delay
            .saturating_mul(factor)
            .min(MAX_RETRY_DELAY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::document::{DocumentStatus, NewDocument};
    use crate::pipeline::analyzer::Analyzer;
    use crate::pipeline::chunker::Chunker;
    use crate::pipeline::indexer::ChunkIndexer;
    use crate::pipeline::worker::WorkerDeps;
    use crate::store::RecordStore;
    use crate::testing::{
        resume_text, HashEmbedder, MemoryFetcher, MemoryIndex, MemoryQueue, MemoryStore,
        PlainTextExtractor, ScriptedModel, VALID_ANALYSIS,
    };
    use crate::vector_index::VectorIndex;

    const URL: &str = "s3://resumes/u1/r1.pdf";
    const ANALYSIS: &str = "resume-analyse";
    const INDEXING: &str = "resume-processing";

    struct Harness {
        store: Arc<MemoryStore>,
        index: Arc<MemoryIndex>,
        queue: Arc<MemoryQueue>,
        analysis: Arc<JobRunner>,
        indexing: Arc<JobRunner>,
    }

    fn runner_config(queue: &str) -> RunnerConfig {
        RunnerConfig {
            queue: queue.to_string(),
            concurrency: 4,
            max_attempts: 3,
            retry_base_delay: Duration::ZERO,
            reserve_timeout: Duration::from_millis(5),
            lease_renewal: Duration::from_millis(20),
        }
    }

    async fn harness(text: &str, model: ScriptedModel, embedder: HashEmbedder) -> Harness {
        harness_with(text, model, embedder, Duration::ZERO).await
    }

    async fn harness_with(
        text: &str,
        model: ScriptedModel,
        embedder: HashEmbedder,
        retry_base_delay: Duration,
    ) -> Harness {
        let config = |queue: &str| RunnerConfig {
            retry_base_delay,
            ..runner_config(queue)
        };
        let store = Arc::new(MemoryStore::default());
        let index = Arc::new(MemoryIndex::default());
        let queue = Arc::new(MemoryQueue::default());
        store
            .create_document(&NewDocument {
                id: "r1".into(),
                owner_id: "u1".into(),
                source_url: URL.into(),
            })
            .await
            .unwrap();
        let job = Job::new("r1", "u1", URL);
        queue.enqueue(ANALYSIS, &job).await.unwrap();
        queue.enqueue(INDEXING, &job).await.unwrap();

        let deps = WorkerDeps {
            store: store.clone(),
            fetcher: Arc::new(MemoryFetcher::with(URL, text)),
            extractor: Arc::new(PlainTextExtractor),
            min_text_chars: 50,
        };
        let analysis = DocumentWorker::analysis(deps.clone(), Analyzer::new(Arc::new(model)));
        let indexing = DocumentWorker::indexing(
            deps,
            ChunkIndexer::new(Chunker::new(200, 40), Arc::new(embedder), index.clone()),
        );
        Harness {
            analysis: Arc::new(JobRunner::new(config(ANALYSIS), queue.clone(), analysis)),
            indexing: Arc::new(JobRunner::new(config(INDEXING), queue.clone(), indexing)),
            store,
            index,
            queue,
        }
    }

    /// Processes jobs one at a time until the runner's queue is empty.
    async fn drain(runner: &JobRunner, queue: &MemoryQueue) {
        while let Some(reservation) = queue
            .reserve(&runner.config.queue, Duration::ZERO)
            .await
            .unwrap()
        {
            runner.process(reservation).await;
        }
    }

    #[tokio::test]
    async fn test_both_stages_complete_document() {
        let h = harness(
            &resume_text(),
            ScriptedModel::replying(VALID_ANALYSIS),
            HashEmbedder::default(),
        )
        .await;
        drain(&h.analysis, &h.queue).await;
        assert_eq!(h.store.status("r1"), Some(DocumentStatus::Analyzing));
        drain(&h.indexing, &h.queue).await;

        assert_eq!(h.store.status("r1"), Some(DocumentStatus::Completed));
        let analysis = h.store.get_analysis("r1").await.unwrap().unwrap();
        let score = analysis.ats_score.unwrap();
        assert!((0.0..=100.0).contains(&score));
        assert!(h.index.count("r1").await.unwrap() > 0);
        assert_eq!(h.queue.in_flight(ANALYSIS), 0);
        assert_eq!(h.queue.in_flight(INDEXING), 0);
    }

    #[tokio::test]
    async fn test_short_text_fails_document_and_dead_letters() {
        let h = harness(
            "Jane Doe",
            ScriptedModel::replying(VALID_ANALYSIS),
            HashEmbedder::default(),
        )
        .await;
        drain(&h.analysis, &h.queue).await;
        drain(&h.indexing, &h.queue).await;

        let document = h.store.get_document("r1").await.unwrap().unwrap();
        assert_eq!(document.status, DocumentStatus::Error);
        assert!(document
            .error_message
            .unwrap()
            .contains("too short"));
        assert_eq!(h.queue.failed(ANALYSIS).len(), 1);
        assert!(h.queue.failed(ANALYSIS)[0].starts_with("insufficient_content"));
        assert_eq!(h.store.analysis_count(), 0);
    }

    #[tokio::test]
    async fn test_indexing_failure_never_completes_document() {
        let h = harness(
            &resume_text(),
            ScriptedModel::replying(VALID_ANALYSIS),
            HashEmbedder::failing(),
        )
        .await;
        drain(&h.analysis, &h.queue).await;
        drain(&h.indexing, &h.queue).await;

        assert_eq!(h.store.status("r1"), Some(DocumentStatus::Error));
        assert!(h.store.get_analysis("r1").await.unwrap().is_some());
        assert_eq!(h.queue.failed(INDEXING).len(), 1);
        assert!(h.queue.pending(INDEXING).is_empty());
    }

    #[tokio::test]
    async fn test_transient_model_failure_is_retried() {
        let h = harness(
            &resume_text(),
            ScriptedModel::flaky(1, VALID_ANALYSIS),
            HashEmbedder::default(),
        )
        .await;

        let first = h.queue.reserve(ANALYSIS, Duration::ZERO).await.unwrap().unwrap();
        h.analysis.process(first).await;
        let requeued = h.queue.pending(ANALYSIS);
        assert_eq!(requeued.len(), 1);
        assert_eq!(requeued[0].attempt, 1);
        assert_ne!(h.store.status("r1"), Some(DocumentStatus::Error));

        drain(&h.analysis, &h.queue).await;
        drain(&h.indexing, &h.queue).await;
        assert_eq!(h.store.status("r1"), Some(DocumentStatus::Completed));
        assert!(h.queue.failed(ANALYSIS).is_empty());
    }

    #[tokio::test]
    async fn test_store_failure_on_join_is_retried() {
        let h = harness(
            &resume_text(),
            ScriptedModel::replying(VALID_ANALYSIS),
            HashEmbedder::default(),
        )
        .await;
        h.store.fail_next_completions(1);
        drain(&h.indexing, &h.queue).await;
        drain(&h.analysis, &h.queue).await;

        assert_eq!(h.store.status("r1"), Some(DocumentStatus::Completed));
        assert!(h.queue.failed(INDEXING).is_empty());
    }

    #[tokio::test]
    async fn test_retries_stop_at_max_attempts() {
        let h = harness(
            &resume_text(),
            ScriptedModel::failing(),
            HashEmbedder::default(),
        )
        .await;
        drain(&h.analysis, &h.queue).await;

        assert_eq!(h.store.status("r1"), Some(DocumentStatus::Error));
        let failed = h.queue.failed(ANALYSIS);
        assert_eq!(failed.len(), 1);
        assert!(failed[0].starts_with("upstream_error"));
    }

    #[tokio::test]
    async fn test_reanalysis_updates_existing_result() {
        let h = harness(
            &resume_text(),
            ScriptedModel::replying(VALID_ANALYSIS),
            HashEmbedder::default(),
        )
        .await;
        drain(&h.analysis, &h.queue).await;
        drain(&h.indexing, &h.queue).await;

        h.store.reset_for_reprocess("r1").await.unwrap().unwrap();
        let job = Job::new("r1", "u1", URL);
        h.queue.enqueue(ANALYSIS, &job).await.unwrap();
        h.queue.enqueue(INDEXING, &job).await.unwrap();
        drain(&h.analysis, &h.queue).await;
        drain(&h.indexing, &h.queue).await;

        assert_eq!(h.store.status("r1"), Some(DocumentStatus::Completed));
        assert_eq!(h.store.analysis_count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_document_is_dead_lettered() {
        let h = harness(
            &resume_text(),
            ScriptedModel::replying(VALID_ANALYSIS),
            HashEmbedder::default(),
        )
        .await;
        drain(&h.analysis, &h.queue).await;
        h.queue
            .enqueue(ANALYSIS, &Job::new("ghost", "u9", URL))
            .await
            .unwrap();
        drain(&h.analysis, &h.queue).await;

        let failed = h.queue.failed(ANALYSIS);
        assert_eq!(failed.len(), 1);
        assert!(failed[0].starts_with("document_not_found"));
        assert!(h.store.get_document("ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unrecorded_failure_is_requeued_not_dead_lettered() {
        let h = harness(
            "Jane Doe",
            ScriptedModel::replying(VALID_ANALYSIS),
            HashEmbedder::default(),
        )
        .await;
        h.store.fail_next_error_writes(1);

        let reservation = h.queue.reserve(ANALYSIS, Duration::ZERO).await.unwrap().unwrap();
        h.analysis.process(reservation).await;
        assert_eq!(h.store.status("r1"), Some(DocumentStatus::Parsing));
        assert!(h.queue.failed(ANALYSIS).is_empty());
        let requeued = h.queue.pending(ANALYSIS);
        assert_eq!(requeued.len(), 1);
        assert_eq!(requeued[0].attempt, 0);

        drain(&h.analysis, &h.queue).await;
        assert_eq!(h.store.status("r1"), Some(DocumentStatus::Error));
        assert_eq!(h.queue.failed(ANALYSIS).len(), 1);
        assert!(h.store.reset_for_reprocess("r1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_backoff_is_not_spent_inside_the_job() {
        let h = harness_with(
            &resume_text(),
            ScriptedModel::flaky(1, VALID_ANALYSIS),
            HashEmbedder::default(),
            Duration::from_secs(60),
        )
        .await;
        let reservation = h.queue.reserve(ANALYSIS, Duration::ZERO).await.unwrap().unwrap();

        let settlement = tokio::time::timeout(
            Duration::from_secs(5),
            h.analysis.execute(&reservation.job),
        )
        .await
        .unwrap();
        assert_eq!(
            settlement,
            Settlement::Retry {
                job: reservation.job.next_attempt(),
                delay: MAX_RETRY_DELAY,
            }
        );
        assert_eq!(h.queue.in_flight(ANALYSIS), 1);
    }

    #[tokio::test]
    async fn test_shutdown_cuts_backoff_short() {
        let h = harness_with(
            &resume_text(),
            ScriptedModel::flaky(1, VALID_ANALYSIS),
            HashEmbedder::default(),
            Duration::from_secs(60),
        )
        .await;
        let reservation = h.queue.reserve(ANALYSIS, Duration::ZERO).await.unwrap().unwrap();
        let settlement = h.analysis.execute(&reservation.job).await;

        let (tx, mut rx) = watch::channel(false);
        tx.send(true).unwrap();
        tokio::time::timeout(
            Duration::from_secs(5),
            h.analysis.settle(&reservation, settlement, &mut rx),
        )
        .await
        .unwrap();
        assert_eq!(h.queue.in_flight(ANALYSIS), 0);
        assert_eq!(h.queue.pending(ANALYSIS)[0].attempt, 1);
    }

    #[tokio::test]
    async fn test_recovery_leaves_live_reservations_alone() {
        let h = harness(
            &resume_text(),
            ScriptedModel::replying(VALID_ANALYSIS),
            HashEmbedder::default(),
        )
        .await;
        let live = h.queue.reserve(INDEXING, Duration::ZERO).await.unwrap();
        assert!(live.is_some());

        assert_eq!(h.queue.recover_in_flight(INDEXING).await.unwrap(), 0);
        assert_eq!(h.queue.in_flight(INDEXING), 1);
        assert!(h.queue.pending(INDEXING).is_empty());
    }

    #[tokio::test]
    async fn test_run_recovers_abandoned_jobs_and_stops_on_shutdown() {
        let h = harness(
            &resume_text(),
            ScriptedModel::replying(VALID_ANALYSIS),
            HashEmbedder::default(),
        )
        .await;
        let reserved = h.queue.reserve(INDEXING, Duration::ZERO).await.unwrap();
        assert!(reserved.is_some());
        h.queue.abandon_in_flight(INDEXING);
        assert_eq!(h.queue.in_flight(INDEXING), 1);

        let (tx, rx) = watch::channel(false);
        let analysis = tokio::spawn(h.analysis.clone().run(rx.clone()));
        let indexing = tokio::spawn(h.indexing.clone().run(rx));

        for _ in 0..200 {
            if h.store.status("r1") == Some(DocumentStatus::Completed) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tx.send(true).unwrap();
        analysis.await.unwrap().unwrap();
        indexing.await.unwrap().unwrap();

        assert_eq!(h.store.status("r1"), Some(DocumentStatus::Completed));
        assert_eq!(h.queue.in_flight(INDEXING), 0);
        assert!(h.queue.heartbeats(INDEXING) >= 1);
    }

    #[test]
    fn test_retry_delay_grows_and_caps() {
        let worker = DocumentWorker::analysis(
            WorkerDeps {
                store: Arc::new(MemoryStore::default()),
                fetcher: Arc::new(MemoryFetcher::default()),
                extractor: Arc::new(PlainTextExtractor),
                min_text_chars: 50,
            },
            Analyzer::new(Arc::new(ScriptedModel::failing())),
        );
        let runner = JobRunner::new(
            RunnerConfig {
                retry_base_delay: Duration::from_secs(2),
                ..runner_config(ANALYSIS)
            },
            Arc::new(MemoryQueue::default()),
            worker,
        );
        assert_eq!(runner.retry_delay(0), Duration::from_secs(2));
        assert_eq!(runner.retry_delay(2), Duration::from_secs(8));
        assert_eq!(runner.retry_delay(10), MAX_RETRY_DELAY);
    }
}
