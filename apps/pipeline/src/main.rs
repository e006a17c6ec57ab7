mod chat;
mod config;
mod db;
mod documents;
mod embeddings;
mod errors;
mod llm_client;
mod models;
mod pipeline;
mod queue;
mod routes;
mod state;
mod store;
#[cfg(test)]
mod testing;
mod vector_index;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use aws_config::Region;
use aws_sdk_s3::config::Credentials;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::chat::service::ChatService;
use crate::config::Config;
use crate::db::create_pool;
use crate::embeddings::{Embedder, OpenAiEmbedder, OpenAiEmbedderConfig};
use crate::llm_client::{ChatModel, LlmClient};
use crate::pipeline::analyzer::Analyzer;
use crate::pipeline::chunker::Chunker;
use crate::pipeline::extractor::PdfExtractor;
use crate::pipeline::fetch::RemoteFetcher;
use crate::pipeline::indexer::ChunkIndexer;
use crate::pipeline::runner::{JobRunner, RunnerConfig};
use crate::pipeline::worker::{DocumentWorker, WorkerDeps};
use crate::queue::redis::RedisJobQueue;
use crate::queue::JobQueue;
use crate::routes::build_router;
use crate::state::{AppState, QueueNames};
use crate::store::postgres::PgRecordStore;
use crate::store::RecordStore;
use crate::vector_index::qdrant::{QdrantConfig, QdrantIndex};
use crate::vector_index::VectorIndex;

const RESERVE_TIMEOUT: Duration = Duration::from_secs(5);
const RETRY_BASE_DELAY: Duration = Duration::from_secs(2);
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (fails on missing required env vars)
    let config = Config::from_env()?;

    // Initialize structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{}={}", env!("CARGO_PKG_NAME"), &config.rust_log))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        "Starting resume pipeline v{} (role: {})",
        env!("CARGO_PKG_VERSION"),
        config.role
    );

    // Record store (PostgreSQL)
    let db = create_pool(&config.database_url).await?;
    let store: Arc<dyn RecordStore> = Arc::new(PgRecordStore::new(db));

    // Job queue (Redis)
    let redis = redis::Client::open(config.redis_url.clone())?;
    let lease = Duration::from_secs(config.queue_lease_secs);
    let redis_queue = RedisJobQueue::connect(redis, lease)
        .await
        .context("Failed to connect to Redis")?;
    info!(
        "Redis job queue initialized (consumer {})",
        redis_queue.consumer_id()
    );
    let queue: Arc<dyn JobQueue> = Arc::new(redis_queue);

    // Model, embeddings, vector index
    let llm = LlmClient::new(config.anthropic_api_key.clone())?;
    info!("LLM client initialized (model: {})", llm_client::MODEL);
    let model: Arc<dyn ChatModel> = Arc::new(llm);

    let embedder: Arc<dyn Embedder> = Arc::new(OpenAiEmbedder::new(OpenAiEmbedderConfig {
        api_key: config.embedding_api_key.clone(),
        base_url: config.embedding_base_url.clone(),
        model: config.embedding_model.clone(),
        dimensions: Some(config.embedding_dimensions),
        timeout: UPSTREAM_TIMEOUT,
        max_retries: 3,
        batch_size: 64,
    })?);

    let index: Arc<dyn VectorIndex> = Arc::new(QdrantIndex::new(QdrantConfig {
        url: config.qdrant_url.clone(),
        api_key: config.qdrant_api_key.clone(),
        collection: config.qdrant_collection.clone(),
        dimensions: config.embedding_dimensions,
        timeout: UPSTREAM_TIMEOUT,
    })?);
    if config.role.serves_api() || config.role.runs_indexing() {
        index
            .ensure_ready()
            .await
            .context("Failed to prepare vector index collection")?;
        info!("Vector index '{}' ready", config.qdrant_collection);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut services = JoinSet::new();

    // Workers
    if config.role.runs_analysis() || config.role.runs_indexing() {
        let s3 = build_s3_client(&config).await;
        info!("S3 client initialized ({})", config.s3_endpoint);
        let http = reqwest::Client::builder().timeout(UPSTREAM_TIMEOUT).build()?;
        let deps = WorkerDeps {
            store: store.clone(),
            fetcher: Arc::new(RemoteFetcher::new(http, s3)),
            extractor: Arc::new(PdfExtractor),
            min_text_chars: config.min_text_chars,
        };

        if config.role.runs_analysis() {
            let worker = DocumentWorker::analysis(deps.clone(), Analyzer::new(model.clone()));
            let runner = JobRunner::new(
                runner_config(&config.analysis_queue, config.analysis_concurrency, &config),
                queue.clone(),
                worker,
            );
            let rx = shutdown_rx.clone();
            services.spawn(async move {
                Arc::new(runner).run(rx).await.context("Analysis worker stopped")
            });
        }

        if config.role.runs_indexing() {
            let indexer = ChunkIndexer::new(
                Chunker::new(config.chunk_size, config.chunk_overlap),
                embedder.clone(),
                index.clone(),
            );
            let worker = DocumentWorker::indexing(deps, indexer);
            let runner = JobRunner::new(
                runner_config(&config.indexing_queue, config.indexing_concurrency, &config),
                queue.clone(),
                worker,
            );
            let rx = shutdown_rx.clone();
            services.spawn(async move {
                Arc::new(runner).run(rx).await.context("Indexing worker stopped")
            });
        }
    }

    // HTTP API
    if config.role.serves_api() {
        let chat = ChatService::new(
            store.clone(),
            embedder.clone(),
            index.clone(),
            model.clone(),
            config.chat_top_k,
        );
        let state = AppState {
            store: store.clone(),
            queue: queue.clone(),
            chat: Arc::new(chat),
            queues: QueueNames {
                analysis: config.analysis_queue.clone(),
                indexing: config.indexing_queue.clone(),
            },
        };

        let app = build_router(state)
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive());

        let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!("Listening on {addr}");

        let mut rx = shutdown_rx.clone();
        services.spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = rx.wait_for(|stop| *stop).await;
                })
                .await
                .context("HTTP server stopped")
        });
    }

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {e}");
        }
        info!("Shutdown requested");
        let _ = shutdown_tx.send(true);
    });

    while let Some(joined) = services.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("{e:#}"),
            Err(e) => error!("Service task panicked: {e}"),
        }
    }

    info!("Shutdown complete");
    Ok(())
}

fn runner_config(queue: &str, concurrency: usize, config: &Config) -> RunnerConfig {
    RunnerConfig {
        queue: queue.to_string(),
        concurrency,
        max_attempts: config.job_max_attempts,
        retry_base_delay: RETRY_BASE_DELAY,
        reserve_timeout: RESERVE_TIMEOUT,
        lease_renewal: Duration::from_secs(config.queue_lease_secs) / 3,
    }
}

/// Constructs an S3 client configured for MinIO (local) or AWS (production).
async fn build_s3_client(config: &Config) -> aws_sdk_s3::Client {
    let credentials = Credentials::new(
        &config.aws_access_key_id,
        &config.aws_secret_access_key,
        None,
        None,
        "pipeline-static",
    );

    let s3_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(Region::new("us-east-1"))
        .credentials_provider(credentials)
        .endpoint_url(&config.s3_endpoint)
        .load()
        .await;

    aws_sdk_s3::Client::new(&s3_config)
}
