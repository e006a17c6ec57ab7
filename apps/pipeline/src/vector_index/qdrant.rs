//! Qdrant REST backend for the vector index.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderValue, CONTENT_TYPE};
use reqwest::{Client, Method, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};
use uuid::Uuid;

use super::{ChunkPayload, IndexError, IndexedChunk, ScoredChunk, VectorIndex};

/// Payload key every filter is built on.
const DOCUMENT_ID_KEY: &str = "documentId";
const UPSERT_BATCH: usize = 256;

#[derive(Debug, Clone)]
pub struct QdrantConfig {
    pub url: String,
    pub api_key: Option<String>,
    pub collection: String,
    pub dimensions: usize,
    pub timeout: Duration,
}

#[derive(Clone)]
pub struct QdrantIndex {
    client: Client,
    base_url: String,
    collection: String,
    dimensions: usize,
}

impl QdrantIndex {
    pub fn new(config: QdrantConfig) -> Result<Self, IndexError> {
        if !(config.url.starts_with("http://") || config.url.starts_with("https://")) {
            return Err(IndexError::Config("Qdrant URL must be an http(s) URL".into()));
        }
        if config.collection.trim().is_empty() {
            return Err(IndexError::Config("missing Qdrant collection name".into()));
        }
        if config.dimensions == 0 {
            return Err(IndexError::Config("vector dimensions must be positive".into()));
        }
        let mut headers = reqwest::header::HeaderMap::new();
        if let Some(key) = config.api_key.as_deref().filter(|k| !k.trim().is_empty()) {
            headers.insert(
                "api-key",
                HeaderValue::from_str(key.trim())
                    .map_err(|_| IndexError::Config("invalid Qdrant API key".into()))?,
            );
        }
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .timeout(config.timeout)
            .default_headers(headers)
            .build()?;
        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            collection: config.collection,
            dimensions: config.dimensions,
        })
    }

    fn collection_url(&self, suffix: &str) -> String {
        format!("{}/collections/{}{}", self.base_url, self.collection, suffix)
    }

    async fn send<T: DeserializeOwned>(
        &self,
        method: Method,
        url: String,
        body: Option<Value>,
    ) -> Result<T, IndexError> {
        let mut request = self.client.request(method, &url);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(IndexError::Api {
                status: status.as_u16(),
                message,
            });
        }
        let envelope: QdrantResponse<T> = response.json().await?;
        Ok(envelope.result)
    }

    fn check_dimensions(&self, vector: &[f32]) -> Result<(), IndexError> {
        if vector.len() != self.dimensions {
            return Err(IndexError::Dimension {
                expected: self.dimensions,
                got: vector.len(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl VectorIndex for QdrantIndex {
    async fn ensure_ready(&self) -> Result<(), IndexError> {
        let response = self.client.get(self.collection_url("")).send().await?;
        match response.status() {
            status if status.is_success() => {
                debug!("Qdrant collection '{}' exists", self.collection);
                return Ok(());
            }
            StatusCode::NOT_FOUND => {}
            status => {
                let message = response.text().await.unwrap_or_default();
                return Err(IndexError::Api {
                    status: status.as_u16(),
                    message,
                });
            }
        }

        let _: Value = self
            .send(
                Method::PUT,
                self.collection_url(""),
                Some(json!({
                    "vectors": { "size": self.dimensions, "distance": "Cosine" }
                })),
            )
            .await?;
        let _: Value = self
            .send(
                Method::PUT,
                self.collection_url("/index?wait=true"),
                Some(json!({ "field_name": DOCUMENT_ID_KEY, "field_schema": "keyword" })),
            )
            .await?;
        info!(
            "Created Qdrant collection '{}' ({} dimensions)",
            self.collection, self.dimensions
        );
        Ok(())
    }

    async fn replace_document(
        &self,
        document_id: &str,
        chunks: Vec<IndexedChunk>,
    ) -> Result<usize, IndexError> {
        for chunk in &chunks {
            self.check_dimensions(&chunk.vector)?;
        }

        self.delete_document(document_id).await?;

        let stored = chunks.len();
        let points: Vec<PointStruct> = chunks
            .into_iter()
            .map(|chunk| PointStruct {
                id: point_id(document_id, chunk.payload.chunk_index),
                vector: chunk.vector,
                payload: chunk.payload,
            })
            .collect();
        for batch in points.chunks(UPSERT_BATCH) {
            let _: Value = self
                .send(
                    Method::PUT,
                    self.collection_url("/points?wait=true"),
                    Some(json!({ "points": batch })),
                )
                .await?;
        }
        debug!("Stored {stored} chunks for document {document_id}");
        Ok(stored)
    }

    async fn search(
        &self,
        document_id: &str,
        vector: &[f32],
        limit: usize,
    ) -> Result<Vec<ScoredChunk>, IndexError> {
        self.check_dimensions(vector)?;
        let hits: Vec<ScoredPoint> = self
            .send(
                Method::POST,
                self.collection_url("/points/search"),
                Some(json!({
                    "vector": vector,
                    "limit": limit,
                    "filter": document_filter(document_id),
                    "with_payload": true,
                })),
            )
            .await?;
        Ok(hits
            .into_iter()
            .filter_map(|hit| {
                hit.payload.map(|payload| ScoredChunk {
                    score: hit.score,
                    payload,
                })
            })
            .collect())
    }

    async fn count(&self, document_id: &str) -> Result<usize, IndexError> {
        let result: CountResult = self
            .send(
                Method::POST,
                self.collection_url("/points/count"),
                Some(json!({ "filter": document_filter(document_id), "exact": true })),
            )
            .await?;
        Ok(result.count)
    }

    async fn delete_document(&self, document_id: &str) -> Result<(), IndexError> {
        let _: Value = self
            .send(
                Method::POST,
                self.collection_url("/points/delete?wait=true"),
                Some(json!({ "filter": document_filter(document_id) })),
            )
            .await?;
        Ok(())
    }
}

/// Deterministic point id, so a redelivered job overwrites instead of duplicating.
fn point_id(document_id: &str, chunk_index: usize) -> Uuid {
    Uuid::new_v5(
        &Uuid::NAMESPACE_URL,
        format!("{document_id}#{chunk_index}").as_bytes(),
    )
}

fn document_filter(document_id: &str) -> Value {
    json!({
        "must": [
            { "key": DOCUMENT_ID_KEY, "match": { "value": document_id } }
        ]
    })
}

#[derive(Debug, Serialize)]
struct PointStruct {
    id: Uuid,
    vector: Vec<f32>,
    payload: ChunkPayload,
}

#[derive(Debug, Deserialize)]
struct QdrantResponse<T> {
    result: T,
}

#[derive(Debug, Deserialize)]
struct ScoredPoint {
    score: f32,
    #[serde(default)]
    payload: Option<ChunkPayload>,
}

#[derive(Debug, Deserialize)]
struct CountResult {
    count: usize,
}
