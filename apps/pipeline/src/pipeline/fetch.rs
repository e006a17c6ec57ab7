//! Downloads the stored binary for a document.

use async_trait::async_trait;
use aws_sdk_s3::error::DisplayErrorContext;
use bytes::Bytes;
use reqwest::Client;
use tracing::debug;

use crate::errors::PipelineError;

/// Carried as `Arc<dyn DocumentFetcher>`.
#[async_trait]
pub trait DocumentFetcher: Send + Sync {
    async fn fetch(&self, source_url: &str) -> Result<Bytes, PipelineError>;
}

/// Fetches `http(s)://` URLs over HTTP and `s3://bucket/key` URLs from S3.
#[derive(Clone)]
pub struct RemoteFetcher {
    http: Client,
    s3: aws_sdk_s3::Client,
}

impl RemoteFetcher {
    pub fn new(http: Client, s3: aws_sdk_s3::Client) -> Self {
        Self { http, s3 }
    }

    async fn fetch_http(&self, url: &str) -> Result<Bytes, PipelineError> {
        let response = self.http.get(url).send().await.map_err(|e| PipelineError::Fetch {
            url: url.to_string(),
            reason: e.to_string(),
            transient: true,
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::Fetch {
                url: url.to_string(),
                reason: format!("server responded {status}"),
                transient: status.as_u16() == 429 || status.is_server_error(),
            });
        }
        response.bytes().await.map_err(|e| PipelineError::Fetch {
            url: url.to_string(),
            reason: e.to_string(),
            transient: true,
        })
    }

    async fn fetch_s3(&self, url: &str, bucket: &str, key: &str) -> Result<Bytes, PipelineError> {
        let output = self
            .s3
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                let missing = e
                    .as_service_error()
                    .map(|se| se.is_no_such_key())
                    .unwrap_or(false);
                PipelineError::Fetch {
                    url: url.to_string(),
                    reason: DisplayErrorContext(&e).to_string(),
                    transient: !missing,
                }
            })?;
        let body = output.body.collect().await.map_err(|e| PipelineError::Fetch {
            url: url.to_string(),
            reason: e.to_string(),
            transient: true,
        })?;
        Ok(body.into_bytes())
    }
}

#[async_trait]
impl DocumentFetcher for RemoteFetcher {
    async fn fetch(&self, source_url: &str) -> Result<Bytes, PipelineError> {
        debug!("Downloading {source_url}");
        match parse_source(source_url) {
            Some(Source::Http) => self.fetch_http(source_url).await,
            Some(Source::S3 { bucket, key }) => self.fetch_s3(source_url, bucket, key).await,
            None => Err(PipelineError::Fetch {
                url: source_url.to_string(),
                reason: "unsupported URL scheme".to_string(),
                transient: false,
            }),
        }
    }
}

#[derive(Debug, PartialEq)]
enum Source<'a> {
    Http,
    S3 { bucket: &'a str, key: &'a str },
}

/// Whether `url` names a location the fetcher can download from.
pub fn is_supported_source(url: &str) -> bool {
    parse_source(url).is_some()
}

fn parse_source(url: &str) -> Option<Source<'_>> {
    if url.starts_with("http://") || url.starts_with("https://") {
        return Some(Source::Http);
    }
    let rest = url.strip_prefix("s3://")?;
    let (bucket, key) = rest.split_once('/')?;
    if bucket.is_empty() || key.is_empty() {
        return None;
    }
    Some(Source::S3 { bucket, key })
}
