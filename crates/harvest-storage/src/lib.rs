//! HTTP fetch utilities, rate limiting, caching and the record-store contract.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use harvest_core::AuthDescriptor;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub mod cache;
pub mod rate_limit;
pub mod store;

pub use cache::{Cache, CacheBackend, CacheError, CacheKey, CacheKind, InMemoryCache};
pub use rate_limit::RateLimiter;
pub use store::{InMemoryStore, OpportunityStore, RecordStore, SourceStore, StoreError};

pub const CRATE_NAME: &str = "harvest-storage";

/// Hex SHA-256 of `bytes`; used to fingerprint raw payloads.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
            per_source_concurrency: 2,
        }
    }
}

/// One GET against an upstream provider.
#[derive(Debug, Clone)]
pub struct FetchRequest<'a> {
    pub url: &'a str,
    pub query: Vec<(String, String)>,
    pub auth: &'a AuthDescriptor,
}

impl<'a> FetchRequest<'a> {
    pub fn new(url: &'a str, auth: &'a AuthDescriptor) -> Self {
        Self {
            url,
            query: Vec::new(),
            auth,
        }
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

/// Transport-level failure. Every variant is transient from the caller's
/// point of view: it counts as one failed fetch and is never retried here.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("fetcher is shutting down")]
    Closed,
}

impl FetchError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Request(err) if err.is_timeout())
    }
}

/// Explicit HTTP client value handed to every adapter call.
///
/// Concurrency is bounded globally and per source. There is no retry loop:
/// a failed request surfaces immediately so the sync backoff can account for it.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        Ok(Self {
            client: builder.build()?,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
        })
    }

    async fn per_source_semaphore(&self, source_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        source_id: &str,
        request: &FetchRequest<'_>,
    ) -> Result<FetchedResponse, FetchError> {
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Closed)?;
        let per_source = self.per_source_semaphore(source_id).await;
        let _source = per_source.acquire().await.map_err(|_| FetchError::Closed)?;

        let span = info_span!("http_fetch", %run_id, source_id, url = request.url);
        self.send(request).instrument(span).await
    }

    async fn send(&self, request: &FetchRequest<'_>) -> Result<FetchedResponse, FetchError> {
        let mut builder = self.client.get(request.url);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        builder = match request.auth {
            AuthDescriptor::None => builder,
            AuthDescriptor::Bearer { token } => builder.bearer_auth(token),
            AuthDescriptor::Basic { username, password } => {
                builder.basic_auth(username, password.as_deref())
            }
            AuthDescriptor::ApiKey { header, value } => builder.header(header.as_str(), value.as_str()),
        };

        let resp = builder.send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }

        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string);
        let body = resp.bytes().await?.to_vec();
        debug!(status = status.as_u16(), bytes = body.len(), "fetched");
        Ok(FetchedResponse {
            status,
            final_url,
            content_type,
            body,
        })
    }
}
