//! Fetch adapters turning a source configuration into raw records.

use std::time::Duration;

use async_trait::async_trait;
use harvest_core::{FetchKind, RawRecord, Source};
use harvest_storage::{FetchError, FetchRequest, FetchedResponse, HttpFetcher};
use reqwest::Url;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

pub mod api;
pub mod rss;
pub mod scrape;

pub use api::ApiAdapter;
pub use rss::RssAdapter;
pub use scrape::ScrapeAdapter;

pub const CRATE_NAME: &str = "harvest-adapters";

/// Hard cap on pages fetched from one source in one run.
pub const MAX_PAGES_PER_RUN: usize = 10;

/// Pause between consecutive pages of the same provider.
pub const DEFAULT_INTER_PAGE_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub inter_page_delay: Duration,
    pub max_pages: usize,
}

impl AdapterContext {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            inter_page_delay: DEFAULT_INTER_PAGE_DELAY,
            max_pages: MAX_PAGES_PER_RUN,
        }
    }

    pub fn with_inter_page_delay(mut self, delay: Duration) -> Self {
        self.inter_page_delay = delay;
        self
    }
}

/// Records pulled from one source plus the items that had to be skipped.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FetchOutcome {
    pub records: Vec<RawRecord>,
    /// One human-readable reason per skipped item.
    pub malformed: Vec<String>,
    pub pages_fetched: usize,
    /// Set when the page cap or a mid-document parse error cut the fetch short.
    pub truncated: bool,
}

impl FetchOutcome {
    pub fn is_complete(&self) -> bool {
        !self.truncated
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("source configuration error: {0}")]
    Configuration(String),
    #[error("malformed upstream payload: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait FetchAdapter: Send + Sync {
    fn kind(&self) -> FetchKind;

    /// Checks that `source` carries everything this adapter needs, before any request is made.
    fn validate(&self, source: &Source) -> Result<(), AdapterError>;

    async fn fetch_raw(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        source: &Source,
    ) -> Result<FetchOutcome, AdapterError>;
}

pub fn adapter_for_kind(kind: FetchKind) -> Box<dyn FetchAdapter> {
    match kind {
        FetchKind::Api => Box::new(ApiAdapter),
        FetchKind::Rss => Box::new(RssAdapter),
        FetchKind::Scrape => Box::new(ScrapeAdapter),
    }
}

/// The source endpoint, required by every adapter.
pub(crate) fn endpoint(source: &Source) -> Result<&str, AdapterError> {
    let url = source
        .base_url
        .as_deref()
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .ok_or_else(|| {
            AdapterError::Configuration(format!(
                "{} source {} has no endpoint",
                source.kind, source.source_id
            ))
        })?;
    Url::parse(url).map_err(|e| {
        AdapterError::Configuration(format!("invalid endpoint `{url}` for {}: {e}", source.source_id))
    })?;
    Ok(url)
}

pub(crate) async fn fetch_text(
    http: &HttpFetcher,
    ctx: &AdapterContext,
    source: &Source,
    url: &str,
) -> Result<(FetchedResponse, String), AdapterError> {
    let resp = http
        .fetch_bytes(ctx.run_id, &source.source_id, &FetchRequest::new(url, &source.auth))
        .await?;
    let text = String::from_utf8_lossy(&resp.body).into_owned();
    Ok((resp, text))
}

pub(crate) fn text_or_none(value: &str) -> Option<String> {
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}
