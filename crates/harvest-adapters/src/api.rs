//! Paginated JSON API adapter.

use async_trait::async_trait;
use harvest_core::{FetchKind, RawRecord, Source};
use harvest_storage::{FetchRequest, HttpFetcher};
use serde_json::{Map as JsonMap, Value as JsonValue};
use tracing::{debug, warn};

use crate::{endpoint, AdapterContext, AdapterError, FetchAdapter, FetchOutcome};

/// Envelope keys checked, in order, when a response is an object rather than a bare array.
const ENVELOPE_KEYS: &[&str] = &["data", "results", "items", "jobs"];

const MORE_FLAG_KEYS: &[&str] = &["has_more", "hasMore", "has_next", "hasNext"];
const NEXT_LINK_KEYS: &[&str] = &["next", "next_page", "nextPage", "next_url"];
const TOTAL_PAGES_KEYS: &[&str] = &["total_pages", "totalPages", "last_page"];

#[derive(Debug, Clone, Copy, Default)]
pub struct ApiAdapter;

#[async_trait]
impl FetchAdapter for ApiAdapter {
    fn kind(&self) -> FetchKind {
        FetchKind::Api
    }

    fn validate(&self, source: &Source) -> Result<(), AdapterError> {
        endpoint(source)?;
        if source.fetch.page_param.trim().is_empty() {
            return Err(AdapterError::Configuration(format!(
                "api source {} has an empty page parameter",
                source.source_id
            )));
        }
        Ok(())
    }

    async fn fetch_raw(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        source: &Source,
    ) -> Result<FetchOutcome, AdapterError> {
        self.validate(source)?;
        let url = endpoint(source)?;
        let page_size = source.fetch.page_size.max(1) as usize;
        let mut outcome = FetchOutcome::default();

        for page in 1..=ctx.max_pages.max(1) {
            if page > 1 && !ctx.inter_page_delay.is_zero() {
                tokio::time::sleep(ctx.inter_page_delay).await;
            }

            let mut request = FetchRequest::new(url, &source.auth)
                .with_query(source.fetch.page_param.as_str(), page);
            if !source.fetch.page_size_param.trim().is_empty() {
                request = request.with_query(source.fetch.page_size_param.as_str(), page_size);
            }
            let resp = http.fetch_bytes(ctx.run_id, &source.source_id, &request).await?;
            outcome.pages_fetched += 1;

            let body: JsonValue = match serde_json::from_slice(&resp.body) {
                Ok(body) => body,
                Err(err) if page == 1 => {
                    return Err(AdapterError::Malformed(format!("response is not JSON: {err}")));
                }
                Err(err) => {
                    warn!(source_id = %source.source_id, page, error = %err, "stopping on non-JSON page");
                    outcome.malformed.push(format!("page {page}: response is not JSON: {err}"));
                    outcome.truncated = true;
                    break;
                }
            };

            let Some(items) = extract_items(&body) else {
                if page == 1 {
                    return Err(AdapterError::Malformed(
                        "no record array found in response".to_string(),
                    ));
                }
                outcome.malformed.push(format!("page {page}: no record array found"));
                outcome.truncated = true;
                break;
            };

            let item_count = items.len();
            for (index, item) in items.iter().enumerate() {
                match item {
                    JsonValue::Object(map) => outcome.records.push(RawRecord::from_map(map.clone())),
                    other => {
                        let reason = format!("page {page} item {index}: expected object, got {}", json_kind(other));
                        warn!(source_id = %source.source_id, %reason, "skipping malformed item");
                        outcome.malformed.push(reason);
                    }
                }
            }
            debug!(source_id = %source.source_id, page, item_count, "api page parsed");

            if !signals_more_pages(&body, page, item_count, page_size) {
                break;
            }
            if page >= ctx.max_pages {
                warn!(
                    source_id = %source.source_id,
                    max_pages = ctx.max_pages,
                    "page cap reached with more pages pending"
                );
                outcome.truncated = true;
            }
        }

        Ok(outcome)
    }
}

/// Finds the record array: a bare array, an envelope key, or an envelope key
/// one object deeper (`{"data": {"jobs": [...]}}`).
pub fn extract_items(body: &JsonValue) -> Option<&Vec<JsonValue>> {
    match body {
        JsonValue::Array(items) => Some(items),
        JsonValue::Object(map) => envelope_array(map).or_else(|| {
            ENVELOPE_KEYS
                .iter()
                .filter_map(|key| map.get(*key).and_then(JsonValue::as_object))
                .find_map(envelope_array)
        }),
        _ => None,
    }
}

fn envelope_array(map: &JsonMap<String, JsonValue>) -> Option<&Vec<JsonValue>> {
    ENVELOPE_KEYS
        .iter()
        .find_map(|key| map.get(*key).and_then(JsonValue::as_array))
}

/// Whether the provider indicates another page after `page`.
///
/// Explicit signals win (`has_more`, a `next` link, `total_pages`, also
/// inside `meta`, `pagination` or `links`); without one, a full page implies more.
pub fn signals_more_pages(body: &JsonValue, page: usize, item_count: usize, page_size: usize) -> bool {
    if item_count == 0 {
        return false;
    }
    let Some(root) = body.as_object() else {
        return item_count >= page_size;
    };

    let scopes = [
        Some(root),
        root.get("meta").and_then(JsonValue::as_object),
        root.get("pagination").and_then(JsonValue::as_object),
        root.get("links").and_then(JsonValue::as_object),
    ];
    for scope in scopes.into_iter().flatten() {
        if let Some(flag) = MORE_FLAG_KEYS
            .iter()
            .find_map(|key| scope.get(*key).and_then(JsonValue::as_bool))
        {
            return flag;
        }
        if let Some(next) = NEXT_LINK_KEYS.iter().find_map(|key| scope.get(*key)) {
            return match next {
                JsonValue::Null | JsonValue::Bool(false) => false,
                JsonValue::String(s) => !s.trim().is_empty(),
                _ => true,
            };
        }
        if let Some(total) = TOTAL_PAGES_KEYS
            .iter()
            .find_map(|key| scope.get(*key).and_then(JsonValue::as_u64))
        {
            return (page as u64) < total;
        }
    }
    item_count >= page_size
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}
