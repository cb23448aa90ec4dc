//! HTML listing-page adapter driven by per-source CSS selectors.

use async_trait::async_trait;
use harvest_core::{CanonicalField, FetchKind, RawRecord, Source};
use harvest_storage::HttpFetcher;
use reqwest::Url;
use scraper::{ElementRef, Html, Selector};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use crate::{endpoint, fetch_text, text_or_none, AdapterContext, AdapterError, FetchAdapter, FetchOutcome};

const DEFAULT_CONTAINER: &str = "article";
const DEFAULT_TITLE_SELECTOR: &str = "h1, h2, h3, .title";
const DEFAULT_LINK_SELECTOR: &str = "a@href";

#[derive(Debug, Clone, Copy, Default)]
pub struct ScrapeAdapter;

#[async_trait]
impl FetchAdapter for ScrapeAdapter {
    fn kind(&self) -> FetchKind {
        FetchKind::Scrape
    }

    fn validate(&self, source: &Source) -> Result<(), AdapterError> {
        endpoint(source)?;
        compile_rules(source).map(|_| ())
    }

    async fn fetch_raw(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        source: &Source,
    ) -> Result<FetchOutcome, AdapterError> {
        self.validate(source)?;
        let url = endpoint(source)?;
        let (resp, html) = fetch_text(http, ctx, source, url).await?;
        let mut outcome = parse_page(&html, source, &resp.final_url)?;
        outcome.pages_fetched = 1;
        Ok(outcome)
    }
}

/// One compiled `selector[@attr]` rule.
struct FieldRule {
    field: CanonicalField,
    selector: Selector,
    attr: Option<String>,
}

fn parse_selector(raw: &str, source: &Source) -> Result<Selector, AdapterError> {
    Selector::parse(raw).map_err(|e| {
        AdapterError::Configuration(format!(
            "invalid selector `{raw}` for {}: {e}",
            source.source_id
        ))
    })
}

/// Splits `css@attr`; a trailing `@name` only counts when `name` looks like an attribute.
fn split_attr(selector: &str) -> (&str, Option<&str>) {
    match selector.rsplit_once('@') {
        Some((css, attr))
            if !css.trim().is_empty()
                && !attr.is_empty()
                && attr.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') =>
        {
            (css.trim(), Some(attr))
        }
        _ => (selector.trim(), None),
    }
}

fn compile_rules(source: &Source) -> Result<(Selector, Vec<FieldRule>), AdapterError> {
    let container = source
        .fetch
        .container_selector
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(DEFAULT_CONTAINER);
    let container = parse_selector(container, source)?;

    let mut targets: Vec<(CanonicalField, &str)> = source
        .field_mapping
        .iter()
        .filter(|(_, selector)| !selector.trim().is_empty())
        .map(|(field, selector)| (*field, selector.as_str()))
        .collect();
    if !targets.iter().any(|(f, _)| *f == CanonicalField::Title) {
        targets.push((CanonicalField::Title, DEFAULT_TITLE_SELECTOR));
    }
    if !targets.iter().any(|(f, _)| *f == CanonicalField::ExternalUrl) {
        targets.push((CanonicalField::ExternalUrl, DEFAULT_LINK_SELECTOR));
    }

    let rules = targets
        .into_iter()
        .map(|(field, selector)| {
            let (css, attr) = split_attr(selector);
            Ok(FieldRule {
                field,
                selector: parse_selector(css, source)?,
                attr: attr.map(str::to_string),
            })
        })
        .collect::<Result<Vec<_>, AdapterError>>()?;
    Ok((container, rules))
}

/// Extracts one raw record per container element on `html`.
///
/// Values are stored under canonical field names. Link-like values are made
/// absolute against `page_url`.
pub fn parse_page(html: &str, source: &Source, page_url: &str) -> Result<FetchOutcome, AdapterError> {
    let (container, rules) = compile_rules(source)?;
    let base = Url::parse(page_url).ok();
    let document = Html::parse_document(html);

    let mut outcome = FetchOutcome::default();
    for (index, node) in document.select(&container).enumerate() {
        let mut record = RawRecord::new();
        for rule in &rules {
            if let Some(value) = extract(node, rule, base.as_ref()) {
                record.insert(rule.field.as_str(), value);
            }
        }

        if record.get(CanonicalField::Title.as_str()).is_none()
            && record.get(CanonicalField::ExternalUrl.as_str()).is_none()
        {
            let reason = format!("container {index}: no title or link matched");
            warn!(source_id = %source.source_id, %reason, "skipping empty listing");
            outcome.malformed.push(reason);
            continue;
        }
        outcome.records.push(record);
    }
    debug!(
        source_id = %source.source_id,
        records = outcome.records.len(),
        malformed = outcome.malformed.len(),
        "page scraped"
    );
    Ok(outcome)
}

fn extract(node: ElementRef<'_>, rule: &FieldRule, base: Option<&Url>) -> Option<JsonValue> {
    let values = node.select(&rule.selector).filter_map(|el| match rule.attr.as_deref() {
        Some(attr) => {
            let raw = el.value().attr(attr)?;
            let text = text_or_none(raw)?;
            Some(if is_link(rule.field, attr) {
                absolutize(&text, base)
            } else {
                text
            })
        }
        None => text_or_none(&el.text().collect::<String>()),
    });

    if rule.field == CanonicalField::Skills {
        let all: Vec<JsonValue> = values.map(JsonValue::String).collect();
        return (!all.is_empty()).then_some(JsonValue::Array(all));
    }
    values.into_iter().next().map(JsonValue::String)
}

fn is_link(field: CanonicalField, attr: &str) -> bool {
    field == CanonicalField::ExternalUrl || attr == "href" || attr == "src"
}

fn absolutize(value: &str, base: Option<&Url>) -> String {
    match base.and_then(|b| b.join(value).ok()) {
        Some(url) => url.to_string(),
        None => value.to_string(),
    }
}
