//! RSS 2.0 / Atom feed adapter.

use std::collections::HashSet;

use async_trait::async_trait;
use harvest_core::{FetchKind, RawRecord, Source};
use harvest_storage::HttpFetcher;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tracing::warn;

use crate::{endpoint, fetch_text, AdapterContext, AdapterError, FetchAdapter, FetchOutcome};

/// Item children captured for every feed.
const DEFAULT_ELEMENTS: &[&str] = &["title", "description", "link", "pubDate", "category", "guid"];

#[derive(Debug, Clone, Copy, Default)]
pub struct RssAdapter;

#[async_trait]
impl FetchAdapter for RssAdapter {
    fn kind(&self) -> FetchKind {
        FetchKind::Rss
    }

    fn validate(&self, source: &Source) -> Result<(), AdapterError> {
        endpoint(source).map(|_| ())
    }

    async fn fetch_raw(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        source: &Source,
    ) -> Result<FetchOutcome, AdapterError> {
        let url = endpoint(source)?;
        let (_resp, text) = fetch_text(http, ctx, source, url).await?;
        let mut outcome = parse_feed(&text, source)?;
        outcome.pages_fetched = 1;
        Ok(outcome)
    }
}

/// Atom element names folded onto their RSS equivalents.
fn rss_key(element: &str) -> &str {
    match element {
        "summary" | "content" => "description",
        "published" | "updated" => "pubDate",
        "id" => "guid",
        other => other,
    }
}

fn element_name(start: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(start.name().as_ref()).into_owned()
}

fn is_entry(name: &str) -> bool {
    name == "item" || name == "entry"
}

/// Parses feed entries into raw records.
///
/// Beyond the default elements, any element named in the source's field
/// mapping is captured under its element name. Entries with neither a title
/// nor a link are skipped.
pub fn parse_feed(xml: &str, source: &Source) -> Result<FetchOutcome, AdapterError> {
    let extra: HashSet<&str> = source.field_mapping.values().map(String::as_str).collect();
    let wanted = |name: &str| DEFAULT_ELEMENTS.contains(&rss_key(name)) || extra.contains(name);

    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut outcome = FetchOutcome::default();
    let mut saw_feed_root = false;
    let mut entry: Option<RawRecord> = None;
    let mut entry_index = 0usize;
    // open elements inside the entry that are not being captured; only direct children count
    let mut entry_depth = 0usize;
    // element currently being captured, and how deep we are inside it
    let mut field: Option<String> = None;
    let mut nested = 0usize;
    let mut text = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(start)) => {
                let name = element_name(&start);
                if matches!(name.as_str(), "rss" | "feed" | "channel" | "rdf:RDF") {
                    saw_feed_root = true;
                }
                if field.is_some() {
                    nested += 1;
                } else if entry.is_none() {
                    if is_entry(&name) {
                        entry = Some(RawRecord::new());
                        entry_index += 1;
                        entry_depth = 0;
                    }
                } else if entry_depth == 0 && wanted(&name) {
                    field = Some(name);
                    nested = 0;
                    text.clear();
                } else {
                    entry_depth += 1;
                }
            }
            Ok(Event::Empty(start)) => {
                let name = element_name(&start);
                if let (Some(record), None, 0, "link") = (entry.as_mut(), field.as_ref(), entry_depth, name.as_str()) {
                    // Atom: <link href="..."/>
                    if let Ok(Some(href)) = start.try_get_attribute("href") {
                        if let Ok(value) = href.unescape_value() {
                            if record.get("link").is_none() && !value.trim().is_empty() {
                                record.insert_text("link", value.trim());
                            }
                        }
                    }
                }
            }
            Ok(Event::Text(chunk)) => {
                if field.is_some() {
                    match chunk.unescape() {
                        Ok(value) => push_text(&mut text, &value),
                        Err(err) => outcome
                            .malformed
                            .push(format!("entry {entry_index}: bad text escape: {err}")),
                    }
                }
            }
            Ok(Event::CData(chunk)) => {
                if field.is_some() {
                    push_text(&mut text, &String::from_utf8_lossy(&chunk.into_inner()));
                }
            }
            Ok(Event::End(end)) => {
                let name = String::from_utf8_lossy(end.name().as_ref()).into_owned();
                if field.is_some() {
                    if nested > 0 {
                        nested -= 1;
                    } else if field.as_deref() == Some(name.as_str()) {
                        if let Some(record) = entry.as_mut() {
                            store_field(record, &name, text.trim());
                        }
                        field = None;
                        text.clear();
                    }
                } else if entry.is_some() && entry_depth > 0 {
                    entry_depth -= 1;
                } else if is_entry(&name) {
                    if let Some(record) = entry.take() {
                        finish_entry(record, entry_index, source, &mut outcome);
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(err) => {
                let position = reader.buffer_position();
                if outcome.records.is_empty() && entry_index == 0 {
                    return Err(AdapterError::Malformed(format!(
                        "invalid feed XML at byte {position}: {err}"
                    )));
                }
                warn!(source_id = %source.source_id, position, error = %err, "feed XML broke mid-document");
                outcome
                    .malformed
                    .push(format!("feed XML error at byte {position}: {err}"));
                outcome.truncated = true;
                break;
            }
            Ok(_) => {}
        }
    }

    if !saw_feed_root {
        return Err(AdapterError::Malformed(
            "document is not an RSS or Atom feed".to_string(),
        ));
    }
    Ok(outcome)
}

fn push_text(buf: &mut String, chunk: &str) {
    if !buf.is_empty() && !chunk.is_empty() {
        buf.push(' ');
    }
    buf.push_str(chunk);
}

fn store_field(record: &mut RawRecord, element: &str, value: &str) {
    if value.is_empty() {
        return;
    }
    let key = rss_key(element);
    // repeated <category> elements accumulate
    if key == "category" {
        if let Some(existing) = record.get("category").and_then(|v| v.as_str()) {
            let joined = format!("{existing}, {value}");
            record.insert_text("category", joined);
            return;
        }
    }
    if record.get(key).is_none() {
        record.insert_text(key, value);
    }
}

fn finish_entry(record: RawRecord, index: usize, source: &Source, outcome: &mut FetchOutcome) {
    if record.get("title").is_none() && record.get("link").is_none() {
        let reason = format!("entry {index}: missing both title and link");
        warn!(source_id = %source.source_id, %reason, "skipping malformed feed entry");
        outcome.malformed.push(reason);
        return;
    }
    outcome.records.push(record);
}
