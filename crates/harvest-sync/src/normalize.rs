//! Raw record -> canonical fields.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use harvest_core::{CanonicalField, CanonicalFields, Category, RawRecord, Source};
use harvest_storage::sha256_hex;
use scraper::Html;
use serde_json::Value as JsonValue;

use crate::categorize::{occurrences, words};

pub const PLACEHOLDER_TITLE: &str = "Untitled opportunity";
pub const PLACEHOLDER_DESCRIPTION: &str = "No description provided.";

/// Generic keys tried, in order, after the source's own mapping.
const SYNONYMS: &[(CanonicalField, &[&str])] = &[
    (CanonicalField::Title, &["title", "name", "job_title", "position", "headline"]),
    (
        CanonicalField::Description,
        &["description", "summary", "body", "details", "content", "job_description"],
    ),
    (CanonicalField::Category, &["category", "categories", "department", "field", "job_type"]),
    (
        CanonicalField::Company,
        &["company", "company_name", "organization", "organisation", "employer", "dc:creator"],
    ),
    (CanonicalField::Location, &["location", "city", "place", "region", "job_location"]),
    (CanonicalField::SalaryMin, &["salary_min", "min_salary", "stipend_min", "pay_min"]),
    (CanonicalField::SalaryMax, &["salary_max", "max_salary", "stipend_max", "pay_max"]),
    (CanonicalField::Salary, &["salary", "stipend", "compensation", "pay"]),
    (CanonicalField::Skills, &["skills", "required_skills", "tags", "requirements"]),
    (CanonicalField::StartDate, &["start_date", "starts_at", "start"]),
    (
        CanonicalField::Deadline,
        &["deadline", "application_deadline", "apply_by", "closes_at", "expires_at"],
    ),
    (
        CanonicalField::PostedAt,
        &["posted_at", "pubDate", "published_at", "date_posted", "created_at"],
    ),
    (CanonicalField::ExternalId, &["external_id", "id", "guid", "job_id", "uuid"]),
    (CanonicalField::ExternalUrl, &["external_url", "url", "link", "apply_url", "href"]),
];

/// Date formats tried in order; the first that parses wins.
const DATETIME_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"];
const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d/%m/%Y", "%m/%d/%Y", "%B %d, %Y", "%b %d, %Y", "%d %B %Y"];

/// Whole-word table for upstream category labels; first hit wins.
const CATEGORY_LABELS: &[(Category, &[&str])] = &[
    (
        Category::Technology,
        &["software", "technology", "tech", "it", "developer", "development", "programming", "data", "computer"],
    ),
    (
        Category::Engineering,
        &["engineering", "engineer", "mechanical", "electrical", "civil", "manufacturing"],
    ),
    (Category::Design, &["design", "designer", "graphic", "creative", "ux", "ui"]),
    (Category::Marketing, &["marketing", "advertising", "communications", "social media", "brand"]),
    (Category::Finance, &["finance", "financial", "accounting", "banking", "investment"]),
    (
        Category::Healthcare,
        &["health", "healthcare", "medical", "medicine", "nursing", "clinical", "hospital", "pharma", "pharmaceutical"],
    ),
    (Category::Education, &["education", "teaching", "tutor", "tutoring", "academic", "school"]),
    (Category::Research, &["research", "science", "scientific", "laboratory", "lab"]),
    (Category::Business, &["business", "management", "operations", "consulting", "sales", "strategy"]),
];

pub fn synonyms_for(field: CanonicalField) -> &'static [&'static str] {
    SYNONYMS
        .iter()
        .find(|(f, _)| *f == field)
        .map(|(_, keys)| *keys)
        .unwrap_or(&[])
}

/// Resolves `field` on `raw`: the source override first (plain key or dotted
/// path), then the synonym list. Nulls and blank strings count as absent.
pub fn lookup<'a>(source: &Source, raw: &'a RawRecord, field: CanonicalField) -> Option<&'a JsonValue> {
    let present = |v: &&JsonValue| match v {
        JsonValue::Null => false,
        JsonValue::String(s) => !s.trim().is_empty(),
        JsonValue::Array(items) => !items.is_empty(),
        _ => true,
    };
    if let Some(value) = source
        .mapping_for(field)
        .and_then(|key| raw.get_path(key))
        .filter(present)
    {
        return Some(value);
    }
    std::iter::once(field.as_str())
        .chain(synonyms_for(field).iter().copied())
        .find_map(|key| raw.get(key).filter(present))
}

/// Flattens a JSON value to display text. Objects resolve through a
/// `name`/`title`/`label` key, arrays join their text elements.
pub fn value_text(value: &JsonValue) -> Option<String> {
    let text = match value {
        JsonValue::String(s) => s.clone(),
        JsonValue::Number(n) => n.to_string(),
        JsonValue::Bool(b) => b.to_string(),
        JsonValue::Array(items) => items
            .iter()
            .filter_map(value_text)
            .collect::<Vec<_>>()
            .join(", "),
        JsonValue::Object(map) => return ["name", "title", "label", "display_name"]
            .iter()
            .find_map(|key| map.get(*key))
            .and_then(value_text),
        JsonValue::Null => return None,
    };
    collapse_whitespace(&text)
}

fn collapse_whitespace(text: &str) -> Option<String> {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    (!collapsed.is_empty()).then_some(collapsed)
}

/// Reduces an HTML fragment to whitespace-collapsed text.
pub fn strip_html(input: &str) -> Option<String> {
    if !input.contains('<') {
        return collapse_whitespace(input);
    }
    let fragment = Html::parse_fragment(input);
    let text = fragment.root_element().text().collect::<String>();
    collapse_whitespace(&text)
}

pub fn parse_datetime(input: &str) -> Option<DateTime<Utc>> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(input) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Some(date) = DATE_FORMATS
        .iter()
        .take(1)
        .find_map(|fmt| NaiveDate::parse_from_str(input, fmt).ok())
    {
        return date.and_hms_opt(0, 0, 0).map(|dt| Utc.from_utc_datetime(&dt));
    }
    if let Some(dt) = DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(input, fmt).ok())
    {
        return Some(Utc.from_utc_datetime(&dt));
    }
    DATE_FORMATS
        .iter()
        .skip(1)
        .find_map(|fmt| NaiveDate::parse_from_str(input, fmt).ok())
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|dt| Utc.from_utc_datetime(&dt))
}

/// Strings go through the format list; numbers are unix seconds.
pub fn value_datetime(value: &JsonValue) -> Option<DateTime<Utc>> {
    match value {
        JsonValue::Number(n) => n.as_i64().and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
        other => value_text(other).as_deref().and_then(parse_datetime),
    }
}

fn extract_numbers(text: &str) -> Vec<f64> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut seen_dot = false;
    let flush = |current: &mut String, seen_dot: &mut bool, out: &mut Vec<f64>| {
        if let Ok(n) = current.trim_end_matches('.').parse::<f64>() {
            out.push(n);
        }
        current.clear();
        *seen_dot = false;
    };
    // thousands separators never split a number
    for ch in text.chars().filter(|c| *c != ',') {
        if ch.is_ascii_digit() {
            current.push(ch);
        } else if ch == '.' && !seen_dot && !current.is_empty() {
            current.push(ch);
            seen_dot = true;
        } else if !current.is_empty() {
            flush(&mut current, &mut seen_dot, &mut out);
        }
    }
    if !current.is_empty() {
        flush(&mut current, &mut seen_dot, &mut out);
    }
    out
}

/// One monetary amount with currency symbols and separators stripped.
pub fn parse_money(text: &str) -> Option<f64> {
    let cleaned: String = text
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    cleaned.parse::<f64>().ok().filter(|n| n.is_finite())
}

/// `$50,000 - $60,000` -> `(50000, 60000)`; a single amount fills both bounds.
pub fn parse_money_range(text: &str) -> (Option<f64>, Option<f64>) {
    match extract_numbers(text).as_slice() {
        [] => (None, None),
        [single] => (Some(*single), Some(*single)),
        [a, b, ..] => (Some(a.min(*b)), Some(a.max(*b))),
    }
}

fn value_money(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        other => value_text(other).as_deref().and_then(parse_money),
    }
}

fn value_money_range(value: &JsonValue) -> (Option<f64>, Option<f64>) {
    match value {
        JsonValue::Number(n) => (n.as_f64(), n.as_f64()),
        JsonValue::Object(map) => (
            ["min", "minimum", "from"].iter().find_map(|k| map.get(*k)).and_then(value_money),
            ["max", "maximum", "to"].iter().find_map(|k| map.get(*k)).and_then(value_money),
        ),
        other => value_text(other)
            .map(|text| parse_money_range(&text))
            .unwrap_or((None, None)),
    }
}

pub fn map_category_label(label: &str) -> Category {
    let label = words(label);
    CATEGORY_LABELS
        .iter()
        .find(|(_, needles)| needles.iter().any(|needle| occurrences(&words(needle), &label) > 0))
        .map(|(category, _)| *category)
        .unwrap_or_default()
}

fn value_skills(value: &JsonValue) -> Vec<String> {
    let parts: Vec<String> = match value {
        JsonValue::Array(items) => items.iter().filter_map(value_text).collect(),
        other => value_text(other)
            .map(|text| {
                text.split([',', ';', '|'])
                    .filter_map(collapse_whitespace)
                    .collect()
            })
            .unwrap_or_default(),
    };
    let mut out: Vec<String> = Vec::with_capacity(parts.len());
    for part in parts {
        if !out.iter().any(|seen| seen.eq_ignore_ascii_case(&part)) {
            out.push(part);
        }
    }
    out
}

/// Stable id for records the provider ships without one.
pub fn fingerprint_id(source_id: &str, fields: &CanonicalFields) -> String {
    let basis = [
        source_id,
        fields.title.as_str(),
        fields.company.as_deref().unwrap_or_default(),
        fields.location.as_deref().unwrap_or_default(),
        fields.external_url.as_deref().unwrap_or_default(),
    ]
    .map(|part| part.trim().to_lowercase())
    .join("\u{1f}");
    let hash = sha256_hex(basis.as_bytes());
    format!("fp-{}", &hash[..16])
}

/// Maps one raw record onto the canonical schema. Never fails: missing
/// required text becomes a placeholder, unparseable values are left empty.
pub fn normalize(source: &Source, raw: &RawRecord) -> CanonicalFields {
    let text = |field| lookup(source, raw, field).and_then(value_text);
    let mut fields = CanonicalFields::default();

    match text(CanonicalField::Title) {
        Some(title) => fields.title = title,
        None => {
            fields.title = PLACEHOLDER_TITLE.to_string();
            fields.placeholders.insert(CanonicalField::Title);
        }
    }
    match lookup(source, raw, CanonicalField::Description)
        .and_then(value_text)
        .and_then(|d| strip_html(&d))
    {
        Some(description) => fields.description = description,
        None => {
            fields.description = PLACEHOLDER_DESCRIPTION.to_string();
            fields.placeholders.insert(CanonicalField::Description);
        }
    }

    fields.category = text(CanonicalField::Category)
        .map(|label| map_category_label(&label))
        .unwrap_or_default();
    fields.company = text(CanonicalField::Company);
    fields.location = text(CanonicalField::Location);

    fields.salary_min = lookup(source, raw, CanonicalField::SalaryMin).and_then(value_money);
    fields.salary_max = lookup(source, raw, CanonicalField::SalaryMax).and_then(value_money);
    if !fields.has_salary() {
        if let Some(value) = lookup(source, raw, CanonicalField::Salary) {
            let (min, max) = value_money_range(value);
            fields.salary_min = min;
            fields.salary_max = max;
        }
    }

    fields.skills = lookup(source, raw, CanonicalField::Skills)
        .map(value_skills)
        .unwrap_or_default();
    fields.start_date = lookup(source, raw, CanonicalField::StartDate)
        .and_then(value_datetime)
        .map(|dt| dt.date_naive());
    fields.deadline = lookup(source, raw, CanonicalField::Deadline)
        .and_then(value_datetime)
        .map(|dt| dt.date_naive());
    fields.posted_at = lookup(source, raw, CanonicalField::PostedAt).and_then(value_datetime);
    fields.external_url = text(CanonicalField::ExternalUrl);

    match text(CanonicalField::ExternalId) {
        Some(id) => fields.external_id = id,
        None => {
            fields.external_id = fingerprint_id(&source.source_id, &fields);
            fields.placeholders.insert(CanonicalField::ExternalId);
        }
    }
    fields
}
