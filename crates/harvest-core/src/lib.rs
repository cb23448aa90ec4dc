//! Core domain model for opportunity harvesting: sources, canonical records, quality and sync state.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "harvest-core";

/// Audit log entries retained per record; older entries are dropped first.
pub const MAX_TRANSFORM_LOG_ENTRIES: usize = 50;

/// Consecutive failures at which a source is considered failed rather than degraded.
pub const FAILED_SOURCE_THRESHOLD: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchKind {
    Api,
    Rss,
    Scrape,
}

impl FetchKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Api => "api",
            Self::Rss => "rss",
            Self::Scrape => "scrape",
        }
    }
}

impl fmt::Display for FetchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown fetch kind `{0}` (expected api, rss or scrape)")]
pub struct UnknownFetchKind(String);

impl FromStr for FetchKind {
    type Err = UnknownFetchKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "api" => Ok(Self::Api),
            "rss" => Ok(Self::Rss),
            "scrape" | "html" => Ok(Self::Scrape),
            other => Err(UnknownFetchKind(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncCadence {
    Hourly,
    #[default]
    Daily,
    Weekly,
    Manual,
}

impl SyncCadence {
    /// Delay until the next scheduled sync after a success; `None` for manual sources.
    pub fn interval(self) -> Option<Duration> {
        match self {
            Self::Hourly => Some(Duration::hours(1)),
            Self::Daily => Some(Duration::days(1)),
            Self::Weekly => Some(Duration::weeks(1)),
            Self::Manual => None,
        }
    }

    /// Age of the last success after which a record counts as stale.
    pub fn stale_after(self) -> Duration {
        match self {
            Self::Hourly => Duration::hours(2),
            Self::Daily => Duration::days(2),
            Self::Weekly => Duration::weeks(2),
            Self::Manual => Duration::days(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthDescriptor {
    #[default]
    None,
    Bearer {
        token: String,
    },
    Basic {
        username: String,
        #[serde(default)]
        password: Option<String>,
    },
    ApiKey {
        header: String,
        value: String,
    },
}

/// Fields of the canonical schema every source maps into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanonicalField {
    Title,
    Description,
    Category,
    Company,
    Location,
    SalaryMin,
    SalaryMax,
    Salary,
    Skills,
    StartDate,
    Deadline,
    PostedAt,
    ExternalId,
    ExternalUrl,
}

impl CanonicalField {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Title => "title",
            Self::Description => "description",
            Self::Category => "category",
            Self::Company => "company",
            Self::Location => "location",
            Self::SalaryMin => "salary_min",
            Self::SalaryMax => "salary_max",
            Self::Salary => "salary",
            Self::Skills => "skills",
            Self::StartDate => "start_date",
            Self::Deadline => "deadline",
            Self::PostedAt => "posted_at",
            Self::ExternalId => "external_id",
            Self::ExternalUrl => "external_url",
        }
    }
}

impl fmt::Display for CanonicalField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchSettings {
    /// CSS selector for one listing on a scraped page.
    #[serde(default)]
    pub container_selector: Option<String>,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_page_param")]
    pub page_param: String,
    #[serde(default = "default_page_size_param")]
    pub page_size_param: String,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            container_selector: None,
            page_size: default_page_size(),
            page_param: default_page_param(),
            page_size_param: default_page_size_param(),
        }
    }
}

fn default_page_size() -> u32 {
    50
}

fn default_page_param() -> String {
    "page".to_string()
}

fn default_page_size_param() -> String {
    "per_page".to_string()
}

fn default_requests_per_hour() -> u32 {
    60
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    #[default]
    NeverSynced,
    Healthy,
    Degraded,
    Failed,
    Inactive,
}

/// A configured external listings provider plus its running sync state.
///
/// Only the configuration half is expected in a registry file; the runtime
/// half defaults to a never-synced source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub source_id: String,
    pub display_name: String,
    pub kind: FetchKind,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub auth: AuthDescriptor,
    #[serde(default)]
    pub field_mapping: BTreeMap<CanonicalField, String>,
    #[serde(default)]
    pub fetch: FetchSettings,
    #[serde(default = "default_requests_per_hour")]
    pub requests_per_hour: u32,
    #[serde(default)]
    pub cadence: SyncCadence,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub is_verified: bool,
    #[serde(default)]
    pub status: SourceStatus,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub last_attempt_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_success_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_attempt_after: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub total_opportunities_synced: u64,
    #[serde(default)]
    pub average_quality_score: f64,
}

impl Source {
    pub fn new(source_id: impl Into<String>, display_name: impl Into<String>, kind: FetchKind) -> Self {
        Self {
            source_id: source_id.into(),
            display_name: display_name.into(),
            kind,
            base_url: None,
            auth: AuthDescriptor::None,
            field_mapping: BTreeMap::new(),
            fetch: FetchSettings::default(),
            requests_per_hour: default_requests_per_hour(),
            cadence: SyncCadence::default(),
            is_active: true,
            is_verified: false,
            status: SourceStatus::NeverSynced,
            consecutive_failures: 0,
            last_attempt_at: None,
            last_success_at: None,
            next_attempt_after: None,
            last_error: None,
            total_opportunities_synced: 0,
            average_quality_score: 0.0,
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn with_mapping(mut self, field: CanonicalField, key: impl Into<String>) -> Self {
        self.field_mapping.insert(field, key.into());
        self
    }

    pub fn mapping_for(&self, field: CanonicalField) -> Option<&str> {
        self.field_mapping
            .get(&field)
            .map(String::as_str)
            .filter(|s| !s.trim().is_empty())
    }

    pub fn is_healthy(&self) -> bool {
        self.is_active
            && self.consecutive_failures < FAILED_SOURCE_THRESHOLD
            && self.average_quality_score > 0.5
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Technology,
    Business,
    Design,
    Marketing,
    Finance,
    Healthcare,
    Education,
    Engineering,
    Research,
    #[default]
    Other,
}

impl Category {
    pub const ALL: [Category; 10] = [
        Category::Technology,
        Category::Business,
        Category::Design,
        Category::Marketing,
        Category::Finance,
        Category::Healthcare,
        Category::Education,
        Category::Engineering,
        Category::Research,
        Category::Other,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Technology => "technology",
            Self::Business => "business",
            Self::Design => "design",
            Self::Marketing => "marketing",
            Self::Finance => "finance",
            Self::Healthcare => "healthcare",
            Self::Education => "education",
            Self::Engineering => "engineering",
            Self::Research => "research",
            Self::Other => "other",
        }
    }

    pub fn is_default(self) -> bool {
        self == Self::Other
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityTier {
    Excellent,
    Good,
    Fair,
    Poor,
    VeryPoor,
}

impl QualityTier {
    pub fn from_score(score: f64) -> Self {
        if score >= 0.9 {
            Self::Excellent
        } else if score >= 0.7 {
            Self::Good
        } else if score >= 0.5 {
            Self::Fair
        } else if score >= 0.3 {
            Self::Poor
        } else {
            Self::VeryPoor
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Excellent => "excellent",
            Self::Good => "good",
            Self::Fair => "fair",
            Self::Poor => "poor",
            Self::VeryPoor => "very_poor",
        }
    }
}

/// Quality score with its tier. The only constructor derives the tier from
/// the score, so the two cannot drift apart.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "QualityRepr")]
pub struct QualityAssessment {
    score: f64,
    tier: QualityTier,
}

#[derive(Deserialize)]
struct QualityRepr {
    score: f64,
}

impl From<QualityRepr> for QualityAssessment {
    fn from(repr: QualityRepr) -> Self {
        Self::from_score(repr.score)
    }
}

impl QualityAssessment {
    pub fn from_score(score: f64) -> Self {
        let score = if score.is_nan() { 0.0 } else { score.clamp(0.0, 1.0) };
        Self {
            score,
            tier: QualityTier::from_score(score),
        }
    }

    pub fn unscored() -> Self {
        Self::from_score(0.0)
    }

    pub fn score(&self) -> f64 {
        self.score
    }

    pub fn tier(&self) -> QualityTier {
        self.tier
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    #[default]
    Pending,
    Synced,
    Outdated,
    Failed,
    Removed,
}

impl SyncStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Synced => "synced",
            Self::Outdated => "outdated",
            Self::Failed => "failed",
            Self::Removed => "removed",
        }
    }
}

/// Normalized values of one listing.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CanonicalFields {
    pub title: String,
    pub description: String,
    pub category: Category,
    pub company: Option<String>,
    pub location: Option<String>,
    pub salary_min: Option<f64>,
    pub salary_max: Option<f64>,
    #[serde(default)]
    pub skills: Vec<String>,
    pub start_date: Option<NaiveDate>,
    pub deadline: Option<NaiveDate>,
    pub posted_at: Option<DateTime<Utc>>,
    pub external_id: String,
    pub external_url: Option<String>,
    /// Fields holding fallback values rather than upstream data.
    #[serde(default)]
    pub placeholders: BTreeSet<CanonicalField>,
}

impl CanonicalFields {
    pub fn is_placeholder(&self, field: CanonicalField) -> bool {
        self.placeholders.contains(&field)
    }

    pub fn has_salary(&self) -> bool {
        self.salary_min.is_some() || self.salary_max.is_some()
    }

    /// Names of fields whose values differ between `self` and `other`.
    pub fn changed_fields(&self, other: &CanonicalFields) -> Vec<CanonicalField> {
        let mut changed = Vec::new();
        let mut check = |differs: bool, field: CanonicalField| {
            if differs {
                changed.push(field);
            }
        };
        check(self.title != other.title, CanonicalField::Title);
        check(self.description != other.description, CanonicalField::Description);
        check(self.category != other.category, CanonicalField::Category);
        check(self.company != other.company, CanonicalField::Company);
        check(self.location != other.location, CanonicalField::Location);
        check(self.salary_min != other.salary_min, CanonicalField::SalaryMin);
        check(self.salary_max != other.salary_max, CanonicalField::SalaryMax);
        check(self.skills != other.skills, CanonicalField::Skills);
        check(self.start_date != other.start_date, CanonicalField::StartDate);
        check(self.deadline != other.deadline, CanonicalField::Deadline);
        check(self.posted_at != other.posted_at, CanonicalField::PostedAt);
        check(self.external_id != other.external_id, CanonicalField::ExternalId);
        check(self.external_url != other.external_url, CanonicalField::ExternalUrl);
        changed
    }
}

/// One upstream item as key/value pairs, before normalization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawRecord(JsonMap<String, JsonValue>);

impl RawRecord {
    pub fn new() -> Self {
        Self(JsonMap::new())
    }

    pub fn from_map(map: JsonMap<String, JsonValue>) -> Self {
        Self(map)
    }

    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.0.get(key)
    }

    /// Looks up `a.b.c` style paths through nested objects; a plain key is a one-segment path.
    pub fn get_path(&self, path: &str) -> Option<&JsonValue> {
        if let Some(value) = self.0.get(path) {
            return Some(value);
        }
        let mut segments = path.split('.');
        let mut cur = self.0.get(segments.next()?)?;
        for segment in segments {
            cur = match cur {
                JsonValue::Object(map) => map.get(segment)?,
                JsonValue::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(cur)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: JsonValue) {
        self.0.insert(key.into(), value);
    }

    pub fn insert_text(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), JsonValue::String(value.into()));
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn as_map(&self) -> &JsonMap<String, JsonValue> {
        &self.0
    }

    pub fn to_value(&self) -> JsonValue {
        JsonValue::Object(self.0.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformLogEntry {
    pub at: DateTime<Utc>,
    pub action: String,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("record {0} cannot be a duplicate of itself")]
    SelfLink(Uuid),
    #[error("record {target} is itself a duplicate and cannot be a link target")]
    TargetIsDuplicate { target: Uuid },
}

/// Canonical listing derived from one `(source_id, external_id)` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opportunity {
    pub id: Uuid,
    /// The underlying listing that is deactivated when this record is a duplicate.
    pub listing_id: Uuid,
    pub source_id: String,
    pub external_id: String,
    pub external_url: Option<String>,
    pub fields: CanonicalFields,
    pub raw_payload: JsonValue,
    pub payload_hash: String,
    pub quality: QualityAssessment,
    pub sync_status: SyncStatus,
    pub sync_error_count: u32,
    pub last_error: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub next_sync_due: Option<DateTime<Utc>>,
    pub first_seen_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub is_active: bool,
    pub duplicate_of: Option<Uuid>,
    #[serde(default)]
    pub potential_duplicates: BTreeSet<Uuid>,
    #[serde(default)]
    pub transform_log: Vec<TransformLogEntry>,
}

impl Opportunity {
    pub fn new(
        source_id: impl Into<String>,
        fields: CanonicalFields,
        raw_payload: JsonValue,
        payload_hash: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut opportunity = Self {
            id: Uuid::new_v4(),
            listing_id: Uuid::new_v4(),
            source_id: source_id.into(),
            external_id: fields.external_id.clone(),
            external_url: fields.external_url.clone(),
            fields,
            raw_payload,
            payload_hash: payload_hash.into(),
            quality: QualityAssessment::unscored(),
            sync_status: SyncStatus::Pending,
            sync_error_count: 0,
            last_error: None,
            last_synced_at: None,
            last_success_at: None,
            next_sync_due: None,
            first_seen_at: now,
            updated_at: now,
            is_active: true,
            duplicate_of: None,
            potential_duplicates: BTreeSet::new(),
            transform_log: Vec::new(),
        };
        opportunity.log_transform(now, "created", "first fetch of external record");
        opportunity
    }

    pub fn is_duplicate(&self) -> bool {
        self.duplicate_of.is_some()
    }

    /// Marks `self` as a duplicate of `target` and deactivates its listing.
    pub fn link_duplicate(&mut self, target: &Opportunity, now: DateTime<Utc>) -> Result<(), LinkError> {
        if target.id == self.id {
            return Err(LinkError::SelfLink(self.id));
        }
        if target.is_duplicate() {
            return Err(LinkError::TargetIsDuplicate { target: target.id });
        }
        self.duplicate_of = Some(target.id);
        self.is_active = false;
        self.potential_duplicates.remove(&target.id);
        self.log_transform(now, "duplicate_linked", format!("duplicate of {}", target.id));
        Ok(())
    }

    /// Returns true when `candidate` was not already flagged for review.
    pub fn add_potential_duplicate(&mut self, candidate: Uuid, now: DateTime<Utc>) -> bool {
        if candidate == self.id || !self.potential_duplicates.insert(candidate) {
            return false;
        }
        self.log_transform(now, "potential_duplicate", format!("flagged against {candidate}"));
        true
    }

    /// Replaces canonical values and origin metadata after a re-fetch.
    pub fn refresh_from(
        &mut self,
        fields: CanonicalFields,
        raw_payload: JsonValue,
        payload_hash: impl Into<String>,
        now: DateTime<Utc>,
    ) {
        let changed = self.fields.changed_fields(&fields);
        self.external_url = fields.external_url.clone();
        self.fields = fields;
        self.raw_payload = raw_payload;
        self.payload_hash = payload_hash.into();
        self.updated_at = now;
        if !changed.is_empty() {
            let names = changed.iter().map(|f| f.as_str()).collect::<Vec<_>>().join(",");
            self.log_transform(now, "fields_refreshed", names);
        }
    }

    pub fn log_transform(&mut self, at: DateTime<Utc>, action: &str, detail: impl Into<String>) {
        self.transform_log.push(TransformLogEntry {
            at,
            action: action.to_string(),
            detail: detail.into(),
        });
        if self.transform_log.len() > MAX_TRANSFORM_LOG_ENTRIES {
            let excess = self.transform_log.len() - MAX_TRANSFORM_LOG_ENTRIES;
            self.transform_log.drain(..excess);
        }
    }
}
