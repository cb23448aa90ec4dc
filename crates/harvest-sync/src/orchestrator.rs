//! Composes fetch, normalize, score, categorize, dedup and persist per source.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use harvest_adapters::{adapter_for_kind, AdapterContext, AdapterError};
use harvest_core::{Opportunity, RawRecord, Source, SourceStatus, SyncCadence, SyncStatus};
use harvest_storage::{
    sha256_hex, Cache, CacheKey, CacheKind, FetchError, HttpClientConfig, HttpFetcher, RateLimiter, RecordStore,
    StoreError,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::categorize::Categorizer;
use crate::config::SyncConfig;
use crate::dedup::{DedupEngine, DedupOutcome};
use crate::report::{
    write_run_report, RunFilter, RunReport, SourceError, SourceErrorKind, SourceRunStats, SourceRunStatus,
};
use crate::{lifecycle, normalize, quality};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("http client setup failed: {0}")]
    Http(#[from] FetchError),
}

/// Aggregate figures over every stored record and source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    pub total_records: usize,
    pub active_records: usize,
    pub duplicates: usize,
    pub flagged_for_review: usize,
    pub average_quality: f64,
    pub by_status: BTreeMap<String, usize>,
    pub by_category: BTreeMap<String, usize>,
    pub by_tier: BTreeMap<String, usize>,
    pub sources_total: usize,
    pub sources_healthy: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSummary {
    pub source: Source,
    pub is_healthy: bool,
    pub record_count: usize,
    pub active_records: usize,
}

enum RecordOutcome {
    Added,
    Updated,
    Unchanged,
}

pub struct IngestionOrchestrator {
    store: Arc<dyn RecordStore>,
    http: HttpFetcher,
    rate_limiter: RateLimiter,
    cache: Cache,
    categorizer: Categorizer,
    dedup: DedupEngine,
    config: SyncConfig,
}

impl IngestionOrchestrator {
    pub fn new(store: Arc<dyn RecordStore>, config: SyncConfig) -> Result<Self, SyncError> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        Ok(Self {
            store,
            http,
            rate_limiter: RateLimiter::new(),
            cache: Cache::in_memory(),
            categorizer: Categorizer::default(),
            dedup: DedupEngine::default(),
            config,
        })
    }

    pub fn with_cache(mut self, cache: Cache) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_categorizer(mut self, categorizer: Categorizer) -> Self {
        self.categorizer = categorizer;
        self
    }

    pub fn with_dedup(mut self, dedup: DedupEngine) -> Self {
        self.dedup = dedup;
        self
    }

    /// Runs one ingestion pass over the sources selected by `filter`.
    ///
    /// Only a failure to read the source list is returned as an error; every
    /// per-source and per-record failure is recorded in the report instead.
    pub async fn run_ingestion(&self, filter: RunFilter) -> Result<RunReport, SyncError> {
        let now = Utc::now();
        let run_id = Uuid::new_v4();
        let mut report = RunReport::new(run_id, now, filter.dry_run);

        let sources = self.store.list_sources().await?;
        let cadences: HashMap<String, SyncCadence> =
            sources.iter().map(|s| (s.source_id.clone(), s.cadence)).collect();

        let mut selected = Vec::new();
        for source in sources {
            if filter.source_id.as_deref().is_some_and(|id| id != source.source_id) {
                continue;
            }
            if filter.kind.is_some_and(|kind| kind != source.kind) {
                continue;
            }
            if !source.is_active {
                if source.status != SourceStatus::Inactive && !filter.dry_run {
                    self.persist_inactive(source).await;
                }
                continue;
            }
            let named = filter.source_id.is_some();
            if filter.force_all || named || lifecycle::source_is_due(&source, now, filter.max_age_hours) {
                selected.push(source);
            }
        }
        report.planned_sources = selected.iter().map(|s| s.source_id.clone()).collect();

        if filter.dry_run {
            info!(%run_id, planned = report.planned_sources.len(), "dry run; nothing fetched");
            report.finished_at = Utc::now();
            return Ok(report);
        }

        info!(%run_id, sources = selected.len(), "ingestion run started");
        let results: Vec<(SourceRunStats, Option<SourceError>)> = stream::iter(selected)
            .map(|source| self.sync_source(run_id, source, &filter))
            .buffer_unordered(self.config.max_parallel_sources.max(1))
            .collect()
            .await;

        for (stats, error) in results {
            report.absorb(stats);
            report.source_errors.extend(error);
        }
        report.per_source.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        report.outdated = self.refresh_stale_records(&cadences, Utc::now()).await;

        self.cache.invalidate_kind(CacheKind::Statistics);
        self.cache.invalidate_kind(CacheKind::SearchResults);

        report.finished_at = Utc::now();
        info!(
            %run_id,
            processed = report.sources_processed,
            skipped = report.sources_skipped,
            added = report.added,
            updated = report.updated,
            errors = report.errors,
            "ingestion run finished"
        );

        if let Some(dir) = &self.config.reports_dir {
            if let Err(err) = write_run_report(dir, &report).await {
                warn!(%run_id, error = %err, "failed to write run report");
            }
        }
        Ok(report)
    }

    async fn persist_inactive(&self, mut source: Source) {
        lifecycle::deactivate_source(&mut source);
        let source_id = source.source_id.clone();
        if let Err(err) = self.store.upsert_source(source).await {
            warn!(%source_id, error = %err, "failed to persist inactive source");
        }
        self.cache.invalidate(&CacheKey::source(&source_id));
    }

    async fn sync_source(
        &self,
        run_id: Uuid,
        source: Source,
        filter: &RunFilter,
    ) -> (SourceRunStats, Option<SourceError>) {
        let span = info_span!("source_sync", %run_id, source_id = %source.source_id, kind = %source.kind);
        self.sync_source_inner(run_id, source, filter).instrument(span).await
    }

    async fn sync_source_inner(
        &self,
        run_id: Uuid,
        mut source: Source,
        filter: &RunFilter,
    ) -> (SourceRunStats, Option<SourceError>) {
        let mut stats = SourceRunStats::new(&source.source_id);

        if !self.rate_limiter.allow(&source.source_id, source.requests_per_hour) {
            debug!("rate limited; skipping this run");
            stats.status = SourceRunStatus::RateLimited;
            return (stats, None);
        }

        let adapter = adapter_for_kind(source.kind);
        let ctx = AdapterContext::new(run_id).with_inter_page_delay(self.config.inter_page_delay);
        let fetched = match adapter.validate(&source) {
            Ok(()) => adapter.fetch_raw(&self.http, &ctx, &source).await,
            Err(err) => Err(err),
        };

        let outcome = match fetched {
            Ok(outcome) => outcome,
            Err(err) => {
                let kind = match &err {
                    AdapterError::Fetch(_) => SourceErrorKind::Fetch,
                    AdapterError::Configuration(_) => SourceErrorKind::Configuration,
                    AdapterError::Malformed(_) => SourceErrorKind::Malformed,
                };
                let message = err.to_string();
                let timed_out = matches!(&err, AdapterError::Fetch(fetch) if fetch.is_timeout());
                warn!(error = %message, ?kind, timed_out, "source fetch failed");
                lifecycle::record_source_failure(&mut source, Utc::now(), message.as_str());
                let source_error = SourceError {
                    source_id: source.source_id.clone(),
                    kind,
                    message,
                };
                self.persist_source(source).await;
                stats.status = SourceRunStatus::Failed;
                return (stats, Some(source_error));
            }
        };

        stats.pages_fetched = outcome.pages_fetched;
        stats.fetched = outcome.records.len();
        stats.malformed = outcome.malformed.len();
        for reason in &outcome.malformed {
            debug!(%reason, "malformed item skipped");
        }

        let mut complete = outcome.is_complete();
        let mut records = outcome.records;
        if let Some(limit) = filter.batch_size {
            if records.len() > limit {
                records.truncate(limit);
                complete = false;
            }
        }
        stats.truncated = !complete;

        let now = Utc::now();
        let mut seen = HashSet::new();
        let mut checked = HashSet::new();
        let mut scores = Vec::new();
        for raw in records {
            match self.process_record(&source, raw, now, &mut checked, &mut stats).await {
                Ok((outcome, record)) => {
                    seen.insert(record.external_id.clone());
                    match outcome {
                        RecordOutcome::Added => {
                            stats.added += 1;
                            scores.push(record.quality.score());
                        }
                        RecordOutcome::Updated => {
                            stats.updated += 1;
                            scores.push(record.quality.score());
                        }
                        RecordOutcome::Unchanged => stats.unchanged += 1,
                    }
                }
                Err((external_id, err)) => {
                    seen.insert(external_id);
                    stats.errors += 1;
                    warn!(error = %err, "record upsert failed");
                }
            }
        }

        // A malformed item may still be listed upstream, so its absence proves nothing.
        if complete && stats.malformed == 0 && stats.fetched > 0 {
            stats.removed = self.retract_missing(&source.source_id, &seen, now).await;
        } else if stats.malformed > 0 {
            debug!(malformed = stats.malformed, "retraction skipped for this run");
        }

        lifecycle::record_source_success(&mut source, Utc::now());
        lifecycle::fold_quality(&mut source, &scores);
        self.persist_source(source).await;
        (stats, None)
    }

    async fn persist_source(&self, source: Source) {
        let source_id = source.source_id.clone();
        if let Err(err) = self.store.upsert_source(source).await {
            warn!(%source_id, error = %err, "failed to persist source state");
        }
        self.cache.invalidate(&CacheKey::source(&source_id));
    }

    /// Normalizes, scores, categorizes, dedups and upserts one raw record.
    async fn process_record(
        &self,
        source: &Source,
        raw: RawRecord,
        now: DateTime<Utc>,
        checked: &mut HashSet<Uuid>,
        stats: &mut SourceRunStats,
    ) -> Result<(RecordOutcome, Opportunity), (String, StoreError)> {
        let mut fields = normalize::normalize(source, &raw);
        self.categorizer.categorize(&mut fields);
        let payload = raw.to_value();
        let payload_hash = sha256_hex(payload.to_string().as_bytes());
        let external_id = fields.external_id.clone();
        let fail = |err| (external_id.clone(), err);

        let existing = self
            .store
            .find_by_external_key(&source.source_id, &fields.external_id)
            .await
            .map_err(fail)?;

        let (outcome, mut record, previous) = match existing {
            Some(mut record) if record.payload_hash == payload_hash && record.sync_status != SyncStatus::Removed => {
                lifecycle::mark_synced(&mut record, source.cadence, now);
                let record = self.store.upsert(record).await.map_err(fail)?;
                self.cache.invalidate(&CacheKey::record(record.id));
                return Ok((RecordOutcome::Unchanged, record));
            }
            Some(record) => {
                let previous = record.clone();
                let mut record = record;
                let relisted = record.sync_status == SyncStatus::Removed;
                record.refresh_from(fields, payload, payload_hash, now);
                record.quality = quality::assess(&record.fields, previous.sync_error_count);
                if relisted {
                    record.log_transform(now, "relisted", "listed upstream again");
                }
                (RecordOutcome::Updated, record, Some(previous))
            }
            None => {
                let quality = quality::assess(&fields, 0);
                let mut record = Opportunity::new(source.source_id.clone(), fields, payload, payload_hash, now);
                record.quality = quality;
                (RecordOutcome::Added, record, None)
            }
        };

        let dedup = if checked.insert(record.id) {
            self.check_duplicates(&mut record, now).await
        } else {
            DedupOutcome::AlreadyDuplicate
        };
        lifecycle::mark_synced(&mut record, source.cadence, now);

        let record = match self.store.upsert(record).await {
            Ok(record) => record,
            Err(err) => {
                if let Some(mut previous) = previous {
                    lifecycle::mark_failed(&mut previous, now, err.to_string());
                    let id = previous.id;
                    if let Err(persist_err) = self.store.upsert(previous).await {
                        warn!(record = %id, error = %persist_err, "could not record sync failure");
                    }
                    self.cache.invalidate(&CacheKey::record(id));
                }
                return Err(fail(err));
            }
        };
        self.cache.invalidate(&CacheKey::record(record.id));

        match dedup {
            DedupOutcome::Duplicate(found) => {
                stats.duplicates += 1;
                info!(record = %record.id, duplicate_of = %found.candidate, similarity = found.similarity, "duplicate linked");
                if let Err(err) = self.store.mark_listing_inactive(record.listing_id).await {
                    warn!(record = %record.id, error = %err, "failed to deactivate duplicate listing");
                }
            }
            DedupOutcome::PotentialDuplicate(_) => stats.potential_duplicates += 1,
            DedupOutcome::Unique | DedupOutcome::AlreadyDuplicate => {}
        }
        Ok((outcome, record))
    }

    async fn check_duplicates(&self, record: &mut Opportunity, now: DateTime<Utc>) -> DedupOutcome {
        if record.is_duplicate() {
            return DedupOutcome::AlreadyDuplicate;
        }
        match self
            .store
            .dedup_candidates(record.fields.category, self.dedup.window_start(now))
            .await
        {
            Ok(candidates) => self.dedup.apply(record, &candidates, now),
            Err(err) => {
                warn!(record = %record.id, error = %err, "dedup candidates unavailable; skipping check");
                DedupOutcome::Unique
            }
        }
    }

    /// Marks stored records of `source_id` missing from a complete fetch as removed.
    async fn retract_missing(&self, source_id: &str, seen: &HashSet<String>, now: DateTime<Utc>) -> usize {
        let stored = match self.store.list_for_source(source_id).await {
            Ok(stored) => stored,
            Err(err) => {
                warn!(error = %err, "could not list records for retraction check");
                return 0;
            }
        };
        let mut removed = 0;
        for mut record in stored {
            if seen.contains(&record.external_id) || record.sync_status == SyncStatus::Removed {
                continue;
            }
            lifecycle::mark_removed(&mut record, now);
            let id = record.id;
            match self.store.upsert(record).await {
                Ok(_) => removed += 1,
                Err(err) => warn!(record = %id, error = %err, "failed to mark record removed"),
            }
            self.cache.invalidate(&CacheKey::record(id));
        }
        removed
    }

    async fn refresh_stale_records(&self, cadences: &HashMap<String, SyncCadence>, now: DateTime<Utc>) -> usize {
        let records = match self.store.all().await {
            Ok(records) => records,
            Err(err) => {
                warn!(error = %err, "could not scan records for staleness");
                return 0;
            }
        };
        let mut flipped = 0;
        for mut record in records {
            let cadence = cadences.get(&record.source_id).copied().unwrap_or_default();
            if !lifecycle::refresh_staleness(&mut record, cadence, now) {
                continue;
            }
            let id = record.id;
            match self.store.upsert(record).await {
                Ok(_) => flipped += 1,
                Err(err) => warn!(record = %id, error = %err, "failed to mark record outdated"),
            }
            self.cache.invalidate(&CacheKey::record(id));
        }
        flipped
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
        info!("cache cleared");
    }

    /// Pre-populates source summaries and global statistics. Returns the number of entries written.
    pub async fn warm_cache(&self) -> Result<usize, SyncError> {
        let sources = self.store.list_sources().await?;
        let mut warmed = 0;
        for source in sources {
            let key = CacheKey::source(&source.source_id);
            let summary = self.build_source_summary(source).await?;
            self.cache.set(&key, &summary);
            warmed += 1;
        }
        let stats = self.compute_statistics().await?;
        self.cache.set(&CacheKey::statistics("global"), &stats);
        info!(entries = warmed + 1, "cache warmed");
        Ok(warmed + 1)
    }

    pub async fn statistics(&self) -> Result<Statistics, SyncError> {
        self.cache
            .get_or_load(&CacheKey::statistics("global"), || self.compute_statistics())
            .await
    }

    pub async fn source_summary(&self, source_id: &str) -> Result<Option<SourceSummary>, SyncError> {
        let key = CacheKey::source(source_id);
        if let Some(hit) = self.cache.get::<SourceSummary>(&key) {
            return Ok(Some(hit));
        }
        let Some(source) = self.store.get_source(source_id).await? else {
            return Ok(None);
        };
        let summary = self.build_source_summary(source).await?;
        self.cache.set(&key, &summary);
        Ok(Some(summary))
    }

    /// Summaries for every registered source, inactive ones included.
    pub async fn source_summaries(&self) -> Result<Vec<SourceSummary>, SyncError> {
        let mut out = Vec::new();
        for source in self.store.list_sources().await? {
            match self.source_summary(&source.source_id).await? {
                Some(summary) => out.push(summary),
                None => out.push(self.build_source_summary(source).await?),
            }
        }
        Ok(out)
    }

    pub async fn record(&self, id: Uuid) -> Result<Option<Opportunity>, SyncError> {
        let key = CacheKey::record(id);
        if let Some(hit) = self.cache.get::<Opportunity>(&key) {
            return Ok(Some(hit));
        }
        let found = self.store.get(id).await?;
        if let Some(record) = &found {
            self.cache.set(&key, record);
        }
        Ok(found)
    }

    async fn build_source_summary(&self, source: Source) -> Result<SourceSummary, SyncError> {
        let records = self.store.list_for_source(&source.source_id).await?;
        Ok(SourceSummary {
            is_healthy: source.is_healthy(),
            record_count: records.len(),
            active_records: records.iter().filter(|r| r.is_active).count(),
            source,
        })
    }

    async fn compute_statistics(&self) -> Result<Statistics, SyncError> {
        let records = self.store.all().await?;
        let sources = self.store.list_sources().await?;
        let mut stats = Statistics {
            total_records: records.len(),
            sources_total: sources.len(),
            sources_healthy: sources.iter().filter(|s| s.is_healthy()).count(),
            ..Default::default()
        };
        let mut quality_sum = 0.0;
        for record in &records {
            if record.is_active {
                stats.active_records += 1;
            }
            if record.is_duplicate() {
                stats.duplicates += 1;
            }
            if !record.potential_duplicates.is_empty() {
                stats.flagged_for_review += 1;
            }
            quality_sum += record.quality.score();
            *stats.by_status.entry(record.sync_status.as_str().to_string()).or_default() += 1;
            *stats.by_category.entry(record.fields.category.as_str().to_string()).or_default() += 1;
            *stats.by_tier.entry(record.quality.tier().as_str().to_string()).or_default() += 1;
        }
        if !records.is_empty() {
            stats.average_quality = quality_sum / records.len() as f64;
        }
        Ok(stats)
    }
}
