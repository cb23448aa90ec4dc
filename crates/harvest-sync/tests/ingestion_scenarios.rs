use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use harvest_core::{
    CanonicalFields, Category, FetchKind, Opportunity, QualityTier, Source, SourceStatus, SyncCadence, SyncStatus,
};
use harvest_storage::{InMemoryStore, OpportunityStore, RecordStore, SourceStore, StoreError};
use harvest_sync::{IngestionOrchestrator, RunFilter, SourceErrorKind, SyncConfig};
use serde_json::json;
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const DESCRIPTION: &str =
    "Build and operate the ingestion services behind our listings search for a summer term.";

fn api_source(id: &str, server: &MockServer) -> Source {
    let mut source = Source::new(id, "Acme Careers", FetchKind::Api).with_base_url(format!("{}/jobs", server.uri()));
    // room for back-to-back runs in one test
    source.requests_per_hour = 1_000_000;
    source
}

fn feed_source(id: &str, kind: FetchKind, url: String) -> Source {
    let mut source = Source::new(id, id, kind).with_base_url(url);
    source.requests_per_hour = 1_000_000;
    source
}

fn orchestrator(store: Arc<dyn RecordStore>, reports: Option<std::path::PathBuf>) -> IngestionOrchestrator {
    let config = SyncConfig {
        inter_page_delay: Duration::ZERO,
        reports_dir: reports,
        ..Default::default()
    };
    IngestionOrchestrator::new(store, config).unwrap()
}

async fn pause() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

fn forced() -> RunFilter {
    RunFilter {
        force_all: true,
        ..Default::default()
    }
}

async fn mount_jobs(server: &MockServer, body: serde_json::Value) {
    Mock::given(method("GET"))
        .and(path("/jobs"))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

fn backend_intern() -> serde_json::Value {
    json!([{
        "id": "x1",
        "title": "Backend Intern",
        "description": DESCRIPTION,
        "company": "Acme",
        "location": "Remote"
    }])
}

#[tokio::test]
async fn first_ingest_creates_a_synced_record() {
    let server = MockServer::start().await;
    mount_jobs(&server, backend_intern()).await;
    let store = Arc::new(InMemoryStore::with_sources([api_source("acme", &server)]));
    let orch = orchestrator(store.clone(), None);

    let before = Utc::now();
    let report = orch.run_ingestion(RunFilter::default()).await.unwrap();
    assert_eq!(report.sources_processed, 1);
    assert_eq!(report.added, 1);
    assert_eq!(report.updated, 0);
    assert_eq!(report.errors, 0);

    let record = store.find_by_external_key("acme", "x1").await.unwrap().unwrap();
    assert!(record.quality.tier() <= QualityTier::Good, "tier {:?}", record.quality.tier());
    assert_eq!(record.sync_status, SyncStatus::Synced);
    let due = record.next_sync_due.unwrap();
    let synced = record.last_synced_at.unwrap();
    assert!(synced >= before);
    assert_eq!(due - synced, SyncCadence::Daily.interval().unwrap());

    let source = store.get_source("acme").await.unwrap().unwrap();
    assert_eq!(source.status, SourceStatus::Healthy);
    assert_eq!(source.total_opportunities_synced, 1);
    assert!(source.next_attempt_after.is_some());
}

#[tokio::test]
async fn unchanged_reingest_adds_and_updates_nothing() {
    let server = MockServer::start().await;
    mount_jobs(&server, backend_intern()).await;
    let store = Arc::new(InMemoryStore::with_sources([api_source("acme", &server)]));
    let orch = orchestrator(store.clone(), None);

    orch.run_ingestion(RunFilter::default()).await.unwrap();
    let first = store.find_by_external_key("acme", "x1").await.unwrap().unwrap();
    pause().await;

    let report = orch
        .run_ingestion(RunFilter {
            force_all: true,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(report.sources_processed, 1);
    assert_eq!(report.added, 0);
    assert_eq!(report.updated, 0);
    assert_eq!(report.unchanged, 1);

    let second = store.find_by_external_key("acme", "x1").await.unwrap().unwrap();
    assert_eq!(second.id, first.id);
    assert_eq!(second.sync_error_count, first.sync_error_count);
    assert_eq!(second.fields, first.fields);
    assert_eq!(second.transform_log, first.transform_log);
}

#[tokio::test]
async fn transient_failure_degrades_and_skips_the_source() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    let store = Arc::new(InMemoryStore::with_sources([api_source("acme", &server)]));
    let orch = orchestrator(store.clone(), None);

    let report = orch.run_ingestion(RunFilter::default()).await.unwrap();
    assert_eq!(report.sources_processed, 0);
    assert_eq!(report.sources_skipped, 1);
    assert_eq!(report.source_errors.len(), 1);
    assert_eq!(report.source_errors[0].kind, SourceErrorKind::Fetch);

    let source = store.get_source("acme").await.unwrap().unwrap();
    assert_eq!(source.consecutive_failures, 1);
    assert_eq!(source.status, SourceStatus::Degraded);
    assert!(source.last_error.is_some());

    for _ in 0..4 {
        pause().await;
        orch.run_ingestion(RunFilter {
            force_all: true,
            ..Default::default()
        })
        .await
        .unwrap();
    }
    let source = store.get_source("acme").await.unwrap().unwrap();
    assert_eq!(source.consecutive_failures, 5);
    assert_eq!(source.status, SourceStatus::Failed);

    // still backing off, so a normal run leaves it alone
    let report = orch.run_ingestion(RunFilter::default()).await.unwrap();
    assert!(report.planned_sources.is_empty());
}

#[tokio::test]
async fn missing_endpoint_is_a_configuration_failure() {
    let store = Arc::new(InMemoryStore::with_sources([Source::new("bare", "Bare", FetchKind::Api)]));
    let orch = orchestrator(store.clone(), None);

    let report = orch.run_ingestion(RunFilter::default()).await.unwrap();
    assert_eq!(report.sources_skipped, 1);
    assert_eq!(report.source_errors[0].kind, SourceErrorKind::Configuration);
    let source = store.get_source("bare").await.unwrap().unwrap();
    assert_eq!(source.consecutive_failures, 1);
}

#[tokio::test]
async fn dry_run_plans_without_fetching_or_mutating() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(backend_intern()))
        .expect(0)
        .mount(&server)
        .await;
    let mut rss = Source::new("feed", "Feed", FetchKind::Rss).with_base_url(format!("{}/rss", server.uri()));
    rss.is_active = false;
    let store = Arc::new(InMemoryStore::with_sources([api_source("acme", &server), rss]));
    let orch = orchestrator(store.clone(), None);

    let report = orch
        .run_ingestion(RunFilter {
            dry_run: true,
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(report.dry_run);
    assert_eq!(report.planned_sources, vec!["acme".to_string()]);
    assert_eq!(report.added, 0);
    assert!(store.all().await.unwrap().is_empty());
    let feed = store.get_source("feed").await.unwrap().unwrap();
    assert_eq!(feed.status, SourceStatus::NeverSynced);
}

#[tokio::test]
async fn filters_select_by_source_and_kind() {
    let server = MockServer::start().await;
    mount_jobs(&server, json!([])).await;
    let rss = Source::new("feed", "Feed", FetchKind::Rss).with_base_url(format!("{}/rss", server.uri()));
    let store = Arc::new(InMemoryStore::with_sources([api_source("acme", &server), rss]));
    let orch = orchestrator(store, None);

    let by_kind = RunFilter {
        kind: Some(FetchKind::Rss),
        dry_run: true,
        ..Default::default()
    };
    assert_eq!(orch.run_ingestion(by_kind).await.unwrap().planned_sources, vec!["feed"]);

    let by_id = RunFilter {
        source_id: Some("acme".into()),
        dry_run: true,
        ..Default::default()
    };
    assert_eq!(orch.run_ingestion(by_id).await.unwrap().planned_sources, vec!["acme"]);
}

#[tokio::test]
async fn cross_source_copies_are_linked_as_duplicates() {
    let first = MockServer::start().await;
    let second = MockServer::start().await;
    mount_jobs(&first, backend_intern()).await;
    mount_jobs(
        &second,
        json!({"data": [{
            "job_id": "B-77",
            "job_title": "Backend intern",
            "summary": DESCRIPTION,
            "employer": "Acme",
            "city": "Remote"
        }]}),
    )
    .await;

    let store = Arc::new(InMemoryStore::with_sources([api_source("acme", &first)]));
    let orch = orchestrator(store.clone(), None);
    orch.run_ingestion(RunFilter::default()).await.unwrap();

    store.upsert_source(api_source("mirror", &second)).await.unwrap();
    let report = orch
        .run_ingestion(RunFilter {
            source_id: Some("mirror".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(report.added, 1);
    assert_eq!(report.duplicates, 1);

    let original = store.find_by_external_key("acme", "x1").await.unwrap().unwrap();
    let copy = store.find_by_external_key("mirror", "B-77").await.unwrap().unwrap();
    assert!(copy.is_duplicate());
    assert_eq!(copy.duplicate_of, Some(original.id));
    assert!(!copy.is_active);
    assert!(original.is_active);
}

#[tokio::test]
async fn records_missing_from_a_complete_fetch_are_removed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/jobs"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": "a", "title": "Archivist Intern", "description": DESCRIPTION},
            {"id": "b", "title": "Curatorial Fellow", "description": DESCRIPTION}
        ])))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    mount_jobs(
        &server,
        json!([{"id": "a", "title": "Archivist Intern", "description": DESCRIPTION}]),
    )
    .await;

    let store = Arc::new(InMemoryStore::with_sources([api_source("museum", &server)]));
    let orch = orchestrator(store.clone(), None);
    assert_eq!(orch.run_ingestion(RunFilter::default()).await.unwrap().added, 2);
    pause().await;

    let report = orch
        .run_ingestion(RunFilter {
            force_all: true,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(report.removed, 1);
    let gone = store.find_by_external_key("museum", "b").await.unwrap().unwrap();
    assert_eq!(gone.sync_status, SyncStatus::Removed);
}

#[tokio::test]
async fn batch_size_caps_records_and_skips_retraction() {
    let server = MockServer::start().await;
    mount_jobs(
        &server,
        json!([
            {"id": "1", "title": "One"},
            {"id": "2", "title": "Two"},
            {"id": "3", "title": "Three"}
        ]),
    )
    .await;
    let store = Arc::new(InMemoryStore::with_sources([api_source("acme", &server)]));
    let orch = orchestrator(store.clone(), None);

    let report = orch
        .run_ingestion(RunFilter {
            batch_size: Some(2),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(report.added, 2);
    assert!(report.per_source[0].truncated);
    assert_eq!(report.removed, 0);
}

#[tokio::test]
async fn read_paths_and_reports() {
    let server = MockServer::start().await;
    mount_jobs(&server, backend_intern()).await;
    let reports = tempfile::tempdir().unwrap();
    let store = Arc::new(InMemoryStore::with_sources([api_source("acme", &server)]));
    let orch = orchestrator(store.clone(), Some(reports.path().to_path_buf()));

    let report = orch.run_ingestion(RunFilter::default()).await.unwrap();
    let run_dir = reports.path().join(report.run_id.to_string());
    assert!(run_dir.join("run_report.json").exists());
    assert!(run_dir.join("summary.md").exists());

    let stats = orch.statistics().await.unwrap();
    assert_eq!(stats.total_records, 1);
    assert_eq!(stats.by_status.get("synced"), Some(&1));

    let summary = orch.source_summary("acme").await.unwrap().unwrap();
    assert_eq!(summary.record_count, 1);
    assert!(orch.source_summary("nope").await.unwrap().is_none());
    let all = orch.source_summaries().await.unwrap();
    assert_eq!(all.len(), 1);
    assert!(all[0].is_healthy);

    let stored = store.find_by_external_key("acme", "x1").await.unwrap().unwrap();
    let via_cache = orch.record(stored.id).await.unwrap().unwrap();
    assert_eq!(via_cache.id, stored.id);

    assert_eq!(orch.warm_cache().await.unwrap(), 2);
    orch.clear_cache();
    assert_eq!(orch.statistics().await.unwrap().total_records, 1);
}

const FEED_FULL: &str = r#"<rss version="2.0"><channel><title>Campus</title>
<item><guid>a</guid><title>Library Assistant</title><link>https://campus.example/a</link>
<description>Shelve returns and staff the front desk during evening hours each week.</description></item>
<item><guid>b</guid><title>Greenhouse Aide</title><link>https://campus.example/b</link></item>
</channel></rss>"#;

const FEED_BROKEN_ITEM: &str = r#"<rss version="2.0"><channel><title>Campus</title>
<item><guid>a</guid><title>Library Assistant</title><link>https://campus.example/a</link>
<description>Shelve returns and staff the front desk during evening hours each week.</description></item>
<item><guid>b</guid><description>title and link lost upstream</description></item>
</channel></rss>"#;

fn xml(body: &str) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .set_body_string(body)
        .insert_header("content-type", "application/rss+xml")
}

#[tokio::test]
async fn malformed_items_keep_their_records_listed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/feed.xml"))
        .respond_with(xml(FEED_FULL))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/feed.xml"))
        .respond_with(xml(FEED_BROKEN_ITEM))
        .mount(&server)
        .await;
    let feed = feed_source("campus", FetchKind::Rss, format!("{}/feed.xml", server.uri()));
    let store = Arc::new(InMemoryStore::with_sources([feed]));
    let orch = orchestrator(store.clone(), None);

    assert_eq!(orch.run_ingestion(RunFilter::default()).await.unwrap().added, 2);
    pause().await;

    let report = orch.run_ingestion(forced()).await.unwrap();
    assert_eq!(report.malformed, 1);
    assert_eq!(report.removed, 0);
    assert!(!report.per_source[0].truncated);
    let kept = store.find_by_external_key("campus", "b").await.unwrap().unwrap();
    assert_ne!(kept.sync_status, SyncStatus::Removed);
    assert!(kept.is_active);
}

#[tokio::test]
async fn feed_and_scraped_sources_ingest_end_to_end() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/feed.xml"))
        .respond_with(xml(FEED_FULL))
        .mount(&server)
        .await;
    let page = r#"<html><body>
<article><h2>Teaching Fellow</h2><a href="/fellows/7">Apply</a></article>
<article><p>Sponsored</p></article>
</body></html>"#;
    Mock::given(method("GET"))
        .and(path("/board"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(page)
                .insert_header("content-type", "text/html"),
        )
        .mount(&server)
        .await;
    let store = Arc::new(InMemoryStore::with_sources([
        feed_source("campus", FetchKind::Rss, format!("{}/feed.xml", server.uri())),
        feed_source("board", FetchKind::Scrape, format!("{}/board", server.uri())),
    ]));
    let orch = orchestrator(store.clone(), None);

    let report = orch.run_ingestion(RunFilter::default()).await.unwrap();
    assert_eq!(report.sources_processed, 2);
    assert_eq!(report.added, 3);
    assert_eq!(report.malformed, 1);
    assert!(report.source_errors.is_empty());

    let item = store.find_by_external_key("campus", "a").await.unwrap().unwrap();
    assert_eq!(item.fields.title, "Library Assistant");
    assert_eq!(item.external_url.as_deref(), Some("https://campus.example/a"));
    assert_eq!(item.sync_status, SyncStatus::Synced);

    let scraped = store.list_for_source("board").await.unwrap();
    assert_eq!(scraped.len(), 1);
    assert_eq!(scraped[0].fields.title, "Teaching Fellow");
    let expected = format!("{}/fellows/7", server.uri());
    assert_eq!(scraped[0].external_url.as_deref(), Some(expected.as_str()));
    assert!(scraped[0].external_id.starts_with("fp-"));
}

/// Delegates to an in-memory store but rejects one write for a chosen external id.
struct RejectingStore {
    inner: InMemoryStore,
    reject: Mutex<Option<String>>,
}

#[async_trait]
impl OpportunityStore for RejectingStore {
    async fn find_by_external_key(
        &self,
        source_id: &str,
        external_id: &str,
    ) -> Result<Option<Opportunity>, StoreError> {
        self.inner.find_by_external_key(source_id, external_id).await
    }

    async fn get(&self, id: Uuid) -> Result<Option<Opportunity>, StoreError> {
        self.inner.get(id).await
    }

    async fn upsert(&self, opportunity: Opportunity) -> Result<Opportunity, StoreError> {
        let rejected = {
            let mut reject = self.reject.lock().unwrap();
            if reject.as_deref() == Some(opportunity.external_id.as_str()) {
                reject.take()
            } else {
                None
            }
        };
        if rejected.is_some() {
            return Err(StoreError::Conflict {
                source_id: opportunity.source_id,
                external_id: opportunity.external_id,
                existing: Uuid::new_v4(),
            });
        }
        self.inner.upsert(opportunity).await
    }

    async fn mark_listing_inactive(&self, listing_id: Uuid) -> Result<(), StoreError> {
        self.inner.mark_listing_inactive(listing_id).await
    }

    async fn dedup_candidates(
        &self,
        category: Category,
        first_seen_since: DateTime<Utc>,
    ) -> Result<Vec<Opportunity>, StoreError> {
        self.inner.dedup_candidates(category, first_seen_since).await
    }

    async fn list_for_source(&self, source_id: &str) -> Result<Vec<Opportunity>, StoreError> {
        self.inner.list_for_source(source_id).await
    }

    async fn all(&self) -> Result<Vec<Opportunity>, StoreError> {
        self.inner.all().await
    }
}

#[async_trait]
impl SourceStore for RejectingStore {
    async fn list_sources(&self) -> Result<Vec<Source>, StoreError> {
        self.inner.list_sources().await
    }

    async fn get_source(&self, source_id: &str) -> Result<Option<Source>, StoreError> {
        self.inner.get_source(source_id).await
    }

    async fn upsert_source(&self, source: Source) -> Result<Source, StoreError> {
        self.inner.upsert_source(source).await
    }
}

#[tokio::test]
async fn rejected_write_marks_the_record_failed_and_the_run_continues() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/jobs"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": "b", "title": "Curatorial Fellow", "description": DESCRIPTION}
        ])))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    mount_jobs(
        &server,
        json!([
            {"id": "b", "title": "Senior Curatorial Fellow", "description": DESCRIPTION},
            {"id": "c", "title": "Registrar Apprentice", "description": DESCRIPTION}
        ]),
    )
    .await;

    let store = Arc::new(RejectingStore {
        inner: InMemoryStore::with_sources([api_source("museum", &server)]),
        reject: Mutex::new(None),
    });
    let orch = orchestrator(store.clone(), None);
    assert_eq!(orch.run_ingestion(RunFilter::default()).await.unwrap().added, 1);
    pause().await;

    *store.reject.lock().unwrap() = Some("b".to_string());
    let report = orch.run_ingestion(forced()).await.unwrap();
    assert_eq!(report.errors, 1);
    assert_eq!(report.added, 1);
    assert_eq!(report.removed, 0);
    assert_eq!(report.sources_processed, 1);

    let failed = store.find_by_external_key("museum", "b").await.unwrap().unwrap();
    assert_eq!(failed.sync_status, SyncStatus::Failed);
    assert_eq!(failed.sync_error_count, 1);
    assert_eq!(failed.fields.title, "Curatorial Fellow");
    assert!(failed.last_error.as_deref().is_some_and(|e| e.contains("already exists")));
    let backoff = failed.next_sync_due.unwrap() - failed.last_synced_at.unwrap();
    assert_eq!(backoff, chrono::Duration::hours(2));

    let added = store.find_by_external_key("museum", "c").await.unwrap().unwrap();
    assert_eq!(added.sync_status, SyncStatus::Synced);
}

#[tokio::test]
async fn stale_synced_records_turn_outdated_during_a_run() {
    let server = MockServer::start().await;
    mount_jobs(&server, backend_intern()).await;
    let mut archive = Source::new("archive", "Archive", FetchKind::Api);
    archive.is_active = false;
    archive.cadence = SyncCadence::Daily;
    let store = Arc::new(InMemoryStore::with_sources([api_source("acme", &server), archive]));

    let three_days_ago = Utc::now() - chrono::Duration::days(3);
    let fields = CanonicalFields {
        title: "Archived Posting".into(),
        description: DESCRIPTION.into(),
        external_id: "old-1".into(),
        ..Default::default()
    };
    let mut old = Opportunity::new("archive", fields, json!({"id": "old-1"}), "h", three_days_ago);
    old.sync_status = SyncStatus::Synced;
    old.last_success_at = Some(three_days_ago);
    store.upsert(old).await.unwrap();

    let orch = orchestrator(store.clone(), None);
    let report = orch.run_ingestion(RunFilter::default()).await.unwrap();
    assert_eq!(report.added, 1);
    assert_eq!(report.outdated, 1);

    let stale = store.find_by_external_key("archive", "old-1").await.unwrap().unwrap();
    assert_eq!(stale.sync_status, SyncStatus::Outdated);
    let fresh = store.find_by_external_key("acme", "x1").await.unwrap().unwrap();
    assert_eq!(fresh.sync_status, SyncStatus::Synced);
}

#[tokio::test]
async fn low_quality_source_is_not_healthy() {
    let server = MockServer::start().await;
    mount_jobs(&server, json!([{"id": "1", "title": "One"}, {"id": "2", "title": "Two"}])).await;
    let store = Arc::new(InMemoryStore::with_sources([api_source("thin", &server)]));
    let orch = orchestrator(store, None);

    orch.run_ingestion(RunFilter::default()).await.unwrap();
    let summary = orch.source_summary("thin").await.unwrap().unwrap();
    assert_eq!(summary.source.status, SourceStatus::Healthy);
    assert!(summary.source.average_quality_score <= 0.5);
    assert!(!summary.is_healthy);
}

#[tokio::test]
async fn fifth_consecutive_failure_makes_a_source_unhealthy() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/jobs"))
        .respond_with(ResponseTemplate::new(200).set_body_json(backend_intern()))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    let store = Arc::new(InMemoryStore::with_sources([api_source("acme", &server)]));
    let orch = orchestrator(store, None);

    orch.run_ingestion(RunFilter::default()).await.unwrap();
    assert!(orch.source_summary("acme").await.unwrap().unwrap().is_healthy);

    for _ in 0..4 {
        pause().await;
        orch.run_ingestion(forced()).await.unwrap();
    }
    let summary = orch.source_summary("acme").await.unwrap().unwrap();
    assert_eq!(summary.source.consecutive_failures, 4);
    assert!(summary.is_healthy);

    pause().await;
    orch.run_ingestion(forced()).await.unwrap();
    let summary = orch.source_summary("acme").await.unwrap().unwrap();
    assert_eq!(summary.source.consecutive_failures, 5);
    assert!(!summary.is_healthy);
}
