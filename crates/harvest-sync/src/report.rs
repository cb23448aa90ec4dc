//! Run filter, run report and the on-disk report writer.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use harvest_core::FetchKind;
use serde::{Deserialize, Serialize};
use tokio::fs;
use uuid::Uuid;

/// Which sources a run considers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFilter {
    /// Restricts the run to one source. A named source is processed even when not due.
    pub source_id: Option<String>,
    pub kind: Option<FetchKind>,
    /// Ignore cadence and backoff for every selected source.
    pub force_all: bool,
    /// Due once the last success is older than this many hours.
    pub max_age_hours: Option<u32>,
    /// Cap on records processed per source in this run.
    pub batch_size: Option<usize>,
    /// Report the planned sources without fetching or mutating anything.
    pub dry_run: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceErrorKind {
    Fetch,
    Configuration,
    Malformed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceError {
    pub source_id: String,
    pub kind: SourceErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceRunStatus {
    #[default]
    Processed,
    RateLimited,
    Failed,
}

/// Per-source counters for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRunStats {
    pub source_id: String,
    pub status: SourceRunStatus,
    pub pages_fetched: usize,
    pub fetched: usize,
    pub added: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub removed: usize,
    pub duplicates: usize,
    pub potential_duplicates: usize,
    pub malformed: usize,
    pub errors: usize,
    /// Fewer records were processed than the source listed.
    pub truncated: bool,
}

impl SourceRunStats {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub sources_processed: usize,
    pub sources_skipped: usize,
    pub added: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub removed: usize,
    pub outdated: usize,
    pub duplicates: usize,
    pub potential_duplicates: usize,
    pub malformed: usize,
    pub errors: usize,
    pub source_errors: Vec<SourceError>,
    /// Sources selected for this run, in processing order.
    pub planned_sources: Vec<String>,
    pub per_source: Vec<SourceRunStats>,
}

impl RunReport {
    pub fn new(run_id: Uuid, started_at: DateTime<Utc>, dry_run: bool) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: started_at,
            dry_run,
            sources_processed: 0,
            sources_skipped: 0,
            added: 0,
            updated: 0,
            unchanged: 0,
            removed: 0,
            outdated: 0,
            duplicates: 0,
            potential_duplicates: 0,
            malformed: 0,
            errors: 0,
            source_errors: Vec::new(),
            planned_sources: Vec::new(),
            per_source: Vec::new(),
        }
    }

    pub fn absorb(&mut self, stats: SourceRunStats) {
        match stats.status {
            SourceRunStatus::Processed => self.sources_processed += 1,
            SourceRunStatus::RateLimited | SourceRunStatus::Failed => self.sources_skipped += 1,
        }
        self.added += stats.added;
        self.updated += stats.updated;
        self.unchanged += stats.unchanged;
        self.removed += stats.removed;
        self.duplicates += stats.duplicates;
        self.potential_duplicates += stats.potential_duplicates;
        self.malformed += stats.malformed;
        self.errors += stats.errors;
        self.per_source.push(stats);
    }

    pub fn summary_markdown(&self) -> String {
        let mut lines = vec![
            "# Ingestion Run".to_string(),
            String::new(),
            format!("- Run ID: `{}`", self.run_id),
            format!("- Started: {}", self.started_at),
            format!("- Finished: {}", self.finished_at),
            format!(
                "- Sources: {} processed, {} skipped",
                self.sources_processed, self.sources_skipped
            ),
            format!(
                "- Records: {} added, {} updated, {} unchanged, {} removed, {} outdated",
                self.added, self.updated, self.unchanged, self.removed, self.outdated
            ),
            format!(
                "- Duplicates: {} linked, {} flagged for review",
                self.duplicates, self.potential_duplicates
            ),
            format!("- Malformed items: {}, record errors: {}", self.malformed, self.errors),
            String::new(),
            "## Sources".to_string(),
        ];
        for stats in &self.per_source {
            lines.push(format!(
                "- {} ({:?}): +{} ~{} ={} -{}{}",
                stats.source_id,
                stats.status,
                stats.added,
                stats.updated,
                stats.unchanged,
                stats.removed,
                if stats.truncated { " (truncated)" } else { "" }
            ));
        }
        if !self.source_errors.is_empty() {
            lines.push(String::new());
            lines.push("## Errors".to_string());
            for err in &self.source_errors {
                lines.push(format!("- {} [{:?}]: {}", err.source_id, err.kind, err.message));
            }
        }
        lines.push(String::new());
        lines.join("\n")
    }
}

/// Writes `<reports_root>/<run_id>/run_report.json` and `summary.md`.
pub async fn write_run_report(reports_root: &Path, report: &RunReport) -> Result<PathBuf> {
    let dir = reports_root.join(report.run_id.to_string());
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let json = serde_json::to_vec_pretty(report).context("serializing run report")?;
    fs::write(dir.join("run_report.json"), json)
        .await
        .context("writing run_report.json")?;
    fs::write(dir.join("summary.md"), report.summary_markdown())
        .await
        .context("writing summary.md")?;
    Ok(dir)
}
