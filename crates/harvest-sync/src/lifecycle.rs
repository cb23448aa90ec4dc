//! Source and record sync state transitions.

use chrono::{DateTime, Duration, Utc};
use harvest_core::{Opportunity, Source, SourceStatus, SyncCadence, SyncStatus, FAILED_SOURCE_THRESHOLD};

const MAX_BACKOFF_HOURS: i64 = 24;

/// `min(24h, 2^failures h)`.
pub fn backoff_delay(failures: u32) -> Duration {
    let hours = if failures >= 5 {
        MAX_BACKOFF_HOURS
    } else {
        (1i64 << failures).min(MAX_BACKOFF_HOURS)
    };
    Duration::hours(hours)
}

fn status_for_failures(failures: u32) -> SourceStatus {
    match failures {
        0 => SourceStatus::Healthy,
        n if n < FAILED_SOURCE_THRESHOLD => SourceStatus::Degraded,
        _ => SourceStatus::Failed,
    }
}

pub fn record_source_success(source: &mut Source, now: DateTime<Utc>) {
    source.consecutive_failures = 0;
    source.status = if source.is_active {
        SourceStatus::Healthy
    } else {
        SourceStatus::Inactive
    };
    source.last_attempt_at = Some(now);
    source.last_success_at = Some(now);
    source.last_error = None;
    source.next_attempt_after = source.cadence.interval().map(|interval| now + interval);
}

pub fn record_source_failure(source: &mut Source, now: DateTime<Utc>, error: impl Into<String>) {
    source.consecutive_failures = source.consecutive_failures.saturating_add(1);
    source.status = if source.is_active {
        status_for_failures(source.consecutive_failures)
    } else {
        SourceStatus::Inactive
    };
    source.last_attempt_at = Some(now);
    source.last_error = Some(error.into());
    source.next_attempt_after = Some(now + backoff_delay(source.consecutive_failures));
}

pub fn deactivate_source(source: &mut Source) {
    source.is_active = false;
    source.status = SourceStatus::Inactive;
}

/// Folds `scores` from this run into the source's running quality average.
pub fn fold_quality(source: &mut Source, scores: &[f64]) {
    if scores.is_empty() {
        return;
    }
    let prior = source.total_opportunities_synced as f64;
    let sum: f64 = scores.iter().sum();
    let total = prior + scores.len() as f64;
    source.average_quality_score = (source.average_quality_score * prior + sum) / total;
    source.total_opportunities_synced += scores.len() as u64;
}

/// Whether a run should pick up `source`.
///
/// A failing source waits out its backoff first. With `max_age_hours` the
/// source is due once its last success is older than that; otherwise it
/// follows its cadence, and manual sources are never due on their own.
pub fn source_is_due(source: &Source, now: DateTime<Utc>, max_age_hours: Option<u32>) -> bool {
    if !source.is_active {
        return false;
    }
    if source.consecutive_failures > 0 && source.next_attempt_after.is_some_and(|gate| gate > now) {
        return false;
    }
    if let Some(hours) = max_age_hours {
        return source
            .last_success_at
            .map_or(true, |at| now - at >= Duration::hours(i64::from(hours)));
    }
    match source.cadence {
        SyncCadence::Manual => false,
        _ => source.next_attempt_after.map_or(true, |gate| gate <= now),
    }
}

pub fn mark_synced(record: &mut Opportunity, cadence: SyncCadence, now: DateTime<Utc>) {
    record.sync_status = SyncStatus::Synced;
    record.sync_error_count = 0;
    record.last_error = None;
    record.last_synced_at = Some(now);
    record.last_success_at = Some(now);
    record.next_sync_due = cadence.interval().map(|interval| now + interval);
}

pub fn mark_failed(record: &mut Opportunity, now: DateTime<Utc>, error: impl Into<String>) {
    let error = error.into();
    record.sync_status = SyncStatus::Failed;
    record.sync_error_count = record.sync_error_count.saturating_add(1);
    record.last_synced_at = Some(now);
    record.next_sync_due = Some(now + backoff_delay(record.sync_error_count));
    record.log_transform(now, "sync_failed", error.as_str());
    record.last_error = Some(error);
}

/// Terminal: the source no longer lists this record.
pub fn mark_removed(record: &mut Opportunity, now: DateTime<Utc>) {
    record.sync_status = SyncStatus::Removed;
    record.next_sync_due = None;
    record.updated_at = now;
    record.log_transform(now, "removed", "no longer listed upstream");
}

pub fn is_stale(record: &Opportunity, cadence: SyncCadence, now: DateTime<Utc>) -> bool {
    match record.last_success_at {
        Some(at) => now - at > cadence.stale_after(),
        None => true,
    }
}

/// Flips a stale `synced` record to `outdated`; returns true when it changed.
pub fn refresh_staleness(record: &mut Opportunity, cadence: SyncCadence, now: DateTime<Utc>) -> bool {
    if record.sync_status == SyncStatus::Synced && is_stale(record, cadence, now) {
        record.sync_status = SyncStatus::Outdated;
        return true;
    }
    false
}
