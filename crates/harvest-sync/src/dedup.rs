//! Weighted fuzzy matching of records against recent same-category records.

use chrono::{DateTime, Duration, Utc};
use harvest_core::{CanonicalFields, Opportunity};
use serde::Serialize;
use strsim::normalized_levenshtein;
use tracing::{debug, warn};
use uuid::Uuid;

pub const TITLE_WEIGHT: f64 = 0.4;
pub const DESCRIPTION_WEIGHT: f64 = 0.3;
pub const COMPANY_WEIGHT: f64 = 0.2;
pub const LOCATION_WEIGHT: f64 = 0.1;

#[derive(Debug, Clone, Copy)]
pub struct DedupConfig {
    pub duplicate_threshold: f64,
    pub review_threshold: f64,
    pub window: Duration,
    pub max_matches: usize,
    pub description_prefix_chars: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            duplicate_threshold: 0.85,
            review_threshold: 0.5,
            window: Duration::days(30),
            max_matches: 10,
            description_prefix_chars: 500,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchClass {
    Duplicate,
    Potential,
    Distinct,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DedupMatch {
    pub candidate: Uuid,
    pub similarity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DedupOutcome {
    /// The record was already linked; nothing was evaluated.
    AlreadyDuplicate,
    Unique,
    PotentialDuplicate(DedupMatch),
    Duplicate(DedupMatch),
}

pub struct DedupEngine {
    config: DedupConfig,
}

impl Default for DedupEngine {
    fn default() -> Self {
        Self::new(DedupConfig::default())
    }
}

impl DedupEngine {
    pub fn new(config: DedupConfig) -> Self {
        Self { config }
    }

    /// Lowercased, whitespace-collapsed form used by every comparison.
    pub fn normalize_text(input: &str) -> String {
        input
            .to_lowercase()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Earliest `first_seen_at` a candidate may have.
    pub fn window_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.config.window
    }

    fn component(a: &str, b: &str) -> f64 {
        let (a, b) = (Self::normalize_text(a), Self::normalize_text(b));
        match (a.is_empty(), b.is_empty()) {
            (true, true) => 1.0,
            (true, false) | (false, true) => 0.0,
            (false, false) => normalized_levenshtein(&a, &b),
        }
    }

    fn prefix(&self, text: &str) -> String {
        text.chars().take(self.config.description_prefix_chars).collect()
    }

    pub fn similarity(&self, a: &CanonicalFields, b: &CanonicalFields) -> f64 {
        let title = Self::component(&a.title, &b.title);
        let description = Self::component(&self.prefix(&a.description), &self.prefix(&b.description));
        let company = Self::component(
            a.company.as_deref().unwrap_or_default(),
            b.company.as_deref().unwrap_or_default(),
        );
        let location = Self::component(
            a.location.as_deref().unwrap_or_default(),
            b.location.as_deref().unwrap_or_default(),
        );
        TITLE_WEIGHT * title
            + DESCRIPTION_WEIGHT * description
            + COMPANY_WEIGHT * company
            + LOCATION_WEIGHT * location
    }

    pub fn classify(&self, similarity: f64) -> MatchClass {
        if similarity >= self.config.duplicate_threshold {
            MatchClass::Duplicate
        } else if similarity > self.config.review_threshold {
            MatchClass::Potential
        } else {
            MatchClass::Distinct
        }
    }

    fn is_candidate(&self, record: &Opportunity, other: &Opportunity, now: DateTime<Utc>) -> bool {
        other.id != record.id
            && other.is_active
            && !other.is_duplicate()
            && other.fields.category == record.fields.category
            && other.first_seen_at >= self.window_start(now)
    }

    /// Eligible candidates above the review threshold, best first, at most `max_matches`.
    pub fn rank(&self, record: &Opportunity, candidates: &[Opportunity], now: DateTime<Utc>) -> Vec<DedupMatch> {
        let mut matches = candidates
            .iter()
            .filter(|other| self.is_candidate(record, other, now))
            .map(|other| DedupMatch {
                candidate: other.id,
                similarity: self.similarity(&record.fields, &other.fields),
            })
            .filter(|m| m.similarity > self.config.review_threshold)
            .collect::<Vec<_>>();
        matches.sort_by(|a, b| {
            b.similarity
                .total_cmp(&a.similarity)
                .then_with(|| a.candidate.cmp(&b.candidate))
        });
        matches.truncate(self.config.max_matches);
        matches
    }

    /// Evaluates `record` and writes the result onto it: a confident match
    /// links it as a duplicate (deactivating it), an ambiguous one is flagged
    /// for review. Already-linked records are left untouched.
    pub fn apply(&self, record: &mut Opportunity, candidates: &[Opportunity], now: DateTime<Utc>) -> DedupOutcome {
        if record.is_duplicate() {
            return DedupOutcome::AlreadyDuplicate;
        }
        let Some(best) = self.rank(record, candidates, now).into_iter().next() else {
            return DedupOutcome::Unique;
        };

        match self.classify(best.similarity) {
            MatchClass::Duplicate => {
                let Some(target) = candidates.iter().find(|c| c.id == best.candidate) else {
                    return DedupOutcome::Unique;
                };
                match record.link_duplicate(target, now) {
                    Ok(()) => {
                        debug!(record = %record.id, target = %target.id, similarity = best.similarity, "linked duplicate");
                        DedupOutcome::Duplicate(best)
                    }
                    Err(err) => {
                        warn!(record = %record.id, error = %err, "duplicate link rejected; flagging for review");
                        record.add_potential_duplicate(best.candidate, now);
                        DedupOutcome::PotentialDuplicate(best)
                    }
                }
            }
            MatchClass::Potential => {
                record.add_potential_duplicate(best.candidate, now);
                DedupOutcome::PotentialDuplicate(best)
            }
            MatchClass::Distinct => DedupOutcome::Unique,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use harvest_core::Category;
    use serde_json::Value as JsonValue;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 20, 12, 0, 0).single().unwrap()
    }

    fn mk(source: &str, title: &str, company: &str, days_ago: i64) -> Opportunity {
        let fields = CanonicalFields {
            title: title.into(),
            description: "Help the data team build dashboards and clean datasets for reporting.".into(),
            category: Category::Technology,
            company: Some(company.into()),
            location: Some("Remote".into()),
            external_id: format!("{source}-{title}"),
            ..Default::default()
        };
        Opportunity::new(source, fields, JsonValue::Null, "h", now() - Duration::days(days_ago))
    }

    #[test]
    fn weighted_similarity_components() {
        let engine = DedupEngine::default();
        let a = mk("a", "Data Analyst Intern", "Acme", 1);
        assert!((engine.similarity(&a.fields, &a.fields) - 1.0).abs() < 1e-9);

        let mut b = a.fields.clone();
        b.company = Some("Zzzz".into());
        // company contributes nothing, everything else matches
        assert!((engine.similarity(&a.fields, &b) - 0.8).abs() < 1e-9);

        b.location = None;
        assert!((engine.similarity(&a.fields, &b) - 0.7).abs() < 1e-9);
    }

    #[test]
    fn normalization_ignores_case_and_spacing() {
        let engine = DedupEngine::default();
        let a = mk("a", "Data   Analyst Intern", "ACME", 1);
        let b = mk("b", "data analyst intern", "acme", 1);
        assert!((engine.similarity(&a.fields, &b.fields) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn thresholds_split_review_from_auto_link() {
        let engine = DedupEngine::default();
        assert_eq!(engine.classify(0.84), MatchClass::Potential);
        assert_eq!(engine.classify(0.86), MatchClass::Duplicate);
        assert_eq!(engine.classify(0.85), MatchClass::Duplicate);
        assert_eq!(engine.classify(0.5), MatchClass::Distinct);
    }

    #[test]
    fn near_identical_record_is_linked_and_deactivated() {
        let engine = DedupEngine::default();
        let existing = mk("a", "Data Analyst Intern", "Acme", 3);
        let mut incoming = mk("b", "Data Analyst Intern", "Acme Inc", 0);

        let outcome = engine.apply(&mut incoming, std::slice::from_ref(&existing), now());
        assert!(matches!(outcome, DedupOutcome::Duplicate(m) if m.candidate == existing.id));
        assert_eq!(incoming.duplicate_of, Some(existing.id));
        assert!(!incoming.is_active);

        // re-running on a linked record is a no-op
        let again = engine.apply(&mut incoming, std::slice::from_ref(&existing), now());
        assert_eq!(again, DedupOutcome::AlreadyDuplicate);
        assert_eq!(incoming.duplicate_of, Some(existing.id));
    }

    #[test]
    fn ambiguous_match_is_only_flagged() {
        let engine = DedupEngine::default();
        let existing = mk("a", "Data Analyst Intern", "Acme", 3);
        let mut incoming = mk("b", "Data Analyst Apprentice", "Northwind", 0);

        let outcome = engine.apply(&mut incoming, std::slice::from_ref(&existing), now());
        assert!(matches!(outcome, DedupOutcome::PotentialDuplicate(_)));
        assert!(incoming.potential_duplicates.contains(&existing.id));
        assert!(!incoming.is_duplicate());
        assert!(incoming.is_active);
    }

    #[test]
    fn candidates_outside_window_or_category_are_ignored() {
        let engine = DedupEngine::default();
        let old = mk("a", "Data Analyst Intern", "Acme", 31);
        let mut other_category = mk("c", "Data Analyst Intern", "Acme", 1);
        other_category.fields.category = Category::Business;
        let mut linked = mk("d", "Data Analyst Intern", "Acme", 1);
        linked.duplicate_of = Some(Uuid::new_v4());

        let mut incoming = mk("b", "Data Analyst Intern", "Acme", 0);
        let outcome = engine.apply(&mut incoming, &[old, other_category, linked], now());
        assert_eq!(outcome, DedupOutcome::Unique);
    }

    #[test]
    fn ranking_keeps_top_matches_best_first() {
        let engine = DedupEngine::new(DedupConfig {
            max_matches: 2,
            ..Default::default()
        });
        let record = mk("x", "Data Analyst Intern", "Acme", 0);
        let candidates = vec![
            mk("a", "Data Analyst", "Acme", 1),
            mk("b", "Data Analyst Intern", "Acme", 1),
            mk("c", "Data Intern", "Acme", 1),
        ];
        let ranked = engine.rank(&record, &candidates, now());
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].candidate, candidates[1].id);
        assert!(ranked[0].similarity >= ranked[1].similarity);
    }
}
