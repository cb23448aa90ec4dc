//! Completeness/accuracy scoring on a 10-point scale, normalized to [0, 1].

use harvest_core::{CanonicalField, CanonicalFields, QualityAssessment};

const REQUIRED_WEIGHT: f64 = 4.0;
const OPTIONAL_WEIGHT: f64 = 2.0;
const ACCURACY_BASELINE: f64 = 4.0;
const MIN_DESCRIPTION_CHARS: usize = 50;
const MAX_ERROR_PENALTY: f64 = 2.0;

/// Breakdown of one score, kept for logs and run reports.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityBreakdown {
    pub required: f64,
    pub optional: f64,
    pub accuracy: f64,
}

impl QualityBreakdown {
    pub fn total(&self) -> f64 {
        self.required + self.optional + self.accuracy
    }
}

fn has_text(fields: &CanonicalFields, field: CanonicalField, value: Option<&str>) -> bool {
    !fields.is_placeholder(field) && value.is_some_and(|v| !v.trim().is_empty())
}

pub fn breakdown(fields: &CanonicalFields, sync_error_count: u32) -> QualityBreakdown {
    let required_present = [
        has_text(fields, CanonicalField::Title, Some(&fields.title)),
        has_text(fields, CanonicalField::Description, Some(&fields.description)),
        // every record carries a category, `other` included
        true,
        has_text(fields, CanonicalField::Location, fields.location.as_deref()),
    ]
    .into_iter()
    .filter(|present| *present)
    .count();

    let optional_present = [
        fields.has_salary(),
        !fields.skills.is_empty(),
        fields.start_date.is_some(),
        fields.deadline.is_some(),
    ]
    .into_iter()
    .filter(|present| *present)
    .count();

    let mut accuracy = ACCURACY_BASELINE;
    if fields.is_placeholder(CanonicalField::Description)
        || fields.description.chars().count() < MIN_DESCRIPTION_CHARS
    {
        accuracy -= 1.0;
    }
    let missing_id = fields.external_id.trim().is_empty() || fields.is_placeholder(CanonicalField::ExternalId);
    let missing_url = !has_text(fields, CanonicalField::ExternalUrl, fields.external_url.as_deref());
    if missing_id || missing_url {
        accuracy -= 1.0;
    }
    accuracy -= MAX_ERROR_PENALTY.min(0.5 * f64::from(sync_error_count));

    QualityBreakdown {
        required: REQUIRED_WEIGHT * required_present as f64 / 4.0,
        optional: OPTIONAL_WEIGHT * optional_present as f64 / 4.0,
        accuracy,
    }
}

/// Score and tier for `fields`, rounded to three decimals.
pub fn assess(fields: &CanonicalFields, sync_error_count: u32) -> QualityAssessment {
    let raw = (breakdown(fields, sync_error_count).total() / 10.0).clamp(0.0, 1.0);
    QualityAssessment::from_score((raw * 1000.0).round() / 1000.0)
}
