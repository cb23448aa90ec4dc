//! Keyword-frequency categorizer with YAML-overridable tables.

use std::path::Path;

use anyhow::{Context, Result};
use harvest_core::{CanonicalFields, Category};
use serde::Deserialize;

/// Confidence a suggestion needs to displace a non-default category.
pub const OVERRIDE_CONFIDENCE: f64 = 0.8;

#[derive(Debug, Clone, Deserialize)]
struct CategoryRulesFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    rules: Vec<CategoryRule>,
}

#[derive(Debug, Clone, Deserialize)]
struct CategoryRule {
    category: Category,
    keywords: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CategorySuggestion {
    pub category: Category,
    pub score: f64,
    pub confidence: f64,
    pub matched_keywords: Vec<String>,
}

/// Category -> keyword tables. Keywords are stored as lowercase word sequences.
#[derive(Debug, Clone)]
pub struct Categorizer {
    tables: Vec<(Category, Vec<Vec<String>>)>,
}

fn builtin_keywords(category: Category) -> &'static [&'static str] {
    match category {
        Category::Technology => &[
            "software", "developer", "programming", "backend", "frontend", "full stack",
            "data science", "machine learning", "cloud", "devops", "python", "javascript", "rust",
        ],
        Category::Business => &[
            "business", "operations", "consulting", "sales", "strategy", "project management",
            "business development", "analyst",
        ],
        Category::Design => &["design", "designer", "ux", "ui", "graphic", "figma", "illustration"],
        Category::Marketing => &[
            "marketing", "social media", "seo", "content", "brand", "campaign", "advertising",
        ],
        Category::Finance => &[
            "finance", "financial", "accounting", "investment", "banking", "audit", "tax",
        ],
        Category::Healthcare => &[
            "health", "healthcare", "medical", "clinical", "nursing", "patient", "hospital",
        ],
        Category::Education => &[
            "education", "teaching", "teacher", "tutor", "curriculum", "students", "classroom",
        ],
        Category::Engineering => &[
            "engineering", "mechanical", "electrical", "civil", "manufacturing", "cad", "hardware",
        ],
        Category::Research => &[
            "research", "laboratory", "lab", "study", "experiment", "scientific", "publication",
        ],
        Category::Other => &[],
    }
}

pub(crate) fn words(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}

/// Whole-word occurrences of `keyword` (a word sequence) in `haystack`.
pub(crate) fn occurrences(keyword: &[String], haystack: &[String]) -> usize {
    if keyword.is_empty() || keyword.len() > haystack.len() {
        return 0;
    }
    haystack.windows(keyword.len()).filter(|w| *w == keyword).count()
}

impl Default for Categorizer {
    fn default() -> Self {
        Self::from_tables(Category::ALL.iter().map(|category| {
            (
                *category,
                builtin_keywords(*category).iter().map(|k| k.to_string()).collect(),
            )
        }))
    }
}

impl Categorizer {
    pub fn from_tables(tables: impl IntoIterator<Item = (Category, Vec<String>)>) -> Self {
        let tables = tables
            .into_iter()
            .filter(|(category, _)| !category.is_default())
            .map(|(category, keywords)| {
                let keywords = keywords
                    .iter()
                    .map(|k| words(k))
                    .filter(|k| !k.is_empty())
                    .collect();
                (category, keywords)
            })
            .collect();
        Self { tables }
    }

    /// Built-in tables with the categories listed in `yaml` replaced.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let file: CategoryRulesFile = serde_yaml::from_str(yaml).context("parsing category rules")?;
        let mut base = Self::default();
        for rule in file.rules {
            let keywords = rule
                .keywords
                .iter()
                .map(|k| words(k))
                .filter(|k| !k.is_empty())
                .collect::<Vec<_>>();
            match base.tables.iter_mut().find(|(c, _)| *c == rule.category) {
                Some((_, existing)) => *existing = keywords,
                None if !rule.category.is_default() => base.tables.push((rule.category, keywords)),
                None => {}
            }
        }
        Ok(base)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    /// Best-scoring category for `text`, or `None` when no keyword matches.
    /// Ties go to the category listed first.
    pub fn suggest(&self, text: &str) -> Option<CategorySuggestion> {
        let haystack = words(text);
        let mut best: Option<CategorySuggestion> = None;
        for (category, keywords) in &self.tables {
            let mut score = 0usize;
            let mut matched = Vec::new();
            for keyword in keywords {
                let hits = occurrences(keyword, &haystack);
                if hits > 0 {
                    score += hits * keyword.len();
                    matched.push(keyword.join(" "));
                }
            }
            if score == 0 || best.as_ref().is_some_and(|b| b.score >= score as f64) {
                continue;
            }
            let confidence = (matched.len() as f64 / keywords.len().max(1) as f64).min(1.0);
            best = Some(CategorySuggestion {
                category: *category,
                score: score as f64,
                confidence,
                matched_keywords: matched,
            });
        }
        best
    }

    /// Applies a suggestion for the record's title and description, honoring
    /// the override guard. Returns the suggestion when it was applied.
    pub fn categorize(&self, fields: &mut CanonicalFields) -> Option<CategorySuggestion> {
        let text = format!("{} {}", fields.title, fields.description);
        let suggestion = self.suggest(&text)?;
        if suggestion.category != fields.category && should_replace(fields.category, suggestion.confidence) {
            fields.category = suggestion.category;
            return Some(suggestion);
        }
        None
    }
}

/// A suggestion replaces `current` only when `current` is the default or the
/// suggestion is confident.
pub fn should_replace(current: Category, confidence: f64) -> bool {
    current.is_default() || confidence > OVERRIDE_CONFIDENCE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frequency_weighted_by_keyword_length() {
        let categorizer = Categorizer::default();
        let s = categorizer
            .suggest("Backend developer working on machine learning services in Python")
            .unwrap();
        assert_eq!(s.category, Category::Technology);
        // backend 1 + developer 1 + machine learning 2 + python 1
        assert_eq!(s.score, 5.0);
        assert_eq!(s.matched_keywords.len(), 4);
        assert!((s.confidence - 4.0 / 13.0).abs() < 1e-9);
        assert!(categorizer.suggest("A quiet afternoon").is_none());
    }

    #[test]
    fn keywords_match_whole_words_only() {
        let categorizer = Categorizer::default();
        // "tax" must not match inside "syntax"
        assert!(categorizer.suggest("syntax").is_none());
    }

    #[test]
    fn override_guard() {
        assert!(!should_replace(Category::Technology, 0.6));
        assert!(should_replace(Category::Technology, 0.85));
        assert!(should_replace(Category::Other, 0.1));
        assert!(!should_replace(Category::Technology, 0.8));
    }

    #[test]
    fn categorize_respects_existing_category() {
        let categorizer = Categorizer::from_tables([
            (Category::Business, vec!["sales".into(), "strategy".into(), "b2b".into(), "pipeline".into(), "crm".into()]),
        ]);
        let mut fields = CanonicalFields {
            title: "Sales strategy intern".into(),
            description: "B2B sales support".into(),
            category: Category::Technology,
            ..Default::default()
        };
        // 3 of 5 keywords: confidence 0.6
        assert!(categorizer.categorize(&mut fields).is_none());
        assert_eq!(fields.category, Category::Technology);

        fields.description = "B2B sales pipeline and CRM hygiene".into();
        let applied = categorizer.categorize(&mut fields).unwrap();
        assert!(applied.confidence > 0.8);
        assert_eq!(fields.category, Category::Business);

        let mut uncategorized = CanonicalFields {
            title: "Sales associate".into(),
            ..Default::default()
        };
        categorizer.categorize(&mut uncategorized);
        assert_eq!(uncategorized.category, Category::Business);
    }

    #[test]
    fn yaml_rules_replace_builtin_tables() {
        let yaml = r#"
version: 1
rules:
  - category: healthcare
    keywords: ["veterinary", "animal care"]
"#;
        let categorizer = Categorizer::from_yaml_str(yaml).unwrap();
        let s = categorizer.suggest("Animal care assistant at a veterinary clinic").unwrap();
        assert_eq!(s.category, Category::Healthcare);
        assert_eq!(s.confidence, 1.0);
        // built-in healthcare keywords are gone
        assert!(categorizer.suggest("hospital").is_none());
        assert!(Categorizer::from_yaml_str("rules: [").is_err());
    }

    #[test]
    fn rules_load_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("categories.yaml");
        std::fs::write(&path, "version: 1\nrules:\n  - category: design\n    keywords: [typography]\n").unwrap();
        let categorizer = Categorizer::from_path(&path).unwrap();
        assert_eq!(categorizer.suggest("typography").unwrap().category, Category::Design);
        assert!(Categorizer::from_path(&dir.path().join("missing.yaml")).is_err());
    }
}
