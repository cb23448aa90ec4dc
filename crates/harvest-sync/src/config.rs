//! Environment configuration and the YAML source registry.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use harvest_adapters::DEFAULT_INTER_PAGE_DELAY;
use harvest_core::Source;
use serde::Deserialize;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub sources_file: PathBuf,
    pub category_rules: Option<PathBuf>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub max_parallel_sources: usize,
    pub inter_page_delay: Duration,
    pub reports_dir: Option<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sources_file: PathBuf::from("sources.yaml"),
            category_rules: None,
            user_agent: "opportunity-harvest/0.1".to_string(),
            http_timeout_secs: 20,
            max_parallel_sources: 4,
            inter_page_delay: DEFAULT_INTER_PAGE_DELAY,
            reports_dir: None,
        }
    }
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            sources_file: env_path("HARVEST_SOURCES_FILE").unwrap_or(defaults.sources_file),
            category_rules: env_path("HARVEST_CATEGORY_RULES"),
            user_agent: std::env::var("HARVEST_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_parse("HARVEST_HTTP_TIMEOUT_SECS").unwrap_or(defaults.http_timeout_secs),
            max_parallel_sources: env_parse::<usize>("HARVEST_MAX_PARALLEL_SOURCES")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_parallel_sources),
            inter_page_delay: env_parse::<u64>("HARVEST_INTER_PAGE_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.inter_page_delay),
            reports_dir: env_path("HARVEST_REPORTS_DIR"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<Source>,
}

impl SourceRegistry {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(yaml).context("parsing source registry")?;
        let mut seen = HashSet::new();
        for source in &registry.sources {
            if source.source_id.trim().is_empty() {
                bail!("source registry entry with an empty source_id");
            }
            if !seen.insert(source.source_id.as_str()) {
                bail!("duplicate source_id `{}` in registry", source.source_id);
            }
        }
        Ok(registry)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }
}
