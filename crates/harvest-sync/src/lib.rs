//! Ingestion pipeline: normalization, scoring, categorization, dedup and sync lifecycle.

use std::sync::Arc;

use anyhow::{Context, Result};
use harvest_storage::InMemoryStore;
use tracing::info;

pub mod categorize;
pub mod config;
pub mod dedup;
pub mod lifecycle;
pub mod normalize;
pub mod orchestrator;
pub mod quality;
pub mod report;

pub use categorize::{Categorizer, CategorySuggestion};
pub use config::{SourceRegistry, SyncConfig};
pub use dedup::{DedupConfig, DedupEngine, DedupMatch, DedupOutcome, MatchClass};
pub use orchestrator::{IngestionOrchestrator, SourceSummary, Statistics, SyncError};
pub use report::{RunFilter, RunReport, SourceError, SourceErrorKind, SourceRunStats, SourceRunStatus};

pub const CRATE_NAME: &str = "harvest-sync";

/// Builds an orchestrator over an in-memory store seeded from the registry
/// file and category rules named by `config`.
pub fn orchestrator_from_config(config: SyncConfig) -> Result<IngestionOrchestrator> {
    let registry = SourceRegistry::load(&config.sources_file)?;
    let categorizer = match &config.category_rules {
        Some(path) => Categorizer::from_path(path)?,
        None => Categorizer::default(),
    };
    info!(
        sources = registry.sources.len(),
        registry = %config.sources_file.display(),
        "source registry loaded"
    );
    let store = Arc::new(InMemoryStore::with_sources(registry.sources));
    let orchestrator = IngestionOrchestrator::new(store, config).context("building orchestrator")?;
    Ok(orchestrator.with_categorizer(categorizer))
}

pub fn orchestrator_from_env() -> Result<IngestionOrchestrator> {
    orchestrator_from_config(SyncConfig::from_env())
}
