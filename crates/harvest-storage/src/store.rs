//! Persistence contract the sync core relies on, plus an in-memory implementation.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use harvest_core::{Category, Opportunity, Source};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record ({source_id}, {external_id}) already exists as {existing}")]
    Conflict {
        source_id: String,
        external_id: String,
        existing: Uuid,
    },
    #[error("{0} not found")]
    NotFound(String),
    #[error("store backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait OpportunityStore: Send + Sync {
    async fn find_by_external_key(
        &self,
        source_id: &str,
        external_id: &str,
    ) -> Result<Option<Opportunity>, StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<Opportunity>, StoreError>;

    /// Inserts or replaces a record in one atomic step. A record whose
    /// `(source_id, external_id)` already belongs to a different id fails with
    /// [`StoreError::Conflict`].
    async fn upsert(&self, opportunity: Opportunity) -> Result<Opportunity, StoreError>;

    async fn mark_listing_inactive(&self, listing_id: Uuid) -> Result<(), StoreError>;

    /// Active, non-duplicate records in `category` first seen at or after `first_seen_since`.
    async fn dedup_candidates(
        &self,
        category: Category,
        first_seen_since: DateTime<Utc>,
    ) -> Result<Vec<Opportunity>, StoreError>;

    async fn list_for_source(&self, source_id: &str) -> Result<Vec<Opportunity>, StoreError>;

    async fn all(&self) -> Result<Vec<Opportunity>, StoreError>;
}

#[async_trait]
pub trait SourceStore: Send + Sync {
    async fn list_sources(&self) -> Result<Vec<Source>, StoreError>;

    async fn get_source(&self, source_id: &str) -> Result<Option<Source>, StoreError>;

    async fn upsert_source(&self, source: Source) -> Result<Source, StoreError>;
}

/// Both halves of the persistence boundary.
pub trait RecordStore: OpportunityStore + SourceStore {}

impl<T: OpportunityStore + SourceStore> RecordStore for T {}

#[derive(Debug, Default)]
struct InMemoryState {
    opportunities: HashMap<Uuid, Opportunity>,
    by_external_key: HashMap<(String, String), Uuid>,
    sources: BTreeMap<String, Source>,
}

/// Non-durable store used by the CLI and tests.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: RwLock<InMemoryState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sources(sources: impl IntoIterator<Item = Source>) -> Self {
        let state = InMemoryState {
            sources: sources
                .into_iter()
                .map(|s| (s.source_id.clone(), s))
                .collect(),
            ..Default::default()
        };
        Self {
            state: RwLock::new(state),
        }
    }
}

#[async_trait]
impl OpportunityStore for InMemoryStore {
    async fn find_by_external_key(
        &self,
        source_id: &str,
        external_id: &str,
    ) -> Result<Option<Opportunity>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .by_external_key
            .get(&(source_id.to_string(), external_id.to_string()))
            .and_then(|id| state.opportunities.get(id))
            .cloned())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Opportunity>, StoreError> {
        Ok(self.state.read().await.opportunities.get(&id).cloned())
    }

    async fn upsert(&self, opportunity: Opportunity) -> Result<Opportunity, StoreError> {
        let mut state = self.state.write().await;
        let key = (opportunity.source_id.clone(), opportunity.external_id.clone());
        if let Some(existing) = state.by_external_key.get(&key) {
            if *existing != opportunity.id {
                return Err(StoreError::Conflict {
                    source_id: key.0,
                    external_id: key.1,
                    existing: *existing,
                });
            }
        }

        let previous_key = state
            .opportunities
            .get(&opportunity.id)
            .map(|prev| (prev.source_id.clone(), prev.external_id.clone()));
        if let Some(previous_key) = previous_key.filter(|k| *k != key) {
            state.by_external_key.remove(&previous_key);
        }
        state.by_external_key.insert(key, opportunity.id);
        state.opportunities.insert(opportunity.id, opportunity.clone());
        Ok(opportunity)
    }

    async fn mark_listing_inactive(&self, listing_id: Uuid) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let record = state
            .opportunities
            .values_mut()
            .find(|o| o.listing_id == listing_id)
            .ok_or_else(|| StoreError::NotFound(format!("listing {listing_id}")))?;
        record.is_active = false;
        Ok(())
    }

    async fn dedup_candidates(
        &self,
        category: Category,
        first_seen_since: DateTime<Utc>,
    ) -> Result<Vec<Opportunity>, StoreError> {
        let state = self.state.read().await;
        let mut out = state
            .opportunities
            .values()
            .filter(|o| {
                o.is_active
                    && !o.is_duplicate()
                    && o.fields.category == category
                    && o.first_seen_at >= first_seen_since
            })
            .cloned()
            .collect::<Vec<_>>();
        out.sort_by_key(|o| (o.first_seen_at, o.id));
        Ok(out)
    }

    async fn list_for_source(&self, source_id: &str) -> Result<Vec<Opportunity>, StoreError> {
        let state = self.state.read().await;
        let mut out = state
            .opportunities
            .values()
            .filter(|o| o.source_id == source_id)
            .cloned()
            .collect::<Vec<_>>();
        out.sort_by(|a, b| a.external_id.cmp(&b.external_id));
        Ok(out)
    }

    async fn all(&self) -> Result<Vec<Opportunity>, StoreError> {
        let state = self.state.read().await;
        let mut out = state.opportunities.values().cloned().collect::<Vec<_>>();
        out.sort_by_key(|o| (o.first_seen_at, o.id));
        Ok(out)
    }
}

#[async_trait]
impl SourceStore for InMemoryStore {
    async fn list_sources(&self) -> Result<Vec<Source>, StoreError> {
        Ok(self.state.read().await.sources.values().cloned().collect())
    }

    async fn get_source(&self, source_id: &str) -> Result<Option<Source>, StoreError> {
        Ok(self.state.read().await.sources.get(source_id).cloned())
    }

    async fn upsert_source(&self, source: Source) -> Result<Source, StoreError> {
        self.state
            .write()
            .await
            .sources
            .insert(source.source_id.clone(), source.clone());
        Ok(source)
    }
}
