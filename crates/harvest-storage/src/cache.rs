//! Short-TTL read-through cache for hot read paths.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheKind {
    Record,
    Source,
    SearchResults,
    Statistics,
}

impl CacheKind {
    pub fn ttl(self) -> Duration {
        match self {
            Self::Record => Duration::from_secs(60 * 60),
            Self::Source => Duration::from_secs(2 * 60 * 60),
            Self::SearchResults => Duration::from_secs(15 * 60),
            Self::Statistics => Duration::from_secs(30 * 60),
        }
    }

    fn prefix(self) -> &'static str {
        match self {
            Self::Record => "record:",
            Self::Source => "source:",
            Self::SearchResults => "search:",
            Self::Statistics => "stats:",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    kind: CacheKind,
    id: String,
}

impl CacheKey {
    pub fn record(id: Uuid) -> Self {
        Self {
            kind: CacheKind::Record,
            id: id.to_string(),
        }
    }

    pub fn source(source_id: &str) -> Self {
        Self {
            kind: CacheKind::Source,
            id: source_id.to_string(),
        }
    }

    pub fn search(query: &str) -> Self {
        Self {
            kind: CacheKind::SearchResults,
            id: query.trim().to_ascii_lowercase(),
        }
    }

    pub fn statistics(scope: &str) -> Self {
        Self {
            kind: CacheKind::Statistics,
            id: scope.to_string(),
        }
    }

    pub fn kind(&self) -> CacheKind {
        self.kind
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.kind.prefix(), self.id)
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),
    #[error("cache value encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}

pub trait CacheBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<JsonValue>, CacheError>;
    fn set(&self, key: &str, value: JsonValue, ttl: Duration) -> Result<(), CacheError>;
    fn delete(&self, key: &str) -> Result<(), CacheError>;
    /// Removes every key starting with `prefix`, returning how many were dropped.
    fn delete_prefix(&self, prefix: &str) -> Result<usize, CacheError>;
    fn clear(&self) -> Result<(), CacheError>;
}

#[derive(Debug, Clone)]
struct CachedEntry {
    value: JsonValue,
    expires_at: Instant,
}

#[derive(Debug, Default)]
pub struct InMemoryCache {
    entries: DashMap<String, CachedEntry>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl CacheBackend for InMemoryCache {
    fn get(&self, key: &str) -> Result<Option<JsonValue>, CacheError> {
        let now = Instant::now();
        self.entries.remove_if(key, |_, entry| entry.expires_at <= now);
        Ok(self.entries.get(key).map(|entry| entry.value.clone()))
    }

    fn set(&self, key: &str, value: JsonValue, ttl: Duration) -> Result<(), CacheError> {
        self.entries.insert(
            key.to_string(),
            CachedEntry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.entries.remove(key);
        Ok(())
    }

    fn delete_prefix(&self, prefix: &str) -> Result<usize, CacheError> {
        let before = self.entries.len();
        self.entries.retain(|key, _| !key.starts_with(prefix));
        Ok(before.saturating_sub(self.entries.len()))
    }

    fn clear(&self) -> Result<(), CacheError> {
        self.entries.clear();
        Ok(())
    }
}

/// Typed facade over a [`CacheBackend`].
///
/// Backend failures are logged and turned into misses or no-ops: a cache
/// outage degrades to direct reads and never fails the caller.
#[derive(Clone)]
pub struct Cache {
    backend: Arc<dyn CacheBackend>,
    /// Bumped by every invalidation; a read-through fill that raced one is dropped.
    generation: Arc<AtomicU64>,
}

impl fmt::Debug for Cache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache").finish_non_exhaustive()
    }
}

impl Default for Cache {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl Cache {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self {
            backend,
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryCache::new()))
    }

    pub fn get<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        let rendered = key.to_string();
        match self.backend.get(&rendered) {
            Ok(Some(value)) => match serde_json::from_value(value) {
                Ok(decoded) => Some(decoded),
                Err(err) => {
                    warn!(key = %rendered, error = %err, "dropping undecodable cache entry");
                    self.invalidate(key);
                    None
                }
            },
            Ok(None) => None,
            Err(err) => {
                warn!(key = %rendered, error = %err, "cache read failed; reading through");
                None
            }
        }
    }

    pub fn set<T: Serialize>(&self, key: &CacheKey, value: &T) {
        self.set_with_ttl(key, value, key.kind().ttl());
    }

    pub fn set_with_ttl<T: Serialize>(&self, key: &CacheKey, value: &T, ttl: Duration) {
        let rendered = key.to_string();
        let result = serde_json::to_value(value)
            .map_err(CacheError::from)
            .and_then(|json| self.backend.set(&rendered, json, ttl));
        if let Err(err) = result {
            warn!(key = %rendered, error = %err, "cache write failed");
        }
    }

    pub fn invalidate(&self, key: &CacheKey) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        let rendered = key.to_string();
        if let Err(err) = self.backend.delete(&rendered) {
            warn!(key = %rendered, error = %err, "cache invalidation failed");
        }
    }

    pub fn invalidate_kind(&self, kind: CacheKind) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        if let Err(err) = self.backend.delete_prefix(kind.prefix()) {
            warn!(?kind, error = %err, "cache invalidation failed");
        }
    }

    pub fn clear(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        if let Err(err) = self.backend.clear() {
            warn!(error = %err, "cache clear failed");
        }
    }

    /// Returns the cached value for `key`, or runs `load`, caches and returns its result.
    ///
    /// The loaded value is not cached when an invalidation ran while `load` was in flight.
    pub async fn get_or_load<T, E, F, Fut>(&self, key: &CacheKey, load: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(hit) = self.get(key) {
            return Ok(hit);
        }
        let started = self.generation.load(Ordering::Acquire);
        let value = load().await?;
        if self.generation.load(Ordering::Acquire) == started {
            self.set(key, &value);
        }
        Ok(value)
    }
}
