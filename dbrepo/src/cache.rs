//! Result cache for `Query` operations.
//!
//! Keyed by a caller-supplied string, not by request: callers decide which queries are worth
//! caching and how to name them. The repository only reads or fills the cache when a key is
//! given.

use async_trait::async_trait;
use moka::Expiry;
use moka::future::Cache;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::types::Row;

/// Default lifetime of a cached result set (three hours).
pub const DEFAULT_EXPIRATION: Duration = Duration::from_secs(180 * 60);

/// Storage backend for cached query results.
#[async_trait]
pub trait ResultCache: Send + Sync {
    async fn get(&self, key: &str) -> Option<Arc<Vec<Row>>>;

    /// Store rows under `key`; `None` keeps them until evicted by capacity.
    async fn set(&self, key: &str, rows: Arc<Vec<Row>>, expiration: Option<Duration>);

    async fn remove(&self, key: &str);
}

#[derive(Clone)]
struct Entry {
    rows: Arc<Vec<Row>>,
    expiration: Option<Duration>,
}

/// Per-entry expiration, taken from the value itself.
struct EntryExpiry;

impl Expiry<String, Entry> for EntryExpiry {
    fn expire_after_create(&self, _key: &String, value: &Entry, _created_at: Instant) -> Option<Duration> {
        value.expiration
    }

    fn expire_after_update(&self, _key: &String, value: &Entry, _updated_at: Instant, _remaining: Option<Duration>) -> Option<Duration> {
        value.expiration
    }
}

/// In-process result cache backed by moka.
#[derive(Clone)]
pub struct MemoryCache {
    entries: Cache<String, Entry>,
}

impl MemoryCache {
    pub fn new(max_capacity: u64) -> Self {
        Self {
            entries: Cache::builder().max_capacity(max_capacity).expire_after(EntryExpiry).build(),
        }
    }

    pub fn entry_count(&self) -> u64 {
        self.entries.entry_count()
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl std::fmt::Debug for MemoryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCache").field("entries", &self.entries.entry_count()).finish()
    }
}

#[async_trait]
impl ResultCache for MemoryCache {
    async fn get(&self, key: &str) -> Option<Arc<Vec<Row>>> {
        self.entries.get(key).await.map(|entry| entry.rows)
    }

    async fn set(&self, key: &str, rows: Arc<Vec<Row>>, expiration: Option<Duration>) {
        self.entries.insert(key.to_string(), Entry { rows, expiration }).await;
    }

    async fn remove(&self, key: &str) {
        self.entries.invalidate(key).await;
    }
}
