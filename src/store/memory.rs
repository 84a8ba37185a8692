//! In-memory LRU storage backend.
//!
//! Provides a bounded, non-persistent store. When capacity is reached the
//! least-recently-used entry is evicted silently.

use std::num::NonZeroUsize;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::RwLock;
use tracing::debug;

use super::backend::StoreBackend;
use super::list::PopFrom;
use super::mutation::{Mutation, Outcome};
use super::sweep::Sweeper;
use super::types::Entry;
use super::wildcard_prefix;
use crate::error::Result;
use crate::value::{Body, Value};

/// Default entry capacity.
pub const DEFAULT_CAPACITY: usize = 10_240;

struct LruState {
    cache: RwLock<LruCache<String, Entry>>,
}

impl LruState {
    fn cleanup_expired(&self) -> usize {
        let mut cache = self.cache.write();
        let expired: Vec<String> = cache
            .iter()
            .filter(|(_, e)| e.is_expired())
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            cache.pop(key);
        }
        expired.len()
    }

    fn apply(&self, key: &str, mutation: Mutation) -> Result<Outcome> {
        let mut cache = self.cache.write();
        if cache.peek(key).is_some_and(Entry::is_expired) {
            cache.pop(key);
        }
        let current = cache.get(key);
        let expires_at = current.and_then(|e| e.expires_at);
        let applied = mutation.apply(key, current.map(|e| &e.body))?;
        if let Some(body) = applied.body {
            cache.put(key.to_string(), Entry { body, expires_at });
        }
        Ok(applied.outcome)
    }
}

/// In-memory LRU backend.
///
/// Reads that touch recency (`get`) take the write lock; `has`, `len`, and
/// `keys` take the shared lock and never reorder entries. Bodies are
/// returned as copies.
///
/// # Example
///
/// ```ignore
/// use unistore::store::MemoryBackend;
///
/// let backend = MemoryBackend::new(1024);
/// backend.set("key", Body::from("value"), None).await?;
/// ```
pub struct MemoryBackend {
    state: Arc<LruState>,
    sweeper: Option<Sweeper>,
}

impl MemoryBackend {
    /// Creates a backend holding at most `capacity` entries (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            state: Arc::new(LruState {
                cache: RwLock::new(LruCache::new(capacity)),
            }),
            sweeper: None,
        }
    }

    /// Creates a backend that also sweeps expired entries every `every`.
    pub fn with_sweep(capacity: usize, every: Duration) -> Self {
        let mut backend = Self::new(capacity);
        let weak: Weak<LruState> = Arc::downgrade(&backend.state);
        backend.sweeper = Sweeper::spawn("lru", every, move || {
            let weak = weak.clone();
            async move {
                let Some(state) = weak.upgrade() else {
                    return false;
                };
                let removed = state.cleanup_expired();
                if removed > 0 {
                    debug!(removed, "Swept expired LRU entries");
                }
                true
            }
        });
        backend
    }

    pub fn capacity(&self) -> usize {
        self.state.cache.read().cap().get()
    }

    /// Removes all expired entries. Returns how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        self.state.cleanup_expired()
    }
}

#[async_trait]
impl StoreBackend for MemoryBackend {
    fn kind(&self) -> &'static str {
        "lru"
    }

    async fn get(&self, key: &str) -> Result<Option<Body>> {
        let mut cache = self.state.cache.write();
        if cache.peek(key).is_some_and(Entry::is_expired) {
            cache.pop(key);
            return Ok(None);
        }
        Ok(cache.get(key).map(|e| e.body.clone()))
    }

    async fn set(&self, key: &str, value: Body, ttl: Option<Duration>) -> Result<()> {
        self.state
            .cache
            .write()
            .put(key.to_string(), Entry::new(value, ttl));
        Ok(())
    }

    async fn has(&self, key: &str) -> Result<bool> {
        let cache = self.state.cache.read();
        Ok(cache.peek(key).is_some_and(|e| !e.is_expired()))
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut cache = self.state.cache.write();
        match wildcard_prefix(key) {
            Some(prefix) => {
                let matched: Vec<String> = cache
                    .iter()
                    .filter(|(k, _)| k.starts_with(prefix))
                    .map(|(k, _)| k.clone())
                    .collect();
                for k in &matched {
                    cache.pop(k);
                }
            },
            None => {
                cache.pop(key);
            },
        }
        Ok(())
    }

    async fn get_del(&self, key: &str) -> Result<Option<Body>> {
        let removed = self.state.cache.write().pop(key);
        Ok(removed.filter(|e| !e.is_expired()).map(|e| e.body))
    }

    async fn len(&self) -> Result<usize> {
        let cache = self.state.cache.read();
        Ok(cache.iter().filter(|(_, e)| !e.is_expired()).count())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let cache = self.state.cache.read();
        Ok(cache
            .iter()
            .filter(|(_, e)| !e.is_expired())
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn clear(&self) -> Result<()> {
        self.state.cache.write().clear();
        Ok(())
    }

    async fn incr(&self, key: &str, delta: i64) -> Result<i64> {
        self.state.apply(key, Mutation::Incr(delta))?.into_int()
    }

    async fn push(&self, key: &str, values: Vec<Value>) -> Result<usize> {
        self.state.apply(key, Mutation::Push(values))?.into_count()
    }

    async fn pop(&self, key: &str, from: PopFrom) -> Result<Value> {
        self.state.apply(key, Mutation::Pop(from))?.into_value()
    }

    async fn pull(&self, key: &str, value: &Value) -> Result<usize> {
        self.state
            .apply(key, Mutation::Pull(value.clone()))?
            .into_count()
    }

    async fn pull_all(&self, key: &str, values: &[Value]) -> Result<usize> {
        self.state
            .apply(key, Mutation::PullAll(values.to_vec()))?
            .into_count()
    }

    async fn add_to_set(&self, key: &str, values: Vec<Value>) -> Result<usize> {
        self.state.apply(key, Mutation::AddToSet(values))?.into_count()
    }

    async fn array_set(&self, key: &str, index: usize, value: Value) -> Result<()> {
        self.state.apply(key, Mutation::ArraySet(index, value))?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if let Some(sweeper) = &self.sweeper {
            sweeper.stop().await;
        }
        Ok(())
    }
}
