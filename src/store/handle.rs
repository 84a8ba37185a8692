//! High-level `Store` handle over backend implementations.
//!
//! Wraps any `StoreBackend` and adds what is common to all of them: the
//! closed state, `Pop` position and page validation, and single-flight
//! `GetSet` / `GetSetMulti`.

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, info};

use super::backend::StoreBackend;
use super::embedded::EmbeddedBackend;
use super::flight::SingleFlight;
use super::list::{self, PopFrom};
use super::memory::MemoryBackend;
use crate::error::{Error, Result};
use crate::value::{Body, Value};

fn check_finite<'a>(key: &str, values: impl IntoIterator<Item = &'a Value>) -> Result<()> {
    if values.into_iter().all(Value::is_finite) {
        Ok(())
    } else {
        Err(Error::invalid_argument(format!(
            "'{key}': NaN and infinite floats cannot be stored"
        )))
    }
}

fn check_body(key: &str, body: &Body) -> Result<()> {
    match body {
        Body::Scalar(v) => check_finite(key, [v]),
        Body::List(items) => check_finite(key, items),
    }
}

struct StoreInner {
    backend: Arc<dyn StoreBackend>,
    closed: AtomicBool,
    flights: SingleFlight,
}

/// High-level store interface.
///
/// Wraps a `StoreBackend` implementation and provides a consistent API
/// regardless of the underlying storage mechanism.
///
/// # Thread Safety
///
/// `Store` is `Clone` and can be shared across tasks. Clones share the
/// backend and the closed state.
///
/// # Example
///
/// ```ignore
/// use unistore::Store;
/// use std::time::Duration;
///
/// let store = Store::memory(1024);
/// store.set("session:123", "user_data", Some(Duration::from_secs(3600))).await?;
///
/// if let Some(body) = store.get("session:123").await? {
///     println!("Found: {body:?}");
/// }
/// ```
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    /// Creates a store backed by an in-memory LRU of `size` entries.
    pub fn memory(size: usize) -> Self {
        Self::custom(MemoryBackend::new(size))
    }

    /// Creates a store backed by an embedded redb database.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or created.
    pub fn embedded<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self::custom(EmbeddedBackend::open(path)?))
    }

    /// Creates a store with a custom backend.
    pub fn custom<B: StoreBackend>(backend: B) -> Self {
        Self::from_arc(Arc::new(backend))
    }

    /// Creates a store from a shared backend.
    pub fn from_arc(backend: Arc<dyn StoreBackend>) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                backend,
                closed: AtomicBool::new(false),
                flights: SingleFlight::new(),
            }),
        }
    }

    /// Backend name (`lru`, `xun`, `redis`, `mongo`, `badger`).
    pub fn kind(&self) -> &'static str {
        self.inner.backend.kind()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn backend(&self) -> Result<&dyn StoreBackend> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        Ok(self.inner.backend.as_ref())
    }

    /// Returns the body bound to `key`, or `None` when absent or expired.
    ///
    /// # Errors
    ///
    /// Returns `Closed` after [`Store::close`], `Backend` on storage failure.
    pub async fn get(&self, key: &str) -> Result<Option<Body>> {
        self.backend()?.get(key).await
    }

    /// Binds `key` to `value`. `ttl` of `None` or zero never expires.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for NaN or infinite floats, `Closed` after
    /// [`Store::close`], `Backend` on storage failure.
    pub async fn set(&self, key: &str, value: impl Into<Body>, ttl: Option<Duration>) -> Result<()> {
        let body = value.into();
        check_body(key, &body)?;
        self.backend()?.set(key, body, ttl).await
    }

    /// # Errors
    ///
    /// Returns `Closed` after [`Store::close`], `Backend` on storage failure.
    pub async fn has(&self, key: &str) -> Result<bool> {
        self.backend()?.has(key).await
    }

    /// Removes `key`; `prefix*` removes every key starting with `prefix`.
    ///
    /// # Errors
    ///
    /// Returns `Closed` after [`Store::close`], `Backend` on storage failure.
    pub async fn del(&self, key: &str) -> Result<()> {
        self.backend()?.del(key).await
    }

    /// # Errors
    ///
    /// Returns `Closed` after [`Store::close`], `Backend` on storage failure.
    pub async fn get_del(&self, key: &str) -> Result<Option<Body>> {
        self.backend()?.get_del(key).await
    }

    /// Returns the existing value, or produces, stores, and returns a new one.
    ///
    /// Concurrent misses on the same key run `producer` once; the other
    /// callers wait and read what it stored.
    ///
    /// # Errors
    ///
    /// Returns `Producer` when `producer` fails or produces a NaN or
    /// infinite float (nothing is stored).
    pub async fn get_set<F, Fut>(&self, key: &str, ttl: Option<Duration>, producer: F) -> Result<Body>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = anyhow::Result<Body>>,
    {
        let backend = self.backend()?;
        if let Some(body) = backend.get(key).await? {
            return Ok(body);
        }

        let _flight = self.inner.flights.lock(key).await;
        if let Some(body) = backend.get(key).await? {
            return Ok(body);
        }

        debug!(key, "Producing value for cache miss");
        let body = producer(key.to_string())
            .await
            .map_err(|source| Error::Producer {
                key: key.to_string(),
                source,
            })?;
        if !body.is_finite() {
            return Err(Error::Producer {
                key: key.to_string(),
                source: anyhow::anyhow!("produced a NaN or infinite float"),
            });
        }
        backend.set(key, body.clone(), ttl).await?;
        Ok(body)
    }

    /// # Errors
    ///
    /// Returns `Closed` after [`Store::close`], `Backend` on storage failure.
    pub async fn len(&self) -> Result<usize> {
        self.backend()?.len().await
    }

    /// # Errors
    ///
    /// Returns `Closed` after [`Store::close`], `Backend` on storage failure.
    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// # Errors
    ///
    /// Returns `Closed` after [`Store::close`], `Backend` on storage failure.
    pub async fn keys(&self) -> Result<Vec<String>> {
        self.backend()?.keys().await
    }

    /// # Errors
    ///
    /// Returns `Closed` after [`Store::close`], `Backend` on storage failure.
    pub async fn clear(&self) -> Result<()> {
        self.backend()?.clear().await
    }

    /// # Errors
    ///
    /// Returns `InvalidKind` for non-counters, `Overflow` past `i64`.
    pub async fn incr(&self, key: &str, delta: i64) -> Result<i64> {
        self.backend()?.incr(key, delta).await
    }

    /// # Errors
    ///
    /// Returns `InvalidKind` for non-counters, `Overflow` past `i64`.
    pub async fn decr(&self, key: &str, delta: i64) -> Result<i64> {
        self.backend()?.decr(key, delta).await
    }

    /// # Errors
    ///
    /// Returns `Closed` after [`Store::close`], `Backend` on storage failure.
    pub async fn get_multi(&self, keys: &[String]) -> Result<HashMap<String, Body>> {
        self.backend()?.get_multi(keys).await
    }

    /// # Errors
    ///
    /// Returns `InvalidArgument`, writing nothing, if any body holds a NaN
    /// or infinite float; `Partial` naming every key that was not written.
    pub async fn set_multi(&self, values: Vec<(String, Body)>, ttl: Option<Duration>) -> Result<()> {
        for (key, body) in &values {
            check_body(key, body)?;
        }
        self.backend()?.set_multi(values, ttl).await
    }

    /// # Errors
    ///
    /// Returns `Partial` naming every key whose delete failed.
    pub async fn del_multi(&self, keys: &[String]) -> Result<()> {
        self.backend()?.del_multi(keys).await
    }

    /// Reads `keys`, producing each missing one. Keys whose producer failed
    /// are left out of the result.
    ///
    /// # Errors
    ///
    /// Returns `Closed` after [`Store::close`], `Backend` on storage failure.
    pub async fn get_set_multi<F, Fut>(
        &self,
        keys: &[String],
        ttl: Option<Duration>,
        producer: F,
    ) -> Result<HashMap<String, Body>>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = anyhow::Result<Body>>,
    {
        let mut found = self.get_multi(keys).await?;
        let missing: Vec<&String> = keys.iter().filter(|k| !found.contains_key(*k)).collect();

        let produced = join_all(missing.into_iter().map(|key| {
            let producer = &producer;
            async move { (key.clone(), self.get_set(key, ttl, producer).await) }
        }))
        .await;

        for (key, result) in produced {
            match result {
                Ok(body) => {
                    found.insert(key, body);
                },
                Err(Error::Producer { key, source }) => {
                    debug!(key, error = %source, "Producer failed, omitting key");
                },
                Err(e) => return Err(e),
            }
        }
        Ok(found)
    }

    /// # Errors
    ///
    /// Returns `InvalidKind` when the key holds a scalar.
    pub async fn push(&self, key: &str, values: Vec<Value>) -> Result<usize> {
        check_finite(key, &values)?;
        self.backend()?.push(key, values).await
    }

    /// Removes the tail (`position = 1`) or head (`position = -1`).
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for other positions, `NotFound` for an
    /// absent or empty list.
    pub async fn pop(&self, key: &str, position: i64) -> Result<Value> {
        let from = PopFrom::from_position(position)?;
        self.backend()?.pop(key, from).await
    }

    /// # Errors
    ///
    /// Returns `InvalidKind` when the key holds a scalar.
    pub async fn pull(&self, key: &str, value: &Value) -> Result<usize> {
        self.backend()?.pull(key, value).await
    }

    /// # Errors
    ///
    /// Returns `InvalidKind` when the key holds a scalar.
    pub async fn pull_all(&self, key: &str, values: &[Value]) -> Result<usize> {
        self.backend()?.pull_all(key, values).await
    }

    /// # Errors
    ///
    /// Returns `InvalidKind` when the key holds a scalar.
    pub async fn add_to_set(&self, key: &str, values: Vec<Value>) -> Result<usize> {
        check_finite(key, &values)?;
        self.backend()?.add_to_set(key, values).await
    }

    /// # Errors
    ///
    /// Returns `InvalidKind` when the key holds a scalar.
    pub async fn array_len(&self, key: &str) -> Result<usize> {
        self.backend()?.array_len(key).await
    }

    /// # Errors
    ///
    /// Returns `OutOfRange` when `index >= len`.
    pub async fn array_get(&self, key: &str, index: usize) -> Result<Value> {
        self.backend()?.array_get(key, index).await
    }

    /// # Errors
    ///
    /// Returns `OutOfRange` when `index >= len`.
    pub async fn array_set(&self, key: &str, index: usize, value: Value) -> Result<()> {
        check_finite(key, [&value])?;
        self.backend()?.array_set(key, index, value).await
    }

    /// # Errors
    ///
    /// Returns `InvalidKind` when the key holds a scalar.
    pub async fn array_slice(&self, key: &str, skip: usize, limit: usize) -> Result<Vec<Value>> {
        self.backend()?.array_slice(key, skip, limit).await
    }

    /// 1-based page of `page_size` elements.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for `page < 1`.
    pub async fn array_page(&self, key: &str, page: usize, page_size: usize) -> Result<Vec<Value>> {
        let (skip, limit) = list::page_bounds(page, page_size)?;
        self.array_slice(key, skip, limit).await
    }

    /// # Errors
    ///
    /// Returns `InvalidKind` when the key holds a scalar.
    pub async fn array_all(&self, key: &str) -> Result<Vec<Value>> {
        self.backend()?.array_all(key).await
    }

    /// Flushes pending state and stops background work. Idempotent; every
    /// later operation on any clone fails with `Closed`.
    ///
    /// # Errors
    ///
    /// Returns `Backend` if pending state could not be flushed.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!(kind = self.kind(), "Closing store");
        self.inner.backend.close().await
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("kind", &self.kind())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_get_set_produces_once_under_contention() {
        let store = Store::memory(64);
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                store
                    .get_set("expensive", None, |_| async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(Body::from("computed"))
                    })
                    .await
                    .unwrap()
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap(), Body::from("computed"));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.inner.flights.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_get_set_failure_stores_nothing() {
        let store = Store::memory(64);
        let err = store
            .get_set("k", None, |_| async { Err(anyhow::anyhow!("upstream down")) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Producer { .. }));
        assert!(!store.has("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_get_set_hit_skips_producer() {
        let store = Store::memory(64);
        store.set("k", "cached", None).await.unwrap();
        let body = store
            .get_set("k", None, |_| async { panic!("producer must not run on a hit") })
            .await
            .unwrap();
        assert_eq!(body, Body::from("cached"));
    }

    #[tokio::test]
    async fn test_get_set_multi_omits_failed_keys() {
        let store = Store::memory(64);
        store.set("a", 1, None).await.unwrap();
        let keys = vec!["a".to_string(), "b".to_string(), "bad".to_string()];
        let found = store
            .get_set_multi(&keys, None, |key| async move {
                if key == "bad" {
                    anyhow::bail!("cannot produce {key}");
                }
                Ok(Body::from(format!("made-{key}")))
            })
            .await
            .unwrap();

        assert_eq!(found.len(), 2);
        assert_eq!(found["a"], Body::from(1));
        assert_eq!(found["b"], Body::from("made-b"));
        assert!(!store.has("bad").await.unwrap());
    }

    #[tokio::test]
    async fn test_pop_position_validated_before_backend() {
        let store = Store::memory(8);
        store.set("scalar", "x", None).await.unwrap();
        assert!(matches!(
            store.pop("scalar", 0).await,
            Err(Error::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_array_page_rejects_page_zero() {
        let store = Store::memory(8);
        assert!(matches!(
            store.array_page("L", 0, 10).await,
            Err(Error::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_closed_store_rejects_everything() {
        let store = Store::memory(8);
        let clone = store.clone();
        store.set("k", "v", None).await.unwrap();
        store.close().await.unwrap();
        store.close().await.unwrap();

        assert!(matches!(clone.get("k").await, Err(Error::Closed)));
        assert!(matches!(clone.set("k", "v", None).await, Err(Error::Closed)));
        assert!(matches!(clone.len().await, Err(Error::Closed)));
        assert!(matches!(clone.push("L", vec![]).await, Err(Error::Closed)));
        assert!(clone.is_closed());
    }
}
