//! Networked cache adapter.
//!
//! Maps the store contract onto a cache engine through [`CacheConnector`]:
//! scalars become native strings, lists become native lists, counters use
//! the native integer add, and TTL uses native per-key expiry.
//!
//! Scalar encoding keeps native counters working: integers are stored as
//! plain decimal text, every other scalar as its tagged JSON form (which
//! always starts with `{` or `"`, so it never parses as an integer). List
//! elements use the same encoding, which makes element equality a plain
//! string comparison on the server.

mod connector;
mod memory;
#[cfg(feature = "redis")]
mod redis;

pub use connector::{CacheConnector, CacheError, CacheResult, CacheValue};
pub use memory::MemoryCache;
#[cfg(feature = "redis")]
pub use self::redis::RedisConnector;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;

use super::backend::StoreBackend;
use super::list::PopFrom;
use super::wildcard_prefix;
use crate::error::{Error, Result};
use crate::value::{Body, Kind, Value};

/// Default deadline for one connector round-trip.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Keys fetched per scan step during wildcard deletes.
const SCAN_BATCH: usize = 500;

/// Encodes one scalar as cache text.
///
/// # Errors
///
/// Returns an error for non-finite floats or if the value cannot be
/// serialized.
pub fn encode_scalar(value: &Value) -> anyhow::Result<String> {
    anyhow::ensure!(value.is_finite(), "non-finite float cannot be encoded");
    match value {
        Value::Int(i) => Ok(i.to_string()),
        other => serde_json::to_string(other).context("Failed to encode cache value"),
    }
}

/// Decodes cache text. Text written by other clients that is neither an
/// integer nor tagged JSON reads back as a string.
pub fn decode_scalar(text: String) -> Value {
    if let Ok(i) = text.parse::<i64>() {
        return Value::Int(i);
    }
    serde_json::from_str(&text).unwrap_or(Value::String(text))
}

fn encode_all(values: &[Value]) -> Result<Vec<String>> {
    values
        .iter()
        .map(|v| encode_scalar(v).map_err(Error::backend))
        .collect()
}

fn decode_value(value: CacheValue) -> Body {
    match value {
        CacheValue::Text(text) => Body::Scalar(decode_scalar(text)),
        CacheValue::List(items) => Body::List(items.into_iter().map(decode_scalar).collect()),
    }
}

/// Networked cache backend (`redis`).
#[derive(Clone)]
pub struct CacheBackend {
    connector: Arc<dyn CacheConnector>,
    timeout: Duration,
}

impl CacheBackend {
    pub fn new(connector: Arc<dyn CacheConnector>) -> Self {
        Self {
            connector,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Sets the deadline applied to each connector call.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Runs one connector call under the deadline and maps its errors for
    /// an operation expecting `kind` at `key`.
    async fn call<T>(
        &self,
        key: &str,
        kind: Kind,
        fut: impl Future<Output = CacheResult<T>> + Send,
    ) -> Result<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(map_error(key, kind, e)),
            Err(_) => Err(Error::backend(anyhow::anyhow!(
                "cache call on '{key}' timed out after {:?}",
                self.timeout
            ))),
        }
    }

    async fn list_len_of(&self, key: &str) -> Result<usize> {
        self.call(key, Kind::List, self.connector.list_len(key))
            .await
    }
}

fn map_error(key: &str, kind: Kind, err: CacheError) -> Error {
    match err {
        CacheError::WrongType => Error::invalid_kind(key, kind),
        CacheError::NotInteger => Error::not_integer(key),
        CacheError::Overflow => Error::overflow(key),
        // Callers that can report a length handle this themselves.
        CacheError::OutOfRange => Error::out_of_range(key, 0, 0),
        CacheError::Io(e) => Error::backend(e.context(format!("Cache call on '{key}' failed"))),
    }
}

#[async_trait]
impl StoreBackend for CacheBackend {
    fn kind(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<Body>> {
        let found = self.call(key, Kind::Value, self.connector.get(key)).await?;
        Ok(found.map(decode_value))
    }

    async fn set(&self, key: &str, value: Body, ttl: Option<Duration>) -> Result<()> {
        let ttl = ttl.filter(|d| !d.is_zero());
        match value {
            Body::Scalar(v) => {
                let text = encode_scalar(&v)?;
                self.call(key, Kind::Value, self.connector.set_text(key, text, ttl))
                    .await
            },
            Body::List(items) => {
                let items = encode_all(&items)?;
                self.call(key, Kind::List, self.connector.set_list(key, items, ttl))
                    .await
            },
        }
    }

    async fn has(&self, key: &str) -> Result<bool> {
        self.call(key, Kind::Value, self.connector.exists(key))
            .await
    }

    async fn del(&self, key: &str) -> Result<()> {
        let Some(prefix) = wildcard_prefix(key) else {
            let keys = [key.to_string()];
            return self
                .call(key, Kind::Value, self.connector.delete(&keys))
                .await;
        };

        let mut matched = Vec::new();
        let mut cursor = 0;
        loop {
            let (next, batch) = self
                .call(key, Kind::Value, self.connector.scan(prefix, cursor, SCAN_BATCH))
                .await?;
            matched.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        for chunk in matched.chunks(SCAN_BATCH) {
            self.call(key, Kind::Value, self.connector.delete(chunk))
                .await?;
        }
        Ok(())
    }

    async fn get_del(&self, key: &str) -> Result<Option<Body>> {
        let found = self
            .call(key, Kind::Value, self.connector.get_del(key))
            .await?;
        Ok(found.map(decode_value))
    }

    async fn len(&self) -> Result<usize> {
        self.call("*", Kind::Value, self.connector.count()).await
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut cursor = 0;
        loop {
            let (next, batch) = self
                .call("*", Kind::Value, self.connector.scan("", cursor, SCAN_BATCH))
                .await?;
            keys.extend(batch);
            if next == 0 {
                return Ok(keys);
            }
            cursor = next;
        }
    }

    async fn clear(&self) -> Result<()> {
        self.call("*", Kind::Value, self.connector.flush()).await
    }

    async fn incr(&self, key: &str, delta: i64) -> Result<i64> {
        self.call(key, Kind::Value, self.connector.incr_by(key, delta))
            .await
    }

    async fn push(&self, key: &str, values: Vec<Value>) -> Result<usize> {
        let items = encode_all(&values)?;
        self.call(key, Kind::List, self.connector.push(key, items))
            .await
    }

    async fn pop(&self, key: &str, from: PopFrom) -> Result<Value> {
        let popped = self
            .call(key, Kind::List, self.connector.pop(key, from))
            .await?;
        popped
            .map(decode_scalar)
            .ok_or_else(|| Error::not_found(key))
    }

    async fn pull(&self, key: &str, value: &Value) -> Result<usize> {
        let items = vec![encode_scalar(value)?];
        self.call(key, Kind::List, self.connector.remove(key, items))
            .await
    }

    async fn pull_all(&self, key: &str, values: &[Value]) -> Result<usize> {
        let items = encode_all(values)?;
        self.call(key, Kind::List, self.connector.remove(key, items))
            .await
    }

    async fn add_to_set(&self, key: &str, values: Vec<Value>) -> Result<usize> {
        let items = encode_all(&values)?;
        self.call(key, Kind::List, self.connector.add_to_set(key, items))
            .await
    }

    async fn array_len(&self, key: &str) -> Result<usize> {
        self.list_len_of(key).await
    }

    async fn array_get(&self, key: &str, index: usize) -> Result<Value> {
        let found = self
            .call(key, Kind::List, self.connector.list_index(key, index))
            .await?;
        match found {
            Some(text) => Ok(decode_scalar(text)),
            None => Err(Error::out_of_range(key, index, self.list_len_of(key).await?)),
        }
    }

    async fn array_set(&self, key: &str, index: usize, value: Value) -> Result<()> {
        let text = encode_scalar(&value)?;
        match tokio::time::timeout(self.timeout, self.connector.list_set(key, index, text)).await {
            Ok(Err(CacheError::OutOfRange)) => {
                Err(Error::out_of_range(key, index, self.list_len_of(key).await?))
            },
            Ok(result) => result.map_err(|e| map_error(key, Kind::List, e)),
            Err(_) => Err(Error::backend(anyhow::anyhow!(
                "cache call on '{key}' timed out after {:?}",
                self.timeout
            ))),
        }
    }

    async fn array_slice(&self, key: &str, skip: usize, limit: usize) -> Result<Vec<Value>> {
        if limit == 0 {
            // Still reject scalars.
            self.list_len_of(key).await?;
            return Ok(Vec::new());
        }
        let stop = skip.saturating_add(limit - 1);
        let items = self
            .call(key, Kind::List, self.connector.list_range(key, skip, stop))
            .await?;
        Ok(items.into_iter().map(decode_scalar).collect())
    }

    async fn array_all(&self, key: &str) -> Result<Vec<Value>> {
        self.array_slice(key, 0, usize::MAX).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> CacheBackend {
        CacheBackend::new(Arc::new(MemoryCache::new()))
    }

    #[test]
    fn test_scalar_encoding_keeps_integers_native() {
        assert_eq!(encode_scalar(&Value::Int(-42)).unwrap(), "-42");
        let text = encode_scalar(&Value::from("42")).unwrap();
        assert!(text.parse::<i64>().is_err());
        assert_eq!(decode_scalar(text), Value::from("42"));
        assert_eq!(decode_scalar("plain text".into()), Value::from("plain text"));
        assert_eq!(
            decode_scalar(encode_scalar(&Value::Null).unwrap()),
            Value::Null
        );
    }

    #[tokio::test]
    async fn test_counter_over_stored_integer() {
        let store = backend();
        store.set("n", Body::from(10), None).await.unwrap();
        assert_eq!(store.incr("n", 5).await.unwrap(), 15);
        assert_eq!(store.get("n").await.unwrap(), Some(Body::from(15)));

        store.set("s", Body::from("10"), None).await.unwrap();
        assert!(matches!(store.incr("s", 1).await, Err(Error::InvalidKind { .. })));
    }

    #[tokio::test]
    async fn test_wrong_type_maps_to_invalid_kind() {
        let store = backend();
        store.push("L", vec![Value::from("a")]).await.unwrap();
        assert!(matches!(store.incr("L", 1).await, Err(Error::InvalidKind { .. })));
        store.set("s", Body::from("x"), None).await.unwrap();
        assert!(matches!(
            store.push("s", vec![Value::from(1)]).await,
            Err(Error::InvalidKind { .. })
        ));
    }

    #[tokio::test]
    async fn test_out_of_range_reports_length() {
        let store = backend();
        store
            .push("L", vec![Value::from("a"), Value::from("b")])
            .await
            .unwrap();
        assert!(matches!(
            store.array_get("L", 2).await,
            Err(Error::OutOfRange { index: 2, len: 2, .. })
        ));
        assert!(matches!(
            store.array_set("L", 5, Value::Null).await,
            Err(Error::OutOfRange { index: 5, len: 2, .. })
        ));
    }

    #[tokio::test]
    async fn test_structured_elements_pull_by_equality() {
        let store = backend();
        let doc = Value::from_json(serde_json::json!({"b": 2, "a": 1}));
        let same = Value::from_json(serde_json::json!({"a": 1, "b": 2}));
        store.push("L", vec![doc, Value::from(1)]).await.unwrap();
        assert_eq!(store.pull("L", &same).await.unwrap(), 1);
        assert_eq!(store.array_all("L").await.unwrap(), vec![Value::from(1)]);
    }

    #[tokio::test]
    async fn test_zero_limit_slice_is_empty() {
        let store = backend();
        store.push("L", vec![Value::from(1)]).await.unwrap();
        assert!(store.array_slice("L", 0, 0).await.unwrap().is_empty());
    }
}
