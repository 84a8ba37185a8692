//! Backend trait for the store contract.
//!
//! Defines the interface every storage backend implements, so callers use
//! the same operations whether the medium is an in-memory LRU, a networked
//! cache, a document database, an embedded KV engine, or the layered store.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use super::list::{self, PopFrom};
use crate::error::{Error, Result};
use crate::value::{Body, Value};

/// Backend trait for the store contract.
///
/// All backends must be thread-safe (`Send + Sync`) for use with tokio.
/// Every mutation must be serializable with respect to every other
/// operation on the same key; there is no ordering across keys.
///
/// `ttl` of `None` or zero means the entry never expires.
#[async_trait]
pub trait StoreBackend: Send + Sync + 'static {
    /// Short backend name (`lru`, `xun`, `redis`, `mongo`, `badger`).
    fn kind(&self) -> &'static str;

    /// Retrieves the body bound to `key`.
    ///
    /// Returns `Ok(None)` if the key doesn't exist or has expired.
    ///
    /// # Errors
    ///
    /// Returns `Backend` if the underlying storage operation fails.
    async fn get(&self, key: &str) -> Result<Option<Body>>;

    /// Binds `key` to `value`, replacing any prior scalar or list.
    ///
    /// # Errors
    ///
    /// Returns `Backend` if the underlying storage operation fails.
    async fn set(&self, key: &str, value: Body, ttl: Option<Duration>) -> Result<()>;

    /// Checks if a non-expired entry exists.
    ///
    /// Default implementation uses `get()`, but backends may override
    /// for efficiency.
    ///
    /// # Errors
    ///
    /// Returns `Backend` if the underlying storage operation fails.
    async fn has(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    /// Removes `key`. A trailing `*` removes every key with that prefix.
    /// Absent keys are not errors.
    ///
    /// # Errors
    ///
    /// Returns `Backend` if the underlying storage operation fails.
    async fn del(&self, key: &str) -> Result<()>;

    /// Atomically reads and removes `key`.
    ///
    /// # Errors
    ///
    /// Returns `Backend` if the underlying storage operation fails.
    async fn get_del(&self, key: &str) -> Result<Option<Body>>;

    /// Counts live entries.
    ///
    /// # Errors
    ///
    /// Returns `Backend` if the underlying storage operation fails.
    async fn len(&self) -> Result<usize>;

    /// Snapshot of all live keys in no particular order.
    ///
    /// # Errors
    ///
    /// Returns `Backend` if the underlying storage operation fails.
    async fn keys(&self) -> Result<Vec<String>>;

    /// Removes every entry.
    ///
    /// # Errors
    ///
    /// Returns `Backend` if the underlying storage operation fails.
    async fn clear(&self) -> Result<()>;

    /// Atomically adds `delta` to the counter at `key` (absent reads as 0).
    ///
    /// # Errors
    ///
    /// Returns `InvalidKind` for lists and non-integer scalars, `Overflow`
    /// when the result leaves the `i64` range.
    async fn incr(&self, key: &str, delta: i64) -> Result<i64>;

    /// Atomically subtracts `delta` from the counter at `key`.
    ///
    /// # Errors
    ///
    /// Same as [`StoreBackend::incr`].
    async fn decr(&self, key: &str, delta: i64) -> Result<i64> {
        let delta = list::negate_delta(key, delta)?;
        self.incr(key, delta).await
    }

    /// Reads several keys. Only present keys appear in the result.
    ///
    /// # Errors
    ///
    /// Returns `Backend` if any read fails.
    async fn get_multi(&self, keys: &[String]) -> Result<HashMap<String, Body>> {
        let mut found = HashMap::with_capacity(keys.len());
        for key in keys {
            if let Some(body) = self.get(key).await? {
                found.insert(key.clone(), body);
            }
        }
        Ok(found)
    }

    /// Writes several keys with a shared TTL.
    ///
    /// # Errors
    ///
    /// Returns `Partial` naming every key that was not written.
    async fn set_multi(&self, values: Vec<(String, Body)>, ttl: Option<Duration>) -> Result<()> {
        let mut failed = Vec::new();
        let mut last_error = None;
        for (key, body) in values {
            if let Err(e) = self.set(&key, body, ttl).await {
                failed.push(key);
                last_error = Some(e);
            }
        }
        partial_result(failed, last_error)
    }

    /// Deletes several keys. Absent keys are not errors.
    ///
    /// # Errors
    ///
    /// Returns `Partial` naming every key whose delete failed.
    async fn del_multi(&self, keys: &[String]) -> Result<()> {
        let mut failed = Vec::new();
        let mut last_error = None;
        for key in keys {
            if let Err(e) = self.del(key).await {
                failed.push(key.clone());
                last_error = Some(e);
            }
        }
        partial_result(failed, last_error)
    }

    /// Appends `values` to the tail in argument order. Returns the new length.
    ///
    /// # Errors
    ///
    /// Returns `InvalidKind` when the key holds a scalar.
    async fn push(&self, key: &str, values: Vec<Value>) -> Result<usize>;

    /// Removes and returns the tail or head element.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an absent or empty list.
    async fn pop(&self, key: &str, from: PopFrom) -> Result<Value>;

    /// Removes every element equal to `value`. Returns the number removed.
    ///
    /// # Errors
    ///
    /// Returns `InvalidKind` when the key holds a scalar.
    async fn pull(&self, key: &str, value: &Value) -> Result<usize>;

    /// Removes every element equal to any of `values`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidKind` when the key holds a scalar.
    async fn pull_all(&self, key: &str, values: &[Value]) -> Result<usize>;

    /// Appends each value not already present. Returns the number appended.
    ///
    /// # Errors
    ///
    /// Returns `InvalidKind` when the key holds a scalar.
    async fn add_to_set(&self, key: &str, values: Vec<Value>) -> Result<usize>;

    /// List length, 0 for an absent key.
    ///
    /// The read defaults below go through `get()`; backends with native
    /// list structures override them.
    ///
    /// # Errors
    ///
    /// Returns `InvalidKind` when the key holds a scalar.
    async fn array_len(&self, key: &str) -> Result<usize> {
        let body = self.get(key).await?;
        Ok(list::as_list(key, body.as_ref())?.len())
    }

    /// Element at a 0-based index.
    ///
    /// # Errors
    ///
    /// Returns `OutOfRange` when `index >= len`.
    async fn array_get(&self, key: &str, index: usize) -> Result<Value> {
        let body = self.get(key).await?;
        list::get(key, list::as_list(key, body.as_ref())?, index)
    }

    /// Replaces the element at a 0-based index.
    ///
    /// # Errors
    ///
    /// Returns `OutOfRange` when `index >= len`.
    async fn array_set(&self, key: &str, index: usize, value: Value) -> Result<()>;

    /// Elements `[skip, skip + limit)` clipped to the list.
    ///
    /// # Errors
    ///
    /// Returns `InvalidKind` when the key holds a scalar.
    async fn array_slice(&self, key: &str, skip: usize, limit: usize) -> Result<Vec<Value>> {
        let body = self.get(key).await?;
        Ok(list::slice(list::as_list(key, body.as_ref())?, skip, limit))
    }

    /// All elements in order.
    ///
    /// # Errors
    ///
    /// Returns `InvalidKind` when the key holds a scalar.
    async fn array_all(&self, key: &str) -> Result<Vec<Value>> {
        list::into_list(key, self.get(key).await?)
    }

    /// Flushes pending state, stops background work, and releases resources.
    ///
    /// # Errors
    ///
    /// Returns `Backend` if pending state could not be flushed.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

fn partial_result(failed: Vec<String>, last_error: Option<Error>) -> Result<()> {
    match last_error {
        None => Ok(()),
        Some(source) => Err(Error::Partial {
            failed,
            source: Box::new(source),
        }),
    }
}
