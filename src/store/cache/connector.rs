//! Narrow interface the cache adapter needs from a networked cache.
//!
//! Values cross the connector as text: scalar strings and list elements.
//! Lists are ordered and vanish when emptied, the way native list types
//! in networked caches behave.

use std::time::Duration;

use async_trait::async_trait;

use crate::store::list::PopFrom;

/// Failures a cache connector reports.
///
/// The first four are server-side rejections the adapter maps onto contract
/// errors; `Io` covers everything else.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("operation against a key holding the wrong kind of value")]
    WrongType,

    #[error("value is not an integer")]
    NotInteger,

    #[error("increment or decrement would overflow")]
    Overflow,

    #[error("index out of range")]
    OutOfRange,

    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

pub type CacheResult<T> = std::result::Result<T, CacheError>;

/// A typed read of one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheValue {
    Text(String),
    List(Vec<String>),
}

/// Operations the cache adapter issues against the engine.
///
/// Every method must be atomic for its key on the server side.
#[async_trait]
pub trait CacheConnector: Send + Sync + 'static {
    /// Reads a key as text or list.
    async fn get(&self, key: &str) -> CacheResult<Option<CacheValue>>;

    /// Reads and deletes a key in one step.
    async fn get_del(&self, key: &str) -> CacheResult<Option<CacheValue>>;

    /// Replaces the key with text. `None` clears any expiry.
    async fn set_text(&self, key: &str, value: String, ttl: Option<Duration>) -> CacheResult<()>;

    /// Replaces the key with a list. An empty list removes the key.
    async fn set_list(&self, key: &str, items: Vec<String>, ttl: Option<Duration>)
    -> CacheResult<()>;

    async fn exists(&self, key: &str) -> CacheResult<bool>;

    async fn delete(&self, keys: &[String]) -> CacheResult<()>;

    /// One bounded batch of keys starting with `prefix`. Returns the next
    /// cursor (0 when the scan is complete) and at most about `count` keys.
    async fn scan(&self, prefix: &str, cursor: u64, count: usize) -> CacheResult<(u64, Vec<String>)>;

    /// Number of keys.
    async fn count(&self) -> CacheResult<usize>;

    /// Removes every key.
    async fn flush(&self) -> CacheResult<()>;

    /// Native integer add. Absent keys start at zero; expiry is kept.
    async fn incr_by(&self, key: &str, delta: i64) -> CacheResult<i64>;

    /// Appends to the tail. Returns the new length.
    async fn push(&self, key: &str, items: Vec<String>) -> CacheResult<usize>;

    async fn pop(&self, key: &str, from: PopFrom) -> CacheResult<Option<String>>;

    /// Removes every element equal to one of `items`. Returns how many.
    async fn remove(&self, key: &str, items: Vec<String>) -> CacheResult<usize>;

    /// Appends each item not already present. Returns how many were added.
    async fn add_to_set(&self, key: &str, items: Vec<String>) -> CacheResult<usize>;

    async fn list_len(&self, key: &str) -> CacheResult<usize>;

    async fn list_index(&self, key: &str, index: usize) -> CacheResult<Option<String>>;

    /// Replaces an element. Fails with `OutOfRange` past the end or on an
    /// absent key.
    async fn list_set(&self, key: &str, index: usize, item: String) -> CacheResult<()>;

    /// Elements `[start, stop]` inclusive, clipped.
    async fn list_range(&self, key: &str, start: usize, stop: usize) -> CacheResult<Vec<String>>;
}
