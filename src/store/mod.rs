//! Unified key-value and list store with pluggable backends.
//!
//! Every backend implements the same [`StoreBackend`] contract (scalar K/V,
//! batch, atomic counters, and MongoDB-style list operations):
//!
//! - **MemoryBackend** (`lru`): bounded in-memory LRU
//! - **LayeredStore** (`xun`): LRU front tier over a SQL table, with a
//!   write-behind worker
//! - **CacheBackend** (`redis`): networked cache through a [`CacheConnector`]
//! - **DocumentBackend** (`mongo`): one document per key through a
//!   [`DocumentConnector`]
//! - **EmbeddedBackend** (`badger`): embedded redb database
//!
//! # Example
//!
//! ```ignore
//! use unistore::Store;
//!
//! let store = Store::memory(10_240);
//! store.push("queue", vec!["a".into(), "b".into()]).await?;
//! assert_eq!(store.pop("queue", -1).await?, "a".into());
//! ```
//!
//! # Custom Backends
//!
//! Implement the `StoreBackend` trait and wrap it with [`Store::custom`].

mod backend;
pub mod cache;
pub mod document;
mod embedded;
mod flight;
mod handle;
pub mod layered;
pub mod list;
mod memory;
pub(crate) mod mutation;
mod sweep;
pub(crate) mod types;

pub use backend::StoreBackend;
pub use cache::{CacheBackend, CacheConnector, MemoryCache};
pub use document::{DocumentBackend, DocumentConnector, MemoryCollection};
pub use embedded::{DEFAULT_SWEEP_INTERVAL, EmbeddedBackend};
pub use handle::Store;
pub use layered::{LayeredOptions, LayeredStore};
pub use list::PopFrom;
pub use memory::{DEFAULT_CAPACITY, MemoryBackend};

/// Prefix matched by a wildcard key (`"user:123:*"` → `"user:123:"`).
///
/// Only a single trailing `*` is special; anywhere else it is literal.
pub fn wildcard_prefix(key: &str) -> Option<&str> {
    key.strip_suffix('*')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcard_prefix() {
        assert_eq!(wildcard_prefix("user:123:*"), Some("user:123:"));
        assert_eq!(wildcard_prefix("*"), Some(""));
        assert_eq!(wildcard_prefix("a*b"), None);
        assert_eq!(wildcard_prefix("plain"), None);
    }
}
