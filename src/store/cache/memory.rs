//! In-process cache connector.
//!
//! Mirrors the observable behavior of a networked cache (typed keys, native
//! integer counters, lists that vanish when emptied, cursor scans) without a
//! server. Used by tests and single-process deployments.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::ops::Bound;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::connector::{CacheConnector, CacheError, CacheResult, CacheValue};
use crate::store::list::PopFrom;
use crate::store::types::{deadline, is_past};

#[derive(Debug, Clone)]
enum Slot {
    Text(String),
    List(VecDeque<String>),
}

#[derive(Debug, Clone)]
struct Item {
    slot: Slot,
    expires_at: Option<DateTime<Utc>>,
}

impl Item {
    fn to_value(&self) -> CacheValue {
        match &self.slot {
            Slot::Text(s) => CacheValue::Text(s.clone()),
            Slot::List(items) => CacheValue::List(items.iter().cloned().collect()),
        }
    }
}

type Items = BTreeMap<String, Item>;

/// Looks up a live item, dropping it first if expired.
fn live<'a>(items: &'a mut Items, key: &str) -> Option<&'a mut Item> {
    if items.get(key).is_some_and(|i| is_past(i.expires_at)) {
        items.remove(key);
    }
    items.get_mut(key)
}

fn list_of<'a>(items: &'a mut Items, key: &str) -> CacheResult<Option<&'a mut VecDeque<String>>> {
    match live(items, key) {
        None => Ok(None),
        Some(Item {
            slot: Slot::List(list),
            ..
        }) => Ok(Some(list)),
        Some(_) => Err(CacheError::WrongType),
    }
}

/// Removes the key if its list became empty.
fn drop_if_empty(items: &mut Items, key: &str) {
    if matches!(items.get(key), Some(Item { slot: Slot::List(l), .. }) if l.is_empty()) {
        items.remove(key);
    }
}

/// In-process [`CacheConnector`].
///
/// Scan cursors name the last key returned, so keys removed between pages
/// never shift the rest of the scan.
#[derive(Default)]
pub struct MemoryCache {
    items: Mutex<Items>,
    cursors: Mutex<Cursors>,
}

/// Open scan cursors: id to the last key handed out. Each id is used once.
#[derive(Default)]
struct Cursors {
    last: u64,
    open: HashMap<u64, String>,
}

impl Cursors {
    fn issue(&mut self, after: String) -> u64 {
        self.last = self.last.wrapping_add(1).max(1);
        self.open.insert(self.last, after);
        self.last
    }
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheConnector for MemoryCache {
    async fn get(&self, key: &str) -> CacheResult<Option<CacheValue>> {
        let mut items = self.items.lock();
        Ok(live(&mut items, key).map(|i| i.to_value()))
    }

    async fn get_del(&self, key: &str) -> CacheResult<Option<CacheValue>> {
        let mut items = self.items.lock();
        let value = live(&mut items, key).map(|i| i.to_value());
        items.remove(key);
        Ok(value)
    }

    async fn set_text(&self, key: &str, value: String, ttl: Option<Duration>) -> CacheResult<()> {
        self.items.lock().insert(
            key.to_string(),
            Item {
                slot: Slot::Text(value),
                expires_at: deadline(ttl),
            },
        );
        Ok(())
    }

    async fn set_list(
        &self,
        key: &str,
        items: Vec<String>,
        ttl: Option<Duration>,
    ) -> CacheResult<()> {
        let mut map = self.items.lock();
        if items.is_empty() {
            map.remove(key);
            return Ok(());
        }
        map.insert(
            key.to_string(),
            Item {
                slot: Slot::List(items.into()),
                expires_at: deadline(ttl),
            },
        );
        Ok(())
    }

    async fn exists(&self, key: &str) -> CacheResult<bool> {
        Ok(live(&mut self.items.lock(), key).is_some())
    }

    async fn delete(&self, keys: &[String]) -> CacheResult<()> {
        let mut items = self.items.lock();
        for key in keys {
            items.remove(key);
        }
        Ok(())
    }

    async fn scan(&self, prefix: &str, cursor: u64, count: usize) -> CacheResult<(u64, Vec<String>)> {
        let after = match cursor {
            0 => None,
            id => match self.cursors.lock().open.remove(&id) {
                Some(key) => Some(key),
                // Unknown or spent cursor: the scan is over.
                None => return Ok((0, Vec::new())),
            },
        };
        let start = match &after {
            Some(key) => Bound::Excluded(key.as_str()),
            None => Bound::Included(prefix),
        };

        let items = self.items.lock();
        let mut matching = items
            .range::<str, _>((start, Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .filter(|(_, i)| !is_past(i.expires_at));

        let batch: Vec<String> = matching
            .by_ref()
            .take(count.max(1))
            .map(|(k, _)| k.clone())
            .collect();
        let more = matching.next().is_some();
        drop(items);

        let next = match batch.last() {
            Some(last) if more => self.cursors.lock().issue(last.clone()),
            _ => 0,
        };
        Ok((next, batch))
    }

    async fn count(&self) -> CacheResult<usize> {
        let items = self.items.lock();
        Ok(items.values().filter(|i| !is_past(i.expires_at)).count())
    }

    async fn flush(&self) -> CacheResult<()> {
        self.items.lock().clear();
        Ok(())
    }

    async fn incr_by(&self, key: &str, delta: i64) -> CacheResult<i64> {
        let mut items = self.items.lock();
        let (current, expires_at) = match live(&mut items, key) {
            None => (0, None),
            Some(Item {
                slot: Slot::Text(text),
                expires_at,
            }) => (
                text.parse::<i64>().map_err(|_| CacheError::NotInteger)?,
                *expires_at,
            ),
            Some(_) => return Err(CacheError::WrongType),
        };
        let next = current.checked_add(delta).ok_or(CacheError::Overflow)?;
        items.insert(
            key.to_string(),
            Item {
                slot: Slot::Text(next.to_string()),
                expires_at,
            },
        );
        Ok(next)
    }

    async fn push(&self, key: &str, values: Vec<String>) -> CacheResult<usize> {
        let mut items = self.items.lock();
        if let Some(list) = list_of(&mut items, key)? {
            list.extend(values);
            return Ok(list.len());
        }
        if values.is_empty() {
            return Ok(0);
        }
        let len = values.len();
        items.insert(
            key.to_string(),
            Item {
                slot: Slot::List(values.into()),
                expires_at: None,
            },
        );
        Ok(len)
    }

    async fn pop(&self, key: &str, from: PopFrom) -> CacheResult<Option<String>> {
        let mut items = self.items.lock();
        let popped = list_of(&mut items, key)?.and_then(|list| match from {
            PopFrom::Tail => list.pop_back(),
            PopFrom::Head => list.pop_front(),
        });
        drop_if_empty(&mut items, key);
        Ok(popped)
    }

    async fn remove(&self, key: &str, values: Vec<String>) -> CacheResult<usize> {
        let mut items = self.items.lock();
        let removed = match list_of(&mut items, key)? {
            None => 0,
            Some(list) => {
                let before = list.len();
                list.retain(|item| !values.contains(item));
                before - list.len()
            },
        };
        drop_if_empty(&mut items, key);
        Ok(removed)
    }

    async fn add_to_set(&self, key: &str, values: Vec<String>) -> CacheResult<usize> {
        let mut items = self.items.lock();
        if list_of(&mut items, key)?.is_none() {
            items.insert(
                key.to_string(),
                Item {
                    slot: Slot::List(VecDeque::new()),
                    expires_at: None,
                },
            );
        }
        let mut added = 0;
        if let Some(list) = list_of(&mut items, key)? {
            for value in values {
                if !list.contains(&value) {
                    list.push_back(value);
                    added += 1;
                }
            }
        }
        drop_if_empty(&mut items, key);
        Ok(added)
    }

    async fn list_len(&self, key: &str) -> CacheResult<usize> {
        let mut items = self.items.lock();
        Ok(list_of(&mut items, key)?.map_or(0, |list| list.len()))
    }

    async fn list_index(&self, key: &str, index: usize) -> CacheResult<Option<String>> {
        let mut items = self.items.lock();
        Ok(list_of(&mut items, key)?.and_then(|list| list.get(index).cloned()))
    }

    async fn list_set(&self, key: &str, index: usize, value: String) -> CacheResult<()> {
        let mut items = self.items.lock();
        let slot = list_of(&mut items, key)?
            .and_then(|list| list.get_mut(index))
            .ok_or(CacheError::OutOfRange)?;
        *slot = value;
        Ok(())
    }

    async fn list_range(&self, key: &str, start: usize, stop: usize) -> CacheResult<Vec<String>> {
        let mut items = self.items.lock();
        Ok(list_of(&mut items, key)?.map_or_else(Vec::new, |list| {
            list.iter()
                .skip(start)
                .take(stop.saturating_sub(start).saturating_add(1))
                .cloned()
                .collect()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emptied_list_vanishes() {
        let cache = MemoryCache::new();
        cache.push("L", vec!["a".into()]).await.unwrap();
        assert_eq!(cache.pop("L", PopFrom::Head).await.unwrap(), Some("a".into()));
        assert!(!cache.exists("L").await.unwrap());
    }

    #[tokio::test]
    async fn test_type_errors() {
        let cache = MemoryCache::new();
        cache.set_text("s", "{\"String\":\"x\"}".into(), None).await.unwrap();
        assert!(matches!(cache.push("s", vec![]).await, Err(CacheError::WrongType)));
        assert!(matches!(cache.incr_by("s", 1).await, Err(CacheError::NotInteger)));

        cache.push("L", vec!["1".into()]).await.unwrap();
        assert!(matches!(cache.incr_by("L", 1).await, Err(CacheError::WrongType)));
    }

    #[tokio::test]
    async fn test_incr_keeps_expiry_and_detects_overflow() {
        let cache = MemoryCache::new();
        cache
            .set_text("n", i64::MAX.to_string(), Some(Duration::from_secs(60)))
            .await
            .unwrap();
        assert!(matches!(cache.incr_by("n", 1).await, Err(CacheError::Overflow)));
        assert_eq!(cache.incr_by("n", -1).await.unwrap(), i64::MAX - 1);
        assert!(cache.items.lock()["n"].expires_at.is_some());
    }

    #[tokio::test]
    async fn test_scan_pages_through_prefix() {
        let cache = MemoryCache::new();
        for i in 0..7 {
            cache.set_text(&format!("p:{i}"), "1".into(), None).await.unwrap();
        }
        cache.set_text("q:0", "1".into(), None).await.unwrap();

        let mut cursor = 0;
        let mut seen = Vec::new();
        loop {
            let (next, batch) = cache.scan("p:", cursor, 3).await.unwrap();
            assert!(batch.len() <= 3);
            seen.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        assert_eq!(seen.len(), 7);
        assert!(seen.iter().all(|k| k.starts_with("p:")));
    }

    #[tokio::test]
    async fn test_scan_survives_deletes_between_pages() {
        let cache = MemoryCache::new();
        for i in 0..6 {
            cache.set_text(&format!("p:{i}"), "1".into(), None).await.unwrap();
        }

        let (cursor, first) = cache.scan("p:", 0, 2).await.unwrap();
        assert_eq!(first, vec!["p:0", "p:1"]);
        cache.delete(&first).await.unwrap();

        let mut seen = Vec::new();
        let mut cursor = cursor;
        while cursor != 0 {
            let (next, batch) = cache.scan("p:", cursor, 2).await.unwrap();
            seen.extend(batch);
            cursor = next;
        }
        assert_eq!(seen, vec!["p:2", "p:3", "p:4", "p:5"]);
        assert!(cache.cursors.lock().open.is_empty());
    }

    #[tokio::test]
    async fn test_list_set_out_of_range() {
        let cache = MemoryCache::new();
        assert!(matches!(
            cache.list_set("none", 0, "x".into()).await,
            Err(CacheError::OutOfRange)
        ));
        cache.push("L", vec!["a".into()]).await.unwrap();
        assert!(matches!(
            cache.list_set("L", 1, "x".into()).await,
            Err(CacheError::OutOfRange)
        ));
    }
}
