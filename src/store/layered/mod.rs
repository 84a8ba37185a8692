//! Layered store: a bounded LRU front tier over a SQL back tier with
//! write-behind persistence.
//!
//! Writes land in the front tier and in a dirty map (or, for deletes, a
//! tombstone set) and are persisted by a background worker on a fixed
//! interval. While a flush is running its snapshot stays visible as the
//! in-flight map, so readers never fall through to a row that is about to
//! change. Reads resolve in this order:
//!
//! ```text
//! tombstones -> dirty -> in-flight -> LRU -> SQL (then installed in LRU)
//! ```
//!
//! Locks are always taken in the same order: tombstones, dirty, in-flight,
//! LRU. None of them is held across an await. Reads that the front tier can
//! answer take every lock shared; mutations and back-tier installs take
//! them exclusively. Loads from the back tier are
//! installed only if no flush or clear happened meanwhile, tracked by an
//! epoch counter bumped under the locks.

mod back;
mod worker;


pub use back::{BackTable, DirtyEntry, validate_table_name};

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use lru::LruCache;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, error, info};

use self::worker::Worker;
use super::backend::StoreBackend;
use super::list::PopFrom;
use super::memory::DEFAULT_CAPACITY;
use super::mutation::{Mutation, Outcome};
use super::types::Entry;
use super::wildcard_prefix;
use crate::error::{Error, Result};
use crate::sql::SqlBackend;
use crate::value::{Body, Value};

/// Back-tier table used when none is configured.
pub const DEFAULT_TABLE: &str = "__store_default";

/// Default write-behind interval.
pub const DEFAULT_PERSIST_INTERVAL: Duration = Duration::from_secs(60);

/// Default interval between expired-row sweeps.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

/// Construction options for [`LayeredStore`].
#[derive(Debug, Clone, PartialEq)]
pub struct LayeredOptions {
    /// Back-tier table name (letters, digits, underscores).
    pub table: String,
    /// Front-tier capacity in entries.
    pub cache_size: usize,
    pub persist_interval: Duration,
    pub cleanup_interval: Duration,
}

impl Default for LayeredOptions {
    fn default() -> Self {
        Self {
            table: DEFAULT_TABLE.to_string(),
            cache_size: DEFAULT_CAPACITY,
            persist_interval: DEFAULT_PERSIST_INTERVAL,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
        }
    }
}

/// Pending upserts (`Some`) and deletes (`None`) of the running flush.
type Inflight = HashMap<String, Option<Entry>>;

/// What the front tier knows about a key.
enum Resident {
    /// The key's state is decided without the back tier.
    Known(Option<Entry>),
    /// Only the back tier can answer.
    Unknown,
}

impl Resident {
    fn known(entry: &Entry) -> Self {
        Self::Known((!entry.is_expired()).then(|| entry.clone()))
    }
}

/// Outcome of a read-modify-write step.
enum Change {
    Keep,
    Put(Entry),
    Delete,
}

struct State {
    back: BackTable,
    tombstones: RwLock<HashSet<String>>,
    dirty: RwLock<HashMap<String, DirtyEntry>>,
    inflight: RwLock<Inflight>,
    cache: RwLock<LruCache<String, Entry>>,
    epoch: AtomicU64,
    /// Serializes flushes with each other and with `clear`.
    flush_lock: tokio::sync::Mutex<()>,
}

/// Borrowed view of the four front tiers, however they are locked.
struct Tiers<'a> {
    tombstones: &'a HashSet<String>,
    dirty: &'a HashMap<String, DirtyEntry>,
    inflight: &'a Inflight,
    cache: &'a LruCache<String, Entry>,
}

impl Tiers<'_> {
    fn peek(&self, key: &str) -> Resident {
        if self.tombstones.contains(key) {
            return Resident::Known(None);
        }
        if let Some(dirty) = self.dirty.get(key) {
            return Resident::known(&dirty.entry);
        }
        if let Some(pending) = self.inflight.get(key) {
            return pending.as_ref().map_or(Resident::Known(None), Resident::known);
        }
        self.cache.peek(key).map_or(Resident::Unknown, Resident::known)
    }

    /// Every key the front tier holds state for, tombstoned ones included.
    fn resident_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.cache.iter().map(|(k, _)| k.clone()).collect();
        keys.extend(self.dirty.keys().cloned());
        keys.extend(self.inflight.keys().cloned());
        keys.extend(self.tombstones.iter().cloned());
        keys
    }
}

/// All front-tier locks, shared, acquired in order.
struct Shared<'a> {
    tombstones: RwLockReadGuard<'a, HashSet<String>>,
    dirty: RwLockReadGuard<'a, HashMap<String, DirtyEntry>>,
    inflight: RwLockReadGuard<'a, Inflight>,
    cache: RwLockReadGuard<'a, LruCache<String, Entry>>,
}

impl Shared<'_> {
    fn tiers(&self) -> Tiers<'_> {
        Tiers {
            tombstones: &self.tombstones,
            dirty: &self.dirty,
            inflight: &self.inflight,
            cache: &self.cache,
        }
    }
}

/// All front-tier locks, exclusive, acquired in order.
struct Locked<'a> {
    tombstones: RwLockWriteGuard<'a, HashSet<String>>,
    dirty: RwLockWriteGuard<'a, HashMap<String, DirtyEntry>>,
    inflight: RwLockWriteGuard<'a, Inflight>,
    cache: RwLockWriteGuard<'a, LruCache<String, Entry>>,
}

impl Locked<'_> {
    fn tiers(&self) -> Tiers<'_> {
        Tiers {
            tombstones: &self.tombstones,
            dirty: &self.dirty,
            inflight: &self.inflight,
            cache: &self.cache,
        }
    }

    fn peek(&self, key: &str) -> Resident {
        self.tiers().peek(key)
    }

    /// Like `peek`, but marks the key as recently used.
    fn resolve(&mut self, key: &str) -> Resident {
        let _ = self.cache.get(key);
        self.peek(key)
    }

    fn put(&mut self, key: &str, entry: Entry) {
        self.tombstones.remove(key);
        self.dirty.insert(
            key.to_string(),
            DirtyEntry {
                entry: entry.clone(),
                updated_at: Utc::now(),
            },
        );
        self.cache.put(key.to_string(), entry);
    }

    fn remove(&mut self, key: &str) {
        self.cache.pop(key);
        self.dirty.remove(key);
        self.tombstones.insert(key.to_string());
    }

    fn resident_keys(&self) -> Vec<String> {
        self.tiers().resident_keys()
    }
}

impl State {
    fn share(&self) -> Shared<'_> {
        let tombstones = self.tombstones.read();
        let dirty = self.dirty.read();
        let inflight = self.inflight.read();
        let cache = self.cache.read();
        Shared {
            tombstones,
            dirty,
            inflight,
            cache,
        }
    }

    fn lock(&self) -> Locked<'_> {
        let tombstones = self.tombstones.write();
        let dirty = self.dirty.write();
        let inflight = self.inflight.write();
        let cache = self.cache.write();
        Locked {
            tombstones,
            dirty,
            inflight,
            cache,
        }
    }

    fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    fn bump_epoch(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }

    /// Answers from the front tier under shared locks. A hit marks the key
    /// as recently used unless another thread holds the LRU.
    fn lookup(&self, key: &str) -> Resident {
        let found = self.share().tiers().peek(key);
        if matches!(found, Resident::Known(_))
            && let Some(mut cache) = self.cache.try_write()
        {
            cache.promote(key);
        }
        found
    }

    async fn read(&self, key: &str) -> Result<Option<Entry>> {
        loop {
            let epoch = {
                if let Resident::Known(entry) = self.lookup(key) {
                    return Ok(entry);
                }
                self.epoch()
            };

            let loaded = self.back.load(key).await?;

            let mut locked = self.lock();
            match locked.resolve(key) {
                Resident::Known(entry) => return Ok(entry),
                Resident::Unknown if self.epoch() == epoch => {
                    if let Some(entry) = &loaded {
                        locked.cache.put(key.to_string(), entry.clone());
                    }
                    return Ok(loaded);
                },
                Resident::Unknown => {},
            }
        }
    }

    /// Runs `f` against the current state of `key` under the front-tier
    /// locks, loading it from the back tier first when needed.
    async fn mutate<T>(
        &self,
        key: &str,
        f: impl FnOnce(Option<Entry>) -> Result<(Change, T)>,
    ) -> Result<T> {
        let mut loaded: Option<(u64, Option<Entry>)> = None;
        loop {
            let epoch = {
                let mut locked = self.lock();
                let current = match (locked.resolve(key), &loaded) {
                    (Resident::Known(entry), _) => Some(entry),
                    (Resident::Unknown, Some((epoch, row))) if *epoch == self.epoch() => {
                        if let Some(entry) = row {
                            locked.cache.put(key.to_string(), entry.clone());
                        }
                        Some(row.clone())
                    },
                    (Resident::Unknown, _) => None,
                };
                if let Some(current) = current {
                    let (change, out) = f(current)?;
                    match change {
                        Change::Keep => {},
                        Change::Put(entry) => locked.put(key, entry),
                        Change::Delete => locked.remove(key),
                    }
                    return Ok(out);
                }
                self.epoch()
            };
            loaded = Some((epoch, self.back.load(key).await?));
        }
    }

    async fn apply(&self, key: &str, mutation: Mutation) -> Result<Outcome> {
        self.mutate(key, |current| {
            let expires_at = current.as_ref().and_then(|e| e.expires_at);
            let applied = mutation.apply(key, current.as_ref().map(|e| &e.body))?;
            let change = match applied.body {
                Some(body) => Change::Put(Entry { body, expires_at }),
                None => Change::Keep,
            };
            Ok((change, applied.outcome))
        })
        .await
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        loop {
            let epoch = self.epoch();
            let stored = self.back.live_keys(Some(prefix)).await?;

            let mut locked = self.lock();
            if self.epoch() != epoch {
                continue;
            }
            let mut matched: HashSet<String> = stored.into_iter().collect();
            matched.extend(
                locked
                    .resident_keys()
                    .into_iter()
                    .filter(|k| k.starts_with(prefix)),
            );
            for key in &matched {
                locked.remove(key);
            }
            return Ok(matched.len());
        }
    }

    async fn keys(&self) -> Result<Vec<String>> {
        loop {
            let epoch = self.epoch();
            let stored: HashSet<String> = self.back.live_keys(None).await?.into_iter().collect();

            let shared = self.share();
            if self.epoch() != epoch {
                continue;
            }
            let tiers = shared.tiers();
            let mut candidates = stored.clone();
            candidates.extend(tiers.resident_keys());
            return Ok(candidates
                .into_iter()
                .filter(|key| match tiers.peek(key) {
                    Resident::Known(entry) => entry.is_some(),
                    Resident::Unknown => stored.contains(key),
                })
                .collect());
        }
    }

    async fn clear(&self) -> Result<()> {
        let _flushing = self.flush_lock.lock().await;
        self.back.clear().await?;
        let mut locked = self.lock();
        locked.tombstones.clear();
        locked.dirty.clear();
        locked.inflight.clear();
        locked.cache.clear();
        self.bump_epoch();
        Ok(())
    }

    /// Persists the current dirty map and tombstones in one transaction.
    ///
    /// On failure the snapshot is merged back for keys that have not been
    /// written again since, and the error is returned.
    async fn flush(&self) -> Result<usize> {
        let _flushing = self.flush_lock.lock().await;

        let (upserts, deletes) = {
            let mut locked = self.lock();
            let deletes: Vec<String> = std::mem::take(&mut *locked.tombstones).into_iter().collect();
            let upserts: Vec<(String, DirtyEntry)> =
                std::mem::take(&mut *locked.dirty).into_iter().collect();
            for key in &deletes {
                locked.inflight.insert(key.clone(), None);
            }
            for (key, dirty) in &upserts {
                locked.inflight.insert(key.clone(), Some(dirty.entry.clone()));
            }
            (upserts, deletes)
        };
        let total = upserts.len() + deletes.len();
        if total == 0 {
            return Ok(0);
        }

        let result = self.back.write(&upserts, &deletes).await;

        let mut locked = self.lock();
        locked.inflight.clear();
        match result {
            Ok(()) => {
                self.bump_epoch();
                Ok(total)
            },
            Err(e) => {
                for (key, dirty) in upserts {
                    if !locked.dirty.contains_key(&key) && !locked.tombstones.contains(&key) {
                        locked.dirty.insert(key, dirty);
                    }
                }
                for key in deletes {
                    if !locked.dirty.contains_key(&key) && !locked.tombstones.contains(&key) {
                        locked.tombstones.insert(key);
                    }
                }
                Err(Error::backend(e))
            },
        }
    }

    async fn cleanup_expired(&self) -> Result<usize> {
        let removed = self.back.delete_expired().await?;
        let mut cache = self.cache.write();
        let expired: Vec<String> = cache
            .iter()
            .filter(|(_, e)| e.is_expired())
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            cache.pop(key);
        }
        Ok(removed)
    }

    fn pending(&self) -> usize {
        let shared = self.share();
        shared.tombstones.len() + shared.dirty.len()
    }
}

/// Layered store backend (`xun`).
///
/// Bounded LRU in front of a SQL table, with write-behind persistence and
/// periodic expiry cleanup run by a background worker. [`close`] performs
/// a final flush before returning.
///
/// Writes accepted after the last successful flush are lost if the process
/// dies before the next one.
///
/// [`close`]: StoreBackend::close
pub struct LayeredStore {
    state: Arc<State>,
    worker: Worker,
}

impl LayeredStore {
    /// Opens the store on `db`, creating the table if needed, and starts the
    /// background worker.
    ///
    /// # Errors
    ///
    /// Returns `Config` for an invalid table name and `Backend` if the table
    /// cannot be created.
    pub async fn open(db: Arc<dyn SqlBackend>, options: LayeredOptions) -> Result<Self> {
        let back = BackTable::new(db, &options.table).map_err(|e| Error::config(e.to_string()))?;
        back.ensure_schema().await?;

        let capacity = NonZeroUsize::new(options.cache_size).unwrap_or(NonZeroUsize::MIN);
        let state = Arc::new(State {
            back,
            tombstones: RwLock::new(HashSet::new()),
            dirty: RwLock::new(HashMap::new()),
            inflight: RwLock::new(HashMap::new()),
            cache: RwLock::new(LruCache::new(capacity)),
            epoch: AtomicU64::new(0),
            flush_lock: tokio::sync::Mutex::new(()),
        });
        let worker = Worker::spawn(
            state.clone(),
            options.persist_interval,
            options.cleanup_interval,
        );

        info!(
            table = %options.table,
            cache_size = capacity.get(),
            persist_interval = ?options.persist_interval,
            cleanup_interval = ?options.cleanup_interval,
            "Opened layered store"
        );
        Ok(Self { state, worker })
    }

    /// Back-tier table name.
    pub fn table(&self) -> &str {
        self.state.back.name()
    }

    /// Number of writes and deletes waiting for the next flush.
    pub fn pending(&self) -> usize {
        self.state.pending()
    }

    /// Persists pending writes now. Returns how many keys were written.
    ///
    /// # Errors
    ///
    /// Returns `Backend` if the transaction fails; the writes stay pending.
    pub async fn flush(&self) -> Result<usize> {
        self.state.flush().await
    }

    /// Deletes expired rows and front-tier entries now.
    ///
    /// # Errors
    ///
    /// Returns `Backend` if the delete fails.
    pub async fn cleanup_expired(&self) -> Result<usize> {
        self.state.cleanup_expired().await
    }
}

#[async_trait]
impl StoreBackend for LayeredStore {
    fn kind(&self) -> &'static str {
        "xun"
    }

    async fn get(&self, key: &str) -> Result<Option<Body>> {
        Ok(self.state.read(key).await?.map(|e| e.body))
    }

    async fn set(&self, key: &str, value: Body, ttl: Option<Duration>) -> Result<()> {
        self.state.lock().put(key, Entry::new(value, ttl));
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        match wildcard_prefix(key) {
            Some(prefix) => {
                let removed = self.state.delete_prefix(prefix).await?;
                debug!(prefix, removed, "Deleted keys by prefix");
            },
            None => self.state.lock().remove(key),
        }
        Ok(())
    }

    async fn get_del(&self, key: &str) -> Result<Option<Body>> {
        self.state
            .mutate(key, |current| {
                Ok(match current {
                    Some(entry) => (Change::Delete, Some(entry.body)),
                    None => (Change::Keep, None),
                })
            })
            .await
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.state.keys().await?.len())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        self.state.keys().await
    }

    async fn clear(&self) -> Result<()> {
        self.state.clear().await
    }

    async fn incr(&self, key: &str, delta: i64) -> Result<i64> {
        self.state
            .apply(key, Mutation::Incr(delta))
            .await?
            .into_int()
    }

    async fn set_multi(&self, values: Vec<(String, Body)>, ttl: Option<Duration>) -> Result<()> {
        let mut locked = self.state.lock();
        for (key, body) in values {
            locked.put(&key, Entry::new(body, ttl));
        }
        Ok(())
    }

    async fn push(&self, key: &str, values: Vec<Value>) -> Result<usize> {
        self.state
            .apply(key, Mutation::Push(values))
            .await?
            .into_count()
    }

    async fn pop(&self, key: &str, from: PopFrom) -> Result<Value> {
        self.state
            .apply(key, Mutation::Pop(from))
            .await?
            .into_value()
    }

    async fn pull(&self, key: &str, value: &Value) -> Result<usize> {
        self.state
            .apply(key, Mutation::Pull(value.clone()))
            .await?
            .into_count()
    }

    async fn pull_all(&self, key: &str, values: &[Value]) -> Result<usize> {
        self.state
            .apply(key, Mutation::PullAll(values.to_vec()))
            .await?
            .into_count()
    }

    async fn add_to_set(&self, key: &str, values: Vec<Value>) -> Result<usize> {
        self.state
            .apply(key, Mutation::AddToSet(values))
            .await?
            .into_count()
    }

    async fn array_set(&self, key: &str, index: usize, value: Value) -> Result<()> {
        self.state
            .apply(key, Mutation::ArraySet(index, value))
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let result = self.worker.shutdown().await;
        match &result {
            Ok(()) => info!(table = %self.table(), "Closed layered store"),
            Err(e) => error!(
                table = %self.table(),
                pending = self.pending(),
                error = %e,
                "Final flush failed; pending writes are lost"
            ),
        }
        result
    }
}
