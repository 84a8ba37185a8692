//! Redb-backed embedded storage backend.
//!
//! Bodies are stored JSON-encoded under the bare key together with their
//! expiry. Mutations run under a process-wide reader-writer lock per
//! database file and each one commits in its own redb write transaction.
//! A background sweep removes expired records.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use redb::{
    Database, ReadableDatabase, ReadableTable, ReadableTableMetadata, Table, TableDefinition,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::backend::StoreBackend;
use super::list::PopFrom;
use super::mutation::{Mutation, Outcome};
use super::sweep::Sweeper;
use super::types::{deadline, is_past};
use super::wildcard_prefix;
use crate::error::{Error, Result};
use crate::value::{Body, Value};

/// Table holding one JSON record per key.
pub(crate) const STORE_TABLE: TableDefinition<'static, &'static str, &'static [u8]> =
    TableDefinition::new("store");

type StoreTable<'txn> = Table<'txn, &'static str, &'static [u8]>;

/// Default interval between expiry sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Keys removed per write transaction by a wildcard delete.
const DELETE_BATCH: usize = 512;

#[derive(Debug, Serialize, Deserialize)]
struct Record {
    body: Body,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expired_at: Option<DateTime<Utc>>,
}

impl Record {
    fn is_expired(&self) -> bool {
        is_past(self.expired_at)
    }

    fn encode(&self) -> anyhow::Result<Vec<u8>> {
        anyhow::ensure!(self.body.is_finite(), "non-finite float cannot be encoded");
        serde_json::to_vec(self).context("Failed to serialize record to JSON")
    }

    fn decode(key: &str, bytes: &[u8]) -> anyhow::Result<Self> {
        serde_json::from_slice(bytes)
            .with_context(|| format!("Failed to deserialize record for key '{key}'"))
    }
}

fn record_expired(bytes: &[u8]) -> bool {
    serde_json::from_slice::<Record>(bytes).is_ok_and(|r| r.is_expired())
}

/// One open database file. Shared by every backend opened on the same path.
struct EmbeddedCore {
    db: Database,
    lock: RwLock<()>,
    path: PathBuf,
}

fn open_handles() -> &'static Mutex<HashMap<PathBuf, Weak<EmbeddedCore>>> {
    static HANDLES: OnceLock<Mutex<HashMap<PathBuf, Weak<EmbeddedCore>>>> = OnceLock::new();
    HANDLES.get_or_init(|| Mutex::new(HashMap::new()))
}

impl EmbeddedCore {
    fn open(path: &Path) -> anyhow::Result<Arc<Self>> {
        let path = std::path::absolute(path)
            .with_context(|| format!("Failed to resolve store path: {}", path.display()))?;

        let mut handles = open_handles().lock();
        if let Some(core) = handles.get(&path).and_then(Weak::upgrade) {
            debug!(path = %path.display(), "Reusing open embedded database");
            return Ok(core);
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create store directory: {}", parent.display())
            })?;
        }

        let db = Database::create(&path)
            .with_context(|| format!("Failed to open store database: {}", path.display()))?;

        let write_txn = db
            .begin_write()
            .context("Failed to begin initialization transaction")?;
        {
            let _table = write_txn
                .open_table(STORE_TABLE)
                .context("Failed to initialize store table")?;
        }
        write_txn
            .commit()
            .context("Failed to commit initialization transaction")?;

        info!(path = %path.display(), "Opened embedded store");
        let core = Arc::new(Self {
            db,
            lock: RwLock::new(()),
            path: path.clone(),
        });
        handles.retain(|_, weak| weak.strong_count() > 0);
        handles.insert(path, Arc::downgrade(&core));
        Ok(core)
    }

    fn read_record(&self, key: &str) -> Result<Option<Record>> {
        let _guard = self.lock.read();
        let read_txn = self
            .db
            .begin_read()
            .context("Failed to begin read transaction")?;
        let table = read_txn
            .open_table(STORE_TABLE)
            .context("Failed to open store table")?;
        let found = table
            .get(key)
            .with_context(|| format!("Failed to read key '{key}'"))?;
        match found {
            Some(guard) => Ok(Some(Record::decode(key, guard.value())?)),
            None => Ok(None),
        }
    }

    /// Runs `f` inside one write transaction under the exclusive lock.
    fn write<T>(&self, f: impl FnOnce(&mut StoreTable<'_>) -> Result<T>) -> Result<T> {
        let _guard = self.lock.write();
        let write_txn = self
            .db
            .begin_write()
            .context("Failed to begin write transaction")?;
        let value = {
            let mut table = write_txn
                .open_table(STORE_TABLE)
                .context("Failed to open store table")?;
            f(&mut table)?
        };
        write_txn
            .commit()
            .context("Failed to commit write transaction")?;
        Ok(value)
    }

    fn get_sync(&self, key: &str) -> Result<Option<Body>> {
        match self.read_record(key)? {
            Some(record) if record.is_expired() => {
                // Only remove it if nobody rewrote the key in between.
                self.write(|table| {
                    let expired = table
                        .get(key)
                        .with_context(|| format!("Failed to read key '{key}'"))?
                        .is_some_and(|g| record_expired(g.value()));
                    if expired {
                        table
                            .remove(key)
                            .with_context(|| format!("Failed to remove key '{key}'"))?;
                    }
                    Ok(())
                })?;
                Ok(None)
            },
            Some(record) => Ok(Some(record.body)),
            None => Ok(None),
        }
    }

    fn set_many_sync(&self, values: Vec<(String, Body)>, ttl: Option<Duration>) -> Result<()> {
        let expired_at = deadline(ttl);
        self.write(|table| {
            for (key, body) in values {
                let json = Record { body, expired_at }.encode()?;
                table
                    .insert(key.as_str(), json.as_slice())
                    .with_context(|| format!("Failed to insert key '{key}'"))?;
            }
            Ok(())
        })
    }

    fn delete_sync(&self, key: &str) -> Result<()> {
        self.write(|table| {
            table
                .remove(key)
                .with_context(|| format!("Failed to remove key '{key}'"))?;
            Ok(())
        })
    }

    fn delete_prefix_sync(&self, prefix: &str) -> Result<usize> {
        let mut total = 0;
        loop {
            let removed = self.write(|table| {
                let mut batch = Vec::with_capacity(DELETE_BATCH);
                for item in table
                    .range::<&str>(prefix..)
                    .context("Failed to scan store table")?
                {
                    let (key, _) = item.context("Failed to read store entry")?;
                    let key = key.value();
                    if !key.starts_with(prefix) || batch.len() == DELETE_BATCH {
                        break;
                    }
                    batch.push(key.to_string());
                }
                for key in &batch {
                    table
                        .remove(key.as_str())
                        .with_context(|| format!("Failed to remove key '{key}'"))?;
                }
                Ok(batch.len())
            })?;
            total += removed;
            if removed < DELETE_BATCH {
                return Ok(total);
            }
        }
    }

    fn take_sync(&self, key: &str) -> Result<Option<Body>> {
        self.write(|table| {
            let removed = table
                .remove(key)
                .with_context(|| format!("Failed to remove key '{key}'"))?;
            match removed {
                Some(guard) => {
                    let record = Record::decode(key, guard.value())?;
                    Ok((!record.is_expired()).then_some(record.body))
                },
                None => Ok(None),
            }
        })
    }

    fn live_keys_sync(&self) -> Result<Vec<String>> {
        let _guard = self.lock.read();
        let read_txn = self
            .db
            .begin_read()
            .context("Failed to begin read transaction")?;
        let table = read_txn
            .open_table(STORE_TABLE)
            .context("Failed to open store table")?;

        let mut keys = Vec::new();
        for item in table.iter().context("Failed to iterate store table")? {
            let (key, value) = item.context("Failed to read store entry")?;
            if !record_expired(value.value()) {
                keys.push(key.value().to_string());
            }
        }
        Ok(keys)
    }

    fn clear_sync(&self) -> Result<()> {
        self.write(|table| {
            table
                .retain(|_, _| false)
                .context("Failed to clear store table")?;
            Ok(())
        })
    }

    fn mutate_sync(&self, key: &str, mutation: Mutation) -> Result<Outcome> {
        self.write(|table| {
            let current = table
                .get(key)
                .with_context(|| format!("Failed to read key '{key}'"))?
                .map(|g| Record::decode(key, g.value()))
                .transpose()?
                .filter(|r| !r.is_expired());
            let expired_at = current.as_ref().and_then(|r| r.expired_at);
            let applied = mutation.apply(key, current.as_ref().map(|r| &r.body))?;
            if let Some(body) = applied.body {
                let json = Record { body, expired_at }.encode()?;
                table
                    .insert(key, json.as_slice())
                    .with_context(|| format!("Failed to insert key '{key}'"))?;
            }
            Ok(applied.outcome)
        })
    }

    fn cleanup_expired_sync(&self) -> Result<usize> {
        self.write(|table| {
            let before = table.len().context("Failed to count store table")?;
            table
                .retain(|_, value| !record_expired(value))
                .context("Failed to sweep store table")?;
            let after = table.len().context("Failed to count store table")?;
            Ok(usize::try_from(before.saturating_sub(after)).unwrap_or(usize::MAX))
        })
    }
}

/// Redb-backed embedded backend.
///
/// Opening the same path twice in one process shares a single database
/// handle. The handle is released when the last backend using it is dropped.
pub struct EmbeddedBackend {
    core: Arc<EmbeddedCore>,
    sweeper: Option<Sweeper>,
}

impl EmbeddedBackend {
    /// Opens or creates a database at `path` with the default sweep interval.
    ///
    /// # Errors
    ///
    /// Returns `Backend` if the directory or database cannot be created.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_sweep(path, DEFAULT_SWEEP_INTERVAL)
    }

    /// Opens or creates a database, sweeping expired records every `every`
    /// (zero disables the sweep).
    ///
    /// # Errors
    ///
    /// Returns `Backend` if the directory or database cannot be created.
    pub fn open_with_sweep<P: AsRef<Path>>(path: P, every: Duration) -> Result<Self> {
        let core = EmbeddedCore::open(path.as_ref())?;
        let weak = Arc::downgrade(&core);
        let sweeper = Sweeper::spawn("badger", every, move || {
            let weak = weak.clone();
            async move {
                let Some(core) = weak.upgrade() else {
                    return false;
                };
                let swept = tokio::task::spawn_blocking(move || core.cleanup_expired_sync()).await;
                match swept {
                    Ok(Ok(removed)) if removed > 0 => {
                        debug!(removed, "Swept expired embedded records");
                    },
                    Ok(Ok(_)) => {},
                    Ok(Err(e)) => warn!(error = %e, "Embedded sweep failed"),
                    Err(e) => warn!(error = %e, "Embedded sweep task failed"),
                }
                true
            }
        });
        Ok(Self { core, sweeper })
    }

    pub fn path(&self) -> &Path {
        &self.core.path
    }

    /// Removes expired records now. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns `Backend` if the write transaction fails.
    pub async fn cleanup_expired(&self) -> Result<usize> {
        self.blocking(|core| core.cleanup_expired_sync()).await
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&EmbeddedCore) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let core = self.core.clone();
        tokio::task::spawn_blocking(move || f(&core))
            .await
            .context("Task join error")?
    }

    async fn mutate(&self, key: &str, mutation: Mutation) -> Result<Outcome> {
        let key = key.to_string();
        self.blocking(move |core| core.mutate_sync(&key, mutation))
            .await
    }
}

#[async_trait]
impl StoreBackend for EmbeddedBackend {
    fn kind(&self) -> &'static str {
        "badger"
    }

    async fn get(&self, key: &str) -> Result<Option<Body>> {
        let key = key.to_string();
        self.blocking(move |core| core.get_sync(&key)).await
    }

    async fn set(&self, key: &str, value: Body, ttl: Option<Duration>) -> Result<()> {
        let values = vec![(key.to_string(), value)];
        self.blocking(move |core| core.set_many_sync(values, ttl))
            .await
    }

    async fn del(&self, key: &str) -> Result<()> {
        let key = key.to_string();
        self.blocking(move |core| match wildcard_prefix(&key) {
            Some(prefix) => core.delete_prefix_sync(prefix).map(|_| ()),
            None => core.delete_sync(&key),
        })
        .await
    }

    async fn get_del(&self, key: &str) -> Result<Option<Body>> {
        let key = key.to_string();
        self.blocking(move |core| core.take_sync(&key)).await
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.keys().await?.len())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        self.blocking(EmbeddedCore::live_keys_sync).await
    }

    async fn clear(&self) -> Result<()> {
        self.blocking(EmbeddedCore::clear_sync).await
    }

    async fn incr(&self, key: &str, delta: i64) -> Result<i64> {
        self.mutate(key, Mutation::Incr(delta)).await?.into_int()
    }

    /// Writes every pair in one transaction: all or nothing.
    async fn set_multi(&self, values: Vec<(String, Body)>, ttl: Option<Duration>) -> Result<()> {
        let keys: Vec<String> = values.iter().map(|(k, _)| k.clone()).collect();
        self.blocking(move |core| core.set_many_sync(values, ttl))
            .await
            .map_err(|source| Error::Partial {
                failed: keys,
                source: Box::new(source),
            })
    }

    async fn push(&self, key: &str, values: Vec<Value>) -> Result<usize> {
        self.mutate(key, Mutation::Push(values)).await?.into_count()
    }

    async fn pop(&self, key: &str, from: PopFrom) -> Result<Value> {
        self.mutate(key, Mutation::Pop(from)).await?.into_value()
    }

    async fn pull(&self, key: &str, value: &Value) -> Result<usize> {
        self.mutate(key, Mutation::Pull(value.clone()))
            .await?
            .into_count()
    }

    async fn pull_all(&self, key: &str, values: &[Value]) -> Result<usize> {
        self.mutate(key, Mutation::PullAll(values.to_vec()))
            .await?
            .into_count()
    }

    async fn add_to_set(&self, key: &str, values: Vec<Value>) -> Result<usize> {
        self.mutate(key, Mutation::AddToSet(values))
            .await?
            .into_count()
    }

    async fn array_set(&self, key: &str, index: usize, value: Value) -> Result<()> {
        self.mutate(key, Mutation::ArraySet(index, value)).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if let Some(sweeper) = &self.sweeper {
            sweeper.stop().await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> EmbeddedBackend {
        EmbeddedBackend::open_with_sweep(dir.path().join("store.redb"), Duration::ZERO).unwrap()
    }

    #[tokio::test]
    async fn test_persistence_across_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let backend = open(&dir);
            backend.set("k", Body::from("v"), None).await.unwrap();
            backend.push("L", vec![Value::from(1), Value::from(2)]).await.unwrap();
        }
        let backend = open(&dir);
        assert_eq!(backend.get("k").await.unwrap(), Some(Body::from("v")));
        assert_eq!(backend.array_len("L").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_same_path_shares_handle() {
        let dir = TempDir::new().unwrap();
        let a = open(&dir);
        let b = open(&dir);
        assert!(Arc::ptr_eq(&a.core, &b.core));
        a.set("shared", Body::from(1), None).await.unwrap();
        assert!(b.has("shared").await.unwrap());
    }

    #[tokio::test]
    async fn test_wildcard_delete_spans_batches() {
        let dir = TempDir::new().unwrap();
        let backend = open(&dir);
        let values: Vec<(String, Body)> = (0..(DELETE_BATCH + 10))
            .map(|i| (format!("user:{i:05}"), Body::from(i64::try_from(i).unwrap())))
            .collect();
        backend.set_multi(values, None).await.unwrap();
        backend.set("user", Body::from("bare"), None).await.unwrap();
        backend.set("users:x", Body::from("other"), None).await.unwrap();

        backend.del("user:*").await.unwrap();
        let mut keys = backend.keys().await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["user".to_string(), "users:x".to_string()]);
    }

    #[tokio::test]
    async fn test_expired_records_are_swept() {
        let dir = TempDir::new().unwrap();
        let backend = open(&dir);
        backend
            .set("gone", Body::from(1), Some(Duration::from_millis(10)))
            .await
            .unwrap();
        backend.set("kept", Body::from(2), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(backend.len().await.unwrap(), 1);
        assert_eq!(backend.cleanup_expired().await.unwrap(), 1);
        assert_eq!(backend.cleanup_expired().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_get_del_skips_expired() {
        let dir = TempDir::new().unwrap();
        let backend = open(&dir);
        backend
            .set("k", Body::from(1), Some(Duration::from_millis(5)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(backend.get_del("k").await.unwrap(), None);
        assert!(!backend.has("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_record_is_plain_json() {
        let dir = TempDir::new().unwrap();
        let backend = open(&dir);
        backend.set("k", Body::from("v"), None).await.unwrap();

        let read_txn = backend.core.db.begin_read().unwrap();
        let table = read_txn.open_table(STORE_TABLE).unwrap();
        let raw = table.get("k").unwrap().unwrap();
        let json: serde_json::Value = serde_json::from_slice(raw.value()).unwrap();
        assert!(json.get("body").is_some());
        assert!(json.get("expired_at").is_none());
    }
}
