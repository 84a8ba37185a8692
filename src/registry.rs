//! Process-wide registry of named stores and connectors.
//!
//! Stores are built from [`Descriptor`]s. `lru` and `xun` stores need no
//! connector of their own (a `xun` store uses the SQL connector named in its
//! options, or `default`); `redis` and `mongo` stores name a connector that
//! must be registered first.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::config::{Descriptor, StoreType, store_name};
use crate::error::{Error, Result};
use crate::sql::SqlBackend;
use crate::store::{
    CacheBackend, CacheConnector, DocumentBackend, DocumentConnector, EmbeddedBackend,
    LayeredOptions, LayeredStore, MemoryBackend, Store,
};

/// A named handle to an external engine.
#[derive(Clone)]
pub enum Connector {
    /// Back tier for layered stores.
    Sql(Arc<dyn SqlBackend>),
    /// Networked cache.
    Cache(Arc<dyn CacheConnector>),
    /// Document database collection.
    Document(Arc<dyn DocumentConnector>),
}

impl Connector {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Sql(_) => "sql",
            Self::Cache(_) => "cache",
            Self::Document(_) => "document",
        }
    }
}

impl fmt::Debug for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Connector({})", self.kind())
    }
}

/// Name to store map plus the connectors stores are built from.
///
/// Tests should own a fresh `Registry`; [`Registry::global`] is for the
/// binary and the script bridge.
pub struct Registry {
    root: PathBuf,
    stores: DashMap<String, Store>,
    connectors: DashMap<String, Connector>,
}

static GLOBAL: OnceLock<Registry> = OnceLock::new();

impl Registry {
    /// Creates an empty registry resolving relative paths against `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            stores: DashMap::new(),
            connectors: DashMap::new(),
        }
    }

    /// The process-wide registry, rooted at the working directory on first
    /// use.
    pub fn global() -> &'static Self {
        GLOBAL.get_or_init(|| Self::new(std::env::current_dir().unwrap_or_default()))
    }

    /// Installs the process-wide registry. Fails if it was already set.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the global registry is already initialized.
    pub fn install_global(registry: Self) -> Result<&'static Self> {
        GLOBAL
            .set(registry)
            .map_err(|_| Error::config("global registry is already initialized"))?;
        Ok(Self::global())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Registers or replaces a connector.
    pub fn register_connector(&self, name: impl Into<String>, connector: Connector) {
        let name = name.into();
        debug!(connector = %name, kind = connector.kind(), "Registered connector");
        self.connectors.insert(name, connector);
    }

    pub fn connector(&self, name: &str) -> Option<Connector> {
        self.connectors.get(name).map(|c| c.value().clone())
    }

    fn sql(&self, name: &str) -> Result<Arc<dyn SqlBackend>> {
        match self.connector(name) {
            Some(Connector::Sql(db)) => Ok(db),
            Some(other) => Err(wrong_connector(name, "sql", &other)),
            None => Err(missing_connector(name)),
        }
    }

    fn cache(&self, name: &str) -> Result<Arc<dyn CacheConnector>> {
        match self.connector(name) {
            Some(Connector::Cache(cache)) => Ok(cache),
            Some(other) => Err(wrong_connector(name, "cache", &other)),
            None => Err(missing_connector(name)),
        }
    }

    fn document(&self, name: &str) -> Result<Arc<dyn DocumentConnector>> {
        match self.connector(name) {
            Some(Connector::Document(coll)) => Ok(coll),
            Some(other) => Err(wrong_connector(name, "document", &other)),
            None => Err(missing_connector(name)),
        }
    }

    /// Resolves a descriptor path against the root unless it is absolute.
    pub fn resolve(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    /// Builds the store described by `descriptor` and registers it as
    /// `name`. A store already loaded under `name` stays selectable until
    /// the new one is built, then is swapped out and closed. If the build
    /// fails the old store is kept.
    ///
    /// # Errors
    ///
    /// Returns `Config` for invalid descriptors or missing connectors and
    /// `Backend` if the backend cannot be opened.
    pub async fn load(&self, name: &str, descriptor: &Descriptor) -> Result<Store> {
        let report = descriptor
            .validate()
            .map_err(|e| Error::config(format!("store '{name}': {e:#}")))?;
        for warning in &report.warnings {
            warn!(store = %name, "{warning}");
        }

        let store = self.build(descriptor).await?;
        if let Some(previous) = self.stores.insert(name.to_string(), store.clone()) {
            debug!(store = %name, "Replaced loaded store");
            if let Err(e) = previous.close().await {
                warn!(store = %name, error = %e, "Failed to close replaced store");
            }
        }
        info!(store = %name, kind = store.kind(), "Loaded store");
        Ok(store)
    }

    async fn build(&self, descriptor: &Descriptor) -> Result<Store> {
        let store = match descriptor.kind {
            StoreType::Lru => match descriptor.explicit_cleanup_interval() {
                Some(every) => Store::custom(MemoryBackend::with_sweep(descriptor.capacity(), every)),
                None => Store::memory(descriptor.capacity()),
            },
            StoreType::Xun => {
                let db = self.sql(descriptor.sql_connector())?;
                let options = LayeredOptions {
                    table: descriptor.table().to_string(),
                    cache_size: descriptor.cache_size(),
                    persist_interval: descriptor.persist_interval(),
                    cleanup_interval: descriptor.cleanup_interval(),
                };
                Store::custom(LayeredStore::open(db, options).await?)
            },
            StoreType::Redis => {
                let cache = self.cache(required_connector(descriptor)?)?;
                Store::custom(CacheBackend::new(cache))
            },
            StoreType::Mongo => {
                let coll = self.document(required_connector(descriptor)?)?;
                let backend = DocumentBackend::new(coll);
                Store::custom(match descriptor.explicit_cleanup_interval() {
                    Some(every) => backend.with_sweep(every),
                    None => backend,
                })
            },
            StoreType::Badger => {
                let path = descriptor
                    .option
                    .path
                    .as_deref()
                    .ok_or_else(|| Error::config("badger stores require option.path"))?;
                let path = self.resolve(path);
                Store::custom(match descriptor.explicit_cleanup_interval() {
                    Some(every) => EmbeddedBackend::open_with_sweep(&path, every)?,
                    None => EmbeddedBackend::open(&path)?,
                })
            },
        };
        Ok(store)
    }

    /// Loads one descriptor file, named after its stem.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the file cannot be parsed or has no usable name.
    pub async fn load_file(&self, path: &Path) -> Result<(String, Store)> {
        let name = store_name(path).ok_or_else(|| {
            Error::config(format!("cannot derive a store name from {}", path.display()))
        })?;
        let descriptor = Descriptor::load_from(path).map_err(|e| Error::config(format!("{e:#}")))?;
        let store = self.load(&name, &descriptor).await?;
        Ok((name, store))
    }

    /// Loads every `.json` and `.toml` descriptor in `dir`, in file name
    /// order. Returns the loaded store names.
    ///
    /// # Errors
    ///
    /// Returns the first load error; stores loaded before it stay loaded.
    pub async fn load_dir(&self, dir: &Path) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for path in descriptor_files(dir)? {
            let (name, _) = self.load_file(&path).await?;
            names.push(name);
        }
        Ok(names)
    }

    /// Looks up a loaded store.
    ///
    /// # Errors
    ///
    /// Returns `Config` if no store is loaded under `name`.
    pub fn select(&self, name: &str) -> Result<Store> {
        self.stores
            .get(name)
            .map(|s| s.value().clone())
            .ok_or_else(|| Error::config(format!("store '{name}' is not loaded")))
    }

    /// Names of the loaded stores, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.stores.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Closes and removes one store. Returns false if it was not loaded.
    ///
    /// # Errors
    ///
    /// Returns the store's close error.
    pub async fn unload(&self, name: &str) -> Result<bool> {
        match self.stores.remove(name) {
            Some((_, store)) => {
                store.close().await?;
                Ok(true)
            },
            None => Ok(false),
        }
    }

    /// Closes and removes every store, attempting all of them.
    ///
    /// # Errors
    ///
    /// Returns the first close error.
    pub async fn close_all(&self) -> Result<()> {
        let names = self.names();
        let mut first_error = None;
        for name in names {
            let Some((_, store)) = self.stores.remove(&name) else {
                continue;
            };
            if let Err(e) = store.close().await {
                warn!(store = %name, error = %e, "Failed to close store");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("root", &self.root)
            .field("stores", &self.names())
            .field("connectors", &self.connectors.len())
            .finish()
    }
}

fn required_connector(descriptor: &Descriptor) -> Result<&str> {
    descriptor
        .connector_name()
        .ok_or_else(|| Error::config(format!("{} stores require a connector", descriptor.kind)))
}

fn missing_connector(name: &str) -> Error {
    Error::config(format!("connector '{name}' is not registered"))
}

fn wrong_connector(name: &str, expected: &str, found: &Connector) -> Error {
    Error::config(format!(
        "connector '{name}' is a {} connector, expected {expected}",
        found.kind()
    ))
}

/// Descriptor files in `dir`, sorted by file name.
pub(crate) fn descriptor_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(dir).map_err(|e| {
        Error::config(format!("cannot read descriptor directory {}: {e}", dir.display()))
    })?;
    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.is_file()
                && matches!(
                    path.extension().and_then(|e| e.to_str()),
                    Some("json" | "toml")
                )
        })
        .collect();
    files.sort();
    Ok(files)
}
