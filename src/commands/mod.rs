//! CLI command implementations for unistore.
//!
//! - [`validate`] - Check a directory of store descriptors
//! - [`call`] - Run one `stores.<name>.<Method>` process handler
//! - [`script`] - Run a JavaScript file against the loaded stores

pub mod call;
pub mod script;
pub mod validate;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use tracing::debug;

use crate::config::DEFAULT_CONNECTOR;
use crate::error::Error;
use crate::registry::{Connector, Registry};
use crate::sql::SqliteBackend;

/// SQLite file backing the `default` connector, relative to the root.
pub const DEFAULT_SQLITE_PATH: &str = "data/stores.db";

/// Flags shared by every subcommand.
#[derive(Debug, Clone)]
pub struct Globals {
    /// Root for relative descriptor paths.
    pub root: PathBuf,
    /// SQLite file for the `default` SQL connector.
    pub sqlite: Option<PathBuf>,
    /// Redis URL registered as the `redis` cache connector.
    #[cfg(feature = "redis")]
    pub redis: Option<String>,
}

impl Globals {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            sqlite: None,
            #[cfg(feature = "redis")]
            redis: None,
        }
    }

    /// The SQLite file to open: `--sqlite` if given, else
    /// `<root>/data/stores.db`. Relative paths resolve against the root.
    pub fn sqlite_path(&self) -> PathBuf {
        let path = self
            .sqlite
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SQLITE_PATH));
        if path.is_absolute() {
            path
        } else {
            self.root.join(path)
        }
    }
}

/// Builds a registry with the CLI connectors and loads every descriptor in
/// `stores`.
///
/// # Errors
///
/// Returns an error if a connector cannot be opened or a store fails to
/// load.
pub async fn open_registry(globals: &Globals, stores: &Path) -> Result<Registry> {
    let registry = Registry::new(&globals.root);

    let sqlite_path = globals.sqlite_path();
    let db = SqliteBackend::open(&sqlite_path)
        .with_context(|| format!("Failed to open SQLite store at {}", sqlite_path.display()))?;
    registry.register_connector(DEFAULT_CONNECTOR, Connector::Sql(Arc::new(db)));

    #[cfg(feature = "redis")]
    if let Some(url) = &globals.redis {
        let cache = crate::store::cache::RedisConnector::connect(url)
            .await
            .with_context(|| format!("Failed to connect to Redis at {url}"))?;
        registry.register_connector("redis", Connector::Cache(Arc::new(cache)));
    }

    let names = registry.load_dir(stores).await.map_err(store_error)?;
    debug!(stores = ?names, dir = %stores.display(), "Loaded store descriptors");
    Ok(registry)
}

/// Lifts a store error into `anyhow`, keeping the kind code up front.
pub fn store_error(e: Error) -> anyhow::Error {
    anyhow!("{}: {e}", e.kind())
}

/// Prints a JSON value on stdout.
///
/// # Errors
///
/// Returns an error if the value cannot be serialized.
pub fn print_json(value: &serde_json::Value, pretty: bool) -> Result<()> {
    let text = if pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    println!("{text}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlite_path_resolution() {
        let mut globals = Globals::new("/srv/app");
        assert_eq!(globals.sqlite_path(), PathBuf::from("/srv/app/data/stores.db"));

        globals.sqlite = Some(PathBuf::from("state/kv.db"));
        assert_eq!(globals.sqlite_path(), PathBuf::from("/srv/app/state/kv.db"));

        globals.sqlite = Some(PathBuf::from("/var/lib/kv.db"));
        assert_eq!(globals.sqlite_path(), PathBuf::from("/var/lib/kv.db"));
    }

    #[test]
    fn test_store_error_keeps_kind() {
        let err = store_error(Error::not_found("L"));
        assert_eq!(err.to_string(), "NotFound: not found: L");
    }
}
