//! Registry: descriptor loading, selection, replacement, and teardown.

use std::fs;
use std::sync::Arc;

use unistore::sql::SqliteBackend;
use unistore::store::{MemoryCache, MemoryCollection};
use unistore::{Body, Connector, Descriptor, Error, Registry, StoreType};

fn registry_with_connectors(root: &std::path::Path) -> Registry {
    let registry = Registry::new(root);
    registry.register_connector(
        "default",
        Connector::Sql(Arc::new(SqliteBackend::memory().unwrap())),
    );
    registry.register_connector("cache", Connector::Cache(Arc::new(MemoryCache::new())));
    registry.register_connector("docs", Connector::Document(Arc::new(MemoryCollection::new())));
    registry
}

#[tokio::test]
async fn test_load_dir_builds_every_backend() {
    let root = tempfile::tempdir().unwrap();
    let dir = root.path().join("stores");
    fs::create_dir(&dir).unwrap();
    fs::write(dir.join("lru.json"), r#"{"type": "lru", "option": {"size": 16}}"#).unwrap();
    fs::write(
        dir.join("sessions.xun.toml"),
        "type = \"xun\"\n[option]\ntable = \"sessions\"\npersist_interval = 0.5\n",
    )
    .unwrap();
    fs::write(dir.join("remote.json"), r#"{"type": "redis", "connector": "cache"}"#).unwrap();
    fs::write(dir.join("docs.json"), r#"{"type": "mongo", "connector": "docs"}"#).unwrap();
    fs::write(
        dir.join("local.toml"),
        "type = \"badger\"\n[option]\npath = \"data/local.redb\"\n",
    )
    .unwrap();
    fs::write(dir.join("README.md"), "not a descriptor").unwrap();

    let registry = registry_with_connectors(root.path());
    let names = registry.load_dir(&dir).await.unwrap();
    assert_eq!(names, vec!["docs", "local", "lru", "remote", "sessions"]);
    assert_eq!(registry.names(), names);

    let kinds: Vec<_> = names
        .iter()
        .map(|n| registry.select(n).unwrap().kind())
        .collect();
    assert_eq!(kinds, vec!["mongo", "badger", "lru", "redis", "xun"]);

    for name in &names {
        let store = registry.select(name).unwrap();
        store.set("k", "v", None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(Body::from("v")));
    }

    // Relative badger paths resolve against the registry root.
    assert!(root.path().join("data/local.redb").exists());
    registry.close_all().await.unwrap();
    assert!(registry.names().is_empty());
}

#[tokio::test]
async fn test_select_unknown_store_is_config_error() {
    let registry = Registry::new(std::env::temp_dir());
    assert!(matches!(registry.select("missing"), Err(Error::Config(_))));
}

#[tokio::test]
async fn test_reload_replaces_and_closes_previous() {
    let registry = Registry::new(std::env::temp_dir());
    let first = registry
        .load("cache", &Descriptor::new(StoreType::Lru))
        .await
        .unwrap();
    first.set("k", "old", None).await.unwrap();

    let second = registry
        .load("cache", &Descriptor::new(StoreType::Lru))
        .await
        .unwrap();
    assert!(first.is_closed());
    assert!(matches!(first.get("k").await, Err(Error::Closed)));
    assert_eq!(second.get("k").await.unwrap(), None);
    assert_eq!(registry.names(), vec!["cache"]);
}

#[tokio::test]
async fn test_failed_reload_keeps_previous_store() {
    let registry = Registry::new(std::env::temp_dir());
    let store = registry
        .load("cache", &Descriptor::new(StoreType::Lru))
        .await
        .unwrap();
    store.set("k", "kept", None).await.unwrap();

    let invalid = Descriptor::from_json(r#"{"type": "lru", "option": {"size": 0}}"#).unwrap();
    assert!(matches!(registry.load("cache", &invalid).await, Err(Error::Config(_))));

    // No SQL connector is registered, so building fails after validation.
    let unbuildable = Descriptor::new(StoreType::Xun);
    assert!(registry.load("cache", &unbuildable).await.is_err());

    let selected = registry.select("cache").unwrap();
    assert!(!selected.is_closed());
    assert_eq!(selected.get("k").await.unwrap(), Some(Body::from("kept")));
    assert_eq!(registry.names(), vec!["cache"]);
}

#[tokio::test]
async fn test_missing_or_wrong_connector() {
    let registry = Registry::new(std::env::temp_dir());

    let xun = registry.load("kv", &Descriptor::new(StoreType::Xun)).await;
    assert!(matches!(xun, Err(Error::Config(msg)) if msg.contains("'default'")));

    let redis = Descriptor::from_json(r#"{"type": "redis"}"#).unwrap();
    assert!(matches!(registry.load("r", &redis).await, Err(Error::Config(_))));

    registry.register_connector("db", Connector::Sql(Arc::new(SqliteBackend::memory().unwrap())));
    let wrong = Descriptor::from_json(r#"{"type": "redis", "connector": "db"}"#).unwrap();
    let err = registry.load("r", &wrong).await.unwrap_err();
    assert!(err.to_string().contains("expected cache"), "{err}");
    assert!(registry.names().is_empty());
}

#[tokio::test]
async fn test_xun_uses_named_sql_connector() {
    let registry = Registry::new(std::env::temp_dir());
    let db = Arc::new(SqliteBackend::memory().unwrap());
    registry.register_connector("main", Connector::Sql(db));

    let descriptor =
        Descriptor::from_json(r#"{"type": "xun", "option": {"connector": "main", "table": "kv"}}"#)
            .unwrap();
    let store = registry.load("kv", &descriptor).await.unwrap();
    store.push("L", vec!["a".into()]).await.unwrap();
    assert_eq!(store.array_len("L").await.unwrap(), 1);
    registry.unload("kv").await.unwrap();
    assert!(store.is_closed());
    assert!(!registry.unload("kv").await.unwrap());
}

#[tokio::test]
async fn test_invalid_descriptor_is_rejected() {
    let root = tempfile::tempdir().unwrap();
    fs::write(root.path().join("bad.json"), r#"{"type": "lru", "option": {"size": 0}}"#).unwrap();

    let registry = Registry::new(root.path());
    let err = registry.load_dir(root.path()).await.unwrap_err();
    assert!(matches!(err, Error::Config(_)));
    assert!(err.to_string().contains("size"), "{err}");
}

#[test]
fn test_global_registry_is_installed_once() {
    let root = tempfile::tempdir().unwrap();
    let installed = Registry::install_global(Registry::new(root.path())).unwrap();
    assert_eq!(installed.root(), root.path());
    assert!(std::ptr::eq(installed, Registry::global()));
    assert!(Registry::install_global(Registry::new(root.path())).is_err());
}
