//! `unistore call --stores <dir> <process> [args...]` - run one process
//! handler and print its JSON result.

use std::path::Path;

use anyhow::Result;
use serde_json::Value as Json;

use super::{Globals, open_registry, print_json, store_error};
use crate::process;

/// Parses one CLI argument: JSON if it parses, otherwise a plain string.
///
/// `unistore call stores.cache.Get user:1` and
/// `unistore call stores.cache.Get '"user:1"'` mean the same thing.
pub fn parse_arg(raw: &str) -> Json {
    serde_json::from_str(raw).unwrap_or_else(|_| Json::String(raw.to_string()))
}

/// Execute the call command.
///
/// # Errors
///
/// Returns an error if the stores cannot be loaded or the handler fails.
/// Stores are closed either way.
pub async fn execute(globals: &Globals, stores: &Path, process: &str, args: &[String]) -> Result<()> {
    let registry = open_registry(globals, stores).await?;
    let args: Vec<Json> = args.iter().map(|a| parse_arg(a)).collect();

    let result = process::call(&registry, process, &args).await;
    let closed = registry.close_all().await;

    let value = result.map_err(store_error)?;
    closed.map_err(store_error)?;
    print_json(&value, true)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use serde_json::json;

    use super::*;

    #[test]
    fn test_parse_arg() {
        assert_eq!(parse_arg("42"), json!(42));
        assert_eq!(parse_arg("[1,2]"), json!([1, 2]));
        assert_eq!(parse_arg("\"quoted\""), json!("quoted"));
        assert_eq!(parse_arg("user:1"), json!("user:1"));
        assert_eq!(parse_arg("null"), json!(null));
    }

    #[tokio::test]
    async fn test_call_persists_through_default_connector() {
        let root = tempfile::tempdir().unwrap();
        let stores = root.path().join("stores");
        fs::create_dir(&stores).unwrap();
        fs::write(stores.join("kv.json"), r#"{"type": "xun"}"#).unwrap();
        let globals = Globals::new(root.path());

        execute(&globals, &stores, "stores.kv.Set", &["greeting".into(), "hello".into()])
            .await
            .unwrap();
        assert!(root.path().join("data/stores.db").exists());

        let registry = open_registry(&globals, &stores).await.unwrap();
        let value = process::call(&registry, "stores.kv.Get", &[json!("greeting")])
            .await
            .unwrap();
        assert_eq!(value, json!("hello"));
        registry.close_all().await.unwrap();
    }

    #[tokio::test]
    async fn test_call_reports_error_kind() {
        let root = tempfile::tempdir().unwrap();
        let stores = root.path().join("stores");
        fs::create_dir(&stores).unwrap();
        fs::write(stores.join("cache.json"), r#"{"type": "lru"}"#).unwrap();

        let err = execute(&Globals::new(root.path()), &stores, "stores.cache.Pop", &["L".into()])
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("NotFound"), "{err}");
    }
}
