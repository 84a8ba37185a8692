//! `unistore script --stores <dir> <file.js> [--input <json>]` - run a
//! script through the JavaScript bridge.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;

use super::{Globals, open_registry, print_json, store_error};
use crate::bridge;

/// Execute the script command.
///
/// # Errors
///
/// Returns an error if the script cannot be read, the input is not JSON,
/// the stores cannot be loaded, or the script fails.
pub async fn execute(globals: &Globals, stores: &Path, file: &Path, input: Option<&str>) -> Result<()> {
    let source = fs::read_to_string(file)
        .with_context(|| format!("Failed to read script: {}", file.display()))?;
    let input: serde_json::Value = match input {
        Some(raw) => serde_json::from_str(raw).context("--input must be valid JSON")?,
        None => serde_json::Value::Null,
    };

    let registry = open_registry(globals, stores).await?;
    let output = bridge::run_script(&registry, &source, &input).await;
    let closed = registry.close_all().await;

    let output = output.with_context(|| format!("Script failed: {}", file.display()))?;
    closed.map_err(store_error)?;
    info!(script = %file.display(), calls = output.calls, "Script finished");
    print_json(&output.result, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_script_rejects_bad_input() {
        let root = tempfile::tempdir().unwrap();
        let file = root.path().join("main.js");
        fs::write(&file, "export default function(input) { return input; }").unwrap();

        let err = execute(&Globals::new(root.path()), root.path(), &file, Some("{oops"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("--input"), "{err}");
    }

    #[tokio::test]
    async fn test_script_runs_against_loaded_stores() {
        let root = tempfile::tempdir().unwrap();
        let stores = root.path().join("stores");
        fs::create_dir(&stores).unwrap();
        fs::write(stores.join("cache.toml"), "type = \"lru\"\n").unwrap();
        let file = root.path().join("main.js");
        fs::write(
            &file,
            r#"export default function(input) {
                const cache = new Store("cache");
                return cache.Incr("hits", input.by);
            }"#,
        )
        .unwrap();

        execute(&Globals::new(root.path()), &stores, &file, Some(r#"{"by": 3}"#))
            .await
            .unwrap();
    }
}
