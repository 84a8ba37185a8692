//! JavaScript bridge.
//!
//! Scripts run in QuickJS on a blocking thread and see a `Store` class:
//!
//! ```js
//! export default function(input) {
//!     const cache = new Store("cache");
//!     cache.Set("greeting", "hello", 60);
//!     return cache.GetSet("user:" + input.id, 0, (key) => ({ id: input.id }));
//! }
//! ```
//!
//! Each method call crosses to the async runtime through an unbounded
//! channel and blocks the JS thread on a per-call reply channel. Store
//! errors become JS exceptions whose message starts with the error kind
//! (`NotFound: ...`).
//!
//! Scripts have no network, filesystem, or module access.

mod runtime;
mod types;

pub use types::ScriptOutput;

use std::sync::Arc;

use anyhow::{Result, anyhow};
use tokio::sync::mpsc;
use tracing::debug;

use self::types::{CallReply, StoreBridge, StoreCall};
use crate::process;
use crate::registry::Registry;

/// Runs `source` with `input`, resolving store names through `registry`.
///
/// # Errors
///
/// Returns an error if the script fails to parse, throws, or panics.
pub async fn run_script(
    registry: &Registry,
    source: &str,
    input: &serde_json::Value,
) -> Result<ScriptOutput> {
    let (call_tx, mut call_rx) = mpsc::unbounded_channel::<StoreCall>();
    let bridge = Arc::new(StoreBridge { tx: call_tx });

    let script = runtime::preprocess_script(source);
    let input = input.clone();
    let mut js_handle =
        tokio::task::spawn_blocking(move || runtime::run_js(&script, &input, bridge));

    let mut calls = 0usize;
    loop {
        tokio::select! {
            js_result = &mut js_handle => {
                return finish(js_result, calls);
            }
            msg = call_rx.recv() => {
                let Some(StoreCall { process, args, reply_tx }) = msg else {
                    break;
                };
                calls += 1;
                let result = process::call(registry, &process, &args).await;
                if let Err(e) = &result {
                    debug!(%process, error = %e, "Script store call failed");
                }
                let _ = reply_tx.send(CallReply::from(result));
            }
        }
    }

    finish(js_handle.await, calls)
}

fn finish(
    js_result: std::result::Result<std::result::Result<serde_json::Value, String>, tokio::task::JoinError>,
    calls: usize,
) -> Result<ScriptOutput> {
    match js_result {
        Ok(Ok(result)) => Ok(ScriptOutput { result, calls }),
        Ok(Err(e)) => Err(anyhow!(e)),
        Err(e) => Err(anyhow!("Script panicked: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::config::{Descriptor, StoreType};

    async fn registry() -> Registry {
        let registry = Registry::new(std::env::temp_dir());
        registry
            .load("cache", &Descriptor::new(StoreType::Lru))
            .await
            .unwrap();
        registry
    }

    #[tokio::test]
    async fn test_script_uses_store() {
        let registry = registry().await;
        let output = run_script(
            &registry,
            r#"export default function(input) {
                const s = new Store("cache");
                s.Set("k", input.value, 0);
                s.Push("L", "a", "b", "c");
                return { k: s.Get("k"), popped: s.Pop("L", 1), len: s.ArrayLen("L") };
            }"#,
            &json!({"value": "bar"}),
        )
        .await
        .unwrap();
        assert_eq!(output.result, json!({"k": "bar", "popped": "c", "len": 2}));
        assert_eq!(output.calls, 5);

        let store = registry.select("cache").unwrap();
        assert_eq!(store.array_len("L").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_store_errors_become_exceptions() {
        let registry = registry().await;
        let output = run_script(
            &registry,
            r#"export default function(input) {
                const s = new Store("cache");
                try {
                    s.Pop("empty", 1);
                    return "no error";
                } catch (e) {
                    return e.kind;
                }
            }"#,
            &json!(null),
        )
        .await
        .unwrap();
        assert_eq!(output.result, json!("NotFound"));
    }

    #[tokio::test]
    async fn test_get_set_calls_producer_once() {
        let registry = registry().await;
        let output = run_script(
            &registry,
            r#"export default function(input) {
                const s = new Store("cache");
                let produced = 0;
                const make = (key) => { produced += 1; return key + "!"; };
                const a = s.GetSet("x", 0, make);
                const b = s.GetSet("x", 0, make);
                const many = s.GetSetMulti(["x", "y", "bad"], 0, (key) => {
                    if (key === "bad") throw new Error("nope");
                    return key + "?";
                });
                return { a, b, produced, many };
            }"#,
            &json!(null),
        )
        .await
        .unwrap();
        assert_eq!(
            output.result,
            json!({"a": "x!", "b": "x!", "produced": 1, "many": {"x": "x!", "y": "y?"}})
        );
    }

    #[tokio::test]
    async fn test_unknown_store_is_config_error() {
        let registry = registry().await;
        let output = run_script(
            &registry,
            r#"export default function(input) {
                try { new Store("missing").Get("k"); } catch (e) { return e.message; }
            }"#,
            &json!(null),
        )
        .await
        .unwrap();
        assert!(output.result.as_str().unwrap().starts_with("Config:"));
    }

    #[tokio::test]
    async fn test_script_error_is_reported() {
        let registry = registry().await;
        let err = run_script(&registry, "export default function(input) { return nope; }", &json!(null))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Script error"));
    }
}
