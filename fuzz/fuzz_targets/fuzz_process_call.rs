//! Fuzz target for process handlers.
//!
//! Feeds arbitrary process names and JSON arguments to `process::call`
//! against an in-memory store. Every input must produce a value or a
//! typed error, never a panic.
//!
//! Run with: `cargo +nightly fuzz run fuzz_process_call`

#![no_main]

use std::sync::OnceLock;

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use unistore::process;
use unistore::{Descriptor, Registry, StoreType};

#[derive(Arbitrary, Debug)]
struct CallInput {
    method: String,
    args_json: String,
}

fn runtime() -> &'static tokio::runtime::Runtime {
    static RT: OnceLock<tokio::runtime::Runtime> = OnceLock::new();
    RT.get_or_init(|| {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
    })
}

fuzz_target!(|input: CallInput| {
    let args = match serde_json::from_str::<serde_json::Value>(&input.args_json) {
        Ok(serde_json::Value::Array(args)) => args,
        Ok(other) => vec![other],
        Err(_) => vec![serde_json::Value::String(input.args_json.clone())],
    };

    runtime().block_on(async {
        let registry = Registry::new(std::env::temp_dir());
        registry
            .load("fuzz", &Descriptor::new(StoreType::Lru))
            .await
            .unwrap();
        let _ = process::call(&registry, &format!("stores.fuzz.{}", input.method), &args).await;
        let _ = process::call(&registry, &input.method, &args).await;
        registry.close_all().await.unwrap();
    });
});
