//! QuickJS side of the bridge. Runs on a blocking thread.

use std::cell::RefCell;
use std::sync::Arc;
use std::time::Duration;

use rquickjs::{CatchResultExt, Context as JsContext, Ctx, Function, Object, Runtime};

use super::types::{CallReply, StoreBridge, StoreCall};

/// Job-queue turns allowed before a script counts as hung.
const MAX_PENDING_JOBS: usize = 10_000;

/// Defines `Store` on top of the native `__store_call`.
///
/// `GetSet` and `GetSetMulti` take a JS producer, so they are composed here
/// from `Get`/`Set` and `GetMulti`/`Set`. A producer that throws in
/// `GetSetMulti` leaves its key out of the result.
const PRELUDE: &str = r#"
class Store {
    constructor(name) {
        if (typeof name !== "string" || name.length === 0) {
            throw new TypeError("Store name must be a non-empty string");
        }
        this.name = name;
    }

    GetSet(key, ttl, producer) {
        var value = this.Get(key);
        if (value !== null && value !== undefined) {
            return value;
        }
        value = producer(key);
        this.Set(key, value, ttl);
        return value;
    }

    GetSetMulti(keys, ttl, producer) {
        var found = this.GetMulti(keys);
        for (var i = 0; i < keys.length; i++) {
            var key = keys[i];
            if (Object.prototype.hasOwnProperty.call(found, key)) {
                continue;
            }
            try {
                var value = producer(key);
                this.Set(key, value, ttl);
                found[key] = value;
            } catch (e) {
                // omitted from the result
            }
        }
        return found;
    }
}

[
    "Get", "Set", "Has", "Del", "GetDel", "GetMulti", "SetMulti", "DelMulti",
    "Len", "Keys", "Clear", "Incr", "Decr", "Push", "Pop", "Pull", "PullAll",
    "AddToSet", "ArrayLen", "ArrayGet", "ArraySet", "ArraySlice", "ArrayPage",
    "ArrayAll"
].forEach(function (method) {
    Store.prototype[method] = function () {
        var args = Array.prototype.slice.call(arguments);
        var reply = JSON.parse(
            __store_call("stores." + this.name + "." + method, JSON.stringify(args))
        );
        if (reply.error) {
            var err = new Error(reply.error.kind + ": " + reply.error.message);
            err.kind = reply.error.kind;
            throw err;
        }
        return reply.ok;
    };
});
"#;

thread_local! {
    static STORE_BRIDGE: RefCell<Option<Arc<StoreBridge>>> = const { RefCell::new(None) };
}

/// Clears the thread-local bridge on drop, even if a panic occurs.
struct BridgeGuard;

impl BridgeGuard {
    fn set(bridge: Arc<StoreBridge>) -> Self {
        STORE_BRIDGE.with(|cell| {
            *cell.borrow_mut() = Some(bridge);
        });
        Self
    }
}

impl Drop for BridgeGuard {
    fn drop(&mut self) {
        STORE_BRIDGE.with(|cell| {
            *cell.borrow_mut() = None;
        });
    }
}

/// Runs a preprocessed script with `Store` available (blocking).
pub(super) fn run_js(
    script: &str,
    input: &serde_json::Value,
    bridge: Arc<StoreBridge>,
) -> Result<serde_json::Value, String> {
    let _guard = BridgeGuard::set(bridge);

    let runtime = Runtime::new().map_err(|e| format!("Failed to create JS runtime: {e}"))?;
    let context =
        JsContext::full(&runtime).map_err(|e| format!("Failed to create JS context: {e}"))?;

    context.with(|ctx| {
        let store_call = Function::new(ctx.clone(), native_store_call)
            .map_err(|e| format!("Failed to create __store_call: {e}"))?;
        ctx.globals()
            .set("__store_call", store_call)
            .map_err(|e| format!("Failed to set __store_call: {e}"))?;

        ctx.eval::<(), _>(PRELUDE)
            .catch(&ctx)
            .map_err(|e| format!("Failed to define Store: {e}"))?;

        evaluate(&runtime, &ctx, script, input)
    })
}

/// Sets `input`, evaluates the script, and drains the job queue until the
/// script's outcome settles.
fn evaluate(
    runtime: &Runtime,
    ctx: &Ctx<'_>,
    script: &str,
    input: &serde_json::Value,
) -> Result<serde_json::Value, String> {
    let input_json =
        serde_json::to_string(input).map_err(|e| format!("Input is not serializable: {e}"))?;
    ctx.eval::<(), _>(format!("var input = {input_json};"))
        .catch(ctx)
        .map_err(|e| format!("Cannot bind input: {e}"))?;

    let outcome: Object<'_> = ctx
        .eval(script)
        .catch(ctx)
        .map_err(|e| format!("Script error: {e}"))?;

    for _ in 0..MAX_PENDING_JOBS {
        if outcome.get::<_, bool>("done").unwrap_or(false) {
            return settled(&outcome);
        }
        match runtime.execute_pending_job() {
            Ok(true) => {},
            Ok(false) => std::thread::sleep(Duration::from_micros(100)),
            Err(e) => return Err(format!("Pending job failed: {e:?}")),
        }
    }
    Err("Script did not settle".to_string())
}

/// Reads a settled outcome: `{ done, ok, json }` or `{ done, ok: false, error }`.
fn settled(outcome: &Object<'_>) -> Result<serde_json::Value, String> {
    if !outcome.get::<_, bool>("ok").unwrap_or(false) {
        let error = outcome
            .get::<_, String>("error")
            .unwrap_or_else(|_| "unknown error".to_string());
        return Err(format!("Script error: {error}"));
    }
    let json: String = outcome
        .get("json")
        .map_err(|e| format!("Script result is unreadable: {e}"))?;
    let value: serde_json::Value =
        serde_json::from_str(&json).map_err(|e| format!("Script result is not JSON: {e}"))?;
    Ok(integral(value))
}

/// Native `__store_call(process, argsJson)`: forwards the call to the async
/// side and blocks for the reply JSON.
#[allow(clippy::needless_pass_by_value)] // Required for rquickjs FFI
fn native_store_call(process: String, args_json: String) -> rquickjs::Result<String> {
    STORE_BRIDGE.with(|cell| {
        let bridge = cell.borrow();
        let bridge = bridge.as_ref().ok_or(rquickjs::Error::Exception)?;

        let args = match serde_json::from_str::<serde_json::Value>(&args_json) {
            Ok(serde_json::Value::Array(args)) => args,
            _ => Vec::new(),
        };

        let (reply_tx, reply_rx) = std::sync::mpsc::channel();
        bridge
            .tx
            .send(StoreCall {
                process,
                args,
                reply_tx,
            })
            .map_err(|_| rquickjs::Error::Exception)?;

        let reply: CallReply = reply_rx.recv().map_err(|_| rquickjs::Error::Exception)?;
        serde_json::to_string(&reply).map_err(|_| rquickjs::Error::Exception)
    })
}

/// `export default` forms and what they become. Order matters: the async
/// forms must be rewritten before their sync prefixes.
const EXPORT_FORMS: [(&str, &str); 4] = [
    ("export default async function", "var __main__ = async function"),
    ("export default function", "var __main__ = function"),
    ("export default async (", "var __main__ = async ("),
    ("export default (", "var __main__ = ("),
];

/// Appended to every script: runs `__main__(input)` and records its
/// outcome, sync or async, as JSON text.
const SETTLE: &str = r#"
var __outcome__ = { done: false, ok: false, json: "null", error: "" };
Promise.resolve(__main__(input)).then(
    function (value) {
        try {
            var json = JSON.stringify(value);
            __outcome__.json = json === undefined ? "null" : json;
            __outcome__.ok = true;
        } catch (e) {
            __outcome__.error = String(e);
        }
        __outcome__.done = true;
    },
    function (e) {
        __outcome__.error = e === undefined ? "undefined" : String(e);
        __outcome__.done = true;
    }
);
__outcome__;
"#;

/// Turns `export default function(input) { ... }` into a `__main__`
/// binding followed by [`SETTLE`].
pub(super) fn preprocess_script(script: &str) -> String {
    let body = EXPORT_FORMS
        .iter()
        .fold(script.to_string(), |acc, (from, to)| acc.replace(from, to));
    format!("{body}\n{SETTLE}")
}

/// JSON numbers from JS are doubles; whole ones within 2^53 come back as
/// integers so counters stay integral.
fn integral(value: serde_json::Value) -> serde_json::Value {
    use serde_json::Value as Json;
    const SAFE: f64 = 9_007_199_254_740_992.0;
    match value {
        Json::Number(n) if !n.is_i64() && !n.is_u64() => match n.as_f64() {
            #[allow(clippy::cast_possible_truncation)]
            Some(f) if f.fract() == 0.0 && f.abs() < SAFE => Json::from(f as i64),
            _ => Json::Number(n),
        },
        Json::Array(items) => Json::Array(items.into_iter().map(integral).collect()),
        Json::Object(map) => Json::Object(map.into_iter().map(|(k, v)| (k, integral(v))).collect()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    /// Runs a script without a bridge; store calls fail.
    fn run_plain(script: &str, input: &serde_json::Value) -> Result<serde_json::Value, String> {
        let runtime = Runtime::new().map_err(|e| e.to_string())?;
        let context = JsContext::full(&runtime).map_err(|e| e.to_string())?;
        context.with(|ctx| evaluate(&runtime, &ctx, &preprocess_script(script), input))
    }

    #[test]
    fn test_return_values() {
        let cases = [
            ("export default function(input) { return null; }", json!(null)),
            ("export default function(input) { return 42; }", json!(42)),
            ("export default function(input) { return 1.5; }", json!(1.5)),
            ("export default function(input) { return 2 ** 40; }", json!(1_099_511_627_776_i64)),
            ("export default function(input) { return 'hi'; }", json!("hi")),
            ("export default function(input) { return [1, 'a']; }", json!([1, "a"])),
            ("export default function(input) { return {a: {b: true}}; }", json!({"a": {"b": true}})),
        ];
        for (script, expected) in cases {
            assert_eq!(run_plain(script, &json!(null)).unwrap(), expected, "{script}");
        }
    }

    #[test]
    fn test_input_is_visible() {
        let result = run_plain(
            "export default function(input) { return input.items.map(x => x * 2); }",
            &json!({"items": [1, 2, 3]}),
        )
        .unwrap();
        assert_eq!(result, json!([2, 4, 6]));
    }

    #[test]
    fn test_async_default_resolves() {
        let result = run_plain(
            "export default async function(input) { return await Promise.resolve(input + 1); }",
            &json!(1),
        )
        .unwrap();
        assert_eq!(result, json!(2));
    }

    #[test]
    fn test_thrown_error_message_is_reported() {
        let err = run_plain(
            "export default function(input) { throw new Error('boom'); }",
            &json!(null),
        )
        .unwrap_err();
        assert!(err.contains("boom"), "{err}");
    }

    #[test]
    fn test_preprocess_wraps_default_export() {
        let out = preprocess_script("export default function(input) { return 1; }");
        assert!(out.starts_with("var __main__ = function(input)"));
        assert!(out.contains("Promise.resolve(__main__(input))"));

        let arrow = preprocess_script("export default async (input) => input;");
        assert!(arrow.starts_with("var __main__ = async (input) => input;"));
    }
}
