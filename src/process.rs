//! Process handlers: `stores.<name>.<Method>` over JSON arguments.
//!
//! ```text
//! stores.cache.Set   ["k", "v", 60]     -> null
//! stores.cache.Get   ["k"]              -> "v"
//! stores.queue.Push  ["L", 1, 2, 3]     -> 3
//! ```
//!
//! Method names are case-insensitive. TTLs are seconds. JSON arrays passed
//! as a `Set` value become lists; bytes travel as `{"$bytes": "<hex>"}`.

use std::str::FromStr;
use std::time::Duration;

use serde_json::Value as Json;

use crate::error::{Error, Result};
use crate::registry::Registry;
use crate::store::Store;
use crate::value::{Body, Value};

const GROUP: &str = "stores.";

/// Store methods reachable as processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Set,
    Has,
    Del,
    GetDel,
    GetMulti,
    SetMulti,
    DelMulti,
    Len,
    Keys,
    Clear,
    Incr,
    Decr,
    Push,
    Pop,
    Pull,
    PullAll,
    AddToSet,
    ArrayLen,
    ArrayGet,
    ArraySet,
    ArraySlice,
    ArrayPage,
    ArrayAll,
}

impl FromStr for Method {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "get" => Self::Get,
            "set" => Self::Set,
            "has" => Self::Has,
            "del" => Self::Del,
            "getdel" => Self::GetDel,
            "getmulti" => Self::GetMulti,
            "setmulti" => Self::SetMulti,
            "delmulti" => Self::DelMulti,
            "len" => Self::Len,
            "keys" => Self::Keys,
            "clear" => Self::Clear,
            "incr" => Self::Incr,
            "decr" => Self::Decr,
            "push" => Self::Push,
            "pop" => Self::Pop,
            "pull" => Self::Pull,
            "pullall" => Self::PullAll,
            "addtoset" => Self::AddToSet,
            "arraylen" => Self::ArrayLen,
            "arrayget" => Self::ArrayGet,
            "arrayset" => Self::ArraySet,
            "arrayslice" => Self::ArraySlice,
            "arraypage" => Self::ArrayPage,
            "arrayall" => Self::ArrayAll,
            _ => return Err(Error::invalid_argument(format!("unknown store method '{s}'"))),
        })
    }
}

/// Splits `stores.<name>.<Method>` into the store name and method.
///
/// # Errors
///
/// Returns `InvalidArgument` for other process names or unknown methods.
pub fn parse(process: &str) -> Result<(&str, Method)> {
    let rest = process
        .get(..GROUP.len())
        .filter(|group| group.eq_ignore_ascii_case(GROUP))
        .and_then(|_| process.get(GROUP.len()..))
        .ok_or_else(|| {
            Error::invalid_argument(format!("'{process}' is not a stores.<name>.<Method> process"))
        })?;
    let (name, method) = rest
        .rsplit_once('.')
        .filter(|(name, _)| !name.is_empty())
        .ok_or_else(|| Error::invalid_argument(format!("'{process}' names no store method")))?;
    Ok((name, method.parse()?))
}

/// Runs one process against the registry.
///
/// # Errors
///
/// Returns the store error, `Config` for an unknown store, or
/// `InvalidArgument` for malformed arguments.
pub async fn call(registry: &Registry, process: &str, args: &[Json]) -> Result<Json> {
    let (name, method) = parse(process)?;
    let store = registry.select(name)?;
    dispatch(&store, method, &Args(args)).await
}

/// Runs one method against a store.
///
/// # Errors
///
/// Same as [`call`].
pub async fn dispatch(store: &Store, method: Method, args: &Args<'_>) -> Result<Json> {
    match method {
        Method::Get => Ok(body_or_null(store.get(&args.key(0)?).await?)),
        Method::Set => {
            store.set(&args.key(0)?, args.body(1)?, args.ttl(2)?).await?;
            Ok(Json::Null)
        },
        Method::Has => Ok(Json::Bool(store.has(&args.key(0)?).await?)),
        Method::Del => {
            store.del(&args.key(0)?).await?;
            Ok(Json::Null)
        },
        Method::GetDel => Ok(body_or_null(store.get_del(&args.key(0)?).await?)),
        Method::GetMulti => {
            let found = store.get_multi(&args.keys(0)?).await?;
            Ok(Json::Object(
                found.into_iter().map(|(k, b)| (k, b.to_json())).collect(),
            ))
        },
        Method::SetMulti => {
            let Some(Json::Object(map)) = args.get(0) else {
                return Err(Error::invalid_argument("SetMulti expects an object of key/value pairs"));
            };
            let values = map
                .iter()
                .map(|(k, v)| (k.clone(), Body::from_json(v.clone())))
                .collect();
            store.set_multi(values, args.ttl(1)?).await?;
            Ok(Json::Null)
        },
        Method::DelMulti => {
            store.del_multi(&args.keys(0)?).await?;
            Ok(Json::Null)
        },
        Method::Len => Ok(Json::from(store.len().await?)),
        Method::Keys => Ok(Json::from(store.keys().await?)),
        Method::Clear => {
            store.clear().await?;
            Ok(Json::Null)
        },
        Method::Incr => Ok(Json::from(store.incr(&args.key(0)?, args.int_or(1, 1)?).await?)),
        Method::Decr => Ok(Json::from(store.decr(&args.key(0)?, args.int_or(1, 1)?).await?)),
        Method::Push => Ok(Json::from(store.push(&args.key(0)?, args.rest(1)).await?)),
        Method::Pop => Ok(store.pop(&args.key(0)?, args.int_or(1, 1)?).await?.to_json()),
        Method::Pull => Ok(Json::from(store.pull(&args.key(0)?, &args.value(1)?).await?)),
        Method::PullAll => {
            let values = match args.get(1) {
                Some(Json::Array(items)) if args.0.len() == 2 => {
                    items.iter().cloned().map(Value::from_json).collect()
                },
                _ => args.rest(1),
            };
            Ok(Json::from(store.pull_all(&args.key(0)?, &values).await?))
        },
        Method::AddToSet => Ok(Json::from(store.add_to_set(&args.key(0)?, args.rest(1)).await?)),
        Method::ArrayLen => Ok(Json::from(store.array_len(&args.key(0)?).await?)),
        Method::ArrayGet => {
            let key = args.key(0)?;
            Ok(store.array_get(&key, args.count(1, "index")?).await?.to_json())
        },
        Method::ArraySet => {
            let key = args.key(0)?;
            store
                .array_set(&key, args.count(1, "index")?, args.value(2)?)
                .await?;
            Ok(Json::Null)
        },
        Method::ArraySlice => {
            let key = args.key(0)?;
            let items = store
                .array_slice(&key, args.count(1, "skip")?, args.count(2, "limit")?)
                .await?;
            Ok(list_json(&items))
        },
        Method::ArrayPage => {
            let key = args.key(0)?;
            let items = store
                .array_page(&key, args.count(1, "page")?, args.count(2, "page size")?)
                .await?;
            Ok(list_json(&items))
        },
        Method::ArrayAll => Ok(list_json(&store.array_all(&args.key(0)?).await?)),
    }
}

fn body_or_null(body: Option<Body>) -> Json {
    body.map_or(Json::Null, |b| b.to_json())
}

fn list_json(items: &[Value]) -> Json {
    Json::Array(items.iter().map(Value::to_json).collect())
}

/// Positional JSON arguments.
#[derive(Debug, Clone, Copy)]
pub struct Args<'a>(pub &'a [Json]);

impl Args<'_> {
    /// Argument `i`, treating `null` as absent.
    fn get(&self, i: usize) -> Option<&Json> {
        self.0.get(i).filter(|v| !v.is_null())
    }

    fn required(&self, i: usize, name: &str) -> Result<&Json> {
        self.get(i)
            .ok_or_else(|| Error::invalid_argument(format!("missing argument {i} ({name})")))
    }

    fn key(&self, i: usize) -> Result<String> {
        match self.required(i, "key")? {
            Json::String(key) => Ok(key.clone()),
            other => Err(Error::invalid_argument(format!(
                "key must be a string, got {other}"
            ))),
        }
    }

    fn keys(&self, i: usize) -> Result<Vec<String>> {
        let Json::Array(items) = self.required(i, "keys")? else {
            return Err(Error::invalid_argument("keys must be an array of strings"));
        };
        items
            .iter()
            .map(|item| match item {
                Json::String(key) => Ok(key.clone()),
                other => Err(Error::invalid_argument(format!(
                    "key must be a string, got {other}"
                ))),
            })
            .collect()
    }

    /// A value argument; explicit `null` is a value here.
    fn raw(&self, i: usize) -> Result<Json> {
        self.0
            .get(i)
            .cloned()
            .ok_or_else(|| Error::invalid_argument(format!("missing argument {i} (value)")))
    }

    fn value(&self, i: usize) -> Result<Value> {
        self.raw(i).map(Value::from_json)
    }

    fn body(&self, i: usize) -> Result<Body> {
        self.raw(i).map(Body::from_json)
    }

    fn rest(&self, from: usize) -> Vec<Value> {
        self.0
            .iter()
            .skip(from)
            .cloned()
            .map(Value::from_json)
            .collect()
    }

    fn ttl(&self, i: usize) -> Result<Option<Duration>> {
        let Some(ttl) = self.get(i) else {
            return Ok(None);
        };
        let seconds = ttl
            .as_f64()
            .filter(|s| s.is_finite() && *s >= 0.0)
            .ok_or_else(|| Error::invalid_argument(format!("ttl must be non-negative seconds, got {ttl}")))?;
        Ok(Duration::try_from_secs_f64(seconds).ok())
    }

    fn int_or(&self, i: usize, default: i64) -> Result<i64> {
        match self.get(i) {
            None => Ok(default),
            Some(n) => n
                .as_i64()
                .ok_or_else(|| Error::invalid_argument(format!("expected an integer, got {n}"))),
        }
    }

    /// A non-negative integer argument.
    fn count(&self, i: usize, name: &str) -> Result<usize> {
        let n = self.required(i, name)?;
        n.as_u64()
            .and_then(|n| usize::try_from(n).ok())
            .ok_or_else(|| {
                Error::invalid_argument(format!("{name} must be a non-negative integer, got {n}"))
            })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    async fn registry() -> Registry {
        let registry = Registry::new(std::env::temp_dir());
        registry
            .load("cache", &crate::config::Descriptor::new(crate::config::StoreType::Lru))
            .await
            .unwrap();
        registry
    }

    async fn run(registry: &Registry, process: &str, args: Json) -> Result<Json> {
        let Json::Array(args) = args else {
            panic!("args must be an array");
        };
        call(registry, process, &args).await
    }

    #[test]
    fn test_parse_process_names() {
        assert_eq!(parse("stores.cache.Get").unwrap(), ("cache", Method::Get));
        assert_eq!(parse("Stores.cache.arraypage").unwrap(), ("cache", Method::ArrayPage));
        assert_eq!(parse("stores.a.b.Keys").unwrap(), ("a.b", Method::Keys));
        assert!(parse("models.cache.Get").is_err());
        assert!(parse("stores.Get").is_err());
        assert!(parse("stores.cache.Frobnicate").is_err());
        assert!(parse("st").is_err());
    }

    #[tokio::test]
    async fn test_kv_round_trip() {
        let registry = registry().await;
        run(&registry, "stores.cache.Set", json!(["k", {"a": 1}, 0])).await.unwrap();
        assert_eq!(
            run(&registry, "stores.cache.Get", json!(["k"])).await.unwrap(),
            json!({"a": 1})
        );
        assert_eq!(run(&registry, "stores.cache.has", json!(["k"])).await.unwrap(), json!(true));
        assert_eq!(run(&registry, "stores.cache.Len", json!([])).await.unwrap(), json!(1));
        assert_eq!(run(&registry, "stores.cache.GetDel", json!(["k"])).await.unwrap(), json!({"a": 1}));
        assert_eq!(run(&registry, "stores.cache.Get", json!(["k"])).await.unwrap(), Json::Null);
    }

    #[tokio::test]
    async fn test_list_methods() {
        let registry = registry().await;
        assert_eq!(
            run(&registry, "stores.cache.Push", json!(["L", "a", "b", "c"])).await.unwrap(),
            json!(3)
        );
        assert_eq!(run(&registry, "stores.cache.Pop", json!(["L", -1])).await.unwrap(), json!("a"));
        assert_eq!(
            run(&registry, "stores.cache.ArrayPage", json!(["L", 1, 1])).await.unwrap(),
            json!(["b"])
        );
        assert_eq!(
            run(&registry, "stores.cache.PullAll", json!(["L", ["b", "c"]])).await.unwrap(),
            json!(2)
        );
        assert_eq!(run(&registry, "stores.cache.ArrayAll", json!(["L"])).await.unwrap(), json!([]));
    }

    #[tokio::test]
    async fn test_set_array_becomes_list() {
        let registry = registry().await;
        run(&registry, "stores.cache.Set", json!(["L", [1, 2]])).await.unwrap();
        assert_eq!(run(&registry, "stores.cache.ArrayLen", json!(["L"])).await.unwrap(), json!(2));
    }

    #[tokio::test]
    async fn test_multi_methods() {
        let registry = registry().await;
        run(&registry, "stores.cache.SetMulti", json!([{"a": 1, "b": "x"}]))
            .await
            .unwrap();
        assert_eq!(
            run(&registry, "stores.cache.GetMulti", json!([["a", "b", "c"]])).await.unwrap(),
            json!({"a": 1, "b": "x"})
        );
        run(&registry, "stores.cache.DelMulti", json!([["a"]])).await.unwrap();
        assert_eq!(run(&registry, "stores.cache.Keys", json!([])).await.unwrap(), json!(["b"]));
    }

    #[tokio::test]
    async fn test_counters_default_to_one() {
        let registry = registry().await;
        assert_eq!(run(&registry, "stores.cache.Incr", json!(["n"])).await.unwrap(), json!(1));
        assert_eq!(run(&registry, "stores.cache.Incr", json!(["n", 10])).await.unwrap(), json!(11));
        assert_eq!(run(&registry, "stores.cache.Decr", json!(["n"])).await.unwrap(), json!(10));
    }

    #[tokio::test]
    async fn test_argument_errors() {
        let registry = registry().await;
        assert!(matches!(
            run(&registry, "stores.cache.Get", json!([42])).await,
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            run(&registry, "stores.cache.ArrayGet", json!(["L", -1])).await,
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            run(&registry, "stores.cache.Set", json!(["k", 1, -5])).await,
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            run(&registry, "stores.missing.Get", json!(["k"])).await,
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_bytes_travel_as_hex() {
        let registry = registry().await;
        run(&registry, "stores.cache.Set", json!(["b", {"$bytes": "0102"}])).await.unwrap();
        let store = registry.select("cache").unwrap();
        assert_eq!(
            store.get("b").await.unwrap(),
            Some(Body::from(Value::Bytes(vec![1, 2])))
        );
    }
}
