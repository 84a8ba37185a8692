//! Redis-backed cache connector (feature `redis`).
//!
//! Uses one multiplexed connection shared by every call. Typed reads,
//! get-and-delete, and add-to-set run as Lua scripts so each is a single
//! atomic server-side step.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{RedisError, Script, cmd, pipe};
use tracing::info;

use super::connector::{CacheConnector, CacheError, CacheResult, CacheValue};
use crate::store::list::PopFrom;

const TYPED_GET: &str = r"
local t = redis.call('TYPE', KEYS[1])['ok']
local out
if t == 'string' then
  out = {'s', redis.call('GET', KEYS[1])}
elseif t == 'list' then
  out = redis.call('LRANGE', KEYS[1], 0, -1)
  table.insert(out, 1, 'l')
elseif t == 'none' then
  return {}
else
  return redis.error_reply('WRONGTYPE Operation against a key holding the wrong kind of value')
end
if ARGV[1] == 'del' then
  redis.call('DEL', KEYS[1])
end
return out
";

const ADD_TO_SET: &str = r"
local t = redis.call('TYPE', KEYS[1])['ok']
if t ~= 'none' and t ~= 'list' then
  return redis.error_reply('WRONGTYPE Operation against a key holding the wrong kind of value')
end
local seen = {}
for _, v in ipairs(redis.call('LRANGE', KEYS[1], 0, -1)) do
  seen[v] = true
end
local added = 0
for _, v in ipairs(ARGV) do
  if not seen[v] then
    redis.call('RPUSH', KEYS[1], v)
    seen[v] = true
    added = added + 1
  end
end
return added
";

fn map_error(err: RedisError) -> CacheError {
    if err.code() == Some("WRONGTYPE") {
        return CacheError::WrongType;
    }
    let message = err.to_string();
    if message.contains("not an integer") {
        CacheError::NotInteger
    } else if message.contains("would overflow") {
        CacheError::Overflow
    } else if message.contains("index out of range") || message.contains("no such key") {
        CacheError::OutOfRange
    } else {
        CacheError::Io(anyhow::Error::new(err))
    }
}

fn typed(reply: Vec<String>) -> Option<CacheValue> {
    let mut reply = reply.into_iter();
    match reply.next().as_deref() {
        Some("s") => reply.next().map(CacheValue::Text),
        Some("l") => Some(CacheValue::List(reply.collect())),
        _ => None,
    }
}

/// Escapes glob metacharacters so a key prefix matches literally in `SCAN`.
fn scan_pattern(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('*');
    pattern
}

fn millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// [`CacheConnector`] over a Redis server.
pub struct RedisConnector {
    conn: MultiplexedConnection,
    typed_get: Script,
    add_to_set: Script,
}

impl RedisConnector {
    /// Connects to `url` (`redis://host:port/db`).
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the server is unreachable.
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(url)
            .with_context(|| format!("Invalid redis URL: {url}"))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .with_context(|| format!("Failed to connect to redis at {url}"))?;
        info!(url, "Connected cache connector");
        Ok(Self {
            conn,
            typed_get: Script::new(TYPED_GET),
            add_to_set: Script::new(ADD_TO_SET),
        })
    }

    fn conn(&self) -> MultiplexedConnection {
        self.conn.clone()
    }
}

#[async_trait]
impl CacheConnector for RedisConnector {
    async fn get(&self, key: &str) -> CacheResult<Option<CacheValue>> {
        let reply: Vec<String> = self
            .typed_get
            .key(key)
            .arg("get")
            .invoke_async(&mut self.conn())
            .await
            .map_err(map_error)?;
        Ok(typed(reply))
    }

    async fn get_del(&self, key: &str) -> CacheResult<Option<CacheValue>> {
        let reply: Vec<String> = self
            .typed_get
            .key(key)
            .arg("del")
            .invoke_async(&mut self.conn())
            .await
            .map_err(map_error)?;
        Ok(typed(reply))
    }

    async fn set_text(&self, key: &str, value: String, ttl: Option<Duration>) -> CacheResult<()> {
        let mut set = cmd("SET");
        set.arg(key).arg(value);
        if let Some(ttl) = ttl {
            set.arg("PX").arg(millis(ttl));
        }
        set.query_async::<()>(&mut self.conn())
            .await
            .map_err(map_error)
    }

    async fn set_list(
        &self,
        key: &str,
        items: Vec<String>,
        ttl: Option<Duration>,
    ) -> CacheResult<()> {
        let mut p = pipe();
        p.atomic().cmd("DEL").arg(key).ignore();
        if !items.is_empty() {
            p.cmd("RPUSH").arg(key).arg(items).ignore();
            if let Some(ttl) = ttl {
                p.cmd("PEXPIRE").arg(key).arg(millis(ttl)).ignore();
            }
        }
        p.query_async::<()>(&mut self.conn())
            .await
            .map_err(map_error)
    }

    async fn exists(&self, key: &str) -> CacheResult<bool> {
        cmd("EXISTS")
            .arg(key)
            .query_async(&mut self.conn())
            .await
            .map_err(map_error)
    }

    async fn delete(&self, keys: &[String]) -> CacheResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        cmd("DEL")
            .arg(keys)
            .query_async::<()>(&mut self.conn())
            .await
            .map_err(map_error)
    }

    async fn scan(&self, prefix: &str, cursor: u64, count: usize) -> CacheResult<(u64, Vec<String>)> {
        cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(scan_pattern(prefix))
            .arg("COUNT")
            .arg(count)
            .query_async(&mut self.conn())
            .await
            .map_err(map_error)
    }

    async fn count(&self) -> CacheResult<usize> {
        cmd("DBSIZE")
            .query_async(&mut self.conn())
            .await
            .map_err(map_error)
    }

    async fn flush(&self) -> CacheResult<()> {
        cmd("FLUSHDB")
            .query_async::<()>(&mut self.conn())
            .await
            .map_err(map_error)
    }

    async fn incr_by(&self, key: &str, delta: i64) -> CacheResult<i64> {
        cmd("INCRBY")
            .arg(key)
            .arg(delta)
            .query_async(&mut self.conn())
            .await
            .map_err(map_error)
    }

    async fn push(&self, key: &str, items: Vec<String>) -> CacheResult<usize> {
        if items.is_empty() {
            return self.list_len(key).await;
        }
        cmd("RPUSH")
            .arg(key)
            .arg(items)
            .query_async(&mut self.conn())
            .await
            .map_err(map_error)
    }

    async fn pop(&self, key: &str, from: PopFrom) -> CacheResult<Option<String>> {
        let name = match from {
            PopFrom::Tail => "RPOP",
            PopFrom::Head => "LPOP",
        };
        cmd(name)
            .arg(key)
            .query_async(&mut self.conn())
            .await
            .map_err(map_error)
    }

    async fn remove(&self, key: &str, items: Vec<String>) -> CacheResult<usize> {
        if items.is_empty() {
            self.list_len(key).await?;
            return Ok(0);
        }
        let mut p = pipe();
        p.atomic();
        for item in items {
            p.cmd("LREM").arg(key).arg(0).arg(item);
        }
        let removed: Vec<usize> = p
            .query_async(&mut self.conn())
            .await
            .map_err(map_error)?;
        Ok(removed.into_iter().sum())
    }

    async fn add_to_set(&self, key: &str, items: Vec<String>) -> CacheResult<usize> {
        self.add_to_set
            .key(key)
            .arg(items)
            .invoke_async(&mut self.conn())
            .await
            .map_err(map_error)
    }

    async fn list_len(&self, key: &str) -> CacheResult<usize> {
        cmd("LLEN")
            .arg(key)
            .query_async(&mut self.conn())
            .await
            .map_err(map_error)
    }

    async fn list_index(&self, key: &str, index: usize) -> CacheResult<Option<String>> {
        cmd("LINDEX")
            .arg(key)
            .arg(index)
            .query_async(&mut self.conn())
            .await
            .map_err(map_error)
    }

    async fn list_set(&self, key: &str, index: usize, item: String) -> CacheResult<()> {
        cmd("LSET")
            .arg(key)
            .arg(index)
            .arg(item)
            .query_async::<()>(&mut self.conn())
            .await
            .map_err(map_error)
    }

    async fn list_range(&self, key: &str, start: usize, stop: usize) -> CacheResult<Vec<String>> {
        let stop = i64::try_from(stop).unwrap_or(-1);
        cmd("LRANGE")
            .arg(key)
            .arg(start)
            .arg(stop)
            .query_async(&mut self.conn())
            .await
            .map_err(map_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_pattern_escapes_glob() {
        assert_eq!(scan_pattern("user:1:"), "user:1:*");
        assert_eq!(scan_pattern("a*b?[c]"), "a\\*b\\?\\[c\\]*");
    }

    #[test]
    fn test_typed_reply_decoding() {
        assert_eq!(typed(vec![]), None);
        assert_eq!(
            typed(vec!["s".into(), "42".into()]),
            Some(CacheValue::Text("42".into()))
        );
        assert_eq!(
            typed(vec!["l".into(), "a".into(), "b".into()]),
            Some(CacheValue::List(vec!["a".into(), "b".into()]))
        );
        assert_eq!(typed(vec!["l".into()]), Some(CacheValue::List(vec![])));
    }
}
