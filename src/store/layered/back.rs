//! Durable back-tier table of the layered store.
//!
//! One row per key:
//!
//! ```text
//! (key TEXT PK, value BLOB, kind TEXT, expired_at TIMESTAMP NULL,
//!  created_at TIMESTAMP, updated_at TIMESTAMP)
//! ```
//!
//! Timestamps are RFC 3339 UTC text with millisecond precision, which
//! orders correctly as plain strings.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, SecondsFormat, Utc};
use tracing::error;

use crate::sql::{Row, SqlBackend, Value as SqlValue};
use crate::store::types::Entry;
use crate::value::{Body, Kind};

/// A write waiting for the next flush.
#[derive(Debug, Clone, PartialEq)]
pub struct DirtyEntry {
    pub entry: Entry,
    pub updated_at: DateTime<Utc>,
}

pub(crate) fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(text: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(text)
        .with_context(|| format!("Invalid timestamp '{text}'"))?
        .with_timezone(&Utc))
}

/// Checks that `name` is a plain SQL identifier.
///
/// # Errors
///
/// Returns an error for empty names or names with characters other than
/// ASCII letters, digits, and underscores (or a leading digit).
pub fn validate_table_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        bail!("table name must not be empty");
    };
    if !(first.is_ascii_alphabetic() || first == '_')
        || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        bail!("invalid table name '{name}': use letters, digits, and underscores");
    }
    Ok(())
}

/// Access to one back-tier table.
#[derive(Clone)]
pub struct BackTable {
    db: Arc<dyn SqlBackend>,
    table: String,
}

impl BackTable {
    /// # Errors
    ///
    /// Returns an error if `table` is not a plain identifier.
    pub fn new(db: Arc<dyn SqlBackend>, table: &str) -> Result<Self> {
        validate_table_name(table)?;
        Ok(Self {
            db,
            table: table.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.table
    }

    /// Creates the table and its expiry index if missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the DDL fails.
    pub async fn ensure_schema(&self) -> Result<()> {
        let t = &self.table;
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS \"{t}\" (
                key        TEXT PRIMARY KEY,
                value      BLOB,
                kind       TEXT NOT NULL,
                expired_at TIMESTAMP NULL,
                created_at TIMESTAMP NOT NULL,
                updated_at TIMESTAMP NOT NULL
            );
            CREATE INDEX IF NOT EXISTS \"{t}_expired_at\" ON \"{t}\" (expired_at);"
        );
        self.db
            .execute_batch(&ddl)
            .await
            .with_context(|| format!("Failed to create store table '{t}'"))
    }

    /// Loads a live row.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or the row cannot be decoded.
    pub async fn load(&self, key: &str) -> Result<Option<Entry>> {
        let sql = format!(
            "SELECT value, kind, expired_at FROM \"{}\" WHERE key = ?",
            self.table
        );
        let rows = self
            .db
            .query(&sql, &[SqlValue::from(key)])
            .await
            .with_context(|| format!("Failed to load key '{key}'"))?;
        match rows.first() {
            Some(row) => {
                let entry = decode_row(key, row)?;
                Ok((!entry.is_expired()).then_some(entry))
            },
            None => Ok(None),
        }
    }

    /// Keys of live rows, optionally restricted to a prefix.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn live_keys(&self, prefix: Option<&str>) -> Result<Vec<String>> {
        let now = SqlValue::from(timestamp(Utc::now()));
        let (sql, params) = match prefix {
            Some(prefix) => (
                format!(
                    "SELECT key FROM \"{}\" WHERE (expired_at IS NULL OR expired_at > ?) \
                     AND substr(key, 1, ?) = ?",
                    self.table
                ),
                vec![
                    now,
                    SqlValue::Integer(i64::try_from(prefix.chars().count()).unwrap_or(i64::MAX)),
                    SqlValue::from(prefix),
                ],
            ),
            None => (
                format!(
                    "SELECT key FROM \"{}\" WHERE expired_at IS NULL OR expired_at > ?",
                    self.table
                ),
                vec![now],
            ),
        };
        let rows = self
            .db
            .query(&sql, &params)
            .await
            .context("Failed to list store keys")?;
        rows.iter()
            .map(|row| {
                row.get("key")
                    .and_then(SqlValue::as_text)
                    .map(ToString::to_string)
                    .context("Store row without a text key")
            })
            .collect()
    }

    /// Applies a flush snapshot in one transaction. An entry that cannot be
    /// encoded is logged and its row deleted instead.
    ///
    /// # Errors
    ///
    /// Returns an error if any statement fails; nothing is applied then.
    pub async fn write(
        &self,
        upserts: &[(String, DirtyEntry)],
        deletes: &[String],
    ) -> Result<()> {
        let upsert_sql = format!(
            "INSERT INTO \"{}\" (key, value, kind, expired_at, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                kind = excluded.kind,
                expired_at = excluded.expired_at,
                updated_at = excluded.updated_at",
            self.table
        );
        let delete_sql = format!("DELETE FROM \"{}\" WHERE key = ?", self.table);

        let mut statements = Vec::with_capacity(upserts.len() + deletes.len());
        for (key, dirty) in upserts {
            let body = match dirty.entry.body.encode() {
                Ok(body) => body,
                Err(e) => {
                    // Retrying would fail the same way every tick.
                    error!(table = %self.table, key = %key, error = %e, "Dropping unencodable entry");
                    statements.push((delete_sql.clone(), vec![SqlValue::from(key.as_str())]));
                    continue;
                },
            };
            let updated = timestamp(dirty.updated_at);
            statements.push((
                upsert_sql.clone(),
                vec![
                    SqlValue::from(key.as_str()),
                    SqlValue::Blob(body),
                    SqlValue::from(dirty.entry.body.kind().as_str()),
                    SqlValue::from(dirty.entry.expires_at.map(timestamp)),
                    SqlValue::from(updated.clone()),
                    SqlValue::from(updated),
                ],
            ));
        }
        for key in deletes {
            statements.push((delete_sql.clone(), vec![SqlValue::from(key.as_str())]));
        }

        self.db
            .execute_batch_atomic(statements)
            .await
            .with_context(|| format!("Failed to persist batch to '{}'", self.table))?;
        Ok(())
    }

    /// Deletes expired rows. Returns how many.
    ///
    /// # Errors
    ///
    /// Returns an error if the statement fails.
    pub async fn delete_expired(&self) -> Result<usize> {
        let sql = format!(
            "DELETE FROM \"{}\" WHERE expired_at IS NOT NULL AND expired_at <= ?",
            self.table
        );
        self.db
            .execute(&sql, &[SqlValue::from(timestamp(Utc::now()))])
            .await
            .context("Failed to delete expired rows")
    }

    /// Deletes every row.
    ///
    /// # Errors
    ///
    /// Returns an error if the statement fails.
    pub async fn clear(&self) -> Result<()> {
        let sql = format!("DELETE FROM \"{}\"", self.table);
        self.db
            .execute(&sql, &[])
            .await
            .with_context(|| format!("Failed to clear '{}'", self.table))?;
        Ok(())
    }
}

fn decode_row(key: &str, row: &Row) -> Result<Entry> {
    let kind: Kind = row
        .get("kind")
        .and_then(SqlValue::as_text)
        .with_context(|| format!("Row '{key}' has no kind"))?
        .parse()?;
    let bytes = row
        .get("value")
        .and_then(SqlValue::as_bytes)
        .with_context(|| format!("Row '{key}' has no value"))?;
    let body = Body::decode(kind, bytes).with_context(|| format!("Row '{key}' is corrupt"))?;
    let expires_at = match row.get("expired_at") {
        Some(SqlValue::Text(text)) => Some(parse_timestamp(text)?),
        _ => None,
    };
    Ok(Entry { body, expires_at })
}
