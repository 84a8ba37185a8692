//! SQLite backend for the SQL back tier.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{Connection, params_from_iter};
use tracing::debug;

use super::backend::SqlBackend;
use super::types::{Row, Value};

/// SQLite-backed [`SqlBackend`].
///
/// One connection guarded by a mutex; every call runs on the blocking pool.
#[derive(Clone)]
pub struct SqliteBackend {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteBackend {
    /// Opens or creates a database file, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or database cannot be created.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create SQL directory: {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQL database: {}", path.display()))?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")
            .context("Failed to configure SQL database")?;
        debug!(path = %path.display(), "Opened SQLite database");
        Ok(Self::from_connection(conn))
    }

    /// Opens a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns an error if the in-memory database cannot be created.
    pub fn memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory SQL database")?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || f(&mut conn.lock()))
            .await
            .context("Task join error")?
    }
}

fn bind(params: &[Value]) -> Vec<rusqlite::types::Value> {
    params.iter().map(Value::to_rusqlite).collect()
}

fn query_sync(conn: &Connection, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
    let mut stmt = conn
        .prepare_cached(sql)
        .with_context(|| format!("Failed to prepare query: {sql}"))?;
    let columns: Arc<[String]> = stmt
        .column_names()
        .into_iter()
        .map(str::to_string)
        .collect();
    let mut rows = stmt
        .query(params_from_iter(bind(params)))
        .context("Failed to execute query")?;

    let mut out = Vec::new();
    while let Some(row) = rows.next().context("Failed to fetch row")? {
        let mut values = Vec::with_capacity(columns.len());
        for i in 0..columns.len() {
            values.push(Value::from(row.get_ref(i).context("Failed to read column")?));
        }
        out.push(Row::new(Arc::clone(&columns), values));
    }
    Ok(out)
}

#[async_trait]
impl SqlBackend for SqliteBackend {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let sql = sql.to_string();
        let params = params.to_vec();
        self.blocking(move |conn| query_sync(conn, &sql, &params))
            .await
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<usize> {
        let sql = sql.to_string();
        let params = params.to_vec();
        self.blocking(move |conn| {
            conn.execute(&sql, params_from_iter(bind(&params)))
                .with_context(|| format!("Failed to execute statement: {sql}"))
        })
        .await
    }

    async fn execute_batch(&self, sql: &str) -> Result<()> {
        let sql = sql.to_string();
        self.blocking(move |conn| {
            conn.execute_batch(&sql)
                .context("Failed to execute SQL batch")
        })
        .await
    }

    async fn execute_batch_atomic(
        &self,
        statements: Vec<(String, Vec<Value>)>,
    ) -> Result<Vec<usize>> {
        self.blocking(move |conn| {
            let tx = conn
                .transaction()
                .context("Failed to begin transaction")?;
            let mut affected = Vec::with_capacity(statements.len());
            for (sql, params) in &statements {
                let mut stmt = tx
                    .prepare_cached(sql)
                    .with_context(|| format!("Failed to prepare statement: {sql}"))?;
                affected.push(
                    stmt.execute(params_from_iter(bind(params)))
                        .with_context(|| format!("Failed to execute statement: {sql}"))?,
                );
            }
            tx.commit().context("Failed to commit transaction")?;
            Ok(affected)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_query_round_trip() {
        let db = SqliteBackend::memory().unwrap();
        db.execute_batch("CREATE TABLE t (k TEXT PRIMARY KEY, v BLOB, n INTEGER)")
            .await
            .unwrap();
        db.execute(
            "INSERT INTO t (k, v, n) VALUES (?, ?, ?)",
            &[Value::from("a"), Value::Blob(vec![1, 2]), Value::Integer(7)],
        )
        .await
        .unwrap();

        let rows = db.query("SELECT k, v, n FROM t WHERE k = ?", &[Value::from("a")])
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("v"), Some(&Value::Blob(vec![1, 2])));
        assert_eq!(rows[0].get("n").and_then(Value::as_integer), Some(7));
        assert!(rows[0].get("missing").is_none());
    }

    #[tokio::test]
    async fn test_atomic_batch_rolls_back_on_error() {
        let db = SqliteBackend::memory().unwrap();
        db.execute_batch("CREATE TABLE t (k TEXT PRIMARY KEY)")
            .await
            .unwrap();
        let result = db
            .execute_batch_atomic(vec![
                ("INSERT INTO t (k) VALUES (?)".into(), vec![Value::from("a")]),
                ("INSERT INTO missing (k) VALUES (?)".into(), vec![Value::from("b")]),
            ])
            .await;
        assert!(result.is_err());
        let rows = db.query("SELECT k FROM t", &[]).await.unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_file_database_creates_parent() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("stores.db");
        let db = SqliteBackend::open(&path).unwrap();
        db.execute_batch("CREATE TABLE t (k TEXT)").await.unwrap();
        assert!(path.exists());
    }
}
