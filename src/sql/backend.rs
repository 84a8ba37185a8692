//! The seam between the layered store and a SQL engine.

use anyhow::Result;
use async_trait::async_trait;

use super::types::{Row, Value};

/// What the layered store asks of a SQL engine.
///
/// Placeholders are positional `?`. Implementations are shared across
/// stores through the connector registry, so they must be `Send + Sync`.
#[async_trait]
pub trait SqlBackend: Send + Sync + 'static {
    /// Runs a SELECT and collects every row.
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>>;

    /// Runs one write statement; returns the affected row count.
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<usize>;

    /// Runs parameterless DDL, e.g. `CREATE TABLE IF NOT EXISTS`.
    async fn execute_batch(&self, sql: &str) -> Result<()>;

    /// Runs `statements` in a single transaction and returns the affected
    /// count of each. A failure leaves the table untouched.
    ///
    /// # Errors
    ///
    /// Returns the first statement error after rolling back.
    async fn execute_batch_atomic(&self, statements: Vec<(String, Vec<Value>)>) -> Result<Vec<usize>>;
}
