//! SQL back tier with pluggable backends.
//!
//! The layered store keeps its durable table behind [`SqlBackend`], so any
//! engine that implements the trait can be registered as a connector.
//!
//! # Example
//!
//! ```ignore
//! use unistore::sql::{SqlBackend, SqliteBackend, Value};
//!
//! let db = SqliteBackend::open("data/stores.db")?;
//! let rows = db.query("SELECT key FROM __store_default WHERE key = ?", &[Value::from("k")]).await?;
//! ```

mod backend;
mod sqlite;
mod types;

pub use backend::SqlBackend;
pub use sqlite::SqliteBackend;
pub use types::{Row, Value};
