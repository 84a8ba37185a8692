//! Narrow interface the document adapter needs from a document database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::list::PopFrom;
use crate::store::types::is_past;
use crate::value::{Body, Kind, Value};

/// One stored document: `{key, kind, body, expired_at}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub key: String,
    pub kind: Kind,
    pub body: Body,
    #[serde(default)]
    pub expired_at: Option<DateTime<Utc>>,
}

impl Document {
    pub fn new(key: impl Into<String>, body: Body, expired_at: Option<DateTime<Utc>>) -> Self {
        Self {
            key: key.into(),
            kind: body.kind(),
            body,
            expired_at,
        }
    }

    pub fn is_expired(&self) -> bool {
        is_past(self.expired_at)
    }
}

/// Atomic update operators applied to the `body` field.
#[derive(Debug, Clone, PartialEq)]
pub enum Update {
    /// `$push` with `$each`.
    Push(Vec<Value>),
    /// `$pullAll`.
    PullAll(Vec<Value>),
    /// `$addToSet` with `$each`.
    AddToSet(Vec<Value>),
    /// `$pop`. A no-op on an empty array.
    Pop(PopFrom),
    /// Positional `$set` of `body.<index>`; never extends the array.
    SetIndex(usize, Value),
    /// `$inc` on an integer body.
    Inc(i64),
}

/// Which version of the document `find_one_and_update` returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnDocument {
    Before,
    After,
}

#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    /// The operator does not apply to the body's type.
    #[error("update operator does not apply to the stored body type")]
    TypeMismatch,

    #[error("array index out of range")]
    OutOfRange,

    #[error("integer overflow")]
    Overflow,

    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

pub type DocumentResult<T> = std::result::Result<T, DocumentError>;

/// Operations the document adapter issues against one collection keyed by
/// a unique `key` field.
///
/// Expired documents are invisible to every operation, and an upsert
/// replaces them.
#[async_trait]
pub trait DocumentConnector: Send + Sync + 'static {
    async fn find_one(&self, key: &str) -> DocumentResult<Option<Document>>;

    /// Inserts or replaces the document with the same key.
    async fn replace(&self, doc: Document) -> DocumentResult<()>;

    async fn find_one_and_delete(&self, key: &str) -> DocumentResult<Option<Document>>;

    /// Applies `update` atomically. With `upsert`, an absent key starts as an
    /// empty list (array operators) or zero (`Inc`) without expiry.
    async fn find_one_and_update(
        &self,
        key: &str,
        update: Update,
        upsert: bool,
        ret: ReturnDocument,
    ) -> DocumentResult<Option<Document>>;

    async fn delete(&self, key: &str) -> DocumentResult<()>;

    /// Deletes every document whose key starts with `prefix`.
    async fn delete_prefix(&self, prefix: &str) -> DocumentResult<u64>;

    async fn keys(&self) -> DocumentResult<Vec<String>>;

    async fn count(&self) -> DocumentResult<usize>;

    /// Drops every document.
    async fn drop_all(&self) -> DocumentResult<()>;

    /// Removes expired documents. Returns how many.
    async fn delete_expired(&self) -> DocumentResult<u64>;
}
