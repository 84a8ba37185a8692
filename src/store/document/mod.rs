//! Document database adapter.
//!
//! One document per key (`{key, kind, body, expired_at}`). List operations
//! map onto array update operators and counters onto `$inc`, so every
//! operation is one atomic document update. Results the operators do not
//! report directly (removed or added counts, the popped element) are
//! derived from the pre-update document.

mod connector;
mod memory;

pub use connector::{
    Document, DocumentConnector, DocumentError, DocumentResult, ReturnDocument, Update,
};
pub use memory::MemoryCollection;

use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::backend::StoreBackend;
use super::list::{self, PopFrom};
use super::sweep::Sweeper;
use super::types::deadline;
use super::wildcard_prefix;
use crate::error::{Error, Result};
use crate::value::{Body, Kind, Value};

/// Default deadline for one connector round-trip.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Document database backend (`mongo`).
pub struct DocumentBackend {
    connector: Arc<dyn DocumentConnector>,
    timeout: Duration,
    sweeper: Option<Sweeper>,
}

impl DocumentBackend {
    pub fn new(connector: Arc<dyn DocumentConnector>) -> Self {
        Self {
            connector,
            timeout: DEFAULT_TIMEOUT,
            sweeper: None,
        }
    }

    /// Sets the deadline applied to each connector call.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Deletes expired documents every `every`, for engines without a
    /// native TTL index.
    #[must_use]
    pub fn with_sweep(mut self, every: Duration) -> Self {
        let weak: Weak<dyn DocumentConnector> = Arc::downgrade(&self.connector);
        self.sweeper = Sweeper::spawn("mongo", every, move || {
            let weak = weak.clone();
            async move {
                let Some(connector) = weak.upgrade() else {
                    return false;
                };
                match connector.delete_expired().await {
                    Ok(0) => {},
                    Ok(removed) => debug!(removed, "Swept expired documents"),
                    Err(e) => warn!(error = %e, "Document sweep failed"),
                }
                true
            }
        });
        self
    }

    async fn call<T>(
        &self,
        key: &str,
        kind: Kind,
        fut: impl Future<Output = DocumentResult<T>> + Send,
    ) -> Result<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result.map_err(|e| map_error(key, kind, e)),
            Err(_) => Err(Error::backend(anyhow::anyhow!(
                "document call on '{key}' timed out after {:?}",
                self.timeout
            ))),
        }
    }

    async fn update(
        &self,
        key: &str,
        kind: Kind,
        update: Update,
        upsert: bool,
        ret: ReturnDocument,
    ) -> Result<Option<Document>> {
        self.call(
            key,
            kind,
            self.connector.find_one_and_update(key, update, upsert, ret),
        )
        .await
    }

    /// Body of a live document, if any.
    async fn body(&self, key: &str) -> Result<Option<Body>> {
        let doc = self
            .call(key, Kind::Value, self.connector.find_one(key))
            .await?;
        Ok(doc.filter(|d| !d.is_expired()).map(|d| d.body))
    }
}

fn map_error(key: &str, kind: Kind, err: DocumentError) -> Error {
    match err {
        DocumentError::TypeMismatch if kind == Kind::Value => Error::not_integer(key),
        DocumentError::TypeMismatch => Error::invalid_kind(key, kind),
        DocumentError::OutOfRange => Error::out_of_range(key, 0, 0),
        DocumentError::Overflow => Error::overflow(key),
        DocumentError::Io(e) => Error::backend(e.context(format!("Document call on '{key}' failed"))),
    }
}

/// List held by a returned document, rejecting scalars.
fn list_of(key: &str, doc: Option<Document>) -> Result<Vec<Value>> {
    list::into_list(key, doc.map(|d| d.body))
}

#[async_trait]
impl StoreBackend for DocumentBackend {
    fn kind(&self) -> &'static str {
        "mongo"
    }

    async fn get(&self, key: &str) -> Result<Option<Body>> {
        self.body(key).await
    }

    async fn set(&self, key: &str, value: Body, ttl: Option<Duration>) -> Result<()> {
        let doc = Document::new(key, value, deadline(ttl));
        self.call(key, Kind::Value, self.connector.replace(doc))
            .await
    }

    async fn del(&self, key: &str) -> Result<()> {
        match wildcard_prefix(key) {
            Some(prefix) => {
                self.call(key, Kind::Value, self.connector.delete_prefix(prefix))
                    .await?;
                Ok(())
            },
            None => {
                self.call(key, Kind::Value, self.connector.delete(key))
                    .await
            },
        }
    }

    async fn get_del(&self, key: &str) -> Result<Option<Body>> {
        let doc = self
            .call(key, Kind::Value, self.connector.find_one_and_delete(key))
            .await?;
        Ok(doc.filter(|d| !d.is_expired()).map(|d| d.body))
    }

    async fn len(&self) -> Result<usize> {
        self.call("*", Kind::Value, self.connector.count()).await
    }

    async fn keys(&self) -> Result<Vec<String>> {
        self.call("*", Kind::Value, self.connector.keys()).await
    }

    async fn clear(&self) -> Result<()> {
        self.call("*", Kind::Value, self.connector.drop_all())
            .await
    }

    async fn incr(&self, key: &str, delta: i64) -> Result<i64> {
        let after = self
            .update(key, Kind::Value, Update::Inc(delta), true, ReturnDocument::After)
            .await?;
        match after.map(|d| d.body) {
            Some(Body::Scalar(Value::Int(n))) => Ok(n),
            Some(Body::List(_)) => Err(Error::invalid_kind(key, Kind::Value)),
            _ => Err(Error::not_integer(key)),
        }
    }

    async fn push(&self, key: &str, values: Vec<Value>) -> Result<usize> {
        let after = self
            .update(key, Kind::List, Update::Push(values), true, ReturnDocument::After)
            .await?;
        Ok(list_of(key, after)?.len())
    }

    async fn pop(&self, key: &str, from: PopFrom) -> Result<Value> {
        let before = self
            .update(key, Kind::List, Update::Pop(from), false, ReturnDocument::Before)
            .await?;
        let mut items = list_of(key, before)?;
        list::pop(key, &mut items, from)
    }

    async fn pull(&self, key: &str, value: &Value) -> Result<usize> {
        self.pull_all(key, std::slice::from_ref(value)).await
    }

    async fn pull_all(&self, key: &str, values: &[Value]) -> Result<usize> {
        let before = self
            .update(
                key,
                Kind::List,
                Update::PullAll(values.to_vec()),
                false,
                ReturnDocument::Before,
            )
            .await?;
        let mut items = list_of(key, before)?;
        Ok(list::pull_all(&mut items, values))
    }

    async fn add_to_set(&self, key: &str, values: Vec<Value>) -> Result<usize> {
        let before = self
            .update(
                key,
                Kind::List,
                Update::AddToSet(values.clone()),
                true,
                ReturnDocument::Before,
            )
            .await?;
        let mut items = list_of(key, before)?;
        Ok(list::add_to_set(&mut items, values))
    }

    async fn array_set(&self, key: &str, index: usize, value: Value) -> Result<()> {
        let result = self
            .update(
                key,
                Kind::List,
                Update::SetIndex(index, value),
                false,
                ReturnDocument::After,
            )
            .await;
        match result {
            Ok(Some(_)) => Ok(()),
            Ok(None) => Err(Error::out_of_range(key, index, 0)),
            Err(Error::OutOfRange { .. }) => {
                let len = self.array_len(key).await?;
                Err(Error::out_of_range(key, index, len))
            },
            Err(e) => Err(e),
        }
    }

    async fn close(&self) -> Result<()> {
        if let Some(sweeper) = &self.sweeper {
            sweeper.stop().await;
        }
        Ok(())
    }
}
