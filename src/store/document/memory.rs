//! In-process document collection.

use std::collections::BTreeMap;
use std::ops::Bound;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::connector::{
    Document, DocumentConnector, DocumentError, DocumentResult, ReturnDocument, Update,
};
use crate::store::list::{self, PopFrom};
use crate::value::{Body, Value};

type Docs = BTreeMap<String, Document>;

fn live<'a>(docs: &'a mut Docs, key: &str) -> Option<&'a mut Document> {
    if docs.get(key).is_some_and(Document::is_expired) {
        docs.remove(key);
    }
    docs.get_mut(key)
}

fn array_mut(body: &mut Body) -> DocumentResult<&mut Vec<Value>> {
    match body {
        Body::List(items) => Ok(items),
        Body::Scalar(_) => Err(DocumentError::TypeMismatch),
    }
}

/// Applies one operator to a document body in place.
fn apply(body: &mut Body, update: Update) -> DocumentResult<()> {
    match update {
        Update::Push(values) => {
            array_mut(body)?.extend(values);
        },
        Update::PullAll(values) => {
            list::pull_all(array_mut(body)?, &values);
        },
        Update::AddToSet(values) => {
            list::add_to_set(array_mut(body)?, values);
        },
        Update::Pop(from) => {
            let items = array_mut(body)?;
            match from {
                PopFrom::Tail => {
                    items.pop();
                },
                PopFrom::Head if !items.is_empty() => {
                    items.remove(0);
                },
                PopFrom::Head => {},
            }
        },
        Update::SetIndex(index, value) => {
            let slot = array_mut(body)?
                .get_mut(index)
                .ok_or(DocumentError::OutOfRange)?;
            *slot = value;
        },
        Update::Inc(delta) => {
            let Body::Scalar(Value::Int(current)) = body else {
                return Err(DocumentError::TypeMismatch);
            };
            *current = current.checked_add(delta).ok_or(DocumentError::Overflow)?;
        },
    }
    Ok(())
}

fn upsert_body(update: &Update) -> Body {
    match update {
        Update::Inc(_) => Body::Scalar(Value::Int(0)),
        _ => Body::List(Vec::new()),
    }
}

/// In-process [`DocumentConnector`] over an ordered map.
#[derive(Default)]
pub struct MemoryCollection {
    docs: Mutex<Docs>,
}

impl MemoryCollection {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentConnector for MemoryCollection {
    async fn find_one(&self, key: &str) -> DocumentResult<Option<Document>> {
        Ok(live(&mut self.docs.lock(), key).cloned())
    }

    async fn replace(&self, doc: Document) -> DocumentResult<()> {
        self.docs.lock().insert(doc.key.clone(), doc);
        Ok(())
    }

    async fn find_one_and_delete(&self, key: &str) -> DocumentResult<Option<Document>> {
        let removed = self.docs.lock().remove(key);
        Ok(removed.filter(|d| !d.is_expired()))
    }

    async fn find_one_and_update(
        &self,
        key: &str,
        update: Update,
        upsert: bool,
        ret: ReturnDocument,
    ) -> DocumentResult<Option<Document>> {
        let mut docs = self.docs.lock();
        let before = match live(&mut docs, key) {
            Some(doc) => doc.clone(),
            None if upsert => Document::new(key, upsert_body(&update), None),
            None => return Ok(None),
        };

        let mut after = before.clone();
        apply(&mut after.body, update)?;
        after.kind = after.body.kind();
        docs.insert(key.to_string(), after.clone());

        Ok(Some(match ret {
            ReturnDocument::Before => before,
            ReturnDocument::After => after,
        }))
    }

    async fn delete(&self, key: &str) -> DocumentResult<()> {
        self.docs.lock().remove(key);
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> DocumentResult<u64> {
        let mut docs = self.docs.lock();
        let matched: Vec<String> = docs
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &matched {
            docs.remove(key);
        }
        Ok(matched.len() as u64)
    }

    async fn keys(&self) -> DocumentResult<Vec<String>> {
        let docs = self.docs.lock();
        Ok(docs
            .values()
            .filter(|d| !d.is_expired())
            .map(|d| d.key.clone())
            .collect())
    }

    async fn count(&self) -> DocumentResult<usize> {
        let docs = self.docs.lock();
        Ok(docs.values().filter(|d| !d.is_expired()).count())
    }

    async fn drop_all(&self) -> DocumentResult<()> {
        self.docs.lock().clear();
        Ok(())
    }

    async fn delete_expired(&self) -> DocumentResult<u64> {
        let mut docs = self.docs.lock();
        let before = docs.len();
        docs.retain(|_, d| !d.is_expired());
        Ok((before - docs.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upsert_creates_empty_array_for_push() {
        let coll = MemoryCollection::new();
        let after = coll
            .find_one_and_update("L", Update::Push(vec![Value::from(1)]), true, ReturnDocument::After)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after.body, Body::List(vec![Value::from(1)]));
        assert_eq!(after.kind, crate::value::Kind::List);
    }

    #[tokio::test]
    async fn test_failed_update_leaves_document() {
        let coll = MemoryCollection::new();
        coll.replace(Document::new("s", Body::from("x"), None))
            .await
            .unwrap();
        assert!(matches!(
            coll.find_one_and_update("s", Update::Inc(1), true, ReturnDocument::After)
                .await,
            Err(DocumentError::TypeMismatch)
        ));
        assert_eq!(coll.find_one("s").await.unwrap().unwrap().body, Body::from("x"));
    }

    #[tokio::test]
    async fn test_set_index_never_extends() {
        let coll = MemoryCollection::new();
        coll.replace(Document::new("L", Body::List(vec![Value::Null]), None))
            .await
            .unwrap();
        assert!(matches!(
            coll.find_one_and_update("L", Update::SetIndex(1, Value::Null), false, ReturnDocument::After)
                .await,
            Err(DocumentError::OutOfRange)
        ));
    }

    #[tokio::test]
    async fn test_delete_prefix_and_expiry() {
        let coll = MemoryCollection::new();
        for key in ["a:1", "a:2", "b:1"] {
            coll.replace(Document::new(key, Body::from(1), None))
                .await
                .unwrap();
        }
        let past = chrono::Utc::now() - chrono::Duration::seconds(5);
        coll.replace(Document::new("old", Body::from(1), Some(past)))
            .await
            .unwrap();

        assert_eq!(coll.count().await.unwrap(), 3);
        assert_eq!(coll.delete_prefix("a:").await.unwrap(), 2);
        assert_eq!(coll.delete_expired().await.unwrap(), 1);
        assert_eq!(coll.keys().await.unwrap(), vec!["b:1".to_string()]);
    }
}
