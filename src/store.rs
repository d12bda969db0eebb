//! Durable document store seam
//!
//! Saga state, the event log and sequencer records all live in one
//! [`DocumentStore`]: get by id, create, overwrite, filtered/ordered query,
//! delete. [`InMemoryStore`] backs tests and the bundled binary.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::error::Result;

/// Store-level failures. Converted into `SyndicateError::Persistence`.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Document {collection}/{id} already exists")]
    AlreadyExists { collection: String, id: String },

    #[error("Store backend error: {0}")]
    Backend(String),
}

/// A single field condition. Field names may be dotted paths (`a.b.c`).
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq(String, Value),
    In(String, Vec<Value>),
    Lt(String, Value),
    Lte(String, Value),
    Gte(String, Value),
}

/// Sort direction for [`Query::order_by`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// Conjunction of filters with optional ordering and limit
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub filters: Vec<Filter>,
    pub order_by: Option<(String, SortOrder)>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::Eq(field.into(), value.into()));
        self
    }

    pub fn any_of<I, V>(mut self, field: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.filters
            .push(Filter::In(field.into(), values.into_iter().map(Into::into).collect()));
        self
    }

    pub fn lt(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::Lt(field.into(), value.into()));
        self
    }

    pub fn lte(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::Lte(field.into(), value.into()));
        self
    }

    pub fn gte(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::Gte(field.into(), value.into()));
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, order: SortOrder) -> Self {
        self.order_by = Some((field.into(), order));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether `doc` satisfies every filter
    pub fn matches(&self, doc: &Value) -> bool {
        self.filters.iter().all(|filter| match filter {
            Filter::Eq(field, expected) => field_value(doc, field) == Some(expected),
            Filter::In(field, options) => field_value(doc, field).is_some_and(|v| options.contains(v)),
            Filter::Lt(field, bound) => compare_field(doc, field, bound) == Some(CmpOrdering::Less),
            Filter::Lte(field, bound) => matches!(
                compare_field(doc, field, bound),
                Some(CmpOrdering::Less | CmpOrdering::Equal)
            ),
            Filter::Gte(field, bound) => matches!(
                compare_field(doc, field, bound),
                Some(CmpOrdering::Greater | CmpOrdering::Equal)
            ),
        })
    }

    /// Filter, sort and truncate a set of documents
    pub fn apply<'a>(&self, docs: impl Iterator<Item = &'a Value>) -> Vec<Value> {
        let mut selected: Vec<Value> = docs.filter(|doc| self.matches(doc)).cloned().collect();

        if let Some((field, order)) = &self.order_by {
            selected.sort_by(|a, b| {
                let ordering = match (field_value(a, field), field_value(b, field)) {
                    (Some(x), Some(y)) => compare_values(x, y).unwrap_or(CmpOrdering::Equal),
                    (Some(_), None) => CmpOrdering::Less,
                    (None, Some(_)) => CmpOrdering::Greater,
                    (None, None) => CmpOrdering::Equal,
                };
                match order {
                    SortOrder::Asc => ordering,
                    SortOrder::Desc => ordering.reverse(),
                }
            });
        }

        if let Some(limit) = self.limit {
            selected.truncate(limit);
        }
        selected
    }
}

/// Resolve a dotted field path; `null` counts as absent
fn field_value<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let value = path.split('.').try_fold(doc, |current, key| current.get(key))?;
    (!value.is_null()).then_some(value)
}

fn compare_field(doc: &Value, field: &str, bound: &Value) -> Option<CmpOrdering> {
    compare_values(field_value(doc, field)?, bound)
}

/// Numbers compare numerically; RFC 3339 strings compare as instants
fn compare_values(a: &Value, b: &Value) -> Option<CmpOrdering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => {
            match (DateTime::parse_from_rfc3339(x), DateTime::parse_from_rfc3339(y)) {
                (Ok(x), Ok(y)) => Some(x.cmp(&y)),
                _ => Some(x.cmp(y)),
            }
        }
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Serialize a timestamp the way stored documents carry it
pub fn timestamp_value(at: DateTime<Utc>) -> Value {
    Value::String(at.to_rfc3339())
}

/// Durable document store consumed by the core
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, collection: &str, id: &str) -> std::result::Result<Option<Value>, StoreError>;

    /// Create or overwrite
    async fn put(&self, collection: &str, id: &str, doc: Value) -> std::result::Result<(), StoreError>;

    /// Create; fails with `AlreadyExists` when the id is taken
    async fn create(&self, collection: &str, id: &str, doc: Value) -> std::result::Result<(), StoreError>;

    async fn query(&self, collection: &str, query: &Query) -> std::result::Result<Vec<Value>, StoreError>;

    /// Returns whether a document was removed
    async fn delete(&self, collection: &str, id: &str) -> std::result::Result<bool, StoreError>;
}

/// Typed access on top of any [`DocumentStore`]
#[async_trait]
pub trait DocumentStoreExt: DocumentStore {
    async fn get_doc<T>(&self, collection: &str, id: &str) -> Result<Option<T>>
    where
        T: DeserializeOwned + Send,
    {
        match self.get(collection, id).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    async fn put_doc<T>(&self, collection: &str, id: &str, doc: &T) -> Result<()>
    where
        T: Serialize + Sync,
    {
        let value = serde_json::to_value(doc)?;
        self.put(collection, id, value).await?;
        Ok(())
    }

    async fn create_doc<T>(&self, collection: &str, id: &str, doc: &T) -> Result<()>
    where
        T: Serialize + Sync,
    {
        let value = serde_json::to_value(doc)?;
        self.create(collection, id, value).await?;
        Ok(())
    }

    async fn query_docs<T>(&self, collection: &str, query: &Query) -> Result<Vec<T>>
    where
        T: DeserializeOwned + Send,
    {
        self.query(collection, query)
            .await?
            .into_iter()
            .map(|value| serde_json::from_value(value).map_err(Into::into))
            .collect()
    }
}

impl<S: DocumentStore + ?Sized> DocumentStoreExt for S {}

/// In-memory implementation of [`DocumentStore`].
///
/// `BTreeMap` keeps iteration deterministic. Can be switched into an
/// unavailable state to exercise persistence-failure paths.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    collections: Arc<RwLock<BTreeMap<String, BTreeMap<String, Value>>>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with `StoreError::Unavailable`
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of documents in a collection
    pub async fn len(&self, collection: &str) -> usize {
        self.collections
            .read()
            .await
            .get(collection)
            .map(BTreeMap::len)
            .unwrap_or(0)
    }

    fn check_available(&self) -> std::result::Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store switched off".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn get(&self, collection: &str, id: &str) -> std::result::Result<Option<Value>, StoreError> {
        self.check_available()?;
        Ok(self
            .collections
            .read()
            .await
            .get(collection)
            .and_then(|docs| docs.get(id))
            .cloned())
    }

    async fn put(&self, collection: &str, id: &str, doc: Value) -> std::result::Result<(), StoreError> {
        self.check_available()?;
        self.collections
            .write()
            .await
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), doc);
        Ok(())
    }

    async fn create(&self, collection: &str, id: &str, doc: Value) -> std::result::Result<(), StoreError> {
        self.check_available()?;
        let mut collections = self.collections.write().await;
        let docs = collections.entry(collection.to_string()).or_default();
        if docs.contains_key(id) {
            return Err(StoreError::AlreadyExists {
                collection: collection.to_string(),
                id: id.to_string(),
            });
        }
        docs.insert(id.to_string(), doc);
        Ok(())
    }

    async fn query(&self, collection: &str, query: &Query) -> std::result::Result<Vec<Value>, StoreError> {
        self.check_available()?;
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection)
            .map(|docs| query.apply(docs.values()))
            .unwrap_or_default())
    }

    async fn delete(&self, collection: &str, id: &str) -> std::result::Result<bool, StoreError> {
        self.check_available()?;
        Ok(self
            .collections
            .write()
            .await
            .get_mut(collection)
            .and_then(|docs| docs.remove(id))
            .is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyndicateError;
    use serde::Deserialize;
    use serde_json::json;
    use tokio_test::{assert_err, assert_ok};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Lead {
        id: String,
        score: u32,
    }

    async fn seeded() -> InMemoryStore {
        let store = InMemoryStore::new();
        for (id, status, score, at) in [
            ("a", "active", 3, "2026-01-01T10:00:00Z"),
            ("b", "stopped", 9, "2026-01-01T09:00:00.500Z"),
            ("c", "active", 5, "2026-01-01T09:00:00Z"),
        ] {
            store
                .put("leads", id, json!({"id": id, "status": status, "score": score, "meta": {"at": at}}))
                .await
                .unwrap();
        }
        store
    }

    // === CRUD Tests ===

    #[tokio::test]
    async fn test_get_put_delete() {
        let store = InMemoryStore::new();
        assert!(store.get("docs", "x").await.unwrap().is_none());

        store.put("docs", "x", json!({"v": 1})).await.unwrap();
        store.put("docs", "x", json!({"v": 2})).await.unwrap();
        assert_eq!(store.get("docs", "x").await.unwrap(), Some(json!({"v": 2})));

        assert!(store.delete("docs", "x").await.unwrap());
        assert!(!store.delete("docs", "x").await.unwrap());
    }

    #[tokio::test]
    async fn test_create_rejects_existing() {
        let store = InMemoryStore::new();
        assert_ok!(store.create("docs", "x", json!({})).await);
        let err = assert_err!(store.create("docs", "x", json!({})).await);
        assert!(matches!(err, StoreError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_every_call() {
        let store = InMemoryStore::new();
        store.set_unavailable(true);
        assert!(matches!(store.get("docs", "x").await, Err(StoreError::Unavailable(_))));
        assert!(store.put("docs", "x", json!({})).await.is_err());

        let err: SyndicateError = store.put_doc("docs", "x", &json!({})).await.unwrap_err();
        assert!(err.is_fatal());

        store.set_unavailable(false);
        assert_ok!(store.put("docs", "x", json!({})).await);
    }

    // === Query Tests ===

    #[tokio::test]
    async fn test_query_filters_and_orders() {
        let store = seeded().await;

        let query = Query::new()
            .eq("status", "active")
            .order_by("score", SortOrder::Desc);
        let ids: Vec<_> = store
            .query("leads", &query)
            .await
            .unwrap()
            .into_iter()
            .map(|d| d["id"].as_str().unwrap().to_string())
            .collect();

        assert_eq!(ids, vec!["c", "a"]);
    }

    #[tokio::test]
    async fn test_query_timestamps_compare_as_instants() {
        let store = seeded().await;

        let query = Query::new()
            .lte("meta.at", "2026-01-01T09:00:00.500Z")
            .order_by("meta.at", SortOrder::Asc);
        let docs = store.query("leads", &query).await.unwrap();

        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0]["id"], "c");
        assert_eq!(docs[1]["id"], "b");
    }

    #[tokio::test]
    async fn test_query_in_and_limit() {
        let store = seeded().await;
        let query = Query::new().any_of("id", ["a", "b"]).gte("score", 4).limit(5);
        let docs = store.query("leads", &query).await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0]["id"], "b");

        assert!(store.query("nothing", &Query::new()).await.unwrap().is_empty());
    }

    #[test]
    fn test_missing_fields_never_match_ranges() {
        let query = Query::new().lt("missing", 10);
        assert!(!query.matches(&json!({"other": 1})));
        assert!(!Query::new().eq("a", Value::Null).matches(&json!({"a": null})));
    }

    // === Typed Access Tests ===

    #[tokio::test]
    async fn test_typed_round_trip() {
        let store = InMemoryStore::new();
        let lead = Lead { id: "l1".into(), score: 7 };

        store.create_doc("leads", "l1", &lead).await.unwrap();
        let loaded: Option<Lead> = store.get_doc("leads", "l1").await.unwrap();
        assert_eq!(loaded, Some(lead));

        let all: Vec<Lead> = store.query_docs("leads", &Query::new()).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(store.len("leads").await, 1);
    }
}
