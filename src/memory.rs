//! In-process implementations of the store contracts. Every operation yields
//! once before touching state so concurrent callers interleave the way they
//! would against a remote store.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::models::as_number;
use crate::store::{
    ArtifactStore, Direction, Document, DocumentStore, Fields, NotificationEvent,
    NotificationSink, Query, SnapshotStream, StoreError,
};

type Snapshot = Result<Vec<Document>, StoreError>;

struct Subscriber {
    query: Query,
    tx: mpsc::UnboundedSender<Snapshot>,
}

#[derive(Default)]
struct State {
    collections: HashMap<String, BTreeMap<String, Fields>>,
    subscribers: Vec<Subscriber>,
    require_index: bool,
    subscribe_failure: Option<StoreError>,
    read_failures: HashMap<String, StoreError>,
    delete_failures: HashMap<String, StoreError>,
    ignored_deletes: Vec<String>,
    delete_log: Vec<(String, String)>,
    subscribe_calls: usize,
    next_id: u64,
}

impl State {
    fn snapshot(&self, query: &Query) -> Vec<Document> {
        let mut docs: Vec<Document> = self
            .collections
            .get(&query.collection)
            .into_iter()
            .flatten()
            .map(|(id, fields)| Document::new(id.clone(), fields.clone()))
            .filter(|doc| query.matches(doc))
            .collect();
        if let Some(order) = &query.order_by {
            docs.sort_by(|a, b| {
                let ord = compare_values(a.fields.get(&order.field), b.fields.get(&order.field));
                match order.direction {
                    Direction::Ascending => ord,
                    Direction::Descending => ord.reverse(),
                }
            });
        }
        docs
    }

    fn publish(&mut self, collection: &str) {
        let mut subscribers = std::mem::take(&mut self.subscribers);
        subscribers.retain(|sub| {
            if sub.query.collection != collection {
                return !sub.tx.is_closed();
            }
            sub.tx.send(Ok(self.snapshot(&sub.query))).is_ok()
        });
        self.subscribers = subscribers;
    }
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(x), Some(y)) => match (as_number(x), as_number(y)) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            _ => Ordering::Equal,
        },
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => Ordering::Equal,
    }
}

/// Document store held in memory, with push subscriptions and fault injection.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert or replace a document and push fresh snapshots to subscribers.
    pub fn insert(&self, collection: &str, id: &str, fields: Value) {
        let fields = match fields {
            Value::Object(map) => map,
            _ => Fields::new(),
        };
        let mut state = self.state();
        state
            .collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), fields);
        state.publish(collection);
    }

    pub fn remove(&self, collection: &str, id: &str) -> bool {
        let mut state = self.state();
        let removed = state
            .collections
            .get_mut(collection)
            .and_then(|c| c.remove(id))
            .is_some();
        if removed {
            state.publish(collection);
        }
        removed
    }

    pub fn contains(&self, collection: &str, id: &str) -> bool {
        self.state()
            .collections
            .get(collection)
            .is_some_and(|c| c.contains_key(id))
    }

    pub fn count(&self, collection: &str) -> usize {
        self.state().collections.get(collection).map_or(0, |c| c.len())
    }

    pub fn documents(&self, collection: &str) -> Vec<Document> {
        self.state().snapshot(&Query::collection(collection))
    }

    /// Reject ordered queries the way a store without a composite index does.
    pub fn require_index(&self, required: bool) {
        self.state().require_index = required;
    }

    pub fn fail_subscriptions(&self, error: StoreError) {
        self.state().subscribe_failure = Some(error);
    }

    /// Push `error` to every live subscription on `collection`, ending them.
    pub fn break_subscriptions(&self, collection: &str, error: StoreError) {
        self.state().subscribers.retain(|sub| {
            if sub.query.collection != collection {
                return true;
            }
            let _ = sub.tx.send(Err(error.clone()));
            false
        });
    }

    pub fn fail_reads(&self, collection: &str, error: StoreError) {
        self.state().read_failures.insert(collection.to_string(), error);
    }

    pub fn fail_deletes(&self, collection: &str, error: StoreError) {
        self.state().delete_failures.insert(collection.to_string(), error);
    }

    /// Accept deletes on `collection` without removing anything.
    pub fn ignore_deletes(&self, collection: &str) {
        self.state().ignored_deletes.push(collection.to_string());
    }

    pub fn clear_failures(&self) {
        let mut state = self.state();
        state.subscribe_failure = None;
        state.read_failures.clear();
        state.delete_failures.clear();
        state.ignored_deletes.clear();
    }

    /// Every delete that reached the store, in call order.
    pub fn delete_log(&self) -> Vec<(String, String)> {
        self.state().delete_log.clone()
    }

    pub fn subscribe_calls(&self) -> usize {
        self.state().subscribe_calls
    }

    pub fn subscriber_count(&self) -> usize {
        let mut state = self.state();
        state.subscribers.retain(|s| !s.tx.is_closed());
        state.subscribers.len()
    }

    fn check_ordering(state: &State, query: &Query) -> Result<(), StoreError> {
        if state.require_index && query.order_by.is_some() {
            return Err(StoreError::FailedPrecondition(format!(
                "query on '{}' requires an index",
                query.collection
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn subscribe(&self, query: Query) -> Result<SnapshotStream, StoreError> {
        tokio::task::yield_now().await;
        let mut state = self.state();
        state.subscribe_calls += 1;
        if let Some(e) = state.subscribe_failure.clone() {
            return Err(e);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        match Self::check_ordering(&state, &query) {
            // Rejections arrive on the stream, after the handle is returned.
            Err(e) => {
                let _ = tx.send(Err(e));
            }
            Ok(()) => {
                let _ = tx.send(Ok(state.snapshot(&query)));
                state.subscribers.push(Subscriber { query, tx });
            }
        }
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(stream.boxed())
    }

    async fn get_one(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        tokio::task::yield_now().await;
        let state = self.state();
        if let Some(e) = state.read_failures.get(collection) {
            return Err(e.clone());
        }
        Ok(state
            .collections
            .get(collection)
            .and_then(|c| c.get(id))
            .map(|fields| Document::new(id, fields.clone())))
    }

    async fn get_many(&self, query: Query) -> Result<Vec<Document>, StoreError> {
        tokio::task::yield_now().await;
        let state = self.state();
        if let Some(e) = state.read_failures.get(&query.collection) {
            return Err(e.clone());
        }
        Self::check_ordering(&state, &query)?;
        Ok(state.snapshot(&query))
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError> {
        tokio::task::yield_now().await;
        let mut state = self.state();
        state.delete_log.push((collection.to_string(), id.to_string()));
        if let Some(e) = state.delete_failures.get(collection) {
            return Err(e.clone());
        }
        if state.ignored_deletes.iter().any(|c| c == collection) {
            return Ok(());
        }
        let removed = state
            .collections
            .get_mut(collection)
            .and_then(|c| c.remove(id))
            .is_some();
        if !removed {
            return Err(StoreError::NotFound(format!("{collection}/{id}")));
        }
        state.publish(collection);
        Ok(())
    }

    async fn put(
        &self,
        collection: &str,
        id: Option<&str>,
        fields: Fields,
    ) -> Result<String, StoreError> {
        tokio::task::yield_now().await;
        let mut state = self.state();
        let id = match id {
            Some(id) => id.to_string(),
            None => {
                state.next_id += 1;
                format!("doc-{}", state.next_id)
            }
        };
        state
            .collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.clone(), fields);
        state.publish(collection);
        Ok(id)
    }
}

/// Artifact store that keeps uploads in memory under `memory://` URLs.
#[derive(Clone, Default)]
pub struct MemoryArtifactStore {
    uploads: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
    failure: Arc<Mutex<Option<StoreError>>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_uploads(&self, error: Option<StoreError>) {
        *self.failure.lock().unwrap_or_else(|e| e.into_inner()) = error;
    }

    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.uploads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(path)
            .cloned()
    }

    pub fn paths(&self) -> Vec<String> {
        self.uploads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn upload(
        &self,
        path: &str,
        bytes: Vec<u8>,
        _content_type: &str,
    ) -> Result<String, StoreError> {
        tokio::task::yield_now().await;
        if let Some(e) = self.failure.lock().unwrap_or_else(|e| e.into_inner()).clone() {
            return Err(e);
        }
        self.uploads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path.to_string(), bytes);
        Ok(format!("memory://{path}"))
    }
}

/// Notification sink that records every published event.
#[derive(Clone, Default)]
pub struct MemoryNotifier {
    events: Arc<Mutex<Vec<NotificationEvent>>>,
    failure: Arc<Mutex<Option<StoreError>>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_publishes(&self, error: Option<StoreError>) {
        *self.failure.lock().unwrap_or_else(|e| e.into_inner()) = error;
    }

    pub fn events(&self) -> Vec<NotificationEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl NotificationSink for MemoryNotifier {
    async fn publish(&self, event: NotificationEvent) -> Result<(), StoreError> {
        tokio::task::yield_now().await;
        if let Some(e) = self.failure.lock().unwrap_or_else(|e| e.into_inner()).clone() {
            return Err(e);
        }
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_subscription_pushes_on_change() {
        let store = MemoryStore::new();
        store.insert("records", "a", json!({"userId": "u1", "createdAt": "2025-01-01"}));
        let mut stream = store
            .subscribe(
                Query::collection("records")
                    .where_eq("userId", "u1")
                    .order_by("createdAt", Direction::Descending),
            )
            .await
            .unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap().len(), 1);

        store.insert("records", "b", json!({"userId": "u1", "createdAt": "2025-02-01"}));
        let snap = stream.next().await.unwrap().unwrap();
        assert_eq!(snap.iter().map(|d| d.id.as_str()).collect::<Vec<_>>(), ["b", "a"]);

        store.insert("records", "c", json!({"userId": "u2"}));
        assert_eq!(stream.next().await.unwrap().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_ordered_subscription_rejected_without_index() {
        let store = MemoryStore::new();
        store.require_index(true);
        let q = Query::collection("records").order_by("createdAt", Direction::Descending);
        let mut stream = store.subscribe(q.clone()).await.unwrap();
        assert!(matches!(
            stream.next().await,
            Some(Err(StoreError::FailedPrecondition(_)))
        ));
        assert!(stream.next().await.is_none());
        assert!(store.get_many(q.clone()).await.is_err());
        assert!(store.get_many(q.unordered()).await.is_ok());
    }

    #[tokio::test]
    async fn test_delete_missing_is_not_found() {
        let store = MemoryStore::new();
        let err = store.delete("records", "nope").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        assert_eq!(store.delete_log().len(), 1);
    }

    #[tokio::test]
    async fn test_put_allocates_ids() {
        let store = MemoryStore::new();
        let a = store.put("reports", None, Fields::new()).await.unwrap();
        let b = store.put("reports", None, Fields::new()).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(store.count("reports"), 2);
    }
}
