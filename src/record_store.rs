//! Live, subscribed view of one user's records.
//!
//! Every pushed snapshot is re-derived in full (field names and line items
//! loaded concurrently across all records) and swapped into the cache in one
//! step. Derivations are numbered; only one newer than the last applied
//! generation may replace the cache, and nothing is applied after
//! `unsubscribe()`.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Instant;

use futures::future::join_all;
use futures::StreamExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::{RecordsError, Result};
use crate::loader::SubcollectionLoader;
use crate::models::Record;
use crate::resolver::{FieldNameResolver, NameCache};
use crate::store::{Direction, Document, DocumentStore, Query, SnapshotStream, StoreError, RECORDS};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreState {
    Uninitialized,
    Subscribing,
    Live,
    Reloading,
    Unsubscribed,
    Failed(String),
}

/// Read access to whatever the consumer currently holds in its cache.
pub trait RecordCache: Send + Sync {
    fn contains(&self, id: &str) -> bool;
}

impl RecordCache for HashSet<String> {
    fn contains(&self, id: &str) -> bool {
        HashSet::contains(self, id)
    }
}

struct Status {
    state: StoreState,
    issued: u64,
    applied: u64,
}

struct Inner {
    resolver: FieldNameResolver,
    loader: SubcollectionLoader,
    cache: RwLock<Arc<Vec<Record>>>,
    status: Mutex<Status>,
    degraded: Mutex<bool>,
    shutdown: CancellationToken,
    version: watch::Sender<u64>,
}

impl Inner {
    fn status(&self) -> MutexGuard<'_, Status> {
        self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: StoreState) {
        let mut status = self.status();
        if status.state != StoreState::Unsubscribed {
            status.state = state;
        }
    }

    fn next_generation(&self) -> u64 {
        let mut status = self.status();
        status.issued += 1;
        if status.state == StoreState::Live {
            status.state = StoreState::Reloading;
        }
        status.issued
    }

    async fn derive(&self, docs: Vec<Document>) -> Vec<Record> {
        let mut records: Vec<Record> = docs.iter().map(Record::from_document).collect();
        let field_ids: BTreeSet<String> =
            records.iter().filter_map(|r| r.field_id.clone()).collect();

        let names = join_all(field_ids.iter().map(|id| async move {
            (id.clone(), self.resolver.resolve(id).await)
        }));
        let children = join_all(records.iter().map(|r| self.loader.load(&r.id)));
        let (names, children) = futures::join!(names, children);
        let names: HashMap<String, String> = names.into_iter().collect();

        for (record, children) in records.iter_mut().zip(children) {
            if let Some(name) = record.field_id.as_ref().and_then(|id| names.get(id)) {
                record.field_name = name.clone();
            }
            record.bought_items = children.bought_items;
            record.vehicle_update = children.vehicle_update;
        }
        sort_newest_first(&mut records);
        records
    }

    async fn derive_and_apply(&self, generation: u64, docs: Vec<Document>) {
        let started = Instant::now();
        let records = tokio::select! {
            _ = self.shutdown.cancelled() => {
                log::debug!("Discarding derivation {generation} after unsubscribe");
                return;
            }
            records = self.derive(docs) => records,
        };
        let count = records.len();
        if self.apply(generation, records) {
            log::info!(
                "Loaded {count} records in {:.2}ms (generation {generation})",
                started.elapsed().as_secs_f64() * 1000.0
            );
        }
    }

    /// Swap the cache if `generation` is the newest seen and the session is open.
    fn apply(&self, generation: u64, records: Vec<Record>) -> bool {
        let mut status = self.status();
        if self.shutdown.is_cancelled() {
            return false;
        }
        if generation <= status.applied {
            log::debug!(
                "Dropping stale derivation {generation} (applied {})",
                status.applied
            );
            return false;
        }
        status.applied = generation;
        *self.cache.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(records);
        if status.applied == status.issued {
            status.state = StoreState::Live;
        }
        self.version.send_replace(generation);
        true
    }

    /// Records that the unordered fallback is in use. False if it already was.
    fn enter_degraded(&self) -> bool {
        !std::mem::replace(&mut *self.degraded.lock().unwrap_or_else(|e| e.into_inner()), true)
    }

    fn spawn_derivation(self: &Arc<Self>, docs: Vec<Document>) {
        let generation = self.next_generation();
        let inner = self.clone();
        tokio::spawn(async move { inner.derive_and_apply(generation, docs).await });
    }

    /// Follow pushes until unsubscribe. A late ordering rejection gets the
    /// same single unordered retry as one during `initialize`.
    async fn listen(
        self: Arc<Self>,
        store: Arc<dyn DocumentStore>,
        query: Query,
        mut stream: SnapshotStream,
    ) {
        loop {
            let item = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                item = stream.next() => item,
            };
            match item {
                Some(Ok(docs)) => self.spawn_derivation(docs),
                Some(Err(StoreError::FailedPrecondition(msg))) if self.enter_degraded() => {
                    log::warn!("Records subscription rejected its ordering ({msg}), resubscribing without orderBy");
                    let reopened = tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        reopened = open(store.as_ref(), query.unordered()) => reopened,
                    };
                    match reopened {
                        Ok((next, docs)) => {
                            stream = next;
                            self.spawn_derivation(docs);
                        }
                        Err(e) => {
                            log::error!("Fallback records query also failed: {e}");
                            self.set_state(StoreState::Failed(e.to_string()));
                            break;
                        }
                    }
                }
                Some(Err(e)) => {
                    log::error!("Records subscription failed: {e}");
                    self.set_state(StoreState::Failed(e.to_string()));
                    break;
                }
                None => {
                    log::info!("Records subscription closed by the store");
                    break;
                }
            }
        }
    }
}

pub struct RecordStore {
    inner: Arc<Inner>,
}

impl RecordStore {
    /// Subscribe to `user_id`'s records, newest first, and wait for the first
    /// snapshot to be derived. An ordered subscription rejected with a failed
    /// precondition, now or later on the live stream, is retried once without
    /// ordering; records are sorted client-side either way.
    pub async fn initialize(
        store: Arc<dyn DocumentStore>,
        user_id: &str,
        names: NameCache,
    ) -> Result<Self> {
        let (version, _) = watch::channel(0);
        let inner = Arc::new(Inner {
            resolver: FieldNameResolver::new(store.clone(), names),
            loader: SubcollectionLoader::new(store.clone()),
            cache: RwLock::new(Arc::new(Vec::new())),
            status: Mutex::new(Status {
                state: StoreState::Uninitialized,
                issued: 0,
                applied: 0,
            }),
            degraded: Mutex::new(false),
            shutdown: CancellationToken::new(),
            version,
        });
        inner.set_state(StoreState::Subscribing);

        let query = Query::collection(RECORDS)
            .where_eq("userId", user_id)
            .order_by("createdAt", Direction::Descending);

        let (stream, first) = match open(store.as_ref(), query.clone()).await {
            Ok(opened) => opened,
            Err(StoreError::FailedPrecondition(msg)) => {
                log::warn!("Ordered records query rejected ({msg}), retrying without orderBy");
                inner.enter_degraded();
                match open(store.as_ref(), query.unordered()).await {
                    Ok(opened) => opened,
                    Err(e) => {
                        log::error!("Fallback records query also failed: {e}");
                        inner.set_state(StoreState::Failed(e.to_string()));
                        return Err(RecordsError::Unavailable(format!(
                            "records query failed after fallback: {e}"
                        )));
                    }
                }
            }
            Err(e) => {
                log::error!("Error setting up records listener: {e}");
                inner.set_state(StoreState::Failed(e.to_string()));
                return Err(e.into());
            }
        };

        let generation = inner.next_generation();
        inner.derive_and_apply(generation, first).await;
        tokio::spawn(inner.clone().listen(store, query, stream));
        Ok(Self { inner })
    }

    /// The latest derived list. Never waits on a derivation in progress.
    pub fn current_list(&self) -> Arc<Vec<Record>> {
        self.inner
            .cache
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn get(&self, id: &str) -> Option<Record> {
        self.current_list().iter().find(|r| r.id == id).cloned()
    }

    pub fn state(&self) -> StoreState {
        self.inner.status().state.clone()
    }

    /// True when running on the unordered fallback subscription.
    pub fn is_degraded(&self) -> bool {
        *self.inner.degraded.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn names(&self) -> &NameCache {
        self.inner.resolver.cache()
    }

    /// Yields the generation number of every cache swap.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.inner.version.subscribe()
    }

    /// Stop the subscription. In-flight derivations are discarded.
    pub fn unsubscribe(&self) {
        let mut status = self.inner.status();
        self.inner.shutdown.cancel();
        if status.state != StoreState::Unsubscribed {
            log::info!("Records subscription closed");
            status.state = StoreState::Unsubscribed;
        }
    }
}

impl RecordCache for RecordStore {
    fn contains(&self, id: &str) -> bool {
        self.current_list().iter().any(|r| r.id == id)
    }
}

impl Drop for RecordStore {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

async fn open(
    store: &dyn DocumentStore,
    query: Query,
) -> std::result::Result<(SnapshotStream, Vec<Document>), StoreError> {
    let mut stream = store.subscribe(query).await?;
    match stream.next().await {
        Some(Ok(docs)) => Ok((stream, docs)),
        Some(Err(e)) => Err(e),
        None => Err(StoreError::Unavailable(
            "subscription closed before its first snapshot".to_string(),
        )),
    }
}

/// Record date (or creation time) descending; undated records last.
pub fn sort_newest_first(records: &mut [Record]) {
    records.sort_by(|a, b| {
        b.effective_date()
            .cmp(&a.effective_date())
            .then_with(|| b.created_at.cmp(&a.created_at))
            .then_with(|| a.id.cmp(&b.id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::models::UNKNOWN_FIELD;
    use crate::store::{bought_items_path, Fields, FIELDS};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Tracks the most `get_many` calls in flight at once.
    struct PeakReadStore {
        inner: MemoryStore,
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl DocumentStore for PeakReadStore {
        async fn subscribe(&self, query: Query) -> std::result::Result<SnapshotStream, StoreError> {
            self.inner.subscribe(query).await
        }

        async fn get_one(
            &self,
            collection: &str,
            id: &str,
        ) -> std::result::Result<Option<Document>, StoreError> {
            self.inner.get_one(collection, id).await
        }

        async fn get_many(&self, query: Query) -> std::result::Result<Vec<Document>, StoreError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let result = self.inner.get_many(query).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            result
        }

        async fn delete(&self, collection: &str, id: &str) -> std::result::Result<(), StoreError> {
            self.inner.delete(collection, id).await
        }

        async fn put(
            &self,
            collection: &str,
            id: Option<&str>,
            fields: Fields,
        ) -> std::result::Result<String, StoreError> {
            self.inner.put(collection, id, fields).await
        }
    }

    fn seed() -> MemoryStore {
        let store = MemoryStore::new();
        store.insert(FIELDS, "f1", json!({"field_name": "North Block"}));
        store.insert(
            RECORDS,
            "r1",
            json!({"userId": "u1", "fieldId": "f1", "createdAt": "2025-01-01", "recordDate": "2025-01-05"}),
        );
        store.insert(
            RECORDS,
            "r2",
            json!({"userId": "u1", "fieldId": "f1", "createdAt": "2025-02-01"}),
        );
        store.insert(RECORDS, "r3", json!({"userId": "u1", "createdAt": "2024-12-01", "recordDate": "2025-03-01"}));
        store.insert(RECORDS, "x1", json!({"userId": "u2", "createdAt": "2025-02-01"}));
        store.insert(&bought_items_path("r1"), "i1", json!({"totalCost": 30}));
        store
    }

    fn ids(rs: &RecordStore) -> Vec<String> {
        rs.current_list().iter().map(|r| r.id.clone()).collect()
    }

    async fn next_change(changes: &mut watch::Receiver<u64>) {
        tokio::time::timeout(Duration::from_secs(5), changes.changed())
            .await
            .expect("timed out waiting for cache swap")
            .unwrap();
    }

    #[tokio::test]
    async fn test_initialize_derives_sorted_list() {
        let store = seed();
        let rs = RecordStore::initialize(Arc::new(store), "u1", NameCache::new())
            .await
            .unwrap();
        assert_eq!(ids(&rs), ["r3", "r2", "r1"]);
        assert_eq!(rs.state(), StoreState::Live);
        assert!(!rs.is_degraded());

        let r1 = rs.get("r1").unwrap();
        assert_eq!(r1.field_name, "North Block");
        assert_eq!(r1.bought_items.len(), 1);
        assert_eq!(rs.get("r3").unwrap().field_name, UNKNOWN_FIELD);
        assert_eq!(rs.names().len(), 1);
    }

    #[tokio::test]
    async fn test_child_loads_run_across_records_at_once() {
        let store = Arc::new(PeakReadStore {
            inner: seed(),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let rs = RecordStore::initialize(store.clone(), "u1", NameCache::new())
            .await
            .unwrap();
        assert_eq!(rs.current_list().len(), 3);
        // One record contributes at most two loads (items and vehicle update).
        assert!(store.peak.load(Ordering::SeqCst) > 2);
        assert_eq!(store.active.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_push_update_replaces_cache() {
        let store = seed();
        let rs = RecordStore::initialize(Arc::new(store.clone()), "u1", NameCache::new())
            .await
            .unwrap();
        let mut changes = rs.changes();

        store.insert(RECORDS, "r4", json!({"userId": "u1", "createdAt": "2025-06-01"}));
        next_change(&mut changes).await;
        assert_eq!(ids(&rs), ["r4", "r3", "r2", "r1"]);

        store.remove(RECORDS, "r2");
        next_change(&mut changes).await;
        assert_eq!(ids(&rs), ["r4", "r3", "r1"]);
        assert!(!RecordCache::contains(&rs, "r2"));
    }

    #[tokio::test]
    async fn test_degraded_mode_matches_ordered_result() {
        let ordered = RecordStore::initialize(Arc::new(seed()), "u1", NameCache::new())
            .await
            .unwrap();

        let store = seed();
        store.require_index(true);
        let degraded = RecordStore::initialize(Arc::new(store.clone()), "u1", NameCache::new())
            .await
            .unwrap();
        assert!(degraded.is_degraded());
        assert_eq!(store.subscribe_calls(), 2);
        assert_eq!(ids(&degraded), ids(&ordered));
    }

    #[tokio::test]
    async fn test_fallback_failure_is_terminal_unavailable() {
        let store = seed();
        store.fail_subscriptions(StoreError::FailedPrecondition("index".into()));
        let err = RecordStore::initialize(Arc::new(store.clone()), "u1", NameCache::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RecordsError::Unavailable(_)));
        assert_eq!(store.subscribe_calls(), 2);
    }

    #[tokio::test]
    async fn test_late_ordering_rejection_falls_back_once() {
        let store = seed();
        let rs = RecordStore::initialize(Arc::new(store.clone()), "u1", NameCache::new())
            .await
            .unwrap();
        let mut changes = rs.changes();

        store.require_index(true);
        store.break_subscriptions(RECORDS, StoreError::FailedPrecondition("index".into()));
        next_change(&mut changes).await;
        assert!(rs.is_degraded());
        assert_eq!(store.subscribe_calls(), 2);
        assert_eq!(rs.state(), StoreState::Live);

        store.insert(RECORDS, "r4", json!({"userId": "u1", "createdAt": "2025-06-01"}));
        next_change(&mut changes).await;
        assert_eq!(ids(&rs), ["r4", "r3", "r2", "r1"]);

        store.break_subscriptions(RECORDS, StoreError::FailedPrecondition("index".into()));
        for _ in 0..50 {
            if matches!(rs.state(), StoreState::Failed(_)) {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(matches!(rs.state(), StoreState::Failed(_)));
        assert_eq!(store.subscribe_calls(), 2);
        assert_eq!(ids(&rs), ["r4", "r3", "r2", "r1"]);
    }

    #[tokio::test]
    async fn test_other_subscribe_errors_do_not_fall_back() {
        let store = seed();
        store.fail_subscriptions(StoreError::PermissionDenied("records".into()));
        let err = RecordStore::initialize(Arc::new(store.clone()), "u1", NameCache::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RecordsError::PermissionDenied { .. }));
        assert_eq!(store.subscribe_calls(), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_replacement() {
        let store = seed();
        let rs = RecordStore::initialize(Arc::new(store.clone()), "u1", NameCache::new())
            .await
            .unwrap();
        store.insert(RECORDS, "r9", json!({"userId": "u1", "createdAt": "2025-09-01"}));
        tokio::task::yield_now().await;
        rs.unsubscribe();
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        assert_eq!(rs.state(), StoreState::Unsubscribed);
        assert_eq!(ids(&rs), ["r3", "r2", "r1"]);
    }

    #[tokio::test]
    async fn test_stale_generation_is_dropped() {
        let rs = RecordStore::initialize(Arc::new(seed()), "u1", NameCache::new())
            .await
            .unwrap();
        let second = rs.inner.next_generation();
        let third = rs.inner.next_generation();
        assert!(rs.inner.apply(third, Vec::new()));
        assert!(!rs.inner.apply(second, rs.current_list().to_vec()));
        assert_eq!(rs.state(), StoreState::Live);
        assert!(rs.current_list().is_empty());
    }
}
