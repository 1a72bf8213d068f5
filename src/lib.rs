//! Cost records for farm field operations.
//!
//! A [`RecordsEngine`] keeps a live, derived cache of one user's records,
//! filters it, deletes records with ownership checks, and submits per-field
//! reports to reviewers. The document store, artifact store and notification
//! sink are injected through [`store::Backends`].

pub mod artifacts;
pub mod assembler;
pub mod classifier;
pub mod deletion;
pub mod error;
pub mod filter;
pub mod fmt;
pub mod guard;
pub mod loader;
pub mod memory;
pub mod models;
pub mod pipeline;
pub mod record_store;
pub mod render;
pub mod resolver;
pub mod settings;
pub mod store;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Local;

pub use assembler::{CostSummary, Report, TimelineEntry};
pub use classifier::{Bucket, CostClassifier, CostRule, KeyMatcher};
pub use deletion::{DeleteOutcome, PartialFailure};
pub use error::{PermissionReason, RecordsError, Result};
pub use filter::{CostCategory, DateMode, FilterState, FilteredView};
pub use models::{BoughtItem, CostBreakdown, FieldProfile, Record, VehicleUpdate};
pub use pipeline::{SubmissionPipeline, SubmissionReceipt, SubmissionState};
pub use record_store::{RecordStore, StoreState};
pub use settings::Settings;
pub use store::Backends;

use deletion::DeletionCoordinator;
use filter::FilterEngine;
use guard::InFlight;
use resolver::NameCache;

#[derive(Clone)]
struct Session {
    user_id: String,
    records: Arc<RecordStore>,
    /// Pipelines of `submit_report` calls that have not yet succeeded, by
    /// field id. A retry sends the report they still hold.
    submissions: Arc<Mutex<HashMap<String, Arc<SubmissionPipeline>>>>,
}

pub struct RecordsEngine {
    backends: Backends,
    settings: Settings,
    classifier: CostClassifier,
    filter: FilterEngine,
    inflight: InFlight,
    deletion: DeletionCoordinator,
    session: Mutex<Option<Session>>,
}

impl RecordsEngine {
    pub fn new(backends: Backends, settings: Settings) -> Self {
        Self::with_classifier(backends, settings, CostClassifier::new())
    }

    pub fn with_classifier(backends: Backends, settings: Settings, classifier: CostClassifier) -> Self {
        let inflight = InFlight::new();
        Self {
            deletion: DeletionCoordinator::new(
                backends.store.clone(),
                inflight.clone(),
                settings.verify_after_delete,
            ),
            filter: FilterEngine::new(classifier.clone(), settings.week_days),
            backends,
            settings,
            classifier,
            inflight,
            session: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn session(&self) -> Result<Session> {
        self.lock().clone().ok_or_else(|| {
            RecordsError::InvalidState("record store is not initialized".to_string())
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn classifier(&self) -> &CostClassifier {
        &self.classifier
    }

    /// Subscribe to `user_id`'s records, replacing any previous session.
    /// Each session gets its own field-name cache.
    pub async fn initialize_record_store(&self, user_id: &str) -> Result<Arc<RecordStore>> {
        self.shutdown();
        let records = Arc::new(
            RecordStore::initialize(self.backends.store.clone(), user_id, NameCache::new()).await?,
        );
        *self.lock() = Some(Session {
            user_id: user_id.to_string(),
            records: records.clone(),
            submissions: Arc::default(),
        });
        Ok(records)
    }

    pub fn record_store(&self) -> Option<Arc<RecordStore>> {
        self.lock().as_ref().map(|s| s.records.clone())
    }

    /// Current cached list; empty before initialization.
    pub fn records(&self) -> Arc<Vec<Record>> {
        self.record_store()
            .map(|rs| rs.current_list())
            .unwrap_or_default()
    }

    pub fn apply_filter(&self, state: &FilterState) -> FilteredView {
        self.filter.apply(&self.records(), state)
    }

    pub async fn delete_record(&self, record_id: &str) -> Result<DeleteOutcome> {
        let session = self.session()?;
        self.deletion
            .delete_record(&session.user_id, record_id, session.records.as_ref())
            .await
    }

    /// A submission flow owned by the current user, for step-by-step use.
    pub fn submission(&self) -> Result<SubmissionPipeline> {
        let session = self.session()?;
        Ok(self.pipeline_for(&session))
    }

    fn pipeline_for(&self, session: &Session) -> SubmissionPipeline {
        SubmissionPipeline::new(
            self.backends.clone(),
            self.classifier.clone(),
            self.settings.clone(),
            &session.user_id,
            self.inflight.clone(),
        )
    }

    /// Select, assemble and send in one call. After a failed send the
    /// assembled report is kept, and the next call for the same field sends
    /// it again without re-fetching.
    pub async fn submit_report(&self, field_id: &str) -> Result<SubmissionReceipt> {
        let session = self.session()?;
        let pipeline = session
            .submissions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(field_id.to_string())
            .or_insert_with(|| Arc::new(self.pipeline_for(&session)))
            .clone();

        match pipeline.state() {
            SubmissionState::Previewing(_) | SubmissionState::Sending(_) => {
                log::debug!("Resending held report for field {field_id}");
            }
            _ => {
                pipeline.select_field(field_id)?;
                pipeline.preview().await?;
            }
        }
        let receipt = pipeline.send().await?;
        session
            .submissions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(field_id);
        Ok(receipt)
    }

    pub fn export_csv(&self, state: &FilterState) -> Result<String> {
        let view = self.apply_filter(state);
        render::tabular::to_csv(&view, &self.classifier, &self.settings.currency)
    }

    pub fn print_view(&self, state: &FilterState) -> String {
        let view = self.apply_filter(state);
        render::tabular::print_view(
            &view,
            &self.classifier,
            state,
            &self.settings.currency,
            Local::now(),
        )
    }

    /// Stop the live subscription, if any.
    pub fn shutdown(&self) {
        if let Some(session) = self.lock().take() {
            session.records.unsubscribe();
        }
    }
}

impl Drop for RecordsEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryArtifactStore, MemoryNotifier, MemoryStore};
    use crate::store::{bought_items_path, StoreError, FIELDS, RECORDS, REPORTS};
    use serde_json::json;
    use std::time::Duration;

    fn engine() -> (MemoryStore, MemoryNotifier, RecordsEngine) {
        let (store, _, notifier, engine) = engine_parts();
        (store, notifier, engine)
    }

    fn engine_parts() -> (MemoryStore, MemoryArtifactStore, MemoryNotifier, RecordsEngine) {
        let store = MemoryStore::new();
        store.insert(FIELDS, "f1", json!({"fieldName": "North Block"}));
        store.insert(RECORDS, "r1", json!({
            "userId": "u1", "fieldId": "f1", "taskType": "Planting", "status": "Planted",
            "recordDate": "2025-02-01", "data": {"laborCost": 50, "fertilizerCost": 100}
        }));
        store.insert(RECORDS, "r2", json!({
            "userId": "u1", "fieldId": "f1", "taskType": "Hauling", "status": "Harvested",
            "recordDate": "2025-09-01", "fuelCost": 75
        }));
        store.insert(RECORDS, "x", json!({"userId": "u2", "fieldId": "f1"}));
        store.insert(&bought_items_path("r1"), "i1", json!({"totalCost": 30}));
        let artifacts = MemoryArtifactStore::new();
        let notifier = MemoryNotifier::new();
        let backends = Backends {
            store: Arc::new(store.clone()),
            artifacts: Arc::new(artifacts.clone()),
            notifier: Arc::new(notifier.clone()),
        };
        let engine = RecordsEngine::new(backends, Settings::default());
        (store, artifacts, notifier, engine)
    }

    async fn wait_until(engine: &RecordsEngine, pred: impl Fn(&[Record]) -> bool) {
        let rs = engine.record_store().unwrap();
        let mut changes = rs.changes();
        tokio::time::timeout(Duration::from_secs(2), async {
            while !pred(&engine.records()) {
                if changes.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_operations_before_initialize() {
        let (_, _, engine) = engine();
        assert!(engine.records().is_empty());
        assert!(matches!(engine.delete_record("r1").await, Err(RecordsError::InvalidState(_))));
        assert!(matches!(engine.submit_report("f1").await, Err(RecordsError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_end_to_end() {
        let _ = env_logger::try_init();
        let (store, notifier, engine) = engine();
        engine.initialize_record_store("u1").await.unwrap();

        let ids: Vec<String> = engine.records().iter().map(|r| r.id.clone()).collect();
        assert_eq!(ids, ["r2", "r1"]);
        assert_eq!(engine.records()[1].field_name, "North Block");

        let fuel = FilterState { cost_category: CostCategory::Fuel, ..Default::default() };
        let view = engine.apply_filter(&fuel);
        assert_eq!(view.len(), 1);
        assert_eq!(view[0].id, "r2");
        assert!(engine.export_csv(&fuel).unwrap().contains("\"75.00\""));
        assert!(engine.print_view(&FilterState::default()).contains("PHP 255.00"));

        let receipt = engine.submit_report("f1").await.unwrap();
        assert_eq!(receipt.record_count, 3);
        assert_eq!(store.documents(REPORTS).len(), 1);
        assert_eq!(notifier.events().len(), 1);

        let outcome = engine.delete_record("r1").await.unwrap();
        assert_eq!(outcome, DeleteOutcome::Deleted { partial: None });
        wait_until(&engine, |records| records.iter().all(|r| r.id != "r1")).await;
        assert_eq!(engine.records().len(), 1);

        // Gone from both store and cache now.
        assert_eq!(engine.delete_record("r1").await.unwrap(), DeleteOutcome::AlreadyGone);
    }

    #[tokio::test]
    async fn test_submit_retry_reuses_assembled_report() {
        let (store, artifacts, notifier, engine) = engine_parts();
        engine.initialize_record_store("u1").await.unwrap();

        artifacts.fail_uploads(Some(StoreError::Unavailable("bucket down".into())));
        let err = engine.submit_report("f1").await.unwrap_err();
        assert!(matches!(err, RecordsError::UploadFailure(_)));

        store.fail_reads(RECORDS, StoreError::Unavailable("offline".into()));
        store.fail_reads(FIELDS, StoreError::Unavailable("offline".into()));
        artifacts.fail_uploads(None);
        let receipt = engine.submit_report("f1").await.unwrap();
        assert_eq!(receipt.record_count, 3);
        assert_eq!(notifier.events().len(), 1);

        // Once sent, the next submission assembles afresh.
        assert!(engine.submit_report("f1").await.is_err());
        store.clear_failures();
        assert!(engine.submit_report("f1").await.is_ok());
        assert_eq!(store.documents(REPORTS).len(), 2);
    }

    #[tokio::test]
    async fn test_cannot_delete_other_users_record() {
        let (_, _, engine) = engine();
        engine.initialize_record_store("u1").await.unwrap();
        let err = engine.delete_record("x").await.unwrap_err();
        assert!(matches!(err, RecordsError::PermissionDenied { .. }));
    }

    #[tokio::test]
    async fn test_shutdown_closes_subscription() {
        let (store, _, engine) = engine();
        let rs = engine.initialize_record_store("u1").await.unwrap();
        engine.shutdown();
        assert_eq!(rs.state(), StoreState::Unsubscribed);
        assert!(engine.records().is_empty());
        store.insert(RECORDS, "r3", json!({"userId": "u1"}));
        tokio::task::yield_now().await;
        assert_eq!(rs.current_list().len(), 2);
    }
}
