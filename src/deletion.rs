//! Owner-checked deletion of a record and its line items.
//!
//! The store is the source of truth for existence and ownership; the local
//! cache is only consulted to decide whether a missing record means "already
//! gone" or "you are looking at something stale".

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::future::join_all;

use crate::error::{PermissionReason, RecordsError, Result};
use crate::guard::{InFlight, Operation};
use crate::models::owner_of;
use crate::record_store::RecordCache;
use crate::store::{bought_items_path, vehicle_updates_path, DocumentStore, Query, StoreError, RECORDS};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteState {
    Idle,
    Deleting,
    Done,
    Failed(String),
}

/// Child documents that could not be deleted. The parent delete still went through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialFailure {
    pub failed_children: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted { partial: Option<PartialFailure> },
    /// Neither the store nor the cache had the record.
    AlreadyGone,
}

pub struct DeletionCoordinator {
    store: Arc<dyn DocumentStore>,
    inflight: InFlight,
    verify_after_delete: bool,
    states: Mutex<HashMap<String, DeleteState>>,
}

impl DeletionCoordinator {
    pub fn new(store: Arc<dyn DocumentStore>, inflight: InFlight, verify_after_delete: bool) -> Self {
        Self {
            store,
            inflight,
            verify_after_delete,
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn state(&self, record_id: &str) -> DeleteState {
        if self.inflight.is_active(Operation::Delete, record_id) {
            return DeleteState::Deleting;
        }
        self.states
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(record_id)
            .cloned()
            .unwrap_or(DeleteState::Idle)
    }

    /// Delete `record_id` on behalf of `user_id`. A second call for the same
    /// id while one is running fails with `AlreadyInFlight` without touching
    /// the store.
    pub async fn delete_record(
        &self,
        user_id: &str,
        record_id: &str,
        cache: &dyn RecordCache,
    ) -> Result<DeleteOutcome> {
        let _guard = self.inflight.try_acquire(Operation::Delete, record_id)?;
        let result = self.run(user_id, record_id, cache).await;
        let state = match &result {
            Ok(_) => DeleteState::Done,
            Err(e) => DeleteState::Failed(e.to_string()),
        };
        self.states
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(record_id.to_string(), state);
        result
    }

    async fn run(&self, user_id: &str, record_id: &str, cache: &dyn RecordCache) -> Result<DeleteOutcome> {
        let current = match self.store.get_one(RECORDS, record_id).await {
            Ok(doc) => doc,
            Err(StoreError::NotFound(_)) => None,
            Err(e) => return Err(e.into()),
        };
        let Some(doc) = current else {
            if cache.contains(record_id) {
                return Err(RecordsError::NotFound(format!(
                    "record {record_id} no longer exists in the store"
                )));
            }
            log::info!("Record {record_id} already deleted");
            return Ok(DeleteOutcome::AlreadyGone);
        };

        let owner = owner_of(&doc.fields);
        if owner.as_deref() != Some(user_id) {
            log::warn!("Refusing to delete {record_id}: owner mismatch");
            return Err(RecordsError::PermissionDenied {
                id: record_id.to_string(),
                reason: PermissionReason::WrongOwner { owner },
            });
        }

        let partial = self.delete_children(record_id).await;

        match self.store.delete(RECORDS, record_id).await {
            Ok(()) => {}
            Err(StoreError::NotFound(_)) if !cache.contains(record_id) => {
                log::info!("Record {record_id} was removed concurrently");
                return Ok(DeleteOutcome::AlreadyGone);
            }
            Err(StoreError::PermissionDenied(_)) => {
                return Err(self.explain_denial(user_id, record_id).await);
            }
            Err(e) => return Err(e.into()),
        }

        if self.verify_after_delete {
            match self.store.get_one(RECORDS, record_id).await {
                Ok(Some(_)) => {
                    log::error!("Record {record_id} still present after delete");
                    return Err(RecordsError::DeleteNotApplied(record_id.to_string()));
                }
                Ok(None) => log::debug!("Verified deletion of {record_id}"),
                Err(e) => log::debug!("Could not verify deletion of {record_id}: {e}"),
            }
        }

        log::info!("Deleted record {record_id}");
        Ok(DeleteOutcome::Deleted { partial })
    }

    /// Each child is deleted on its own; failures are collected, not raised.
    async fn delete_children(&self, record_id: &str) -> Option<PartialFailure> {
        let mut failed = Vec::new();
        let mut targets = Vec::new();
        for path in [bought_items_path(record_id), vehicle_updates_path(record_id)] {
            match self.store.get_many(Query::collection(path.clone())).await {
                Ok(docs) => targets.extend(docs.into_iter().map(|d| (path.clone(), d.id))),
                Err(e) => {
                    log::warn!("Could not list {path}: {e}");
                    failed.push(path);
                }
            }
        }

        let results = join_all(targets.iter().map(|(path, id)| async move {
            (path, id, self.store.delete(path, id).await)
        }))
        .await;
        for (path, id, result) in results {
            if let Err(e) = result {
                log::warn!("Failed to delete {path}/{id}: {e}");
                failed.push(format!("{path}/{id}"));
            }
        }

        if failed.is_empty() {
            None
        } else {
            log::warn!("{} child deletions failed for {record_id}", failed.len());
            Some(PartialFailure {
                failed_children: failed,
            })
        }
    }

    /// Re-read after a refused delete to tell a changed owner from missing rights.
    async fn explain_denial(&self, user_id: &str, record_id: &str) -> RecordsError {
        let reason = match self.store.get_one(RECORDS, record_id).await {
            Ok(Some(doc)) => {
                let owner = owner_of(&doc.fields);
                if owner.as_deref() == Some(user_id) {
                    PermissionReason::InsufficientRights
                } else {
                    PermissionReason::WrongOwner { owner }
                }
            }
            _ => PermissionReason::InsufficientRights,
        };
        RecordsError::PermissionDenied {
            id: record_id.to_string(),
            reason,
        }
    }
}
