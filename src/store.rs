//! Contracts for the collaborators this crate consumes: the document store,
//! the artifact store and the notification sink.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;
use thiserror::Error;

pub type Fields = serde_json::Map<String, Value>;

pub const RECORDS: &str = "records";
pub const FIELDS: &str = "fields";
pub const REPORTS: &str = "field_reports";

pub fn bought_items_path(record_id: &str) -> String {
    format!("{RECORDS}/{record_id}/bought_items")
}

pub fn vehicle_updates_path(record_id: &str) -> String {
    format!("{RECORDS}/{record_id}/vehicle_updates")
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("{0}")]
    Other(String),
}

/// A stored document: its id within the collection plus its raw fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub fields: Fields,
}

impl Document {
    pub fn new(id: impl Into<String>, fields: Fields) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub field: String,
    pub direction: Direction,
}

/// Equality-filtered, optionally ordered query over one collection.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub collection: String,
    pub filters: Vec<(String, Value)>,
    pub order_by: Option<OrderBy>,
}

impl Query {
    pub fn collection(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            filters: Vec::new(),
            order_by: None,
        }
    }

    pub fn where_eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push((field.into(), value.into()));
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.order_by = Some(OrderBy {
            field: field.into(),
            direction,
        });
        self
    }

    /// The same query with its ordering clause removed.
    pub fn unordered(&self) -> Self {
        Self {
            order_by: None,
            ..self.clone()
        }
    }

    pub fn matches(&self, doc: &Document) -> bool {
        self.filters
            .iter()
            .all(|(field, value)| doc.fields.get(field) == Some(value))
    }
}

/// Push stream of full query snapshots. An `Err` item ends the subscription.
pub type SnapshotStream = BoxStream<'static, Result<Vec<Document>, StoreError>>;

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Open a push subscription. Rejection of the ordering clause may surface
    /// either here or as the first item of the stream.
    async fn subscribe(&self, query: Query) -> Result<SnapshotStream, StoreError>;

    async fn get_one(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError>;

    async fn get_many(&self, query: Query) -> Result<Vec<Document>, StoreError>;

    async fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError>;

    /// Write a document; `None` lets the store allocate the id.
    async fn put(&self, collection: &str, id: Option<&str>, fields: Fields)
        -> Result<String, StoreError>;
}

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Persist bytes under `path` and return a URL the reviewer can open.
    async fn upload(&self, path: &str, bytes: Vec<u8>, content_type: &str)
        -> Result<String, StoreError>;
}

/// Who a notification is addressed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Audience {
    Role(String),
    User(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct NotificationEvent {
    pub audience: Audience,
    pub kind: String,
    pub title: String,
    pub message: String,
    pub related_ids: Vec<String>,
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn publish(&self, event: NotificationEvent) -> Result<(), StoreError>;
}

/// The three external collaborators, bundled for injection.
#[derive(Clone)]
pub struct Backends {
    pub store: Arc<dyn DocumentStore>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub notifier: Arc<dyn NotificationSink>,
}
