use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Local, NaiveDateTime};
use futures::future::join_all;

use crate::classifier::CostClassifier;
use crate::error::{RecordsError, Result};
use crate::loader::SubcollectionLoader;
use crate::models::{CostBreakdown, FieldProfile, Record};
use crate::store::{Direction, Document, DocumentStore, Query, StoreError, FIELDS, RECORDS};

pub const UNSPECIFIED_STATUS: &str = "Unspecified";

/// One growth stage of the field, e.g. "Planted" or "Harvested".
#[derive(Debug, Clone, PartialEq)]
pub struct TimelineEntry {
    pub status: String,
    pub earliest_date: Option<NaiveDateTime>,
    pub record_count: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CostSummary {
    pub total_task_cost: f64,
    pub total_bought_items_cost: f64,
    pub total_vehicle_cost: f64,
    pub breakdown: CostBreakdown,
    pub grand_total: f64,
}

/// Field-scoped aggregation, ready to render.
#[derive(Debug, Clone)]
pub struct Report {
    pub field: FieldProfile,
    /// Oldest first.
    pub records: Vec<Record>,
    pub timeline: Vec<TimelineEntry>,
    pub summary: CostSummary,
    pub assembled_at: DateTime<Local>,
}

impl Report {
    /// Records grouped by status, in timeline order.
    pub fn groups(&self) -> Vec<(&str, Vec<&Record>)> {
        self.timeline
            .iter()
            .map(|entry| {
                let records = self
                    .records
                    .iter()
                    .filter(|r| status_label(r) == entry.status)
                    .collect();
                (entry.status.as_str(), records)
            })
            .collect()
    }
}

pub fn status_label(record: &Record) -> &str {
    record
        .status
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(UNSPECIFIED_STATUS)
}

pub struct ReportAssembler {
    store: Arc<dyn DocumentStore>,
    loader: SubcollectionLoader,
    classifier: CostClassifier,
}

impl ReportAssembler {
    pub fn new(store: Arc<dyn DocumentStore>, classifier: CostClassifier) -> Self {
        Self {
            loader: SubcollectionLoader::new(store.clone()),
            store,
            classifier,
        }
    }

    pub async fn assemble(&self, field_id: &str) -> Result<Report> {
        let field = match self.store.get_one(FIELDS, field_id).await? {
            Some(doc) => FieldProfile::from_document(&doc),
            None => return Err(RecordsError::NotFound(format!("field {field_id}"))),
        };

        let mut records: Vec<Record> = self
            .field_records(field_id)
            .await?
            .iter()
            .map(Record::from_document)
            .collect();

        let children = join_all(records.iter().map(|r| self.loader.load(&r.id))).await;
        for (record, children) in records.iter_mut().zip(children) {
            record.field_name = field.name.clone();
            record.bought_items = children.bought_items;
            record.vehicle_update = children.vehicle_update;
        }
        records.sort_by(|a, b| {
            a.effective_date()
                .cmp(&b.effective_date())
                .then_with(|| a.id.cmp(&b.id))
        });

        let timeline = build_timeline(&records);
        let summary = summarize(&self.classifier, &records);
        log::info!(
            "Assembled report for {} ({} records, {} stages)",
            field.name,
            records.len(),
            timeline.len()
        );

        Ok(Report {
            field,
            records,
            timeline,
            summary,
            assembled_at: Local::now(),
        })
    }

    async fn field_records(&self, field_id: &str) -> Result<Vec<Document>> {
        let query = Query::collection(RECORDS)
            .where_eq("fieldId", field_id)
            .order_by("createdAt", Direction::Ascending);
        match self.store.get_many(query.clone()).await {
            Ok(docs) => Ok(docs),
            Err(StoreError::FailedPrecondition(msg)) => {
                log::warn!("Ordered field query rejected ({msg}), retrying without orderBy");
                self.store.get_many(query.unordered()).await.map_err(|e| {
                    RecordsError::Unavailable(format!("field records query failed after fallback: {e}"))
                })
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Stages ordered by when they were first reached; undated stages last.
pub fn build_timeline(records: &[Record]) -> Vec<TimelineEntry> {
    let mut groups: BTreeMap<&str, TimelineEntry> = BTreeMap::new();
    for record in records {
        let status = status_label(record);
        let date = record.effective_date();
        let entry = groups.entry(status).or_insert_with(|| TimelineEntry {
            status: status.to_string(),
            earliest_date: None,
            record_count: 0,
        });
        entry.record_count += 1;
        entry.earliest_date = match (entry.earliest_date, date) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
    }
    let mut timeline: Vec<TimelineEntry> = groups.into_values().collect();
    timeline.sort_by(|a, b| match (a.earliest_date, b.earliest_date) {
        (Some(x), Some(y)) => x.cmp(&y).then_with(|| a.status.cmp(&b.status)),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => a.status.cmp(&b.status),
    });
    timeline
}

pub fn summarize(classifier: &CostClassifier, records: &[Record]) -> CostSummary {
    let mut summary = CostSummary::default();
    for record in records {
        let costs = classifier.classify_by_source(record);
        summary.total_task_cost += costs.task.total();
        summary.total_bought_items_cost += costs.bought_items.total();
        summary.total_vehicle_cost += costs.vehicle.total();
        summary.breakdown += costs.combined();
    }
    summary.grand_total = summary.breakdown.total();
    summary
}
