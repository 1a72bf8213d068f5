//! Field report submission: select a field, preview the assembled report,
//! then send it to the reviewers.
//!
//! Sending renders from the held [`Report`], never from a fresh fetch, so a
//! failed send can simply be retried from the same preview.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Local;
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::assembler::{Report, ReportAssembler};
use crate::classifier::CostClassifier;
use crate::error::{RecordsError, Result};
use crate::fmt::money;
use crate::guard::{InFlight, Operation};
use crate::render::ReportDocument;
use crate::settings::Settings;
use crate::store::{Audience, Backends, NotificationEvent, REPORTS};

pub const REPORT_SUBMITTED: &str = "field_report_submitted";
pub const PENDING_REVIEW: &str = "pending_review";

#[derive(Debug, Clone, PartialEq)]
pub struct SubmissionReceipt {
    pub report_id: String,
    pub field_id: String,
    pub artifact_url: String,
    pub artifact_path: String,
    pub artifact_sha256: String,
    pub record_count: usize,
    pub grand_total: f64,
}

#[derive(Debug, Clone)]
pub enum SubmissionState {
    Idle,
    FieldSelected(String),
    Previewing(Arc<Report>),
    Sending(Arc<Report>),
    Sent(SubmissionReceipt),
}

impl SubmissionState {
    fn name(&self) -> &'static str {
        match self {
            SubmissionState::Idle => "idle",
            SubmissionState::FieldSelected(_) => "field selected",
            SubmissionState::Previewing(_) => "previewing",
            SubmissionState::Sending(_) => "sending",
            SubmissionState::Sent(_) => "sent",
        }
    }
}

pub struct SubmissionPipeline {
    backends: Backends,
    assembler: ReportAssembler,
    classifier: CostClassifier,
    settings: Settings,
    owner: String,
    inflight: InFlight,
    state: Mutex<SubmissionState>,
}

impl SubmissionPipeline {
    pub fn new(
        backends: Backends,
        classifier: CostClassifier,
        settings: Settings,
        owner: &str,
        inflight: InFlight,
    ) -> Self {
        Self {
            assembler: ReportAssembler::new(backends.store.clone(), classifier.clone()),
            backends,
            classifier,
            settings,
            owner: owner.to_string(),
            inflight,
            state: Mutex::new(SubmissionState::Idle),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SubmissionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> SubmissionState {
        self.lock().clone()
    }

    /// The report currently on preview, if any.
    pub fn report(&self) -> Option<Arc<Report>> {
        match &*self.lock() {
            SubmissionState::Previewing(r) | SubmissionState::Sending(r) => Some(r.clone()),
            _ => None,
        }
    }

    pub fn select_field(&self, field_id: &str) -> Result<()> {
        let mut state = self.lock();
        if let SubmissionState::Sending(_) = *state {
            return Err(RecordsError::InvalidState(
                "cannot change field while a report is sending".to_string(),
            ));
        }
        *state = SubmissionState::FieldSelected(field_id.to_string());
        Ok(())
    }

    /// Assemble the selected field's report and hold it for preview.
    pub async fn preview(&self) -> Result<Arc<Report>> {
        let field_id = match &*self.lock() {
            SubmissionState::FieldSelected(id) => id.clone(),
            SubmissionState::Previewing(r) => r.field.id.clone(),
            other => {
                return Err(RecordsError::InvalidState(format!(
                    "cannot preview while {}",
                    other.name()
                )))
            }
        };
        let report = Arc::new(self.assembler.assemble(&field_id).await?);
        let mut state = self.lock();
        // A field change during assembly wins over this result.
        match &*state {
            SubmissionState::FieldSelected(id) if *id == field_id => {}
            SubmissionState::Previewing(r) if r.field.id == field_id => {}
            _ => {
                return Err(RecordsError::InvalidState(
                    "selection changed while assembling".to_string(),
                ))
            }
        }
        *state = SubmissionState::Previewing(report.clone());
        Ok(report)
    }

    pub fn document(&self, report: &Report) -> ReportDocument {
        ReportDocument::build(report, &self.classifier, &self.settings.currency)
    }

    /// Render, upload, record and announce the previewed report. Any failure
    /// puts the same report back on preview and returns a retryable error.
    pub async fn send(&self) -> Result<SubmissionReceipt> {
        let report = self.report_on_preview()?;
        let _guard = self.inflight.try_acquire(Operation::Submit, &report.field.id)?;
        *self.lock() = SubmissionState::Sending(report.clone());
        let rollback = Rollback {
            pipeline: self,
            report: Some(report.clone()),
        };
        log::info!("Submitting report for field {}", report.field.id);

        match self.deliver(&report).await {
            Ok(receipt) => {
                log::info!("Report {} submitted for review", receipt.report_id);
                rollback.disarm();
                *self.lock() = SubmissionState::Sent(receipt.clone());
                Ok(receipt)
            }
            Err(e) => {
                log::warn!("Report submission failed, back to preview: {e}");
                Err(e)
            }
        }
    }

    fn report_on_preview(&self) -> Result<Arc<Report>> {
        match &*self.lock() {
            SubmissionState::Previewing(r) => Ok(r.clone()),
            SubmissionState::Sending(r) => Err(RecordsError::AlreadyInFlight(format!(
                "submit {}",
                r.field.id
            ))),
            other => Err(RecordsError::InvalidState(format!(
                "cannot send while {}",
                other.name()
            ))),
        }
    }

    async fn deliver(&self, report: &Report) -> Result<SubmissionReceipt> {
        let artifact = self.document(report).render_artifact().map_err(|e| match e {
            RecordsError::RenderFailure(_) => e,
            other => RecordsError::RenderFailure(other.to_string()),
        })?;
        let sha256 = hex::encode(Sha256::digest(&artifact.bytes));
        let path = format!(
            "{}/{}/{}.{}",
            self.settings.artifact_prefix,
            report.field.id,
            Local::now().format("%Y%m%d-%H%M%S"),
            artifact.extension
        );
        log::debug!("Rendered {} bytes for {path}", artifact.bytes.len());

        let url = self
            .backends
            .artifacts
            .upload(&path, artifact.bytes, artifact.content_type)
            .await
            .map_err(|e| RecordsError::UploadFailure(e.to_string()))?;

        let s = &report.summary;
        let metadata = json!({
            "fieldId": report.field.id,
            "fieldName": report.field.name,
            "handlerId": self.owner,
            "recordCount": report.records.len(),
            "costSummary": {
                "totalTaskCost": s.total_task_cost,
                "totalBoughtItemsCost": s.total_bought_items_cost,
                "totalVehicleCost": s.total_vehicle_cost,
                "fuelCost": s.breakdown.fuel,
                "laborCost": s.breakdown.labor,
                "otherCost": s.breakdown.other,
                "grandTotal": s.grand_total,
            },
            "artifactUrl": url,
            "artifactPath": path,
            "artifactSha256": sha256,
            "status": PENDING_REVIEW,
            "submittedAt": Local::now().to_rfc3339(),
        });
        let fields = match metadata {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        let report_id = self
            .backends
            .store
            .put(REPORTS, None, fields)
            .await
            .map_err(|e| RecordsError::Unavailable(format!("saving report metadata: {e}")))?;

        let event = NotificationEvent {
            audience: Audience::Role(self.settings.reviewer_role.clone()),
            kind: REPORT_SUBMITTED.to_string(),
            title: "New field report".to_string(),
            message: format!(
                "Report for {} submitted with {} records, total {}",
                report.field.name,
                report.records.len(),
                money(s.grand_total, &self.settings.currency)
            ),
            related_ids: vec![report_id.clone(), report.field.id.clone()],
        };
        self.backends
            .notifier
            .publish(event)
            .await
            .map_err(|e| RecordsError::Unavailable(format!("notifying reviewers: {e}")))?;

        Ok(SubmissionReceipt {
            report_id,
            field_id: report.field.id.clone(),
            artifact_url: url,
            artifact_path: path,
            artifact_sha256: sha256,
            record_count: report.records.len(),
            grand_total: s.grand_total,
        })
    }
}

/// Puts the report back on preview when a send fails or its future is
/// dropped mid-flight. Disarmed once the send has succeeded.
struct Rollback<'a> {
    pipeline: &'a SubmissionPipeline,
    report: Option<Arc<Report>>,
}

impl Rollback<'_> {
    fn disarm(mut self) {
        self.report = None;
    }
}

impl Drop for Rollback<'_> {
    fn drop(&mut self) {
        if let Some(report) = self.report.take() {
            let mut state = self.pipeline.lock();
            if let SubmissionState::Sending(_) = *state {
                *state = SubmissionState::Previewing(report);
            }
        }
    }
}
