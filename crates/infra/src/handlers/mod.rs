//! Per-lane job handlers.
//!
//! Each handler validates its payload, calls out to collaborators and returns
//! the lane's output. Audit records written as a side effect of OCR / AI jobs
//! are best effort: a failed audit write is logged and the job still succeeds.

pub mod ai_analysis;
pub mod audit;
pub mod image_ocr;

pub use ai_analysis::AiAnalysisHandler;
pub use audit::AuditHandler;
pub use image_ocr::ImageOcrHandler;

use larder_core::OwnerId;
use serde_json::Value;
use tracing::warn;

use crate::jobs::Job;
use crate::storage::AuditLog;

/// Record an audit entry without letting a failure affect the job.
pub(crate) async fn record_side_effect(audit: &dyn AuditLog, job: &Job, owner_id: OwnerId, action: &str, details: Value) {
    if let Err(e) = audit.record(owner_id, action, details).await {
        warn!(queue = %job.queue, job_id = %job.id, action, error = %e, "audit write failed");
    }
}
