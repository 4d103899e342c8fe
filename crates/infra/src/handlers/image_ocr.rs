use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use larder_ai::InferenceService;

use super::record_side_effect;
use crate::jobs::{HandlerError, Job, JobHandler, JobOutput, JobPayload, OcrOutput, QueueName};
use crate::storage::AuditLog;

pub const OCR_PROCESSED: &str = "OCR_PROCESSED";

/// `image-processing`: extract items from an uploaded image.
///
/// Items are returned for a review step and never written to the inventory
/// here.
pub struct ImageOcrHandler {
    inference: Arc<dyn InferenceService>,
    audit: Arc<dyn AuditLog>,
}

impl ImageOcrHandler {
    pub fn new(inference: Arc<dyn InferenceService>, audit: Arc<dyn AuditLog>) -> Self {
        Self { inference, audit }
    }
}

#[async_trait]
impl JobHandler for ImageOcrHandler {
    fn queue(&self) -> QueueName {
        QueueName::ImageProcessing
    }

    async fn handle(&self, job: &Job) -> Result<JobOutput, HandlerError> {
        let JobPayload::ImageProcessing(payload) = &job.payload else {
            return Err(HandlerError::InvalidPayload(format!(
                "expected an image-processing payload, got {}",
                job.payload.queue()
            )));
        };
        job.payload
            .validate()
            .map_err(|e| HandlerError::InvalidPayload(e.to_string()))?;

        let analysis = self.inference.analyze_image(&payload.image_url).await?;
        let items = analysis.normalized_items();
        debug!(job_id = %job.id, extracted = analysis.items.len(), kept = items.len(), "image analysed");

        record_side_effect(
            self.audit.as_ref(),
            job,
            job.owner_id,
            OCR_PROCESSED,
            json!({
                "job_id": job.id,
                "items_found": items.len(),
                "inventory_id": payload.inventory_id,
            }),
        )
        .await;

        Ok(JobOutput::Ocr(OcrOutput {
            items,
            raw_text: analysis.raw_text,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::payload::ImageOcrPayload;
    use crate::storage::{InMemoryAuditLog, StoreError};
    use chrono::Utc;
    use larder_ai::{ExtractedItem, ImageAnalysis, InferenceError, LocalInference};
    use larder_core::{InventoryId, OwnerId};

    struct BrokenAudit;

    #[async_trait]
    impl AuditLog for BrokenAudit {
        async fn record(&self, _: OwnerId, _: &str, _: serde_json::Value) -> Result<crate::storage::AuditEntry, StoreError> {
            Err(StoreError::Unavailable("disk full".into()))
        }

        async fn entries_for(&self, _: OwnerId) -> Result<Vec<crate::storage::AuditEntry>, StoreError> {
            Ok(Vec::new())
        }
    }

    fn job(url: &str, inventory_id: InventoryId) -> Job {
        Job::new(
            OwnerId::new(),
            JobPayload::ImageProcessing(ImageOcrPayload {
                image_url: url.into(),
                inventory_id,
            }),
            Utc::now(),
        )
    }

    fn receipt() -> ImageAnalysis {
        ImageAnalysis {
            raw_text: "MILK 2\nBREAD".into(),
            items: vec![
                ExtractedItem::new("Milk", 1.7, "l").with_confidence(0.9),
                ExtractedItem::new("Bread", 0.0, ""),
                ExtractedItem::new(" ", 1.0, "pcs"),
            ],
        }
    }

    #[tokio::test]
    async fn returns_normalised_items_and_records_audit() {
        let inference = Arc::new(LocalInference::new().with_analysis("mem://r", receipt()));
        let audit = Arc::new(InMemoryAuditLog::new());
        let handler = ImageOcrHandler::new(inference, audit.clone());
        let inventory = InventoryId::new();
        let job = job("mem://r", inventory);

        let JobOutput::Ocr(out) = handler.handle(&job).await.unwrap() else {
            panic!("wrong output variant");
        };
        assert_eq!(out.items.len(), 2);
        assert_eq!(out.items[0].quantity, 2.0);
        assert_eq!(out.items[1].unit, "pcs");
        assert_eq!(out.items[1].quantity, 1.0);

        let entries = audit.entries_for(job.owner_id).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, OCR_PROCESSED);
        assert_eq!(entries[0].details["items_found"], 2);
        assert_eq!(entries[0].details["inventory_id"], serde_json::json!(inventory));
    }

    #[tokio::test]
    async fn audit_failure_does_not_fail_the_job() {
        let inference = Arc::new(LocalInference::new().with_default_analysis(receipt()));
        let handler = ImageOcrHandler::new(inference, Arc::new(BrokenAudit));

        assert!(handler.handle(&job("mem://x", InventoryId::new())).await.is_ok());
    }

    #[tokio::test]
    async fn inference_errors_become_handler_errors() {
        let inference = Arc::new(LocalInference::new());
        inference.fail_next(InferenceError::InvalidResponse("not json".into()));
        let handler = ImageOcrHandler::new(inference, Arc::new(InMemoryAuditLog::new()));

        let err = handler.handle(&job("mem://x", InventoryId::new())).await.unwrap_err();
        assert!(matches!(err, HandlerError::Inference(InferenceError::InvalidResponse(_))));
        assert!(err.to_string().contains("not json"));
    }
}
