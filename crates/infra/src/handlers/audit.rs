use std::sync::Arc;

use async_trait::async_trait;

use crate::jobs::{AuditOutput, HandlerError, Job, JobHandler, JobOutput, JobPayload, QueueName};
use crate::storage::AuditLog;

/// `audit-logging`: persist one audit entry. A failed write fails the job.
pub struct AuditHandler {
    audit: Arc<dyn AuditLog>,
}

impl AuditHandler {
    pub fn new(audit: Arc<dyn AuditLog>) -> Self {
        Self { audit }
    }
}

#[async_trait]
impl JobHandler for AuditHandler {
    fn queue(&self) -> QueueName {
        QueueName::AuditLogging
    }

    async fn handle(&self, job: &Job) -> Result<JobOutput, HandlerError> {
        let JobPayload::AuditLogging(payload) = &job.payload else {
            return Err(HandlerError::InvalidPayload(format!(
                "expected an audit-logging payload, got {}",
                job.payload.queue()
            )));
        };

        let entry = self
            .audit
            .record(job.owner_id, &payload.action, payload.details.clone())
            .await?;
        Ok(JobOutput::Audit(AuditOutput { entry_id: entry.id }))
    }
}
