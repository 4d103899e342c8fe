use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use larder_ai::{InferenceService, ToolSpec};

use super::record_side_effect;
use crate::jobs::{AiAction, AiOutput, HandlerError, Job, JobHandler, JobOutput, JobPayload, QueueName};
use crate::storage::AuditLog;

/// `ai-analysis`: run one LLM action.
pub struct AiAnalysisHandler {
    inference: Arc<dyn InferenceService>,
    audit: Arc<dyn AuditLog>,
}

impl AiAnalysisHandler {
    pub fn new(inference: Arc<dyn InferenceService>, audit: Arc<dyn AuditLog>) -> Self {
        Self { inference, audit }
    }
}

fn prompt_for(action: &AiAction) -> (String, Vec<ToolSpec>) {
    match action {
        AiAction::GenerateInsights { query } => (
            format!("Answer the following question about the user's food inventory:\n{query}"),
            vec![ToolSpec {
                name: "list_inventory_items".to_string(),
                description: "List the items currently stored in the user's inventories".to_string(),
                parameters: json!({"type": "object", "properties": {}}),
            }],
        ),
        AiAction::AnalyzeWaste { data } => (
            format!(
                "Analyze the following consumption data and predict which items are likely to go to waste:\n{data}"
            ),
            Vec::new(),
        ),
    }
}

/// Audit action recorded when `action` finishes.
pub fn completed_action(action: &AiAction) -> String {
    format!("AI_{}_COMPLETED", action.name())
}

#[async_trait]
impl JobHandler for AiAnalysisHandler {
    fn queue(&self) -> QueueName {
        QueueName::AiAnalysis
    }

    async fn handle(&self, job: &Job) -> Result<JobOutput, HandlerError> {
        let JobPayload::AiAnalysis(action) = &job.payload else {
            return Err(HandlerError::InvalidPayload(format!(
                "expected an ai-analysis payload, got {}",
                job.payload.queue()
            )));
        };
        job.payload
            .validate()
            .map_err(|e| HandlerError::InvalidPayload(e.to_string()))?;

        let (prompt, tools) = prompt_for(action);
        let response = self.inference.chat_complete(&prompt, &tools).await?;

        record_side_effect(
            self.audit.as_ref(),
            job,
            job.owner_id,
            &completed_action(action),
            json!({ "job_id": job.id }),
        )
        .await;

        Ok(JobOutput::Ai(AiOutput {
            action: action.name().to_string(),
            response: response.content,
        }))
    }
}
