//! Per-lane payload and output shapes.
//!
//! Every lane has exactly one payload type and one output type; the queue
//! store only sees the tagged [`JobPayload`] and the serialised output.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use larder_ai::ExtractedItem;
use larder_core::{AuditEntryId, DomainError, DomainResult, InventoryId};

use super::types::QueueName;

/// `image-processing`: OCR an uploaded image into reviewable items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageOcrPayload {
    pub image_url: String,
    pub inventory_id: InventoryId,
}

/// `ai-analysis`: one of the supported LLM actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AiAction {
    GenerateInsights { query: String },
    AnalyzeWaste { data: Value },
}

impl AiAction {
    pub fn name(&self) -> &'static str {
        match self {
            AiAction::GenerateInsights { .. } => "GENERATE_INSIGHTS",
            AiAction::AnalyzeWaste { .. } => "ANALYZE_WASTE",
        }
    }
}

/// `audit-logging`: persist one audit entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditPayload {
    pub action: String,
    #[serde(default)]
    pub details: Value,
}

impl AuditPayload {
    pub fn new(action: impl Into<String>, details: Value) -> Self {
        Self {
            action: action.into(),
            details,
        }
    }
}

/// Payload tagged by lane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "queue", content = "data", rename_all = "kebab-case")]
pub enum JobPayload {
    ImageProcessing(ImageOcrPayload),
    AiAnalysis(AiAction),
    AuditLogging(AuditPayload),
}

impl JobPayload {
    pub fn queue(&self) -> QueueName {
        match self {
            JobPayload::ImageProcessing(_) => QueueName::ImageProcessing,
            JobPayload::AiAnalysis(_) => QueueName::AiAnalysis,
            JobPayload::AuditLogging(_) => QueueName::AuditLogging,
        }
    }

    /// Parse an untyped request body for `queue` and validate it.
    pub fn from_json(queue: QueueName, body: Value) -> DomainResult<Self> {
        let payload = match queue {
            QueueName::ImageProcessing => {
                JobPayload::ImageProcessing(decode::<ImageOcrPayload>(queue, body)?)
            }
            QueueName::AiAnalysis => JobPayload::AiAnalysis(decode::<AiAction>(queue, body)?),
            QueueName::AuditLogging => {
                JobPayload::AuditLogging(decode::<AuditPayload>(queue, body)?)
            }
        };
        payload.validate()?;
        Ok(payload)
    }

    pub fn validate(&self) -> DomainResult<()> {
        match self {
            JobPayload::ImageProcessing(p) => {
                if p.image_url.trim().is_empty() {
                    return Err(DomainError::validation("image_url must not be empty"));
                }
            }
            JobPayload::AiAnalysis(AiAction::GenerateInsights { query }) => {
                if query.trim().is_empty() {
                    return Err(DomainError::validation("query must not be empty"));
                }
            }
            JobPayload::AiAnalysis(AiAction::AnalyzeWaste { data }) => {
                if data.is_null() {
                    return Err(DomainError::validation("data must be provided"));
                }
            }
            JobPayload::AuditLogging(p) => {
                if p.action.trim().is_empty() {
                    return Err(DomainError::validation("action must not be empty"));
                }
            }
        }
        Ok(())
    }

    /// Routing context surfaced to the client with the job status.
    pub fn owner_context(&self) -> Option<InventoryId> {
        match self {
            JobPayload::ImageProcessing(p) => Some(p.inventory_id),
            _ => None,
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(queue: QueueName, body: Value) -> DomainResult<T> {
    serde_json::from_value(body)
        .map_err(|e| DomainError::validation(format!("invalid {queue} payload: {e}")))
}

/// `image-processing` output: items for a review step, never auto-applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrOutput {
    pub items: Vec<ExtractedItem>,
    pub raw_text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiOutput {
    pub action: String,
    pub response: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditOutput {
    pub entry_id: AuditEntryId,
}

/// Output produced by a handler, one variant per lane.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum JobOutput {
    Ocr(OcrOutput),
    Ai(AiOutput),
    Audit(AuditOutput),
}

impl JobOutput {
    pub fn queue(&self) -> QueueName {
        match self {
            JobOutput::Ocr(_) => QueueName::ImageProcessing,
            JobOutput::Ai(_) => QueueName::AiAnalysis,
            JobOutput::Audit(_) => QueueName::AuditLogging,
        }
    }

    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}
