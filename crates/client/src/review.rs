//! Turning a finished OCR job into add-item requests.
//!
//! Extracted items are only suggestions; the caller picks the ones to keep
//! and hands the resulting requests to [`crate::spawn_batch`].

use larder_ai::ExtractedItem;
use serde::{Deserialize, Serialize};

use crate::transport::TransportError;
use crate::types::{JobStatusResponse, RemoteJobState};

const OCR_NOTE: &str = "Added via OCR Scan";

/// Body of `POST /inventories/{id}/items`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddItemRequest {
    pub name: String,
    pub quantity: f64,
    pub unit: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl From<&ExtractedItem> for AddItemRequest {
    fn from(item: &ExtractedItem) -> Self {
        Self {
            name: item.name.clone(),
            quantity: item.quantity,
            unit: item.unit.clone(),
            notes: Some(review_note(item.confidence)),
        }
    }
}

/// `Added via OCR Scan (93% conf)`, or without the suffix when the model
/// gave no confidence.
pub fn review_note(confidence: Option<f64>) -> String {
    match confidence {
        Some(c) => format!("{OCR_NOTE} ({}% conf)", (c.clamp(0.0, 1.0) * 100.0).round() as u32),
        None => OCR_NOTE.to_string(),
    }
}

/// Items of a completed image job, normalized. Anything else is a parse
/// error: the caller should only review completed jobs.
pub fn extracted_items(status: &JobStatusResponse) -> Result<Vec<ExtractedItem>, TransportError> {
    if status.status != RemoteJobState::Completed {
        return Err(TransportError::Parse(format!(
            "job {} is not completed",
            status.job_id
        )));
    }

    let Some(items) = status.result.as_ref().and_then(|r| r.get("items")) else {
        return Ok(Vec::new());
    };

    let items: Vec<ExtractedItem> =
        serde_json::from_value(items.clone()).map_err(|e| TransportError::Parse(e.to_string()))?;

    Ok(items.into_iter().filter_map(ExtractedItem::normalized).collect())
}
