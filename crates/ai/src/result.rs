use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unit used when the model does not report one.
pub const DEFAULT_UNIT: &str = "pcs";

/// One item the vision model found on a receipt / shelf photo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedItem {
    pub name: String,
    pub quantity: f64,
    pub unit: String,
    /// Model confidence in \[0, 1\], when the service reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

impl ExtractedItem {
    pub fn new(name: impl Into<String>, quantity: f64, unit: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            quantity,
            unit: unit.into(),
            confidence: None,
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    /// Clean up raw model output.
    ///
    /// - names are trimmed; items with an empty name are dropped
    /// - quantities are rounded to a whole count of at least 1
    /// - a blank unit becomes [`DEFAULT_UNIT`]
    /// - confidence is clamped into \[0, 1\]
    pub fn normalized(self) -> Option<Self> {
        let name = self.name.trim().to_string();
        if name.is_empty() {
            return None;
        }

        let quantity = if self.quantity.is_finite() {
            self.quantity.round().max(1.0)
        } else {
            1.0
        };

        let unit = match self.unit.trim() {
            "" => DEFAULT_UNIT.to_string(),
            u => u.to_string(),
        };

        let confidence = self
            .confidence
            .filter(|c| c.is_finite())
            .map(|c| c.clamp(0.0, 1.0));

        Some(Self {
            name,
            quantity,
            unit,
            confidence,
        })
    }
}

/// Output of `analyze_image`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ImageAnalysis {
    pub raw_text: String,
    pub items: Vec<ExtractedItem>,
}

impl ImageAnalysis {
    /// Normalise every item, dropping the unusable ones.
    pub fn normalized_items(&self) -> Vec<ExtractedItem> {
        self.items
            .iter()
            .cloned()
            .filter_map(ExtractedItem::normalized)
            .collect()
    }
}

/// Output of `chat_complete`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub content: String,
    /// Names of tools the model invoked while answering.
    #[serde(default)]
    pub tool_calls: Vec<String>,
}

impl ChatResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InferenceError {
    #[error("inference service rate limited the request")]
    RateLimited,

    #[error("inference request timed out")]
    Timeout,

    #[error("inference service returned a malformed response: {0}")]
    InvalidResponse(String),

    #[error("inference service unavailable: {0}")]
    Unavailable(String),
}
