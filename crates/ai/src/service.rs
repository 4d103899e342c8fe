use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::result::{ChatResponse, ImageAnalysis, InferenceError};

/// A tool the model may call during `chat_complete`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON schema of the tool arguments.
    pub parameters: serde_json::Value,
}

/// Vision / LLM inference collaborator.
///
/// Implementations talk to an external service and may be slow (tens of
/// seconds) or fail; callers run them inside queue workers only.
#[async_trait]
pub trait InferenceService: Send + Sync + 'static {
    /// Extract text and food items from an uploaded image.
    async fn analyze_image(&self, image_ref: &str) -> Result<ImageAnalysis, InferenceError>;

    /// Run a prompt to completion.
    async fn chat_complete(
        &self,
        prompt: &str,
        tools: &[ToolSpec],
    ) -> Result<ChatResponse, InferenceError>;
}
