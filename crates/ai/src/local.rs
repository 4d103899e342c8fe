//! In-process inference double for development and tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::result::{ChatResponse, ImageAnalysis, InferenceError};
use crate::service::{InferenceService, ToolSpec};

/// Deterministic [`InferenceService`].
///
/// - `analyze_image` answers from a per-image-ref table, falling back to a
///   default analysis (empty unless configured).
/// - `chat_complete` echoes a summary of the prompt unless replies are queued.
/// - Queued failures are returned first, one per call, for either operation.
#[derive(Debug, Default)]
pub struct LocalInference {
    analyses: Mutex<HashMap<String, ImageAnalysis>>,
    default_analysis: Mutex<ImageAnalysis>,
    chat_replies: Mutex<VecDeque<ChatResponse>>,
    failures: Mutex<VecDeque<InferenceError>>,
    latency: Mutex<Option<Duration>>,
    image_calls: AtomicUsize,
    chat_calls: AtomicUsize,
}

impl LocalInference {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_analysis(self, image_ref: impl Into<String>, analysis: ImageAnalysis) -> Self {
        self.analyses.lock().insert(image_ref.into(), analysis);
        self
    }

    pub fn with_default_analysis(self, analysis: ImageAnalysis) -> Self {
        *self.default_analysis.lock() = analysis;
        self
    }

    pub fn with_chat_reply(self, reply: ChatResponse) -> Self {
        self.chat_replies.lock().push_back(reply);
        self
    }

    /// Simulated service latency applied to every call.
    pub fn with_latency(self, latency: Duration) -> Self {
        *self.latency.lock() = Some(latency);
        self
    }

    /// Make the next call (of either kind) fail with `err`.
    pub fn fail_next(&self, err: InferenceError) {
        self.failures.lock().push_back(err);
    }

    pub fn image_calls(&self) -> usize {
        self.image_calls.load(Ordering::SeqCst)
    }

    pub fn chat_calls(&self) -> usize {
        self.chat_calls.load(Ordering::SeqCst)
    }

    async fn simulate(&self) -> Result<(), InferenceError> {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        match self.failures.lock().pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl InferenceService for LocalInference {
    async fn analyze_image(&self, image_ref: &str) -> Result<ImageAnalysis, InferenceError> {
        self.image_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate().await?;

        let known = self.analyses.lock().get(image_ref).cloned();
        Ok(known.unwrap_or_else(|| self.default_analysis.lock().clone()))
    }

    async fn chat_complete(
        &self,
        prompt: &str,
        tools: &[ToolSpec],
    ) -> Result<ChatResponse, InferenceError> {
        self.chat_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate().await?;

        if let Some(reply) = self.chat_replies.lock().pop_front() {
            return Ok(reply);
        }

        tracing::debug!(tools = tools.len(), "local inference echoing prompt");
        Ok(ChatResponse::text(format!(
            "analysis of {} character prompt",
            prompt.chars().count()
        )))
    }
}
