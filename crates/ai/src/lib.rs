//! `larder-ai`
//!
//! **Responsibility:** inference collaborator boundary.
//!
//! This crate only describes what the job handlers need from a vision/LLM
//! service; it does not know about queues or storage:
//! - `analyze_image` turns an uploaded image reference into extracted items.
//! - `chat_complete` runs a prompt (optionally with tools) to a text answer.
//!
//! Failures are typed ([`InferenceError`]) so handlers can turn them into a
//! human-readable job failure reason instead of propagating them raw.

pub mod local;
pub mod result;
pub mod service;

pub use local::LocalInference;
pub use result::{ChatResponse, ExtractedItem, ImageAnalysis, InferenceError};
pub use service::{InferenceService, ToolSpec};
