use serde::{Deserialize, Serialize};

use larder_core::JobId;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct CreateInventoryRequest {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct WastePredictionRequest {
    pub data: serde_json::Value,
}

// -------------------------
// Response DTOs
// -------------------------

/// `202 Accepted` body for anything that enqueues a job.
#[derive(Debug, Serialize)]
pub struct JobAccepted {
    pub job_id: JobId,
}
