//! Job status lookup with ownership check and result reshaping.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use larder_core::{InventoryId, JobId, OwnerId};

use super::store::{QueueError, QueueStore};
use super::types::{Job, JobState, QueueName};

/// Field that item-extraction lanes always carry in a completed result.
pub const ITEMS_FIELD: &str = "items";

#[derive(Debug, thiserror::Error)]
pub enum StatusError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job {0} belongs to another owner")]
    Forbidden(JobId),
    #[error(transparent)]
    Store(#[from] QueueError),
}

/// Wire view of one job's status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusView {
    pub job_id: JobId,
    pub queue: QueueName,
    pub status: JobState,
    /// Present only when completed.
    pub result: Option<Value>,
    /// Failure reason, present only when failed.
    pub error: Option<String>,
    /// Target inventory for image jobs, used to route the review step.
    pub owner_context: Option<InventoryId>,
}

impl JobStatusView {
    pub fn from_job(job: &Job) -> Self {
        let result = match job.state {
            JobState::Completed => Some(shape_result(job.queue, job.result.clone())),
            _ => None,
        };
        let error = match job.state {
            JobState::Failed => job.failure_reason.clone(),
            _ => None,
        };

        Self {
            job_id: job.id,
            queue: job.queue,
            status: job.state,
            result,
            error,
            owner_context: job.payload.owner_context(),
        }
    }
}

/// Look up `job_id` in `queue` on behalf of `requester`.
///
/// A job in a different lane is reported as not found. Ownership is checked
/// before anything about the job's state is revealed.
pub async fn get_status(
    store: &dyn QueueStore,
    queue: QueueName,
    job_id: JobId,
    requester: OwnerId,
) -> Result<JobStatusView, StatusError> {
    let job = store
        .get_job(job_id)
        .await?
        .filter(|job| job.queue == queue)
        .ok_or(StatusError::NotFound(job_id))?;

    if job.owner_id != requester {
        return Err(StatusError::Forbidden(job_id));
    }

    Ok(JobStatusView::from_job(&job))
}

/// Guarantee an `items` array on completed item-extraction results.
fn shape_result(queue: QueueName, raw: Option<Value>) -> Value {
    if !queue.extracts_items() {
        return raw.unwrap_or(Value::Null);
    }

    let mut object = match raw {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    };
    if !object.get(ITEMS_FIELD).is_some_and(Value::is_array) {
        object.insert(ITEMS_FIELD.to_string(), Value::Array(Vec::new()));
    }
    Value::Object(object)
}
