//! Client-side job types.
//!
//! [`JobStatusResponse`] mirrors the API's status body. [`JobHandle`] is the
//! caller's local record of a job it is waiting on; it is not the
//! authoritative job, only what this process has observed.

use std::fmt;

use chrono::{DateTime, Utc};
use larder_core::{InventoryId, JobId};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

/// Prefix of handle ids that never exist on the server.
pub const LOCAL_PREFIX: &str = "task-";

/// Server-side job state as it appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteJobState {
    Waiting,
    Active,
    Completed,
    Failed,
}

impl RemoteJobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RemoteJobState::Completed | RemoteJobState::Failed)
    }
}

/// Body of `GET /jobs/{queue}/{job_id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusResponse {
    pub job_id: JobId,
    pub queue: String,
    pub status: RemoteJobState,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub owner_context: Option<InventoryId>,
}

/// Locally mirrored status of a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandleStatus {
    Active,
    Completed,
    Failed,
}

impl HandleStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, HandleStatus::Active)
    }
}

/// Identifier of a tracked handle: a server job id, or a `task-` id for
/// work that only exists in this process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandleId(String);

impl HandleId {
    pub fn remote(job_id: JobId) -> Self {
        Self(job_id.to_string())
    }

    /// A fresh local id, `task-<uuid>`.
    pub fn local() -> Self {
        Self(format!("{LOCAL_PREFIX}{}", Uuid::now_v7()))
    }

    pub fn is_local(&self) -> bool {
        self.0.starts_with(LOCAL_PREFIX)
    }

    /// The server job id, unless this id is locally namespaced.
    pub fn job_id(&self) -> Option<JobId> {
        if self.is_local() {
            return None;
        }
        self.0.parse().ok()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<JobId> for HandleId {
    fn from(value: JobId) -> Self {
        Self::remote(value)
    }
}

/// Where a handle's status comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum HandleOrigin {
    /// Polled from the status endpoint of `queue`.
    Remote { queue: String },
    /// Settled by a task running in this process.
    Local,
}

/// One in-flight job as seen by this client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobHandle {
    pub id: HandleId,
    pub origin: HandleOrigin,
    pub status: HandleStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub owner_context: Option<InventoryId>,
    pub created_at: DateTime<Utc>,
    pub terminal_at: Option<DateTime<Utc>>,
    /// Set together with the transition into a terminal status.
    pub notified: bool,
}

impl JobHandle {
    pub fn new(id: HandleId, origin: HandleOrigin, owner_context: Option<InventoryId>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            origin,
            status: HandleStatus::Active,
            result: None,
            error: None,
            owner_context,
            created_at: now,
            terminal_at: None,
            notified: false,
        }
    }

    /// Whether the registry tick may ask the server about this handle.
    pub fn is_pollable(&self) -> bool {
        self.status == HandleStatus::Active
            && matches!(self.origin, HandleOrigin::Remote { .. })
            && !self.id.is_local()
    }

    /// Move into a terminal status. Returns the notification to dispatch the
    /// first time only; later calls leave the handle untouched.
    pub fn settle(
        &mut self,
        status: HandleStatus,
        result: Option<Value>,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> Option<JobNotification> {
        if self.notified || !status.is_terminal() {
            return None;
        }

        self.status = status;
        self.result = result;
        self.error = error;
        self.terminal_at = Some(now);
        self.notified = true;

        Some(JobNotification {
            id: self.id.clone(),
            status,
            result: self.result.clone(),
            error: self.error.clone(),
            owner_context: self.owner_context,
        })
    }
}

/// "Job ready" event, sent once per handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobNotification {
    pub id: HandleId,
    pub status: HandleStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub owner_context: Option<InventoryId>,
}

/// Aggregate of a batch run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub success_count: usize,
    pub fail_count: usize,
}

impl BatchOutcome {
    pub fn to_value(self) -> Value {
        json!({ "success_count": self.success_count, "fail_count": self.fail_count })
    }

    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }
}
