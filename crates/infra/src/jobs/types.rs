//! Core job types and the job lifecycle state machine.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use larder_core::{DomainError, JobId, OwnerId};

use super::payload::JobPayload;
use super::store::QueueError;

/// Logical lane a job belongs to. Lanes are processed independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueName {
    ImageProcessing,
    AiAnalysis,
    AuditLogging,
}

impl QueueName {
    pub const ALL: [QueueName; 3] = [
        QueueName::ImageProcessing,
        QueueName::AiAnalysis,
        QueueName::AuditLogging,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::ImageProcessing => "image-processing",
            QueueName::AiAnalysis => "ai-analysis",
            QueueName::AuditLogging => "audit-logging",
        }
    }

    /// Lanes whose completed result must always carry an `items` array.
    pub fn extracts_items(&self) -> bool {
        matches!(self, QueueName::ImageProcessing)
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueName {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        QueueName::ALL
            .into_iter()
            .find(|q| q.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown queue: {s}")))
    }
}

/// Job lifecycle state: `waiting -> active -> {completed | failed}`.
///
/// The only backwards edge is the stall sweep returning an expired `active`
/// job to `waiting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(JobState::Waiting),
            "active" => Ok(JobState::Active),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            other => Err(DomainError::validation(format!("unknown job state: {other}"))),
        }
    }
}

/// A queued unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub queue: QueueName,
    pub owner_id: OwnerId,
    pub payload: JobPayload,
    pub state: JobState,
    /// Present only when `state == Completed`.
    pub result: Option<serde_json::Value>,
    /// Present only when `state == Failed`.
    pub failure_reason: Option<String>,
    /// Number of times the job has been claimed. Doubles as the lease fence.
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub lease_expires_at: Option<DateTime<Utc>>,
}

/// What the stall sweep decided for one expired job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallOutcome {
    Requeued,
    Exhausted,
}

impl Job {
    /// Create a job in the `waiting` state.
    pub fn new(owner_id: OwnerId, payload: JobPayload, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            queue: payload.queue(),
            owner_id,
            payload,
            state: JobState::Waiting,
            result: None,
            failure_reason: None,
            attempts: 0,
            enqueued_at: now,
            started_at: None,
            finished_at: None,
            lease_expires_at: None,
        }
    }

    /// `waiting -> active`. Bumps the attempt counter and starts a lease.
    pub fn claim(&mut self, now: DateTime<Utc>, lease: chrono::Duration) -> Result<(), QueueError> {
        self.expect_state(JobState::Waiting, JobState::Active)?;
        self.state = JobState::Active;
        self.attempts += 1;
        self.started_at = Some(now);
        self.lease_expires_at = Some(now + lease);
        Ok(())
    }

    /// `active -> completed`, fenced by the claim's attempt number.
    pub fn complete(
        &mut self,
        attempt: u32,
        result: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        self.check_fence(attempt, JobState::Completed)?;
        self.state = JobState::Completed;
        self.result = Some(result);
        self.finish(now);
        Ok(())
    }

    /// `active -> failed`, fenced by the claim's attempt number.
    pub fn fail(
        &mut self,
        attempt: u32,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        self.check_fence(attempt, JobState::Failed)?;
        self.fail_unfenced(reason, now);
        Ok(())
    }

    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Active && self.lease_expires_at.is_some_and(|at| at <= now)
    }

    /// Return an expired `active` job to `waiting`, or fail it once the
    /// attempt budget is spent. `None` if the lease has not expired.
    pub fn sweep_stalled(&mut self, now: DateTime<Utc>, max_attempts: u32) -> Option<StallOutcome> {
        if !self.lease_expired(now) {
            return None;
        }

        if self.attempts >= max_attempts {
            self.fail_unfenced(
                format!(
                    "job stalled and exhausted its {} attempt(s) without finishing",
                    self.attempts
                ),
                now,
            );
            return Some(StallOutcome::Exhausted);
        }

        self.state = JobState::Waiting;
        self.started_at = None;
        self.lease_expires_at = None;
        Some(StallOutcome::Requeued)
    }

    /// `finished_at - started_at` for completed jobs.
    pub fn processing_time(&self) -> Option<chrono::Duration> {
        match (self.state, self.started_at, self.finished_at) {
            (JobState::Completed, Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }

    fn fail_unfenced(&mut self, reason: impl Into<String>, now: DateTime<Utc>) {
        self.state = JobState::Failed;
        self.failure_reason = Some(reason.into());
        self.finish(now);
    }

    fn finish(&mut self, now: DateTime<Utc>) {
        self.finished_at = Some(now);
        self.lease_expires_at = None;
    }

    fn expect_state(&self, expected: JobState, to: JobState) -> Result<(), QueueError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(QueueError::InvalidTransition {
                job_id: self.id,
                from: self.state,
                to,
            })
        }
    }

    fn check_fence(&self, attempt: u32, to: JobState) -> Result<(), QueueError> {
        // A newer claim exists (or the job was requeued after this claim).
        let superseded = attempt < self.attempts
            || (self.state == JobState::Waiting && attempt > 0 && attempt == self.attempts);
        if superseded {
            return Err(QueueError::LeaseLost {
                job_id: self.id,
                attempt,
            });
        }
        self.expect_state(JobState::Active, to)?;
        if attempt != self.attempts {
            return Err(QueueError::LeaseLost {
                job_id: self.id,
                attempt,
            });
        }
        Ok(())
    }
}

/// Per-lane job counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

impl JobCounts {
    pub fn record(&mut self, state: JobState) {
        match state {
            JobState::Waiting => self.waiting += 1,
            JobState::Active => self.active += 1,
            JobState::Completed => self.completed += 1,
            JobState::Failed => self.failed += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.waiting + self.active + self.completed + self.failed
    }
}

/// Counts plus recent processing latency for one lane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueMetrics {
    pub queue: QueueName,
    pub counts: JobCounts,
    /// Mean `finished_at - started_at` over the most recent completed jobs.
    pub avg_latency_ms: Option<f64>,
}

/// Number of completed jobs sampled for [`QueueMetrics::avg_latency_ms`].
pub const LATENCY_SAMPLE: usize = 5;

/// Mean processing time of the `sample` most recently finished jobs.
pub fn average_latency_ms<'a>(jobs: impl IntoIterator<Item = &'a Job>, sample: usize) -> Option<f64> {
    let mut finished: Vec<&Job> = jobs
        .into_iter()
        .filter(|j| j.processing_time().is_some())
        .collect();
    finished.sort_by(|a, b| b.finished_at.cmp(&a.finished_at));
    finished.truncate(sample);

    if finished.is_empty() {
        return None;
    }

    let total_ms: i64 = finished
        .iter()
        .filter_map(|j| j.processing_time())
        .map(|d| d.num_milliseconds())
        .sum();
    Some(total_ms as f64 / finished.len() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::payload::AuditPayload;

    fn audit_job(now: DateTime<Utc>) -> Job {
        Job::new(
            OwnerId::new(),
            JobPayload::AuditLogging(AuditPayload::new("LOGIN", serde_json::json!({}))),
            now,
        )
    }

    #[test]
    fn queue_names_parse_and_display() {
        for q in QueueName::ALL {
            assert_eq!(q.as_str().parse::<QueueName>().unwrap(), q);
        }
        assert!("email".parse::<QueueName>().is_err());
        assert_eq!(
            serde_json::to_value(QueueName::AiAnalysis).unwrap(),
            serde_json::json!("ai-analysis")
        );
    }

    #[test]
    fn happy_path_lifecycle() {
        let now = Utc::now();
        let mut job = audit_job(now);
        assert_eq!(job.queue, QueueName::AuditLogging);

        job.claim(now, chrono::Duration::seconds(30)).unwrap();
        assert_eq!(job.state, JobState::Active);
        assert_eq!(job.attempts, 1);

        job.complete(1, serde_json::json!({"ok": true}), now + chrono::Duration::seconds(2))
            .unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert!(job.failure_reason.is_none());
        assert_eq!(job.processing_time(), Some(chrono::Duration::seconds(2)));
    }

    #[test]
    fn terminal_states_reject_further_writes() {
        let now = Utc::now();
        let mut job = audit_job(now);
        job.claim(now, chrono::Duration::seconds(30)).unwrap();
        job.fail(1, "boom", now).unwrap();

        let err = job.complete(1, serde_json::json!({}), now).unwrap_err();
        assert!(matches!(err, QueueError::InvalidTransition { from: JobState::Failed, .. }));
        assert!(job.claim(now, chrono::Duration::seconds(1)).is_err());
        assert_eq!(job.failure_reason.as_deref(), Some("boom"));
        assert!(job.result.is_none());
    }

    #[test]
    fn writing_a_waiting_job_is_invalid() {
        let now = Utc::now();
        let mut job = audit_job(now);
        let err = job.fail(0, "nope", now).unwrap_err();
        assert!(matches!(err, QueueError::InvalidTransition { from: JobState::Waiting, .. }));
    }

    #[test]
    fn stalled_job_is_requeued_then_old_lease_is_fenced() {
        let now = Utc::now();
        let lease = chrono::Duration::seconds(10);
        let mut job = audit_job(now);
        job.claim(now, lease).unwrap();

        assert_eq!(job.sweep_stalled(now + chrono::Duration::seconds(5), 3), None);
        assert_eq!(
            job.sweep_stalled(now + chrono::Duration::seconds(10), 3),
            Some(StallOutcome::Requeued)
        );
        assert_eq!(job.state, JobState::Waiting);

        // The crashed worker wakes up late.
        let err = job.complete(1, serde_json::json!({}), now).unwrap_err();
        assert!(matches!(err, QueueError::LeaseLost { attempt: 1, .. }));

        job.claim(now, lease).unwrap();
        assert!(matches!(
            job.complete(1, serde_json::json!({}), now).unwrap_err(),
            QueueError::LeaseLost { .. }
        ));
        job.complete(2, serde_json::json!({}), now).unwrap();
    }

    #[test]
    fn stall_sweep_fails_job_after_attempt_budget() {
        let now = Utc::now();
        let lease = chrono::Duration::seconds(1);
        let mut job = audit_job(now);

        job.claim(now, lease).unwrap();
        assert_eq!(job.sweep_stalled(now + lease, 2), Some(StallOutcome::Requeued));
        job.claim(now + lease, lease).unwrap();
        assert_eq!(
            job.sweep_stalled(now + lease * 2, 2),
            Some(StallOutcome::Exhausted)
        );

        assert_eq!(job.state, JobState::Failed);
        assert!(job.failure_reason.as_deref().unwrap().contains("exhausted"));
    }

    #[test]
    fn average_latency_uses_most_recent_jobs() {
        let base = Utc::now();
        let mut jobs = Vec::new();
        for (i, ms) in [1000i64, 100, 200, 300, 400, 500].into_iter().enumerate() {
            let mut job = audit_job(base);
            let start = base + chrono::Duration::seconds(i as i64 * 10);
            job.claim(start, chrono::Duration::seconds(60)).unwrap();
            job.complete(1, serde_json::json!({}), start + chrono::Duration::milliseconds(ms))
                .unwrap();
            jobs.push(job);
        }

        // The oldest (1000ms) falls outside the sample of five.
        assert_eq!(average_latency_ms(&jobs, LATENCY_SAMPLE), Some(300.0));
        assert_eq!(average_latency_ms(std::iter::empty::<&Job>(), LATENCY_SAMPLE), None);
    }
}
