//! Queue store abstraction and the in-memory implementation.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use larder_core::{JobId, OwnerId, SharedClock, SystemClock};

use super::payload::JobPayload;
use super::types::{
    average_latency_ms, Job, JobCounts, JobState, QueueMetrics, QueueName, StallOutcome,
    LATENCY_SAMPLE,
};

/// Queue store error.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum QueueError {
    #[error("queue store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("invalid transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: JobId,
        from: JobState,
        to: JobState,
    },
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("lease lost for job {job_id} (attempt {attempt} was superseded)")]
    LeaseLost { job_id: JobId, attempt: u32 },
    #[error("job serialization failed: {0}")]
    Serialization(String),
}

/// Result of one stall sweep over a lane.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StallSweep {
    pub requeued: Vec<JobId>,
    pub exhausted: Vec<JobId>,
}

impl StallSweep {
    pub fn is_empty(&self) -> bool {
        self.requeued.is_empty() && self.exhausted.is_empty()
    }
}

/// How many terminal jobs a lane keeps. `None` keeps everything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub keep_completed: Option<usize>,
    pub keep_failed: Option<usize>,
}

impl RetentionPolicy {
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn with_keep_completed(mut self, n: usize) -> Self {
        self.keep_completed = Some(n);
        self
    }

    pub fn with_keep_failed(mut self, n: usize) -> Self {
        self.keep_failed = Some(n);
        self
    }

    fn limit_for(&self, state: JobState) -> Option<usize> {
        match state {
            JobState::Completed => self.keep_completed,
            JobState::Failed => self.keep_failed,
            _ => None,
        }
    }
}

/// Durable multi-consumer work distribution, one FIFO-ish list per lane.
///
/// `claim_next` is the only cross-worker critical section and must be atomic
/// in the implementation, never emulated with read-then-write.
#[async_trait]
pub trait QueueStore: Send + Sync + 'static {
    /// Add a job in the `waiting` state.
    async fn enqueue(&self, owner_id: OwnerId, payload: JobPayload) -> Result<JobId, QueueError>;

    /// Atomically move the next `waiting` job of `queue` to `active`.
    async fn claim_next(&self, queue: QueueName, lease: Duration) -> Result<Option<Job>, QueueError>;

    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, QueueError>;

    /// Jobs of `queue` in any of `states` (all states when empty), oldest first.
    async fn get_jobs(
        &self,
        queue: QueueName,
        states: &[JobState],
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Job>, QueueError>;

    /// `active -> completed` for the claim identified by `attempt`.
    async fn mark_completed(
        &self,
        job_id: JobId,
        attempt: u32,
        result: serde_json::Value,
    ) -> Result<Job, QueueError>;

    /// `active -> failed` for the claim identified by `attempt`.
    async fn mark_failed(&self, job_id: JobId, attempt: u32, reason: String) -> Result<Job, QueueError>;

    async fn get_counts(&self, queue: QueueName) -> Result<JobCounts, QueueError>;

    /// Requeue `active` jobs whose lease expired; fail the ones that already
    /// used `max_attempts` claims.
    async fn requeue_stalled(&self, queue: QueueName, max_attempts: u32) -> Result<StallSweep, QueueError>;

    /// Remove every job of `queue`. Returns how many were removed.
    async fn obliterate(&self, queue: QueueName) -> Result<u64, QueueError>;

    /// Counts plus average latency of recently completed jobs.
    async fn metrics(&self, queue: QueueName) -> Result<QueueMetrics, QueueError> {
        let counts = self.get_counts(queue).await?;
        let completed = self
            .get_jobs(queue, &[JobState::Completed], 0, usize::MAX)
            .await?;
        Ok(QueueMetrics {
            queue,
            counts,
            avg_latency_ms: average_latency_ms(&completed, LATENCY_SAMPLE),
        })
    }
}

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<JobId, Job>,
    waiting: HashMap<QueueName, VecDeque<JobId>>,
}

impl Inner {
    fn job_mut(&mut self, job_id: JobId) -> Result<&mut Job, QueueError> {
        self.jobs.get_mut(&job_id).ok_or(QueueError::NotFound(job_id))
    }

    fn prune(&mut self, queue: QueueName, state: JobState, retention: &RetentionPolicy) {
        let Some(keep) = retention.limit_for(state) else {
            return;
        };

        let mut terminal: Vec<(chrono::DateTime<chrono::Utc>, JobId)> = self
            .jobs
            .values()
            .filter(|j| j.queue == queue && j.state == state)
            .map(|j| (j.finished_at.unwrap_or(j.enqueued_at), j.id))
            .collect();
        if terminal.len() <= keep {
            return;
        }

        terminal.sort();
        let excess = terminal.len() - keep;
        for (_, id) in terminal.into_iter().take(excess) {
            self.jobs.remove(&id);
        }
        debug!(queue = %queue, state = %state, removed = excess, "pruned terminal jobs");
    }
}

/// In-memory queue store for tests/dev and single-process deployments.
pub struct InMemoryQueueStore {
    inner: Mutex<Inner>,
    clock: SharedClock,
    retention: RetentionPolicy,
}

impl std::fmt::Debug for InMemoryQueueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryQueueStore")
            .field("jobs", &self.inner.lock().jobs.len())
            .field("retention", &self.retention)
            .finish()
    }
}

impl InMemoryQueueStore {
    pub fn new() -> Self {
        Self::with_clock(SystemClock::shared())
    }

    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            clock,
            retention: RetentionPolicy::default(),
        }
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn finish(
        &self,
        job_id: JobId,
        apply: impl FnOnce(&mut Job) -> Result<(), QueueError>,
    ) -> Result<Job, QueueError> {
        let mut inner = self.inner.lock();
        let job = inner.job_mut(job_id)?;
        apply(job)?;
        let job = job.clone();
        inner.prune(job.queue, job.state, &self.retention);
        Ok(job)
    }
}

impl Default for InMemoryQueueStore {
    fn default() -> Self {
        Self::new()
    }
}

fn lease_duration(lease: Duration) -> chrono::Duration {
    chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::days(1))
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn enqueue(&self, owner_id: OwnerId, payload: JobPayload) -> Result<JobId, QueueError> {
        let job = Job::new(owner_id, payload, self.clock.now());
        let id = job.id;
        let queue = job.queue;

        let mut inner = self.inner.lock();
        inner.jobs.insert(id, job);
        inner.waiting.entry(queue).or_default().push_back(id);
        Ok(id)
    }

    async fn claim_next(&self, queue: QueueName, lease: Duration) -> Result<Option<Job>, QueueError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let Inner { jobs, waiting } = &mut *inner;
        let Some(lane) = waiting.get_mut(&queue) else {
            return Ok(None);
        };

        // Entries can go stale (obliterated or pruned jobs); skip them.
        while let Some(id) = lane.pop_front() {
            if let Some(job) = jobs.get_mut(&id) {
                if job.state == JobState::Waiting {
                    job.claim(now, lease_duration(lease))?;
                    return Ok(Some(job.clone()));
                }
            }
        }
        Ok(None)
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, QueueError> {
        Ok(self.inner.lock().jobs.get(&job_id).cloned())
    }

    async fn get_jobs(
        &self,
        queue: QueueName,
        states: &[JobState],
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Job>, QueueError> {
        let inner = self.inner.lock();
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| j.queue == queue && (states.is_empty() || states.contains(&j.state)))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.enqueued_at.cmp(&b.enqueued_at).then(a.id.cmp(&b.id)));
        Ok(jobs.into_iter().skip(offset).take(limit).collect())
    }

    async fn mark_completed(
        &self,
        job_id: JobId,
        attempt: u32,
        result: serde_json::Value,
    ) -> Result<Job, QueueError> {
        let now = self.clock.now();
        self.finish(job_id, |job| job.complete(attempt, result, now))
    }

    async fn mark_failed(&self, job_id: JobId, attempt: u32, reason: String) -> Result<Job, QueueError> {
        let now = self.clock.now();
        self.finish(job_id, |job| job.fail(attempt, reason, now))
    }

    async fn get_counts(&self, queue: QueueName) -> Result<JobCounts, QueueError> {
        let inner = self.inner.lock();
        let mut counts = JobCounts::default();
        for job in inner.jobs.values().filter(|j| j.queue == queue) {
            counts.record(job.state);
        }
        Ok(counts)
    }

    async fn requeue_stalled(&self, queue: QueueName, max_attempts: u32) -> Result<StallSweep, QueueError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let mut sweep = StallSweep::default();

        let mut expired: Vec<&mut Job> = inner
            .jobs
            .values_mut()
            .filter(|j| j.queue == queue && j.lease_expired(now))
            .collect();
        expired.sort_by_key(|j| j.enqueued_at);

        for job in expired {
            match job.sweep_stalled(now, max_attempts) {
                Some(StallOutcome::Requeued) => sweep.requeued.push(job.id),
                Some(StallOutcome::Exhausted) => sweep.exhausted.push(job.id),
                None => {}
            }
        }

        let lane = inner.waiting.entry(queue).or_default();
        lane.extend(sweep.requeued.iter().copied());
        if !sweep.exhausted.is_empty() {
            inner.prune(queue, JobState::Failed, &self.retention);
        }
        Ok(sweep)
    }

    async fn obliterate(&self, queue: QueueName) -> Result<u64, QueueError> {
        let mut inner = self.inner.lock();
        let before = inner.jobs.len();
        inner.jobs.retain(|_, j| j.queue != queue);
        inner.waiting.remove(&queue);
        Ok((before - inner.jobs.len()) as u64)
    }
}
