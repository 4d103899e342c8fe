//! Queue worker runtime.
//!
//! A [`Worker`] drains one lane: it claims jobs from the [`QueueStore`],
//! runs the lane's [`JobHandler`] with bounded concurrency and always records
//! a terminal state, even when the handler errors, panics or times out.
//! A periodic stall sweep returns jobs whose lease expired (crashed or hung
//! workers) to `waiting`, failing them once the attempt budget is spent.

use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use larder_ai::InferenceError;
use larder_core::JobId;

use super::payload::JobOutput;
use super::store::{QueueError, QueueStore};
use super::types::{Job, QueueName};
use crate::storage::StoreError;

/// Failure of a handler. Always converted into a job failure reason.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("inference failed: {0}")]
    Inference(#[from] InferenceError),
    #[error("storage failed: {0}")]
    Store(#[from] StoreError),
    #[error("{0}")]
    Other(String),
}

/// Per-lane job handler.
///
/// Handlers must tolerate re-execution: a stalled job that is requeued may
/// run twice.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    fn queue(&self) -> QueueName;

    async fn handle(&self, job: &Job) -> Result<JobOutput, HandlerError>;
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Name for logging
    pub name: String,
    /// Maximum handler invocations in flight
    pub concurrency: usize,
    /// Idle delay between claim attempts when the lane is empty
    pub poll_interval: Duration,
    /// How long a claim stays valid before the job counts as stalled
    pub lease_timeout: Duration,
    /// How often the stall sweep runs
    pub sweep_interval: Duration,
    /// Claims allowed per job before a stall fails it for good
    pub max_attempts: u32,
    /// Handler wall-clock budget; exceeding it fails the job
    pub handler_timeout: Option<Duration>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "worker".to_string(),
            concurrency: 2,
            poll_interval: Duration::from_millis(250),
            lease_timeout: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(30),
            max_attempts: 3,
            handler_timeout: None,
        }
    }
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_lease_timeout(mut self, lease: Duration) -> Self {
        self.lease_timeout = lease;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = Some(timeout);
        self
    }
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct WorkerStats {
    pub jobs_claimed: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub jobs_requeued: u64,
    pub jobs_exhausted: u64,
    pub leases_lost: u64,
    pub in_flight: usize,
    pub uptime_secs: u64,
}

/// How one execution ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Execution {
    Completed(JobId),
    Failed(JobId, String),
    /// The terminal write was rejected (lease lost / store error).
    Unrecorded(JobId),
}

/// Handle to control a running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerHandle {
    /// Stop claiming and wait for in-flight jobs to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.join.await {
            error!(error = %e, "worker task ended abnormally");
        }
    }

    /// Stop claiming without waiting.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats.lock().clone()
    }
}

/// Drains one lane with one handler.
pub struct Worker {
    store: Arc<dyn QueueStore>,
    handler: Arc<dyn JobHandler>,
    config: WorkerConfig,
    stats: Arc<Mutex<WorkerStats>>,
}

impl Worker {
    pub fn new(store: Arc<dyn QueueStore>, handler: Arc<dyn JobHandler>, config: WorkerConfig) -> Self {
        Self {
            store,
            handler,
            config,
            stats: Arc::new(Mutex::new(WorkerStats::default())),
        }
    }

    pub fn queue(&self) -> QueueName {
        self.handler.queue()
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats.lock().clone()
    }

    /// Claim and execute at most one job inline.
    pub async fn process_next(&self) -> Result<Option<Execution>, QueueError> {
        let Some(job) = self
            .store
            .claim_next(self.queue(), self.config.lease_timeout)
            .await?
        else {
            return Ok(None);
        };
        self.stats.lock().jobs_claimed += 1;
        Ok(Some(self.execute(job).await))
    }

    /// Run one stall sweep over the lane.
    pub async fn sweep_stalled(&self) -> Result<(), QueueError> {
        let queue = self.queue();
        let sweep = self
            .store
            .requeue_stalled(queue, self.config.max_attempts)
            .await?;

        for job_id in &sweep.requeued {
            warn!(worker = %self.config.name, queue = %queue, job_id = %job_id, "requeued stalled job");
        }
        for job_id in &sweep.exhausted {
            error!(worker = %self.config.name, queue = %queue, job_id = %job_id, "stalled job exhausted its attempts");
        }

        let mut s = self.stats.lock();
        s.jobs_requeued += sweep.requeued.len() as u64;
        s.jobs_exhausted += sweep.exhausted.len() as u64;
        Ok(())
    }

    /// Spawn the claim loop and the stall sweep onto the tokio runtime.
    pub fn spawn(self) -> WorkerHandle {
        let cancel = CancellationToken::new();
        let stats = self.stats.clone();
        let worker = Arc::new(self);
        let join = tokio::spawn(worker.run(cancel.clone()));

        WorkerHandle {
            cancel,
            join,
            stats,
        }
    }

    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let queue = self.queue();
        let name = self.config.name.clone();
        info!(worker = %name, queue = %queue, concurrency = self.config.concurrency, "worker started");

        let started = Instant::now();
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut tasks: JoinSet<()> = JoinSet::new();
        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            while let Some(res) = tasks.try_join_next() {
                if let Err(e) = res {
                    error!(worker = %name, error = %e, "job task ended abnormally");
                }
            }
            self.stats.lock().uptime_secs = started.elapsed().as_secs();

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sweep.tick() => {
                    if let Err(e) = self.sweep_stalled().await {
                        warn!(worker = %name, queue = %queue, error = %e, "stall sweep failed");
                    }
                }
                permit = semaphore.clone().acquire_owned() => {
                    let Ok(permit) = permit else { break };

                    match self.store.claim_next(queue, self.config.lease_timeout).await {
                        Ok(Some(job)) => {
                            debug!(worker = %name, queue = %queue, job_id = %job.id, attempt = job.attempts, "claimed job");
                            {
                                let mut s = self.stats.lock();
                                s.jobs_claimed += 1;
                                s.in_flight += 1;
                            }
                            let worker = self.clone();
                            tasks.spawn(async move {
                                worker.execute(job).await;
                                worker.stats.lock().in_flight -= 1;
                                drop(permit);
                            });
                        }
                        Ok(None) => {
                            drop(permit);
                            idle(&cancel, self.config.poll_interval).await;
                        }
                        Err(e) => {
                            drop(permit);
                            warn!(worker = %name, queue = %queue, error = %e, "claim failed");
                            idle(&cancel, self.config.poll_interval).await;
                        }
                    }
                }
            }
        }

        info!(worker = %name, queue = %queue, in_flight = tasks.len(), "worker stopping");
        while let Some(res) = tasks.join_next().await {
            if let Err(e) = res {
                error!(worker = %name, error = %e, "job task ended abnormally");
            }
        }
        info!(worker = %name, queue = %queue, "worker stopped");
    }

    /// Run the handler and record the terminal state.
    async fn execute(&self, job: Job) -> Execution {
        let job_id = job.id;
        let attempt = job.attempts;

        let outcome = self.invoke(job).await;
        let (write, execution) = match outcome {
            Ok(value) => (
                self.store.mark_completed(job_id, attempt, value).await,
                Execution::Completed(job_id),
            ),
            Err(reason) => (
                self.store.mark_failed(job_id, attempt, reason.clone()).await,
                Execution::Failed(job_id, reason),
            ),
        };

        let queue = self.queue();
        let name = &self.config.name;
        match write {
            Ok(_) => {
                let mut s = self.stats.lock();
                match &execution {
                    Execution::Completed(_) => {
                        s.jobs_completed += 1;
                        info!(worker = %name, queue = %queue, job_id = %job_id, attempt, "job completed");
                    }
                    Execution::Failed(_, reason) => {
                        s.jobs_failed += 1;
                        warn!(worker = %name, queue = %queue, job_id = %job_id, attempt, reason = %reason, "job failed");
                    }
                    Execution::Unrecorded(_) => {}
                }
                execution
            }
            Err(QueueError::LeaseLost { .. }) | Err(QueueError::InvalidTransition { .. }) => {
                self.stats.lock().leases_lost += 1;
                warn!(worker = %name, queue = %queue, job_id = %job_id, attempt, "lease lost; result discarded");
                Execution::Unrecorded(job_id)
            }
            Err(e) => {
                // The job stays active; the stall sweep will pick it up.
                error!(worker = %name, queue = %queue, job_id = %job_id, attempt, error = %e, "failed to record terminal state");
                Execution::Unrecorded(job_id)
            }
        }
    }

    /// Handler output as JSON, or a human-readable failure reason.
    async fn invoke(&self, job: Job) -> Result<serde_json::Value, String> {
        let handler = self.handler.clone();
        let queue = job.queue;
        let task = tokio::spawn(async move { handler.handle(&job).await });
        let abort = task.abort_handle();

        let joined = match self.config.handler_timeout {
            Some(limit) => match tokio::time::timeout(limit, task).await {
                Ok(joined) => joined,
                Err(_) => {
                    abort.abort();
                    return Err(format!("handler timed out after {}s", limit.as_secs_f64()));
                }
            },
            None => task.await,
        };

        match joined {
            Ok(Ok(output)) if output.queue() != queue => Err(format!(
                "handler returned {} output for a {queue} job",
                output.queue()
            )),
            Ok(Ok(output)) => output
                .to_value()
                .map_err(|e| format!("failed to serialise job result: {e}")),
            Ok(Err(e)) => Err(e.to_string()),
            Err(e) if e.is_panic() => Err(format!("handler panicked: {}", panic_message(e.into_panic()))),
            Err(e) => Err(format!("handler task aborted: {e}")),
        }
    }
}

async fn idle(cancel: &CancellationToken, delay: Duration) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = tokio::time::sleep(delay) => {}
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::payload::{AuditOutput, AuditPayload, JobPayload};
    use crate::jobs::store::InMemoryQueueStore;
    use crate::jobs::types::JobState;
    use larder_core::{AuditEntryId, ManualClock, OwnerId};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Handler scripted by the audit action in the payload.
    struct Scripted {
        calls: AtomicUsize,
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Scripted {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                running: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl JobHandler for Scripted {
        fn queue(&self) -> QueueName {
            QueueName::AuditLogging
        }

        async fn handle(&self, job: &Job) -> Result<JobOutput, HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            let JobPayload::AuditLogging(p) = &job.payload else {
                return Err(HandlerError::InvalidPayload("not an audit job".into()));
            };
            let result = match p.action.as_str() {
                "slow" => {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok(JobOutput::Audit(AuditOutput { entry_id: AuditEntryId::new() }))
                }
                "hang" => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(JobOutput::Audit(AuditOutput { entry_id: AuditEntryId::new() }))
                }
                "error" => Err(HandlerError::Inference(InferenceError::RateLimited)),
                "panic" => panic!("handler blew up"),
                _ => Ok(JobOutput::Audit(AuditOutput { entry_id: AuditEntryId::new() })),
            };
            self.running.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }

    fn audit(action: &str) -> JobPayload {
        JobPayload::AuditLogging(AuditPayload::new(action, serde_json::json!({})))
    }

    async fn wait_terminal(store: &InMemoryQueueStore, id: JobId) -> Job {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let job = store.get_job(id).await.unwrap().unwrap();
                if job.state.is_terminal() {
                    return job;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("job did not reach a terminal state")
    }

    #[tokio::test]
    async fn handler_errors_and_panics_become_failure_reasons() {
        let store = Arc::new(InMemoryQueueStore::new());
        let worker = Worker::new(store.clone(), Scripted::new(), WorkerConfig::default());
        let owner = OwnerId::new();

        let ok = store.enqueue(owner, audit("ok")).await.unwrap();
        let err = store.enqueue(owner, audit("error")).await.unwrap();
        let boom = store.enqueue(owner, audit("panic")).await.unwrap();

        assert_eq!(worker.process_next().await.unwrap(), Some(Execution::Completed(ok)));
        assert!(matches!(worker.process_next().await.unwrap(), Some(Execution::Failed(id, _)) if id == err));
        assert!(matches!(worker.process_next().await.unwrap(), Some(Execution::Failed(id, _)) if id == boom));
        assert_eq!(worker.process_next().await.unwrap(), None);

        let failed = store.get_job(err).await.unwrap().unwrap();
        assert_eq!(failed.state, JobState::Failed);
        assert!(failed.failure_reason.unwrap().contains("rate limited"));

        let panicked = store.get_job(boom).await.unwrap().unwrap();
        assert!(panicked.failure_reason.unwrap().contains("handler blew up"));

        let done = store.get_job(ok).await.unwrap().unwrap();
        assert!(done.result.unwrap().get("entry_id").is_some());

        let stats = worker.stats();
        assert_eq!((stats.jobs_completed, stats.jobs_failed), (1, 2));
    }

    /// Registered for the audit lane but answers like an AI handler.
    struct Misrouted;

    #[async_trait]
    impl JobHandler for Misrouted {
        fn queue(&self) -> QueueName {
            QueueName::AuditLogging
        }

        async fn handle(&self, _job: &Job) -> Result<JobOutput, HandlerError> {
            Ok(JobOutput::Ai(crate::jobs::payload::AiOutput {
                action: "GENERATE_INSIGHTS".into(),
                response: "wrong lane".into(),
            }))
        }
    }

    #[tokio::test]
    async fn output_for_another_lane_fails_the_job() {
        let store = Arc::new(InMemoryQueueStore::new());
        let worker = Worker::new(store.clone(), Arc::new(Misrouted), WorkerConfig::default());
        let id = store.enqueue(OwnerId::new(), audit("ok")).await.unwrap();

        let exec = worker.process_next().await.unwrap().unwrap();
        assert!(matches!(exec, Execution::Failed(_, ref r) if r.contains("ai-analysis output")));

        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert!(job.result.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn handler_timeout_fails_the_job() {
        let store = Arc::new(InMemoryQueueStore::new());
        let config = WorkerConfig::default().with_handler_timeout(Duration::from_secs(5));
        let worker = Worker::new(store.clone(), Scripted::new(), config);
        let id = store.enqueue(OwnerId::new(), audit("hang")).await.unwrap();

        let exec = worker.process_next().await.unwrap().unwrap();
        assert!(matches!(exec, Execution::Failed(_, ref r) if r.contains("timed out")));
        assert_eq!(store.get_job(id).await.unwrap().unwrap().state, JobState::Failed);
    }

    #[tokio::test]
    async fn spawned_worker_respects_concurrency_limit() {
        let store = Arc::new(InMemoryQueueStore::new());
        let handler = Scripted::new();
        let config = WorkerConfig::default()
            .with_concurrency(2)
            .with_poll_interval(Duration::from_millis(5));
        let handle = Worker::new(store.clone(), handler.clone(), config).spawn();

        let owner = OwnerId::new();
        let mut ids = Vec::new();
        for _ in 0..6 {
            ids.push(store.enqueue(owner, audit("slow")).await.unwrap());
        }
        for id in ids {
            assert_eq!(wait_terminal(&store, id).await.state, JobState::Completed);
        }

        assert_eq!(handler.calls.load(Ordering::SeqCst), 6);
        assert!(handler.peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(handle.stats().jobs_completed, 6);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn crashed_claim_is_requeued_and_completed_by_another_worker() {
        let clock = ManualClock::starting_now();
        let store = Arc::new(InMemoryQueueStore::with_clock(clock.clone()));
        let lease = Duration::from_secs(60);
        let id = store.enqueue(OwnerId::new(), audit("ok")).await.unwrap();

        // First worker claims the job and dies without writing a result.
        let crashed = store.claim_next(QueueName::AuditLogging, lease).await.unwrap().unwrap();
        assert_eq!(crashed.id, id);

        let config = WorkerConfig::default()
            .with_lease_timeout(lease)
            .with_sweep_interval(Duration::from_millis(10))
            .with_poll_interval(Duration::from_millis(5));
        let handle = Worker::new(store.clone(), Scripted::new(), config).spawn();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.get_job(id).await.unwrap().unwrap().state, JobState::Active);

        clock.advance(lease + Duration::from_secs(1));
        let job = wait_terminal(&store, id).await;
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.attempts, 2);

        let stats = handle.stats();
        assert_eq!(stats.jobs_requeued, 1);
        handle.shutdown().await;

        // The crashed worker's late write is fenced off.
        assert!(matches!(
            store.mark_failed(id, crashed.attempts, "late".into()).await,
            Err(QueueError::LeaseLost { .. }) | Err(QueueError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn shutdown_waits_for_in_flight_jobs() {
        let store = Arc::new(InMemoryQueueStore::new());
        let config = WorkerConfig::default().with_poll_interval(Duration::from_millis(5));
        let handle = Worker::new(store.clone(), Scripted::new(), config).spawn();
        let id = store.enqueue(OwnerId::new(), audit("slow")).await.unwrap();

        loop {
            if store.get_job(id).await.unwrap().unwrap().state == JobState::Active {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        handle.shutdown().await;
        assert_eq!(store.get_job(id).await.unwrap().unwrap().state, JobState::Completed);
    }
}
