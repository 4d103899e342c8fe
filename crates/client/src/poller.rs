//! Following a single job until it finishes.
//!
//! Polls the status endpoint at a fixed interval for at most
//! `max_attempts` requests and `interval * max_attempts` of wall-clock time.
//! Transport errors count as "not done yet" while budget remains, but the
//! last one is reported if it runs out.

use std::sync::Arc;
use std::time::Duration;

use larder_core::JobId;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::transport::{JobStatusTransport, TransportError};
use crate::types::{JobStatusResponse, RemoteJobState};

#[derive(Debug, Clone)]
pub struct PollConfig {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            max_attempts: 30,
        }
    }
}

impl PollConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }
}

/// How a poll run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// Completed; the body carries the result for review.
    Resolved(JobStatusResponse),
    Failed { reason: String },
    /// Attempt or time budget exhausted without a terminal status.
    TimedOut {
        attempts: u32,
        last_error: Option<TransportError>,
    },
    /// The server refused to show the job. Never retried.
    Rejected(TransportError),
    Cancelled,
}

/// Observable progress of a spawned poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Idle,
    Polling { attempt: u32 },
    Resolved,
    Failed,
    TimedOut,
    Rejected,
}

impl PollState {
    fn from_outcome(outcome: &PollOutcome) -> Option<Self> {
        match outcome {
            PollOutcome::Resolved(_) => Some(PollState::Resolved),
            PollOutcome::Failed { .. } => Some(PollState::Failed),
            PollOutcome::TimedOut { .. } => Some(PollState::TimedOut),
            PollOutcome::Rejected(_) => Some(PollState::Rejected),
            PollOutcome::Cancelled => None,
        }
    }
}

#[derive(Clone)]
pub struct JobPoller {
    transport: Arc<dyn JobStatusTransport>,
    config: PollConfig,
}

impl JobPoller {
    pub fn new(transport: Arc<dyn JobStatusTransport>, config: PollConfig) -> Self {
        Self { transport, config }
    }

    pub fn config(&self) -> &PollConfig {
        &self.config
    }

    /// Poll until terminal, rejected, out of budget or cancelled.
    ///
    /// Attempts are scheduled one interval apart starting immediately, and
    /// the whole run is bounded by `interval * max_attempts` of wall-clock
    /// time: a request still pending at that deadline is dropped and reported
    /// as [`TransportError::Timeout`]. `on_state` is not called once `cancel`
    /// has fired.
    pub async fn poll_with<F>(
        &self,
        queue: &str,
        job_id: JobId,
        cancel: &CancellationToken,
        mut on_state: F,
    ) -> PollOutcome
    where
        F: FnMut(PollState),
    {
        let started = Instant::now();
        let deadline = started + self.config.interval * self.config.max_attempts;
        let mut attempts = 0;
        let mut last_error = None;

        for attempt in 1..=self.config.max_attempts {
            // Slow answers push later attempts back; they never add budget.
            let scheduled = started + self.config.interval * (attempt - 1);
            tokio::select! {
                _ = cancel.cancelled() => return PollOutcome::Cancelled,
                _ = tokio::time::sleep_until(scheduled) => {}
            }
            if Instant::now() >= deadline {
                break;
            }
            attempts = attempt;
            on_state(PollState::Polling { attempt });

            // An in-flight request is not interrupted by `cancel`; its answer
            // is dropped.
            let response = tokio::time::timeout_at(deadline, self.transport.job_status(queue, job_id))
                .await
                .unwrap_or(Err(TransportError::Timeout));
            if cancel.is_cancelled() {
                return PollOutcome::Cancelled;
            }

            match response {
                Ok(status) => {
                    last_error = None;
                    match status.status {
                        RemoteJobState::Completed => return PollOutcome::Resolved(status),
                        RemoteJobState::Failed => {
                            return PollOutcome::Failed {
                                reason: status.error.unwrap_or_else(|| "job failed".to_string()),
                            };
                        }
                        RemoteJobState::Waiting | RemoteJobState::Active => {
                            debug!(job_id = %job_id, attempt, state = ?status.status, "job still running");
                        }
                    }
                }
                Err(e) if e.is_fatal() => {
                    warn!(job_id = %job_id, error = %e, "job status rejected");
                    return PollOutcome::Rejected(e);
                }
                Err(e) => {
                    debug!(job_id = %job_id, attempt, error = %e, "status poll failed");
                    last_error = Some(e);
                }
            }
        }

        warn!(job_id = %job_id, attempts, elapsed_ms = started.elapsed().as_millis() as u64, "gave up waiting for job");
        PollOutcome::TimedOut { attempts, last_error }
    }

    pub async fn poll(&self, queue: &str, job_id: JobId, cancel: &CancellationToken) -> PollOutcome {
        self.poll_with(queue, job_id, cancel, |_| {}).await
    }

    /// Run the poll loop on its own task.
    pub fn spawn(&self, queue: impl Into<String>, job_id: JobId) -> PollHandle {
        let poller = self.clone();
        let queue = queue.into();
        let cancel = CancellationToken::new();
        let (state_tx, state_rx) = watch::channel(PollState::Idle);

        let token = cancel.clone();
        let join = tokio::spawn(async move {
            let outcome = poller
                .poll_with(&queue, job_id, &token, |state| {
                    let _ = state_tx.send(state);
                })
                .await;
            if let Some(state) = PollState::from_outcome(&outcome) {
                let _ = state_tx.send(state);
            }
            outcome
        });

        PollHandle {
            cancel,
            state: state_rx,
            join,
        }
    }
}

/// A spawned poller. Dropping it does not stop polling; call
/// [`PollHandle::abandon`].
pub struct PollHandle {
    cancel: CancellationToken,
    state: watch::Receiver<PollState>,
    join: JoinHandle<PollOutcome>,
}

impl PollHandle {
    /// Stop issuing requests. No further state changes are published.
    pub fn abandon(&self) {
        self.cancel.cancel();
    }

    pub fn state(&self) -> PollState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<PollState> {
        self.state.clone()
    }

    pub async fn outcome(self) -> PollOutcome {
        self.join.await.unwrap_or(PollOutcome::Cancelled)
    }
}
