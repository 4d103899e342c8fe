//! Blocking-style wait on a job, for request paths that need the answer.

use std::time::Duration;

use larder_core::JobId;

use super::store::{QueueError, QueueStore};
use super::types::Job;

/// How often [`wait_until_finished`] re-reads the job.
pub const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    #[error("job {job_id} did not finish within {timeout:?}")]
    TimedOut { job_id: JobId, timeout: Duration },
    #[error(transparent)]
    Store(#[from] QueueError),
}

/// Poll the store until `job_id` is terminal or `timeout` elapses.
///
/// Timing out does not cancel the job; it keeps running and its result stays
/// observable through the status endpoint.
pub async fn wait_until_finished(
    store: &dyn QueueStore,
    job_id: JobId,
    timeout: Duration,
) -> Result<Job, WaitError> {
    let poll = async {
        loop {
            match store.get_job(job_id).await? {
                Some(job) if job.state.is_terminal() => return Ok(job),
                Some(_) => tokio::time::sleep(WAIT_POLL_INTERVAL).await,
                None => return Err(WaitError::Store(QueueError::NotFound(job_id))),
            }
        }
    };

    match tokio::time::timeout(timeout, poll).await {
        Ok(res) => res,
        Err(_) => Err(WaitError::TimedOut { job_id, timeout }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::payload::{AuditPayload, JobPayload};
    use crate::jobs::store::InMemoryQueueStore;
    use crate::jobs::types::{JobState, QueueName};
    use larder_core::OwnerId;
    use std::sync::Arc;

    fn audit() -> JobPayload {
        JobPayload::AuditLogging(AuditPayload::new("A", serde_json::json!({})))
    }

    #[tokio::test(start_paused = true)]
    async fn returns_once_job_finishes() {
        let store = Arc::new(InMemoryQueueStore::new());
        let id = store.enqueue(OwnerId::new(), audit()).await.unwrap();

        let finisher = store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            let job = finisher
                .claim_next(QueueName::AuditLogging, Duration::from_secs(30))
                .await
                .unwrap()
                .unwrap();
            finisher
                .mark_completed(job.id, job.attempts, serde_json::json!({"ok": true}))
                .await
                .unwrap();
        });

        let job = wait_until_finished(store.as_ref(), id, Duration::from_secs(30)).await.unwrap();
        assert_eq!(job.state, JobState::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_without_touching_the_job() {
        let store = InMemoryQueueStore::new();
        let id = store.enqueue(OwnerId::new(), audit()).await.unwrap();

        let err = wait_until_finished(&store, id, Duration::from_secs(30)).await.unwrap_err();
        assert!(matches!(err, WaitError::TimedOut { .. }));
        assert_eq!(store.get_job(id).await.unwrap().unwrap().state, JobState::Waiting);
    }

    #[tokio::test]
    async fn unknown_job_is_reported() {
        let store = InMemoryQueueStore::new();
        let err = wait_until_finished(&store, JobId::new(), Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, WaitError::Store(QueueError::NotFound(_))));
    }
}
