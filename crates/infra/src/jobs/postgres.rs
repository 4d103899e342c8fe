//! Postgres-backed queue store.
//!
//! Claiming uses `SELECT ... FOR UPDATE SKIP LOCKED` inside a single
//! `UPDATE ... RETURNING` statement, so concurrent workers (in this process
//! or others) never receive the same job.
//!
//! ## Error Mapping
//!
//! | SQLx Error | QueueError |
//! |------------|------------|
//! | `PoolClosed`, `PoolTimedOut`, `Io`, `Tls` | `StoreUnavailable` |
//! | Row decode failures | `Serialization` |
//! | Anything else | `StoreUnavailable` |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use larder_core::{JobId, OwnerId, SharedClock, SystemClock};

use super::payload::JobPayload;
use super::store::{QueueError, QueueStore, RetentionPolicy, StallSweep};
use super::types::{
    average_latency_ms, Job, JobCounts, JobState, QueueMetrics, QueueName, StallOutcome,
    LATENCY_SAMPLE,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS larder_jobs (
    id               UUID PRIMARY KEY,
    queue            TEXT NOT NULL,
    owner_id         UUID NOT NULL,
    payload          JSONB NOT NULL,
    state            TEXT NOT NULL,
    result           JSONB,
    failure_reason   TEXT,
    attempts         INTEGER NOT NULL DEFAULT 0,
    enqueued_at      TIMESTAMPTZ NOT NULL,
    started_at       TIMESTAMPTZ,
    finished_at      TIMESTAMPTZ,
    lease_expires_at TIMESTAMPTZ
);
CREATE INDEX IF NOT EXISTS larder_jobs_claim_idx ON larder_jobs (queue, state, enqueued_at);
"#;

const COLUMNS: &str = "id, queue, owner_id, payload, state, result, failure_reason, attempts, \
                       enqueued_at, started_at, finished_at, lease_expires_at";

#[derive(Clone)]
pub struct PostgresQueueStore {
    pool: Arc<PgPool>,
    clock: SharedClock,
    retention: RetentionPolicy,
}

impl std::fmt::Debug for PostgresQueueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresQueueStore")
            .field("retention", &self.retention)
            .finish()
    }
}

impl PostgresQueueStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
            clock: SystemClock::shared(),
            retention: RetentionPolicy::default(),
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    /// Connect and make sure the jobs table exists.
    pub async fn connect(database_url: &str) -> Result<Self, QueueError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        let store = Self::new(pool);
        store.ensure_schema().await?;
        Ok(store)
    }

    pub async fn ensure_schema(&self) -> Result<(), QueueError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    async fn write_terminal(&self, job_id: JobId, apply: impl FnOnce(&mut Job) -> Result<(), QueueError>) -> Result<Job, QueueError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;

        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM larder_jobs WHERE id = $1 FOR UPDATE"))
            .bind(job_id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("lock_job", e))?
            .ok_or(QueueError::NotFound(job_id))?;

        let mut job = job_from_row(&row)?;
        apply(&mut job)?;

        sqlx::query(
            "UPDATE larder_jobs SET state = $2, result = $3, failure_reason = $4, \
             finished_at = $5, lease_expires_at = NULL WHERE id = $1",
        )
        .bind(job_id.as_uuid())
        .bind(job.state.as_str())
        .bind(&job.result)
        .bind(&job.failure_reason)
        .bind(job.finished_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("write_terminal", e))?;

        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;

        self.prune(job.queue, job.state).await?;
        Ok(job)
    }

    async fn prune(&self, queue: QueueName, state: JobState) -> Result<(), QueueError> {
        let keep = match state {
            JobState::Completed => self.retention.keep_completed,
            JobState::Failed => self.retention.keep_failed,
            _ => None,
        };
        let Some(keep) = keep else {
            return Ok(());
        };

        sqlx::query(
            "DELETE FROM larder_jobs WHERE id IN ( \
               SELECT id FROM larder_jobs WHERE queue = $1 AND state = $2 \
               ORDER BY finished_at DESC, id DESC OFFSET $3)",
        )
        .bind(queue.as_str())
        .bind(state.as_str())
        .bind(keep as i64)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("prune", e))?;
        Ok(())
    }
}

#[async_trait]
impl QueueStore for PostgresQueueStore {
    #[instrument(skip(self, payload), fields(queue = %payload.queue()), err)]
    async fn enqueue(&self, owner_id: OwnerId, payload: JobPayload) -> Result<JobId, QueueError> {
        let job = Job::new(owner_id, payload, self.clock.now());
        let payload = serde_json::to_value(&job.payload)
            .map_err(|e| QueueError::Serialization(e.to_string()))?;

        sqlx::query(
            "INSERT INTO larder_jobs (id, queue, owner_id, payload, state, attempts, enqueued_at) \
             VALUES ($1, $2, $3, $4, $5, 0, $6)",
        )
        .bind(job.id.as_uuid())
        .bind(job.queue.as_str())
        .bind(owner_id.as_uuid())
        .bind(payload)
        .bind(JobState::Waiting.as_str())
        .bind(job.enqueued_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("enqueue", e))?;

        Ok(job.id)
    }

    #[instrument(skip(self), err)]
    async fn claim_next(&self, queue: QueueName, lease: Duration) -> Result<Option<Job>, QueueError> {
        let now = self.clock.now();
        let expires = now + chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::days(1));

        let row = sqlx::query(&format!(
            "UPDATE larder_jobs SET state = 'active', attempts = attempts + 1, \
               started_at = $2, lease_expires_at = $3 \
             WHERE id = ( \
               SELECT id FROM larder_jobs WHERE queue = $1 AND state = 'waiting' \
               ORDER BY enqueued_at, id FOR UPDATE SKIP LOCKED LIMIT 1) \
             RETURNING {COLUMNS}"
        ))
        .bind(queue.as_str())
        .bind(now)
        .bind(expires)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_next", e))?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, QueueError> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM larder_jobs WHERE id = $1"))
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn get_jobs(
        &self,
        queue: QueueName,
        states: &[JobState],
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Job>, QueueError> {
        let states: Vec<&str> = states.iter().map(JobState::as_str).collect();
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM larder_jobs \
             WHERE queue = $1 AND (cardinality($2::text[]) = 0 OR state = ANY($2)) \
             ORDER BY enqueued_at, id OFFSET $3 LIMIT $4"
        ))
        .bind(queue.as_str())
        .bind(&states)
        .bind(offset as i64)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_jobs", e))?;

        rows.iter().map(job_from_row).collect()
    }

    async fn mark_completed(
        &self,
        job_id: JobId,
        attempt: u32,
        result: serde_json::Value,
    ) -> Result<Job, QueueError> {
        let now = self.clock.now();
        self.write_terminal(job_id, |job| job.complete(attempt, result, now))
            .await
    }

    async fn mark_failed(&self, job_id: JobId, attempt: u32, reason: String) -> Result<Job, QueueError> {
        let now = self.clock.now();
        self.write_terminal(job_id, |job| job.fail(attempt, reason, now))
            .await
    }

    async fn get_counts(&self, queue: QueueName) -> Result<JobCounts, QueueError> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS n FROM larder_jobs WHERE queue = $1 GROUP BY state")
            .bind(queue.as_str())
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_counts", e))?;

        let mut counts = JobCounts::default();
        for row in rows {
            let state: String = row.try_get("state").map_err(decode_error)?;
            let n: i64 = row.try_get("n").map_err(decode_error)?;
            let n = n.max(0) as u64;
            match state.parse::<JobState>().map_err(|e| QueueError::Serialization(e.to_string()))? {
                JobState::Waiting => counts.waiting = n,
                JobState::Active => counts.active = n,
                JobState::Completed => counts.completed = n,
                JobState::Failed => counts.failed = n,
            }
        }
        Ok(counts)
    }

    #[instrument(skip(self), err)]
    async fn requeue_stalled(&self, queue: QueueName, max_attempts: u32) -> Result<StallSweep, QueueError> {
        let now = self.clock.now();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;

        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM larder_jobs \
             WHERE queue = $1 AND state = 'active' AND lease_expires_at <= $2 \
             ORDER BY enqueued_at FOR UPDATE SKIP LOCKED"
        ))
        .bind(queue.as_str())
        .bind(now)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("find_stalled", e))?;

        let mut sweep = StallSweep::default();
        for row in &rows {
            let mut job = job_from_row(row)?;
            match job.sweep_stalled(now, max_attempts) {
                Some(StallOutcome::Requeued) => sweep.requeued.push(job.id),
                Some(StallOutcome::Exhausted) => sweep.exhausted.push(job.id),
                None => continue,
            }

            sqlx::query(
                "UPDATE larder_jobs SET state = $2, started_at = $3, failure_reason = $4, \
                 finished_at = $5, lease_expires_at = NULL WHERE id = $1",
            )
            .bind(job.id.as_uuid())
            .bind(job.state.as_str())
            .bind(job.started_at)
            .bind(&job.failure_reason)
            .bind(job.finished_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("requeue_stalled", e))?;
        }

        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;
        if !sweep.exhausted.is_empty() {
            self.prune(queue, JobState::Failed).await?;
        }
        Ok(sweep)
    }

    async fn obliterate(&self, queue: QueueName) -> Result<u64, QueueError> {
        let done = sqlx::query("DELETE FROM larder_jobs WHERE queue = $1")
            .bind(queue.as_str())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("obliterate", e))?;
        Ok(done.rows_affected())
    }

    async fn metrics(&self, queue: QueueName) -> Result<QueueMetrics, QueueError> {
        let counts = self.get_counts(queue).await?;
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM larder_jobs WHERE queue = $1 AND state = 'completed' \
             ORDER BY finished_at DESC LIMIT $2"
        ))
        .bind(queue.as_str())
        .bind(LATENCY_SAMPLE as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("metrics", e))?;

        let recent = rows.iter().map(job_from_row).collect::<Result<Vec<_>, _>>()?;
        Ok(QueueMetrics {
            queue,
            counts,
            avg_latency_ms: average_latency_ms(&recent, LATENCY_SAMPLE),
        })
    }
}

fn job_from_row(row: &sqlx::postgres::PgRow) -> Result<Job, QueueError> {
    let queue: String = row.try_get("queue").map_err(decode_error)?;
    let state: String = row.try_get("state").map_err(decode_error)?;
    let payload: serde_json::Value = row.try_get("payload").map_err(decode_error)?;
    let attempts: i32 = row.try_get("attempts").map_err(decode_error)?;
    let id: Uuid = row.try_get("id").map_err(decode_error)?;
    let owner_id: Uuid = row.try_get("owner_id").map_err(decode_error)?;

    Ok(Job {
        id: JobId::from_uuid(id),
        queue: queue
            .parse()
            .map_err(|e: larder_core::DomainError| QueueError::Serialization(e.to_string()))?,
        owner_id: OwnerId::from_uuid(owner_id),
        payload: serde_json::from_value(payload).map_err(|e| QueueError::Serialization(e.to_string()))?,
        state: state
            .parse()
            .map_err(|e: larder_core::DomainError| QueueError::Serialization(e.to_string()))?,
        result: row.try_get("result").map_err(decode_error)?,
        failure_reason: row.try_get("failure_reason").map_err(decode_error)?,
        attempts: attempts.max(0) as u32,
        enqueued_at: row.try_get::<DateTime<Utc>, _>("enqueued_at").map_err(decode_error)?,
        started_at: row.try_get("started_at").map_err(decode_error)?,
        finished_at: row.try_get("finished_at").map_err(decode_error)?,
        lease_expires_at: row.try_get("lease_expires_at").map_err(decode_error)?,
    })
}

fn decode_error(err: sqlx::Error) -> QueueError {
    QueueError::Serialization(format!("failed to decode job row: {err}"))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> QueueError {
    match err {
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            QueueError::Serialization(format!("{operation}: {err}"))
        }
        other => QueueError::StoreUnavailable(format!("{operation}: {other}")),
    }
}
