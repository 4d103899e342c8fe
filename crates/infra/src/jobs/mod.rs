//! Asynchronous job processing.
//!
//! ## Design
//!
//! - Jobs live in named lanes (`QueueName`) that never block each other
//! - Lifecycle is `waiting -> active -> {completed | failed}`; terminal is final
//! - Claims are atomic and leased; an expired lease is requeued by the stall
//!   sweep, and terminal writes are fenced by the claim's attempt number
//! - Payloads and outputs are typed per lane
//!
//! ## Components
//!
//! - `QueueStore`: enqueue / claim / terminal writes (in-memory or Postgres)
//! - `Worker`: drains one lane with a `JobHandler`, bounded concurrency
//! - `get_status`: owner-checked status view with stable result shape
//! - `wait_until_finished`: request-path wait with a timeout

pub mod payload;
pub mod postgres;
pub mod status;
pub mod store;
pub mod types;
pub mod wait;
pub mod worker;

pub use payload::{
    AiAction, AiOutput, AuditOutput, AuditPayload, ImageOcrPayload, JobOutput, JobPayload,
    OcrOutput,
};
pub use postgres::PostgresQueueStore;
pub use status::{get_status, JobStatusView, StatusError, ITEMS_FIELD};
pub use store::{InMemoryQueueStore, QueueError, QueueStore, RetentionPolicy, StallSweep};
pub use types::{Job, JobCounts, JobState, QueueMetrics, QueueName, StallOutcome, LATENCY_SAMPLE};
pub use wait::{wait_until_finished, WaitError};
pub use worker::{Execution, HandlerError, JobHandler, Worker, WorkerConfig, WorkerHandle, WorkerStats};
