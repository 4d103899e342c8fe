//! `larder-client` — the caller's side of the job pipeline.
//!
//! Talks to the API over HTTP, follows individual jobs to completion, keeps
//! a registry of background jobs that notifies once per finished job, and
//! applies reviewed OCR items as a detached batch.

pub mod batch;
pub mod poller;
pub mod registry;
pub mod review;
pub mod transport;
pub mod types;

pub use batch::spawn_batch;
pub use poller::{JobPoller, PollConfig, PollHandle, PollOutcome, PollState};
pub use registry::{BackgroundJobRegistry, RegistryConfig, RegistryHandle};
pub use review::{AddItemRequest, extracted_items, review_note};
pub use transport::{HttpApiClient, ItemWriter, JobStatusTransport, TransportError};
pub use types::{
    BatchOutcome, HandleId, HandleOrigin, HandleStatus, JobHandle, JobNotification,
    JobStatusResponse, RemoteJobState,
};
