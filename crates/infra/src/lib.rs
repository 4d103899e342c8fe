//! Infrastructure layer: job queue, workers, persistent-store collaborators.

pub mod handlers;
pub mod jobs;
pub mod storage;
