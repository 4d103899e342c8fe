//! `larder-core` — shared building blocks for the job pipeline.
//!
//! This crate contains **pure** primitives (no infrastructure concerns):
//! strongly-typed identifiers, the domain error model, and an injectable clock.

pub mod clock;
pub mod error;
pub mod id;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use error::{DomainError, DomainResult};
pub use id::{AuditEntryId, InventoryId, ItemId, JobId, OwnerId};
