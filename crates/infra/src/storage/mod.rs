//! Persistent-store collaborators used by handlers and the HTTP layer.
//!
//! These are narrow interfaces with their own error taxonomy; the in-memory
//! implementations back dev deployments and tests.

pub mod audit;
pub mod inventory;
pub mod objects;

pub use audit::{AuditEntry, AuditLog, InMemoryAuditLog};
pub use inventory::{InMemoryInventoryStore, Inventory, InventoryItem, InventoryStore, NewItem};
pub use objects::{InMemoryObjectStore, ObjectStore};

/// Persistent store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<larder_core::DomainError> for StoreError {
    fn from(err: larder_core::DomainError) -> Self {
        use larder_core::DomainError;
        match err {
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => StoreError::Validation(msg),
            DomainError::NotFound => StoreError::NotFound("resource".to_string()),
            DomainError::Conflict(msg) => StoreError::Conflict(msg),
        }
    }
}
