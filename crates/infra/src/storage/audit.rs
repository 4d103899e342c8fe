use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use larder_core::{AuditEntryId, OwnerId, SharedClock, SystemClock};

use super::StoreError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: AuditEntryId,
    pub owner_id: OwnerId,
    pub action: String,
    pub details: Value,
    pub recorded_at: DateTime<Utc>,
}

/// Append-only audit trail.
#[async_trait]
pub trait AuditLog: Send + Sync + 'static {
    async fn record(&self, owner_id: OwnerId, action: &str, details: Value) -> Result<AuditEntry, StoreError>;

    async fn entries_for(&self, owner_id: OwnerId) -> Result<Vec<AuditEntry>, StoreError>;
}

pub struct InMemoryAuditLog {
    entries: RwLock<Vec<AuditEntry>>,
    clock: SharedClock,
}

impl InMemoryAuditLog {
    pub fn new() -> Self {
        Self::with_clock(SystemClock::shared())
    }

    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            clock,
        }
    }
}

impl Default for InMemoryAuditLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuditLog for InMemoryAuditLog {
    async fn record(&self, owner_id: OwnerId, action: &str, details: Value) -> Result<AuditEntry, StoreError> {
        if action.trim().is_empty() {
            return Err(StoreError::Validation("audit action must not be empty".into()));
        }
        let entry = AuditEntry {
            id: AuditEntryId::new(),
            owner_id,
            action: action.to_string(),
            details,
            recorded_at: self.clock.now(),
        };
        self.entries.write().push(entry.clone());
        Ok(entry)
    }

    async fn entries_for(&self, owner_id: OwnerId) -> Result<Vec<AuditEntry>, StoreError> {
        Ok(self
            .entries
            .read()
            .iter()
            .filter(|e| e.owner_id == owner_id)
            .cloned()
            .collect())
    }
}
