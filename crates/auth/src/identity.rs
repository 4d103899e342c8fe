//! Identity resolution contract: request credential -> owner identity.

use chrono::{DateTime, Utc};
use thiserror::Error;

use larder_core::OwnerId;

use crate::Role;

/// A resolved caller identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub owner_id: OwnerId,
    pub roles: Vec<Role>,
}

impl Identity {
    pub fn new(owner_id: OwnerId, roles: Vec<Role>) -> Self {
        Self { owner_id, roles }
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r.as_str() == role)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),
}

impl AuthError {
    pub fn unauthenticated(msg: impl Into<String>) -> Self {
        Self::Unauthenticated(msg.into())
    }
}

/// Resolves a request credential into an [`Identity`].
pub trait IdentityResolver: Send + Sync + 'static {
    fn resolve(&self, credential: &str, now: DateTime<Utc>) -> Result<Identity, AuthError>;

    /// Shortcut when only the owner id matters.
    fn resolve_owner(&self, credential: &str, now: DateTime<Utc>) -> Result<OwnerId, AuthError> {
        self.resolve(credential, now).map(|identity| identity.owner_id)
    }
}
