use larder_auth::{Identity, Role};
use larder_core::OwnerId;

/// Owner context for a request (authenticated identity + roles).
///
/// Inserted by the auth middleware; every protected route extracts it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerContext {
    owner_id: OwnerId,
    roles: Vec<Role>,
}

impl OwnerContext {
    pub fn new(owner_id: OwnerId, roles: Vec<Role>) -> Self {
        Self { owner_id, roles }
    }

    pub fn owner_id(&self) -> OwnerId {
        self.owner_id
    }

    pub fn roles(&self) -> &[Role] {
        &self.roles
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r.as_str() == role)
    }
}

impl From<Identity> for OwnerContext {
    fn from(identity: Identity) -> Self {
        Self::new(identity.owner_id, identity.roles)
    }
}
