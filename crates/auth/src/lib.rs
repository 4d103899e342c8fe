//! `larder-auth` — identity resolution boundary.
//!
//! This crate is intentionally decoupled from HTTP and storage: it turns a
//! request credential (a bearer token) into the owner identity used for job
//! ownership checks.

pub mod claims;
pub mod identity;
pub mod jwt;
pub mod roles;

pub use claims::{JwtClaims, TokenValidationError, validate_claims};
pub use identity::{AuthError, Identity, IdentityResolver};
pub use jwt::Hs256JwtValidator;
pub use roles::Role;
