//! HS256 bearer-token verification.

use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};

use crate::claims::{JwtClaims, validate_claims};
use crate::identity::{AuthError, Identity, IdentityResolver};

/// Verifies HS256-signed tokens carrying [`JwtClaims`].
///
/// The time window is checked with [`validate_claims`] against the caller's
/// `now` rather than jsonwebtoken's numeric `exp`, so tokens use the same
/// RFC 3339 timestamps as the rest of the system.
pub struct Hs256JwtValidator {
    key: DecodingKey,
    validation: Validation,
}

impl Hs256JwtValidator {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.required_spec_claims.clear();
        validation.validate_exp = false;

        Self {
            key: DecodingKey::from_secret(secret.as_ref()),
            validation,
        }
    }

    pub fn decode(&self, token: &str, now: DateTime<Utc>) -> Result<JwtClaims, AuthError> {
        let data = jsonwebtoken::decode::<JwtClaims>(token, &self.key, &self.validation)
            .map_err(|e| {
                tracing::debug!(error = %e, "bearer token rejected");
                AuthError::unauthenticated(e.to_string())
            })?;

        validate_claims(&data.claims, now).map_err(|e| AuthError::unauthenticated(e.to_string()))?;
        Ok(data.claims)
    }
}

impl IdentityResolver for Hs256JwtValidator {
    fn resolve(&self, credential: &str, now: DateTime<Utc>) -> Result<Identity, AuthError> {
        let claims = self.decode(credential, now)?;
        Ok(Identity::new(claims.sub, claims.roles))
    }
}
