//! Handshake authentication: path-carried JWT verification.
//!
//! GPortal clients present their credential as the WebSocket request path:
//! the path stripped of its leading `/` *is* the JWT, and no other location
//! (headers, query string) is consulted. Verification is HS256 against the
//! shared broker secret; an `exp` claim is honored when present but not
//! required.
//!
//! Claims validation is a pluggable hook. The default rule accepts any claims
//! object carrying a string `id` and a `type` equal to one of the two device
//! role strings; deployments with stricter identity schemes swap in their own
//! closure via [`TokenVerifier::with_claims_validator`].
//!
//! The two failure modes are kept distinct because they mean different
//! things: a token that does not verify is a forgery attempt (`hackTry`),
//! while a verified token with unusable claims is a misissued credential
//! (`jwtIdError`). Both reject the handshake with HTTP 403.

use std::sync::Arc;

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use portal_core::{DeviceIdentity, DeviceRole};
use serde_json::Value;
use thiserror::Error;

/// Pluggable claims validity rule.
pub type ClaimsValidator = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Error type for handshake authentication.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The token failed signature or timestamp verification.
    #[error("token verification failed: {0}")]
    InvalidToken(#[source] jsonwebtoken::errors::Error),

    /// The token verified, but its claims cannot identify a device.
    #[error("verified token carries unusable claims")]
    InvalidClaims {
        /// The offending claims, for the `jwtIdError` event.
        claims: Value,
    },
}

impl AuthError {
    /// Reason phrase of the 403 rejection sent for this failure.
    pub fn rejection_reason(&self) -> &'static str {
        match self {
            AuthError::InvalidToken(_) => "Invalid URL",
            AuthError::InvalidClaims { .. } => "Invalid identity",
        }
    }
}

/// Verifies path-carried tokens and extracts the device identity.
#[derive(Clone)]
pub struct TokenVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
    claims_validator: ClaimsValidator,
}

impl TokenVerifier {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        // `exp` is checked when the token carries one but its absence is not
        // an error, and an `aud` claim passes through unvalidated.
        validation.required_spec_claims.clear();
        validation.validate_aud = false;
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            claims_validator: Arc::new(default_claims_valid),
        }
    }

    /// Replaces the default claims validity rule.
    pub fn with_claims_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.claims_validator = Arc::new(validator);
        self
    }

    /// Authenticates a handshake request path.
    ///
    /// # Errors
    ///
    /// [`AuthError::InvalidToken`] when the path does not hold a token this
    /// broker issued trust for; [`AuthError::InvalidClaims`] when it does but
    /// the claims fail validation or name no device identity.
    pub fn authenticate_path(&self, request_path: &str) -> Result<(Value, DeviceIdentity), AuthError> {
        let token = request_path.strip_prefix('/').unwrap_or(request_path);
        let claims = decode::<Value>(token, &self.decoding_key, &self.validation)
            .map_err(AuthError::InvalidToken)?
            .claims;

        if !(self.claims_validator)(&claims) {
            return Err(AuthError::InvalidClaims { claims });
        }
        let identity = identity_from_claims(&claims)
            .ok_or_else(|| AuthError::InvalidClaims {
                claims: claims.clone(),
            })?;
        Ok((claims, identity))
    }
}

/// Default validity rule: the claims name a device identity.
fn default_claims_valid(claims: &Value) -> bool {
    identity_from_claims(claims).is_some()
}

/// Extracts the identity from verified claims: a string `id` plus a `type`
/// matching one of the device role strings.
fn identity_from_claims(claims: &Value) -> Option<DeviceIdentity> {
    let id = claims.get("id")?.as_str()?;
    let role: DeviceRole = serde_json::from_value(claims.get("type")?.clone()).ok()?;
    Some(DeviceIdentity::new(id, role))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
