//! Envelope authentication.
//!
//! Every operation except registration starts here: parse the envelope,
//! look up the claimed sender, verify the signature with their registered
//! key, then check freshness. The order matters: nothing about the body is
//! trusted until the signature check passes, and the signature cannot be
//! checked until the user's key is known.

use timevault_core::envelope::{SignedRequest, check_freshness, parse_envelope, verify_signature};
use timevault_core::error::ApiError;
use timevault_crypto::PublicKey;

use crate::storage::Storage;

/// A request that passed all envelope checks.
#[derive(Debug, Clone)]
pub struct AuthenticatedRequest {
    /// Verified sender.
    pub username: String,
    /// The signed body. Safe to act on.
    pub body: serde_json::Map<String, serde_json::Value>,
    /// The sender's registered key, for encrypting the response.
    pub public_key: PublicKey,
}

/// Verifies signed envelopes against the user registry.
#[derive(Clone)]
pub struct Authenticator<S> {
    storage: S,
}

impl<S: Storage> Authenticator<S> {
    /// Build an authenticator over `storage`.
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    /// Run the full envelope check pipeline. `now` is unix seconds.
    pub fn authenticate(
        &self,
        request: &SignedRequest,
        now: i64,
    ) -> Result<AuthenticatedRequest, ApiError> {
        let parsed = parse_envelope(request)?;
        let user = self
            .storage
            .load_user(&parsed.username)
            .map_err(|e| {
                tracing::error!(error = %e, "user lookup failed");
                ApiError::Internal { detail: e.to_string() }
            })?
            .ok_or(ApiError::UnknownUser)?;
        let public_key = PublicKey::from_pem(&user.public_key_pem).map_err(|e| {
            // A stored key that no longer parses is corruption, not caller error.
            tracing::error!(username = %user.username, error = %e, "registered key unreadable");
            ApiError::Internal { detail: e.to_string() }
        })?;
        verify_signature(request, &public_key)?;
        check_freshness(parsed.timestamp, now)?;
        Ok(AuthenticatedRequest { username: parsed.username, body: parsed.body, public_key })
    }
}
