//! Response sealing.
//!
//! Every authenticated operation answers sealed to the caller's public
//! key; only registration (which has no key on file yet) and error bodies
//! travel in the clear. The encryptor tracks whether a body has already
//! been sealed for the current request, so a handler bug can at worst
//! produce an error body, never a double (or plaintext) release.

use serde_json::Value;
use timevault_core::envelope::{EncryptedResponse, encrypt_response};
use timevault_core::error::{ApiError, ErrorBody};
use timevault_crypto::PublicKey;

/// What an operation hands back to the transport.
#[derive(Debug, Clone)]
pub enum ApiResponse {
    /// Cleartext success body. Only registration uses this, since the
    /// caller has no key on file to seal to until it completes.
    Clear(Value),
    /// Body encrypted to the requester.
    Sealed(EncryptedResponse),
    /// Cleartext error with a state code.
    Error(ErrorBody),
}

impl ApiResponse {
    /// Error response for `err`, logging internal detail server-side.
    pub fn from_error(err: &ApiError) -> Self {
        if let ApiError::Internal { detail } = err {
            tracing::error!(detail = %detail, "request failed");
        } else {
            tracing::debug!(state = err.state(), error = %err, "request rejected");
        }
        Self::Error(err.to_body())
    }
}

/// Seals at most one body per request to one recipient.
pub struct ResponseEncryptor {
    recipient: PublicKey,
    sealed: bool,
}

impl ResponseEncryptor {
    /// Encryptor for one request, addressed to `recipient`.
    pub fn new(recipient: PublicKey) -> Self {
        Self { recipient, sealed: false }
    }

    /// Encrypt `body` to the recipient. A second call on the same request
    /// is a handler bug and comes back as an internal error instead of a
    /// second ciphertext.
    pub fn seal(&mut self, body: &Value) -> ApiResponse {
        if self.sealed {
            tracing::error!("response already sealed for this request");
            return ApiResponse::from_error(&ApiError::Internal {
                detail: "double seal".to_owned(),
            });
        }
        match encrypt_response(body, &self.recipient) {
            Ok(encrypted) => {
                self.sealed = true;
                ApiResponse::Sealed(encrypted)
            }
            Err(e) => {
                tracing::error!(error = %e, "response encryption failed");
                ApiResponse::from_error(&ApiError::Crypto)
            }
        }
    }
}
