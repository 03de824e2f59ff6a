//! Error taxonomy shared between server and client.
//!
//! Every failure that crosses the wire carries a small integer state code so
//! that clients can branch on the cause without parsing prose. State `0` is
//! reserved for success and never appears on an error.

use serde::{Deserialize, Serialize};
use timevault_crypto::CryptoError;

/// A failure produced while servicing an archive operation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ApiError {
    /// The request could not be parsed or was structurally invalid.
    #[error("malformed request: {reason}")]
    BadRequest {
        /// Human-readable cause, safe to return to the caller.
        reason: String,
    },

    /// A uniqueness constraint was violated.
    #[error("duplicate {what}")]
    Duplicate {
        /// The entity that already exists.
        what: String,
    },

    /// The envelope signature did not verify against the sender's key.
    #[error("signature verification failed")]
    BadSignature,

    /// The envelope timestamp fell outside the freshness window.
    #[error("request expired")]
    Expired,

    /// A field failed validation.
    #[error("invalid {field}: {reason}")]
    Validation {
        /// Name of the offending field.
        field: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The named user is not registered.
    #[error("unknown user")]
    UnknownUser,

    /// The authenticated user lacks the required permission.
    #[error("permission denied")]
    Forbidden,

    /// The requested entity does not exist.
    #[error("{what} not found")]
    NotFound {
        /// The entity that was looked up.
        what: String,
    },

    /// A cryptographic operation failed. Deliberately opaque.
    #[error("cryptographic failure")]
    Crypto,

    /// An unexpected server-side fault. The detail is logged, never returned.
    #[error("internal error")]
    Internal {
        /// Diagnostic detail for the server log.
        detail: String,
    },
}

impl ApiError {
    /// Numeric state code for the wire.
    pub fn state(&self) -> i32 {
        match self {
            Self::BadRequest { .. } => 1,
            Self::Duplicate { .. } => 2,
            Self::BadSignature => 3,
            Self::Expired => 4,
            Self::Validation { .. } => 5,
            Self::UnknownUser => 6,
            Self::Forbidden => 7,
            Self::NotFound { .. } => 8,
            Self::Crypto => 9,
            Self::Internal { .. } => -1,
        }
    }

    /// Wire representation. Internal detail is replaced with a generic
    /// message so server faults never leak diagnostics to callers.
    pub fn to_body(&self) -> ErrorBody {
        let error = match self {
            Self::Internal { .. } => "internal error".to_owned(),
            other => other.to_string(),
        };
        ErrorBody { error, state: self.state() }
    }
}

impl From<CryptoError> for ApiError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::MalformedInput { reason } | CryptoError::MalformedKey { reason } => {
                Self::BadRequest { reason }
            }
            _ => Self::Crypto,
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(e: serde_json::Error) -> Self {
        Self::BadRequest { reason: e.to_string() }
    }
}

/// JSON error body returned alongside a non-success status.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorBody {
    /// Human-readable message.
    pub error: String,
    /// Machine-readable state code.
    pub state: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_codes_are_stable() {
        let reason = "x".to_owned();
        assert_eq!(ApiError::BadRequest { reason: reason.clone() }.state(), 1);
        assert_eq!(ApiError::Duplicate { what: reason.clone() }.state(), 2);
        assert_eq!(ApiError::BadSignature.state(), 3);
        assert_eq!(ApiError::Expired.state(), 4);
        assert_eq!(
            ApiError::Validation { field: reason.clone(), reason: reason.clone() }.state(),
            5
        );
        assert_eq!(ApiError::UnknownUser.state(), 6);
        assert_eq!(ApiError::Forbidden.state(), 7);
        assert_eq!(ApiError::NotFound { what: reason.clone() }.state(), 8);
        assert_eq!(ApiError::Crypto.state(), 9);
        assert_eq!(ApiError::Internal { detail: reason }.state(), -1);
    }

    #[test]
    fn internal_detail_never_reaches_the_wire() {
        let err = ApiError::Internal { detail: "db handle poisoned".to_owned() };
        let body = err.to_body();
        assert_eq!(body.error, "internal error");
        assert_eq!(body.state, -1);
    }

    #[test]
    fn crypto_auth_failure_is_opaque() {
        let err: ApiError = CryptoError::AuthenticationFailure.into();
        assert!(matches!(err, ApiError::Crypto));
    }
}
