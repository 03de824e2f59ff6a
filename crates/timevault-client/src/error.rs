//! Client-side error taxonomy.

use timevault_crypto::CryptoError;

/// A failure anywhere on the client side of an archive exchange.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The transport could not deliver the request.
    #[error("transport failure: {reason}")]
    Transport {
        /// What went wrong on the wire.
        reason: String,
    },

    /// The server rejected the request with a state code.
    #[error("server rejected request (state {state}): {message}")]
    Api {
        /// Wire state code.
        state: i32,
        /// Server-provided message.
        message: String,
    },

    /// A cryptographic operation failed.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// The server's response did not have the expected shape.
    #[error("malformed response: {reason}")]
    BadResponse {
        /// What was missing or wrong.
        reason: String,
    },

    /// The caller's grant lacks a scope an operation needs.
    #[error("grant does not include the {scope} scope")]
    MissingGrant {
        /// The missing scope key.
        scope: String,
    },

    /// The server assigned a different sequence range than the one the
    /// upload derived its keys for.
    #[error("sequence mismatch: derived keys for {expected}, server assigned {got}")]
    SequenceMismatch {
        /// First sequence the client derived keys for.
        expected: u64,
        /// First sequence the server actually assigned.
        got: u64,
    },

    /// A stored media object never became readable within the poll budget.
    #[error("media object {media_id} not ready after {attempts} polls")]
    MediaTimeout {
        /// The object that was polled.
        media_id: uuid::Uuid,
        /// How many polls were made.
        attempts: u32,
    },

    /// An internal pipeline task failed or hung up.
    #[error("upload pipeline failure: {reason}")]
    Pipeline {
        /// The task-side cause.
        reason: String,
    },
}

impl From<serde_json::Error> for ClientError {
    fn from(e: serde_json::Error) -> Self {
        Self::BadResponse { reason: e.to_string() }
    }
}
