//! Error types for the crypto layer.
//!
//! Every cryptographic failure surfaces as a typed variant; the boundary
//! layers decide how each maps to a caller-visible state code. The crypto
//! layer never swallows a failure into a default value.

use thiserror::Error;

/// Errors produced by the primitive crypto layer and the key hierarchy.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Requested symmetric key size is not one of 128/192/256 bits.
    #[error("invalid symmetric key size: {bits} bits (must be 128, 192 or 256)")]
    InvalidKeySize {
        /// The rejected bit length.
        bits: u32,
    },

    /// Signing failed, typically because the private key is malformed.
    #[error("signing failed: {reason}")]
    SigningError {
        /// Human-readable failure reason.
        reason: String,
    },

    /// AEAD tag verification failed. No partial plaintext is ever returned.
    #[error("authentication failed: ciphertext rejected")]
    AuthenticationFailure,

    /// A key could not be parsed (bad PEM, wrong ASN.1 structure, ...).
    #[error("malformed key: {reason}")]
    MalformedKey {
        /// Human-readable failure reason.
        reason: String,
    },

    /// An input was structurally invalid (bad base64, wrong nonce length, ...).
    ///
    /// Distinct from [`CryptoError::AuthenticationFailure`]: malformed inputs
    /// are caller bugs, failed authentication is hostile or corrupted data.
    #[error("malformed input: {reason}")]
    MalformedInput {
        /// Human-readable failure reason.
        reason: String,
    },

    /// Asymmetric wrapping is restricted to short symmetric keys.
    #[error("refusing to wrap {len} bytes: asymmetric wrapping is limited to {max} bytes")]
    WrapTooLong {
        /// Length of the rejected payload.
        len: usize,
        /// Maximum permitted payload length.
        max: usize,
    },

    /// RSA operation failed (key generation, encryption, decryption).
    #[error("asymmetric operation failed: {reason}")]
    AsymmetricFailure {
        /// Human-readable failure reason.
        reason: String,
    },
}
