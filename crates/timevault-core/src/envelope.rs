//! The signed request envelope and the encrypted response.
//!
//! Every mutating or key-releasing request travels as a single JSON string
//! (the body with the caller's username and a unix timestamp merged in)
//! plus an RSA signature over that exact string. Verification is pure: the
//! caller supplies `now`, so freshness is testable without a clock.
//!
//! Responses that carry key material go back under a fresh AES-256 key
//! wrapped to the requester's public key, so even the transport never sees
//! released keys in the clear.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use timevault_crypto::{
    CryptoError, KeySize, PrivateKey, PublicKey, SymmetricKey, aead_decrypt, aead_encrypt,
};

use crate::error::ApiError;
use crate::model::CipherBlob;

/// Maximum allowed skew, in seconds, between the envelope timestamp and the
/// verifier's clock. Past or future beyond this is rejected.
pub const FRESHNESS_WINDOW_SECS: i64 = 120;

/// A request as it travels: the serialized body and a signature over it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedRequest {
    /// JSON-serialized body with `username` and `timestamp` merged in.
    /// Signed byte-for-byte, so it is kept as the original string.
    pub globalmessage: String,
    /// Base64 RSA PKCS#1 v1.5 SHA-256 signature over `globalmessage`.
    pub signature: String,
}

/// The fields every envelope body must carry, extracted before any
/// signature check so the verifier knows whose key to use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedEnvelope {
    /// Claimed sender. Unverified until the signature check passes.
    pub username: String,
    /// Unix seconds at signing time.
    pub timestamp: i64,
    /// The full body, claimed fields included.
    pub body: Map<String, Value>,
}

/// Serialize `body`, merge in identity and time, and sign the result.
///
/// `body` must be a JSON object; `username` and `timestamp` are written
/// into it, replacing any values the caller put there.
pub fn build_signed_request(
    username: &str,
    timestamp: i64,
    body: &Value,
    key: &PrivateKey,
) -> Result<SignedRequest, ApiError> {
    let Value::Object(fields) = body else {
        return Err(ApiError::BadRequest { reason: "request body must be a JSON object".into() });
    };
    let mut merged = fields.clone();
    merged.insert("username".to_owned(), Value::String(username.to_owned()));
    merged.insert("timestamp".to_owned(), Value::Number(timestamp.into()));
    let globalmessage = serde_json::to_string(&Value::Object(merged))?;
    let signature = key.sign(globalmessage.as_bytes())?;
    Ok(SignedRequest { globalmessage, signature })
}

/// Parse the envelope body and pull out the claimed identity and timestamp.
/// No cryptography happens here.
pub fn parse_envelope(request: &SignedRequest) -> Result<ParsedEnvelope, ApiError> {
    let parsed: Value = serde_json::from_str(&request.globalmessage).map_err(|e| {
        ApiError::BadRequest { reason: format!("envelope is not valid JSON: {e}") }
    })?;
    let Value::Object(body) = parsed else {
        return Err(ApiError::BadRequest { reason: "envelope must be a JSON object".into() });
    };
    let username = body
        .get("username")
        .and_then(Value::as_str)
        .ok_or_else(|| ApiError::BadRequest { reason: "envelope missing username".into() })?
        .to_owned();
    let timestamp = body
        .get("timestamp")
        .and_then(Value::as_i64)
        .ok_or_else(|| ApiError::BadRequest { reason: "envelope missing timestamp".into() })?;
    Ok(ParsedEnvelope { username, timestamp, body })
}

/// Verify `request`'s signature against `key`.
pub fn verify_signature(request: &SignedRequest, key: &PublicKey) -> Result<(), ApiError> {
    let ok = key
        .verify(request.globalmessage.as_bytes(), &request.signature)
        .map_err(|_| ApiError::BadSignature)?;
    if ok { Ok(()) } else { Err(ApiError::BadSignature) }
}

/// Reject envelopes signed too far from `now`, in either direction.
pub fn check_freshness(timestamp: i64, now: i64) -> Result<(), ApiError> {
    if (now - timestamp).abs() > FRESHNESS_WINDOW_SECS {
        Err(ApiError::Expired)
    } else {
        Ok(())
    }
}

/// A response encrypted to one recipient: a wrapped one-off key plus the
/// body under it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedResponse {
    /// Base64 RSA-OAEP wrapping of the one-off AES-256 key.
    pub key: String,
    /// The response body under that key.
    #[serde(rename = "encryptedMessage")]
    pub encrypted_message: CipherBlob,
}

/// Encrypt `body` to `recipient` under a fresh AES-256 key.
pub fn encrypt_response(body: &Value, recipient: &PublicKey) -> Result<EncryptedResponse, CryptoError> {
    let one_off = SymmetricKey::generate(KeySize::Bits256);
    let serialized = serde_json::to_vec(body)
        .map_err(|e| CryptoError::MalformedInput { reason: e.to_string() })?;
    let ct = aead_encrypt(&one_off, &serialized);
    let wrapped = recipient.wrap_key(one_off.as_bytes())?;
    Ok(EncryptedResponse {
        key: BASE64.encode(wrapped),
        encrypted_message: CipherBlob::from_aead(&ct),
    })
}

/// Unwrap the one-off key and decrypt the body.
pub fn decrypt_response(response: &EncryptedResponse, key: &PrivateKey) -> Result<Value, CryptoError> {
    let wrapped = BASE64
        .decode(&response.key)
        .map_err(|_| CryptoError::MalformedInput { reason: "bad wrapped key base64".into() })?;
    let raw = key.unwrap_key(&wrapped)?;
    let one_off = SymmetricKey::from_bytes(raw)?;
    let plaintext = aead_decrypt(&one_off, &response.encrypted_message.to_aead()?)?;
    serde_json::from_slice(&plaintext)
        .map_err(|e| CryptoError::MalformedInput { reason: format!("decrypted body is not JSON: {e}") })
}
