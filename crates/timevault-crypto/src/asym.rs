//! RSA identity keys: signatures and key wrapping.
//!
//! One RSA-3072 keypair serves two distinct usages: PKCS#1 v1.5-SHA256 for
//! request signatures, and OAEP-SHA256 exclusively for wrapping short
//! symmetric keys. Bulk content never touches RSA.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use pbkdf2::pbkdf2_hmac;
use rsa::{
    Oaep, RsaPrivateKey, RsaPublicKey,
    pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding},
    signature::{SignatureEncoding, Signer, Verifier},
};
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroize;

use crate::{
    aead::{AeadCiphertext, NONCE_SIZE, SymmetricKey, aead_decrypt, aead_encrypt},
    error::CryptoError,
};

/// RSA modulus size in bits.
pub const RSA_MODULUS_BITS: usize = 3072;

/// Asymmetric wrapping is restricted to key material of at most this length.
pub const MAX_WRAP_LEN: usize = 32;

/// PBKDF2-SHA256 iteration count for password-protected private keys.
const PBKDF2_ROUNDS: u32 = 100_000;

/// Salt length for password-protected private keys.
const PBKDF2_SALT_LEN: usize = 16;

/// An RSA public key (SPKI).
///
/// The server stores one per user and uses it to verify request signatures
/// and to target-encrypt response keys. It can never unwrap anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey {
    inner: RsaPublicKey,
}

/// An RSA private key (PKCS#8). Never leaves the client.
#[derive(Clone)]
pub struct PrivateKey {
    inner: RsaPrivateKey,
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivateKey").field("inner", &"[REDACTED]").finish()
    }
}

/// Generate a fresh RSA-3072 keypair from the OS CSPRNG.
pub fn generate_keypair() -> Result<(PublicKey, PrivateKey), CryptoError> {
    let private = RsaPrivateKey::new(&mut rand::rngs::OsRng, RSA_MODULUS_BITS).map_err(|e| {
        CryptoError::AsymmetricFailure { reason: format!("key generation failed: {e}") }
    })?;
    let public = RsaPublicKey::from(&private);

    Ok((PublicKey { inner: public }, PrivateKey { inner: private }))
}

impl PublicKey {
    /// Parse a PEM-encoded (SPKI) public key.
    pub fn from_pem(pem: &str) -> Result<Self, CryptoError> {
        let inner = RsaPublicKey::from_public_key_pem(pem)
            .map_err(|e| CryptoError::MalformedKey { reason: format!("bad public key: {e}") })?;
        Ok(Self { inner })
    }

    /// PEM (SPKI) encoding of this key.
    pub fn to_pem(&self) -> Result<String, CryptoError> {
        self.inner
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| CryptoError::MalformedKey { reason: format!("pem encoding: {e}") })
    }

    /// Verify a base64 PKCS#1 v1.5-SHA256 signature over `message`.
    ///
    /// A bad signature returns `Ok(false)`; only structurally invalid inputs
    /// (non-base64 signature text) produce an error.
    pub fn verify(&self, message: &[u8], signature_b64: &str) -> Result<bool, CryptoError> {
        let raw = BASE64.decode(signature_b64).map_err(|e| CryptoError::MalformedInput {
            reason: format!("signature is not valid base64: {e}"),
        })?;

        // A wrong-length signature cannot possibly verify; it is still a
        // "bad signature", not a caller error.
        let Ok(signature) = rsa::pkcs1v15::Signature::try_from(raw.as_slice()) else {
            return Ok(false);
        };

        let verifying_key = rsa::pkcs1v15::VerifyingKey::<Sha256>::new(self.inner.clone());
        Ok(verifying_key.verify(message, &signature).is_ok())
    }

    /// Wrap a short symmetric key under this public key (OAEP-SHA256).
    pub fn wrap_key(&self, key_material: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if key_material.len() > MAX_WRAP_LEN {
            return Err(CryptoError::WrapTooLong { len: key_material.len(), max: MAX_WRAP_LEN });
        }

        self.inner
            .encrypt(&mut rand::rngs::OsRng, Oaep::new::<Sha256>(), key_material)
            .map_err(|e| CryptoError::AsymmetricFailure { reason: format!("oaep encrypt: {e}") })
    }
}

impl PrivateKey {
    /// Parse a PEM-encoded (PKCS#8) private key.
    pub fn from_pem(pem: &str) -> Result<Self, CryptoError> {
        let inner = RsaPrivateKey::from_pkcs8_pem(pem)
            .map_err(|e| CryptoError::MalformedKey { reason: format!("bad private key: {e}") })?;
        Ok(Self { inner })
    }

    /// PEM (PKCS#8) encoding of this key.
    pub fn to_pem(&self) -> Result<String, CryptoError> {
        self.inner
            .to_pkcs8_pem(LineEnding::LF)
            .map(|pem| pem.to_string())
            .map_err(|e| CryptoError::MalformedKey { reason: format!("pem encoding: {e}") })
    }

    /// The public half of this keypair.
    pub fn public_key(&self) -> PublicKey {
        PublicKey { inner: RsaPublicKey::from(&self.inner) }
    }

    /// Sign `message` with PKCS#1 v1.5-SHA256, returning base64.
    pub fn sign(&self, message: &[u8]) -> Result<String, CryptoError> {
        let signing_key = rsa::pkcs1v15::SigningKey::<Sha256>::new(self.inner.clone());
        let signature = signing_key
            .try_sign(message)
            .map_err(|e| CryptoError::SigningError { reason: e.to_string() })?;
        Ok(BASE64.encode(signature.to_bytes()))
    }

    /// Unwrap a symmetric key previously wrapped with [`PublicKey::wrap_key`].
    pub fn unwrap_key(&self, wrapped: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.inner
            .decrypt(Oaep::new::<Sha256>(), wrapped)
            .map_err(|_| CryptoError::AuthenticationFailure)
    }
}

/// A private key encrypted at rest under a password-derived key.
///
/// Optional client-side protection: the key stays usable only to someone who
/// knows the password. All fields are base64.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct EncryptedPrivateKey {
    /// Random PBKDF2 salt.
    pub salt: String,
    /// AES-GCM ciphertext of the PKCS#8 PEM.
    pub ciphertext: String,
    /// AES-GCM nonce.
    pub iv: String,
}

/// Derive the at-rest protection key from a password and salt.
fn password_key(password: &str, salt: &[u8]) -> SymmetricKey {
    let mut okm = [0u8; 32];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, PBKDF2_ROUNDS, &mut okm);
    let key = SymmetricKey::from_bytes(okm.to_vec());
    okm.zeroize();
    let Ok(key) = key else {
        unreachable!("32 bytes is a valid symmetric key length");
    };
    key
}

/// Encrypt a private key under a password (PBKDF2-SHA256 + AES-GCM).
pub fn encrypt_private_key(
    key: &PrivateKey,
    password: &str,
) -> Result<EncryptedPrivateKey, CryptoError> {
    let mut salt = [0u8; PBKDF2_SALT_LEN];
    rand::rngs::OsRng.fill_bytes(&mut salt);

    let protection = password_key(password, &salt);
    let mut pem = key.to_pem()?;
    let sealed = aead_encrypt(&protection, pem.as_bytes());
    pem.zeroize();

    Ok(EncryptedPrivateKey {
        salt: BASE64.encode(salt),
        ciphertext: BASE64.encode(&sealed.ciphertext),
        iv: BASE64.encode(sealed.nonce),
    })
}

/// Recover a private key from its password-encrypted form.
///
/// # Errors
///
/// A wrong password surfaces as [`CryptoError::AuthenticationFailure`]; the
/// caller cannot distinguish it from corrupted storage, by construction.
pub fn decrypt_private_key(
    encrypted: &EncryptedPrivateKey,
    password: &str,
) -> Result<PrivateKey, CryptoError> {
    let decode = |field: &str, value: &str| {
        BASE64.decode(value).map_err(|e| CryptoError::MalformedInput {
            reason: format!("invalid base64 in {field}: {e}"),
        })
    };

    let salt = decode("salt", &encrypted.salt)?;
    let ciphertext = decode("ciphertext", &encrypted.ciphertext)?;
    let iv = decode("iv", &encrypted.iv)?;
    let nonce: [u8; NONCE_SIZE] = iv.try_into().map_err(|iv: Vec<u8>| {
        CryptoError::MalformedInput {
            reason: format!("iv must be {NONCE_SIZE} bytes, got {}", iv.len()),
        }
    })?;

    let protection = password_key(password, &salt);
    let sealed = AeadCiphertext { ciphertext, nonce };
    let mut pem_bytes = aead_decrypt(&protection, &sealed)?;
    let pem = String::from_utf8(pem_bytes.clone())
        .map_err(|_| CryptoError::MalformedKey { reason: "decrypted key is not UTF-8".into() })?;
    pem_bytes.zeroize();

    PrivateKey::from_pem(&pem)
}

#[cfg(test)]
mod tests {
    use super::*;

    // RSA-3072 generation is slow; share one keypair across tests.
    fn keypair() -> &'static (PublicKey, PrivateKey) {
        static PAIR: std::sync::OnceLock<(PublicKey, PrivateKey)> = std::sync::OnceLock::new();
        PAIR.get_or_init(|| generate_keypair().unwrap())
    }

    #[test]
    fn sign_verify_roundtrip() {
        let (public, private) = keypair();
        let message = b"{\"username\":\"alice_01\",\"timestamp\":1700000000}";

        let signature = private.sign(message).unwrap();
        assert!(public.verify(message, &signature).unwrap());
    }

    #[test]
    fn verify_rejects_mutated_message_without_error() {
        let (public, private) = keypair();
        let signature = private.sign(b"original").unwrap();

        assert!(!public.verify(b"originaX", &signature).unwrap());
    }

    #[test]
    fn verify_rejects_wrong_key_without_error() {
        let (_, private) = keypair();
        let signature = private.sign(b"message").unwrap();

        let (other_public, _) = generate_keypair().unwrap();
        assert!(!other_public.verify(b"message", &signature).unwrap());
    }

    #[test]
    fn verify_errors_only_on_malformed_base64() {
        let (public, _) = keypair();
        let result = public.verify(b"message", "not//valid@@base64!!");
        assert!(matches!(result, Err(CryptoError::MalformedInput { .. })));
    }

    #[test]
    fn verify_tolerates_wrong_length_signature() {
        let (public, _) = keypair();
        // Valid base64, nonsense signature: must be false, not an error.
        assert!(!public.verify(b"message", "AAAA").unwrap());
    }

    #[test]
    fn wrap_unwrap_roundtrip() {
        let (public, private) = keypair();
        let key_material = SymmetricKey::generate(crate::aead::KeySize::Bits256);

        let wrapped = public.wrap_key(key_material.as_bytes()).unwrap();
        let unwrapped = private.unwrap_key(&wrapped).unwrap();

        assert_eq!(unwrapped, key_material.as_bytes());
    }

    #[test]
    fn wrap_refuses_bulk_content() {
        let (public, _) = keypair();
        let result = public.wrap_key(&[0u8; 33]);
        assert!(matches!(result, Err(CryptoError::WrapTooLong { len: 33, max: 32 })));
    }

    #[test]
    fn unwrap_with_wrong_key_fails_closed() {
        let (public, _) = keypair();
        let wrapped = public.wrap_key(&[7u8; 32]).unwrap();

        let (_, other_private) = generate_keypair().unwrap();
        assert_eq!(other_private.unwrap_key(&wrapped), Err(CryptoError::AuthenticationFailure));
    }

    #[test]
    fn pem_roundtrip_both_halves() {
        let (public, private) = keypair();

        let public2 = PublicKey::from_pem(&public.to_pem().unwrap()).unwrap();
        let private2 = PrivateKey::from_pem(&private.to_pem().unwrap()).unwrap();

        let signature = private2.sign(b"pem roundtrip").unwrap();
        assert!(public2.verify(b"pem roundtrip", &signature).unwrap());
    }

    #[test]
    fn from_pem_rejects_garbage() {
        assert!(matches!(
            PublicKey::from_pem("-----BEGIN PUBLIC KEY-----\nnope\n-----END PUBLIC KEY-----"),
            Err(CryptoError::MalformedKey { .. })
        ));
        assert!(matches!(PrivateKey::from_pem("garbage"), Err(CryptoError::MalformedKey { .. })));
    }

    #[test]
    fn password_protection_roundtrip() {
        let (public, private) = keypair();

        let encrypted = encrypt_private_key(private, "correct horse").unwrap();
        let recovered = decrypt_private_key(&encrypted, "correct horse").unwrap();

        let signature = recovered.sign(b"still me").unwrap();
        assert!(public.verify(b"still me", &signature).unwrap());
    }

    #[test]
    fn wrong_password_fails_authentication() {
        let (_, private) = keypair();
        let encrypted = encrypt_private_key(private, "right").unwrap();

        assert_eq!(
            decrypt_private_key(&encrypted, "wrong").unwrap_err(),
            CryptoError::AuthenticationFailure
        );
    }
}
