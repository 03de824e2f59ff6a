//! Symmetric keys and authenticated encryption.
//!
//! All content encryption in Timevault is AES-GCM with a fresh random 96-bit
//! nonce per call. Nonces come from the OS CSPRNG, never from a counter:
//! independent actors encrypt under the same derived keys, so any shared
//! counter scheme would risk nonce reuse.

use aes_gcm::{
    Aes128Gcm, Aes256Gcm, AesGcm, Nonce,
    aead::{Aead, KeyInit},
    aes::Aes192,
};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use rand::RngCore;
use zeroize::Zeroize;

use crate::error::CryptoError;

/// AES-192-GCM is not aliased by the `aes-gcm` crate; conversations may pick
/// any of the three sizes.
type Aes192Gcm = AesGcm<Aes192, aes_gcm::aead::consts::U12>;

/// AES-GCM nonce length in bytes (96 bits).
pub const NONCE_SIZE: usize = 12;

/// Permitted symmetric key sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum KeySize {
    /// 128-bit key.
    Bits128,
    /// 192-bit key.
    Bits192,
    /// 256-bit key.
    Bits256,
}

impl KeySize {
    /// Parse a bit length. Anything other than 128/192/256 is rejected.
    pub fn from_bits(bits: u32) -> Result<Self, CryptoError> {
        match bits {
            128 => Ok(Self::Bits128),
            192 => Ok(Self::Bits192),
            256 => Ok(Self::Bits256),
            _ => Err(CryptoError::InvalidKeySize { bits }),
        }
    }

    /// Bit length of this key size.
    pub const fn bits(self) -> u32 {
        match self {
            Self::Bits128 => 128,
            Self::Bits192 => 192,
            Self::Bits256 => 256,
        }
    }

    /// Byte length of this key size.
    pub const fn byte_len(self) -> usize {
        (self.bits() / 8) as usize
    }
}

/// A symmetric content key. Zeroized on drop.
///
/// Keys are derived or randomly generated, held only transiently in memory,
/// and never persisted in plaintext form.
#[derive(Clone, PartialEq, Eq)]
pub struct SymmetricKey {
    bytes: Vec<u8>,
}

impl SymmetricKey {
    /// Generate a fresh random key of the given size from the OS CSPRNG.
    pub fn generate(size: KeySize) -> Self {
        let mut bytes = vec![0u8; size.byte_len()];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Wrap raw key bytes. The length must correspond to a permitted size.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, CryptoError> {
        KeySize::from_bits((bytes.len() * 8) as u32)?;
        Ok(Self { bytes })
    }

    /// Decode a base64-encoded key.
    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        let bytes = BASE64.decode(encoded).map_err(|e| CryptoError::MalformedInput {
            reason: format!("invalid base64 key: {e}"),
        })?;
        Self::from_bytes(bytes)
    }

    /// Base64 encoding of the raw key bytes.
    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.bytes)
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Size of this key.
    pub fn size(&self) -> KeySize {
        match self.bytes.len() {
            16 => KeySize::Bits128,
            24 => KeySize::Bits192,
            _ => KeySize::Bits256,
        }
    }
}

impl Drop for SymmetricKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymmetricKey").field("bytes", &"[REDACTED]").finish()
    }
}

/// Output of [`aead_encrypt`]: ciphertext (with appended tag) and its nonce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AeadCiphertext {
    /// Ciphertext including the 16-byte GCM tag.
    pub ciphertext: Vec<u8>,
    /// The 96-bit nonce used for this encryption.
    pub nonce: [u8; NONCE_SIZE],
}

/// Encrypt `plaintext` under `key` with AES-GCM and a fresh random nonce.
pub fn aead_encrypt(key: &SymmetricKey, plaintext: &[u8]) -> AeadCiphertext {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce);

    let ciphertext = match key.size() {
        KeySize::Bits128 => {
            let cipher = Aes128Gcm::new(key.as_bytes().into());
            cipher.encrypt(Nonce::from_slice(&nonce), plaintext)
        },
        KeySize::Bits192 => {
            let cipher = Aes192Gcm::new(key.as_bytes().into());
            cipher.encrypt(Nonce::from_slice(&nonce), plaintext)
        },
        KeySize::Bits256 => {
            let cipher = Aes256Gcm::new(key.as_bytes().into());
            cipher.encrypt(Nonce::from_slice(&nonce), plaintext)
        },
    };

    let Ok(ciphertext) = ciphertext else {
        unreachable!("AES-GCM encryption cannot fail with a validated key and nonce");
    };

    AeadCiphertext { ciphertext, nonce }
}

/// Decrypt an AES-GCM ciphertext.
///
/// # Errors
///
/// [`CryptoError::AuthenticationFailure`] if tag verification fails; no
/// partially-decrypted data is ever returned.
pub fn aead_decrypt(key: &SymmetricKey, sealed: &AeadCiphertext) -> Result<Vec<u8>, CryptoError> {
    let nonce = Nonce::from_slice(&sealed.nonce);
    let ciphertext = sealed.ciphertext.as_slice();
    let plaintext = match key.size() {
        KeySize::Bits128 => Aes128Gcm::new(key.as_bytes().into()).decrypt(nonce, ciphertext),
        KeySize::Bits192 => Aes192Gcm::new(key.as_bytes().into()).decrypt(nonce, ciphertext),
        KeySize::Bits256 => Aes256Gcm::new(key.as_bytes().into()).decrypt(nonce, ciphertext),
    };

    plaintext.map_err(|_| CryptoError::AuthenticationFailure)
}
