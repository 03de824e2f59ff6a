//! Deterministic key derivation via HKDF-SHA256.
//!
//! Every content key in the archive is derived, never stored: the same
//! `(master material, label, size)` triple always re-produces the same key,
//! so holders of a master key can rebuild any key in its subtree on demand.

use hkdf::Hkdf;
use sha2::Sha256;

use crate::aead::{KeySize, SymmetricKey};

/// Fixed application salt for all HKDF derivations.
///
/// Wire-compatibility constant: changing it re-keys every existing archive.
pub const HKDF_SALT: &[u8] = b"TimeMachine-salt";

/// Derivation label for the per-conversation sender key.
pub const SENDER_LABEL: &str = "sender";

/// Derive a symmetric key from master material and a context label.
///
/// Fully deterministic. The label provides domain separation: two different
/// labels under the same master never collide, and the full label namespace
/// is defined by the key hierarchy (see [`crate::hierarchy`]).
pub fn derive_key(master: &[u8], label: &str, size: KeySize) -> SymmetricKey {
    let hkdf = Hkdf::<Sha256>::new(Some(HKDF_SALT), master);

    let mut okm = vec![0u8; size.byte_len()];
    let Ok(()) = hkdf.expand(label.as_bytes(), &mut okm) else {
        unreachable!("at most 32 bytes is a valid HKDF-SHA256 output length");
    };

    let Ok(key) = SymmetricKey::from_bytes(okm) else {
        unreachable!("KeySize::byte_len is always a valid key length");
    };
    key
}
