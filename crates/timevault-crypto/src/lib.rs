//! Timevault cryptographic primitives and key hierarchy.
//!
//! Everything a client needs to keep the server blind: authenticated
//! symmetric encryption, asymmetric signatures and key wrapping, and the
//! deterministic derivation scheme that turns one conversation master key
//! into a unique key per archived message.
//!
//! # Key lifecycle
//!
//! ```text
//! Conversation master key  (generated client-side, once)
//!        │
//!        ├─ HKDF "sender"          → sender key (identity field only)
//!        │
//!        └─ HKDF vault label       → vault key
//!             └─ HKDF block label  → block key
//!                  └─ ...          → group, chunk
//!                       └─ HKDF message label → message key
//!                              │
//!                              └─ AES-GCM → ciphertext
//! ```
//!
//! Only the master key is ever persisted, and only in asymmetrically-wrapped
//! form inside a grant. Every other key is re-derived on demand and held
//! transiently in memory (zeroized on drop).
//!
//! # Security
//!
//! - Derivation labels embed the full dotted coordinate path, binding each
//!   key to its unique tree position; sibling levels cannot collide.
//! - AEAD nonces are random per call from the OS CSPRNG; independent actors
//!   encrypting under the same derived key cannot reuse a nonce by
//!   construction.
//! - Asymmetric operations wrap at most 32 bytes of key material; bulk
//!   content never touches RSA.

pub mod aead;
pub mod asym;
pub mod derive;
pub mod error;
pub mod hierarchy;

pub use aead::{AeadCiphertext, KeySize, NONCE_SIZE, SymmetricKey, aead_decrypt, aead_encrypt};
pub use asym::{
    EncryptedPrivateKey, MAX_WRAP_LEN, PrivateKey, PublicKey, decrypt_private_key,
    encrypt_private_key, generate_keypair,
};
pub use derive::{HKDF_SALT, SENDER_LABEL, derive_key};
pub use error::CryptoError;
pub use hierarchy::{Coordinate, DerivationChain, MESSAGES_PER_VAULT};
