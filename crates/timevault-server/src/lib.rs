//! Blind archive server.
//!
//! The server authenticates signed envelopes, assigns sequence numbers and
//! tree coordinates, enforces membership and admin rules, and stores what
//! it is given. It holds no keys besides the users' public keys: message
//! bodies, sender identities, media and every grant it stores are
//! ciphertext it cannot open.
//!
//! Layering mirrors the request path: [`auth`] verifies the envelope,
//! [`api`] runs the operation against a [`storage::Storage`] backend, and
//! [`respond`] seals every authenticated response to the requester. Transport
//! (HTTP or otherwise) sits above this crate and only shuttles JSON.

pub mod api;
pub mod auth;
pub mod respond;
pub mod storage;

pub use api::Api;
pub use auth::{AuthenticatedRequest, Authenticator};
pub use respond::{ApiResponse, ResponseEncryptor};
pub use storage::{MemoryStorage, RedbStorage, ReservedRange, Storage, StorageError};
