//! Shared domain model and protocol logic for the Timevault archive.
//!
//! This crate defines everything the server and client agree on: the
//! persistent record shapes ([`model`]), the grant scope language
//! ([`scope`]), the signed request envelope and encrypted response
//! ([`envelope`]), and the error taxonomy with its wire state codes
//! ([`error`]).
//!
//! Nothing here performs I/O. Envelope verification takes `now` as a
//! parameter and storage is someone else's problem, which keeps the whole
//! protocol layer deterministic and unit-testable.

pub mod envelope;
pub mod error;
pub mod model;
pub mod scope;

pub use envelope::{
    EncryptedResponse, FRESHNESS_WINDOW_SECS, ParsedEnvelope, SignedRequest, build_signed_request,
    check_freshness, decrypt_response, encrypt_response, parse_envelope, verify_signature,
};
pub use error::{ApiError, ErrorBody};
pub use model::{
    CipherBlob, Conversation, Grant, GrantEntry, Media, MediaRef, Message, MessageKind,
    ResolvedAccess, User,
};
pub use scope::{GrantScope, ScopeLevel, ScopeParseError, is_valid_scope_key};
