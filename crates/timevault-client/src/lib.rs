//! Archive client.
//!
//! Everything cryptographic about the archive happens in this crate or
//! below it: conversation master keys are generated here, grants are
//! wrapped and opened here, and plaintext exists only here. The server
//! sees signed envelopes and ciphertext.
//!
//! A [`session::Session`] signs requests; [`upload`] turns a parsed source
//! conversation into an encrypted archive; [`read`] walks the key tree
//! back down to plaintext. The transport is a seam ([`transport`]) so the
//! same client drives an HTTP backend or an in-process server in tests.

pub mod error;
pub mod grants;
pub mod read;
pub mod session;
pub mod transport;
pub mod upload;

pub use error::ClientError;
pub use grants::{MemberAccess, UnlockedAccess, regrant_entries, unwrap_entries};
pub use read::{DecryptedMessage, MessageBody, read_conversation};
pub use session::{ConversationHandle, NewConversation, Session};
pub use transport::{ArchiveTransport, Op, open_reply};
pub use upload::{SourceItem, SourcePayload, UploadEvent, UploadReport, upload_conversation};
