//! Transport seam.
//!
//! The client is transport-agnostic: anything that can deliver a signed
//! envelope to the server and hand back its JSON reply works. Successful
//! replies are either a clear body (`state: 0`) or a sealed
//! `EncryptedResponse`; [`open_reply`] normalizes both into the clear body.

use serde_json::Value;
use timevault_core::envelope::{EncryptedResponse, SignedRequest, decrypt_response};
use timevault_crypto::PrivateKey;

use crate::error::ClientError;

/// The archive operations a transport must route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    /// Register a new user.
    Register,
    /// Authenticated echo of the caller's username.
    Login,
    /// Look up a user's public key.
    GetUser,
    /// Create a conversation.
    CreateConversation,
    /// Add a member to a conversation.
    AddMember,
    /// List the caller's conversations.
    ListConversations,
    /// Store a media object.
    UploadMedia,
    /// Check whether a media object is durably stored.
    MediaReady,
    /// Fetch a media object.
    GetMedia,
    /// Store a batch of messages.
    UploadMessages,
    /// Read a page of messages.
    GetMessages,
}

/// Delivers signed envelopes to the archive server.
///
/// A server rejection must surface as [`ClientError::Api`] with the wire
/// state code; `Ok` carries the success body, clear or sealed.
pub trait ArchiveTransport: Send + Sync + 'static {
    /// Deliver one operation and return the server's reply body.
    fn call(
        &self,
        op: Op,
        request: SignedRequest,
    ) -> impl Future<Output = Result<Value, ClientError>> + Send;
}

/// Open a reply body: decrypt it if sealed, pass it through if clear.
pub fn open_reply(reply: Value, key: &PrivateKey) -> Result<Value, ClientError> {
    if reply.get("encryptedMessage").is_some() {
        let sealed: EncryptedResponse = serde_json::from_value(reply)?;
        Ok(decrypt_response(&sealed, key)?)
    } else {
        Ok(reply)
    }
}
