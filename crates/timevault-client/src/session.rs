//! A user's authenticated session.
//!
//! Wraps the private key and signs every outgoing body. The account
//! operations (register, conversations, membership) live here; the heavier
//! read and upload paths build on a session from their own modules.

use std::collections::BTreeMap;

use serde_json::{Value, json};
use timevault_core::envelope::{SignedRequest, build_signed_request};
use timevault_core::model::{Conversation, GrantEntry};
use timevault_crypto::{KeySize, PrivateKey, PublicKey, SymmetricKey};
use uuid::Uuid;

use crate::error::ClientError;
use crate::grants::{MemberAccess, creator_entries, member_entries, regrant_entries};
use crate::transport::{ArchiveTransport, Op, open_reply};

/// Parameters for a new conversation.
#[derive(Debug, Clone)]
pub struct NewConversation {
    /// Display title, unique case-insensitively on the server.
    pub title: String,
    /// Free-form description.
    pub description: String,
    /// Display color tag.
    pub color: String,
    /// Key size for the whole derivation tree.
    pub key_size: KeySize,
    /// Replace the duplicate-title check with an explicit overwrite intent.
    pub force: bool,
}

/// Handle to a conversation this session can write: id plus master key.
pub struct ConversationHandle {
    /// Server-assigned identifier.
    pub convo_id: Uuid,
    /// The freshly generated master key. Exists only client-side.
    pub master: SymmetricKey,
}

/// A signing identity bound to a registered username.
#[derive(Clone)]
pub struct Session {
    /// The username this session signs as.
    pub username: String,
    private_key: PrivateKey,
    public_key: PublicKey,
}

impl Session {
    /// Session for `username` holding `private_key`.
    pub fn new(username: impl Into<String>, private_key: PrivateKey) -> Self {
        let public_key = private_key.public_key();
        Self { username: username.into(), private_key, public_key }
    }

    /// This session's private key, for opening sealed replies and grants.
    pub fn private_key(&self) -> &PrivateKey {
        &self.private_key
    }

    /// This session's public key.
    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// Sign `body` with the session key, stamped with the current time.
    pub fn sign(&self, body: &Value) -> Result<SignedRequest, ClientError> {
        let now = chrono::Utc::now().timestamp();
        build_signed_request(&self.username, now, body, &self.private_key)
            .map_err(|e| ClientError::BadResponse { reason: e.to_string() })
    }

    /// Sign `body`, deliver it, and open the reply. The server seals every
    /// authenticated reply to this session's key; registration comes back
    /// clear and passes through unchanged.
    pub(crate) async fn call<T: ArchiveTransport>(
        &self,
        transport: &T,
        op: Op,
        body: &Value,
    ) -> Result<Value, ClientError> {
        let reply = transport.call(op, self.sign(body)?).await?;
        open_reply(reply, &self.private_key)
    }

    /// Register this session's username and public key.
    pub async fn register<T: ArchiveTransport>(&self, transport: &T) -> Result<(), ClientError> {
        let body = json!({ "publickey": self.public_key.to_pem()? });
        self.call(transport, Op::Register, &body).await?;
        tracing::info!(username = %self.username, "registered");
        Ok(())
    }

    /// Confirm this session's key still authenticates against the server.
    pub async fn login<T: ArchiveTransport>(&self, transport: &T) -> Result<(), ClientError> {
        let reply = self.call(transport, Op::Login, &json!({})).await?;
        let echoed = reply.get("username").and_then(Value::as_str);
        if echoed != Some(self.username.as_str()) {
            return Err(ClientError::BadResponse {
                reason: "login echoed a different username".to_owned(),
            });
        }
        Ok(())
    }

    /// Fetch another user's public key.
    pub async fn fetch_public_key<T: ArchiveTransport>(
        &self,
        transport: &T,
        username: &str,
    ) -> Result<PublicKey, ClientError> {
        let body = json!({ "user": username });
        let reply = self.call(transport, Op::GetUser, &body).await?;
        let pem = reply
            .get("publickey")
            .and_then(Value::as_str)
            .ok_or_else(|| ClientError::BadResponse { reason: "missing publickey".to_owned() })?;
        Ok(PublicKey::from_pem(pem)?)
    }

    /// Create a conversation: generate its master key, wrap the creator
    /// grant to this session, and hand back the handle with the key.
    pub async fn create_conversation<T: ArchiveTransport>(
        &self,
        transport: &T,
        spec: NewConversation,
    ) -> Result<ConversationHandle, ClientError> {
        let master = SymmetricKey::generate(spec.key_size);
        let grants = creator_entries(&master, &self.public_key)?;
        let body = json!({
            "title": spec.title,
            "description": spec.description,
            "color": spec.color,
            "aesSize": spec.key_size.bits(),
            "force": spec.force,
            "grants": grants,
        });
        let reply = self.call(transport, Op::CreateConversation, &body).await?;
        let convo_id = reply
            .get("convoId")
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or_else(|| ClientError::BadResponse { reason: "missing convoId".to_owned() })?;
        tracing::info!(%convo_id, "conversation created");
        Ok(ConversationHandle { convo_id, master })
    }

    /// Add a member, wrapping their grant to their registered key.
    pub async fn add_member<T: ArchiveTransport>(
        &self,
        transport: &T,
        convo_id: Uuid,
        master: &SymmetricKey,
        member: &str,
        access: MemberAccess,
        admin: bool,
    ) -> Result<(), ClientError> {
        let member_key = self.fetch_public_key(transport, member).await?;
        let grants = member_entries(master, access, &member_key)?;
        let body = json!({
            "convoId": convo_id,
            "member": member,
            "admin": admin,
            "grants": grants,
        });
        self.call(transport, Op::AddMember, &body).await?;
        tracing::info!(%convo_id, member, "member added");
        Ok(())
    }

    /// Add a member using this session's own stored grant instead of a
    /// held master key: unwrap the `all` entry with the session's private
    /// key and rewrap it for the new member's registered key. This is how
    /// an admin who created the conversation on another device (or long
    /// ago) extends access without the master key in hand.
    #[allow(clippy::too_many_arguments)]
    pub async fn add_member_from_grant<T: ArchiveTransport>(
        &self,
        transport: &T,
        convo_id: Uuid,
        own_grant: &BTreeMap<String, GrantEntry>,
        key_size: KeySize,
        member: &str,
        access: MemberAccess,
        admin: bool,
    ) -> Result<(), ClientError> {
        let member_key = self.fetch_public_key(transport, member).await?;
        let grants =
            regrant_entries(own_grant, key_size, &self.private_key, &member_key, access)?;
        let body = json!({
            "convoId": convo_id,
            "member": member,
            "admin": admin,
            "grants": grants,
        });
        self.call(transport, Op::AddMember, &body).await?;
        tracing::info!(%convo_id, member, "member added from grant");
        Ok(())
    }

    /// List the conversations this user participates in.
    pub async fn list_conversations<T: ArchiveTransport>(
        &self,
        transport: &T,
    ) -> Result<Vec<Conversation>, ClientError> {
        let reply = self.call(transport, Op::ListConversations, &json!({})).await?;
        let convos = reply
            .get("conversations")
            .cloned()
            .ok_or_else(|| ClientError::BadResponse { reason: "missing conversations".to_owned() })?;
        Ok(serde_json::from_value(convos)?)
    }
}
