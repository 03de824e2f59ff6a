//! The archive operations.
//!
//! Each operation takes a signed envelope and the current unix time,
//! authenticates the sender, acts on storage, and produces an
//! [`ApiResponse`]. The handlers are pure with respect to time and
//! transport, so the whole layer is exercised by plain unit tests.
//!
//! Everything content-bearing stays ciphertext end to end: handlers route
//! and validate blobs, assign sequences and tree coordinates, and release
//! wrapped keys strictly per grant, but they can decrypt none of it.

use std::collections::BTreeMap;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::{Value, json};
use timevault_core::envelope::{SignedRequest, check_freshness, parse_envelope, verify_signature};
use timevault_core::error::ApiError;
use timevault_core::model::{
    CipherBlob, Conversation, Grant, GrantEntry, Media, MediaRef, Message, MessageContent,
    MessageKind, User,
};
use timevault_crypto::{Coordinate, KeySize, PublicKey};
use uuid::Uuid;

use crate::auth::{AuthenticatedRequest, Authenticator};
use crate::respond::{ApiResponse, ResponseEncryptor};
use crate::storage::{Storage, StorageError};

/// Messages returned per read when the caller does not say.
pub const DEFAULT_PAGE_SIZE: usize = 100;
/// Hard cap on messages per read.
pub const MAX_PAGE_SIZE: usize = 1000;
/// Longest accepted username.
pub const MAX_USERNAME_LEN: usize = 64;

fn storage_err(e: StorageError) -> ApiError {
    match e {
        StorageError::ConversationNotFound { .. } => {
            ApiError::NotFound { what: "conversation".to_owned() }
        }
        other => ApiError::Internal { detail: other.to_string() },
    }
}

fn parse_body<T: for<'de> Deserialize<'de>>(
    body: &serde_json::Map<String, Value>,
) -> Result<T, ApiError> {
    serde_json::from_value(Value::Object(body.clone()))
        .map_err(|e| ApiError::BadRequest { reason: e.to_string() })
}

fn valid_username(username: &str) -> bool {
    !username.is_empty()
        && username.len() <= MAX_USERNAME_LEN
        && username.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

#[derive(Deserialize)]
struct RegisterBody {
    username: String,
    #[serde(rename = "publickey")]
    public_key: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateConversationBody {
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    color: String,
    aes_size: u32,
    #[serde(default)]
    force: bool,
    grants: BTreeMap<String, GrantEntry>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddMemberBody {
    convo_id: Uuid,
    member: String,
    #[serde(default)]
    admin: bool,
    grants: BTreeMap<String, GrantEntry>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IncomingMessage {
    /// Absent or null marks a system message.
    #[serde(default)]
    sender: Option<CipherBlob>,
    /// Original message time, unix seconds.
    date: i64,
    #[serde(rename = "type")]
    kind: MessageKind,
    #[serde(default)]
    content: Option<MessageContent>,
    #[serde(default)]
    media: Option<MediaRef>,
    #[serde(default)]
    searchable_hash: Vec<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadMessagesBody {
    convo_id: Uuid,
    batch_id: String,
    messages: Vec<IncomingMessage>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadMediaBody {
    convo_id: Uuid,
    ciphertext: String,
    iv: String,
    mime_type: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MediaQueryBody {
    convo_id: Uuid,
    media_id: Uuid,
}

fn default_from() -> u64 {
    1
}

fn default_limit() -> usize {
    DEFAULT_PAGE_SIZE
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetMessagesBody {
    convo_id: Uuid,
    #[serde(default = "default_from")]
    from: u64,
    #[serde(default = "default_limit")]
    limit: usize,
}

/// The archive operation layer over a [`Storage`] backend.
#[derive(Clone)]
pub struct Api<S> {
    storage: S,
    auth: Authenticator<S>,
}

impl<S: Storage> Api<S> {
    /// Build the operation layer over `storage`.
    pub fn new(storage: S) -> Self {
        let auth = Authenticator::new(storage.clone());
        Self { storage, auth }
    }

    /// Register a new user.
    ///
    /// The envelope is self-signed with the key being registered, so this
    /// is the one operation that runs its own check pipeline instead of
    /// [`Authenticator`].
    pub fn register(&self, request: &SignedRequest, now: i64) -> ApiResponse {
        match self.register_inner(request, now) {
            Ok(body) => ApiResponse::Clear(body),
            Err(e) => ApiResponse::from_error(&e),
        }
    }

    fn register_inner(&self, request: &SignedRequest, now: i64) -> Result<Value, ApiError> {
        let parsed = parse_envelope(request)?;
        let body: RegisterBody = parse_body(&parsed.body)?;
        if self.storage.load_user(&body.username).map_err(storage_err)?.is_some() {
            return Err(ApiError::Duplicate { what: "user".to_owned() });
        }
        let public_key = PublicKey::from_pem(&body.public_key).map_err(|e| {
            ApiError::Validation { field: "publickey".to_owned(), reason: e.to_string() }
        })?;
        verify_signature(request, &public_key)?;
        check_freshness(parsed.timestamp, now)?;
        if !valid_username(&body.username) {
            return Err(ApiError::Validation {
                field: "username".to_owned(),
                reason: "must be 1-64 characters of [A-Za-z0-9_]".to_owned(),
            });
        }
        let user = User {
            username: body.username.clone(),
            public_key_pem: body.public_key,
            created_at: unix_to_datetime(now),
        };
        self.storage.put_user(&user).map_err(storage_err)?;
        tracing::info!(username = %user.username, "user registered");
        Ok(json!({ "username": user.username, "state": 0 }))
    }

    /// Create a conversation. The caller becomes its first participant and
    /// admin; the grant map in the body (wrapped by the caller, to the
    /// caller) is stored untouched.
    pub fn create_conversation(&self, request: &SignedRequest, now: i64) -> ApiResponse {
        self.sealed_op(request, now, |api, auth| api.create_conversation_inner(auth, now))
    }

    fn create_conversation_inner(
        &self,
        auth: &AuthenticatedRequest,
        now: i64,
    ) -> Result<Value, ApiError> {
        let body: CreateConversationBody = parse_body(&auth.body)?;
        if body.title.trim().is_empty() {
            return Err(ApiError::Validation {
                field: "title".to_owned(),
                reason: "must not be empty".to_owned(),
            });
        }
        KeySize::from_bits(body.aes_size).map_err(|_| ApiError::Validation {
            field: "aesSize".to_owned(),
            reason: "must be 128, 192 or 256".to_owned(),
        })?;
        if !body.grants.contains_key("all") {
            return Err(ApiError::Validation {
                field: "grants".to_owned(),
                reason: "creator grant must include the all scope".to_owned(),
            });
        }
        // The force flag lives inside the signed body, so only the caller
        // can assert it. Titles are unique per participant, not globally:
        // another user's conversation of the same name is invisible here.
        if !body.force
            && self
                .storage
                .find_conversation_by_title(&body.title, &auth.username)
                .map_err(storage_err)?
                .is_some()
        {
            return Err(ApiError::Duplicate { what: "conversation title".to_owned() });
        }

        let convo = Conversation {
            id: Uuid::new_v4(),
            title: body.title,
            description: body.description,
            color: body.color,
            aes_size: body.aes_size,
            created_by: auth.username.clone(),
            participants: vec![auth.username.clone()],
            admins: vec![auth.username.clone()],
            message_count: 0,
            created_at: unix_to_datetime(now),
        };
        let grant = Grant {
            convo_id: convo.id,
            grantee: auth.username.clone(),
            is_admin: true,
            entries: body.grants,
        };
        grant.validate_scope_keys().map_err(|e| ApiError::Validation {
            field: "grants".to_owned(),
            reason: e.to_string(),
        })?;
        self.storage.put_conversation(&convo).map_err(storage_err)?;
        self.storage.put_grant(&grant).map_err(storage_err)?;
        tracing::info!(convo_id = %convo.id, created_by = %auth.username, "conversation created");
        Ok(json!({ "convoId": convo.id, "state": 0 }))
    }

    /// Add a member to a conversation. Admin only. The grant map was
    /// wrapped by the admin to the new member's public key.
    pub fn add_member(&self, request: &SignedRequest, now: i64) -> ApiResponse {
        self.sealed_op(request, now, |api, auth| api.add_member_inner(auth))
    }

    fn add_member_inner(&self, auth: &AuthenticatedRequest) -> Result<Value, ApiError> {
        let body: AddMemberBody = parse_body(&auth.body)?;
        let convo = self.load_convo(body.convo_id)?;
        if !convo.is_admin(&auth.username) {
            return Err(ApiError::Forbidden);
        }
        if self.storage.load_user(&body.member).map_err(storage_err)?.is_none() {
            return Err(ApiError::UnknownUser);
        }
        let grant = Grant {
            convo_id: body.convo_id,
            grantee: body.member.clone(),
            is_admin: body.admin,
            entries: body.grants,
        };
        grant.validate_scope_keys().map_err(|e| ApiError::Validation {
            field: "grants".to_owned(),
            reason: e.to_string(),
        })?;
        let added = self
            .storage
            .add_participant(body.convo_id, &body.member, body.admin, &grant)
            .map_err(storage_err)?;
        if !added {
            return Err(ApiError::Duplicate { what: "member".to_owned() });
        }
        tracing::info!(
            convo_id = %body.convo_id,
            member = %body.member,
            admin = body.admin,
            "member added"
        );
        Ok(json!({ "state": 0 }))
    }

    /// Authenticated echo. Lets a client confirm its key still matches the
    /// registered one before doing real work.
    pub fn login(&self, request: &SignedRequest, now: i64) -> ApiResponse {
        self.sealed_op(request, now, |_, auth| {
            Ok(json!({ "username": auth.username, "state": 0 }))
        })
    }

    /// Look up a registered user's public key. Needed by admins to wrap
    /// grant keys for a new member; public keys are public.
    pub fn get_user(&self, request: &SignedRequest, now: i64) -> ApiResponse {
        self.sealed_op(request, now, |api, auth| {
            #[derive(Deserialize)]
            struct GetUserBody {
                user: String,
            }
            let body: GetUserBody = parse_body(&auth.body)?;
            let user = api
                .storage
                .load_user(&body.user)
                .map_err(storage_err)?
                .ok_or(ApiError::UnknownUser)?;
            Ok(json!({
                "username": user.username,
                "publickey": user.public_key_pem,
                "state": 0,
            }))
        })
    }

    /// List the conversations the caller participates in. Metadata only.
    pub fn list_conversations(&self, request: &SignedRequest, now: i64) -> ApiResponse {
        self.sealed_op(request, now, |api, auth| {
            let convos =
                api.storage.list_conversations_for(&auth.username).map_err(storage_err)?;
            Ok(json!({ "conversations": convos, "state": 0 }))
        })
    }

    /// Store one encrypted media object. Admin only; returns the assigned
    /// media id for the referencing message to carry.
    pub fn upload_media(&self, request: &SignedRequest, now: i64) -> ApiResponse {
        self.sealed_op(request, now, |api, auth| api.upload_media_inner(auth, now))
    }

    fn upload_media_inner(&self, auth: &AuthenticatedRequest, now: i64) -> Result<Value, ApiError> {
        let body: UploadMediaBody = parse_body(&auth.body)?;
        let convo = self.load_convo(body.convo_id)?;
        if !convo.is_admin(&auth.username) {
            return Err(ApiError::Forbidden);
        }
        let ciphertext = BASE64.decode(&body.ciphertext).map_err(|_| ApiError::Validation {
            field: "ciphertext".to_owned(),
            reason: "invalid base64".to_owned(),
        })?;
        let media = Media {
            media_id: Uuid::new_v4(),
            size: ciphertext.len() as u64,
            ciphertext,
            iv: body.iv,
            mime_type: body.mime_type,
            uploaded_by: auth.username.clone(),
            uploaded_at: unix_to_datetime(now),
        };
        self.storage.put_media(&media).map_err(storage_err)?;
        tracing::debug!(media_id = %media.media_id, size = media.size, "media stored");
        Ok(json!({ "mediaId": media.media_id, "state": 0 }))
    }

    /// Whether a media object is durably stored. Uploads poll this before
    /// sending the message that references the object.
    pub fn media_ready(&self, request: &SignedRequest, now: i64) -> ApiResponse {
        self.sealed_op(request, now, |api, auth| {
            let body: MediaQueryBody = parse_body(&auth.body)?;
            let convo = api.load_convo(body.convo_id)?;
            if !convo.is_participant(&auth.username) {
                return Err(ApiError::Forbidden);
            }
            let ready = api.storage.load_media(body.media_id).map_err(storage_err)?.is_some();
            Ok(json!({ "ready": ready, "state": 0 }))
        })
    }

    /// Fetch one encrypted media object. The body is opaque without the
    /// media key held in the referencing message, so it travels as stored.
    pub fn get_media(&self, request: &SignedRequest, now: i64) -> ApiResponse {
        self.sealed_op(request, now, |api, auth| {
            let body: MediaQueryBody = parse_body(&auth.body)?;
            let convo = api.load_convo(body.convo_id)?;
            if !convo.is_participant(&auth.username) {
                return Err(ApiError::Forbidden);
            }
            let media = api
                .storage
                .load_media(body.media_id)
                .map_err(storage_err)?
                .ok_or_else(|| ApiError::NotFound { what: "media".to_owned() })?;
            Ok(json!({
                "mediaId": media.media_id,
                "ciphertext": BASE64.encode(&media.ciphertext),
                "iv": media.iv,
                "mimeType": media.mime_type,
                "state": 0,
            }))
        })
    }

    /// Store a batch of messages. Admin only. The server assigns sequences
    /// atomically and derives each message's tree coordinate from
    /// `sequence - 1`; retrying a batch id reuses the original range.
    pub fn upload_messages(&self, request: &SignedRequest, now: i64) -> ApiResponse {
        self.sealed_op(request, now, |api, auth| api.upload_messages_inner(auth))
    }

    fn upload_messages_inner(&self, auth: &AuthenticatedRequest) -> Result<Value, ApiError> {
        let body: UploadMessagesBody = parse_body(&auth.body)?;
        let convo = self.load_convo(body.convo_id)?;
        if !convo.is_admin(&auth.username) {
            return Err(ApiError::Forbidden);
        }
        if body.messages.is_empty() {
            return Err(ApiError::Validation {
                field: "messages".to_owned(),
                reason: "batch must not be empty".to_owned(),
            });
        }
        if body.batch_id.is_empty() {
            return Err(ApiError::Validation {
                field: "batchId".to_owned(),
                reason: "must not be empty".to_owned(),
            });
        }
        for (i, message) in body.messages.iter().enumerate() {
            match (message.kind, &message.content, &message.media) {
                (MessageKind::Text, Some(_), None) => {}
                (MessageKind::Media, None, Some(media_ref)) => {
                    if self
                        .storage
                        .load_media(media_ref.media_id)
                        .map_err(storage_err)?
                        .is_none()
                    {
                        return Err(ApiError::NotFound { what: "media".to_owned() });
                    }
                }
                _ => {
                    return Err(ApiError::Validation {
                        field: format!("messages[{i}]"),
                        reason: "payload does not match its type".to_owned(),
                    });
                }
            }
        }

        let range = self
            .storage
            .reserve_sequences(body.convo_id, &body.batch_id, body.messages.len() as u64)
            .map_err(storage_err)?;
        if range.replayed && range.count != body.messages.len() as u64 {
            return Err(ApiError::Validation {
                field: "batchId".to_owned(),
                reason: "batch was previously reserved with a different size".to_owned(),
            });
        }
        for (i, incoming) in body.messages.into_iter().enumerate() {
            let sequence = range.first + i as u64;
            let message = Message {
                convo_id: body.convo_id,
                sequence,
                coordinate: Coordinate::from_index(sequence - 1),
                sender: incoming.sender,
                uploader: auth.username.clone(),
                date: unix_to_datetime(incoming.date),
                kind: incoming.kind,
                content: incoming.content,
                media: incoming.media,
                searchable_hash: incoming.searchable_hash,
            };
            self.storage.put_message(&message).map_err(storage_err)?;
        }
        tracing::info!(
            convo_id = %body.convo_id,
            first = range.first,
            count = range.count,
            replayed = range.replayed,
            "batch stored"
        );
        Ok(json!({
            "firstSequence": range.first,
            "count": range.count,
            "replayed": range.replayed,
            "state": 0,
        }))
    }

    /// Read a page of messages. Participant only. The response carries the
    /// caller's resolved grant entries and the conversation key size, and
    /// is always sealed to the caller's key.
    pub fn get_messages(&self, request: &SignedRequest, now: i64) -> ApiResponse {
        self.sealed_op(request, now, |api, auth| api.get_messages_inner(auth))
    }

    fn get_messages_inner(&self, auth: &AuthenticatedRequest) -> Result<Value, ApiError> {
        let body: GetMessagesBody = parse_body(&auth.body)?;
        let convo = self.load_convo(body.convo_id)?;
        if !convo.is_participant(&auth.username) {
            return Err(ApiError::Forbidden);
        }
        let limit = body.limit.clamp(1, MAX_PAGE_SIZE);
        let messages = self
            .storage
            .load_messages(body.convo_id, body.from, limit)
            .map_err(storage_err)?;
        let grants = self
            .storage
            .load_grant(body.convo_id, &auth.username)
            .map_err(storage_err)?
            .map(|g| g.resolve_access().wire_entries())
            .unwrap_or_default();
        Ok(json!({
            "messages": messages,
            "grants": grants,
            "keySize": convo.aes_size,
            "total": convo.message_count,
            "state": 0,
        }))
    }

    fn load_convo(&self, convo_id: Uuid) -> Result<Conversation, ApiError> {
        self.storage
            .load_conversation(convo_id)
            .map_err(storage_err)?
            .ok_or_else(|| ApiError::NotFound { what: "conversation".to_owned() })
    }

    /// Authenticate, run `op`, and seal its body to the caller's key.
    /// Every operation past registration answers sealed; only error
    /// bodies travel in the clear.
    fn sealed_op(
        &self,
        request: &SignedRequest,
        now: i64,
        op: impl FnOnce(&Self, &AuthenticatedRequest) -> Result<Value, ApiError>,
    ) -> ApiResponse {
        let auth = match self.auth.authenticate(request, now) {
            Ok(auth) => auth,
            Err(e) => return ApiResponse::from_error(&e),
        };
        let mut encryptor = ResponseEncryptor::new(auth.public_key.clone());
        match op(self, &auth) {
            Ok(body) => encryptor.seal(&body),
            Err(e) => ApiResponse::from_error(&e),
        }
    }
}

fn unix_to_datetime(secs: i64) -> DateTime<Utc> {
    // Out-of-range seconds clamp to the epoch rather than failing the
    // whole request over a bad client clock.
    Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
}
