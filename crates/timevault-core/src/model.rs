//! Persistent records shared by the server and the client.
//!
//! Everything here is ciphertext-shaped from the server's point of view.
//! Message payloads, sender identities, and media bodies are opaque blobs;
//! only structural metadata (sequence numbers, coordinates, ownership) is
//! visible in the clear.

use std::collections::BTreeMap;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use timevault_crypto::{AeadCiphertext, Coordinate, CryptoError};
use uuid::Uuid;

use crate::scope::{GrantScope, ScopeParseError};

/// A registered user: a name bound to a public key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Unique username, `[A-Za-z0-9_]+`.
    pub username: String,
    /// PEM-encoded RSA public key used for envelope verification and
    /// response encryption.
    pub public_key_pem: String,
    /// Registration time.
    pub created_at: DateTime<Utc>,
}

/// An AEAD ciphertext in wire form: base64 body plus base64 nonce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CipherBlob {
    /// Base64 ciphertext, tag included.
    pub ciphertext: String,
    /// Base64 96-bit nonce.
    pub iv: String,
}

impl CipherBlob {
    /// Wire form of a freshly produced ciphertext.
    pub fn from_aead(ct: &AeadCiphertext) -> Self {
        Self {
            ciphertext: BASE64.encode(&ct.ciphertext),
            iv: BASE64.encode(ct.nonce),
        }
    }

    /// Decode back into the form the cipher layer consumes.
    pub fn to_aead(&self) -> Result<AeadCiphertext, CryptoError> {
        let ciphertext = BASE64
            .decode(&self.ciphertext)
            .map_err(|_| CryptoError::MalformedInput { reason: "bad ciphertext base64".into() })?;
        let iv = BASE64
            .decode(&self.iv)
            .map_err(|_| CryptoError::MalformedInput { reason: "bad iv base64".into() })?;
        let nonce: [u8; 12] = iv
            .try_into()
            .map_err(|_| CryptoError::MalformedInput { reason: "iv must be 12 bytes".into() })?;
        Ok(AeadCiphertext { ciphertext, nonce })
    }
}

/// Conversation metadata. Titles and descriptions are stored in the clear;
/// they are organizational labels, not archive content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    /// Stable identifier.
    pub id: Uuid,
    /// Display title, unique case-insensitively unless forced.
    pub title: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
    /// Display color tag.
    #[serde(default)]
    pub color: String,
    /// AES key size for the whole conversation tree: 128, 192, or 256.
    pub aes_size: u32,
    /// Username of the creator, always an admin.
    pub created_by: String,
    /// All members, creator included.
    pub participants: Vec<String>,
    /// Members allowed to upload and to add others.
    pub admins: Vec<String>,
    /// Messages stored so far. Drives sequence assignment.
    pub message_count: u64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    /// Whether `username` may read the conversation.
    pub fn is_participant(&self, username: &str) -> bool {
        self.participants.iter().any(|p| p == username)
    }

    /// Whether `username` may upload and add members.
    pub fn is_admin(&self, username: &str) -> bool {
        self.admins.iter().any(|a| a == username)
    }
}

/// One wrapped key inside a grant: a derived key encrypted to the grantee's
/// public key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantEntry {
    /// Base64 RSA-OAEP wrapping of the raw derived key.
    #[serde(rename = "encryptedDerivedKey")]
    pub encrypted_key: String,
    /// When this entry was issued. Stamped at ingest when the wire form
    /// omits it.
    #[serde(rename = "grantedAt", default = "Utc::now")]
    pub granted_at: DateTime<Utc>,
}

/// A user's cryptographic capability over one conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grant {
    /// Conversation this grant covers.
    pub convo_id: Uuid,
    /// Username of the grantee.
    pub grantee: String,
    /// Whether the grantee may upload and add members.
    pub is_admin: bool,
    /// Scope key (`all`, `sender`, or a coordinate key) to wrapped key.
    pub entries: BTreeMap<String, GrantEntry>,
}

/// The subset of a grant released to a reader, per its strongest scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedAccess {
    /// Grantee holds `all`: full derivation capability.
    Full {
        /// The wrapped master key.
        entry: GrantEntry,
    },
    /// No `all` entry: only the sender key (if granted) is released.
    SenderOnly {
        /// The wrapped sender key, when present.
        entry: Option<GrantEntry>,
    },
}

impl Grant {
    /// Reject grants whose scope keys are malformed. Applied on ingest so
    /// stored grants are always well-formed.
    pub fn validate_scope_keys(&self) -> Result<(), ScopeParseError> {
        for key in self.entries.keys() {
            key.parse::<GrantScope>()?;
        }
        Ok(())
    }

    /// Decide what this grant releases to its holder. An `all` entry wins;
    /// otherwise only the sender entry is exposed, never raw coordinate
    /// entries the holder did not explicitly request.
    pub fn resolve_access(&self) -> ResolvedAccess {
        if let Some(entry) = self.entries.get("all") {
            ResolvedAccess::Full { entry: entry.clone() }
        } else {
            ResolvedAccess::SenderOnly { entry: self.entries.get("sender").cloned() }
        }
    }
}

impl ResolvedAccess {
    /// Wire form: the scope-key map a read response carries.
    pub fn wire_entries(&self) -> BTreeMap<String, GrantEntry> {
        let mut out = BTreeMap::new();
        match self {
            Self::Full { entry } => {
                out.insert("all".to_owned(), entry.clone());
            }
            Self::SenderOnly { entry: Some(entry) } => {
                out.insert("sender".to_owned(), entry.clone());
            }
            Self::SenderOnly { entry: None } => {}
        }
        out
    }
}

/// Kind of payload a message carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Encrypted text body.
    Text,
    /// Reference to an encrypted media object.
    Media,
}

/// Pointer from a message to its media object, with the media key wrapped
/// under the message's own derived key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaRef {
    /// Identifier of the stored media object.
    pub media_id: Uuid,
    /// The one-off media key, AEAD-encrypted under the message key.
    pub encrypted_media_key: CipherBlob,
}

/// Encrypted text payload. The metadata slot rides in the clear for client
/// bookkeeping; anything sensitive belongs inside the ciphertext.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageContent {
    /// Base64 ciphertext, tag included.
    pub ciphertext: String,
    /// Base64 96-bit nonce.
    pub iv: String,
    /// Free-form client metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl MessageContent {
    /// Decode back into the form the cipher layer consumes.
    pub fn to_aead(&self) -> Result<AeadCiphertext, CryptoError> {
        CipherBlob { ciphertext: self.ciphertext.clone(), iv: self.iv.clone() }.to_aead()
    }
}

/// One archived message. The server assigns `sequence` and the tree
/// coordinate; everything content-bearing arrives already encrypted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Owning conversation.
    pub convo_id: Uuid,
    /// 1-based position in the conversation. Derivation index is
    /// `sequence - 1`.
    pub sequence: u64,
    /// Position in the derivation tree.
    #[serde(rename = "hierarchy")]
    pub coordinate: Coordinate,
    /// Original sender identity, encrypted under the sender key.
    /// Absent for system messages.
    pub sender: Option<CipherBlob>,
    /// Username that performed the upload. Cleartext by design: it names
    /// the archivist, not the conversation participant.
    pub uploader: String,
    /// Original timestamp of the message.
    pub date: DateTime<Utc>,
    /// Payload kind.
    #[serde(rename = "type")]
    pub kind: MessageKind,
    /// Encrypted text body. Present when `kind` is `Text`.
    pub content: Option<MessageContent>,
    /// Media pointer. Present when `kind` is `Media`.
    #[serde(rename = "mediaRef")]
    pub media: Option<MediaRef>,
    /// Client-computed search tokens over the plaintext. Opaque here.
    #[serde(default)]
    pub searchable_hash: Vec<String>,
}

/// An encrypted media object. The body is opaque bytes under a one-off key
/// held only inside the owning message's `MediaRef`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Media {
    /// Stable identifier, referenced by `MediaRef`.
    pub media_id: Uuid,
    /// AEAD ciphertext of the file body.
    pub ciphertext: Vec<u8>,
    /// Base64 96-bit nonce for the body.
    pub iv: String,
    /// Declared MIME type.
    pub mime_type: String,
    /// Ciphertext length in bytes.
    pub size: u64,
    /// Username that uploaded the object.
    pub uploaded_by: String,
    /// Upload time.
    pub uploaded_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use timevault_crypto::{KeySize, SymmetricKey, aead_encrypt};

    fn entry(tag: &str) -> GrantEntry {
        GrantEntry { encrypted_key: tag.to_owned(), granted_at: Utc::now() }
    }

    fn grant_with(keys: &[&str]) -> Grant {
        Grant {
            convo_id: Uuid::new_v4(),
            grantee: "reader".to_owned(),
            is_admin: false,
            entries: keys.iter().map(|k| ((*k).to_owned(), entry(k))).collect(),
        }
    }

    #[test]
    fn full_grant_wins_over_everything_else() {
        let grant = grant_with(&["all", "sender", "message-000001.01.01.01.07"]);
        match grant.resolve_access() {
            ResolvedAccess::Full { entry } => assert_eq!(entry.encrypted_key, "all"),
            other => panic!("expected full access, got {other:?}"),
        }
    }

    #[test]
    fn without_all_only_sender_is_released() {
        let grant = grant_with(&["sender", "message-000001.01.01.01.07"]);
        let wire = grant.resolve_access().wire_entries();
        assert_eq!(wire.len(), 1);
        assert!(wire.contains_key("sender"));
    }

    #[test]
    fn empty_access_for_grant_without_sender_or_all() {
        let grant = grant_with(&["message-000001.01.01.01.07"]);
        assert!(grant.resolve_access().wire_entries().is_empty());
    }

    #[test]
    fn scope_key_validation_catches_bad_keys() {
        assert!(grant_with(&["all", "sender"]).validate_scope_keys().is_ok());
        assert!(grant_with(&["all", "message-1.01.01.01.07"]).validate_scope_keys().is_err());
    }

    #[test]
    fn wire_names_match_the_record_contract() {
        let entry = serde_json::to_value(entry("wrapped")).unwrap();
        assert!(entry.get("encryptedDerivedKey").is_some());
        assert!(entry.get("grantedAt").is_some());

        let message = Message {
            convo_id: Uuid::new_v4(),
            sequence: 1,
            coordinate: Coordinate::from_index(0),
            sender: None,
            uploader: "archivist".to_owned(),
            date: Utc::now(),
            kind: MessageKind::Media,
            content: None,
            media: Some(MediaRef {
                media_id: Uuid::new_v4(),
                encrypted_media_key: CipherBlob {
                    ciphertext: "a2V5".to_owned(),
                    iv: "aXZpdml2aXZpdg==".to_owned(),
                },
            }),
            searchable_hash: vec![],
        };
        let wire = serde_json::to_value(&message).unwrap();
        assert!(wire.get("hierarchy").is_some());
        assert_eq!(wire["type"], "media");
        assert!(wire["mediaRef"].get("mediaId").is_some());
        assert!(wire["mediaRef"].get("encryptedMediaKey").is_some());
        assert!(wire.get("searchableHash").is_some());

        // The metadata slot is optional on the wire.
        let content: MessageContent =
            serde_json::from_value(serde_json::json!({ "ciphertext": "Yg==", "iv": "aXY=" }))
                .unwrap();
        assert!(content.metadata.is_none());
    }

    #[test]
    fn cipher_blob_roundtrip() {
        let key = SymmetricKey::generate(KeySize::Bits256);
        let ct = aead_encrypt(&key, b"payload");
        let blob = CipherBlob::from_aead(&ct);
        assert_eq!(blob.to_aead().unwrap(), ct);
    }

    #[test]
    fn cipher_blob_rejects_short_iv() {
        let blob = CipherBlob { ciphertext: BASE64.encode(b"abc"), iv: BASE64.encode(b"short") };
        assert!(blob.to_aead().is_err());
    }
}
