//! The read path: fetch pages, open grants, walk the key tree, decrypt.

use std::collections::BTreeMap;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use timevault_core::model::{GrantEntry, Message, MessageKind};
use timevault_crypto::{
    AeadCiphertext, Coordinate, DerivationChain, KeySize, SymmetricKey, aead_decrypt,
};
use uuid::Uuid;

use crate::error::ClientError;
use crate::grants::{UnlockedAccess, unwrap_entries};
use crate::session::Session;
use crate::transport::{ArchiveTransport, Op};

/// Messages fetched per request when paging through a conversation.
const PAGE_SIZE: usize = 500;

/// One page of a conversation as the server releases it.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadPage {
    /// Messages in ascending sequence order.
    pub messages: Vec<Message>,
    /// The caller's resolved grant entries.
    pub grants: BTreeMap<String, GrantEntry>,
    /// Conversation key size in bits.
    pub key_size: u32,
    /// Total messages stored.
    pub total: u64,
}

/// A message after decryption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptedMessage {
    /// Position in the conversation.
    pub sequence: u64,
    /// Original sender, when one exists and the sender key was granted.
    pub sender: Option<String>,
    /// Original message time.
    pub date: DateTime<Utc>,
    /// The payload, as far as the caller's grant reaches.
    pub body: MessageBody,
}

/// How much of a message the caller's keys could open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    /// Decrypted text.
    Text(String),
    /// Decrypted media bytes with their declared MIME type.
    Media {
        /// The file body.
        data: Vec<u8>,
        /// Declared MIME type.
        mime_type: String,
    },
    /// No key reached this payload.
    Sealed,
}

/// Fetch one page of messages, opening the sealed reply.
pub async fn fetch_page<T: ArchiveTransport>(
    transport: &T,
    session: &Session,
    convo_id: Uuid,
    from: u64,
    limit: usize,
) -> Result<ReadPage, ClientError> {
    let body = json!({ "convoId": convo_id, "from": from, "limit": limit });
    let opened = session.call(transport, Op::GetMessages, &body).await?;
    Ok(serde_json::from_value(opened)?)
}

/// Fetch and decrypt a whole conversation.
///
/// Pages through the archive, opens the released grant entries, and
/// decrypts as much as those keys reach: with `all` everything opens, with
/// only `sender` the payloads stay [`MessageBody::Sealed`] but senders are
/// named. Messages come back sorted by sequence.
pub async fn read_conversation<T: ArchiveTransport>(
    transport: &T,
    session: &Session,
    convo_id: Uuid,
) -> Result<Vec<DecryptedMessage>, ClientError> {
    let mut messages: Vec<Message> = Vec::new();
    let first_page = fetch_page(transport, session, convo_id, 1, PAGE_SIZE).await?;
    let key_size = KeySize::from_bits(first_page.key_size)?;
    let access = unwrap_entries(&first_page.grants, key_size, session.private_key())?;
    messages.extend(first_page.messages);

    while (messages.len() as u64) < first_page.total {
        let from = messages.last().map_or(1, |m| m.sequence + 1);
        let page = fetch_page(transport, session, convo_id, from, PAGE_SIZE).await?;
        if page.messages.is_empty() {
            break;
        }
        messages.extend(page.messages);
    }
    messages.sort_by_key(|m| m.sequence);

    decrypt_messages(transport, session, convo_id, &access, messages).await
}

async fn decrypt_messages<T: ArchiveTransport>(
    transport: &T,
    session: &Session,
    convo_id: Uuid,
    access: &UnlockedAccess,
    messages: Vec<Message>,
) -> Result<Vec<DecryptedMessage>, ClientError> {
    let mut chain = access
        .master
        .as_ref()
        .map(|master| DerivationChain::new(master.as_bytes(), master.size()));
    // A master holder is not handed a separate sender entry; the sender
    // key derives from the chain.
    let sender_key = access
        .sender
        .clone()
        .or_else(|| chain.as_ref().map(DerivationChain::sender_key));

    let mut out = Vec::with_capacity(messages.len());
    for message in messages {
        let sender = match (&sender_key, &message.sender) {
            (Some(sender_key), Some(blob)) => {
                let raw = aead_decrypt(sender_key, &blob.to_aead()?)?;
                Some(String::from_utf8(raw).map_err(|_| ClientError::BadResponse {
                    reason: "sender is not UTF-8".to_owned(),
                })?)
            }
            // System messages carry no sender; without the sender key the
            // name stays sealed either way.
            _ => None,
        };

        let body = match chain.as_mut() {
            Some(chain) => {
                // Derive from the sequence rather than trusting the stored
                // coordinate; the two must agree for keys to line up.
                let key = chain.message_key(Coordinate::from_index(message.sequence - 1));
                open_payload(transport, session, convo_id, &message, &key).await?
            }
            None => MessageBody::Sealed,
        };

        out.push(DecryptedMessage { sequence: message.sequence, sender, date: message.date, body });
    }
    Ok(out)
}

async fn open_payload<T: ArchiveTransport>(
    transport: &T,
    session: &Session,
    convo_id: Uuid,
    message: &Message,
    key: &SymmetricKey,
) -> Result<MessageBody, ClientError> {
    match message.kind {
        MessageKind::Text => {
            let blob = message.content.as_ref().ok_or_else(|| ClientError::BadResponse {
                reason: "text message without content".to_owned(),
            })?;
            let raw = aead_decrypt(key, &blob.to_aead()?)?;
            Ok(MessageBody::Text(String::from_utf8(raw).map_err(|_| {
                ClientError::BadResponse { reason: "message body is not UTF-8".to_owned() }
            })?))
        }
        MessageKind::Media => {
            let media_ref = message.media.as_ref().ok_or_else(|| ClientError::BadResponse {
                reason: "media message without media reference".to_owned(),
            })?;
            let raw_key = aead_decrypt(key, &media_ref.encrypted_media_key.to_aead()?)?;
            let media_key = SymmetricKey::from_bytes(raw_key)?;
            let (data, mime_type) =
                fetch_media(transport, session, convo_id, media_ref.media_id, &media_key).await?;
            Ok(MessageBody::Media { data, mime_type })
        }
    }
}

async fn fetch_media<T: ArchiveTransport>(
    transport: &T,
    session: &Session,
    convo_id: Uuid,
    media_id: Uuid,
    media_key: &SymmetricKey,
) -> Result<(Vec<u8>, String), ClientError> {
    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct MediaBody {
        ciphertext: String,
        iv: String,
        mime_type: String,
    }

    let body = json!({ "convoId": convo_id, "mediaId": media_id });
    let reply = session.call(transport, Op::GetMedia, &body).await?;
    let media: MediaBody = serde_json::from_value(reply)?;

    let ciphertext = BASE64.decode(&media.ciphertext).map_err(|_| ClientError::BadResponse {
        reason: "media ciphertext is not base64".to_owned(),
    })?;
    let iv = BASE64.decode(&media.iv).map_err(|_| ClientError::BadResponse {
        reason: "media iv is not base64".to_owned(),
    })?;
    let nonce: [u8; 12] = iv.try_into().map_err(|_| ClientError::BadResponse {
        reason: "media iv must be 12 bytes".to_owned(),
    })?;
    let data = aead_decrypt(media_key, &AeadCiphertext { ciphertext, nonce })?;
    Ok((data, media.mime_type))
}
