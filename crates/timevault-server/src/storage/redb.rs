//! Redb-backed durable storage.
//!
//! Uses redb's ACID transactions for crash safety; compound operations
//! (membership plus grant, sequence reservation plus batch record) commit in
//! a single write transaction. Records are CBOR-encoded.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use timevault_core::model::{Conversation, Grant, Media, Message, User};
use uuid::Uuid;

use super::{ReservedRange, Storage, StorageError};

/// Key: username UTF-8. Value: CBOR `User`.
const USERS: TableDefinition<&str, &[u8]> = TableDefinition::new("users");

/// Key: conversation id, 16 bytes. Value: CBOR `Conversation`.
const CONVOS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("conversations");

/// Key: conversation id ++ grantee UTF-8. Value: CBOR `Grant`.
const GRANTS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("grants");

/// Key: conversation id ++ sequence (8 bytes BE), so lexicographic order is
/// sequence order. Value: CBOR `Message`.
const MESSAGES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("messages");

/// Key: media id, 16 bytes. Value: CBOR `Media`.
const MEDIA: TableDefinition<&[u8], &[u8]> = TableDefinition::new("media");

/// Key: conversation id ++ batch id UTF-8. Value: first sequence (8 bytes
/// BE) ++ count (8 bytes BE).
const BATCHES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("batches");

/// Durable storage backed by redb. Clone is cheap (`Arc`).
#[derive(Clone)]
pub struct RedbStorage {
    db: Arc<Database>,
}

fn io_err(e: impl std::fmt::Display) -> StorageError {
    StorageError::Io(e.to_string())
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    let mut bytes = Vec::new();
    ciborium::into_writer(value, &mut bytes)
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    Ok(bytes)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StorageError> {
    ciborium::from_reader(bytes).map_err(|e| StorageError::Serialization(e.to_string()))
}

fn grant_key(convo_id: Uuid, grantee: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(16 + grantee.len());
    key.extend_from_slice(convo_id.as_bytes());
    key.extend_from_slice(grantee.as_bytes());
    key
}

fn message_key(convo_id: Uuid, sequence: u64) -> [u8; 24] {
    let mut key = [0u8; 24];
    key[..16].copy_from_slice(convo_id.as_bytes());
    key[16..].copy_from_slice(&sequence.to_be_bytes());
    key
}

fn batch_key(convo_id: Uuid, batch_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(16 + batch_id.len());
    key.extend_from_slice(convo_id.as_bytes());
    key.extend_from_slice(batch_id.as_bytes());
    key
}

impl RedbStorage {
    /// Open or create a database at `path`, creating all tables.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = Database::create(path.as_ref()).map_err(io_err)?;

        let txn = db.begin_write().map_err(io_err)?;
        {
            let _ = txn.open_table(USERS).map_err(io_err)?;
            let _ = txn.open_table(CONVOS).map_err(io_err)?;
            let _ = txn.open_table(GRANTS).map_err(io_err)?;
            let _ = txn.open_table(MESSAGES).map_err(io_err)?;
            let _ = txn.open_table(MEDIA).map_err(io_err)?;
            let _ = txn.open_table(BATCHES).map_err(io_err)?;
        }
        txn.commit().map_err(io_err)?;

        Ok(Self { db: Arc::new(db) })
    }
}

impl Storage for RedbStorage {
    fn put_user(&self, user: &User) -> Result<(), StorageError> {
        let txn = self.db.begin_write().map_err(io_err)?;
        {
            let mut table = txn.open_table(USERS).map_err(io_err)?;
            let bytes = encode(user)?;
            table.insert(user.username.as_str(), bytes.as_slice()).map_err(io_err)?;
        }
        txn.commit().map_err(io_err)?;
        Ok(())
    }

    fn load_user(&self, username: &str) -> Result<Option<User>, StorageError> {
        let txn = self.db.begin_read().map_err(io_err)?;
        let table = txn.open_table(USERS).map_err(io_err)?;
        match table.get(username).map_err(io_err)? {
            Some(value) => Ok(Some(decode(value.value())?)),
            None => Ok(None),
        }
    }

    fn put_conversation(&self, convo: &Conversation) -> Result<(), StorageError> {
        let txn = self.db.begin_write().map_err(io_err)?;
        {
            let mut table = txn.open_table(CONVOS).map_err(io_err)?;
            let bytes = encode(convo)?;
            table.insert(convo.id.as_bytes().as_slice(), bytes.as_slice()).map_err(io_err)?;
        }
        txn.commit().map_err(io_err)?;
        Ok(())
    }

    fn load_conversation(&self, convo_id: Uuid) -> Result<Option<Conversation>, StorageError> {
        let txn = self.db.begin_read().map_err(io_err)?;
        let table = txn.open_table(CONVOS).map_err(io_err)?;
        match table.get(convo_id.as_bytes().as_slice()).map_err(io_err)? {
            Some(value) => Ok(Some(decode(value.value())?)),
            None => Ok(None),
        }
    }

    fn find_conversation_by_title(
        &self,
        title: &str,
        username: &str,
    ) -> Result<Option<Conversation>, StorageError> {
        let txn = self.db.begin_read().map_err(io_err)?;
        let table = txn.open_table(CONVOS).map_err(io_err)?;
        for result in table.iter().map_err(io_err)? {
            let (_, value) = result.map_err(io_err)?;
            let convo: Conversation = decode(value.value())?;
            if convo.title.eq_ignore_ascii_case(title) && convo.is_participant(username) {
                return Ok(Some(convo));
            }
        }
        Ok(None)
    }

    fn list_conversations_for(&self, username: &str) -> Result<Vec<Conversation>, StorageError> {
        let txn = self.db.begin_read().map_err(io_err)?;
        let table = txn.open_table(CONVOS).map_err(io_err)?;
        let mut out = Vec::new();
        for result in table.iter().map_err(io_err)? {
            let (_, value) = result.map_err(io_err)?;
            let convo: Conversation = decode(value.value())?;
            if convo.is_participant(username) {
                out.push(convo);
            }
        }
        Ok(out)
    }

    fn put_grant(&self, grant: &Grant) -> Result<(), StorageError> {
        let txn = self.db.begin_write().map_err(io_err)?;
        {
            let mut table = txn.open_table(GRANTS).map_err(io_err)?;
            let key = grant_key(grant.convo_id, &grant.grantee);
            let bytes = encode(grant)?;
            table.insert(key.as_slice(), bytes.as_slice()).map_err(io_err)?;
        }
        txn.commit().map_err(io_err)?;
        Ok(())
    }

    fn load_grant(&self, convo_id: Uuid, grantee: &str) -> Result<Option<Grant>, StorageError> {
        let txn = self.db.begin_read().map_err(io_err)?;
        let table = txn.open_table(GRANTS).map_err(io_err)?;
        let key = grant_key(convo_id, grantee);
        match table.get(key.as_slice()).map_err(io_err)? {
            Some(value) => Ok(Some(decode(value.value())?)),
            None => Ok(None),
        }
    }

    fn add_participant(
        &self,
        convo_id: Uuid,
        username: &str,
        admin: bool,
        grant: &Grant,
    ) -> Result<bool, StorageError> {
        let txn = self.db.begin_write().map_err(io_err)?;
        let added = {
            let mut convos = txn.open_table(CONVOS).map_err(io_err)?;
            let mut convo: Conversation =
                match convos.get(convo_id.as_bytes().as_slice()).map_err(io_err)? {
                    Some(value) => decode(value.value())?,
                    None => return Err(StorageError::ConversationNotFound { convo_id }),
                };
            if convo.is_participant(username) {
                false
            } else {
                convo.participants.push(username.to_owned());
                if admin {
                    convo.admins.push(username.to_owned());
                }
                let bytes = encode(&convo)?;
                convos
                    .insert(convo_id.as_bytes().as_slice(), bytes.as_slice())
                    .map_err(io_err)?;

                let mut grants = txn.open_table(GRANTS).map_err(io_err)?;
                let key = grant_key(convo_id, username);
                let bytes = encode(grant)?;
                grants.insert(key.as_slice(), bytes.as_slice()).map_err(io_err)?;
                true
            }
        };
        txn.commit().map_err(io_err)?;
        Ok(added)
    }

    fn reserve_sequences(
        &self,
        convo_id: Uuid,
        batch_id: &str,
        count: u64,
    ) -> Result<ReservedRange, StorageError> {
        let txn = self.db.begin_write().map_err(io_err)?;
        let range = {
            let mut batches = txn.open_table(BATCHES).map_err(io_err)?;
            let key = batch_key(convo_id, batch_id);
            if let Some(value) = batches.get(key.as_slice()).map_err(io_err)? {
                let bytes = value.value();
                if bytes.len() != 16 {
                    return Err(StorageError::Serialization(
                        "batch record has wrong length".to_owned(),
                    ));
                }
                let first = u64::from_be_bytes(
                    bytes[..8].try_into().map_err(|_| io_err("batch record truncated"))?,
                );
                let count = u64::from_be_bytes(
                    bytes[8..].try_into().map_err(|_| io_err("batch record truncated"))?,
                );
                ReservedRange { first, count, replayed: true }
            } else {
                let mut convos = txn.open_table(CONVOS).map_err(io_err)?;
                let mut convo: Conversation =
                    match convos.get(convo_id.as_bytes().as_slice()).map_err(io_err)? {
                        Some(value) => decode(value.value())?,
                        None => return Err(StorageError::ConversationNotFound { convo_id }),
                    };
                let first = convo.message_count + 1;
                convo.message_count += count;
                let bytes = encode(&convo)?;
                convos
                    .insert(convo_id.as_bytes().as_slice(), bytes.as_slice())
                    .map_err(io_err)?;

                let mut value = [0u8; 16];
                value[..8].copy_from_slice(&first.to_be_bytes());
                value[8..].copy_from_slice(&count.to_be_bytes());
                batches.insert(key.as_slice(), value.as_slice()).map_err(io_err)?;
                ReservedRange { first, count, replayed: false }
            }
        };
        txn.commit().map_err(io_err)?;
        Ok(range)
    }

    fn put_message(&self, message: &Message) -> Result<(), StorageError> {
        let txn = self.db.begin_write().map_err(io_err)?;
        {
            let mut table = txn.open_table(MESSAGES).map_err(io_err)?;
            let key = message_key(message.convo_id, message.sequence);
            let bytes = encode(message)?;
            table.insert(key.as_slice(), bytes.as_slice()).map_err(io_err)?;
        }
        txn.commit().map_err(io_err)?;
        Ok(())
    }

    fn load_messages(
        &self,
        convo_id: Uuid,
        from: u64,
        limit: usize,
    ) -> Result<Vec<Message>, StorageError> {
        let txn = self.db.begin_read().map_err(io_err)?;
        let table = txn.open_table(MESSAGES).map_err(io_err)?;

        let start = message_key(convo_id, from);
        let end = message_key(convo_id, u64::MAX);
        let results = table.range(start.as_slice()..=end.as_slice()).map_err(io_err)?;

        let mut messages = Vec::with_capacity(limit.min(64));
        for result in results {
            if messages.len() >= limit {
                break;
            }
            let (_, value) = result.map_err(io_err)?;
            messages.push(decode(value.value())?);
        }
        Ok(messages)
    }

    fn put_media(&self, media: &Media) -> Result<(), StorageError> {
        let txn = self.db.begin_write().map_err(io_err)?;
        {
            let mut table = txn.open_table(MEDIA).map_err(io_err)?;
            let bytes = encode(media)?;
            table.insert(media.media_id.as_bytes().as_slice(), bytes.as_slice()).map_err(io_err)?;
        }
        txn.commit().map_err(io_err)?;
        Ok(())
    }

    fn load_media(&self, media_id: Uuid) -> Result<Option<Media>, StorageError> {
        let txn = self.db.begin_read().map_err(io_err)?;
        let table = txn.open_table(MEDIA).map_err(io_err)?;
        match table.get(media_id.as_bytes().as_slice()).map_err(io_err)? {
            Some(value) => Ok(Some(decode(value.value())?)),
            None => Ok(None),
        }
    }
}
