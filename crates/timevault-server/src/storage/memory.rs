//! In-memory storage for tests and ephemeral deployments.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use timevault_core::model::{Conversation, Grant, Media, Message, User};
use uuid::Uuid;

use super::{ReservedRange, Storage, StorageError};

/// In-memory storage implementation.
///
/// `HashMap`s behind one `Arc<Mutex<_>>`, so clones share state and every
/// operation is trivially atomic. A poisoned mutex surfaces as
/// [`StorageError::Io`] rather than a panic.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    users: HashMap<String, User>,
    convos: HashMap<Uuid, Conversation>,
    /// Keyed by (conversation, grantee).
    grants: HashMap<(Uuid, String), Grant>,
    /// Messages per conversation, kept sorted by sequence.
    messages: HashMap<Uuid, Vec<Message>>,
    media: HashMap<Uuid, Media>,
    /// Reserved batch ranges, keyed by (conversation, batch id).
    batches: HashMap<(Uuid, String), (u64, u64)>,
}

impl MemoryStorage {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StorageError> {
        self.inner.lock().map_err(|_| StorageError::Io("storage mutex poisoned".to_owned()))
    }
}

impl Storage for MemoryStorage {
    fn put_user(&self, user: &User) -> Result<(), StorageError> {
        self.lock()?.users.insert(user.username.clone(), user.clone());
        Ok(())
    }

    fn load_user(&self, username: &str) -> Result<Option<User>, StorageError> {
        Ok(self.lock()?.users.get(username).cloned())
    }

    fn put_conversation(&self, convo: &Conversation) -> Result<(), StorageError> {
        self.lock()?.convos.insert(convo.id, convo.clone());
        Ok(())
    }

    fn load_conversation(&self, convo_id: Uuid) -> Result<Option<Conversation>, StorageError> {
        Ok(self.lock()?.convos.get(&convo_id).cloned())
    }

    fn find_conversation_by_title(
        &self,
        title: &str,
        username: &str,
    ) -> Result<Option<Conversation>, StorageError> {
        let inner = self.lock()?;
        Ok(inner
            .convos
            .values()
            .find(|c| c.title.eq_ignore_ascii_case(title) && c.is_participant(username))
            .cloned())
    }

    fn list_conversations_for(&self, username: &str) -> Result<Vec<Conversation>, StorageError> {
        let inner = self.lock()?;
        Ok(inner.convos.values().filter(|c| c.is_participant(username)).cloned().collect())
    }

    fn put_grant(&self, grant: &Grant) -> Result<(), StorageError> {
        self.lock()?.grants.insert((grant.convo_id, grant.grantee.clone()), grant.clone());
        Ok(())
    }

    fn load_grant(&self, convo_id: Uuid, grantee: &str) -> Result<Option<Grant>, StorageError> {
        Ok(self.lock()?.grants.get(&(convo_id, grantee.to_owned())).cloned())
    }

    fn add_participant(
        &self,
        convo_id: Uuid,
        username: &str,
        admin: bool,
        grant: &Grant,
    ) -> Result<bool, StorageError> {
        let mut inner = self.lock()?;
        let convo = inner
            .convos
            .get_mut(&convo_id)
            .ok_or(StorageError::ConversationNotFound { convo_id })?;
        if convo.is_participant(username) {
            return Ok(false);
        }
        convo.participants.push(username.to_owned());
        if admin {
            convo.admins.push(username.to_owned());
        }
        inner.grants.insert((convo_id, username.to_owned()), grant.clone());
        Ok(true)
    }

    fn reserve_sequences(
        &self,
        convo_id: Uuid,
        batch_id: &str,
        count: u64,
    ) -> Result<ReservedRange, StorageError> {
        let mut inner = self.lock()?;
        let batch_key = (convo_id, batch_id.to_owned());
        if let Some(&(first, count)) = inner.batches.get(&batch_key) {
            return Ok(ReservedRange { first, count, replayed: true });
        }
        let convo = inner
            .convos
            .get_mut(&convo_id)
            .ok_or(StorageError::ConversationNotFound { convo_id })?;
        let first = convo.message_count + 1;
        convo.message_count += count;
        inner.batches.insert(batch_key, (first, count));
        Ok(ReservedRange { first, count, replayed: false })
    }

    fn put_message(&self, message: &Message) -> Result<(), StorageError> {
        let mut inner = self.lock()?;
        let messages = inner.messages.entry(message.convo_id).or_default();
        match messages.binary_search_by_key(&message.sequence, |m| m.sequence) {
            Ok(pos) => messages[pos] = message.clone(),
            Err(pos) => messages.insert(pos, message.clone()),
        }
        Ok(())
    }

    fn load_messages(
        &self,
        convo_id: Uuid,
        from: u64,
        limit: usize,
    ) -> Result<Vec<Message>, StorageError> {
        let inner = self.lock()?;
        let Some(messages) = inner.messages.get(&convo_id) else {
            return Ok(Vec::new());
        };
        let start = messages.partition_point(|m| m.sequence < from);
        Ok(messages[start..].iter().take(limit).cloned().collect())
    }

    fn put_media(&self, media: &Media) -> Result<(), StorageError> {
        self.lock()?.media.insert(media.media_id, media.clone());
        Ok(())
    }

    fn load_media(&self, media_id: Uuid) -> Result<Option<Media>, StorageError> {
        Ok(self.lock()?.media.get(&media_id).cloned())
    }
}
