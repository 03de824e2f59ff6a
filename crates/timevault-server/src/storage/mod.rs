//! Storage abstraction for the archive server.
//!
//! Trait-based abstraction over the persistent record store. The trait is
//! synchronous (no async) to keep the operation layer a plain state machine;
//! implementations share internal state via `Arc`, so clones access the same
//! underlying storage.

mod memory;
mod redb;

use timevault_core::model::{Conversation, Grant, Media, Message, User};
use uuid::Uuid;

pub use self::memory::MemoryStorage;
pub use self::redb::RedbStorage;

/// Errors that can occur during storage operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    /// The referenced conversation does not exist.
    #[error("conversation not found: {convo_id}")]
    ConversationNotFound {
        /// The conversation that was looked up.
        convo_id: Uuid,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error (file system, database, lock poisoning).
    #[error("I/O error: {0}")]
    Io(String),
}

/// Outcome of a sequence reservation.
///
/// Reservation is keyed by `(conversation, batch_id)`: retrying a batch that
/// was already reserved returns the original range with `replayed` set, so an
/// interrupted upload can resume without burning sequence numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReservedRange {
    /// First sequence number of the range, 1-based.
    pub first: u64,
    /// Number of sequences reserved.
    pub count: u64,
    /// Whether this batch had already been reserved.
    pub replayed: bool,
}

/// Persistent record store for users, conversations, grants, messages and
/// media.
///
/// Must be `Clone + Send + Sync` so one store can back concurrent request
/// handlers. All mutating compound operations (`reserve_sequences`,
/// `add_participant`) are atomic: concurrent callers never observe a
/// half-applied update.
pub trait Storage: Clone + Send + Sync + 'static {
    /// Store a new user. Fails with `Io` only; duplicate checking is the
    /// caller's job via [`Storage::load_user`].
    fn put_user(&self, user: &User) -> Result<(), StorageError>;

    /// Load a user by name. `None` if not registered.
    fn load_user(&self, username: &str) -> Result<Option<User>, StorageError>;

    /// Store a conversation, overwriting any record with the same id.
    fn put_conversation(&self, convo: &Conversation) -> Result<(), StorageError>;

    /// Load a conversation by id.
    fn load_conversation(&self, convo_id: Uuid) -> Result<Option<Conversation>, StorageError>;

    /// Find a conversation `username` participates in whose title matches
    /// case-insensitively. Titles are only unique within one user's
    /// conversations, so the lookup is scoped by participant.
    fn find_conversation_by_title(
        &self,
        title: &str,
        username: &str,
    ) -> Result<Option<Conversation>, StorageError>;

    /// All conversations `username` participates in. Order is not
    /// guaranteed.
    fn list_conversations_for(&self, username: &str) -> Result<Vec<Conversation>, StorageError>;

    /// Store a grant, keyed by `(conversation, grantee)`. Overwrites.
    fn put_grant(&self, grant: &Grant) -> Result<(), StorageError>;

    /// Load the grant held by `grantee` over `convo_id`.
    fn load_grant(&self, convo_id: Uuid, grantee: &str) -> Result<Option<Grant>, StorageError>;

    /// Atomically add `username` to a conversation and store their grant.
    ///
    /// Returns `false` without modifying anything if the user is already a
    /// participant. When `admin` is set the user also joins the admin list.
    fn add_participant(
        &self,
        convo_id: Uuid,
        username: &str,
        admin: bool,
        grant: &Grant,
    ) -> Result<bool, StorageError>;

    /// Atomically reserve `count` sequence numbers in a conversation.
    ///
    /// The conversation's message count is bumped by `count` and the first
    /// reserved sequence returned. If `batch_id` was already reserved for
    /// this conversation, the original range comes back with `replayed` set
    /// and the count is not bumped again.
    fn reserve_sequences(
        &self,
        convo_id: Uuid,
        batch_id: &str,
        count: u64,
    ) -> Result<ReservedRange, StorageError>;

    /// Store a message at its assigned sequence. Overwrites, which makes
    /// batch replay after a partial failure idempotent.
    fn put_message(&self, message: &Message) -> Result<(), StorageError>;

    /// Load messages with `sequence >= from`, ascending, at most `limit`.
    fn load_messages(
        &self,
        convo_id: Uuid,
        from: u64,
        limit: usize,
    ) -> Result<Vec<Message>, StorageError>;

    /// Store a media object.
    fn put_media(&self, media: &Media) -> Result<(), StorageError>;

    /// Load a media object by id.
    fn load_media(&self, media_id: Uuid) -> Result<Option<Media>, StorageError>;
}
