//! Building and opening grants.
//!
//! A grant wraps derived keys to one user's RSA key. The creator issues
//! themselves `all` plus `sender`; members get either the same pair or the
//! sender key alone, depending on how much of the archive they should be
//! able to open.

use std::collections::BTreeMap;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use timevault_core::model::GrantEntry;
use timevault_crypto::{DerivationChain, KeySize, PrivateKey, PublicKey, SymmetricKey};

use crate::error::ClientError;

/// How much of a conversation a member may open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberAccess {
    /// Master key: every message, forever.
    Full,
    /// Sender identities only.
    SenderOnly,
}

/// Wrap one symmetric key to `recipient`.
pub fn wrap_entry(key: &SymmetricKey, recipient: &PublicKey) -> Result<GrantEntry, ClientError> {
    let wrapped = recipient.wrap_key(key.as_bytes())?;
    Ok(GrantEntry { encrypted_key: BASE64.encode(wrapped), granted_at: Utc::now() })
}

/// The `all` + `sender` map a conversation creator stores for themselves.
pub fn creator_entries(
    master: &SymmetricKey,
    own_key: &PublicKey,
) -> Result<BTreeMap<String, GrantEntry>, ClientError> {
    let sender = DerivationChain::new(master.as_bytes(), master.size()).sender_key();
    let mut entries = BTreeMap::new();
    entries.insert("all".to_owned(), wrap_entry(master, own_key)?);
    entries.insert("sender".to_owned(), wrap_entry(&sender, own_key)?);
    Ok(entries)
}

/// The grant map an admin wraps for a new member.
pub fn member_entries(
    master: &SymmetricKey,
    access: MemberAccess,
    recipient: &PublicKey,
) -> Result<BTreeMap<String, GrantEntry>, ClientError> {
    let sender = DerivationChain::new(master.as_bytes(), master.size()).sender_key();
    let mut entries = BTreeMap::new();
    if access == MemberAccess::Full {
        entries.insert("all".to_owned(), wrap_entry(master, recipient)?);
    }
    entries.insert("sender".to_owned(), wrap_entry(&sender, recipient)?);
    Ok(entries)
}

/// Rewrap a grant this user already holds for a new member.
///
/// Unwraps the caller's own `all` entry with their private key and wraps
/// the recovered master (and its derived sender key) to `recipient`. Lets
/// an admin extend access from their stored grant alone, without the
/// master key in memory.
pub fn regrant_entries(
    own: &BTreeMap<String, GrantEntry>,
    key_size: KeySize,
    own_key: &PrivateKey,
    recipient: &PublicKey,
    access: MemberAccess,
) -> Result<BTreeMap<String, GrantEntry>, ClientError> {
    let unlocked = unwrap_entries(own, key_size, own_key)?;
    let master = unlocked
        .master
        .ok_or_else(|| ClientError::MissingGrant { scope: "all".to_owned() })?;
    member_entries(&master, access, recipient)
}

/// Keys recovered from a grant map.
#[derive(Debug, Default)]
pub struct UnlockedAccess {
    /// The conversation master key, when `all` was granted.
    pub master: Option<SymmetricKey>,
    /// The sender-identity key, when granted.
    pub sender: Option<SymmetricKey>,
}

/// Unwrap whatever entries the server released. Unknown scope keys are
/// ignored; the read path only ever consumes `all` and `sender`.
pub fn unwrap_entries(
    entries: &BTreeMap<String, GrantEntry>,
    key_size: KeySize,
    private_key: &PrivateKey,
) -> Result<UnlockedAccess, ClientError> {
    let mut access = UnlockedAccess::default();
    for (scope, entry) in entries {
        let wrapped = BASE64.decode(&entry.encrypted_key).map_err(|_| {
            ClientError::BadResponse { reason: format!("grant entry {scope} is not base64") }
        })?;
        let raw = private_key.unwrap_key(&wrapped)?;
        if raw.len() != key_size.byte_len() {
            return Err(ClientError::BadResponse {
                reason: format!("grant entry {scope} has the wrong key length"),
            });
        }
        let key = SymmetricKey::from_bytes(raw)?;
        match scope.as_str() {
            "all" => access.master = Some(key),
            "sender" => access.sender = Some(key),
            _ => {}
        }
    }
    Ok(access)
}
