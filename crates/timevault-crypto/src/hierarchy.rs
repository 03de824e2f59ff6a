//! The 5-level key hierarchy: vault → block → group → chunk → message.
//!
//! A message's flat archive index maps bijectively onto a 5-tuple coordinate
//! under a fan-out of 8 at every level (4096 messages per vault). The
//! coordinate is the addressing scheme for key derivation: each level's key
//! is derived from its parent's exported key material under a label that
//! embeds the full dotted path down to that level, binding every key to its
//! unique position in the tree.
//!
//! ```text
//! master
//!   └─ vault-000000
//!        └─ block-000000.03
//!             └─ group-000000.03.01
//!                  └─ chunk-000000.03.01.07
//!                       └─ message-000000.03.01.07.02
//! ```
//!
//! Sequential messages almost always share the four upper levels, so
//! [`DerivationChain`] caches them and only re-derives a level when its
//! coordinate component (or any parent's) changes.

use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::{
    aead::{KeySize, SymmetricKey},
    derive::{SENDER_LABEL, derive_key},
};

/// Blocks per vault.
pub const BLOCKS_PER_VAULT: u64 = 8;
/// Groups per block.
pub const GROUPS_PER_BLOCK: u64 = 8;
/// Chunks per group.
pub const CHUNKS_PER_GROUP: u64 = 8;
/// Messages per chunk.
pub const MESSAGES_PER_CHUNK: u64 = 8;

/// Messages addressed by one vault (4096).
pub const MESSAGES_PER_VAULT: u64 =
    BLOCKS_PER_VAULT * GROUPS_PER_BLOCK * CHUNKS_PER_GROUP * MESSAGES_PER_CHUNK;
/// Messages addressed by one block (512).
pub const MESSAGES_PER_BLOCK: u64 = GROUPS_PER_BLOCK * CHUNKS_PER_GROUP * MESSAGES_PER_CHUNK;
/// Messages addressed by one group (64).
pub const MESSAGES_PER_GROUP: u64 = CHUNKS_PER_GROUP * MESSAGES_PER_CHUNK;

/// A message's position in the hierarchy.
///
/// All components are non-negative; `block`, `group`, `chunk` and `message`
/// are always `< 8` when produced by [`Coordinate::from_index`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Coordinate {
    /// Vault index (unbounded).
    pub vault: u64,
    /// Block within the vault.
    pub block: u64,
    /// Group within the block.
    pub group: u64,
    /// Chunk within the group.
    pub chunk: u64,
    /// Message within the chunk.
    pub message: u64,
}

impl Coordinate {
    /// Map a flat archive index to its coordinate.
    pub fn from_index(index: u64) -> Self {
        let vault = index / MESSAGES_PER_VAULT;
        let in_vault = index % MESSAGES_PER_VAULT;

        let block = in_vault / MESSAGES_PER_BLOCK;
        let in_block = in_vault % MESSAGES_PER_BLOCK;

        let group = in_block / MESSAGES_PER_GROUP;
        let in_group = in_block % MESSAGES_PER_GROUP;

        let chunk = in_group / MESSAGES_PER_CHUNK;
        let message = in_group % MESSAGES_PER_CHUNK;

        Self { vault, block, group, chunk, message }
    }

    /// Map a coordinate back to its flat archive index.
    ///
    /// Exact inverse of [`Coordinate::from_index`] for all in-range
    /// coordinates.
    pub fn to_index(self) -> u64 {
        self.vault * MESSAGES_PER_VAULT
            + self.block * MESSAGES_PER_BLOCK
            + self.group * MESSAGES_PER_GROUP
            + self.chunk * MESSAGES_PER_CHUNK
            + self.message
    }

    /// Derivation label for the vault level: `vault-{vault:06}`.
    pub fn vault_label(&self) -> String {
        format!("vault-{:06}", self.vault)
    }

    /// Derivation label for the block level.
    pub fn block_label(&self) -> String {
        format!("block-{:06}.{:02}", self.vault, self.block)
    }

    /// Derivation label for the group level.
    pub fn group_label(&self) -> String {
        format!("group-{:06}.{:02}.{:02}", self.vault, self.block, self.group)
    }

    /// Derivation label for the chunk level.
    pub fn chunk_label(&self) -> String {
        format!("chunk-{:06}.{:02}.{:02}.{:02}", self.vault, self.block, self.group, self.chunk)
    }

    /// Derivation label for the message level (full dotted path).
    pub fn message_label(&self) -> String {
        format!(
            "message-{:06}.{:02}.{:02}.{:02}.{:02}",
            self.vault, self.block, self.group, self.chunk, self.message
        )
    }
}

/// Cached upper-level keys from the previous derivation.
struct ChainCache {
    coordinate: Coordinate,
    vault_key: SymmetricKey,
    block_key: SymmetricKey,
    group_key: SymmetricKey,
    chunk_key: SymmetricKey,
}

/// Per-session derivation chain with upper-level caching.
///
/// Walks the five derivation steps for a coordinate, re-keying each level
/// from the previous level's exported key material. Levels are invalidated
/// strictly left to right: a changed `block` also re-derives `group`,
/// `chunk` and `message`.
///
/// The cache is session state: one chain serves exactly one conversation
/// master key and must never be shared across conversations.
pub struct DerivationChain {
    master: Vec<u8>,
    size: KeySize,
    cache: Option<ChainCache>,
}

impl Drop for DerivationChain {
    fn drop(&mut self) {
        self.master.zeroize();
    }
}

impl std::fmt::Debug for DerivationChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DerivationChain")
            .field("size", &self.size)
            .field("cached", &self.cache.as_ref().map(|c| c.coordinate))
            .finish()
    }
}

impl DerivationChain {
    /// Create a chain rooted at the given conversation master key material.
    pub fn new(master: &[u8], size: KeySize) -> Self {
        Self { master: master.to_vec(), size, cache: None }
    }

    /// The conversation's sender key, independent of the message hierarchy.
    ///
    /// Encrypts only the sender identity field, so "sender"-scoped grantees
    /// can resolve who wrote a message without any content access.
    pub fn sender_key(&self) -> SymmetricKey {
        derive_key(&self.master, SENDER_LABEL, self.size)
    }

    /// Derive the message key for a coordinate, reusing cached upper levels.
    pub fn message_key(&mut self, coordinate: Coordinate) -> SymmetricKey {
        let reusable = self.cache.as_ref().map(|c| c.coordinate);

        let same_vault = reusable.is_some_and(|p| p.vault == coordinate.vault);
        let same_block = same_vault && reusable.is_some_and(|p| p.block == coordinate.block);
        let same_group = same_block && reusable.is_some_and(|p| p.group == coordinate.group);
        let same_chunk = same_group && reusable.is_some_and(|p| p.chunk == coordinate.chunk);

        // Levels recompute only when their component (or a parent's) changed.
        let vault_key = if same_vault {
            self.cached().vault_key.clone()
        } else {
            derive_key(&self.master, &coordinate.vault_label(), self.size)
        };
        let block_key = if same_block {
            self.cached().block_key.clone()
        } else {
            derive_key(vault_key.as_bytes(), &coordinate.block_label(), self.size)
        };
        let group_key = if same_group {
            self.cached().group_key.clone()
        } else {
            derive_key(block_key.as_bytes(), &coordinate.group_label(), self.size)
        };
        let chunk_key = if same_chunk {
            self.cached().chunk_key.clone()
        } else {
            derive_key(group_key.as_bytes(), &coordinate.chunk_label(), self.size)
        };

        let message_key = derive_key(chunk_key.as_bytes(), &coordinate.message_label(), self.size);

        self.cache = Some(ChainCache { coordinate, vault_key, block_key, group_key, chunk_key });

        message_key
    }

    fn cached(&self) -> &ChainCache {
        let Some(cache) = self.cache.as_ref() else {
            unreachable!("cached() is only reached when a matching cache entry exists");
        };
        cache
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_zero_is_origin() {
        let c = Coordinate::from_index(0);
        assert_eq!(c, Coordinate { vault: 0, block: 0, group: 0, chunk: 0, message: 0 });
    }

    #[test]
    fn index_walks_message_level_first() {
        let c = Coordinate::from_index(7);
        assert_eq!(c.message, 7);
        assert_eq!(c.chunk, 0);

        let c = Coordinate::from_index(8);
        assert_eq!(c.message, 0);
        assert_eq!(c.chunk, 1);
    }

    #[test]
    fn vault_rolls_over_at_4096() {
        let c = Coordinate::from_index(4095);
        assert_eq!(c, Coordinate { vault: 0, block: 7, group: 7, chunk: 7, message: 7 });

        let c = Coordinate::from_index(4096);
        assert_eq!(c, Coordinate { vault: 1, block: 0, group: 0, chunk: 0, message: 0 });
    }

    #[test]
    fn labels_embed_full_dotted_path() {
        let c = Coordinate { vault: 42, block: 1, group: 2, chunk: 5, message: 7 };

        assert_eq!(c.vault_label(), "vault-000042");
        assert_eq!(c.block_label(), "block-000042.01");
        assert_eq!(c.group_label(), "group-000042.01.02");
        assert_eq!(c.chunk_label(), "chunk-000042.01.02.05");
        assert_eq!(c.message_label(), "message-000042.01.02.05.07");
    }

    #[test]
    fn chain_is_deterministic() {
        let master = b"conversation master key material";
        let coord = Coordinate::from_index(1234);

        let mut a = DerivationChain::new(master, KeySize::Bits256);
        let mut b = DerivationChain::new(master, KeySize::Bits256);

        assert_eq!(a.message_key(coord).as_bytes(), b.message_key(coord).as_bytes());
    }

    #[test]
    fn cached_walk_matches_fresh_derivation() {
        let master = b"conversation master key material";

        // Walk sequentially (cache warm)...
        let mut warm = DerivationChain::new(master, KeySize::Bits256);
        let warm_keys: Vec<_> =
            (0..100).map(|i| warm.message_key(Coordinate::from_index(i))).collect();

        // ...and compare against per-index fresh chains.
        for (i, warm_key) in warm_keys.iter().enumerate() {
            let mut fresh = DerivationChain::new(master, KeySize::Bits256);
            let fresh_key = fresh.message_key(Coordinate::from_index(i as u64));
            assert_eq!(warm_key.as_bytes(), fresh_key.as_bytes(), "index {i}");
        }
    }

    #[test]
    fn adjacent_coordinates_differ_at_every_level() {
        let master = b"conversation master key material";
        let base = Coordinate { vault: 1, block: 2, group: 3, chunk: 4, message: 5 };

        let variants = [
            Coordinate { vault: 2, ..base },
            Coordinate { block: 3, ..base },
            Coordinate { group: 4, ..base },
            Coordinate { chunk: 5, ..base },
            Coordinate { message: 6, ..base },
        ];

        let mut chain = DerivationChain::new(master, KeySize::Bits256);
        let base_key = chain.message_key(base);

        for variant in variants {
            let mut chain = DerivationChain::new(master, KeySize::Bits256);
            assert_ne!(
                chain.message_key(variant).as_bytes(),
                base_key.as_bytes(),
                "coordinate {variant:?} must not collide with {base:?}"
            );
        }
    }

    #[test]
    fn sender_key_is_stable_and_distinct() {
        let master = b"conversation master key material";
        let chain = DerivationChain::new(master, KeySize::Bits256);

        let sender_a = chain.sender_key();
        let sender_b = chain.sender_key();
        assert_eq!(sender_a.as_bytes(), sender_b.as_bytes());

        let mut chain = DerivationChain::new(master, KeySize::Bits256);
        let message = chain.message_key(Coordinate::from_index(0));
        assert_ne!(sender_a.as_bytes(), message.as_bytes());
    }

    #[test]
    fn different_masters_never_share_message_keys() {
        let coord = Coordinate::from_index(17);

        let mut a = DerivationChain::new(b"master a", KeySize::Bits256);
        let mut b = DerivationChain::new(b"master b", KeySize::Bits256);

        assert_ne!(a.message_key(coord).as_bytes(), b.message_key(coord).as_bytes());
    }
}
