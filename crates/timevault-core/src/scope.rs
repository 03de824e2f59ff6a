//! Grant scopes: what portion of a conversation's key tree a grant unlocks.
//!
//! A scope is carried on the wire as a string key inside a grant map. The
//! three forms are `all` (the conversation master key), `sender` (the
//! sender-identity key), and a coordinate key such as
//! `message-000001.01.01.01.07` naming a single node of the derivation tree.
//! The vault segment is always six digits, every deeper segment two.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use timevault_crypto::Coordinate;

/// A level of the derivation tree that a coordinate scope can address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeLevel {
    /// Top of the tree, one segment.
    Vault,
    /// Two segments.
    Block,
    /// Three segments.
    Group,
    /// Four segments.
    Chunk,
    /// Full five-segment path to a single message key.
    Message,
}

impl ScopeLevel {
    /// Number of path segments a coordinate at this level carries.
    pub fn depth(self) -> usize {
        match self {
            Self::Vault => 1,
            Self::Block => 2,
            Self::Group => 3,
            Self::Chunk => 4,
            Self::Message => 5,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Vault => "vault",
            Self::Block => "block",
            Self::Group => "group",
            Self::Chunk => "chunk",
            Self::Message => "message",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "vault" => Some(Self::Vault),
            "block" => Some(Self::Block),
            "group" => Some(Self::Group),
            "chunk" => Some(Self::Chunk),
            "message" => Some(Self::Message),
            _ => None,
        }
    }
}

/// A scope key failed to parse.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid scope key {key:?}: {reason}")]
pub struct ScopeParseError {
    /// The offending key, as received.
    pub key: String,
    /// What was wrong with it.
    pub reason: String,
}

impl ScopeParseError {
    fn new(key: &str, reason: impl Into<String>) -> Self {
        Self { key: key.to_owned(), reason: reason.into() }
    }
}

/// What a single grant entry unlocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GrantScope {
    /// The conversation master key. Full derivation capability.
    All,
    /// The sender-identity key only.
    Sender,
    /// One node of the derivation tree.
    Coordinate {
        /// Tree level the path addresses.
        level: ScopeLevel,
        /// Path from the vault down, one value per level.
        path: Vec<u64>,
    },
}

/// Largest vault index the fixed six-digit key format can carry.
pub const MAX_SCOPE_VAULT: u64 = 999_999;

impl GrantScope {
    /// Scope for the exact message at `coordinate`.
    ///
    /// The vault segment renders as exactly six digits, so coordinates
    /// past [`MAX_SCOPE_VAULT`] cannot form a valid key and are rejected.
    pub fn for_message(coordinate: &Coordinate) -> Result<Self, ScopeParseError> {
        if coordinate.vault > MAX_SCOPE_VAULT {
            return Err(ScopeParseError::new(
                &format!("vault-{}", coordinate.vault),
                "vault index exceeds the six-digit key format",
            ));
        }
        Ok(Self::Coordinate {
            level: ScopeLevel::Message,
            path: vec![
                coordinate.vault,
                coordinate.block,
                coordinate.group,
                coordinate.chunk,
                coordinate.message,
            ],
        })
    }

    /// Whether this scope alone is enough to derive any key in the tree.
    pub fn is_full(&self) -> bool {
        matches!(self, Self::All)
    }
}

impl FromStr for GrantScope {
    type Err = ScopeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => return Ok(Self::All),
            "sender" => return Ok(Self::Sender),
            _ => {}
        }
        let (level_str, path_str) = s
            .split_once('-')
            .ok_or_else(|| ScopeParseError::new(s, "expected `level-path`"))?;
        let level = ScopeLevel::parse(level_str)
            .ok_or_else(|| ScopeParseError::new(s, format!("unknown level {level_str:?}")))?;

        let segments: Vec<&str> = path_str.split('.').collect();
        if segments.len() != level.depth() {
            return Err(ScopeParseError::new(
                s,
                format!("expected {} path segments, got {}", level.depth(), segments.len()),
            ));
        }
        let mut path = Vec::with_capacity(segments.len());
        for (i, seg) in segments.iter().enumerate() {
            let want = if i == 0 { 6 } else { 2 };
            if seg.len() != want || !seg.bytes().all(|b| b.is_ascii_digit()) {
                return Err(ScopeParseError::new(
                    s,
                    format!("segment {i} must be {want} digits"),
                ));
            }
            // Width and digit checks above guarantee this parses.
            let value = seg.parse::<u64>().map_err(|_| {
                ScopeParseError::new(s, format!("segment {i} is not a number"))
            })?;
            path.push(value);
        }
        Ok(Self::Coordinate { level, path })
    }
}

impl fmt::Display for GrantScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("all"),
            Self::Sender => f.write_str("sender"),
            Self::Coordinate { level, path } => {
                write!(f, "{}-", level.as_str())?;
                for (i, value) in path.iter().enumerate() {
                    if i == 0 {
                        write!(f, "{value:06}")?;
                    } else {
                        write!(f, ".{value:02}")?;
                    }
                }
                Ok(())
            }
        }
    }
}

/// Whether `key` is a well-formed scope key.
pub fn is_valid_scope_key(key: &str) -> bool {
    key.parse::<GrantScope>().is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_special_scopes() {
        assert_eq!("all".parse::<GrantScope>().unwrap(), GrantScope::All);
        assert_eq!("sender".parse::<GrantScope>().unwrap(), GrantScope::Sender);
    }

    #[test]
    fn parses_coordinate_scopes() {
        let scope = "message-000001.01.01.01.07".parse::<GrantScope>().unwrap();
        assert_eq!(
            scope,
            GrantScope::Coordinate {
                level: ScopeLevel::Message,
                path: vec![1, 1, 1, 1, 7],
            }
        );
        let scope = "vault-000042".parse::<GrantScope>().unwrap();
        assert_eq!(
            scope,
            GrantScope::Coordinate { level: ScopeLevel::Vault, path: vec![42] }
        );
    }

    #[test]
    fn rejects_malformed_keys() {
        for key in [
            "message-1.01.01.01.07", // vault segment not zero-padded
            "unknown-000001",        // no such level
            "vault-000001.01",       // too many segments
            "message-000001.01.01.01", // too few segments
            "block-000001.1",        // short segment
            "vault-00000a",          // non-digit
            "all-000001",            // special scope with a path
            "",
        ] {
            assert!(key.parse::<GrantScope>().is_err(), "accepted {key:?}");
        }
    }

    #[test]
    fn display_roundtrips() {
        for key in ["all", "sender", "message-000001.01.01.01.07", "vault-000000", "chunk-000003.00.07.02"] {
            let scope: GrantScope = key.parse().unwrap();
            assert_eq!(scope.to_string(), key);
        }
    }

    #[test]
    fn message_scope_from_coordinate() {
        let coordinate = Coordinate::from_index(4095);
        let scope = GrantScope::for_message(&coordinate).unwrap();
        assert_eq!(scope.to_string(), "message-000000.07.07.07.07");
    }

    #[test]
    fn vault_past_the_six_digit_bound_is_rejected() {
        // 4096 messages per vault; this index lands in vault 1_000_000.
        let over = Coordinate::from_index(1_000_000 * 4096);
        assert!(GrantScope::for_message(&over).is_err());

        let last = Coordinate::from_index(1_000_000 * 4096 - 1);
        let scope = GrantScope::for_message(&last).unwrap();
        assert!(is_valid_scope_key(&scope.to_string()));
    }
}
