//! Property tests for the grant scope key language.

use proptest::prelude::*;
use timevault_core::scope::{GrantScope, ScopeLevel, is_valid_scope_key};

fn arb_level() -> impl Strategy<Value = ScopeLevel> {
    prop_oneof![
        Just(ScopeLevel::Vault),
        Just(ScopeLevel::Block),
        Just(ScopeLevel::Group),
        Just(ScopeLevel::Chunk),
        Just(ScopeLevel::Message),
    ]
}

proptest! {
    /// Any formatted coordinate scope parses back to itself.
    #[test]
    fn display_parse_roundtrip(
        level in arb_level(),
        vault in 0u64..1_000_000,
        rest in proptest::collection::vec(0u64..8, 4),
    ) {
        let mut path = vec![vault];
        path.extend(rest.into_iter().take(level.depth() - 1));
        let scope = GrantScope::Coordinate { level, path };
        let key = scope.to_string();
        prop_assert!(is_valid_scope_key(&key));
        prop_assert_eq!(key.parse::<GrantScope>().unwrap(), scope);
    }

    /// Keys with the wrong vault width never parse.
    #[test]
    fn unpadded_vault_segment_is_rejected(vault in 0u64..100_000) {
        let key = format!("vault-{vault}");
        // Only exactly-six-digit renderings are valid.
        prop_assert!(!is_valid_scope_key(&key));
    }
}
