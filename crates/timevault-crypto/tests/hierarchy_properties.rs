//! Property-based tests for the coordinate bijection and derivation chain.

use proptest::prelude::{ProptestConfig, prop_assert, prop_assert_eq, proptest};
use timevault_crypto::{
    KeySize,
    hierarchy::{
        BLOCKS_PER_VAULT, CHUNKS_PER_GROUP, Coordinate, DerivationChain, GROUPS_PER_BLOCK,
        MESSAGES_PER_CHUNK,
    },
};

proptest! {
    #![proptest_config(ProptestConfig::with_cases(512))]

    #[test]
    fn index_coordinate_bijection(index in 0u64..10_000_000) {
        let coordinate = Coordinate::from_index(index);
        prop_assert_eq!(coordinate.to_index(), index);
    }

    #[test]
    fn coordinates_stay_in_fanout_range(index in 0u64..10_000_000) {
        let c = Coordinate::from_index(index);
        prop_assert!(c.block < BLOCKS_PER_VAULT);
        prop_assert!(c.group < GROUPS_PER_BLOCK);
        prop_assert!(c.chunk < CHUNKS_PER_GROUP);
        prop_assert!(c.message < MESSAGES_PER_CHUNK);
    }

    #[test]
    fn in_range_coordinates_roundtrip(
        vault in 0u64..2048,
        block in 0u64..8,
        group in 0u64..8,
        chunk in 0u64..8,
        message in 0u64..8,
    ) {
        let coordinate = Coordinate { vault, block, group, chunk, message };
        prop_assert_eq!(Coordinate::from_index(coordinate.to_index()), coordinate);
    }

    #[test]
    fn distinct_indices_derive_distinct_keys(a in 0u64..100_000, b in 0u64..100_000) {
        if a == b {
            return Ok(());
        }
        let master = b"property test master key material";
        let mut chain = DerivationChain::new(master, KeySize::Bits256);
        let key_a = chain.message_key(Coordinate::from_index(a));
        let key_b = chain.message_key(Coordinate::from_index(b));
        prop_assert!(key_a.as_bytes() != key_b.as_bytes());
    }

    #[test]
    fn cache_order_does_not_change_keys(indices in proptest::collection::vec(0u64..50_000, 1..30)) {
        let master = b"property test master key material";
        let mut chain = DerivationChain::new(master, KeySize::Bits256);

        for &index in &indices {
            let coordinate = Coordinate::from_index(index);
            let cached = chain.message_key(coordinate);

            let mut fresh = DerivationChain::new(master, KeySize::Bits256);
            let expected = fresh.message_key(coordinate);

            prop_assert_eq!(cached.as_bytes(), expected.as_bytes());
        }
    }
}
