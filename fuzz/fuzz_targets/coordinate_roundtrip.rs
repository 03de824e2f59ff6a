//! Fuzz target for the index/coordinate mapping.
//!
//! Every index must map to a coordinate and back to itself, with all
//! sub-vault components inside the fan-out, for the full u64 range.

#![no_main]

use libfuzzer_sys::fuzz_target;
use timevault_crypto::Coordinate;

fuzz_target!(|index: u64| {
    let coordinate = Coordinate::from_index(index);
    assert!(coordinate.block < 8);
    assert!(coordinate.group < 8);
    assert!(coordinate.chunk < 8);
    assert!(coordinate.message < 8);
    assert_eq!(coordinate.to_index(), index);
});
