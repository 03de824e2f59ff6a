//! Fuzz target for grant scope key parsing.
//!
//! Scope keys arrive from untrusted request bodies. Parsing must never
//! panic, and any key that parses must re-render to exactly itself.

#![no_main]

use libfuzzer_sys::fuzz_target;
use timevault_core::scope::GrantScope;

fuzz_target!(|data: &str| {
    if let Ok(scope) = data.parse::<GrantScope>() {
        let rendered = scope.to_string();
        assert_eq!(rendered, data, "scope key does not roundtrip");
    }
});
