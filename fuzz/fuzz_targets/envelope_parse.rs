//! Fuzz target for signed envelope parsing.
//!
//! The envelope body is attacker-controlled JSON. Parsing must never panic
//! regardless of nesting, field types, or encoding of the two payload
//! strings.

#![no_main]

use libfuzzer_sys::fuzz_target;
use timevault_core::envelope::{SignedRequest, parse_envelope};

fuzz_target!(|input: (String, String)| {
    let (globalmessage, signature) = input;
    let request = SignedRequest { globalmessage, signature };
    let _ = parse_envelope(&request);
});
