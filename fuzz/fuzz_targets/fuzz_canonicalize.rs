#![no_main]

use libfuzzer_sys::fuzz_target;
use warden_core::canonical::canonicalize;

fuzz_target!(|data: &[u8]| {
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(data) else {
        return;
    };
    let canonical = canonicalize(&value);
    // Canonical output must parse back and be a fixed point.
    let reparsed: serde_json::Value =
        serde_json::from_slice(&canonical).expect("canonical output is valid JSON");
    assert_eq!(canonicalize(&reparsed), canonical);
});
