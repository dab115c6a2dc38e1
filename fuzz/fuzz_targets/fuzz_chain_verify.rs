#![no_main]

use libfuzzer_sys::fuzz_target;
use warden_core::audit::{verify_chain, AuditEvent};
use warden_core::keys::KeyRegistry;

fuzz_target!(|data: &[u8]| {
    let Ok(events) = serde_json::from_slice::<Vec<AuditEvent>>(data) else {
        return;
    };
    let registry = KeyRegistry::new();
    let _ = verify_chain(&events, &registry);
});
