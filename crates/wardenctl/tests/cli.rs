use std::path::Path;
use std::process::{Command, Output};
use std::sync::Arc;

use serde_json::{json, Value};
use tempfile::TempDir;
use warden_core::audit::policy::OsSampler;
use warden_core::audit::{AppendRequest, AuditEvent, AuditLedger, AuditPolicy};
use warden_core::clock::SystemClock;
use warden_core::keys::KeyMaterial;
use warden_core::signer::{LocalSigner, Signer};
use warden_core::store::MemoryStore;
use warden_core::Principal;

fn wardenctl(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_wardenctl"))
        .args(args)
        .output()
        .expect("wardenctl should launch")
}

fn path_str(path: &Path) -> &str {
    path.to_str().expect("utf8 path")
}

async fn export_chain(dir: &Path) -> (Vec<AuditEvent>, std::path::PathBuf) {
    let signer = LocalSigner::ed25519_from_seed_hex(&"07".repeat(32)).expect("seed");
    let KeyMaterial::Ed25519(public) = signer.key_material() else {
        panic!("ed25519 signer expected");
    };
    let keys_path = dir.join("keys.json");
    std::fs::write(
        &keys_path,
        json!({"keys": {signer.signer_id(): hex::encode(public.as_bytes())}}).to_string(),
    )
    .expect("write keys");

    let ledger = AuditLedger::new(
        Arc::new(MemoryStore::new()),
        Arc::new(signer),
        AuditPolicy::default(),
        Arc::new(OsSampler),
        Arc::new(SystemClock),
    );
    let alice = Principal::new("alice");
    for step in ["uploaded", "scanned", "published"] {
        ledger
            .append(
                AppendRequest::new("package:pkg-1", format!("package.{step}"), "alice", json!({"step": step})),
                &alice,
            )
            .await
            .expect("append");
    }
    (ledger.chain("package:pkg-1").await.expect("chain"), keys_path)
}

#[tokio::test]
async fn verify_chain_accepts_untouched_export() {
    let dir = TempDir::new().expect("tmp");
    let (events, keys) = export_chain(dir.path()).await;
    let events_path = dir.path().join("events.json");
    std::fs::write(&events_path, serde_json::to_vec(&events).expect("json")).expect("write");

    let out = wardenctl(&["verify-chain", "--events", path_str(&events_path), "--keys", path_str(&keys)]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let report: Value = serde_json::from_slice(&out.stdout).expect("report json");
    assert_eq!(report["eventsVerified"], 3);
    assert_eq!(report["chainId"], "package:pkg-1");
}

#[tokio::test]
async fn verify_chain_reports_tamper() {
    let dir = TempDir::new().expect("tmp");
    let (mut events, keys) = export_chain(dir.path()).await;
    events[2].actor_id = "mallory".to_string();
    let events_path = dir.path().join("events.json");
    std::fs::write(&events_path, serde_json::to_vec(&events).expect("json")).expect("write");

    let out = wardenctl(&["verify-chain", "--events", path_str(&events_path), "--keys", path_str(&keys)]);
    assert!(!out.status.success());
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("tamper detected at index 2"), "{stderr}");
}

#[test]
fn canonicalize_prints_sorted_form_and_hash() {
    let dir = TempDir::new().expect("tmp");
    let input = dir.path().join("doc.json");
    std::fs::write(&input, r#"{ "b": [1.0, "x"], "a": {"d": null, "c": true} }"#).expect("write");

    let out = wardenctl(&["canonicalize", "--in", path_str(&input)]);
    assert!(out.status.success());
    let stdout = String::from_utf8(out.stdout).expect("utf8");
    let mut lines = stdout.lines();
    let canonical = lines.next().expect("canonical line");
    assert_eq!(canonical, r#"{"a":{"c":true,"d":null},"b":[1,"x"]}"#);
    assert_eq!(
        lines.next().expect("hash line"),
        format!("sha256:{}", warden_core::canonical::sha256_hex(canonical.as_bytes()))
    );
}

#[test]
fn vectors_pass_on_shared_file_and_fail_on_mismatch() {
    let shared = concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/../warden-core/tests/vectors/canonical_vectors.json"
    );
    let out = wardenctl(&["vectors", "--file", shared]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let summary: Value = serde_json::from_slice(&out.stdout).expect("summary");
    assert_eq!(summary["version"], "warden-canon/1");
    assert_eq!(summary["failed"], json!([]));

    let dir = TempDir::new().expect("tmp");
    let bad = dir.path().join("bad.json");
    std::fs::write(
        &bad,
        json!([{"name": "wrong_order", "value": {"b": 1, "a": 2}, "canonical": "{\"b\":1,\"a\":2}"}]).to_string(),
    )
    .expect("write");
    let out = wardenctl(&["vectors", "--file", path_str(&bad)]);
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("wrong_order"));
}

#[test]
fn keygen_writes_loadable_seed() {
    let dir = TempDir::new().expect("tmp");
    let key = dir.path().join("signing.key");
    let out = wardenctl(&["keygen", "--out", path_str(&key)]);
    assert!(out.status.success());
    let info: Value = serde_json::from_slice(&out.stdout).expect("json");

    let seed = std::fs::read_to_string(&key).expect("seed");
    let signer = LocalSigner::ed25519_from_seed_hex(seed.trim()).expect("loadable");
    assert_eq!(info["signerId"], signer.signer_id());

    let again = wardenctl(&["keygen", "--out", path_str(&key)]);
    assert!(!again.status.success());
    assert_eq!(std::fs::read_to_string(&key).expect("seed"), seed);
}
