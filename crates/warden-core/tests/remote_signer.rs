use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use ed25519_dalek::{Signer as _, SigningKey};
use serde_json::{json, Value};
use warden_core::keys::KeyMaterial;
use warden_core::signer::{GuardedSigner, LocalSigner, RemoteSigner, RemoteSignerConfig, Signer};

#[derive(Clone)]
struct Kms {
    key: Arc<SigningKey>,
    calls: Arc<AtomicUsize>,
    /// Number of leading calls answered with this status.
    fail_first: usize,
    fail_status: StatusCode,
}

async fn sign(State(kms): State<Kms>, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    let n = kms.calls.fetch_add(1, Ordering::SeqCst);
    if n < kms.fail_first {
        return (kms.fail_status, Json(json!({"error": "nope"})));
    }
    let payload = B64
        .decode(body["payload_b64"].as_str().unwrap_or_default())
        .unwrap_or_default();
    let sig = kms.key.sign(&payload);
    (
        StatusCode::OK,
        Json(json!({"signature_b64": B64.encode(sig.to_bytes()), "signer_id": "kms-key-v2"})),
    )
}

async fn public_key(State(kms): State<Kms>) -> Json<Value> {
    Json(json!({"publicKey": B64.encode(kms.key.verifying_key().as_bytes())}))
}

async fn spawn_kms(fail_first: usize, fail_status: StatusCode) -> (String, Kms) {
    let kms = Kms {
        key: Arc::new(SigningKey::from_bytes(&[5_u8; 32])),
        calls: Arc::new(AtomicUsize::new(0)),
        fail_first,
        fail_status,
    };
    let app = Router::new()
        .route("/sign", post(sign))
        .route("/publicKey", post(public_key))
        .route("/health", get(|| async { "ok" }))
        .with_state(kms.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}"), kms)
}

fn config(endpoint: String, attempts: u32) -> RemoteSignerConfig {
    RemoteSignerConfig {
        endpoint,
        key_id: Some("kms-key".to_string()),
        timeout: Duration::from_millis(500),
        attempts,
        backoff: Duration::from_millis(10),
        ..RemoteSignerConfig::default()
    }
}

#[tokio::test]
async fn signs_and_adopts_reported_signer_id() {
    let (endpoint, kms) = spawn_kms(0, StatusCode::OK).await;
    let signer = RemoteSigner::new(config(endpoint, 3)).expect("signer");
    assert_eq!(signer.signer_id(), "kms-key");

    let env = signer.sign(b"hash-bytes").await.expect("sign");
    assert_eq!(env.signer_id, "kms-key-v2");
    assert_eq!(signer.signer_id(), "kms-key-v2");
    assert!(!env.fallback);
    KeyMaterial::Ed25519(kms.key.verifying_key())
        .verify(b"hash-bytes", &env.signature)
        .expect("verifies");

    signer.health().await.expect("healthy");
    let published = signer.published_keys().await;
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].0, "kms-key-v2");
}

#[tokio::test]
async fn server_errors_are_retried_with_linear_backoff() {
    let (endpoint, kms) = spawn_kms(2, StatusCode::SERVICE_UNAVAILABLE).await;
    let signer = RemoteSigner::new(config(endpoint, 3)).expect("signer");
    let started = Instant::now();
    signer.sign(b"x").await.expect("third attempt succeeds");
    assert_eq!(kms.calls.load(Ordering::SeqCst), 3);
    assert!(started.elapsed() >= Duration::from_millis(30));
}

#[tokio::test]
async fn exhausted_retries_are_signer_unavailable() {
    let (endpoint, kms) = spawn_kms(usize::MAX, StatusCode::BAD_GATEWAY).await;
    let signer = RemoteSigner::new(config(endpoint, 2)).expect("signer");
    let err = signer.sign(b"x").await.unwrap_err();
    assert_eq!(err.code(), "SIGNER_UNAVAILABLE");
    assert_eq!(kms.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn client_errors_are_rejections_without_retry() {
    let (endpoint, kms) = spawn_kms(usize::MAX, StatusCode::FORBIDDEN).await;
    let signer = RemoteSigner::new(config(endpoint, 5)).expect("signer");
    let err = signer.sign(b"x").await.unwrap_err();
    assert_eq!(err.code(), "SIGNER_REJECTED");
    assert_eq!(kms.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unreachable_endpoint_fails_closed_or_falls_back() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let endpoint = format!("http://{}", listener.local_addr().expect("addr"));
    drop(listener);

    let remote: Arc<dyn Signer> = Arc::new(RemoteSigner::new(config(endpoint, 2)).expect("signer"));
    assert!(remote.health().await.is_err());

    let closed = GuardedSigner::fail_closed(remote.clone());
    assert_eq!(closed.sign(b"x").await.unwrap_err().code(), "SIGNER_UNAVAILABLE");

    let fallback = Arc::new(LocalSigner::generate().with_signer_id("dev-local"));
    let open = GuardedSigner::permissive(remote, Some(fallback));
    let env = open.sign(b"x").await.expect("fallback signs");
    assert!(env.fallback);
    assert_eq!(env.signer_id, "dev-local");
}

#[tokio::test]
async fn dropping_the_future_cancels_the_call() {
    let (endpoint, kms) = spawn_kms(usize::MAX, StatusCode::INTERNAL_SERVER_ERROR).await;
    let mut cfg = config(endpoint, 50);
    cfg.backoff = Duration::from_millis(200);
    let signer = RemoteSigner::new(cfg).expect("signer");
    let res = tokio::time::timeout(Duration::from_millis(100), signer.sign(b"x")).await;
    assert!(res.is_err());
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(kms.calls.load(Ordering::SeqCst), 1);
}
