use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use warden_core::clock::ManualClock;
use warden_core::idempotency::{IdempotencyRecord, IdempotencyStore, IdempotentRequest};
use warden_core::store::{MemoryStore, SqliteStore};
use warden_core::{WardenError, WardenResult};

fn request<'a>(key: &'a str) -> IdempotentRequest<'a> {
    IdempotentRequest {
        key: Some(key),
        method: "POST",
        path: "/v1/packages",
        principal_id: "alice",
    }
}

fn memory_store(clock: Arc<ManualClock>) -> IdempotencyStore {
    IdempotencyStore::new(Arc::new(MemoryStore::new()), clock, Duration::from_secs(60))
}

#[tokio::test]
async fn replay_returns_identical_result_without_rerunning() {
    let store = memory_store(Arc::new(ManualClock::new(0)));
    let created = Arc::new(AtomicUsize::new(0));

    let run = |created: Arc<AtomicUsize>| async move {
        let n = created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok::<_, WardenError>((201, json!({"packageId": format!("pkg-{n}")})))
    };

    let first = store.execute(request("k-1"), || run(created.clone())).await.unwrap();
    let second = store.execute(request("k-1"), || run(created.clone())).await.unwrap();

    assert!(!first.replayed);
    assert!(second.replayed);
    assert_eq!(first.record.status, second.record.status);
    assert_eq!(
        serde_json::to_vec(&first.record.response).unwrap(),
        serde_json::to_vec(&second.record.response).unwrap()
    );
    assert_eq!(created.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn missing_key_is_a_validation_error() {
    let store = memory_store(Arc::new(ManualClock::new(0)));
    let err = store
        .execute(
            IdempotentRequest {
                key: None,
                ..request("unused")
            },
            || async { Ok((200, json!({}))) },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "VALIDATION_ERROR");
}

#[tokio::test]
async fn key_reuse_on_another_route_is_rejected() {
    let store = memory_store(Arc::new(ManualClock::new(0)));
    store
        .execute(request("k"), || async { Ok((201, json!({"ok": true}))) })
        .await
        .unwrap();
    let err = store
        .execute(
            IdempotentRequest {
                path: "/v1/payouts",
                ..request("k")
            },
            || async { Ok((201, json!({}))) },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "VALIDATION_ERROR");
    let err = store
        .execute(
            IdempotentRequest {
                principal_id: "mallory",
                ..request("k")
            },
            || async { Ok((201, json!({}))) },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "FORBIDDEN");
}

#[tokio::test]
async fn failed_operations_are_not_recorded() {
    let store = memory_store(Arc::new(ManualClock::new(0)));
    let err = store
        .execute(request("k"), || async {
            Err::<(u16, serde_json::Value), _>(WardenError::SignerUnavailable("down".into()))
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), "SIGNER_UNAVAILABLE");
    assert!(store.get("k").await.unwrap().is_none());

    let retried = store
        .execute(request("k"), || async { Ok((201, json!({"id": 1}))) })
        .await
        .unwrap();
    assert!(!retried.replayed);
}

#[tokio::test]
async fn records_expire_after_ttl_and_are_collected() {
    let clock = Arc::new(ManualClock::new(0));
    let store = memory_store(clock.clone());
    store
        .execute(request("k"), || async { Ok((201, json!({"v": 1}))) })
        .await
        .unwrap();
    clock.advance_ms(61_000);
    assert!(store.get("k").await.unwrap().is_none());
    let fresh = store
        .execute(request("k"), || async { Ok((201, json!({"v": 2}))) })
        .await
        .unwrap();
    assert!(!fresh.replayed);

    store
        .execute(request("other"), || async { Ok((200, json!({}))) })
        .await
        .unwrap();
    clock.advance_ms(61_000);
    assert_eq!(store.collect_garbage(121_000, 1).await.unwrap(), 2);
}

#[tokio::test]
async fn concurrent_duplicates_execute_once() {
    let store = Arc::new(memory_store(Arc::new(ManualClock::new(0))));
    let executions = Arc::new(AtomicUsize::new(0));
    let mut tasks = Vec::new();
    for _ in 0..16 {
        let store = store.clone();
        let executions = executions.clone();
        tasks.push(tokio::spawn(async move {
            store
                .execute(request("burst"), || async move {
                    executions.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    Ok::<_, WardenError>((201, json!({"resource": "r-1"})))
                })
                .await
                .unwrap()
        }));
    }
    let mut fresh = 0;
    for t in tasks {
        if !t.await.unwrap().replayed {
            fresh += 1;
        }
    }
    assert_eq!(fresh, 1);
    assert_eq!(executions.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn sqlite_backend_replays_and_upserts() -> WardenResult<()> {
    let dir = tempfile::tempdir().expect("tmp");
    let repo = Arc::new(SqliteStore::open(dir.path().join("warden.db"))?);
    let store = IdempotencyStore::new(repo, Arc::new(ManualClock::new(0)), Duration::from_secs(60));

    let first = store
        .execute(request("sql"), || async { Ok((201, json!({"id": "a"}))) })
        .await?;
    let second = store
        .execute(request("sql"), || async { Ok((201, json!({"id": "b"}))) })
        .await?;
    assert!(second.replayed);
    assert_eq!(first.record.response, second.record.response);

    let overwritten = IdempotencyRecord {
        response: json!({"id": "c"}),
        ..first.record.clone()
    };
    store.save(&overwritten).await?;
    assert_eq!(
        store.get("sql").await?.map(|r| r.response),
        Some(json!({"id": "c"}))
    );
    Ok(())
}
