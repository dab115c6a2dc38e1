//! Replay-safe execution of side-effecting requests keyed by a client token.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::Clock;
use crate::error::{WardenError, WardenResult};
use crate::locks::KeyedLocks;
use crate::store::IdempotencyRepository;

pub const MAX_KEY_LEN: usize = 255;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdempotencyRecord {
    pub key: String,
    pub method: String,
    pub path: String,
    pub status: u16,
    pub response: Value,
    pub principal_id: String,
    pub created_at: u64,
    pub expires_at: u64,
}

impl IdempotencyRecord {
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at <= now_ms
    }
}

#[derive(Debug, Clone, Copy)]
pub struct IdempotentRequest<'a> {
    pub key: Option<&'a str>,
    pub method: &'a str,
    pub path: &'a str,
    pub principal_id: &'a str,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IdempotentOutcome {
    pub record: IdempotencyRecord,
    /// The stored result was returned and the operation did not run.
    pub replayed: bool,
}

pub fn validate_key(key: Option<&str>) -> WardenResult<&str> {
    let key = key.ok_or_else(|| WardenError::validation("idempotency key is required"))?;
    if key.is_empty() || key.len() > MAX_KEY_LEN {
        return Err(WardenError::validation(format!(
            "idempotency key must be 1..={MAX_KEY_LEN} characters"
        )));
    }
    if !key.bytes().all(|b| (0x20..=0x7e).contains(&b)) {
        return Err(WardenError::validation(
            "idempotency key must be printable ascii",
        ));
    }
    Ok(key)
}

pub struct IdempotencyStore {
    repo: Arc<dyn IdempotencyRepository>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    locks: KeyedLocks,
}

impl IdempotencyStore {
    pub fn new(repo: Arc<dyn IdempotencyRepository>, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            repo,
            clock,
            ttl,
            locks: KeyedLocks::new(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Unexpired record for `key`, if any.
    pub async fn get(&self, key: &str) -> WardenResult<Option<IdempotencyRecord>> {
        let now = self.clock.now_ms();
        Ok(self
            .repo
            .get_record(key)
            .await?
            .filter(|r| !r.is_expired(now)))
    }

    /// Upsert by key; the last writer's fields win.
    pub async fn save(&self, record: &IdempotencyRecord) -> WardenResult<()> {
        self.repo.save_record(record).await
    }

    /// Runs `op` at most once per key within the TTL.
    ///
    /// A stored result is returned verbatim. Failed operations are not
    /// recorded, so the client may retry them with the same key.
    pub async fn execute<F, Fut>(
        &self,
        request: IdempotentRequest<'_>,
        op: F,
    ) -> WardenResult<IdempotentOutcome>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = WardenResult<(u16, Value)>> + Send,
    {
        let key = validate_key(request.key)?;
        let _key_guard = self.locks.lock(key).await;

        if let Some(existing) = self.get(key).await? {
            check_compatible(&existing, &request)?;
            tracing::info!(key = %key, path = %existing.path, "idempotent replay");
            return Ok(IdempotentOutcome {
                record: existing,
                replayed: true,
            });
        }

        let (status, response) = op().await?;
        let now = self.clock.now_ms();
        let record = IdempotencyRecord {
            key: key.to_string(),
            method: request.method.to_string(),
            path: request.path.to_string(),
            status,
            response,
            principal_id: request.principal_id.to_string(),
            created_at: now,
            expires_at: now.saturating_add(self.ttl.as_millis() as u64),
        };

        match self.repo.insert_record_if_absent(&record, now).await? {
            None => Ok(IdempotentOutcome {
                record,
                replayed: false,
            }),
            Some(winner) => {
                let conflict = WardenError::IdempotencyConflict(key.to_string());
                tracing::info!(key = %key, detail = %conflict, "concurrent execution lost; returning stored result");
                check_compatible(&winner, &request)?;
                Ok(IdempotentOutcome {
                    record: winner,
                    replayed: true,
                })
            }
        }
    }

    pub async fn collect_garbage(&self, now_ms: u64, batch_size: usize) -> WardenResult<usize> {
        let batch_size = batch_size.max(1);
        let mut total = 0;
        loop {
            let deleted = self.repo.delete_expired_records(now_ms, batch_size).await?;
            total += deleted;
            if deleted < batch_size {
                break;
            }
        }
        if total > 0 {
            tracing::info!(deleted = total, "idempotency ttl gc removed records");
        }
        Ok(total)
    }
}

fn check_compatible(record: &IdempotencyRecord, request: &IdempotentRequest<'_>) -> WardenResult<()> {
    if !record.method.eq_ignore_ascii_case(request.method) || record.path != request.path {
        return Err(WardenError::validation(format!(
            "idempotency key was used for {} {}",
            record.method, record.path
        )));
    }
    if record.principal_id != request.principal_id {
        return Err(WardenError::Forbidden(
            "idempotency key belongs to another principal".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_validation() {
        assert!(validate_key(None).is_err());
        assert!(validate_key(Some("")).is_err());
        assert!(validate_key(Some(&"k".repeat(256))).is_err());
        assert!(validate_key(Some("tab\tkey")).is_err());
        assert_eq!(validate_key(Some("order-42 retry")).unwrap(), "order-42 retry");
    }
}
