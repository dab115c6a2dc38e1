//! Repository seams for everything the core persists.
//!
//! Both [`MemoryStore`] and [`SqliteStore`] implement all three traits, so
//! business logic never knows which engine sits underneath.

mod memory;
mod sqlite;

use async_trait::async_trait;

use crate::audit::{AuditEvent, ChainHead};
use crate::error::WardenResult;
use crate::idempotency::IdempotencyRecord;
use crate::multisig::ApprovalRequest;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[async_trait]
pub trait AuditRepository: Send + Sync {
    async fn chain_head(&self, chain_id: &str) -> WardenResult<Option<ChainHead>>;

    /// Fails with `Conflict` on a duplicate `(chain_id, hash)` or `(chain_id, sequence)`.
    async fn insert_event(&self, event: &AuditEvent) -> WardenResult<()>;

    async fn get_event(&self, id: &str) -> WardenResult<Option<AuditEvent>>;

    async fn chain_events(&self, chain_id: &str) -> WardenResult<Vec<AuditEvent>>;

    /// Deletes up to `limit` events whose retention has passed, whose type is not
    /// in `protected_types`, and which have no surviving predecessor in their chain.
    async fn delete_expired_events(
        &self,
        now_ms: u64,
        protected_types: &[String],
        limit: usize,
    ) -> WardenResult<usize>;

    async fn delete_event(&self, id: &str) -> WardenResult<bool>;
}

#[async_trait]
pub trait IdempotencyRepository: Send + Sync {
    async fn get_record(&self, key: &str) -> WardenResult<Option<IdempotencyRecord>>;

    /// Upsert by key.
    async fn save_record(&self, record: &IdempotencyRecord) -> WardenResult<()>;

    /// Stores `record` unless an unexpired record holds the key; returns that
    /// record instead when one does.
    async fn insert_record_if_absent(
        &self,
        record: &IdempotencyRecord,
        now_ms: u64,
    ) -> WardenResult<Option<IdempotencyRecord>>;

    async fn delete_expired_records(&self, now_ms: u64, limit: usize) -> WardenResult<usize>;
}

#[async_trait]
pub trait ApprovalRepository: Send + Sync {
    async fn get_request(&self, id: &str) -> WardenResult<Option<ApprovalRequest>>;

    /// Fails with `Conflict` if the id exists.
    async fn insert_request(&self, request: &ApprovalRequest) -> WardenResult<()>;

    async fn save_request(&self, request: &ApprovalRequest) -> WardenResult<()>;
}
