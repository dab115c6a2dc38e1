use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{ApprovalRepository, AuditRepository, IdempotencyRepository};
use crate::audit::{AuditEvent, ChainHead};
use crate::error::{WardenError, WardenResult};
use crate::idempotency::IdempotencyRecord;
use crate::multisig::ApprovalRequest;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS audit_events (
    id TEXT PRIMARY KEY,
    chain_id TEXT NOT NULL,
    sequence INTEGER NOT NULL,
    event_type TEXT NOT NULL,
    actor_id TEXT NOT NULL,
    payload TEXT NOT NULL,
    hash TEXT NOT NULL,
    prev_hash TEXT,
    signature TEXT NOT NULL,
    signer_id TEXT NOT NULL,
    signer_fallback INTEGER NOT NULL DEFAULT 0,
    retention_expires_at_ms INTEGER,
    created_at_ms INTEGER NOT NULL,
    UNIQUE (chain_id, sequence),
    UNIQUE (chain_id, hash)
);
CREATE INDEX IF NOT EXISTS idx_audit_events_chain_created
    ON audit_events (chain_id, created_at_ms);
CREATE INDEX IF NOT EXISTS idx_audit_events_retention
    ON audit_events (retention_expires_at_ms);
CREATE TABLE IF NOT EXISTS audit_chain_heads (
    chain_id TEXT PRIMARY KEY,
    sequence INTEGER NOT NULL,
    hash TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS idempotency_records (
    key TEXT PRIMARY KEY,
    method TEXT NOT NULL,
    path TEXT NOT NULL,
    status INTEGER NOT NULL,
    response TEXT NOT NULL,
    principal_id TEXT NOT NULL,
    created_at_ms INTEGER NOT NULL,
    expires_at_ms INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_idempotency_expires
    ON idempotency_records (expires_at_ms);
CREATE TABLE IF NOT EXISTS approval_requests (
    id TEXT PRIMARY KEY,
    status TEXT NOT NULL,
    body TEXT NOT NULL,
    updated_at_ms INTEGER NOT NULL
);
"#;

const EVENT_COLUMNS: &str = "id, chain_id, sequence, event_type, actor_id, payload, hash, prev_hash, \
     signature, signer_id, signer_fallback, retention_expires_at_ms, created_at_ms";

/// SQLite-backed repositories. One connection, serialized by a mutex; every
/// multi-statement write runs in a transaction.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> WardenResult<Self> {
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> WardenResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> WardenResult<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn to_sql_int(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

fn from_sql_int(v: i64) -> u64 {
    u64::try_from(v).unwrap_or(0)
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<(AuditEvent, String)> {
    let payload: String = row.get(5)?;
    let event = AuditEvent {
        id: row.get(0)?,
        chain_id: row.get(1)?,
        sequence: from_sql_int(row.get(2)?),
        event_type: row.get(3)?,
        actor_id: row.get(4)?,
        payload: serde_json::Value::Null,
        hash: row.get(6)?,
        prev_hash: row.get(7)?,
        signature: row.get(8)?,
        signer_id: row.get(9)?,
        signer_fallback: row.get::<_, i64>(10)? != 0,
        sampled: false,
        retention_expires_at: row.get::<_, Option<i64>>(11)?.map(from_sql_int),
        created_at: from_sql_int(row.get(12)?),
    };
    Ok((event, payload))
}

fn decode_event((mut event, payload): (AuditEvent, String)) -> WardenResult<AuditEvent> {
    event.payload = serde_json::from_str(&payload)
        .map_err(|e| WardenError::Storage(format!("corrupt payload for event {}: {e}", event.id)))?;
    Ok(event)
}

#[async_trait]
impl AuditRepository for SqliteStore {
    async fn chain_head(&self, chain_id: &str) -> WardenResult<Option<ChainHead>> {
        let conn = self.conn.lock();
        let head = conn
            .query_row(
                "SELECT sequence, hash FROM audit_chain_heads WHERE chain_id = ?1",
                params![chain_id],
                |row| {
                    Ok(ChainHead {
                        sequence: from_sql_int(row.get(0)?),
                        hash: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(head)
    }

    async fn insert_event(&self, event: &AuditEvent) -> WardenResult<()> {
        let payload = serde_json::to_string(&event.payload)?;
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let head: Option<i64> = tx
            .query_row(
                "SELECT sequence FROM audit_chain_heads WHERE chain_id = ?1",
                params![event.chain_id],
                |row| row.get(0),
            )
            .optional()?;
        if head.is_some_and(|seq| from_sql_int(seq) >= event.sequence) {
            return Err(WardenError::Conflict(format!(
                "sequence {} already used in chain {}",
                event.sequence, event.chain_id
            )));
        }
        tx.execute(
            &format!("INSERT INTO audit_events ({EVENT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"),
            params![
                event.id,
                event.chain_id,
                to_sql_int(event.sequence),
                event.event_type,
                event.actor_id,
                payload,
                event.hash,
                event.prev_hash,
                event.signature,
                event.signer_id,
                i64::from(event.signer_fallback),
                event.retention_expires_at.map(to_sql_int),
                to_sql_int(event.created_at),
            ],
        )?;
        tx.execute(
            "INSERT INTO audit_chain_heads (chain_id, sequence, hash) VALUES (?1, ?2, ?3)
             ON CONFLICT(chain_id) DO UPDATE SET sequence = excluded.sequence, hash = excluded.hash",
            params![event.chain_id, to_sql_int(event.sequence), event.hash],
        )?;
        tx.commit()?;
        Ok(())
    }

    async fn get_event(&self, id: &str) -> WardenResult<Option<AuditEvent>> {
        let conn = self.conn.lock();
        let raw = conn
            .query_row(
                &format!("SELECT {EVENT_COLUMNS} FROM audit_events WHERE id = ?1"),
                params![id],
                event_from_row,
            )
            .optional()?;
        raw.map(decode_event).transpose()
    }

    async fn chain_events(&self, chain_id: &str) -> WardenResult<Vec<AuditEvent>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM audit_events WHERE chain_id = ?1 ORDER BY sequence ASC"
        ))?;
        let rows = stmt.query_map(params![chain_id], event_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(decode_event(row?)?);
        }
        Ok(out)
    }

    async fn delete_expired_events(
        &self,
        now_ms: u64,
        protected_types: &[String],
        limit: usize,
    ) -> WardenResult<usize> {
        let protected = serde_json::to_string(protected_types)?;
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM audit_events WHERE id IN (
                SELECT e.id FROM audit_events e
                WHERE e.retention_expires_at_ms IS NOT NULL
                  AND e.retention_expires_at_ms <= ?1
                  AND e.event_type NOT IN (SELECT value FROM json_each(?2))
                  AND NOT EXISTS (
                      SELECT 1 FROM audit_events k
                      WHERE k.chain_id = e.chain_id
                        AND k.sequence < e.sequence
                        AND (k.retention_expires_at_ms IS NULL
                             OR k.retention_expires_at_ms > ?1
                             OR k.event_type IN (SELECT value FROM json_each(?2))))
                ORDER BY e.chain_id, e.sequence
                LIMIT ?3)",
            params![to_sql_int(now_ms), protected, to_sql_int(limit as u64)],
        )?;
        Ok(deleted)
    }

    async fn delete_event(&self, id: &str) -> WardenResult<bool> {
        let conn = self.conn.lock();
        let deleted = conn.execute("DELETE FROM audit_events WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<(IdempotencyRecord, String)> {
    let response: String = row.get(4)?;
    let record = IdempotencyRecord {
        key: row.get(0)?,
        method: row.get(1)?,
        path: row.get(2)?,
        status: u16::try_from(row.get::<_, i64>(3)?).unwrap_or(0),
        response: serde_json::Value::Null,
        principal_id: row.get(5)?,
        created_at: from_sql_int(row.get(6)?),
        expires_at: from_sql_int(row.get(7)?),
    };
    Ok((record, response))
}

fn decode_record((mut record, response): (IdempotencyRecord, String)) -> WardenResult<IdempotencyRecord> {
    record.response = serde_json::from_str(&response).map_err(|e| {
        WardenError::Storage(format!("corrupt response for key {}: {e}", record.key))
    })?;
    Ok(record)
}

const RECORD_COLUMNS: &str =
    "key, method, path, status, response, principal_id, created_at_ms, expires_at_ms";

const UPSERT_RECORD: &str = "INSERT INTO idempotency_records
        (key, method, path, status, response, principal_id, created_at_ms, expires_at_ms)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
     ON CONFLICT(key) DO UPDATE SET
        method = excluded.method,
        path = excluded.path,
        status = excluded.status,
        response = excluded.response,
        principal_id = excluded.principal_id,
        created_at_ms = excluded.created_at_ms,
        expires_at_ms = excluded.expires_at_ms";

fn upsert_record(conn: &Connection, record: &IdempotencyRecord) -> WardenResult<()> {
    let response = serde_json::to_string(&record.response)?;
    conn.execute(
        UPSERT_RECORD,
        params![
            record.key,
            record.method,
            record.path,
            i64::from(record.status),
            response,
            record.principal_id,
            to_sql_int(record.created_at),
            to_sql_int(record.expires_at),
        ],
    )?;
    Ok(())
}

#[async_trait]
impl IdempotencyRepository for SqliteStore {
    async fn get_record(&self, key: &str) -> WardenResult<Option<IdempotencyRecord>> {
        let conn = self.conn.lock();
        let raw = conn
            .query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM idempotency_records WHERE key = ?1"),
                params![key],
                record_from_row,
            )
            .optional()?;
        raw.map(decode_record).transpose()
    }

    async fn save_record(&self, record: &IdempotencyRecord) -> WardenResult<()> {
        let conn = self.conn.lock();
        upsert_record(&conn, record)
    }

    async fn insert_record_if_absent(
        &self,
        record: &IdempotencyRecord,
        now_ms: u64,
    ) -> WardenResult<Option<IdempotencyRecord>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let existing = tx
            .query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM idempotency_records WHERE key = ?1"),
                params![record.key],
                record_from_row,
            )
            .optional()?
            .map(decode_record)
            .transpose()?;
        if let Some(existing) = existing {
            if !existing.is_expired(now_ms) {
                return Ok(Some(existing));
            }
        }
        upsert_record(&tx, record)?;
        tx.commit()?;
        Ok(None)
    }

    async fn delete_expired_records(&self, now_ms: u64, limit: usize) -> WardenResult<usize> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM idempotency_records WHERE key IN (
                SELECT key FROM idempotency_records WHERE expires_at_ms <= ?1 LIMIT ?2)",
            params![to_sql_int(now_ms), to_sql_int(limit as u64)],
        )?;
        Ok(deleted)
    }
}

#[async_trait]
impl ApprovalRepository for SqliteStore {
    async fn get_request(&self, id: &str) -> WardenResult<Option<ApprovalRequest>> {
        let conn = self.conn.lock();
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM approval_requests WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        body.map(|b| {
            serde_json::from_str(&b)
                .map_err(|e| WardenError::Storage(format!("corrupt approval request {id}: {e}")))
        })
        .transpose()
    }

    async fn insert_request(&self, request: &ApprovalRequest) -> WardenResult<()> {
        let body = serde_json::to_string(request)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO approval_requests (id, status, body, updated_at_ms) VALUES (?1, ?2, ?3, ?4)",
            params![
                request.id,
                request.status.as_str(),
                body,
                to_sql_int(request.updated_at)
            ],
        )?;
        Ok(())
    }

    async fn save_request(&self, request: &ApprovalRequest) -> WardenResult<()> {
        let body = serde_json::to_string(request)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO approval_requests (id, status, body, updated_at_ms) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET status = excluded.status, body = excluded.body,
                updated_at_ms = excluded.updated_at_ms",
            params![
                request.id,
                request.status.as_str(),
                body,
                to_sql_int(request.updated_at)
            ],
        )?;
        Ok(())
    }
}
