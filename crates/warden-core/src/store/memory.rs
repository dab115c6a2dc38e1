use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{ApprovalRepository, AuditRepository, IdempotencyRepository};
use crate::audit::{AuditEvent, ChainHead};
use crate::error::{WardenError, WardenResult};
use crate::idempotency::IdempotencyRecord;
use crate::multisig::ApprovalRequest;

/// Arena of events plus id, per-chain hash and chain indexes. Deleted slots stay as
/// tombstones so indexes never shift.
#[derive(Debug, Default)]
struct AuditArena {
    events: Vec<Option<AuditEvent>>,
    by_id: HashMap<String, usize>,
    by_hash: HashMap<(String, String), usize>,
    by_chain: HashMap<String, BTreeMap<u64, usize>>,
    heads: HashMap<String, ChainHead>,
}

impl AuditArena {
    fn remove(&mut self, slot: usize) -> Option<AuditEvent> {
        let event = self.events.get_mut(slot)?.take()?;
        self.by_id.remove(&event.id);
        self.by_hash.remove(&(event.chain_id.clone(), event.hash.clone()));
        if let Some(chain) = self.by_chain.get_mut(&event.chain_id) {
            chain.remove(&event.sequence);
            if chain.is_empty() {
                self.by_chain.remove(&event.chain_id);
            }
        }
        Some(event)
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    audit: RwLock<AuditArena>,
    idempotency: RwLock<HashMap<String, IdempotencyRecord>>,
    approvals: RwLock<HashMap<String, ApprovalRequest>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrites a stored event in place. Exists so tamper detection can be
    /// exercised against a store.
    pub fn overwrite_event(&self, event: AuditEvent) -> WardenResult<()> {
        let mut arena = self.audit.write();
        let slot = *arena
            .by_id
            .get(&event.id)
            .ok_or_else(|| WardenError::NotFound(format!("audit event {}", event.id)))?;
        arena.events[slot] = Some(event);
        Ok(())
    }

    pub fn audit_event_count(&self) -> usize {
        self.audit.read().by_id.len()
    }
}

#[async_trait]
impl AuditRepository for MemoryStore {
    async fn chain_head(&self, chain_id: &str) -> WardenResult<Option<ChainHead>> {
        Ok(self.audit.read().heads.get(chain_id).cloned())
    }

    async fn insert_event(&self, event: &AuditEvent) -> WardenResult<()> {
        let mut arena = self.audit.write();
        let hash_key = (event.chain_id.clone(), event.hash.clone());
        if arena.by_hash.contains_key(&hash_key) {
            return Err(WardenError::Conflict(format!(
                "duplicate event hash {} in chain {}",
                event.hash, event.chain_id
            )));
        }
        if arena.by_id.contains_key(&event.id) {
            return Err(WardenError::Conflict(format!("duplicate event id {}", event.id)));
        }
        let taken = arena
            .by_chain
            .get(&event.chain_id)
            .is_some_and(|c| c.contains_key(&event.sequence));
        let stale = arena
            .heads
            .get(&event.chain_id)
            .is_some_and(|h| h.sequence >= event.sequence);
        if taken || stale {
            return Err(WardenError::Conflict(format!(
                "sequence {} already used in chain {}",
                event.sequence, event.chain_id
            )));
        }

        let slot = arena.events.len();
        arena.events.push(Some(event.clone()));
        arena.by_id.insert(event.id.clone(), slot);
        arena.by_hash.insert(hash_key, slot);
        arena
            .by_chain
            .entry(event.chain_id.clone())
            .or_default()
            .insert(event.sequence, slot);
        arena.heads.insert(
            event.chain_id.clone(),
            ChainHead {
                sequence: event.sequence,
                hash: event.hash.clone(),
            },
        );
        Ok(())
    }

    async fn get_event(&self, id: &str) -> WardenResult<Option<AuditEvent>> {
        let arena = self.audit.read();
        Ok(arena
            .by_id
            .get(id)
            .and_then(|slot| arena.events[*slot].clone()))
    }

    async fn chain_events(&self, chain_id: &str) -> WardenResult<Vec<AuditEvent>> {
        let arena = self.audit.read();
        Ok(arena
            .by_chain
            .get(chain_id)
            .map(|chain| {
                chain
                    .values()
                    .filter_map(|slot| arena.events[*slot].clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete_expired_events(
        &self,
        now_ms: u64,
        protected_types: &[String],
        limit: usize,
    ) -> WardenResult<usize> {
        let mut arena = self.audit.write();
        let mut doomed = Vec::new();
        'chains: for chain in arena.by_chain.values() {
            for slot in chain.values() {
                let Some(event) = arena.events[*slot].as_ref() else {
                    continue;
                };
                let expired = event.retention_expires_at.is_some_and(|t| t <= now_ms);
                if !expired || protected_types.iter().any(|t| t == &event.event_type) {
                    continue 'chains;
                }
                doomed.push(*slot);
                if doomed.len() >= limit {
                    break 'chains;
                }
            }
        }
        for slot in &doomed {
            arena.remove(*slot);
        }
        Ok(doomed.len())
    }

    async fn delete_event(&self, id: &str) -> WardenResult<bool> {
        let mut arena = self.audit.write();
        let Some(slot) = arena.by_id.get(id).copied() else {
            return Ok(false);
        };
        Ok(arena.remove(slot).is_some())
    }
}

#[async_trait]
impl IdempotencyRepository for MemoryStore {
    async fn get_record(&self, key: &str) -> WardenResult<Option<IdempotencyRecord>> {
        Ok(self.idempotency.read().get(key).cloned())
    }

    async fn save_record(&self, record: &IdempotencyRecord) -> WardenResult<()> {
        self.idempotency
            .write()
            .insert(record.key.clone(), record.clone());
        Ok(())
    }

    async fn insert_record_if_absent(
        &self,
        record: &IdempotencyRecord,
        now_ms: u64,
    ) -> WardenResult<Option<IdempotencyRecord>> {
        let mut records = self.idempotency.write();
        if let Some(existing) = records.get(&record.key) {
            if !existing.is_expired(now_ms) {
                return Ok(Some(existing.clone()));
            }
        }
        records.insert(record.key.clone(), record.clone());
        Ok(None)
    }

    async fn delete_expired_records(&self, now_ms: u64, limit: usize) -> WardenResult<usize> {
        let mut records = self.idempotency.write();
        let doomed: Vec<String> = records
            .values()
            .filter(|r| r.is_expired(now_ms))
            .take(limit)
            .map(|r| r.key.clone())
            .collect();
        for key in &doomed {
            records.remove(key);
        }
        Ok(doomed.len())
    }
}

#[async_trait]
impl ApprovalRepository for MemoryStore {
    async fn get_request(&self, id: &str) -> WardenResult<Option<ApprovalRequest>> {
        Ok(self.approvals.read().get(id).cloned())
    }

    async fn insert_request(&self, request: &ApprovalRequest) -> WardenResult<()> {
        let mut approvals = self.approvals.write();
        if approvals.contains_key(&request.id) {
            return Err(WardenError::Conflict(format!(
                "approval request {} exists",
                request.id
            )));
        }
        approvals.insert(request.id.clone(), request.clone());
        Ok(())
    }

    async fn save_request(&self, request: &ApprovalRequest) -> WardenResult<()> {
        self.approvals
            .write()
            .insert(request.id.clone(), request.clone());
        Ok(())
    }
}
